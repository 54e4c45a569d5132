//! Concrete persistence for SQLVault: atomic file replacement, the key file,
//! the password record and the AES-GCM database envelope.

pub mod atomic;
pub mod envelope;
pub mod key_store;
pub mod password_vault;
pub mod wipe;

pub use envelope::CipherEnvelope;
pub use key_store::{FileKeyStore, InMemoryKeyStore, KeyStore};
pub use password_vault::PasswordVault;
