//! Core types for SQLVault: the error taxonomy, key material, password
//! records, gate configuration and session state.
//! Nothing in this crate touches the filesystem or the environment.

pub mod auth;
pub mod config;
pub mod error;
pub mod key;
pub mod session;

pub use auth::{KdfAlgorithm, KdfParams, PasswordRecord};
pub use config::GateConfig;
pub use error::VaultError;
pub use key::MasterKey;
pub use session::{GateState, Session};
