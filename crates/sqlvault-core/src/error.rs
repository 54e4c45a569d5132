use std::path::PathBuf;

use thiserror::Error;

use crate::session::GateState;

/// Errors produced by the encrypted-persistence core.
///
/// Every cryptographic and integrity failure is terminal for the operation
/// that raised it: callers never receive partial plaintext or a fallback key.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Underlying file system failure (disk full, permission denied, ...).
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    /// The key file is missing, truncated, or fails its format check.
    #[error("key file is missing or corrupt: {reason}")]
    CorruptKey { reason: String },
    /// The password record is missing or malformed.
    #[error("password record is missing or corrupt: {reason}")]
    CorruptAuth { reason: String },
    /// Password mismatch.
    #[error("authentication failed")]
    Auth,
    /// The envelope failed authentication (wrong key, corruption, tampering).
    #[error("unable to decrypt database envelope")]
    Decryption,
    /// The envelope was written by a newer format revision.
    #[error("unsupported envelope version {found} (newest supported is {supported})")]
    UnsupportedVersion { found: u8, supported: u8 },
    /// A password record already exists where a fresh one was requested.
    #[error("password record already initialized at {}", path.display())]
    AlreadyInitialized { path: PathBuf },
    /// The session gate is not in the state the operation requires.
    #[error("operation requires {expected} state but the gate is {actual}")]
    InvalidState {
        expected: GateState,
        actual: GateState,
    },
    /// Configuration rejected at load time.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
    /// The working database still has an un-checkpointed journal.
    #[error("working database is still open (journal present at {})", path.display())]
    WorkingFileInUse { path: PathBuf },
}

impl VaultError {
    pub fn corrupt_key(reason: impl Into<String>) -> Self {
        Self::CorruptKey {
            reason: reason.into(),
        }
    }

    pub fn corrupt_auth(reason: impl Into<String>) -> Self {
        Self::CorruptAuth {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// True for failures that must be reported to users without saying which
    /// check failed.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            Self::Auth | Self::Decryption | Self::CorruptKey { .. } | Self::CorruptAuth { .. }
        )
    }

    /// Message safe to show to an end user.
    pub fn public_message(&self) -> String {
        if self.is_access_denied() {
            "unable to unlock the database".to_string()
        } else {
            self.to_string()
        }
    }
}
