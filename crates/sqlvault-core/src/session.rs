use std::{
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::key::MasterKey;

/// Lifecycle of the session gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Only ciphertext and key/password files are on disk.
    Locked,
    /// Password verification and envelope opening in progress.
    Authenticating,
    /// A plaintext working file exists and a session holds the key.
    Unlocked,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => f.write_str("locked"),
            Self::Authenticating => f.write_str("authenticating"),
            Self::Unlocked => f.write_str("unlocked"),
        }
    }
}

/// State of an unlocked database.
///
/// The key copy is wiped when the session is dropped.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    key: MasterKey,
    working_path: PathBuf,
    unlocked_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: MasterKey, working_path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            working_path: working_path.into(),
            unlocked_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Path the database layer should open.
    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    pub fn unlocked_at(&self) -> DateTime<Utc> {
        self.unlocked_at
    }

    pub fn key(&self) -> &MasterKey {
        &self.key
    }

    /// Swap in a rotated key. The old key is wiped on drop.
    pub fn replace_key(&mut self, key: MasterKey) {
        self.key = key;
    }
}
