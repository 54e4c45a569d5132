use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Default PBKDF2 round count for new password records.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 200_000;
/// Lowest PBKDF2 round count accepted from configuration.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;
/// Argon2id defaults: 3 passes over 64 MiB.
pub const DEFAULT_ARGON2_PASSES: u32 = 3;
pub const DEFAULT_ARGON2_MEMORY_KIB: u32 = 64 * 1024;
/// Argon2id floor (2 passes over 19 MiB).
pub const MIN_ARGON2_PASSES: u32 = 2;
pub const MIN_ARGON2_MEMORY_KIB: u32 = 19 * 1024;
/// Salt length for new records.
pub const SALT_LEN: usize = 16;
/// Derived hash length.
pub const HASH_LEN: usize = 32;

/// Key-derivation function used for the password gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    #[default]
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256,
    #[serde(rename = "argon2id")]
    Argon2id,
}

impl fmt::Display for KdfAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pbkdf2Sha256 => f.write_str("pbkdf2-sha256"),
            Self::Argon2id => f.write_str("argon2id"),
        }
    }
}

/// Cost parameters for deriving a password hash.
///
/// `iterations` is the PBKDF2 round count or the Argon2id pass count.
/// `memory_kib` only applies to Argon2id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    #[serde(default)]
    pub algorithm: KdfAlgorithm,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_kib: Option<u32>,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::pbkdf2(DEFAULT_PBKDF2_ITERATIONS)
    }
}

impl KdfParams {
    pub fn pbkdf2(iterations: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Pbkdf2Sha256,
            iterations,
            memory_kib: None,
        }
    }

    pub fn argon2id(passes: u32, memory_kib: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            iterations: passes,
            memory_kib: Some(memory_kib),
        }
    }

    /// Reject parameters weaker than current guidance.
    pub fn validate(&self) -> Result<(), VaultError> {
        match self.algorithm {
            KdfAlgorithm::Pbkdf2Sha256 => {
                if self.iterations < MIN_PBKDF2_ITERATIONS {
                    return Err(VaultError::config(format!(
                        "pbkdf2 iterations {} below minimum {MIN_PBKDF2_ITERATIONS}",
                        self.iterations
                    )));
                }
            }
            KdfAlgorithm::Argon2id => {
                if self.iterations < MIN_ARGON2_PASSES {
                    return Err(VaultError::config(format!(
                        "argon2id passes {} below minimum {MIN_ARGON2_PASSES}",
                        self.iterations
                    )));
                }
                let memory = self.memory_kib.unwrap_or(0);
                if memory < MIN_ARGON2_MEMORY_KIB {
                    return Err(VaultError::config(format!(
                        "argon2id memory {memory} KiB below minimum {MIN_ARGON2_MEMORY_KIB} KiB"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Persisted password-gate record.
///
/// Records written before the algorithm field existed (`{salt, hash,
/// iterations}`) load as PBKDF2-SHA256.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRecord {
    #[serde(default)]
    pub algorithm: KdfAlgorithm,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_kib: Option<u32>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub hash: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_iterations() -> u32 {
    DEFAULT_PBKDF2_ITERATIONS
}

impl PasswordRecord {
    pub fn params(&self) -> KdfParams {
        KdfParams {
            algorithm: self.algorithm,
            iterations: self.iterations,
            memory_kib: self.memory_kib,
        }
    }

    /// Structural integrity check applied on every load.
    pub fn check(&self) -> Result<(), VaultError> {
        if self.salt.len() < SALT_LEN {
            return Err(VaultError::corrupt_auth(format!(
                "salt is {} bytes, expected at least {SALT_LEN}",
                self.salt.len()
            )));
        }
        if self.hash.len() != HASH_LEN {
            return Err(VaultError::corrupt_auth(format!(
                "hash is {} bytes, expected {HASH_LEN}",
                self.hash.len()
            )));
        }
        if self.iterations == 0 {
            return Err(VaultError::corrupt_auth("iteration count is zero"));
        }
        if self.algorithm == KdfAlgorithm::Argon2id && self.memory_kib.is_none() {
            return Err(VaultError::corrupt_auth("argon2id record without memory cost"));
        }
        Ok(())
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
