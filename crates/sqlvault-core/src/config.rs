use std::path::{self, Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{auth::KdfParams, error::VaultError};

/// Suffix appended to the database path to form the envelope path.
pub const ENVELOPE_SUFFIX: &str = ".enc";
pub const DEFAULT_DATABASE_FILE: &str = "database.db";
pub const DEFAULT_AUTH_FILE: &str = "auth.json";
pub const DEFAULT_KEY_FILE: &str = "db_key.key";
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
/// Password set on first run; users are expected to change it immediately.
pub const DEFAULT_INITIAL_PASSWORD: &str = "Admin";

/// Locations and policy for one encrypted database.
///
/// Built once by the surrounding application (config file, environment
/// overrides) and handed to the gate; nothing below this layer reads the
/// environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Plaintext database location. Only `<database_path>.enc` exists at
    /// rest; a plaintext file found here is migrated on bootstrap.
    pub database_path: PathBuf,
    pub auth_path: PathBuf,
    pub key_path: PathBuf,
    /// Directory holding the working file while unlocked. Must not be
    /// under a backed-up data directory.
    pub working_dir: PathBuf,
    pub kdf: KdfParams,
    pub max_failed_attempts: u32,
    pub initial_password: String,
}

impl GateConfig {
    /// Default file names inside `data_dir`, with the working file kept in
    /// `working_dir`.
    pub fn in_dirs(data_dir: impl AsRef<Path>, working_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            database_path: data_dir.join(DEFAULT_DATABASE_FILE),
            auth_path: data_dir.join(DEFAULT_AUTH_FILE),
            key_path: data_dir.join(DEFAULT_KEY_FILE),
            working_dir: working_dir.into(),
            kdf: KdfParams::default(),
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            initial_password: DEFAULT_INITIAL_PASSWORD.to_string(),
        }
    }

    pub fn envelope_path(&self) -> PathBuf {
        let mut raw = self.database_path.clone().into_os_string();
        raw.push(ENVELOPE_SUFFIX);
        PathBuf::from(raw)
    }

    pub fn working_path(&self) -> PathBuf {
        let name = self
            .database_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| DEFAULT_DATABASE_FILE.into());
        self.working_dir.join(name)
    }

    pub fn validate(&self) -> Result<(), VaultError> {
        for (label, path) in [
            ("database_path", &self.database_path),
            ("auth_path", &self.auth_path),
            ("key_path", &self.key_path),
        ] {
            if path.file_name().is_none() {
                return Err(VaultError::config(format!(
                    "{label} must name a file: {}",
                    path.display()
                )));
            }
        }

        let envelope = self.envelope_path();
        let persisted = [&self.auth_path, &self.key_path, &envelope];
        for (i, a) in persisted.iter().enumerate() {
            if persisted[i + 1..].contains(a) {
                return Err(VaultError::config(format!(
                    "{} is used for more than one artifact",
                    a.display()
                )));
            }
        }

        if self.working_dir.as_os_str().is_empty() {
            return Err(VaultError::config("working_dir is empty"));
        }
        let working_dir = normalized(&self.working_dir)?;
        for (label, path) in [
            ("database_path", &self.database_path),
            ("auth_path", &self.auth_path),
            ("key_path", &self.key_path),
        ] {
            let parent = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let parent = normalized(parent)?;
            if working_dir.starts_with(&parent) {
                return Err(VaultError::config(format!(
                    "working_dir {} is inside {}, which holds the {label}",
                    self.working_dir.display(),
                    parent.display()
                )));
            }
        }

        if self.max_failed_attempts == 0 {
            return Err(VaultError::config("max_failed_attempts must be at least 1"));
        }
        if self.initial_password.is_empty() {
            return Err(VaultError::config("initial_password is empty"));
        }
        self.kdf.validate()
    }
}

/// Absolute form of `path` with `.` and `..` resolved lexically. Symlinks
/// are not followed.
fn normalized(path: &Path) -> Result<PathBuf, VaultError> {
    let mut out = PathBuf::new();
    for component in path::absolute(path)?.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GateConfig {
        GateConfig::in_dirs("/var/lib/sqlvault", "/run/user/1000/sqlvault")
    }

    #[test]
    fn defaults_match_legacy_file_names() {
        let cfg = sample();
        assert_eq!(cfg.auth_path, PathBuf::from("/var/lib/sqlvault/auth.json"));
        assert_eq!(cfg.key_path, PathBuf::from("/var/lib/sqlvault/db_key.key"));
        assert_eq!(
            cfg.envelope_path(),
            PathBuf::from("/var/lib/sqlvault/database.db.enc")
        );
        assert_eq!(
            cfg.working_path(),
            PathBuf::from("/run/user/1000/sqlvault/database.db")
        );
        cfg.validate().expect("defaults validate");
    }

    #[test]
    fn rejects_working_dir_inside_data_dir() {
        let mut cfg = sample();
        cfg.working_dir = PathBuf::from("/var/lib/sqlvault/tmp");
        let err = cfg.validate().expect_err("should reject");
        assert!(matches!(err, VaultError::Config { .. }));
    }

    #[test]
    fn rejects_working_dir_reached_through_dot_segments() {
        let mut cfg = sample();
        cfg.working_dir = PathBuf::from("/var/lib/sqlvault/../sqlvault/./tmp");
        assert!(matches!(cfg.validate(), Err(VaultError::Config { .. })));

        // Leaving the data directory through `..` is fine.
        cfg.working_dir = PathBuf::from("/var/lib/sqlvault/../sqlvault-run");
        cfg.validate().expect("sibling directory validates");
    }

    #[test]
    fn rejects_working_dir_beside_auth_or_key_file() {
        let mut cfg = sample();
        cfg.auth_path = PathBuf::from("/etc/sqlvault/auth.json");
        cfg.working_dir = PathBuf::from("/etc/sqlvault/work");
        assert!(matches!(cfg.validate(), Err(VaultError::Config { .. })));

        let mut cfg = sample();
        cfg.key_path = PathBuf::from("/home/me/keys/db_key.key");
        cfg.working_dir = PathBuf::from("/home/me/keys");
        assert!(matches!(cfg.validate(), Err(VaultError::Config { .. })));
    }

    #[test]
    fn relative_working_dir_is_checked_against_absolute_paths() {
        let mut cfg = sample();
        cfg.working_dir = PathBuf::from("tmp");
        let cwd = std::env::current_dir().expect("cwd");
        cfg.database_path = cwd.join(DEFAULT_DATABASE_FILE);
        assert!(matches!(cfg.validate(), Err(VaultError::Config { .. })));
    }

    #[test]
    fn rejects_shared_artifact_paths() {
        let mut cfg = sample();
        cfg.key_path = cfg.auth_path.clone();
        assert!(matches!(cfg.validate(), Err(VaultError::Config { .. })));
    }

    #[test]
    fn rejects_zero_attempt_bound_and_weak_kdf() {
        let mut cfg = sample();
        cfg.max_failed_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.kdf = KdfParams::pbkdf2(1_000);
        assert!(cfg.validate().is_err());
    }
}
