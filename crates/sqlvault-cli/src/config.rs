use std::{
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::{config_dir, data_local_dir, runtime_dir};
use serde::{Deserialize, Serialize};
use sqlvault_core::{GateConfig, KdfParams};

const APP_DIR: &str = "sqlvault";

pub const DATABASE_PATH_ENV: &str = "SQLVAULT_DATABASE_PATH";
pub const AUTH_PATH_ENV: &str = "SQLVAULT_AUTH_PATH";
pub const KEY_PATH_ENV: &str = "SQLVAULT_KEY_PATH";
pub const WORKING_DIR_ENV: &str = "SQLVAULT_WORKING_DIR";

/// User-level configuration loaded from `~/.config/sqlvault/config.toml` (platform-specific).
///
/// Every field is optional; unset fields fall back to the platform defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Directory holding the key, password record and envelope.
    pub data_dir: Option<PathBuf>,
    /// Where the plaintext working file lives while unlocked.
    pub working_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub auth_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub max_failed_attempts: Option<u32>,
    /// Hash parameters for password records written from now on.
    pub kdf: Option<KdfParams>,
}

/// Path overrides taken from the environment at start-up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub database_path: Option<PathBuf>,
    pub auth_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var_os(name))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let path = |name: &str| lookup(name).filter(|v| !v.is_empty()).map(PathBuf::from);
        Self {
            database_path: path(DATABASE_PATH_ENV),
            auth_path: path(AUTH_PATH_ENV),
            key_path: path(KEY_PATH_ENV),
            working_dir: path(WORKING_DIR_ENV),
        }
    }
}

impl Config {
    /// Resolve file locations (environment beats config file beats defaults)
    /// and validate the result.
    pub fn to_gate_config(&self, env: &EnvOverrides) -> Result<GateConfig> {
        let data_dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir()?,
        };
        let working_dir = env
            .working_dir
            .clone()
            .or_else(|| self.working_dir.clone())
            .unwrap_or_else(default_working_dir);

        let mut gate = GateConfig::in_dirs(&data_dir, working_dir);
        if let Some(path) = env.database_path.clone().or_else(|| self.database_path.clone()) {
            gate.database_path = path;
        }
        if let Some(path) = env.auth_path.clone().or_else(|| self.auth_path.clone()) {
            gate.auth_path = path;
        }
        if let Some(path) = env.key_path.clone().or_else(|| self.key_path.clone()) {
            gate.key_path = path;
        }
        if let Some(kdf) = self.kdf {
            gate.kdf = kdf;
        }
        if let Some(max) = self.max_failed_attempts {
            gate.max_failed_attempts = max;
        }

        gate.validate()?;
        Ok(gate)
    }
}

/// Load config from `path`, or the default path when none is given; if
/// missing, return defaults.
pub fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_from_path(path),
        None => load_from_path(default_path()?),
    }
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join(APP_DIR).join("config.toml"))
}

pub fn default_data_dir() -> Result<PathBuf> {
    let base =
        data_local_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join(APP_DIR))
}

/// Per-user runtime dir (usually tmpfs) when the platform has one.
pub fn default_working_dir() -> PathBuf {
    runtime_dir()
        .unwrap_or_else(env::temp_dir)
        .join(APP_DIR)
}

/// Write `config` to `path` unless a file is already there. Returns the path.
pub fn write_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
