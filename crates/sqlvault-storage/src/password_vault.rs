use std::{
    fs, io,
    path::{Path, PathBuf},
};

use argon2::{Algorithm, Argon2, Params, Version};
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use sqlvault_core::{
    auth::{HASH_LEN, SALT_LEN},
    KdfAlgorithm, KdfParams, PasswordRecord, VaultError,
};
use subtle::ConstantTimeEq;
use tracing::{info, instrument};
use zeroize::Zeroizing;

use crate::atomic::{self, WriteOptions};

/// Salted password hash guarding access to the database.
///
/// Plaintext passwords are never stored or compared; candidates are run
/// through the KDF recorded in the file and the digests are compared in
/// constant time.
#[derive(Debug, Clone)]
pub struct PasswordVault {
    path: PathBuf,
    params: KdfParams,
}

impl PasswordVault {
    /// `params` apply to records written from now on; verification always
    /// uses the parameters stored with the record.
    pub fn new(path: impl Into<PathBuf>, params: KdfParams) -> Self {
        Self {
            path: path.into(),
            params,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_initialized(&self) -> bool {
        self.path.exists()
    }

    /// First-run setup.
    #[instrument(skip_all, fields(path = %self.path.display(), algorithm = %self.params.algorithm))]
    pub fn initialize(&self, password: &str) -> Result<(), VaultError> {
        if self.is_initialized() {
            return Err(VaultError::AlreadyInitialized {
                path: self.path.clone(),
            });
        }
        let record = new_record(password, &self.params)?;
        self.store(&record)?;
        info!("password record initialized");
        Ok(())
    }

    /// `Ok(false)` on mismatch; errors only for I/O or a bad record.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn verify(&self, candidate: &str) -> Result<bool, VaultError> {
        let record = self.load()?;
        let derived = derive(candidate.as_bytes(), &record.salt, &record.params())?;
        Ok(derived[..].ct_eq(&record.hash[..]).into())
    }

    /// Replace the record after `old` verifies. The swap is a single atomic
    /// replace, so either the old or the new record is on disk.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn change_password(&self, old: &str, new: &str) -> Result<(), VaultError> {
        if !self.verify(old)? {
            return Err(VaultError::Auth);
        }
        let record = new_record(new, &self.params)?;
        self.store(&record)?;
        info!("password changed");
        Ok(())
    }

    pub fn load(&self) -> Result<PasswordRecord, VaultError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(VaultError::corrupt_auth("password record is missing"))
            }
            Err(err) => return Err(err.into()),
        };
        let record: PasswordRecord = serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::corrupt_auth(format!("parse failed: {e}")))?;
        record.check()?;
        Ok(record)
    }

    pub fn sweep_stale(&self) -> io::Result<usize> {
        atomic::sweep_stale(&self.path)
    }

    fn store(&self, record: &PasswordRecord) -> Result<(), VaultError> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| VaultError::corrupt_auth(format!("serialize failed: {e}")))?;
        atomic::write_atomic(&self.path, &json, WriteOptions::secret())?;
        Ok(())
    }
}

fn new_record(password: &str, params: &KdfParams) -> Result<PasswordRecord, VaultError> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let hash = derive(password.as_bytes(), &salt, params)?;
    Ok(PasswordRecord {
        algorithm: params.algorithm,
        iterations: params.iterations,
        memory_kib: params.memory_kib,
        salt,
        hash: hash.to_vec(),
        updated_at: Some(Utc::now()),
    })
}

fn derive(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; HASH_LEN]>, VaultError> {
    let mut out = Zeroizing::new([0u8; HASH_LEN]);
    match params.algorithm {
        KdfAlgorithm::Pbkdf2Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, params.iterations, &mut out[..]);
        }
        KdfAlgorithm::Argon2id => {
            let memory = params
                .memory_kib
                .ok_or_else(|| VaultError::corrupt_auth("argon2id without memory cost"))?;
            let argon_params = Params::new(memory, params.iterations, 1, Some(HASH_LEN))
                .map_err(|e| VaultError::corrupt_auth(format!("argon2 parameters: {e}")))?;
            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
                .hash_password_into(password, salt, &mut out[..])
                .map_err(|e| VaultError::corrupt_auth(format!("argon2 derivation: {e}")))?;
        }
    }
    Ok(out)
}
