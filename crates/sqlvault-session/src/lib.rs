//! Lock/unlock lifecycle for one encrypted SQLite database.
//!
//! While locked only the envelope, key file and password record exist on
//! disk. Unlocking decrypts the envelope into a private working file; locking
//! seals it back and wipes the plaintext.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use sqlvault_core::{GateConfig, GateState, MasterKey, Session, VaultError};
use sqlvault_storage::{
    atomic::{self, WriteOptions},
    wipe, CipherEnvelope, FileKeyStore, KeyStore, PasswordVault,
};
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

/// What `bootstrap` had to do to bring the files into a usable state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub created_key: bool,
    /// The password record was created with the configured initial password.
    pub initialized_password: bool,
    /// A plaintext database was sealed into a new envelope and wiped.
    pub migrated_plaintext: bool,
    pub removed_stale_working_file: bool,
    /// Temp files left behind by interrupted atomic writes.
    pub swept_temp_files: usize,
}

/// Single authority over the database lifecycle.
pub struct SessionGate<K: KeyStore = FileKeyStore> {
    config: GateConfig,
    keys: K,
    vault: PasswordVault,
    state: GateState,
    session: Option<Session>,
    failed_attempts: u32,
}

impl SessionGate<FileKeyStore> {
    /// Validate `config` and build a gate over the key file it names.
    pub fn from_config(config: GateConfig) -> Result<Self, VaultError> {
        config.validate()?;
        let keys = FileKeyStore::new(&config.key_path);
        Ok(Self::with_key_store(config, keys))
    }
}

impl<K: KeyStore> SessionGate<K> {
    /// Gate over an arbitrary key store. `config` is used as given.
    pub fn with_key_store(config: GateConfig, keys: K) -> Self {
        let vault = PasswordVault::new(&config.auth_path, config.kdf);
        Self {
            config,
            keys,
            vault,
            state: GateState::Locked,
            session: None,
            failed_attempts: 0,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Where the plaintext lives while unlocked.
    pub fn working_path(&self) -> PathBuf {
        self.config.working_path()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// True once the consecutive failure count reaches the configured bound.
    /// Callers decide how long to back off.
    pub fn cooldown_required(&self) -> bool {
        self.failed_attempts >= self.config.max_failed_attempts
    }

    /// First-run setup and crash recovery. Safe to call on every start.
    ///
    /// Never regenerates a key or password record when an envelope already
    /// exists: that would make the envelope unreadable.
    #[instrument(skip_all, fields(database = %self.config.database_path.display()))]
    pub fn bootstrap(&mut self) -> Result<BootstrapReport, VaultError> {
        self.expect_state(GateState::Locked)?;
        let mut report = BootstrapReport::default();
        let envelope_path = self.config.envelope_path();
        let working_path = self.config.working_path();

        report.swept_temp_files = atomic::sweep_stale(&self.config.key_path)?
            + self.vault.sweep_stale()?
            + atomic::sweep_stale(&envelope_path)?
            + atomic::sweep_stale(&working_path)?;
        if report.swept_temp_files > 0 {
            warn!(
                count = report.swept_temp_files,
                "removed temp files from interrupted writes"
            );
        }

        let has_envelope = envelope_path.exists();

        if !self.keys.exists() {
            if has_envelope {
                return Err(VaultError::corrupt_key(
                    "envelope exists but the key is missing",
                ));
            }
            self.keys.generate()?;
            report.created_key = true;
        }

        if !self.vault.is_initialized() {
            if has_envelope {
                return Err(VaultError::corrupt_auth(
                    "envelope exists but the password record is missing",
                ));
            }
            self.vault.initialize(&self.config.initial_password)?;
            report.initialized_password = true;
            warn!("password record created with the initial password; change it");
        }

        if self.config.database_path.exists() {
            if has_envelope {
                warn!(
                    path = %self.config.database_path.display(),
                    "plaintext database next to an envelope; leaving it untouched"
                );
            } else {
                let key = self.keys.load()?;
                let plaintext = Zeroizing::new(fs::read(&self.config.database_path)?);
                CipherEnvelope::seal(&plaintext, &key)?.write_to(&envelope_path)?;
                wipe::wipe_working_set(&self.config.database_path)?;
                report.migrated_plaintext = true;
                info!(len = plaintext.len(), "migrated plaintext database into envelope");
            }
        }

        if wipe::wipe_working_set(&working_path)? > 0 {
            report.removed_stale_working_file = true;
            warn!(path = %working_path.display(), "wiped stale working file");
        }

        Ok(report)
    }

    /// Verify `password`, decrypt the envelope into the working file and
    /// open a session.
    ///
    /// Nothing is written unless both the password and the envelope check
    /// out. A missing envelope unlocks to an empty database.
    #[instrument(skip_all)]
    pub fn unlock(&mut self, password: &str) -> Result<&Session, VaultError> {
        self.expect_state(GateState::Locked)?;
        self.state = GateState::Authenticating;

        match self.authenticate(password) {
            Ok(session) => {
                info!(session = %session.id(), "database unlocked");
                self.failed_attempts = 0;
                self.state = GateState::Unlocked;
                Ok(&*self.session.insert(session))
            }
            Err(err) => {
                self.state = GateState::Locked;
                if matches!(err, VaultError::Auth) {
                    self.record_failure();
                }
                Err(err)
            }
        }
    }

    /// Seal the working file into the envelope, wipe it and end the session.
    ///
    /// On error the gate stays unlocked and the working file is kept.
    #[instrument(skip_all)]
    pub fn lock(&mut self) -> Result<(), VaultError> {
        let session = self.active_session()?;
        self.seal_working(session)?;
        let removed = wipe::wipe_working_set(session.working_path())?;
        debug!(removed, "working set wiped");

        if let Some(session) = self.session.take() {
            info!(session = %session.id(), "database locked");
        }
        self.state = GateState::Locked;
        Ok(())
    }

    /// Seal the current working file without ending the session.
    #[instrument(skip_all)]
    pub fn checkpoint(&mut self) -> Result<(), VaultError> {
        let session = self.active_session()?;
        if self.seal_working(session)? {
            info!("checkpoint written");
        }
        Ok(())
    }

    /// Replace the password record after `old` verifies. A wrong `old`
    /// counts as a failed attempt.
    #[instrument(skip_all)]
    pub fn change_password(&mut self, old: &str, new: &str) -> Result<(), VaultError> {
        match self.vault.change_password(old, new) {
            Err(VaultError::Auth) => {
                self.record_failure();
                Err(VaultError::Auth)
            }
            other => other,
        }
    }

    /// Re-seal the database under a fresh key.
    ///
    /// The new key is staged before the envelope is replaced, so a crash at
    /// any point leaves either the old pair or a recoverable staged key.
    #[instrument(skip_all)]
    pub fn rotate_key(&mut self) -> Result<(), VaultError> {
        let session = self.active_session()?;
        let plaintext = self.current_plaintext(session)?;

        let next = MasterKey::random();
        self.keys.stage(&next)?;
        let resealed = CipherEnvelope::seal(&plaintext, &next)
            .and_then(|envelope| envelope.write_to(&self.config.envelope_path()));
        if let Err(err) = resealed {
            // The envelope is still sealed under the active key.
            if let Err(discard) = self.keys.discard_staged() {
                warn!(%discard, "failed to discard staged key");
            }
            return Err(err);
        }
        self.keys.rotate(&next)?;

        if let Some(session) = self.session.as_mut() {
            session.replace_key(next);
        }
        info!("database re-sealed under a new key");
        Ok(())
    }

    /// Copy the sealed envelope to `dest`. When unlocked the working file is
    /// checkpointed first so the copy is current.
    #[instrument(skip_all, fields(dest = %dest.display()))]
    pub fn backup_to(&mut self, dest: &Path) -> Result<(), VaultError> {
        let envelope_path = self.config.envelope_path();
        if dest == envelope_path.as_path() {
            return Err(VaultError::config("backup destination is the envelope itself"));
        }
        if self.state == GateState::Unlocked {
            self.checkpoint()?;
        }

        let bytes = fs::read(&envelope_path)?;
        CipherEnvelope::from_bytes(&bytes)?;
        atomic::write_atomic(dest, &bytes, WriteOptions::private())?;
        info!(len = bytes.len(), "envelope backed up");
        Ok(())
    }

    fn authenticate(&self, password: &str) -> Result<Session, VaultError> {
        if !self.vault.verify(password)? {
            return Err(VaultError::Auth);
        }

        let (key, plaintext) = self.open_envelope()?;
        let working_path = self.config.working_path();
        if wipe::wipe_working_set(&working_path)? > 0 {
            warn!(path = %working_path.display(), "replaced stale working file");
        }
        atomic::ensure_private_dir(&self.config.working_dir)?;
        atomic::write_atomic(&working_path, &plaintext, WriteOptions::private())?;
        Ok(Session::new(key, working_path))
    }

    /// Active key and decrypted database. Completes an interrupted rotation
    /// when only the staged key opens the envelope.
    fn open_envelope(&self) -> Result<(MasterKey, Zeroizing<Vec<u8>>), VaultError> {
        let key = self.keys.load()?;
        let Some(envelope) = CipherEnvelope::read_from(&self.config.envelope_path())? else {
            debug!("no envelope yet; starting with an empty database");
            self.keys.discard_staged()?;
            return Ok((key, Zeroizing::new(Vec::new())));
        };

        match envelope.open(&key) {
            Ok(plaintext) => {
                // A rotation that stopped before re-sealing left this behind.
                self.keys.discard_staged()?;
                Ok((key, plaintext))
            }
            Err(VaultError::Decryption) => {
                let Some(staged) = self.keys.staged()? else {
                    return Err(VaultError::Decryption);
                };
                let plaintext = envelope.open(&staged)?;
                self.keys.rotate(&staged)?;
                warn!("completed interrupted key rotation");
                Ok((staged, plaintext))
            }
            Err(err) => Err(err),
        }
    }

    /// Writes the envelope unless there is nothing worth sealing. Returns
    /// whether it was written.
    fn seal_working(&self, session: &Session) -> Result<bool, VaultError> {
        let envelope_path = self.config.envelope_path();
        let plaintext = match self.read_working(session)? {
            Some(plaintext) => plaintext,
            None if envelope_path.exists() => {
                warn!("working file is empty or missing; keeping the existing envelope");
                return Ok(false);
            }
            None => Zeroizing::new(Vec::new()),
        };
        CipherEnvelope::seal(&plaintext, session.key())?.write_to(&envelope_path)?;
        Ok(true)
    }

    /// Working file contents, falling back to the sealed copy.
    fn current_plaintext(&self, session: &Session) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        if let Some(plaintext) = self.read_working(session)? {
            return Ok(plaintext);
        }
        match CipherEnvelope::read_from(&self.config.envelope_path())? {
            Some(envelope) => envelope.open(session.key()),
            None => Ok(Zeroizing::new(Vec::new())),
        }
    }

    /// `None` when the working file is missing or empty.
    fn read_working(&self, session: &Session) -> Result<Option<Zeroizing<Vec<u8>>>, VaultError> {
        let working = session.working_path();
        if let Some(journal) = wipe::open_journal(working)? {
            return Err(VaultError::WorkingFileInUse { path: journal });
        }
        match fs::read(working) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(Zeroizing::new(bytes))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn active_session(&self) -> Result<&Session, VaultError> {
        self.expect_state(GateState::Unlocked)?;
        self.session.as_ref().ok_or(VaultError::InvalidState {
            expected: GateState::Unlocked,
            actual: self.state,
        })
    }

    fn expect_state(&self, expected: GateState) -> Result<(), VaultError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(VaultError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn record_failure(&mut self) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        warn!(failed_attempts = self.failed_attempts, "authentication failed");
    }
}

impl<K: KeyStore> Drop for SessionGate<K> {
    fn drop(&mut self) {
        if self.state != GateState::Unlocked {
            return;
        }
        if let Err(err) = self.lock() {
            error!(
                %err,
                path = %self.config.working_path().display(),
                "failed to lock on shutdown; plaintext working file left behind"
            );
        }
    }
}
