use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use base64::{engine::general_purpose, Engine as _};
use sqlvault_core::{
    key::{MasterKey, KEY_LEN},
    VaultError,
};
use tracing::{info, instrument};
use zeroize::Zeroizing;

use crate::{
    atomic::{self, WriteOptions},
    wipe,
};

/// Format marker at the start of every key file.
const KEY_MARKER: &str = "sqlvault-key-v1:";
const PENDING_SUFFIX: &str = ".pending";

/// Owns the canonical copy of the master key.
pub trait KeyStore: Send + Sync {
    /// Create, persist and return a fresh key.
    fn generate(&self) -> Result<MasterKey, VaultError>;

    /// Load the active key. Never falls back to a default.
    fn load(&self) -> Result<MasterKey, VaultError>;

    /// Replace the active key. The envelope must already be sealed under
    /// `next`; any staged key is cleared.
    fn rotate(&self, next: &MasterKey) -> Result<(), VaultError>;

    fn exists(&self) -> bool;

    /// Persist `next` as the pending rotation target before re-sealing.
    fn stage(&self, next: &MasterKey) -> Result<(), VaultError>;

    /// Pending rotation target left by an interrupted rotation, if any.
    fn staged(&self) -> Result<Option<MasterKey>, VaultError>;

    /// Drop a staged key that the envelope was never sealed under.
    fn discard_staged(&self) -> Result<(), VaultError>;
}

/// Key file on disk, owner-only and hidden where supported.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pending_path(&self) -> PathBuf {
        let mut raw = self.path.clone().into_os_string();
        raw.push(PENDING_SUFFIX);
        PathBuf::from(raw)
    }
}

impl KeyStore for FileKeyStore {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn generate(&self) -> Result<MasterKey, VaultError> {
        let key = MasterKey::random();
        write_key(&self.path, &key)?;
        info!("generated new master key");
        Ok(key)
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn load(&self) -> Result<MasterKey, VaultError> {
        read_key(&self.path)?.ok_or_else(|| VaultError::corrupt_key("key file is missing"))
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn rotate(&self, next: &MasterKey) -> Result<(), VaultError> {
        write_key(&self.path, next)?;
        remove_if_present(&self.pending_path())?;
        info!("master key rotated");
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn stage(&self, next: &MasterKey) -> Result<(), VaultError> {
        write_key(&self.pending_path(), next)
    }

    fn staged(&self) -> Result<Option<MasterKey>, VaultError> {
        read_key(&self.pending_path())
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn discard_staged(&self) -> Result<(), VaultError> {
        if remove_if_present(&self.pending_path())? {
            info!("discarded unused staged key");
        }
        Ok(())
    }
}

/// In-memory key store for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyStore {
    inner: Arc<Mutex<Slots>>,
}

#[derive(Debug, Default)]
struct Slots {
    active: Option<MasterKey>,
    pending: Option<MasterKey>,
}

impl InMemoryKeyStore {
    pub fn with_key(key: MasterKey) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots {
                active: Some(key),
                pending: None,
            })),
        }
    }

    fn slots(&self) -> Result<std::sync::MutexGuard<'_, Slots>, VaultError> {
        self.inner
            .lock()
            .map_err(|err| VaultError::corrupt_key(format!("lock poisoned: {err}")))
    }
}

impl KeyStore for InMemoryKeyStore {
    fn generate(&self) -> Result<MasterKey, VaultError> {
        let key = MasterKey::random();
        self.slots()?.active = Some(key.clone());
        Ok(key)
    }

    fn load(&self) -> Result<MasterKey, VaultError> {
        self.slots()?
            .active
            .clone()
            .ok_or_else(|| VaultError::corrupt_key("no key generated"))
    }

    fn rotate(&self, next: &MasterKey) -> Result<(), VaultError> {
        let mut slots = self.slots()?;
        slots.active = Some(next.clone());
        slots.pending = None;
        Ok(())
    }

    fn exists(&self) -> bool {
        self.slots().map(|s| s.active.is_some()).unwrap_or(false)
    }

    fn stage(&self, next: &MasterKey) -> Result<(), VaultError> {
        self.slots()?.pending = Some(next.clone());
        Ok(())
    }

    fn staged(&self) -> Result<Option<MasterKey>, VaultError> {
        Ok(self.slots()?.pending.clone())
    }

    fn discard_staged(&self) -> Result<(), VaultError> {
        self.slots()?.pending = None;
        Ok(())
    }
}

fn write_key(path: &Path, key: &MasterKey) -> Result<(), VaultError> {
    let encoded = encode_key(key);
    atomic::write_atomic(path, encoded.as_bytes(), WriteOptions::secret())?;
    Ok(())
}

/// Zero-fill and unlink; `false` if there was nothing to remove.
fn remove_if_present(path: &Path) -> Result<bool, VaultError> {
    Ok(wipe::wipe_file(path)?)
}

fn read_key(path: &Path) -> Result<Option<MasterKey>, VaultError> {
    let contents = match fs::read_to_string(path) {
        Ok(text) => Zeroizing::new(text),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            return Err(VaultError::corrupt_key("key file is not text"))
        }
        Err(err) => return Err(err.into()),
    };
    decode_key(&contents).map(Some)
}

fn encode_key(key: &MasterKey) -> Zeroizing<String> {
    Zeroizing::new(format!(
        "{KEY_MARKER}{}\n",
        general_purpose::STANDARD.encode(key.as_bytes())
    ))
}

fn decode_key(contents: &str) -> Result<MasterKey, VaultError> {
    let body = contents
        .trim_end()
        .strip_prefix(KEY_MARKER)
        .ok_or_else(|| VaultError::corrupt_key("missing format marker"))?;

    let bytes = Zeroizing::new(
        general_purpose::STANDARD
            .decode(body)
            .map_err(|e| VaultError::corrupt_key(format!("decode error: {e}")))?,
    );

    if bytes.len() != KEY_LEN {
        return Err(VaultError::corrupt_key(format!(
            "expected {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }

    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&bytes);
    let key = MasterKey::from_bytes(out);
    zeroize::Zeroize::zeroize(&mut out);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_loads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKeyStore::new(dir.path().join("db_key.key"));
        assert!(!store.exists());

        let generated = store.generate().expect("generate");
        assert!(store.exists());
        assert_eq!(store.load().expect("load"), generated);
    }

    #[test]
    fn missing_key_is_corrupt_not_defaulted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKeyStore::new(dir.path().join("db_key.key"));
        let err = store.load().expect_err("missing key");
        assert!(matches!(err, VaultError::CorruptKey { .. }));
    }

    #[test]
    fn truncated_or_unmarked_files_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db_key.key");
        let store = FileKeyStore::new(&path);
        store.generate().expect("generate");

        let full = fs::read_to_string(&path).expect("read");
        fs::write(&path, &full[..full.len() / 2]).expect("truncate");
        assert!(matches!(store.load(), Err(VaultError::CorruptKey { .. })));

        // Bare base64 of a Fernet-style key, without our marker.
        fs::write(&path, "IfjQ3BX0Kl36g3jC-rFj2_9bHmP8zc6gAt0J1jskRwA=").expect("write");
        assert!(matches!(store.load(), Err(VaultError::CorruptKey { .. })));

        fs::write(&path, [0xff, 0xfe, 0x00]).expect("write binary");
        assert!(matches!(store.load(), Err(VaultError::CorruptKey { .. })));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode_key("sqlvault-key-v1:abcd").expect_err("should reject wrong length");
        assert!(matches!(err, VaultError::CorruptKey { .. }));
    }

    #[test]
    fn rotate_replaces_key_and_clears_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKeyStore::new(dir.path().join("db_key.key"));
        let old = store.generate().expect("generate");
        let next = MasterKey::random();

        store.stage(&next).expect("stage");
        assert_eq!(store.staged().expect("staged"), Some(next.clone()));
        assert_eq!(store.load().expect("load"), old);

        store.rotate(&next).expect("rotate");
        assert_eq!(store.load().expect("load"), next);
        assert_eq!(store.staged().expect("staged"), None);
    }

    #[test]
    fn discarding_staged_key_removes_pending_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKeyStore::new(dir.path().join("db_key.key"));
        let active = store.generate().expect("generate");
        store.stage(&MasterKey::random()).expect("stage");
        assert!(store.pending_path().exists());

        store.discard_staged().expect("discard");
        assert!(!store.pending_path().exists());
        assert_eq!(store.staged().expect("staged"), None);
        assert_eq!(store.load().expect("load"), active);

        store.discard_staged().expect("nothing to discard");
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileKeyStore::new(dir.path().join("db_key.key"));
        store.generate().expect("generate");
        let mode = fs::metadata(store.path()).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn unwritable_directory_surfaces_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file").expect("write");
        let store = FileKeyStore::new(blocker.join("db_key.key"));
        assert!(matches!(store.generate(), Err(VaultError::Io(_))));
    }

    #[test]
    fn memory_store_returns_same_key() {
        let store = InMemoryKeyStore::default();
        assert!(!store.exists());
        let first = store.generate().expect("generate");
        let second = store.load().expect("load");
        assert_eq!(first, second);

        store.stage(&MasterKey::random()).expect("stage");
        store.discard_staged().expect("discard");
        assert_eq!(store.staged().expect("staged"), None);
    }
}
