use std::{fs, io, path::Path};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use sqlvault_core::{MasterKey, VaultError};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::atomic::{self, WriteOptions};

/// Leading bytes of every envelope file.
pub const MAGIC: &[u8; 4] = b"SQLV";
/// Newest format revision this build reads and the one it writes.
pub const ENVELOPE_VERSION: u8 = 1;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + 1;

/// Versioned AES-256-GCM container for the database file.
///
/// Layout: `magic ‖ version ‖ nonce ‖ ciphertext ‖ tag`. The magic and
/// version are bound as associated data, so editing them breaks the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    version: u8,
    nonce: [u8; NONCE_LEN],
    /// Ciphertext with the GCM tag appended.
    sealed: Vec<u8>,
}

impl CipherEnvelope {
    /// Encrypt `plaintext` under `key` with a fresh random nonce.
    #[instrument(skip_all, fields(len = plaintext.len()))]
    pub fn seal(plaintext: &[u8], key: &MasterKey) -> Result<Self, VaultError> {
        let cipher = build_cipher(key)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &header(ENVELOPE_VERSION),
                },
            )
            .map_err(|_| {
                VaultError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "payload too large to seal",
                ))
            })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce.as_slice());
        Ok(Self {
            version: ENVELOPE_VERSION,
            nonce: nonce_bytes,
            sealed,
        })
    }

    /// Verify the tag and return the plaintext.
    ///
    /// Wrong key, corruption and tampering are all reported as
    /// [`VaultError::Decryption`].
    #[instrument(skip_all, fields(version = self.version))]
    pub fn open(&self, key: &MasterKey) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        check_version(self.version)?;
        let cipher = build_cipher(key)?;
        cipher
            .decrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: &self.sealed,
                    aad: &header(self.version),
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| VaultError::Decryption)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Authentication tag (trailing bytes of the sealed payload).
    pub fn tag(&self) -> &[u8] {
        &self.sealed[self.sealed.len() - TAG_LEN..]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + self.sealed.len());
        out.extend_from_slice(&header(self.version));
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.sealed);
        out
    }

    /// Parse the container framing. Does not touch the key; authenticity is
    /// only established by [`open`](Self::open).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(VaultError::Decryption);
        }
        let version = bytes[MAGIC.len()];
        check_version(version)?;

        let body = &bytes[HEADER_LEN..];
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Decryption);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&body[..NONCE_LEN]);
        Ok(Self {
            version,
            nonce,
            sealed: body[NONCE_LEN..].to_vec(),
        })
    }

    /// Persist through an atomic replace.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn write_to(&self, path: &Path) -> Result<(), VaultError> {
        atomic::write_atomic(path, &self.to_bytes(), WriteOptions::secret())?;
        debug!(len = self.sealed.len(), "envelope written");
        Ok(())
    }

    /// Read an envelope file; `Ok(None)` if it does not exist.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn read_from(path: &Path) -> Result<Option<Self>, VaultError> {
        match fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn header(version: u8) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[..MAGIC.len()].copy_from_slice(MAGIC);
    out[MAGIC.len()] = version;
    out
}

fn check_version(version: u8) -> Result<(), VaultError> {
    if version > ENVELOPE_VERSION {
        return Err(VaultError::UnsupportedVersion {
            found: version,
            supported: ENVELOPE_VERSION,
        });
    }
    if version == 0 {
        return Err(VaultError::Decryption);
    }
    Ok(())
}

fn build_cipher(key: &MasterKey) -> Result<Aes256Gcm, VaultError> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::corrupt_key(format!("cipher init failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_encrypts_and_decrypts() {
        let key = MasterKey::random();
        for payload in [
            Vec::new(),
            b"SQLite format 3\0".to_vec(),
            vec![0x5a; 64 * 1024 + 7],
        ] {
            let envelope = CipherEnvelope::seal(&payload, &key).expect("seal");
            let parsed = CipherEnvelope::from_bytes(&envelope.to_bytes()).expect("parse");
            assert_eq!(parsed, envelope);
            assert_eq!(parsed.tag().len(), TAG_LEN);
            assert_eq!(parsed.open(&key).expect("open").as_slice(), payload.as_slice());
        }
    }

    #[test]
    fn ciphertext_does_not_contain_plaintext() {
        let key = MasterKey::random();
        let bytes = CipherEnvelope::seal(b"TESTDATA-TESTDATA", &key)
            .expect("seal")
            .to_bytes();
        assert!(!bytes.windows(8).any(|w| w == b"TESTDATA"));
    }

    #[test]
    fn every_seal_uses_a_fresh_nonce() {
        let key = MasterKey::random();
        let a = CipherEnvelope::seal(b"same", &key).expect("seal");
        let b = CipherEnvelope::seal(b"same", &key).expect("seal");
        assert_ne!(a.nonce(), b.nonce());
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn flipping_any_ciphertext_or_tag_bit_is_rejected() {
        let key = MasterKey::random();
        let bytes = CipherEnvelope::seal(b"payload!", &key)
            .expect("seal")
            .to_bytes();
        let body_start = HEADER_LEN + NONCE_LEN;

        for index in body_start..bytes.len() {
            for bit in 0..8 {
                let mut tampered = bytes.clone();
                tampered[index] ^= 1 << bit;
                let envelope = CipherEnvelope::from_bytes(&tampered).expect("framing intact");
                let err = envelope.open(&key).expect_err("tamper must be detected");
                assert!(matches!(err, VaultError::Decryption));
            }
        }
    }

    #[test]
    fn nonce_and_header_are_authenticated() {
        let key = MasterKey::random();
        let bytes = CipherEnvelope::seal(b"payload", &key)
            .expect("seal")
            .to_bytes();

        let mut tampered = bytes.clone();
        tampered[HEADER_LEN] ^= 0x01;
        let err = CipherEnvelope::from_bytes(&tampered)
            .and_then(|e| e.open(&key))
            .expect_err("nonce tamper");
        assert!(matches!(err, VaultError::Decryption));

        let mut tampered = bytes;
        tampered[0] = b'X';
        assert!(matches!(
            CipherEnvelope::from_bytes(&tampered),
            Err(VaultError::Decryption)
        ));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let envelope = CipherEnvelope::seal(b"secret rows", &MasterKey::random()).expect("seal");
        let err = envelope
            .open(&MasterKey::random())
            .expect_err("wrong key must fail");
        assert!(matches!(err, VaultError::Decryption));
    }

    #[test]
    fn newer_version_is_unsupported() {
        let key = MasterKey::random();
        let mut bytes = CipherEnvelope::seal(b"x", &key).expect("seal").to_bytes();
        bytes[MAGIC.len()] = ENVELOPE_VERSION + 1;
        let err = CipherEnvelope::from_bytes(&bytes).expect_err("future version");
        assert!(matches!(
            err,
            VaultError::UnsupportedVersion {
                found: 2,
                supported: 1
            }
        ));

        bytes[MAGIC.len()] = 0;
        assert!(matches!(
            CipherEnvelope::from_bytes(&bytes),
            Err(VaultError::Decryption)
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let key = MasterKey::random();
        let bytes = CipherEnvelope::seal(b"", &key).expect("seal").to_bytes();
        for len in [0, 3, HEADER_LEN, bytes.len() - 1] {
            let result = CipherEnvelope::from_bytes(&bytes[..len]).and_then(|e| e.open(&key));
            assert!(matches!(result, Err(VaultError::Decryption)), "len {len}");
        }
    }

    #[test]
    fn file_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("database.db.enc");
        assert_eq!(CipherEnvelope::read_from(&path).expect("read"), None);

        let key = MasterKey::random();
        CipherEnvelope::seal(b"rows", &key)
            .expect("seal")
            .write_to(&path)
            .expect("write");
        let loaded = CipherEnvelope::read_from(&path)
            .expect("read")
            .expect("present");
        assert_eq!(loaded.open(&key).expect("open").as_slice(), b"rows");
    }
}
