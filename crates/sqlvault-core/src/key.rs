use std::fmt;

use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the master key in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Symmetric key protecting the database envelope.
///
/// Bytes are wiped when the value is dropped and never appear in `Debug`
/// output, so a key can sit inside structs that get logged.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Fresh key from the OS CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_keys_differ() {
        assert_ne!(MasterKey::random(), MasterKey::random());
    }

    #[test]
    fn debug_never_prints_key_bytes() {
        let key = MasterKey::from_bytes([0xAB; KEY_LEN]);
        let rendered = format!("{key:?}");
        assert_eq!(rendered, "MasterKey(<redacted>)");
        assert!(!rendered.to_lowercase().contains("ab"));
    }
}
