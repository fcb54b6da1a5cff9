// Ordered set of symmetric keys for the gossip wire format (spec §4.3).
// `primary` (position 0) encrypts; decryption tries every installed key in
// order. Grounded in the teacher's `networking::security::encryption`
// module's use of `aes_gcm::{Aead, KeyInit}`, but simplified to the flat
// keyring Serf/memberlist-style systems use instead of that module's
// envelope-encryption (DEK/KEK) hierarchy, which this spec has no use for.

use parking_lot::RwLock;

use crate::error::{Error, Result};

const VALID_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

#[derive(Default)]
struct Inner {
    keys: Vec<Vec<u8>>,
}

/// Thread-safe, atomically-updatable keyring. All mutating operations take
/// the internal write lock only for the duration of the vector edit, never
/// across encrypt/decrypt calls, so gossip can proceed concurrently with
/// rotation.
pub struct Keyring {
    inner: RwLock<Inner>,
}

impl Keyring {
    pub fn new(keys: Vec<Vec<u8>>) -> Result<Self> {
        for k in &keys {
            validate_len(k)?;
        }
        Ok(Self {
            inner: RwLock::new(Inner { keys }),
        })
    }

    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().keys.is_empty()
    }

    /// The key used to encrypt outbound traffic, i.e. position 0.
    pub fn primary(&self) -> Option<Vec<u8>> {
        self.inner.read().keys.first().cloned()
    }

    /// All installed keys, primary first, in the order decryption tries them.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.inner.read().keys.clone()
    }

    /// Appends `key` to the keyring without making it primary.
    pub fn install(&self, key: Vec<u8>) -> Result<()> {
        validate_len(&key)?;
        let mut inner = self.inner.write();
        if !inner.keys.contains(&key) {
            inner.keys.push(key);
        }
        Ok(())
    }

    /// Rotates `key` to position 0. The key must already be installed.
    pub fn use_key(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        let pos = inner
            .keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| Error::Keyring("key not installed".into()))?;
        let k = inner.keys.remove(pos);
        inner.keys.insert(0, k);
        Ok(())
    }

    /// Removes `key`. Forbidden when `key` is the current primary.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.keys.first().map(|k| k.as_slice()) == Some(key) {
            return Err(Error::Keyring("cannot remove the primary key".into()));
        }
        inner.keys.retain(|k| k != key);
        Ok(())
    }
}

fn validate_len(key: &[u8]) -> Result<()> {
    if !VALID_KEY_LENGTHS.contains(&key.len()) {
        return Err(Error::Keyring(format!(
            "key must be 16, 24, or 32 bytes, got {}",
            key.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> Vec<u8> {
        vec![b; 32]
    }

    #[test]
    fn primary_is_position_zero() {
        let kr = Keyring::new(vec![key(1), key(2)]).unwrap();
        assert_eq!(kr.primary(), Some(key(1)));
    }

    #[test]
    fn use_key_rotates_to_front() {
        let kr = Keyring::new(vec![key(1), key(2)]).unwrap();
        kr.use_key(&key(2)).unwrap();
        assert_eq!(kr.primary(), Some(key(2)));
        assert_eq!(kr.keys(), vec![key(2), key(1)]);
    }

    #[test]
    fn remove_primary_forbidden() {
        let kr = Keyring::new(vec![key(1)]).unwrap();
        assert!(kr.remove(&key(1)).is_err());
    }

    #[test]
    fn install_rejects_bad_length() {
        let kr = Keyring::empty();
        assert!(kr.install(vec![0u8; 10]).is_err());
    }
}
