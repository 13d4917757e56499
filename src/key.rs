//! Key objects: self-contained, password-wrapped copies of the repository's
//! master key (§3.2, §4.2).

use serde::{Deserialize, Serialize};

use crate::crypto::{self, KdfParams, Key};
use crate::error::{Error, Result};
use crate::hashing::ObjectId;

/// The on-backend JSON envelope for one password (§3.2, §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    kdf: String,
    params: KdfParams,
    #[serde(with = "base64_bytes")]
    salt: Vec<u8>,
    #[serde(with = "base64_bytes")]
    wrapped_master: Vec<u8>,
    /// A human label, e.g. "added 2026-01-01 by alice@laptop" -- purely
    /// informational, never consulted by unlock logic.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,
}

mod base64_bytes {
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

impl KeyFile {
    /// Wraps `master` under a freshly derived key for `password`.
    pub fn wrap(password: &[u8], master: &Key, params: KdfParams) -> Result<Self> {
        let salt = crypto::random_salt();
        let user_key = crypto::derive_key(password, &salt, params)?;
        let wrapped_master = crypto::encrypt(&user_key, &master.to_bytes());
        Ok(Self {
            kdf: "scrypt".to_string(),
            params,
            salt: salt.to_vec(),
            wrapped_master,
            label: None,
        })
    }

    /// Attempts to unwrap the master key with `password`.
    pub fn try_unwrap(&self, password: &[u8]) -> Result<Key> {
        if self.kdf != "scrypt" {
            return Err(Error::invalid("key file", format!("unknown kdf {}", self.kdf)));
        }
        let user_key = crypto::derive_key(password, &self.salt, self.params)?;
        let master_bytes = crypto::decrypt(&user_key, &self.wrapped_master, "master key")?;
        Key::from_bytes(&master_bytes)
    }

    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn id(&self) -> Result<ObjectId> {
        Ok(ObjectId::hash(&self.to_canonical_json()?))
    }
}

/// Tries each key object in turn, returning the master key from the first
/// one that unwraps. Surfaces [`Error::WrongPassword`] only once every
/// candidate has failed (§4.2).
pub fn unlock(password: &[u8], candidates: &[KeyFile]) -> Result<Key> {
    for key_file in candidates {
        if let Ok(master) = key_file.try_unwrap(password) {
            return Ok(master);
        }
    }
    Err(Error::WrongPassword)
}

#[cfg(test)]
mod test {
    use super::*;

    fn tiny_params() -> KdfParams {
        KdfParams {
            log_n: 4,
            r: 1,
            p: 1,
        }
    }

    #[test]
    fn wrap_then_unwrap_round_trips() {
        let master = Key::generate();
        let key_file = KeyFile::wrap(b"geheim", &master, tiny_params()).unwrap();
        let unwrapped = key_file.try_unwrap(b"geheim").unwrap();
        assert_eq!(unwrapped.to_bytes(), master.to_bytes());
    }

    #[test]
    fn wrong_password_fails_to_unwrap() {
        let master = Key::generate();
        let key_file = KeyFile::wrap(b"geheim", &master, tiny_params()).unwrap();
        assert!(key_file.try_unwrap(b"wrong").is_err());
    }

    #[test]
    fn unlock_tries_every_candidate() {
        let master = Key::generate();
        let a = KeyFile::wrap(b"alice-pw", &master, tiny_params()).unwrap();
        let b = KeyFile::wrap(b"bob-pw", &master, tiny_params()).unwrap();

        let unlocked = unlock(b"bob-pw", &[a.clone(), b.clone()]).unwrap();
        assert_eq!(unlocked.to_bytes(), master.to_bytes());

        assert!(matches!(
            unlock(b"carol-pw", &[a, b]).unwrap_err(),
            Error::WrongPassword
        ));
    }

    #[test]
    fn serialization_round_trips() {
        let master = Key::generate();
        let key_file = KeyFile::wrap(b"geheim", &master, tiny_params()).unwrap();
        let json = key_file.to_canonical_json().unwrap();
        let restored = KeyFile::from_slice(&json).unwrap();
        assert_eq!(
            restored.try_unwrap(b"geheim").unwrap().to_bytes(),
            master.to_bytes()
        );
    }
}
