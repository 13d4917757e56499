//! The authenticated-encryption envelope and key hierarchy.
//!
//! Envelope layout: `IV (16) || ciphertext || tag (16)`. Encryption is
//! AES-256-CTR; integrity is Poly1305-AES, the same construction restic
//! uses: the MAC key splits into a 16-byte AES key `k` and a 16-byte,
//! per-message-independent Poly1305 `r`. The one-time Poly1305 `s` half of
//! the key is `AES_k(IV)`, so every message gets a fresh Poly1305 key
//! without needing a second random value on the wire.

use aes::Aes128;
use aes::Aes256;
use aes::cipher::{BlockEncrypt, KeyInit, StreamCipher};
use ctr::Ctr128BE;
use poly1305::Poly1305;
use rand::RngCore;
use scrypt::Params as ScryptParams;
use universal_hash::{KeyInit as _, UniversalHash};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
/// IV + tag framing overhead added to every envelope.
pub const ENVELOPE_OVERHEAD: usize = IV_LEN + TAG_LEN;

type Aes256Ctr = Ctr128BE<Aes256>;

/// A (Kenc, Kmac) pair. Used both as the repository's persistent master key
/// and as the password-derived key that wraps it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key {
    enc: [u8; KEY_LEN],
    mac: [u8; KEY_LEN],
}

impl Key {
    pub fn generate() -> Self {
        let mut enc = [0u8; KEY_LEN];
        let mut mac = [0u8; KEY_LEN];
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut enc);
        rng.fill_bytes(&mut mac);
        Self { enc, mac }
    }

    /// Splits a 64-byte scrypt output into (Kenc, Kmac).
    fn from_kdf_output(bytes: [u8; 64]) -> Self {
        let mut enc = [0u8; KEY_LEN];
        let mut mac = [0u8; KEY_LEN];
        enc.copy_from_slice(&bytes[..KEY_LEN]);
        mac.copy_from_slice(&bytes[KEY_LEN..]);
        Self { enc, mac }
    }

    pub fn to_bytes(&self) -> [u8; 2 * KEY_LEN] {
        let mut out = [0u8; 2 * KEY_LEN];
        out[..KEY_LEN].copy_from_slice(&self.enc);
        out[KEY_LEN..].copy_from_slice(&self.mac);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 2 * KEY_LEN {
            return Err(Error::invalid(
                "key",
                format!("expected {} bytes, got {}", 2 * KEY_LEN, bytes.len()),
            ));
        }
        let mut enc = [0u8; KEY_LEN];
        let mut mac = [0u8; KEY_LEN];
        enc.copy_from_slice(&bytes[..KEY_LEN]);
        mac.copy_from_slice(&bytes[KEY_LEN..]);
        Ok(Self { enc, mac })
    }

    /// The fixed half of the per-message Poly1305 key: `k` (AES-128 key used
    /// to derive `s`) and `r` (the Poly1305 multiplier, reused every message
    /// since it never touches the wire directly).
    fn mac_k(&self) -> &[u8] {
        &self.mac[..16]
    }

    fn mac_r(&self) -> &[u8] {
        &self.mac[16..]
    }

    fn poly1305_key(&self, iv: &[u8; IV_LEN]) -> poly1305::Key {
        let k = Aes128::new_from_slice(self.mac_k()).expect("16-byte key");
        let mut s = aes::Block::clone_from_slice(iv);
        k.encrypt_block(&mut s);

        let mut key_bytes = [0u8; 32];
        key_bytes[..16].copy_from_slice(self.mac_r());
        key_bytes[16..].copy_from_slice(&s);
        key_bytes.into()
    }

    fn tag(&self, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = Poly1305::new(&self.poly1305_key(iv));
        mac.update_padded(iv);
        mac.update_padded(ciphertext);
        mac.finalize().into_bytes().into()
    }
}

/// Scrypt parameters plus the salt used to derive a password key; stored
/// alongside each wrapped master key inside a Key object.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct KdfParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // N=2^15, r=8, p=1: scrypt's own recommended interactive-use parameters.
        Self {
            log_n: 15,
            r: 8,
            p: 1,
        }
    }
}

pub const SALT_LEN: usize = 64;

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derives a user key from a password and salt via scrypt.
pub fn derive_key(password: &[u8], salt: &[u8], params: KdfParams) -> Result<Key> {
    let scrypt_params = ScryptParams::new(params.log_n, params.r, params.p, 64)
        .map_err(|e| Error::invalid("scrypt parameters", e))?;
    let mut out = [0u8; 64];
    scrypt::scrypt(password, salt, &scrypt_params, &mut out)
        .map_err(|e| Error::invalid("scrypt output", e))?;
    let key = Key::from_kdf_output(out);
    out.zeroize();
    Ok(key)
}

/// Encrypts `plaintext` into a self-contained envelope: `IV || ciphertext || tag`.
pub fn encrypt(key: &Key, plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut ciphertext = plaintext.to_vec();
    let mut cipher = Aes256Ctr::new(&key.enc.into(), &iv.into());
    cipher.apply_keystream(&mut ciphertext);

    let tag = key.tag(&iv, &ciphertext);

    let mut envelope = Vec::with_capacity(IV_LEN + ciphertext.len() + TAG_LEN);
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&ciphertext);
    envelope.extend_from_slice(&tag);
    envelope
}

/// Decrypts an envelope, failing with [`Error::Unauthenticated`] *before*
/// returning any plaintext if the tag doesn't match.
pub fn decrypt(key: &Key, envelope: &[u8], context: &str) -> Result<Vec<u8>> {
    if envelope.len() < ENVELOPE_OVERHEAD {
        return Err(Error::Corrupted(
            context.to_string(),
            "envelope shorter than IV+tag overhead".to_string(),
        ));
    }

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&envelope[..IV_LEN]);
    let ciphertext = &envelope[IV_LEN..envelope.len() - TAG_LEN];
    let given_tag = &envelope[envelope.len() - TAG_LEN..];

    let expected_tag = key.tag(&iv, ciphertext);
    // Constant-time-ish comparison: the poly1305 crate's CtOption would be
    // nicer, but a manual XOR-fold over a 16-byte tag is standard here too.
    let mismatch = expected_tag
        .iter()
        .zip(given_tag)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if mismatch != 0 {
        return Err(Error::Unauthenticated(context.to_string()));
    }

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(&key.enc.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips() {
        let key = Key::generate();
        let msg = b"the quick brown fox jumps over the lazy dog";
        let envelope = encrypt(&key, msg);
        let decrypted = decrypt(&key, &envelope, "test").unwrap();
        assert_eq!(decrypted, msg);
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let key = Key::generate();
        let envelope = encrypt(&key, b"");
        let decrypted = decrypt(&key, &envelope, "test").unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn flipped_bit_is_unauthenticated() {
        let key = Key::generate();
        let mut envelope = encrypt(&key, b"foobar");
        let last = envelope.len() / 2;
        envelope[last] ^= 0x01;
        let err = decrypt(&key, &envelope, "test").unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[test]
    fn wrong_key_is_unauthenticated() {
        let key = Key::generate();
        let other = Key::generate();
        let envelope = encrypt(&key, b"foobar");
        let err = decrypt(&other, &envelope, "test").unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[test]
    fn kdf_is_deterministic_for_same_salt() {
        let salt = random_salt();
        let params = KdfParams {
            log_n: 4,
            r: 1,
            p: 1,
        }; // tiny params so the test runs fast
        let a = derive_key(b"hunter2", &salt, params).unwrap();
        let b = derive_key(b"hunter2", &salt, params).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn kdf_differs_for_different_passwords() {
        let salt = random_salt();
        let params = KdfParams {
            log_n: 4,
            r: 1,
            p: 1,
        };
        let a = derive_key(b"hunter2", &salt, params).unwrap();
        let b = derive_key(b"hunter3", &salt, params).unwrap();
        assert_ne!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn key_wrapping_round_trips() {
        let salt = random_salt();
        let params = KdfParams {
            log_n: 4,
            r: 1,
            p: 1,
        };
        let user_key = derive_key(b"geheim", &salt, params).unwrap();
        let master = Key::generate();

        let wrapped = encrypt(&user_key, &master.to_bytes());
        let unwrapped = decrypt(&user_key, &wrapped, "master key").unwrap();
        assert_eq!(unwrapped, master.to_bytes());

        let wrong_user_key = derive_key(b"wrong", &salt, params).unwrap();
        assert!(decrypt(&wrong_user_key, &wrapped, "master key").is_err());
    }
}
