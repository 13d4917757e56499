//! Tools for hashing everything we care about into a unique [`ObjectId`]

use std::fmt;
use std::io;
use std::io::prelude::*;

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, digest::Output};

use crate::error::{Error, Result};

type Sha256Digest = Output<Sha256>;

/// The hash (SHA-256) used to identify every object in the repository.
///
/// Every backend object name except `config` is the hex form of its own
/// `ObjectId`, so this type's `Display` impl doubles as the canonical
/// on-backend name.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId {
    digest: Sha256Digest,
}

impl ObjectId {
    pub const LEN: usize = 32;

    /// Calculates an ID from the given bytes.
    pub fn hash(bytes: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(bytes),
        }
    }

    /// A random, non-content-addressed id -- used for things like a fresh
    /// repository's id, which names nothing in particular.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; Self::LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_digest(*Sha256Digest::from_slice(&bytes))
    }

    fn from_digest(digest: Sha256Digest) -> Self {
        Self { digest }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(Error::invalid(
                "object id",
                format!("expected {} bytes, got {}", Self::LEN, bytes.len()),
            ));
        }
        Ok(Self::from_digest(*Sha256Digest::from_slice(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.digest.as_slice()
    }

    /// A git-like shortened hex form, unique enough for most UI uses.
    pub fn short_name(&self) -> String {
        HEXLOWER.encode(&self.digest[..4])
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", HEXLOWER.encode(&self.digest))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.digest))
    }
}

impl std::str::FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = HEXLOWER
            .decode(s.to_lowercase().as_bytes())
            .map_err(|e| Error::invalid("object id", e))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Everything we persist is JSON, so there's no need for the dual
        // hex-vs-raw-bytes hack a CBOR-backed format would want: always
        // serialize as the canonical hex string.
        serializer.serialize_str(&HEXLOWER.encode(&self.digest))
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<ObjectId, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (ObjectId, R) {
        (ObjectId::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (ObjectId, W) {
        (ObjectId::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const DEVELOPERS: &[u8] = b"Developers, developers, developers, developers!".as_slice();

    #[test]
    fn foobar_hashes_to_known_digest() {
        let id = ObjectId::hash(b"foobar");
        assert_eq!(
            id.to_string(),
            "c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2"
        );
    }

    #[test]
    fn round_trips_through_display_and_fromstr() {
        let id = ObjectId::hash(DEVELOPERS);
        let parsed: ObjectId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn reader_and_writer_agree() -> std::io::Result<()> {
        let mut r = HashingReader::new(DEVELOPERS);
        io::copy(&mut r, &mut io::sink())?;
        let (rid, _) = r.finalize();

        let mut w = HashingWriter::new(io::sink());
        w.write_all(DEVELOPERS)?;
        let (wid, _) = w.finalize();

        assert_eq!(rid, wid);
        assert_eq!(rid, ObjectId::hash(DEVELOPERS));
        Ok(())
    }
}
