//! Build, read, and write compressed, encrypted packs of [blobs](crate::blob::Blob).
//!
//! On-disk layout (§4.3): `N` encrypted blob bodies, then an encrypted
//! header listing `(kind, length, id)` per body in append order, then a
//! trailing little-endian `u32` giving the encrypted header's length. The
//! pack's own backend name is the SHA-256 of its complete byte stream.

use std::io::prelude::*;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tracing::*;

use crate::blob::{Blob, Kind as BlobKind};
use crate::crypto::{self, Key};
use crate::error::{Error, Result};
use crate::hashing::ObjectId;

/// One record in a pack's header: which blob, how long its encrypted body
/// is, and (implicitly, via cumulative sum) where it starts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Manifest {
    pub kind: BlobKind,
    pub id: ObjectId,
    pub offset: u64,
    pub length: u64,
}

const RECORD_LEN: usize = 1 + 4 + ObjectId::LEN;
const TRAILER_LEN: usize = 4;

fn kind_byte(kind: BlobKind) -> u8 {
    match kind {
        BlobKind::Chunk => 0,
        BlobKind::Tree => 1,
    }
}

fn byte_kind(b: u8) -> Result<BlobKind> {
    match b {
        0 => Ok(BlobKind::Chunk),
        1 => Ok(BlobKind::Tree),
        other => Err(Error::Corrupted(
            "pack header".to_string(),
            format!("unknown blob kind byte {other}"),
        )),
    }
}

fn compress(plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(plaintext)?;
    Ok(enc.finish()?)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut dec = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    dec.read_to_end(&mut out).map_err(|e| {
        Error::Corrupted("blob body".to_string(), format!("zlib inflate failed: {e}"))
    })?;
    Ok(out)
}

/// A finalized, ready-to-upload pack.
pub struct FinishedPack {
    pub id: ObjectId,
    pub bytes: Vec<u8>,
    pub manifest: Vec<Manifest>,
}

/// Accumulates blobs into one pack in memory until it's finalized.
///
/// Packs stay well under the tens-of-megabytes range (§4.3's target is
/// 4-16 MiB), so building them as one contiguous buffer is simpler than
/// streaming through a temp file and costs nothing observable.
pub struct PackWriter {
    body: Vec<u8>,
    records: Vec<(BlobKind, ObjectId, u64)>, // kind, id, length
}

impl PackWriter {
    pub fn new() -> Self {
        Self {
            body: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether this in-progress pack already has a body for `(kind, id)`,
    /// so a caller can dedup against blobs not yet uploaded (and therefore
    /// not yet in the index) rather than just those already sealed.
    pub fn contains(&self, kind: BlobKind, id: ObjectId) -> bool {
        self.records.iter().any(|(k, i, _)| *k == kind && *i == id)
    }

    /// Size of the pack so far, including bodies but not the (not-yet-built)
    /// header and trailer. Good enough for target-size comparisons.
    pub fn len(&self) -> u64 {
        self.body.len() as u64
    }

    /// Compresses and encrypts `blob`'s bytes and appends them to the pack.
    pub fn add(&mut self, key: &Key, blob: &Blob) -> Result<()> {
        let compressed = compress(blob.bytes())?;
        let envelope = crypto::encrypt(key, &compressed);
        self.records
            .push((blob.kind, blob.id, envelope.len() as u64));
        self.body.extend_from_slice(&envelope);
        Ok(())
    }

    /// Serializes, encrypts, and appends the header and trailer, then hashes
    /// the whole thing to get the pack's backend name.
    pub fn finish(mut self, key: &Key) -> Result<FinishedPack> {
        let mut header_plain = Vec::with_capacity(self.records.len() * RECORD_LEN);
        let mut manifest = Vec::with_capacity(self.records.len());
        let mut offset = 0u64;
        for (kind, id, length) in &self.records {
            header_plain.push(kind_byte(*kind));
            header_plain.extend_from_slice(&(*length as u32).to_le_bytes());
            header_plain.extend_from_slice(id.as_bytes());
            manifest.push(Manifest {
                kind: *kind,
                id: *id,
                offset,
                length: *length,
            });
            offset += length;
        }

        let header_envelope = crypto::encrypt(key, &header_plain);
        let header_len = header_envelope.len() as u32;

        self.body.extend_from_slice(&header_envelope);
        self.body.extend_from_slice(&header_len.to_le_bytes());

        let id = ObjectId::hash(&self.body);
        debug!(
            "Finished pack {} ({} blobs, {} bytes)",
            id,
            manifest.len(),
            self.body.len()
        );

        Ok(FinishedPack {
            id,
            bytes: self.body,
            manifest,
        })
    }
}

impl Default for PackWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses an already-decrypted pack header into its manifest records.
pub fn parse_header(header_plain: &[u8]) -> Result<Vec<Manifest>> {
    if header_plain.len() % RECORD_LEN != 0 {
        return Err(Error::Corrupted(
            "pack header".to_string(),
            format!(
                "header length {} isn't a multiple of record length {RECORD_LEN}",
                header_plain.len()
            ),
        ));
    }
    let mut manifest = Vec::with_capacity(header_plain.len() / RECORD_LEN);
    let mut offset = 0u64;
    for record in header_plain.chunks_exact(RECORD_LEN) {
        let kind = byte_kind(record[0])?;
        let length = u32::from_le_bytes(record[1..5].try_into().unwrap()) as u64;
        let id = ObjectId::from_bytes(&record[5..5 + ObjectId::LEN])?;
        manifest.push(Manifest {
            kind,
            id,
            offset,
            length,
        });
        offset += length;
    }
    Ok(manifest)
}

/// Given a full pack's bytes, returns its manifest by reading only the tail
/// (trailer + header), matching the "self-describing" invariant (§8.5):
/// callers never need to scan the whole pack to know what it contains.
pub fn manifest_from_tail(key: &Key, pack_bytes: &[u8]) -> Result<Vec<Manifest>> {
    if pack_bytes.len() < TRAILER_LEN {
        return Err(Error::Corrupted(
            "pack".to_string(),
            "shorter than the trailer".to_string(),
        ));
    }
    let (body_and_header, trailer) = pack_bytes.split_at(pack_bytes.len() - TRAILER_LEN);
    let header_len = u32::from_le_bytes(trailer.try_into().unwrap()) as usize;
    if header_len > body_and_header.len() {
        return Err(Error::Corrupted(
            "pack".to_string(),
            "header-length trailer exceeds pack size".to_string(),
        ));
    }
    let header_envelope = &body_and_header[body_and_header.len() - header_len..];
    let header_plain = crypto::decrypt(key, header_envelope, "pack header")?;
    parse_header(&header_plain)
}

/// Decrypts and decompresses one blob body given its manifest location.
pub fn decode_body(key: &Key, envelope: &[u8], context: &str) -> Result<Vec<u8>> {
    let compressed = crypto::decrypt(key, envelope, context)?;
    decompress(&compressed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blob::Contents;

    fn blob(kind: BlobKind, bytes: &[u8]) -> Blob {
        Blob {
            contents: Contents::Buffer(bytes.to_vec()),
            id: ObjectId::hash(bytes),
            kind,
        }
    }

    #[test]
    fn pack_round_trips_one_blob() {
        let key = Key::generate();
        let mut w = PackWriter::new();
        let b = blob(BlobKind::Chunk, b"hello pack world");
        w.add(&key, &b).unwrap();
        let finished = w.finish(&key).unwrap();

        let manifest = manifest_from_tail(&key, &finished.bytes).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].id, b.id);
        assert_eq!(manifest[0].offset, 0);

        let body_envelope =
            &finished.bytes[manifest[0].offset as usize..][..manifest[0].length as usize];
        let decoded = decode_body(&key, body_envelope, "test").unwrap();
        assert_eq!(decoded, b"hello pack world");
    }

    #[test]
    fn pack_preserves_append_order_and_offsets() {
        let key = Key::generate();
        let mut w = PackWriter::new();
        let a = blob(BlobKind::Chunk, b"first");
        let b = blob(BlobKind::Tree, b"second, a bit longer");
        w.add(&key, &a).unwrap();
        w.add(&key, &b).unwrap();
        let finished = w.finish(&key).unwrap();

        let manifest = manifest_from_tail(&key, &finished.bytes).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].id, a.id);
        assert_eq!(manifest[1].id, b.id);
        assert_eq!(manifest[1].offset, manifest[0].length);
        assert_eq!(manifest[0].kind, BlobKind::Chunk);
        assert_eq!(manifest[1].kind, BlobKind::Tree);
    }

    #[test]
    fn empty_pack_has_empty_manifest() {
        let key = Key::generate();
        let w = PackWriter::new();
        assert!(w.is_empty());
        let finished = w.finish(&key).unwrap();
        let manifest = manifest_from_tail(&key, &finished.bytes).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn corrupted_trailer_is_rejected() {
        let key = Key::generate();
        let mut w = PackWriter::new();
        w.add(&key, &blob(BlobKind::Chunk, b"x")).unwrap();
        let mut finished = w.finish(&key).unwrap();
        let last = finished.bytes.len() - 1;
        finished.bytes[last] = 0xff; // blow up the header-length trailer
        assert!(manifest_from_tail(&key, &finished.bytes).is_err());
    }
}
