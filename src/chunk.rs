//! Cut files into content-defined chunks.

use std::sync::Arc;

use camino::Utf8Path;
use fastcdc::v2020::FastCDC;
use tracing::*;

use crate::blob::{self, Blob};
use crate::error::Result;
use crate::file_util;
use crate::hashing::ObjectId;

/// A span of a shared byte buffer,
/// similar to [`Bytes`](https://docs.rs/bytes/latest/bytes/struct.Bytes.html),
/// but referencing a file it came from.
///
/// All chunks from a file share the same underlying buffer via a refcount to
/// avoid reallocating the whole file, bit by bit, as we pass its chunks to
/// the archiver pipeline.
#[derive(Debug, Clone)]
pub struct FileSpan {
    file: Arc<file_util::LoadedFile>,
    start: usize,
    end: usize,
}

impl AsRef<[u8]> for FileSpan {
    fn as_ref(&self) -> &[u8] {
        let bytes: &[u8] = self.file.bytes();
        &bytes[self.start..self.end]
    }
}

pub type ChunkedFile = Vec<Blob>;

/// The chunker's min/target/max sizes are repository parameters recorded in
/// `Config` at init time; these are just the defaults a fresh repository
/// gets.
pub const DEFAULT_MIN_SIZE: u32 = 1024 * 512;
pub const DEFAULT_TARGET_SIZE: u32 = 1024 * 1024;
pub const DEFAULT_MAX_SIZE: u32 = 1024 * 1024 * 8;

/// Cuts a file into content-defined chunks so that small local edits shift
/// only the chunks near the edit, letting unchanged chunks dedupe against
/// whatever's already in the repository.
///
/// FastCDC is used instead of a Rabin-based rolling hash (like restic's)
/// because it's considerably faster at the same job; see
/// <https://crates.io/crates/fastcdc>.
pub fn chunk_file<P: AsRef<Utf8Path>>(
    path: P,
    min_size: u32,
    target_size: u32,
    max_size: u32,
) -> Result<ChunkedFile> {
    let path: &Utf8Path = path.as_ref();

    let file = file_util::read_file(path)?;
    let file_bytes: &[u8] = file.bytes();

    trace!("Finding cut points for {path}");
    let cuts: Vec<_> = FastCDC::new(file_bytes, min_size, target_size, max_size).collect();
    debug!("Chunking {} into {} chunks", path, cuts.len());

    let chunks: Vec<Blob> = cuts
        .iter()
        .map(|chunk| {
            let file = file.clone();
            let start = chunk.offset;
            let end = chunk.offset + chunk.length;
            let span = FileSpan { file, start, end };

            let id = ObjectId::hash(span.as_ref());

            trace!("{}: [{}..{}] {}", path, start, end, id);

            Blob {
                contents: blob::Contents::Span(span),
                id,
                kind: blob::Kind::Chunk,
            }
        })
        .collect();

    Ok(chunks)
}
