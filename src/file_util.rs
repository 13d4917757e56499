//! Utilities for reading files into buffers and checking magic bytes.

use std::fs::File;
use std::io::prelude::*;
use std::sync::Arc;

use camino::Utf8Path;
use tracing::*;

use crate::counters;
use crate::error::{Error, Result};

/// Checks for the given magic bytes at the start of the file
pub fn check_magic<R: Read>(r: &mut R, expected: &[u8; 8]) -> Result<()> {
    let mut magic: [u8; 8] = [0; 8];
    r.read_exact(&mut magic)?;
    if &magic != expected {
        return Err(Error::Corrupted(
            "magic bytes".to_string(),
            format!(
                "expected {}, found {}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&magic)
            ),
        ));
    }
    Ok(())
}

/// A loaded file, either as a buffer (if it's small) or as a memory map.
#[derive(Debug)]
pub enum LoadedFile {
    Buffered(Vec<u8>),
    Mapped(memmap2::Mmap),
}

impl LoadedFile {
    pub fn bytes(&self) -> &[u8] {
        match self {
            LoadedFile::Buffered(vec) => vec,
            LoadedFile::Mapped(map) => map,
        }
    }
}

const MEGA: u64 = 1024 * 1024;
const MMAP_THRESHOLD: u64 = 10 * MEGA;

/// Reads an entire file if it's small enough, memory maps it otherwise.
pub fn read_file(path: &Utf8Path) -> Result<Arc<LoadedFile>> {
    let mut fh = File::open(path)?;
    let file_length = fh.metadata()?.len();

    let file = if file_length < MMAP_THRESHOLD {
        trace!("{} is < 10MB, reading to buffer", path);
        let mut buffer = Vec::with_capacity(file_length as usize);
        fh.read_to_end(&mut buffer)?;
        counters::bump(counters::Op::FileToBuffer);
        LoadedFile::Buffered(buffer)
    } else {
        trace!("{} is > 10MB, memory mapping", path);
        let mapping = unsafe { memmap2::Mmap::map(&fh)? };
        counters::bump(counters::Op::FileToMmap);
        LoadedFile::Mapped(mapping)
    };

    Ok(Arc::new(file))
}

#[cfg(unix)]
pub fn move_opened(from: &Utf8Path, from_fh: File, to: &Utf8Path) -> Result<()> {
    // POSIX lets us rename opened files. Neat!
    match std::fs::rename(from, to) {
        Ok(()) => {
            debug!("Renamed {} to {}", from, to);
            Ok(())
        }
        // Once io_error_more stabilizes: e.kind() == ErrorKind::CrossesDevices
        Err(e) if e.raw_os_error() == Some(18) /* EXDEV */ => {
            move_by_copy(from, from_fh, to)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(windows)]
pub fn move_opened(from: &Utf8Path, from_fh: File, to: &Utf8Path) -> Result<()> {
    // On Windows, we can't move an open file. Boo, Windows.
    move_by_copy(from, from_fh, to)
}

fn move_by_copy(from: &Utf8Path, mut from_fh: File, to: &Utf8Path) -> Result<()> {
    from_fh.seek(std::io::SeekFrom::Start(0))?;
    safe_copy_to_file(from_fh, to)?;

    std::fs::remove_file(from)?;
    debug!("Moved {} to {}", from, to);
    Ok(())
}

/// Copies the reader to a new file at `to + ".part"`, then renames to `to`.
///
/// This should guarantee that `to` never contains a partial file.
pub fn safe_copy_to_file<R: Read>(mut from: R, to: &Utf8Path) -> Result<()> {
    let to_part = camino::Utf8PathBuf::from(format!("{to}.part"));
    let to_part = to_part.as_path();

    let mut to_fh = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&to_part)?;

    std::io::copy(&mut from, &mut to_fh)?;
    drop(from);

    to_fh.sync_all()?;
    drop(to_fh);

    std::fs::rename(&to_part, to)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_small_file_as_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small");
        std::fs::write(&path, b"hello").unwrap();
        let path = Utf8Path::from_path(&path).unwrap();

        let loaded = read_file(path).unwrap();
        assert!(matches!(*loaded, LoadedFile::Buffered(_)));
        assert_eq!(loaded.bytes(), b"hello");
    }

    #[test]
    fn magic_mismatch_is_corrupted_error() {
        let mut cursor = std::io::Cursor::new(b"NOTRIGHT".to_vec());
        let err = check_magic(&mut cursor, b"CRYPOPAK").unwrap_err();
        assert!(matches!(err, Error::Corrupted(..)));
    }

    #[test]
    fn safe_copy_leaves_no_part_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let to = dir.path().join("dest");
        let to = Utf8Path::from_path(&to).unwrap();

        safe_copy_to_file(std::io::Cursor::new(b"payload".to_vec()), to).unwrap();
        assert_eq!(std::fs::read(to).unwrap(), b"payload");
        assert!(!camino::Utf8PathBuf::from(format!("{to}.part")).exists());
    }
}
