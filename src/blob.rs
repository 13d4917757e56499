//! Defines [`Blob`], our fundamental unit of backup.

use serde::{Deserialize, Serialize};

use crate::chunk::FileSpan;
use crate::hashing::ObjectId;

/// A chunk of a file or a tree to place in a pack.
///
/// Our fundamental unit of backup.
#[derive(Debug, Clone)]
pub struct Blob {
    /// The bytes to back up
    pub contents: Contents,
    /// The ID of said bytes (the SHA-256 of the plaintext)
    pub id: ObjectId,
    /// Is the blob a chunk or a tree?
    pub kind: Kind,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// A chunk of a file.
    Chunk,
    /// A serialized tree (directory listing).
    Tree,
}

/// Either part of a loaded file or an owned buffer.
///
/// Formerly this could be some `Box<dyn AsRef<[u8]> + Send + Sync>`, but
/// there's only two real cases, so let's cut down on the indirection.
#[derive(Debug, Clone)]
pub enum Contents {
    Buffer(Vec<u8>),
    Span(FileSpan),
}

impl Blob {
    /// Convenience method to get at the blob's contents as a byte slice
    pub fn bytes(&self) -> &[u8] {
        match &self.contents {
            Contents::Buffer(v) => v,
            Contents::Span(s) => s.as_ref(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}
