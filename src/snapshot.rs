//! Immutable root-of-world records naming a tree id and provenance (§3.5).

use camino::Utf8PathBuf;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hashing::ObjectId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<ObjectId>,
    pub tree: ObjectId,
    pub paths: Vec<Utf8PathBuf>,
    pub hostname: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
}

impl Snapshot {
    /// The canonical JSON bytes whose SHA-256 is this snapshot's id (§3.1).
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn id(&self) -> Result<ObjectId> {
        Ok(ObjectId::hash(&self.to_canonical_json()?))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Picks up the ambient host/user identity the archiver stamps onto a fresh
/// snapshot, absent a caller override.
pub fn local_identity() -> (String, String, u32, u32) {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    #[cfg(unix)]
    let (username, uid, gid) = {
        let uid = rustix::process::getuid();
        let gid = rustix::process::getgid();
        let username = std::env::var("USER").unwrap_or_else(|_| uid.as_raw().to_string());
        (username, uid.as_raw(), gid.as_raw())
    };
    #[cfg(not(unix))]
    let (username, uid, gid) = (
        std::env::var("USERNAME").unwrap_or_else(|_| "unknown".to_string()),
        0,
        0,
    );

    (hostname, username, uid, gid)
}
