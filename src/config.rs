//! The repository's one immutable `Config` object (§3.2, §4.8), plus the
//! user's own `~/.config/cryptopak.toml` preferences (ambient, outside the
//! repository entirely).

use std::{fs, io};

use anyhow::{Context, anyhow};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::chunk;
use crate::error::{Error, Result};
use crate::hashing::ObjectId;

/// Supported `Config.version` range. Bump `CURRENT_VERSION` when the wire
/// format changes in a way old readers can't tolerate.
pub const CURRENT_VERSION: u32 = 1;
pub const MIN_SUPPORTED_VERSION: u32 = 1;
pub const MAX_SUPPORTED_VERSION: u32 = 1;

/// Default size a pack writer aims for before sealing (§4.5).
pub const DEFAULT_PACK_TARGET_SIZE: u64 = 1024 * 1024 * 8; // 8 MiB

/// The repository's one immutable object, written at `init` and never
/// touched again (§3.7, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    pub repository_id: ObjectId,
    /// Opaque per §1's scope note: the core just hands this to whatever
    /// content-defined chunker it's linked against.
    pub chunker_polynomial: u64,
    pub chunk_min_size: u32,
    pub chunk_target_size: u32,
    pub chunk_max_size: u32,
    pub pack_target_size: u64,
}

impl Config {
    pub fn fresh() -> Self {
        Self {
            version: CURRENT_VERSION,
            repository_id: ObjectId::random(),
            chunker_polynomial: random_polynomial(),
            chunk_min_size: chunk::DEFAULT_MIN_SIZE,
            chunk_target_size: chunk::DEFAULT_TARGET_SIZE,
            chunk_max_size: chunk::DEFAULT_MAX_SIZE,
            pack_target_size: DEFAULT_PACK_TARGET_SIZE,
        }
    }

    pub fn validate_version(&self) -> Result<()> {
        if self.version < MIN_SUPPORTED_VERSION || self.version > MAX_SUPPORTED_VERSION {
            return Err(Error::VersionMismatch {
                found: self.version,
                min: MIN_SUPPORTED_VERSION,
                max: MAX_SUPPORTED_VERSION,
            });
        }
        Ok(())
    }

    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let config: Config = serde_json::from_slice(bytes)?;
        config.validate_version()?;
        Ok(config)
    }
}

/// A 64-bit FastCDC polynomial seed. Not cryptographically meaningful --
/// just needs to differ across repositories so their chunk boundaries
/// don't all land at identical offsets for identical content.
fn random_polynomial() -> u64 {
    use rand::RngCore;
    rand::thread_rng().next_u64()
}

/// The user's local preferences, read from `~/.config/cryptopak.toml`.
/// Entirely separate from any one repository's `Config`.
#[derive(Debug, Deserialize)]
pub struct Preferences {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default)]
    pub default_repository: Option<String>,
}

fn default_parallelism() -> usize {
    num_cpus::get()
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            default_repository: None,
        }
    }
}

/// Loads `~/.config/cryptopak.toml`, or the defaults if it doesn't exist.
pub fn load_preferences() -> anyhow::Result<Preferences> {
    let mut path: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    path.extend([".config", "cryptopak.toml"]);

    let s = match fs::read_to_string(&path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Preferences::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {path}"))?;

    toml::from_str(&s).with_context(|| format!("Couldn't parse {path}"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_config_validates() {
        let config = Config::fresh();
        assert!(config.validate_version().is_ok());
    }

    #[test]
    fn future_version_is_rejected() {
        let mut config = Config::fresh();
        config.version = MAX_SUPPORTED_VERSION + 1;
        assert!(matches!(
            config.validate_version().unwrap_err(),
            Error::VersionMismatch { .. }
        ));
    }

    #[test]
    fn serialization_round_trips() {
        let config = Config::fresh();
        let json = config.to_canonical_json().unwrap();
        let restored = Config::from_slice(&json).unwrap();
        assert_eq!(restored.repository_id, config.repository_id);
        assert_eq!(restored.chunker_polynomial, config.chunker_polynomial);
    }
}
