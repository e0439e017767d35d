//! TOML configuration for the pager and trees.
//!
//! ```toml
//! [pager]
//! page_size = 4096
//! cache_pages = 1024
//! synchronous = "full"
//! autocheckpoint_frames = 1000
//! checksum_verify_on_read = true
//!
//! [btree]
//! max_path_length = 64
//! iterator_batch_size = 10
//! ```
//!
//! Every key is optional; missing keys keep their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::primitives::pager::{PagerOptions, Synchronous};
use crate::storage::btree::BTreeOptions;

/// Resolved options for one database directory.
#[derive(Clone, Debug, Default)]
pub struct RidbagConfig {
    /// Page cache and durability settings.
    pub pager: PagerOptions,
    /// Tree traversal settings.
    pub btree: BTreeOptions,
}

impl RidbagConfig {
    /// Reads `path`, or returns the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        raw.resolve()
    }

    /// Parses configuration text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        raw.resolve()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    pager: RawPager,
    #[serde(default)]
    btree: RawBTree,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPager {
    page_size: Option<u32>,
    cache_pages: Option<usize>,
    synchronous: Option<String>,
    autocheckpoint_frames: Option<u64>,
    checksum_verify_on_read: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBTree {
    max_path_length: Option<usize>,
    iterator_batch_size: Option<usize>,
}

impl RawConfig {
    fn resolve(self) -> Result<RidbagConfig, ConfigError> {
        let mut pager = PagerOptions::default();
        if let Some(page_size) = self.pager.page_size {
            pager.page_size = page_size;
        }
        if let Some(cache_pages) = self.pager.cache_pages {
            pager.cache_pages = cache_pages;
        }
        if let Some(value) = self.pager.synchronous {
            pager.synchronous = Synchronous::parse(&value)
                .ok_or(ConfigError::InvalidSynchronous { value })?;
        }
        if let Some(frames) = self.pager.autocheckpoint_frames {
            pager.autocheckpoint_frames = frames;
        }
        if let Some(verify) = self.pager.checksum_verify_on_read {
            pager.checksum_verify_on_read = verify;
        }
        pager
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;

        let mut btree = BTreeOptions::default();
        if let Some(depth) = self.btree.max_path_length {
            btree.max_path_length = depth;
        }
        if let Some(batch) = self.btree.iterator_batch_size {
            btree.iterator_batch_size = batch;
        }
        btree
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(RidbagConfig { pager, btree })
    }
}

/// Failures while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// `synchronous` is not one of `full`, `normal`, `off`.
    #[error("synchronous value '{value}' is invalid")]
    InvalidSynchronous {
        /// Value found in the file.
        value: String,
    },
    /// A value is outside its accepted range.
    #[error("invalid config: {0}")]
    Invalid(String),
}
