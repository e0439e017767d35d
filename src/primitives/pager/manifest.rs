//! `files.json`: the list of data files owned by a database directory.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::types::{FileId, Result, RidbagError};

pub(crate) const MANIFEST_FILE: &str = "files.json";
pub(crate) const WAL_FILE: &str = "ridbag.wal";
const MANIFEST_FORMAT_VERSION: u16 = 1;
const DATA_FILE_EXT: &str = "rbt";

/// Persistent directory metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest format version.
    pub format_version: u16,
    /// Page size shared by every file in the directory.
    pub page_size: u32,
    /// Salt tying the WAL to this directory.
    pub wal_salt: u64,
    /// Next file id to hand out; ids are never reused.
    pub next_file_id: u32,
    /// Registered data files.
    pub files: Vec<ManifestFile>,
}

/// One registered data file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// File id used in page keys and WAL frames.
    pub id: u32,
    /// Logical name, also the stem of the on-disk file.
    pub name: String,
}

impl Manifest {
    /// Finds the id registered for `name`.
    pub fn lookup(&self, name: &str) -> Option<FileId> {
        self.files
            .iter()
            .find(|file| file.name == name)
            .map(|file| FileId(file.id))
    }

    /// Finds the name registered for `id`.
    pub fn name_of(&self, id: FileId) -> Option<&str> {
        self.files
            .iter()
            .find(|file| file.id == id.0)
            .map(|file| file.name.as_str())
    }
}

pub(crate) fn create_manifest(page_size: u32) -> Manifest {
    Manifest {
        format_version: MANIFEST_FORMAT_VERSION,
        page_size,
        wal_salt: OsRng.next_u64(),
        next_file_id: 1,
        files: Vec::new(),
    }
}

pub(crate) fn load_manifest(dir: &Path) -> Result<Manifest> {
    let bytes = fs::read(dir.join(MANIFEST_FILE))?;
    let manifest: Manifest = serde_json::from_slice(&bytes)
        .map_err(|_| RidbagError::Corruption("manifest is not valid json"))?;
    if manifest.format_version != MANIFEST_FORMAT_VERSION {
        return Err(RidbagError::Corruption("unsupported manifest version"));
    }
    Ok(manifest)
}

/// Replaces the manifest atomically via write-to-temp and rename.
pub(crate) fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|err| RidbagError::InvalidOwned(format!("manifest encode: {err}")))?;
    let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
    Ok(())
}

pub(crate) fn manifest_exists(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).exists()
}

/// Rejects names that could escape the directory or collide with pager files.
pub(crate) fn validate_file_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RidbagError::InvalidOwned(format!(
            "invalid file name {name:?}: use [A-Za-z0-9_-]"
        )))
    }
}

pub(crate) fn data_file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{DATA_FILE_EXT}"))
}
