//! Export Runs from a Catalog into a pack directory.
//!
//! This module contains:
//! - export: per-Run and batch export of Documents, collecting external files
//! - external: copying external files into the pack
//! - manifest: manifests and the pack's `catalog.yml`
//! - directory: the whole pack workflow, as run by `databroker-pack`
//!
//! Pack directory layout:
//!
//! ```text
//! DIRECTORY/
//!   catalog.yml
//!   documents/<uid>.msgpack | <uid>.jsonl
//!   documents_manifest_N.txt
//!   external_files_manifest_<HASH>_N.txt
//!   external_files/<HASH>/...           (only when copying external files)
//! ```

pub mod directory;
pub mod export;
pub mod external;
pub mod manifest;

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub use directory::{write_pack, PackOptions, PackReport, Selection};
pub use export::{export_catalog, export_run, export_uids, ExportOptions, ExportSummary, ExternalMode, RunExport};
pub use external::{copy_external_files, CopyOutcome};
pub use manifest::{write_catalog_file, write_documents_manifest, write_external_files_manifest};

/// Errors that callers branch on
#[derive(Debug, Error)]
pub enum PackError {
    #[error("limit must be None or a number 1 or greater")]
    InvalidLimit,

    #[error("Query {0} yielded no results. Exiting.")]
    NoResults(String),

    #[error("Found empty input for --uids. Exiting")]
    EmptyUids,

    #[error("Could not create directory at {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory at {0} is not writable.")]
    NotWritable(PathBuf),

    #[error("The file {0} exists. Specify an empty directory, or a nonexistent one.")]
    CatalogFileExists(PathBuf),

    #[error("{file} is not inside root {root}")]
    OutsideRoot { file: PathBuf, root: PathBuf },
}

/// Identifies one external-data root of an export batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternalKey {
    /// `root` as it will appear in the packed Resource documents
    pub root_in_document: String,
    /// Where the data is found now (after the source catalog's root_map)
    pub root: String,
    /// Hash of the recorded root, unique to this batch
    pub unique_id: String,
}

/// Deterministic, batch-unique name for a root: hex of the first 16 bytes
/// of SHA-256(root ‖ salt).
pub fn root_hash(salt: &[u8], root: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root.as_bytes());
    hasher.update(salt);
    hex::encode(&hasher.finalize()[..16])
}

/// 64 random hex characters
pub fn generate_salt() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// `root_hash` with the salt of one export batch
#[derive(Debug, Clone)]
pub struct RootHasher {
    salt: Vec<u8>,
}

impl RootHasher {
    pub fn new(salt: impl Into<Vec<u8>>) -> Self {
        Self { salt: salt.into() }
    }

    /// Hasher with a given salt, or a fresh random one
    pub fn from_option(salt: Option<&str>) -> Self {
        match salt {
            Some(salt) => Self::new(salt.as_bytes()),
            None => Self::new(generate_salt()),
        }
    }

    pub fn hash(&self, root: &str) -> String {
        root_hash(&self.salt, root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_hash_is_deterministic_per_salt() {
        let a = root_hash(b"salt", "/data");
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, root_hash(b"salt", "/data"));
        assert_ne!(a, root_hash(b"pepper", "/data"));
        assert_ne!(a, root_hash(b"salt", "/other"));
    }

    #[test]
    fn test_generate_salt() {
        let salt = generate_salt();
        assert_eq!(salt.len(), 64);
        assert!(salt.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(salt, generate_salt());
    }

    #[test]
    fn test_root_hasher() {
        let fixed = RootHasher::from_option(Some("abc"));
        assert_eq!(fixed.hash("/r"), root_hash(b"abc", "/r"));
        let random = RootHasher::from_option(None);
        assert_ne!(random.hash("/r"), fixed.hash("/r"));
    }
}
