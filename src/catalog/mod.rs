//! Catalogs: named, searchable collections of Runs.
//!
//! # Drivers
//!
//! | Driver                             | Backend                           |
//! |------------------------------------|-----------------------------------|
//! | `bluesky-msgpack-catalog`          | msgpack document files ([`FileCatalog`]) |
//! | `bluesky-jsonl-catalog`            | JSONL document files ([`FileCatalog`])   |
//! | `bluesky-mongo-normalized-catalog` | MongoDB collections ([`MongoCatalog`])   |
//!
//! Catalogs are found by name through the [`CatalogRegistry`], which scans
//! the catalog search path for YAML catalog files.

pub mod files;
pub mod mongo;
pub mod registry;
pub mod source;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{RootMap, Run};
use crate::query::Query;

pub use files::FileCatalog;
pub use mongo::{MongoCatalog, MONGO_NORMALIZED_DRIVER};
pub use registry::{open_source, CatalogRegistry, RegisteredSource};
pub use source::{join_pattern, CatalogFile, GeneratedBy, SourceArgs, SourceEntry, SourceMetadata, PACKED_SOURCE, PACK_CATALOG_FILE};

/// Errors that callers branch on
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("No Run found with uid (or uid prefix) {0:?}")]
    RunNotFound(String),

    #[error("uid prefix {prefix:?} is ambiguous: it matches {count} Runs")]
    AmbiguousUid { prefix: String, count: usize },

    #[error("No catalog named {0:?} on the catalog search path")]
    UnknownCatalog(String),

    #[error("Catalog driver {0:?} is not supported")]
    UnsupportedDriver(String),

    #[error("Catalog source {source_name:?} is missing argument {arg:?}")]
    MissingArg { source_name: String, arg: &'static str },
}

/// A searchable collection of Runs
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Catalog name
    fn name(&self) -> &str;

    /// Where recorded Resource roots are found on this machine
    fn root_map(&self) -> &RootMap;

    /// uids of Runs whose RunStart matches `query`, in catalog order
    async fn search(&self, query: &Query) -> Result<Vec<String>>;

    /// Number of Runs in the catalog
    async fn count(&self) -> Result<usize>;

    /// A Run by full uid or unique uid prefix
    async fn get(&self, uid: &str) -> Result<Run>;
}

/// Pick a single uid among `candidates` for the lookup key `key`:
/// an exact match wins, otherwise the prefix must be unique.
pub(crate) fn resolve_uid<'a>(
    key: &str,
    candidates: impl IntoIterator<Item = &'a str>,
) -> Result<&'a str, CatalogError> {
    let matches: Vec<&str> = candidates
        .into_iter()
        .filter(|uid| uid.starts_with(key))
        .collect();

    if let Some(exact) = matches.iter().find(|uid| **uid == key) {
        return Ok(*exact);
    }
    match matches.as_slice() {
        [] => Err(CatalogError::RunNotFound(key.to_string())),
        [only] => Ok(*only),
        many => Err(CatalogError::AmbiguousUid {
            prefix: key.to_string(),
            count: many.len(),
        }),
    }
}
