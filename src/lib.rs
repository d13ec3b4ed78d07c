//! databroker-pack - portable bundles of Bluesky Runs
//!
//! Exports selected Runs from a catalog into a self-describing directory
//! (serialized Documents, manifests of external files, and a `catalog.yml`),
//! and registers such directories as named catalogs again.
//!
//! # Modules
//!
//! - `domain`: Documents and Runs
//! - `query`: MongoDB-style queries over RunStart documents
//! - `catalog`: catalog files, the search path, file- and Mongo-backed catalogs
//! - `serializer`: msgpack/jsonl Document files and the Mongo writer
//! - `handlers`: locating and loading external data by Resource spec
//! - `pack`: export, manifests, external file copies
//! - `unpack`: registering a pack in place or in MongoDB
//! - `config`, `cli`: configuration and the two command-line tools
//!
//! # Usage
//!
//! ```bash
//! # Pack every Run, copying external files along
//! databroker-pack my_catalog ./pack --all --copy-external
//!
//! # Make it available as a catalog named "shipped"
//! databroker-unpack inplace ./pack shipped
//! ```

pub mod catalog;
pub mod cli;
pub mod config;
pub mod domain;
pub mod handlers;
pub mod pack;
pub mod query;
pub mod serializer;
pub mod unpack;

// Re-export main types at crate root for convenience
pub use catalog::{Catalog, CatalogRegistry};
pub use domain::{Document, DocumentName, Run, RootMap};
pub use pack::{write_pack, PackOptions, PackReport, Selection};
pub use query::Query;
pub use serializer::Format;
pub use unpack::{unpack_inplace, unpack_mongo_normalized};
