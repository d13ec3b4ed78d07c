//! Domain types for databroker-pack.
//!
//! This module contains the core data structures:
//! - Document: one `(name, body)` event-model record
//! - Run: the ordered documents of one acquisition session

pub mod document;
pub mod run;

use std::collections::BTreeMap;

// Re-export commonly used types
pub use document::{unpack_datum_page, unpack_event_page, Document, DocumentName};
pub use run::{DatumRef, Run, RunError};

/// Maps a `root` recorded in a Resource to where the data lives now
pub type RootMap = BTreeMap<String, String>;
