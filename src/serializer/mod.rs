//! Document serialization.
//!
//! A pack stores each Run in its own file under `documents/`, either as
//! newline-delimited JSON or as a stream of msgpack arrays. Both layouts hold
//! the same `[name, document]` pairs, so either can be read back losslessly.

pub mod manager;
pub mod mongo;

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::domain::{Document, DocumentName};

pub use manager::{FileManager, ManagerError};
pub use mongo::MongoNormalizedSerializer;

/// Artifact label under which document files are recorded
pub const DOCUMENTS_LABEL: &str = "all";

/// Catalog driver for msgpack-backed packs
pub const MSGPACK_DRIVER: &str = "bluesky-msgpack-catalog";

/// Catalog driver for JSONL-backed packs
pub const JSONL_DRIVER: &str = "bluesky-jsonl-catalog";

/// On-disk document format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Binary, compact and fast (default)
    #[default]
    Msgpack,

    /// Plain text, one JSON array per line
    Jsonl,
}

impl Format {
    /// File extension, without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Msgpack => "msgpack",
            Format::Jsonl => "jsonl",
        }
    }

    /// Catalog driver able to read this format
    pub fn driver(&self) -> &'static str {
        match self {
            Format::Msgpack => MSGPACK_DRIVER,
            Format::Jsonl => JSONL_DRIVER,
        }
    }

    pub fn from_driver(driver: &str) -> Option<Self> {
        match driver {
            MSGPACK_DRIVER => Some(Format::Msgpack),
            JSONL_DRIVER => Some(Format::Jsonl),
            _ => None,
        }
    }

    /// Glob, relative to the pack root, matching every document file
    pub fn documents_glob(&self) -> String {
        format!("./documents/*.{}", self.extension())
    }

    /// Encode one document in this format
    pub fn encode(&self, doc: &Document) -> Result<Vec<u8>> {
        match self {
            Format::Jsonl => {
                let mut line = serde_json::to_vec(doc).context("Failed to serialize document")?;
                line.push(b'\n');
                Ok(line)
            }
            Format::Msgpack => rmp_serde::to_vec(doc).context("Failed to serialize document"),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Format {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "msgpack" => Ok(Format::Msgpack),
            "jsonl" => Ok(Format::Jsonl),
            _ => anyhow::bail!("Unknown format: {} (expected msgpack or jsonl)", s),
        }
    }
}

/// Writes the documents of one Run to `documents/<start uid>.<ext>`.
///
/// The file is created when the RunStart arrives, so a Run whose documents
/// are all skipped leaves nothing behind.
pub struct Serializer<'m> {
    manager: &'m mut FileManager,
    format: Format,
    file: Option<(File, PathBuf)>,
}

impl<'m> Serializer<'m> {
    pub fn new(manager: &'m mut FileManager, format: Format) -> Self {
        Self {
            manager,
            format,
            file: None,
        }
    }

    /// Append one document.
    pub async fn write(&mut self, doc: &Document) -> Result<()> {
        if self.file.is_none() {
            if doc.name != DocumentName::Start {
                anyhow::bail!("Expected a 'start' document first, got '{}'", doc.name);
            }
            let uid = doc.uid().context("RunStart document has no 'uid'")?;
            let postfix = format!("documents/{}.{}", uid, self.format.extension());
            let file = self.manager.open(DOCUMENTS_LABEL, &postfix).await?;
            self.file = Some((file, self.manager.directory().join(&postfix)));
        }

        let bytes = self.format.encode(doc)?;
        if let Some((file, path)) = self.file.as_mut() {
            file.write_all(&bytes)
                .await
                .with_context(|| format!("Failed to write document to {}", path.display()))?;
        }
        Ok(())
    }

    /// Flush and close, returning the path written (if any).
    pub async fn close(self) -> Result<Option<PathBuf>> {
        match self.file {
            Some((mut file, path)) => {
                file.flush()
                    .await
                    .with_context(|| format!("Failed to flush {}", path.display()))?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }
}

/// Read every document from a file written by [`Serializer`].
pub async fn read_documents(path: &Path, format: Format) -> Result<Vec<Document>> {
    match format {
        Format::Jsonl => {
            let content = fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| {
                    serde_json::from_str(line)
                        .with_context(|| format!("Failed to parse document in {}", path.display()))
                })
                .collect()
        }
        Format::Msgpack => {
            let bytes = fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let total = bytes.len() as u64;
            let mut cursor = Cursor::new(bytes);
            let mut documents = Vec::new();
            while cursor.position() < total {
                let doc: Document = rmp_serde::from_read(&mut cursor)
                    .with_context(|| format!("Failed to decode document in {}", path.display()))?;
                documents.push(doc);
            }
            Ok(documents)
        }
    }
}
