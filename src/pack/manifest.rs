//! Text manifests and the pack's catalog file.
//!
//! Manifests list one path per line and are split into numbered chunks
//! (`<stem>_0.txt`, `<stem>_1.txt`, ...) so no single file grows unbounded.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::catalog::{join_pattern, CatalogFile, GeneratedBy, SourceEntry, SourceMetadata, PACKED_SOURCE, PACK_CATALOG_FILE};
use crate::domain::RootMap;
use crate::serializer::{FileManager, Format};

const DOCUMENTS_MANIFEST_LABEL: &str = "documents_manifest";
const EXTERNAL_MANIFEST_LABEL: &str = "manifest";
const CATALOG_FILE_LABEL: &str = "catalog_file";

/// List document files relative to the pack `directory`.
pub async fn write_documents_manifest<'a>(
    manager: &mut FileManager,
    directory: &Path,
    artifacts: impl IntoIterator<Item = &'a PathBuf>,
    max_lines: usize,
) -> Result<Vec<PathBuf>> {
    let directory = std::path::absolute(directory)
        .with_context(|| format!("Invalid pack directory {}", directory.display()))?;
    let lines = artifacts
        .into_iter()
        .map(|artifact| {
            artifact
                .strip_prefix(&directory)
                .map(|p| p.to_string_lossy().into_owned())
                .with_context(|| {
                    format!("{} is not inside {}", artifact.display(), directory.display())
                })
        })
        .collect::<Result<Vec<_>>>()?;

    write_chunked(manager, DOCUMENTS_MANIFEST_LABEL, "documents_manifest", &lines, max_lines).await
}

/// List the files of one root, sorted and de-duplicated.
pub async fn write_external_files_manifest<'a>(
    manager: &mut FileManager,
    unique_id: &str,
    files: impl IntoIterator<Item = &'a PathBuf>,
    max_lines: usize,
) -> Result<Vec<PathBuf>> {
    let lines: Vec<String> = files
        .into_iter()
        .map(|f| f.to_string_lossy().into_owned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let stem = format!("external_files_manifest_{}", unique_id);
    write_chunked(manager, EXTERNAL_MANIFEST_LABEL, &stem, &lines, max_lines).await
}

/// Write `lines` into `<stem>_N.txt` files of at most `max_lines` lines each.
/// An empty list still produces `<stem>_0.txt`.
async fn write_chunked(
    manager: &mut FileManager,
    label: &str,
    stem: &str,
    lines: &[String],
    max_lines: usize,
) -> Result<Vec<PathBuf>> {
    let max_lines = max_lines.max(1);
    let chunks: Vec<&[String]> = if lines.is_empty() {
        vec![&lines[..0]]
    } else {
        lines.chunks(max_lines).collect()
    };

    let mut written = Vec::with_capacity(chunks.len());
    for (n, chunk) in chunks.into_iter().enumerate() {
        let postfix = format!("{}_{}.txt", stem, n);
        let mut file = manager.open(label, &postfix).await?;
        let mut content = String::new();
        for line in chunk {
            content.push_str(line);
            content.push('\n');
        }
        file.write_all(content.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", postfix))?;
        file.flush().await?;
        written.push(manager.directory().join(&postfix));
    }

    debug!(stem, files = written.len(), lines = lines.len(), "Wrote manifest");
    Ok(written)
}

/// Write `catalog.yml`: a single `packed_catalog` source reading `paths`
/// (relative to `directory`) with the given root_map.
pub async fn write_catalog_file(
    manager: &mut FileManager,
    directory: &Path,
    format: Format,
    paths: &[String],
    root_map: &RootMap,
) -> Result<PathBuf> {
    let directory = std::path::absolute(directory)
        .with_context(|| format!("Invalid pack directory {}", directory.display()))?;

    let mut source = SourceEntry::new(format.driver());
    source.args.paths = Some(paths.iter().map(|p| join_pattern(&directory, p)).collect());
    source.args.root_map = root_map.clone();
    source.metadata = Some(SourceMetadata {
        generated_by: Some(GeneratedBy::current()),
        relative_paths: Some(paths.to_vec()),
        ..Default::default()
    });

    let yaml = CatalogFile::single(PACKED_SOURCE, source).to_yaml()?;
    let mut file = manager.open(CATALOG_FILE_LABEL, PACK_CATALOG_FILE).await?;
    file.write_all(yaml.as_bytes())
        .await
        .context("Failed to write catalog file")?;
    file.flush().await?;

    Ok(manager.directory().join(PACK_CATALOG_FILE))
}
