//! The complete pack workflow: export, manifests, external files, catalog.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs;
use tracing::{info, warn};

use super::export::{export_catalog, export_uids, ExportOptions, ExportSummary, ExternalMode};
use super::external::copy_external_files;
use super::manifest::{write_catalog_file, write_documents_manifest, write_external_files_manifest};
use super::PackError;
use crate::catalog::{Catalog, PACK_CATALOG_FILE};
use crate::config::DEFAULT_MANIFEST_MAX_LINES;
use crate::domain::RootMap;
use crate::query::Query;
use crate::serializer::FileManager;

/// Directory (under the pack root) receiving copied external files
pub const EXTERNAL_FILES_DIR: &str = "external_files";

/// Which Runs to pack
#[derive(Debug, Clone)]
pub enum Selection {
    Query(Query),
    /// uids or unique uid prefixes
    Uids(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct PackOptions {
    pub export: ExportOptions,
    /// Copy external files into `external_files/` (with `ExternalMode::Paths`)
    pub copy_external: bool,
    pub manifest_max_lines: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            export: ExportOptions::default(),
            copy_external: false,
            manifest_max_lines: DEFAULT_MANIFEST_MAX_LINES,
        }
    }
}

#[derive(Debug)]
pub struct PackReport {
    pub summary: ExportSummary,
    /// External files that could not be copied
    pub copy_failures: Vec<PathBuf>,
    /// root_map written to the pack's catalog file
    pub root_map: RootMap,
    pub catalog_file: PathBuf,
    /// Documents and external files manifests
    pub manifests: Vec<PathBuf>,
}

impl PackReport {
    pub fn is_success(&self) -> bool {
        self.summary.failures.is_empty() && self.copy_failures.is_empty()
    }
}

/// Create `directory` if needed and check that a pack can be written there.
pub async fn prepare_directory(directory: &Path) -> Result<(), PackError> {
    fs::create_dir_all(directory)
        .await
        .map_err(|source| PackError::CreateDirectory {
            path: directory.to_path_buf(),
            source,
        })?;

    // Permission bits do not account for ownership or ACLs; create a file.
    let dir = directory.to_path_buf();
    let writable = tokio::task::spawn_blocking(move || tempfile::tempfile_in(&dir).is_ok())
        .await
        .unwrap_or(false);
    if !writable {
        return Err(PackError::NotWritable(directory.to_path_buf()));
    }

    // The catalog file is written last and never overwritten; fail early.
    let catalog_file = directory.join(PACK_CATALOG_FILE);
    if catalog_file.is_file() {
        return Err(PackError::CatalogFileExists(catalog_file));
    }
    Ok(())
}

/// Pack the selected Runs of `catalog` into `directory`.
pub async fn write_pack(
    catalog: &dyn Catalog,
    selection: &Selection,
    directory: &Path,
    options: &PackOptions,
) -> Result<PackReport> {
    prepare_directory(directory).await?;
    let mut manager = FileManager::new(directory)?;
    let export = &options.export;

    let summary = match selection {
        Selection::Query(query) => {
            let summary = export_catalog(catalog, query, &mut manager, export).await?;
            if summary.runs == 0 {
                return Err(PackError::NoResults(query.to_string()).into());
            }
            summary
        }
        Selection::Uids(uids) => {
            if uids.is_empty() {
                return Err(PackError::EmptyUids.into());
            }
            let uids = match export.limit {
                Some(0) => return Err(PackError::InvalidLimit.into()),
                Some(limit) => &uids[..limit.min(uids.len())],
                None => &uids[..],
            };
            export_uids(catalog, uids, &mut manager, export).await?
        }
    };

    let mut manifests = Vec::new();
    let documents: Vec<&PathBuf> = summary.documents().collect();
    if !export.no_documents && !documents.is_empty() {
        manifests.extend(
            write_documents_manifest(&mut manager, directory, documents, options.manifest_max_lines).await?,
        );
    }

    // Only in Paths mode do the packed Documents still reference external
    // files, so only then does the catalog need a root_map.
    let mut root_map = RootMap::new();
    let mut copy_failures = Vec::new();
    if export.external == ExternalMode::Paths {
        let pack_root = manager.directory().to_path_buf();
        for (key, files) in &summary.files {
            let root_key = if export.no_documents {
                key.root_in_document.clone()
            } else {
                key.unique_id.clone()
            };

            if options.copy_external {
                let outcome = copy_external_files(
                    &pack_root.join(EXTERNAL_FILES_DIR),
                    &key.root,
                    &key.unique_id,
                    files,
                    export.strict,
                )
                .await?;
                copy_failures.extend(outcome.failures);

                let relative_root = outcome.new_root.strip_prefix(&pack_root).unwrap_or(&outcome.new_root);
                root_map.insert(root_key, relative_root.to_string_lossy().into_owned());

                let relative_files: Vec<PathBuf> = outcome
                    .new_files
                    .iter()
                    .map(|f| f.strip_prefix(&pack_root).unwrap_or(f).to_path_buf())
                    .collect();
                manifests.extend(
                    write_external_files_manifest(
                        &mut manager,
                        &key.unique_id,
                        &relative_files,
                        options.manifest_max_lines,
                    )
                    .await?,
                );
            } else {
                root_map.insert(root_key, key.root.clone());
                manifests.extend(
                    write_external_files_manifest(&mut manager, &key.unique_id, files, options.manifest_max_lines)
                        .await?,
                );
            }
        }
    }

    let paths = [export.format.documents_glob()];
    let catalog_file = write_catalog_file(&mut manager, directory, export.format, &paths, &root_map).await?;

    if !summary.failures.is_empty() {
        warn!(count = summary.failures.len(), "Runs failed to pack");
    }
    if !copy_failures.is_empty() {
        warn!(count = copy_failures.len(), "External files failed to copy");
    }
    info!(
        directory = %manager.directory().display(),
        runs = summary.runs,
        roots = summary.files.len(),
        "Pack complete"
    );

    Ok(PackReport {
        summary,
        copy_failures,
        root_map,
        catalog_file,
        manifests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_prepare_directory_creates_and_checks() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("new/pack");
        prepare_directory(&target).await.unwrap();
        assert!(target.is_dir());

        std::fs::File::create(target.join(PACK_CATALOG_FILE))
            .unwrap()
            .write_all(b"sources: {}\n")
            .unwrap();
        assert!(matches!(
            prepare_directory(&target).await,
            Err(PackError::CatalogFileExists(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prepare_directory_read_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let target = temp.path().join("locked");
        std::fs::create_dir(&target).unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o555)).unwrap();

        // Privileged users write through the mode bits.
        let bypassed = std::fs::write(target.join("check"), b"x").is_ok();
        let result = prepare_directory(&target).await;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).unwrap();

        if bypassed {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(PackError::NotWritable(_))));
        }
    }

    #[tokio::test]
    async fn test_prepare_directory_under_a_file_fails() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            prepare_directory(&file.join("pack")).await,
            Err(PackError::CreateDirectory { .. })
        ));
    }
}
