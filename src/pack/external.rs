//! Copy external files into the pack directory.
//!
//! A filesystem copy is not always applicable. The external files manifests
//! can feed other transfer tools (rsync, globus) instead.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{error, info};

use super::PackError;

/// Result of copying the files of one root
#[derive(Debug, Default)]
pub struct CopyOutcome {
    /// `target_directory/unique_id`
    pub new_root: PathBuf,
    /// Files created
    pub new_files: Vec<PathBuf>,
    /// Source files that could not be copied
    pub failures: Vec<PathBuf>,
}

/// Copy `files` (all under `root`) to `target_directory/unique_id/`,
/// keeping their paths relative to `root`.
///
/// Each failure is logged; with `strict` the first one is returned as an
/// error, otherwise the file is recorded in `failures`.
pub async fn copy_external_files<'a>(
    target_directory: &Path,
    root: &str,
    unique_id: &str,
    files: impl IntoIterator<Item = &'a PathBuf>,
    strict: bool,
) -> Result<CopyOutcome> {
    let new_root = target_directory.join(unique_id);
    let mut outcome = CopyOutcome {
        new_root: new_root.clone(),
        ..Default::default()
    };

    for file in files {
        match copy_one(file, Path::new(root), &new_root).await {
            Ok(dest) => outcome.new_files.push(dest),
            Err(e) => {
                error!(file = %file.display(), error = %format!("{:#}", e), "Error while copying external file");
                if strict {
                    return Err(e);
                }
                outcome.failures.push(file.clone());
            }
        }
    }

    info!(
        root,
        copied = outcome.new_files.len(),
        failures = outcome.failures.len(),
        "Copied external files"
    );
    Ok(outcome)
}

async fn copy_one(file: &Path, root: &Path, new_root: &Path) -> Result<PathBuf> {
    let relative = file.strip_prefix(root).map_err(|_| PackError::OutsideRoot {
        file: file.to_path_buf(),
        root: root.to_path_buf(),
    })?;
    let dest = new_root.join(relative);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::copy(file, &dest)
        .await
        .with_context(|| format!("Failed to copy {} to {}", file.display(), dest.display()))?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_copy_preserves_relative_layout() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.npy"), b"a").unwrap();
        std::fs::write(root.join("sub/b.npy"), b"b").unwrap();
        let files = vec![root.join("a.npy"), root.join("sub/b.npy")];
        let target = temp.path().join("pack/external_files");

        let outcome = copy_external_files(&target, root.to_str().unwrap(), "hash", &files, true)
            .await
            .unwrap();

        assert_eq!(outcome.new_root, target.join("hash"));
        assert_eq!(
            outcome.new_files,
            vec![target.join("hash/a.npy"), target.join("hash/sub/b.npy")]
        );
        assert_eq!(std::fs::read(target.join("hash/sub/b.npy")).unwrap(), b"b");
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn test_missing_and_outside_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("ok.npy"), b"ok").unwrap();
        let files = vec![
            root.join("ok.npy"),
            root.join("missing.npy"),
            PathBuf::from("/elsewhere/x.npy"),
        ];
        let target = temp.path().join("out");

        let outcome = copy_external_files(&target, root.to_str().unwrap(), "h", &files, false)
            .await
            .unwrap();
        assert_eq!(outcome.new_files.len(), 1);
        assert_eq!(outcome.failures, files[1..].to_vec());

        let err = copy_external_files(&temp.path().join("out2"), root.to_str().unwrap(), "h", &files[1..], true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to copy"));
    }
}
