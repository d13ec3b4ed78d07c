//! Writing manager for pack directories.
//!
//! Every file a pack produces is opened through a [`FileManager`], which
//! never overwrites an existing file and remembers what it created, grouped
//! by a human-readable label (`all` for documents, `manifest`, ...).

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};

/// Errors raised while opening files in a pack directory
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("The postfix {0} must be structured like a relative file path.")]
    AbsolutePostfix(String),

    #[error("The postfix {0:?} has already been used.")]
    PostfixReused(String),

    #[error("Could not create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Creates files under one directory, exclusively
#[derive(Debug)]
pub struct FileManager {
    directory: PathBuf,
    reserved: HashSet<PathBuf>,
    artifacts: BTreeMap<String, Vec<PathBuf>>,
}

impl FileManager {
    /// Manage files under `directory` (made absolute, not yet created)
    pub fn new(directory: impl AsRef<Path>) -> std::io::Result<Self> {
        let directory = std::path::absolute(directory.as_ref())?;
        Ok(Self {
            directory,
            reserved: HashSet::new(),
            artifacts: BTreeMap::new(),
        })
    }

    /// Absolute root of the managed directory
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Files created so far, by label
    pub fn artifacts(&self) -> &BTreeMap<String, Vec<PathBuf>> {
        &self.artifacts
    }

    /// Create `directory/postfix` for writing. Fails if it already exists.
    pub async fn open(&mut self, label: &str, postfix: &str) -> Result<File, ManagerError> {
        let relative = Path::new(postfix);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(ManagerError::AbsolutePostfix(postfix.to_string()));
        }
        if !self.reserved.insert(relative.to_path_buf()) {
            return Err(ManagerError::PostfixReused(postfix.to_string()));
        }

        let path = self.directory.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| ManagerError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| ManagerError::Io {
                path: path.clone(),
                source,
            })?;

        self.artifacts
            .entry(label.to_string())
            .or_default()
            .push(path);

        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_open_creates_parents_and_records_artifact() {
        let temp = TempDir::new().unwrap();
        let mut manager = FileManager::new(temp.path()).unwrap();

        let mut file = manager.open("all", "documents/abc.jsonl").await.unwrap();
        file.write_all(b"x").await.unwrap();
        file.flush().await.unwrap();

        let expected = temp.path().join("documents").join("abc.jsonl");
        assert!(expected.exists());
        assert_eq!(manager.artifacts()["all"], vec![expected]);
    }

    #[tokio::test]
    async fn test_never_overwrites() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("catalog.yml"), "existing").unwrap();
        let mut manager = FileManager::new(temp.path()).unwrap();

        let err = manager.open("catalog_file", "catalog.yml").await.unwrap_err();
        assert!(matches!(err, ManagerError::Io { .. }));
        assert_eq!(
            std::fs::read_to_string(temp.path().join("catalog.yml")).unwrap(),
            "existing"
        );
    }

    #[tokio::test]
    async fn test_rejects_reuse_and_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let mut manager = FileManager::new(temp.path()).unwrap();

        manager.open("manifest", "a.txt").await.unwrap();
        assert!(matches!(
            manager.open("manifest", "a.txt").await,
            Err(ManagerError::PostfixReused(_))
        ));
        assert!(matches!(
            manager.open("manifest", "/etc/passwd").await,
            Err(ManagerError::AbsolutePostfix(_))
        ));
        assert!(matches!(
            manager.open("manifest", "../outside.txt").await,
            Err(ManagerError::AbsolutePostfix(_))
        ));
    }
}
