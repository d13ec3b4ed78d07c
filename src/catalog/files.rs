//! Catalog backed by document files (JSONL or msgpack).

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{resolve_uid, Catalog};
use crate::domain::{RootMap, Run};
use crate::query::Query;
use crate::serializer::{read_documents, Format};

/// All Runs found in a set of document files, held in memory
pub struct FileCatalog {
    name: String,
    root_map: RootMap,
    runs: Vec<Run>,
}

impl FileCatalog {
    /// Read every file matching `paths` (globs).
    ///
    /// Runs are ordered by RunStart time, then uid. A uid seen twice keeps
    /// its first occurrence.
    pub async fn open(
        name: impl Into<String>,
        format: Format,
        paths: &[String],
        root_map: RootMap,
    ) -> Result<Self> {
        let name = name.into();
        let mut files: Vec<PathBuf> = Vec::new();
        for pattern in paths {
            let matched = glob::glob(pattern)
                .with_context(|| format!("Invalid path pattern: {}", pattern))?;
            for entry in matched {
                match entry {
                    Ok(path) if path.is_file() => files.push(path),
                    Ok(_) => {}
                    Err(e) => warn!(catalog = %name, error = %e, "Skipping unreadable path"),
                }
            }
        }
        files.sort();
        files.dedup();

        let mut runs = Vec::new();
        for file in &files {
            let documents = read_documents(file, format).await?;
            let file_runs = Run::split(documents)
                .with_context(|| format!("Invalid document stream in {}", file.display()))?;
            debug!(path = %file.display(), runs = file_runs.len(), "Read document file");
            runs.extend(file_runs);
        }

        Ok(Self::from_runs(name, runs, root_map))
    }

    /// Catalog over Runs already in memory
    pub fn from_runs(name: impl Into<String>, runs: Vec<Run>, root_map: RootMap) -> Self {
        let name = name.into();
        let mut seen = HashSet::new();
        let mut runs: Vec<Run> = runs
            .into_iter()
            .filter(|run| {
                let first = seen.insert(run.uid().to_string());
                if !first {
                    warn!(catalog = %name, uid = run.uid(), "Duplicate Run ignored");
                }
                first
            })
            .collect();
        runs.sort_by(|a, b| {
            a.time()
                .total_cmp(&b.time())
                .then_with(|| a.uid().cmp(b.uid()))
        });

        Self {
            name,
            root_map,
            runs,
        }
    }

    #[cfg(test)]
    pub(crate) fn runs(&self) -> &[Run] {
        &self.runs
    }
}

#[async_trait]
impl Catalog for FileCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn root_map(&self) -> &RootMap {
        &self.root_map
    }

    async fn search(&self, query: &Query) -> Result<Vec<String>> {
        Ok(self
            .runs
            .iter()
            .filter(|run| query.matches(run.start()))
            .map(|run| run.uid().to_string())
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.runs.len())
    }

    async fn get(&self, uid: &str) -> Result<Run> {
        let uid = resolve_uid(uid, self.runs.iter().map(Run::uid))?;
        self.runs
            .iter()
            .find(|run| run.uid() == uid)
            .cloned()
            .with_context(|| format!("Run {} vanished from catalog {}", uid, self.name))
    }
}
