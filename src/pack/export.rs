//! Serialize Runs and collect the external files they reference.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use super::{ExternalKey, PackError, RootHasher};
use crate::catalog::Catalog;
use crate::domain::{Document, DocumentName, RootMap, Run};
use crate::handlers::{Filler, HandlerRegistry};
use crate::query::Query;
use crate::serializer::{FileManager, Format, Serializer, DOCUMENTS_LABEL};

/// What to do about data stored outside the Documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExternalMode {
    /// Record the external files so they can be listed or copied
    #[default]
    Paths,
    /// Load the data into the Events; drop Resources and Datums
    Fill,
    /// Leave external files alone
    Ignore,
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Abort on the first failing Run instead of recording it
    pub strict: bool,
    pub external: ExternalMode,
    /// Only locate external files, write no Documents
    pub no_documents: bool,
    pub handlers: HandlerRegistry,
    pub format: Format,
    /// Salt for root hashes; random when absent
    pub salt: Option<String>,
    /// Stop after this many Runs (must be at least 1)
    pub limit: Option<usize>,
}

/// Output of one Run
#[derive(Debug, Default)]
pub struct RunExport {
    pub artifacts: BTreeMap<String, Vec<PathBuf>>,
    pub files: BTreeMap<ExternalKey, BTreeSet<PathBuf>>,
}

/// Output of a batch
#[derive(Debug, Default)]
pub struct ExportSummary {
    /// Files written, by label
    pub artifacts: BTreeMap<String, BTreeSet<PathBuf>>,
    /// External files, by root
    pub files: BTreeMap<ExternalKey, BTreeSet<PathBuf>>,
    /// uids of Runs that failed
    pub failures: Vec<String>,
    /// Runs attempted
    pub runs: usize,
}

impl ExportSummary {
    fn merge(&mut self, export: RunExport) {
        for (label, paths) in export.artifacts {
            self.artifacts.entry(label).or_default().extend(paths);
        }
        for (key, files) in export.files {
            self.files.entry(key).or_default().extend(files);
        }
    }

    /// Document files written
    pub fn documents(&self) -> impl Iterator<Item = &PathBuf> {
        self.artifacts.get(DOCUMENTS_LABEL).into_iter().flatten()
    }
}

/// Export one Run through `manager`.
///
/// Resource documents get their `root` replaced by the root's unique id so
/// that roots from different batches never collide in a root_map.
#[instrument(skip_all, fields(uid = run.uid()))]
pub async fn export_run(
    run: &Run,
    manager: &mut FileManager,
    hasher: &RootHasher,
    root_map: &RootMap,
    options: &ExportOptions,
) -> Result<RunExport> {
    let mut files: BTreeMap<ExternalKey, BTreeSet<PathBuf>> = BTreeMap::new();
    let mut filler = Filler::new(&options.handlers, root_map);
    let mut serializer = Serializer::new(manager, options.format);

    for doc in run.documents() {
        let out = if options.external == ExternalMode::Fill {
            let filled = filler.process(doc)?;
            if doc.name.is_external_related() {
                continue;
            }
            filled
        } else if doc.name == DocumentName::Resource {
            resource(run, doc, &mut files, hasher, root_map, options)?
        } else {
            doc.clone()
        };

        if !options.no_documents {
            serializer.write(&out).await?;
        }
    }

    let mut artifacts = BTreeMap::new();
    if let Some(path) = serializer.close().await? {
        artifacts.insert(DOCUMENTS_LABEL.to_string(), vec![path]);
    }
    debug!(files = files.values().map(BTreeSet::len).sum::<usize>(), "Exported Run");

    Ok(RunExport { artifacts, files })
}

/// Record a Resource's files and return the copy to serialize.
fn resource(
    run: &Run,
    doc: &Document,
    files: &mut BTreeMap<ExternalKey, BTreeSet<PathBuf>>,
    hasher: &RootHasher,
    root_map: &RootMap,
    options: &ExportOptions,
) -> Result<Document> {
    let recorded = doc.get_str("root").unwrap_or_default();
    let root = root_map.get(recorded).map(String::as_str).unwrap_or(recorded);
    let unique_id = hasher.hash(recorded);

    if options.external == ExternalMode::Paths {
        let resource_uid = doc.uid().context("Resource document has no 'uid'")?;
        let datum_kwargs = run.datum_kwargs_for(resource_uid)?;
        let file_list = options
            .handlers
            .file_list_for(&doc.body, &datum_kwargs, root_map)
            .with_context(|| format!("Failed to list files of Resource {}", resource_uid))?;

        let key = ExternalKey {
            root_in_document: if options.no_documents { recorded } else { root }.to_string(),
            root: root.to_string(),
            unique_id: unique_id.clone(),
        };
        files.entry(key).or_default().extend(file_list);
    }

    let mut out = doc.clone();
    if !options.no_documents {
        if let Some(body) = out.body.as_object_mut() {
            body.insert("root".to_string(), Value::String(unique_id));
        }
    }
    Ok(out)
}

/// Export the Runs with the given uids (or unique uid prefixes), in order.
pub async fn export_uids(
    catalog: &dyn Catalog,
    uids: &[String],
    manager: &mut FileManager,
    options: &ExportOptions,
) -> Result<ExportSummary> {
    let hasher = RootHasher::from_option(options.salt.as_deref());
    let mut summary = ExportSummary::default();

    for uid in uids {
        summary.runs += 1;
        let result = async {
            let run = catalog.get(uid).await?;
            export_run(&run, manager, &hasher, catalog.root_map(), options).await
        }
        .await;

        match result {
            Ok(export) => summary.merge(export),
            Err(e) => {
                error!(uid = %uid, error = %format!("{:#}", e), "Error while exporting Run");
                if options.strict {
                    return Err(e.context(format!("Error while exporting Run {:?}", uid)));
                }
                summary.failures.push(uid.clone());
            }
        }
    }

    info!(
        runs = summary.runs,
        failures = summary.failures.len(),
        catalog = catalog.name(),
        "Finished writing Documents"
    );
    Ok(summary)
}

/// Export every Run matching `query`, honoring `options.limit`.
pub async fn export_catalog(
    catalog: &dyn Catalog,
    query: &Query,
    manager: &mut FileManager,
    options: &ExportOptions,
) -> Result<ExportSummary> {
    if options.limit == Some(0) {
        return Err(PackError::InvalidLimit.into());
    }

    let mut uids = catalog.search(query).await?;
    if let Some(limit) = options.limit {
        uids.truncate(limit);
    }
    debug!(query = %query, matches = uids.len(), "Searched catalog");

    export_uids(catalog, &uids, manager, options).await
}
