//! A Run and the lookups the exporter needs from it.
//!
//! A Run is one data-acquisition session: a RunStart, any number of
//! descriptors, events, resources and datums, and (usually) a RunStop.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use super::document::{unpack_datum_page, Document, DocumentName};

/// Errors raised while assembling a Run from documents
#[derive(Debug, Error)]
pub enum RunError {
    #[error("A Run must begin with a 'start' document, found '{0}'")]
    MissingStart(DocumentName),

    #[error("Document stream is empty")]
    Empty,

    #[error("RunStart document has no 'uid'")]
    MissingUid,

    #[error("Malformed datum_page in Run {uid}: {reason}")]
    MalformedPage { uid: String, reason: String },
}

/// A Datum reduced to what a handler needs
#[derive(Debug, Clone, PartialEq)]
pub struct DatumRef {
    /// uid of the Resource the Datum points into
    pub resource: String,

    /// Handler-specific keyword arguments
    pub datum_kwargs: Value,
}

/// A single Run, documents kept in canonical order
#[derive(Debug, Clone)]
pub struct Run {
    uid: String,
    documents: Vec<Document>,
}

impl Run {
    /// Build a Run from its documents. The first one must be the RunStart.
    pub fn new(documents: Vec<Document>) -> Result<Self, RunError> {
        let first = documents.first().ok_or(RunError::Empty)?;
        if first.name != DocumentName::Start {
            return Err(RunError::MissingStart(first.name));
        }
        let uid = first.uid().ok_or(RunError::MissingUid)?.to_string();
        Ok(Self { uid, documents })
    }

    /// Split a flat document stream into Runs, one per RunStart.
    ///
    /// Documents are assigned to the most recent RunStart; anything before
    /// the first one is an error.
    pub fn split(documents: Vec<Document>) -> Result<Vec<Self>, RunError> {
        let mut runs = Vec::new();
        let mut current: Vec<Document> = Vec::new();

        for doc in documents {
            if doc.name == DocumentName::Start && !current.is_empty() {
                runs.push(Self::new(std::mem::take(&mut current))?);
            }
            current.push(doc);
        }
        if !current.is_empty() {
            runs.push(Self::new(current)?);
        }

        Ok(runs)
    }

    /// RunStart uid
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// RunStart document body
    pub fn start(&self) -> &Value {
        &self.documents[0].body
    }

    /// RunStop document body, if the Run was closed
    pub fn stop(&self) -> Option<&Value> {
        self.documents
            .iter()
            .rev()
            .find(|d| d.name == DocumentName::Stop)
            .map(|d| &d.body)
    }

    pub fn scan_id(&self) -> Option<i64> {
        self.start().get("scan_id").and_then(Value::as_i64)
    }

    /// RunStart time (0.0 when absent)
    pub fn time(&self) -> f64 {
        self.start().get("time").and_then(Value::as_f64).unwrap_or(0.0)
    }

    /// All documents, canonical order
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Map of datum_id to the Datum it names, covering Datums and DatumPages.
    pub fn datum_index(&self) -> Result<HashMap<String, DatumRef>, RunError> {
        let mut index = HashMap::new();
        for datum in self.datums()? {
            if let (Some(id), Some(resource)) = (
                datum.get("datum_id").and_then(Value::as_str),
                datum.get("resource").and_then(Value::as_str),
            ) {
                index.insert(
                    id.to_string(),
                    DatumRef {
                        resource: resource.to_string(),
                        datum_kwargs: datum.get("datum_kwargs").cloned().unwrap_or(Value::Null),
                    },
                );
            }
        }
        Ok(index)
    }

    /// The `datum_kwargs` of every Datum that references `resource_uid`, in
    /// document order.
    pub fn datum_kwargs_for(&self, resource_uid: &str) -> Result<Vec<Value>, RunError> {
        Ok(self
            .datums()?
            .into_iter()
            .filter(|d| d.get("resource").and_then(Value::as_str) == Some(resource_uid))
            .map(|d| d.get("datum_kwargs").cloned().unwrap_or(Value::Null))
            .collect())
    }

    fn datums(&self) -> Result<Vec<Value>, RunError> {
        let mut datums = Vec::new();
        for doc in &self.documents {
            match doc.name {
                DocumentName::Datum => datums.push(doc.body.clone()),
                DocumentName::DatumPage => {
                    let rows = unpack_datum_page(&doc.body).map_err(|e| RunError::MalformedPage {
                        uid: self.uid.clone(),
                        reason: e.to_string(),
                    })?;
                    datums.extend(rows);
                }
                _ => {}
            }
        }
        Ok(datums)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(name: DocumentName, body: Value) -> Document {
        Document::new(name, body)
    }

    fn sample_run() -> Vec<Document> {
        vec![
            doc(DocumentName::Start, json!({"uid": "run-1", "time": 10.0, "scan_id": 7})),
            doc(DocumentName::Resource, json!({"uid": "res-a", "spec": "NPY_SEQ", "root": "/data", "resource_path": "a", "resource_kwargs": {}})),
            doc(DocumentName::Datum, json!({"datum_id": "res-a/0", "resource": "res-a", "datum_kwargs": {"index": 0}})),
            doc(DocumentName::DatumPage, json!({"resource": "res-a", "datum_id": ["res-a/1", "res-a/2"], "datum_kwargs": {"index": [1, 2]}})),
            doc(DocumentName::Stop, json!({"uid": "stop-1", "run_start": "run-1", "exit_status": "success"})),
        ]
    }

    #[test]
    fn test_run_creation() {
        let run = Run::new(sample_run()).unwrap();

        assert_eq!(run.uid(), "run-1");
        assert_eq!(run.scan_id(), Some(7));
        assert_eq!(run.time(), 10.0);
        assert_eq!(run.stop().unwrap()["exit_status"], "success");
        assert_eq!(
            run.documents()
                .iter()
                .filter(|d| d.name == DocumentName::Resource)
                .count(),
            1
        );
    }

    #[test]
    fn test_run_requires_start_first() {
        let mut docs = sample_run();
        docs.remove(0);
        assert!(matches!(Run::new(docs), Err(RunError::MissingStart(DocumentName::Resource))));
        assert!(matches!(Run::new(Vec::new()), Err(RunError::Empty)));
    }

    #[test]
    fn test_datum_kwargs_include_pages() {
        let run = Run::new(sample_run()).unwrap();
        let kwargs = run.datum_kwargs_for("res-a").unwrap();

        assert_eq!(kwargs, vec![json!({"index": 0}), json!({"index": 1}), json!({"index": 2})]);
        assert!(run.datum_kwargs_for("other").unwrap().is_empty());
    }

    #[test]
    fn test_datum_index() {
        let run = Run::new(sample_run()).unwrap();
        let index = run.datum_index().unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(index["res-a/2"].resource, "res-a");
        assert_eq!(index["res-a/2"].datum_kwargs, json!({"index": 2}));
    }

    #[test]
    fn test_split_groups_by_start() {
        let mut docs = sample_run();
        docs.push(doc(DocumentName::Start, json!({"uid": "run-2", "time": 11.0})));
        docs.push(doc(DocumentName::Stop, json!({"uid": "stop-2", "run_start": "run-2"})));

        let runs = Run::split(docs).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].documents().len(), 5);
        assert_eq!(runs[1].uid(), "run-2");
    }
}
