//! Event-model documents.
//!
//! A Run is recorded as an ordered stream of `(name, document)` pairs. The
//! document bodies are kept as raw JSON so that fields this crate does not
//! know about survive a pack/unpack round trip untouched.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of an event-model document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentName {
    /// RunStart
    Start,

    /// EventDescriptor
    Descriptor,

    /// A single Event
    Event,

    /// A column-oriented batch of Events
    EventPage,

    /// Pointer to an external file (or set of files)
    Resource,

    /// Pointer to a slice of a Resource
    Datum,

    /// A column-oriented batch of Datums
    DatumPage,

    /// RunStop
    Stop,
}

impl DocumentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentName::Start => "start",
            DocumentName::Descriptor => "descriptor",
            DocumentName::Event => "event",
            DocumentName::EventPage => "event_page",
            DocumentName::Resource => "resource",
            DocumentName::Datum => "datum",
            DocumentName::DatumPage => "datum_page",
            DocumentName::Stop => "stop",
        }
    }

    /// Resource, Datum and DatumPage only exist to locate external data.
    pub fn is_external_related(&self) -> bool {
        matches!(
            self,
            DocumentName::Resource | DocumentName::Datum | DocumentName::DatumPage
        )
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(DocumentName::Start),
            "descriptor" => Ok(DocumentName::Descriptor),
            "event" => Ok(DocumentName::Event),
            "event_page" => Ok(DocumentName::EventPage),
            "resource" => Ok(DocumentName::Resource),
            "datum" => Ok(DocumentName::Datum),
            "datum_page" => Ok(DocumentName::DatumPage),
            "stop" => Ok(DocumentName::Stop),
            _ => anyhow::bail!("Unknown document name: {}", s),
        }
    }
}

/// One `(name, document)` pair.
///
/// Serialized as a two-element array, `["start", {...}]`, which is the
/// layout of both the JSONL and msgpack document files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(DocumentName, Value)", into = "(DocumentName, Value)")]
pub struct Document {
    pub name: DocumentName,
    pub body: Value,
}

impl From<(DocumentName, Value)> for Document {
    fn from((name, body): (DocumentName, Value)) -> Self {
        Self { name, body }
    }
}

impl From<Document> for (DocumentName, Value) {
    fn from(doc: Document) -> Self {
        (doc.name, doc.body)
    }
}

impl Document {
    pub fn new(name: DocumentName, body: Value) -> Self {
        Self { name, body }
    }

    /// Unique identifier of this document (`datum_id` for Datums)
    pub fn uid(&self) -> Option<&str> {
        let key = match self.name {
            DocumentName::Datum => "datum_id",
            _ => "uid",
        };
        self.body.get(key).and_then(Value::as_str)
    }

    /// Unix timestamp, when the document kind carries a scalar one
    pub fn time(&self) -> Option<f64> {
        self.body.get("time").and_then(Value::as_f64)
    }

    /// String field lookup
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }
}

/// Split an EventPage into one Event per row.
pub fn unpack_event_page(page: &Value) -> Result<Vec<Value>> {
    let descriptor = page
        .get("descriptor")
        .cloned()
        .context("event_page is missing 'descriptor'")?;
    let uids = column(page, "uid")?;
    let times = column(page, "time")?;
    let seq_nums = column(page, "seq_num")?;

    let mut events = Vec::with_capacity(uids.len());
    for i in 0..uids.len() {
        let mut event = Map::new();
        event.insert("descriptor".to_string(), descriptor.clone());
        event.insert("uid".to_string(), uids[i].clone());
        event.insert("time".to_string(), cell(times, i)?);
        event.insert("seq_num".to_string(), cell(seq_nums, i)?);
        for key in ["data", "timestamps", "filled"] {
            if let Some(columns) = page.get(key).and_then(Value::as_object) {
                event.insert(key.to_string(), Value::Object(row(columns, i)?));
            }
        }
        events.push(Value::Object(event));
    }
    Ok(events)
}

/// Split a DatumPage into one Datum per row.
pub fn unpack_datum_page(page: &Value) -> Result<Vec<Value>> {
    let resource = page
        .get("resource")
        .cloned()
        .context("datum_page is missing 'resource'")?;
    let datum_ids = column(page, "datum_id")?;
    let kwargs = page
        .get("datum_kwargs")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let mut datums = Vec::with_capacity(datum_ids.len());
    for (i, datum_id) in datum_ids.iter().enumerate() {
        let mut datum = Map::new();
        datum.insert("resource".to_string(), resource.clone());
        datum.insert("datum_id".to_string(), datum_id.clone());
        datum.insert("datum_kwargs".to_string(), Value::Object(row(&kwargs, i)?));
        datums.push(Value::Object(datum));
    }
    Ok(datums)
}

fn column<'a>(page: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    page.get(key)
        .and_then(Value::as_array)
        .with_context(|| format!("page is missing column '{}'", key))
}

fn cell(values: &[Value], i: usize) -> Result<Value> {
    values
        .get(i)
        .cloned()
        .with_context(|| format!("page column is shorter than row {}", i))
}

fn row(columns: &Map<String, Value>, i: usize) -> Result<Map<String, Value>> {
    columns
        .iter()
        .map(|(key, values)| {
            let values = values
                .as_array()
                .with_context(|| format!("page column '{}' is not an array", key))?;
            Ok((key.clone(), cell(values, i)?))
        })
        .collect()
}
