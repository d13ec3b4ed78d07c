//! Catalog backed by MongoDB in the "normalized" layout.
//!
//! Collections:
//!
//! | Collection         | Documents   |
//! |--------------------|-------------|
//! | `run_start`        | start       |
//! | `run_stop`         | stop        |
//! | `event_descriptor` | descriptor  |
//! | `event`            | event       |
//! | `resource`         | resource    |
//! | `datum`            | datum       |

use anyhow::{Context, Result};
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document as BsonDocument};
use mongodb::options::{ClientOptions, FindOptions};
use mongodb::{Client, Collection, Database};
use serde_json::Value;

use super::{resolve_uid, Catalog, CatalogError};
use crate::domain::{Document, DocumentName, RootMap, Run};
use crate::query::Query;

/// Catalog driver name for MongoDB-backed catalogs
pub const MONGO_NORMALIZED_DRIVER: &str = "bluesky-mongo-normalized-catalog";

/// Collection holding documents of the given kind (pages are stored as rows)
pub fn collection_for(name: DocumentName) -> &'static str {
    match name {
        DocumentName::Start => "run_start",
        DocumentName::Stop => "run_stop",
        DocumentName::Descriptor => "event_descriptor",
        DocumentName::Event | DocumentName::EventPage => "event",
        DocumentName::Resource => "resource",
        DocumentName::Datum | DocumentName::DatumPage => "datum",
    }
}

/// Database name from a parsed URI; the URI must name one
pub fn database_name(options: &ClientOptions) -> Result<String> {
    options
        .default_database
        .clone()
        .filter(|name| !name.is_empty())
        .context("Mongo URI must include a database name.")
}

/// Check that `uri` parses and names a database, without connecting.
pub async fn validate_uri(uri: &str) -> Result<()> {
    let options = ClientOptions::parse(uri)
        .await
        .with_context(|| format!("Invalid MongoDB URI: {}", uri))?;
    database_name(&options).map(|_| ())
}

/// Runs stored in MongoDB
pub struct MongoCatalog {
    name: String,
    root_map: RootMap,
    metadatastore: Database,
    asset_registry: Database,
}

impl MongoCatalog {
    /// Connect to the run and asset databases (often the same URI).
    pub async fn connect(
        name: impl Into<String>,
        metadatastore_db: &str,
        asset_registry_db: &str,
        root_map: RootMap,
    ) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            root_map,
            metadatastore: open_database(metadatastore_db).await?,
            asset_registry: open_database(asset_registry_db).await?,
        })
    }

    fn collection(&self, name: DocumentName) -> Collection<BsonDocument> {
        let database = match name {
            DocumentName::Resource | DocumentName::Datum | DocumentName::DatumPage => {
                &self.asset_registry
            }
            _ => &self.metadatastore,
        };
        database.collection(collection_for(name))
    }

    async fn find_all(
        &self,
        name: DocumentName,
        filter: BsonDocument,
        sort: Option<BsonDocument>,
    ) -> Result<Vec<Value>> {
        let options = FindOptions::builder().sort(sort).build();
        let mut cursor = self
            .collection(name)
            .find(filter, options)
            .await
            .with_context(|| format!("Failed to query {} documents", name))?;

        let mut found = Vec::new();
        while cursor.advance().await? {
            found.push(to_json(cursor.deserialize_current()?));
        }
        Ok(found)
    }

    async fn start_uids(&self, filter: BsonDocument) -> Result<Vec<String>> {
        let starts = self
            .find_all(DocumentName::Start, filter, Some(doc! { "time": 1 }))
            .await?;
        Ok(starts
            .iter()
            .filter_map(|s| s.get("uid").and_then(Value::as_str).map(str::to_string))
            .collect())
    }
}

pub(crate) async fn open_database(uri: &str) -> Result<Database> {
    let options = ClientOptions::parse(uri)
        .await
        .with_context(|| format!("Invalid MongoDB URI: {}", uri))?;
    let name = database_name(&options)?;
    let client = Client::with_options(options).context("Failed to create MongoDB client")?;
    Ok(client.database(&name))
}

/// BSON document to JSON, dropping the server-assigned `_id`.
fn to_json(document: BsonDocument) -> Value {
    let mut value = Bson::Document(document).into_relaxed_extjson();
    if let Some(map) = value.as_object_mut() {
        map.remove("_id");
    }
    value
}

fn uids_of(values: &[Value]) -> Vec<Bson> {
    values
        .iter()
        .filter_map(|v| v.get("uid").and_then(Value::as_str))
        .map(|uid| Bson::String(uid.to_string()))
        .collect()
}

/// Escape a uid prefix for use in a `$regex`.
fn regex_escape(text: &str) -> String {
    text.chars()
        .flat_map(|c| {
            let escape = !c.is_ascii_alphanumeric() && c != '-' && c != '_';
            escape.then_some('\\').into_iter().chain(std::iter::once(c))
        })
        .collect()
}

#[async_trait]
impl Catalog for MongoCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    fn root_map(&self) -> &RootMap {
        &self.root_map
    }

    async fn search(&self, query: &Query) -> Result<Vec<String>> {
        let filter = mongodb::bson::to_document(query.as_value())
            .context("Query is not representable as BSON")?;
        self.start_uids(filter).await
    }

    async fn count(&self) -> Result<usize> {
        let n = self
            .collection(DocumentName::Start)
            .count_documents(doc! {}, None)
            .await
            .context("Failed to count Runs")?;
        Ok(n as usize)
    }

    async fn get(&self, key: &str) -> Result<Run> {
        let prefix = format!("^{}", regex_escape(key));
        let candidates = self
            .start_uids(doc! { "uid": { "$regex": prefix } })
            .await?;
        let uid = resolve_uid(key, candidates.iter().map(String::as_str))?.to_string();

        let start = self
            .find_all(DocumentName::Start, doc! { "uid": uid.as_str() }, None)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CatalogError::RunNotFound(uid.clone()))?;

        let descriptors = self
            .find_all(
                DocumentName::Descriptor,
                doc! { "run_start": uid.as_str() },
                Some(doc! { "time": 1 }),
            )
            .await?;
        let resources = self
            .find_all(DocumentName::Resource, doc! { "run_start": uid.as_str() }, None)
            .await?;
        let datums = if resources.is_empty() {
            Vec::new()
        } else {
            self.find_all(
                DocumentName::Datum,
                doc! { "resource": { "$in": uids_of(&resources) } },
                None,
            )
            .await?
        };
        let events = if descriptors.is_empty() {
            Vec::new()
        } else {
            self.find_all(
                DocumentName::Event,
                doc! { "descriptor": { "$in": uids_of(&descriptors) } },
                Some(doc! { "time": 1, "seq_num": 1 }),
            )
            .await?
        };
        let stop = self
            .find_all(DocumentName::Stop, doc! { "run_start": uid.as_str() }, None)
            .await?
            .into_iter()
            .next();

        let mut documents = vec![Document::new(DocumentName::Start, start)];
        let groups = [
            (DocumentName::Descriptor, descriptors),
            (DocumentName::Resource, resources),
            (DocumentName::Datum, datums),
            (DocumentName::Event, events),
        ];
        for (name, bodies) in groups {
            documents.extend(bodies.into_iter().map(|body| Document::new(name, body)));
        }
        if let Some(stop) = stop {
            documents.push(Document::new(DocumentName::Stop, stop));
        }

        Ok(Run::new(documents)?)
    }
}
