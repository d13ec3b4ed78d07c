//! Bulk-load documents into a MongoDB "normalized" layout.
//!
//! One collection per document kind; pages are split into rows so that the
//! database only ever holds single Events and Datums.

use anyhow::{Context, Result};
use mongodb::bson::{self, Document as BsonDocument};
use mongodb::Database;
use serde_json::Value;

use crate::catalog::mongo::{collection_for, open_database};
use crate::domain::{unpack_datum_page, unpack_event_page, Document, DocumentName};

/// Inserts documents into the collections read by the mongo catalog driver
pub struct MongoNormalizedSerializer {
    database: Database,
}

impl MongoNormalizedSerializer {
    /// Connect to the database named in `uri`.
    pub async fn connect(uri: &str) -> Result<Self> {
        Ok(Self {
            database: open_database(uri).await?,
        })
    }

    /// Insert one document, unpacking pages into rows.
    pub async fn write(&self, doc: &Document) -> Result<()> {
        let rows = match doc.name {
            DocumentName::EventPage => unpack_event_page(&doc.body)?,
            DocumentName::DatumPage => unpack_datum_page(&doc.body)?,
            _ => vec![doc.body.clone()],
        };
        if rows.is_empty() {
            return Ok(());
        }

        let bson_rows = rows
            .iter()
            .map(to_bson)
            .collect::<Result<Vec<_>>>()?;
        let collection = self
            .database
            .collection::<BsonDocument>(collection_for(doc.name));

        collection
            .insert_many(bson_rows, None)
            .await
            .with_context(|| format!("Failed to insert {} document(s)", doc.name))?;
        Ok(())
    }
}

fn to_bson(value: &Value) -> Result<BsonDocument> {
    bson::to_document(value).context("Document is not representable as BSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_bson_keeps_fields() {
        let doc = to_bson(&json!({"uid": "abc", "time": 1.5, "data": {"x": [1, 2]}})).unwrap();
        assert_eq!(doc.get_str("uid").unwrap(), "abc");
        assert_eq!(doc.get_f64("time").unwrap(), 1.5);
        assert!(doc.get_document("data").unwrap().get_array("x").is_ok());
    }

    #[test]
    fn test_to_bson_rejects_non_objects() {
        assert!(to_bson(&json!([1, 2, 3])).is_err());
    }
}
