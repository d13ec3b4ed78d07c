//! Replace datum references in Events with the data they point to.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use super::{Handler, HandlerRegistry};
use crate::domain::{unpack_datum_page, DatumRef, Document, DocumentName, RootMap};

/// Fills external data into Event and EventPage documents.
///
/// Documents must be fed in stream order: a Resource before its Datums,
/// Datums and Descriptors before the Events that reference them.
pub struct Filler<'a> {
    registry: &'a HandlerRegistry,
    root_map: &'a RootMap,
    resources: HashMap<String, Value>,
    datums: HashMap<String, DatumRef>,
    /// descriptor uid -> data keys marked `external`
    external_keys: HashMap<String, Vec<String>>,
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl<'a> Filler<'a> {
    pub fn new(registry: &'a HandlerRegistry, root_map: &'a RootMap) -> Self {
        Self {
            registry,
            root_map,
            resources: HashMap::new(),
            datums: HashMap::new(),
            external_keys: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Observe one document and return it, filled if it is an Event(Page).
    pub fn process(&mut self, doc: &Document) -> Result<Document> {
        match doc.name {
            DocumentName::Resource => {
                let uid = doc.uid().context("Resource document has no 'uid'")?;
                self.resources.insert(uid.to_string(), doc.body.clone());
            }
            DocumentName::Datum => self.add_datum(&doc.body)?,
            DocumentName::DatumPage => {
                for datum in unpack_datum_page(&doc.body)? {
                    self.add_datum(&datum)?;
                }
            }
            DocumentName::Descriptor => {
                let uid = doc.uid().context("Descriptor document has no 'uid'")?;
                self.external_keys
                    .insert(uid.to_string(), external_keys(&doc.body));
            }
            DocumentName::Event => return self.fill_event(doc, false),
            DocumentName::EventPage => return self.fill_event(doc, true),
            DocumentName::Start | DocumentName::Stop => {}
        }
        Ok(doc.clone())
    }

    fn add_datum(&mut self, datum: &Value) -> Result<()> {
        let datum_id = datum
            .get("datum_id")
            .and_then(Value::as_str)
            .context("Datum document has no 'datum_id'")?;
        let resource = datum
            .get("resource")
            .and_then(Value::as_str)
            .with_context(|| format!("Datum {} has no 'resource'", datum_id))?;
        self.datums.insert(
            datum_id.to_string(),
            DatumRef {
                resource: resource.to_string(),
                datum_kwargs: datum.get("datum_kwargs").cloned().unwrap_or(Value::Null),
            },
        );
        Ok(())
    }

    fn fill_event(&mut self, doc: &Document, paged: bool) -> Result<Document> {
        let descriptor = doc
            .get_str("descriptor")
            .with_context(|| format!("{} document has no 'descriptor'", doc.name))?;
        let keys = match self.external_keys.get(descriptor) {
            Some(keys) if !keys.is_empty() => keys.clone(),
            _ => return Ok(doc.clone()),
        };

        let mut body = doc.body.clone();
        for key in &keys {
            let Some(value) = body.get("data").and_then(|d| d.get(key)).cloned() else {
                continue;
            };
            let already = body
                .get("filled")
                .and_then(|f| f.get(key))
                .map(|f| if paged { all_true(f) } else { f == &Value::Bool(true) })
                .unwrap_or(false);
            if already {
                continue;
            }

            let (filled_value, flag) = if paged {
                let ids = value
                    .as_array()
                    .with_context(|| format!("EventPage column {:?} is not an array", key))?;
                let loaded = ids
                    .iter()
                    .map(|id| self.load(id))
                    .collect::<Result<Vec<_>>>()?;
                let flags = vec![Value::Bool(true); loaded.len()];
                (Value::Array(loaded), Value::Array(flags))
            } else {
                (self.load(&value)?, Value::Bool(true))
            };

            set_in(&mut body, "data", key, filled_value);
            set_in(&mut body, "filled", key, flag);
        }

        Ok(Document::new(doc.name, body))
    }

    /// Data for one datum id
    fn load(&mut self, datum_id: &Value) -> Result<Value> {
        let datum_id = datum_id
            .as_str()
            .with_context(|| format!("Expected a datum id, found {}", datum_id))?;
        let datum = self
            .datums
            .get(datum_id)
            .with_context(|| format!("Datum {} not found", datum_id))?;

        if !self.handlers.contains_key(&datum.resource) {
            let resource = self
                .resources
                .get(&datum.resource)
                .with_context(|| format!("Resource {} not found", datum.resource))?;
            let handler = self.registry.handler_for(resource, self.root_map)?;
            self.handlers.insert(datum.resource.clone(), handler);
        }
        let handler = self
            .handlers
            .get(&datum.resource)
            .with_context(|| format!("No handler for Resource {}", datum.resource))?;

        handler
            .fill(&datum.datum_kwargs)
            .with_context(|| format!("Failed to fill datum {}", datum_id))
    }
}

/// Data keys of a Descriptor with a truthy `external` field
fn external_keys(descriptor: &Value) -> Vec<String> {
    let mut keys: Vec<String> = descriptor
        .get("data_keys")
        .and_then(Value::as_object)
        .map(|data_keys| {
            data_keys
                .iter()
                .filter(|(_, spec)| match spec.get("external") {
                    None | Some(Value::Null) | Some(Value::Bool(false)) => false,
                    Some(Value::String(s)) => !s.is_empty(),
                    Some(_) => true,
                })
                .map(|(key, _)| key.clone())
                .collect()
        })
        .unwrap_or_default();
    keys.sort();
    keys
}

fn all_true(flags: &Value) -> bool {
    flags
        .as_array()
        .map(|a| !a.is_empty() && a.iter().all(|f| f == &Value::Bool(true)))
        .unwrap_or(false)
}

/// `body[section][key] = value`, creating `section` if needed
fn set_in(body: &mut Value, section: &str, key: &str, value: Value) {
    let Some(object) = body.as_object_mut() else {
        return;
    };
    let entry = object
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Some(map) = entry.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::numpy::tests::npy_f64;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(name: DocumentName, body: Value) -> Document {
        Document::new(name, body)
    }

    fn stream(root: &str) -> Vec<Document> {
        vec![
            doc(DocumentName::Start, json!({"uid": "s", "time": 0.0})),
            doc(
                DocumentName::Descriptor,
                json!({
                    "uid": "d",
                    "run_start": "s",
                    "data_keys": {
                        "img": {"dtype": "array", "external": "FILESTORE:"},
                        "motor": {"dtype": "number"},
                    },
                }),
            ),
            doc(
                DocumentName::Resource,
                json!({"uid": "r", "spec": "NPY_SEQ", "root": root, "resource_path": "img", "resource_kwargs": {}}),
            ),
            doc(
                DocumentName::DatumPage,
                json!({"resource": "r", "datum_id": ["r/0", "r/1"], "datum_kwargs": {"index": [0, 1]}}),
            ),
        ]
    }

    #[test]
    fn test_fills_event_and_event_page() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("img_0.npy"), npy_f64(&[2], &[1.0, 2.0])).unwrap();
        std::fs::write(temp.path().join("img_1.npy"), npy_f64(&[2], &[3.0, 4.0])).unwrap();

        let registry = HandlerRegistry::default();
        let mut root_map = RootMap::new();
        root_map.insert("/recorded".to_string(), temp.path().to_string_lossy().into_owned());
        let mut filler = Filler::new(&registry, &root_map);
        for d in stream("/recorded") {
            filler.process(&d).unwrap();
        }

        let event = doc(
            DocumentName::Event,
            json!({"uid": "e", "descriptor": "d", "data": {"img": "r/0", "motor": 1.5}, "filled": {"img": false}}),
        );
        let filled = filler.process(&event).unwrap();
        assert_eq!(filled.body["data"]["img"], json!([1.0, 2.0]));
        assert_eq!(filled.body["data"]["motor"], json!(1.5));
        assert_eq!(filled.body["filled"]["img"], json!(true));
        // input untouched
        assert_eq!(event.body["data"]["img"], json!("r/0"));

        let page = doc(
            DocumentName::EventPage,
            json!({"uid": ["e1", "e2"], "descriptor": "d", "data": {"img": ["r/0", "r/1"]}, "filled": {}}),
        );
        let filled = filler.process(&page).unwrap();
        assert_eq!(filled.body["data"]["img"], json!([[1.0, 2.0], [3.0, 4.0]]));
        assert_eq!(filled.body["filled"]["img"], json!([true, true]));
    }

    #[test]
    fn test_unknown_datum_is_an_error() {
        let registry = HandlerRegistry::default();
        let root_map = RootMap::new();
        let mut filler = Filler::new(&registry, &root_map);
        for d in stream("/nowhere") {
            filler.process(&d).unwrap();
        }
        let event = doc(
            DocumentName::Event,
            json!({"uid": "e", "descriptor": "d", "data": {"img": "missing"}}),
        );
        assert!(filler.process(&event).is_err());
    }

    #[test]
    fn test_external_keys() {
        let descriptor = json!({"data_keys": {
            "a": {"external": "FILESTORE:"},
            "b": {"external": null},
            "c": {},
            "d": {"external": true},
        }});
        assert_eq!(external_keys(&descriptor), vec!["a", "d"]);
    }
}
