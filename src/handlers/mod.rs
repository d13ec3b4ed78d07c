//! Handlers for data stored outside the Documents.
//!
//! A Resource document names a file (or file series) by `spec`, `root` and
//! `resource_path`; Datum documents address pieces of it through
//! `datum_kwargs`. A [`Handler`] turns those into concrete file paths and,
//! where supported, loads the data itself.
//!
//! Built-in handlers:
//!
//! | Spec          | Handler                   | Fill |
//! |---------------|---------------------------|------|
//! | `NPY_SEQ`     | `NumpySeqHandler`         | yes  |
//! | `AD_HDF5`     | `AreaDetectorHDF5Handler` | no   |
//! | `AD_HDF5_SWMR`| `AreaDetectorHDF5Handler` | no   |
//! | `AD_TIFF`     | `AreaDetectorTiffHandler` | no   |

pub mod area_detector;
pub mod filler;
pub mod numpy;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::domain::RootMap;

pub use area_detector::{AreaDetectorHdf5Handler, AreaDetectorTiffHandler};
pub use filler::Filler;
pub use numpy::{read_npy, NumpySeqHandler};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("No handler registered for Resource spec {0:?}")]
    UnknownSpec(String),

    #[error("Unknown handler class {0:?}")]
    UnknownClass(String),

    #[error("Could not parse --handler-registry {0}. A dict of strings is expected.")]
    Parse(String),

    #[error("Resource is missing required field {0:?}")]
    MissingField(&'static str),

    #[error("{spec} requires keyword argument {key:?}")]
    MissingKwarg { spec: &'static str, key: &'static str },

    #[error("{spec} keyword argument {key:?} is out of range: {value}")]
    KwargRange {
        spec: &'static str,
        key: &'static str,
        value: i64,
    },

    #[error("Loading data is not supported for {0} files")]
    FillUnsupported(&'static str),

    #[error("Invalid template {template:?}: {reason}")]
    Template { template: String, reason: String },

    #[error("Invalid .npy file {path}: {reason}")]
    Npy { path: PathBuf, reason: String },

    #[error("Failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves external data for one Resource
pub trait Handler: Send + Sync {
    /// Files touched by the given datums, in order
    fn file_list(&self, datum_kwargs: &[Value]) -> Result<Vec<PathBuf>, HandlerError>;

    /// Data for one datum
    fn fill(&self, datum_kwargs: &Value) -> Result<Value, HandlerError>;
}

/// Built-in handler implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    NumpySeq,
    AreaDetectorHdf5,
    AreaDetectorTiff,
}

impl HandlerKind {
    const ALL: [HandlerKind; 3] = [
        HandlerKind::NumpySeq,
        HandlerKind::AreaDetectorHdf5,
        HandlerKind::AreaDetectorTiff,
    ];

    pub fn class_name(&self) -> &'static str {
        match self {
            HandlerKind::NumpySeq => "NumpySeqHandler",
            HandlerKind::AreaDetectorHdf5 => "AreaDetectorHDF5Handler",
            HandlerKind::AreaDetectorTiff => "AreaDetectorTiffHandler",
        }
    }

    /// Look up by class path, e.g. `ophyd.sim.NumpySeqHandler` or
    /// `area_detector_handlers.handlers:AreaDetectorHDF5Handler`.
    pub fn from_class_path(path: &str) -> Result<Self, HandlerError> {
        let class = path.rsplit(['.', ':']).next().unwrap_or(path);
        Self::ALL
            .into_iter()
            .find(|kind| kind.class_name() == class)
            .ok_or_else(|| HandlerError::UnknownClass(path.to_string()))
    }

    fn build(&self, path: PathBuf, resource_kwargs: &Value) -> Result<Box<dyn Handler>, HandlerError> {
        Ok(match self {
            HandlerKind::NumpySeq => Box::new(NumpySeqHandler::new(path)),
            HandlerKind::AreaDetectorHdf5 => Box::new(AreaDetectorHdf5Handler::new(path)),
            HandlerKind::AreaDetectorTiff => {
                Box::new(AreaDetectorTiffHandler::new(path, resource_kwargs)?)
            }
        })
    }
}

/// Maps Resource `spec` to a handler
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, HandlerKind>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let handlers = [
            ("NPY_SEQ", HandlerKind::NumpySeq),
            ("AD_HDF5", HandlerKind::AreaDetectorHdf5),
            ("AD_HDF5_SWMR", HandlerKind::AreaDetectorHdf5),
            ("AD_TIFF", HandlerKind::AreaDetectorTiff),
        ]
        .into_iter()
        .map(|(spec, kind)| (spec.to_string(), kind))
        .collect();
        Self { handlers }
    }
}

impl HandlerRegistry {
    /// Registry with exactly the given specs, from a mapping such as
    /// `{'NPY_SEQ': 'ophyd.sim.NumpySeqHandler'}`.
    pub fn parse(text: &str) -> Result<Self, HandlerError> {
        let mapping: BTreeMap<String, String> =
            serde_yaml::from_str(text).map_err(|_| HandlerError::Parse(text.to_string()))?;
        let handlers = mapping
            .into_iter()
            .map(|(spec, class)| Ok((spec, HandlerKind::from_class_path(&class)?)))
            .collect::<Result<_, HandlerError>>()?;
        Ok(Self { handlers })
    }

    pub fn specs(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Handler for a Resource, looking for its files under the mapped root.
    pub fn handler_for(&self, resource: &Value, root_map: &RootMap) -> Result<Box<dyn Handler>, HandlerError> {
        let spec = field(resource, "spec")?;
        let kind = self
            .handlers
            .get(spec)
            .ok_or_else(|| HandlerError::UnknownSpec(spec.to_string()))?;
        let path = resource_location(resource, root_map)?;
        let kwargs = resource.get("resource_kwargs").unwrap_or(&Value::Null);
        kind.build(path, kwargs)
    }

    /// Files referenced by a Resource and the datums pointing into it.
    pub fn file_list_for(
        &self,
        resource: &Value,
        datum_kwargs: &[Value],
        root_map: &RootMap,
    ) -> Result<Vec<PathBuf>, HandlerError> {
        self.handler_for(resource, root_map)?.file_list(datum_kwargs)
    }
}

/// The Resource's `root` after applying `root_map`
pub fn mapped_root<'a>(resource: &'a Value, root_map: &'a RootMap) -> &'a str {
    let root = resource.get("root").and_then(Value::as_str).unwrap_or("");
    root_map.get(root).map(String::as_str).unwrap_or(root)
}

/// `root / resource_path`, with `root` mapped
fn resource_location(resource: &Value, root_map: &RootMap) -> Result<PathBuf, HandlerError> {
    let root = mapped_root(resource, root_map);
    let resource_path = field(resource, "resource_path")?;
    Ok(Path::new(root).join(resource_path))
}

fn field<'a>(doc: &'a Value, key: &'static str) -> Result<&'a str, HandlerError> {
    doc.get(key)
        .and_then(Value::as_str)
        .ok_or(HandlerError::MissingField(key))
}

/// Integer keyword argument, accepting whole floats
fn int_kwarg(kwargs: &Value, spec: &'static str, key: &'static str) -> Result<i64, HandlerError> {
    let value = kwargs.get(key);
    value
        .and_then(Value::as_i64)
        .or_else(|| {
            value
                .and_then(Value::as_f64)
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        })
        .ok_or(HandlerError::MissingKwarg { spec, key })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_registry_specs() {
        let registry = HandlerRegistry::default();
        let specs: Vec<&str> = registry.specs().collect();
        assert_eq!(specs, vec!["AD_HDF5", "AD_HDF5_SWMR", "AD_TIFF", "NPY_SEQ"]);
    }

    #[test]
    fn test_parse_registry() {
        let registry = HandlerRegistry::parse(
            "{'NPY_SEQ': 'ophyd.sim.NumpySeqHandler', 'AD_HDF5': 'area_detector_handlers.handlers:AreaDetectorHDF5Handler'}",
        )
        .unwrap();
        let specs: Vec<&str> = registry.specs().collect();
        assert_eq!(specs, vec!["AD_HDF5", "NPY_SEQ"]);

        assert!(matches!(
            HandlerRegistry::parse("{'X': 'pkg.NoSuchHandler'}"),
            Err(HandlerError::UnknownClass(_))
        ));
        assert!(matches!(
            HandlerRegistry::parse("[1, 2"),
            Err(HandlerError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_spec() {
        let resource = json!({"spec": "CUSTOM", "root": "/", "resource_path": "x", "uid": "r"});
        let err = HandlerRegistry::default()
            .handler_for(&resource, &RootMap::new())
            .err()
            .unwrap();
        assert!(matches!(err, HandlerError::UnknownSpec(spec) if spec == "CUSTOM"));
    }

    #[test]
    fn test_file_list_uses_root_map() {
        let resource = json!({
            "spec": "NPY_SEQ",
            "root": "/recorded",
            "resource_path": "scan/data",
            "resource_kwargs": {},
            "uid": "r",
        });
        let mut root_map = RootMap::new();
        root_map.insert("/recorded".to_string(), "/mnt/current".to_string());

        let files = HandlerRegistry::default()
            .file_list_for(&resource, &[json!({"index": 0}), json!({"index": 1})], &root_map)
            .unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("/mnt/current/scan/data_0.npy"),
                PathBuf::from("/mnt/current/scan/data_1.npy"),
            ]
        );
    }

    #[test]
    fn test_int_kwarg_accepts_whole_floats() {
        let kwargs = json!({"a": 3, "b": 4.0, "c": 4.5});
        assert_eq!(int_kwarg(&kwargs, "T", "a").unwrap(), 3);
        assert_eq!(int_kwarg(&kwargs, "T", "b").unwrap(), 4);
        assert!(int_kwarg(&kwargs, "T", "c").is_err());
        assert!(int_kwarg(&kwargs, "T", "d").is_err());
    }
}
