//! Shared fixtures: a small JSONL catalog whose Runs reference NPY_SEQ files.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use serde_json::json;
use tempfile::TempDir;

use databroker_pack::catalog::{CatalogFile, GeneratedBy, SourceEntry, SourceMetadata, PACKED_SOURCE, PACK_CATALOG_FILE};
use databroker_pack::serializer::JSONL_DRIVER;
use databroker_pack::{unpack_inplace, CatalogRegistry, Document, DocumentName, Format};

pub const RAW: &str = "raw";

/// Run uids in start-time order
pub const RUNS: [&str; 2] = ["aaaa-1111", "bbbb-2222"];

pub struct Fixture {
    pub temp: TempDir,
    pub registry: CatalogRegistry,
    /// Recorded root of every Resource
    pub data: PathBuf,
}

impl Fixture {
    pub fn path(&self, relative: &str) -> PathBuf {
        self.temp.path().join(relative)
    }
}

/// A little-endian float64 `.npy` file body.
pub fn npy_f64(values: &[f64]) -> Vec<u8> {
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );
    while (10 + header.len() + 1) % 64 != 0 {
        header.push(' ');
    }
    header.push('\n');

    let mut bytes = b"\x93NUMPY".to_vec();
    bytes.extend([1u8, 0u8]);
    bytes.extend((header.len() as u16).to_le_bytes());
    bytes.extend(header.as_bytes());
    for v in values {
        bytes.extend(v.to_le_bytes());
    }
    bytes
}

/// Values stored in point `index` of Run `n`
pub fn point_values(n: usize, index: usize) -> Vec<f64> {
    vec![(10 * n + index) as f64, 0.5]
}

fn run_documents(n: usize, uid: &str, data: &Path) -> Vec<Document> {
    let descriptor = format!("{}-desc", uid);
    let resource = format!("{}-res", uid);
    let resource_path = format!("run{}/img", n);
    let mut docs = vec![
        Document::new(
            DocumentName::Start,
            json!({"uid": uid, "time": 100.0 * (n + 1) as f64, "plan_name": if n == 0 { "count" } else { "scan" }, "scan_id": n + 1}),
        ),
        Document::new(
            DocumentName::Descriptor,
            json!({
                "uid": descriptor,
                "run_start": uid,
                "time": 100.0 * (n + 1) as f64,
                "name": "primary",
                "data_keys": {
                    "img": {"dtype": "array", "shape": [2], "source": "det", "external": "FILESTORE:"},
                    "x": {"dtype": "number", "shape": [], "source": "motor"}
                }
            }),
        ),
        Document::new(
            DocumentName::Resource,
            json!({
                "uid": resource,
                "spec": "NPY_SEQ",
                "root": data.to_string_lossy(),
                "resource_path": resource_path,
                "resource_kwargs": {},
                "path_semantics": "posix",
                "run_start": uid
            }),
        ),
    ];
    for index in 0..2 {
        let datum_id = format!("{}/{}", resource, index);
        docs.push(Document::new(
            DocumentName::Datum,
            json!({"datum_id": datum_id, "resource": resource, "datum_kwargs": {"index": index}}),
        ));
        docs.push(Document::new(
            DocumentName::Event,
            json!({
                "uid": format!("{}-ev{}", uid, index),
                "descriptor": descriptor,
                "time": 100.0 * (n + 1) as f64 + index as f64,
                "seq_num": index + 1,
                "data": {"img": datum_id, "x": index},
                "timestamps": {"img": 0.0, "x": 0.0},
                "filled": {"img": false}
            }),
        ));
    }
    docs.push(Document::new(
        DocumentName::Stop,
        json!({"uid": format!("{}-stop", uid), "run_start": uid, "exit_status": "success", "num_events": {"primary": 2}}),
    ));
    docs
}

/// Build a pack-shaped source directory, register it as [`RAW`] and write
/// the external files its Resources point at.
pub async fn raw_catalog() -> Fixture {
    let temp = TempDir::new().unwrap();
    let data = temp.path().join("data");
    let source_dir = temp.path().join("source");
    std::fs::create_dir_all(source_dir.join("documents")).unwrap();

    for (n, uid) in RUNS.iter().enumerate() {
        std::fs::create_dir_all(data.join(format!("run{}", n))).unwrap();
        for index in 0..2 {
            std::fs::write(
                data.join(format!("run{}/img_{}.npy", n, index)),
                npy_f64(&point_values(n, index)),
            )
            .unwrap();
        }

        let mut lines = Vec::new();
        for doc in run_documents(n, uid, &data) {
            lines.extend(Format::Jsonl.encode(&doc).unwrap());
        }
        std::fs::write(source_dir.join(format!("documents/{}.jsonl", uid)), lines).unwrap();
    }

    let mut entry = SourceEntry::new(JSONL_DRIVER);
    entry.metadata = Some(SourceMetadata {
        generated_by: Some(GeneratedBy::current()),
        relative_paths: Some(vec![Format::Jsonl.documents_glob()]),
        ..Default::default()
    });
    std::fs::write(
        source_dir.join(PACK_CATALOG_FILE),
        CatalogFile::single(PACKED_SOURCE, entry).to_yaml().unwrap(),
    )
    .unwrap();

    let registry = CatalogRegistry::new(vec![temp.path().join("catalogs")]);
    unpack_inplace(&registry, &source_dir, RAW, false).await.unwrap();

    Fixture { temp, registry, data }
}

/// Non-empty lines of every file whose name starts with `prefix` in `dir`.
pub fn manifest_lines(dir: &Path, prefix: &str) -> Vec<String> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix))
        })
        .collect();
    files.sort();
    files
        .iter()
        .flat_map(|f| {
            std::fs::read_to_string(f)
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|l| !l.is_empty())
        .collect()
}
