//! Register a pack directory as a named catalog.
//!
//! Two strategies:
//! - in place: write a catalog file pointing at the pack's Document files
//! - mongo_normalized: copy the Documents into MongoDB and point at that
//!
//! Either way the new catalog file is `databroker_unpack_<NAME>.yml` in the
//! first (user-writable) directory of the catalog search path.

pub mod mongo;

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use thiserror::Error;
use tracing::info;

use crate::catalog::{join_pattern, CatalogFile, CatalogRegistry, SourceEntry, PACKED_SOURCE, PACK_CATALOG_FILE};
use crate::domain::RootMap;

pub use mongo::unpack_mongo_normalized;

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("Could not find 'catalog.yml' in {0}")]
    MissingCatalogFile(PathBuf),

    #[error("Catalog file {0} has no 'packed_catalog' source")]
    MissingPackedSource(PathBuf),

    #[error("A catalog named {0:?} already exists")]
    CatalogNameExists(String),

    #[error("The catalog {0:?} exists but not in the user-writable location. Pick a different catalog name.")]
    NotUserWritable(String),

    #[error("Cannot merge source with driver {new} into source with driver {existing}")]
    DriverMismatch { new: String, existing: String },

    #[error("Existing catalog has {arg} {existing} which does not match requested uri {uri}.")]
    UriMismatch {
        arg: &'static str,
        existing: String,
        uri: String,
    },

    #[error("root_map between existing source and new source have colliding keys {0:?}")]
    RootMapCollision(Vec<String>),
}

/// What every unpack strategy starts from
struct Unpacking {
    /// Absolute pack directory
    pack_dir: PathBuf,
    /// The pack's source, paths and root_map made absolute
    source: SourceEntry,
    /// Source already registered under the name (merge only)
    existing: Option<SourceEntry>,
    /// Catalog file to write
    dest: PathBuf,
}

/// Catalog file written for `name`
pub fn destination(registry: &CatalogRegistry, name: &str) -> Result<PathBuf> {
    Ok(registry
        .user_dir()?
        .join(format!("databroker_unpack_{}.yml", name)))
}

async fn prepare(registry: &CatalogRegistry, path: &Path, name: &str, merge: bool) -> Result<Unpacking> {
    if !path.is_dir() {
        return Err(UnpackError::NotADirectory(path.to_path_buf()).into());
    }
    let pack_file = path.join(PACK_CATALOG_FILE);
    if !pack_file.is_file() {
        return Err(UnpackError::MissingCatalogFile(path.to_path_buf()).into());
    }
    let pack_dir = std::path::absolute(path)
        .with_context(|| format!("Invalid pack directory {}", path.display()))?;

    let dest = destination(registry, name)?;
    let existing = if registry.contains(name).await? {
        if !merge {
            return Err(UnpackError::CatalogNameExists(name.to_string()).into());
        }
        if !dest.is_file() {
            return Err(UnpackError::NotUserWritable(name.to_string()).into());
        }
        let existing = CatalogFile::load(&dest).await?;
        let source = existing
            .sources
            .get(name)
            .cloned()
            .ok_or_else(|| UnpackError::NotUserWritable(name.to_string()))?;
        Some(source)
    } else {
        None
    };

    let mut pack = CatalogFile::load(&pack_file).await?;
    let mut source = pack
        .sources
        .remove(PACKED_SOURCE)
        .ok_or(UnpackError::MissingPackedSource(pack_file))?;
    absolutize(&mut source, &pack_dir);

    Ok(Unpacking {
        pack_dir,
        source,
        existing,
        dest,
    })
}

/// Rewrite `args.paths` from `metadata.relative_paths` and make relative
/// root_map values absolute, both against the pack directory.
fn absolutize(source: &mut SourceEntry, pack_dir: &Path) {
    if let Some(relative) = source.relative_paths() {
        let mut paths: Vec<String> = relative.iter().map(|p| join_pattern(pack_dir, p)).collect();
        paths.sort();
        source.args.paths = Some(paths);
    }
    for value in source.args.root_map.values_mut() {
        if Path::new(value.as_str()).is_relative() {
            *value = pack_dir.join(value.as_str()).to_string_lossy().into_owned();
        }
    }
}

/// Add `existing` entries to `root_map`; any shared key is an error.
fn merge_root_maps(root_map: &mut RootMap, existing: &RootMap) -> Result<(), UnpackError> {
    let collisions: Vec<String> = root_map
        .keys()
        .filter(|k| existing.contains_key(*k))
        .cloned()
        .collect();
    if !collisions.is_empty() {
        return Err(UnpackError::RootMapCollision(collisions));
    }
    root_map.extend(existing.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(())
}

fn sorted_union(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().chain(b).cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Write `{sources: {name: source}}` to `dest` under an exclusive lock.
fn write_catalog(dest: &Path, name: &str, source: SourceEntry) -> Result<()> {
    if let Some(dir) = dest.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create catalog directory: {}", dir.display()))?;
    }
    let yaml = CatalogFile::single(name, source).to_yaml()?;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dest)
        .with_context(|| format!("Failed to open catalog file: {}", dest.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("Failed to acquire file lock on {}", dest.display()))?;
    file.set_len(0)?;
    file.write_all(yaml.as_bytes())
        .with_context(|| format!("Failed to write catalog file: {}", dest.display()))?;
    file.flush()?;

    // Lock is released when file is dropped
    Ok(())
}

/// Register the pack at `path` as catalog `name`, reading its files in place.
///
/// With `merge`, an existing catalog of the same name (written by a previous
/// unpack) is extended rather than rejected.
pub async fn unpack_inplace(registry: &CatalogRegistry, path: &Path, name: &str, merge: bool) -> Result<PathBuf> {
    let Unpacking {
        pack_dir,
        mut source,
        existing,
        dest,
    } = prepare(registry, path, name, merge).await?;

    if let Some(existing) = &existing {
        if existing.driver != source.driver {
            return Err(UnpackError::DriverMismatch {
                new: source.driver.clone(),
                existing: existing.driver.clone(),
            }
            .into());
        }

        let paths = sorted_union(
            source.args.paths.as_deref().unwrap_or_default(),
            existing.args.paths.as_deref().unwrap_or_default(),
        );
        source.args.paths = Some(paths);

        let relative = sorted_union(
            source.relative_paths().unwrap_or_default(),
            existing.relative_paths().unwrap_or_default(),
        );
        source.metadata.get_or_insert_with(Default::default).relative_paths = Some(relative);

        merge_root_maps(&mut source.args.root_map, &existing.args.root_map)?;
    }

    write_catalog(&dest, name, source)?;
    info!(name, pack = %pack_dir.display(), config = %dest.display(), "Unpacked in place");
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use tempfile::TempDir;

    const PACK_YAML: &str = r#"sources:
  packed_catalog:
    driver: bluesky-jsonl-catalog
    args:
      paths:
      - /somewhere/else/documents/*.jsonl
      root_map:
        ROOTHASH: external_files/ROOTHASH
    metadata:
      generated_by:
        library: databroker_pack
        version: 0.1.0
      relative_paths:
      - ./documents/*.jsonl
"#;

    fn make_pack(dir: &Path, uid: &str, root_key: &str) {
        std::fs::create_dir_all(dir.join("documents")).unwrap();
        std::fs::write(
            dir.join("documents").join(format!("{}.jsonl", uid)),
            format!("[\"start\", {{\"uid\": \"{}\", \"time\": 1.0}}]\n", uid),
        )
        .unwrap();
        std::fs::write(dir.join(PACK_CATALOG_FILE), PACK_YAML.replace("ROOTHASH", root_key)).unwrap();
    }

    #[tokio::test]
    async fn test_unpack_inplace_writes_absolute_config() {
        let temp = TempDir::new().unwrap();
        let pack = temp.path().join("pack");
        make_pack(&pack, "aaa", "h1");
        let registry = CatalogRegistry::new(vec![temp.path().join("catalogs")]);

        let dest = unpack_inplace(&registry, &pack, "mine", false).await.unwrap();
        assert_eq!(dest, temp.path().join("catalogs/databroker_unpack_mine.yml"));

        let written = CatalogFile::load(&dest).await.unwrap();
        let source = &written.sources["mine"];
        assert_eq!(
            source.args.paths.as_ref().unwrap(),
            &vec![format!("{}/documents/*.jsonl", pack.display())]
        );
        assert_eq!(
            source.args.root_map["h1"],
            pack.join("external_files/h1").to_string_lossy()
        );

        let catalog = registry.open("mine").await.unwrap();
        assert_eq!(catalog.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_existing_name_requires_merge() {
        let temp = TempDir::new().unwrap();
        let pack = temp.path().join("pack");
        make_pack(&pack, "aaa", "h1");
        let registry = CatalogRegistry::new(vec![temp.path().join("catalogs")]);
        unpack_inplace(&registry, &pack, "mine", false).await.unwrap();

        let err = unpack_inplace(&registry, &pack, "mine", false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UnpackError>(),
            Some(UnpackError::CatalogNameExists(name)) if name == "mine"
        ));
    }

    #[tokio::test]
    async fn test_merge_unions_paths_and_rejects_collisions() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        let third = temp.path().join("third");
        make_pack(&first, "aaa", "h1");
        make_pack(&second, "bbb", "h2");
        make_pack(&third, "ccc", "h1");
        let registry = CatalogRegistry::new(vec![temp.path().join("catalogs")]);

        unpack_inplace(&registry, &first, "mine", true).await.unwrap();
        let dest = unpack_inplace(&registry, &second, "mine", true).await.unwrap();

        let written = CatalogFile::load(&dest).await.unwrap();
        let source = &written.sources["mine"];
        assert_eq!(source.args.paths.as_ref().unwrap().len(), 2);
        assert_eq!(source.args.root_map.len(), 2);
        assert_eq!(source.relative_paths().unwrap(), ["./documents/*.jsonl"]);
        assert_eq!(registry.open("mine").await.unwrap().count().await.unwrap(), 2);

        let err = unpack_inplace(&registry, &third, "mine", true).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UnpackError>(),
            Some(UnpackError::RootMapCollision(keys)) if keys == &vec!["h1".to_string()]
        ));
    }

    #[tokio::test]
    async fn test_merge_into_foreign_catalog_is_refused() {
        let temp = TempDir::new().unwrap();
        let pack = temp.path().join("pack");
        make_pack(&pack, "aaa", "h1");
        let user = temp.path().join("user");
        let system = temp.path().join("system");
        std::fs::create_dir_all(&system).unwrap();
        std::fs::write(
            system.join("site.yml"),
            "sources:\n  mine:\n    driver: bluesky-jsonl-catalog\n",
        )
        .unwrap();
        let registry = CatalogRegistry::new(vec![user, system]);

        let err = unpack_inplace(&registry, &pack, "mine", true).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UnpackError>(),
            Some(UnpackError::NotUserWritable(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_pack_paths() {
        let temp = TempDir::new().unwrap();
        let registry = CatalogRegistry::new(vec![temp.path().join("catalogs")]);

        let err = unpack_inplace(&registry, &temp.path().join("missing"), "x", false)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<UnpackError>(), Some(UnpackError::NotADirectory(_))));

        let err = unpack_inplace(&registry, temp.path(), "x", false).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UnpackError>(),
            Some(UnpackError::MissingCatalogFile(_))
        ));
    }

    #[test]
    fn test_merge_root_maps() {
        let mut a: RootMap = [("x".to_string(), "/x".to_string())].into_iter().collect();
        let b: RootMap = [("y".to_string(), "/y".to_string())].into_iter().collect();
        merge_root_maps(&mut a, &b).unwrap();
        assert_eq!(a.len(), 2);
        assert!(merge_root_maps(&mut a, &b).is_err());
    }
}
