//! Unpack by copying Documents into MongoDB.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info};

use super::{merge_root_maps, prepare, write_catalog, UnpackError, Unpacking};
use crate::catalog::mongo::validate_uri;
use crate::catalog::{open_source, CatalogRegistry, SourceEntry, MONGO_NORMALIZED_DRIVER, PACKED_SOURCE};
use crate::query::Query;
use crate::serializer::MongoNormalizedSerializer;

/// Check that an existing source can receive this unpack.
fn check_existing(existing: &SourceEntry, uri: &str) -> Result<(), UnpackError> {
    if existing.driver != MONGO_NORMALIZED_DRIVER {
        return Err(UnpackError::DriverMismatch {
            new: MONGO_NORMALIZED_DRIVER.to_string(),
            existing: existing.driver.clone(),
        });
    }
    let args = [
        ("metadatastore_db", &existing.args.metadatastore_db),
        ("asset_registry_db", &existing.args.asset_registry_db),
    ];
    for (arg, value) in args {
        let value = value.as_deref().unwrap_or_default();
        if value != uri {
            return Err(UnpackError::UriMismatch {
                arg,
                existing: value.to_string(),
                uri: uri.to_string(),
            });
        }
    }
    Ok(())
}

/// Mongo source built from the pack's file-based one
fn mongo_source(source: &SourceEntry, uri: &str) -> SourceEntry {
    let mut mongo = SourceEntry::new(MONGO_NORMALIZED_DRIVER);
    mongo.metadata = source.metadata.clone();
    mongo.extra = source.extra.clone();
    mongo.args.metadatastore_db = Some(uri.to_string());
    mongo.args.asset_registry_db = Some(uri.to_string());
    mongo.args.root_map = source.args.root_map.clone();
    mongo
}

/// Copy every Document of the pack at `path` into the database named in
/// `uri` and register it as catalog `name`.
pub async fn unpack_mongo_normalized(
    registry: &CatalogRegistry,
    path: &Path,
    uri: &str,
    name: &str,
    merge: bool,
) -> Result<PathBuf> {
    let Unpacking {
        pack_dir,
        source,
        existing,
        dest,
    } = prepare(registry, path, name, merge).await?;

    validate_uri(uri).await?;
    if let Some(existing) = &existing {
        check_existing(existing, uri)?;
    }

    let catalog = open_source(PACKED_SOURCE, &source).await?;
    let serializer = MongoNormalizedSerializer::connect(uri).await?;
    let uids = catalog.search(&Query::all()).await?;
    info!(runs = uids.len(), pack = %pack_dir.display(), "Copying Documents into MongoDB");
    for uid in &uids {
        let run = catalog.get(uid).await?;
        for doc in run.documents() {
            serializer.write(doc).await?;
        }
        debug!(uid = %uid, documents = run.documents().len(), "Copied Run");
    }

    let mut mongo = mongo_source(&source, uri);
    if let Some(existing) = &existing {
        merge_root_maps(&mut mongo.args.root_map, &existing.args.root_map)?;
    }

    write_catalog(&dest, name, mongo)?;
    info!(name, config = %dest.display(), "Unpacked into MongoDB");
    Ok(dest)
}
