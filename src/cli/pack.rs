//! `databroker-pack`: export Runs from a catalog into a directory.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use tracing::info;

use super::{list_catalogs, write_report};
use crate::catalog::CatalogRegistry;
use crate::config::config;
use crate::handlers::HandlerRegistry;
use crate::pack::{write_pack, ExportOptions, ExternalMode, PackError, PackOptions, Selection};
use crate::query::Query;
use crate::serializer::Format;

/// Export Runs from a catalog, with their external files, into a portable directory
#[derive(Parser, Debug)]
#[command(name = "databroker-pack")]
#[command(version, about, long_about = None)]
#[command(group(ArgGroup::new("selection").args(["all", "query", "uids"])))]
#[command(group(ArgGroup::new("external").args(["copy_external", "fill_external", "ignore_external"])))]
pub struct PackCli {
    /// Catalog name, or path to a catalog file
    #[arg(required_unless_present = "list_catalogs")]
    pub catalog: Option<String>,

    /// Destination directory, created if missing
    #[arg(required_unless_present = "list_catalogs")]
    pub directory: Option<PathBuf>,

    /// Export every Run in the catalog
    #[arg(long)]
    pub all: bool,

    /// MongoDB-style query, or TimeRange(since=..., until=...); repeat to combine
    #[arg(short, long)]
    pub query: Vec<String>,

    /// Newline-separated file of uids or uid prefixes ('-' reads stdin); repeatable
    #[arg(long)]
    pub uids: Vec<PathBuf>,

    /// Copy external files into the pack
    #[arg(long)]
    pub copy_external: bool,

    /// Load external data into the Documents
    #[arg(long)]
    pub fill_external: bool,

    /// Leave external files out entirely
    #[arg(long)]
    pub ignore_external: bool,

    /// Document file format
    #[arg(long, value_enum, ignore_case = true, default_value = "msgpack")]
    pub format: FormatArg,

    /// Locate external files but write no Documents
    #[arg(long)]
    pub no_documents: bool,

    /// Pack at most this many Runs
    #[arg(long)]
    pub limit: Option<usize>,

    /// Stop on the first failure
    #[arg(long)]
    pub strict: bool,

    /// Handler classes by Resource spec, as a dict, e.g. "{NPY_SEQ: ophyd.sim.NumpySeqHandler}"
    #[arg(long)]
    pub handler_registry: Option<String>,

    /// Salt for naming external roots (random by default)
    #[arg(long)]
    pub salt: Option<String>,

    /// List the available catalogs and exit
    #[arg(long)]
    pub list_catalogs: bool,
}

/// Document format for the CLI (maps to Format)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    Msgpack,
    Jsonl,
}

impl From<FormatArg> for Format {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Msgpack => Format::Msgpack,
            FormatArg::Jsonl => Format::Jsonl,
        }
    }
}

impl PackCli {
    fn external_mode(&self) -> ExternalMode {
        if self.fill_external {
            ExternalMode::Fill
        } else if self.ignore_external {
            ExternalMode::Ignore
        } else {
            ExternalMode::Paths
        }
    }

    fn selection(&self) -> Result<Selection> {
        if self.all {
            Ok(Selection::Query(Query::all()))
        } else if !self.query.is_empty() {
            let mut queries = self
                .query
                .iter()
                .map(|q| Query::parse(q))
                .collect::<Result<Vec<_>, _>>()?;
            if queries.len() == 1 {
                Ok(Selection::Query(queries.remove(0)))
            } else {
                Ok(Selection::Query(Query::and(queries)))
            }
        } else if !self.uids.is_empty() {
            Ok(Selection::Uids(read_uid_files(&self.uids)?))
        } else {
            bail!("Choose the Runs to pack with --all, --query or --uids")
        }
    }

    /// Execute the pack command
    pub async fn execute(self) -> Result<ExitCode> {
        let config = config()?;
        let registry = CatalogRegistry::from_config(config);

        if self.list_catalogs {
            list_catalogs(&registry).await?;
            return Ok(ExitCode::SUCCESS);
        }

        let (Some(catalog_name), Some(directory)) = (self.catalog.as_deref(), self.directory.as_deref()) else {
            bail!("CATALOG and DIRECTORY are required");
        };

        let selection = self.selection()?;
        let handlers = match &self.handler_registry {
            Some(text) => HandlerRegistry::parse(text)?,
            None => HandlerRegistry::default(),
        };
        let options = PackOptions {
            export: ExportOptions {
                strict: self.strict,
                external: self.external_mode(),
                no_documents: self.no_documents,
                handlers,
                format: self.format.into(),
                salt: self.salt.clone(),
                limit: self.limit,
            },
            copy_external: self.copy_external,
            manifest_max_lines: config.manifest_max_lines,
        };

        let catalog = registry
            .open(catalog_name)
            .await
            .with_context(|| format!("Failed to open catalog {}", catalog_name))?;
        let report = write_pack(&*catalog, &selection, directory, &options).await?;

        if !report.summary.failures.is_empty() {
            let path = write_report("databroker-pack-failures-", report.summary.failures.iter().cloned())?;
            println!(
                "{} Run(s) failed to be packed. Their uids are listed in {}",
                report.summary.failures.len(),
                path.display()
            );
        }
        if !report.copy_failures.is_empty() {
            let path = write_report(
                "databroker-pack-copy-failures-",
                report.copy_failures.iter().map(|p| p.display().to_string()),
            )?;
            println!(
                "{} external file(s) failed to be copied. They are listed in {}",
                report.copy_failures.len(),
                path.display()
            );
        }
        info!(catalog_file = %report.catalog_file.display(), "Wrote catalog file");

        Ok(if report.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
}

/// Read uids from each file, or stdin for `-`.
fn read_uid_files(paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut uids = Vec::new();
    for path in paths {
        let text = if path == Path::new("-") {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read uids from stdin")?;
            buffer
        } else {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read uids file: {}", path.display()))?
        };
        uids.extend(parse_uids(&text));
    }
    if uids.is_empty() {
        return Err(PackError::EmptyUids.into());
    }
    Ok(uids)
}

/// One uid per line; blank lines and `#` comments are skipped.
fn parse_uids(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}
