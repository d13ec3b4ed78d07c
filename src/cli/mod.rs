//! Command-line interfaces for databroker-pack and databroker-unpack.
//!
//! Both binaries share logging setup and catalog listing; argument parsing
//! and dispatch live in [`pack`] and [`unpack`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::catalog::CatalogRegistry;

pub mod pack;
pub mod unpack;

pub use pack::PackCli;
pub use unpack::UnpackCli;

/// Handle on the installed logging
#[derive(Debug)]
pub struct Logging {
    /// Kept temp file receiving every ERROR event
    pub error_log: PathBuf,
}

/// Install a stderr layer filtered by `RUST_LOG` (default `info`) and an
/// ERROR-level layer writing to a temp file that outlives the process.
pub fn init_logging(program: &str) -> Result<Logging> {
    let (file, error_log) = tempfile::Builder::new()
        .prefix(&format!("{}-", program))
        .suffix(".log")
        .tempfile()
        .context("Failed to create error log")?
        .keep()
        .context("Failed to keep error log")?;

    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    let errors = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(LevelFilter::ERROR);

    tracing_subscriber::registry().with(stderr).with(errors).init();

    Ok(Logging { error_log })
}

/// Print every catalog name found on the search path, one per line.
pub async fn list_catalogs(registry: &CatalogRegistry) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    for name in registry.names().await? {
        writeln!(stdout, "{}", name)?;
    }
    Ok(())
}

/// Arrange `names` in columns fitting `width` characters.
pub fn columns(names: &[String], width: usize) -> String {
    let cell = names.iter().map(String::len).max().unwrap_or(0) + 2;
    let per_row = (width / cell.max(1)).max(1);

    let mut out = String::new();
    for row in names.chunks(per_row) {
        let line: String = row.iter().map(|n| format!("{:<cell$}", n, cell = cell)).collect();
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Terminal width from `COLUMNS`, else 80.
pub fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|c| c.parse().ok())
        .filter(|&c: &usize| c > 0)
        .unwrap_or(80)
}

/// Write `lines` to a kept temp file and return its path.
pub fn write_report(prefix: &str, lines: impl IntoIterator<Item = String>) -> Result<PathBuf> {
    let (mut file, path) = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".txt")
        .tempfile()
        .context("Failed to create report file")?
        .keep()
        .context("Failed to keep report file")?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    Ok(path)
}

/// Point the user at the error log if anything was written to it.
pub fn report_error_log(error_log: &Path) {
    let has_errors = std::fs::metadata(error_log).map(|m| m.len() > 0).unwrap_or(false);
    if has_errors {
        eprintln!("Errors were logged to {}", error_log.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_fit_width() {
        let names: Vec<String> = ["a", "bbb", "cc", "d"].iter().map(|s| s.to_string()).collect();
        // cell = 5, so two per row at width 12
        assert_eq!(columns(&names, 12), "a    bbb\ncc   d\n");
        assert_eq!(columns(&names, 1), "a\nbbb\ncc\nd\n");
        assert_eq!(columns(&[], 80), "");
    }

    #[test]
    fn test_write_report() {
        let path = write_report("databroker-pack-test-", vec!["x".to_string(), "y".to_string()]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "x\ny\n");
        std::fs::remove_file(path).unwrap();
    }
}
