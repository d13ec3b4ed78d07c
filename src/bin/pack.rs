//! databroker-pack entrypoint

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use databroker_pack::cli::{init_logging, report_error_log, PackCli};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let logging = init_logging("databroker-pack")?;

    let cli = PackCli::parse();
    let code = match cli.execute().await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    };

    report_error_log(&logging.error_log);
    Ok(code)
}
