//! `databroker-unpack`: register a pack directory as a named catalog.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

use super::{columns, list_catalogs, terminal_width};
use crate::catalog::CatalogRegistry;
use crate::config::config;
use crate::unpack::{unpack_inplace, unpack_mongo_normalized, UnpackError};

/// Install a pack directory as a catalog
#[derive(Parser, Debug)]
#[command(name = "databroker-unpack")]
#[command(version, about, long_about = None)]
pub struct UnpackCli {
    /// List the available catalogs and exit
    #[arg(long)]
    pub list_catalogs: bool,

    #[command(subcommand)]
    pub command: Option<UnpackCommand>,
}

#[derive(Subcommand, Debug)]
pub enum UnpackCommand {
    /// Read the packed files where they are
    Inplace {
        /// Pack directory
        path: PathBuf,

        /// Catalog name to register
        name: String,

        /// Fail if NAME exists instead of merging into it
        #[arg(long)]
        no_merge: bool,
    },

    /// Copy the packed Documents into MongoDB
    #[command(name = "mongo_normalized")]
    MongoNormalized {
        /// Pack directory
        path: PathBuf,

        /// Catalog name to register
        name: String,

        /// Fail if NAME exists instead of merging into it
        #[arg(long)]
        no_merge: bool,

        /// MongoDB URI; "{database}" becomes databroker_<NAME>
        #[arg(long)]
        mongo_uri: Option<String>,
    },
}

/// Fill the `{database}` placeholder of a URI template.
pub fn mongo_uri_for(template: &str, name: &str) -> String {
    template.replace("{database}", &format!("databroker_{}", name))
}

impl UnpackCli {
    /// Execute the unpack command
    pub async fn execute(self) -> Result<ExitCode> {
        let config = config()?;
        let registry = CatalogRegistry::from_config(config);

        if self.list_catalogs {
            list_catalogs(&registry).await?;
            return Ok(ExitCode::SUCCESS);
        }

        let Some(command) = self.command else {
            UnpackCli::command().print_help()?;
            return Ok(ExitCode::FAILURE);
        };

        let (name, result) = match command {
            UnpackCommand::Inplace { path, name, no_merge } => {
                let result = unpack_inplace(&registry, &path, &name, !no_merge).await;
                (name, result)
            }
            UnpackCommand::MongoNormalized {
                path,
                name,
                no_merge,
                mongo_uri,
            } => {
                let template = mongo_uri.unwrap_or_else(|| config.mongo_uri.clone());
                let uri = mongo_uri_for(&template, &name);
                let result = unpack_mongo_normalized(&registry, &path, &uri, &name, !no_merge).await;
                (name, result)
            }
        };

        match result {
            Ok(dest) => {
                print_placed(&dest);
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => match e.downcast_ref::<UnpackError>() {
                Some(UnpackError::CatalogNameExists(_)) => {
                    eprintln!("{}. Choose a different NAME. Existing catalogs:\n", e);
                    let names = registry.names().await?;
                    eprint!("{}", columns(&names, terminal_width()));
                    tracing::debug!(name = %name, "Refused to overwrite catalog");
                    Ok(ExitCode::FAILURE)
                }
                _ => Err(e),
            },
        }
    }
}

fn print_placed(dest: &Path) {
    println!("Placed configuration file at {}", dest.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mongo_uri_template() {
        assert_eq!(
            mongo_uri_for("mongodb://localhost:27017/{database}", "xyz"),
            "mongodb://localhost:27017/databroker_xyz"
        );
        assert_eq!(mongo_uri_for("mongodb://h/fixed", "xyz"), "mongodb://h/fixed");
    }

    #[test]
    fn test_arguments() {
        let cli = UnpackCli::try_parse_from(["databroker-unpack", "inplace", "/tmp/p", "name"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(UnpackCommand::Inplace { no_merge: false, .. })
        ));

        let cli = UnpackCli::try_parse_from([
            "databroker-unpack",
            "mongo_normalized",
            "/tmp/p",
            "name",
            "--no-merge",
            "--mongo-uri",
            "mongodb://h/{database}",
        ])
        .unwrap();
        let Some(UnpackCommand::MongoNormalized { no_merge, mongo_uri, .. }) = cli.command else {
            panic!("expected mongo_normalized");
        };
        assert!(no_merge);
        assert_eq!(mongo_uri.as_deref(), Some("mongodb://h/{database}"));

        let cli = UnpackCli::try_parse_from(["databroker-unpack", "--list-catalogs"]).unwrap();
        assert!(cli.list_catalogs && cli.command.is_none());

        assert!(UnpackCli::try_parse_from(["databroker-unpack", "inplace", "/tmp/p"]).is_err());
    }
}
