//! `pgriver bootstrap`: install or remove the database artifacts.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::catalog::Catalog;
use crate::db::connect_with_retry;
use crate::install::Installer;
use crate::settings::Settings;
use crate::tree::Tree;
use crate::{schema, Cli};

#[derive(Debug, Clone, Default, Args)]
pub struct BootstrapArgs {
    /// Remove triggers, functions, views, and the replication slot
    #[arg(long)]
    pub teardown: bool,

    /// Never create the replication slot, only check for it
    #[arg(long)]
    pub no_create: bool,

    /// Print the DDL without executing anything
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, help = "Database host (overrides PG_HOST)")]
    pub host: Option<String>,

    #[arg(long, help = "Database port (overrides PG_PORT)")]
    pub port: Option<u16>,

    #[arg(long, help = "Database user (overrides PG_USER)")]
    pub user: Option<String>,

    #[arg(long, help = "Database password (overrides PG_PASSWORD)")]
    pub password: Option<String>,
}

impl BootstrapArgs {
    /// Fold CLI overrides into the environment-derived settings.
    pub fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(host) = &self.host {
            settings.pg_host = host.clone();
        }
        if let Some(port) = self.port {
            settings.pg_port = port;
        }
        if let Some(user) = &self.user {
            settings.pg_user = user.clone();
        }
        if let Some(password) = &self.password {
            settings.pg_password = Some(password.clone());
        }
        settings
    }
}

pub async fn cmd_bootstrap(cli: &Cli, args: &BootstrapArgs, settings: Settings) -> Result<()> {
    let settings = args.apply(settings);
    let config = cli.config_path(&settings)?;
    let syncs = schema::load(Path::new(&config))?;

    for sync in &syncs {
        let url = settings.database_url(&sync.database);
        let pool = connect_with_retry(&url)
            .await
            .with_context(|| format!("connecting to {}", sync.database))?;

        let catalog = Catalog::load(&pool).await?;
        let tree = Tree::build(sync, &catalog)
            .with_context(|| format!("building tree for sync {}", sync.database))?;
        tracing::debug!(
            database = %sync.database,
            nodes = tree.len(),
            projection = ?tree.projection(tree.root().id),
            "schema tree validated"
        );

        let installer = Installer::new(&pool, &tree, &sync.database).dry_run(args.dry_run);
        if args.teardown {
            info!(database = %sync.database, "tearing down");
            installer.teardown().await?;
        } else {
            info!(database = %sync.database, "bootstrapping");
            installer.setup(args.no_create).await?;
        }
    }

    Ok(())
}
