//! Trigger and slot installer.
//!
//! Bootstraps a source database: notification function, per-table row and
//! truncate triggers, the logical replication slot, and the key-metadata
//! helper view. Teardown removes all of it, slot last.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::capture::slot_name;
use crate::error::PrivilegeError;
use crate::render::{RenderedSql, Safety};
use crate::tree::Tree;

pub mod ddl;

pub struct Installer<'a> {
    pool: &'a PgPool,
    tree: &'a Tree,
    database: String,
    dry_run: bool,
}

impl<'a> Installer<'a> {
    pub fn new(pool: &'a PgPool, tree: &'a Tree, database: &str) -> Self {
        Self {
            pool,
            tree,
            database: database.to_string(),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Install everything the tree needs. Re-running is a no-op. With
    /// `no_create` the replication slot is left alone and only checked.
    pub async fn setup(&self, no_create: bool) -> Result<()> {
        self.verify_privileges().await?;

        let statements = ddl::setup_statements(self.tree);
        self.execute(&statements).await?;

        let slot = slot_name(&self.database);
        if self.dry_run {
            println!("-- replication slot: {slot} (test_decoding)");
            return Ok(());
        }

        if no_create {
            if !self.slot_exists(&slot).await? {
                warn!(slot, "replication slot missing and --no-create given");
            }
        } else {
            self.create_slot(&slot).await?;
        }

        info!(database = %self.database, "bootstrap complete");
        Ok(())
    }

    /// Remove the installed artifacts. The slot drops last; a slot held by
    /// another consumer is reported and skipped, never fatal.
    pub async fn teardown(&self) -> Result<()> {
        self.verify_privileges().await?;

        let statements = ddl::teardown_statements(self.tree);
        self.execute(&statements).await?;

        let slot = slot_name(&self.database);
        if self.dry_run {
            println!("-- drop replication slot: {slot}");
            return Ok(());
        }
        self.drop_slot(&slot).await?;

        info!(database = %self.database, "teardown complete");
        Ok(())
    }

    async fn execute(&self, statements: &[RenderedSql]) -> Result<()> {
        for statement in statements {
            if self.dry_run {
                if statement.safety == Safety::Destructive {
                    println!("-- destructive");
                }
                println!("{};", statement.sql);
                continue;
            }
            sqlx::raw_sql(&statement.sql)
                .execute(self.pool)
                .await
                .with_context(|| format!("executing bootstrap DDL: {}", statement.sql))?;
        }
        Ok(())
    }

    /// The connecting role must be a superuser or hold REPLICATION; both
    /// the slot and the decoding functions require it.
    async fn verify_privileges(&self) -> Result<()> {
        let (superuser, replication, role): (bool, bool, String) = sqlx::query_as(
            "SELECT rolsuper, rolreplication, rolname FROM pg_roles WHERE rolname = current_user",
        )
        .fetch_one(self.pool)
        .await?;

        if !superuser && !replication {
            return Err(PrivilegeError::InsufficientPrivilege { role }.into());
        }
        Ok(())
    }

    async fn slot_exists(&self, slot: &str) -> Result<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM pg_replication_slots WHERE slot_name = $1")
                .bind(slot)
                .fetch_optional(self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn create_slot(&self, slot: &str) -> Result<()> {
        if self.slot_exists(slot).await? {
            return Ok(());
        }
        sqlx::query("SELECT pg_create_logical_replication_slot($1, 'test_decoding')")
            .bind(slot)
            .execute(self.pool)
            .await
            .with_context(|| format!("creating replication slot {slot}"))?;
        info!(slot, "replication slot created");
        Ok(())
    }

    async fn drop_slot(&self, slot: &str) -> Result<()> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT active FROM pg_replication_slots WHERE slot_name = $1")
                .bind(slot)
                .fetch_optional(self.pool)
                .await?;

        match row {
            None => Ok(()),
            Some((true,)) => {
                // Reported and skipped: another consumer still holds it.
                warn!(slot, "{}", PrivilegeError::SlotInUse(slot.to_string()));
                Ok(())
            }
            Some((false,)) => {
                sqlx::query("SELECT pg_drop_replication_slot($1)")
                    .bind(slot)
                    .execute(self.pool)
                    .await
                    .with_context(|| format!("dropping replication slot {slot}"))?;
                info!(slot, "replication slot dropped");
                Ok(())
            }
        }
    }
}
