//! `pgriver sync`: one-shot catch-up or the full daemon.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::capture::{
    ChangeEvent, NotificationListener, ReplicationReader, event_queue, slot_name,
};
use crate::catalog::Catalog;
use crate::checkpoint::{Checkpoint, FileCheckpointStore};
use crate::db::{connect_with_retry, current_txid};
use crate::engine::{SyncEngine, sync_documents};
use crate::indexer::Indexer;
use crate::query::Filter;
use crate::schema::SyncDef;
use crate::settings::Settings;
use crate::tree::Tree;
use crate::{Cli, schema};

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(2);
const LISTENER_RETRY_LIMIT: u32 = 10;

pub async fn cmd_sync(cli: &Cli, daemon: bool, settings: Settings) -> Result<()> {
    if settings.redis_checkpoint {
        anyhow::bail!(
            "REDIS_CHECKPOINT=true requires a broker-backed checkpoint store, which is not wired in"
        );
    }

    let config = cli.config_path(&settings)?;
    let syncs = schema::load(Path::new(&config))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if daemon {
        tokio::spawn(async move {
            crate::wait_for_shutdown_signal().await;
            info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
        });
    }

    let mut handles = Vec::new();
    for sync in syncs {
        let settings = settings.clone();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            run_sync(sync, settings, daemon, shutdown).await
        }));
    }

    for handle in handles {
        handle.await??;
    }
    Ok(())
}

async fn run_sync(
    sync: SyncDef,
    settings: Settings,
    daemon: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let url = settings.database_url(&sync.database);
    let pool = connect_with_retry(&url)
        .await
        .with_context(|| format!("connecting to {}", sync.database))?;

    let catalog = Catalog::load(&pool).await?;
    let tree = Tree::build(&sync, &catalog)
        .with_context(|| format!("building tree for sync {}", sync.database))?;

    let indexer = Indexer::new(&settings)?;
    let index = sync.index().to_string();
    let checkpoint_dir = settings
        .checkpoint_path
        .clone()
        .unwrap_or_else(|| ".".to_string());
    let checkpoint = Checkpoint::open(
        Box::new(FileCheckpointStore::new(checkpoint_dir)),
        &sync.database,
        &index,
    )?;

    // Catch-up pass: every pivot row committed past the checkpoint is
    // re-read and upserted. Deletes that happened while offline surface
    // through the replication slot, so the checkpoint itself only moves
    // once those events have gone through the engine.
    let caught_up_to = catch_up(&pool, &tree, &indexer, &index, &checkpoint, &settings).await?;

    let tables: BTreeSet<(String, String)> = tree
        .tables()
        .into_iter()
        .map(|t| (t.schema, t.table))
        .collect();

    if !daemon {
        return one_shot(
            sync,
            pool,
            tree,
            indexer,
            index,
            checkpoint,
            tables,
            settings,
            caught_up_to,
        )
        .await;
    }

    let (event_tx, event_rx) = event_queue(settings.redis_write_chunk_size);

    let engine = SyncEngine::new(
        pool.clone(),
        tree,
        indexer,
        index.clone(),
        checkpoint,
        event_rx,
        settings.clone(),
    );
    let acked = engine.checkpoint_snapshot();

    let reader = ReplicationReader::new(
        pool.clone(),
        slot_name(&sync.database),
        tables.clone(),
        event_tx.clone(),
        acked,
        settings.logical_slot_chunk_size,
        settings.poll_timeout,
    );

    let listener_handle = tokio::spawn(listen_with_retry(
        pool.clone(),
        tables,
        event_tx,
        shutdown.clone(),
    ));
    let reader_handle = tokio::spawn(reader.run(shutdown.clone()));
    let engine_handle = tokio::spawn(engine.run(shutdown));

    let (listener_result, reader_result, engine_result) =
        tokio::join!(listener_handle, reader_handle, engine_handle);
    listener_result??;
    reader_result??;
    engine_result??;

    info!(index = %index, "sync stopped");
    Ok(())
}

/// Drain the replication slot once through the engine, so deletes and
/// truncates missed while offline are applied, then stop.
#[allow(clippy::too_many_arguments)]
async fn one_shot(
    sync: SyncDef,
    pool: PgPool,
    tree: Tree,
    indexer: Indexer,
    index: String,
    checkpoint: Checkpoint,
    tables: BTreeSet<(String, String)>,
    settings: Settings,
    caught_up_to: u64,
) -> Result<()> {
    let refresher = indexer.clone();
    let (_event_tx, event_rx) = event_queue(settings.redis_write_chunk_size);
    let mut engine = SyncEngine::new(
        pool.clone(),
        tree,
        indexer,
        index.clone(),
        checkpoint,
        event_rx,
        settings.clone(),
    );

    let slot = slot_name(&sync.database);
    loop {
        let peeked =
            crate::capture::peek_slot(&pool, &slot, &tables, settings.logical_slot_chunk_size)
                .await;
        let (wal_rows, events) = match peeked {
            Ok(batch) => batch,
            Err(crate::error::SourceError::ReplicationSlotGone(gone)) => {
                warn!(slot = %gone, "replication slot missing; run bootstrap to enable delete capture");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        if wal_rows == 0 {
            break;
        }
        if !events.is_empty() {
            engine.process_batch(events).await?;
        }
        crate::capture::advance_slot(&pool, &slot, wal_rows).await?;
    }

    // The slot is drained, so everything up to the catch-up window is now
    // durably indexed.
    loop {
        match engine.advance_checkpoint(caught_up_to) {
            Ok(_) => break,
            Err(e) => {
                warn!(error = %e, "checkpoint store unavailable, stalling");
                tokio::time::sleep(settings.redis_socket_timeout).await;
            }
        }
    }

    refresher.refresh(&index).await.ok();
    info!(index = %index, checkpoint = engine.checkpoint_snapshot().get(), "one-shot sync complete");
    Ok(())
}

/// Re-read and upsert every pivot row committed in `(txmin_committed,
/// txid_current]`. Returns the window's upper bound. The checkpoint is NOT
/// advanced here: WAL rows may still be sitting in the slot (deletes,
/// truncates), and the slot must not advance past events the engine has
/// not indexed.
async fn catch_up(
    pool: &PgPool,
    tree: &Tree,
    indexer: &Indexer,
    index: &str,
    checkpoint: &Checkpoint,
    settings: &Settings,
) -> Result<u64> {
    let txmax = current_txid(pool).await?;
    let txmin = checkpoint.get();
    let filter = Filter::Full {
        txmin: (txmin > 0).then_some(txmin as i64),
        txmax: Some(txmax as i64),
    };

    let stats = sync_documents(pool, tree, indexer, index, &filter, settings.query_chunk_size)
        .await
        .context("catch-up sync")?;
    info!(
        index,
        documents = stats.documents,
        skipped = stats.skipped,
        txmin,
        txmax,
        "catch-up complete"
    );
    Ok(txmax)
}

/// The listener must survive dropped connections; reconnect with a bounded
/// number of consecutive failures.
async fn listen_with_retry(
    pool: PgPool,
    tables: BTreeSet<(String, String)>,
    queue: mpsc::Sender<ChangeEvent>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut failures = 0u32;
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let listener =
            NotificationListener::connect(pool.clone(), tables.clone(), queue.clone()).await;
        let outcome = match listener {
            Ok(listener) => listener.run(shutdown.clone()).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => return Ok(()),
            Err(e) => {
                failures += 1;
                if failures > LISTENER_RETRY_LIMIT {
                    return Err(e);
                }
                warn!(error = %e, attempt = failures, "notification listener failed, reconnecting");
                tokio::time::sleep(LISTENER_RETRY_DELAY).await;
            }
        }
    }
}
