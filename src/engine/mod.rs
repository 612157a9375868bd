//! The sync engine: sole consumer of the event queue, sole writer of the
//! checkpoint.
//!
//! Each cycle drains a batch, resolves the affected pivot keys, re-reads
//! the current document state through the synthesizer, pushes bulk
//! actions, and advances `txmin_committed` once the indexer acknowledged
//! everything. Indexer failures quarantine the batch and freeze the
//! checkpoint; transient source failures retry with bounded backoff and
//! then halt the engine.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::capture::ChangeEvent;
use crate::checkpoint::{Checkpoint, CheckpointSnapshot};
use crate::error::IndexerError;
use crate::indexer::{BulkAction, Indexer};
use crate::query::{DocumentCursor, Filter, PivotKey, Synthesizer, canonical_id, chunk_keys};
use crate::settings::Settings;
use crate::transform;
use crate::tree::Tree;

pub mod affected;

const SOURCE_RETRY_LIMIT: u32 = 5;
const SOURCE_RETRY_INITIAL: Duration = Duration::from_secs(1);
const SOURCE_RETRY_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Draining,
    Querying,
    Indexing,
    Checkpointing,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub documents: u64,
    pub skipped: u64,
    pub max_txid: i64,
}

/// Stream every document matching the filter into the index. Shared by the
/// engine's pointed sync, the one-shot full sync, and parallel backfill
/// workers.
pub async fn sync_documents(
    pool: &PgPool,
    tree: &Tree,
    indexer: &Indexer,
    index: &str,
    filter: &Filter,
    fetch_size: usize,
) -> Result<SyncStats> {
    let sql = Synthesizer::new(tree).document_query(filter);
    let mut cursor = DocumentCursor::open(pool, &sql, fetch_size).await?;
    let mut stats = SyncStats::default();

    loop {
        let rows = cursor.next_batch().await?;
        if rows.is_empty() {
            break;
        }

        let mut actions = Vec::with_capacity(rows.len());
        for row in rows {
            let id = canonical_id(&row.key);
            stats.max_txid = stats.max_txid.max(row.txid);
            let mut document = row.document;
            match transform::apply_document(tree, &mut document) {
                Ok(()) => actions.push(BulkAction::Index { id, document }),
                Err(e) => {
                    // Per-document data error: report, skip, keep going.
                    error!(index, document_id = %id, error = %e, "skipping document");
                    stats.skipped += 1;
                }
            }
        }

        stats.documents += actions.len() as u64;
        indexer.bulk(index, &actions).await?;
    }

    cursor.close().await?;
    Ok(stats)
}

/// How one batch application failed.
enum BatchError {
    /// The indexer rejected the batch after its own retries.
    Indexer(IndexerError),
    /// The source database failed; retried by the engine, then fatal.
    Source(anyhow::Error),
}

struct QuarantinedBatch {
    at: DateTime<Utc>,
    events: usize,
    reason: String,
}

pub struct SyncEngine {
    pool: PgPool,
    tree: Tree,
    indexer: Indexer,
    index: String,
    checkpoint: Checkpoint,
    queue: mpsc::Receiver<ChangeEvent>,
    settings: Settings,
    state: EngineState,
    quarantined: Vec<QuarantinedBatch>,
}

impl SyncEngine {
    pub fn new(
        pool: PgPool,
        tree: Tree,
        indexer: Indexer,
        index: String,
        checkpoint: Checkpoint,
        queue: mpsc::Receiver<ChangeEvent>,
        settings: Settings,
    ) -> Self {
        Self {
            pool,
            tree,
            indexer,
            index,
            checkpoint,
            queue,
            settings,
            state: EngineState::Idle,
            quarantined: Vec::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn checkpoint_snapshot(&self) -> CheckpointSnapshot {
        self.checkpoint.snapshot()
    }

    /// Direct checkpoint write for drivers that sequence batches
    /// themselves (one-shot slot drain).
    pub(crate) fn advance_checkpoint(&self, txid: u64) -> Result<bool, crate::error::BrokerError> {
        self.checkpoint.advance(txid)
    }

    /// Run until shutdown. Cancellation is honored between states only;
    /// the batch in flight always completes and checkpoints first.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(index = %self.index, "sync engine started");
        loop {
            self.state = EngineState::Draining;
            let events = self.drain(&mut shutdown).await;

            if !events.is_empty() {
                self.process_batch(events).await?;
            }

            if *shutdown.borrow() {
                break;
            }
        }
        self.state = EngineState::Idle;
        info!(index = %self.index, checkpoint = self.checkpoint.get(), "sync engine stopped");
        Ok(())
    }

    /// Pull up to one read chunk off the queue, waiting at most the poll
    /// timeout for the first event.
    async fn drain(&mut self, shutdown: &mut watch::Receiver<bool>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();

        tokio::select! {
            _ = shutdown.changed() => {}
            received = self.queue.recv() => {
                if let Some(event) = received {
                    events.push(event);
                }
            }
            _ = tokio::time::sleep(self.settings.poll_timeout) => {}
        }

        while events.len() < self.settings.redis_read_chunk_size {
            match self.queue.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        events
    }

    pub(crate) async fn process_batch(&mut self, events: Vec<ChangeEvent>) -> Result<()> {
        self.state = EngineState::Querying;
        debug!(index = %self.index, events = events.len(), "processing batch");

        let mut resolution = affected::resolve(&self.tree, &events);
        // A full re-sync covers every pivot anyway; skip the rooting
        // queries in that case.
        if !resolution.full_resync {
            for chain in std::mem::take(&mut resolution.pending) {
                let sql = chain.sql(self.tree.root());
                let keys = self.fetch_pivot_keys(&sql).await?;
                resolution.upserts.extend(keys);
            }
        }
        dedup_keys(&mut resolution.upserts);

        self.state = EngineState::Indexing;
        let mut attempts = 0u32;
        let mut backoff = SOURCE_RETRY_INITIAL;
        loop {
            match self.apply(&resolution).await {
                Ok(()) => break,
                Err(BatchError::Indexer(e)) => {
                    // Retries are exhausted by the time the failure reaches
                    // this point; freeze the checkpoint so restart replays
                    // the batch.
                    error!(index = %self.index, error = %e, "batch quarantined");
                    self.quarantined.push(QuarantinedBatch {
                        at: Utc::now(),
                        events: events.len(),
                        reason: e.to_string(),
                    });
                    return Ok(());
                }
                Err(BatchError::Source(e)) => {
                    attempts += 1;
                    if attempts > SOURCE_RETRY_LIMIT {
                        return Err(e.context("source database failed while applying batch"));
                    }
                    warn!(index = %self.index, attempt = attempts, error = %e, "source error, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(SOURCE_RETRY_MAX);
                }
            }
        }

        self.state = EngineState::Checkpointing;
        if self.quarantined.is_empty() {
            let max_xmin = events.iter().map(|e| e.xmin).max().unwrap_or(0);
            self.persist_checkpoint(max_xmin).await;
        } else {
            for batch in &self.quarantined {
                warn!(
                    index = %self.index,
                    since = %batch.at,
                    events = batch.events,
                    reason = %batch.reason,
                    "checkpoint frozen by quarantined batch"
                );
            }
        }

        self.state = EngineState::Idle;
        Ok(())
    }

    async fn apply(&self, resolution: &affected::Resolution) -> Result<(), BatchError> {
        if resolution.truncate_root {
            self.indexer
                .delete_all(&self.index)
                .await
                .map_err(BatchError::Indexer)?;
        }

        if !resolution.deletes.is_empty() {
            let actions: Vec<BulkAction> = resolution
                .deletes
                .iter()
                .map(|id| BulkAction::Delete { id: id.clone() })
                .collect();
            self.indexer
                .bulk(&self.index, &actions)
                .await
                .map_err(BatchError::Indexer)?;
        }

        if resolution.full_resync {
            self.sync_filtered(&Filter::full()).await?;
        } else if !resolution.upserts.is_empty() {
            for chunk in chunk_keys(resolution.upserts.clone(), self.settings.filter_chunk_size) {
                self.sync_filtered(&Filter::Keys(chunk)).await?;
            }
        }
        Ok(())
    }

    async fn sync_filtered(&self, filter: &Filter) -> Result<(), BatchError> {
        match sync_documents(
            &self.pool,
            &self.tree,
            &self.indexer,
            &self.index,
            filter,
            self.settings.query_chunk_size,
        )
        .await
        {
            Ok(stats) => {
                debug!(
                    index = %self.index,
                    documents = stats.documents,
                    skipped = stats.skipped,
                    "documents indexed"
                );
                Ok(())
            }
            Err(e) => match e.downcast::<IndexerError>() {
                Ok(indexer_error) => Err(BatchError::Indexer(indexer_error)),
                Err(source_error) => Err(BatchError::Source(source_error)),
            },
        }
    }

    async fn fetch_pivot_keys(&self, sql: &str) -> Result<Vec<PivotKey>> {
        let mut attempts = 0u32;
        let mut backoff = SOURCE_RETRY_INITIAL;
        loop {
            match sqlx::query_as::<_, (JsonValue,)>(sql).fetch_all(&self.pool).await {
                Ok(rows) => {
                    return Ok(rows
                        .into_iter()
                        .filter_map(|(key,)| key.as_array().cloned())
                        .collect());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts > SOURCE_RETRY_LIMIT {
                        return Err(anyhow::Error::from(e).context("resolving affected pivot keys"));
                    }
                    warn!(index = %self.index, attempt = attempts, error = %e, "pivot key query failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(SOURCE_RETRY_MAX);
                }
            }
        }
    }

    /// The broker contract: never drop a checkpoint write, stall instead.
    async fn persist_checkpoint(&self, max_xmin: u64) {
        loop {
            match self.checkpoint.advance(max_xmin) {
                Ok(moved) => {
                    if moved {
                        debug!(index = %self.index, txmin_committed = max_xmin, "checkpoint advanced");
                    }
                    return;
                }
                Err(e) => {
                    warn!(index = %self.index, error = %e, "checkpoint store unavailable, stalling");
                    tokio::time::sleep(self.settings.redis_socket_timeout).await;
                }
            }
        }
    }
}

fn dedup_keys(keys: &mut Vec<PivotKey>) {
    let mut seen = std::collections::BTreeSet::new();
    keys.retain(|key| seen.insert(serde_json::to_string(key).unwrap_or_default()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::books_catalog;
    use crate::checkpoint::FileCheckpointStore;
    use crate::schema::parse;
    use serde_json::json;

    #[test]
    fn test_dedup_keys_preserves_order() {
        let mut keys = vec![
            vec![json!("b")],
            vec![json!("a")],
            vec![json!("b")],
            vec![json!("a"), json!(1)],
        ];
        dedup_keys(&mut keys);
        assert_eq!(
            keys,
            vec![vec![json!("b")], vec![json!("a")], vec![json!("a"), json!(1)]]
        );
    }

    #[tokio::test]
    async fn test_engine_starts_idle_with_shared_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::open(
            Box::new(FileCheckpointStore::new(dir.path())),
            "books",
            "books",
        )
        .unwrap();
        checkpoint.advance(42).unwrap();

        let syncs = parse(crate::tree::tests::BOOKS_SCHEMA).unwrap();
        let tree = Tree::build(&syncs[0], &books_catalog()).unwrap();
        let settings = Settings::default();
        let pool = PgPool::connect_lazy("postgres://postgres@localhost:5432/books").unwrap();
        let (_tx, rx) = crate::capture::event_queue(16);

        let engine = SyncEngine::new(
            pool,
            tree,
            Indexer::new(&settings).unwrap(),
            "books".to_string(),
            checkpoint,
            rx,
            settings,
        );
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.checkpoint_snapshot().get(), 42);
    }
}
