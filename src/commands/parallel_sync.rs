//! `pgriver parallel-sync`: tuple-id paged full backfill.
//!
//! The pivot heap is split into block-range work units; N workers pull
//! units from a shared queue and stream their documents into the index. A
//! coordinator tracks the highest contiguous completed block and persists
//! it as the ctid checkpoint, so an interrupted backfill resumes where the
//! contiguous prefix ended.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::checkpoint::CtidCheckpoint;
use crate::db::connect_with_retry;
use crate::engine::sync_documents;
use crate::indexer::Indexer;
use crate::query::Filter;
use crate::settings::Settings;
use crate::tree::Tree;
use crate::{Cli, schema};

/// One work unit: pivot heap blocks `[start, end)`.
pub type WorkUnit = (u32, u32);

pub async fn cmd_parallel_sync(cli: &Cli, nprocs: usize, settings: Settings) -> Result<()> {
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
        let indexer = Arc::new(Indexer::new(&settings)?);
        let index = sync.index().to_string();

        let checkpoint_dir = settings
            .checkpoint_path
            .clone()
            .unwrap_or_else(|| ".".to_string());
        let checkpoint = CtidCheckpoint::new(checkpoint_dir, &sync.database, &index);
        let start_block = checkpoint.load()?.unwrap_or(0) as u32;

        let root = tree.root();
        let (relpages, reltuples): (i32, f32) = sqlx::query_as(
            "SELECT relpages, reltuples FROM pg_class WHERE oid = ($1::text)::regclass",
        )
        .bind(format!("\"{}\".\"{}\"", root.schema, root.table))
        .fetch_one(&pool)
        .await?;

        let units = plan_units(
            relpages.max(0) as u32,
            reltuples.max(0.0) as f64,
            settings.block_size,
            start_block,
        );
        if units.is_empty() {
            info!(index = %index, "nothing to backfill");
            continue;
        }
        info!(
            index = %index,
            units = units.len(),
            workers = nprocs,
            start_block,
            "parallel backfill starting"
        );

        // Reversed so popping serves the lowest blocks first and the
        // checkpoint watermark can follow the workers.
        let mut stack = units.clone();
        stack.reverse();
        let queue = Arc::new(Mutex::new(stack));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<WorkUnit>();

        let tree = Arc::new(tree);
        let mut workers = Vec::new();
        for worker_id in 0..nprocs.max(1) {
            let queue = Arc::clone(&queue);
            let tree = Arc::clone(&tree);
            let indexer = Arc::clone(&indexer);
            let pool = pool.clone();
            let index = index.clone();
            let done = done_tx.clone();
            let fetch_size = settings.query_chunk_size;

            workers.push(tokio::spawn(async move {
                loop {
                    let unit = { queue.lock().await.pop() };
                    let Some((start, end)) = unit else {
                        return anyhow::Ok(());
                    };
                    let filter = Filter::TupleRange {
                        start_block: start,
                        end_block: end,
                    };
                    let stats =
                        sync_documents(&pool, &tree, &indexer, &index, &filter, fetch_size)
                            .await
                            .with_context(|| {
                                format!("worker {worker_id} failed on blocks {start}..{end}")
                            })?;
                    tracing::debug!(worker_id, start, end, documents = stats.documents, "unit done");
                    done.send((start, end)).ok();
                }
            }));
        }
        drop(done_tx);

        // Coordinator: advance the contiguous watermark as units finish.
        let mut completed = BTreeSet::new();
        let mut watermark = start_block;
        while let Some(unit) = done_rx.recv().await {
            completed.insert(unit);
            let new_watermark = advance_watermark(watermark, &completed);
            if new_watermark > watermark {
                watermark = new_watermark;
                checkpoint.save(watermark as u64)?;
            }
        }

        for worker in workers {
            worker.await??;
        }

        checkpoint.save(watermark as u64)?;
        indexer.refresh(&index).await.ok();
        if watermark as u64 != expected_end(&units) {
            warn!(index = %index, watermark, "backfill finished with gaps; rerun to fill them");
        }
        info!(index = %index, watermark, "parallel backfill complete");
    }

    Ok(())
}

/// Split `[start_block, relpages]` into units of roughly `block_size` rows,
/// using the planner's rows-per-block estimate. The final unit overshoots
/// by one block so rows in the last partially-filled page are covered.
pub fn plan_units(relpages: u32, reltuples: f64, block_size: u64, start_block: u32) -> Vec<WorkUnit> {
    let end = relpages + 1;
    if start_block >= end {
        return Vec::new();
    }

    let rows_per_block = if relpages > 0 && reltuples > 0.0 {
        (reltuples / relpages as f64).ceil().max(1.0) as u64
    } else {
        1
    };
    let blocks_per_unit = (block_size / rows_per_block).max(1) as u32;

    let mut units = Vec::new();
    let mut cursor = start_block;
    while cursor < end {
        let unit_end = cursor.saturating_add(blocks_per_unit).min(end);
        units.push((cursor, unit_end));
        cursor = unit_end;
    }
    units
}

/// Highest block such that every block below it belongs to a completed
/// unit.
pub fn advance_watermark(current: u32, completed: &BTreeSet<WorkUnit>) -> u32 {
    let mut watermark = current;
    for &(start, end) in completed {
        if start > watermark {
            break;
        }
        if end > watermark {
            watermark = end;
        }
    }
    watermark
}

fn expected_end(units: &[WorkUnit]) -> u64 {
    units.last().map(|&(_, end)| end as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_units_covers_all_blocks() {
        // 100 pages, ~64 rows per page, 20480 rows per unit => 320 blocks
        // per unit => one unit covering everything.
        let units = plan_units(100, 6400.0, 20_480, 0);
        assert_eq!(units, vec![(0, 101)]);
    }

    #[test]
    fn test_plan_units_splits_large_tables() {
        // 1000 pages, 100 rows per page, 20480 rows per unit => 204 blocks.
        let units = plan_units(1000, 100_000.0, 20_480, 0);
        assert_eq!(units[0], (0, 204));
        assert_eq!(units[1], (204, 408));
        assert_eq!(units.last().unwrap().1, 1001);
        // Contiguous, no gaps.
        for pair in units.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn test_plan_units_resumes_from_checkpoint() {
        let units = plan_units(1000, 100_000.0, 20_480, 408);
        assert_eq!(units[0].0, 408);
    }

    #[test]
    fn test_plan_units_empty_when_done() {
        assert!(plan_units(100, 6400.0, 20_480, 101).is_empty());
    }

    #[test]
    fn test_watermark_requires_contiguity() {
        let mut completed = BTreeSet::new();
        completed.insert((204, 408));
        // Unit (0, 204) not done yet: watermark stays put.
        assert_eq!(advance_watermark(0, &completed), 0);

        completed.insert((0, 204));
        assert_eq!(advance_watermark(0, &completed), 408);
    }

    #[test]
    fn test_watermark_skips_nothing_after_gap() {
        let mut completed = BTreeSet::new();
        completed.insert((0, 10));
        completed.insert((20, 30));
        assert_eq!(advance_watermark(0, &completed), 10);
    }
}
