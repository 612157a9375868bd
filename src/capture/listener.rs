//! Notification listener worker.
//!
//! Blocks on the database notification channel and appends every relevant
//! payload to the event queue, stamped with the current transaction id.
//! Notifications arrive after commit, so `txid_current()` is an upper
//! bound on the committing transaction; the replication path provides the
//! precise ids when it matters.

use std::collections::BTreeSet;

use anyhow::Result;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::capture::event::ChangeEvent;
use crate::settings::NOTIFY_CHANNEL;

pub struct NotificationListener {
    pool: PgPool,
    listener: PgListener,
    tables: BTreeSet<(String, String)>,
    queue: mpsc::Sender<ChangeEvent>,
}

impl NotificationListener {
    pub async fn connect(
        pool: PgPool,
        tables: BTreeSet<(String, String)>,
        queue: mpsc::Sender<ChangeEvent>,
    ) -> Result<Self> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        Ok(Self {
            pool,
            listener,
            tables,
            queue,
        })
    }

    /// Runs until shutdown. The receive itself carries no timeout; this
    /// worker stays blocked on the channel indefinitely.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("notification listener shutting down");
                    return Ok(());
                }
                notification = self.listener.recv() => {
                    let notification = notification?;
                    self.handle(notification.payload()).await?;
                }
            }
        }
    }

    async fn handle(&mut self, payload: &str) -> Result<()> {
        let xmin: i64 = sqlx::query_scalar("SELECT txid_current()")
            .fetch_one(&self.pool)
            .await?;

        let event = match ChangeEvent::from_notification(payload, xmin as u64) {
            Ok(event) => event,
            Err(e) => {
                // A bad payload is reported, never fatal to the listener.
                warn!(error = %e, "dropping unparseable notification");
                return Ok(());
            }
        };

        if !self
            .tables
            .contains(&(event.schema.clone(), event.table.clone()))
        {
            return Ok(());
        }

        debug!(op = %event.tg_op, table = %event.table, "notification received");
        // Bounded queue: blocking here is the backpressure.
        self.queue.send(event).await?;
        Ok(())
    }
}
