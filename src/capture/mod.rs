//! Change capture: two ingestion surfaces feeding one ordered queue.
//!
//! The notification listener covers the live trigger path; the replication
//! reader covers startup catch-up and anything the trigger path missed.
//! Both are strictly append-only; the sync engine is the sole consumer.

use tokio::sync::mpsc;

pub mod event;
pub mod listener;
pub mod replication;

pub use event::{ChangeEvent, JsonMap, TgOp};
pub use listener::NotificationListener;
pub use replication::{ReplicationReader, advance_slot, peek_slot, slot_name};

/// The bounded many-writer-one-reader event queue.
pub fn event_queue(capacity: usize) -> (mpsc::Sender<ChangeEvent>, mpsc::Receiver<ChangeEvent>) {
    mpsc::channel(capacity.max(1))
}
