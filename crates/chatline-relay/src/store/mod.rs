//! Offline queue and per-conversation history.
//!
//! Both stores are synchronous; async callers go through [`blocking`].

mod memory;
mod sqlite;

pub use memory::{MemoryHistory, MemoryOfflineQueue};
pub use sqlite::SqliteStore;

use anyhow::{Context, Result};
use chatline::protocol::{ChatType, Envelope, Frame, MessageId, UserId};

/// Default cap on entries kept per history list.
pub const DEFAULT_HISTORY_LIMIT: usize = 200;

/// Identifies one directional history list: what `owner` sees of their
/// conversation with `counterpart` (a user or a group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub owner: UserId,
    pub chat_type: ChatType,
    pub counterpart: i64,
}

impl HistoryKey {
    pub fn new(owner: UserId, chat_type: ChatType, counterpart: i64) -> Self {
        Self {
            owner,
            chat_type,
            counterpart,
        }
    }
}

/// Per-user list of frames that could not be pushed live.
pub trait OfflineQueue: Send + Sync + 'static {
    fn push(&self, user_id: UserId, frame: &Frame) -> Result<()>;

    /// Remove and return every queued frame in append order, as one
    /// operation. Frames pushed concurrently land either in this batch or
    /// in the queue for the next one.
    fn take_all(&self, user_id: UserId) -> Result<Vec<Frame>>;

    fn len(&self, user_id: UserId) -> Result<usize>;
}

/// Bounded per-pair history of delivered envelopes.
pub trait HistoryStore: Send + Sync + 'static {
    /// Append, dropping the oldest entries beyond the store's cap.
    fn append(&self, key: &HistoryKey, envelope: &Envelope) -> Result<()>;

    /// Set `isremove` on the entry with `id`. Returns false if absent.
    fn mark_removed(&self, key: &HistoryKey, id: MessageId) -> Result<bool>;

    /// Up to `limit` most recent entries, oldest first.
    fn recent(&self, key: &HistoryKey, limit: usize) -> Result<Vec<Envelope>>;
}

/// Run store I/O on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("spawn_blocking failed")?
}
