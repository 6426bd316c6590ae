use chatline::protocol::{Frame, UserId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

/// Notice pushed to a connection replaced by a newer login of the same user.
pub const EVICTION_NOTICE: &str = "account signed in on another device";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Sending half of a live connection, held by the registry.
///
/// Cloning is cheap; all clones refer to the same socket.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::Sender<Frame>,
    close: CancellationToken,
}

/// Receiving half, owned by the connection's writer task.
#[derive(Debug)]
pub struct Outbound {
    pub rx: mpsc::Receiver<Frame>,
    pub close: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle with a bounded outbound queue of `buffer` frames.
    pub fn channel(buffer: usize) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let close = CancellationToken::new();
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            close: close.clone(),
        };
        (handle, Outbound { rx, close })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.tx.is_closed()
    }

    /// Queue a frame for the socket writer.
    pub async fn push(&self, frame: Frame) -> Result<(), RelayError> {
        if self.close.is_cancelled() {
            return Err(RelayError::ConnectionClosed(self.id));
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| RelayError::ConnectionClosed(self.id))
    }

    /// Best-effort notice followed by close. Never suspends.
    fn evict(&self) {
        if self.tx.try_send(Frame::fail(EVICTION_NOTICE)).is_err() {
            tracing::debug!(connection_id = self.id, "eviction notice not queued");
        }
        self.close.cancel();
    }
}

/// Tracks the single live connection of every online user.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<UserId, ConnectionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the user's session. Returns true if an older
    /// session was evicted.
    ///
    /// The eviction runs while the map entry is locked, so concurrent
    /// connects for one user always leave exactly one handle installed.
    pub fn connect(&self, user_id: UserId, handle: ConnectionHandle) -> bool {
        let connection_id = handle.id;
        let evicted = match self.sessions.entry(user_id) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(handle);
                previous.evict();
                tracing::info!(
                    user_id,
                    connection_id,
                    evicted_connection_id = previous.id,
                    "session replaced"
                );
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                false
            }
        };
        if !evicted {
            tracing::info!(user_id, connection_id, "session connected");
        }
        evicted
    }

    /// Remove the user's session, but only if it is still `connection_id`.
    pub fn disconnect(&self, user_id: UserId, connection_id: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(&user_id, |_, handle| handle.id == connection_id)
            .is_some();
        if removed {
            tracing::info!(user_id, connection_id, "session disconnected");
        }
        removed
    }

    /// Current handle for a user, cloned so the caller doesn't hold the map entry.
    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.sessions.get(&user_id).map(|r| r.value().clone())
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.sessions.contains_key(&user_id)
    }

    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatline::protocol::{FrameData, Label};
    use std::sync::Arc;

    #[test]
    fn connect_and_lookup() {
        let registry = SessionRegistry::new();
        let (handle, _out) = ConnectionHandle::channel(4);
        let id = handle.id();
        assert!(!registry.connect(1, handle));
        assert_eq!(registry.lookup(1).unwrap().id(), id);
        assert!(registry.lookup(2).is_none());
        assert!(registry.is_online(1));
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn reconnect_evicts_previous_with_notice() {
        let registry = SessionRegistry::new();
        let (first, mut first_out) = ConnectionHandle::channel(4);
        let (second, _second_out) = ConnectionHandle::channel(4);
        let second_id = second.id();

        registry.connect(1, first);
        assert!(registry.connect(1, second));

        let notice = first_out.rx.try_recv().unwrap();
        assert_eq!(notice.msg, Label::Fail);
        assert_eq!(
            notice.data,
            Some(FrameData::Notice(EVICTION_NOTICE.to_string()))
        );
        assert!(first_out.close.is_cancelled());
        assert_eq!(registry.lookup(1).unwrap().id(), second_id);
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn stale_disconnect_is_ignored() {
        let registry = SessionRegistry::new();
        let (first, _a) = ConnectionHandle::channel(4);
        let (second, _b) = ConnectionHandle::channel(4);
        let first_id = first.id();
        let second_id = second.id();

        registry.connect(1, first);
        registry.connect(1, second);

        assert!(!registry.disconnect(1, first_id));
        assert_eq!(registry.lookup(1).unwrap().id(), second_id);
        assert!(registry.disconnect(1, second_id));
        assert!(registry.lookup(1).is_none());
    }

    #[test]
    fn eviction_with_full_buffer_still_closes() {
        let registry = SessionRegistry::new();
        let (first, first_out) = ConnectionHandle::channel(1);
        first.tx.try_send(Frame::fail("filler")).unwrap();
        registry.connect(1, first);

        let (second, _b) = ConnectionHandle::channel(1);
        registry.connect(1, second);
        assert!(first_out.close.is_cancelled());
    }

    #[tokio::test]
    async fn push_to_closed_connection_fails() {
        let (handle, out) = ConnectionHandle::channel(4);
        drop(out);
        let err = handle.push(Frame::fail("x")).await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_connects_leave_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, out) = ConnectionHandle::channel(4);
                let id = handle.id();
                registry.connect(7, handle);
                (id, out)
            }));
        }

        let mut outs = Vec::new();
        for task in tasks {
            outs.push(task.await.unwrap());
        }

        assert_eq!(registry.online_count(), 1);
        let live_id = registry.lookup(7).unwrap().id();
        let still_open: Vec<u64> = outs
            .iter()
            .filter(|(_, out)| !out.close.is_cancelled())
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(still_open, vec![live_id]);

        for (id, out) in outs.iter_mut() {
            if *id != live_id {
                assert_eq!(out.rx.try_recv().unwrap().msg, Label::Fail);
            }
        }
    }
}
