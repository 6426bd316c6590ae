use chatline::protocol::{ChatType, Envelope, Frame, FrameData, Tombstone, UserId};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::registry::SessionRegistry;
use crate::store::{HistoryKey, HistoryStore, OfflineQueue, blocking};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Pushed to the live connection and recorded in history.
    Live,
    /// Recipient offline; appended to their queue.
    Queued,
    /// Failed and logged. Not retried.
    Dropped,
}

/// History key under which `owner` keeps a message between `from_id` and
/// `to_id`. Received messages, group ones included, are filed under the
/// sender; a sender's own direct copy is filed under the recipient.
pub fn history_key(owner: UserId, chat_type: ChatType, from_id: UserId, to_id: i64) -> HistoryKey {
    let counterpart = match chat_type {
        ChatType::User if owner == from_id => to_id,
        ChatType::User | ChatType::Group => from_id,
    };
    HistoryKey::new(owner, chat_type, counterpart)
}

fn envelope_key(owner: UserId, envelope: &Envelope) -> HistoryKey {
    history_key(owner, envelope.chat_type, envelope.from_id, envelope.to_id)
}

fn tombstone_key(owner: UserId, tombstone: &Tombstone) -> HistoryKey {
    history_key(owner, tombstone.chat_type, tombstone.from_id, tombstone.to_id)
}

/// Decides live push vs offline queue for every frame sent to a user.
pub struct DeliveryRouter {
    registry: Arc<SessionRegistry>,
    offline: Arc<dyn OfflineQueue>,
    history: Arc<dyn HistoryStore>,
}

impl DeliveryRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        offline: Arc<dyn OfflineQueue>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            registry,
            offline,
            history,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Deliver `frame` to `recipient`. Never fails: errors are logged here
    /// and reported as [`DeliveryOutcome::Dropped`].
    pub async fn deliver(&self, recipient: UserId, frame: Frame) -> DeliveryOutcome {
        let label = frame.msg;
        match self.try_deliver(recipient, frame).await {
            Ok(outcome) => {
                debug!(recipient, ?label, ?outcome, "frame delivered");
                outcome
            }
            Err(e) => {
                warn!(recipient, ?label, error = %e, "delivery failed");
                DeliveryOutcome::Dropped
            }
        }
    }

    async fn try_deliver(&self, recipient: UserId, frame: Frame) -> Result<DeliveryOutcome, RelayError> {
        // The session may appear right after this lookup; the frame is then
        // queued and handed over on the next replay.
        match self.registry.lookup(recipient) {
            Some(handle) => {
                handle.push(frame.clone()).await?;
                self.record(recipient, frame).await?;
                Ok(DeliveryOutcome::Live)
            }
            None => {
                let offline = self.offline.clone();
                blocking(move || offline.push(recipient, &frame)).await?;
                Ok(DeliveryOutcome::Queued)
            }
        }
    }

    /// Reflect a frame the recipient has seen in their history.
    async fn record(&self, recipient: UserId, frame: Frame) -> anyhow::Result<()> {
        let history = self.history.clone();
        match frame.data {
            Some(FrameData::Envelope(envelope)) => {
                let key = envelope_key(recipient, &envelope);
                blocking(move || history.append(&key, &envelope)).await
            }
            Some(FrameData::Tombstone(tombstone)) => {
                let key = tombstone_key(recipient, &tombstone);
                blocking(move || history.mark_removed(&key, tombstone.id).map(|_| ())).await
            }
            _ => Ok(()),
        }
    }

    /// Drain `user_id`'s offline queue and push it to their live connection.
    ///
    /// The batch is taken in one store operation and returned whether or not
    /// the push succeeds; frames are not re-queued.
    pub async fn replay(&self, user_id: UserId) -> Result<Vec<Frame>, RelayError> {
        let offline = self.offline.clone();
        let frames = blocking(move || offline.take_all(user_id)).await?;
        if frames.is_empty() {
            return Ok(frames);
        }

        match self.registry.lookup(user_id) {
            Some(handle) => {
                for frame in &frames {
                    let pushed = match handle.push(frame.clone()).await {
                        Ok(()) => self.record(user_id, frame.clone()).await.map_err(RelayError::from),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = pushed {
                        warn!(user_id, error = %e, "replay push failed");
                    }
                }
            }
            None => debug!(user_id, count = frames.len(), "replayed without live session"),
        }
        debug!(user_id, count = frames.len(), "offline queue drained");
        Ok(frames)
    }

    /// Push-only signal; dropped if the user is offline.
    pub async fn notify(&self, user_id: UserId, frame: Frame) -> bool {
        let Some(handle) = self.registry.lookup(user_id) else {
            return false;
        };
        match handle.push(frame).await {
            Ok(()) => true,
            Err(e) => {
                debug!(user_id, error = %e, "notify failed");
                false
            }
        }
    }

    /// File the sender's own copy of an envelope. Store failures are logged
    /// and reported as `false`; the message has already been routed.
    pub async fn keep_copy(&self, owner: UserId, envelope: Envelope) -> bool {
        let history = self.history.clone();
        let key = envelope_key(owner, &envelope);
        let message_id = envelope.id;
        match blocking(move || history.append(&key, &envelope)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(owner, message_id, error = %e, "failed to keep sender copy");
                false
            }
        }
    }

    /// Mark the sender's own copy of a recalled message. Returns whether a
    /// copy was marked; store failures are logged and reported as `false`.
    pub async fn mark_copy_removed(&self, owner: UserId, tombstone: Tombstone) -> bool {
        let history = self.history.clone();
        let key = tombstone_key(owner, &tombstone);
        match blocking(move || history.mark_removed(&key, tombstone.id)).await {
            Ok(marked) => marked,
            Err(e) => {
                warn!(owner, message_id = tombstone.id, error = %e, "failed to mark sender copy");
                false
            }
        }
    }

    pub async fn history(&self, key: HistoryKey, limit: usize) -> anyhow::Result<Vec<Envelope>> {
        let history = self.history.clone();
        blocking(move || history.recent(&key, limit)).await
    }

    pub async fn queued(&self, user_id: UserId) -> anyhow::Result<usize> {
        let offline = self.offline.clone();
        blocking(move || offline.len(user_id)).await
    }
}
