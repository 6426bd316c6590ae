use chatline::protocol::{Frame, GroupSnapshot, UserId};
use std::sync::Arc;

use crate::delivery::{DeliveryOutcome, DeliveryRouter};

/// Per-outcome counts of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub attempted: usize,
    pub live: usize,
    pub queued: usize,
    pub dropped: usize,
}

impl FanoutReport {
    fn record(&mut self, outcome: DeliveryOutcome) {
        self.attempted += 1;
        match outcome {
            DeliveryOutcome::Live => self.live += 1,
            DeliveryOutcome::Queued => self.queued += 1,
            DeliveryOutcome::Dropped => self.dropped += 1,
        }
    }
}

/// Expands a group snapshot into one delivery per member.
pub struct GroupFanout {
    router: Arc<DeliveryRouter>,
}

impl GroupFanout {
    pub fn new(router: Arc<DeliveryRouter>) -> Self {
        Self { router }
    }

    /// Deliver `frame` to every member of `group` except `exclude`, one at a
    /// time in member order. Membership changes after the snapshot was read
    /// are not seen.
    pub async fn fanout(&self, group: &GroupSnapshot, frame: &Frame, exclude: Option<UserId>) -> FanoutReport {
        let mut report = FanoutReport::default();
        for member in &group.members {
            if Some(member.user_id) == exclude {
                continue;
            }
            let outcome = self.router.deliver(member.user_id, frame.clone()).await;
            report.record(outcome);
        }
        tracing::debug!(
            group_id = group.id,
            attempted = report.attempted,
            live = report.live,
            queued = report.queued,
            dropped = report.dropped,
            "group fan-out"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, SessionRegistry};
    use crate::store::{MemoryHistory, MemoryOfflineQueue};
    use chatline::protocol::GroupMember;

    fn group(members: &[UserId]) -> GroupSnapshot {
        GroupSnapshot {
            id: 100,
            name: "crew".to_string(),
            avatar: String::new(),
            owner_id: members[0],
            active: true,
            members: members
                .iter()
                .map(|&user_id| GroupMember {
                    user_id,
                    nickname: None,
                })
                .collect(),
        }
    }

    fn fanout() -> (GroupFanout, Arc<DeliveryRouter>) {
        let router = Arc::new(DeliveryRouter::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(MemoryOfflineQueue::new()),
            Arc::new(MemoryHistory::default()),
        ));
        (GroupFanout::new(router.clone()), router)
    }

    #[tokio::test]
    async fn excludes_sender() {
        let (fanout, router) = fanout();
        let (handle, mut out) = ConnectionHandle::channel(8);
        router.registry().connect(2, handle);

        let report = fanout
            .fanout(&group(&[1, 2, 3, 4]), &Frame::fail("ping"), Some(1))
            .await;
        assert_eq!(
            report,
            FanoutReport {
                attempted: 3,
                live: 1,
                queued: 2,
                dropped: 0
            }
        );
        assert!(out.rx.try_recv().is_ok());
        assert_eq!(router.queued(1).await.unwrap(), 0);
        assert_eq!(router.queued(3).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn no_exclusion_reaches_everyone() {
        let (fanout, router) = fanout();
        let report = fanout
            .fanout(&group(&[1, 2, 3]), &Frame::fail("ping"), None)
            .await;
        assert_eq!(report.attempted, 3);
        assert_eq!(router.queued(1).await.unwrap(), 1);
    }
}
