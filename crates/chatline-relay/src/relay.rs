use chatline::protocol::{
    ChatType, Envelope, Frame, GroupEvent, GroupEventKind, GroupSnapshot, RecallRequest,
    SendRequest, Tombstone, UserId,
};
use std::sync::Arc;
use tracing::info;

use crate::delivery::{DeliveryOutcome, DeliveryRouter};
use crate::directory::{Directory, UserProfile};
use crate::envelope::{Content, EnvelopeBuilder, Party, notice};
use crate::error::RelayError;
use crate::fanout::GroupFanout;
use crate::registry::{ConnectionHandle, SessionRegistry};
use crate::store::{
    DEFAULT_HISTORY_LIMIT, HistoryKey, HistoryStore, MemoryHistory, MemoryOfflineQueue,
    OfflineQueue, blocking,
};

/// Page size of a history read without an explicit limit.
const DEFAULT_HISTORY_PAGE: usize = 50;

/// Request-level operations of the relay.
///
/// Boundary checks (friendship, membership, account state) run here before
/// anything reaches the delivery path.
pub struct Relay {
    pub(crate) directory: Arc<dyn Directory>,
    pub(crate) router: Arc<DeliveryRouter>,
    pub(crate) fanout: GroupFanout,
    pub(crate) builder: EnvelopeBuilder,
    history_limit: usize,
}

impl Relay {
    pub fn new(
        directory: Arc<dyn Directory>,
        offline: Arc<dyn OfflineQueue>,
        history: Arc<dyn HistoryStore>,
        history_limit: usize,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(DeliveryRouter::new(registry, offline, history));
        Self {
            directory,
            fanout: GroupFanout::new(router.clone()),
            router,
            builder: EnvelopeBuilder::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Relay with process-memory stores.
    pub fn in_memory(directory: Arc<dyn Directory>) -> Self {
        Self::new(
            directory,
            Arc::new(MemoryOfflineQueue::new()),
            Arc::new(MemoryHistory::new(DEFAULT_HISTORY_LIMIT)),
            DEFAULT_HISTORY_LIMIT,
        )
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.router.registry()
    }

    pub fn router(&self) -> &Arc<DeliveryRouter> {
        &self.router
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Check that `user_id` may hold a live connection.
    pub async fn admit(&self, user_id: UserId) -> Result<UserProfile, RelayError> {
        let profile = self
            .user(user_id)
            .await?
            .ok_or_else(|| RelayError::Unauthorized("user does not exist".to_string()))?;
        if !profile.enabled {
            return Err(RelayError::Forbidden("account is disabled".to_string()));
        }
        Ok(profile)
    }

    pub fn connect(&self, user_id: UserId, handle: ConnectionHandle) -> bool {
        self.registry().connect(user_id, handle)
    }

    pub fn disconnect(&self, user_id: UserId, connection_id: u64) -> bool {
        self.registry().disconnect(user_id, connection_id)
    }

    pub fn online_count(&self) -> usize {
        self.registry().online_count()
    }

    // -----------------------------------------------------------------------
    // Directory reads
    // -----------------------------------------------------------------------

    pub(crate) async fn read<T, F>(&self, f: F) -> Result<T, RelayError>
    where
        F: FnOnce(&dyn Directory) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let directory = self.directory.clone();
        Ok(blocking(move || f(directory.as_ref())).await?)
    }

    pub async fn user(&self, id: UserId) -> Result<Option<UserProfile>, RelayError> {
        self.read(move |d| d.user(id)).await
    }

    async fn active_group(&self, id: i64) -> Result<Option<GroupSnapshot>, RelayError> {
        let group = self.read(move |d| d.group(id)).await?;
        Ok(group.filter(|g| g.active))
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Build and route a user message. Returns the envelope as acknowledgement.
    pub async fn send(&self, sender: UserId, request: SendRequest) -> Result<Envelope, RelayError> {
        if !request.kind.is_user_authored() {
            return Err(RelayError::InvalidRequest(
                "system messages cannot be sent by users".to_string(),
            ));
        }
        if request.data.is_empty() {
            return Err(RelayError::InvalidRequest("message data is empty".to_string()));
        }
        let content = Content::new(request.kind, request.data, request.options.as_deref())?;
        let profile = self.admit(sender).await?;

        match request.chat_type {
            ChatType::User => self.send_direct(&profile, request.to_id, content).await,
            ChatType::Group => self.send_group(&profile, request.to_id, content).await,
        }
    }

    async fn send_direct(
        &self,
        sender: &UserProfile,
        to_id: UserId,
        content: Content,
    ) -> Result<Envelope, RelayError> {
        let sender_id = sender.id;
        let (their_record, recipient, our_record) = self
            .read(move |d| {
                Ok((
                    d.friendship(to_id, sender_id)?,
                    d.user(to_id)?,
                    d.friendship(sender_id, to_id)?,
                ))
            })
            .await?;

        let their_record = their_record
            .filter(|f| !f.blacklisted)
            .ok_or_else(|| RelayError::NotFound("recipient not found or has blocked you".to_string()))?;
        let recipient = recipient
            .filter(|u| u.enabled)
            .ok_or_else(|| RelayError::NotFound("recipient not found or disabled".to_string()))?;

        let from = Party::user(sender, their_record.nickname.as_deref());
        let to = Party::user(
            &recipient,
            our_record.as_ref().and_then(|f| f.nickname.as_deref()),
        );
        let envelope = self.builder.direct(&from, &to, content);

        let outcome = self.router.deliver(to_id, Frame::ok(envelope.clone())).await;
        let kept = self.router.keep_copy(sender_id, envelope.clone()).await;
        info!(
            from_id = sender_id,
            to_id,
            message_id = envelope.id,
            ?outcome,
            kept,
            "direct message sent"
        );
        Ok(envelope)
    }

    async fn send_group(
        &self,
        sender: &UserProfile,
        group_id: i64,
        content: Content,
    ) -> Result<Envelope, RelayError> {
        let group = self
            .active_group(group_id)
            .await?
            .ok_or_else(|| RelayError::NotFound("group not found or dissolved".to_string()))?;
        let member = group
            .member(sender.id)
            .ok_or_else(|| RelayError::Forbidden("you are not a member of this group".to_string()))?;

        let from = Party::user(sender, member.nickname.as_deref());
        let envelope = self.builder.group(&from, &Party::group(&group), content);

        let report = self
            .fanout
            .fanout(&group, &Frame::ok(envelope.clone()), Some(sender.id))
            .await;
        info!(
            from_id = sender.id,
            group_id,
            message_id = envelope.id,
            attempted = report.attempted,
            "group message sent"
        );
        Ok(envelope)
    }

    /// Route a tombstone to the recipients of the original message.
    ///
    /// Neither the message nor its ownership is checked.
    pub async fn recall(&self, actor: UserId, request: RecallRequest) -> Result<Tombstone, RelayError> {
        let tombstone = Tombstone {
            from_id: actor,
            to_id: request.to_id,
            chat_type: request.chat_type,
            id: request.id,
        };

        match request.chat_type {
            ChatType::User => {
                let outcome = self
                    .router
                    .deliver(request.to_id, Frame::recall(tombstone))
                    .await;
                let marked = self.router.mark_copy_removed(actor, tombstone).await;
                info!(from_id = actor, to_id = request.to_id, message_id = request.id, ?outcome, marked, "message recalled");
            }
            ChatType::Group => match self.active_group(request.to_id).await? {
                Some(group) => {
                    let report = self
                        .fanout
                        .fanout(&group, &Frame::recall(tombstone), Some(actor))
                        .await;
                    info!(from_id = actor, group_id = group.id, message_id = request.id, attempted = report.attempted, "group message recalled");
                }
                None => {
                    tracing::debug!(group_id = request.to_id, "recall for unknown group not routed");
                }
            },
        }
        Ok(tombstone)
    }

    /// Drain the user's offline queue through their live connection.
    pub async fn replay(&self, user_id: UserId) -> Result<Vec<Frame>, RelayError> {
        self.router.replay(user_id).await
    }

    /// Recent history of `owner`'s conversation with `counterpart`, oldest first.
    pub async fn history(
        &self,
        owner: UserId,
        chat_type: ChatType,
        counterpart: i64,
        limit: Option<usize>,
    ) -> Result<Vec<Envelope>, RelayError> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_PAGE)
            .clamp(1, self.history_limit);
        let key = HistoryKey::new(owner, chat_type, counterpart);
        Ok(self.router.history(key, limit).await?)
    }

    // -----------------------------------------------------------------------
    // Group notices
    // -----------------------------------------------------------------------

    /// Announce a committed group change to every member of the snapshot,
    /// the actor included.
    pub async fn group_event(&self, event: GroupEvent) -> Result<Envelope, RelayError> {
        let GroupEvent {
            actor_id,
            group,
            kind,
        } = event;
        let actor = self
            .user(actor_id)
            .await?
            .ok_or_else(|| RelayError::NotFound("user not found".to_string()))?;
        let alias = group.member(actor_id).and_then(|m| m.nickname.as_deref());
        let from = Party::user(&actor, alias);
        let mut to = Party::group(&group);

        let text = match &kind {
            GroupEventKind::Created => notice::GROUP_CREATED.to_string(),
            GroupEventKind::Renamed { name } => {
                to.name = name.clone();
                notice::group_renamed(&from.name, name)
            }
            GroupEventKind::Announced { remark } => notice::group_announcement(remark),
            GroupEventKind::Quit if actor_id == group.owner_id => notice::GROUP_DISSOLVED.to_string(),
            GroupEventKind::Quit => notice::member_left(&from.name),
        };

        let envelope = self.builder.system(&from, &to, ChatType::Group, text);
        let report = self
            .fanout
            .fanout(&group, &Frame::ok(envelope.clone()), None)
            .await;
        info!(
            actor_id,
            group_id = group.id,
            event = ?kind,
            attempted = report.attempted,
            "group notice sent"
        );
        Ok(envelope)
    }

    pub(crate) async fn deliver(&self, recipient: UserId, envelope: Envelope) -> DeliveryOutcome {
        self.router.deliver(recipient, Frame::ok(envelope)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::delivery::tests::FailingHistory;
    use crate::directory::{Friendship, MemoryDirectory};
    use chatline::protocol::{GroupMember, Label, MessageKind};
    use crate::registry::Outbound;

    pub(crate) fn profile(id: UserId, username: &str) -> UserProfile {
        UserProfile {
            id,
            username: username.to_string(),
            nickname: None,
            avatar: format!("{username}.png"),
            enabled: true,
        }
    }

    /// alice(1), bob(2), carol(3), dave(4, disabled). alice and bob are
    /// friends; bob calls alice "Al". Group 100 = alice (owner), bob, carol.
    pub(crate) fn fixture() -> (Relay, Arc<MemoryDirectory>) {
        let directory = Arc::new(MemoryDirectory::new());
        directory.upsert_user(profile(1, "alice"));
        directory.upsert_user(profile(2, "bob"));
        directory.upsert_user(profile(3, "carol"));
        directory.upsert_user(UserProfile {
            enabled: false,
            ..profile(4, "dave")
        });
        directory.befriend(1, 2);
        directory.upsert_friendship(Friendship {
            user_id: 2,
            friend_id: 1,
            nickname: Some("Al".to_string()),
            blacklisted: false,
        });
        directory.befriend(1, 4);
        directory.upsert_group(GroupSnapshot {
            id: 100,
            name: "crew".to_string(),
            avatar: String::new(),
            owner_id: 1,
            active: true,
            members: vec![
                GroupMember {
                    user_id: 1,
                    nickname: Some("captain".to_string()),
                },
                GroupMember {
                    user_id: 2,
                    nickname: None,
                },
                GroupMember {
                    user_id: 3,
                    nickname: None,
                },
            ],
        });
        (Relay::in_memory(directory.clone()), directory)
    }

    fn online(relay: &Relay, user_id: UserId) -> Outbound {
        let (handle, out) = ConnectionHandle::channel(16);
        relay.connect(user_id, handle);
        out
    }

    fn text(to_id: i64, chat_type: ChatType, data: &str) -> SendRequest {
        SendRequest {
            to_id,
            chat_type,
            kind: MessageKind::Text,
            data: data.to_string(),
            options: None,
        }
    }

    #[tokio::test]
    async fn direct_send_uses_aliases_and_keeps_copy() {
        let (relay, _) = fixture();
        let mut bob = online(&relay, 2);

        let envelope = relay.send(1, text(2, ChatType::User, "hi")).await.unwrap();
        assert_eq!(envelope.from_name, "Al");
        assert_eq!(envelope.to_name, "bob");
        assert_eq!(bob.rx.try_recv().unwrap().envelope(), Some(&envelope));

        let own = relay.history(1, ChatType::User, 2, None).await.unwrap();
        assert_eq!(own, vec![envelope.clone()]);
        let theirs = relay.history(2, ChatType::User, 1, None).await.unwrap();
        assert_eq!(theirs, vec![envelope]);
    }

    #[tokio::test]
    async fn direct_send_offline_queues_once() {
        let (relay, _) = fixture();
        relay.send(1, text(2, ChatType::User, "hi")).await.unwrap();
        assert_eq!(relay.router().queued(2).await.unwrap(), 1);
        assert!(relay.history(2, ChatType::User, 1, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocked_or_stranger_is_rejected() {
        let (relay, directory) = fixture();
        let err = relay.send(3, text(2, ChatType::User, "hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));

        directory.upsert_friendship(Friendship {
            user_id: 2,
            friend_id: 1,
            nickname: None,
            blacklisted: true,
        });
        let err = relay.send(1, text(2, ChatType::User, "hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
        assert_eq!(relay.router().queued(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disabled_recipient_is_rejected() {
        let (relay, _) = fixture();
        let err = relay.send(1, text(4, ChatType::User, "hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn system_kind_and_bad_card_rejected_before_delivery() {
        let (relay, _) = fixture();
        let mut request = text(2, ChatType::User, "hi");
        request.kind = MessageKind::System;
        assert!(matches!(
            relay.send(1, request).await.unwrap_err(),
            RelayError::InvalidRequest(_)
        ));

        let mut request = text(2, ChatType::User, "card");
        request.kind = MessageKind::Card;
        request.options = Some("[]".to_string());
        assert!(matches!(
            relay.send(1, request).await.unwrap_err(),
            RelayError::MalformedPayload(_)
        ));
        assert_eq!(relay.router().queued(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn group_send_excludes_sender() {
        let (relay, _) = fixture();
        let mut alice = online(&relay, 1);
        let mut bob = online(&relay, 2);

        let envelope = relay.send(1, text(100, ChatType::Group, "yo")).await.unwrap();
        assert_eq!(envelope.from_name, "captain");
        assert_eq!(envelope.to_id, 100);
        assert_eq!(envelope.to_name, "crew");

        assert!(bob.rx.try_recv().is_ok());
        assert!(alice.rx.try_recv().is_err());
        assert_eq!(relay.router().queued(3).await.unwrap(), 1);
        assert_eq!(relay.router().queued(1).await.unwrap(), 0);

        let filed = relay.history(2, ChatType::Group, 1, None).await.unwrap();
        assert_eq!(filed, vec![envelope]);
        assert!(relay.history(2, ChatType::Group, 100, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_write_failure_does_not_fail_sender() {
        let (_, directory) = fixture();
        let relay = Relay::new(
            directory,
            Arc::new(MemoryOfflineQueue::new()),
            Arc::new(FailingHistory),
            DEFAULT_HISTORY_LIMIT,
        );
        let mut bob = online(&relay, 2);

        let envelope = relay.send(1, text(2, ChatType::User, "hi")).await.unwrap();
        assert_eq!(bob.rx.try_recv().unwrap().envelope(), Some(&envelope));

        let tombstone = relay
            .recall(
                1,
                RecallRequest {
                    to_id: 2,
                    chat_type: ChatType::User,
                    id: envelope.id,
                },
            )
            .await
            .unwrap();
        assert_eq!(bob.rx.try_recv().unwrap().tombstone(), Some(&tombstone));
    }

    #[tokio::test]
    async fn non_member_cannot_send_to_group() {
        let (relay, directory) = fixture();
        directory.upsert_user(profile(5, "eve"));
        let err = relay.send(5, text(100, ChatType::Group, "hey")).await.unwrap_err();
        assert!(matches!(err, RelayError::Forbidden(_)));

        let err = relay.send(1, text(999, ChatType::Group, "hey")).await.unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn recall_follows_original_route() {
        let (relay, _) = fixture();
        let mut bob = online(&relay, 2);
        let envelope = relay.send(1, text(2, ChatType::User, "oops")).await.unwrap();
        bob.rx.try_recv().unwrap();

        let tombstone = relay
            .recall(
                1,
                RecallRequest {
                    to_id: 2,
                    chat_type: ChatType::User,
                    id: envelope.id,
                },
            )
            .await
            .unwrap();
        assert_eq!(tombstone, envelope.tombstone());

        let frame = bob.rx.try_recv().unwrap();
        assert_eq!(frame.msg, Label::Recall);
        assert_eq!(frame.tombstone(), Some(&tombstone));

        assert!(relay.history(2, ChatType::User, 1, None).await.unwrap()[0].isremove);
        assert!(relay.history(1, ChatType::User, 2, None).await.unwrap()[0].isremove);
    }

    #[tokio::test]
    async fn group_recall_excludes_actor_and_tolerates_missing_group() {
        let (relay, _) = fixture();
        let request = RecallRequest {
            to_id: 100,
            chat_type: ChatType::Group,
            id: 77,
        };
        relay.recall(1, request).await.unwrap();
        assert_eq!(relay.router().queued(1).await.unwrap(), 0);
        assert_eq!(relay.router().queued(2).await.unwrap(), 1);
        assert_eq!(relay.router().queued(3).await.unwrap(), 1);

        let missing = RecallRequest {
            to_id: 555,
            chat_type: ChatType::Group,
            id: 78,
        };
        let tombstone = relay.recall(1, missing).await.unwrap();
        assert_eq!(tombstone.to_id, 555);
    }

    #[tokio::test]
    async fn group_notices_reach_actor() {
        let (relay, directory) = fixture();
        let group = directory_group(&directory);

        let envelope = relay
            .group_event(GroupEvent {
                actor_id: 2,
                group: group.clone(),
                kind: GroupEventKind::Renamed {
                    name: "new crew".to_string(),
                },
            })
            .await
            .unwrap();
        assert_eq!(envelope.kind, MessageKind::System);
        assert_eq!(envelope.data, "bob renamed the group to new crew");
        assert_eq!(envelope.to_name, "new crew");
        for member in 1..=3 {
            assert_eq!(relay.router().queued(member).await.unwrap(), 1);
        }

        let left = relay
            .group_event(GroupEvent {
                actor_id: 3,
                group: group.clone(),
                kind: GroupEventKind::Quit,
            })
            .await
            .unwrap();
        assert_eq!(left.data, "carol left the group");

        let dissolved = relay
            .group_event(GroupEvent {
                actor_id: 1,
                group,
                kind: GroupEventKind::Quit,
            })
            .await
            .unwrap();
        assert_eq!(dissolved.data, notice::GROUP_DISSOLVED);
        assert_eq!(dissolved.from_name, "captain");
    }

    fn directory_group(directory: &MemoryDirectory) -> GroupSnapshot {
        directory.group(100).unwrap().unwrap()
    }

    #[tokio::test]
    async fn admit_checks_account() {
        let (relay, _) = fixture();
        assert!(relay.admit(1).await.is_ok());
        assert!(matches!(
            relay.admit(4).await.unwrap_err(),
            RelayError::Forbidden(_)
        ));
        assert!(matches!(
            relay.admit(42).await.unwrap_err(),
            RelayError::Unauthorized(_)
        ));
    }

    #[tokio::test]
    async fn history_limit_is_clamped() {
        let (relay, _) = fixture();
        for i in 0..3 {
            relay
                .send(1, text(2, ChatType::User, &format!("m{i}")))
                .await
                .unwrap();
        }
        let page = relay.history(1, ChatType::User, 2, Some(2)).await.unwrap();
        assert_eq!(
            page.iter().map(|e| e.data.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );
        assert_eq!(relay.history(1, ChatType::User, 2, Some(0)).await.unwrap().len(), 1);
    }
}
