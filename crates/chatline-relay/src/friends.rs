//! Notifications for the friend-request workflow.
//!
//! The account service commits the request itself; the relay only tells
//! both sides about the outcome.

use chatline::protocol::{ChatType, Envelope, FriendAcceptEvent, Frame, Label, UserId};
use tracing::info;

use crate::directory::UserProfile;
use crate::envelope::{EnvelopeBuilder, Party, notice};
use crate::error::RelayError;
use crate::relay::Relay;

/// The two "you are now friends" envelopes: acceptor to requester, then
/// requester to acceptor. Each side sees the other under the alias they chose.
pub fn accept_notices(
    builder: &EnvelopeBuilder,
    requester: &UserProfile,
    acceptor: &UserProfile,
    event: &FriendAcceptEvent,
) -> (Envelope, Envelope) {
    // request.nickname: what the requester calls the acceptor.
    // response.nickname: what the acceptor calls the requester.
    let acceptor_as_seen = Party::user(acceptor, event.request.nickname.as_deref());
    let requester_as_seen = Party::user(requester, event.response.nickname.as_deref());

    let to_requester = builder.system(
        &acceptor_as_seen,
        &requester_as_seen,
        ChatType::User,
        notice::FRIEND_ACCEPTED,
    );
    let to_acceptor = builder.system(
        &requester_as_seen,
        &acceptor_as_seen,
        ChatType::User,
        notice::FRIEND_ACCEPTED,
    );
    (to_requester, to_acceptor)
}

impl Relay {
    /// Tell both parties of an accepted request. Delivery failures are
    /// swallowed; missing profiles fail the event.
    pub async fn friend_accepted(&self, event: FriendAcceptEvent) -> Result<[Envelope; 2], RelayError> {
        let requester_id = event.request.requester_id;
        let acceptor_id = event.request.acceptor_id;
        let (requester, acceptor) = self
            .read(move |d| Ok((d.user(requester_id)?, d.user(acceptor_id)?)))
            .await?;
        let requester = requester
            .ok_or_else(|| RelayError::NotFound(format!("user {requester_id} not found")))?;
        let acceptor =
            acceptor.ok_or_else(|| RelayError::NotFound(format!("user {acceptor_id} not found")))?;

        let (to_requester, to_acceptor) = accept_notices(&self.builder, &requester, &acceptor, &event);

        let first = self.deliver(requester_id, to_requester.clone()).await;
        let second = self.deliver(acceptor_id, to_acceptor.clone()).await;
        info!(
            request_id = event.request.id,
            requester_id,
            acceptor_id,
            requester_outcome = ?first,
            acceptor_outcome = ?second,
            "friend request accepted"
        );
        Ok([to_requester, to_acceptor])
    }

    /// Nudge `user_id` to refresh their pending requests. Nothing is queued
    /// for offline users; they see the list on next fetch.
    pub async fn friend_requested(&self, user_id: UserId) -> bool {
        self.router
            .notify(user_id, Frame::signal(Label::UpdateApplyList))
            .await
    }
}
