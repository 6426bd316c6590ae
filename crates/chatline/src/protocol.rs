use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub type UserId = i64;
pub type GroupId = i64;
pub type MessageId = i64;

// ---------------------------------------------------------------------------
// Typed enums for wire format safety
// ---------------------------------------------------------------------------

/// Whether a message is addressed to a single user or to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    User,
    Group,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatType::User => "user",
            ChatType::Group => "group",
        }
    }
}

impl fmt::Display for ChatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of content an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Emoticon,
    Card,
    /// Server-generated notice (group changes, new friendship).
    System,
}

impl MessageKind {
    /// Kinds a client may send; `System` is reserved for the server.
    pub fn is_user_authored(self) -> bool {
        !matches!(self, MessageKind::System)
    }
}

/// Tag on every frame pushed to a live connection. Receivers branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Label {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "recall")]
    Recall,
    #[serde(rename = "fail")]
    Fail,
    /// The friend-request list of the receiver changed.
    #[serde(rename = "updateApplyList")]
    UpdateApplyList,
}

// ---------------------------------------------------------------------------
// Envelope & tombstone
// ---------------------------------------------------------------------------

/// The canonical message record.
///
/// For group messages `to_*` identify the group, never an individual member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub from_id: UserId,
    pub from_name: String,
    pub from_avatar: String,
    pub to_id: i64,
    pub to_name: String,
    pub to_avatar: String,
    pub chat_type: ChatType,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Milliseconds since the Unix epoch.
    pub create_time: i64,
    #[serde(default)]
    pub isremove: bool,
}

impl Envelope {
    /// The recall record for this envelope.
    pub fn tombstone(&self) -> Tombstone {
        Tombstone {
            from_id: self.from_id,
            to_id: self.to_id,
            chat_type: self.chat_type,
            id: self.id,
        }
    }
}

/// Minimal recall record. Never carries the original payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub from_id: UserId,
    pub to_id: i64,
    pub chat_type: ChatType,
    pub id: MessageId,
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Body of a pushed frame.
///
/// Untagged: an envelope is tried first, so a tombstone (a strict subset of
/// envelope fields) only matches when the richer fields are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameData {
    Envelope(Envelope),
    Tombstone(Tombstone),
    Notice(String),
}

/// A frame pushed over a live connection: `{"msg": label, "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub msg: Label,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<FrameData>,
}

impl Frame {
    pub fn ok(envelope: Envelope) -> Self {
        Self {
            msg: Label::Ok,
            data: Some(FrameData::Envelope(envelope)),
        }
    }

    pub fn recall(tombstone: Tombstone) -> Self {
        Self {
            msg: Label::Recall,
            data: Some(FrameData::Tombstone(tombstone)),
        }
    }

    pub fn fail(notice: impl Into<String>) -> Self {
        Self {
            msg: Label::Fail,
            data: Some(FrameData::Notice(notice.into())),
        }
    }

    /// A data-less signal such as `updateApplyList`.
    pub fn signal(label: Label) -> Self {
        Self {
            msg: label,
            data: None,
        }
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match &self.data {
            Some(FrameData::Envelope(e)) => Some(e),
            _ => None,
        }
    }

    pub fn tombstone(&self) -> Option<&Tombstone> {
        match &self.data {
            Some(FrameData::Tombstone(t)) => Some(t),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Body of `POST /chat/send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub to_id: i64,
    pub chat_type: ChatType,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data: String,
    /// Raw JSON text; only read for card messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
}

/// Body of `POST /chat/recall`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecallRequest {
    pub to_id: i64,
    pub chat_type: ChatType,
    pub id: MessageId,
}

/// Query of `GET /chat/history/{chat_type}/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// HTTP reply body: `{"msg": "ok" | "fail", "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply<T> {
    pub msg: Label,
    pub data: T,
}

impl<T> Reply<T> {
    pub fn ok(data: T) -> Self {
        Self {
            msg: Label::Ok,
            data,
        }
    }

    pub fn fail(data: T) -> Self {
        Self {
            msg: Label::Fail,
            data,
        }
    }
}

/// Relay liveness info returned by `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthInfo {
    pub online: usize,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// One member of a group snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub user_id: UserId,
    /// The member's nickname inside this group, if set.
    #[serde(default)]
    pub nickname: Option<String>,
}

/// Group state as read at the start of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    /// The group owner; quitting as owner dissolves the group.
    pub owner_id: UserId,
    #[serde(default = "default_true")]
    pub active: bool,
    pub members: Vec<GroupMember>,
}

impl GroupSnapshot {
    pub fn member(&self, user_id: UserId) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.user_id == user_id)
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Workflow events
// ---------------------------------------------------------------------------

/// A friend request as stored by the account service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequest {
    pub id: i64,
    pub requester_id: UserId,
    pub acceptor_id: UserId,
    /// The alias the requester chose for the acceptor.
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub lookme: bool,
    #[serde(default)]
    pub lookhim: bool,
}

/// The acceptor's answer to a friend request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcceptorResponse {
    /// The alias the acceptor chose for the requester.
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub lookme: bool,
    #[serde(default)]
    pub lookhim: bool,
}

/// Emitted after the friend-request transaction has committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendAcceptEvent {
    pub request: FriendRequest,
    pub response: AcceptorResponse,
}

/// Emitted when someone sends `user_id` a friend request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FriendRequestedEvent {
    pub user_id: UserId,
}

/// What happened to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupEventKind {
    Created,
    Renamed { name: String },
    Announced { remark: String },
    /// The actor left; when the actor owns the group it was dissolved.
    Quit,
}

/// A group change committed by the group service.
///
/// `group` is the snapshot taken before the change, so a quitting member is
/// still listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEvent {
    pub actor_id: UserId,
    pub group: GroupSnapshot,
    #[serde(flatten)]
    pub kind: GroupEventKind,
}
