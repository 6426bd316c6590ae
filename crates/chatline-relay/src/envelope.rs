use chatline::protocol::{ChatType, Envelope, GroupSnapshot, MessageId, MessageKind};
use chatline::time::now_ms;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::directory::UserProfile;
use crate::error::RelayError;

/// Appended to a video URL to get its poster frame from the object store.
pub const VIDEO_POSTER_SUFFIX: &str = "?x-oss-process=video/snapshot,t_10,m_fast,w_300,f_png";

/// Server-generated texts carried by system envelopes.
pub mod notice {
    pub const FRIEND_ACCEPTED: &str = "You are now friends. Start chatting!";
    pub const GROUP_CREATED: &str = "Group created. Start chatting!";
    pub const GROUP_DISSOLVED: &str = "This group has been dissolved";

    pub fn group_renamed(from_name: &str, name: &str) -> String {
        format!("{from_name} renamed the group to {name}")
    }

    pub fn group_announcement(remark: &str) -> String {
        format!("[Announcement] {remark}")
    }

    pub fn member_left(from_name: &str) -> String {
        format!("{from_name} left the group")
    }
}

/// Time-based message ids: `max(now_ms, last + 1)`, unique within the process.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> MessageId {
        let now = now_ms();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// One side of an envelope as it will be displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub id: i64,
    pub name: String,
    pub avatar: String,
}

impl Party {
    /// A user, named by `alias` when one is set, else nickname, else username.
    pub fn user(profile: &UserProfile, alias: Option<&str>) -> Self {
        let name = match alias {
            Some(a) if !a.is_empty() => a,
            _ => profile.display_name(),
        };
        Self {
            id: profile.id,
            name: name.to_string(),
            avatar: profile.avatar.clone(),
        }
    }

    pub fn group(group: &GroupSnapshot) -> Self {
        Self {
            id: group.id,
            name: group.name.clone(),
            avatar: group.avatar.clone(),
        }
    }
}

/// Message body and its derived options.
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    pub kind: MessageKind,
    pub data: String,
    pub options: Map<String, Value>,
}

impl Content {
    /// Validate caller content and derive `options`.
    ///
    /// Video gets a poster URL; card options must be a JSON object; every
    /// other kind discards what the caller sent.
    pub fn new(kind: MessageKind, data: String, raw_options: Option<&str>) -> Result<Self, RelayError> {
        let options = match kind {
            MessageKind::Video => {
                let mut options = Map::new();
                options.insert(
                    "poster".to_string(),
                    Value::String(format!("{data}{VIDEO_POSTER_SUFFIX}")),
                );
                options
            }
            MessageKind::Card => {
                let raw = raw_options.ok_or_else(|| {
                    RelayError::MalformedPayload("card message requires options".to_string())
                })?;
                match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) => {
                        return Err(RelayError::MalformedPayload(
                            "card options must be a JSON object".to_string(),
                        ));
                    }
                    Err(e) => {
                        return Err(RelayError::MalformedPayload(format!(
                            "card options are not valid JSON: {e}"
                        )));
                    }
                }
            }
            _ => Map::new(),
        };
        Ok(Self {
            kind,
            data,
            options,
        })
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::System,
            data: text.into(),
            options: Map::new(),
        }
    }
}

/// Assembles envelopes from already-fetched context. Never touches I/O.
#[derive(Debug, Default)]
pub struct EnvelopeBuilder {
    ids: IdGenerator,
}

impl EnvelopeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(&self, from: &Party, to: &Party, chat_type: ChatType, content: Content) -> Envelope {
        Envelope {
            id: self.ids.next_id(),
            from_id: from.id,
            from_name: from.name.clone(),
            from_avatar: from.avatar.clone(),
            to_id: to.id,
            to_name: to.name.clone(),
            to_avatar: to.avatar.clone(),
            chat_type,
            kind: content.kind,
            data: content.data,
            options: content.options,
            create_time: now_ms(),
            isremove: false,
        }
    }

    pub fn direct(&self, from: &Party, to: &Party, content: Content) -> Envelope {
        self.build(from, to, ChatType::User, content)
    }

    /// `group` is the addressee; members are resolved at fan-out.
    pub fn group(&self, from: &Party, group: &Party, content: Content) -> Envelope {
        self.build(from, group, ChatType::Group, content)
    }

    pub fn system(&self, from: &Party, to: &Party, chat_type: ChatType, text: impl Into<String>) -> Envelope {
        self.build(from, to, chat_type, Content::system(text))
    }
}
