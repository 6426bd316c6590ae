//! Read-only view of the account service's users, friendships and groups.
//!
//! The relay never writes these records; the account service owns them. The
//! in-memory backend doubles as the test fixture.

mod memory;
mod sqlite;

pub use memory::MemoryDirectory;
pub use sqlite::SqliteDirectory;

use anyhow::Result;
use chatline::protocol::{GroupId, GroupSnapshot, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub avatar: String,
    pub enabled: bool,
}

impl UserProfile {
    /// Profile nickname if set, else username.
    pub fn display_name(&self) -> &str {
        match self.nickname.as_deref() {
            Some(n) if !n.is_empty() => n,
            _ => &self.username,
        }
    }
}

/// `user_id`'s record about `friend_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friendship {
    pub user_id: UserId,
    pub friend_id: UserId,
    /// Alias `user_id` gave `friend_id`.
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub blacklisted: bool,
}

/// Blocking lookups; callers run them on `spawn_blocking`.
pub trait Directory: Send + Sync + 'static {
    fn user(&self, id: UserId) -> Result<Option<UserProfile>>;

    fn friendship(&self, user_id: UserId, friend_id: UserId) -> Result<Option<Friendship>>;

    fn group(&self, id: GroupId) -> Result<Option<GroupSnapshot>>;
}
