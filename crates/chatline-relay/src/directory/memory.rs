use anyhow::Result;
use chatline::protocol::{GroupId, GroupSnapshot, UserId};
use dashmap::DashMap;

use super::{Directory, Friendship, UserProfile};

#[derive(Default)]
pub struct MemoryDirectory {
    users: DashMap<UserId, UserProfile>,
    friendships: DashMap<(UserId, UserId), Friendship>,
    groups: DashMap<GroupId, GroupSnapshot>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_user(&self, profile: UserProfile) {
        self.users.insert(profile.id, profile);
    }

    pub fn upsert_friendship(&self, friendship: Friendship) {
        self.friendships
            .insert((friendship.user_id, friendship.friend_id), friendship);
    }

    /// Insert both directions of a friendship without aliases.
    pub fn befriend(&self, a: UserId, b: UserId) {
        for (user_id, friend_id) in [(a, b), (b, a)] {
            self.upsert_friendship(Friendship {
                user_id,
                friend_id,
                nickname: None,
                blacklisted: false,
            });
        }
    }

    pub fn upsert_group(&self, group: GroupSnapshot) {
        self.groups.insert(group.id, group);
    }
}

impl Directory for MemoryDirectory {
    fn user(&self, id: UserId) -> Result<Option<UserProfile>> {
        Ok(self.users.get(&id).map(|r| r.value().clone()))
    }

    fn friendship(&self, user_id: UserId, friend_id: UserId) -> Result<Option<Friendship>> {
        Ok(self
            .friendships
            .get(&(user_id, friend_id))
            .map(|r| r.value().clone()))
    }

    fn group(&self, id: GroupId) -> Result<Option<GroupSnapshot>> {
        Ok(self.groups.get(&id).map(|r| r.value().clone()))
    }
}
