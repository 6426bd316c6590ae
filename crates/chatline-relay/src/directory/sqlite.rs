use anyhow::{Context, Result, anyhow};
use chatline::protocol::{GroupId, GroupMember, GroupSnapshot, UserId};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex as StdMutex, MutexGuard};

use super::{Directory, Friendship, UserProfile};

/// SQLite mirror of the account service tables the relay reads.
///
/// One connection behind a std `Mutex`; callers are already on a blocking
/// thread.
pub struct SqliteDirectory {
    conn: StdMutex<Connection>,
}

impl SqliteDirectory {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open directory db {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("failed to open in-memory sqlite")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user (
                id        INTEGER PRIMARY KEY NOT NULL,
                username  TEXT NOT NULL UNIQUE,
                nickname  TEXT,
                avatar    TEXT NOT NULL DEFAULT '',
                status    INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS friend (
                user_id   INTEGER NOT NULL,
                friend_id INTEGER NOT NULL,
                nickname  TEXT,
                isblack   INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, friend_id)
            );
            CREATE TABLE IF NOT EXISTS chat_group (
                id        INTEGER PRIMARY KEY NOT NULL,
                name      TEXT NOT NULL,
                avatar    TEXT NOT NULL DEFAULT '',
                user_id   INTEGER NOT NULL,
                status    INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS group_user (
                group_id  INTEGER NOT NULL,
                user_id   INTEGER NOT NULL,
                nickname  TEXT,
                PRIMARY KEY (group_id, user_id)
            );",
        )
        .context("failed to create directory tables")?;

        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| anyhow!("lock poisoned: {e}"))
    }

    pub fn upsert_user(&self, profile: &UserProfile) -> Result<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO user (id, username, nickname, avatar, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                profile.id,
                profile.username,
                profile.nickname,
                profile.avatar,
                profile.enabled
            ],
        )?;
        Ok(())
    }

    pub fn upsert_friendship(&self, friendship: &Friendship) -> Result<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO friend (user_id, friend_id, nickname, isblack)
                 VALUES (?1, ?2, ?3, ?4)",
            params![
                friendship.user_id,
                friendship.friend_id,
                friendship.nickname,
                friendship.blacklisted
            ],
        )?;
        Ok(())
    }

    /// Replace a group and its member list.
    pub fn upsert_group(&self, group: &GroupSnapshot) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO chat_group (id, name, avatar, user_id, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                group.id,
                group.name,
                group.avatar,
                group.owner_id,
                group.active
            ],
        )?;
        tx.execute("DELETE FROM group_user WHERE group_id = ?1", [group.id])?;
        for member in &group.members {
            tx.execute(
                "INSERT INTO group_user (group_id, user_id, nickname) VALUES (?1, ?2, ?3)",
                params![group.id, member.user_id, member.nickname],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl Directory for SqliteDirectory {
    fn user(&self, id: UserId) -> Result<Option<UserProfile>> {
        let conn = self.lock()?;
        let profile = conn
            .query_row(
                "SELECT id, username, nickname, avatar, status FROM user WHERE id = ?1",
                [id],
                |row| {
                    Ok(UserProfile {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        nickname: row.get(2)?,
                        avatar: row.get(3)?,
                        enabled: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("user lookup failed")?;
        Ok(profile)
    }

    fn friendship(&self, user_id: UserId, friend_id: UserId) -> Result<Option<Friendship>> {
        let conn = self.lock()?;
        let friendship = conn
            .query_row(
                "SELECT user_id, friend_id, nickname, isblack FROM friend
                     WHERE user_id = ?1 AND friend_id = ?2",
                [user_id, friend_id],
                |row| {
                    Ok(Friendship {
                        user_id: row.get(0)?,
                        friend_id: row.get(1)?,
                        nickname: row.get(2)?,
                        blacklisted: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("friendship lookup failed")?;
        Ok(friendship)
    }

    fn group(&self, id: GroupId) -> Result<Option<GroupSnapshot>> {
        let conn = self.lock()?;
        let head = conn
            .query_row(
                "SELECT name, avatar, user_id, status FROM chat_group WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, UserId>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()
            .context("group lookup failed")?;
        let Some((name, avatar, owner_id, active)) = head else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT user_id, nickname FROM group_user WHERE group_id = ?1 ORDER BY rowid",
        )?;
        let members = stmt
            .query_map([id], |row| {
                Ok(GroupMember {
                    user_id: row.get(0)?,
                    nickname: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("group member lookup failed")?;

        Ok(Some(GroupSnapshot {
            id,
            name,
            avatar,
            owner_id,
            active,
            members,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn alice() -> UserProfile {
        UserProfile {
            id: 1,
            username: "alice".to_string(),
            nickname: Some("Ally".to_string()),
            avatar: "a.png".to_string(),
            enabled: true,
        }
    }

    #[test]
    fn user_round_trip() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        dir.upsert_user(&alice()).unwrap();
        assert_eq!(dir.user(1).unwrap(), Some(alice()));
        assert_eq!(dir.user(2).unwrap(), None);
    }

    #[test]
    fn friendship_is_directional() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        dir.upsert_friendship(&Friendship {
            user_id: 2,
            friend_id: 1,
            nickname: Some("boss".to_string()),
            blacklisted: true,
        })
        .unwrap();

        let record = dir.friendship(2, 1).unwrap().unwrap();
        assert_eq!(record.nickname.as_deref(), Some("boss"));
        assert!(record.blacklisted);
        assert!(dir.friendship(1, 2).unwrap().is_none());
    }

    #[test]
    fn group_members_keep_order() {
        let dir = SqliteDirectory::open_in_memory().unwrap();
        let group = GroupSnapshot {
            id: 10,
            name: "climbing".to_string(),
            avatar: String::new(),
            owner_id: 3,
            active: true,
            members: vec![
                GroupMember {
                    user_id: 3,
                    nickname: None,
                },
                GroupMember {
                    user_id: 1,
                    nickname: Some("al".to_string()),
                },
            ],
        };
        dir.upsert_group(&group).unwrap();
        assert_eq!(dir.group(10).unwrap(), Some(group.clone()));

        let mut shrunk = group;
        shrunk.members.truncate(1);
        shrunk.active = false;
        dir.upsert_group(&shrunk).unwrap();
        assert_eq!(dir.group(10).unwrap(), Some(shrunk));
        assert!(dir.group(11).unwrap().is_none());
    }

    #[test]
    fn persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("directory.db");
        {
            let dir = SqliteDirectory::open(&path).unwrap();
            dir.upsert_user(&alice()).unwrap();
        }
        let dir = SqliteDirectory::open(&path).unwrap();
        assert_eq!(dir.user(1).unwrap().unwrap().username, "alice");
    }
}
