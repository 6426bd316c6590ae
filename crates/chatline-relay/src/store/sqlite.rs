use anyhow::{Context, Result, anyhow};
use chatline::protocol::{Envelope, Frame, MessageId, UserId};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex as StdMutex, MutexGuard};

use super::{HistoryKey, HistoryStore, OfflineQueue};

/// SQLite-backed offline queue and history that survive relay restarts.
///
/// Records are stored as JSON text, one row per frame or envelope. All
/// operations serialize on one connection, so writes for different users
/// contend with each other; [`MemoryOfflineQueue`](super::MemoryOfflineQueue)
/// and [`MemoryHistory`](super::MemoryHistory) keep keys independent. Each
/// operation is one short statement or transaction on the blocking pool.
pub struct SqliteStore {
    conn: StdMutex<Connection>,
    history_limit: usize,
}

impl SqliteStore {
    pub fn open(path: &Path, history_limit: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open message db {}", path.display()))?;
        Self::init(conn, history_limit)
    }

    pub fn open_in_memory(history_limit: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::init(conn, history_limit)
    }

    fn init(conn: Connection, history_limit: usize) -> Result<Self> {
        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS offline_queue (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id     INTEGER NOT NULL,
                frame       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_offline_user ON offline_queue(user_id, seq);
            CREATE TABLE IF NOT EXISTS history (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id        INTEGER NOT NULL,
                chat_type       TEXT NOT NULL,
                counterpart_id  INTEGER NOT NULL,
                message_id      INTEGER NOT NULL,
                envelope        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_pair
                ON history(owner_id, chat_type, counterpart_id, seq);",
        )
        .context("failed to create message tables")?;

        let queued: i64 = conn
            .query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))
            .unwrap_or(0);
        if queued > 0 {
            tracing::info!(queued, "loaded offline queue from disk");
        }

        Ok(Self {
            conn: StdMutex::new(conn),
            history_limit: history_limit.max(1),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| anyhow!("lock poisoned: {e}"))
    }
}

impl OfflineQueue for SqliteStore {
    fn push(&self, user_id: UserId, frame: &Frame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.lock()?
            .execute(
                "INSERT INTO offline_queue (user_id, frame) VALUES (?1, ?2)",
                params![user_id, json],
            )
            .context("failed to enqueue frame")?;
        Ok(())
    }

    fn take_all(&self, user_id: UserId) -> Result<Vec<Frame>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt =
                tx.prepare("SELECT seq, frame FROM offline_queue WHERE user_id = ?1 ORDER BY seq")?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        tx.execute("DELETE FROM offline_queue WHERE user_id = ?1", [user_id])?;
        tx.commit().context("failed to drain offline queue")?;

        let mut frames = Vec::with_capacity(rows.len());
        for (seq, json) in rows {
            match serde_json::from_str(&json) {
                Ok(frame) => frames.push(frame),
                Err(e) => tracing::warn!(user_id, seq, error = %e, "dropping unreadable queued frame"),
            }
        }
        Ok(frames)
    }

    fn len(&self, user_id: UserId) -> Result<usize> {
        let count: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM offline_queue WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl HistoryStore for SqliteStore {
    fn append(&self, key: &HistoryKey, envelope: &Envelope) -> Result<()> {
        let json = serde_json::to_string(envelope)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO history (owner_id, chat_type, counterpart_id, message_id, envelope)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.owner,
                key.chat_type.as_str(),
                key.counterpart,
                envelope.id,
                json
            ],
        )?;
        tx.execute(
            "DELETE FROM history
                 WHERE owner_id = ?1 AND chat_type = ?2 AND counterpart_id = ?3
                   AND seq NOT IN (
                       SELECT seq FROM history
                        WHERE owner_id = ?1 AND chat_type = ?2 AND counterpart_id = ?3
                        ORDER BY seq DESC LIMIT ?4
                   )",
            params![
                key.owner,
                key.chat_type.as_str(),
                key.counterpart,
                self.history_limit as i64
            ],
        )?;
        tx.commit().context("failed to append history")?;
        Ok(())
    }

    fn mark_removed(&self, key: &HistoryKey, id: MessageId) -> Result<bool> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT seq, envelope FROM history
                     WHERE owner_id = ?1 AND chat_type = ?2 AND counterpart_id = ?3
                       AND message_id = ?4
                     ORDER BY seq DESC LIMIT 1",
                params![key.owner, key.chat_type.as_str(), key.counterpart, id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((seq, json)) = row else {
            return Ok(false);
        };

        let mut envelope: Envelope =
            serde_json::from_str(&json).context("stored envelope is unreadable")?;
        envelope.isremove = true;
        conn.execute(
            "UPDATE history SET envelope = ?1 WHERE seq = ?2",
            params![serde_json::to_string(&envelope)?, seq],
        )?;
        Ok(true)
    }

    fn recent(&self, key: &HistoryKey, limit: usize) -> Result<Vec<Envelope>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT envelope FROM history
                 WHERE owner_id = ?1 AND chat_type = ?2 AND counterpart_id = ?3
                 ORDER BY seq DESC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![
                    key.owner,
                    key.chat_type.as_str(),
                    key.counterpart,
                    limit as i64
                ],
                |row| row.get::<_, String>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut envelopes = rows
            .iter()
            .map(|json| serde_json::from_str(json).context("stored envelope is unreadable"))
            .collect::<Result<Vec<Envelope>>>()?;
        envelopes.reverse();
        Ok(envelopes)
    }
}
