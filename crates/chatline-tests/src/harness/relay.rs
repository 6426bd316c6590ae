use anyhow::Result;
use chatline::protocol::{GroupMember, GroupSnapshot, UserId};
use chatline_relay::Relay;
use chatline_relay::auth::TokenSigner;
use chatline_relay::directory::{Friendship, MemoryDirectory, UserProfile};
use chatline_relay::server::{AppState, INTERNAL_SECRET_HEADER, spawn_relay};
use chatline_relay::store::{DEFAULT_HISTORY_LIMIT, SqliteStore};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

use super::poll_until;

pub const TOKEN_SECRET: &str = "test-secret-0123456789";
pub const INTERNAL_SECRET: &str = "internal-secret";

/// A relay on a random port backed by an in-memory directory the test
/// populates directly.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub directory: Arc<MemoryDirectory>,
    pub state: Arc<AppState>,
    http: reqwest::Client,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _data_dir: Option<TempDir>,
}

impl TestRelay {
    /// Relay with in-memory stores.
    pub async fn spawn() -> Result<Self> {
        let directory = Arc::new(MemoryDirectory::new());
        let relay = Relay::in_memory(directory.clone());
        Self::start(directory, relay, None).await
    }

    /// Relay with the offline queue and history in SQLite under a temp dir.
    pub async fn spawn_sqlite() -> Result<Self> {
        let data_dir = TempDir::new()?;
        let directory = Arc::new(MemoryDirectory::new());
        let store = Arc::new(SqliteStore::open(
            &data_dir.path().join("messages.db"),
            DEFAULT_HISTORY_LIMIT,
        )?);
        let relay = Relay::new(
            directory.clone(),
            store.clone(),
            store,
            DEFAULT_HISTORY_LIMIT,
        );
        Self::start(directory, relay, Some(data_dir)).await
    }

    async fn start(
        directory: Arc<MemoryDirectory>,
        relay: Relay,
        data_dir: Option<TempDir>,
    ) -> Result<Self> {
        super::init_tracing();
        let state = Arc::new(AppState {
            relay: Arc::new(relay),
            tokens: TokenSigner::new(TOKEN_SECRET, 3600),
            internal_secret: Some(INTERNAL_SECRET.to_string()),
            outbound_buffer: 64,
        });
        let (addr, shutdown_tx) = spawn_relay(state.clone(), "127.0.0.1:0").await?;
        Ok(Self {
            addr,
            directory,
            state,
            http: reqwest::Client::new(),
            shutdown_tx: Some(shutdown_tx),
            _data_dir: data_dir,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    pub fn token(&self, user_id: UserId) -> String {
        self.state
            .tokens
            .issue(user_id)
            .unwrap_or_else(|e| panic!("token for {user_id}: {e}"))
    }

    pub fn add_user(&self, id: UserId, username: &str) {
        self.directory.upsert_user(UserProfile {
            id,
            username: username.to_string(),
            nickname: None,
            avatar: format!("https://cdn.example/{username}.png"),
            enabled: true,
        });
    }

    pub fn disable_user(&self, id: UserId, username: &str) {
        self.directory.upsert_user(UserProfile {
            id,
            username: username.to_string(),
            nickname: None,
            avatar: String::new(),
            enabled: false,
        });
    }

    pub fn befriend(&self, a: UserId, b: UserId) {
        self.directory.befriend(a, b);
    }

    pub fn block(&self, user_id: UserId, blocked: UserId) {
        self.directory.upsert_friendship(Friendship {
            user_id,
            friend_id: blocked,
            nickname: None,
            blacklisted: true,
        });
    }

    pub fn add_group(&self, id: i64, name: &str, owner_id: UserId, members: &[UserId]) -> GroupSnapshot {
        let group = GroupSnapshot {
            id,
            name: name.to_string(),
            avatar: String::new(),
            owner_id,
            active: true,
            members: members
                .iter()
                .map(|&user_id| GroupMember {
                    user_id,
                    nickname: None,
                })
                .collect(),
        };
        self.directory.upsert_group(group.clone());
        group
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.state.relay.registry().is_online(user_id)
    }

    /// Wait until the registry has (or no longer has) a session for `user_id`.
    pub async fn wait_online(&self, user_id: UserId, online: bool) -> bool {
        poll_until(Duration::from_secs(3), move || async move {
            self.is_online(user_id) == online
        })
        .await
    }

    pub async fn queued(&self, user_id: UserId) -> usize {
        self.state
            .relay
            .router()
            .queued(user_id)
            .await
            .unwrap_or_else(|e| panic!("queue length for {user_id}: {e}"))
    }

    /// POST to an `/internal/*` route with the given secret.
    pub async fn internal_with<T: Serialize>(
        &self,
        path: &str,
        secret: &str,
        body: &T,
    ) -> Result<(u16, serde_json::Value)> {
        let resp = self
            .http
            .post(self.url(path))
            .header(INTERNAL_SECRET_HEADER, secret)
            .json(body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        Ok((status, resp.json().await?))
    }

    pub async fn internal<T: Serialize>(&self, path: &str, body: &T) -> Result<(u16, serde_json::Value)> {
        self.internal_with(path, INTERNAL_SECRET, body).await
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
