use anyhow::{Context, Result, bail};
use chatline::protocol::{
    ChatType, Envelope, Frame, Label, MessageKind, RecallRequest, Reply, SendRequest, Tombstone,
};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::relay::TestRelay;

/// HTTP client acting as one logged-in user.
pub struct TestClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl TestClient {
    pub fn new(relay: &TestRelay, user_id: i64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: relay.url(""),
            token: relay.token(user_id),
        }
    }

    /// Client presenting an arbitrary token.
    pub fn with_token(relay: &TestRelay, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: relay.url(""),
            token: token.to_string(),
        }
    }

    /// POST and return status plus raw JSON body, including failures.
    pub async fn post_raw<T: serde::Serialize>(
        &self,
        path: &str,
        body: Option<&T>,
    ) -> Result<(u16, serde_json::Value)> {
        let mut req = self
            .http
            .post(format!("{}{}", self.base, path))
            .header("token", &self.token);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        Ok((status, resp.json().await?))
    }

    async fn post_ok<T: serde::Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&T>,
    ) -> Result<R> {
        let (status, value) = self.post_raw(path, body).await?;
        if status != 200 {
            bail!("{path} returned {status}: {value}");
        }
        let reply: Reply<R> = serde_json::from_value(value).context("unexpected reply shape")?;
        if reply.msg != Label::Ok {
            bail!("{path} replied {:?}", reply.msg);
        }
        Ok(reply.data)
    }

    pub async fn try_send(&self, request: &SendRequest) -> Result<(u16, serde_json::Value)> {
        self.post_raw("/chat/send", Some(request)).await
    }

    pub async fn send(&self, request: &SendRequest) -> Result<Envelope> {
        self.post_ok("/chat/send", Some(request)).await
    }

    pub async fn send_text(&self, to_id: i64, chat_type: ChatType, text: &str) -> Result<Envelope> {
        self.send(&text_request(to_id, chat_type, text)).await
    }

    pub async fn recall(&self, to_id: i64, chat_type: ChatType, id: i64) -> Result<Tombstone> {
        let request = RecallRequest { to_id, chat_type, id };
        self.post_ok("/chat/recall", Some(&request)).await
    }

    pub async fn getmessage(&self) -> Result<Vec<Frame>> {
        self.post_ok::<(), _>("/chat/getmessage", None).await
    }

    pub async fn history(&self, chat_type: ChatType, id: i64, limit: Option<usize>) -> Result<Vec<Envelope>> {
        let mut url = format!("{}/chat/history/{}/{}", self.base, chat_type, id);
        if let Some(limit) = limit {
            url.push_str(&format!("?limit={limit}"));
        }
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status().as_u16();
        if status != 200 {
            bail!("history returned {status}");
        }
        let reply: Reply<Vec<Envelope>> = resp.json().await?;
        Ok(reply.data)
    }
}

pub fn text_request(to_id: i64, chat_type: ChatType, text: &str) -> SendRequest {
    SendRequest {
        to_id,
        chat_type,
        kind: MessageKind::Text,
        data: text.to_string(),
        options: None,
    }
}

/// A live WebSocket session.
pub struct TestSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestSocket {
    /// Connect as `user_id` and wait until the relay has registered the session.
    pub async fn connect(relay: &TestRelay, user_id: i64) -> Result<Self> {
        let socket = Self::connect_raw(&relay.ws_url(&relay.token(user_id))).await?;
        if !relay.wait_online(user_id, true).await {
            bail!("user {user_id} never came online");
        }
        Ok(socket)
    }

    pub async fn connect_raw(url: &str) -> Result<Self> {
        let (inner, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect {url}"))?;
        Ok(Self { inner })
    }

    /// Next frame pushed by the relay. `None` if the socket closed or nothing
    /// arrived within `timeout`.
    pub async fn next_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.inner.next()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Ok(None),
                Ok(Some(msg)) => msg?,
            };
            match msg {
                Message::Text(text) => {
                    return Ok(Some(
                        serde_json::from_str(text.as_str()).context("unparseable frame")?,
                    ));
                }
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
    }

    /// Like [`next_frame`](Self::next_frame) but fails when nothing arrives.
    pub async fn expect_frame(&mut self, timeout: Duration) -> Result<Frame> {
        match self.next_frame(timeout).await? {
            Some(frame) => Ok(frame),
            None => bail!("no frame within {timeout:?}"),
        }
    }

    /// True once the relay has closed the socket.
    pub async fn closed_within(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.inner.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.inner.send(Message::Close(None)).await?;
        Ok(())
    }
}
