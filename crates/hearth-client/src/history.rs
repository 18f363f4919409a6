//! Where a conversation's backlog comes from.
//!
//! The backend serves stored messages over REST in the same shape the room
//! channel broadcasts them, oldest first.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use hearth_shared::{EncryptedMessage, RoomId};

use crate::config::ClientConfig;
use crate::error::HistoryError;

#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Stored messages of `room`, oldest first.
    async fn fetch(&self, room: RoomId, token: &str) -> Result<Vec<EncryptedMessage>, HistoryError>;
}

/// `GET {api_base}/chat/rooms/{room}/messages/` with a bearer token.
pub struct RestHistory {
    client: reqwest::Client,
    api_base: Url,
}

impl RestHistory {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, HistoryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Self::with_client(api_base, client)
    }

    /// Use a preconfigured client (proxy, TLS roots, shared pool).
    pub fn with_client(api_base: &str, client: reqwest::Client) -> Result<Self, HistoryError> {
        let api_base =
            Url::parse(api_base).map_err(|e| HistoryError::Endpoint(format!("{api_base}: {e}")))?;
        if !matches!(api_base.scheme(), "http" | "https") {
            return Err(HistoryError::Endpoint(format!(
                "unsupported scheme {:?}",
                api_base.scheme()
            )));
        }
        Ok(Self { client, api_base })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, HistoryError> {
        Self::new(&config.api_base, config.http_timeout)
    }

    fn messages_url(&self, room: RoomId) -> Url {
        let mut url = self.api_base.clone();
        let path = format!(
            "{}/chat/rooms/{}/messages/",
            self.api_base.path().trim_end_matches('/'),
            room
        );
        url.set_path(&path);
        url.set_query(None);
        url
    }
}

#[async_trait]
impl HistorySource for RestHistory {
    async fn fetch(&self, room: RoomId, token: &str) -> Result<Vec<EncryptedMessage>, HistoryError> {
        let url = self.messages_url(room);
        debug!(room = %room, url = %url, "fetching history");

        let response = self.client.get(url).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let messages: Vec<EncryptedMessage> = serde_json::from_slice(&body)?;
        debug!(room = %room, count = messages.len(), "history fetched");
        Ok(messages)
    }
}

/// In-memory history, for tests and offline use.
#[derive(Default)]
pub struct MemoryHistory {
    rooms: Mutex<HashMap<RoomId, Vec<EncryptedMessage>>>,
    failure: Mutex<Option<String>>,
}

impl MemoryHistory {
    pub fn push(&self, message: EncryptedMessage) {
        self.rooms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(message.room)
            .or_default()
            .push(message);
    }

    /// Make every fetch fail with `reason` until cleared with `None`.
    pub fn fail_with(&self, reason: Option<&str>) {
        *self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = reason.map(str::to_owned);
    }
}

#[async_trait]
impl HistorySource for MemoryHistory {
    async fn fetch(&self, room: RoomId, _token: &str) -> Result<Vec<EncryptedMessage>, HistoryError> {
        if let Some(reason) = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            return Err(HistoryError::Unavailable(reason));
        }

        let mut messages = self
            .rooms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&room)
            .cloned()
            .unwrap_or_default();
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;

    /// Serve one HTTP response and hand back the raw request head.
    async fn one_shot_http(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
        });

        (format!("http://{addr}/api"), rx)
    }

    // Loopback only; ignore any proxy configured in the environment.
    fn local_history(base: &str) -> RestHistory {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        RestHistory::with_client(base, client).unwrap()
    }

    #[tokio::test]
    async fn test_rest_history_fetch() {
        let body = r#"[
            {"id": 1, "room": 42, "ciphertext": "AAAA", "iv": "BBBB", "sender": 3,
             "sender_username": "ana", "sender_photo_url": null,
             "created_at": "2024-05-01T10:00:00.123456"},
            {"id": 2, "room": 42, "ciphertext": "CCCC", "iv": "DDDD", "sender": null,
             "created_at": "2024-05-01T10:01:00+00:00"}
        ]"#;
        let (base, request) = one_shot_http("200 OK", body).await;

        let history = local_history(&base);
        let messages = history.fetch(RoomId(42), "tok-9").await.unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id.0, 1);
        assert_eq!(messages[0].sender_username.as_deref(), Some("ana"));
        assert!(messages[0].created_at.is_some());
        assert_eq!(messages[1].sender, None);

        let head = request.await.unwrap();
        assert!(head.starts_with("GET /api/chat/rooms/42/messages/ HTTP/1.1"));
        assert!(head.to_ascii_lowercase().contains("authorization: bearer tok-9"));
    }

    #[tokio::test]
    async fn test_rest_history_status_error() {
        let (base, _request) = one_shot_http("401 Unauthorized", "{}").await;
        let history = local_history(&base);

        let err = history.fetch(RoomId(1), "expired").await.unwrap_err();
        assert!(matches!(err, HistoryError::Status(401)));
    }

    #[test]
    fn test_rest_history_rejects_ws_base() {
        assert!(RestHistory::new("ws://localhost", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_memory_history_failure_toggle() {
        let history = MemoryHistory::default();
        history.fail_with(Some("offline"));
        assert!(history.fetch(RoomId(1), "t").await.is_err());

        history.fail_with(None);
        assert!(history.fetch(RoomId(1), "t").await.unwrap().is_empty());
    }
}
