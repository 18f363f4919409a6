//! In-process WebSocket server for exercising the transport end to end.
//!
//! Enabled for this crate's own tests and, through the `test-util` feature,
//! for downstream crates.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::debug;

use hearth_shared::constants::TOKEN_QUERY_PARAM;

use crate::endpoint::TransportConfig;
use crate::error::TransportError;

const WAIT: Duration = Duration::from_secs(5);

/// Grace used by [`TestServer::config`]: long enough for a loopback close.
pub const TEST_OPEN_GRACE: Duration = Duration::from_millis(200);

/// How the server answers the next upgrade requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Accept,
    /// Refuse the upgrade with this HTTP status.
    RejectHttp(u16),
    /// Upgrade, then close at once with this close code.
    CloseAfterUpgrade(u16),
}

pub struct TestServer {
    addr: SocketAddr,
    behavior: Arc<Mutex<Behavior>>,
    connections: mpsc::UnboundedReceiver<ServerConn>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let behavior = Arc::new(Mutex::new(Behavior::Accept));
        let (tx, connections) = mpsc::unbounded_channel();

        let task = tokio::spawn(accept_loop(listener, behavior.clone(), tx));

        Ok(Self {
            addr,
            behavior,
            connections,
            task,
        })
    }

    pub fn ws_base(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn config(&self) -> Result<TransportConfig, TransportError> {
        Ok(TransportConfig::new(&self.ws_base())?.with_open_grace(TEST_OPEN_GRACE))
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self
            .behavior
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = behavior;
    }

    /// Next accepted connection, or `None` after a few seconds.
    pub async fn next_connection(&mut self) -> Option<ServerConn> {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    behavior: Arc<Mutex<Behavior>>,
    tx: mpsc::UnboundedSender<ServerConn>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let behavior = *behavior
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(conn) = handshake(stream, behavior).await {
                let _ = tx.send(conn);
            }
        });
    }
}

async fn handshake(stream: TcpStream, behavior: Behavior) -> Option<ServerConn> {
    let mut target = None;
    let callback = |req: &Request, resp: Response| {
        target = Some(req.uri().clone());
        match behavior {
            Behavior::RejectHttp(status) => Err(reject(status)),
            _ => Ok(resp),
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "test server handshake ended");
            return None;
        }
    };

    let uri = target?;
    let token = uri.query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == TOKEN_QUERY_PARAM)
            .map(|(_, value)| value.into_owned())
    });
    let mut conn = ServerConn {
        path: uri.path().to_string(),
        token,
        ws,
    };

    if let Behavior::CloseAfterUpgrade(code) = behavior {
        conn.close(code).await;
    }
    Some(conn)
}

fn reject(status: u16) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("rejected".to_string()));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::FORBIDDEN);
    response
}

/// Server side of one accepted socket.
pub struct ServerConn {
    pub path: String,
    pub token: Option<String>,
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    /// Returns `false` if the client is already gone.
    pub async fn send_text(&mut self, text: impl Into<String>) -> bool {
        self.ws.send(Message::Text(text.into())).await.is_ok()
    }

    pub async fn send_json(&mut self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string()).await
    }

    pub async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        let _ = self.ws.close(Some(frame)).await;
    }

    /// Next text frame from the client, skipping control frames.
    pub async fn next_text(&mut self) -> Option<String> {
        let read = async {
            while let Some(message) = self.ws.next().await {
                match message {
                    Ok(Message::Text(text)) => return Some(text),
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
            None
        };
        tokio::time::timeout(WAIT, read).await.ok().flatten()
    }

    /// Wait until the client closes the socket.
    pub async fn closed_by_client(&mut self) -> bool {
        let read = async {
            while let Some(message) = self.ws.next().await {
                match message {
                    Ok(Message::Close(_)) | Err(_) => return true,
                    Ok(_) => continue,
                }
            }
            true
        };
        tokio::time::timeout(WAIT, read).await.unwrap_or(false)
    }
}
