//! WebSocket endpoint configuration and authenticated URL construction.
//!
//! The access token travels as a `token` query parameter: mobile WebSocket
//! handshakes cannot carry custom headers.

use std::time::Duration;

use url::Url;

use hearth_shared::constants::TOKEN_QUERY_PARAM;
use hearth_shared::ChannelKind;

use crate::error::TransportError;

/// Default wait after the upgrade for an immediate server-side close.
pub const DEFAULT_OPEN_GRACE: Duration = Duration::from_millis(150);

/// Where and how the transport connects.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `ws://` or `wss://` origin, optionally with a path prefix.
    pub base_url: Url,

    /// How long to wait after the HTTP upgrade for the server to close the
    /// socket before the channel is reported `OPEN`. The backend
    /// authenticates after accepting the upgrade, so a bad token shows up as
    /// a close within this window. Zero disables the wait.
    pub open_grace: Duration,
}

impl TransportConfig {
    /// Parse `base`. `http(s)` origins are mapped to `ws(s)`.
    pub fn new(base: &str) -> Result<Self, TransportError> {
        let mut base_url =
            Url::parse(base).map_err(|e| TransportError::InvalidEndpoint(format!("{base}: {e}")))?;

        let scheme = match base_url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "unsupported scheme {other:?}"
                )))
            }
        };
        if base_url.scheme() != scheme {
            base_url
                .set_scheme(scheme)
                .map_err(|_| TransportError::InvalidEndpoint(format!("cannot use scheme {scheme}")))?;
        }
        if base_url.host_str().is_none() {
            return Err(TransportError::InvalidEndpoint(format!("{base}: missing host")));
        }

        Ok(Self {
            base_url,
            open_grace: DEFAULT_OPEN_GRACE,
        })
    }

    pub fn with_open_grace(mut self, open_grace: Duration) -> Self {
        self.open_grace = open_grace;
        self
    }

    /// `{base}{path}?token={token}` for the given channel.
    pub fn channel_url(&self, kind: ChannelKind, token: &str) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        let path = format!("{}{}", self.base_url.path().trim_end_matches('/'), kind.path());
        url.set_path(&path);
        url.set_fragment(None);
        url.query_pairs_mut()
            .clear()
            .append_pair(TOKEN_QUERY_PARAM, token);
        Ok(url)
    }
}

/// URL without its query string, safe to log.
pub fn redact(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}
