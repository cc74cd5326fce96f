//! The negotiate step: an HTTP POST that yields the connection token used
//! on the WebSocket URL.

use serde::Deserialize;
use url::Url;

use hublink_core::endpoint::{join_path, websocket_url};
use hublink_core::TransportError;

/// Negotiate redirects are followed at most this many times.
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    pub connection_id: Option<String>,
    pub connection_token: Option<String>,
    pub negotiate_version: Option<u32>,
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
    /// Redirect to another endpoint (used by hosted hub services).
    pub url: Option<String>,
    pub access_token: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

impl NegotiateResponse {
    /// Token to put on the WebSocket URL. Version 1 servers hand out a
    /// separate `connectionToken`; version 0 servers only the id.
    pub fn token(&self) -> Option<&str> {
        self.connection_token
            .as_deref()
            .or(self.connection_id.as_deref())
    }

    /// `true` if the server lists WebSockets with text framing, or lists
    /// nothing at all.
    pub fn supports_websockets(&self) -> bool {
        self.available_transports.is_empty()
            || self.available_transports.iter().any(|t| {
                t.transport.eq_ignore_ascii_case("WebSockets")
                    && (t.transfer_formats.is_empty()
                        || t.transfer_formats.iter().any(|f| f == "Text"))
            })
    }
}

/// The negotiate endpoint for `base`.
pub fn negotiate_url(base: &Url) -> Url {
    let mut url = join_path(base, "negotiate");
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    url
}

/// POST to the negotiate endpoint, following redirects, and build the
/// WebSocket URL to connect to. Returns the URL and an optional bearer
/// token handed out by a redirect.
pub async fn negotiate(
    http: &reqwest::Client,
    endpoint: &str,
) -> Result<(Url, Option<String>), TransportError> {
    let mut base = Url::parse(endpoint)
        .map_err(|e| TransportError::Other(format!("invalid hub URL '{endpoint}': {e}")))?;
    let mut access_token: Option<String> = None;

    for _ in 0..=MAX_REDIRECTS {
        let url = negotiate_url(&base);
        tracing::debug!(url = %url, "negotiating");

        let mut req = http.post(url.clone());
        if let Some(token) = &access_token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!(
                "negotiate returned HTTP {status}"
            )));
        }
        let mut body: NegotiateResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Http(format!("negotiate response: {e}")))?;

        if let Some(error) = body.error.take() {
            return Err(TransportError::Handshake(error));
        }
        if let Some(redirect) = body.url.take() {
            base = Url::parse(&redirect)
                .map_err(|e| TransportError::Handshake(format!("bad redirect '{redirect}': {e}")))?;
            access_token = body.access_token.take();
            continue;
        }
        if !body.supports_websockets() {
            return Err(TransportError::Handshake(
                "server does not offer the WebSockets transport".into(),
            ));
        }
        let ws = connection_url(&base, body.token())?;
        return Ok((ws, access_token));
    }

    Err(TransportError::Handshake(format!(
        "negotiate redirected more than {MAX_REDIRECTS} times"
    )))
}

/// WebSocket URL for `base`, carrying the negotiated token as `id`.
pub fn connection_url(base: &Url, token: Option<&str>) -> Result<Url, TransportError> {
    let mut url = websocket_url(base.as_str())?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("id", token);
    }
    Ok(url)
}
