//! Endpoint URL helpers shared by the WebSocket transports.

use url::Url;

use crate::error::TransportError;

/// Parse `raw` and map `http`/`https` to `ws`/`wss`. WebSocket URLs pass
/// through unchanged.
pub fn websocket_url(raw: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(raw)
        .map_err(|e| TransportError::Other(format!("invalid endpoint URL '{raw}': {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::Other(format!(
                "unsupported URL scheme '{other}' (expected http, https, ws or wss)"
            )))
        }
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|_| TransportError::Other(format!("cannot rewrite scheme of '{raw}'")))?;
    }
    Ok(url)
}

/// Append `segment` to the path of `base`, keeping its query string.
pub fn join_path(base: &Url, segment: &str) -> Url {
    let mut url = base.clone();
    let path = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        segment.trim_start_matches('/')
    );
    url.set_path(&path);
    url
}
