use url::Url;

use super::TransportError;

/// Builds the relay socket URL. The scheme follows the hosting context
/// (`https` -> `wss`, `http` -> `ws`) and the bearer token rides in the query.
pub fn relay_socket_url(relay_url: &str, token: &str) -> Result<Url, TransportError> {
    let base = Url::parse(relay_url)
        .map_err(|err| TransportError::Setup(format!("invalid relay url {relay_url}: {err}")))?;

    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported relay scheme: {other}"
            )));
        }
    };

    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    if ws.path().is_empty() || ws.path() == "/" {
        ws.set_path("ws");
    }
    ws.set_fragment(None);
    ws.query_pairs_mut().append_pair("token", token);
    Ok(ws)
}
