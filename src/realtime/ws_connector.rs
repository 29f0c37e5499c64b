use crate::realtime::*;
use futures_util::StreamExt;
use reqwest::Url;
use tokio_tungstenite::connect_async;

/// Realtime endpoint on the API host: same host and port, scheme upgraded
/// (`http` → `ws`, `https` → `wss`).
pub fn realtime_url(api_base: &str, path: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(api_base)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => anyhow::bail!("unsupported api scheme: {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot switch {api_base} to {scheme}"))?;
    url.set_path(path);
    url.set_query(None);
    Ok(url.to_string())
}

pub struct WsConnector;

#[async_trait::async_trait]
impl RealtimeConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<ConnHalves, RealtimeError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| RealtimeError::Transport(format!("websocket connect: {e}")))?;
        let (sink, stream) = ws.split();
        Ok((Box::new(sink), Box::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrades_scheme_and_keeps_host() {
        assert_eq!(
            realtime_url("https://api.example.org/v1", "/ws").unwrap(),
            "wss://api.example.org/ws"
        );
        assert_eq!(
            realtime_url("http://127.0.0.1:8080", "/ws").unwrap(),
            "ws://127.0.0.1:8080/ws"
        );
        assert!(realtime_url("ftp://example.org", "/ws").is_err());
    }
}
