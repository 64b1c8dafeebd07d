//! Readiness probe for a server that may still be starting.

use std::time::Duration;
use termlink_core::{BridgeError, BridgeResult};
use tokio::net::TcpStream;
use tracing::debug;

/// Poll a TCP connect to `addr` until it is accepted, up to `attempts` times
/// `interval` apart.
pub async fn wait_for_server(addr: &str, attempts: u32, interval: Duration) -> BridgeResult<()> {
    for attempt in 1..=attempts.max(1) {
        match TcpStream::connect(addr).await {
            Ok(_) => {
                debug!(addr, attempt, "server is accepting connections");
                return Ok(());
            }
            Err(e) => {
                debug!(addr, attempt, error = %e, "server not ready");
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
    Err(BridgeError::Timeout)
}

/// `host:port` of a `ws://` or `wss://` URL.
pub fn socket_addr(url: &str) -> BridgeResult<String> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| BridgeError::Config(format!("not a URL: {url}")))?;
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    if authority.is_empty() {
        return Err(BridgeError::Config(format!("missing host: {url}")));
    }
    if authority.contains(':') && !authority.ends_with(']') {
        return Ok(authority.to_string());
    }
    let port = match scheme {
        "ws" | "http" => 80,
        "wss" | "https" => 443,
        other => return Err(BridgeError::Config(format!("unsupported scheme: {other}"))),
    };
    Ok(format!("{authority}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn ready_server_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        wait_for_server(&addr, 3, Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn absent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = wait_for_server(&addr, 3, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout));
    }

    #[test]
    fn socket_addr_from_url() {
        assert_eq!(socket_addr("ws://127.0.0.1:7681/terminal").unwrap(), "127.0.0.1:7681");
        assert_eq!(socket_addr("ws://example.com/terminal?x=1").unwrap(), "example.com:80");
        assert_eq!(socket_addr("wss://example.com").unwrap(), "example.com:443");
        assert!(socket_addr("example.com").is_err());
        assert!(socket_addr("ftp://example.com").is_err());
    }
}
