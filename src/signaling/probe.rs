//! Erreichbarkeitstest für den Signaling-Endpunkt
//!
//! Ein einzelner WebSocket-Verbindungsversuch mit festem Timeout.
//! Die Probe-Verbindung wird in jedem Fall wieder geschlossen.

use async_trait::async_trait;
use std::time::Duration;
use tokio_tungstenite::connect_async;

use super::ws::sip_ws_request;

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// `true` wenn der Endpunkt innerhalb des Timeouts erreichbar ist
    async fn probe(&self, endpoint: &str, timeout: Duration) -> bool;
}

/// Probe über einen WebSocket-Handshake
#[derive(Debug, Default, Clone, Copy)]
pub struct WsProbe;

#[async_trait]
impl ConnectivityProbe for WsProbe {
    async fn probe(&self, endpoint: &str, timeout: Duration) -> bool {
        tracing::debug!("Probing {} (timeout {:?})", endpoint, timeout);

        let request = match sip_ws_request(endpoint) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Probe to {} failed: {}", endpoint, e);
                return false;
            }
        };

        match tokio::time::timeout(timeout, connect_async(request)).await {
            Ok(Ok((mut ws_stream, _))) => {
                if let Err(e) = ws_stream.close(None).await {
                    tracing::debug!("Probe close failed: {}", e);
                }
                true
            }
            Ok(Err(e)) => {
                tracing::warn!("Probe to {} failed: {}", endpoint, e);
                false
            }
            // Der abgebrochene Verbindungsversuch wird mit dem Future gedroppt
            Err(_) => {
                tracing::warn!("Probe to {} timed out after {:?}", endpoint, timeout);
                false
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    #[tokio::test]
    async fn test_probe_accepts_websocket_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let _ = tokio_tungstenite::accept_hdr_async(
                    stream,
                    |_req: &Request, mut resp: Response| {
                        resp.headers_mut()
                            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("sip"));
                        Ok(resp)
                    },
                )
                .await;
            }
        });

        let reachable = WsProbe
            .probe(&format!("ws://{}", addr), Duration::from_secs(5))
            .await;
        assert!(reachable);
    }

    #[tokio::test]
    async fn test_probe_rejects_non_websocket_endpoint() {
        let reachable = WsProbe
            .probe("http://127.0.0.1:1", Duration::from_millis(200))
            .await;
        assert!(!reachable);
    }

    #[tokio::test]
    async fn test_probe_refused() {
        // Port binden und sofort freigeben, damit niemand lauscht
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let reachable = WsProbe
            .probe(&format!("ws://{}", addr), Duration::from_secs(5))
            .await;
        assert!(!reachable);
    }

    #[tokio::test]
    async fn test_probe_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Verbindung annehmen, aber nie den Handshake beantworten
        let _guard = tokio::spawn(async move {
            let _conn = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let started = tokio::time::Instant::now();
        let reachable = WsProbe
            .probe(&format!("ws://{}", addr), Duration::from_millis(200))
            .await;
        assert!(!reachable);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
