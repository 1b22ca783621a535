// ABOUTME: Reachability probe for the configured alternate API endpoint
// ABOUTME: Tells "endpoint unreachable" apart from "endpoint answered"; only ever logs

use std::time::Duration;

/// What one probe found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// No alternate endpoint configured, nothing probed
    Skipped,
    /// The endpoint answered, with any HTTP status
    Reachable { status: u16 },
    /// Connection, DNS or timeout failure
    Unreachable { error: String },
}

#[derive(Debug, Clone)]
pub struct EndpointProbe {
    base_url: Option<String>,
    client: reqwest::Client,
}

impl EndpointProbe {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build probe client, using defaults");
                reqwest::Client::new()
            });
        Self { base_url, client }
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// GET the endpoint once and log the result
    pub async fn probe(&self) -> ProbeOutcome {
        let Some(ref base_url) = self.base_url else {
            return ProbeOutcome::Skipped;
        };

        tracing::info!(base_url = %base_url, "Diagnosing API endpoint connectivity");
        match self.client.get(base_url).send().await {
            Ok(response) => {
                let status = response.status();
                tracing::info!(
                    status = status.as_u16(),
                    status_text = status.canonical_reason().unwrap_or(""),
                    "API endpoint reachable"
                );
                ProbeOutcome::Reachable {
                    status: status.as_u16(),
                }
            }
            Err(e) => {
                tracing::error!(base_url = %base_url, error = %e, "API endpoint unreachable");
                ProbeOutcome::Unreachable {
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_skipped_without_endpoint() {
        let probe = EndpointProbe::new(None, Duration::from_secs(1));
        assert_eq!(probe.probe().await, ProbeOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_any_status_counts_as_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
        });

        let probe = EndpointProbe::new(Some(url), Duration::from_secs(5));
        assert_eq!(probe.probe().await, ProbeOutcome::Reachable { status: 404 });
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let probe = EndpointProbe::new(Some(url), Duration::from_secs(5));
        assert!(matches!(
            probe.probe().await,
            ProbeOutcome::Unreachable { .. }
        ));
    }

    #[tokio::test]
    async fn test_silent_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let probe = EndpointProbe::new(Some(url), Duration::from_millis(200));
        assert!(matches!(
            probe.probe().await,
            ProbeOutcome::Unreachable { .. }
        ));
        server.abort();
    }
}
