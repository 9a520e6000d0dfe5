//! Outbound Peer Calls
//!
//! Every call opens a WebSocket to `ws://<peer>/peer`, sends one bincode
//! request, waits for one bincode reply and closes. The whole exchange is
//! bounded by the configured peer timeout and never retried.

use std::time::Duration;
use futures_util::{stream, SinkExt, StreamExt};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::game::state::PlayerId;
use crate::network::node::NodeError;
use crate::network::protocol::{PeerRequest, PeerResponse, RegisterRequest, RegisterResponse};

/// Path other nodes connect to.
pub const PEER_PATH: &str = "/peer";

/// Concurrent probes during a discovery sweep.
const DISCOVERY_CONCURRENCY: usize = 32;

/// Client for calls to other nodes.
#[derive(Debug, Clone)]
pub struct PeerClient {
    timeout: Duration,
}

impl PeerClient {
    /// Create a client with a per-call bound.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The per-call bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Perform one call. A `Rejected` reply becomes `NodeError::PeerRejected`.
    pub async fn call(&self, peer: &PlayerId, request: &PeerRequest) -> Result<PeerResponse, NodeError> {
        let unreachable = |reason: String| NodeError::PeerUnreachable {
            peer: peer.clone(),
            reason,
        };

        let response = match timeout(self.timeout, self.exchange(peer, request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => return Err(unreachable(format!("no reply within {:?}", self.timeout))),
        };

        match response {
            PeerResponse::Rejected { code, reason } => Err(NodeError::PeerRejected {
                peer: peer.clone(),
                code,
                reason,
            }),
            other => Ok(other),
        }
    }

    async fn exchange(&self, peer: &PlayerId, request: &PeerRequest) -> Result<PeerResponse, NodeError> {
        let url = format!("ws://{}{}", peer, PEER_PATH);
        let (mut ws, _) = connect_async(url.as_str()).await?;

        let bytes = request.to_bytes()?;
        #[cfg(feature = "debug-tracing")]
        debug!("-> {} {} ({} bytes)", peer, request.kind(), bytes.len());
        ws.send(Message::Binary(bytes)).await?;

        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Binary(data) => {
                    let response = PeerResponse::from_bytes(&data)?;
                    let _ = ws.close(None).await;
                    return Ok(response);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        Err(NodeError::PeerUnreachable {
            peer: peer.clone(),
            reason: "connection closed before reply".to_string(),
        })
    }

    /// Register with every candidate concurrently. Stops collecting when
    /// `budget` runs out; candidates that failed or had not answered by
    /// then are dropped.
    pub async fn discover(
        &self,
        candidates: Vec<PlayerId>,
        request: RegisterRequest,
        budget: Duration,
    ) -> Vec<RegisterResponse> {
        let total = candidates.len();
        let found: Vec<RegisterResponse> = stream::iter(candidates)
            .map(|candidate| {
                let request = PeerRequest::Register(request.clone());
                async move {
                    match self.call(&candidate, &request).await {
                        Ok(PeerResponse::Registered(response)) => Some(response),
                        Ok(other) => {
                            warn!("Unexpected register reply from {}: {:?}", candidate, other);
                            None
                        }
                        Err(e) => {
                            debug!("Candidate {} dropped: {}", candidate, e);
                            None
                        }
                    }
                }
            })
            .buffer_unordered(DISCOVERY_CONCURRENCY)
            .take_until(sleep(budget))
            .filter_map(|r| async move { r })
            .collect()
            .await;

        debug!("Discovery probed {} candidates, {} answered", total, found.len());
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn id(port: u16) -> PlayerId {
        PlayerId::from_parts("127.0.0.1", port)
    }

    /// A port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_call_to_closed_port_is_unreachable() {
        let port = closed_port().await;
        let client = PeerClient::new(Duration::from_millis(500));

        let err = client.call(&id(port), &PeerRequest::Ping).await.unwrap_err();
        assert!(matches!(err, NodeError::PeerUnreachable { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        // Accepts TCP but never completes the WebSocket handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = PeerClient::new(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = client.call(&id(port), &PeerRequest::Ping).await.unwrap_err();

        assert!(matches!(err, NodeError::PeerUnreachable { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_discover_drops_dead_candidates() {
        let client = PeerClient::new(Duration::from_millis(300));
        let candidates = vec![id(closed_port().await), id(closed_port().await)];
        let request = RegisterRequest {
            address: id(1),
            known_peers: Vec::new(),
            ready: Vec::new(),
        };

        let found = client.discover(candidates, request, Duration::from_secs(2)).await;
        assert!(found.is_empty());
    }
}
