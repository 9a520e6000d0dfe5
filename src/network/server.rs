//! WebSocket Node Server
//!
//! One TCP port per node. The WebSocket upgrade is routed by path:
//! `/peer` serves bincode calls from other nodes, anything else (normally
//! `/ws`) is a local client speaking JSON.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::game::session::SessionConfig;
use crate::game::state::PlayerId;
use crate::network::node::{now_ms, NodeConfig, PeerNode};
use crate::network::peer::PEER_PATH;
use crate::network::protocol::{
    ClientMessage, ErrorCode, PeerRequest, PeerResponse, ServerMessage, StateSnapshot,
};
use crate::network::registry::subnet_candidates;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host part of this node's identifier.
    pub own_host: String,
    /// Bind address. Port 0 picks a free port, which then becomes part of
    /// the identifier.
    pub bind_addr: SocketAddr,
    /// Prefix length of the subnet swept by `discover`.
    pub netmask_cidr: u8,
    /// Explicit discovery candidates.
    pub peers: Vec<PlayerId>,
    /// Game rules, quorum included.
    pub session: SessionConfig,
    /// Bound on each outbound peer call.
    pub peer_timeout: Duration,
    /// Bound on a whole discovery sweep.
    pub discover_budget: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// State push interval while a ball is live.
    pub refresh_interval: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            own_host: "127.0.0.1".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            netmask_cidr: 24,
            peers: Vec::new(),
            session: SessionConfig::default(),
            peer_timeout: Duration::from_millis(1500),
            discover_budget: Duration::from_secs(5),
            max_connections: 64,
            refresh_interval: Duration::from_secs(1),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, GameServerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any name -> value lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GameServerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |name: &str| -> Result<Option<u64>, GameServerError> {
            lookup(name).map(|raw| parse_var(name, &raw)).transpose()
        };

        let port: u16 = match lookup("PORT") {
            Some(raw) => parse_var("PORT", &raw)?,
            None => defaults.bind_addr.port(),
        };
        let bind_addr = match lookup("BIND_ADDR") {
            Some(raw) => parse_var("BIND_ADDR", &raw)?,
            None => SocketAddr::from(([0, 0, 0, 0], port)),
        };
        let netmask_cidr = match lookup("NETMASK_CIDR") {
            Some(raw) => parse_var("NETMASK_CIDR", &raw)?,
            None => defaults.netmask_cidr,
        };
        let peers = match lookup("PEERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| PlayerId::parse(s).map_err(|e| GameServerError::Config(format!("PEERS: {}", e))))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let mut session = defaults.session.clone();
        if let Some(quorum) = parse("QUORUM")? {
            session.quorum = quorum as usize;
        }

        Ok(Self {
            own_host: lookup("OWN_HOST").unwrap_or(defaults.own_host),
            bind_addr,
            netmask_cidr,
            peers,
            session,
            peer_timeout: parse("PEER_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.peer_timeout),
            discover_budget: parse("DISCOVER_BUDGET_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.discover_budget),
            max_connections: parse("MAX_CONNECTIONS")?
                .map(|n| n as usize)
                .unwrap_or(defaults.max_connections),
            refresh_interval: defaults.refresh_interval,
            version: defaults.version,
        })
    }

    /// Discovery candidates for a node listening on `port`: the explicit
    /// peers, then the subnet of `own_host` when it is a routable IPv4
    /// address.
    pub fn candidates(&self, port: u16) -> Vec<PlayerId> {
        let mut candidates = self.peers.clone();
        if let Ok(own) = Ipv4Addr::from_str(&self.own_host) {
            if !own.is_loopback() && !own.is_unspecified() && self.netmask_cidr > 0 {
                candidates.extend(subnet_candidates(own, self.netmask_cidr, port));
            }
        }
        candidates.dedup();
        candidates
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T, GameServerError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| GameServerError::Config(format!("{}={:?}: {}", name, raw, e)))
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Counts a live connection until dropped.
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The node server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Bound listener.
    listener: TcpListener,
    /// Address actually bound.
    local_addr: SocketAddr,
    /// The node behind this port.
    node: Arc<PeerNode>,
    /// Live connections.
    connections: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Bind the listener and create the node. The identifier uses the port
    /// actually bound.
    pub async fn bind(config: ServerConfig) -> Result<Self, GameServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let self_id = PlayerId::parse(&format!("{}:{}", config.own_host, local_addr.port()))
            .map_err(|e| GameServerError::Config(format!("OWN_HOST: {}", e)))?;

        let node = PeerNode::new(NodeConfig {
            self_id,
            session: config.session.clone(),
            peer_timeout: config.peer_timeout,
            discover_budget: config.discover_budget,
            candidates: config.candidates(local_addr.port()),
            seed_nonce: now_ms() as u64,
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            listener,
            local_addr,
            node,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The node behind this server.
    pub fn node(&self) -> &Arc<PeerNode> {
        &self.node
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Run the server until `shutdown`.
    #[instrument(skip(self), fields(node = %self.node.self_id()))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        info!("Node {} listening on {}", self.node.self_id(), self.local_addr);

        let refresh_node = self.node.clone();
        let refresh_every = self.config.refresh_interval;
        let refresh_handle = tokio::spawn(async move {
            let mut ticker = interval(refresh_every);
            loop {
                ticker.tick().await;
                refresh_node.refresh().await;
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connection_count() >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        refresh_handle.abort();
        self.node.halt();
        Ok(())
    }

    /// Ask `run` and every connection to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Upgrade a connection and route it by path.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let node = self.node.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.connections.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard(self.connections.clone());

        tokio::spawn(async move {
            let _guard = guard;
            let mut path = String::new();
            let route = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();
                Ok(response)
            };

            let ws = match accept_hdr_async(stream, route).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            if path == PEER_PATH {
                serve_peer(ws, addr, node).await;
            } else {
                if path != "/ws" {
                    debug!("Client {} connected on {:?}, treating as /ws", addr, path);
                }
                serve_client(ws, addr, node, shutdown_rx).await;
            }
        });
    }
}

/// Answer bincode requests from another node.
async fn serve_peer(mut ws: WebSocketStream<TcpStream>, addr: SocketAddr, node: Arc<PeerNode>) {
    while let Some(msg) = ws.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Peer connection {} failed: {}", addr, e);
                break;
            }
        };

        let response = match PeerRequest::from_bytes(&data) {
            Ok(request) => node.handle_peer(request).await,
            Err(e) => {
                warn!("Undecodable peer request from {}: {}", addr, e);
                PeerResponse::Rejected {
                    code: ErrorCode::InvalidMessage,
                    reason: e.to_string(),
                }
            }
        };

        let bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize peer response: {}", e);
                break;
            }
        };
        if ws.send(Message::Binary(bytes)).await.is_err() {
            break;
        }
    }
}

/// Serve a local client: requests in, replies and state pushes out.
async fn serve_client(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    node: Arc<PeerNode>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Client {} connected", addr);
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut state_rx = node.broadcaster().subscribe();
    let initial = StateSnapshot::clone(&state_rx.borrow_and_update());
    let _ = msg_tx.send(ServerMessage::State(initial)).await;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match ClientMessage::from_json(&text) {
                            Ok(request) => handle_client_message(&node, request).await,
                            Err(e) => {
                                debug!("Invalid message from {}: {}", addr, e);
                                ServerMessage::invalid_message(e)
                            }
                        };
                        if msg_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = StateSnapshot::clone(&state_rx.borrow_and_update());
                if msg_tx.send(ServerMessage::State(snapshot)).await.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                let _ = msg_tx.send(ServerMessage::Shutdown {
                    reason: "Server shutting down".to_string(),
                }).await;
                break;
            }
        }
    }

    // Let queued replies drain before closing
    drop(msg_tx);
    let _ = tokio::time::timeout(Duration::from_millis(200), sender_task).await;
    info!("Client {} cleaned up", addr);
}

/// Apply one client request and build the reply.
async fn handle_client_message(node: &Arc<PeerNode>, msg: ClientMessage) -> ServerMessage {
    let ack = |action: &str| ServerMessage::Ack { action: action.to_string() };

    let result = match msg {
        ClientMessage::Discover => {
            return ServerMessage::Discovered { found: node.discover().await };
        }
        ClientMessage::Ready => node.ready().await.map(|_| ack("ready")),
        ClientMessage::StartGame => node.start_game().await.map(|_| ack("start_game")),
        ClientMessage::PassBall { new_word, client_timestamp_ms, sequence } => node
            .pass_ball(&new_word, client_timestamp_ms, sequence)
            .await
            .map(|_| ack("pass_ball")),
        ClientMessage::Rematch => node.rematch().await.map(|_| ack("rematch")),
        ClientMessage::Combo { combo_key } => node.combo(&combo_key).await.map(|_| ack("combo")),
        ClientMessage::PowerUp => node.power_up().await.map(|_| ack("power_up")),
        ClientMessage::Players => return ServerMessage::Players(node.players().await),
        ClientMessage::GetState => return ServerMessage::State(node.state().await),
        ClientMessage::Ping { timestamp } => {
            return ServerMessage::Pong {
                timestamp,
                server_time: now_ms().max(0) as u64,
            };
        }
    };

    result.unwrap_or_else(|e| {
        debug!("Request rejected: {}", e);
        ServerMessage::Error(e.to_server_error())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::GamePhase;
    use rand::Rng;
    use std::collections::BTreeMap;
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    fn loopback(peers: Vec<PlayerId>, quorum: usize) -> ServerConfig {
        let mut config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            peers,
            peer_timeout: Duration::from_millis(1000),
            discover_budget: Duration::from_secs(2),
            ..Default::default()
        };
        config.session.quorum = quorum;
        config
    }

    async fn start(config: ServerConfig) -> Arc<GameServer> {
        let server = Arc::new(GameServer::bind(config).await.unwrap());
        let runner = server.clone();
        tokio::spawn(async move { runner.run().await });
        server
    }

    /// Poll `node` until `check` holds on its snapshot.
    async fn wait_for<F>(node: &PeerNode, check: F) -> StateSnapshot
    where
        F: Fn(&StateSnapshot) -> bool,
    {
        for _ in 0..100 {
            let state = node.state().await;
            if check(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        panic!("condition not reached on {}", node.self_id());
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 5000);
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.session.quorum, 1);
        assert_eq!(config.peer_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: BTreeMap<&str, &str> = [
            ("OWN_HOST", "192.168.1.20"),
            ("PORT", "6000"),
            ("QUORUM", "3"),
            ("PEERS", "10.0.0.2:6000, 10.0.0.3:6001"),
            ("PEER_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();

        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.bind_addr, SocketAddr::from(([0, 0, 0, 0], 6000)));
        assert_eq!(config.session.quorum, 3);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peer_timeout, Duration::from_millis(250));
        assert_eq!(config.discover_budget, Duration::from_secs(5));

        // Two explicit peers plus the /24 minus this host
        assert_eq!(config.candidates(6000).len(), 2 + 253);

        let bad = ServerConfig::from_lookup(|k| (k == "PORT").then(|| "http".to_string()));
        assert!(matches!(bad, Err(GameServerError::Config(_))));
        let bad = ServerConfig::from_lookup(|k| (k == "PEERS").then(|| "nope".to_string()));
        assert!(matches!(bad, Err(GameServerError::Config(_))));
    }

    #[test]
    fn test_loopback_host_skips_sweep() {
        let config = ServerConfig::default();
        assert!(config.candidates(5000).is_empty());
    }

    #[tokio::test]
    async fn test_two_nodes_play_a_turn() {
        let a = start(loopback(Vec::new(), 2)).await;
        let a_id = a.node().self_id().clone();
        let b = start(loopback(vec![a_id.clone()], 2)).await;
        let b_id = b.node().self_id().clone();

        // Idempotent registration
        assert_eq!(b.node().discover().await, vec![a_id.clone()]);
        assert_eq!(b.node().discover().await, vec![a_id.clone()]);
        assert_eq!(a.node().players().await.peers.len(), 2);
        assert_eq!(b.node().players().await.peers.len(), 2);

        a.node().ready().await.unwrap();
        wait_for(b.node(), |s| s.ready.contains(&a_id)).await;
        assert_eq!(b.node().state().await.phase, GamePhase::Lobby);
        b.node().ready().await.unwrap();

        // Exactly one node starts; both end up agreeing on the holder
        let started = wait_for(a.node(), |s| s.phase == GamePhase::Active).await;
        let holder = started.holder.clone().unwrap();
        wait_for(b.node(), |s| s.holder.as_ref() == Some(&holder)).await;

        let (passer, other) = if holder == a_id { (&a, &b) } else { (&b, &a) };
        let other_id = other.node().self_id().clone();
        let letter = rand::thread_rng().gen_range(b'a'..=b'z') as char;
        let word = format!("{}{}", started.word.unwrap(), letter);

        passer.node().pass_ball(&word, now_ms(), Some(0)).await.unwrap();

        let received = other.node().state().await;
        assert_eq!(received.holder, Some(other_id.clone()));
        assert_eq!(received.word.as_deref(), Some(word.as_str()));
        assert_eq!(received.sequence, Some(1));
        assert_eq!(received.history.len(), 1);
        assert_eq!(other.node().armed_sequence(), Some(1));

        let after = passer.node().state().await;
        assert_eq!(after.holder, Some(other_id));
        assert_eq!(passer.node().armed_sequence(), None);
        assert_ne!(b_id, a_id);

        a.shutdown();
        b.shutdown();
    }

    type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn next_message(ws: &mut ClientWs) -> ServerMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(3), ws.next())
                .await
                .expect("no message in time")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = msg {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    /// Skip state pushes until a reply that is not one arrives.
    async fn next_reply(ws: &mut ClientWs) -> ServerMessage {
        loop {
            match next_message(ws).await {
                ServerMessage::State(_) => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn test_client_session() {
        let server = start(loopback(Vec::new(), 1)).await;
        let url = format!("ws://127.0.0.1:{}/ws", server.local_addr().port());
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        match next_message(&mut ws).await {
            ServerMessage::State(state) => assert_eq!(state.phase, GamePhase::Lobby),
            other => panic!("Expected initial state, got {:?}", other),
        }

        ws.send(Message::Text(r#"{"type":"ready"}"#.into())).await.unwrap();
        match next_reply(&mut ws).await {
            ServerMessage::Ack { action } => assert_eq!(action, "ready"),
            other => panic!("Expected ack, got {:?}", other),
        }

        ws.send(Message::Text(r#"{"type":"get_state"}"#.into())).await.unwrap();
        let state = loop {
            if let ServerMessage::State(state) = next_message(&mut ws).await {
                if state.phase == GamePhase::Active {
                    break state;
                }
            }
        };
        let word = state.word.unwrap();

        // Not an extension of the current word
        let bad = format!(
            r#"{{"type":"pass_ball","new_word":"{}","client_timestamp_ms":{}}}"#,
            "AB", now_ms()
        );
        ws.send(Message::Text(bad)).await.unwrap();
        match next_reply(&mut ws).await {
            ServerMessage::Error(e) => assert_eq!(e.code, ErrorCode::InvalidWord),
            other => panic!("Expected error, got {:?}", other),
        }

        let good = format!(
            r#"{{"type":"pass_ball","new_word":"{}e","client_timestamp_ms":{},"sequence":0}}"#,
            word, now_ms()
        );
        ws.send(Message::Text(good)).await.unwrap();
        match next_reply(&mut ws).await {
            ServerMessage::Ack { action } => assert_eq!(action, "pass_ball"),
            other => panic!("Expected ack, got {:?}", other),
        }

        ws.send(Message::Text("not json".into())).await.unwrap();
        match next_reply(&mut ws).await {
            ServerMessage::Error(e) => assert_eq!(e.code, ErrorCode::InvalidMessage),
            other => panic!("Expected error, got {:?}", other),
        }

        ws.send(Message::Text(r#"{"type":"players"}"#.into())).await.unwrap();
        match next_reply(&mut ws).await {
            ServerMessage::Players(info) => {
                assert_eq!(info.peers.len(), 1);
                assert!(info.peers[0].is_self);
            }
            other => panic!("Expected players, got {:?}", other),
        }
        assert_eq!(server.connection_count(), 1);

        server.shutdown();
        match next_reply(&mut ws).await {
            ServerMessage::Shutdown { .. } => {}
            other => panic!("Expected shutdown, got {:?}", other),
        }
    }
}
