//! Peer Node
//!
//! One player's process: the owned `GameSession`, the registry of other
//! nodes, the loss timer and the snapshot broadcaster. Every operation a
//! local client or a remote node can ask for lands here.
//!
//! ```text
//!   /ws client ──► PeerNode ──► GameSession (turn lock)
//!                     │  ▲
//!      PeerClient ◄───┘  └─── /peer requests from other nodes
//!                     │
//!                     └──► LossTimer / StateBroadcaster
//! ```
//!
//! The session lock is never held across a peer call. Each operation
//! mutates under the lock, publishes a snapshot, releases, and only then
//! talks to other nodes.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::core::keypad::ComboKey;
use crate::game::power::ComboEffect;
use crate::game::scheduler::{ArmedBall, Handoff};
use crate::game::session::{GameSession, SessionConfig, TurnError, ValidationError};
use crate::game::state::{BallPayload, GameOverNotice, GamePhase, PlayerId};
use crate::network::broadcast::StateBroadcaster;
use crate::network::peer::PeerClient;
use crate::network::protocol::{
    ErrorCode, PeerRequest, PeerResponse, PlayersInfo, RegisterRequest, RegisterResponse,
    ServerError, StateSnapshot,
};
use crate::network::registry::PeerRegistry;
use crate::network::timer::LossTimer;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors surfaced by node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The game rules refused the request.
    #[error(transparent)]
    Turn(#[from] TurnError),

    /// A peer call failed or timed out.
    #[error("Peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: PlayerId, reason: String },

    /// A peer answered with a refusal.
    #[error("Peer {peer} rejected the call ({code:?}): {reason}")]
    PeerRejected {
        peer: PlayerId,
        code: ErrorCode,
        reason: String,
    },

    /// Peer frame could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// WebSocket failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Socket failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ValidationError> for NodeError {
    fn from(err: ValidationError) -> Self {
        NodeError::Turn(TurnError::Validation(err))
    }
}

impl NodeError {
    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            NodeError::Turn(e) => e.into(),
            NodeError::PeerUnreachable { .. } => ErrorCode::PeerUnreachable,
            NodeError::PeerRejected { .. } => ErrorCode::PeerRejected,
            NodeError::Codec(_) => ErrorCode::InvalidMessage,
            NodeError::WebSocket(_) | NodeError::Io(_) => ErrorCode::InternalError,
        }
    }

    /// Wire form for clients and peers.
    pub fn to_server_error(&self) -> ServerError {
        ServerError {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

// =============================================================================
// CONFIG
// =============================================================================

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's identifier
    pub self_id: PlayerId,
    /// Game rules
    pub session: SessionConfig,
    /// Bound on each outbound peer call
    pub peer_timeout: Duration,
    /// Bound on a whole discovery sweep
    pub discover_budget: Duration,
    /// Addresses probed by `discover`
    pub candidates: Vec<PlayerId>,
    /// Mixed into the node's random seed
    pub seed_nonce: u64,
}

impl NodeConfig {
    /// Defaults for a node known as `self_id`.
    pub fn new(self_id: PlayerId) -> Self {
        Self {
            self_id,
            session: SessionConfig::default(),
            peer_timeout: Duration::from_millis(1500),
            discover_budget: Duration::from_secs(5),
            candidates: Vec::new(),
            seed_nonce: 0,
        }
    }
}

// =============================================================================
// NODE
// =============================================================================

/// One player's node.
pub struct PeerNode {
    /// Configuration
    config: NodeConfig,
    /// Game state; this lock is the turn lock
    session: RwLock<GameSession>,
    /// Other nodes
    registry: RwLock<PeerRegistry>,
    /// Outbound calls
    client: PeerClient,
    /// Deadline of the ball this node holds
    timer: LossTimer,
    /// Snapshot push channel
    broadcaster: StateBroadcaster,
}

impl PeerNode {
    /// Create a node in the lobby.
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let session = GameSession::new(
            config.self_id.clone(),
            config.session.clone(),
            config.seed_nonce,
        );
        let broadcaster = StateBroadcaster::new(StateSnapshot::capture(&session, now_ms()));

        info!("Node {} created (quorum {})", config.self_id, config.session.quorum);

        Arc::new(Self {
            registry: RwLock::new(PeerRegistry::new(config.self_id.clone())),
            client: PeerClient::new(config.peer_timeout),
            session: RwLock::new(session),
            timer: LossTimer::new(),
            broadcaster,
            config,
        })
    }

    /// This node's identifier.
    pub fn self_id(&self) -> &PlayerId {
        &self.config.self_id
    }

    /// Snapshot push channel.
    pub fn broadcaster(&self) -> &StateBroadcaster {
        &self.broadcaster
    }

    /// Sequence the loss timer is armed for.
    pub fn armed_sequence(&self) -> Option<u64> {
        self.timer.armed_sequence()
    }

    fn publish(&self, session: &GameSession) {
        self.broadcaster.publish(StateSnapshot::capture(session, now_ms()));
    }

    /// Re-publish while a ball is live so remaining time keeps moving.
    pub async fn refresh(&self) {
        let session = self.session.read().await;
        if session.phase() == GamePhase::Active {
            self.publish(&session);
        }
    }

    /// Stop the loss timer. Used on shutdown.
    pub fn halt(&self) {
        self.timer.cancel_all();
    }

    // -------------------------------------------------------------------------
    // Discovery and registration
    // -------------------------------------------------------------------------

    async fn register_request(&self) -> RegisterRequest {
        let known_peers = self.registry.read().await.remote_peers();
        let ready = ready_set(&*self.session.read().await);
        RegisterRequest {
            address: self.self_id().clone(),
            known_peers,
            ready,
        }
    }

    /// Add peers and the readiness they reported.
    async fn learn(&self, peers: &[PlayerId], ready: &[PlayerId]) {
        {
            let mut registry = self.registry.write().await;
            let fresh = peers.iter().filter(|p| registry.register((*p).clone())).count();
            if fresh > 0 {
                debug!("Learned {} new peers ({} known)", fresh, registry.len());
            }
        }

        let mut session = self.session.write().await;
        for peer in peers {
            if peer != self.self_id() {
                session.add_participant(peer.clone());
            }
        }
        if session.phase() == GamePhase::Lobby {
            for id in ready {
                if let Err(e) = session.mark_ready(id) {
                    debug!("Ready state for {} not applied: {}", id, e);
                }
            }
        }
        self.publish(&session);
    }

    /// Probe the configured candidates and register with whoever answers.
    /// Peers learned second-hand are registered with as well. Returns every
    /// node that answered.
    #[instrument(skip(self))]
    pub async fn discover(self: &Arc<Self>) -> Vec<PlayerId> {
        let candidates: Vec<PlayerId> = self
            .config
            .candidates
            .iter()
            .filter(|c| *c != self.self_id())
            .cloned()
            .collect();
        info!("Discovering among {} candidates", candidates.len());

        let mut found = Vec::new();
        let mut round = candidates;
        // Second round covers peers only known through the first
        for _ in 0..2 {
            if round.is_empty() {
                break;
            }
            let request = self.register_request().await;
            let responses = self
                .client
                .discover(round, request, self.config.discover_budget)
                .await;

            let mut learned = Vec::new();
            for response in responses {
                if let Err(e) = response.validate() {
                    warn!("Ignoring registration reply: {}", e);
                    continue;
                }
                let mut peers = vec![response.self_id.clone()];
                peers.extend(response.known_peers.iter().cloned());
                self.learn(&peers, &response.ready).await;
                self.registry.write().await.mark_reachable(&response.self_id);

                learned.extend(response.known_peers);
                found.push(response.self_id);
            }

            round = learned
                .into_iter()
                .filter(|p| p != self.self_id() && !found.contains(p))
                .collect();
            round.sort();
            round.dedup();
        }

        info!("Discovery found {} peers", found.len());
        self.maybe_auto_start().await;
        found
    }

    /// A peer registered with this node.
    pub async fn handle_register(
        self: &Arc<Self>,
        request: RegisterRequest,
    ) -> Result<RegisterResponse, NodeError> {
        request.validate()?;
        let mut peers = vec![request.address.clone()];
        peers.extend(request.known_peers);
        self.learn(&peers, &request.ready).await;
        self.registry.write().await.mark_reachable(&request.address);

        let response = RegisterResponse {
            self_id: self.self_id().clone(),
            known_peers: self.registry.read().await.remote_peers(),
            ready: ready_set(&*self.session.read().await),
        };

        let node = Arc::clone(self);
        tokio::spawn(async move { node.maybe_auto_start().await });
        Ok(response)
    }

    // -------------------------------------------------------------------------
    // Lobby
    // -------------------------------------------------------------------------

    /// Mark this node's player ready and tell every peer.
    pub async fn ready(self: &Arc<Self>) -> Result<(), NodeError> {
        let changed = {
            let mut session = self.session.write().await;
            let changed = session.mark_ready(self.self_id())?;
            self.publish(&session);
            changed
        };

        if changed {
            let peers = self.registry.read().await.remote_peers();
            let request = PeerRequest::NotifyReady {
                player: self.self_id().clone(),
            };
            self.fan_out(request, peers).await;
        }

        self.maybe_auto_start().await;
        Ok(())
    }

    /// A peer reports a participant ready.
    pub async fn handle_notify_ready(self: &Arc<Self>, player: PlayerId) -> Result<(), NodeError> {
        player.validate()?;
        self.registry.write().await.register(player.clone());
        {
            let mut session = self.session.write().await;
            session.mark_ready(&player)?;
            self.publish(&session);
        }

        let node = Arc::clone(self);
        tokio::spawn(async move { node.maybe_auto_start().await });
        Ok(())
    }

    /// Start the game if this node is the one that should.
    async fn maybe_auto_start(self: &Arc<Self>) {
        if !self.session.read().await.should_auto_start() {
            return;
        }
        match self.start_game().await {
            Ok(()) => {}
            // Another path started it first
            Err(NodeError::Turn(TurnError::Validation(ValidationError::WrongPhase(_)))) => {}
            Err(e) => warn!("Auto-start failed: {}", e),
        }
    }

    /// Start a game now if the quorum is met.
    #[instrument(skip(self))]
    pub async fn start_game(self: &Arc<Self>) -> Result<(), NodeError> {
        let handoff = {
            let mut session = self.session.write().await;
            let handoff = session.start_game(now_ms())?;
            self.publish(&session);
            handoff
        };
        self.dispatch(handoff).await
    }

    // -------------------------------------------------------------------------
    // Turns
    // -------------------------------------------------------------------------

    /// Extend the word as the local holder and pass the ball on.
    #[instrument(skip(self))]
    pub async fn pass_ball(
        self: &Arc<Self>,
        new_word: &str,
        client_timestamp_ms: i64,
        expected_sequence: Option<u64>,
    ) -> Result<(), NodeError> {
        let handoff = {
            let mut session = self.session.write().await;
            let previous = session.token().map(|t| t.sequence);
            let handoff = session.pass_ball(
                self.self_id(),
                new_word,
                client_timestamp_ms,
                expected_sequence,
                now_ms(),
            )?;
            if let Some(previous) = previous {
                self.timer.cancel(previous);
            }
            self.publish(&session);
            handoff
        };
        self.dispatch(handoff).await
    }

    /// Deliver a handoff. A ball that cannot reach its next holder ends the
    /// game and the failure is returned.
    async fn dispatch(self: &Arc<Self>, handoff: Handoff) -> Result<(), NodeError> {
        match handoff {
            Handoff::Local(armed) => {
                self.arm_timer(&armed);
                let payload = self.session.read().await.ball_payload(self.self_id());
                let peers = self.registry.read().await.remote_peers();
                self.spawn_fan_out(PeerRequest::BallMoved(payload), peers);
                Ok(())
            }
            Handoff::Remote { target, payload } => {
                let sequence = payload.sequence;
                let request = PeerRequest::ReceiveBall(payload.clone());

                match self.client.call(&target, &request).await {
                    Ok(_) => {
                        self.registry.write().await.mark_reachable(&target);
                        let others = self.others(&target).await;
                        self.spawn_fan_out(PeerRequest::BallMoved(payload), others);
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Dispatch of ball {} to {} failed: {}", sequence, target, e);
                        if matches!(e, NodeError::PeerUnreachable { .. }) {
                            self.registry.write().await.mark_unreachable(&target);
                        }
                        let notice = {
                            let mut session = self.session.write().await;
                            let notice = session.dispatch_failed(sequence, &target);
                            self.publish(&session);
                            notice
                        };
                        if let Some(notice) = notice {
                            // The target too: it may have taken the ball and only replied late
                            let peers = self.registry.read().await.remote_peers();
                            self.spawn_fan_out(PeerRequest::GameOver(notice), peers);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Schedule the loss for `armed`, replacing any earlier deadline.
    fn arm_timer(self: &Arc<Self>, armed: &ArmedBall) {
        let delay = (armed.deadline_ms - now_ms()).max(0) as u64;
        let sequence = armed.sequence;
        let node = Arc::clone(self);

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            node.on_timer(sequence).await;
        });
        self.timer.arm(sequence, task.abort_handle());
        debug!("Loss timer armed for turn {} in {}ms", sequence, delay);
    }

    /// The deadline for `sequence` passed.
    async fn on_timer(self: &Arc<Self>, sequence: u64) {
        self.timer.fired(sequence);
        let notice = {
            let mut session = self.session.write().await;
            let notice = session.expire(sequence);
            if notice.is_some() {
                self.publish(&session);
            }
            notice
        };

        if let Some(notice) = notice {
            warn!("Turn {} lost by {}", sequence, notice.loser);
            let peers = self.registry.read().await.remote_peers();
            self.spawn_fan_out(PeerRequest::GameOver(notice), peers);
        }
    }

    /// A peer handed this node the ball.
    #[instrument(skip(self, payload), fields(sequence = payload.sequence, from = %payload.from))]
    pub async fn handle_receive_ball(self: &Arc<Self>, payload: BallPayload) -> Result<(), NodeError> {
        payload.validate()?;
        let players = ball_players(&payload);

        let armed = {
            let mut session = self.session.write().await;
            let armed = session.receive_ball(payload, now_ms())?;
            self.publish(&session);
            armed
        };
        self.note_players(players).await;
        self.arm_timer(&armed);
        Ok(())
    }

    /// The ball moved between two other nodes. Returns false if the notice
    /// was stale.
    pub async fn handle_ball_moved(&self, payload: BallPayload) -> Result<bool, NodeError> {
        payload.validate()?;
        let players = ball_players(&payload);

        let applied = {
            let mut session = self.session.write().await;
            let applied = session.observe_ball(payload, now_ms());
            if applied {
                // Someone else holds the ball now
                self.timer.cancel_all();
                self.publish(&session);
            }
            applied
        };
        if applied {
            self.note_players(players).await;
        }
        Ok(applied)
    }

    /// Register the sender (first) and every participant of an accepted ball.
    async fn note_players(&self, players: Vec<PlayerId>) {
        let mut registry = self.registry.write().await;
        for player in &players {
            registry.register(player.clone());
        }
        if let Some(from) = players.first() {
            registry.mark_reachable(from);
        }
    }

    /// A peer announced the end of the game. Returns false if ignored.
    pub async fn handle_game_over(&self, notice: GameOverNotice) -> Result<bool, NodeError> {
        notice.validate()?;
        let mut session = self.session.write().await;
        let applied = session.apply_game_over(notice);
        if applied {
            self.timer.cancel_all();
            self.publish(&session);
        }
        Ok(applied)
    }

    // -------------------------------------------------------------------------
    // Rematch
    // -------------------------------------------------------------------------

    /// Return to the lobby and tell every peer. Returns false if already
    /// in the lobby. A node watching a stalled game leaves it this way; the
    /// node holding the ball is refused.
    pub async fn rematch(self: &Arc<Self>) -> Result<bool, NodeError> {
        {
            let mut session = self.session.write().await;
            let phase = session.phase();
            if phase == GamePhase::Lobby {
                return Ok(false);
            }
            if !session.rematch() {
                return Err(ValidationError::WrongPhase(phase).into());
            }
            self.timer.cancel_all();
            self.publish(&session);
        }

        let peers = self.registry.read().await.remote_peers();
        let request = PeerRequest::Rematch {
            from: self.self_id().clone(),
        };
        self.fan_out(request, peers).await;
        Ok(true)
    }

    /// A peer went back to the lobby. Returns false if ignored.
    pub async fn handle_rematch(&self, from: &PlayerId) -> Result<bool, NodeError> {
        from.validate()?;
        let mut session = self.session.write().await;
        let applied = session.rematch();
        if applied {
            debug!("Rematch requested by {}", from);
            self.timer.cancel_all();
            self.publish(&session);
        }
        Ok(applied)
    }

    // -------------------------------------------------------------------------
    // Combos
    // -------------------------------------------------------------------------

    /// Fire a charged combo.
    pub async fn combo(&self, combo_key: &str) -> Result<ComboEffect, NodeError> {
        let key = ComboKey::parse(combo_key)
            .ok_or_else(|| ValidationError::InvalidComboKey(combo_key.to_string()))?;

        let mut session = self.session.write().await;
        let effect = session.combo(key)?;
        debug!("Combo {} applied on {}", key.symbol(), self.self_id());
        self.publish(&session);
        Ok(effect)
    }

    /// Fire the power-up.
    pub async fn power_up(&self) -> Result<(), NodeError> {
        let mut session = self.session.write().await;
        session.power_up()?;
        info!("Power-up fired by {}", self.self_id());
        self.publish(&session);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Every known node.
    pub async fn players(&self) -> PlayersInfo {
        PlayersInfo {
            self_id: self.self_id().clone(),
            peers: self.registry.read().await.list_peers(),
        }
    }

    /// A freshly built snapshot.
    pub async fn state(&self) -> StateSnapshot {
        StateSnapshot::capture(&*self.session.read().await, now_ms())
    }

    // -------------------------------------------------------------------------
    // Peer requests
    // -------------------------------------------------------------------------

    /// Answer one request from another node.
    pub async fn handle_peer(self: &Arc<Self>, request: PeerRequest) -> PeerResponse {
        #[cfg(feature = "debug-tracing")]
        debug!("<- {}", request.kind());

        let result = match request {
            PeerRequest::Ping => {
                return PeerResponse::Pong {
                    identity: self.self_id().clone(),
                }
            }
            PeerRequest::Register(register) => self.handle_register(register).await.map(Some),
            PeerRequest::NotifyReady { player } => self.handle_notify_ready(player).await.map(|_| None),
            PeerRequest::ReceiveBall(payload) => self.handle_receive_ball(payload).await.map(|_| None),
            PeerRequest::BallMoved(payload) => self.handle_ball_moved(payload).await.map(|_| None),
            PeerRequest::GameOver(notice) => self.handle_game_over(notice).await.map(|_| None),
            PeerRequest::Rematch { from } => self.handle_rematch(&from).await.map(|_| None),
        };

        match result {
            Ok(Some(registered)) => PeerResponse::Registered(registered),
            Ok(None) => PeerResponse::Ack,
            Err(e) => {
                debug!("Peer request rejected: {}", e);
                PeerResponse::Rejected {
                    code: e.code(),
                    reason: e.to_string(),
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    async fn others(&self, except: &PlayerId) -> Vec<PlayerId> {
        self.registry
            .read()
            .await
            .remote_peers()
            .into_iter()
            .filter(|p| p != except)
            .collect()
    }

    /// Send `request` to every target concurrently and record who answered.
    async fn fan_out(&self, request: PeerRequest, targets: Vec<PlayerId>) {
        if targets.is_empty() {
            return;
        }
        let kind = request.kind();
        let calls = targets.iter().map(|peer| {
            let request = &request;
            async move { (peer, self.client.call(peer, request).await) }
        });
        let results = join_all(calls).await;

        let mut registry = self.registry.write().await;
        for (peer, result) in results {
            match result {
                Ok(_) => registry.mark_reachable(peer),
                Err(NodeError::PeerRejected { reason, .. }) => {
                    debug!("{} refused {}: {}", peer, kind, reason);
                    registry.mark_reachable(peer);
                }
                Err(e) => {
                    warn!("{} to {} failed: {}", kind, peer, e);
                    registry.mark_unreachable(peer);
                }
            }
        }
    }

    fn spawn_fan_out(self: &Arc<Self>, request: PeerRequest, targets: Vec<PlayerId>) {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.fan_out(request, targets).await });
    }
}

/// Sender first, then every participant the ball names.
fn ball_players(payload: &BallPayload) -> Vec<PlayerId> {
    std::iter::once(payload.from.clone())
        .chain(payload.shared.players.iter().map(|p| p.id.clone()))
        .collect()
}

fn ready_set(session: &GameSession) -> Vec<PlayerId> {
    session
        .players()
        .values()
        .filter(|p| p.ready)
        .map(|p| p.id.clone())
        .collect()
}
