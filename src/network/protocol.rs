//! Protocol Messages
//!
//! Two wire formats share one port:
//!
//! - `/ws`: local clients. JSON text frames tagged with `"type"`.
//! - `/peer`: other nodes. Binary frames, bincode-encoded, one request and
//!   one response per connection. Peer enums are externally tagged because
//!   bincode cannot decode `#[serde(tag = "type")]`.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::core::keypad::{ComboKey, PAD_DIGITS};
use crate::game::mission::Mission;
use crate::game::power::PowerSystem;
use crate::game::session::{GameSession, TurnError, ValidationError};
use crate::game::state::{
    BallPayload, GameOverNotice, GamePhase, PlayerId, PlayerState, TurnRecord,
};
use crate::network::registry::PeerInfo;

// =============================================================================
// CLIENT -> NODE MESSAGES
// =============================================================================

/// Messages sent from a local client to its node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Probe the network for peers.
    Discover,

    /// Mark this node's player ready.
    Ready,

    /// Start a game now if the quorum is met.
    StartGame,

    /// Extend the word and pass the ball.
    PassBall {
        /// Current word plus one letter.
        new_word: String,
        /// When the player submitted (Unix ms).
        client_timestamp_ms: i64,
        /// Turn the client is answering.
        #[serde(default)]
        sequence: Option<u64>,
    },

    /// Leave game over for the lobby.
    Rematch,

    /// Fire a charged combo (`*`, `0`, `#` or its name).
    Combo { combo_key: String },

    /// Fire the power-up.
    PowerUp,

    /// List known peers.
    Players,

    /// Poll the state snapshot.
    GetState,

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

// =============================================================================
// NODE -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from a node to its local clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Consolidated state, pushed on change and polled with `get_state`.
    State(StateSnapshot),

    /// Request applied.
    Ack { action: String },

    /// Known peers.
    Players(PlayersInfo),

    /// Result of a discovery sweep.
    Discovered { found: Vec<PlayerId> },

    /// Request rejected.
    Error(ServerError),

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Node is shutting down.
    Shutdown { reason: String },
}

/// Reply to `players`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayersInfo {
    /// This node's identifier.
    pub self_id: PlayerId,
    /// Every known node, this one included.
    pub peers: Vec<PeerInfo>,
}

/// Wire error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Undecodable message.
    InvalidMessage,
    /// Caller does not hold the ball.
    NotHolder,
    /// No game in play.
    NoActiveBall,
    /// Word is not the current word plus one lowercase letter.
    InvalidWord,
    /// Dead, blocked or wrong forced letter.
    ForbiddenLetter,
    /// Request for a superseded turn.
    StaleSequence,
    /// Unknown combo key.
    InvalidCombo,
    /// Combo or power-up not charged.
    NotCharged,
    /// Not allowed in the current phase.
    WrongPhase,
    /// Too few ready players.
    QuorumNotMet,
    /// Malformed peer address.
    InvalidAddress,
    /// Ball or notice for another game.
    WrongGame,
    /// Turn already timed out.
    TimerRace,
    /// Two balls in flight.
    StateConflict,
    /// A peer could not be reached.
    PeerUnreachable,
    /// A peer refused the call.
    PeerRejected,
    /// Internal error.
    InternalError,
}

impl From<&ValidationError> for ErrorCode {
    fn from(err: &ValidationError) -> Self {
        match err {
            ValidationError::NotHolder(_) | ValidationError::WrongRecipient(_) => ErrorCode::NotHolder,
            ValidationError::NoActiveBall => ErrorCode::NoActiveBall,
            ValidationError::MalformedExtension { .. }
            | ValidationError::NotLowercase(_)
            | ValidationError::InvalidTimestamp(_) => ErrorCode::InvalidWord,
            ValidationError::DeadLetter(_)
            | ValidationError::BlockedLetter(_)
            | ValidationError::ForcedLetter { .. } => ErrorCode::ForbiddenLetter,
            ValidationError::StaleSequence { .. } => ErrorCode::StaleSequence,
            ValidationError::InvalidComboKey(_) => ErrorCode::InvalidCombo,
            ValidationError::ComboNotCharged(_) | ValidationError::PowerUpNotReady => ErrorCode::NotCharged,
            ValidationError::WrongPhase(_) => ErrorCode::WrongPhase,
            ValidationError::QuorumNotMet { .. } => ErrorCode::QuorumNotMet,
            ValidationError::InvalidAddress(_) | ValidationError::UnknownPlayer(_) => ErrorCode::InvalidAddress,
            ValidationError::WrongGame => ErrorCode::WrongGame,
            ValidationError::InvalidPadDigit(_) | ValidationError::InvalidLetter(_) => ErrorCode::InvalidMessage,
        }
    }
}

impl From<&TurnError> for ErrorCode {
    fn from(err: &TurnError) -> Self {
        match err {
            TurnError::Validation(v) => v.into(),
            TurnError::TimerRace { .. } => ErrorCode::TimerRace,
            TurnError::StateConflict(_) => ErrorCode::StateConflict,
        }
    }
}

// =============================================================================
// STATE SNAPSHOT
// =============================================================================

/// One player as a client sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerView {
    pub id: PlayerId,
    pub is_self: bool,
    pub ready: bool,
    pub turn_count: u32,
    pub vowel_power: BTreeMap<char, f64>,
    pub phone_pad: BTreeMap<u8, u8>,
    pub inabilities: Vec<char>,
    pub active_missions: Vec<Mission>,
    pub completed_missions: usize,
    /// Combos this player could fire now
    pub combos_ready: Vec<ComboKey>,
    pub power_up_ready: bool,
}

impl PlayerView {
    fn of(player: &PlayerState, self_id: &PlayerId) -> Self {
        Self {
            id: player.id.clone(),
            is_self: &player.id == self_id,
            ready: player.ready,
            turn_count: player.turn_count,
            vowel_power: player.vowel_power.clone(),
            phone_pad: PAD_DIGITS.iter().map(|&d| (d, player.pad_charge(d))).collect(),
            inabilities: player.inabilities.iter().copied().collect(),
            active_missions: player.active_missions.clone(),
            completed_missions: player.completed_missions.len(),
            combos_ready: ComboKey::ALL
                .iter()
                .copied()
                .filter(|&k| PowerSystem::column_charged(player, k))
                .collect(),
            power_up_ready: PowerSystem::power_up_ready(player),
        }
    }
}

/// Everything a client needs to render the game.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub self_id: PlayerId,
    pub phase: GamePhase,
    pub game_id: Option<Uuid>,
    pub players: Vec<PlayerView>,
    pub ready: Vec<PlayerId>,
    /// Current holder, while a ball is live
    pub holder: Option<PlayerId>,
    pub word: Option<String>,
    pub sequence: Option<u64>,
    pub timeout_ms: Option<u64>,
    /// Time left on the holder's clock as seen by this node
    pub remaining_ms: Option<u64>,
    pub history: Vec<TurnRecord>,
    pub archive: Vec<Vec<TurnRecord>>,
    pub cursed_letters: Vec<char>,
    pub dead_letters: Vec<char>,
    pub forced_letter: Option<char>,
    pub scramble_ui_for: Option<PlayerId>,
    pub pace_factor: f64,
    pub last_loser: Option<PlayerId>,
    /// When the snapshot was taken (Unix ms)
    pub server_time_ms: i64,
}

impl StateSnapshot {
    /// Build a snapshot of a session at `now_ms`.
    pub fn capture(session: &GameSession, now_ms: i64) -> Self {
        let self_id = session.self_id();
        let token = session.token();
        let curses = session.curses();

        Self {
            self_id: self_id.clone(),
            phase: session.phase(),
            game_id: session.game_id(),
            players: session.players().values().map(|p| PlayerView::of(p, self_id)).collect(),
            ready: session
                .players()
                .values()
                .filter(|p| p.ready)
                .map(|p| p.id.clone())
                .collect(),
            holder: token.map(|t| t.holder.clone()),
            word: token.map(|t| t.word.clone()),
            sequence: token.map(|t| t.sequence),
            timeout_ms: token.map(|t| t.timeout_ms),
            remaining_ms: token.map(|t| t.remaining_ms(now_ms)),
            history: session.history().to_vec(),
            archive: session.archive().to_vec(),
            cursed_letters: curses.cursed.iter().copied().collect(),
            dead_letters: curses.dead.iter().copied().collect(),
            forced_letter: session.forced_letter(),
            scramble_ui_for: session.scramble_ui_for().cloned(),
            pace_factor: session.pace_factor(),
            last_loser: session.last_loser().cloned(),
            server_time_ms: now_ms,
        }
    }
}

// =============================================================================
// PEER MESSAGES
// =============================================================================

/// Registration handshake, sent by the discovering node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Caller's identifier
    pub address: PlayerId,
    /// Peers the caller already knows
    pub known_peers: Vec<PlayerId>,
    /// Participants the caller knows to be ready
    pub ready: Vec<PlayerId>,
}

/// Registration reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Callee's identifier
    pub self_id: PlayerId,
    /// Peers the callee knows
    pub known_peers: Vec<PlayerId>,
    /// Participants the callee knows to be ready
    pub ready: Vec<PlayerId>,
}

/// Calls between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerRequest {
    /// Liveness probe.
    Ping,
    /// Register the caller.
    Register(RegisterRequest),
    /// A participant is ready.
    NotifyReady { player: PlayerId },
    /// The callee becomes the holder.
    ReceiveBall(BallPayload),
    /// The ball moved between two other nodes.
    BallMoved(BallPayload),
    /// The game ended.
    GameOver(GameOverNotice),
    /// Return to the lobby.
    Rematch { from: PlayerId },
}

/// Replies between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerResponse {
    /// Liveness reply.
    Pong { identity: PlayerId },
    /// Registration accepted.
    Registered(RegisterResponse),
    /// Call applied or ignored as stale.
    Ack,
    /// Call refused.
    Rejected { code: ErrorCode, reason: String },
}

impl PeerRequest {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerRequest::Ping => "ping",
            PeerRequest::Register(_) => "register",
            PeerRequest::NotifyReady { .. } => "notify_ready",
            PeerRequest::ReceiveBall(_) => "receive_ball",
            PeerRequest::BallMoved(_) => "ball_moved",
            PeerRequest::GameOver(_) => "game_over",
            PeerRequest::Rematch { .. } => "rematch",
        }
    }
}

impl RegisterRequest {
    /// Check the caller's address and every address it passed along.
    pub fn validate(&self) -> Result<(), ValidationError> {
        std::iter::once(&self.address)
            .chain(&self.known_peers)
            .chain(&self.ready)
            .try_for_each(PlayerId::validate)
    }
}

impl RegisterResponse {
    /// Check the callee's address and every address it passed along.
    pub fn validate(&self) -> Result<(), ValidationError> {
        std::iter::once(&self.self_id)
            .chain(&self.known_peers)
            .chain(&self.ready)
            .try_for_each(PlayerId::validate)
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error reply for an undecodable frame.
    pub fn invalid_message(detail: impl std::fmt::Display) -> Self {
        ServerMessage::Error(ServerError {
            code: ErrorCode::InvalidMessage,
            message: format!("Invalid message format: {}", detail),
        })
    }
}

impl PeerRequest {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl PeerResponse {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::session::SessionConfig;
    use crate::game::state::GameOverReason;

    fn id(port: u16) -> PlayerId {
        PlayerId::from_parts("127.0.0.1", port)
    }

    #[test]
    fn test_client_messages_parse() {
        let msg = ClientMessage::from_json(
            r#"{"type":"pass_ball","new_word":"cab","client_timestamp_ms":1700000000000}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::PassBall { new_word, client_timestamp_ms, sequence } => {
                assert_eq!(new_word, "cab");
                assert_eq!(client_timestamp_ms, 1_700_000_000_000);
                assert_eq!(sequence, None);
            }
            other => panic!("Wrong message type: {:?}", other),
        }

        assert!(matches!(
            ClientMessage::from_json(r##"{"type":"combo","combo_key":"#"}"##).unwrap(),
            ClientMessage::Combo { combo_key } if combo_key == "#"
        ));
        assert!(matches!(
            ClientMessage::from_json(r#"{"type":"start_game"}"#).unwrap(),
            ClientMessage::StartGame
        ));
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"type":"pass_ball"}"#).is_err());
    }

    #[test]
    fn test_snapshot_json() {
        let mut session = GameSession::new(id(5000), SessionConfig::default(), 1);
        session.mark_ready(&id(5000)).unwrap();
        session.start_game(1_000).unwrap();

        let snapshot = StateSnapshot::capture(&session, 2_000);
        assert_eq!(snapshot.phase, GamePhase::Active);
        assert_eq!(snapshot.holder, Some(id(5000)));
        assert_eq!(snapshot.remaining_ms, Some(14_000));
        assert_eq!(snapshot.ready, vec![id(5000)]);
        assert_eq!(snapshot.players[0].active_missions.len(), 3);
        assert!(snapshot.players[0].is_self);

        let json = ServerMessage::State(snapshot).to_json().unwrap();
        assert!(json.contains(r#""type":"state""#));
        assert!(json.contains(r#""phase":"active""#));
        assert!(json.contains(r#""self_id":"127.0.0.1:5000""#));
    }

    #[test]
    fn test_peer_messages_binary() {
        let mut session = GameSession::new(id(5000), SessionConfig::default(), 1);
        session.add_participant(id(5001));
        session.mark_ready(&id(5001)).unwrap();
        session.start_game(0).unwrap();
        let payload = session.ball_payload(&id(5000));

        let request = PeerRequest::ReceiveBall(payload);
        let bytes = request.to_bytes().unwrap();
        assert_eq!(PeerRequest::from_bytes(&bytes).unwrap(), request);

        let notice = PeerRequest::GameOver(GameOverNotice {
            game_id: Uuid::new_v4(),
            loser: id(5001),
            reason: GameOverReason::PeerUnreachable(id(5001)),
            sequence: 4,
            history: Vec::new(),
        });
        let bytes = notice.to_bytes().unwrap();
        assert_eq!(PeerRequest::from_bytes(&bytes).unwrap(), notice);

        let rejected = PeerResponse::Rejected { code: ErrorCode::StaleSequence, reason: "old".into() };
        assert_eq!(PeerResponse::from_bytes(&rejected.to_bytes().unwrap()).unwrap(), rejected);
        assert!(PeerRequest::from_bytes(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_error_codes() {
        let code: ErrorCode = (&TurnError::TimerRace { sequence: 3 }).into();
        assert_eq!(code, ErrorCode::TimerRace);

        let code: ErrorCode = (&ValidationError::DeadLetter('x')).into();
        assert_eq!(code, ErrorCode::ForbiddenLetter);

        let json = ServerMessage::Error(ServerError {
            code: ErrorCode::StaleSequence,
            message: "old".to_string(),
        })
        .to_json()
        .unwrap();
        assert!(json.contains("stale_sequence"));
    }

    /// An identifier as a peer could put it on the wire, unchecked.
    fn raw_id(raw: &str) -> PlayerId {
        serde_json::from_value(serde_json::Value::String(raw.to_string())).unwrap()
    }

    #[test]
    fn test_registration_validation() {
        let register = |address: PlayerId, known_peers: Vec<PlayerId>| RegisterRequest {
            address,
            known_peers,
            ready: Vec::new(),
        };
        assert!(register(id(5001), vec![id(5002)]).validate().is_ok());
        assert_eq!(
            register(raw_id("no such/host:0"), Vec::new()).validate(),
            Err(ValidationError::InvalidAddress("no such/host:0".to_string()))
        );
        assert!(register(id(5001), vec![raw_id(":0")]).validate().is_err());
        assert!(raw_id(" spaced:1").validate().is_err());
        assert!(raw_id("host").validate().is_err());
        assert!(raw_id("127.0.0.1:5000").validate().is_ok());

        let notice = GameOverNotice {
            game_id: Uuid::new_v4(),
            loser: raw_id("x:99999"),
            reason: GameOverReason::Timeout,
            sequence: 0,
            history: Vec::new(),
        };
        let err = notice.validate().unwrap_err();
        assert_eq!(ErrorCode::from(&err), ErrorCode::InvalidAddress);

        let response = RegisterResponse {
            self_id: id(5001),
            known_peers: Vec::new(),
            ready: vec![raw_id("")],
        };
        assert!(response.validate().is_err());
    }

    #[test]
    fn test_ball_validation() {
        let mut session = GameSession::new(id(5000), SessionConfig::default(), 1);
        session.add_participant(id(5001));
        session.mark_ready(&id(5001)).unwrap();
        session.start_game(0).unwrap();
        let payload = session.ball_payload(&id(5000));
        assert!(payload.validate().is_ok());

        let mut bad = payload.clone();
        bad.holder = raw_id("evil host:1");
        assert!(matches!(bad.validate(), Err(ValidationError::InvalidAddress(_))));

        let mut bad = payload.clone();
        bad.shared.players[0].phone_pad.insert(1, 2);
        assert_eq!(bad.validate(), Err(ValidationError::InvalidPadDigit(1)));

        let mut bad = payload.clone();
        bad.shared.players[0].vowel_power.insert('b', 0.5);
        assert_eq!(bad.validate(), Err(ValidationError::InvalidLetter('b')));

        let mut bad = payload.clone();
        bad.shared.curses.cursed.insert('Q');
        assert_eq!(bad.validate(), Err(ValidationError::InvalidLetter('Q')));

        let mut bad = payload;
        bad.shared.curses.dead.insert('1');
        let err = bad.validate().unwrap_err();
        assert_eq!(ErrorCode::from(&err), ErrorCode::InvalidMessage);
    }
}
