//! Game State Definitions
//!
//! Players, the ball token, turn records and the payloads that travel
//! between peers with the ball. Uses BTreeMap/BTreeSet so every peer
//! iterates in the same order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::core::keypad::{self, VOWELS, PAD_DIGITS};
use crate::game::mission::Mission;
use crate::game::power::{CurseBoard, PowerPolicy};
use crate::game::session::ValidationError;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Player identifier: the `host:port` a peer listens on.
///
/// Globally meaningful across peers, which is why it doubles as the
/// network address used to reach the player.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(String);

impl PlayerId {
    /// Build an identifier from a host and a port.
    pub fn from_parts(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    /// Parse and validate a `host:port` address.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        let invalid = || ValidationError::InvalidAddress(raw.to_string());

        let (host, port) = raw.rsplit_once(':').ok_or_else(invalid)?;
        let host_ok = !host.is_empty()
            && host.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
        let port_ok = matches!(port.parse::<u16>(), Ok(p) if p > 0);

        if host_ok && port_ok {
            Ok(Self(raw.to_string()))
        } else {
            Err(invalid())
        }
    }

    /// Check an identifier that arrived already built, e.g. from a peer.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match Self::parse(&self.0) {
            Ok(parsed) if parsed == *self => Ok(()),
            _ => Err(ValidationError::InvalidAddress(self.0.clone())),
        }
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// GAME PHASE
// =============================================================================

/// Lifecycle of the turn token on one peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    /// Waiting for players to ready up.
    Lobby,
    /// First ball being created.
    Starting,
    /// A ball is in play.
    Active,
    /// A holder ran out of time; waiting for a rematch.
    GameOver,
}

// =============================================================================
// PLAYER STATE
// =============================================================================

/// State of a single player.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Player identifier
    pub id: PlayerId,

    /// Ready for the next game
    pub ready: bool,

    /// Accepted passes this game
    pub turn_count: u32,

    /// Accumulated power per vowel, in [0, cap]
    pub vowel_power: BTreeMap<char, f64>,

    /// Charge per keypad digit (2-9), in [0, pad cap]
    pub phone_pad: BTreeMap<u8, u8>,

    /// How often each letter was played since its counter last reset
    pub letter_counts: BTreeMap<char, u32>,

    /// Letters this player may not play on their current turn
    pub inabilities: BTreeSet<char>,

    /// Missions in progress
    pub active_missions: Vec<Mission>,

    /// Missions already completed this game
    pub completed_missions: Vec<Mission>,

    /// Attaque combo fired; handicaps whoever receives this player's next pass
    pub attack_armed: bool,

    /// Multiplier waiting for this player's next turn
    pub next_turn_factor: Option<f64>,

    /// This player's next turn gets the maximum timeout
    pub full_next_turn: bool,
}

impl PlayerState {
    /// Create a fresh player.
    pub fn new(id: PlayerId, policy: &PowerPolicy) -> Self {
        let mut player = Self {
            id,
            ready: false,
            turn_count: 0,
            vowel_power: BTreeMap::new(),
            phone_pad: BTreeMap::new(),
            letter_counts: BTreeMap::new(),
            inabilities: BTreeSet::new(),
            active_missions: Vec::new(),
            completed_missions: Vec::new(),
            attack_armed: false,
            next_turn_factor: None,
            full_next_turn: false,
        };
        player.reset_for_game(policy);
        player
    }

    /// Clear everything a game accumulates. Keeps the ready flag.
    pub fn reset_for_game(&mut self, policy: &PowerPolicy) {
        self.turn_count = 0;
        self.vowel_power = VOWELS.iter().map(|&v| (v, policy.vowel_initial)).collect();
        self.reset_pad();
        self.letter_counts.clear();
        self.inabilities.clear();
        self.active_missions.clear();
        self.completed_missions.clear();
        self.attack_armed = false;
        self.next_turn_factor = None;
        self.full_next_turn = false;
    }

    /// Zero every keypad digit.
    pub fn reset_pad(&mut self) {
        self.phone_pad = PAD_DIGITS.iter().map(|&d| (d, 0)).collect();
    }

    /// Charge of one keypad digit.
    #[inline]
    pub fn pad_charge(&self, digit: u8) -> u8 {
        self.phone_pad.get(&digit).copied().unwrap_or(0)
    }

    /// Power of one vowel.
    #[inline]
    pub fn power_of(&self, vowel: char) -> f64 {
        self.vowel_power.get(&vowel).copied().unwrap_or(0.0)
    }
}

// =============================================================================
// BALL TOKEN
// =============================================================================

/// The turn token as this peer sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallToken {
    /// Current word, lowercase letters only
    pub word: String,
    /// Player who must extend the word next
    pub holder: PlayerId,
    /// Turn number within the game; stale timers and passes carry older values
    pub sequence: u64,
    /// Time granted to the holder
    pub timeout_ms: u64,
    /// When the holder's turn started (Unix ms)
    pub armed_at_ms: i64,
    /// When the holder loses (Unix ms)
    pub deadline_ms: i64,
}

impl BallToken {
    /// Token armed at `now_ms`.
    pub fn armed(word: String, holder: PlayerId, sequence: u64, timeout_ms: u64, now_ms: i64) -> Self {
        Self {
            word,
            holder,
            sequence,
            timeout_ms,
            armed_at_ms: now_ms,
            deadline_ms: now_ms.saturating_add(timeout_ms as i64),
        }
    }

    /// Milliseconds left on the holder's clock.
    pub fn remaining_ms(&self, now_ms: i64) -> u64 {
        self.deadline_ms.saturating_sub(now_ms).max(0) as u64
    }
}

// =============================================================================
// HISTORY
// =============================================================================

/// Breakdown of one timeout computation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutLog {
    /// Base timeout (ms)
    pub base: u64,
    /// Speed multiplier
    pub speed_bonus: f64,
    /// Vowel multiplier (1.0 when no vowel was played)
    pub vowel_bonus: f64,
    /// Cursed multiplier (1.0 when not cursed)
    pub cursed_malus: f64,
    /// Attaque multiplier (1.0 when not attacked)
    pub pad_combo_malus: f64,
    /// Product of mission, bonus and pace multipliers
    pub mission_bonus: f64,
    /// Clamped result (ms)
    #[serde(rename = "final")]
    pub final_ms: u64,
}

/// One accepted pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Word after the pass
    pub word: String,
    /// Player who passed
    pub player: PlayerId,
    /// Time the passer took (ms)
    pub response_time_ms: u64,
    /// Names of every modifier that shaped the next timeout
    pub applied_multipliers: Vec<String>,
    /// Timeout computation for the next holder
    pub timeout_log: TimeoutLog,
}

// =============================================================================
// PEER PAYLOADS
// =============================================================================

/// Game state that travels with the ball.
///
/// Only the holder mutates it; whoever receives the ball adopts it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    /// Every participant
    pub players: Vec<PlayerState>,
    /// Cursed and dead letters
    pub curses: CurseBoard,
    /// Letter the holder must play
    pub forced_letter: Option<char>,
    /// Player whose keypad is scrambled
    pub scramble_ui_for: Option<PlayerId>,
    /// Game-wide timeout multiplier
    pub pace_factor: f64,
    /// Accepted passes this game
    pub history: Vec<TurnRecord>,
}

/// The ball handed to a peer (`receive_ball`) or announced to observers
/// (`ball_moved`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BallPayload {
    /// Game this ball belongs to
    pub game_id: Uuid,
    /// Sender
    pub from: PlayerId,
    /// New holder
    pub holder: PlayerId,
    /// Current word
    pub word: String,
    /// Time granted to the new holder
    pub timeout_ms: u64,
    /// Turn number
    pub sequence: u64,
    /// Everything else the holder needs
    pub shared: SharedState,
}

impl BallPayload {
    /// Reject a ball whose addresses or letters no honest peer would send.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.from.validate()?;
        self.holder.validate()?;
        if let Some(id) = &self.shared.scramble_ui_for {
            id.validate()?;
        }
        check_letters(self.shared.forced_letter.iter().copied())?;

        for player in &self.shared.players {
            player.id.validate()?;
            if let Some(&digit) = player.phone_pad.keys().find(|d| !PAD_DIGITS.contains(*d)) {
                return Err(ValidationError::InvalidPadDigit(digit));
            }
            if let Some(&vowel) = player.vowel_power.keys().find(|v| !VOWELS.contains(*v)) {
                return Err(ValidationError::InvalidLetter(vowel));
            }
            check_letters(player.letter_counts.keys().copied())?;
            check_letters(player.inabilities.iter().copied())?;
        }

        let curses = &self.shared.curses;
        check_letters(curses.cursed.iter().copied())?;
        check_letters(curses.dead.iter().copied())?;
        check_letters(curses.levels.keys().copied())?;

        for record in &self.shared.history {
            record.player.validate()?;
        }
        Ok(())
    }
}

fn check_letters(mut letters: impl Iterator<Item = char>) -> Result<(), ValidationError> {
    match letters.find(|&c| !keypad::is_letter(c)) {
        Some(c) => Err(ValidationError::InvalidLetter(c)),
        None => Ok(()),
    }
}

/// Why a game ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameOverReason {
    /// Holder let the deadline lapse.
    Timeout,
    /// The ball could not be delivered to this peer.
    PeerUnreachable(PlayerId),
}

/// Notice sent to every peer when a game ends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameOverNotice {
    /// Game that ended
    pub game_id: Uuid,
    /// Player charged with the loss
    pub loser: PlayerId,
    /// Why
    pub reason: GameOverReason,
    /// Last sequence in play
    pub sequence: u64,
    /// Final history
    pub history: Vec<TurnRecord>,
}

impl GameOverNotice {
    /// Reject a notice naming an address no peer could have.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.loser.validate()?;
        if let GameOverReason::PeerUnreachable(id) = &self.reason {
            id.validate()?;
        }
        self.history.iter().try_for_each(|r| r.player.validate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_id_parse() {
        assert!(PlayerId::parse("192.168.1.20:5000").is_ok());
        assert!(PlayerId::parse("localhost:5000").is_ok());
        assert_eq!(PlayerId::parse(" peer-a:80 ").unwrap().as_str(), "peer-a:80");

        for bad in ["", "nohost", ":5000", "host:", "host:0", "host:70000", "ho st:1", "a/b:1"] {
            assert!(
                matches!(PlayerId::parse(bad), Err(ValidationError::InvalidAddress(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_player_id_order() {
        let a = PlayerId::from_parts("10.0.0.1", 5000);
        let b = PlayerId::from_parts("10.0.0.2", 5000);
        assert!(a < b);
        assert_eq!(a.to_string(), "10.0.0.1:5000");
    }

    #[test]
    fn test_new_player_is_blank() {
        let policy = PowerPolicy::default();
        let player = PlayerState::new(PlayerId::from_parts("h", 1), &policy);

        assert_eq!(player.vowel_power.len(), VOWELS.len());
        assert!(player.vowel_power.values().all(|&p| p == policy.vowel_initial));
        assert_eq!(player.phone_pad.len(), 8);
        assert!(PAD_DIGITS.iter().all(|&d| player.pad_charge(d) == 0));
        assert!(!player.ready);
    }

    #[test]
    fn test_reset_keeps_ready() {
        let policy = PowerPolicy::default();
        let mut player = PlayerState::new(PlayerId::from_parts("h", 1), &policy);
        player.ready = true;
        player.turn_count = 9;
        player.phone_pad.insert(2, 3);
        player.inabilities.insert('x');

        player.reset_for_game(&policy);

        assert!(player.ready);
        assert_eq!(player.turn_count, 0);
        assert_eq!(player.pad_charge(2), 0);
        assert!(player.inabilities.is_empty());
    }

    #[test]
    fn test_token_remaining() {
        let token = BallToken::armed("ab".into(), PlayerId::from_parts("h", 1), 3, 5000, 1_000);
        assert_eq!(token.deadline_ms, 6_000);
        assert_eq!(token.remaining_ms(2_000), 4_000);
        assert_eq!(token.remaining_ms(9_000), 0);
    }
}
