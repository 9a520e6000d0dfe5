//! Game Session
//!
//! The turn-token state machine owned by one node. Every mutation goes
//! through `&mut self`, so the caller's lock is the turn lock: a pass and
//! a loss timer for the same sequence can never both apply.
//!
//! ```text
//!            ready / start (quorum met)
//!   Lobby ──────────────────────────────► Starting ──► Active ◄─┐
//!     ▲                                                  │  │   │ pass
//!     │ rematch                     deadline / game_over │  └───┘
//!     └───────────────────────── GameOver ◄──────────────┘
//! ```
//!
//! Only the node holding the ball mutates the shared game state. It hands
//! the whole state over with the ball, so the next holder is authoritative
//! with a complete picture.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::keypad::{self, ComboKey};
use crate::core::rng::DeterministicRng;
use crate::game::mission::{advance_missions, draw_missions, MissionEffect, TurnContext};
use crate::game::power::{ComboEffect, CurseBoard, PowerPolicy, PowerSystem};
use crate::game::scheduler::{choose_next_holder, ArmedBall, Handoff};
use crate::game::state::{
    BallPayload, BallToken, GameOverNotice, GameOverReason, GamePhase, PlayerId,
    PlayerState, SharedState, TurnRecord,
};
use crate::game::timeout::{TimeoutCalculator, TimeoutInputs, TimeoutPolicy};

// =============================================================================
// ERRORS
// =============================================================================

/// A request that breaks the rules. Rejected with no state change.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} does not hold the ball")]
    NotHolder(PlayerId),

    #[error("No ball in play")]
    NoActiveBall,

    #[error("'{proposed}' is not '{current}' plus one letter")]
    MalformedExtension { current: String, proposed: String },

    #[error("'{0}' must contain lowercase letters only")]
    NotLowercase(String),

    #[error("Letter '{0}' is dead")]
    DeadLetter(char),

    #[error("Letter '{0}' is blocked for this turn")]
    BlockedLetter(char),

    #[error("Letter '{expected}' must be played, got '{got}'")]
    ForcedLetter { expected: char, got: char },

    #[error("Stale sequence {got}, ball is at {expected}")]
    StaleSequence { expected: u64, got: u64 },

    #[error("Unknown combo key '{0}'")]
    InvalidComboKey(String),

    #[error("Combo '{}' is not charged", .0.symbol())]
    ComboNotCharged(ComboKey),

    #[error("Power-up is not charged")]
    PowerUpNotReady,

    #[error("Not allowed while {0:?}")]
    WrongPhase(GamePhase),

    #[error("{ready} ready, {quorum} required")]
    QuorumNotMet { ready: usize, quorum: usize },

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("Ball belongs to another game")]
    WrongGame,

    #[error("Invalid client timestamp {0}")]
    InvalidTimestamp(i64),

    #[error("Ball addressed to {0}")]
    WrongRecipient(PlayerId),

    #[error("Unknown player {0}")]
    UnknownPlayer(PlayerId),

    #[error("Keypad digit {0} is not on the pad")]
    InvalidPadDigit(u8),

    #[error("'{0}' is not a playable letter here")]
    InvalidLetter(char),
}

/// Why a turn operation failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The deadline for this sequence already passed; the game is over.
    #[error("Turn {sequence} already timed out")]
    TimerRace { sequence: u64 },

    /// Another game's ball arrived while this node holds one.
    #[error("State conflict: {0}")]
    StateConflict(String),
}

// =============================================================================
// CONFIG
// =============================================================================

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Ready participants needed to leave the lobby (1 allows solo play).
    pub quorum: usize,
    /// Missions dealt to each player at game start.
    pub missions_per_player: usize,
    /// Timeout formula constants.
    pub timeout: TimeoutPolicy,
    /// Power system constants.
    pub power: PowerPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quorum: 1,
            missions_per_player: 3,
            timeout: TimeoutPolicy::default(),
            power: PowerPolicy::default(),
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// One node's view of the game.
pub struct GameSession {
    /// This node's player
    self_id: PlayerId,
    /// Configuration
    config: SessionConfig,
    /// Current phase
    phase: GamePhase,
    /// Current or last game. Kept after a rematch so late notices for it are refused.
    game_id: Option<Uuid>,
    /// Every known participant
    players: BTreeMap<PlayerId, PlayerState>,
    /// Curses and combos
    power: PowerSystem,
    /// Timeout formula
    calculator: TimeoutCalculator,
    /// Letter the holder must play
    forced_letter: Option<char>,
    /// Player whose keypad is scrambled
    scramble_ui_for: Option<PlayerId>,
    /// Game-wide timeout multiplier
    pace_factor: f64,
    /// Accepted passes this game
    history: Vec<TurnRecord>,
    /// Histories of previous games
    archive: Vec<Vec<TurnRecord>>,
    /// The ball, while a game is live
    token: Option<BallToken>,
    /// Loser of the last game
    last_loser: Option<PlayerId>,
    /// Random choices
    rng: DeterministicRng,
}

impl GameSession {
    /// Create a session in the lobby with only this node's player.
    pub fn new(self_id: PlayerId, config: SessionConfig, seed_nonce: u64) -> Self {
        let rng = DeterministicRng::for_node(self_id.as_str(), seed_nonce);
        let mut players = BTreeMap::new();
        players.insert(self_id.clone(), PlayerState::new(self_id.clone(), &config.power));

        Self {
            power: PowerSystem::new(config.power.clone()),
            calculator: TimeoutCalculator::new(config.timeout.clone()),
            self_id,
            config,
            phase: GamePhase::Lobby,
            game_id: None,
            players,
            forced_letter: None,
            scramble_ui_for: None,
            pace_factor: 1.0,
            history: Vec::new(),
            archive: Vec::new(),
            token: None,
            last_loser: None,
            rng,
        }
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    /// Add a participant. Returns false if already known.
    pub fn add_participant(&mut self, id: PlayerId) -> bool {
        if self.players.contains_key(&id) {
            return false;
        }
        info!("Participant {} joined", id);
        self.players.insert(id.clone(), PlayerState::new(id, &self.config.power));
        true
    }

    /// Mark a participant ready. Returns false if it already was.
    pub fn mark_ready(&mut self, id: &PlayerId) -> Result<bool, ValidationError> {
        if self.phase != GamePhase::Lobby {
            return Err(ValidationError::WrongPhase(self.phase));
        }
        self.add_participant(id.clone());

        let player = self
            .players
            .get_mut(id)
            .ok_or_else(|| ValidationError::UnknownPlayer(id.clone()))?;
        if player.ready {
            return Ok(false);
        }
        player.ready = true;
        info!("Participant {} is ready ({}/{})", id, self.ready_count(), self.players.len());
        Ok(true)
    }

    /// Number of ready participants.
    pub fn ready_count(&self) -> usize {
        self.players.values().filter(|p| p.ready).count()
    }

    /// Enough ready participants to start.
    pub fn quorum_met(&self) -> bool {
        self.ready_count() >= self.config.quorum.max(1)
    }

    /// Whether this node should start the game on its own: everyone is
    /// ready, the quorum is met, and this node sorts first. Only one node
    /// ever satisfies the last condition.
    pub fn should_auto_start(&self) -> bool {
        self.phase == GamePhase::Lobby
            && self.quorum_met()
            && self.players.values().all(|p| p.ready)
            && self.players.keys().next() == Some(&self.self_id)
    }

    // -------------------------------------------------------------------------
    // Game start
    // -------------------------------------------------------------------------

    /// Create the first ball of a new game.
    pub fn start_game(&mut self, now_ms: i64) -> Result<Handoff, TurnError> {
        if self.phase != GamePhase::Lobby {
            return Err(ValidationError::WrongPhase(self.phase).into());
        }
        if !self.quorum_met() {
            return Err(ValidationError::QuorumNotMet {
                ready: self.ready_count(),
                quorum: self.config.quorum.max(1),
            }
            .into());
        }

        self.phase = GamePhase::Starting;
        let game_id = Uuid::new_v4();
        self.game_id = Some(game_id);

        let policy = self.config.power.clone();
        for player in self.players.values_mut() {
            player.reset_for_game(&policy);
            player.active_missions = draw_missions(&mut self.rng, self.config.missions_per_player);
        }
        self.power.reset();
        self.forced_letter = None;
        self.scramble_ui_for = None;
        self.pace_factor = 1.0;
        self.history.clear();
        self.last_loser = None;

        let ready: Vec<PlayerId> = self
            .players
            .values()
            .filter(|p| p.ready)
            .map(|p| p.id.clone())
            .collect();
        let holder = self
            .rng
            .choose(&ready)
            .cloned()
            .unwrap_or_else(|| self.self_id.clone());
        let word = self.rng.next_letter().to_string();
        let timeout_ms = self.calculator.policy().base_ms;

        self.phase = GamePhase::Active;
        info!("Game {} started: word '{}', holder {}", game_id, word, holder);

        Ok(self.hand_over(word, holder, 0, timeout_ms, now_ms))
    }

    // -------------------------------------------------------------------------
    // Passing
    // -------------------------------------------------------------------------

    /// Accept a pass from the local holder.
    ///
    /// `expected_sequence` lets a client pin the turn it is answering; a
    /// pass for an older turn is refused.
    pub fn pass_ball(
        &mut self,
        player: &PlayerId,
        new_word: &str,
        client_timestamp_ms: i64,
        expected_sequence: Option<u64>,
        now_ms: i64,
    ) -> Result<Handoff, TurnError> {
        let token = match (self.phase, self.token.as_ref()) {
            (GamePhase::GameOver, _) => {
                let sequence = self.token.as_ref().map_or(0, |t| t.sequence);
                return Err(TurnError::TimerRace { sequence });
            }
            (GamePhase::Active, Some(token)) => token.clone(),
            _ => return Err(ValidationError::NoActiveBall.into()),
        };

        if player != &token.holder || token.holder != self.self_id {
            return Err(ValidationError::NotHolder(player.clone()).into());
        }
        if let Some(got) = expected_sequence {
            if got != token.sequence {
                return Err(ValidationError::StaleSequence { expected: token.sequence, got }.into());
            }
        }
        if now_ms >= token.deadline_ms {
            return Err(TurnError::TimerRace { sequence: token.sequence });
        }

        let letter = validate_extension(&token.word, new_word)?;
        if self.power.is_dead(letter) {
            return Err(ValidationError::DeadLetter(letter).into());
        }
        let passer = self
            .players
            .get(player)
            .ok_or_else(|| ValidationError::UnknownPlayer(player.clone()))?;
        if passer.inabilities.contains(&letter) {
            return Err(ValidationError::BlockedLetter(letter).into());
        }
        if let Some(expected) = self.forced_letter {
            if expected != letter {
                return Err(ValidationError::ForcedLetter { expected, got: letter }.into());
            }
        }
        if client_timestamp_ms < 0 {
            return Err(ValidationError::InvalidTimestamp(client_timestamp_ms).into());
        }

        // Client clock, bounded by what the server saw
        let elapsed = now_ms.saturating_sub(token.armed_at_ms).max(0);
        let response_time_ms = client_timestamp_ms
            .saturating_sub(token.armed_at_ms)
            .clamp(0, elapsed) as u64;

        Ok(self.accept_pass(&token, player, new_word, letter, response_time_ms, now_ms))
    }

    /// Apply a validated pass. Cannot fail.
    fn accept_pass(
        &mut self,
        token: &BallToken,
        player: &PlayerId,
        new_word: &str,
        letter: char,
        response_time_ms: u64,
        now_ms: i64,
    ) -> Handoff {
        let previous_passer = self.history.last().map(|r| r.player.clone());
        let exchanges = self.history.len() + 1;
        let ctx = TurnContext {
            letter,
            previous_letter: token.word.chars().last(),
            response_time_ms,
            timeout_ms: token.timeout_ms,
            exchanges,
        };

        let mut extras: Vec<(String, f64)> = Vec::new();
        let (play, effects, attack) = match self.players.get_mut(player) {
            Some(passer) => {
                let play = self.power.play_letter(passer, letter);
                passer.turn_count += 1;
                passer.inabilities.clear();
                let effects = advance_missions(passer, &ctx, &mut self.rng);
                let attack = std::mem::take(&mut passer.attack_armed);
                (play, effects, attack)
            }
            None => Default::default(),
        };

        self.forced_letter = None;
        if self.scramble_ui_for.as_ref() == Some(player) {
            self.scramble_ui_for = None;
        }

        let ricochet = effects.contains(&MissionEffect::Ricochet);
        let next = match previous_passer {
            Some(prev)
                if ricochet
                    && &prev != player
                    && self.players.get(&prev).map_or(false, |p| p.ready) =>
            {
                prev
            }
            _ => choose_next_holder(&self.players, player, &mut self.rng),
        };

        for effect in &effects {
            match *effect {
                MissionEffect::OpponentFactor(f) => extras.push((effect.label().to_string(), f)),
                MissionEffect::OwnNextTurn(f) => {
                    if let Some(passer) = self.players.get_mut(player) {
                        passer.next_turn_factor = Some(passer.next_turn_factor.unwrap_or(1.0) * f);
                    }
                }
                MissionEffect::FullNextTurn => {
                    if let Some(passer) = self.players.get_mut(player) {
                        passer.full_next_turn = true;
                    }
                }
                MissionEffect::Pace(f) => self.pace_factor = self.pace_factor.min(f),
                MissionEffect::Ricochet => {}
                MissionEffect::ScrambleNext => self.scramble_ui_for = Some(next.clone()),
                MissionEffect::ForceLetter(c) => self.forced_letter = Some(c),
            }
        }

        let mut full_turn = false;
        if let Some(target) = self.players.get_mut(&next) {
            if let Some(f) = target.next_turn_factor.take() {
                extras.push(("turn bonus".to_string(), f));
            }
            full_turn = std::mem::take(&mut target.full_next_turn);
            if attack {
                target
                    .inabilities
                    .extend(ComboKey::Attaque.column().iter().flat_map(|&d| keypad::letters_on(d)));
            }
        }
        if self.pace_factor < 1.0 {
            extras.push(("pace".to_string(), self.pace_factor));
        }

        let mut outcome = self.calculator.compute(&TimeoutInputs {
            response_time_ms,
            vowel: play.vowel_power.map(|p| (letter, p)),
            cursed: play.cursed,
            pad_combo: attack,
            extras,
        });
        if full_turn {
            let max_ms = self.calculator.policy().max_ms;
            outcome.timeout_ms = max_ms;
            outcome.log.final_ms = max_ms;
            outcome.applied.push("full turn".to_string());
        }

        debug!(
            "Pass '{}' by {} in {}ms, next {} gets {}ms {:?}",
            new_word, player, response_time_ms, next, outcome.timeout_ms, outcome.applied
        );

        self.history.push(TurnRecord {
            word: new_word.to_string(),
            player: player.clone(),
            response_time_ms,
            applied_multipliers: outcome.applied,
            timeout_log: outcome.log,
        });

        self.hand_over(new_word.to_string(), next, token.sequence + 1, outcome.timeout_ms, now_ms)
    }

    /// Arm the token for `holder` and describe where it must go.
    fn hand_over(
        &mut self,
        word: String,
        holder: PlayerId,
        sequence: u64,
        timeout_ms: u64,
        now_ms: i64,
    ) -> Handoff {
        let token = BallToken::armed(word, holder.clone(), sequence, timeout_ms, now_ms);
        let deadline_ms = token.deadline_ms;
        self.token = Some(token);
        let game_id = self.game_id.unwrap_or_else(Uuid::nil);

        if holder == self.self_id {
            Handoff::Local(ArmedBall { game_id, sequence, timeout_ms, deadline_ms })
        } else {
            let payload = self.ball_payload(&self.self_id);
            Handoff::Remote { target: holder, payload }
        }
    }

    // -------------------------------------------------------------------------
    // Incoming balls
    // -------------------------------------------------------------------------

    /// Become the holder of a ball delivered by a peer.
    pub fn receive_ball(&mut self, payload: BallPayload, now_ms: i64) -> Result<ArmedBall, TurnError> {
        if payload.holder != self.self_id {
            return Err(ValidationError::WrongRecipient(payload.holder).into());
        }
        if payload.word.is_empty() || !payload.word.chars().all(keypad::is_letter) {
            return Err(ValidationError::NotLowercase(payload.word).into());
        }

        if self.game_id == Some(payload.game_id) {
            match self.phase {
                GamePhase::GameOver => {
                    return Err(TurnError::TimerRace { sequence: payload.sequence });
                }
                GamePhase::Lobby => return Err(ValidationError::WrongGame.into()),
                GamePhase::Starting | GamePhase::Active => {
                    if let Some(token) = &self.token {
                        if payload.sequence <= token.sequence {
                            return Err(ValidationError::StaleSequence {
                                expected: token.sequence + 1,
                                got: payload.sequence,
                            }
                            .into());
                        }
                    }
                }
            }
        } else if self.is_local_holder() {
            return Err(TurnError::StateConflict(format!(
                "ball for game {} arrived while holding a ball of game {:?}",
                payload.game_id, self.game_id
            )));
        }

        let policy = self.calculator.policy();
        let timeout_ms = payload.timeout_ms.clamp(policy.min_ms, policy.max_ms);
        let sequence = payload.sequence;
        let game_id = payload.game_id;

        info!(
            "Received ball '{}' from {} (seq {}, {}ms)",
            payload.word, payload.from, sequence, timeout_ms
        );

        self.adopt(payload.game_id, payload.shared);
        let token = BallToken::armed(payload.word, self.self_id.clone(), sequence, timeout_ms, now_ms);
        let deadline_ms = token.deadline_ms;
        self.token = Some(token);

        Ok(ArmedBall { game_id, sequence, timeout_ms, deadline_ms })
    }

    /// Record that the ball moved between two other nodes. Returns false if
    /// the notice is stale or belongs to a game this node does not follow.
    pub fn observe_ball(&mut self, payload: BallPayload, now_ms: i64) -> bool {
        if payload.holder == self.self_id {
            return false;
        }

        let accept = if self.game_id == Some(payload.game_id) {
            matches!(self.phase, GamePhase::Active | GamePhase::Starting)
                && self.token.as_ref().map_or(true, |t| payload.sequence > t.sequence)
        } else {
            self.phase == GamePhase::Lobby
        };
        if !accept {
            debug!("Ignoring ball notice seq {} from {}", payload.sequence, payload.from);
            return false;
        }

        self.adopt(payload.game_id, payload.shared);
        self.token = Some(BallToken::armed(
            payload.word,
            payload.holder,
            payload.sequence,
            payload.timeout_ms,
            now_ms,
        ));
        true
    }

    /// Take over the shared state carried by a ball.
    fn adopt(&mut self, game_id: Uuid, shared: SharedState) {
        if self.game_id != Some(game_id) {
            self.last_loser = None;
        }
        self.game_id = Some(game_id);
        self.phase = GamePhase::Active;

        let mut players: BTreeMap<PlayerId, PlayerState> =
            shared.players.into_iter().map(|p| (p.id.clone(), p)).collect();
        for (id, player) in &self.players {
            if !players.contains_key(id) {
                let mut fresh = player.clone();
                fresh.reset_for_game(&self.config.power);
                players.insert(id.clone(), fresh);
            }
        }
        self.players = players;

        self.power.set_board(shared.curses);
        self.forced_letter = shared.forced_letter;
        self.scramble_ui_for = shared.scramble_ui_for;
        self.pace_factor = shared.pace_factor;
        self.history = shared.history;
    }

    // -------------------------------------------------------------------------
    // Game end
    // -------------------------------------------------------------------------

    /// Loss timer fired for `sequence`. A timer for a superseded turn
    /// does nothing.
    pub fn expire(&mut self, sequence: u64) -> Option<GameOverNotice> {
        match (&self.phase, &self.token) {
            (GamePhase::Active, Some(token))
                if token.sequence == sequence && token.holder == self.self_id =>
            {
                info!("Turn {} timed out, {} loses", sequence, self.self_id);
                Some(self.end_game(self.self_id.clone(), GameOverReason::Timeout))
            }
            _ => {
                debug!("Stale loss timer for turn {}", sequence);
                None
            }
        }
    }

    /// The ball for `sequence` could not be delivered to `target`.
    pub fn dispatch_failed(&mut self, sequence: u64, target: &PlayerId) -> Option<GameOverNotice> {
        match (&self.phase, &self.token) {
            (GamePhase::Active, Some(token))
                if token.sequence == sequence && &token.holder == target =>
            {
                warn!("Ball {} could not reach {}, game over", sequence, target);
                Some(self.end_game(target.clone(), GameOverReason::PeerUnreachable(target.clone())))
            }
            _ => None,
        }
    }

    fn end_game(&mut self, loser: PlayerId, reason: GameOverReason) -> GameOverNotice {
        let sequence = self.token.as_ref().map_or(0, |t| t.sequence);
        self.phase = GamePhase::GameOver;
        self.token = None;
        self.last_loser = Some(loser.clone());

        GameOverNotice {
            game_id: self.game_id.unwrap_or_else(Uuid::nil),
            loser,
            reason,
            sequence,
            history: self.history.clone(),
        }
    }

    /// Apply a game-over notice from a peer. Returns false if ignored.
    pub fn apply_game_over(&mut self, notice: GameOverNotice) -> bool {
        let applies = match self.phase {
            GamePhase::Active | GamePhase::Starting => self.game_id == Some(notice.game_id),
            GamePhase::Lobby => self.game_id.is_none(),
            GamePhase::GameOver => false,
        };
        if !applies {
            debug!("Ignoring game over for {}", notice.game_id);
            return false;
        }

        info!("Game {} over, {} lost ({:?})", notice.game_id, notice.loser, notice.reason);
        self.game_id = Some(notice.game_id);
        self.phase = GamePhase::GameOver;
        self.token = None;
        self.last_loser = Some(notice.loser);
        if notice.history.len() > self.history.len() {
            self.history = notice.history;
        }
        true
    }

    /// Return to the lobby. Idempotent: only the first call after a game
    /// ends archives its history.
    ///
    /// A node that is only watching a live game may also leave it, since a
    /// holder that went silent never sends the game over. The holder itself
    /// keeps playing until its deadline.
    pub fn rematch(&mut self) -> bool {
        match self.phase {
            GamePhase::GameOver => {}
            GamePhase::Active | GamePhase::Starting if !self.is_local_holder() => {
                warn!(
                    "Abandoning game {:?} held by {:?}",
                    self.game_id,
                    self.token.as_ref().map(|t| &t.holder)
                );
            }
            _ => return false,
        }

        if !self.history.is_empty() {
            self.archive.push(std::mem::take(&mut self.history));
        }
        for player in self.players.values_mut() {
            player.ready = false;
        }
        self.token = None;
        self.forced_letter = None;
        self.scramble_ui_for = None;
        self.pace_factor = 1.0;
        self.phase = GamePhase::Lobby;
        info!("Back to lobby, {} games archived", self.archive.len());
        true
    }

    // -------------------------------------------------------------------------
    // Combos
    // -------------------------------------------------------------------------

    fn require_local_holder(&self) -> Result<(), ValidationError> {
        match (&self.phase, &self.token) {
            (GamePhase::Active, Some(token)) if token.holder == self.self_id => Ok(()),
            (GamePhase::Active, Some(_)) => Err(ValidationError::NotHolder(self.self_id.clone())),
            _ => Err(ValidationError::NoActiveBall),
        }
    }

    /// Fire a charged combo on this node's player.
    pub fn combo(&mut self, key: ComboKey) -> Result<ComboEffect, TurnError> {
        self.require_local_holder()?;
        let player = self
            .players
            .get_mut(&self.self_id)
            .ok_or_else(|| ValidationError::UnknownPlayer(self.self_id.clone()))?;
        Ok(self.power.trigger_combo(player, key)?)
    }

    /// Fire the power-up for this node's player.
    pub fn power_up(&mut self) -> Result<(), TurnError> {
        self.require_local_holder()?;
        Ok(self.power.power_up(&self.self_id, &mut self.players)?)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn self_id(&self) -> &PlayerId {
        &self.self_id
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn game_id(&self) -> Option<Uuid> {
        self.game_id
    }

    pub fn players(&self) -> &BTreeMap<PlayerId, PlayerState> {
        &self.players
    }

    pub fn curses(&self) -> &CurseBoard {
        self.power.board()
    }

    pub fn token(&self) -> Option<&BallToken> {
        self.token.as_ref()
    }

    pub fn history(&self) -> &[TurnRecord] {
        &self.history
    }

    pub fn archive(&self) -> &[Vec<TurnRecord>] {
        &self.archive
    }

    pub fn forced_letter(&self) -> Option<char> {
        self.forced_letter
    }

    pub fn scramble_ui_for(&self) -> Option<&PlayerId> {
        self.scramble_ui_for.as_ref()
    }

    pub fn pace_factor(&self) -> f64 {
        self.pace_factor
    }

    pub fn last_loser(&self) -> Option<&PlayerId> {
        self.last_loser.as_ref()
    }

    /// This node holds a live ball.
    pub fn is_local_holder(&self) -> bool {
        self.phase == GamePhase::Active
            && self.token.as_ref().map_or(false, |t| t.holder == self.self_id)
    }

    /// Everything a ball carries besides the token itself.
    pub fn shared_state(&self) -> SharedState {
        SharedState {
            players: self.players.values().cloned().collect(),
            curses: self.power.board().clone(),
            forced_letter: self.forced_letter,
            scramble_ui_for: self.scramble_ui_for.clone(),
            pace_factor: self.pace_factor,
            history: self.history.clone(),
        }
    }

    /// The current ball as a payload sent by `from`.
    pub fn ball_payload(&self, from: &PlayerId) -> BallPayload {
        let (word, holder, timeout_ms, sequence) = match &self.token {
            Some(t) => (t.word.clone(), t.holder.clone(), t.timeout_ms, t.sequence),
            None => (String::new(), self.self_id.clone(), 0, 0),
        };
        BallPayload {
            game_id: self.game_id.unwrap_or_else(Uuid::nil),
            from: from.clone(),
            holder,
            word,
            timeout_ms,
            sequence,
            shared: self.shared_state(),
        }
    }
}

/// Check that `proposed` is `current` plus one lowercase letter and return
/// that letter.
fn validate_extension(current: &str, proposed: &str) -> Result<char, ValidationError> {
    if proposed.is_empty() || !proposed.chars().all(keypad::is_letter) {
        return Err(ValidationError::NotLowercase(proposed.to_string()));
    }

    let malformed = || ValidationError::MalformedExtension {
        current: current.to_string(),
        proposed: proposed.to_string(),
    };
    let tail = proposed.strip_prefix(current).ok_or_else(malformed)?;
    let mut chars = tail.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) => Ok(letter),
        _ => Err(malformed()),
    }
}
