//! Power System
//!
//! Everything a played letter charges: vowel power, keypad digits, letter
//! counts that escalate into curses, and the combos and power-up those
//! charges unlock.

use std::collections::{BTreeMap, BTreeSet};
use serde::{Serialize, Deserialize};
use tracing::info;

use crate::core::keypad::{self, ComboKey, PAD_DIGITS, VOWELS};
use crate::game::session::ValidationError;
use crate::game::state::{PlayerId, PlayerState};

/// Tunable constants of the power system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowerPolicy {
    /// Vowel power at game start
    pub vowel_initial: f64,
    /// Power gained each time a vowel is played
    pub vowel_increment: f64,
    /// Vowel power cap
    pub vowel_cap: f64,
    /// Keypad digit cap
    pub pad_cap: u8,
    /// Plays of one letter by one player before it escalates
    pub curse_threshold: u32,
}

impl Default for PowerPolicy {
    fn default() -> Self {
        Self {
            vowel_initial: 1.0,
            vowel_increment: 0.25,
            vowel_cap: 2.0,
            pad_cap: 3,
            curse_threshold: 3,
        }
    }
}

/// Game-wide letter curses.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurseBoard {
    /// Letters that cut the next timeout
    pub cursed: BTreeSet<char>,
    /// Letters nobody may play
    pub dead: BTreeSet<char>,
    /// How far each letter has escalated (1 = cursed once, 2 = dead)
    pub levels: BTreeMap<char, u8>,
}

/// What one played letter did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LetterPlay {
    /// Vowel power before this play, if the letter is a vowel
    pub vowel_power: Option<f64>,
    /// The letter was cursed; the curse is now lifted
    pub cursed: bool,
    /// The letter just became cursed
    pub newly_cursed: bool,
    /// The letter just became dead
    pub newly_dead: bool,
}

/// Effect of a fired combo.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComboEffect {
    /// Every curse cleared.
    Purged { cleared: usize },
    /// Vowel power refilled, keypad emptied.
    Recharged,
    /// Next holder handicapped.
    AttackArmed,
}

/// Per-game power rules.
#[derive(Clone, Debug, Default)]
pub struct PowerSystem {
    policy: PowerPolicy,
    board: CurseBoard,
}

impl PowerSystem {
    /// Create a power system.
    pub fn new(policy: PowerPolicy) -> Self {
        Self {
            policy,
            board: CurseBoard::default(),
        }
    }

    /// The policy in use.
    pub fn policy(&self) -> &PowerPolicy {
        &self.policy
    }

    /// Current curses.
    pub fn board(&self) -> &CurseBoard {
        &self.board
    }

    /// Adopt curses carried by a ball.
    pub fn set_board(&mut self, board: CurseBoard) {
        self.board = board;
    }

    /// Forget all curses (new game).
    pub fn reset(&mut self) {
        self.board = CurseBoard::default();
    }

    /// Letter may not be played by anyone.
    pub fn is_dead(&self, letter: char) -> bool {
        self.board.dead.contains(&letter)
    }

    /// Letter cuts the next timeout.
    pub fn is_cursed(&self, letter: char) -> bool {
        self.board.cursed.contains(&letter)
    }

    /// Apply one accepted letter to its player.
    pub fn play_letter(&mut self, player: &mut PlayerState, letter: char) -> LetterPlay {
        let mut play = LetterPlay::default();

        // Playing a cursed letter lifts the curse but costs the whole pad
        if self.board.cursed.remove(&letter) {
            play.cursed = true;
            player.reset_pad();
            player.letter_counts.remove(&letter);
            info!("Player {} played cursed letter '{}', curse lifted", player.id, letter);
        }

        if let Some(digit) = keypad::pad_digit(letter) {
            let charge = player.phone_pad.entry(digit).or_insert(0);
            *charge = (*charge + 1).min(self.policy.pad_cap);
        }

        if keypad::is_vowel(letter) {
            let power = player.vowel_power.entry(letter).or_insert(self.policy.vowel_initial);
            play.vowel_power = Some(*power);
            *power = (*power + self.policy.vowel_increment).min(self.policy.vowel_cap);
        }

        let count = player.letter_counts.entry(letter).or_insert(0);
        *count += 1;
        if *count >= self.policy.curse_threshold {
            *count = 0;
            let level = self.board.levels.entry(letter).or_insert(0);
            match *level {
                0 => {
                    *level = 1;
                    self.board.cursed.insert(letter);
                    play.newly_cursed = true;
                    info!("Letter '{}' is now cursed", letter);
                }
                1 => {
                    *level = 2;
                    self.board.cursed.remove(&letter);
                    self.board.dead.insert(letter);
                    play.newly_dead = true;
                    info!("Letter '{}' is now dead", letter);
                }
                _ => {}
            }
        }

        play
    }

    /// Every digit of the combo's column holds a charge.
    pub fn column_charged(player: &PlayerState, key: ComboKey) -> bool {
        key.column().iter().all(|&d| player.pad_charge(d) >= 1)
    }

    /// Every digit 2-9 holds a charge.
    pub fn power_up_ready(player: &PlayerState) -> bool {
        PAD_DIGITS.iter().all(|&d| player.pad_charge(d) >= 1)
    }

    /// Fire a charged combo, consuming its column.
    pub fn trigger_combo(
        &mut self,
        player: &mut PlayerState,
        key: ComboKey,
    ) -> Result<ComboEffect, ValidationError> {
        if !Self::column_charged(player, key) {
            return Err(ValidationError::ComboNotCharged(key));
        }

        for digit in key.column() {
            player.phone_pad.insert(*digit, 0);
        }

        let effect = match key {
            ComboKey::Purge => {
                let cleared = self.board.cursed.len();
                self.board.cursed.clear();
                ComboEffect::Purged { cleared }
            }
            ComboKey::Recharge => {
                for vowel in VOWELS {
                    player.vowel_power.insert(vowel, self.policy.vowel_cap);
                }
                player.reset_pad();
                ComboEffect::Recharged
            }
            ComboKey::Attaque => {
                player.attack_armed = true;
                ComboEffect::AttackArmed
            }
        };

        info!("Player {} fired combo '{}': {:?}", player.id, key.symbol(), effect);
        Ok(effect)
    }

    /// Fire the power-up: every keypad is wiped, the activator's
    /// inabilities are lifted.
    pub fn power_up(
        &mut self,
        activator: &PlayerId,
        players: &mut BTreeMap<PlayerId, PlayerState>,
    ) -> Result<(), ValidationError> {
        let player = players
            .get(activator)
            .ok_or_else(|| ValidationError::UnknownPlayer(activator.clone()))?;
        if !Self::power_up_ready(player) {
            return Err(ValidationError::PowerUpNotReady);
        }

        for player in players.values_mut() {
            player.reset_pad();
        }
        if let Some(player) = players.get_mut(activator) {
            player.inabilities.clear();
        }

        info!("Player {} fired the power-up", activator);
        Ok(())
    }
}
