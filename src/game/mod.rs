//! Game Logic Module
//!
//! All turn-token rules. No I/O and no clocks: callers pass the current
//! time in milliseconds.
//!
//! ## Module Structure
//!
//! - `state`: Players, the ball, turn records, payloads carried with the ball
//! - `timeout`: Next-holder deadline formula
//! - `power`: Vowel power, keypad charge, curses, combos, power-up
//! - `mission`: Per-player missions and their effects
//! - `scheduler`: Next-holder choice and handoff description
//! - `session`: The per-node state machine and its errors

pub mod state;
pub mod timeout;
pub mod power;
pub mod mission;
pub mod scheduler;
pub mod session;

// Re-export key types
pub use state::{
    BallPayload, BallToken, GameOverNotice, GameOverReason, GamePhase, PlayerId,
    PlayerState, SharedState, TurnRecord, TimeoutLog,
};
pub use timeout::{TimeoutCalculator, TimeoutInputs, TimeoutPolicy};
pub use power::{ComboEffect, CurseBoard, PowerPolicy, PowerSystem};
pub use mission::{Mission, MissionEffect, MissionKind};
pub use scheduler::{choose_next_holder, ArmedBall, Handoff};
pub use session::{GameSession, SessionConfig, TurnError, ValidationError};
