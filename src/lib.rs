//! # Word Ball
//!
//! Peer-to-peer word relay. Each player runs one node; a single ball
//! carrying a growing word travels between nodes, and whoever holds it
//! when its deadline passes loses.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WORD BALL NODE                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic helpers                     │
//! │  ├── rng.rs      - Seeded Xorshift128+ PRNG                  │
//! │  └── keypad.rs   - Alphabet, vowels, phone keypad, combos    │
//! │                                                              │
//! │  game/           - Turn rules (no I/O, no clocks)            │
//! │  ├── state.rs    - Players, ball token, history, payloads    │
//! │  ├── timeout.rs  - Next-holder deadline formula              │
//! │  ├── power.rs    - Vowel power, keypad charge, curses        │
//! │  ├── mission.rs  - Per-player missions                       │
//! │  ├── scheduler.rs- Next-holder choice                        │
//! │  └── session.rs  - Per-node state machine                    │
//! │                                                              │
//! │  network/        - Sockets and timers                        │
//! │  ├── protocol.rs - Client and peer messages                  │
//! │  ├── registry.rs - Known peers                               │
//! │  ├── peer.rs     - Outbound peer calls                       │
//! │  ├── timer.rs    - Loss timer                                │
//! │  ├── broadcast.rs- State push channel                        │
//! │  ├── node.rs     - API operations                            │
//! │  └── server.rs   - WebSocket server                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority
//!
//! There is no coordinator. Only the node holding the ball mutates the
//! game, and it hands the whole shared state over with the ball. The
//! `sequence` counter orders turns; anything carrying an older sequence
//! is ignored.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use game::session::{GameSession, SessionConfig, TurnError, ValidationError};
pub use game::state::{GamePhase, PlayerId, PlayerState};
pub use network::node::{NodeError, PeerNode};
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
