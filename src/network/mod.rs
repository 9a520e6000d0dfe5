//! Network Layer
//!
//! Everything with a socket or a clock. Game rules live in `game/`; this
//! layer moves the ball between nodes and keeps local clients informed.
//!
//! ## Module Structure
//!
//! - `protocol`: Client JSON messages, peer bincode messages, state snapshot
//! - `registry`: Known peers and discovery candidates
//! - `peer`: Outbound calls to other nodes
//! - `timer`: Loss timer keyed by sequence
//! - `broadcast`: State snapshot push channel
//! - `node`: Every operation bound to one owned session
//! - `server`: WebSocket accept loop and configuration

pub mod protocol;
pub mod registry;
pub mod peer;
pub mod timer;
pub mod broadcast;
pub mod node;
pub mod server;

pub use protocol::{
    ClientMessage, ServerMessage, ErrorCode, ServerError, PeerRequest, PeerResponse,
    StateSnapshot, PlayersInfo,
};
pub use registry::{PeerInfo, PeerRegistry};
pub use peer::PeerClient;
pub use timer::LossTimer;
pub use broadcast::StateBroadcaster;
pub use node::{NodeConfig, NodeError, PeerNode};
pub use server::{GameServer, ServerConfig, GameServerError};
