// src/network/mod.rs
//! Network communication components
//!
//! This module handles all network interactions with the mining pool and the
//! blockchain node:
//! - `PoolSession`: Registration, work and shares over a pool connection
//! - `NodeClient`: Consensus, balance and mempool queries over JSON-RPC

/// Mining pool session implementation
///
/// Manages the connection lifecycle, work notifications, share submission,
/// keepalive and reconnection.
pub mod pool;

/// Blockchain node client implementation
///
/// Polls a node's JSON-RPC interface for consensus state and serves ledger
/// queries for the statistics line.
pub mod node;

/// Pool wire messages and miner identity
pub mod protocol;

/// Transport abstraction and the WebSocket connector
pub mod transport;

/// Session lifecycle states
pub mod state;

/// Reconnection delays
pub mod backoff;

// Re-export main components for cleaner imports
pub use node::{ConsensusEvent, Ledger, NodeClient, NodeConfig};
pub use pool::{PoolConfig, PoolSession, SessionEvent, SessionHandle, SessionSettings};
pub use protocol::MinerIdentity;
pub use state::SessionState;
pub use transport::{Connector, PoolLink, WsConnector};
