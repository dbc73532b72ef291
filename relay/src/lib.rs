//! Authoritative match relay: accepts agent and spectator websocket
//! connections, arbitrates the commit/reveal protocol per room, escrows
//! wagers, and settles the pot exactly once per match.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod chain;
pub mod commitments;
pub mod history;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod wagers;

pub use chain::{
    assign_roles, game_key, spawn_chain_worker, ChainCommand, ChainError, ChainLedger,
    OffchainLedger,
};
pub use commitments::{CommitmentError, CommitmentProtocol};
pub use history::{spawn_history_worker, HistorySink, LogHistorySink, MatchRecord};
pub use registry::{ConnectionId, ConnectionKind, ConnectionRegistry, RegistryError};
pub use rooms::{Room, RoomConfig, RoomEvent};
pub use server::{Relay, RelayConfig};
pub use wagers::{WagerError, WagerLedger};

/// On-disk relay configuration. Every field has a default so an empty file
/// is a valid config.
#[derive(Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub auth_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub initial_deposit: u64,
    pub stake: u64,
    pub min_players: usize,
    pub commit_window_ms: u64,
    pub reveal_window_ms: u64,
    pub discussion_ms: u64,
    pub voting_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            port: 8080,
            auth_timeout_ms: relay.auth_timeout.as_millis() as u64,
            heartbeat_interval_ms: relay.heartbeat_interval.as_millis() as u64,
            heartbeat_timeout_ms: relay.heartbeat_timeout.as_millis() as u64,
            initial_deposit: relay.initial_deposit,
            stake: relay.stake,
            min_players: relay.room.min_players,
            commit_window_ms: relay.room.commit_window_ms,
            reveal_window_ms: relay.room.reveal_window_ms,
            discussion_ms: relay.room.discussion_ms,
            voting_ms: relay.room.voting_ms,
        }
    }
}

impl Config {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            auth_timeout: Duration::from_millis(self.auth_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            initial_deposit: self.initial_deposit,
            stake: self.stake,
            room: RoomConfig {
                min_players: self.min_players,
                commit_window_ms: self.commit_window_ms,
                reveal_window_ms: self.reveal_window_ms,
                discussion_ms: self.discussion_ms,
                voting_ms: self.voting_ms,
            },
        }
    }
}
