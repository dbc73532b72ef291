//! Client-side toolkit for veilmatch relays: a resilient per-identity link,
//! a multi-identity orchestrator, and the strategy seam agents plug into.

pub mod link;
pub mod orchestrator;
pub mod strategy;

pub use link::{
    AgentLinkClient, CredentialProvider, LinkConfig, LinkEvent, LinkState, SignerCredentials,
};
pub use orchestrator::{ConnectionOrchestrator, MergedGameView};
pub use strategy::{IdleStrategy, Strategy};

use thiserror::Error;

/// Error type for client operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid data: {0}")]
    InvalidData(#[from] commonware_codec::Error),
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid URL scheme: {0} (expected http, https, ws, or wss)")]
    InvalidScheme(String),
    #[error("authentication refused: {0}")]
    AuthFailed(String),
    #[error("authentication timed out")]
    AuthTimeout,
    #[error("link is no longer running")]
    LinkClosed,
    #[error("identity is not registered with the orchestrator")]
    UnknownIdentity,
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
