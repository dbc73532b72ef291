//! Live connection bookkeeping: which duplex connections exist, which
//! identity each one is bound to, and which room it sits in.
//!
//! The registry enforces at-most-one-live-connection-per-identity. A second
//! binding attempt for an identity that is already bound to a different live
//! connection fails with [`RegistryError::DuplicateIdentity`].

use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use veilmatch_types::{CloseReason, Identity, ServerMessage};

/// Frames handed to a connection's socket writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Close with an explicit reason code.
    Close(CloseReason),
    /// Drop the socket without a reason; peers observe an unexpected closure.
    Terminate,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("identity is already bound to a live connection")]
    DuplicateIdentity,
    #[error("unknown connection")]
    UnknownConnection,
    #[error("connection already has a bound identity")]
    AlreadyBound,
    #[error("send failed: peer hung up")]
    SendFailed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    Agent,
    Spectator,
}

/// One live duplex connection. The `outbox` is the exclusively owned
/// transport handle; the socket writer task drains it.
pub struct Connection {
    pub id: ConnectionId,
    pub kind: ConnectionKind,
    pub joined_at: Instant,
    pub identity: Option<Identity>,
    pub room: Option<String>,
    outbox: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: u64,
    connections: HashMap<ConnectionId, Connection>,
    by_identity: HashMap<Identity, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection. Always succeeds and assigns a fresh id.
    pub fn add_connection(
        &mut self,
        outbox: mpsc::UnboundedSender<Outbound>,
        kind: ConnectionKind,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                kind,
                joined_at: Instant::now(),
                identity: None,
                room: None,
                outbox,
            },
        );
        id
    }

    /// Binds `identity` to the connection. Set at most once per connection;
    /// fails if the identity is already bound to a different live connection.
    pub fn bind_identity(
        &mut self,
        id: ConnectionId,
        identity: Identity,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = self.by_identity.get(&identity) {
            if *existing != id {
                return Err(RegistryError::DuplicateIdentity);
            }
        }
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection)?;
        if connection.identity.is_some() {
            return Err(RegistryError::AlreadyBound);
        }
        connection.identity = Some(identity.clone());
        self.by_identity.insert(identity, id);
        Ok(())
    }

    pub fn set_kind(&mut self, id: ConnectionId, kind: ConnectionKind) -> Result<(), RegistryError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection)?;
        connection.kind = kind;
        Ok(())
    }

    pub fn join_room(&mut self, id: ConnectionId, room: String) -> Result<(), RegistryError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection)?;
        connection.room = Some(room);
        Ok(())
    }

    /// Releases the connection's identity binding and room membership.
    /// Idempotent: removing an unknown id is a no-op.
    pub fn remove_connection(&mut self, id: ConnectionId) {
        let Some(connection) = self.connections.remove(&id) else {
            return;
        };
        if let Some(identity) = connection.identity {
            // Only release if the binding still points at this connection.
            if self.by_identity.get(&identity) == Some(&id) {
                self.by_identity.remove(&identity);
            }
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_by_identity(&self, identity: &Identity) -> Option<&Connection> {
        let id = self.by_identity.get(identity)?;
        self.connections.get(id)
    }

    pub fn identity_of(&self, id: ConnectionId) -> Option<&Identity> {
        self.connections.get(&id)?.identity.as_ref()
    }

    pub fn room_of(&self, id: ConnectionId) -> Option<&str> {
        self.connections.get(&id)?.room.as_deref()
    }

    pub fn connections_in_room<'a>(
        &'a self,
        room: &'a str,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .values()
            .filter(move |c| c.room.as_deref() == Some(room))
    }

    pub fn agent_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.kind == ConnectionKind::Agent)
            .count()
    }

    pub fn spectator_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.kind == ConnectionKind::Spectator)
            .count()
    }

    /// Best-effort delivery to one connection. A failure is reported to the
    /// caller and never silently retried.
    pub fn send(&self, id: ConnectionId, message: ServerMessage) -> Result<(), RegistryError> {
        let connection = self
            .connections
            .get(&id)
            .ok_or(RegistryError::UnknownConnection)?;
        connection
            .outbox
            .send(Outbound::Message(message))
            .map_err(|_| RegistryError::SendFailed)
    }

    /// Queues a close frame with an explicit reason on the connection's
    /// writer.
    pub fn close(&self, id: ConnectionId, reason: CloseReason) -> Result<(), RegistryError> {
        let connection = self
            .connections
            .get(&id)
            .ok_or(RegistryError::UnknownConnection)?;
        connection
            .outbox
            .send(Outbound::Close(reason))
            .map_err(|_| RegistryError::SendFailed)
    }

    /// Drops the connection's socket without a close reason.
    pub fn terminate(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let connection = self
            .connections
            .get(&id)
            .ok_or(RegistryError::UnknownConnection)?;
        connection
            .outbox
            .send(Outbound::Terminate)
            .map_err(|_| RegistryError::SendFailed)
    }

    /// Every live connection.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Best-effort delivery to every connection in a room. Failures are
    /// collected and returned.
    pub fn broadcast(
        &self,
        room: &str,
        message: &ServerMessage,
    ) -> Vec<(ConnectionId, RegistryError)> {
        let mut failures = Vec::new();
        for connection in self.connections_in_room(room) {
            if connection.outbox.send(Outbound::Message(message.clone())).is_err() {
                failures.push((connection.id, RegistryError::SendFailed));
            }
        }
        failures
    }

    /// Best-effort delivery to one identity, if it has a live connection.
    pub fn send_to_identity(
        &self,
        identity: &Identity,
        message: ServerMessage,
    ) -> Result<(), RegistryError> {
        let connection = self
            .connection_by_identity(identity)
            .ok_or(RegistryError::UnknownConnection)?;
        connection
            .outbox
            .send(Outbound::Message(message))
            .map_err(|_| RegistryError::SendFailed)
    }
}
