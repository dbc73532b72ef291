//! Binary wire protocol between agents/spectators and the relay.
//!
//! Both directions are closed tagged unions with one leading tag byte,
//! handled exhaustively on both ends. Frames travel as WebSocket binary
//! messages.

use crate::{
    read_string, string_encode_size, write_string, AuthRequest, GameAction, Identity, Salt,
};
use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};
use commonware_cryptography::sha256::Digest;

/// Maximum length of a human-readable reason string.
pub const MAX_REASON_LENGTH: usize = 128;

/// Maximum number of entries in any wire-borne list (alive sets, winner
/// lists, released action batches).
pub const MAX_LIST_LENGTH: usize = 64;

fn write_identities(identities: &[Identity], writer: &mut impl BufMut) {
    (identities.len() as u32).write(writer);
    for identity in identities {
        identity.write(writer);
    }
}

fn read_identities(reader: &mut impl Buf) -> Result<Vec<Identity>, Error> {
    let len = u32::read(reader)? as usize;
    if len > MAX_LIST_LENGTH {
        return Err(Error::Invalid("Identities", "too many entries"));
    }
    let mut identities = Vec::with_capacity(len);
    for _ in 0..len {
        identities.push(Identity::read(reader)?);
    }
    Ok(identities)
}

fn identities_encode_size(identities: &[Identity]) -> usize {
    4 + identities.iter().map(|i| i.encode_size()).sum::<usize>()
}

fn write_salt(salt: &Salt, writer: &mut impl BufMut) {
    writer.put_slice(salt);
}

fn read_salt(reader: &mut impl Buf) -> Result<Salt, Error> {
    if reader.remaining() < 32 {
        return Err(Error::EndOfBuffer);
    }
    let mut salt = [0u8; 32];
    reader.copy_to_slice(&mut salt);
    Ok(salt)
}

/// Hidden role assigned to a participant at match start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Crew = 0,
    Saboteur = 1,
}

impl Write for Role {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for Role {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        match u8::read(reader)? {
            0 => Ok(Self::Crew),
            1 => Ok(Self::Saboteur),
            _ => Err(Error::Invalid("Role", "unknown tag")),
        }
    }
}

impl EncodeSize for Role {
    fn encode_size(&self) -> usize {
        1
    }
}

/// Phase timeline of a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GamePhase {
    Lobby = 0,
    /// Commit/reveal window for hidden actions.
    Night = 1,
    Discussion = 2,
    Voting = 3,
    Ended = 4,
}

impl Write for GamePhase {
    fn write(&self, writer: &mut impl BufMut) {
        (*self as u8).write(writer);
    }
}

impl Read for GamePhase {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        match u8::read(reader)? {
            0 => Ok(Self::Lobby),
            1 => Ok(Self::Night),
            2 => Ok(Self::Discussion),
            3 => Ok(Self::Voting),
            4 => Ok(Self::Ended),
            _ => Err(Error::Invalid("GamePhase", "unknown tag")),
        }
    }
}

impl EncodeSize for GamePhase {
    fn encode_size(&self) -> usize {
        1
    }
}

/// Why the relay closed a connection. Carried as the WebSocket close code
/// `4000 + tag`; a closure bearing none of these codes is "unexpected" and
/// is the only kind that triggers automatic reconnection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    Normal = 0,
    AuthFailed = 1,
    Kicked = 2,
    GameEnded = 3,
    DuplicateConnection = 4,
}

impl CloseReason {
    pub fn close_code(&self) -> u16 {
        4000 + *self as u16
    }

    pub fn from_close_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(Self::Normal),
            4001 => Some(Self::AuthFailed),
            4002 => Some(Self::Kicked),
            4003 => Some(Self::GameEnded),
            4004 => Some(Self::DuplicateConnection),
            _ => None,
        }
    }
}

/// Messages sent by agents and spectators to the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    /// Binary: [0] [AuthRequest]
    Auth(AuthRequest),

    /// Acknowledges a server heartbeat, echoing its timestamp.
    /// Binary: [1] [timestampMs:u64 BE]
    HeartbeatAck { timestamp_ms: u64 },

    /// Locks in a hidden action for a round.
    /// Binary: [2] [round:u64 BE] [digest:32]
    Commit { round: u64, digest: Digest },

    /// Discloses the committed action plus its salt for verification.
    /// Binary: [3] [round:u64 BE] [GameAction] [salt:32]
    Reveal {
        round: u64,
        action: GameAction,
        salt: Salt,
    },

    /// An open (non-hidden) action command expecting confirmation.
    /// Binary: [4] [actionId:u64 BE] [GameAction]
    Action { action_id: u64, action: GameAction },

    /// Subscribes an unauthenticated connection to a room as a spectator.
    /// Binary: [5] [gameIdLen:u32 BE] [gameIdBytes...]
    Spectate { game_id: String },
}

impl Write for ClientMessage {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Auth(auth) => {
                0u8.write(writer);
                auth.write(writer);
            }
            Self::HeartbeatAck { timestamp_ms } => {
                1u8.write(writer);
                timestamp_ms.write(writer);
            }
            Self::Commit { round, digest } => {
                2u8.write(writer);
                round.write(writer);
                digest.write(writer);
            }
            Self::Reveal {
                round,
                action,
                salt,
            } => {
                3u8.write(writer);
                round.write(writer);
                action.write(writer);
                write_salt(salt, writer);
            }
            Self::Action { action_id, action } => {
                4u8.write(writer);
                action_id.write(writer);
                action.write(writer);
            }
            Self::Spectate { game_id } => {
                5u8.write(writer);
                write_string(game_id, writer);
            }
        }
    }
}

impl Read for ClientMessage {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let message = match u8::read(reader)? {
            0 => Self::Auth(AuthRequest::read(reader)?),
            1 => Self::HeartbeatAck {
                timestamp_ms: u64::read(reader)?,
            },
            2 => Self::Commit {
                round: u64::read(reader)?,
                digest: Digest::read(reader)?,
            },
            3 => Self::Reveal {
                round: u64::read(reader)?,
                action: GameAction::read(reader)?,
                salt: read_salt(reader)?,
            },
            4 => Self::Action {
                action_id: u64::read(reader)?,
                action: GameAction::read(reader)?,
            },
            5 => Self::Spectate {
                game_id: read_string(reader, crate::MAX_GAME_ID_LENGTH)?,
            },
            _ => return Err(Error::Invalid("ClientMessage", "unknown tag")),
        };
        Ok(message)
    }
}

impl EncodeSize for ClientMessage {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Auth(auth) => auth.encode_size(),
            Self::HeartbeatAck { timestamp_ms } => timestamp_ms.encode_size(),
            Self::Commit { round, digest } => round.encode_size() + digest.encode_size(),
            Self::Reveal {
                round,
                action,
                salt: _,
            } => round.encode_size() + action.encode_size() + 32,
            Self::Action { action_id, action } => action_id.encode_size() + action.encode_size(),
            Self::Spectate { game_id } => string_encode_size(game_id),
        }
    }
}

/// Messages sent by the relay to agents and spectators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMessage {
    /// Binary: [0] [identity:32] [gameIdLen:u32 BE] [gameIdBytes...]
    AuthSuccess { identity: Identity, game_id: String },

    /// Binary: [1] [reasonLen:u32 BE] [reasonBytes...]
    AuthFailure { reason: String },

    /// Liveness probe; must be acknowledged with `HeartbeatAck`.
    /// Binary: [2] [timestampMs:u64 BE]
    Heartbeat { timestamp_ms: u64 },

    /// Binary: [3] [actionId:u64 BE]
    ActionConfirmed { action_id: u64 },

    /// Binary: [4] [actionId:u64 BE] [reasonLen:u32 BE] [reasonBytes...]
    ActionRejected { action_id: u64, reason: String },

    /// Snapshot of the authoritative room state.
    /// Binary: [5] [gameIdLen:u32 BE] [gameId...] [phase:u8] [round:u64 BE]
    ///         [aliveCount:u32 BE] [alive...]
    GameStateUpdate {
        game_id: String,
        phase: GamePhase,
        round: u64,
        alive: Vec<Identity>,
    },

    /// Binary: [6] [identity:32] [alive:u8]
    PlayerUpdate { identity: Identity, alive: bool },

    /// Delivered privately to one agent at match start.
    /// Binary: [7] [role:u8]
    RoleAssigned { role: Role },

    /// Binary: [8] [victim:32]
    PlayerKilled { victim: Identity },

    /// Binary: [9] [reporter:32] [victim:32]
    BodyReported { reporter: Identity, victim: Identity },

    /// Binary: [10] [round:u64 BE] [deadlineMs:u64 BE]
    VotingStarted { round: u64, deadline_ms: u64 },

    /// Binary: [11] [round:u64 BE] [ejected:Option<32>]
    VotingResult {
        round: u64,
        ejected: Option<Identity>,
    },

    /// Binary: [12] [identity:32]
    PlayerEjected { identity: Identity },

    /// Binary: [13] [gameIdLen:u32 BE] [gameId...] [winnerCount:u32 BE] [winners...]
    GameEnded {
        game_id: String,
        winners: Vec<Identity>,
    },

    /// The simultaneous release of every revealed action for a round.
    /// Binary: [14] [round:u64 BE] [count:u32 BE] ([identity:32] [GameAction])...
    RoundActions {
        round: u64,
        actions: Vec<(Identity, GameAction)>,
    },
}

impl Write for ServerMessage {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::AuthSuccess { identity, game_id } => {
                0u8.write(writer);
                identity.write(writer);
                write_string(game_id, writer);
            }
            Self::AuthFailure { reason } => {
                1u8.write(writer);
                write_string(reason, writer);
            }
            Self::Heartbeat { timestamp_ms } => {
                2u8.write(writer);
                timestamp_ms.write(writer);
            }
            Self::ActionConfirmed { action_id } => {
                3u8.write(writer);
                action_id.write(writer);
            }
            Self::ActionRejected { action_id, reason } => {
                4u8.write(writer);
                action_id.write(writer);
                write_string(reason, writer);
            }
            Self::GameStateUpdate {
                game_id,
                phase,
                round,
                alive,
            } => {
                5u8.write(writer);
                write_string(game_id, writer);
                phase.write(writer);
                round.write(writer);
                write_identities(alive, writer);
            }
            Self::PlayerUpdate { identity, alive } => {
                6u8.write(writer);
                identity.write(writer);
                alive.write(writer);
            }
            Self::RoleAssigned { role } => {
                7u8.write(writer);
                role.write(writer);
            }
            Self::PlayerKilled { victim } => {
                8u8.write(writer);
                victim.write(writer);
            }
            Self::BodyReported { reporter, victim } => {
                9u8.write(writer);
                reporter.write(writer);
                victim.write(writer);
            }
            Self::VotingStarted { round, deadline_ms } => {
                10u8.write(writer);
                round.write(writer);
                deadline_ms.write(writer);
            }
            Self::VotingResult { round, ejected } => {
                11u8.write(writer);
                round.write(writer);
                ejected.write(writer);
            }
            Self::PlayerEjected { identity } => {
                12u8.write(writer);
                identity.write(writer);
            }
            Self::GameEnded { game_id, winners } => {
                13u8.write(writer);
                write_string(game_id, writer);
                write_identities(winners, writer);
            }
            Self::RoundActions { round, actions } => {
                14u8.write(writer);
                round.write(writer);
                (actions.len() as u32).write(writer);
                for (identity, action) in actions {
                    identity.write(writer);
                    action.write(writer);
                }
            }
        }
    }
}

impl Read for ServerMessage {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let message = match u8::read(reader)? {
            0 => Self::AuthSuccess {
                identity: Identity::read(reader)?,
                game_id: read_string(reader, crate::MAX_GAME_ID_LENGTH)?,
            },
            1 => Self::AuthFailure {
                reason: read_string(reader, MAX_REASON_LENGTH)?,
            },
            2 => Self::Heartbeat {
                timestamp_ms: u64::read(reader)?,
            },
            3 => Self::ActionConfirmed {
                action_id: u64::read(reader)?,
            },
            4 => Self::ActionRejected {
                action_id: u64::read(reader)?,
                reason: read_string(reader, MAX_REASON_LENGTH)?,
            },
            5 => Self::GameStateUpdate {
                game_id: read_string(reader, crate::MAX_GAME_ID_LENGTH)?,
                phase: GamePhase::read(reader)?,
                round: u64::read(reader)?,
                alive: read_identities(reader)?,
            },
            6 => Self::PlayerUpdate {
                identity: Identity::read(reader)?,
                alive: bool::read(reader)?,
            },
            7 => Self::RoleAssigned {
                role: Role::read(reader)?,
            },
            8 => Self::PlayerKilled {
                victim: Identity::read(reader)?,
            },
            9 => Self::BodyReported {
                reporter: Identity::read(reader)?,
                victim: Identity::read(reader)?,
            },
            10 => Self::VotingStarted {
                round: u64::read(reader)?,
                deadline_ms: u64::read(reader)?,
            },
            11 => Self::VotingResult {
                round: u64::read(reader)?,
                ejected: Option::<Identity>::read(reader)?,
            },
            12 => Self::PlayerEjected {
                identity: Identity::read(reader)?,
            },
            13 => Self::GameEnded {
                game_id: read_string(reader, crate::MAX_GAME_ID_LENGTH)?,
                winners: read_identities(reader)?,
            },
            14 => {
                let round = u64::read(reader)?;
                let len = u32::read(reader)? as usize;
                if len > MAX_LIST_LENGTH {
                    return Err(Error::Invalid("RoundActions", "too many entries"));
                }
                let mut actions = Vec::with_capacity(len);
                for _ in 0..len {
                    actions.push((Identity::read(reader)?, GameAction::read(reader)?));
                }
                Self::RoundActions { round, actions }
            }
            _ => return Err(Error::Invalid("ServerMessage", "unknown tag")),
        };
        Ok(message)
    }
}

impl EncodeSize for ServerMessage {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::AuthSuccess { identity, game_id } => {
                identity.encode_size() + string_encode_size(game_id)
            }
            Self::AuthFailure { reason } => string_encode_size(reason),
            Self::Heartbeat { timestamp_ms } => timestamp_ms.encode_size(),
            Self::ActionConfirmed { action_id } => action_id.encode_size(),
            Self::ActionRejected { action_id, reason } => {
                action_id.encode_size() + string_encode_size(reason)
            }
            Self::GameStateUpdate {
                game_id,
                phase,
                round,
                alive,
            } => {
                string_encode_size(game_id)
                    + phase.encode_size()
                    + round.encode_size()
                    + identities_encode_size(alive)
            }
            Self::PlayerUpdate { identity, alive } => identity.encode_size() + alive.encode_size(),
            Self::RoleAssigned { role } => role.encode_size(),
            Self::PlayerKilled { victim } => victim.encode_size(),
            Self::BodyReported { reporter, victim } => {
                reporter.encode_size() + victim.encode_size()
            }
            Self::VotingStarted { round, deadline_ms } => {
                round.encode_size() + deadline_ms.encode_size()
            }
            Self::VotingResult { round, ejected } => round.encode_size() + ejected.encode_size(),
            Self::PlayerEjected { identity } => identity.encode_size(),
            Self::GameEnded { game_id, winners } => {
                string_encode_size(game_id) + identities_encode_size(winners)
            }
            Self::RoundActions { round, actions } => {
                round.encode_size()
                    + 4
                    + actions
                        .iter()
                        .map(|(identity, action)| identity.encode_size() + action.encode_size())
                        .sum::<usize>()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ActionKind;
    use commonware_codec::{DecodeExt, Encode};
    use commonware_cryptography::{
        ed25519::PrivateKey, Hasher, PrivateKeyExt, Sha256, Signer,
    };
    use rand::{rngs::StdRng, SeedableRng};

    fn identity(seed: u64) -> Identity {
        PrivateKey::from_rng(&mut StdRng::seed_from_u64(seed)).public_key()
    }

    #[test]
    fn test_client_message_roundtrip() {
        let mut rng = StdRng::seed_from_u64(1);
        let private = PrivateKey::from_rng(&mut rng);
        let digest = Sha256::hash(b"commitment");
        for message in [
            ClientMessage::Auth(crate::AuthRequest::sign(&private, "room-9".to_string(), 55)),
            ClientMessage::HeartbeatAck { timestamp_ms: 77 },
            ClientMessage::Commit { round: 3, digest },
            ClientMessage::Reveal {
                round: 3,
                action: GameAction::new(ActionKind::Kill).with_target(identity(2)),
                salt: [5u8; 32],
            },
            ClientMessage::Action {
                action_id: 12,
                action: GameAction::new(ActionKind::Vote).with_target(identity(3)),
            },
            ClientMessage::Spectate {
                game_id: "room-9".to_string(),
            },
        ] {
            let decoded = ClientMessage::decode(&mut message.encode().as_ref()).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn test_server_message_roundtrip() {
        for message in [
            ServerMessage::AuthSuccess {
                identity: identity(1),
                game_id: "room-9".to_string(),
            },
            ServerMessage::AuthFailure {
                reason: "bad signature".to_string(),
            },
            ServerMessage::Heartbeat { timestamp_ms: 9 },
            ServerMessage::ActionConfirmed { action_id: 4 },
            ServerMessage::ActionRejected {
                action_id: 4,
                reason: "invalid phase".to_string(),
            },
            ServerMessage::GameStateUpdate {
                game_id: "room-9".to_string(),
                phase: GamePhase::Night,
                round: 2,
                alive: vec![identity(1), identity(2)],
            },
            ServerMessage::RoleAssigned {
                role: Role::Saboteur,
            },
            ServerMessage::VotingResult {
                round: 2,
                ejected: Some(identity(2)),
            },
            ServerMessage::GameEnded {
                game_id: "room-9".to_string(),
                winners: vec![identity(1)],
            },
            ServerMessage::RoundActions {
                round: 2,
                actions: vec![(
                    identity(1),
                    GameAction::new(ActionKind::Move).with_destination("reactor"),
                )],
            },
        ] {
            let decoded = ServerMessage::decode(&mut message.encode().as_ref()).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn test_close_reason_codes() {
        for reason in [
            CloseReason::Normal,
            CloseReason::AuthFailed,
            CloseReason::Kicked,
            CloseReason::GameEnded,
            CloseReason::DuplicateConnection,
        ] {
            assert_eq!(CloseReason::from_close_code(reason.close_code()), Some(reason));
        }
        // Anything outside the reserved band is an unexpected closure.
        assert_eq!(CloseReason::from_close_code(1000), None);
        assert_eq!(CloseReason::from_close_code(4005), None);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(ClientMessage::decode(&mut [200u8].as_slice()).is_err());
        assert!(ServerMessage::decode(&mut [200u8].as_slice()).is_err());
    }

    #[test]
    fn test_oversized_list_rejected() {
        let message = ServerMessage::GameStateUpdate {
            game_id: "room".to_string(),
            phase: GamePhase::Lobby,
            round: 0,
            alive: vec![identity(1)],
        };
        let mut bytes = message.encode().to_vec();
        // Patch the alive-count word to exceed the bound.
        let count_offset = bytes.len() - 32 - 4;
        bytes[count_offset..count_offset + 4].copy_from_slice(&(65u32).to_be_bytes());
        assert!(ServerMessage::decode(&mut bytes.as_slice()).is_err());
    }
}
