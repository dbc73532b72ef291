//! Shared types for the veilmatch coordination layer: identities and auth
//! credentials, hidden actions, commitment hashing, and the binary wire
//! protocol spoken between agents and the relay.

use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};
use commonware_cryptography::{ed25519, Signer, Verifier};
use commonware_utils::union;

pub mod action;
pub mod commitment;
pub mod wire;

pub use action::{ActionKind, GameAction};
pub use commitment::{commitment_digest, generate_commitment, Salt};
pub use wire::{ClientMessage, CloseReason, GamePhase, Role, ServerMessage};

/// Domain separator for all veilmatch signatures.
pub const NAMESPACE: &[u8] = b"_VEILMATCH";
pub const AUTH_SUFFIX: &[u8] = b"_AUTH";

/// Maximum length of a room/game identifier on the wire.
pub const MAX_GAME_ID_LENGTH: usize = 128;

/// Credentials older (or newer) than this relative to the relay clock are
/// rejected as expired.
pub const MAX_AUTH_SKEW_MS: u64 = 60_000;

/// The stable key identifying a participant, independent of any one
/// connection.
pub type Identity = ed25519::PublicKey;

#[inline]
pub fn auth_namespace() -> Vec<u8> {
    union(NAMESPACE, AUTH_SUFFIX)
}

/// Helper to write a string as length-prefixed UTF-8 bytes.
pub(crate) fn write_string(s: &str, writer: &mut impl BufMut) {
    let bytes = s.as_bytes();
    (bytes.len() as u32).write(writer);
    writer.put_slice(bytes);
}

/// Helper to read a string from length-prefixed UTF-8 bytes.
pub(crate) fn read_string(reader: &mut impl Buf, max_len: usize) -> Result<String, Error> {
    let len = u32::read(reader)? as usize;
    if len > max_len {
        return Err(Error::Invalid("String", "too long"));
    }
    if reader.remaining() < len {
        return Err(Error::EndOfBuffer);
    }
    let mut bytes = vec![0u8; len];
    reader.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| Error::Invalid("String", "invalid UTF-8"))
}

/// Helper to get encode size of a string.
pub(crate) fn string_encode_size(s: &str) -> usize {
    4 + s.len()
}

/// A one-shot authentication credential: an ed25519 signature binding an
/// identity to a game and a freshness timestamp.
///
/// Credentials are produced fresh for every connection attempt and are never
/// reused across attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthRequest {
    pub identity: Identity,
    pub game_id: String,
    pub timestamp_ms: u64,
    pub signature: ed25519::Signature,
}

impl AuthRequest {
    fn payload(game_id: &str, timestamp_ms: u64) -> Vec<u8> {
        let mut payload = Vec::new();
        write_string(game_id, &mut payload);
        timestamp_ms.write(&mut payload);
        payload
    }

    pub fn sign(private: &ed25519::PrivateKey, game_id: String, timestamp_ms: u64) -> Self {
        let signature = private.sign(
            Some(&auth_namespace()),
            &Self::payload(&game_id, timestamp_ms),
        );
        Self {
            identity: private.public_key(),
            game_id,
            timestamp_ms,
            signature,
        }
    }

    pub fn verify(&self) -> bool {
        self.identity.verify(
            Some(&auth_namespace()),
            &Self::payload(&self.game_id, self.timestamp_ms),
            &self.signature,
        )
    }

    /// Whether the credential's timestamp is within the allowed skew of
    /// `now_ms`.
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms.abs_diff(self.timestamp_ms) <= MAX_AUTH_SKEW_MS
    }
}

impl Write for AuthRequest {
    fn write(&self, writer: &mut impl BufMut) {
        self.identity.write(writer);
        write_string(&self.game_id, writer);
        self.timestamp_ms.write(writer);
        self.signature.write(writer);
    }
}

impl Read for AuthRequest {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            identity: Identity::read(reader)?,
            game_id: read_string(reader, MAX_GAME_ID_LENGTH)?,
            timestamp_ms: u64::read(reader)?,
            signature: ed25519::Signature::read(reader)?,
        })
    }
}

impl EncodeSize for AuthRequest {
    fn encode_size(&self) -> usize {
        self.identity.encode_size()
            + string_encode_size(&self.game_id)
            + self.timestamp_ms.encode_size()
            + self.signature.encode_size()
    }
}
