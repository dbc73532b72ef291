//! Commit/reveal hashing for hidden actions.
//!
//! The digest pins an exact byte encoding so that independently written
//! committers and verifiers agree bit-for-bit:
//!
//! 1. action kind: one byte (its wire tag)
//! 2. target: 32 public-key bytes, or 32 zero bytes when absent
//! 3. destination: `u32` big-endian length then UTF-8 bytes; absent encodes
//!    as length 0 (an empty string is normalized to absent before hashing)
//! 4. auxiliary: `u64` big-endian; absent encodes as 0 (a zero value is
//!    normalized to absent before hashing)
//! 5. salt: 32 raw bytes
//! 6. committer identity: 32 public-key bytes

use crate::{GameAction, Identity};
use commonware_cryptography::{sha256::Digest, Hasher, Sha256};
use rand::{CryptoRng, RngCore};

/// Random pre-image material held by the committer until reveal.
pub type Salt = [u8; 32];

/// Sentinel written for an absent target.
const ABSENT_TARGET: [u8; 32] = [0u8; 32];

/// Computes the commitment digest for `action` by `identity` under `salt`.
///
/// The action is normalized first, so callers may pass un-normalized actions
/// and still interoperate.
pub fn commitment_digest(action: &GameAction, salt: &Salt, identity: &Identity) -> Digest {
    let action = action.clone().normalized();
    let mut hasher = Sha256::new();
    hasher.update(&[action.kind.tag()]);
    match &action.target {
        Some(target) => {
            hasher.update(target.as_ref());
        }
        None => {
            hasher.update(&ABSENT_TARGET);
        }
    }
    match &action.destination {
        Some(destination) => {
            hasher.update(&(destination.len() as u32).to_be_bytes());
            hasher.update(destination.as_bytes());
        }
        None => {
            hasher.update(&0u32.to_be_bytes());
        }
    }
    hasher.update(&action.auxiliary.unwrap_or(0).to_be_bytes());
    hasher.update(salt);
    hasher.update(identity.as_ref());
    hasher.finalize()
}

/// Draws a fresh salt and computes the digest to commit.
pub fn generate_commitment<R: RngCore + CryptoRng>(
    action: &GameAction,
    identity: &Identity,
    rng: &mut R,
) -> (Digest, Salt) {
    let mut salt = [0u8; 32];
    rng.fill_bytes(&mut salt);
    let digest = commitment_digest(action, &salt, identity);
    (digest, salt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ActionKind;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt, Signer};
    use rand::{rngs::StdRng, SeedableRng};

    fn identity(seed: u64) -> Identity {
        PrivateKey::from_rng(&mut StdRng::seed_from_u64(seed)).public_key()
    }

    #[test]
    fn test_digest_deterministic() {
        let me = identity(1);
        let action = GameAction::new(ActionKind::Kill).with_target(identity(2));
        let salt = [7u8; 32];
        assert_eq!(
            commitment_digest(&action, &salt, &me),
            commitment_digest(&action, &salt, &me),
        );
    }

    #[test]
    fn test_digest_sensitive_to_every_field() {
        let me = identity(1);
        let salt = [7u8; 32];
        let base = GameAction::new(ActionKind::Move)
            .with_destination("reactor")
            .with_auxiliary(5);
        let reference = commitment_digest(&base, &salt, &me);

        let mut kind = base.clone();
        kind.kind = ActionKind::Sabotage;
        assert_ne!(commitment_digest(&kind, &salt, &me), reference);

        let targeted = base.clone().with_target(identity(2));
        assert_ne!(commitment_digest(&targeted, &salt, &me), reference);

        let moved = base.clone().with_destination("engine");
        assert_ne!(commitment_digest(&moved, &salt, &me), reference);

        let aux = base.clone().with_auxiliary(6);
        assert_ne!(commitment_digest(&aux, &salt, &me), reference);

        let mut flipped = salt;
        flipped[0] ^= 1;
        assert_ne!(commitment_digest(&base, &flipped, &me), reference);

        assert_ne!(commitment_digest(&base, &salt, &identity(3)), reference);
    }

    #[test]
    fn test_sentinels_are_canonical() {
        let me = identity(1);
        let salt = [9u8; 32];
        // Empty destination and zero auxiliary hash identically to absent.
        let explicit = GameAction::new(ActionKind::Vote)
            .with_destination("")
            .with_auxiliary(0);
        let absent = GameAction::new(ActionKind::Vote);
        assert_eq!(
            commitment_digest(&explicit, &salt, &me),
            commitment_digest(&absent, &salt, &me),
        );
    }

    #[test]
    fn test_generate_commitment_verifies() {
        let mut rng = StdRng::seed_from_u64(42);
        let me = identity(1);
        let action = GameAction::new(ActionKind::CompleteTask).with_auxiliary(11);
        let (digest, salt) = generate_commitment(&action, &me, &mut rng);
        assert_eq!(commitment_digest(&action, &salt, &me), digest);
    }
}
