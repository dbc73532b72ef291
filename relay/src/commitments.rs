//! The commit/reveal protocol for hidden per-round actions.
//!
//! Each participant locks in a SHA-256 digest of its action during the commit
//! window, then discloses the action plus salt during the reveal window. A
//! revealed action is never observable by any other identity until every
//! committed identity has revealed or the reveal deadline elapses, whichever
//! comes first. A committer that never reveals forfeits: its action is a
//! no-op and is never exposed after the fact.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;
use veilmatch_types::{commitment_digest, GameAction, Identity, Salt};

use commonware_cryptography::sha256::Digest;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommitmentError {
    #[error("identity already committed this round")]
    DuplicateCommitment,
    #[error("round is not accepting this operation")]
    InvalidPhase,
    #[error("no commitment to reveal")]
    NoCommitment,
    #[error("revealed action does not match commitment")]
    CommitmentMismatch,
    #[error("unknown round")]
    UnknownRound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundPhase {
    Committing,
    Revealing,
    Released,
}

struct CommitmentEntry {
    digest: Digest,
    revealed: Option<GameAction>,
}

struct RoundCommitments {
    phase: RoundPhase,
    /// Reveal deadline on the caller's monotonic millisecond clock.
    deadline_ms: u64,
    entries: BTreeMap<Identity, CommitmentEntry>,
}

/// Commit/reveal state for one room across rounds.
#[derive(Default)]
pub struct CommitmentProtocol {
    rounds: BTreeMap<u64, RoundCommitments>,
}

impl CommitmentProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the commit window for a round. Re-opening an existing round is
    /// an `InvalidPhase` error.
    pub fn open_round(&mut self, round: u64, deadline_ms: u64) -> Result<(), CommitmentError> {
        if self.rounds.contains_key(&round) {
            return Err(CommitmentError::InvalidPhase);
        }
        self.rounds.insert(
            round,
            RoundCommitments {
                phase: RoundPhase::Committing,
                deadline_ms,
                entries: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Closes the commit window and opens the reveal window.
    pub fn begin_reveal(&mut self, round: u64) -> Result<(), CommitmentError> {
        let state = self
            .rounds
            .get_mut(&round)
            .ok_or(CommitmentError::UnknownRound)?;
        if state.phase != RoundPhase::Committing {
            return Err(CommitmentError::InvalidPhase);
        }
        state.phase = RoundPhase::Revealing;
        Ok(())
    }

    /// Accepts a commitment digest. At most one outstanding commitment per
    /// identity per round.
    pub fn commit(
        &mut self,
        round: u64,
        identity: Identity,
        digest: Digest,
    ) -> Result<(), CommitmentError> {
        let state = self
            .rounds
            .get_mut(&round)
            .ok_or(CommitmentError::InvalidPhase)?;
        if state.phase != RoundPhase::Committing {
            return Err(CommitmentError::InvalidPhase);
        }
        if state.entries.contains_key(&identity) {
            return Err(CommitmentError::DuplicateCommitment);
        }
        state.entries.insert(
            identity,
            CommitmentEntry {
                digest,
                revealed: None,
            },
        );
        Ok(())
    }

    /// Verifies a reveal against the stored commitment. The action stays
    /// private until [`Self::try_release`] fires.
    pub fn reveal(
        &mut self,
        round: u64,
        identity: &Identity,
        action: GameAction,
        salt: &Salt,
    ) -> Result<(), CommitmentError> {
        let state = self
            .rounds
            .get_mut(&round)
            .ok_or(CommitmentError::InvalidPhase)?;
        if state.phase != RoundPhase::Revealing {
            return Err(CommitmentError::InvalidPhase);
        }
        let entry = state
            .entries
            .get_mut(identity)
            .ok_or(CommitmentError::NoCommitment)?;
        if entry.revealed.is_some() {
            return Err(CommitmentError::DuplicateCommitment);
        }
        let recomputed = commitment_digest(&action, salt, identity);
        if recomputed != entry.digest {
            return Err(CommitmentError::CommitmentMismatch);
        }
        entry.revealed = Some(action.normalized());
        Ok(())
    }

    /// How many committed identities have not yet revealed.
    pub fn outstanding(&self, round: u64) -> usize {
        self.rounds
            .get(&round)
            .map(|state| {
                state
                    .entries
                    .values()
                    .filter(|e| e.revealed.is_none())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Releases the round's actions if every committed identity has revealed
    /// or the deadline has elapsed. Returns `None` while the round must stay
    /// private, and releases at most once. Committers that missed the
    /// deadline forfeit and are excluded.
    pub fn try_release(
        &mut self,
        round: u64,
        now_ms: u64,
    ) -> Option<Vec<(Identity, GameAction)>> {
        let state = self.rounds.get_mut(&round)?;
        if state.phase != RoundPhase::Revealing {
            return None;
        }
        let all_revealed = state.entries.values().all(|e| e.revealed.is_some());
        if !all_revealed && now_ms < state.deadline_ms {
            return None;
        }
        state.phase = RoundPhase::Released;
        let forfeited = state
            .entries
            .values()
            .filter(|e| e.revealed.is_none())
            .count();
        if forfeited > 0 {
            debug!(round, forfeited, "commitments forfeited at deadline");
        }
        Some(
            state
                .entries
                .iter()
                .filter_map(|(identity, entry)| {
                    entry
                        .revealed
                        .clone()
                        .map(|action| (identity.clone(), action))
                })
                .collect(),
        )
    }

    /// Drops bookkeeping for rounds at or below `round`.
    pub fn prune(&mut self, round: u64) {
        self.rounds = self.rounds.split_off(&(round + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt, Signer};
    use rand::{rngs::StdRng, SeedableRng};
    use veilmatch_types::{generate_commitment, ActionKind};

    fn identity(seed: u64) -> Identity {
        PrivateKey::from_rng(&mut StdRng::seed_from_u64(seed)).public_key()
    }

    fn committed(
        protocol: &mut CommitmentProtocol,
        round: u64,
        seed: u64,
        action: &GameAction,
    ) -> (Identity, Salt) {
        let me = identity(seed);
        let (digest, salt) =
            generate_commitment(action, &me, &mut StdRng::seed_from_u64(seed + 100));
        protocol.commit(round, me.clone(), digest).unwrap();
        (me, salt)
    }

    #[test]
    fn test_commit_reveal_roundtrip() {
        let mut protocol = CommitmentProtocol::new();
        protocol.open_round(1, 10_000).unwrap();
        let action = GameAction::new(ActionKind::Move).with_destination("reactor");
        let (me, salt) = committed(&mut protocol, 1, 1, &action);

        protocol.begin_reveal(1).unwrap();
        protocol.reveal(1, &me, action.clone(), &salt).unwrap();
        let released = protocol.try_release(1, 0).unwrap();
        assert_eq!(released, vec![(me, action)]);
    }

    #[test]
    fn test_duplicate_commitment_rejected() {
        let mut protocol = CommitmentProtocol::new();
        protocol.open_round(1, 10_000).unwrap();
        let action = GameAction::new(ActionKind::Sabotage).with_auxiliary(2);
        let (me, _) = committed(&mut protocol, 1, 1, &action);
        let (digest, _) =
            generate_commitment(&action, &me, &mut StdRng::seed_from_u64(999));
        assert_eq!(
            protocol.commit(1, me, digest),
            Err(CommitmentError::DuplicateCommitment)
        );
    }

    #[test]
    fn test_phase_enforcement() {
        let mut protocol = CommitmentProtocol::new();
        let me = identity(1);
        let action = GameAction::new(ActionKind::Move);
        let (digest, salt) = generate_commitment(&action, &me, &mut StdRng::seed_from_u64(5));

        // No round open yet.
        assert_eq!(
            protocol.commit(1, me.clone(), digest.clone()),
            Err(CommitmentError::InvalidPhase)
        );

        protocol.open_round(1, 10_000).unwrap();
        // Reveal before the reveal window opens.
        assert_eq!(
            protocol.reveal(1, &me, action.clone(), &salt),
            Err(CommitmentError::InvalidPhase)
        );

        protocol.commit(1, me.clone(), digest.clone()).unwrap();
        protocol.begin_reveal(1).unwrap();
        // Commit after the window closed.
        assert_eq!(
            protocol.commit(1, identity(2), digest),
            Err(CommitmentError::InvalidPhase)
        );
        protocol.reveal(1, &me, action, &salt).unwrap();
    }

    #[test]
    fn test_mismatched_reveal_rejected() {
        let mut protocol = CommitmentProtocol::new();
        protocol.open_round(1, 10_000).unwrap();
        let action = GameAction::new(ActionKind::Kill).with_target(identity(9));
        let (me, salt) = committed(&mut protocol, 1, 1, &action);
        protocol.begin_reveal(1).unwrap();

        // Different action under the same salt.
        let other = GameAction::new(ActionKind::Kill).with_target(identity(8));
        assert_eq!(
            protocol.reveal(1, &me, other, &salt),
            Err(CommitmentError::CommitmentMismatch)
        );

        // Same action, perturbed salt.
        let mut flipped = salt;
        flipped[31] ^= 0x01;
        assert_eq!(
            protocol.reveal(1, &me, action.clone(), &flipped),
            Err(CommitmentError::CommitmentMismatch)
        );

        // The stored commitment is still intact and reveals cleanly.
        protocol.reveal(1, &me, action, &salt).unwrap();
    }

    #[test]
    fn test_reveal_without_commitment() {
        let mut protocol = CommitmentProtocol::new();
        protocol.open_round(1, 10_000).unwrap();
        protocol.begin_reveal(1).unwrap();
        let me = identity(1);
        let action = GameAction::new(ActionKind::Move);
        let (_, salt) = generate_commitment(&action, &me, &mut StdRng::seed_from_u64(5));
        assert_eq!(
            protocol.reveal(1, &me, action, &salt),
            Err(CommitmentError::NoCommitment)
        );
    }

    #[test]
    fn test_no_release_before_all_revealed() {
        let mut protocol = CommitmentProtocol::new();
        protocol.open_round(1, 10_000).unwrap();
        let action_a = GameAction::new(ActionKind::Move).with_destination("engine");
        let action_b = GameAction::new(ActionKind::CompleteTask).with_auxiliary(4);
        let (a, salt_a) = committed(&mut protocol, 1, 1, &action_a);
        let (b, salt_b) = committed(&mut protocol, 1, 2, &action_b);
        protocol.begin_reveal(1).unwrap();

        protocol.reveal(1, &a, action_a.clone(), &salt_a).unwrap();
        // One reveal outstanding, deadline not reached: nothing observable.
        assert!(protocol.try_release(1, 5_000).is_none());
        assert_eq!(protocol.outstanding(1), 1);

        protocol.reveal(1, &b, action_b.clone(), &salt_b).unwrap();
        let mut released = protocol.try_release(1, 5_000).unwrap();
        released.sort_by(|(x, _), (y, _)| x.cmp(y));
        let mut expected = vec![(a, action_a), (b, action_b)];
        expected.sort_by(|(x, _), (y, _)| x.cmp(y));
        assert_eq!(released, expected);

        // Release happens at most once.
        assert!(protocol.try_release(1, 5_000).is_none());
    }

    #[test]
    fn test_deadline_forfeits_unrevealed() {
        let mut protocol = CommitmentProtocol::new();
        protocol.open_round(1, 10_000).unwrap();
        let action_a = GameAction::new(ActionKind::Move).with_destination("engine");
        let action_b = GameAction::new(ActionKind::Kill).with_target(identity(7));
        let (a, salt_a) = committed(&mut protocol, 1, 1, &action_a);
        let (_b, _salt_b) = committed(&mut protocol, 1, 2, &action_b);
        protocol.begin_reveal(1).unwrap();
        protocol.reveal(1, &a, action_a.clone(), &salt_a).unwrap();

        assert!(protocol.try_release(1, 9_999).is_none());
        let released = protocol.try_release(1, 10_000).unwrap();
        // The unrevealed committer forfeits; its action never surfaces.
        assert_eq!(released, vec![(a, action_a)]);
        assert!(protocol.try_release(1, 20_000).is_none());
    }
}
