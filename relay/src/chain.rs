//! Narrow integration with the external settlement ledger.
//!
//! The relay consults the ledger through a create/settle/cancel/balance
//! interface keyed by a deterministic identifier derived from the room id.
//! Writes are queued and drained by a dedicated worker so the event-handling
//! path never blocks on an external round trip. A failing ledger degrades to
//! off-chain-only operation: loudly logged, never fatal.

use commonware_cryptography::{sha256::Digest, Hasher, Sha256};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use veilmatch_types::{Identity, Role};

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger rejected the request: {0}")]
    Rejected(String),
}

/// Deterministic fixed-length game identifier derived by hashing the room id.
pub fn game_key(room_id: &str) -> Digest {
    Sha256::hash(room_id.as_bytes())
}

/// Deterministic role assignment derived from the ledger game key, so every
/// honest party agrees without trusting relay-local randomness. Players are
/// ranked by `H(gameKey || identity)`; the lowest ranks become saboteurs.
pub fn assign_roles(key: &Digest, players: &[Identity]) -> Vec<(Identity, Role)> {
    let saboteurs = (players.len() / 5).max(1);
    let mut ranked: Vec<(Digest, Identity)> = players
        .iter()
        .map(|identity| {
            let mut hasher = Sha256::new();
            hasher.update(key.as_ref());
            hasher.update(identity.as_ref());
            (hasher.finalize(), identity.clone())
        })
        .collect();
    ranked.sort_by(|(a, _), (b, _)| a.cmp(b));
    ranked
        .into_iter()
        .enumerate()
        .map(|(index, (_, identity))| {
            let role = if index < saboteurs {
                Role::Saboteur
            } else {
                Role::Crew
            };
            (identity, role)
        })
        .collect()
}

/// The on-chain escrow contract surface the relay depends on.
pub trait ChainLedger: Send + Sync + 'static {
    fn create_game(
        &self,
        key: Digest,
        players: Vec<Identity>,
        roles: Vec<(Identity, Role)>,
    ) -> impl Future<Output = Result<(), ChainError>> + Send;

    fn settle_game(
        &self,
        key: Digest,
        winners: Vec<Identity>,
    ) -> impl Future<Output = Result<(), ChainError>> + Send;

    fn cancel_game(&self, key: Digest) -> impl Future<Output = Result<(), ChainError>> + Send;

    fn balance(&self, identity: Identity)
        -> impl Future<Output = Result<u64, ChainError>> + Send;
}

/// A queued ledger write.
#[derive(Debug)]
pub enum ChainCommand {
    CreateGame {
        key: Digest,
        players: Vec<Identity>,
        roles: Vec<(Identity, Role)>,
    },
    SettleGame {
        key: Digest,
        winners: Vec<Identity>,
    },
    CancelGame {
        key: Digest,
    },
}

/// Drains queued ledger writes. Errors degrade to off-chain-only mode: the
/// failure is logged and the queue keeps draining.
pub fn spawn_chain_worker<L: ChainLedger>(
    ledger: L,
    mut commands: mpsc::UnboundedReceiver<ChainCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let result = match command {
                ChainCommand::CreateGame {
                    key,
                    players,
                    roles,
                } => ledger.create_game(key, players, roles).await,
                ChainCommand::SettleGame { key, winners } => {
                    ledger.settle_game(key, winners).await
                }
                ChainCommand::CancelGame { key } => ledger.cancel_game(key).await,
            };
            if let Err(err) = result {
                error!(?err, "chain ledger write failed; continuing off-chain");
            }
        }
        info!("chain worker stopped");
    })
}

/// Off-chain-only ledger used when no chain endpoint is configured. Accepts
/// every write so matches still resolve locally.
#[derive(Clone, Default)]
pub struct OffchainLedger;

impl ChainLedger for OffchainLedger {
    fn create_game(
        &self,
        key: Digest,
        players: Vec<Identity>,
        _roles: Vec<(Identity, Role)>,
    ) -> impl Future<Output = Result<(), ChainError>> + Send {
        async move {
            warn!(?key, players = players.len(), "off-chain mode: game not escrowed");
            Ok(())
        }
    }

    fn settle_game(
        &self,
        key: Digest,
        winners: Vec<Identity>,
    ) -> impl Future<Output = Result<(), ChainError>> + Send {
        async move {
            warn!(?key, winners = winners.len(), "off-chain mode: settlement not recorded");
            Ok(())
        }
    }

    fn cancel_game(&self, key: Digest) -> impl Future<Output = Result<(), ChainError>> + Send {
        async move {
            warn!(?key, "off-chain mode: cancellation not recorded");
            Ok(())
        }
    }

    fn balance(
        &self,
        _identity: Identity,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send {
        async move { Ok(0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt, Signer};
    use rand::{rngs::StdRng, SeedableRng};

    fn identity(seed: u64) -> Identity {
        PrivateKey::from_rng(&mut StdRng::seed_from_u64(seed)).public_key()
    }

    #[test]
    fn test_game_key_deterministic() {
        assert_eq!(game_key("room-1"), game_key("room-1"));
        assert_ne!(game_key("room-1"), game_key("room-2"));
    }

    #[test]
    fn test_assign_roles_deterministic() {
        let key = game_key("room-1");
        let players: Vec<Identity> = (0..5).map(identity).collect();
        let roles = assign_roles(&key, &players);
        assert_eq!(roles, assign_roles(&key, &players));
        assert_eq!(roles.len(), 5);
        let saboteurs = roles
            .iter()
            .filter(|(_, role)| *role == Role::Saboteur)
            .count();
        assert_eq!(saboteurs, 1);
        // Every player receives exactly one role.
        for player in &players {
            assert_eq!(roles.iter().filter(|(p, _)| p == player).count(), 1);
        }
    }

    #[test]
    fn test_assign_roles_depends_on_key() {
        let players: Vec<Identity> = (0..8).map(identity).collect();
        let a = assign_roles(&game_key("room-1"), &players);
        let b = assign_roles(&game_key("room-2"), &players);
        // Same players, different match: assignment may differ, counts match.
        let count = |roles: &[(Identity, Role)]| {
            roles
                .iter()
                .filter(|(_, role)| *role == Role::Saboteur)
                .count()
        };
        assert_eq!(count(&a), count(&b));
    }

    #[tokio::test]
    async fn test_chain_worker_drains_queue() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_chain_worker(OffchainLedger, rx);
        let key = game_key("room-1");
        tx.send(ChainCommand::CreateGame {
            key: key.clone(),
            players: vec![identity(1)],
            roles: vec![(identity(1), Role::Crew)],
        })
        .unwrap();
        tx.send(ChainCommand::SettleGame {
            key,
            winners: vec![identity(1)],
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();
    }
}
