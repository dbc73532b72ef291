//! In-memory escrow of staked value per match.
//!
//! Balances never go negative; a wager debits the balance atomically with
//! accumulating into the game's pot. Settlement is a one-way transition from
//! unsettled to settled, distributes the full pot exactly once with exact
//! integer arithmetic, and is idempotent-by-rejection: a second settle or
//! refund on the same game fails without mutating any balance.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;
use veilmatch_types::Identity;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WagerError {
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("identity already wagered in this game")]
    AlreadyWagered,
    #[error("game already settled")]
    AlreadySettled,
    #[error("unknown game")]
    UnknownGame,
}

/// Per-identity balance and lifetime tallies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BalanceRecord {
    pub balance: u64,
    pub total_deposited: u64,
    pub total_won: u64,
    pub total_lost: u64,
}

/// Escrowed stakes for one match.
#[derive(Debug, Default)]
pub struct GameWager {
    pub stakes: BTreeMap<Identity, u64>,
    pub total_pot: u64,
    pub settled: bool,
}

#[derive(Default)]
pub struct WagerLedger {
    balances: BTreeMap<Identity, BalanceRecord>,
    games: BTreeMap<String, GameWager>,
}

impl WagerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, identity: &Identity) -> Option<&BalanceRecord> {
        self.balances.get(identity)
    }

    pub fn game(&self, game_id: &str) -> Option<&GameWager> {
        self.games.get(game_id)
    }

    pub fn deposit(&mut self, identity: Identity, amount: u64) -> Result<(), WagerError> {
        if amount == 0 {
            return Err(WagerError::InvalidAmount);
        }
        let record = self.balances.entry(identity).or_default();
        record.balance += amount;
        record.total_deposited += amount;
        Ok(())
    }

    /// Debits the identity's balance and accumulates the stake into the
    /// game's pot, atomically.
    pub fn submit_wager(
        &mut self,
        game_id: &str,
        identity: Identity,
        amount: u64,
    ) -> Result<(), WagerError> {
        if amount == 0 {
            return Err(WagerError::InvalidAmount);
        }
        let game = self.games.entry(game_id.to_string()).or_default();
        if game.settled {
            return Err(WagerError::AlreadySettled);
        }
        if game.stakes.contains_key(&identity) {
            return Err(WagerError::AlreadyWagered);
        }
        let record = self.balances.entry(identity.clone()).or_default();
        if record.balance < amount {
            return Err(WagerError::InsufficientBalance);
        }
        record.balance -= amount;
        game.stakes.insert(identity, amount);
        game.total_pot += amount;
        Ok(())
    }

    /// Distributes the pot to `winners` in the caller-supplied order: each
    /// winner receives `pot / n`, with the integer remainder going to the
    /// first winner so the credited amounts sum to exactly the pot. An empty
    /// winner list refunds every staker instead. Every staker not among the
    /// winners has its stake added to `total_lost`.
    pub fn settle(&mut self, game_id: &str, winners: &[Identity]) -> Result<(), WagerError> {
        let game = self.games.get_mut(game_id).ok_or(WagerError::UnknownGame)?;
        if game.settled {
            return Err(WagerError::AlreadySettled);
        }
        game.settled = true;

        if winners.is_empty() {
            for (identity, stake) in &game.stakes {
                let record = self.balances.entry(identity.clone()).or_default();
                record.balance += stake;
            }
            info!(game_id, pot = game.total_pot, "pot refunded: no winners");
            return Ok(());
        }

        let share = game.total_pot / winners.len() as u64;
        let remainder = game.total_pot % winners.len() as u64;
        for (index, winner) in winners.iter().enumerate() {
            let credit = if index == 0 { share + remainder } else { share };
            let record = self.balances.entry(winner.clone()).or_default();
            record.balance += credit;
            record.total_won += credit;
        }
        for (identity, stake) in &game.stakes {
            if !winners.contains(identity) {
                let record = self.balances.entry(identity.clone()).or_default();
                record.total_lost += stake;
            }
        }
        info!(
            game_id,
            pot = game.total_pot,
            winners = winners.len(),
            "pot settled"
        );
        Ok(())
    }

    /// Returns every staker's exact original stake and marks the game
    /// settled. Only valid while unsettled.
    pub fn refund(&mut self, game_id: &str) -> Result<(), WagerError> {
        self.settle(game_id, &[])
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
    fn test_deposit_rejects_zero() {
        let mut ledger = WagerLedger::new();
        assert_eq!(ledger.deposit(identity(1), 0), Err(WagerError::InvalidAmount));
        ledger.deposit(identity(1), 50).unwrap();
        let record = ledger.balance(&identity(1)).unwrap();
        assert_eq!(record.balance, 50);
        assert_eq!(record.total_deposited, 50);
    }

    #[test]
    fn test_wager_guards() {
        let mut ledger = WagerLedger::new();
        ledger.deposit(identity(1), 100).unwrap();
        assert_eq!(
            ledger.submit_wager("g", identity(1), 200),
            Err(WagerError::InsufficientBalance)
        );
        ledger.submit_wager("g", identity(1), 60).unwrap();
        assert_eq!(
            ledger.submit_wager("g", identity(1), 10),
            Err(WagerError::AlreadyWagered)
        );
        assert_eq!(ledger.balance(&identity(1)).unwrap().balance, 40);
        assert_eq!(ledger.game("g").unwrap().total_pot, 60);
    }

    #[test]
    fn test_settlement_conservation_with_remainder() {
        let mut ledger = WagerLedger::new();
        let (a, b, c, d) = (identity(1), identity(2), identity(3), identity(4));
        for (who, stake) in [(&a, 25u64), (&b, 25), (&c, 25), (&d, 25)] {
            ledger.deposit(who.clone(), stake).unwrap();
            ledger.submit_wager("g", who.clone(), stake).unwrap();
        }
        assert_eq!(ledger.game("g").unwrap().total_pot, 100);

        // 100 across three winners: first listed takes the remainder.
        ledger.settle("g", &[a.clone(), b.clone(), c.clone()]).unwrap();
        assert_eq!(ledger.balance(&a).unwrap().balance, 34);
        assert_eq!(ledger.balance(&b).unwrap().balance, 33);
        assert_eq!(ledger.balance(&c).unwrap().balance, 33);
        assert_eq!(34 + 33 + 33, 100);
        assert_eq!(ledger.balance(&d).unwrap().total_lost, 25);
    }

    #[test]
    fn test_settlement_idempotent_by_rejection() {
        let mut ledger = WagerLedger::new();
        let (a, b) = (identity(1), identity(2));
        ledger.deposit(a.clone(), 100).unwrap();
        ledger.deposit(b.clone(), 100).unwrap();
        ledger.submit_wager("g", a.clone(), 100).unwrap();
        ledger.submit_wager("g", b.clone(), 100).unwrap();

        ledger.settle("g", &[a.clone()]).unwrap();
        let snapshot_a = ledger.balance(&a).unwrap().clone();
        let snapshot_b = ledger.balance(&b).unwrap().clone();

        assert_eq!(ledger.settle("g", &[a.clone()]), Err(WagerError::AlreadySettled));
        assert_eq!(ledger.refund("g"), Err(WagerError::AlreadySettled));
        assert_eq!(ledger.balance(&a).unwrap(), &snapshot_a);
        assert_eq!(ledger.balance(&b).unwrap(), &snapshot_b);
    }

    #[test]
    fn test_refund_conservation() {
        let mut ledger = WagerLedger::new();
        let stakes = [(identity(1), 70u64), (identity(2), 30), (identity(3), 45)];
        for (who, stake) in &stakes {
            ledger.deposit(who.clone(), *stake).unwrap();
            ledger.submit_wager("g", who.clone(), *stake).unwrap();
            assert_eq!(ledger.balance(who).unwrap().balance, 0);
        }

        ledger.refund("g").unwrap();
        for (who, stake) in &stakes {
            let record = ledger.balance(who).unwrap();
            assert_eq!(record.balance, *stake);
            // A refund records neither winners nor losers.
            assert_eq!(record.total_won, 0);
            assert_eq!(record.total_lost, 0);
        }
    }

    #[test]
    fn test_settle_unknown_game() {
        let mut ledger = WagerLedger::new();
        assert_eq!(ledger.settle("missing", &[]), Err(WagerError::UnknownGame));
    }

    #[test]
    fn test_end_to_end_wager_flow() {
        let mut ledger = WagerLedger::new();
        let (a, b) = (identity(1), identity(2));
        ledger.deposit(a.clone(), 100).unwrap();
        ledger.submit_wager("g", a.clone(), 100).unwrap();
        assert_eq!(ledger.balance(&a).unwrap().balance, 0);
        ledger.deposit(b.clone(), 100).unwrap();
        ledger.submit_wager("g", b.clone(), 100).unwrap();
        assert_eq!(ledger.game("g").unwrap().total_pot, 200);

        ledger.settle("g", &[a.clone()]).unwrap();
        let record_a = ledger.balance(&a).unwrap();
        assert_eq!(record_a.balance, 200);
        assert_eq!(record_a.total_won, 200);
        assert_eq!(ledger.balance(&b).unwrap().total_lost, 100);

        assert_eq!(ledger.settle("g", &[a.clone()]), Err(WagerError::AlreadySettled));
        assert_eq!(ledger.balance(&a).unwrap().balance, 200);
        assert_eq!(ledger.balance(&b).unwrap().balance, 0);
    }
}
