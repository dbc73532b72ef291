//! Decision seam for agent behavior.
//!
//! The client never decides what to play; callers plug in a [`Strategy`].
//! Heuristics live outside this crate.

use crate::orchestrator::MergedGameView;
use veilmatch_types::{ActionKind, GameAction};

pub trait Strategy: Send + Sync {
    /// Picks the next action from the kinds currently legal, or `None` to
    /// sit the window out.
    fn choose(&self, view: &MergedGameView, available: &[ActionKind]) -> Option<GameAction>;
}

/// Never acts. Useful as a spectating baseline and in tests.
#[derive(Clone, Copy, Default)]
pub struct IdleStrategy;

impl Strategy for IdleStrategy {
    fn choose(&self, _view: &MergedGameView, _available: &[ActionKind]) -> Option<GameAction> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_strategy_never_acts() {
        let view = MergedGameView::default();
        let strategy = IdleStrategy;
        assert_eq!(
            strategy.choose(&view, &[ActionKind::Move, ActionKind::Vote]),
            None
        );
    }
}
