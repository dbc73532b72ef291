//! Per-match phase progression.
//!
//! A room walks Lobby -> (Night -> Discussion -> Voting)* -> Ended. Night is
//! the commit/reveal window arbitrated by [`crate::commitments`]; the room
//! applies released actions, runs the vote, and decides the match outcome.
//! All deadlines are evaluated against the caller's monotonic millisecond
//! clock; expiry always produces a well-defined transition.

use crate::commitments::CommitmentProtocol;
use std::collections::BTreeMap;
use tracing::info;
use veilmatch_types::{ActionKind, GameAction, GamePhase, Identity, Role, ServerMessage};

/// Phase durations and lobby size, all in milliseconds.
#[derive(Clone, Copy, Debug)]
pub struct RoomConfig {
    pub min_players: usize,
    pub commit_window_ms: u64,
    pub reveal_window_ms: u64,
    pub discussion_ms: u64,
    pub voting_ms: u64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            min_players: 4,
            commit_window_ms: 15_000,
            reveal_window_ms: 10_000,
            discussion_ms: 20_000,
            voting_ms: 15_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlayerState {
    pub role: Role,
    pub alive: bool,
}

/// Events a phase transition produces; the server layer turns these into
/// broadcasts and ledger commands.
#[derive(Debug)]
pub enum RoomEvent {
    Broadcast(ServerMessage),
    /// Deliver privately to one identity.
    Direct(Identity, ServerMessage),
    /// The match is over; settle the pot for these winners.
    Ended { winners: Vec<Identity> },
}

pub struct Room {
    pub id: String,
    pub phase: GamePhase,
    pub round: u64,
    pub config: RoomConfig,
    pub players: BTreeMap<Identity, PlayerState>,
    pub commitments: CommitmentProtocol,
    votes: BTreeMap<Identity, Option<Identity>>,
    /// Deadline of the current non-Night phase, or of the commit window.
    phase_deadline_ms: u64,
    committing: bool,
}

impl Room {
    pub fn new(id: String, config: RoomConfig) -> Self {
        Self {
            id,
            phase: GamePhase::Lobby,
            round: 0,
            config,
            players: BTreeMap::new(),
            commitments: CommitmentProtocol::new(),
            votes: BTreeMap::new(),
            phase_deadline_ms: 0,
            committing: false,
        }
    }

    /// Adds a player while in the lobby. Rejoining is a no-op.
    pub fn add_player(&mut self, identity: Identity) -> bool {
        if self.phase != GamePhase::Lobby {
            return false;
        }
        self.players
            .entry(identity)
            .or_insert(PlayerState {
                role: Role::Crew,
                alive: true,
            });
        true
    }

    pub fn alive(&self) -> Vec<Identity> {
        self.players
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    pub fn is_alive(&self, identity: &Identity) -> bool {
        self.players.get(identity).map(|p| p.alive).unwrap_or(false)
    }

    pub fn ready(&self) -> bool {
        self.phase == GamePhase::Lobby && self.players.len() >= self.config.min_players
    }

    fn state_update(&self) -> ServerMessage {
        ServerMessage::GameStateUpdate {
            game_id: self.id.clone(),
            phase: self.phase,
            round: self.round,
            alive: self.alive(),
        }
    }

    /// Starts the match with roles decided by the authoritative ledger key
    /// (never by a local coin flip). Emits role assignments and the first
    /// night's state update.
    pub fn start(&mut self, roles: &[(Identity, Role)], now_ms: u64) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        for (identity, role) in roles {
            if let Some(player) = self.players.get_mut(identity) {
                player.role = *role;
                events.push(RoomEvent::Direct(
                    identity.clone(),
                    ServerMessage::RoleAssigned { role: *role },
                ));
            }
        }
        events.extend(self.begin_night(now_ms));
        events
    }

    fn begin_night(&mut self, now_ms: u64) -> Vec<RoomEvent> {
        self.round += 1;
        self.phase = GamePhase::Night;
        self.committing = true;
        self.phase_deadline_ms = now_ms + self.config.commit_window_ms;
        // Reveal deadline covers both windows; release is gated on the
        // reveal phase having begun.
        let reveal_deadline = self.phase_deadline_ms + self.config.reveal_window_ms;
        self.commitments
            .open_round(self.round, reveal_deadline)
            .expect("round numbers never repeat");
        info!(room = %self.id, round = self.round, "night begins");
        vec![RoomEvent::Broadcast(self.state_update())]
    }

    /// Commit is only legal during the night's commit window.
    pub fn accepting_commits(&self) -> bool {
        self.phase == GamePhase::Night && self.committing
    }

    pub fn accepting_reveals(&self) -> bool {
        self.phase == GamePhase::Night && !self.committing
    }

    /// Records a vote. At most one per alive player, only during Voting.
    pub fn record_vote(
        &mut self,
        voter: &Identity,
        target: Option<Identity>,
    ) -> Result<(), &'static str> {
        if self.phase != GamePhase::Voting {
            return Err("not in voting phase");
        }
        if !self.is_alive(voter) {
            return Err("voter is not alive");
        }
        if let Some(target) = &target {
            if !self.is_alive(target) {
                return Err("vote target is not alive");
            }
        }
        if self.votes.contains_key(voter) {
            return Err("already voted");
        }
        self.votes.insert(voter.clone(), target);
        Ok(())
    }

    fn all_alive_voted(&self) -> bool {
        self.players
            .iter()
            .filter(|(_, p)| p.alive)
            .all(|(identity, _)| self.votes.contains_key(identity))
    }

    /// Applies the released night actions: saboteur kills take effect, all
    /// other kinds are carried opaquely.
    fn apply_actions(&mut self, actions: &[(Identity, GameAction)]) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        for (actor, action) in actions {
            if action.kind != ActionKind::Kill {
                continue;
            }
            let is_saboteur = self
                .players
                .get(actor)
                .map(|p| p.alive && p.role == Role::Saboteur)
                .unwrap_or(false);
            let Some(victim) = action.target.clone() else {
                continue;
            };
            if is_saboteur && self.is_alive(&victim) {
                if let Some(player) = self.players.get_mut(&victim) {
                    player.alive = false;
                }
                events.push(RoomEvent::Broadcast(ServerMessage::PlayerKilled {
                    victim,
                }));
            }
        }
        events
    }

    fn tally_votes(&mut self) -> Option<Identity> {
        let mut counts: BTreeMap<Identity, usize> = BTreeMap::new();
        for target in self.votes.values().flatten() {
            *counts.entry(target.clone()).or_default() += 1;
        }
        let (leader, leader_count) = counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(identity, count)| (identity.clone(), *count))?;
        // A tie ejects nobody.
        let tied = counts.values().filter(|count| **count == leader_count).count() > 1;
        if tied {
            None
        } else {
            Some(leader)
        }
    }

    fn outcome(&self) -> Option<Vec<Identity>> {
        let alive_saboteurs = self
            .players
            .values()
            .filter(|p| p.alive && p.role == Role::Saboteur)
            .count();
        let alive_crew = self
            .players
            .values()
            .filter(|p| p.alive && p.role == Role::Crew)
            .count();
        if alive_saboteurs == 0 {
            // Crew wins: every crew member, dead or alive, shares the pot.
            Some(
                self.players
                    .iter()
                    .filter(|(_, p)| p.role == Role::Crew)
                    .map(|(identity, _)| identity.clone())
                    .collect(),
            )
        } else if alive_saboteurs >= alive_crew {
            Some(
                self.players
                    .iter()
                    .filter(|(_, p)| p.role == Role::Saboteur)
                    .map(|(identity, _)| identity.clone())
                    .collect(),
            )
        } else {
            None
        }
    }

    fn finish(&mut self, winners: Vec<Identity>) -> Vec<RoomEvent> {
        self.phase = GamePhase::Ended;
        info!(room = %self.id, winners = winners.len(), "match ended");
        vec![
            RoomEvent::Broadcast(ServerMessage::GameEnded {
                game_id: self.id.clone(),
                winners: winners.clone(),
            }),
            RoomEvent::Ended { winners },
        ]
    }

    /// Advances deadlines against the monotonic clock. Also the release
    /// point for the commit/reveal protocol: actions become visible here and
    /// nowhere else.
    pub fn tick(&mut self, now_ms: u64) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        match self.phase {
            GamePhase::Lobby | GamePhase::Ended => {}
            GamePhase::Night => {
                if self.committing && now_ms >= self.phase_deadline_ms {
                    self.committing = false;
                    self.commitments
                        .begin_reveal(self.round)
                        .expect("commit window only closes once");
                }
                if !self.committing {
                    if let Some(actions) = self.commitments.try_release(self.round, now_ms) {
                        events.push(RoomEvent::Broadcast(ServerMessage::RoundActions {
                            round: self.round,
                            actions: actions.clone(),
                        }));
                        events.extend(self.apply_actions(&actions));
                        if let Some(winners) = self.outcome() {
                            events.extend(self.finish(winners));
                            return events;
                        }
                        self.phase = GamePhase::Discussion;
                        self.phase_deadline_ms = now_ms + self.config.discussion_ms;
                        events.push(RoomEvent::Broadcast(self.state_update()));
                    }
                }
            }
            GamePhase::Discussion => {
                if now_ms >= self.phase_deadline_ms {
                    self.phase = GamePhase::Voting;
                    self.phase_deadline_ms = now_ms + self.config.voting_ms;
                    self.votes.clear();
                    events.push(RoomEvent::Broadcast(ServerMessage::VotingStarted {
                        round: self.round,
                        deadline_ms: self.phase_deadline_ms,
                    }));
                }
            }
            GamePhase::Voting => {
                if now_ms >= self.phase_deadline_ms || self.all_alive_voted() {
                    let ejected = self.tally_votes();
                    events.push(RoomEvent::Broadcast(ServerMessage::VotingResult {
                        round: self.round,
                        ejected: ejected.clone(),
                    }));
                    if let Some(identity) = ejected {
                        if let Some(player) = self.players.get_mut(&identity) {
                            player.alive = false;
                        }
                        events.push(RoomEvent::Broadcast(ServerMessage::PlayerEjected {
                            identity,
                        }));
                    }
                    self.votes.clear();
                    if let Some(winners) = self.outcome() {
                        events.extend(self.finish(winners));
                    } else {
                        self.commitments.prune(self.round);
                        events.extend(self.begin_night(now_ms));
                    }
                }
            }
        }
        events
    }
}
