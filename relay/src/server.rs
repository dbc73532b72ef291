//! WebSocket endpoint and the single-writer event loop.
//!
//! Every inbound network event funnels into methods that take the state
//! write lock, mutate, and release before anything awaits. Chain and history
//! writes are queued on channels drained by their own workers, so the
//! request-handling path never blocks on an external round trip.

use crate::chain::{assign_roles, game_key, ChainCommand};
use crate::commitments::CommitmentError;
use crate::history::MatchRecord;
use crate::registry::{ConnectionId, ConnectionKind, ConnectionRegistry, Outbound, RegistryError};
use crate::rooms::{Room, RoomConfig, RoomEvent};
use crate::wagers::WagerLedger;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State as AxumState,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use commonware_codec::{DecodeExt, Encode};
use futures::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use veilmatch_types::{
    ActionKind, ClientMessage, CloseReason, GamePhase, Identity, ServerMessage,
};

/// Relay timing and escrow parameters.
#[derive(Clone, Copy, Debug)]
pub struct RelayConfig {
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Faucet credit granted to an identity on first authentication.
    pub initial_deposit: u64,
    /// Stake escrowed per player at match start.
    pub stake: u64,
    pub room: RoomConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            initial_deposit: 1_000,
            stake: 100,
            room: RoomConfig::default(),
        }
    }
}

struct State {
    registry: ConnectionRegistry,
    rooms: HashMap<String, Room>,
    wagers: WagerLedger,
    /// Connections that have not yet authenticated, with their deadline.
    auth_deadlines: HashMap<ConnectionId, Instant>,
    last_ack: HashMap<ConnectionId, Instant>,
}

#[derive(Clone)]
pub struct Relay {
    config: RelayConfig,
    started: Instant,
    state: Arc<RwLock<State>>,
    chain_tx: mpsc::UnboundedSender<ChainCommand>,
    history_tx: mpsc::UnboundedSender<MatchRecord>,
}

impl Relay {
    /// Builds the relay plus the receivers its chain and history workers
    /// drain.
    pub fn new(
        config: RelayConfig,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<ChainCommand>,
        mpsc::UnboundedReceiver<MatchRecord>,
    ) {
        let (chain_tx, chain_rx) = mpsc::unbounded_channel();
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let relay = Self {
            config,
            started: Instant::now(),
            state: Arc::new(RwLock::new(State {
                registry: ConnectionRegistry::new(),
                rooms: HashMap::new(),
                wagers: WagerLedger::new(),
                auth_deadlines: HashMap::new(),
                last_ack: HashMap::new(),
            })),
            chain_tx,
            history_tx,
        };
        (relay, chain_rx, history_rx)
    }

    /// Milliseconds on the relay's monotonic clock.
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn wall_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any);
        Router::new()
            .route("/ws", get(ws_handler))
            .layer(cors)
            .with_state(self.clone())
    }

    pub fn agent_count(&self) -> usize {
        self.state.read().expect("state lock poisoned").registry.agent_count()
    }

    pub fn spectator_count(&self) -> usize {
        self.state
            .read()
            .expect("state lock poisoned")
            .registry
            .spectator_count()
    }

    pub fn balance(&self, identity: &Identity) -> Option<u64> {
        self.state
            .read()
            .expect("state lock poisoned")
            .wagers
            .balance(identity)
            .map(|record| record.balance)
    }

    pub fn room_phase(&self, room_id: &str) -> Option<GamePhase> {
        self.state
            .read()
            .expect("state lock poisoned")
            .rooms
            .get(room_id)
            .map(|room| room.phase)
    }

    fn on_connect(&self, outbox: mpsc::UnboundedSender<Outbound>) -> ConnectionId {
        let mut state = self.state.write().expect("state lock poisoned");
        let id = state.registry.add_connection(outbox, ConnectionKind::Spectator);
        state
            .auth_deadlines
            .insert(id, Instant::now() + self.config.auth_timeout);
        state.last_ack.insert(id, Instant::now());
        debug!(?id, "connection opened");
        id
    }

    /// Synchronously releases the connection's identity binding and room
    /// membership so a reconnect attempt is never blocked by stale state.
    fn on_disconnect(&self, id: ConnectionId) {
        let mut state = self.state.write().expect("state lock poisoned");
        state.registry.remove_connection(id);
        state.auth_deadlines.remove(&id);
        state.last_ack.remove(&id);
        debug!(?id, "connection closed");
    }

    fn close(state: &mut State, id: ConnectionId, reason: CloseReason) {
        let _ = state.registry.close(id, reason);
        state.registry.remove_connection(id);
        state.auth_deadlines.remove(&id);
        state.last_ack.remove(&id);
    }

    fn dispatch(&self, state: &mut State, room_id: &str, events: Vec<RoomEvent>) {
        for event in events {
            match event {
                RoomEvent::Broadcast(message) => {
                    for (id, err) in state.registry.broadcast(room_id, &message) {
                        warn!(?id, %err, "broadcast delivery failed");
                    }
                }
                RoomEvent::Direct(identity, message) => {
                    if let Err(err) = state.registry.send_to_identity(&identity, message) {
                        warn!(%err, "direct delivery failed");
                    }
                }
                RoomEvent::Ended { winners } => {
                    if let Err(err) = state.wagers.settle(room_id, &winners) {
                        warn!(room = room_id, %err, "settlement rejected");
                    }
                    let _ = self.chain_tx.send(ChainCommand::SettleGame {
                        key: game_key(room_id),
                        winners: winners.clone(),
                    });
                    if let Some(room) = state.rooms.get(room_id) {
                        let _ = self.history_tx.send(MatchRecord {
                            game_id: room_id.to_string(),
                            players: room.players.keys().cloned().collect(),
                            winners,
                            total_pot: state
                                .wagers
                                .game(room_id)
                                .map(|g| g.total_pot)
                                .unwrap_or(0),
                            rounds: room.round,
                        });
                    }
                    // The match is over: close every room connection and drop
                    // the room. The wager aggregate stays behind so a late
                    // settle attempt is still rejected as already settled.
                    let ids: Vec<ConnectionId> = state
                        .registry
                        .connections_in_room(room_id)
                        .map(|c| c.id)
                        .collect();
                    for id in ids {
                        Self::close(state, id, CloseReason::GameEnded);
                    }
                    state.rooms.remove(room_id);
                }
            }
        }
    }

    fn handle_auth(&self, state: &mut State, id: ConnectionId, auth: veilmatch_types::AuthRequest) {
        if !auth.verify() {
            let _ = state.registry.send(
                id,
                ServerMessage::AuthFailure {
                    reason: "invalid signature".to_string(),
                },
            );
            Self::close(state, id, CloseReason::AuthFailed);
            return;
        }
        if !auth.is_fresh(Self::wall_ms()) {
            let _ = state.registry.send(
                id,
                ServerMessage::AuthFailure {
                    reason: "expired credential".to_string(),
                },
            );
            Self::close(state, id, CloseReason::AuthFailed);
            return;
        }
        match state.registry.bind_identity(id, auth.identity.clone()) {
            Ok(()) => {}
            Err(RegistryError::DuplicateIdentity) => {
                let _ = state.registry.send(
                    id,
                    ServerMessage::AuthFailure {
                        reason: "identity already connected".to_string(),
                    },
                );
                Self::close(state, id, CloseReason::DuplicateConnection);
                return;
            }
            Err(err) => {
                warn!(?id, %err, "identity binding failed");
                Self::close(state, id, CloseReason::AuthFailed);
                return;
            }
        }
        let _ = state.registry.set_kind(id, ConnectionKind::Agent);
        let _ = state.registry.join_room(id, auth.game_id.clone());
        state.auth_deadlines.remove(&id);

        let room = state
            .rooms
            .entry(auth.game_id.clone())
            .or_insert_with(|| Room::new(auth.game_id.clone(), self.config.room));
        let joined = room.add_player(auth.identity.clone());
        let rejoining = !joined && room.players.contains_key(&auth.identity);
        if !joined && !rejoining {
            let _ = state.registry.send(
                id,
                ServerMessage::AuthFailure {
                    reason: "match already in progress".to_string(),
                },
            );
            Self::close(state, id, CloseReason::Kicked);
            return;
        }

        // First authentication seeds the faucet balance.
        if state.wagers.balance(&auth.identity).is_none() {
            let _ = state
                .wagers
                .deposit(auth.identity.clone(), self.config.initial_deposit);
        }

        let _ = state.registry.send(
            id,
            ServerMessage::AuthSuccess {
                identity: auth.identity.clone(),
                game_id: auth.game_id.clone(),
            },
        );
        info!(game_id = %auth.game_id, "agent authenticated");

        let room = state.rooms.get_mut(&auth.game_id).expect("room just inserted");
        let snapshot = ServerMessage::GameStateUpdate {
            game_id: room.id.clone(),
            phase: room.phase,
            round: room.round,
            alive: room.alive(),
        };
        let _ = state.registry.send(id, snapshot);
        if joined {
            let update = ServerMessage::PlayerUpdate {
                identity: auth.identity.clone(),
                alive: true,
            };
            for (failed, err) in state.registry.broadcast(&auth.game_id, &update) {
                warn!(id = ?failed, %err, "broadcast delivery failed");
            }
        }

        if room.ready() {
            self.start_match(state, &auth.game_id);
        }
    }

    fn start_match(&self, state: &mut State, room_id: &str) {
        let key = game_key(room_id);
        let room = state.rooms.get_mut(room_id).expect("room exists");
        let players: Vec<Identity> = room.players.keys().cloned().collect();

        // Escrow every player's stake before play begins.
        for player in &players {
            if let Err(err) = state
                .wagers
                .submit_wager(room_id, player.clone(), self.config.stake)
            {
                warn!(room = room_id, %err, "stake escrow rejected");
            }
        }

        // Roles derive from the authoritative ledger game key.
        let roles = assign_roles(&key, &players);
        let _ = self.chain_tx.send(ChainCommand::CreateGame {
            key,
            players,
            roles: roles.clone(),
        });

        let now = self.now_ms();
        let room = state.rooms.get_mut(room_id).expect("room exists");
        let events = room.start(&roles, now);
        self.dispatch(state, room_id, events);
    }

    fn handle_message(&self, id: ConnectionId, message: ClientMessage) {
        let mut state = self.state.write().expect("state lock poisoned");
        let state = &mut *state;
        match message {
            ClientMessage::Auth(auth) => self.handle_auth(state, id, auth),
            ClientMessage::HeartbeatAck { timestamp_ms: _ } => {
                state.last_ack.insert(id, Instant::now());
            }
            ClientMessage::Spectate { game_id } => {
                let _ = state.registry.join_room(id, game_id.clone());
                state.auth_deadlines.remove(&id);
                if let Some(room) = state.rooms.get(&game_id) {
                    let _ = state.registry.send(
                        id,
                        ServerMessage::GameStateUpdate {
                            game_id: room.id.clone(),
                            phase: room.phase,
                            round: room.round,
                            alive: room.alive(),
                        },
                    );
                }
            }
            ClientMessage::Commit { round, digest } => {
                let reply = self.apply_commit(state, id, round, digest);
                let _ = state.registry.send(id, reply);
            }
            ClientMessage::Reveal {
                round,
                action,
                salt,
            } => {
                let reply = self.apply_reveal(state, id, round, action, salt);
                let _ = state.registry.send(id, reply);
                // A completed reveal set may release the round immediately.
                if let Some(room_id) = state.registry.room_of(id).map(str::to_string) {
                    let now = self.now_ms();
                    if let Some(room) = state.rooms.get_mut(&room_id) {
                        let events = room.tick(now);
                        self.dispatch(state, &room_id, events);
                    }
                }
            }
            ClientMessage::Action { action_id, action } => {
                let reply = self.apply_action(state, id, action_id, action);
                let _ = state.registry.send(id, reply);
            }
        }
    }

    fn authed_room<'a>(
        state: &'a mut State,
        id: ConnectionId,
    ) -> Option<(Identity, &'a mut Room)> {
        let identity = state.registry.identity_of(id)?.clone();
        let room_id = state.registry.room_of(id)?.to_string();
        let room = state.rooms.get_mut(&room_id)?;
        Some((identity, room))
    }

    /// Commit/reveal confirmations reuse the round number as the action id.
    fn apply_commit(
        &self,
        state: &mut State,
        id: ConnectionId,
        round: u64,
        digest: commonware_cryptography::sha256::Digest,
    ) -> ServerMessage {
        let Some((identity, room)) = Self::authed_room(state, id) else {
            return ServerMessage::ActionRejected {
                action_id: round,
                reason: "not authenticated".to_string(),
            };
        };
        if !room.accepting_commits() || round != room.round {
            return ServerMessage::ActionRejected {
                action_id: round,
                reason: CommitmentError::InvalidPhase.to_string(),
            };
        }
        if !room.is_alive(&identity) {
            return ServerMessage::ActionRejected {
                action_id: round,
                reason: "not alive".to_string(),
            };
        }
        match room.commitments.commit(round, identity, digest) {
            Ok(()) => ServerMessage::ActionConfirmed { action_id: round },
            Err(err) => ServerMessage::ActionRejected {
                action_id: round,
                reason: err.to_string(),
            },
        }
    }

    fn apply_reveal(
        &self,
        state: &mut State,
        id: ConnectionId,
        round: u64,
        action: veilmatch_types::GameAction,
        salt: veilmatch_types::Salt,
    ) -> ServerMessage {
        let Some((identity, room)) = Self::authed_room(state, id) else {
            return ServerMessage::ActionRejected {
                action_id: round,
                reason: "not authenticated".to_string(),
            };
        };
        if !room.accepting_reveals() || round != room.round {
            return ServerMessage::ActionRejected {
                action_id: round,
                reason: CommitmentError::InvalidPhase.to_string(),
            };
        }
        match room.commitments.reveal(round, &identity, action, &salt) {
            Ok(()) => ServerMessage::ActionConfirmed { action_id: round },
            Err(err) => ServerMessage::ActionRejected {
                action_id: round,
                reason: err.to_string(),
            },
        }
    }

    fn apply_action(
        &self,
        state: &mut State,
        id: ConnectionId,
        action_id: u64,
        action: veilmatch_types::GameAction,
    ) -> ServerMessage {
        let Some((identity, room)) = Self::authed_room(state, id) else {
            return ServerMessage::ActionRejected {
                action_id,
                reason: "not authenticated".to_string(),
            };
        };
        let room_id = room.id.clone();
        let rejected = |reason: &str| ServerMessage::ActionRejected {
            action_id,
            reason: reason.to_string(),
        };
        match action.kind {
            // A vote completing the alive set resolves on the next timer
            // tick, after this confirmation is delivered.
            ActionKind::Vote => match room.record_vote(&identity, action.target.clone()) {
                Ok(()) => ServerMessage::ActionConfirmed { action_id },
                Err(reason) => rejected(reason),
            },
            ActionKind::ReportBody => {
                if room.phase != GamePhase::Discussion {
                    return rejected("no body to report in this phase");
                }
                let Some(victim) = action.target.clone() else {
                    return rejected("report requires a target");
                };
                if !room.players.contains_key(&victim) {
                    return rejected("target is not in this match");
                }
                if room.is_alive(&victim) {
                    return rejected("target is alive");
                }
                let message = ServerMessage::BodyReported {
                    reporter: identity,
                    victim,
                };
                for (failed, err) in state.registry.broadcast(&room_id, &message) {
                    warn!(?failed, %err, "broadcast delivery failed");
                }
                ServerMessage::ActionConfirmed { action_id }
            }
            ActionKind::Move | ActionKind::CompleteTask => {
                if !room.is_alive(&identity) {
                    return rejected("not alive");
                }
                ServerMessage::ActionConfirmed { action_id }
            }
            ActionKind::Kill | ActionKind::Sabotage => {
                rejected("hidden actions must go through commit/reveal")
            }
        }
    }

    /// Periodic maintenance: room deadlines, auth deadlines, heartbeat
    /// liveness. All expiry paths produce explicit transitions.
    pub fn tick(&self) {
        let now = self.now_ms();
        let now_instant = Instant::now();
        let mut state = self.state.write().expect("state lock poisoned");
        let state = &mut *state;

        let room_ids: Vec<String> = state.rooms.keys().cloned().collect();
        for room_id in room_ids {
            let Some(room) = state.rooms.get_mut(&room_id) else {
                continue;
            };
            let events = room.tick(now);
            self.dispatch(state, &room_id, events);
        }

        let expired: Vec<ConnectionId> = state
            .auth_deadlines
            .iter()
            .filter(|(_, deadline)| now_instant >= **deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(?id, "authentication deadline elapsed");
            Self::close(state, id, CloseReason::AuthFailed);
        }

        let stale: Vec<ConnectionId> = state
            .last_ack
            .iter()
            .filter(|(_, last)| now_instant.duration_since(**last) > self.config.heartbeat_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            debug!(?id, "heartbeat timed out");
            let _ = state.registry.terminate(id);
            state.registry.remove_connection(id);
            state.auth_deadlines.remove(&id);
            state.last_ack.remove(&id);
        }
    }

    /// Pushes a liveness probe to every connection.
    pub fn send_heartbeats(&self) {
        let now = self.now_ms();
        let state = self.state.read().expect("state lock poisoned");
        let ids: Vec<ConnectionId> = state.registry.connections().map(|c| c.id).collect();
        for id in ids {
            let _ = state
                .registry
                .send(id, ServerMessage::Heartbeat { timestamp_ms: now });
        }
    }

    /// Spawns the maintenance loop driving [`Self::tick`] and heartbeats.
    pub fn spawn_timers(&self) -> tokio::task::JoinHandle<()> {
        let relay = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(250));
            let mut heartbeat = tokio::time::interval(relay.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => relay.tick(),
                    _ = heartbeat.tick() => relay.send_heartbeats(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt, Signer};
    use rand::{rngs::StdRng, SeedableRng};
    use veilmatch_types::GameAction;

    fn identity(seed: u64) -> Identity {
        PrivateKey::from_rng(&mut StdRng::seed_from_u64(seed)).public_key()
    }

    #[test]
    fn test_report_requires_dead_room_player() {
        let (relay, _chain_rx, _history_rx) = Relay::new(RelayConfig::default());
        let mut guard = relay.state.write().expect("state lock poisoned");
        let state = &mut *guard;

        let (outbox, _outbox_rx) = mpsc::unbounded_channel();
        let id = state.registry.add_connection(outbox, ConnectionKind::Agent);
        let reporter = identity(1);
        let dead = identity(2);
        let outsider = identity(3);
        state.registry.bind_identity(id, reporter.clone()).unwrap();
        state.registry.join_room(id, "room-1".to_string()).unwrap();

        let mut room = Room::new("room-1".to_string(), RoomConfig::default());
        room.add_player(reporter.clone());
        room.add_player(dead.clone());
        room.players.get_mut(&dead).unwrap().alive = false;
        room.phase = GamePhase::Discussion;
        state.rooms.insert("room-1".to_string(), room);

        let report =
            |target: &Identity| GameAction::new(ActionKind::ReportBody).with_target(target.clone());

        // An identity that was never in the match is not a body.
        let reply = relay.apply_action(state, id, 9, report(&outsider));
        assert!(matches!(reply, ServerMessage::ActionRejected { action_id: 9, .. }));

        // A living player is not a body either.
        let reply = relay.apply_action(state, id, 10, report(&reporter));
        assert!(matches!(reply, ServerMessage::ActionRejected { action_id: 10, .. }));

        let reply = relay.apply_action(state, id, 11, report(&dead));
        assert!(matches!(reply, ServerMessage::ActionConfirmed { action_id: 11 }));
    }
}

async fn ws_handler(
    AxumState(relay): AxumState<Relay>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, relay))
}

async fn handle_socket(socket: WebSocket, relay: Relay) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Outbound>();
    let id = relay.on_connect(outbox_tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            match frame {
                Outbound::Message(message) => {
                    let bytes = message.encode().to_vec();
                    if sender.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: reason.close_code(),
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
                Outbound::Terminate => {
                    // A bare close frame severs the socket so the reader
                    // loop ends too; otherwise only the sink half drops.
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Binary(data)) => match ClientMessage::decode(&mut data.as_slice()) {
                Ok(message) => relay.handle_message(id, message),
                Err(err) => {
                    // Malformed frames are rejected; the connection stays open.
                    debug!(?id, ?err, "undecodable client message");
                    let state = relay.state.read().expect("state lock poisoned");
                    let _ = state.registry.send(
                        id,
                        ServerMessage::ActionRejected {
                            action_id: 0,
                            reason: "malformed message".to_string(),
                        },
                    );
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(?id, ?err, "websocket read error");
                break;
            }
        }
    }

    relay.on_disconnect(id);
    writer.abort();
}
