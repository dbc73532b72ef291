//! Resilient relay link for a single agent identity.
//!
//! The link owns the websocket, authenticates on every (re)connection with a
//! freshly minted credential, answers heartbeats, and reconnects with
//! exponential backoff after unexpected closures. Closures that carry an
//! explicit reason code are final: the relay meant them, so the link stops.

use crate::{Error, Result};
use commonware_codec::{DecodeExt, Encode};
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;
use veilmatch_types::{
    AuthRequest, ClientMessage, CloseReason, GameAction, Salt, ServerMessage,
};
use commonware_cryptography::{ed25519::PrivateKey, sha256::Digest, Signer};

/// Mints the credential used for one connection attempt. Invoked fresh each
/// attempt; implementations must not cache signatures.
pub trait CredentialProvider: Send + Sync + 'static {
    fn credential(&self, game_id: &str) -> AuthRequest;
}

/// Provider backed by a held signing key, stamping the wall clock.
pub struct SignerCredentials {
    private: PrivateKey,
}

impl SignerCredentials {
    pub fn new(private: PrivateKey) -> Self {
        Self { private }
    }

    pub fn identity(&self) -> veilmatch_types::Identity {
        self.private.public_key()
    }
}

impl CredentialProvider for SignerCredentials {
    fn credential(&self, game_id: &str) -> AuthRequest {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        AuthRequest::sign(&self.private, game_id.to_string(), now_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    /// Backing off before another connection attempt.
    Reconnecting { attempt: u32 },
    Error(String),
}

/// What the link reports to its observer.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    State(LinkState),
    Message(ServerMessage),
}

#[derive(Clone, Copy, Debug)]
pub struct LinkConfig {
    pub auth_timeout: Duration,
    /// Missing a heartbeat for this long counts as an unexpected closure.
    pub heartbeat_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_multiplier: u32,
    pub backoff_cap: Duration,
    pub max_reconnect_attempts: u32,
    pub queue_capacity: usize,
    /// Unconfirmed actions older than this are silently forgotten.
    pub action_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(250),
            backoff_multiplier: 2,
            backoff_cap: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            queue_capacity: 64,
            action_timeout: Duration::from_secs(30),
        }
    }
}

impl LinkConfig {
    /// Exponential backoff, capped. Non-decreasing in `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.saturating_pow(attempt);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// Bounded outbound buffer. When full, the oldest entry is dropped: stale
/// game commands are worth less than fresh ones.
pub(crate) struct OutboundQueue {
    capacity: usize,
    entries: VecDeque<ClientMessage>,
}

impl OutboundQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Enqueues a message, returning the dropped entry if the queue was full.
    pub(crate) fn push(&mut self, message: ClientMessage) -> Option<ClientMessage> {
        let dropped = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        dropped
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = ClientMessage> + '_ {
        self.entries.drain(..)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Actions sent but not yet confirmed or rejected.
pub(crate) struct PendingActions {
    sent_at: HashMap<u64, Instant>,
}

impl PendingActions {
    pub(crate) fn new() -> Self {
        Self {
            sent_at: HashMap::new(),
        }
    }

    pub(crate) fn track(&mut self, action_id: u64) {
        self.sent_at.insert(action_id, Instant::now());
    }

    pub(crate) fn resolve(&mut self, action_id: u64) -> bool {
        self.sent_at.remove(&action_id).is_some()
    }

    /// Forgets entries older than `timeout`, returning their ids.
    pub(crate) fn prune(&mut self, timeout: Duration) -> Vec<u64> {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .sent_at
            .iter()
            .filter(|(_, sent)| now.duration_since(**sent) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.sent_at.remove(id);
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.sent_at.len()
    }
}

enum Command {
    Send(ClientMessage),
    Disconnect,
}

/// Handle to a running link. Dropping the handle does not stop the link;
/// call [`Self::disconnect`].
pub struct AgentLinkClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    task: tokio::task::JoinHandle<()>,
}

impl AgentLinkClient {
    /// Starts a link to `base_url` (http(s) or ws(s)) for `game_id`. Every
    /// state transition and relay message is emitted on `events`.
    pub fn connect(
        base_url: &str,
        game_id: String,
        provider: Arc<dyn CredentialProvider>,
        config: LinkConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self> {
        let mut url = Url::parse(base_url)?;
        let ws_scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => url.scheme(),
            scheme => return Err(Error::InvalidScheme(scheme.to_string())),
        };
        let scheme = ws_scheme.to_string();
        url.set_scheme(&scheme)
            .map_err(|_| Error::InvalidScheme(scheme))?;
        let url = url.join("/ws")?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let task = tokio::spawn(run_link(LinkTask {
            url,
            game_id,
            provider,
            config,
            events,
            commands: commands_rx,
            state: state_tx,
        }));
        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            task,
        })
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Watch handle for awaiting state transitions.
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        self.commands
            .send(Command::Send(message))
            .map_err(|_| Error::LinkClosed)
    }

    /// Locks in a hidden action for `round`.
    pub fn commit(&self, round: u64, digest: Digest) -> Result<()> {
        self.send(ClientMessage::Commit { round, digest })
    }

    /// Discloses a committed action.
    pub fn reveal(&self, round: u64, action: GameAction, salt: Salt) -> Result<()> {
        self.send(ClientMessage::Reveal {
            round,
            action,
            salt,
        })
    }

    /// Sends an open action expecting confirmation under `action_id`.
    pub fn action(&self, action_id: u64, action: GameAction) -> Result<()> {
        self.send(ClientMessage::Action { action_id, action })
    }

    /// Stops the link permanently. No reconnection follows.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

struct LinkTask {
    url: Url,
    game_id: String,
    provider: Arc<dyn CredentialProvider>,
    config: LinkConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<LinkState>,
}

/// Why one connection attempt finished.
enum SessionEnd {
    /// Relay closed with an explicit reason, or the caller disconnected.
    Final,
    /// Socket dropped, errored, or went silent: reconnect.
    Unexpected,
}

impl LinkTask {
    fn set_state(&self, state: LinkState) {
        let _ = self.events.send(LinkEvent::State(state.clone()));
        let _ = self.state.send(state);
    }

    fn action_id_of(message: &ClientMessage) -> Option<u64> {
        match message {
            // Commit and reveal confirmations reuse the round number.
            ClientMessage::Commit { round, .. } | ClientMessage::Reveal { round, .. } => {
                Some(*round)
            }
            ClientMessage::Action { action_id, .. } => Some(*action_id),
            _ => None,
        }
    }
}

async fn run_link(mut task: LinkTask) {
    let mut queue = OutboundQueue::new(task.config.queue_capacity);
    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            task.set_state(LinkState::Reconnecting { attempt });
            let delay = task.config.backoff_delay(attempt - 1);
            debug!(?delay, attempt, "backing off before reconnect");
            // Keep accepting sends while backing off; they queue.
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = task.commands.recv() => match command {
                        Some(Command::Send(message)) => {
                            if queue.push(message).is_some() {
                                warn!("outbound queue full; dropped oldest entry");
                            }
                        }
                        Some(Command::Disconnect) | None => {
                            task.set_state(LinkState::Disconnected);
                            return;
                        }
                    },
                }
            }
        }

        match run_session(&mut task, &mut queue, &mut attempt).await {
            Ok(SessionEnd::Final) => return,
            Ok(SessionEnd::Unexpected) => {
                attempt += 1;
                if attempt > task.config.max_reconnect_attempts {
                    task.set_state(LinkState::Error("reconnect attempts exhausted".to_string()));
                    return;
                }
            }
            // A refused credential is final; retrying would only be refused
            // again. An auth deadline that lapsed with the relay reachable is
            // treated the same way.
            Err(Error::AuthFailed(_)) | Err(Error::AuthTimeout) => return,
            Err(err) => {
                attempt += 1;
                if attempt > task.config.max_reconnect_attempts {
                    task.set_state(LinkState::Error(err.to_string()));
                    return;
                }
                debug!(%err, "connection attempt failed");
            }
        }
    }
}

/// One connection attempt: dial, authenticate, pump until closure.
/// Returns `Ok` with how the session ended, or `Err` for dial/auth
/// transport failures (retryable).
async fn run_session(
    task: &mut LinkTask,
    queue: &mut OutboundQueue,
    attempt: &mut u32,
) -> Result<SessionEnd> {
    task.set_state(LinkState::Connecting);
    let (mut ws, _) = connect_async(task.url.as_str()).await?;

    task.set_state(LinkState::Authenticating);
    // A fresh credential every attempt: signatures are never reused.
    let credential = task.provider.credential(&task.game_id);
    let auth = ClientMessage::Auth(credential);
    ws.send(Message::Binary(auth.encode().to_vec())).await?;

    let auth_deadline = tokio::time::sleep(task.config.auth_timeout);
    tokio::pin!(auth_deadline);
    loop {
        tokio::select! {
            _ = &mut auth_deadline => {
                task.set_state(LinkState::Error("authentication timed out".to_string()));
                return Err(Error::AuthTimeout);
            }
            frame = ws.next() => {
                let Some(frame) = frame else {
                    return Ok(SessionEnd::Unexpected);
                };
                match frame? {
                    Message::Binary(data) => {
                        let message = ServerMessage::decode(&mut data.as_slice())?;
                        match &message {
                            ServerMessage::AuthSuccess { .. } => {
                                let _ = task.events.send(LinkEvent::Message(message));
                                break;
                            }
                            ServerMessage::AuthFailure { reason } => {
                                let reason = reason.clone();
                                let _ = task.events.send(LinkEvent::Message(message));
                                task.set_state(LinkState::Error(reason.clone()));
                                return Err(Error::AuthFailed(reason));
                            }
                            // Heartbeats may interleave with the auth reply.
                            _ => {
                                let _ = task.events.send(LinkEvent::Message(message));
                            }
                        }
                    }
                    Message::Close(frame) => {
                        if let Some(frame) = frame {
                            if let Some(reason) = CloseReason::from_close_code(frame.code.into()) {
                                info!(?reason, "relay refused the connection");
                                task.set_state(LinkState::Disconnected);
                                return Ok(SessionEnd::Final);
                            }
                        }
                        return Ok(SessionEnd::Unexpected);
                    }
                    _ => {}
                }
            }
        }
    }

    task.set_state(LinkState::Connected);
    info!(game_id = %task.game_id, "link established");
    // Backoff restarts from the base delay once a connection authenticates.
    *attempt = 0;

    let mut pending = PendingActions::new();
    // Flush everything queued while disconnected, oldest first.
    let backlog: Vec<ClientMessage> = queue.drain().collect();
    for message in backlog {
        if let Some(action_id) = LinkTask::action_id_of(&message) {
            pending.track(action_id);
        }
        ws.send(Message::Binary(message.encode().to_vec())).await?;
    }

    let mut last_heartbeat = Instant::now();
    let mut prune_interval = tokio::time::interval(Duration::from_secs(1));
    prune_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = prune_interval.tick() => {
                for action_id in pending.prune(task.config.action_timeout) {
                    debug!(action_id, "action unconfirmed past timeout; forgotten");
                }
                if last_heartbeat.elapsed() > task.config.heartbeat_timeout {
                    warn!("heartbeat timeout; treating link as dead");
                    return Ok(SessionEnd::Unexpected);
                }
            }
            command = task.commands.recv() => match command {
                Some(Command::Send(message)) => {
                    if let Some(action_id) = LinkTask::action_id_of(&message) {
                        pending.track(action_id);
                    }
                    if ws.send(Message::Binary(message.encode().to_vec())).await.is_err() {
                        return Ok(SessionEnd::Unexpected);
                    }
                }
                Some(Command::Disconnect) | None => {
                    let _ = ws.send(Message::Close(None)).await;
                    task.set_state(LinkState::Disconnected);
                    return Ok(SessionEnd::Final);
                }
            },
            frame = ws.next() => {
                let Some(frame) = frame else {
                    return Ok(SessionEnd::Unexpected);
                };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(%err, "websocket read error");
                        return Ok(SessionEnd::Unexpected);
                    }
                };
                match frame {
                    Message::Binary(data) => {
                        let message = match ServerMessage::decode(&mut data.as_slice()) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!(%err, "undecodable relay message; skipped");
                                continue;
                            }
                        };
                        match &message {
                            ServerMessage::Heartbeat { timestamp_ms } => {
                                last_heartbeat = Instant::now();
                                let ack = ClientMessage::HeartbeatAck {
                                    timestamp_ms: *timestamp_ms,
                                };
                                if ws.send(Message::Binary(ack.encode().to_vec())).await.is_err() {
                                    return Ok(SessionEnd::Unexpected);
                                }
                            }
                            ServerMessage::ActionConfirmed { action_id }
                            | ServerMessage::ActionRejected { action_id, .. } => {
                                pending.resolve(*action_id);
                            }
                            _ => {}
                        }
                        let _ = task.events.send(LinkEvent::Message(message));
                    }
                    Message::Close(frame) => {
                        if let Some(frame) = frame {
                            if let Some(reason) = CloseReason::from_close_code(frame.code.into()) {
                                info!(?reason, "relay closed the link");
                                task.set_state(LinkState::Disconnected);
                                return Ok(SessionEnd::Final);
                            }
                        }
                        return Ok(SessionEnd::Unexpected);
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilmatch_types::ActionKind;

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let config = LinkConfig {
            backoff_base: Duration::from_millis(100),
            backoff_multiplier: 2,
            backoff_cap: Duration::from_secs(5),
            ..LinkConfig::default()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(800));
        // Capped and non-decreasing from there.
        assert_eq!(config.backoff_delay(10), Duration::from_secs(5));
        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let delay = config.backoff_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= config.backoff_cap);
            previous = delay;
        }
    }

    #[test]
    fn test_queue_drops_oldest_and_flushes_fifo() {
        let mut queue = OutboundQueue::new(3);
        let message = |id: u64| ClientMessage::Action {
            action_id: id,
            action: GameAction::new(ActionKind::Move),
        };
        assert!(queue.push(message(1)).is_none());
        assert!(queue.push(message(2)).is_none());
        assert!(queue.push(message(3)).is_none());
        // Full: the oldest entry makes room for the newest.
        assert_eq!(queue.push(message(4)), Some(message(1)));
        assert_eq!(queue.len(), 3);

        let order: Vec<u64> = queue
            .drain()
            .map(|m| match m {
                ClientMessage::Action { action_id, .. } => action_id,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![2, 3, 4]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_pending_actions_prune() {
        let mut pending = PendingActions::new();
        pending.track(1);
        pending.track(2);
        assert!(pending.resolve(1));
        assert!(!pending.resolve(1));
        assert_eq!(pending.len(), 1);

        // Nothing is old enough yet.
        assert!(pending.prune(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(2));
        let expired = pending.prune(Duration::ZERO);
        assert_eq!(expired, vec![2]);
        assert_eq!(pending.len(), 0);
    }
}
