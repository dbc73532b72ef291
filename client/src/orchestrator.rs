//! Drives many agent identities against one relay and merges what they see.
//!
//! Each identity gets its own [`AgentLinkClient`] and credential provider.
//! Events from every link feed a shared [`MergedGameView`]; merging is
//! last-writer-wins per field, so the view tracks whichever link heard from
//! the relay most recently.

use crate::link::{AgentLinkClient, CredentialProvider, LinkConfig, LinkEvent, LinkState};
use crate::{Error, Result};
use futures::future::join_all;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::debug;
use veilmatch_types::{GamePhase, Identity, Role, ServerMessage};

/// Relay state as assembled from every connected link's events.
#[derive(Clone, Debug, Default)]
pub struct MergedGameView {
    pub game_id: Option<String>,
    pub phase: Option<GamePhase>,
    pub round: u64,
    pub alive: Vec<Identity>,
    /// Roles are only ever learned for our own identities.
    pub roles: BTreeMap<Identity, Role>,
    /// Monotonic merge counter; higher wins.
    pub last_update: u64,
}

impl MergedGameView {
    /// Folds one link's event into the view. `observer` is the identity the
    /// event was delivered to.
    pub fn apply(&mut self, observer: &Identity, message: &ServerMessage) {
        self.last_update += 1;
        match message {
            ServerMessage::GameStateUpdate {
                game_id,
                phase,
                round,
                alive,
            } => {
                self.game_id = Some(game_id.clone());
                self.phase = Some(*phase);
                self.round = *round;
                self.alive = alive.clone();
            }
            ServerMessage::RoleAssigned { role } => {
                self.roles.insert(observer.clone(), *role);
            }
            ServerMessage::PlayerUpdate { identity, alive } => {
                if *alive {
                    if !self.alive.contains(identity) {
                        self.alive.push(identity.clone());
                    }
                } else {
                    self.alive.retain(|player| player != identity);
                }
            }
            ServerMessage::PlayerKilled { victim }
            | ServerMessage::PlayerEjected { identity: victim } => {
                self.alive.retain(|identity| identity != victim);
            }
            ServerMessage::GameEnded { .. } => {
                self.phase = Some(GamePhase::Ended);
            }
            _ => {}
        }
    }
}

struct ManagedLink {
    provider: Arc<dyn CredentialProvider>,
    link: Option<AgentLinkClient>,
    events_task: Option<tokio::task::JoinHandle<()>>,
}

/// Connects and supervises one link per identity.
pub struct ConnectionOrchestrator {
    base_url: String,
    game_id: String,
    config: LinkConfig,
    links: HashMap<Identity, ManagedLink>,
    view: Arc<Mutex<MergedGameView>>,
}

impl ConnectionOrchestrator {
    pub fn new(base_url: String, game_id: String, config: LinkConfig) -> Self {
        Self {
            base_url,
            game_id,
            config,
            links: HashMap::new(),
            view: Arc::new(Mutex::new(MergedGameView::default())),
        }
    }

    /// Registers an identity without connecting it. Replaces any previous
    /// provider for the identity.
    pub fn add_identity(&mut self, identity: Identity, provider: Arc<dyn CredentialProvider>) {
        self.links.insert(
            identity,
            ManagedLink {
                provider,
                link: None,
                events_task: None,
            },
        );
    }

    /// Disconnects and forgets an identity.
    pub fn remove_identity(&mut self, identity: &Identity) {
        if let Some(managed) = self.links.remove(identity) {
            if let Some(link) = managed.link {
                link.disconnect();
            }
            if let Some(task) = managed.events_task {
                task.abort();
            }
        }
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.links.keys()
    }

    /// Snapshot of the merged view.
    pub fn view(&self) -> MergedGameView {
        self.view.lock().expect("view lock poisoned").clone()
    }

    pub fn link(&self, identity: &Identity) -> Option<&AgentLinkClient> {
        self.links.get(identity)?.link.as_ref()
    }

    /// Connects one identity and waits until its link authenticates (or
    /// fails terminally).
    pub async fn connect_one(&mut self, identity: &Identity) -> Result<()> {
        let mut state = self.start_link(identity)?;

        // Wait for the first authenticated connection.
        loop {
            match &*state.borrow_and_update() {
                LinkState::Connected => return Ok(()),
                LinkState::Error(reason) => return Err(Error::AuthFailed(reason.clone())),
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(Error::LinkClosed);
            }
        }
    }

    /// Connects every registered identity. Attempts run concurrently; each
    /// identity's outcome is reported independently.
    pub async fn connect_all(&mut self) -> Vec<(Identity, Result<()>)> {
        let identities: Vec<Identity> = self.links.keys().cloned().collect();
        let mut started = Vec::with_capacity(identities.len());
        let mut results = Vec::with_capacity(identities.len());
        for identity in identities {
            match self.start_link(&identity) {
                Ok(state) => started.push((identity, state)),
                Err(err) => results.push((identity, Err(err))),
            }
        }

        let waits = started.into_iter().map(|(identity, mut state)| async move {
            loop {
                match &*state.borrow_and_update() {
                    LinkState::Connected => return (identity, Ok(())),
                    LinkState::Error(reason) => {
                        return (identity, Err(Error::AuthFailed(reason.clone())))
                    }
                    _ => {}
                }
                if state.changed().await.is_err() {
                    return (identity, Err(Error::LinkClosed));
                }
            }
        });
        results.extend(join_all(waits).await);
        results
    }

    fn start_link(
        &mut self,
        identity: &Identity,
    ) -> Result<tokio::sync::watch::Receiver<LinkState>> {
        let managed = self
            .links
            .get_mut(identity)
            .ok_or(Error::UnknownIdentity)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = AgentLinkClient::connect(
            &self.base_url,
            self.game_id.clone(),
            managed.provider.clone(),
            self.config,
            events_tx,
        )?;
        let state = link.state_watch();
        managed.events_task = Some(spawn_view_feed(
            identity.clone(),
            events_rx,
            self.view.clone(),
        ));
        managed.link = Some(link);
        Ok(state)
    }

    pub fn disconnect_one(&mut self, identity: &Identity) {
        if let Some(managed) = self.links.get_mut(identity) {
            if let Some(link) = managed.link.take() {
                link.disconnect();
            }
            if let Some(task) = managed.events_task.take() {
                task.abort();
            }
        }
    }

    pub fn disconnect_all(&mut self) {
        let identities: Vec<Identity> = self.links.keys().cloned().collect();
        for identity in identities {
            self.disconnect_one(&identity);
        }
    }

    /// Blocks until every link reports a terminal state or `timeout` passes.
    pub async fn wait_idle(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, async {
            for managed in self.links.values() {
                let Some(link) = &managed.link else { continue };
                let mut state = link.state_watch();
                loop {
                    match &*state.borrow_and_update() {
                        LinkState::Disconnected | LinkState::Error(_) => break,
                        _ => {}
                    }
                    if state.changed().await.is_err() {
                        break;
                    }
                }
            }
        })
        .await;
    }
}

fn spawn_view_feed(
    observer: Identity,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    view: Arc<Mutex<MergedGameView>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Message(message) => {
                    view.lock().expect("view lock poisoned").apply(&observer, &message);
                }
                LinkEvent::State(state) => {
                    debug!(?state, "link state changed");
                }
            }
        }
    })
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
    fn test_view_merges_last_writer_wins() {
        let mut view = MergedGameView::default();
        let a = identity(1);
        let b = identity(2);

        view.apply(
            &a,
            &ServerMessage::GameStateUpdate {
                game_id: "room-1".to_string(),
                phase: GamePhase::Night,
                round: 1,
                alive: vec![a.clone(), b.clone()],
            },
        );
        assert_eq!(view.phase, Some(GamePhase::Night));
        assert_eq!(view.round, 1);

        // A later observation from a different link overwrites the fields.
        view.apply(
            &b,
            &ServerMessage::GameStateUpdate {
                game_id: "room-1".to_string(),
                phase: GamePhase::Discussion,
                round: 1,
                alive: vec![a.clone(), b.clone()],
            },
        );
        assert_eq!(view.phase, Some(GamePhase::Discussion));
        assert_eq!(view.last_update, 2);
    }

    #[test]
    fn test_view_tracks_roles_per_observer() {
        let mut view = MergedGameView::default();
        let a = identity(1);
        let b = identity(2);
        view.apply(&a, &ServerMessage::RoleAssigned { role: Role::Saboteur });
        view.apply(&b, &ServerMessage::RoleAssigned { role: Role::Crew });
        assert_eq!(view.roles.get(&a), Some(&Role::Saboteur));
        assert_eq!(view.roles.get(&b), Some(&Role::Crew));
    }

    #[test]
    fn test_view_removes_dead_players() {
        let mut view = MergedGameView::default();
        let a = identity(1);
        let b = identity(2);
        view.apply(
            &a,
            &ServerMessage::GameStateUpdate {
                game_id: "room-1".to_string(),
                phase: GamePhase::Night,
                round: 1,
                alive: vec![a.clone(), b.clone()],
            },
        );
        view.apply(&a, &ServerMessage::PlayerKilled { victim: b.clone() });
        assert_eq!(view.alive, vec![a]);
    }
}
