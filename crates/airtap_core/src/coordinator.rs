/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::api::{AccountApi, ApiError};
use crate::config::CoreConfig;
use crate::http_retry::{next_backoff, sleep_with_jitter};
use crate::identity::{CredentialStore, Identity, IdentityContext, IdentityEvent};
use crate::link::parse_discover_link;
use crate::media::{MediaEngine, MediaEvent, RelayServer};
use crate::negotiation::{NegotiationEngine, SessionState};
use crate::net_metrics::NetMetrics;
use crate::registry::{InsertOutcome, PeerRecord, PeerRegistry, RosterEvent};
use crate::roster_db::RosterStore;
use crate::signaling::{SignalingChannel, SignalingEvent, TaggedEvent};
use crate::ui_events::UiEvent;
use airtap_protocol::{
    AccountId, CreateAccountRequest, CreateAccountResponse, DiscoverResponse, InfoKind, RtcServer,
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RELAY_RETRY_BASE: Duration = Duration::from_secs(1);
const RELAY_RETRY_MAX: Duration = Duration::from_secs(60);
const REOFFER_BASE: Duration = Duration::from_millis(500);
const REOFFER_MAX: Duration = Duration::from_secs(30);

pub enum Command {
    SignIn {
        account_id: AccountId,
        credential: String,
    },
    SignOut,
    CreateAccount {
        license_key: String,
        first_name: String,
        last_name: Option<String>,
    },
    HandleLink(String),
    RemovePeer(AccountId),
    ToggleMute(AccountId),
    TalkStart(usize),
    TalkStop(usize),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct Snapshot {
    pub account_id: Option<AccountId>,
    pub self_speaking: bool,
    pub peers: Vec<PeerRecord>,
    pub sessions: Vec<(AccountId, SessionState)>,
}

/// Cloneable front door into a running [`SessionCoordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    ui: broadcast::Sender<UiEvent>,
}

impl CoordinatorHandle {
    pub fn send(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("coordinator is not running"))
    }

    pub fn sign_in(&self, account_id: AccountId, credential: impl Into<String>) -> Result<()> {
        self.send(Command::SignIn {
            account_id,
            credential: credential.into(),
        })
    }

    pub fn sign_out(&self) -> Result<()> {
        self.send(Command::SignOut)
    }

    pub fn handle_link(&self, link: impl Into<String>) -> Result<()> {
        self.send(Command::HandleLink(link.into()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx))?;
        rx.await.context("coordinator dropped snapshot request")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }
}

/// Collaborators injected into the coordinator.
pub struct CoordinatorDeps {
    pub credentials: Box<dyn CredentialStore>,
    pub roster: Box<dyn RosterStore>,
    pub media: Arc<dyn MediaEngine>,
    /// Receiving end of the channel the media engine was built with.
    pub media_events: mpsc::UnboundedReceiver<MediaEvent>,
    pub api: Arc<dyn AccountApi>,
}

/// Work finished off the coordinator task, tagged with the epoch it started in.
enum Completion {
    RelayServers(Result<Vec<RtcServer>, ApiError>),
    Discovered(Result<DiscoverResponse, ApiError>),
    AccountCreated(Result<CreateAccountResponse, ApiError>),
    Reoffer(AccountId),
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Single owner of identity, roster, negotiation sessions and the outbound
/// signaling channel. Every input is funnelled through [`SessionCoordinator::run`].
pub struct SessionCoordinator {
    identity: IdentityContext,
    registry: PeerRegistry,
    engine: NegotiationEngine,
    signaling: SignalingChannel,
    api: Arc<dyn AccountApi>,
    metrics: Arc<NetMetrics>,
    link_scheme: String,

    epoch: u64,
    relays_ready: bool,
    signaling_ready: bool,
    self_speaking: bool,
    relay_retry: Duration,
    reoffer_backoff: HashMap<AccountId, Duration>,
    in_flight: Vec<JoinHandle<()>>,

    ui: broadcast::Sender<UiEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    identity_rx: mpsc::UnboundedReceiver<IdentityEvent>,
    roster_rx: mpsc::UnboundedReceiver<RosterEvent>,
    signaling_tx: mpsc::UnboundedSender<TaggedEvent>,
    signaling_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    done_tx: mpsc::UnboundedSender<(u64, Completion)>,
    done_rx: mpsc::UnboundedReceiver<(u64, Completion)>,
}

impl SessionCoordinator {
    pub fn new(cfg: &CoreConfig, deps: CoordinatorDeps, metrics: Arc<NetMetrics>) -> (Self, CoordinatorHandle) {
        let (identity_tx, identity_rx) = mpsc::unbounded_channel();
        let (roster_tx, roster_rx) = mpsc::unbounded_channel();
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (ui_tx, _) = broadcast::channel(256);

        let coordinator = Self {
            identity: IdentityContext::new(deps.credentials, identity_tx),
            registry: PeerRegistry::new(deps.roster, cfg.max_peers(), roster_tx),
            engine: NegotiationEngine::new(deps.media),
            signaling: SignalingChannel::new(cfg.signaling(), metrics.clone()),
            api: deps.api,
            metrics,
            link_scheme: cfg.link_scheme(),
            epoch: 0,
            relays_ready: false,
            signaling_ready: false,
            self_speaking: false,
            relay_retry: RELAY_RETRY_BASE,
            reoffer_backoff: HashMap::new(),
            in_flight: Vec::new(),
            ui: ui_tx.clone(),
            commands: command_rx,
            identity_rx,
            roster_rx,
            signaling_tx,
            signaling_rx,
            media_rx: deps.media_events,
            done_tx,
            done_rx,
        };
        let handle = CoordinatorHandle {
            commands: command_tx,
            ui: ui_tx,
        };
        (coordinator, handle)
    }

    /// Restores stored credentials, then processes events until `Shutdown`
    /// or until every command sender is gone.
    pub async fn run(mut self) -> Result<()> {
        self.identity.load();
        loop {
            tokio::select! {
                biased;
                Some(ev) = self.identity_rx.recv() => self.on_identity(ev).await,
                Some(ev) = self.roster_rx.recv() => self.on_roster(ev).await,
                Some((epoch, done)) = self.done_rx.recv() => self.on_completion(epoch, done).await,
                Some((epoch, ev)) = self.signaling_rx.recv() => self.on_signaling(epoch, ev).await,
                Some(ev) = self.media_rx.recv() => self.on_media(ev).await,
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.on_command(cmd).await == Flow::Stop {
                        break;
                    }
                }
            }
        }
        let closed = self.engine.close_all().await;
        self.signaling.stop();
        self.abort_in_flight();
        info!(closed, "coordinator stopped");
        Ok(())
    }

    fn emit(&self, ev: UiEvent) {
        let _ = self.ui.send(ev);
    }

    fn is_ready(&self) -> bool {
        self.relays_ready && self.signaling_ready && self.identity.current().is_some()
    }

    fn publish_sessions(&self) {
        self.metrics
            .media_sessions_set(self.engine.len() as u64, self.engine.connected_count() as u64);
    }

    fn spawn_task<F>(&mut self, fut: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.done_tx.clone();
        let epoch = self.epoch;
        self.in_flight.retain(|h| !h.is_finished());
        self.in_flight.push(tokio::spawn(async move {
            let done = fut.await;
            let _ = tx.send((epoch, done));
        }));
    }

    fn abort_in_flight(&mut self) {
        for h in self.in_flight.drain(..) {
            h.abort();
        }
    }

    fn fetch_relays(&mut self, identity: Identity, delay: Duration) {
        let api = self.api.clone();
        self.spawn_task(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Completion::RelayServers(api.rtc_servers(&identity).await)
        });
    }

    async fn on_identity(&mut self, ev: IdentityEvent) {
        match ev {
            IdentityEvent::SignedIn(identity) => {
                self.epoch += 1;
                self.relays_ready = false;
                self.signaling_ready = false;
                self.relay_retry = RELAY_RETRY_BASE;
                self.reoffer_backoff.clear();
                info!(account_id = identity.account_id, epoch = self.epoch, "signed in");
                self.signaling
                    .start(&identity, self.epoch, self.signaling_tx.clone());
                if let Err(e) = self.registry.load() {
                    warn!("roster load failed: {e:#}");
                }
                self.fetch_relays(identity.clone(), Duration::ZERO);
                self.emit(UiEvent::peer("signed_in", identity.account_id));
            }
            IdentityEvent::SignedOut => {
                self.epoch += 1;
                self.relays_ready = false;
                self.signaling_ready = false;
                self.self_speaking = false;
                self.reoffer_backoff.clear();
                self.abort_in_flight();
                let closed = self.engine.close_all().await;
                self.signaling.stop();
                self.registry.wipe();
                self.publish_sessions();
                info!(closed, epoch = self.epoch, "signed out");
                self.emit(UiEvent::plain("signed_out"));
            }
        }
    }

    async fn on_roster(&mut self, ev: RosterEvent) {
        match ev {
            RosterEvent::PeerAdded(record) => {
                if !self.registry.contains(record.id) {
                    debug!(peer_id = record.id, "stale roster addition ignored");
                    return;
                }
                self.emit(UiEvent::new(
                    "peer_added",
                    Some(record.id),
                    Some(record.display_name()),
                ));
                if self.is_ready() {
                    self.start_offer(record.id).await;
                } else {
                    debug!(peer_id = record.id, "session not ready, offer deferred");
                }
            }
            RosterEvent::PeerRemoved(id) => {
                if self.engine.remove_peer(id).await {
                    self.publish_sessions();
                }
                self.emit(UiEvent::peer("peer_removed", id));
            }
        }
    }

    async fn offer_to_roster(&mut self) {
        let ids: Vec<AccountId> = self
            .registry
            .peers()
            .iter()
            .map(|p| p.id)
            .filter(|id| !self.engine.has_session(*id))
            .collect();
        for id in ids {
            self.start_offer(id).await;
        }
    }

    async fn start_offer(&mut self, peer_id: AccountId) {
        match self.engine.add_peer(peer_id).await {
            Ok(Some(sdp)) => {
                self.apply_stored_mute(peer_id).await;
                if let Err(e) = self.signaling.send_offer(peer_id, sdp) {
                    error!(peer_id, "offer not sent: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(peer_id, "negotiation failed: {e:#}"),
        }
        self.publish_sessions();
    }

    async fn apply_stored_mute(&self, peer_id: AccountId) {
        if self.registry.get(peer_id).is_some_and(|p| p.is_muted) {
            self.engine.mute_audio(peer_id).await;
        }
    }

    async fn on_signaling(&mut self, epoch: u64, ev: SignalingEvent) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "stale signaling event dropped");
            return;
        }
        match ev {
            SignalingEvent::Ready => {
                self.signaling_ready = true;
                self.emit(UiEvent::plain("signaling_ready"));
                if self.is_ready() {
                    self.offer_to_roster().await;
                }
            }
            SignalingEvent::Disconnected => {
                self.signaling_ready = false;
                self.emit(UiEvent::plain("signaling_down"));
            }
            SignalingEvent::ReceivedOffer { from, sdp } => {
                if self.identity.account_id() == Some(from) {
                    debug!("offer from own account ignored");
                    return;
                }
                if !self.registry.contains(from) {
                    debug!(peer_id = from, "offer from account outside the roster ignored");
                    return;
                }
                match self.engine.handle_incoming_offer(from, &sdp).await {
                    Ok(answer) => {
                        self.apply_stored_mute(from).await;
                        if let Err(e) = self.signaling.send_answer(from, answer) {
                            error!(peer_id = from, "answer not sent: {e}");
                        }
                    }
                    Err(e) => warn!(peer_id = from, "answering offer failed: {e:#}"),
                }
                self.publish_sessions();
            }
            SignalingEvent::ReceivedAnswer { from, sdp } => {
                if let Err(e) = self.engine.handle_incoming_answer(from, &sdp).await {
                    warn!(peer_id = from, "applying answer failed: {e:#}");
                    self.publish_sessions();
                }
            }
            SignalingEvent::ReceivedCandidate { from, candidate } => {
                if let Err(e) = self.engine.handle_remote_candidate(from, &candidate).await {
                    warn!(peer_id = from, "remote candidate rejected: {e:#}");
                }
            }
            SignalingEvent::ReceivedInfo { from, info } => {
                let speaking = info == InfoKind::MicOn;
                if self.registry.set_speaking(from, speaking) {
                    let kind = if speaking { "peer_speaking" } else { "peer_silent" };
                    self.emit(UiEvent::peer(kind, from));
                }
            }
        }
    }

    async fn on_media(&mut self, ev: MediaEvent) {
        match ev {
            MediaEvent::LocalCandidate {
                peer_id,
                connection,
                candidate,
            } => {
                if !self.engine.is_current(peer_id, connection) {
                    debug!(peer_id, connection, "candidate from stale connection dropped");
                    return;
                }
                if let Err(e) = self.signaling.send_candidate(peer_id, candidate) {
                    error!(peer_id, "candidate not sent: {e}");
                }
            }
            MediaEvent::StateChanged {
                peer_id,
                connection,
                state,
            } => {
                if let Some(next) = self.engine.on_connection_state(peer_id, connection, state).await {
                    self.publish_sessions();
                    self.emit(UiEvent::new("media_state", Some(peer_id), Some(format!("{next:?}"))));
                    match next {
                        SessionState::Connected => {
                            self.reoffer_backoff.remove(&peer_id);
                        }
                        SessionState::Closed => self.schedule_reoffer(peer_id),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Offers again to a roster peer whose media connection died, after a
    /// per-peer backoff that resets once the peer connects.
    fn schedule_reoffer(&mut self, peer_id: AccountId) {
        if !self.registry.contains(peer_id) {
            return;
        }
        let delay = self.reoffer_backoff.get(&peer_id).copied().unwrap_or(REOFFER_BASE);
        self.reoffer_backoff.insert(peer_id, next_backoff(delay, REOFFER_MAX));
        info!(peer_id, retry_in_ms = delay.as_millis() as u64, "re-offer scheduled");
        self.spawn_task(async move {
            sleep_with_jitter(delay).await;
            Completion::Reoffer(peer_id)
        });
    }

    async fn on_completion(&mut self, epoch: u64, done: Completion) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "stale completion dropped");
            return;
        }
        match done {
            Completion::RelayServers(Ok(servers)) => {
                let relays: Vec<RelayServer> = servers.into_iter().map(RelayServer::from).collect();
                info!(count = relays.len(), "relay servers configured");
                self.engine.set_relay_servers(&relays).await;
                self.relays_ready = true;
                if self.is_ready() {
                    self.offer_to_roster().await;
                }
            }
            Completion::RelayServers(Err(e)) if e.is_auth_rejection() => {
                self.force_sign_out("relay server fetch");
            }
            Completion::RelayServers(Err(e)) => {
                let Some(identity) = self.identity.current().cloned() else {
                    return;
                };
                let delay = self.relay_retry;
                self.relay_retry = next_backoff(delay, RELAY_RETRY_MAX);
                warn!(retry_in_ms = delay.as_millis() as u64, "relay server fetch failed: {e}");
                self.fetch_relays(identity, delay);
            }
            Completion::Discovered(Ok(found)) => self.on_discovered(found),
            Completion::Discovered(Err(e)) if e.is_auth_rejection() => {
                self.force_sign_out("discovery");
            }
            Completion::Discovered(Err(e)) => {
                info!("discovery failed: {e}");
                self.emit(UiEvent::new("link_rejected", None, Some(e.to_string())));
            }
            Completion::AccountCreated(Ok(created)) => {
                info!(account_id = created.account_id, "account created");
                self.identity.sign_in(created.account_id, created.token);
                self.emit(UiEvent::new(
                    "account_created",
                    Some(created.account_id),
                    Some(created.shareable_link),
                ));
            }
            Completion::AccountCreated(Err(e)) => {
                warn!("account creation failed: {e}");
                self.emit(UiEvent::new("account_failed", None, Some(e.to_string())));
            }
            Completion::Reoffer(peer_id) => {
                if !self.registry.contains(peer_id) || self.engine.has_session(peer_id) {
                    debug!(peer_id, "re-offer no longer needed");
                    return;
                }
                if self.is_ready() {
                    self.start_offer(peer_id).await;
                }
            }
        }
    }

    fn on_discovered(&mut self, found: DiscoverResponse) {
        if self.identity.account_id() == Some(found.account_id) {
            self.emit(UiEvent::new("link_rejected", None, Some("own code".to_string())));
            return;
        }
        let record = PeerRecord::new(found.account_id, found.first_name, found.last_name);
        let reason = match self.registry.insert(record) {
            Ok(InsertOutcome::Inserted) => return,
            Ok(InsertOutcome::Duplicate) => "already known".to_string(),
            Ok(InsertOutcome::Full) => "roster full".to_string(),
            Err(e) => {
                warn!("storing discovered peer failed: {e:#}");
                format!("{e:#}")
            }
        };
        self.emit(UiEvent::new("link_rejected", Some(found.account_id), Some(reason)));
    }

    /// Queues `SignedOut`; the biased loop tears down before anything else runs.
    fn force_sign_out(&mut self, during: &str) {
        warn!(during, "credentials rejected, signing out");
        self.identity.sign_out();
    }

    async fn on_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::SignIn {
                account_id,
                credential,
            } => self.identity.sign_in(account_id, credential),
            Command::SignOut => {
                if !self.identity.sign_out() {
                    debug!("sign-out while signed out ignored");
                }
            }
            Command::CreateAccount {
                license_key,
                first_name,
                last_name,
            } => {
                let api = self.api.clone();
                let req = CreateAccountRequest {
                    license_key,
                    first_name,
                    last_name,
                };
                self.spawn_task(async move { Completion::AccountCreated(api.create_account(req).await) });
            }
            Command::HandleLink(link) => self.handle_link(&link),
            Command::RemovePeer(id) => {
                self.reoffer_backoff.remove(&id);
                if let Err(e) = self.registry.remove(id) {
                    warn!(peer_id = id, "removing peer failed: {e:#}");
                }
            }
            Command::ToggleMute(id) => self.toggle_mute(id).await,
            Command::TalkStart(index) => self.talk(index, true).await,
            Command::TalkStop(index) => self.talk(index, false).await,
            Command::Snapshot(reply) => {
                let snapshot = Snapshot {
                    account_id: self.identity.account_id(),
                    self_speaking: self.self_speaking,
                    peers: self.registry.peers().to_vec(),
                    sessions: self
                        .engine
                        .peers()
                        .into_iter()
                        .map(|id| (id, self.engine.state(id)))
                        .collect(),
                };
                let _ = reply.send(snapshot);
            }
            Command::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    fn handle_link(&mut self, link: &str) {
        let Some(code) = parse_discover_link(link, &self.link_scheme) else {
            debug!("ignoring link that is not a discovery link");
            return;
        };
        let Some(identity) = self.identity.current().cloned() else {
            self.emit(UiEvent::new("link_rejected", None, Some("signed out".to_string())));
            return;
        };
        if !self.registry.has_capacity() {
            self.emit(UiEvent::new("link_rejected", None, Some("roster full".to_string())));
            return;
        }
        let api = self.api.clone();
        self.spawn_task(async move { Completion::Discovered(api.discover(&identity, &code).await) });
    }

    async fn toggle_mute(&mut self, id: AccountId) {
        let Some(muted) = self.registry.get(id).map(|p| !p.is_muted) else {
            return;
        };
        match self.registry.set_muted(id, muted) {
            Ok(true) => {
                if muted {
                    self.engine.mute_audio(id).await;
                    self.emit(UiEvent::peer("peer_muted", id));
                } else {
                    self.engine.unmute_audio(id).await;
                    self.emit(UiEvent::peer("peer_unmuted", id));
                }
            }
            Ok(false) => {}
            Err(e) => warn!(peer_id = id, "mute flag not stored: {e:#}"),
        }
    }

    async fn talk(&mut self, index: usize, on: bool) {
        let Some(id) = self.registry.at(index).map(|p| p.id) else {
            debug!(index, "no roster entry at index");
            return;
        };
        if on {
            self.engine.unmute_mic(id).await;
        } else {
            self.engine.mute_mic(id).await;
        }
        if self.signaling.is_started() {
            let info = if on { InfoKind::MicOn } else { InfoKind::MicOff };
            if let Err(e) = self.signaling.send_info(id, info) {
                error!(peer_id = id, "talk state not sent: {e}");
            }
        }
        self.self_speaking = on;
        let kind = if on { "self_speaking" } else { "self_silent" };
        self.emit(UiEvent::peer(kind, id));
    }
}
