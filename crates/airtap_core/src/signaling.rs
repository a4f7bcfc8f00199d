/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::SignalingSettings;
use crate::http_retry::{next_backoff, sleep_with_jitter};
use crate::identity::Identity;
use crate::net_metrics::NetMetrics;
use airtap_protocol::{
    AccountId, CandidatePayload, Envelope, EnvelopePayload, EnvelopeType, InfoKind,
};
use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::{header::AUTHORIZATION, HeaderValue};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Inbound side of the channel, as seen by the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum SignalingEvent {
    Ready,
    Disconnected,
    ReceivedOffer { from: AccountId, sdp: String },
    ReceivedAnswer { from: AccountId, sdp: String },
    ReceivedCandidate { from: AccountId, candidate: CandidatePayload },
    ReceivedInfo { from: AccountId, info: InfoKind },
}

/// Event stamped with the identity epoch of the socket task that produced it.
pub type TaggedEvent = (u64, SignalingEvent);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling channel used before it was started")]
    NotStarted,
    #[error("signaling socket task has exited")]
    Closed,
}

fn into_event(env: Envelope) -> Option<SignalingEvent> {
    let from = env.from_account_id()?;
    let payload = env.payload?;
    match env.kind {
        EnvelopeType::Ack => None,
        EnvelopeType::Offer => payload
            .offer
            .map(|o| SignalingEvent::ReceivedOffer { from, sdp: o.sdp }),
        EnvelopeType::Answer => payload
            .answer
            .map(|a| SignalingEvent::ReceivedAnswer { from, sdp: a.sdp }),
        EnvelopeType::Candidate => payload
            .candidate
            .map(|candidate| SignalingEvent::ReceivedCandidate { from, candidate }),
        EnvelopeType::Info => payload
            .info
            .map(|i| SignalingEvent::ReceivedInfo { from, info: i.kind }),
    }
}

struct SocketHandle {
    outbound: mpsc::UnboundedSender<Envelope>,
    shutdown: watch::Sender<bool>,
}

/// Outbound half of the signaling channel. Owns the nonce counter; the
/// WebSocket itself lives in a spawned socket task.
pub struct SignalingChannel {
    settings: SignalingSettings,
    metrics: Arc<NetMetrics>,
    next_nonce: u64,
    socket: Option<SocketHandle>,
}

impl SignalingChannel {
    pub fn new(settings: SignalingSettings, metrics: Arc<NetMetrics>) -> Self {
        Self {
            settings,
            metrics,
            next_nonce: 0,
            socket: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.socket.is_some()
    }

    /// Nonce of the most recent send, 0 when nothing was sent yet.
    pub fn last_nonce(&self) -> u64 {
        self.next_nonce
    }

    /// Spawns the socket task for `identity`. A running task is stopped first
    /// and the nonce counter restarts.
    pub fn start(&mut self, identity: &Identity, epoch: u64, events: mpsc::UnboundedSender<TaggedEvent>) {
        self.stop();
        self.next_nonce = 0;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = SocketTask {
            settings: self.settings.clone(),
            auth: identity.basic_auth(),
            epoch,
            outbound: outbound_rx,
            events,
            shutdown: shutdown_rx,
            metrics: self.metrics.clone(),
            pending: BTreeMap::new(),
            backlog: VecDeque::new(),
            recent: VecDeque::new(),
        };
        tokio::spawn(task.run());
        info!(account_id = identity.account_id, epoch, "signaling started");
        self.socket = Some(SocketHandle {
            outbound: outbound_tx,
            shutdown: shutdown_tx,
        });
    }

    /// Returns false when the channel was not running.
    pub fn stop(&mut self) -> bool {
        let Some(socket) = self.socket.take() else {
            return false;
        };
        let _ = socket.shutdown.send(true);
        info!("signaling stopped");
        true
    }

    pub fn send_offer(&mut self, to: AccountId, sdp: String) -> Result<u64, SignalingError> {
        self.send(EnvelopeType::Offer, EnvelopePayload::offer_to(to, sdp))
    }

    pub fn send_answer(&mut self, to: AccountId, sdp: String) -> Result<u64, SignalingError> {
        self.send(EnvelopeType::Answer, EnvelopePayload::answer_to(to, sdp))
    }

    pub fn send_candidate(&mut self, to: AccountId, candidate: CandidatePayload) -> Result<u64, SignalingError> {
        self.send(EnvelopeType::Candidate, EnvelopePayload::candidate_to(to, candidate))
    }

    pub fn send_info(&mut self, to: AccountId, info: InfoKind) -> Result<u64, SignalingError> {
        self.send(EnvelopeType::Info, EnvelopePayload::info_to(to, info))
    }

    fn send(&mut self, kind: EnvelopeType, payload: EnvelopePayload) -> Result<u64, SignalingError> {
        let Some(socket) = &self.socket else {
            error!(?kind, "signaling send attempted before start");
            return Err(SignalingError::NotStarted);
        };
        let nonce = self.next_nonce + 1;
        if socket.outbound.send(Envelope::new(kind, nonce, payload)).is_err() {
            error!(?kind, nonce, "signaling socket task is gone");
            return Err(SignalingError::Closed);
        }
        self.next_nonce = nonce;
        debug!(?kind, nonce, "envelope queued");
        Ok(nonce)
    }
}

async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct Pending {
    envelope: Envelope,
    sent_at: Instant,
    attempts: u32,
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

struct SocketTask {
    settings: SignalingSettings,
    auth: String,
    epoch: u64,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<TaggedEvent>,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<NetMetrics>,
    /// Sent, not yet acknowledged.
    pending: BTreeMap<u64, Pending>,
    /// Never made it onto a socket.
    backlog: VecDeque<Envelope>,
    recent: VecDeque<(Instant, AccountId, EnvelopeType, u64)>,
}

impl SocketTask {
    async fn run(mut self) {
        let mut backoff = self.settings.reconnect_base;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.connect().await {
                Ok(Some(ws)) => {
                    backoff = self.settings.reconnect_base;
                    self.metrics.set_signaling_connected(true);
                    info!(epoch = self.epoch, "signaling connected");
                    let _ = self.events.send((self.epoch, SignalingEvent::Ready));
                    match self.session(ws).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Dropped(reason) => {
                            warn!(epoch = self.epoch, "signaling dropped: {reason}");
                            self.metrics.set_signaling_error(reason);
                            let _ = self.events.send((self.epoch, SignalingEvent::Disconnected));
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(epoch = self.epoch, "signaling connect failed: {e:#}");
                    self.metrics.set_signaling_error(format!("{e:#}"));
                }
            }
            self.metrics.signaling_reconnect();
            tokio::select! {
                _ = sleep_with_jitter(backoff) => {}
                _ = wait_shutdown(&mut self.shutdown) => break,
            }
            backoff = next_backoff(backoff, self.settings.reconnect_max);
        }
        self.metrics.set_signaling_connected(false);
        debug!(epoch = self.epoch, "signaling task exited");
    }

    async fn connect(&mut self) -> Result<Option<WsStream>> {
        let mut req = self
            .settings
            .ws_url
            .as_str()
            .into_client_request()
            .context("invalid signaling url")?;
        req.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&self.auth).context("invalid authorization header")?,
        );
        tokio::select! {
            res = tokio_tungstenite::connect_async(req) => {
                let (ws, _) = res.context("signaling handshake failed")?;
                Ok(Some(ws))
            }
            _ = wait_shutdown(&mut self.shutdown) => Ok(None),
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut ws_tx, mut ws_rx): (WsSink, WsSource) = ws.split();
        if let Err(e) = self.flush(&mut ws_tx).await {
            return SessionEnd::Dropped(format!("{e:#}"));
        }

        let mut ping = tokio::time::interval(self.settings.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut retry = tokio::time::interval((self.settings.ack_timeout / 2).max(Duration::from_millis(50)));
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_shutdown(&mut self.shutdown) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                out = self.outbound.recv() => {
                    let Some(env) = out else {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = self.transmit(&mut ws_tx, env).await {
                        return SessionEnd::Dropped(format!("{e:#}"));
                    }
                }
                _ = ping.tick() => {
                    let payload = now_ms().to_be_bytes().to_vec();
                    if let Err(e) = ws_tx.send(Message::Ping(payload)).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                _ = retry.tick() => {
                    if let Err(e) = self.retry_unacked(&mut ws_tx).await {
                        return SessionEnd::Dropped(format!("{e:#}"));
                    }
                }
                msg = ws_rx.next() => {
                    let msg = match msg {
                        None => return SessionEnd::Dropped("closed by server".to_string()),
                        Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                        Some(Ok(m)) => m,
                    };
                    match msg {
                        Message::Text(text) => {
                            self.metrics.signaling_rx_add(text.len() as u64);
                            if let Err(e) = self.on_text(&mut ws_tx, &text).await {
                                return SessionEnd::Dropped(format!("{e:#}"));
                            }
                        }
                        Message::Pong(p) => {
                            if p.len() == 8 {
                                let mut a = [0u8; 8];
                                a.copy_from_slice(&p);
                                self.metrics.signaling_rtt_update(now_ms().saturating_sub(u64::from_be_bytes(a)));
                            }
                        }
                        Message::Ping(p) => {
                            let _ = ws_tx.send(Message::Pong(p)).await;
                        }
                        Message::Close(_) => return SessionEnd::Dropped("closed by server".to_string()),
                        _ => {}
                    }
                }
            }
        }
    }

    async fn write(&self, ws_tx: &mut WsSink, env: &Envelope) -> Result<()> {
        let text = serde_json::to_string(env).context("encode envelope")?;
        let len = text.len() as u64;
        ws_tx.send(Message::Text(text)).await.context("signaling write")?;
        self.metrics.signaling_tx_add(len);
        Ok(())
    }

    async fn transmit(&mut self, ws_tx: &mut WsSink, env: Envelope) -> Result<()> {
        if let Err(e) = self.write(ws_tx, &env).await {
            if !env.is_ack() {
                self.backlog.push_front(env);
            }
            return Err(e);
        }
        if env.is_ack() {
            self.metrics.ack_sent();
            return Ok(());
        }
        self.metrics.envelope_sent();
        if self.settings.ack_max_retries > 0 {
            self.pending.insert(
                env.nonce,
                Pending {
                    envelope: env,
                    sent_at: Instant::now(),
                    attempts: 0,
                },
            );
        }
        Ok(())
    }

    /// Runs right after a (re)connect: unacknowledged envelopes go out again
    /// under their original nonce, then whatever never left.
    async fn flush(&mut self, ws_tx: &mut WsSink) -> Result<()> {
        let nonces: Vec<u64> = self.pending.keys().copied().collect();
        for nonce in nonces {
            let Some(p) = self.pending.get_mut(&nonce) else {
                continue;
            };
            p.sent_at = Instant::now();
            let env = p.envelope.clone();
            self.write(ws_tx, &env).await?;
            self.metrics.envelope_resent();
        }
        while let Some(env) = self.backlog.pop_front() {
            self.transmit(ws_tx, env).await?;
        }
        Ok(())
    }

    async fn retry_unacked(&mut self, ws_tx: &mut WsSink) -> Result<()> {
        let now = Instant::now();
        let due: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) >= self.settings.ack_timeout)
            .map(|(nonce, _)| *nonce)
            .collect();
        for nonce in due {
            let Some(mut p) = self.pending.remove(&nonce) else {
                continue;
            };
            if p.attempts >= self.settings.ack_max_retries {
                warn!(nonce, kind = ?p.envelope.kind, "envelope never acknowledged, giving up");
                self.metrics.envelope_unacked();
                continue;
            }
            p.attempts += 1;
            p.sent_at = now;
            let res = self.write(ws_tx, &p.envelope).await;
            let attempt = p.attempts;
            self.pending.insert(nonce, p);
            res?;
            self.metrics.envelope_resent();
            debug!(nonce, attempt, "envelope resent");
        }
        Ok(())
    }

    async fn on_text(&mut self, ws_tx: &mut WsSink, text: &str) -> Result<()> {
        let env: Envelope = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("dropping malformed envelope: {e}");
                self.metrics.malformed();
                return Ok(());
            }
        };
        if env.is_ack() {
            self.metrics.ack_received();
            if self.pending.remove(&env.nonce).is_none() {
                debug!(nonce = env.nonce, "ack for unknown nonce");
            }
            return Ok(());
        }

        self.transmit(ws_tx, Envelope::ack(env.nonce)).await?;

        let nonce = env.nonce;
        if let Some(from) = env.from_account_id() {
            if self.is_duplicate(from, env.kind, nonce) {
                debug!(nonce, peer_id = from, "duplicate envelope acknowledged and dropped");
                return Ok(());
            }
        }
        match into_event(env) {
            Some(event) => {
                let _ = self.events.send((self.epoch, event));
            }
            None => {
                warn!(nonce, "dropping envelope without sender or payload");
                self.metrics.malformed();
            }
        }
        Ok(())
    }

    /// A peer that resends under the same nonce is delivered once. Only
    /// active while acknowledgement retry is on.
    fn is_duplicate(&mut self, from: AccountId, kind: EnvelopeType, nonce: u64) -> bool {
        if self.settings.ack_max_retries == 0 {
            return false;
        }
        let window = self.settings.ack_timeout * (self.settings.ack_max_retries + 1);
        let now = Instant::now();
        while self
            .recent
            .front()
            .is_some_and(|(t, ..)| now.duration_since(*t) > window)
        {
            self.recent.pop_front();
        }
        if self
            .recent
            .iter()
            .any(|(_, f, k, n)| *f == from && *k == kind && *n == nonce)
        {
            return true;
        }
        self.recent.push_back((now, from, kind, nonce));
        false
    }
}
