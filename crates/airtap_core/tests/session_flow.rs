/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use airtap_core::api::{AccountApi, ApiError};
use airtap_core::config::CoreConfig;
use airtap_core::coordinator::{Command, CoordinatorDeps, CoordinatorHandle, SessionCoordinator};
use airtap_core::identity::{Identity, MemoryCredentials};
use airtap_core::media::{ConnectionId, ConnectionState, MediaEngine, MediaEvent, RelayServer};
use airtap_core::net_metrics::NetMetrics;
use airtap_core::registry::PeerRecord;
use airtap_core::roster_db::MemoryRoster;
use airtap_core::runtime;
use airtap_core::ui_events::UiEvent;
use airtap_protocol::{
    AccountId, CandidatePayload, CreateAccountRequest, CreateAccountResponse, DiscoverResponse, Envelope,
    EnvelopeType, InfoKind, RtcServer,
};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingMedia {
    calls: Mutex<Vec<String>>,
    next_connection: Mutex<ConnectionId>,
}

impl RecordingMedia {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, peer_id: AccountId) -> Vec<String> {
        let suffix = format!(" {peer_id}");
        self.calls()
            .into_iter()
            .filter(|c| c.ends_with(&suffix) || c.contains(&format!("{suffix} ")))
            .collect()
    }
}

#[async_trait]
impl MediaEngine for RecordingMedia {
    async fn create_connection(&self, peer_id: AccountId) -> Result<ConnectionId> {
        self.record(format!("create_connection {peer_id}"));
        let mut next = self.next_connection.lock().unwrap();
        *next += 1;
        Ok(*next)
    }
    async fn close_connection(&self, peer_id: AccountId) {
        self.record(format!("close_connection {peer_id}"));
    }
    async fn create_offer(&self, peer_id: AccountId) -> Result<String> {
        self.record(format!("create_offer {peer_id}"));
        Ok(format!("offer-{peer_id}"))
    }
    async fn set_offer(&self, peer_id: AccountId, sdp: &str) -> Result<()> {
        self.record(format!("set_offer {peer_id} {sdp}"));
        Ok(())
    }
    async fn create_answer(&self, peer_id: AccountId) -> Result<String> {
        self.record(format!("create_answer {peer_id}"));
        Ok(format!("answer-{peer_id}"))
    }
    async fn set_answer(&self, peer_id: AccountId, sdp: &str) -> Result<()> {
        self.record(format!("set_answer {peer_id} {sdp}"));
        Ok(())
    }
    async fn add_remote_candidate(&self, peer_id: AccountId, _candidate: &CandidatePayload) -> Result<()> {
        self.record(format!("add_remote_candidate {peer_id}"));
        Ok(())
    }
    async fn set_relay_servers(&self, servers: &[RelayServer]) {
        self.record(format!("set_relay_servers {}", servers.len()));
    }
    async fn mute_audio(&self, peer_id: AccountId) {
        self.record(format!("mute_audio {peer_id}"));
    }
    async fn unmute_audio(&self, peer_id: AccountId) {
        self.record(format!("unmute_audio {peer_id}"));
    }
    async fn mute_mic(&self, peer_id: AccountId) {
        self.record(format!("mute_mic {peer_id}"));
    }
    async fn unmute_mic(&self, peer_id: AccountId) {
        self.record(format!("unmute_mic {peer_id}"));
    }
}

#[derive(Default)]
struct ScriptedApi {
    reject_credentials: bool,
    discover: Option<(AccountId, &'static str)>,
}

#[async_trait]
impl AccountApi for ScriptedApi {
    async fn create_account(&self, _req: CreateAccountRequest) -> Result<CreateAccountResponse, ApiError> {
        Err(ApiError::InvalidLicense)
    }

    async fn discover(&self, _identity: &Identity, _code: &str) -> Result<DiscoverResponse, ApiError> {
        match self.discover {
            Some((account_id, first_name)) => Ok(DiscoverResponse {
                account_id,
                first_name: first_name.to_string(),
                last_name: None,
            }),
            None => Err(ApiError::InvalidDiscoveryCode),
        }
    }

    async fn rtc_servers(&self, _identity: &Identity) -> Result<Vec<RtcServer>, ApiError> {
        if self.reject_credentials {
            return Err(ApiError::InvalidCredentials);
        }
        Ok(vec![RtcServer {
            server_id: 1,
            url: "turn:relay.test:3478".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        }])
    }
}

struct Harness {
    listener: TcpListener,
    handle: CoordinatorHandle,
    ui: broadcast::Receiver<UiEvent>,
    media: Arc<RecordingMedia>,
    roster: MemoryRoster,
    credentials: MemoryCredentials,
    media_tx: mpsc::UnboundedSender<MediaEvent>,
    task: Option<JoinHandle<Result<()>>>,
}

impl Harness {
    fn media_event(&self, ev: MediaEvent) {
        self.media_tx.send(ev).unwrap();
    }

    async fn stop(self) {
        self.handle.shutdown().unwrap();
        if let Some(task) = self.task {
            timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        }
    }
}

/// Builds a coordinator over fakes without running it.
async fn wire(peers: Vec<PeerRecord>, api: ScriptedApi) -> (SessionCoordinator, Harness) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cfg = CoreConfig {
        ws_url: Some(format!("ws://{}", listener.local_addr().unwrap())),
        ack_max_retries: Some(0),
        reconnect_base_ms: Some(50),
        ..CoreConfig::default()
    };
    let media = Arc::new(RecordingMedia::default());
    let roster = MemoryRoster::with_peers(peers);
    let credentials = MemoryCredentials::new();
    let (media_tx, media_rx) = mpsc::unbounded_channel();
    let deps = CoordinatorDeps {
        credentials: Box::new(credentials.clone()),
        roster: Box::new(roster.clone()),
        media: media.clone(),
        media_events: media_rx,
        api: Arc::new(api),
    };
    let (coordinator, handle) = SessionCoordinator::new(&cfg, deps, Arc::new(NetMetrics::new()));
    let ui = handle.subscribe();
    let harness = Harness {
        listener,
        handle,
        ui,
        media,
        roster,
        credentials,
        media_tx,
        task: None,
    };
    (coordinator, harness)
}

async fn harness(peers: Vec<PeerRecord>, api: ScriptedApi) -> Harness {
    let (coordinator, mut h) = wire(peers, api).await;
    h.task = Some(tokio::spawn(coordinator.run()));
    h
}

/// Signs in with one stored peer (42) and consumes the first offer.
async fn connected_with_peer_42() -> (Harness, WebSocketStream<TcpStream>) {
    let mut h = harness(vec![PeerRecord::new(42, "Ana", None)], ScriptedApi::default()).await;
    h.handle.sign_in(7, "tok").unwrap();
    let (mut ws, _) = accept(&h.listener).await;
    let offer = next_envelope(&mut ws).await;
    assert_eq!((offer.kind, offer.nonce), (EnvelopeType::Offer, 1));
    wait_for(&mut h.ui, "peer_added").await;
    (h, ws)
}

async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, Option<String>) {
    let (sock, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let auth = Arc::new(Mutex::new(None));
    let slot = auth.clone();
    let ws = tokio_tungstenite::accept_hdr_async(sock, move |req: &Request, resp: Response| {
        *slot.lock().unwrap() = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(resp)
    })
    .await
    .unwrap();
    let auth = auth.lock().unwrap().clone();
    (ws, auth)
}

async fn next_envelope(ws: &mut WebSocketStream<TcpStream>) -> Envelope {
    timeout(WAIT, async {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(t) => return serde_json::from_str::<Envelope>(&t).unwrap(),
                _ => continue,
            }
        }
    })
    .await
    .unwrap()
}

async fn no_envelope_within(ws: &mut WebSocketStream<TcpStream>, limit: Duration) {
    let got = timeout(limit, async {
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(t) = msg {
                return Some(t);
            }
        }
        None
    })
    .await;
    assert!(!matches!(got, Ok(Some(_))), "unexpected envelope: {got:?}");
}

async fn push(ws: &mut WebSocketStream<TcpStream>, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

async fn wait_for(ui: &mut broadcast::Receiver<UiEvent>, kind: &str) -> UiEvent {
    timeout(WAIT, async {
        loop {
            let ev = ui.recv().await.unwrap();
            if ev.kind == kind {
                return ev;
            }
        }
    })
    .await
    .unwrap()
}

fn candidate(sdp: &str) -> CandidatePayload {
    CandidatePayload {
        sdp: sdp.to_string(),
        sdp_m_line_index: 0,
        sdp_mid: Some("0".to_string()),
    }
}

#[tokio::test]
async fn sign_in_offers_to_stored_peer() {
    let mut h = harness(vec![PeerRecord::new(42, "Ana", None)], ScriptedApi::default()).await;
    h.handle.sign_in(7, "tok").unwrap();

    let (mut ws, auth) = accept(&h.listener).await;
    assert_eq!(auth, Some(Identity::new(7, "tok").basic_auth()));

    let offer = next_envelope(&mut ws).await;
    assert_eq!(offer.kind, EnvelopeType::Offer);
    assert_eq!(offer.nonce, 1);
    let payload = offer.payload.unwrap();
    assert_eq!(payload.to_account_id, Some(42));
    assert_eq!(payload.offer.unwrap().sdp, "offer-42");

    assert_eq!(h.media.calls_for(42), vec!["create_connection 42", "create_offer 42"]);
    assert!(h.media.calls().contains(&"set_relay_servers 1".to_string()));
    wait_for(&mut h.ui, "peer_added").await;

    h.stop().await;
}

#[tokio::test]
async fn colliding_offer_is_acked_then_answered_on_a_fresh_connection() {
    let (h, mut ws) = connected_with_peer_42().await;

    push(
        &mut ws,
        r#"{"type":"offer","nonce":5,"payload":{"fromAccountId":42,"offer":{"sdp":"v=0 remote"}}}"#,
    )
    .await;

    assert_eq!(next_envelope(&mut ws).await, Envelope::ack(5));
    let answer = next_envelope(&mut ws).await;
    assert_eq!(answer.kind, EnvelopeType::Answer);
    assert_eq!(answer.nonce, 2);
    let payload = answer.payload.unwrap();
    assert_eq!(payload.to_account_id, Some(42));
    assert_eq!(payload.answer.unwrap().sdp, "answer-42");

    assert_eq!(
        h.media.calls_for(42),
        vec![
            "create_connection 42",
            "create_offer 42",
            "close_connection 42",
            "create_connection 42",
            "set_offer 42 v=0 remote",
            "create_answer 42",
        ]
    );
    h.stop().await;
}

#[tokio::test]
async fn removed_peer_loses_its_session_and_cannot_call_back() {
    let (mut h, mut ws) = connected_with_peer_42().await;

    h.handle.send(Command::RemovePeer(42)).unwrap();
    let removed = wait_for(&mut h.ui, "peer_removed").await;
    assert_eq!(removed.peer_id, Some(42));
    assert_eq!(h.media.calls_for(42).last().map(String::as_str), Some("close_connection 42"));
    assert!(h.roster.rows().is_empty());

    push(
        &mut ws,
        r#"{"type":"offer","nonce":9,"payload":{"fromAccountId":42,"offer":{"sdp":"v=0 again"}}}"#,
    )
    .await;
    assert_eq!(next_envelope(&mut ws).await, Envelope::ack(9));
    no_envelope_within(&mut ws, Duration::from_millis(500)).await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.peers.is_empty());
    assert!(snapshot.sessions.is_empty());
    assert!(!h.media.calls().contains(&"set_offer 42 v=0 again".to_string()));
    h.stop().await;
}

#[tokio::test]
async fn local_candidates_are_forwarded_only_from_the_live_connection() {
    let (h, mut ws) = connected_with_peer_42().await;

    h.media_event(MediaEvent::LocalCandidate {
        peer_id: 42,
        connection: 99,
        candidate: candidate("stale"),
    });
    h.media_event(MediaEvent::LocalCandidate {
        peer_id: 42,
        connection: 1,
        candidate: candidate("live"),
    });

    let env = next_envelope(&mut ws).await;
    assert_eq!((env.kind, env.nonce), (EnvelopeType::Candidate, 2));
    let payload = env.payload.unwrap();
    assert_eq!(payload.to_account_id, Some(42));
    assert_eq!(payload.candidate, Some(candidate("live")));
    no_envelope_within(&mut ws, Duration::from_millis(300)).await;
    h.stop().await;
}

#[tokio::test]
async fn failed_media_closes_the_session_and_offers_again() {
    let (mut h, mut ws) = connected_with_peer_42().await;

    h.media_event(MediaEvent::StateChanged {
        peer_id: 42,
        connection: 1,
        state: ConnectionState::Failed,
    });
    let ev = wait_for(&mut h.ui, "media_state").await;
    assert_eq!(ev.detail.as_deref(), Some("Closed"));

    let offer = next_envelope(&mut ws).await;
    assert_eq!((offer.kind, offer.nonce), (EnvelopeType::Offer, 2));
    assert_eq!(offer.payload.unwrap().to_account_id, Some(42));
    assert_eq!(
        h.media.calls_for(42),
        vec![
            "create_connection 42",
            "create_offer 42",
            "close_connection 42",
            "create_connection 42",
            "create_offer 42",
        ]
    );

    // The replaced connection no longer drives the session.
    h.media_event(MediaEvent::StateChanged {
        peer_id: 42,
        connection: 1,
        state: ConnectionState::Closed,
    });
    h.media_event(MediaEvent::StateChanged {
        peer_id: 42,
        connection: 2,
        state: ConnectionState::Connected,
    });
    let ev = wait_for(&mut h.ui, "media_state").await;
    assert_eq!(ev.detail.as_deref(), Some("Connected"));
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.sessions, vec![(42, airtap_core::negotiation::SessionState::Connected)]);
    h.stop().await;
}

#[tokio::test]
async fn toggle_mute_persists_and_silences_playback() {
    let (mut h, _ws) = connected_with_peer_42().await;

    h.handle.send(Command::ToggleMute(42)).unwrap();
    wait_for(&mut h.ui, "peer_muted").await;
    assert!(h.roster.rows()[0].is_muted);
    assert!(h.media.calls().contains(&"mute_audio 42".to_string()));

    h.handle.send(Command::ToggleMute(42)).unwrap();
    wait_for(&mut h.ui, "peer_unmuted").await;
    assert!(!h.roster.rows()[0].is_muted);
    assert!(h.media.calls().contains(&"unmute_audio 42".to_string()));
    h.stop().await;
}

#[tokio::test]
async fn push_to_talk_opens_the_mic_and_tells_the_peer() {
    let (mut h, mut ws) = connected_with_peer_42().await;

    h.handle.send(Command::TalkStart(0)).unwrap();
    let info = next_envelope(&mut ws).await;
    assert_eq!((info.kind, info.nonce), (EnvelopeType::Info, 2));
    let payload = info.payload.unwrap();
    assert_eq!(payload.to_account_id, Some(42));
    assert_eq!(payload.info.unwrap().kind, InfoKind::MicOn);
    wait_for(&mut h.ui, "self_speaking").await;
    assert!(h.handle.snapshot().await.unwrap().self_speaking);

    h.handle.send(Command::TalkStop(0)).unwrap();
    let info = next_envelope(&mut ws).await;
    assert_eq!((info.kind, info.nonce), (EnvelopeType::Info, 3));
    assert_eq!(info.payload.unwrap().info.unwrap().kind, InfoKind::MicOff);
    wait_for(&mut h.ui, "self_silent").await;

    let calls = h.media.calls_for(42);
    let on = calls.iter().position(|c| c == "unmute_mic 42").unwrap();
    let off = calls.iter().position(|c| c == "mute_mic 42").unwrap();
    assert!(on < off);
    h.stop().await;
}

#[tokio::test]
async fn rejected_credentials_force_sign_out_and_wipe() {
    let api = ScriptedApi {
        reject_credentials: true,
        ..ScriptedApi::default()
    };
    let mut h = harness(vec![PeerRecord::new(42, "Ana", None)], api).await;
    h.handle.sign_in(7, "stale").unwrap();

    wait_for(&mut h.ui, "signed_out").await;
    assert!(h.roster.rows().is_empty());
    assert_eq!(h.credentials.stored(), None);

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.account_id, None);
    assert!(snapshot.peers.is_empty());
    assert!(snapshot.sessions.is_empty());
    assert!(!h.media.calls().iter().any(|c| c.starts_with("create_offer")));

    // The socket may or may not have connected before the rejection; either
    // way nothing is ever sent on it.
    if let Ok(Ok((sock, _))) = timeout(Duration::from_millis(300), h.listener.accept()).await {
        if let Ok(mut ws) = tokio_tungstenite::accept_async(sock).await {
            no_envelope_within(&mut ws, Duration::from_millis(300)).await;
        }
    }
    h.stop().await;
}

#[tokio::test]
async fn repeated_sign_out_is_silent() {
    let mut h = harness(Vec::new(), ScriptedApi::default()).await;
    h.handle.sign_in(7, "tok").unwrap();
    wait_for(&mut h.ui, "signed_in").await;

    h.handle.sign_out().unwrap();
    h.handle.sign_out().unwrap();
    h.handle.snapshot().await.unwrap();

    let mut signed_out = 0;
    while let Ok(ev) = h.ui.try_recv() {
        if ev.kind == "signed_out" {
            signed_out += 1;
        }
    }
    assert_eq!(signed_out, 1);
    h.stop().await;
}

#[tokio::test]
async fn discovery_link_adds_peer_and_offers() {
    let api = ScriptedApi {
        discover: Some((42, "Ana")),
        ..ScriptedApi::default()
    };
    let mut h = harness(Vec::new(), api).await;
    h.handle.sign_in(7, "tok").unwrap();
    let (mut ws, _) = accept(&h.listener).await;

    h.handle.handle_link("airtap://discover?code=AB12").unwrap();
    let added = wait_for(&mut h.ui, "peer_added").await;
    assert_eq!(added.peer_id, Some(42));
    assert_eq!(h.roster.rows(), vec![PeerRecord::new(42, "Ana", None)]);

    let offer = next_envelope(&mut ws).await;
    assert_eq!((offer.kind, offer.nonce), (EnvelopeType::Offer, 1));
    assert_eq!(offer.payload.unwrap().to_account_id, Some(42));

    h.handle.handle_link("airtap://discover?code=AB12").unwrap();
    let rejected = wait_for(&mut h.ui, "link_rejected").await;
    assert_eq!(rejected.detail.as_deref(), Some("already known"));
    h.stop().await;
}

#[tokio::test]
async fn mic_info_updates_speaking_flag() {
    let (mut h, mut ws) = connected_with_peer_42().await;

    push(
        &mut ws,
        r#"{"type":"info","nonce":3,"payload":{"fromAccountId":42,"info":{"type":"mic_on"}}}"#,
    )
    .await;
    assert_eq!(next_envelope(&mut ws).await, Envelope::ack(3));
    let ev = wait_for(&mut h.ui, "peer_speaking").await;
    assert_eq!(ev.peer_id, Some(42));

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.peers[0].is_speaking);
    h.stop().await;
}

#[tokio::test]
async fn stopping_a_launched_core_waits_for_sessions_to_close() {
    let (coordinator, h) = wire(vec![PeerRecord::new(42, "Ana", None)], ScriptedApi::default()).await;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let id = runtime::launch(rt, coordinator, h.handle.clone(), Arc::new(NetMetrics::new()));

    runtime::handle(id).unwrap().sign_in(7, "tok").unwrap();
    let (mut ws, _) = accept(&h.listener).await;
    assert_eq!(next_envelope(&mut ws).await.kind, EnvelopeType::Offer);

    assert!(runtime::stop_and_wait(id, WAIT).await.unwrap());
    assert_eq!(h.media.calls().last().map(String::as_str), Some("close_connection 42"));
    assert!(runtime::handle(id).is_none());
}
