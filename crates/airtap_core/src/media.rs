/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use airtap_protocol::{AccountId, CandidatePayload, RtcServer};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Identifies one underlying media connection. A peer gets a fresh id every
/// time its connection is recreated, so callbacks from a replaced connection
/// can be told apart from the live one.
pub type ConnectionId = u64;

#[derive(Clone, PartialEq, Eq)]
pub struct RelayServer {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("url", &self.url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl From<RtcServer> for RelayServer {
    fn from(s: RtcServer) -> Self {
        Self {
            url: s.url,
            username: s.username,
            password: s.password,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaEvent {
    LocalCandidate {
        peer_id: AccountId,
        connection: ConnectionId,
        candidate: CandidatePayload,
    },
    StateChanged {
        peer_id: AccountId,
        connection: ConnectionId,
        state: ConnectionState,
    },
}

/// Remote audio packet handed to the playback collaborator.
#[derive(Clone, Debug)]
pub struct InboundAudio {
    pub peer_id: AccountId,
    pub payload: Bytes,
}

/// The opaque audio/ICE stack. Callbacks are delivered as [`MediaEvent`]s on
/// the channel the engine was built with.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_connection(&self, peer_id: AccountId) -> Result<ConnectionId>;
    async fn close_connection(&self, peer_id: AccountId);
    async fn create_offer(&self, peer_id: AccountId) -> Result<String>;
    async fn set_offer(&self, peer_id: AccountId, sdp: &str) -> Result<()>;
    async fn create_answer(&self, peer_id: AccountId) -> Result<String>;
    async fn set_answer(&self, peer_id: AccountId, sdp: &str) -> Result<()>;
    async fn add_remote_candidate(&self, peer_id: AccountId, candidate: &CandidatePayload) -> Result<()>;
    async fn set_relay_servers(&self, servers: &[RelayServer]);
    /// Silences playback of the peer's inbound audio.
    async fn mute_audio(&self, peer_id: AccountId);
    async fn unmute_audio(&self, peer_id: AccountId);
    /// Stops feeding the local microphone into the peer's outbound track.
    async fn mute_mic(&self, peer_id: AccountId);
    async fn unmute_mic(&self, peer_id: AccountId);
}

struct PeerMedia {
    connection: ConnectionId,
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    mic_enabled: Arc<AtomicBool>,
    playback_muted: Arc<AtomicBool>,
}

pub struct WebrtcMediaEngine {
    api: API,
    peers: Mutex<HashMap<AccountId, PeerMedia>>,
    ice_servers: RwLock<Vec<RTCIceServer>>,
    next_connection: AtomicU64,
    events: mpsc::UnboundedSender<MediaEvent>,
    playback: Option<mpsc::Sender<InboundAudio>>,
}

fn map_state(s: RTCPeerConnectionState) -> ConnectionState {
    match s {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

/// Closes a connection that is not registered yet when `res` failed.
async fn close_on_err<T>(pc: &RTCPeerConnection, res: Result<T, webrtc::Error>, what: &'static str) -> Result<T> {
    match res {
        Ok(v) => Ok(v),
        Err(e) => {
            if let Err(ce) = pc.close().await {
                debug!("close after failed {what}: {ce}");
            }
            Err(anyhow::Error::new(e).context(what))
        }
    }
}

impl WebrtcMediaEngine {
    pub fn new(
        events: mpsc::UnboundedSender<MediaEvent>,
        playback: Option<mpsc::Sender<InboundAudio>>,
    ) -> Result<Self> {
        let mut media = RtcMediaEngine::default();
        media.register_default_codecs().context("register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .context("register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            peers: Mutex::new(HashMap::new()),
            ice_servers: RwLock::new(Vec::new()),
            next_connection: AtomicU64::new(1),
            events,
            playback,
        })
    }

    async fn pc(&self, peer_id: AccountId) -> Result<Arc<RTCPeerConnection>> {
        self.peers
            .lock()
            .await
            .get(&peer_id)
            .map(|p| p.pc.clone())
            .ok_or_else(|| anyhow!("no media connection for peer {peer_id}"))
    }

    /// Feeds one encoded microphone frame to every peer whose microphone is open.
    pub async fn write_microphone_sample(&self, data: Bytes, duration: Duration) {
        let tracks: Vec<Arc<TrackLocalStaticSample>> = {
            let guard = self.peers.lock().await;
            guard
                .values()
                .filter(|p| p.mic_enabled.load(Ordering::Relaxed))
                .map(|p| p.track.clone())
                .collect()
        };
        for track in tracks {
            let sample = Sample {
                data: data.clone(),
                duration,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("mic sample dropped: {e}");
            }
        }
    }

    async fn set_flag(&self, peer_id: AccountId, f: impl FnOnce(&PeerMedia)) {
        if let Some(p) = self.peers.lock().await.get(&peer_id) {
            f(p);
        }
    }

    fn attach_callbacks(&self, peer_id: AccountId, connection: ConnectionId, pc: &RTCPeerConnection, playback_muted: Arc<AtomicBool>) {
        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(cand) = cand else { return };
                match cand.to_json() {
                    Ok(init) => {
                        let candidate = CandidatePayload {
                            sdp: init.candidate,
                            sdp_m_line_index: init.sdp_mline_index.map(i32::from).unwrap_or(0),
                            sdp_mid: init.sdp_mid,
                        };
                        let _ = events.send(MediaEvent::LocalCandidate {
                            peer_id,
                            connection,
                            candidate,
                        });
                    }
                    Err(e) => warn!(peer_id, "candidate encode failed: {e}"),
                }
            })
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let _ = events.send(MediaEvent::StateChanged {
                peer_id,
                connection,
                state: map_state(s),
            });
            Box::pin(async {})
        }));

        let playback = self.playback.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let playback = playback.clone();
                let muted = playback_muted.clone();
                tokio::spawn(async move {
                    while let Ok((pkt, _)) = track.read_rtp().await {
                        if muted.load(Ordering::Relaxed) {
                            continue;
                        }
                        if let Some(tx) = playback.as_ref() {
                            let _ = tx.try_send(InboundAudio {
                                peer_id,
                                payload: pkt.payload,
                            });
                        }
                    }
                });
                Box::pin(async {})
            },
        ));
    }
}

#[async_trait]
impl MediaEngine for WebrtcMediaEngine {
    async fn create_connection(&self, peer_id: AccountId) -> Result<ConnectionId> {
        self.close_connection(peer_id).await;

        let ice_servers = self.ice_servers.read().map(|g| g.clone()).unwrap_or_default();
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers,
                    ..Default::default()
                })
                .await
                .context("new peer connection")?,
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            format!("airtap-{peer_id}"),
        ));
        let added = pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await;
        let sender = close_on_err(&pc, added, "add audio track").await?;
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let playback_muted = Arc::new(AtomicBool::new(false));
        self.attach_callbacks(peer_id, connection, &pc, playback_muted.clone());

        self.peers.lock().await.insert(
            peer_id,
            PeerMedia {
                connection,
                pc,
                track,
                mic_enabled: Arc::new(AtomicBool::new(false)),
                playback_muted,
            },
        );
        debug!(peer_id, connection, "media connection created");
        Ok(connection)
    }

    async fn close_connection(&self, peer_id: AccountId) {
        let Some(peer) = self.peers.lock().await.remove(&peer_id) else {
            return;
        };
        if let Err(e) = peer.pc.close().await {
            warn!(peer_id, connection = peer.connection, "media close failed: {e}");
        }
    }

    async fn create_offer(&self, peer_id: AccountId) -> Result<String> {
        let pc = self.pc(peer_id).await?;
        let offer = pc.create_offer(None).await.context("create offer")?;
        pc.set_local_description(offer.clone())
            .await
            .context("set local offer")?;
        Ok(offer.sdp)
    }

    async fn set_offer(&self, peer_id: AccountId, sdp: &str) -> Result<()> {
        let pc = self.pc(peer_id).await?;
        let desc = RTCSessionDescription::offer(sdp.to_string()).context("parse offer")?;
        pc.set_remote_description(desc).await.context("set remote offer")?;
        Ok(())
    }

    async fn create_answer(&self, peer_id: AccountId) -> Result<String> {
        let pc = self.pc(peer_id).await?;
        let answer = pc.create_answer(None).await.context("create answer")?;
        pc.set_local_description(answer.clone())
            .await
            .context("set local answer")?;
        Ok(answer.sdp)
    }

    async fn set_answer(&self, peer_id: AccountId, sdp: &str) -> Result<()> {
        let pc = self.pc(peer_id).await?;
        let desc = RTCSessionDescription::answer(sdp.to_string()).context("parse answer")?;
        pc.set_remote_description(desc).await.context("set remote answer")?;
        Ok(())
    }

    async fn add_remote_candidate(&self, peer_id: AccountId, candidate: &CandidatePayload) -> Result<()> {
        let pc = self.pc(peer_id).await?;
        pc.add_ice_candidate(RTCIceCandidateInit {
            candidate: candidate.sdp.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: u16::try_from(candidate.sdp_m_line_index).ok(),
            username_fragment: None,
        })
        .await
        .context("add ice candidate")?;
        Ok(())
    }

    async fn set_relay_servers(&self, servers: &[RelayServer]) {
        let list = servers
            .iter()
            .map(|s| RTCIceServer {
                urls: vec![s.url.clone()],
                username: s.username.clone(),
                credential: s.password.clone(),
                ..Default::default()
            })
            .collect::<Vec<_>>();
        if let Ok(mut g) = self.ice_servers.write() {
            *g = list;
        }
    }

    async fn mute_audio(&self, peer_id: AccountId) {
        self.set_flag(peer_id, |p| p.playback_muted.store(true, Ordering::Relaxed)).await;
    }

    async fn unmute_audio(&self, peer_id: AccountId) {
        self.set_flag(peer_id, |p| p.playback_muted.store(false, Ordering::Relaxed)).await;
    }

    async fn mute_mic(&self, peer_id: AccountId) {
        self.set_flag(peer_id, |p| p.mic_enabled.store(false, Ordering::Relaxed)).await;
    }

    async fn unmute_mic(&self, peer_id: AccountId) {
        self.set_flag(peer_id, |p| p.mic_enabled.store(true, Ordering::Relaxed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_server_debug_hides_password() {
        let s = RelayServer::from(RtcServer {
            server_id: 1,
            url: "turn:relay.example:3478".to_string(),
            username: "u".to_string(),
            password: "hunter2".to_string(),
        });
        assert!(!format!("{s:?}").contains("hunter2"));
    }

    #[test]
    fn only_failed_and_closed_are_terminal() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
    }

    #[tokio::test]
    async fn webrtc_engine_produces_an_offer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = WebrtcMediaEngine::new(tx, None).unwrap();
        engine.create_connection(42).await.unwrap();
        let sdp = engine.create_offer(42).await.unwrap();
        assert!(sdp.starts_with("v=0"));
        assert!(sdp.contains("opus"));
        engine.close_connection(42).await;
        assert!(engine.create_offer(42).await.is_err());
    }

    #[tokio::test]
    async fn half_built_connection_is_closed_on_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = WebrtcMediaEngine::new(tx, None).unwrap();
        let pc = engine
            .api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();

        let res = close_on_err(&pc, Err::<(), _>(webrtc::Error::ErrConnectionClosed), "add audio track").await;
        assert!(format!("{:#}", res.unwrap_err()).starts_with("add audio track"));
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::Closed);

        let kept = close_on_err(&pc, Ok(5), "add audio track").await.unwrap();
        assert_eq!(kept, 5);
    }
}
