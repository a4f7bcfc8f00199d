/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::media::{ConnectionId, ConnectionState, MediaEngine, RelayServer};
use airtap_protocol::{AccountId, CandidatePayload};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum SessionState {
    Idle,
    ConnectionCreated,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Closed,
}

impl SessionState {
    fn has_local_description(self) -> bool {
        matches!(self, Self::OfferSent | Self::AnswerExchanged | Self::Connected)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NegotiationSession {
    pub peer_id: AccountId,
    pub role: Role,
    pub state: SessionState,
    pub connection: ConnectionId,
}

/// Per-peer offer/answer state machines over one [`MediaEngine`].
///
/// Every failing step closes the peer's connection and forgets the session,
/// so a session is either fully registered or absent.
pub struct NegotiationEngine {
    media: Arc<dyn MediaEngine>,
    sessions: HashMap<AccountId, NegotiationSession>,
}

impl NegotiationEngine {
    pub fn new(media: Arc<dyn MediaEngine>) -> Self {
        Self {
            media,
            sessions: HashMap::new(),
        }
    }

    /// `Idle` for peers without a session.
    pub fn state(&self, peer_id: AccountId) -> SessionState {
        self.sessions
            .get(&peer_id)
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    pub fn session(&self, peer_id: AccountId) -> Option<&NegotiationSession> {
        self.sessions.get(&peer_id)
    }

    pub fn has_session(&self, peer_id: AccountId) -> bool {
        self.sessions.contains_key(&peer_id)
    }

    pub fn peers(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Connected)
            .count()
    }

    /// True when `connection` is the live connection of `peer_id`'s session.
    pub fn is_current(&self, peer_id: AccountId, connection: ConnectionId) -> bool {
        self.sessions
            .get(&peer_id)
            .is_some_and(|s| s.connection == connection)
    }

    pub async fn set_relay_servers(&self, servers: &[RelayServer]) {
        self.media.set_relay_servers(servers).await;
    }

    /// Starts as offerer. Returns the offer SDP to transmit, or `None` when a
    /// session for the peer already exists.
    pub async fn add_peer(&mut self, peer_id: AccountId) -> Result<Option<String>> {
        if self.sessions.contains_key(&peer_id) {
            debug!(peer_id, "session already present, not offering");
            return Ok(None);
        }
        self.open(peer_id, Role::Offerer).await?;
        match self.media.create_offer(peer_id).await {
            Ok(sdp) => {
                self.transition(peer_id, SessionState::OfferSent);
                info!(peer_id, "offer created");
                Ok(Some(sdp))
            }
            Err(e) => {
                self.discard(peer_id).await;
                Err(e.context(format!("create offer for peer {peer_id}")))
            }
        }
    }

    /// Applies a remote offer and returns the answer SDP to transmit. An offer
    /// that collides with a local description replaces the old connection.
    pub async fn handle_incoming_offer(&mut self, peer_id: AccountId, sdp: &str) -> Result<String> {
        if self
            .sessions
            .get(&peer_id)
            .is_some_and(|s| s.state.has_local_description())
        {
            info!(peer_id, state = ?self.state(peer_id), "offer collision, recreating connection");
            self.discard(peer_id).await;
        }
        match self.sessions.get_mut(&peer_id) {
            Some(s) => s.role = Role::Answerer,
            None => self.open(peer_id, Role::Answerer).await?,
        }

        if let Err(e) = self.media.set_offer(peer_id, sdp).await {
            self.discard(peer_id).await;
            return Err(e.context(format!("apply offer from peer {peer_id}")));
        }
        self.transition(peer_id, SessionState::OfferReceived);

        match self.media.create_answer(peer_id).await {
            Ok(answer) => {
                self.transition(peer_id, SessionState::AnswerExchanged);
                info!(peer_id, "answer created");
                Ok(answer)
            }
            Err(e) => {
                self.discard(peer_id).await;
                Err(e.context(format!("create answer for peer {peer_id}")))
            }
        }
    }

    /// Returns false when the answer was ignored (no session, or not awaiting one).
    pub async fn handle_incoming_answer(&mut self, peer_id: AccountId, sdp: &str) -> Result<bool> {
        let state = self.state(peer_id);
        if state != SessionState::OfferSent {
            debug!(peer_id, ?state, "ignoring answer");
            return Ok(false);
        }
        if let Err(e) = self.media.set_answer(peer_id, sdp).await {
            self.discard(peer_id).await;
            return Err(e.context(format!("apply answer from peer {peer_id}")));
        }
        self.transition(peer_id, SessionState::AnswerExchanged);
        Ok(true)
    }

    /// Forwards regardless of negotiation progress; early candidates are
    /// queued by the media engine.
    pub async fn handle_remote_candidate(&mut self, peer_id: AccountId, candidate: &CandidatePayload) -> Result<bool> {
        if !self.sessions.contains_key(&peer_id) {
            debug!(peer_id, "candidate for unknown peer ignored");
            return Ok(false);
        }
        self.media
            .add_remote_candidate(peer_id, candidate)
            .await
            .with_context(|| format!("add remote candidate for peer {peer_id}"))?;
        Ok(true)
    }

    /// Applies a media connection state change. Returns the resulting session
    /// state when it changed, `Closed` when the session was torn down.
    pub async fn on_connection_state(
        &mut self,
        peer_id: AccountId,
        connection: ConnectionId,
        state: ConnectionState,
    ) -> Option<SessionState> {
        if !self.is_current(peer_id, connection) {
            debug!(peer_id, connection, ?state, "stale connection state ignored");
            return None;
        }
        match state {
            ConnectionState::Connected => {
                if self.state(peer_id) == SessionState::Connected {
                    return None;
                }
                self.transition(peer_id, SessionState::Connected);
                info!(peer_id, "media connected");
                Some(SessionState::Connected)
            }
            s if s.is_terminal() => {
                warn!(peer_id, state = ?s, "media connection lost, closing session");
                self.discard(peer_id).await;
                Some(SessionState::Closed)
            }
            _ => None,
        }
    }

    /// Removing an unknown peer is a no-op.
    pub async fn remove_peer(&mut self, peer_id: AccountId) -> bool {
        self.discard(peer_id).await
    }

    pub async fn close_all(&mut self) -> usize {
        let ids: Vec<AccountId> = self.sessions.keys().copied().collect();
        for id in &ids {
            self.discard(*id).await;
        }
        ids.len()
    }

    pub async fn mute_audio(&self, peer_id: AccountId) {
        self.media.mute_audio(peer_id).await;
    }

    pub async fn unmute_audio(&self, peer_id: AccountId) {
        self.media.unmute_audio(peer_id).await;
    }

    pub async fn mute_mic(&self, peer_id: AccountId) {
        self.media.mute_mic(peer_id).await;
    }

    pub async fn unmute_mic(&self, peer_id: AccountId) {
        self.media.unmute_mic(peer_id).await;
    }

    async fn open(&mut self, peer_id: AccountId, role: Role) -> Result<()> {
        let connection = match self.media.create_connection(peer_id).await {
            Ok(c) => c,
            Err(e) => {
                self.media.close_connection(peer_id).await;
                return Err(e.context(format!("create connection for peer {peer_id}")));
            }
        };
        self.sessions.insert(
            peer_id,
            NegotiationSession {
                peer_id,
                role,
                state: SessionState::ConnectionCreated,
                connection,
            },
        );
        debug!(peer_id, connection, ?role, "connection created");
        Ok(())
    }

    fn transition(&mut self, peer_id: AccountId, next: SessionState) {
        if let Some(s) = self.sessions.get_mut(&peer_id) {
            debug!(peer_id, from = ?s.state, to = ?next, "session transition");
            s.state = next;
        }
    }

    async fn discard(&mut self, peer_id: AccountId) -> bool {
        if self.sessions.remove(&peer_id).is_none() {
            return false;
        }
        self.media.close_connection(peer_id).await;
        debug!(peer_id, "session closed");
        true
    }
}
