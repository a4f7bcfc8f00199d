/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::roster_db::RosterStore;
use airtap_protocol::AccountId;
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct PeerRecord {
    pub id: AccountId,
    pub first_name: String,
    pub last_name: Option<String>,
    pub is_muted: bool,
    pub is_speaking: bool,
}

impl PeerRecord {
    pub fn new(id: AccountId, first_name: impl Into<String>, last_name: Option<String>) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            last_name,
            is_muted: false,
            is_speaking: false,
        }
    }

    pub fn display_name(&self) -> String {
        match self.last_name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RosterEvent {
    PeerAdded(PeerRecord),
    PeerRemoved(AccountId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
    Full,
}

/// In-memory source of truth for known peers, write-through to a [`RosterStore`].
pub struct PeerRegistry {
    store: Box<dyn RosterStore>,
    peers: Vec<PeerRecord>,
    max_peers: Option<usize>,
    events: mpsc::UnboundedSender<RosterEvent>,
}

impl PeerRegistry {
    pub fn new(
        store: Box<dyn RosterStore>,
        max_peers: Option<usize>,
        events: mpsc::UnboundedSender<RosterEvent>,
    ) -> Self {
        Self {
            store,
            peers: Vec::new(),
            max_peers,
            events,
        }
    }

    pub fn peers(&self) -> &[PeerRecord] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: AccountId) -> bool {
        self.peers.iter().any(|p| p.id == id)
    }

    pub fn get(&self, id: AccountId) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn at(&self, index: usize) -> Option<&PeerRecord> {
        self.peers.get(index)
    }

    pub fn has_capacity(&self) -> bool {
        self.max_peers.map(|cap| self.peers.len() < cap).unwrap_or(true)
    }

    /// Replaces the in-memory roster with the stored one and replays every
    /// record as `PeerAdded`.
    pub fn load(&mut self) -> Result<usize> {
        self.release();
        self.peers = self.store.load_all()?;
        for p in &self.peers {
            let _ = self.events.send(RosterEvent::PeerAdded(p.clone()));
        }
        info!(count = self.peers.len(), "roster loaded");
        Ok(self.peers.len())
    }

    pub fn insert(&mut self, record: PeerRecord) -> Result<InsertOutcome> {
        if self.contains(record.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        if !self.has_capacity() {
            return Ok(InsertOutcome::Full);
        }
        self.store.insert(&record)?;
        debug!(peer_id = record.id, "peer inserted");
        self.peers.push(record.clone());
        let _ = self.events.send(RosterEvent::PeerAdded(record));
        Ok(InsertOutcome::Inserted)
    }

    /// Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: AccountId) -> Result<bool> {
        let Some(idx) = self.peers.iter().position(|p| p.id == id) else {
            return Ok(false);
        };
        self.store.delete(id)?;
        self.peers.remove(idx);
        debug!(peer_id = id, "peer removed");
        let _ = self.events.send(RosterEvent::PeerRemoved(id));
        Ok(true)
    }

    /// Drops the in-memory roster, announcing each removal. The store is untouched.
    pub fn release(&mut self) {
        for p in self.peers.drain(..) {
            let _ = self.events.send(RosterEvent::PeerRemoved(p.id));
        }
    }

    /// Releases the roster and erases the store.
    pub fn wipe(&mut self) {
        self.release();
        if let Err(e) = self.store.wipe_all() {
            warn!("roster wipe failed: {e:#}");
        }
    }

    pub fn set_muted(&mut self, id: AccountId, muted: bool) -> Result<bool> {
        let Some(p) = self.peers.iter_mut().find(|p| p.id == id) else {
            return Ok(false);
        };
        self.store.set_muted(id, muted)?;
        p.is_muted = muted;
        Ok(true)
    }

    /// Returns true when the flag actually changed.
    pub fn set_speaking(&mut self, id: AccountId, speaking: bool) -> bool {
        let Some(p) = self.peers.iter_mut().find(|p| p.id == id) else {
            return false;
        };
        if p.is_speaking == speaking {
            return false;
        }
        p.is_speaking = speaking;
        if let Err(e) = self.store.set_speaking(id, speaking) {
            debug!(peer_id = id, "speaking flag not stored: {e:#}");
        }
        true
    }
}
