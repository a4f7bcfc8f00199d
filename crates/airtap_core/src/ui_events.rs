/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use airtap_protocol::AccountId;
use serde::Serialize;

fn now_ms_u64() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Notification pushed to presentation observers.
///
/// `kind` is one of: `signed_in`, `signed_out`, `account_created`,
/// `peer_added`, `peer_removed`, `peer_muted`, `peer_unmuted`,
/// `peer_speaking`, `peer_silent`, `self_speaking`, `self_silent`,
/// `link_rejected`, `signaling_ready`, `signaling_down`, `media_state`.
#[derive(Clone, Debug, Serialize)]
pub struct UiEvent {
    pub kind: String,
    pub ts_ms: u64,
    pub peer_id: Option<AccountId>,
    pub detail: Option<String>,
}

impl UiEvent {
    pub fn new(kind: &str, peer_id: Option<AccountId>, detail: Option<String>) -> Self {
        Self {
            kind: kind.to_string(),
            ts_ms: now_ms_u64(),
            peer_id,
            detail,
        }
    }

    pub fn peer(kind: &str, peer_id: AccountId) -> Self {
        Self::new(kind, Some(peer_id), None)
    }

    pub fn plain(kind: &str) -> Self {
        Self::new(kind, None, None)
    }
}
