/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub struct NetMetrics {
    pub signaling_connected: AtomicBool,
    pub signaling_last_change_ms: AtomicU64,
    pub signaling_reconnects: AtomicU64,
    pub signaling_rx_bytes: AtomicU64,
    pub signaling_tx_bytes: AtomicU64,
    pub signaling_rtt_ema_ms: AtomicU64,
    signaling_last_error: Mutex<Option<String>>,

    pub envelopes_sent: AtomicU64,
    pub envelopes_resent: AtomicU64,
    pub envelopes_unacked: AtomicU64,
    pub acks_received: AtomicU64,
    pub acks_sent: AtomicU64,
    pub malformed_dropped: AtomicU64,

    pub media_sessions: AtomicU64,
    pub media_connected: AtomicU64,

    pub auth_failures: AtomicU64,
    pub http_timeouts: AtomicU64,
    pub http_errors: AtomicU64,
}

impl NetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_signaling_connected(&self, v: bool) {
        self.signaling_connected.store(v, Ordering::Relaxed);
        self.signaling_last_change_ms.store(now_ms(), Ordering::Relaxed);
        if v {
            if let Ok(mut g) = self.signaling_last_error.lock() {
                *g = None;
            }
        }
    }

    pub fn set_signaling_error(&self, err: String) {
        self.set_signaling_connected(false);
        if let Ok(mut g) = self.signaling_last_error.lock() {
            *g = Some(err);
        }
    }

    pub fn signaling_reconnect(&self) {
        self.signaling_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn signaling_rx_add(&self, n: u64) {
        self.signaling_rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn signaling_tx_add(&self, n: u64) {
        self.signaling_tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn signaling_rtt_update(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        let prev = self.signaling_rtt_ema_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            ms
        } else {
            (prev.saturating_mul(7).saturating_add(ms)) / 8
        };
        self.signaling_rtt_ema_ms.store(next, Ordering::Relaxed);
    }

    pub fn envelope_sent(&self) {
        self.envelopes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelope_resent(&self) {
        self.envelopes_resent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelope_unacked(&self) {
        self.envelopes_unacked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) {
        self.malformed_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn media_sessions_set(&self, total: u64, connected: u64) {
        self.media_sessions.store(total, Ordering::Relaxed);
        self.media_connected.store(connected, Ordering::Relaxed);
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_timeout(&self) {
        self.http_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn http_error(&self) {
        self.http_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let last_error = self
            .signaling_last_error
            .lock()
            .ok()
            .and_then(|g| g.clone());
        serde_json::json!({
            "ts_ms": now_ms(),
            "signaling": {
                "connected": self.signaling_connected.load(Ordering::Relaxed),
                "last_change_ms": self.signaling_last_change_ms.load(Ordering::Relaxed),
                "reconnects": self.signaling_reconnects.load(Ordering::Relaxed),
                "rx_bytes": self.signaling_rx_bytes.load(Ordering::Relaxed),
                "tx_bytes": self.signaling_tx_bytes.load(Ordering::Relaxed),
                "rtt_ms": self.signaling_rtt_ema_ms.load(Ordering::Relaxed),
                "last_error": last_error,
            },
            "envelopes": {
                "sent": self.envelopes_sent.load(Ordering::Relaxed),
                "resent": self.envelopes_resent.load(Ordering::Relaxed),
                "unacked": self.envelopes_unacked.load(Ordering::Relaxed),
                "acks_received": self.acks_received.load(Ordering::Relaxed),
                "acks_sent": self.acks_sent.load(Ordering::Relaxed),
                "malformed_dropped": self.malformed_dropped.load(Ordering::Relaxed),
            },
            "media": {
                "sessions": self.media_sessions.load(Ordering::Relaxed),
                "connected": self.media_connected.load(Ordering::Relaxed),
            },
            "errors": {
                "auth_failures": self.auth_failures.load(Ordering::Relaxed),
                "http_timeouts": self.http_timeouts.load(Ordering::Relaxed),
                "http_errors": self.http_errors.load(Ordering::Relaxed),
            },
        })
    }
}
