/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use airtap_protocol::AccountId;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use keyring::Entry;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{info, warn};

const ACCOUNT_ID_KEY: &str = "accountId";
const ACCOUNT_TOKEN_KEY: &str = "accountToken";

/// Account id plus bearer token. Only exists while signed in.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub account_id: AccountId,
    pub credential: String,
}

impl Identity {
    pub fn new(account_id: AccountId, credential: impl Into<String>) -> Self {
        Self {
            account_id,
            credential: credential.into(),
        }
    }

    /// `Authorization` header value shared by the socket handshake and the HTTP API.
    pub fn basic_auth(&self) -> String {
        let raw = format!("{}:{}", self.account_id, self.credential);
        format!("Basic {}", B64.encode(raw.as_bytes()))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("account_id", &self.account_id)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityEvent {
    SignedIn(Identity),
    SignedOut,
}

pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<Identity>>;
    fn save(&self, identity: &Identity) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// OS keychain backed credential store.
pub struct KeyringCredentials {
    service: String,
}

impl KeyringCredentials {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).with_context(|| format!("keyring entry {key}"))
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(v) => Ok(Some(v)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("keyring read {key}")),
        }
    }
}

impl CredentialStore for KeyringCredentials {
    fn load(&self) -> Result<Option<Identity>> {
        let (Some(id), Some(token)) = (self.read(ACCOUNT_ID_KEY)?, self.read(ACCOUNT_TOKEN_KEY)?) else {
            return Ok(None);
        };
        let account_id = id
            .trim()
            .parse::<AccountId>()
            .context("stored account id is not an integer")?;
        Ok(Some(Identity::new(account_id, token)))
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        self.entry(ACCOUNT_ID_KEY)?
            .set_password(&identity.account_id.to_string())
            .context("keyring write accountId")?;
        self.entry(ACCOUNT_TOKEN_KEY)?
            .set_password(&identity.credential)
            .context("keyring write accountToken")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        for key in [ACCOUNT_ID_KEY, ACCOUNT_TOKEN_KEY] {
            match self.entry(key)?.delete_password() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(e) => return Err(e).with_context(|| format!("keyring delete {key}")),
            }
        }
        Ok(())
    }
}

/// In-process credential store. Clones share the same slot.
#[derive(Clone, Default)]
pub struct MemoryCredentials {
    slot: Arc<Mutex<Option<Identity>>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: Identity) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(identity))),
        }
    }

    pub fn stored(&self) -> Option<Identity> {
        self.slot.lock().ok().and_then(|g| g.clone())
    }
}

impl CredentialStore for MemoryCredentials {
    fn load(&self) -> Result<Option<Identity>> {
        Ok(self.stored())
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        if let Ok(mut g) = self.slot.lock() {
            *g = Some(identity.clone());
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if let Ok(mut g) = self.slot.lock() {
            *g = None;
        }
        Ok(())
    }
}

/// Owns the current identity and announces sign-in/sign-out transitions.
/// `SignedOut` is the only teardown trigger in the system.
pub struct IdentityContext {
    store: Box<dyn CredentialStore>,
    current: Option<Identity>,
    events: mpsc::UnboundedSender<IdentityEvent>,
}

impl IdentityContext {
    pub fn new(store: Box<dyn CredentialStore>, events: mpsc::UnboundedSender<IdentityEvent>) -> Self {
        Self {
            store,
            current: None,
            events,
        }
    }

    pub fn current(&self) -> Option<&Identity> {
        self.current.as_ref()
    }

    pub fn account_id(&self) -> Option<AccountId> {
        self.current.as_ref().map(|i| i.account_id)
    }

    /// Restores a persisted identity. Returns true when a sign-in was triggered.
    pub fn load(&mut self) -> bool {
        match self.store.load() {
            Ok(Some(identity)) => {
                self.sign_in(identity.account_id, identity.credential);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("credential load failed: {e:#}");
                false
            }
        }
    }

    pub fn sign_in(&mut self, account_id: AccountId, credential: String) {
        let identity = Identity::new(account_id, credential);
        if self.current.as_ref() == Some(&identity) {
            return;
        }
        if self.current.is_some() {
            self.sign_out();
        }
        info!(account_id, "signing in");
        if let Err(e) = self.store.save(&identity) {
            warn!(account_id, "credential save failed: {e:#}");
        }
        self.current = Some(identity.clone());
        let _ = self.events.send(IdentityEvent::SignedIn(identity));
    }

    /// Returns false (and emits nothing) when already signed out.
    pub fn sign_out(&mut self) -> bool {
        let Some(prev) = self.current.take() else {
            return false;
        };
        info!(account_id = prev.account_id, "signing out");
        if let Err(e) = self.store.clear() {
            warn!("credential clear failed: {e:#}");
        }
        let _ = self.events.send(IdentityEvent::SignedOut);
        true
    }
}
