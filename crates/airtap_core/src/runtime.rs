/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::api::HttpAccountApi;
use crate::config::CoreConfig;
use crate::coordinator::{CoordinatorDeps, CoordinatorHandle, SessionCoordinator};
use crate::identity::KeyringCredentials;
use crate::media::WebrtcMediaEngine;
use crate::net_metrics::NetMetrics;
use crate::roster_db::RosterDb;
use anyhow::{Context, Result};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

static HANDLE_SEQ: AtomicU64 = AtomicU64::new(1);

struct RunningCore {
    shutdown_tx: watch::Sender<bool>,
    join: Option<thread::JoinHandle<()>>,
    handle: CoordinatorHandle,
    metrics: Arc<NetMetrics>,
}

static REGISTRY: Mutex<Vec<(u64, RunningCore)>> = Mutex::new(Vec::new());

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("static directive")),
        )
        .try_init()
        .ok();
}

/// Wires the production collaborators: keychain credentials, the SQLite
/// roster, the WebRTC media engine and the HTTP account API.
pub fn build(cfg: &CoreConfig, metrics: Arc<NetMetrics>) -> Result<(SessionCoordinator, CoordinatorHandle)> {
    let data_dir = cfg.data_dir()?;
    info!("data dir: {}", data_dir.display());
    let roster = RosterDb::open(data_dir.join("airtap.db"))?;
    let credentials = KeyringCredentials::new(cfg.keyring_service());

    let (media_tx, media_rx) = mpsc::unbounded_channel();
    let media = WebrtcMediaEngine::new(media_tx, None).context("init media engine")?;

    let http = reqwest::Client::builder()
        .timeout(cfg.http_timeout())
        .build()
        .context("build http client")?;
    let api = HttpAccountApi::new(cfg.api_base_url(), http, metrics.clone());

    let deps = CoordinatorDeps {
        credentials: Box::new(credentials),
        roster: Box::new(roster),
        media: Arc::new(media),
        media_events: media_rx,
        api: Arc::new(api),
    };
    Ok(SessionCoordinator::new(cfg, deps, metrics))
}

/// Runs the coordinator until it stops on its own or `shutdown` flips to true.
pub async fn serve(
    coordinator: SessionCoordinator,
    handle: CoordinatorHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut task = tokio::spawn(coordinator.run());
    tokio::select! {
        res = &mut task => return res.context("coordinator task panicked")?,
        _ = async {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        } => {}
    }
    let _ = handle.shutdown();
    task.await.context("coordinator task panicked")?
}

/// Starts a core on its own thread and runtime. The returned id addresses it
/// in [`stop`], [`stop_and_wait`], [`handle`] and [`metrics_json`].
pub fn start(cfg: CoreConfig) -> Result<u64> {
    init_tracing();

    let metrics = Arc::new(NetMetrics::new());
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let (coordinator, handle) = {
        let _guard = rt.enter();
        build(&cfg, metrics.clone())?
    };
    Ok(launch(rt, coordinator, handle, metrics))
}

/// Registers an already wired coordinator and drives it on a dedicated
/// thread with `rt`.
pub fn launch(
    rt: tokio::runtime::Runtime,
    coordinator: SessionCoordinator,
    handle: CoordinatorHandle,
    metrics: Arc<NetMetrics>,
) -> u64 {
    let id = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let serve_handle = handle.clone();
    let join = thread::spawn(move || {
        if let Err(e) = rt.block_on(serve(coordinator, serve_handle, shutdown_rx)) {
            error!("core runtime failed: {e:#}");
        }
    });

    let mut reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    reg.push((
        id,
        RunningCore {
            shutdown_tx,
            join: Some(join),
            handle,
            metrics,
        },
    ));
    info!(id, "core started");
    id
}

fn signal_stop(id: u64) -> Result<Option<thread::JoinHandle<()>>> {
    let mut reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    let idx = reg
        .iter()
        .position(|(h, _)| *h == id)
        .context("invalid handle")?;
    let (_, mut running) = reg.swap_remove(idx);
    let _ = running.shutdown_tx.send(true);
    Ok(running.join.take())
}

/// Signals shutdown and returns immediately; the core thread is reaped in
/// the background.
pub fn stop(id: u64) -> Result<()> {
    if let Some(j) = signal_stop(id)? {
        thread::spawn(move || {
            let _ = j.join();
        });
    }
    Ok(())
}

/// Signals shutdown and waits up to `limit` for the core thread to finish
/// closing its sessions. Returns false on timeout.
pub async fn stop_and_wait(id: u64, limit: Duration) -> Result<bool> {
    let Some(j) = signal_stop(id)? else {
        return Ok(true);
    };
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(move || j.join())).await {
        Ok(Ok(Ok(()))) => Ok(true),
        Ok(Ok(Err(_))) => Err(anyhow::anyhow!("core thread panicked")),
        Ok(Err(e)) => Err(anyhow::Error::new(e).context("join core thread")),
        Err(_) => {
            warn!(id, "core did not stop within {}ms", limit.as_millis());
            Ok(false)
        }
    }
}

pub fn handle(id: u64) -> Option<CoordinatorHandle> {
    let reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    reg.iter()
        .find(|(h, _)| *h == id)
        .map(|(_, r)| r.handle.clone())
}

pub fn metrics_json(id: u64) -> Option<serde_json::Value> {
    let reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    reg.iter()
        .find(|(h, _)| *h == id)
        .map(|(_, r)| r.metrics.snapshot_json())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_handle_is_rejected() {
        assert!(stop(u64::MAX).is_err());
        assert!(signal_stop(u64::MAX).is_err());
        assert!(handle(u64::MAX).is_none());
        assert!(metrics_json(u64::MAX).is_none());
    }
}
