/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use airtap_core::config::CoreConfig;
use airtap_core::coordinator::{Command, CoordinatorHandle};
use airtap_core::runtime;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn default_config_path() -> Result<PathBuf> {
    if cfg!(target_os = "windows") {
        let base = std::env::var("APPDATA")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        return Ok(PathBuf::from(base).join("Airtap").join("config.json"));
    }
    if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        return Ok(PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join("Airtap")
            .join("config.json"));
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Ok(PathBuf::from(home).join(".config").join("airtap").join("config.json"))
}

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
            return Err(anyhow::anyhow!("--config requires a path"));
        }
    }
    if let Ok(path) = std::env::var("AIRTAP_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    default_config_path()
}

fn load_config(path: &PathBuf) -> Result<CoreConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).context("decode CoreConfig"),
        Err(e) => {
            warn!("config missing: {} ({e}), using defaults", path.display());
            Ok(CoreConfig::default())
        }
    }
}

/// One command per stdin line.
fn parse_command(line: &str) -> Result<Option<Command>> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let cmd = match verb {
        "sign-in" => {
            let account_id = parts
                .next()
                .context("sign-in <account_id> <token>")?
                .parse()
                .context("account id must be an integer")?;
            let credential = parts.next().context("sign-in <account_id> <token>")?.to_string();
            Command::SignIn {
                account_id,
                credential,
            }
        }
        "sign-out" => Command::SignOut,
        "create" => {
            let license_key = parts.next().context("create <license> <first> [last]")?.to_string();
            let first_name = parts.next().context("create <license> <first> [last]")?.to_string();
            let last_name = parts.next().map(str::to_string);
            Command::CreateAccount {
                license_key,
                first_name,
                last_name,
            }
        }
        "link" => Command::HandleLink(parts.next().context("link <url>")?.to_string()),
        "remove" => Command::RemovePeer(parts.next().context("remove <id>")?.parse()?),
        "mute" => Command::ToggleMute(parts.next().context("mute <id>")?.parse()?),
        "talk" => Command::TalkStart(parts.next().context("talk <index>")?.parse()?),
        "release" => Command::TalkStop(parts.next().context("release <index>")?.parse()?),
        "quit" => Command::Shutdown,
        other => return Err(anyhow::anyhow!("unknown command: {other}")),
    };
    Ok(Some(cmd))
}

async fn print_snapshot(handle: &CoordinatorHandle) {
    match handle.snapshot().await {
        Ok(s) => match serde_json::to_string(&s) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!("snapshot encode failed: {e}"),
        },
        Err(e) => warn!("snapshot failed: {e:#}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    runtime::init_tracing();
    let cfg_path = parse_config_path()?;
    info!("airtap core service starting");
    info!("config: {}", cfg_path.display());

    let cfg = load_config(&cfg_path)?;
    let id = runtime::start(cfg)?;
    let handle = runtime::handle(id).context("core vanished after start")?;

    let mut ui = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(ev) = ui.recv().await {
            if let Ok(json) = serde_json::to_string(&ev) {
                println!("{json}");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        match line.trim() {
            "peers" => print_snapshot(&handle).await,
            "metrics" => {
                if let Some(m) = runtime::metrics_json(id) {
                    println!("{m}");
                }
            }
            text => match parse_command(text) {
                Ok(Some(Command::Shutdown)) => break,
                Ok(Some(cmd)) => handle.send(cmd)?,
                Ok(None) => {}
                Err(e) => warn!("{e:#}"),
            },
        }
    }

    match runtime::stop_and_wait(id, STOP_TIMEOUT).await {
        Ok(true) => info!("core stopped"),
        Ok(false) => warn!("core still closing sessions, exiting anyway"),
        Err(e) => warn!("failed to stop core: {e:#}"),
    }
    Ok(())
}
