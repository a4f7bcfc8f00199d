/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod api;
pub mod config;
pub mod coordinator;
pub mod http_retry;
pub mod identity;
pub mod link;
pub mod media;
pub mod negotiation;
pub mod net_metrics;
pub mod registry;
pub mod roster_db;
pub mod runtime;
pub mod signaling;
pub mod ui_events;
