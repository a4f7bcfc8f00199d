/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Serialize};

/// Server-assigned account identifier. Peers are addressed by their account id.
pub type AccountId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    Ack,
    Offer,
    Answer,
    Candidate,
    Info,
}

/// One signaling frame. Sent as a single JSON text message over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EnvelopePayload>,
}

impl Envelope {
    pub fn ack(nonce: u64) -> Self {
        Self {
            kind: EnvelopeType::Ack,
            nonce,
            payload: None,
        }
    }

    pub fn new(kind: EnvelopeType, nonce: u64, payload: EnvelopePayload) -> Self {
        Self {
            kind,
            nonce,
            payload: Some(payload),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.kind == EnvelopeType::Ack
    }

    pub fn from_account_id(&self) -> Option<AccountId> {
        self.payload.as_ref().and_then(|p| p.from_account_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SdpPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SdpPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<CandidatePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<InfoPayload>,
}

impl EnvelopePayload {
    pub fn offer_to(to: AccountId, sdp: String) -> Self {
        Self {
            to_account_id: Some(to),
            offer: Some(SdpPayload { sdp }),
            ..Default::default()
        }
    }

    pub fn answer_to(to: AccountId, sdp: String) -> Self {
        Self {
            to_account_id: Some(to),
            answer: Some(SdpPayload { sdp }),
            ..Default::default()
        }
    }

    pub fn candidate_to(to: AccountId, candidate: CandidatePayload) -> Self {
        Self {
            to_account_id: Some(to),
            candidate: Some(candidate),
            ..Default::default()
        }
    }

    pub fn info_to(to: AccountId, kind: InfoKind) -> Self {
        Self {
            to_account_id: Some(to),
            info: Some(InfoPayload { kind }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

/// ICE candidate as carried on the wire. `sdp` is the candidate line itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub sdp: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: i32,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoKind {
    MicOn,
    MicOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoPayload {
    #[serde(rename = "type")]
    pub kind: InfoKind,
}

// Account API (HTTP).

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub license_key: String,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountResponse {
    pub account_id: AccountId,
    pub shareable_link: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub account_id: AccountId,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcServersResponse {
    #[serde(default)]
    pub servers: Vec<RtcServer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcServer {
    #[serde(default)]
    pub server_id: i64,
    pub url: String,
    pub username: String,
    pub password: String,
}

/// Error body returned by the account API on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(alias = "error")]
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    Internal = 0,
    InvalidBody = 1,
    InvalidLicense = 2,
    InvalidDiscoveryCode = 3,
    InvalidCredentials = 4,
}

impl ApiErrorCode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Internal),
            1 => Some(Self::InvalidBody),
            2 => Some(Self::InvalidLicense),
            3 => Some(Self::InvalidDiscoveryCode),
            4 => Some(Self::InvalidCredentials),
            _ => None,
        }
    }
}
