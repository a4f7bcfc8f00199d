/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::http_retry::send_with_retry;
use crate::identity::Identity;
use crate::net_metrics::NetMetrics;
use airtap_protocol::{
    ApiErrorBody, ApiErrorCode, CreateAccountRequest, CreateAccountResponse, DiscoverResponse,
    RtcServer, RtcServersResponse,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("account api internal error")]
    Internal,
    #[error("account api rejected the request body")]
    InvalidBody,
    #[error("invalid license key")]
    InvalidLicense,
    #[error("invalid discovery code")]
    InvalidDiscoveryCode,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("unexpected http status {status}")]
    Http { status: u16 },
    #[error("account api unreachable: {0}")]
    Transport(String),
    #[error("account api response not understood: {0}")]
    Decode(String),
}

impl ApiError {
    /// Code 4: the stored credential is no longer valid and the user must sign in again.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::InvalidCredentials)
    }
}

impl From<ApiErrorCode> for ApiError {
    fn from(code: ApiErrorCode) -> Self {
        match code {
            ApiErrorCode::Internal => Self::Internal,
            ApiErrorCode::InvalidBody => Self::InvalidBody,
            ApiErrorCode::InvalidLicense => Self::InvalidLicense,
            ApiErrorCode::InvalidDiscoveryCode => Self::InvalidDiscoveryCode,
            ApiErrorCode::InvalidCredentials => Self::InvalidCredentials,
        }
    }
}

fn decode_error(status: StatusCode, body: &str) -> ApiError {
    if let Ok(err) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(code) = ApiErrorCode::from_code(err.code) {
            return code.into();
        }
    }
    if status == StatusCode::UNAUTHORIZED {
        return ApiError::InvalidCredentials;
    }
    ApiError::Http {
        status: status.as_u16(),
    }
}

fn decode_response<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, ApiError> {
    if !status.is_success() {
        return Err(decode_error(status, body));
    }
    serde_json::from_str(body).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Account/licence HTTP API consumed by the core.
#[async_trait]
pub trait AccountApi: Send + Sync {
    async fn create_account(&self, req: CreateAccountRequest) -> Result<CreateAccountResponse, ApiError>;
    async fn discover(&self, identity: &Identity, code: &str) -> Result<DiscoverResponse, ApiError>;
    async fn rtc_servers(&self, identity: &Identity) -> Result<Vec<RtcServer>, ApiError>;
}

pub struct HttpAccountApi {
    base: String,
    http: reqwest::Client,
    metrics: Arc<NetMetrics>,
}

impl HttpAccountApi {
    /// `base` must end with `/`; paths are appended verbatim.
    pub fn new(base: impl Into<String>, http: reqwest::Client, metrics: Arc<NetMetrics>) -> Self {
        Self {
            base: base.into(),
            http,
            metrics,
        }
    }

    async fn finish<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T, ApiError> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let out = decode_response(status, &text);
        if matches!(out, Err(ApiError::InvalidCredentials)) {
            self.metrics.auth_failure();
        }
        out
    }
}

#[async_trait]
impl AccountApi for HttpAccountApi {
    async fn create_account(&self, req: CreateAccountRequest) -> Result<CreateAccountResponse, ApiError> {
        let url = format!("{}account/create", self.base);
        debug!("creating a new account");
        let resp = send_with_retry(|| self.http.post(&url).json(&req), 3, &self.metrics)
            .await
            .map_err(|e| ApiError::Transport(format!("{e:#}")))?;
        self.finish(resp).await
    }

    async fn discover(&self, identity: &Identity, code: &str) -> Result<DiscoverResponse, ApiError> {
        let url = format!(
            "{}account/discover?code={}",
            self.base,
            urlencoding::encode(code.trim())
        );
        debug!(account_id = identity.account_id, "discovering peer by code");
        let auth = identity.basic_auth();
        let resp = send_with_retry(
            || self.http.get(&url).header("Authorization", &auth),
            3,
            &self.metrics,
        )
        .await
        .map_err(|e| ApiError::Transport(format!("{e:#}")))?;
        self.finish(resp).await
    }

    async fn rtc_servers(&self, identity: &Identity) -> Result<Vec<RtcServer>, ApiError> {
        let url = format!("{}rtc/servers", self.base);
        let auth = identity.basic_auth();
        let resp = send_with_retry(
            || self.http.get(&url).header("Authorization", &auth),
            3,
            &self.metrics,
        )
        .await
        .map_err(|e| ApiError::Transport(format!("{e:#}")))?;
        let body: RtcServersResponse = self.finish(resp).await?;
        Ok(body.servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers exactly one HTTP request with the given status line and body,
    /// returning the raw request head.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let join = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(reply.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{addr}/"), join)
    }

    fn api(base: String) -> HttpAccountApi {
        HttpAccountApi::new(base, reqwest::Client::new(), Arc::new(NetMetrics::new()))
    }

    #[test]
    fn error_codes_map_to_variants() {
        let e = decode_error(StatusCode::BAD_REQUEST, r#"{"code":3}"#);
        assert!(matches!(e, ApiError::InvalidDiscoveryCode));
        let e = decode_error(StatusCode::FORBIDDEN, r#"{"error":4}"#);
        assert!(e.is_auth_rejection());
        let e = decode_error(StatusCode::UNAUTHORIZED, "");
        assert!(e.is_auth_rejection());
        let e = decode_error(StatusCode::NOT_FOUND, "nope");
        assert!(matches!(e, ApiError::Http { status: 404 }));
    }

    #[tokio::test]
    async fn discover_sends_basic_auth_and_encoded_code() {
        let (base, req) = serve_once("200 OK", r#"{"accountId":42,"firstName":"Ana"}"#).await;
        let resp = api(base)
            .discover(&Identity::new(7, "tok"), "a b&c")
            .await
            .unwrap();
        assert_eq!(resp.account_id, 42);
        assert_eq!(resp.last_name, None);
        let head = req.await.unwrap();
        assert!(head.starts_with("GET /account/discover?code=a%20b%26c "));
        let expected = Identity::new(7, "tok").basic_auth();
        assert!(head.to_ascii_lowercase().contains(&format!("authorization: {}", expected.to_ascii_lowercase())));
    }

    #[tokio::test]
    async fn rtc_servers_surfaces_invalid_credentials() {
        let (base, _req) = serve_once("403 Forbidden", r#"{"code":4}"#).await;
        let api = api(base);
        let err = api.rtc_servers(&Identity::new(7, "stale")).await.unwrap_err();
        assert!(err.is_auth_rejection());
        assert_eq!(api.metrics.auth_failures.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
