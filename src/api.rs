//! Dispatch server API client.
//!
//! Provides authenticated HTTP communication with the admin dashboard:
//! queued-action replay, the connectivity probe used by the network observer,
//! and decoding of the pairing string scanned during driver onboarding.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::TerminalError;
use crate::storage::{self, SessionVault, KEY_DEVICE_ID, KEY_SERVER_URL};

/// Default timeout for replayed requests. The drain loop must never hang on
/// a single action, so every replay is bounded.
const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used for the lightweight connectivity probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the dispatch server URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Pairing string decoding
// ---------------------------------------------------------------------------

fn decode_pairing_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Extract the bearer token from a pairing string (base64url JSON with a
/// `token` field, as emitted by the admin dashboard's driver QR code).
pub fn extract_token_from_pairing_string(raw: &str) -> Option<String> {
    decode_pairing_payload(raw)
        .and_then(|v| {
            v.get("token")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

/// Extract the dispatch server URL from a pairing string.
pub fn extract_server_url_from_pairing_string(raw: &str) -> Option<String> {
    decode_pairing_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_server_url)
        })
        .filter(|s| !s.is_empty())
}

/// Extract the assigned device id from a pairing string.
pub fn extract_device_id_from_pairing_string(raw: &str) -> Option<String> {
    decode_pairing_payload(raw)
        .and_then(|v| {
            v.get("did")
                .or_else(|| v.get("deviceId"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach dispatch server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid dispatch server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session token is invalid or expired".to_string(),
        403 => "Driver not authorized for this operation".to_string(),
        404 => "Dispatch server endpoint not found".to_string(),
        s if s >= 500 => format!("Dispatch server error (HTTP {s})"),
        s => format!("Unexpected response from dispatch server (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Authenticated HTTP client for the dispatch server.
///
/// Base URL and bearer token are resolved from the session vault on every
/// request so re-pairing takes effect without rebuilding the client.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    vault: Arc<dyn SessionVault>,
}

impl ApiClient {
    pub fn new(vault: Arc<dyn SessionVault>) -> Result<Self, TerminalError> {
        let http = Client::builder()
            .timeout(REPLAY_TIMEOUT)
            .connect_timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| TerminalError::Api(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { http, vault })
    }

    fn base_url(&self) -> Result<String, TerminalError> {
        self.vault
            .get(KEY_SERVER_URL)
            .map(|u| normalize_server_url(&u))
            .ok_or_else(|| TerminalError::Api("Dispatch server URL not configured".to_string()))
    }

    /// Replay a queued (or immediate) mutating request against the dispatch
    /// server.
    ///
    /// `endpoint` should include the leading slash, e.g.
    /// `/api/driver/deliveries/42/complete`. `method` must be a mutating
    /// verb: POST, PUT, or PATCH. The action's id doubles as the idempotency
    /// key so the server can deduplicate at-least-once replays.
    pub async fn replay(
        &self,
        method: &str,
        endpoint: &str,
        data: &Value,
        idempotency_key: &str,
    ) -> Result<Value, TerminalError> {
        let base = self.base_url()?;
        let full_url = format!("{base}{endpoint}");

        let http_method = match method.to_uppercase().as_str() {
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            _ => return Err(TerminalError::UnsupportedMethod(method.to_string())),
        };

        // Missing token is a hard failure for this attempt but retryable:
        // the driver may sign in again before the next drain pass.
        let token = storage::bearer_token(self.vault.as_ref()).ok_or(TerminalError::MissingToken)?;
        let device_id = self.vault.get(KEY_DEVICE_ID).unwrap_or_default();

        debug!(method, endpoint, "replaying request against dispatch server");

        let resp = self
            .http
            .request(http_method, &full_url)
            .bearer_auth(token.as_str())
            .header("x-device-id", &device_id)
            .header("X-Idempotency-Key", idempotency_key)
            .header("Content-Type", "application/json")
            .json(data)
            .send()
            .await
            .map_err(|e| TerminalError::Api(friendly_error(&base, &e)))?;

        let status = resp.status();

        if !status.is_success() {
            // Preserve validation details for diagnostics and queue visibility.
            let body_text = resp.text().await.unwrap_or_default();
            let detail = if let Ok(json) = serde_json::from_str::<Value>(&body_text) {
                let message = json
                    .get("error")
                    .or_else(|| json.get("message"))
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| status_error(status));
                let details = json.get("details").or_else(|| json.get("errors")).cloned();
                if let Some(details) = details {
                    format!("{message} (HTTP {}): {}", status.as_u16(), details)
                } else if !body_text.trim().is_empty() && body_text.trim() != message {
                    format!("{message} (HTTP {}): {}", status.as_u16(), body_text.trim())
                } else {
                    format!("{message} (HTTP {})", status.as_u16())
                }
            } else if !body_text.trim().is_empty() {
                format!(
                    "{} (HTTP {}): {}",
                    status_error(status),
                    status.as_u16(),
                    body_text.trim()
                )
            } else {
                format!("{} (HTTP {})", status_error(status), status.as_u16())
            };
            return Err(TerminalError::Api(detail));
        }

        // Return the JSON body, or null for empty 204 responses.
        let body_text = resp.text().await.unwrap_or_default();
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| TerminalError::Api(format!("Invalid JSON from dispatch server: {e}")))
    }

    /// Quick connectivity probe: HEAD request to the server health endpoint.
    /// Returns `false` for any failure, including an unconfigured vault.
    pub async fn probe_health(&self) -> bool {
        let base = match self.base_url() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let health_url = format!("{base}/api/health");

        match self
            .http
            .head(&health_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient").finish_non_exhaustive()
    }
}

/// Store credentials decoded from a pairing string in the vault.
///
/// Accepts either raw base64url or plain JSON. Returns an error when the
/// string carries no usable token/URL pair.
pub fn pair_from_string(vault: &dyn SessionVault, raw: &str) -> Result<(), TerminalError> {
    let token = extract_token_from_pairing_string(raw)
        .ok_or_else(|| TerminalError::Vault("pairing string has no token".to_string()))?;
    let url = extract_server_url_from_pairing_string(raw)
        .ok_or_else(|| TerminalError::Vault("pairing string has no server URL".to_string()))?;

    vault.set(storage::KEY_BEARER_TOKEN, &token)?;
    vault.set(KEY_SERVER_URL, &url)?;
    if let Some(device_id) = extract_device_id_from_pairing_string(raw) {
        vault.set(KEY_DEVICE_ID, &device_id)?;
    } else {
        warn!("pairing string has no device id; keeping existing identity");
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
