//! Outbound preparation and inbound classification.
//!
//! `prepare_request` runs once per logical request, before the first send.
//! `classify_response` runs after every send, including the replay, and
//! decides between success, an expired credential that should trigger a
//! refresh, and a terminal error.

use tracing::debug;

use crate::case::{to_local_case, to_wire_case, to_wire_key};
use crate::error::ApiError;
use crate::http::{Attempt, HttpRequest, HttpResponse, RequestBody, AUTHORIZATION};
use crate::payload::Payload;
use crate::token::AccessToken;

/// Status the server uses for a missing, invalid or expired access token.
pub const CREDENTIAL_EXPIRED_STATUS: u16 = 401;

/// A successful response, normalized to local casing.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiEnvelope {
    pub data: Payload,
    pub meta: Option<Payload>,
}

impl ApiEnvelope {
    /// Split a `{data, meta}` body. Bodies without a `data` key are taken
    /// whole as `data`.
    pub fn from_body(mut body: Payload) -> Self {
        match body.take("data") {
            Some(data) => {
                let meta = body.take("meta");
                Self { data, meta }
            }
            None => Self {
                data: body,
                meta: None,
            },
        }
    }

    /// Decode `data` into a typed value.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        self.data.decode()
    }
}

#[derive(Debug)]
pub enum Outcome {
    Success(ApiEnvelope),
    /// First-attempt 401. Never surfaced to callers.
    CredentialExpired,
    Failed(ApiError),
}

/// Attach the bearer token and convert body and query keys to wire casing.
pub fn prepare_request(mut request: HttpRequest, token: Option<&AccessToken>) -> HttpRequest {
    if let Some(token) = token {
        request.set_header(AUTHORIZATION, token.bearer());
    }
    request.body = request.body.map(|body| match body {
        RequestBody::Json(payload) => RequestBody::Json(to_wire_case(payload)),
        multipart @ RequestBody::Multipart(_) => multipart,
    });
    request.query = request
        .query
        .into_iter()
        .map(|(key, value)| (to_wire_key(&key), value))
        .collect();
    debug!(
        method = %request.method,
        path = %request.path,
        authorized = token.is_some(),
        "request prepared"
    );
    request
}

pub fn classify_response(response: &HttpResponse, attempt: Attempt) -> Outcome {
    if response.is_success() {
        return match parse_body(&response.body) {
            Ok(body) => Outcome::Success(ApiEnvelope::from_body(to_local_case(body))),
            Err(err) => Outcome::Failed(err),
        };
    }
    if response.status == CREDENTIAL_EXPIRED_STATUS {
        return match attempt {
            Attempt::NotAttempted => Outcome::CredentialExpired,
            Attempt::Retried => Outcome::Failed(ApiError::session_expired(
                "credentials rejected after refresh",
            )),
        };
    }
    Outcome::Failed(error_from_response(response))
}

/// Resolve a response without engaging the refresh machinery: a 401 becomes
/// an ordinary validation error. Used by the auth endpoints themselves.
pub fn settle_response(response: &HttpResponse) -> crate::Result<ApiEnvelope> {
    match classify_response(response, Attempt::NotAttempted) {
        Outcome::Success(envelope) => Ok(envelope),
        Outcome::CredentialExpired => Err(error_from_response(response)),
        Outcome::Failed(err) => Err(err),
    }
}

/// Build a `Validation` or `Server` error from a non-2xx response.
pub fn error_from_response(response: &HttpResponse) -> ApiError {
    let body = parse_body(&response.body)
        .map(to_local_case)
        .unwrap_or_else(|_| Payload::String(response.body.clone()));
    let message = server_message(&body).unwrap_or_else(|| {
        ::http::StatusCode::from_u16(response.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("unexpected status")
            .to_string()
    });
    if (400..500).contains(&response.status) {
        ApiError::Validation {
            status: response.status,
            message,
            body,
        }
    } else {
        ApiError::Server {
            status: response.status,
            message,
            body,
        }
    }
}

fn parse_body(raw: &str) -> crate::Result<Payload> {
    if raw.trim().is_empty() {
        return Ok(Payload::Null);
    }
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Payload::from)
        .map_err(|e| ApiError::Deserialization(e.to_string()))
}

/// `message`, then `error.message`, then a string `error`.
fn server_message(body: &Payload) -> Option<String> {
    if let Some(message) = body.get("message").and_then(Payload::as_str) {
        return Some(message.to_string());
    }
    let error = body.get("error")?;
    error
        .get("message")
        .and_then(Payload::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}
