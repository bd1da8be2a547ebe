//! Wire types for the consentd IPC protocol.
//!
//! Newline-delimited JSON-RPC-lite: each request is one JSON object with
//! `id`, `method` and optional `params`; each response carries the same
//! `id` and either `result` or `error`.

use std::collections::BTreeMap;

use consent_core::ConsentError;
use consent_core::CookieCategory;
use consent_core::Decision;
use consent_core::EvaluatorState;
use serde::Deserialize;
use serde::Serialize;

// ─────────────────────────────────────────────────────────────────────────────
// Error codes (JSON-RPC error.code)
// ─────────────────────────────────────────────────────────────────────────────

/// Standard JSON-RPC errors.
pub const ERR_INVALID_REQUEST: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;

/// Consent store lookup or update failed.
pub const ERR_CONSENT_STORE: i64 = 200;
/// Evaluator not running, crashed or stopped.
pub const ERR_EVALUATOR_UNAVAILABLE: i64 = 300;
pub const ERR_MALFORMED_REPLY: i64 = 301;
pub const ERR_UNSUPPORTED_QUERY: i64 = 302;
/// Lifecycle request not valid in the evaluator's current state.
pub const ERR_INVALID_TRANSITION: i64 = 303;
pub const ERR_INTERNAL: i64 = 500;

/// Map a decision-path error to its error code.
pub fn error_code(err: &ConsentError) -> i64 {
    match err {
        ConsentError::EvaluatorUnavailable { .. }
        | ConsentError::BinaryNotFound { .. }
        | ConsentError::Launch { .. } => ERR_EVALUATOR_UNAVAILABLE,
        ConsentError::MalformedReply { .. } => ERR_MALFORMED_REPLY,
        ConsentError::UnsupportedQuery { .. } => ERR_UNSUPPORTED_QUERY,
        ConsentError::ConsentStore(_) => ERR_CONSENT_STORE,
        ConsentError::InvalidTransition { .. } => ERR_INVALID_TRANSITION,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: serde_json::Value,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorResponse {
    pub id: serde_json::Value,
    pub error: RpcError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, message)
    }
}

impl From<ConsentError> for RpcError {
    fn from(err: ConsentError) -> Self {
        Self::new(error_code(&err), err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handshake
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloParams {
    pub protocol_version: String,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResult {
    pub protocol_version: String,
    pub service_version: String,
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// consent.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecideParams {
    pub user_id: String,
    pub category: CookieCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecideResult {
    pub user_id: String,
    pub category: CookieCategory,
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiresParams {
    pub category: CookieCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiresResult {
    pub category: CookieCategory,
    pub requires_consent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateParams {
    pub user_id: String,
    pub consent: BTreeMap<CookieCategory, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserParams {
    pub user_id: String,
}

/// Effective consent of one user; every non-essential category is listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentResult {
    pub user_id: String,
    pub found: bool,
    pub consent: BTreeMap<CookieCategory, bool>,
}

// ─────────────────────────────────────────────────────────────────────────────
// cookie.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyParams {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifyResult {
    pub name: String,
    pub category: CookieCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeParams {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizeResult {
    pub total: usize,
    pub counts: BTreeMap<CookieCategory, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeParams {
    pub user_id: String,
    pub category: CookieCategory,
}

// ─────────────────────────────────────────────────────────────────────────────
// evaluator.*
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct EvaluatorStatusResult {
    pub state: EvaluatorState,
    pub ready: bool,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub queue_depth: usize,
    pub uptime_s: u64,
}
