//! Backend wire format.
//!
//! ```text
//! GET  /global/health            -> { "healthy": bool, "version"?: string }
//! POST /session                  -> { "id": string } | { "error": ... }
//! POST /session/{id}/message     -> { "parts": [{ "type", "text" }] } | { "error": ... }
//! ```
//!
//! Responses are untrusted: every field the backend may omit is optional here,
//! and the client decides what a missing field means.

use serde::{Deserialize, Serialize};

pub const HEALTH_PATH: &str = "/global/health";
pub const SESSION_PATH: &str = "/session";

pub fn message_path(session_id: &str) -> String {
    format!("/session/{session_id}/message")
}

#[derive(Clone, Debug, Deserialize)]
pub struct HealthResponse {
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub version: Option<String>,
}

/// Body of `POST /session`. Unset fields are omitted so the backend applies its defaults.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CreateSessionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Backend errors arrive either as `{"message": ...}` or a bare string.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum BackendError {
    Message { message: String },
    Text(String),
    Other(serde_json::Value),
}

impl BackendError {
    pub fn message(&self) -> String {
        match self {
            BackendError::Message { message } => message.clone(),
            BackendError::Text(text) => text.clone(),
            BackendError::Other(value) => value.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub error: Option<BackendError>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Part {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: Some(text.into()),
        }
    }
}

/// Body of `POST /session/{id}/message`.
#[derive(Clone, Debug, Serialize)]
pub struct MessageRequest {
    pub parts: Vec<Part>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default)]
    pub error: Option<BackendError>,
}

impl MessageResponse {
    /// Text parts in order, joined by newlines. `None` when there are none.
    pub fn text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter(|p| p.kind == "text")
            .filter_map(|p| p.text.as_deref())
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }
}
