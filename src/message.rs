//! Messages exchanged between a controller, a session and the bridge owner.
//!
//! Every message is a tagged union on `kind`. Kinds this build does not know
//! decode into an `Unknown` variant instead of failing.

use serde::{Deserialize, Serialize};

/// Controller to session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlRequest {
    GetStatus,
    StartAutomation,
    StopAutomation,
    /// Locate the submit control and report whether it could be pressed.
    /// Never presses it.
    VerifySubmitReady,
    #[serde(other)]
    Unknown,
}

/// Session snapshot answered to `GET_STATUS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub is_running: bool,
    pub step: u8,
    pub identifier: Option<String>,
}

/// Session to controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Status(SessionStatus),
    SubmitReady { ready: bool, detail: String },
    Ack { success: bool },
}

impl ControlResponse {
    pub fn ack(success: bool) -> Self {
        ControlResponse::Ack { success }
    }
}

/// Progress broadcast from a session to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename = "STATUS_UPDATE", rename_all = "camelCase")]
pub struct StatusUpdate {
    pub step: u8,
    pub message: String,
    pub is_error: bool,
}

impl StatusUpdate {
    pub fn info(step: u8, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            is_error: false,
        }
    }

    pub fn error(step: u8, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            is_error: true,
        }
    }
}

/// Session to bridge owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeRequest {
    FillFrameField {
        target: String,
        selector: String,
        value: String,
    },
    DetachBridge {
        target: String,
    },
    #[serde(other)]
    Unknown,
}

/// Bridge owner to session. Failures are values, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn filled(frame_id: String, value: String) -> Self {
        Self {
            success: true,
            frame_id: Some(frame_id),
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}
