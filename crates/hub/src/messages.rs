// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tagged-variant wire messages for all four message families (§6):
//! device→session, session→device, App→session, session→App.
//!
//! Decoding is permissive: unrecognized `type` values fall through to an
//! `Other` variant that retains the raw JSON, rather than failing the whole
//! decode, mirroring the teacher's `events::parse_upstream_message`
//! tolerance for unknown/partial upstream payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Close codes used by this core (§6).
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const PING_TIMEOUT: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Reserved internal code signalling "not available", used to drive App resurrection.
    pub const NOT_AVAILABLE: u16 = 1069;
}

fn now_ms() -> u64 {
    crate::util::epoch_ms()
}

// -- Device -> Session (ingress) ---------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceInbound {
    ConnectionInit {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "livekitRequested", default)]
        livekit_requested: bool,
    },
    GlassesConnectionState {
        status: String,
        #[serde(rename = "modelName", default)]
        model_name: Option<String>,
    },
    Vad {
        status: VadStatus,
    },
    CalendarEvent {
        #[serde(rename = "eventId")]
        event_id: String,
        title: String,
        #[serde(rename = "dtStart")]
        dt_start: String,
        #[serde(rename = "dtEnd", default)]
        dt_end: Option<String>,
        #[serde(default)]
        timezone: Option<String>,
        #[serde(rename = "timeStamp", default)]
        time_stamp: Option<String>,
    },
    LocationUpdate {
        lat: f64,
        lng: f64,
        #[serde(default)]
        accuracy: Option<f64>,
        #[serde(rename = "correlationId", default)]
        correlation_id: Option<String>,
    },
    PhotoResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "photoUrl")]
        photo_url: String,
        #[serde(rename = "savedToGallery")]
        saved_to_gallery: bool,
    },
    RtmpStreamStatus {
        #[serde(rename = "streamId")]
        stream_id: String,
        status: String,
        #[serde(rename = "errorDetails", default)]
        error_details: Option<String>,
        #[serde(default)]
        stats: Option<Value>,
    },
    KeepAliveAck {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "ackId")]
        ack_id: String,
    },
    #[serde(other)]
    Other,
}

/// `vad.status` may arrive as a JSON boolean or as the strings `"true"`/`"false"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadStatus(pub bool);

impl<'de> Deserialize<'de> for VadStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let b = match value {
            Value::Bool(b) => b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };
        Ok(VadStatus(b))
    }
}

// -- Session -> Device (egress) ----------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceOutbound {
    MicrophoneStateChange {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "isMicrophoneEnabled")]
        is_microphone_enabled: bool,
        #[serde(rename = "requiredData")]
        required_data: Vec<&'static str>,
        #[serde(rename = "bypassVad")]
        bypass_vad: bool,
        timestamp: u64,
    },
    StartRtmpStream {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "rtmpUrl")]
        rtmp_url: String,
        #[serde(rename = "appId")]
        app_id: String,
        #[serde(rename = "streamId")]
        stream_id: String,
        video: Value,
        audio: Value,
        stream: Value,
        timestamp: u64,
    },
    KeepRtmpStreamAlive {
        #[serde(rename = "streamId")]
        stream_id: String,
        #[serde(rename = "ackId")]
        ack_id: String,
    },
    StopRtmpStream {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "appId")]
        app_id: String,
        #[serde(rename = "streamId")]
        stream_id: String,
        timestamp: u64,
    },
    PhotoRequest {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "appId")]
        app_id: String,
        #[serde(rename = "webhookUrl")]
        webhook_url: String,
        #[serde(rename = "authToken", skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<String>,
        timestamp: u64,
    },
    SetLocationTier {
        tier: &'static str,
        timestamp: u64,
    },
    RequestSingleLocation {
        accuracy: String,
        #[serde(rename = "correlationId")]
        correlation_id: String,
        timestamp: u64,
    },
    ConnectionError {
        code: &'static str,
        message: String,
        timestamp: u64,
    },
    CapabilitiesUpdate {
        capabilities: Value,
        #[serde(rename = "modelName")]
        model_name: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        timestamp: u64,
    },
}

// -- App -> Session (ingress) -------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppInbound {
    AppConnectionInit {
        #[serde(rename = "packageName")]
        package_name: String,
        #[serde(rename = "apiKey")]
        api_key: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    SubscriptionUpdate {
        subscriptions: Vec<SubscriptionRequest>,
    },
    PhotoRequest {
        #[serde(rename = "packageName")]
        package_name: String,
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "saveToGallery", default)]
        save_to_gallery: bool,
        #[serde(rename = "customWebhookUrl", default)]
        custom_webhook_url: Option<String>,
        #[serde(rename = "authToken", default)]
        auth_token: Option<String>,
        #[serde(default)]
        size: Option<String>,
    },
    RtmpStreamRequest {
        #[serde(rename = "rtmpUrl")]
        rtmp_url: String,
        #[serde(default)]
        video: Value,
        #[serde(default)]
        audio: Value,
        #[serde(default)]
        stream: Value,
    },
    RtmpStreamStopRequest {
        #[serde(rename = "streamId", default)]
        stream_id: Option<String>,
    },
    AudioPlayRequest {
        #[serde(rename = "requestId")]
        request_id: String,
        url: String,
    },
    AudioPlayResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    ManagedStreamStop {
        #[serde(default)]
        payload: Value,
    },
    #[serde(other)]
    Other,
}

/// One entry of `subscription_update.subscriptions`: a bare stream-key string
/// or a structured `{stream:"location-stream", rate}` record.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionRequest {
    Plain(String),
    LocationWithRate { stream: String, rate: String },
}

// -- Session -> App (egress) --------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppOutbound {
    ConnectionAck {
        #[serde(rename = "sessionId")]
        session_id: String,
        settings: Value,
        #[serde(rename = "augmentosSettings")]
        augmentos_settings: Value,
        capabilities: Value,
        timestamp: u64,
    },
    ConnectionError {
        code: &'static str,
        message: String,
        timestamp: u64,
    },
    DataStream {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "streamType")]
        stream_type: String,
        data: Value,
        timestamp: u64,
    },
    RtmpStreamStatus {
        #[serde(rename = "streamId")]
        stream_id: String,
        status: &'static str,
        #[serde(rename = "errorDetails", skip_serializing_if = "Option::is_none")]
        error_details: Option<String>,
        timestamp: u64,
    },
    PhotoResult {
        #[serde(rename = "requestId")]
        request_id: String,
        success: bool,
        #[serde(rename = "photoUrl", skip_serializing_if = "Option::is_none")]
        photo_url: Option<String>,
        #[serde(rename = "savedToGallery")]
        saved_to_gallery: bool,
        timestamp: u64,
    },
    CapabilitiesUpdate {
        capabilities: Value,
        #[serde(rename = "modelName")]
        model_name: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        timestamp: u64,
    },
    PermissionError {
        message: String,
        details: Vec<PermissionErrorDetail>,
        timestamp: u64,
    },
    AppStopped {
        timestamp: u64,
    },
    /// Legacy settings-broadcast path, kept for back-compat Apps (§4.11).
    AugmentosSettingsUpdate {
        #[serde(rename = "sessionId")]
        session_id: String,
        settings: Value,
        timestamp: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionErrorDetail {
    pub stream: String,
    #[serde(rename = "requiredPermission")]
    pub required_permission: String,
    pub message: String,
}

impl AppOutbound {
    pub fn connection_ack(
        session_id: impl Into<String>,
        settings: Value,
        augmentos_settings: Value,
        capabilities: Value,
    ) -> Self {
        Self::ConnectionAck {
            session_id: session_id.into(),
            settings,
            augmentos_settings,
            capabilities,
            timestamp: now_ms(),
        }
    }

    pub fn connection_error(code: &'static str, message: impl Into<String>) -> Self {
        Self::ConnectionError { code, message: message.into(), timestamp: now_ms() }
    }

    pub fn data_stream(session_id: impl Into<String>, stream_type: impl Into<String>, data: Value) -> Self {
        Self::DataStream {
            session_id: session_id.into(),
            stream_type: stream_type.into(),
            data,
            timestamp: now_ms(),
        }
    }

    pub fn app_stopped() -> Self {
        Self::AppStopped { timestamp: now_ms() }
    }
}

impl DeviceOutbound {
    pub fn connection_error(code: &'static str, message: impl Into<String>) -> Self {
        Self::ConnectionError { code, message: message.into(), timestamp: now_ms() }
    }
}
