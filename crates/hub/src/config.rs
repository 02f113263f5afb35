// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime configuration for the session hub (§6's environment/config table).

use std::time::Duration;

/// Configuration for the glasshub session core.
#[derive(Debug, Clone, clap::Parser)]
pub struct HubConfig {
    /// Hostname used to build cloud App websocket URLs.
    #[arg(long, default_value = "cloud.glasshub.local", env = "GLASSHUB_PUBLIC_HOST")]
    pub cloud_public_host_name: String,

    /// Device heartbeat interval.
    #[arg(long, default_value_t = 10_000, env = "GLASSHUB_DEVICE_HEARTBEAT_MS")]
    pub device_heartbeat_interval_ms: u64,

    /// App heartbeat interval.
    #[arg(long, default_value_t = 10_000, env = "GLASSHUB_APP_HEARTBEAT_MS")]
    pub app_heartbeat_interval_ms: u64,

    /// Whether missed device pongs close the transport. Off by default (§9 open question).
    #[arg(long, default_value_t = false, env = "GLASSHUB_PONG_TIMEOUT_ENABLED")]
    pub pong_timeout_enabled: bool,

    /// Device pong deadline.
    #[arg(long, default_value_t = 30_000, env = "GLASSHUB_PONG_TIMEOUT_MS")]
    pub pong_timeout_ms: u64,

    /// Total deadline for `AppConnectionManager::start_app`.
    #[arg(long, default_value_t = 5_000, env = "GLASSHUB_APP_START_DEADLINE_MS")]
    pub app_start_deadline_ms: u64,

    /// Max webhook attempts.
    #[arg(long, default_value_t = 2, env = "GLASSHUB_WEBHOOK_ATTEMPTS")]
    pub webhook_attempts: u32,

    /// Per-attempt webhook timeout.
    #[arg(long, default_value_t = 10_000, env = "GLASSHUB_WEBHOOK_ATTEMPT_TIMEOUT_MS")]
    pub webhook_attempt_timeout_ms: u64,

    /// Grace window after `markAppReconnected` during which empty subscription updates
    /// are discarded.
    #[arg(long, default_value_t = 8_000, env = "GLASSHUB_SUBSCRIPTION_RECONNECT_GRACE_MS")]
    pub subscription_reconnect_grace_ms: u64,

    /// Debounce window for subscription-change re-evaluation.
    #[arg(long, default_value_t = 100, env = "GLASSHUB_SUBSCRIPTION_DEBOUNCE_MS")]
    pub subscription_debounce_ms: u64,

    /// Microphone state debounce window.
    #[arg(long, default_value_t = 1_000, env = "GLASSHUB_MIC_DEBOUNCE_MS")]
    pub mic_debounce_ms: u64,

    /// Mic-off holddown after media subscribers drop to zero.
    #[arg(long, default_value_t = 3_000, env = "GLASSHUB_MIC_OFF_HOLDDOWN_MS")]
    pub mic_off_holddown_ms: u64,

    /// Unauthorized-audio suppression window.
    #[arg(long, default_value_t = 5_000, env = "GLASSHUB_UNAUTHORIZED_AUDIO_DEBOUNCE_MS")]
    pub unauthorized_audio_debounce_ms: u64,

    /// Microphone keep-alive resend interval.
    #[arg(long, default_value_t = 10_000, env = "GLASSHUB_MIC_KEEPALIVE_MS")]
    pub mic_keepalive_ms: u64,

    /// RTMP keep-alive tick interval.
    #[arg(long, default_value_t = 15_000, env = "GLASSHUB_RTMP_KEEPALIVE_MS")]
    pub rtmp_keepalive_ms: u64,

    /// RTMP keep-alive ACK deadline.
    #[arg(long, default_value_t = 10_000, env = "GLASSHUB_RTMP_ACK_DEADLINE_MS")]
    pub rtmp_ack_deadline_ms: u64,

    /// RTMP stream inactivity timeout.
    #[arg(long, default_value_t = 60_000, env = "GLASSHUB_RTMP_STREAM_TIMEOUT_MS")]
    pub rtmp_stream_timeout_ms: u64,

    /// Missed ACKs required (together with the inactivity timeout) to time out a stream.
    #[arg(long, default_value_t = 3, env = "GLASSHUB_RTMP_MAX_MISSED_ACKS")]
    pub rtmp_max_missed_acks: u32,

    /// Photo request deadline.
    #[arg(long, default_value_t = 30_000, env = "GLASSHUB_PHOTO_DEADLINE_MS")]
    pub photo_deadline_ms: u64,

    /// Device reconnect grace window before a disposed session is torn down.
    #[arg(long, default_value_t = 60_000, env = "GLASSHUB_DEVICE_GRACE_MS")]
    pub device_grace_ms: u64,

    /// App reconnection grace window after an unexpected transport close.
    #[arg(long, default_value_t = 5_000, env = "GLASSHUB_APP_RECONNECT_GRACE_MS")]
    pub app_reconnect_grace_ms: u64,

    /// Bounded queue depth for the ordered audio-reassembly path.
    #[arg(long, default_value_t = 100, env = "GLASSHUB_ORDERED_AUDIO_QUEUE_CAP")]
    pub ordered_audio_queue_cap: usize,

    /// Ordered audio-reassembly drain tick interval.
    #[arg(long, default_value_t = 100, env = "GLASSHUB_ORDERED_AUDIO_TICK_MS")]
    pub ordered_audio_tick_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            cloud_public_host_name: "cloud.glasshub.local".to_owned(),
            device_heartbeat_interval_ms: 10_000,
            app_heartbeat_interval_ms: 10_000,
            pong_timeout_enabled: false,
            pong_timeout_ms: 30_000,
            app_start_deadline_ms: 5_000,
            webhook_attempts: 2,
            webhook_attempt_timeout_ms: 10_000,
            subscription_reconnect_grace_ms: 8_000,
            subscription_debounce_ms: 100,
            mic_debounce_ms: 1_000,
            mic_off_holddown_ms: 3_000,
            unauthorized_audio_debounce_ms: 5_000,
            mic_keepalive_ms: 10_000,
            rtmp_keepalive_ms: 15_000,
            rtmp_ack_deadline_ms: 10_000,
            rtmp_stream_timeout_ms: 60_000,
            rtmp_max_missed_acks: 3,
            photo_deadline_ms: 30_000,
            device_grace_ms: 60_000,
            app_reconnect_grace_ms: 5_000,
            ordered_audio_queue_cap: 100,
            ordered_audio_tick_ms: 100,
        }
    }
}

macro_rules! duration_accessor {
    ($name:ident, $field:ident) => {
        pub fn $name(&self) -> Duration {
            Duration::from_millis(self.$field)
        }
    };
}

impl HubConfig {
    duration_accessor!(device_heartbeat_interval, device_heartbeat_interval_ms);
    duration_accessor!(app_heartbeat_interval, app_heartbeat_interval_ms);
    duration_accessor!(pong_timeout, pong_timeout_ms);
    duration_accessor!(app_start_deadline, app_start_deadline_ms);
    duration_accessor!(webhook_attempt_timeout, webhook_attempt_timeout_ms);
    duration_accessor!(subscription_reconnect_grace, subscription_reconnect_grace_ms);
    duration_accessor!(subscription_debounce, subscription_debounce_ms);
    duration_accessor!(mic_debounce, mic_debounce_ms);
    duration_accessor!(mic_off_holddown, mic_off_holddown_ms);
    duration_accessor!(unauthorized_audio_debounce, unauthorized_audio_debounce_ms);
    duration_accessor!(mic_keepalive, mic_keepalive_ms);
    duration_accessor!(rtmp_keepalive, rtmp_keepalive_ms);
    duration_accessor!(rtmp_ack_deadline, rtmp_ack_deadline_ms);
    duration_accessor!(rtmp_stream_timeout, rtmp_stream_timeout_ms);
    duration_accessor!(photo_deadline, photo_deadline_ms);
    duration_accessor!(device_grace, device_grace_ms);
    duration_accessor!(app_reconnect_grace, app_reconnect_grace_ms);
    duration_accessor!(ordered_audio_tick, ordered_audio_tick_ms);
}
