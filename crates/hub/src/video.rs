// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `VideoStreamTracker` (§4.6): RTMP stream state machine, keep-alive/ACK
//! loop, and timeout policy.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use tokio::time::{Duration, Instant};

use crate::messages::{AppOutbound, DeviceOutbound};
use crate::session::Session;

/// RTMP stream lifecycle state (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initializing,
    Active,
    Stopping,
    Stopped,
    Timeout,
}

impl StreamState {
    /// Maps glasses-reported status strings to internal state; unknown
    /// strings are ignored (§4.6).
    fn from_device_status(status: &str) -> Option<Self> {
        match status {
            "initializing" => Some(Self::Initializing),
            "active" => Some(Self::Active),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Stopped),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Timeout => "timeout",
        }
    }
}

struct StreamRecord {
    owner: String,
    state: StreamState,
    last_activity: Instant,
    pending_ack_id: Option<String>,
    missed_acks: u32,
    keepalive_token: CancellationToken,
}

pub struct VideoStreamTracker {
    session: OnceLock<Weak<Session>>,
    keepalive_interval: Duration,
    ack_deadline: Duration,
    stream_timeout: Duration,
    max_missed_acks: u32,
    streams: RwLock<HashMap<String, StreamRecord>>,
}

impl VideoStreamTracker {
    pub fn new(keepalive_interval: Duration, ack_deadline: Duration, stream_timeout: Duration, max_missed_acks: u32) -> Arc<Self> {
        Arc::new(Self {
            session: OnceLock::new(),
            keepalive_interval,
            ack_deadline,
            stream_timeout,
            max_missed_acks,
            streams: RwLock::new(HashMap::new()),
        })
    }

    pub fn bind_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    /// `startRtmpStream` (§4.6): validate, stop any pre-existing stream for
    /// this user, allocate a stream-id, kick off the device and the
    /// keep-alive loop.
    pub async fn start_rtmp_stream(
        &self,
        owner: &str,
        rtmp_url: &str,
        video: Value,
        audio: Value,
        stream: Value,
    ) -> Result<String, String> {
        if !(rtmp_url.starts_with("rtmp://") || rtmp_url.starts_with("rtmps://")) {
            return Err("rtmp url must start with rtmp:// or rtmps://".to_owned());
        }

        let Some(session) = self.session() else { return Err("session not bound".to_owned()) };
        if !session.apps.is_running(owner) {
            return Err("app is not running".to_owned());
        }
        let Some(device) = session.device_transport() else { return Err("device transport not open".to_owned()) };
        if !device.is_open() {
            return Err("device transport not open".to_owned());
        }

        self.stop_existing_for_user(owner).await;

        let stream_id = Uuid::new_v4().simple().to_string()[..12].to_owned();
        let token = CancellationToken::new();
        {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            streams.insert(
                stream_id.clone(),
                StreamRecord {
                    owner: owner.to_owned(),
                    state: StreamState::Initializing,
                    last_activity: Instant::now(),
                    pending_ack_id: None,
                    missed_acks: 0,
                    keepalive_token: token.clone(),
                },
            );
        }

        let _ = crate::transport::send_device(
            device.as_ref(),
            &DeviceOutbound::StartRtmpStream {
                session_id: session.session_id().to_owned(),
                rtmp_url: rtmp_url.to_owned(),
                app_id: owner.to_owned(),
                stream_id: stream_id.clone(),
                video,
                audio,
                stream,
                timestamp: crate::util::epoch_ms(),
            },
        );

        self.send_status_to_app(&stream_id, owner, StreamState::Initializing, None).await;
        self.spawn_keepalive(stream_id.clone(), token);
        Ok(stream_id)
    }

    /// If the user already has a managed (or unmanaged-but-tracked) stream,
    /// stop it before starting a new one (§4.6: "only one stream at a time").
    async fn stop_existing_for_user(&self, owner: &str) {
        let existing: Vec<String> = self
            .streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, r)| r.owner == owner)
            .map(|(id, _)| id.clone())
            .collect();
        for stream_id in existing {
            self.stop_tracking(&stream_id, owner, true).await;
        }
    }

    /// Device-reported status update (§4.6).
    pub async fn on_device_status(&self, stream_id: &str, status: &str, error_details: Option<String>) {
        let Some(new_state) = StreamState::from_device_status(status) else {
            warn!(stream_id, status, "unknown rtmp status from device, ignoring");
            return;
        };
        if status == "error" {
            warn!(stream_id, error = ?error_details, "rtmp stream reported error");
        }

        let owner = {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            let Some(record) = streams.get_mut(stream_id) else { return };
            record.state = new_state;
            record.last_activity = Instant::now();
            record.owner.clone()
        };

        self.send_status_to_app(stream_id, &owner, new_state, error_details).await;

        if matches!(new_state, StreamState::Stopped | StreamState::Timeout) {
            self.cancel_keepalive(stream_id);
        }
    }

    /// Drives the 15s keep-alive cadence on its own fixed ticker (§4.6):
    /// each tick's ack-deadline wait runs as an independent task so a slow
    /// or absent device ACK never delays the next tick.
    fn spawn_keepalive(&self, stream_id: String, token: CancellationToken) {
        let Some(session) = self.session() else { return };
        let tracker = Arc::clone(&session.video);
        let interval = self.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !tracker.send_keepalive(&stream_id, token.clone()).await {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// One keep-alive tick (§4.6): pings the device and spawns an
    /// independent ack-deadline check for this ack-id. Returns `false` when
    /// the stream should no longer be ticked (stopped, timed out, or
    /// untracked).
    async fn send_keepalive(&self, stream_id: &str, token: CancellationToken) -> bool {
        let still_live = {
            let streams = self.streams.read().unwrap_or_else(|e| e.into_inner());
            streams.get(stream_id).map(|r| matches!(r.state, StreamState::Initializing | StreamState::Active))
        };
        let Some(true) = still_live else {
            self.stop_tracking_untracked(stream_id).await;
            return false;
        };

        let Some(session) = self.session() else { return false };
        let Some(device) = session.device_transport() else { return true };
        if !device.is_open() {
            return true;
        }

        let ack_id = Uuid::new_v4().simple().to_string()[..8].to_owned();
        {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = streams.get_mut(stream_id) {
                record.pending_ack_id = Some(ack_id.clone());
            }
        }

        let _ = crate::transport::send_device(
            device.as_ref(),
            &DeviceOutbound::KeepRtmpStreamAlive { stream_id: stream_id.to_owned(), ack_id: ack_id.clone() },
        );

        let tracker = Arc::clone(&session.video);
        let deadline = self.ack_deadline;
        let stream_id = stream_id.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if !tracker.check_ack_deadline(&stream_id, &ack_id).await {
                token.cancel();
            }
        });

        true
    }

    async fn check_ack_deadline(&self, stream_id: &str, expected_ack_id: &str) -> bool {
        let timed_out = {
            let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
            let Some(record) = streams.get_mut(stream_id) else { return false };
            if record.pending_ack_id.as_deref() != Some(expected_ack_id) {
                // ACK already arrived and cleared this id.
                return true;
            }
            record.pending_ack_id = None;
            record.missed_acks += 1;
            record.last_activity.elapsed() > self.stream_timeout && record.missed_acks >= self.max_missed_acks
        };

        if timed_out {
            let owner = self.owner_of(stream_id);
            self.streams.write().unwrap_or_else(|e| e.into_inner()).remove(stream_id);
            if let Some(owner) = owner {
                self.send_status_to_app(stream_id, &owner, StreamState::Timeout, None).await;
            }
            info!(stream_id, "rtmp stream timed out after repeated missed keep-alive acks");
            return false;
        }
        true
    }

    /// `keep_alive_ack` ingress (§4.6): clears the pending ACK and resets
    /// the missed-ack counter.
    pub fn on_keepalive_ack(&self, stream_id: &str, ack_id: &str) {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        let Some(record) = streams.get_mut(stream_id) else {
            warn!(stream_id, "keep-alive ack for unknown stream, discarding");
            return;
        };
        if record.pending_ack_id.as_deref() != Some(ack_id) {
            warn!(stream_id, ack_id, "unexpected keep-alive ack id, discarding");
            return;
        }
        record.pending_ack_id = None;
        record.missed_acks = 0;
        record.last_activity = Instant::now();
    }

    /// `stopRtmpStream` (§4.6): ownership-checked stop.
    pub async fn stop_rtmp_stream(&self, requester: &str, stream_id: Option<&str>) -> Result<(), String> {
        let target = match stream_id {
            Some(id) => id.to_owned(),
            None => {
                let found = self
                    .streams
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .find(|(_, r)| r.owner == requester)
                    .map(|(id, _)| id.clone());
                match found {
                    Some(id) => id,
                    None => return Ok(()),
                }
            }
        };

        let owner = self.owner_of(&target);
        match owner {
            Some(owner) if owner == requester => {}
            Some(_) => return Err("not the owner of this stream".to_owned()),
            None => return Ok(()),
        }

        self.stop_tracking(&target, requester, false).await;
        Ok(())
    }

    async fn stop_tracking(&self, stream_id: &str, owner: &str, silent: bool) {
        self.cancel_keepalive(stream_id);
        self.streams.write().unwrap_or_else(|e| e.into_inner()).remove(stream_id);

        if silent {
            return;
        }

        if let Some(session) = self.session() {
            if let Some(device) = session.device_transport() {
                if device.is_open() {
                    let _ = crate::transport::send_device(
                        device.as_ref(),
                        &DeviceOutbound::StopRtmpStream {
                            session_id: session.session_id().to_owned(),
                            app_id: owner.to_owned(),
                            stream_id: stream_id.to_owned(),
                            timestamp: crate::util::epoch_ms(),
                        },
                    );
                }
            }
        }
        self.send_status_to_app(stream_id, owner, StreamState::Stopped, None).await;
    }

    async fn stop_tracking_untracked(&self, stream_id: &str) {
        self.cancel_keepalive(stream_id);
        self.streams.write().unwrap_or_else(|e| e.into_inner()).remove(stream_id);
    }

    fn cancel_keepalive(&self, stream_id: &str) {
        if let Some(record) = self.streams.read().unwrap_or_else(|e| e.into_inner()).get(stream_id) {
            record.keepalive_token.cancel();
        }
    }

    fn owner_of(&self, stream_id: &str) -> Option<String> {
        self.streams.read().unwrap_or_else(|e| e.into_inner()).get(stream_id).map(|r| r.owner.clone())
    }

    /// Send status to the owning App directly (with resurrection), and
    /// relay to any other subscribers of `rtmp-stream-status` (§4.6).
    async fn send_status_to_app(&self, stream_id: &str, owner: &str, state: StreamState, error_details: Option<String>) {
        let Some(session) = self.session() else { return };

        let msg = AppOutbound::RtmpStreamStatus {
            stream_id: stream_id.to_owned(),
            status: state.as_wire_str(),
            error_details: error_details.clone(),
            timestamp: crate::util::epoch_ms(),
        };
        session.send_to_app_with_resurrection(owner, &msg).await;

        session
            .relay_to_apps_except(
                "rtmp-stream-status",
                serde_json::json!({ "streamId": stream_id, "status": state.as_wire_str(), "errorDetails": error_details }),
                owner,
            )
            .await;
    }

    pub fn state_of(&self, stream_id: &str) -> Option<StreamState> {
        self.streams.read().unwrap_or_else(|e| e.into_inner()).get(stream_id).map(|r| r.state)
    }
}

#[cfg(test)]
#[path = "video_tests.rs"]
mod tests;
