// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `Session` (§3, §4): the per-user aggregate root. Holds the device
//! transport and every component manager, wires each manager's
//! `bind_session` back-reference at construction, and is the routing switch
//! for both inbound message families plus the handful of cross-component
//! operations (relay, resurrection-aware App sends) the managers call back
//! into.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock, Weak};

use serde_json::Value;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::AppConnectionManager;
use crate::audio::AudioPipe;
use crate::calendar::{CalendarCache, CalendarEvent};
use crate::capability::DeviceCapabilityManager;
use crate::collaborators::{
    AllowAllPermissionChecker, AnalyticsSink, AppDescriptor, AppStore, CapabilityTable, DisplayManager,
    EffectiveCapabilities, FakeWebhookClient, InMemoryAppStore, NoopAnalyticsSink, NoopDisplayManager,
    NoopTranscriptionSink, NoopTranslationSink, PermissionChecker, RejectedStream, StaticCapabilityTable,
    TranscriptionSink, TranslationSink, UserStore, WebhookClient,
};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::location::{LocationController, NormalizedLocation};
use crate::messages::{close_code, AppInbound, AppOutbound, DeviceInbound, DeviceOutbound, PermissionErrorDetail, SubscriptionRequest};
use crate::microphone::MicrophoneController;
use crate::photo::PhotoRequestRouter;
use crate::registry::Registry;
use crate::settings::UserSettingsBridge;
use crate::subscription::{ApplyOutcome, StreamKey, SubscriptionEngine};
use crate::transport::Transport;
use crate::video::VideoStreamTracker;
use bytes::Bytes;

pub struct Session {
    user_id: String,
    session_id: String,
    start_time: Instant,
    config: HubConfig,
    analytics: Arc<dyn AnalyticsSink>,
    app_store: Arc<dyn AppStore>,

    disposed: AtomicBool,
    device: RwLock<Option<Arc<dyn Transport>>>,
    device_last_activity: StdMutex<Option<Instant>>,
    heartbeat_token: StdMutex<Option<CancellationToken>>,
    device_grace_token: StdMutex<Option<CancellationToken>>,
    registry: OnceLock<Weak<Registry>>,

    pub apps: Arc<AppConnectionManager>,
    pub subscriptions: Arc<SubscriptionEngine>,
    pub microphone: Arc<MicrophoneController>,
    pub audio: Arc<AudioPipe>,
    pub video: Arc<VideoStreamTracker>,
    pub location: Arc<LocationController>,
    pub calendar: Arc<CalendarCache>,
    pub capabilities: Arc<DeviceCapabilityManager>,
    pub settings: Arc<UserSettingsBridge>,
    pub photo: Arc<PhotoRequestRouter>,
}

impl Session {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn started_at(&self) -> Instant {
        self.start_time
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn device_transport(&self) -> Option<Arc<dyn Transport>> {
        self.device.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Completes the async half of construction: loads the settings snapshot
    /// and seeds the location cache. Split from `SessionBuilder::build` so
    /// the builder itself stays synchronous (tests construct a `Session`
    /// without a runtime handoff).
    pub async fn initialize(self: &Arc<Self>) {
        self.settings.load().await;
        self.location.seed_from_store().await;
    }

    /// A device websocket finished its handshake (§4, device heartbeat).
    pub async fn attach_device(self: &Arc<Self>, transport: Arc<dyn Transport>) -> HubResult<()> {
        if self.is_disposed() {
            return Err(HubError::InvalidState("session disposed".into()));
        }
        *self.device.write().unwrap_or_else(|e| e.into_inner()) = Some(transport);
        *self.device_last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        if let Some(token) = self.device_grace_token.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
        self.restart_heartbeat();
        info!(session_id = %self.session_id, "device attached");
        Ok(())
    }

    /// Device transport lost. Starts a reconnect grace window; if it elapses
    /// without a fresh `attach_device`, the session disposes itself.
    pub async fn detach_device(self: &Arc<Self>, reason: &str) {
        *self.device.write().unwrap_or_else(|e| e.into_inner()) = None;
        if let Some(token) = self.heartbeat_token.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
        info!(session_id = %self.session_id, reason, "device transport detached, starting reconnect grace");

        let token = CancellationToken::new();
        *self.device_grace_token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        let this = Arc::downgrade(self);
        let grace = self.config.device_grace();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Some(session) = this.upgrade() {
                        session.dispose("device reconnect grace elapsed").await;
                    }
                }
            }
        });
    }

    fn restart_heartbeat(self: &Arc<Self>) {
        if let Some(old) = self.heartbeat_token.lock().unwrap_or_else(|e| e.into_inner()).take() {
            old.cancel();
        }
        let token = CancellationToken::new();
        *self.heartbeat_token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let this = Arc::downgrade(self);
        let interval = self.config.device_heartbeat_interval();
        let pong_timeout_enabled = self.config.pong_timeout_enabled;
        let pong_timeout = self.config.pong_timeout();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let Some(session) = this.upgrade() else { break };
                        if !pong_timeout_enabled {
                            continue;
                        }
                        let stale = session
                            .device_last_activity
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .map(|t| t.elapsed() > pong_timeout)
                            .unwrap_or(false);
                        if stale {
                            if let Some(transport) = session.device_transport() {
                                transport.close(close_code::PING_TIMEOUT, "device heartbeat timeout");
                            }
                            session.detach_device("heartbeat timeout").await;
                            break;
                        }
                    }
                }
            }
        });
    }

    /// `dispose` (§3, §4): idempotent teardown of every component and the
    /// device/App transports, then deregisters from the registry if bound.
    pub async fn dispose(self: &Arc<Self>, reason: &str) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.session_id, reason, "disposing session");

        if let Some(token) = self.heartbeat_token.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
        if let Some(token) = self.device_grace_token.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }

        self.microphone.dispose();
        self.location.persist_on_dispose().await;

        for package in self.apps.running_packages() {
            let _ = self.apps.stop_app(&package).await;
        }

        if let Some(transport) = self.device_transport() {
            transport.close(close_code::NORMAL, reason);
        }
        *self.device.write().unwrap_or_else(|e| e.into_inner()) = None;

        self.analytics.track(&self.user_id, "session_disposed", serde_json::json!({ "reason": reason })).await;

        if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
            registry.remove(&self.user_id);
        }
    }

    // -- Dispatch -------------------------------------------------------

    /// Route one decoded device→session message (§6).
    pub async fn route_device_message(self: &Arc<Self>, msg: DeviceInbound) {
        *self.device_last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        match msg {
            DeviceInbound::ConnectionInit { .. } => {
                // Handshake/auth happens in the transport driver before a
                // message ever reaches this router.
            }
            DeviceInbound::GlassesConnectionState { status, model_name } => {
                self.capabilities.handle_connection_state(&status, model_name.as_deref()).await;
            }
            DeviceInbound::Vad { status } => {
                debug!(active = status.0, "vad status received");
            }
            DeviceInbound::CalendarEvent { event_id, title, dt_start, dt_end, timezone, time_stamp } => {
                let event = CalendarEvent { event_id, title, dt_start, dt_end, timezone, time_stamp };
                self.calendar.update_event_from_websocket(event, &crate::util::now_iso()).await;
            }
            DeviceInbound::LocationUpdate { lat, lng, accuracy, correlation_id } => {
                let loc = NormalizedLocation { lat, lng, accuracy, timestamp: Instant::now() };
                if loc.is_finite() {
                    self.location.update_from_websocket(loc, correlation_id.as_deref()).await;
                }
            }
            DeviceInbound::PhotoResponse { request_id, photo_url, saved_to_gallery } => {
                self.photo.handle_photo_response(&request_id, &photo_url, saved_to_gallery).await;
            }
            DeviceInbound::RtmpStreamStatus { stream_id, status, error_details, .. } => {
                self.video.on_device_status(&stream_id, &status, error_details).await;
            }
            DeviceInbound::KeepAliveAck { stream_id, ack_id } => {
                self.video.on_keepalive_ack(&stream_id, &ack_id);
            }
            DeviceInbound::Other => {
                debug!("unrecognized device message type, ignoring");
            }
        }
    }

    /// Route one decoded App→session message for `package` (§6).
    pub async fn route_app_message(self: &Arc<Self>, package: &str, msg: AppInbound) {
        match msg {
            AppInbound::AppConnectionInit { .. } => {
                // Handled by the transport driver via `apps.register_connection`.
            }
            AppInbound::SubscriptionUpdate { subscriptions } => {
                if let Some(outcome) = self.subscriptions.apply(package, subscriptions).await {
                    self.subscriptions.notify_rejections(&outcome).await;
                    self.after_subscription_apply(&outcome).await;
                }
            }
            AppInbound::PhotoRequest { package_name, request_id, save_to_gallery, custom_webhook_url, auth_token, size } => {
                if let Err(e) = self
                    .photo
                    .request_photo(&package_name, &request_id, save_to_gallery, custom_webhook_url, auth_token, size)
                    .await
                {
                    warn!(package = %package_name, err = %e, "photo request failed");
                }
            }
            AppInbound::RtmpStreamRequest { rtmp_url, video, audio, stream } => {
                if let Err(e) = self.video.start_rtmp_stream(package, &rtmp_url, video, audio, stream).await {
                    warn!(package, err = %e, "rtmp stream request failed");
                }
            }
            AppInbound::RtmpStreamStopRequest { stream_id } => {
                if let Err(e) = self.video.stop_rtmp_stream(package, stream_id.as_deref()).await {
                    warn!(package, err = %e, "rtmp stream stop request failed");
                }
            }
            AppInbound::AudioPlayRequest { .. } | AppInbound::AudioPlayResponse { .. } | AppInbound::ManagedStreamStop { .. } => {
                // Audio-play/managed-stream relaying belongs to the out-of-scope media subsystem (§1).
            }
            AppInbound::Other => {
                debug!(package, "unrecognized app message type, ignoring");
            }
        }
    }

    /// Post-apply side effects (§4.3): recompute mic/location aggregates and
    /// replay the calendar cache for newly added streams.
    async fn after_subscription_apply(self: &Arc<Self>, outcome: &ApplyOutcome) {
        self.refresh_microphone_aggregates().await;

        if outcome.location_rate.is_some() {
            let subs = self.subscriptions.location_subscriptions().await;
            let newly: Vec<String> = if outcome.newly_added.contains(&StreamKey::LocationStream) {
                vec![outcome.package.clone()]
            } else {
                Vec::new()
            };
            self.location.on_subscription_change(subs, &newly).await;
        }

        if outcome.newly_added.contains(&StreamKey::CalendarEvent) {
            self.calendar.handle_subscription_update(&[outcome.package.clone()]).await;
        }
    }

    pub async fn refresh_microphone_aggregates(self: &Arc<Self>) {
        let has_pcm = !self.subscriptions.apps_needing_pcm().await.is_empty();
        self.microphone.force_refresh(has_pcm, has_pcm).await;
    }

    // -- Cross-component helpers called back into by managers -----------

    pub async fn get_capabilities(&self) -> EffectiveCapabilities {
        self.capabilities.current()
    }

    /// Legacy/back-compat settings view handed to a freshly connected App in
    /// its `connection_ack` (§4.2, §4.11).
    pub async fn get_app_settings_snapshot(&self) -> Value {
        let snapshot = self.settings.snapshot();
        let mut fields = serde_json::Map::new();
        for (key, value) in snapshot.raw {
            fields.insert(key, value);
        }
        fields.insert("metricSystemEnabled".to_owned(), Value::Bool(snapshot.metric_system_enabled));
        if let Some(wearable) = snapshot.default_wearable {
            fields.insert("defaultWearable".to_owned(), Value::String(wearable));
        }
        Value::Object(fields)
    }

    pub async fn app_descriptor(&self, package: &str) -> Option<AppDescriptor> {
        self.app_store.get_app(package).await.ok().flatten()
    }

    pub async fn broadcast_capabilities_to_apps(self: &Arc<Self>, caps: &EffectiveCapabilities) {
        for package in self.apps.running_packages() {
            let msg = AppOutbound::CapabilitiesUpdate {
                capabilities: caps.to_json(),
                model_name: caps.model_name.clone(),
                session_id: self.session_id.clone(),
                timestamp: crate::util::epoch_ms(),
            };
            self.send_to_app_with_resurrection(&package, &msg).await;
        }
    }

    /// Best-effort send to a running App; failures (not running, transport
    /// closed) are logged and swallowed rather than propagated, since
    /// `AppConnectionManager` owns the grace/resurrection lifecycle and will
    /// redeliver state (connection_ack, settings) once the App reconnects.
    pub async fn send_to_app_with_resurrection(&self, package: &str, msg: &AppOutbound) {
        if let Err(e) = self.apps.send_message_to_app(package, msg) {
            debug!(package, err = %e, "app message not delivered");
        }
    }

    pub async fn send_data_stream_to_app(&self, package: &str, stream_type: &str, data: Value) {
        let msg = AppOutbound::data_stream(self.session_id.clone(), stream_type, data);
        self.send_to_app_with_resurrection(package, &msg).await;
    }

    pub async fn send_permission_error(&self, package: &str, rejected: &[RejectedStream]) {
        let details: Vec<PermissionErrorDetail> = rejected
            .iter()
            .map(|r| PermissionErrorDetail {
                stream: r.stream.as_wire_string(),
                required_permission: r.required_permission.clone(),
                message: r.message.clone(),
            })
            .collect();
        let msg = AppOutbound::PermissionError {
            message: "one or more requested streams were rejected".to_owned(),
            details,
            timestamp: crate::util::epoch_ms(),
        };
        self.send_to_app_with_resurrection(package, &msg).await;
    }

    /// Relay a stream update to every App subscribed to `stream_key` (§4.3).
    pub async fn relay_to_apps(&self, stream_key: &str, payload: Value) {
        self.relay_to_apps_filtered(stream_key, payload, None).await;
    }

    /// Same as `relay_to_apps`, skipping `except` (the owning App, which
    /// already received its own direct status push).
    pub async fn relay_to_apps_except(&self, stream_key: &str, payload: Value, except: &str) {
        self.relay_to_apps_filtered(stream_key, payload, Some(except)).await;
    }

    async fn relay_to_apps_filtered(&self, stream_key: &str, payload: Value, except: Option<&str>) {
        let key = StreamKey::parse(stream_key);
        for package in self.subscriptions.get_apps_for(&key).await {
            if Some(package.as_str()) == except {
                continue;
            }
            self.send_data_stream_to_app(&package, stream_key, payload.clone()).await;
        }
    }

    /// Raw PCM fan-out to every App with a PCM-needing subscription (§4.4, §4.5).
    pub async fn relay_audio_to_apps(&self, pcm: Bytes) {
        for package in self.subscriptions.apps_needing_pcm().await {
            let _ = self.apps.send_binary_to_app(&package, pcm.clone());
        }
    }

    pub fn send_to_device(&self, msg: &DeviceOutbound) {
        let Some(transport) = self.device_transport() else { return };
        if !transport.is_open() {
            return;
        }
        let _ = crate::transport::send_device(transport.as_ref(), msg);
    }

    pub fn send_error_to_device(&self, code: &'static str, message: impl Into<String>) {
        self.send_to_device(&DeviceOutbound::connection_error(code, message));
    }
}

/// Builds a `Session` with every component manager wired and bound.
/// Defaults every collaborator to an in-memory/no-op test double; production
/// callers override the ones that matter with `with_*` before `build()`.
pub struct SessionBuilder {
    user_id: String,
    user_store: Arc<dyn UserStore>,
    app_store: Option<Arc<dyn AppStore>>,
    permission_checker: Option<Arc<dyn PermissionChecker>>,
    capability_table: Option<Arc<dyn CapabilityTable>>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    display: Option<Arc<dyn DisplayManager>>,
    transcription: Option<Arc<dyn TranscriptionSink>>,
    translation: Option<Arc<dyn TranslationSink>>,
    webhook_client: Option<Arc<dyn WebhookClient>>,
    config: Option<HubConfig>,
    registry: Option<Arc<Registry>>,
}

impl SessionBuilder {
    pub fn new(user_id: impl Into<String>, user_store: Arc<dyn UserStore>) -> Self {
        Self {
            user_id: user_id.into(),
            user_store,
            app_store: None,
            permission_checker: None,
            capability_table: None,
            analytics: None,
            display: None,
            transcription: None,
            translation: None,
            webhook_client: None,
            config: None,
            registry: None,
        }
    }

    /// Convenience alias used throughout the test suite; identical to `new`.
    pub fn new_test(user_id: impl Into<String>, user_store: Arc<dyn UserStore>) -> Self {
        Self::new(user_id, user_store)
    }

    pub fn with_app_store(mut self, app_store: Arc<dyn AppStore>) -> Self {
        self.app_store = Some(app_store);
        self
    }

    pub fn with_permission_checker(mut self, checker: Arc<dyn PermissionChecker>) -> Self {
        self.permission_checker = Some(checker);
        self
    }

    pub fn with_capability_table(mut self, table: Arc<dyn CapabilityTable>) -> Self {
        self.capability_table = Some(table);
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn with_display(mut self, display: Arc<dyn DisplayManager>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn with_transcription(mut self, sink: Arc<dyn TranscriptionSink>) -> Self {
        self.transcription = Some(sink);
        self
    }

    pub fn with_translation(mut self, sink: Arc<dyn TranslationSink>) -> Self {
        self.translation = Some(sink);
        self
    }

    pub fn with_webhook_client(mut self, client: Arc<dyn WebhookClient>) -> Self {
        self.webhook_client = Some(client);
        self
    }

    pub fn with_config(mut self, config: HubConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Arc<Session> {
        let user_id = self.user_id;
        let config = self.config.unwrap_or_default();
        let app_store = self.app_store.unwrap_or_else(|| Arc::new(InMemoryAppStore::new()) as Arc<dyn AppStore>);
        let user_store = self.user_store;
        let permission_checker =
            self.permission_checker.unwrap_or_else(|| Arc::new(AllowAllPermissionChecker) as Arc<dyn PermissionChecker>);
        let capability_table = self
            .capability_table
            .unwrap_or_else(|| Arc::new(StaticCapabilityTable::with_defaults()) as Arc<dyn CapabilityTable>);
        let analytics = self.analytics.unwrap_or_else(|| Arc::new(NoopAnalyticsSink) as Arc<dyn AnalyticsSink>);
        let display = self.display.unwrap_or_else(|| Arc::new(NoopDisplayManager) as Arc<dyn DisplayManager>);
        let transcription =
            self.transcription.unwrap_or_else(|| Arc::new(NoopTranscriptionSink) as Arc<dyn TranscriptionSink>);
        let translation =
            self.translation.unwrap_or_else(|| Arc::new(NoopTranslationSink) as Arc<dyn TranslationSink>);
        let webhook_client = self.webhook_client.unwrap_or_else(|| Arc::new(FakeWebhookClient::new()) as Arc<dyn WebhookClient>);

        let subscriptions =
            SubscriptionEngine::new(Arc::clone(&app_store), permission_checker, config.subscription_reconnect_grace());
        let apps = AppConnectionManager::new(
            user_id.clone(),
            Arc::clone(&app_store),
            Arc::clone(&webhook_client),
            Arc::clone(&analytics),
            display,
            Arc::clone(&subscriptions),
            config.app_start_deadline(),
            config.webhook_attempts,
            config.webhook_attempt_timeout(),
            config.app_reconnect_grace(),
        );
        let microphone = MicrophoneController::new(
            config.mic_debounce(),
            config.mic_off_holddown(),
            config.subscription_debounce(),
            config.unauthorized_audio_debounce(),
            config.mic_keepalive(),
        );
        let audio = AudioPipe::new(user_id.clone(), transcription, translation, config.ordered_audio_queue_cap, config.ordered_audio_tick());
        let video = VideoStreamTracker::new(config.rtmp_keepalive(), config.rtmp_ack_deadline(), config.rtmp_stream_timeout(), config.rtmp_max_missed_acks);
        let location = LocationController::new(user_id.clone(), Arc::clone(&user_store));
        let calendar = CalendarCache::new();
        let capabilities = DeviceCapabilityManager::new(user_id.clone(), capability_table, Arc::clone(&analytics));
        let settings = UserSettingsBridge::new(user_id.clone(), Arc::clone(&user_store));
        let photo = PhotoRequestRouter::new(user_id.clone(), webhook_client, config.photo_deadline());

        let session = Arc::new(Session {
            user_id,
            session_id: uuid::Uuid::new_v4().to_string(),
            start_time: Instant::now(),
            config,
            analytics,
            app_store,
            disposed: AtomicBool::new(false),
            device: RwLock::new(None),
            device_last_activity: StdMutex::new(None),
            heartbeat_token: StdMutex::new(None),
            device_grace_token: StdMutex::new(None),
            registry: OnceLock::new(),
            apps,
            subscriptions,
            microphone,
            audio,
            video,
            location,
            calendar,
            capabilities,
            settings,
            photo,
        });

        session.apps.bind_session(Arc::downgrade(&session));
        session.subscriptions.bind_session(Arc::downgrade(&session));
        session.microphone.bind_session(Arc::downgrade(&session));
        session.audio.bind_session(Arc::downgrade(&session));
        session.video.bind_session(Arc::downgrade(&session));
        session.location.bind_session(Arc::downgrade(&session));
        session.calendar.bind_session(Arc::downgrade(&session));
        session.capabilities.bind_session(Arc::downgrade(&session));
        session.settings.bind_session(Arc::downgrade(&session));
        session.photo.bind_session(Arc::downgrade(&session));
        session.audio.spawn_ordered_drain();

        if let Some(registry) = self.registry {
            let _ = session.registry.set(Arc::downgrade(&registry));
        }

        session
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
