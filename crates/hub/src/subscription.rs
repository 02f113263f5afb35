// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `SubscriptionEngine` (§4.3): per-package stream-key sets, permission
//! filtering, reconnect-grace suppression of empty updates, and the
//! aggregate views other managers query on every relevant event.
//!
//! Updates for a single package are serialized through a per-package
//! `tokio::sync::Mutex` rather than a global lock, mirroring the teacher's
//! per-connection state guards in `state.rs` — two concurrent
//! `subscription_update` frames for the same App apply in arrival order
//! without blocking unrelated packages.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use indexmap::IndexSet;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::collaborators::{AppStore, PermissionChecker, RejectedStream};
use crate::location::{LocationSubscription, LocationTier};
use crate::messages::SubscriptionRequest;
use crate::session::Session;

/// A canonicalized subscription stream key (§3, §6).
///
/// Parsed from the wire strings Apps send in `subscription_update`. Unknown
/// strings are retained verbatim as `Other` rather than rejected, consistent
/// with the permissive decoding used throughout (§6).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKey {
    AudioChunk,
    /// Transcription in a given BCP-47 language tag, e.g. `en-US`.
    Transcription(String),
    /// Translation from a source language to a target language.
    Translation { source: String, target: String },
    LocationStream,
    CalendarEvent,
    RtmpStreamStatus,
    /// Subscribes to every stream kind this App is permitted to receive.
    Wildcard,
    /// `augmentos:<key>` — notified when the named user setting changes.
    /// `augmentos:*`/`augmentos:all` subscribe to every setting.
    Setting(String),
    SettingWildcard,
    Other(String),
}

impl StreamKey {
    /// Bare `"transcription"` (no language suffix) implies `en-US` (§4.3).
    pub const DEFAULT_TRANSCRIPTION_LANGUAGE: &'static str = "en-US";

    pub fn parse(raw: &str) -> Self {
        match raw {
            "*" | "all" => Self::Wildcard,
            "audio-chunk" | "audio_chunk" => Self::AudioChunk,
            "location-stream" | "location-update" => Self::LocationStream,
            "calendar-event" | "calendar_event" => Self::CalendarEvent,
            "rtmp-stream-status" | "rtmp_stream_status" => Self::RtmpStreamStatus,
            "transcription" => Self::Transcription(Self::DEFAULT_TRANSCRIPTION_LANGUAGE.to_owned()),
            other => {
                if let Some(lang) = other.strip_prefix("transcription:") {
                    Self::Transcription(lang.to_owned())
                } else if let Some(rest) = other.strip_prefix("translation:") {
                    match rest.split_once("-to-") {
                        Some((source, target)) => {
                            Self::Translation { source: source.to_owned(), target: target.to_owned() }
                        }
                        None => Self::Other(other.to_owned()),
                    }
                } else if let Some(key) = other.strip_prefix("augmentos:") {
                    match key {
                        "*" | "all" => Self::SettingWildcard,
                        key => Self::Setting(key.to_owned()),
                    }
                } else {
                    Self::Other(other.to_owned())
                }
            }
        }
    }

    pub fn as_wire_string(&self) -> String {
        match self {
            Self::AudioChunk => "audio-chunk".to_owned(),
            Self::Transcription(lang) => format!("transcription:{lang}"),
            Self::Translation { source, target } => format!("translation:{source}-to-{target}"),
            Self::LocationStream => "location-stream".to_owned(),
            Self::CalendarEvent => "calendar-event".to_owned(),
            Self::RtmpStreamStatus => "rtmp-stream-status".to_owned(),
            Self::Wildcard => "*".to_owned(),
            Self::Setting(key) => format!("augmentos:{key}"),
            Self::SettingWildcard => "augmentos:*".to_owned(),
            Self::Other(raw) => raw.clone(),
        }
    }

    /// Whether holding this key requires PCM audio to flow from the device (§4.4).
    pub fn needs_pcm(&self) -> bool {
        matches!(self, Self::AudioChunk | Self::Transcription(_) | Self::Translation { .. })
    }

    /// Whether this is a transcription-shaped stream (transcription or translation source leg).
    pub fn is_transcription_like(&self) -> bool {
        matches!(self, Self::Transcription(_) | Self::Translation { .. })
    }

    /// The language this key is scoped to, if any (transcription language, or
    /// translation source language).
    pub fn language(&self) -> Option<&str> {
        match self {
            Self::Transcription(lang) => Some(lang.as_str()),
            Self::Translation { source, .. } => Some(source.as_str()),
            _ => None,
        }
    }
}

impl From<&SubscriptionRequest> for (StreamKey, Option<String>) {
    fn from(req: &SubscriptionRequest) -> Self {
        match req {
            SubscriptionRequest::Plain(raw) => (StreamKey::parse(raw), None),
            SubscriptionRequest::LocationWithRate { stream, rate } => {
                (StreamKey::parse(stream), Some(rate.clone()))
            }
        }
    }
}

/// Outcome of one applied `subscription_update`, handed to `Session` so it
/// can route side effects (mic state, location tier, calendar replay,
/// transcription/translation stream provisioning, permission errors).
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub package: String,
    pub allowed: IndexSet<StreamKey>,
    pub newly_added: Vec<StreamKey>,
    pub rejected: Vec<RejectedStream>,
    /// Present when this update touched `location-stream`, carrying the
    /// requested rate if one was given.
    pub location_rate: Option<Option<LocationTier>>,
}

struct PackageState {
    streams: IndexSet<StreamKey>,
    location_rate: Option<LocationTier>,
    reconnected_at: Option<Instant>,
}

impl PackageState {
    fn new() -> Self {
        Self { streams: IndexSet::new(), location_rate: None, reconnected_at: None }
    }
}

pub struct SubscriptionEngine {
    app_store: Arc<dyn AppStore>,
    permission_checker: Arc<dyn PermissionChecker>,
    reconnect_grace: Duration,
    session: OnceLock<Weak<Session>>,
    packages: RwLock<HashMap<String, Arc<AsyncMutex<PackageState>>>>,
}

impl SubscriptionEngine {
    pub fn new(
        app_store: Arc<dyn AppStore>,
        permission_checker: Arc<dyn PermissionChecker>,
        reconnect_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            app_store,
            permission_checker,
            reconnect_grace,
            session: OnceLock::new(),
            packages: RwLock::new(HashMap::new()),
        })
    }

    pub fn bind_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    fn package_lock(&self, package: &str) -> Arc<AsyncMutex<PackageState>> {
        if let Some(existing) = self.packages.read().unwrap_or_else(|e| e.into_inner()).get(package) {
            return Arc::clone(existing);
        }
        let mut packages = self.packages.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(packages.entry(package.to_owned()).or_insert_with(|| Arc::new(AsyncMutex::new(PackageState::new()))))
    }

    /// `markAppReconnected` (§4.3): opens the grace window during which an
    /// empty `subscription_update` (an App still warming its own state
    /// after a reconnect) is discarded rather than clearing subscriptions.
    pub async fn mark_app_reconnected(&self, package: &str) {
        let lock = self.package_lock(package);
        let mut state = lock.lock().await;
        state.reconnected_at = Some(Instant::now());
    }

    /// Apply a `subscription_update` from `package`. Returns `None` if the
    /// update was an empty-during-grace no-op (nothing to route).
    pub async fn apply(&self, package: &str, requests: Vec<SubscriptionRequest>) -> Option<ApplyOutcome> {
        let lock = self.package_lock(package);
        let mut state = lock.lock().await;

        if requests.is_empty() {
            if let Some(reconnected_at) = state.reconnected_at {
                if reconnected_at.elapsed() <= self.reconnect_grace {
                    debug!(package, "discarding empty subscription update within reconnect grace");
                    return None;
                }
            }
        }

        let app = match self.app_store.get_app(package).await {
            Ok(Some(app)) => app,
            Ok(None) => {
                warn!(package, "subscription update for unknown app");
                return None;
            }
            Err(e) => {
                warn!(package, err = %e, "app store lookup failed during subscription apply");
                return None;
            }
        };

        let mut requested_rate: Option<Option<LocationTier>> = None;
        let mut requested_keys = Vec::with_capacity(requests.len());
        for req in &requests {
            let (key, rate) = <(StreamKey, Option<String>)>::from(req);
            if key == StreamKey::LocationStream {
                requested_rate = Some(rate.as_deref().and_then(LocationTier::parse));
            }
            requested_keys.push(key);
        }

        let outcome = self.permission_checker.check(&app, &requested_keys).await;

        let previous = state.streams.clone();
        state.streams = outcome.allowed.iter().cloned().collect();
        if let Some(rate) = requested_rate {
            state.location_rate = rate;
        }

        let newly_added: Vec<StreamKey> =
            state.streams.iter().filter(|k| !previous.contains(*k)).cloned().collect();

        debug!(
            package,
            allowed = state.streams.len(),
            rejected = outcome.rejected.len(),
            "subscription update applied"
        );

        Some(ApplyOutcome {
            package: package.to_owned(),
            allowed: state.streams.clone(),
            newly_added,
            rejected: outcome.rejected,
            location_rate: requested_rate,
        })
    }

    /// `removeSubscriptions` (§4.2 stopApp): bypasses the reconnect grace —
    /// a stopped App's subscriptions are always cleared immediately.
    pub async fn remove_subscriptions(&self, package: &str) {
        let lock = self.package_lock(package);
        let mut state = lock.lock().await;
        state.streams.clear();
        state.location_rate = None;
        state.reconnected_at = None;
    }

    /// Snapshot of every package's lock, taken under the registry read lock
    /// and released before any individual package lock is awaited, so a
    /// concurrent `apply` on one package never blocks a query touching others.
    fn snapshot_locks(&self) -> Vec<(String, Arc<AsyncMutex<PackageState>>)> {
        self.packages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(p, l)| (p.clone(), Arc::clone(l)))
            .collect()
    }

    pub async fn get_app_subscriptions(&self, package: &str) -> IndexSet<StreamKey> {
        let Some(lock) = self.packages.read().unwrap_or_else(|e| e.into_inner()).get(package).cloned() else {
            return IndexSet::new();
        };
        lock.lock().await.streams.clone()
    }

    pub async fn has_subscription(&self, package: &str, key: &StreamKey) -> bool {
        let subs = self.get_app_subscriptions(package).await;
        subs.contains(key) || subs.contains(&StreamKey::Wildcard)
    }

    pub async fn has_pcm_media(&self, package: &str) -> bool {
        self.get_app_subscriptions(package).await.iter().any(StreamKey::needs_pcm)
    }

    pub async fn has_transcription_media(&self, package: &str) -> bool {
        self.get_app_subscriptions(package).await.iter().any(StreamKey::is_transcription_like)
    }

    /// Every package subscribed to the given key (or to the wildcard).
    pub async fn get_apps_for(&self, key: &StreamKey) -> Vec<String> {
        let mut apps = Vec::new();
        for (package, lock) in self.snapshot_locks() {
            let state = lock.lock().await;
            if state.streams.contains(key) || state.streams.contains(&StreamKey::Wildcard) {
                apps.push(package);
            }
        }
        apps
    }

    pub async fn get_apps_for_setting(&self, setting: &str) -> Vec<String> {
        let target = StreamKey::Setting(setting.to_owned());
        let mut apps = Vec::new();
        for (package, lock) in self.snapshot_locks() {
            let state = lock.lock().await;
            if state.streams.contains(&target)
                || state.streams.contains(&StreamKey::SettingWildcard)
                || state.streams.contains(&StreamKey::Wildcard)
            {
                apps.push(package);
            }
        }
        apps
    }

    /// Every package with at least one PCM-needing subscription.
    pub async fn apps_needing_pcm(&self) -> Vec<String> {
        let mut apps = Vec::new();
        for (package, lock) in self.snapshot_locks() {
            if lock.lock().await.streams.iter().any(StreamKey::needs_pcm) {
                apps.push(package);
            }
        }
        apps
    }

    /// The minimal set of distinct languages any package currently needs
    /// transcribed (direct transcription or as a translation source leg),
    /// used to size the transcription worker pool (§4.5).
    pub async fn get_minimal_language_set(&self) -> Vec<String> {
        let mut langs = Vec::new();
        for (_, lock) in self.snapshot_locks() {
            let state = lock.lock().await;
            langs.extend(state.streams.iter().filter_map(|k| k.language().map(str::to_owned)));
        }
        langs.sort();
        langs.dedup();
        langs
    }

    /// Distinct `Transcription` keys across every package, for
    /// `TranscriptionSink::ensure_streams` (§4.5).
    pub async fn transcription_streams(&self) -> Vec<StreamKey> {
        self.distinct_streams(|k| matches!(k, StreamKey::Transcription(_))).await
    }

    /// Distinct `Translation` keys across every package, for
    /// `TranslationSink::ensure_streams` (§4.5).
    pub async fn translation_streams(&self) -> Vec<StreamKey> {
        self.distinct_streams(|k| matches!(k, StreamKey::Translation { .. })).await
    }

    async fn distinct_streams(&self, matches: impl Fn(&StreamKey) -> bool) -> Vec<StreamKey> {
        let mut keys = Vec::new();
        for (_, lock) in self.snapshot_locks() {
            let state = lock.lock().await;
            keys.extend(state.streams.iter().filter(|k| matches(k)).cloned());
        }
        keys.sort_by_key(StreamKey::as_wire_string);
        keys.dedup();
        keys
    }

    /// Current location-stream subscriptions across all packages, for
    /// `LocationController::on_subscription_change`.
    pub async fn location_subscriptions(&self) -> Vec<LocationSubscription> {
        let mut subs = Vec::new();
        for (package, lock) in self.snapshot_locks() {
            let state = lock.lock().await;
            if state.streams.contains(&StreamKey::LocationStream) {
                subs.push(LocationSubscription { package, rate: state.location_rate });
            }
        }
        subs
    }

    /// Deliver the permission-rejection notice for one outcome, if any, to the App.
    pub async fn notify_rejections(&self, outcome: &ApplyOutcome) {
        if outcome.rejected.is_empty() {
            return;
        }
        let Some(session) = self.session() else { return };
        session.send_permission_error(&outcome.package, &outcome.rejected).await;
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
