// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Collaborator contracts (§1, §4.12): traits at the seams where this core
//! hands off to subsystems explicitly out of scope — the persistent
//! user/app metadata store, permission checks, the device capability table,
//! the display/layout renderer, speech-recognition and translation workers,
//! and the analytics sink. Each trait ships exactly one concrete
//! implementation here — an in-memory/no-op test double — since a real
//! production body belongs to the excluded subsystem, not this crate.
//!
//! Suspension points (§5): every method here is async because a real
//! implementation performs a store read/write or a network call; the
//! per-Session executor must not hold a lock across any of them.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::location::NormalizedLocation;
use crate::subscription::StreamKey;

/// A package identifier, e.g. `com.example.translator`.
pub type PackageName = String;
/// Opaque user identifier (device account).
pub type UserId = String;

/// Whether an App requires hardware the device might lack, and which capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredHardware {
    Camera,
    Microphone,
    Display,
    Speaker,
}

/// Whether an App is a "standard/foreground" App — §4.2 step 4: starting one
/// stops any other running standard App first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    Standard,
    Background,
}

/// Snapshot of an App's metadata, as the (out-of-scope) persistent store would return it.
#[derive(Debug, Clone)]
pub struct AppDescriptor {
    pub package_name: PackageName,
    pub public_url: String,
    pub kind: AppKind,
    pub required_hardware: Vec<RequiredHardware>,
    pub api_key: String,
}

/// Resolved capability set for the device's current model (§4.10).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveCapabilities {
    pub model_name: String,
    pub has_camera: bool,
    pub has_microphone: bool,
    pub has_display: bool,
    pub has_speaker: bool,
}

impl EffectiveCapabilities {
    pub fn supports(&self, hw: RequiredHardware) -> bool {
        match hw {
            RequiredHardware::Camera => self.has_camera,
            RequiredHardware::Microphone => self.has_microphone,
            RequiredHardware::Display => self.has_display,
            RequiredHardware::Speaker => self.has_speaker,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "modelName": self.model_name,
            "camera": self.has_camera,
            "microphone": self.has_microphone,
            "display": self.has_display,
            "speaker": self.has_speaker,
        })
    }
}

/// User settings snapshot, as the (out-of-scope) persistent store would return it (§4.11).
#[derive(Debug, Clone, Default)]
pub struct UserSettings {
    pub default_wearable: Option<String>,
    pub metric_system_enabled: bool,
    pub raw: HashMap<String, Value>,
}

/// Outcome of a permission check over a batch of requested stream keys (§4.3).
#[derive(Debug, Clone, Default)]
pub struct PermissionOutcome {
    pub allowed: Vec<StreamKey>,
    pub rejected: Vec<RejectedStream>,
}

#[derive(Debug, Clone)]
pub struct RejectedStream {
    pub stream: StreamKey,
    pub required_permission: String,
    pub message: String,
}

/// The persistent user/App metadata store (out of scope; §1).
#[async_trait]
pub trait AppStore: Send + Sync {
    async fn get_app(&self, package: &str) -> Result<Option<AppDescriptor>, String>;
    /// Best-effort persistence of the running-app list, per §4.2 stopApp.
    async fn set_running_apps(&self, user: &str, packages: Vec<PackageName>) -> Result<(), String>;
}

/// The persistent user record store (out of scope; §1).
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_settings(&self, user: &str) -> Result<UserSettings, String>;
    async fn get_last_location(&self, user: &str) -> Result<Option<NormalizedLocation>, String>;
    async fn save_last_location(&self, user: &str, location: NormalizedLocation) -> Result<(), String>;
}

/// Permission checker (out of scope; §1, §4.3).
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(&self, app: &AppDescriptor, requested: &[StreamKey]) -> PermissionOutcome;
}

/// External device-capability table (out of scope; §1, §4.10).
#[async_trait]
pub trait CapabilityTable: Send + Sync {
    async fn resolve(&self, model_name: &str) -> Option<EffectiveCapabilities>;
}

/// Layout/display renderer (out of scope; §1, §4.2).
#[async_trait]
pub trait DisplayManager: Send + Sync {
    async fn show_boot_view(&self, user: &str, package: &str);
    async fn clear_app_content(&self, user: &str, package: &str);
}

/// Speech-recognition worker pool (out of scope; §1, §4.5).
#[async_trait]
pub trait TranscriptionSink: Send + Sync {
    async fn ensure_streams(&self, user: &str, languages: &[StreamKey]);
    async fn ingest(&self, user: &str, pcm: &[u8]);
}

/// Translation worker pool (out of scope; §1, §4.5).
#[async_trait]
pub trait TranslationSink: Send + Sync {
    async fn ensure_streams(&self, user: &str, pairs: &[StreamKey]);
    async fn ingest(&self, user: &str, pcm: &[u8]);
}

/// Analytics sink (out of scope; §1).
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn track(&self, user: &str, event: &str, properties: Value);
}

/// Webhook poster (§4.2, §4.7, §4.12): one HTTP POST per call, no retry
/// policy of its own — the retry/backoff/timeout envelope around
/// start/stop/photo webhook calls is `AppConnectionManager`'s and
/// `PhotoRequestRouter`'s concern (§5), not this seam's.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn trigger_app_start(&self, app: &AppDescriptor, user_id: &str, session_id: &str) -> Result<(), String>;
    async fn trigger_app_stop(&self, app: &AppDescriptor, user_id: &str, reason: &str) -> Result<(), String>;
    async fn notify_photo_upload(&self, webhook_url: &str, payload: Value) -> Result<(), String>;
}

// -- No-op / in-memory test doubles ------------------------------------------

/// In-memory `AppStore` seeded with descriptors, for tests and local runs.
#[derive(Default)]
pub struct InMemoryAppStore {
    apps: Mutex<HashMap<PackageName, AppDescriptor>>,
    running: Mutex<HashMap<UserId, Vec<PackageName>>>,
}

impl InMemoryAppStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: AppDescriptor) {
        self.apps.lock().unwrap_or_else(|e| e.into_inner()).insert(descriptor.package_name.clone(), descriptor);
    }

    pub fn running_apps(&self, user: &str) -> Vec<PackageName> {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).get(user).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl AppStore for InMemoryAppStore {
    async fn get_app(&self, package: &str) -> Result<Option<AppDescriptor>, String> {
        Ok(self.apps.lock().unwrap_or_else(|e| e.into_inner()).get(package).cloned())
    }

    async fn set_running_apps(&self, user: &str, packages: Vec<PackageName>) -> Result<(), String> {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).insert(user.to_owned(), packages);
        Ok(())
    }
}

/// In-memory `UserStore`, for tests and local runs.
#[derive(Default)]
pub struct InMemoryUserStore {
    settings: Mutex<HashMap<UserId, UserSettings>>,
    locations: Mutex<HashMap<UserId, NormalizedLocation>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_settings(&self, user: &str, settings: UserSettings) {
        self.settings.lock().unwrap_or_else(|e| e.into_inner()).insert(user.to_owned(), settings);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get_settings(&self, user: &str) -> Result<UserSettings, String> {
        Ok(self.settings.lock().unwrap_or_else(|e| e.into_inner()).get(user).cloned().unwrap_or_default())
    }

    async fn get_last_location(&self, user: &str) -> Result<Option<NormalizedLocation>, String> {
        Ok(self.locations.lock().unwrap_or_else(|e| e.into_inner()).get(user).cloned())
    }

    async fn save_last_location(&self, user: &str, location: NormalizedLocation) -> Result<(), String> {
        self.locations.lock().unwrap_or_else(|e| e.into_inner()).insert(user.to_owned(), location);
        Ok(())
    }
}

/// Permission checker that allows everything — the default for local runs and
/// most tests; tests of the rejection path supply a closure-based fake instead.
pub struct AllowAllPermissionChecker;

#[async_trait]
impl PermissionChecker for AllowAllPermissionChecker {
    async fn check(&self, _app: &AppDescriptor, requested: &[StreamKey]) -> PermissionOutcome {
        PermissionOutcome { allowed: requested.to_vec(), rejected: Vec::new() }
    }
}

/// Capability table backed by a static in-memory map, with a fallback entry
/// (§4.10: unknown models fall back to "Even Realities G1").
pub struct StaticCapabilityTable {
    table: HashMap<String, EffectiveCapabilities>,
}

impl StaticCapabilityTable {
    pub const FALLBACK_MODEL: &'static str = "Even Realities G1";

    pub fn with_defaults() -> Self {
        let mut table = HashMap::new();
        table.insert(
            Self::FALLBACK_MODEL.to_owned(),
            EffectiveCapabilities {
                model_name: Self::FALLBACK_MODEL.to_owned(),
                has_camera: false,
                has_microphone: true,
                has_display: true,
                has_speaker: false,
            },
        );
        Self { table }
    }

    pub fn insert(&mut self, caps: EffectiveCapabilities) {
        self.table.insert(caps.model_name.clone(), caps);
    }
}

#[async_trait]
impl CapabilityTable for StaticCapabilityTable {
    async fn resolve(&self, model_name: &str) -> Option<EffectiveCapabilities> {
        self.table.get(model_name).cloned()
    }
}

/// Test double for `WebhookClient`: records every call and can be primed to
/// fail the next N calls, for exercising `AppConnectionManager`'s retry path.
#[derive(Default)]
pub struct FakeWebhookClient {
    calls: Mutex<Vec<(&'static str, PackageName)>>,
    remaining_failures: Mutex<u32>,
}

impl FakeWebhookClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        *self.remaining_failures.lock().unwrap_or_else(|e| e.into_inner()) = n;
    }

    pub fn calls(&self) -> Vec<(&'static str, PackageName)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_and_maybe_fail(&self, kind: &'static str, package: &str) -> Result<(), String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push((kind, package.to_owned()));
        let mut remaining = self.remaining_failures.lock().unwrap_or_else(|e| e.into_inner());
        if *remaining > 0 {
            *remaining -= 1;
            return Err("simulated webhook failure".to_owned());
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookClient for FakeWebhookClient {
    async fn trigger_app_start(&self, app: &AppDescriptor, _user_id: &str, _session_id: &str) -> Result<(), String> {
        self.record_and_maybe_fail("start", &app.package_name)
    }

    async fn trigger_app_stop(&self, app: &AppDescriptor, _user_id: &str, _reason: &str) -> Result<(), String> {
        self.record_and_maybe_fail("stop", &app.package_name)
    }

    async fn notify_photo_upload(&self, webhook_url: &str, _payload: Value) -> Result<(), String> {
        self.record_and_maybe_fail("photo", webhook_url)
    }
}

macro_rules! noop_sink {
    ($name:ident, $trait:ident, { $($method:tt)* }) => {
        #[derive(Default)]
        pub struct $name;

        #[async_trait]
        impl $trait for $name {
            $($method)*
        }
    };
}

noop_sink!(NoopDisplayManager, DisplayManager, {
    async fn show_boot_view(&self, _user: &str, _package: &str) {}
    async fn clear_app_content(&self, _user: &str, _package: &str) {}
});

noop_sink!(NoopTranscriptionSink, TranscriptionSink, {
    async fn ensure_streams(&self, _user: &str, _languages: &[StreamKey]) {}
    async fn ingest(&self, _user: &str, _pcm: &[u8]) {}
});

noop_sink!(NoopTranslationSink, TranslationSink, {
    async fn ensure_streams(&self, _user: &str, _pairs: &[StreamKey]) {}
    async fn ingest(&self, _user: &str, _pcm: &[u8]) {}
});

noop_sink!(NoopAnalyticsSink, AnalyticsSink, {
    async fn track(&self, _user: &str, _event: &str, _properties: Value) {}
});
