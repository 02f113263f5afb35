// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `UserSettingsBridge` (§4.11): loads the canonical settings snapshot and
//! bridges REST-applied partial updates to the Apps and components that
//! care about specific keys.

use std::sync::{Arc, OnceLock, RwLock, Weak};

use serde_json::Value;
use tracing::warn;

use crate::collaborators::{UserSettings, UserStore};
use crate::messages::AppOutbound;
use crate::session::Session;

pub struct UserSettingsBridge {
    user_id: String,
    user_store: Arc<dyn UserStore>,
    session: OnceLock<Weak<Session>>,
    snapshot: RwLock<UserSettings>,
}

impl UserSettingsBridge {
    pub fn new(user_id: impl Into<String>, user_store: Arc<dyn UserStore>) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            user_store,
            session: OnceLock::new(),
            snapshot: RwLock::new(UserSettings::default()),
        })
    }

    pub fn bind_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    pub fn snapshot(&self) -> UserSettings {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `load` (§4.11): fetch the canonical snapshot and apply
    /// `default_wearable` to the capability manager, if present.
    pub async fn load(&self) {
        let settings = match self.user_store.get_settings(&self.user_id).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(user_id = %self.user_id, err = %e, "failed to load user settings, continuing with defaults");
                UserSettings::default()
            }
        };

        let default_wearable = settings.default_wearable.clone();
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = settings;

        if let Some(model_name) = default_wearable {
            if let Some(session) = self.session() {
                session.capabilities.set_current_model(&model_name).await;
            }
        }
    }

    /// `onSettingsUpdatedViaRest` (§4.11): merge a partial update into the
    /// snapshot and bridge the keys that have side effects.
    pub async fn apply_rest_update(&self, partial: Value) {
        let Value::Object(fields) = partial else { return };

        let mut metric_system_update = None;
        let mut default_wearable_update = None;

        {
            let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            for (key, value) in &fields {
                snapshot.raw.insert(key.clone(), value.clone());
                match key.as_str() {
                    "metric_system_enabled" => {
                        let enabled = coerce_bool(value);
                        snapshot.metric_system_enabled = enabled;
                        metric_system_update = Some(enabled);
                    }
                    "default_wearable" => {
                        if let Some(name) = value.as_str() {
                            snapshot.default_wearable = Some(name.to_owned());
                            default_wearable_update = Some(name.to_owned());
                        }
                    }
                    _ => {}
                }
            }
        }

        let Some(session) = self.session() else { return };

        if let Some(enabled) = metric_system_update {
            let packages = session.subscriptions.get_apps_for_setting("metricSystemEnabled").await;
            for package in packages {
                let msg = AppOutbound::AugmentosSettingsUpdate {
                    session_id: session.session_id().to_owned(),
                    settings: serde_json::json!({ "metricSystemEnabled": enabled }),
                    timestamp: crate::util::epoch_ms(),
                };
                session.send_to_app_with_resurrection(&package, &msg).await;
            }
        }

        if let Some(model_name) = default_wearable_update {
            session.capabilities.set_current_model(&model_name).await;
        }
    }
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
