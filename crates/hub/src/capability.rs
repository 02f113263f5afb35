// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `DeviceCapabilityManager` (§4.10): resolves the device's current model to
//! an `EffectiveCapabilities` set, broadcasts changes, and sweeps Apps that
//! become hardware-incompatible.

use std::sync::{Arc, OnceLock, RwLock, Weak};

use tracing::{info, warn};

use crate::collaborators::{AnalyticsSink, CapabilityTable, EffectiveCapabilities, RequiredHardware, StaticCapabilityTable};
use crate::messages::DeviceOutbound;
use crate::session::Session;

pub struct DeviceCapabilityManager {
    user_id: String,
    table: Arc<dyn CapabilityTable>,
    analytics: Arc<dyn AnalyticsSink>,
    session: OnceLock<Weak<Session>>,
    current: RwLock<EffectiveCapabilities>,
}

impl DeviceCapabilityManager {
    pub fn new(user_id: impl Into<String>, table: Arc<dyn CapabilityTable>, analytics: Arc<dyn AnalyticsSink>) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            table,
            analytics,
            session: OnceLock::new(),
            current: RwLock::new(EffectiveCapabilities {
                model_name: StaticCapabilityTable::FALLBACK_MODEL.to_owned(),
                ..Default::default()
            }),
        })
    }

    pub fn bind_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    pub fn current(&self) -> EffectiveCapabilities {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `setCurrentModel` (§4.10): resolves the named model, falling back to
    /// `"Even Realities G1"` if the table has no entry for it. A no-op if
    /// the model name is unchanged.
    pub async fn set_current_model(&self, model_name: &str) {
        if self.current.read().unwrap_or_else(|e| e.into_inner()).model_name == model_name {
            return;
        }

        let resolved = match self.table.resolve(model_name).await {
            Some(caps) => caps,
            None => {
                warn!(model_name, "unknown device model, falling back to default capability set");
                self.table
                    .resolve(StaticCapabilityTable::FALLBACK_MODEL)
                    .await
                    .unwrap_or_else(|| EffectiveCapabilities {
                        model_name: StaticCapabilityTable::FALLBACK_MODEL.to_owned(),
                        ..Default::default()
                    })
            }
        };

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = resolved.clone();
        info!(user_id = %self.user_id, model_name = %resolved.model_name, "device capabilities updated");
        self.broadcast_and_sweep(resolved).await;
    }

    /// `glasses_connection_state` handling (§4.10): same pipeline as
    /// `setCurrentModel`, plus analytics tracking of the connection event.
    pub async fn handle_connection_state(&self, status: &str, model_name: Option<&str>) {
        self.analytics
            .track(&self.user_id, "glasses_connection_state", serde_json::json!({ "status": status }))
            .await;
        if let Some(model_name) = model_name {
            self.set_current_model(model_name).await;
        }
    }

    async fn broadcast_and_sweep(&self, caps: EffectiveCapabilities) {
        let Some(session) = self.session() else { return };

        if let Some(transport) = session.device_transport() {
            if transport.is_open() {
                let _ = crate::transport::send_device(
                    transport.as_ref(),
                    &DeviceOutbound::CapabilitiesUpdate {
                        capabilities: caps.to_json(),
                        model_name: caps.model_name.clone(),
                        session_id: session.session_id().to_owned(),
                        timestamp: crate::util::epoch_ms(),
                    },
                );
            }
        }

        session.broadcast_capabilities_to_apps(&caps).await;

        for package in session.apps.running_packages() {
            let Some(descriptor) = session.app_descriptor(&package).await else { continue };
            let compatible = descriptor.required_hardware.iter().all(|hw: &RequiredHardware| caps.supports(*hw));
            if !compatible {
                info!(package, "app stopped: incompatible with new device capabilities");
                let _ = session.apps.stop_app(&package).await;
            }
        }
    }
}

#[cfg(test)]
#[path = "capability_tests.rs"]
mod tests;
