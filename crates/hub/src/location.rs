// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `LocationController` (§4.8): tier selection, one-shot polls with
//! correlation, freshness cache, cold-cache seed/persist.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use serde_json::Value;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::collaborators::UserStore;
use crate::messages::DeviceOutbound;
use crate::session::Session;

/// Location accuracy/frequency tier, ascending by accuracy (§4.8).
/// Declaration order doubles as the `Ord` ranking used to pick the
/// highest-ranked tier among simultaneous App subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LocationTier {
    Reduced,
    ThreeKilometers,
    Kilometer,
    HundredMeters,
    TenMeters,
    Standard,
    High,
    Realtime,
}

impl LocationTier {
    pub const DEFAULT: LocationTier = LocationTier::Reduced;

    pub fn parse(rate: &str) -> Option<Self> {
        match rate {
            "reduced" => Some(Self::Reduced),
            "threeKilometers" => Some(Self::ThreeKilometers),
            "kilometer" => Some(Self::Kilometer),
            "hundredMeters" => Some(Self::HundredMeters),
            "tenMeters" => Some(Self::TenMeters),
            "standard" => Some(Self::Standard),
            "high" => Some(Self::High),
            "realtime" => Some(Self::Realtime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reduced => "reduced",
            Self::ThreeKilometers => "threeKilometers",
            Self::Kilometer => "kilometer",
            Self::HundredMeters => "hundredMeters",
            Self::TenMeters => "tenMeters",
            Self::Standard => "standard",
            Self::High => "high",
            Self::Realtime => "realtime",
        }
    }

    /// Freshness max-age table (§4.8).
    pub fn max_age(&self) -> Duration {
        let ms = match self {
            Self::Realtime => 1_000,
            Self::High => 10_000,
            Self::Standard => 30_000,
            Self::TenMeters => 30_000,
            Self::HundredMeters => 60_000,
            Self::Kilometer => 300_000,
            Self::ThreeKilometers => 900_000,
            Self::Reduced => 900_000,
        };
        Duration::from_millis(ms)
    }
}

/// A normalized location fix (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedLocation {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: Option<f64>,
    pub timestamp: Instant,
}

impl NormalizedLocation {
    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite() && self.accuracy.map(f64::is_finite).unwrap_or(true)
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({ "lat": self.lat, "lng": self.lng, "accuracy": self.accuracy })
    }
}

/// Parse either `{lat,lng,accuracy?}` or Expo-style `{latitude,longitude,...}` (§4.8).
pub fn parse_location_payload(payload: &Value, now: Instant) -> Option<NormalizedLocation> {
    let lat = payload
        .get("lat")
        .or_else(|| payload.get("latitude"))
        .and_then(Value::as_f64)?;
    let lng = payload
        .get("lng")
        .or_else(|| payload.get("longitude"))
        .and_then(Value::as_f64)?;
    let accuracy = payload.get("accuracy").and_then(Value::as_f64);
    let loc = NormalizedLocation { lat, lng, accuracy, timestamp: now };
    loc.is_finite().then_some(loc)
}

/// A per-package location subscription entry, computed by `SubscriptionEngine`
/// and pushed here on every apply (§4.3 post-apply step).
#[derive(Debug, Clone)]
pub struct LocationSubscription {
    pub package: String,
    pub rate: Option<LocationTier>,
}

struct PendingPoll {
    package: String,
}

struct ControllerState {
    last_location: Option<NormalizedLocation>,
    pending_polls: HashMap<String, PendingPoll>,
    effective_tier: LocationTier,
}

pub struct LocationController {
    user_id: String,
    user_store: Arc<dyn UserStore>,
    session: OnceLock<Weak<Session>>,
    state: RwLock<ControllerState>,
}

impl LocationController {
    pub fn new(user_id: impl Into<String>, user_store: Arc<dyn UserStore>) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            user_store,
            session: OnceLock::new(),
            state: RwLock::new(ControllerState {
                last_location: None,
                pending_polls: HashMap::new(),
                effective_tier: LocationTier::DEFAULT,
            }),
        })
    }

    pub fn bind_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    /// Seed the cold cache from the user store on Session construction (§4.8).
    pub async fn seed_from_store(&self) {
        match self.user_store.get_last_location(&self.user_id).await {
            Ok(Some(loc)) => {
                self.state.write().unwrap_or_else(|e| e.into_inner()).last_location = Some(loc);
            }
            Ok(None) => {}
            Err(e) => warn!(user_id = %self.user_id, err = %e, "failed to seed last location"),
        }
    }

    /// Persist the last known location on Session disposal (§4.8).
    pub async fn persist_on_dispose(&self) {
        let last = self.state.read().unwrap_or_else(|e| e.into_inner()).last_location.clone();
        if let Some(loc) = last {
            if let Err(e) = self.user_store.save_last_location(&self.user_id, loc).await {
                warn!(user_id = %self.user_id, err = %e, "failed to persist last location");
            }
        }
    }

    /// REST-path update (§6 `location_update` analog from the API surface).
    /// If `correlation_id` matches a pending poll, routes the response to
    /// the requesting App instead of broadcasting.
    pub async fn update_from_api(&self, loc: NormalizedLocation, correlation_id: Option<&str>) {
        self.route_update(loc, correlation_id).await;
    }

    /// Device-originated update over the websocket (§4.8).
    pub async fn update_from_websocket(&self, loc: NormalizedLocation, correlation_id: Option<&str>) {
        self.route_update(loc, correlation_id).await;
    }

    async fn route_update(&self, loc: NormalizedLocation, correlation_id: Option<&str>) {
        let targeted_package = correlation_id.and_then(|cid| {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.pending_polls.remove(cid).map(|p| p.package)
        });

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.last_location = Some(loc.clone());
        }

        let Some(session) = self.session() else { return };

        if let Some(package) = targeted_package {
            session.send_data_stream_to_app(&package, "location-stream", loc.to_json()).await;
        } else {
            session.relay_to_apps("location-stream", loc.to_json()).await;
        }
    }

    /// `handlePollRequestFromApp` (§4.8): respond immediately if fresh,
    /// otherwise poll the device (or wait for the next REST update if the
    /// device transport is closed).
    pub async fn handle_poll_request(&self, accuracy: &str, correlation_id: String, package: String) {
        let requested_tier = LocationTier::parse(accuracy).unwrap_or(LocationTier::DEFAULT);

        let fresh = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            state.last_location.as_ref().map(|loc| {
                Instant::now().saturating_duration_since(loc.timestamp) <= requested_tier.max_age()
            })
        };

        let Some(session) = self.session() else { return };

        if fresh == Some(true) {
            let loc = self.state.read().unwrap_or_else(|e| e.into_inner()).last_location.clone();
            if let Some(loc) = loc {
                session.send_data_stream_to_app(&package, "location-stream", loc.to_json()).await;
            }
            return;
        }

        let device_open = session.device_transport().map(|t| t.is_open()).unwrap_or(false);
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.pending_polls.insert(correlation_id.clone(), PendingPoll { package });
        }
        if device_open {
            session.send_to_device(&DeviceOutbound::RequestSingleLocation {
                accuracy: accuracy.to_owned(),
                correlation_id,
                timestamp: crate::util::epoch_ms(),
            });
        }
        // else: pending remains, satisfied by the next REST update.
    }

    /// `onSubscriptionChange` (§4.8): recompute the effective tier from the
    /// union of current subscriptions and push `SET_LOCATION_TIER` if it changed;
    /// relay the last known location to newly subscribed packages.
    pub async fn on_subscription_change(&self, subs: Vec<LocationSubscription>, newly_subscribed: &[String]) {
        let highest = subs.iter().filter_map(|s| s.rate).max().unwrap_or(LocationTier::DEFAULT);

        let changed = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.effective_tier != highest {
                state.effective_tier = highest;
                true
            } else {
                false
            }
        };

        let Some(session) = self.session() else { return };

        if changed {
            if let Some(transport) = session.device_transport() {
                if transport.is_open() {
                    let _ = crate::transport::send_device(
                        transport.as_ref(),
                        &DeviceOutbound::SetLocationTier {
                            tier: highest.as_str(),
                            timestamp: crate::util::epoch_ms(),
                        },
                    );
                }
            }
        }

        if !newly_subscribed.is_empty() {
            let last = self.state.read().unwrap_or_else(|e| e.into_inner()).last_location.clone();
            if let Some(loc) = last {
                for package in newly_subscribed {
                    session.send_data_stream_to_app(package, "location-stream", loc.to_json()).await;
                }
            }
        }
        debug!(user_id = %self.user_id, tier = highest.as_str(), "location tier evaluated");
    }

    pub fn effective_tier(&self) -> LocationTier {
        self.state.read().unwrap_or_else(|e| e.into_inner()).effective_tier
    }

    pub fn last_location(&self) -> Option<NormalizedLocation> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).last_location.clone()
    }
}

#[cfg(test)]
#[path = "location_tests.rs"]
mod tests;
