// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `AppConnectionManager` (§4.2): App lifecycle — start, websocket
//! registration, transport loss/grace/resurrection, and stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock, Weak};

use tokio::sync::Notify;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::collaborators::{AnalyticsSink, AppDescriptor, AppKind, AppStore, DisplayManager, WebhookClient};
use crate::error::{HubError, HubResult};
use crate::messages::AppOutbound;
use crate::session::Session;
use crate::subscription::SubscriptionEngine;
use crate::transport::Transport;

/// Lifecycle state of one App's connection to this session (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycleState {
    Running,
    /// Transport lost unexpectedly; within `app_reconnect_grace` a
    /// reconnect resumes in place without a restart.
    GracePeriod,
    /// Grace window elapsed; the App is being stopped and restarted.
    Resurrecting,
    /// A deliberate `stopApp` is in progress; transport loss during this
    /// state is expected and triggers no grace timer.
    Stopping,
    Disconnected,
}

struct AppRecord {
    kind: AppKind,
    state: AppLifecycleState,
    transport: Option<Arc<dyn Transport>>,
}

/// A start in flight: waiters block on `notify`; `failure` carries the
/// reason if the webhook itself exhausted retries, so every waiter can
/// distinguish "webhook failed" from "App never dialed back in time".
struct PendingStart {
    notify: Arc<Notify>,
    failure: Arc<StdMutex<Option<String>>>,
}

pub struct AppConnectionManager {
    user_id: String,
    app_store: Arc<dyn AppStore>,
    webhook_client: Arc<dyn WebhookClient>,
    analytics: Arc<dyn AnalyticsSink>,
    display: Arc<dyn DisplayManager>,
    subscriptions: Arc<SubscriptionEngine>,
    session: OnceLock<Weak<Session>>,
    app_start_deadline: Duration,
    webhook_attempts: u32,
    webhook_attempt_timeout: Duration,
    app_reconnect_grace: Duration,
    records: RwLock<HashMap<String, AppRecord>>,
    pending_starts: RwLock<HashMap<String, PendingStart>>,
}

impl AppConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        app_store: Arc<dyn AppStore>,
        webhook_client: Arc<dyn WebhookClient>,
        analytics: Arc<dyn AnalyticsSink>,
        display: Arc<dyn DisplayManager>,
        subscriptions: Arc<SubscriptionEngine>,
        app_start_deadline: Duration,
        webhook_attempts: u32,
        webhook_attempt_timeout: Duration,
        app_reconnect_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            app_store,
            webhook_client,
            analytics,
            display,
            subscriptions,
            session: OnceLock::new(),
            app_start_deadline,
            webhook_attempts,
            webhook_attempt_timeout,
            app_reconnect_grace,
            records: RwLock::new(HashMap::new()),
            pending_starts: RwLock::new(HashMap::new()),
        })
    }

    pub fn bind_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    fn state_of(&self, package: &str) -> Option<AppLifecycleState> {
        self.records.read().unwrap_or_else(|e| e.into_inner()).get(package).map(|r| r.state)
    }

    /// `startApp` (§4.2): running-check, descriptor lookup, hardware
    /// compatibility, standard-App exclusivity, pending-start coalescing,
    /// webhook trigger with retry, then wait for the App's own websocket to
    /// register within the start deadline.
    pub async fn start_app(&self, package: &str) -> HubResult<()> {
        if self.state_of(package) == Some(AppLifecycleState::Running) {
            return Ok(());
        }

        let descriptor = self
            .app_store
            .get_app(package)
            .await
            .map_err(HubError::Store)?
            .ok_or(HubError::NotFound)?;

        if let Some(session) = self.session() {
            let caps = session.get_capabilities().await;
            if !descriptor.required_hardware.iter().all(|hw| caps.supports(*hw)) {
                return Err(HubError::HardwareIncompatible(package.to_owned()));
            }
        }

        if descriptor.kind == AppKind::Standard {
            self.stop_other_running_standard_app(package).await;
        }

        // Pending-connection coalescing: a start already in flight for this
        // package is awaited instead of triggering a second webhook call.
        // The check-and-insert happens under one write-lock hold, so `owns`
        // is exact: true iff this call created the entry just now.
        let (notify, failure, owns) = {
            let mut pending = self.pending_starts.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = pending.get(package) {
                (Arc::clone(&existing.notify), Arc::clone(&existing.failure), false)
            } else {
                let notify = Arc::new(Notify::new());
                let failure = Arc::new(StdMutex::new(None));
                pending.insert(package.to_owned(), PendingStart { notify: Arc::clone(&notify), failure: Arc::clone(&failure) });
                (notify, failure, true)
            }
        };

        // Constructed before triggering the webhook so that a `notify_waiters`
        // call racing with our own registration is never lost (tokio's
        // documented pattern for this exact race).
        let notified = notify.notified();

        if owns {
            self.trigger_start_webhook(package, &descriptor, &notify, &failure).await;
        }

        let result = timeout(self.app_start_deadline, notified).await;

        if owns {
            self.pending_starts.write().unwrap_or_else(|e| e.into_inner()).remove(package);
        }

        match result {
            Ok(()) if self.state_of(package) == Some(AppLifecycleState::Running) => Ok(()),
            Ok(()) => match failure.lock().unwrap_or_else(|e| e.into_inner()).clone() {
                Some(reason) => Err(HubError::WebhookFailure(reason)),
                None => Err(HubError::Timeout(format!("{package} start did not reach Running"))),
            },
            Err(_) => Err(HubError::Timeout(format!("{package} start deadline exceeded"))),
        }
    }

    /// Sends the start webhook with retry/backoff. On exhaustion, records the
    /// failure reason, marks the App `Disconnected`, and wakes any waiters
    /// (including this call's own timeout above) immediately rather than
    /// letting them sit out the full deadline (§4.2, §7).
    async fn trigger_start_webhook(
        &self,
        package: &str,
        descriptor: &AppDescriptor,
        notify: &Arc<Notify>,
        failure: &Arc<StdMutex<Option<String>>>,
    ) {
        let session_id = self.session().map(|s| s.session_id().to_owned()).unwrap_or_default();

        let mut last_err = None;
        for attempt in 0..self.webhook_attempts {
            match timeout(
                self.webhook_attempt_timeout,
                self.webhook_client.trigger_app_start(descriptor, &self.user_id, &session_id),
            )
            .await
            {
                Ok(Ok(())) => return,
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => last_err = Some("webhook call timed out".to_owned()),
            }
            if attempt + 1 < self.webhook_attempts {
                tokio::time::sleep(Duration::from_millis(250 * 2u64.pow(attempt))).await;
            }
        }

        let reason = last_err.unwrap_or_else(|| "webhook failed with no further detail".to_owned());
        warn!(package, err = %reason, "app start webhook failed after retries");

        {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            records
                .entry(package.to_owned())
                .and_modify(|r| r.state = AppLifecycleState::Disconnected)
                .or_insert(AppRecord { kind: descriptor.kind, state: AppLifecycleState::Disconnected, transport: None });
        }

        *failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
        notify.notify_waiters();
    }

    async fn stop_other_running_standard_app(&self, except: &str) {
        let other = {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            records
                .iter()
                .find(|(pkg, r)| pkg.as_str() != except && r.kind == AppKind::Standard && r.state == AppLifecycleState::Running)
                .map(|(pkg, _)| pkg.clone())
        };
        if let Some(pkg) = other {
            info!(stopped = %pkg, starting = %except, "stopping exclusive standard app");
            let _ = self.stop_app(&pkg).await;
        }
    }

    /// `registerConnection`: the App's own websocket dialing back in, after
    /// the start webhook asked its server to open one. Validates the API
    /// key, then promotes the record to `Running` and resolves any pending
    /// `start_app` waiter.
    pub async fn register_connection(
        &self,
        package: &str,
        api_key: &str,
        session_id: &str,
        transport: Arc<dyn Transport>,
    ) -> HubResult<()> {
        let descriptor = self
            .app_store
            .get_app(package)
            .await
            .map_err(HubError::Store)?
            .ok_or(HubError::NotFound)?;

        if descriptor.api_key != api_key {
            transport.close(crate::messages::close_code::POLICY_VIOLATION, "invalid api key");
            return Err(HubError::Auth);
        }

        {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            records.insert(
                package.to_owned(),
                AppRecord { kind: descriptor.kind, state: AppLifecycleState::Running, transport: Some(transport.clone()) },
            );
        }

        if let Some(session) = self.session() {
            let settings = session.get_app_settings_snapshot().await;
            let caps = session.get_capabilities().await;
            let ack = AppOutbound::connection_ack(session_id, settings.clone(), settings, caps.to_json());
            let _ = crate::transport::send_app(transport.as_ref(), &ack);
        }

        self.display.show_boot_view(&self.user_id, package).await;
        self.analytics.track(&self.user_id, "app_connected", serde_json::json!({ "package": package })).await;

        if let Some(waiter) = self.pending_starts.read().unwrap_or_else(|e| e.into_inner()).get(package) {
            waiter.notify.notify_waiters();
        }

        Ok(())
    }

    pub fn send_message_to_app(&self, package: &str, msg: &AppOutbound) -> HubResult<()> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let record = records.get(package).ok_or(HubError::NotFound)?;
        if record.state != AppLifecycleState::Running {
            return Err(HubError::InvalidState(format!("{package} is not running")));
        }
        let transport = record.transport.as_ref().ok_or(HubError::TransportClosed)?;
        crate::transport::send_app(transport.as_ref(), msg)
    }

    /// Raw PCM relay (§4.4): bypasses the `AppOutbound` envelope entirely,
    /// since audio frames are forwarded to subscribed Apps as binary frames.
    pub fn send_binary_to_app(&self, package: &str, bytes: bytes::Bytes) -> HubResult<()> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let record = records.get(package).ok_or(HubError::NotFound)?;
        if record.state != AppLifecycleState::Running {
            return Err(HubError::InvalidState(format!("{package} is not running")));
        }
        let transport = record.transport.as_ref().ok_or(HubError::TransportClosed)?;
        transport.send_binary(bytes)
    }

    /// Transport-close handling (§4.2): a deliberate stop tears down
    /// immediately; anything else opens a grace window before resurrection.
    pub async fn on_transport_closed(self: &Arc<Self>, package: &str) {
        let should_grace = {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            match records.get_mut(package) {
                Some(r) if r.state == AppLifecycleState::Stopping => {
                    r.transport = None;
                    false
                }
                Some(r) => {
                    r.state = AppLifecycleState::GracePeriod;
                    r.transport = None;
                    true
                }
                None => false,
            }
        };

        if !should_grace {
            return;
        }

        let this = Arc::clone(self);
        let package = package.to_owned();
        let grace = self.app_reconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.resurrect_if_still_in_grace(&package).await;
        });
    }

    async fn resurrect_if_still_in_grace(self: &Arc<Self>, package: &str) {
        let still_grace = {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            match records.get_mut(package) {
                Some(r) if r.state == AppLifecycleState::GracePeriod => {
                    r.state = AppLifecycleState::Resurrecting;
                    true
                }
                _ => false,
            }
        };
        if !still_grace {
            return;
        }
        debug!(package, "grace window elapsed without reconnect, resurrecting");
        let _ = self.stop_app(package).await;
        let _ = self.start_app(package).await;
    }

    /// `stopApp` (§4.2): idempotent teardown — subscriptions, display, the
    /// transport itself, and the persisted running-app list.
    pub async fn stop_app(&self, package: &str) -> HubResult<()> {
        let transport = {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            let Some(record) = records.get_mut(package) else { return Ok(()) };
            record.state = AppLifecycleState::Stopping;
            record.transport.take()
        };

        self.subscriptions.remove_subscriptions(package).await;
        if let Some(session) = self.session() {
            session.calendar.handle_unsubscribe(package);
        }
        self.display.clear_app_content(&self.user_id, package).await;

        if let Some(transport) = transport {
            let _ = crate::transport::send_app(transport.as_ref(), &AppOutbound::app_stopped());
            transport.close(crate::messages::close_code::NORMAL, "app stopped");
        }

        self.records.write().unwrap_or_else(|e| e.into_inner()).remove(package);

        if let Ok(Some(descriptor)) = self.app_store.get_app(package).await {
            if let Err(e) = timeout(
                self.webhook_attempt_timeout,
                self.webhook_client.trigger_app_stop(&descriptor, &self.user_id, "session_stop"),
            )
            .await
            .unwrap_or(Err("stop webhook timed out".to_owned()))
            {
                warn!(package, err = %e, "app stop webhook failed (best-effort)");
            }
        }

        let running = self.running_packages();
        if let Err(e) = self.app_store.set_running_apps(&self.user_id, running).await {
            warn!(package, err = %e, "failed to persist running app list");
        }

        self.analytics.track(&self.user_id, "app_stopped", serde_json::json!({ "package": package })).await;
        Ok(())
    }

    pub fn running_packages(&self) -> Vec<String> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, r)| r.state == AppLifecycleState::Running)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn is_running(&self, package: &str) -> bool {
        self.state_of(package) == Some(AppLifecycleState::Running)
    }
}

#[cfg(test)]
#[path = "app_tests.rs"]
mod tests;
