// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `PhotoRequestRouter` (§4.7): one in-flight photo request per `request_id`,
//! a deadline, and the custom-webhook short-circuit that skips waiting on the
//! device entirely.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};

use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collaborators::WebhookClient;
use crate::error::{HubError, HubResult};
use crate::messages::{AppOutbound, DeviceOutbound};
use crate::session::Session;

struct PendingPhotoRequest {
    package: String,
    token: CancellationToken,
}

pub struct PhotoRequestRouter {
    user_id: String,
    webhook_client: Arc<dyn WebhookClient>,
    deadline: Duration,
    session: OnceLock<Weak<Session>>,
    pending: RwLock<HashMap<String, PendingPhotoRequest>>,
}

impl PhotoRequestRouter {
    pub fn new(user_id: impl Into<String>, webhook_client: Arc<dyn WebhookClient>, deadline: Duration) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.into(),
            webhook_client,
            deadline,
            session: OnceLock::new(),
            pending: RwLock::new(HashMap::new()),
        })
    }

    pub fn bind_session(&self, session: Weak<Session>) {
        let _ = self.session.set(session);
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.get().and_then(Weak::upgrade)
    }

    /// `requestPhoto` (§4.7): requires a running App and an open device
    /// transport, resolves the upload target, and either waits for the
    /// device's own `photo_response` or — for a custom webhook URL — notifies
    /// that endpoint directly and resolves the App's request immediately,
    /// since the device uploads straight to the caller's own webhook and
    /// never round-trips a response through this session.
    pub async fn request_photo(
        &self,
        package: &str,
        request_id: &str,
        save_to_gallery: bool,
        custom_webhook_url: Option<String>,
        auth_token: Option<String>,
        size: Option<String>,
    ) -> HubResult<()> {
        let Some(session) = self.session() else { return Err(HubError::InvalidState("session not bound".into())) };

        if !session.apps.is_running(package) {
            return Err(HubError::InvalidState(format!("{package} is not running")));
        }
        let device = session.device_transport().ok_or(HubError::TransportClosed)?;
        if !device.is_open() {
            return Err(HubError::TransportClosed);
        }
        let descriptor = session.app_descriptor(package).await.ok_or(HubError::NotFound)?;

        let webhook_url = custom_webhook_url.clone().unwrap_or_else(|| format!("{}/photo-upload", descriptor.public_url));

        let token = CancellationToken::new();
        {
            let mut pending = self.pending.write().unwrap_or_else(|e| e.into_inner());
            pending.insert(request_id.to_owned(), PendingPhotoRequest { package: package.to_owned(), token: token.clone() });
        }

        let _ = crate::transport::send_device(
            device.as_ref(),
            &DeviceOutbound::PhotoRequest {
                session_id: session.session_id().to_owned(),
                request_id: request_id.to_owned(),
                app_id: package.to_owned(),
                webhook_url,
                auth_token,
                size,
                timestamp: crate::util::epoch_ms(),
            },
        );

        self.spawn_deadline(request_id.to_owned(), token);

        if let Some(custom_url) = custom_webhook_url {
            let _ = self
                .webhook_client
                .notify_photo_upload(
                    &custom_url,
                    serde_json::json!({
                        "type": "photo-upload",
                        "requestId": request_id,
                        "userId": self.user_id,
                        "timestamp": crate::util::epoch_ms(),
                    }),
                )
                .await;
            self.complete_synthetic(request_id, save_to_gallery).await;
        }

        Ok(())
    }

    fn spawn_deadline(&self, request_id: String, token: CancellationToken) {
        let Some(session) = self.session() else { return };
        let photo = Arc::clone(&session.photo);
        let deadline = self.deadline;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(deadline) => photo.expire(&request_id),
            }
        });
    }

    /// Deadline elapsed with no response (§4.7): drop the pending entry.
    /// No fabricated error is sent to the App.
    fn expire(&self, request_id: &str) {
        if self.pending.write().unwrap_or_else(|e| e.into_inner()).remove(request_id).is_some() {
            debug!(request_id, "photo request deadline elapsed without a response");
        }
    }

    fn take_pending(&self, request_id: &str) -> Option<(String, CancellationToken)> {
        self.pending
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id)
            .map(|p| (p.package, p.token))
    }

    /// `handlePhotoResponse` (§4.7): the device's own upload completed.
    pub async fn handle_photo_response(&self, request_id: &str, photo_url: &str, saved_to_gallery: bool) {
        let Some((package, token)) = self.take_pending(request_id) else {
            warn!(request_id, "photo response for unknown or expired request, ignoring");
            return;
        };
        token.cancel();
        let Some(session) = self.session() else { return };
        let msg = AppOutbound::PhotoResult {
            request_id: request_id.to_owned(),
            success: true,
            photo_url: Some(photo_url.to_owned()),
            saved_to_gallery,
            timestamp: crate::util::epoch_ms(),
        };
        session.send_to_app_with_resurrection(&package, &msg).await;
    }

    async fn complete_synthetic(&self, request_id: &str, saved_to_gallery: bool) {
        let Some((package, token)) = self.take_pending(request_id) else { return };
        token.cancel();
        let Some(session) = self.session() else { return };
        let msg = AppOutbound::PhotoResult {
            request_id: request_id.to_owned(),
            success: true,
            photo_url: None,
            saved_to_gallery,
            timestamp: crate::util::epoch_ms(),
        };
        session.send_to_app_with_resurrection(&package, &msg).await;
    }
}

#[cfg(test)]
#[path = "photo_tests.rs"]
mod tests;
