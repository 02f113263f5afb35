// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `HttpWebhookClient`: the production `WebhookClient` (§4.2, §4.7, §4.12).
//! One POST per call, no retry of its own — `AppConnectionManager` and
//! `PhotoRequestRouter` own the attempt/backoff envelope around these calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::collaborators::{AppDescriptor, WebhookClient};

/// Thin reqwest wrapper posting to App-provided webhook URLs.
pub struct HttpWebhookClient {
    client: Client,
}

impl HttpWebhookClient {
    pub fn new(per_call_timeout: Duration) -> Self {
        let client = Client::builder().timeout(per_call_timeout).build().unwrap_or_default();
        Self { client }
    }

    async fn post(&self, url: &str, body: Value) -> Result<(), String> {
        let resp = self.client.post(url).json(&body).send().await.map_err(|e| e.to_string())?;
        resp.error_for_status().map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn trigger_app_start(&self, app: &AppDescriptor, user_id: &str, session_id: &str) -> Result<(), String> {
        let body = serde_json::json!({
            "type": "start_request",
            "userId": user_id,
            "sessionId": session_id,
            "packageName": app.package_name,
        });
        self.post(&app.public_url, body).await
    }

    async fn trigger_app_stop(&self, app: &AppDescriptor, user_id: &str, reason: &str) -> Result<(), String> {
        let body = serde_json::json!({
            "type": "stop_request",
            "userId": user_id,
            "packageName": app.package_name,
            "reason": reason,
        });
        self.post(&app.public_url, body).await
    }

    async fn notify_photo_upload(&self, webhook_url: &str, payload: Value) -> Result<(), String> {
        self.post(webhook_url, payload).await
    }
}

#[cfg(test)]
#[path = "webhook_tests.rs"]
mod tests;
