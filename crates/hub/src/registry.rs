// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `Registry`: the process-wide map from user id to the running `Session`
//! for that user (§3). Mirrors the teacher's `MuxState.sessions` table —
//! one `RwLock<HashMap<...>>` guarding lookups, with session lifecycle
//! (creation, teardown) driven by whoever holds the `Arc<Registry>`, not by
//! the registry itself.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::collaborators::{AnalyticsSink, AppStore, CapabilityTable, PermissionChecker, TranscriptionSink, TranslationSink, UserStore, WebhookClient};
use crate::config::HubConfig;
use crate::session::{Session, SessionBuilder};

/// Process-wide session table (§3). One `Session` per logged-in user;
/// `get_or_create` is the only entry point a transport driver needs.
pub struct Registry {
    config: HubConfig,
    user_store: Arc<dyn UserStore>,
    app_store: Arc<dyn AppStore>,
    permission_checker: Arc<dyn PermissionChecker>,
    capability_table: Arc<dyn CapabilityTable>,
    analytics: Arc<dyn AnalyticsSink>,
    webhook_client: Arc<dyn WebhookClient>,
    transcription: Arc<dyn TranscriptionSink>,
    translation: Arc<dyn TranslationSink>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Registry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: HubConfig,
        user_store: Arc<dyn UserStore>,
        app_store: Arc<dyn AppStore>,
        permission_checker: Arc<dyn PermissionChecker>,
        capability_table: Arc<dyn CapabilityTable>,
        analytics: Arc<dyn AnalyticsSink>,
        webhook_client: Arc<dyn WebhookClient>,
        transcription: Arc<dyn TranscriptionSink>,
        translation: Arc<dyn TranslationSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            user_store,
            app_store,
            permission_checker,
            capability_table,
            analytics,
            webhook_client,
            transcription,
            translation,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Look up the running session for a user, if any, without creating one.
    pub fn get(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).get(user_id).cloned()
    }

    /// Return the running session for `user_id`, building and initializing a
    /// fresh one if none exists yet. A device transport attaching to a brand
    /// new user is the common case (§4.1); a reconnecting device finds its
    /// existing session and reuses it instead.
    pub async fn get_or_create(self: &Arc<Self>, user_id: &str) -> Arc<Session> {
        if let Some(existing) = self.get(user_id) {
            return existing;
        }

        let session = SessionBuilder::new(user_id, Arc::clone(&self.user_store))
            .with_app_store(Arc::clone(&self.app_store))
            .with_permission_checker(Arc::clone(&self.permission_checker))
            .with_capability_table(Arc::clone(&self.capability_table))
            .with_analytics(Arc::clone(&self.analytics))
            .with_webhook_client(Arc::clone(&self.webhook_client))
            .with_transcription(Arc::clone(&self.transcription))
            .with_translation(Arc::clone(&self.translation))
            .with_config(self.config.clone())
            .with_registry(Arc::clone(self))
            .build();
        session.initialize().await;

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        // Lost the race against a concurrent get_or_create for the same
        // user: keep whichever session won and let ours be dropped.
        sessions.entry(user_id.to_owned()).or_insert(session).clone()
    }

    /// Remove a disposed session from the table. Called by `Session::dispose`
    /// through its `Weak<Registry>` back-reference, never directly.
    pub fn remove(&self, user_id: &str) {
        if self.sessions.write().unwrap_or_else(|e| e.into_inner()).remove(user_id).is_some() {
            info!(user_id, "session removed from registry");
        }
    }

    pub fn active_user_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        AllowAllPermissionChecker, FakeWebhookClient, InMemoryAppStore, InMemoryUserStore, NoopAnalyticsSink, NoopTranscriptionSink,
        NoopTranslationSink, StaticCapabilityTable,
    };

    fn test_registry() -> Arc<Registry> {
        Registry::new(
            HubConfig::default(),
            Arc::new(InMemoryUserStore::new()),
            Arc::new(InMemoryAppStore::new()),
            Arc::new(AllowAllPermissionChecker),
            Arc::new(StaticCapabilityTable::with_defaults()),
            Arc::new(NoopAnalyticsSink),
            Arc::new(FakeWebhookClient::new()),
            Arc::new(NoopTranscriptionSink),
            Arc::new(NoopTranslationSink),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_create_reuses_existing_session() {
        let registry = test_registry();
        let a = registry.get_or_create("u1").await;
        let b = registry.get_or_create("u1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.active_user_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_removes_from_registry() {
        let registry = test_registry();
        let session = registry.get_or_create("u1").await;
        assert_eq!(registry.active_user_count(), 1);

        session.dispose("test teardown").await;
        assert_eq!(registry.active_user_count(), 0);
        assert!(registry.get("u1").is_none());
    }
}
