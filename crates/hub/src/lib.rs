// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Glasshub: the core of a real-time session hub for smart-glasses cloud.

pub mod app;
pub mod audio;
pub mod calendar;
pub mod capability;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod location;
pub mod messages;
pub mod microphone;
pub mod photo;
pub mod registry;
pub mod session;
pub mod settings;
pub mod subscription;
pub mod transport;
pub mod util;
pub mod video;
pub mod webhook;
pub mod ws;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{
    AllowAllPermissionChecker, FakeWebhookClient, InMemoryAppStore, InMemoryUserStore, NoopAnalyticsSink, NoopTranscriptionSink,
    NoopTranslationSink, StaticCapabilityTable,
};
use crate::config::HubConfig;
use crate::registry::Registry;
use crate::webhook::HttpWebhookClient;

/// Run the session hub until shutdown.
///
/// Collaborator seams (user/app store, permission checker, capability
/// table, analytics, transcription/translation workers) are out of scope
/// (§1) for this core; the in-memory/no-op doubles wired here stand in for
/// whatever production backs them until an embedding binary supplies real
/// ones through `Registry::new` directly instead of calling this function.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", std::env::var("GLASSHUB_PORT").unwrap_or_else(|_| "8080".to_owned()));
    let shutdown = CancellationToken::new();

    let registry = Registry::new(
        config.clone(),
        Arc::new(InMemoryUserStore::new()),
        Arc::new(InMemoryAppStore::new()),
        Arc::new(AllowAllPermissionChecker),
        Arc::new(StaticCapabilityTable::with_defaults()),
        Arc::new(NoopAnalyticsSink),
        Arc::new(HttpWebhookClient::new(config.webhook_attempt_timeout())) as Arc<dyn crate::collaborators::WebhookClient>,
        Arc::new(NoopTranscriptionSink),
        Arc::new(NoopTranslationSink),
    );

    tracing::info!(%addr, "glasshub listening");
    let router = ws::build_router(registry);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal(shutdown)).await?;

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = token.cancelled() => {}
    }
}
