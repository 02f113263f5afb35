// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios (§8) exercised against the public `Session` API,
//! with in-memory collaborator doubles and `RecordingTransport` standing in
//! for both the device and App wire endpoints.

use std::sync::Arc;

use glasshub::collaborators::{
    AppDescriptor, AppKind, FakeWebhookClient, InMemoryAppStore, InMemoryUserStore, RequiredHardware,
    StaticCapabilityTable,
};
use glasshub::messages::{AppInbound, DeviceInbound, SubscriptionRequest, VadStatus};
use glasshub::session::SessionBuilder;
use glasshub::transport::RecordingTransport;

fn descriptor(package: &str, kind: AppKind, required_hardware: Vec<RequiredHardware>) -> AppDescriptor {
    AppDescriptor {
        package_name: package.to_owned(),
        public_url: format!("https://{package}.example"),
        kind,
        required_hardware,
        api_key: "k".to_owned(),
    }
}

// 1) Subscribe -> fan-out.
#[tokio::test(start_paused = true)]
async fn subscribe_fans_out_audio_and_transcription() {
    let app_store = Arc::new(InMemoryAppStore::new());
    app_store.insert(descriptor("acme", AppKind::Standard, vec![]));
    let user_store = Arc::new(InMemoryUserStore::new());

    let session = SessionBuilder::new_test("u1", user_store).with_app_store(app_store).build();
    session.initialize().await;

    let device = RecordingTransport::new();
    session.attach_device(device.clone()).await.unwrap();

    let app = RecordingTransport::new();
    session.apps.register_connection("acme", "k", "sess-1", app.clone()).await.unwrap();

    session
        .route_app_message(
            "acme",
            AppInbound::SubscriptionUpdate {
                subscriptions: vec![
                    SubscriptionRequest::Plain("audio-chunk".to_owned()),
                    SubscriptionRequest::Plain("transcription:en-US".to_owned()),
                ],
            },
        )
        .await;

    assert!(session.subscriptions.has_pcm_media("acme").await);
    assert!(session.subscriptions.has_transcription_media("acme").await);

    tokio::time::advance(std::time::Duration::from_millis(1_100)).await;
    let mic_frames = device.texts();
    assert!(mic_frames.iter().any(|t| t.contains("microphone_state_change") && t.contains("\"isMicrophoneEnabled\":true")));

    session.audio.ingress(bytes::Bytes::from_static(&[1, 2, 3, 4])).await;
    let relayed_binary = app.frames().into_iter().any(|f| matches!(f, glasshub::transport::OutboundFrame::Binary(b) if b.as_ref() == [1, 2, 3, 4]));
    assert!(relayed_binary);
}

// 2) Reconnect grace suppresses empty.
#[tokio::test(start_paused = true)]
async fn reconnect_grace_suppresses_empty_subscription_update() {
    let app_store = Arc::new(InMemoryAppStore::new());
    app_store.insert(descriptor("bob", AppKind::Standard, vec![]));
    let user_store = Arc::new(InMemoryUserStore::new());

    let session = SessionBuilder::new_test("u2", user_store).with_app_store(app_store).build();
    session.initialize().await;

    let app = RecordingTransport::new();
    session.apps.register_connection("bob", "k", "sess-1", app.clone()).await.unwrap();

    session
        .route_app_message("bob", AppInbound::SubscriptionUpdate { subscriptions: vec![SubscriptionRequest::Plain("calendar-event".to_owned())] })
        .await;
    assert!(session.subscriptions.get_app_subscriptions("bob").await.len() == 1);

    session.subscriptions.mark_app_reconnected("bob").await;
    tokio::time::advance(std::time::Duration::from_secs(2)).await;

    session.route_app_message("bob", AppInbound::SubscriptionUpdate { subscriptions: vec![] }).await;

    assert_eq!(session.subscriptions.get_app_subscriptions("bob").await.len(), 1);
}

// 3) RTMP keep-alive timeout.
#[tokio::test(start_paused = true)]
async fn rtmp_stream_times_out_after_missed_keepalives() {
    let app_store = Arc::new(InMemoryAppStore::new());
    app_store.insert(descriptor("streamer", AppKind::Standard, vec![]));
    let user_store = Arc::new(InMemoryUserStore::new());

    let session = SessionBuilder::new_test("u3", user_store).with_app_store(app_store).build();
    session.initialize().await;

    let device = RecordingTransport::new();
    session.attach_device(device.clone()).await.unwrap();

    let app = RecordingTransport::new();
    session.apps.register_connection("streamer", "k", "sess-1", app.clone()).await.unwrap();

    let stream_id = session
        .video
        .start_rtmp_stream("streamer", "rtmp://example/live", serde_json::json!({}), serde_json::json!({}), serde_json::json!({}))
        .await
        .unwrap();

    // The device never ACKs; let enough keep-alive ticks elapse to exceed
    // both the inactivity timeout and the missed-ack threshold.
    tokio::time::advance(std::time::Duration::from_secs(70)).await;
    tokio::task::yield_now().await;
    tokio::time::advance(std::time::Duration::from_secs(70)).await;
    tokio::task::yield_now().await;

    assert_eq!(session.video.state_of(&stream_id), Some(glasshub::video::StreamState::Timeout));
    assert!(app.texts().iter().any(|t| t.contains("rtmp_stream_status") && t.contains("timeout")));
}

// 4) Photo request with custom webhook.
#[tokio::test(start_paused = true)]
async fn photo_request_with_custom_webhook_resolves_synthetically() {
    let app_store = Arc::new(InMemoryAppStore::new());
    app_store.insert(descriptor("cam", AppKind::Standard, vec![]));
    let user_store = Arc::new(InMemoryUserStore::new());
    let webhook = Arc::new(FakeWebhookClient::new());

    let session = SessionBuilder::new_test("u4", user_store)
        .with_app_store(app_store)
        .with_webhook_client(webhook.clone())
        .build();
    session.initialize().await;

    let device = RecordingTransport::new();
    session.attach_device(device.clone()).await.unwrap();

    let app = RecordingTransport::new();
    session.apps.register_connection("cam", "k", "sess-1", app.clone()).await.unwrap();

    session
        .route_app_message(
            "cam",
            AppInbound::PhotoRequest {
                package_name: "cam".to_owned(),
                request_id: "req-1".to_owned(),
                save_to_gallery: false,
                custom_webhook_url: Some("https://x/upload".to_owned()),
                auth_token: None,
                size: None,
            },
        )
        .await;

    assert!(device.texts().iter().any(|t| t.contains("photo_request") && t.contains("https://x/upload")));
    assert!(app.texts().iter().any(|t| t.contains("photo_result")));
    assert!(webhook.calls().iter().any(|(kind, _)| *kind == "photo"));
}

// 5) Model change stops incompatible App.
#[tokio::test(start_paused = true)]
async fn model_change_stops_incompatible_app() {
    let mut table = StaticCapabilityTable::with_defaults();
    table.insert(glasshub::collaborators::EffectiveCapabilities {
        model_name: "NoCamera".to_owned(),
        has_camera: false,
        has_microphone: true,
        has_display: true,
        has_speaker: false,
    });

    let app_store = Arc::new(InMemoryAppStore::new());
    app_store.insert(descriptor("needs-camera", AppKind::Standard, vec![RequiredHardware::Camera]));
    let user_store = Arc::new(InMemoryUserStore::new());

    let session = SessionBuilder::new_test("u5", user_store)
        .with_app_store(app_store)
        .with_capability_table(Arc::new(table))
        .build();
    session.initialize().await;

    let app = RecordingTransport::new();
    session.apps.register_connection("needs-camera", "k", "sess-1", app.clone()).await.unwrap();

    session.capabilities.set_current_model("NoCamera").await;

    assert!(!session.apps.is_running("needs-camera"));
    assert!(app.texts().iter().any(|t| t.contains("app_stopped")));
    assert_eq!(app.close_codes(), vec![glasshub::messages::close_code::NORMAL]);
}

// 6) Unauthorized audio.
#[tokio::test(start_paused = true)]
async fn unauthorized_audio_is_suppressed_then_refreshed() {
    let app_store = Arc::new(InMemoryAppStore::new());
    let user_store = Arc::new(InMemoryUserStore::new());

    let session = SessionBuilder::new_test("u6", user_store).with_app_store(app_store).build();
    session.initialize().await;

    let device = RecordingTransport::new();
    session.attach_device(device.clone()).await.unwrap();

    // No App is subscribed to anything PCM-needing: mic should be off and no
    // media authorized.
    session.audio.ingress(bytes::Bytes::from_static(&[9, 9])).await;
    tokio::time::advance(std::time::Duration::from_millis(1_100)).await;

    let first_count = device.texts().len();
    assert!(device.texts().iter().any(|t| t.contains("\"isMicrophoneEnabled\":false")));

    // Further bytes inside the suppression window trigger no further sends.
    session.audio.ingress(bytes::Bytes::from_static(&[9, 9])).await;
    tokio::time::advance(std::time::Duration::from_secs(1)).await;
    assert_eq!(device.texts().len(), first_count);

    tokio::time::advance(std::time::Duration::from_secs(5)).await;
    session.audio.ingress(bytes::Bytes::from_static(&[9, 9])).await;
    tokio::task::yield_now().await;
    // Aggregates refresh before detection resumes; still no media
    // subscribers, so the mic stays off and no panic/hang occurs.
    assert!(!session.microphone.is_enabled());
}

// Universal property: aggregates reflect the currently-applied set exactly.
#[tokio::test(start_paused = true)]
async fn aggregates_match_applied_subscription_set() {
    let app_store = Arc::new(InMemoryAppStore::new());
    app_store.insert(descriptor("x", AppKind::Background, vec![]));
    let user_store = Arc::new(InMemoryUserStore::new());

    let session = SessionBuilder::new_test("u7", user_store).with_app_store(app_store).build();
    session.initialize().await;
    let app = RecordingTransport::new();
    session.apps.register_connection("x", "k", "sess-1", app).await.unwrap();

    session
        .route_app_message("x", AppInbound::SubscriptionUpdate { subscriptions: vec![SubscriptionRequest::Plain("audio-chunk".to_owned())] })
        .await;
    assert!(session.subscriptions.apps_needing_pcm().await.contains(&"x".to_owned()));

    session.route_app_message("x", AppInbound::SubscriptionUpdate { subscriptions: vec![] }).await;
    assert!(!session.subscriptions.apps_needing_pcm().await.contains(&"x".to_owned()));
}

// Universal property: VAD messages route without panicking even with no app attached.
#[tokio::test(start_paused = true)]
async fn vad_message_routes_without_a_running_app() {
    let app_store = Arc::new(InMemoryAppStore::new());
    let user_store = Arc::new(InMemoryUserStore::new());
    let session = SessionBuilder::new_test("u8", user_store).with_app_store(app_store).build();
    session.initialize().await;

    session.route_device_message(DeviceInbound::Vad { status: VadStatus(true) }).await;
}
