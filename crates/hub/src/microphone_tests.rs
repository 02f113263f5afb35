use super::*;
use crate::collaborators::{AppDescriptor, AppKind, InMemoryAppStore, InMemoryUserStore};
use crate::session::SessionBuilder;
use crate::transport::RecordingTransport;

fn descriptor(package: &str) -> AppDescriptor {
    AppDescriptor {
        package_name: package.to_owned(),
        public_url: format!("https://{package}.example"),
        kind: AppKind::Standard,
        required_hardware: vec![],
        api_key: "k".to_owned(),
    }
}

async fn running_session(package: &str) -> (Arc<crate::session::Session>, std::sync::Arc<RecordingTransport>) {
    let app_store = Arc::new(InMemoryAppStore::new());
    app_store.insert(descriptor(package));
    let user_store = Arc::new(InMemoryUserStore::new());
    let session = SessionBuilder::new_test("u1", user_store as Arc<dyn crate::collaborators::UserStore>)
        .with_app_store(app_store as Arc<dyn crate::collaborators::AppStore>)
        .build();

    let device = RecordingTransport::new();
    session.attach_device(device.clone()).await.unwrap();

    let app_transport = RecordingTransport::new();
    session.apps.register_connection(package, "k", "sess-1", app_transport.clone()).await.unwrap();

    (session, device)
}

#[tokio::test(start_paused = true)]
async fn first_subscription_change_sends_immediately() {
    let (session, device) = running_session("transcriber").await;

    session.microphone.on_subscription_change(true, true);
    tokio::time::advance(Duration::from_millis(150)).await;
    tokio::task::yield_now().await;

    assert!(device.texts().iter().any(|t| t.contains("microphone_state_change") && t.contains("\"isMicrophoneEnabled\":true")));
    assert!(session.microphone.is_enabled());
}

#[tokio::test(start_paused = true)]
async fn bursty_subscription_changes_coalesce_within_debounce_window() {
    let (session, device) = running_session("transcriber").await;

    session.microphone.on_subscription_change(true, true);
    session.microphone.on_subscription_change(false, false);
    session.microphone.on_subscription_change(true, true);

    tokio::time::advance(Duration::from_millis(150)).await;
    tokio::task::yield_now().await;

    let sends = device.texts().iter().filter(|t| t.contains("microphone_state_change")).count();
    assert!(sends <= 2, "debounce should coalesce the burst instead of sending every intermediate state");
    assert!(session.microphone.is_enabled());
}

#[tokio::test(start_paused = true)]
async fn turning_off_holds_down_before_disabling() {
    let (session, device) = running_session("transcriber").await;

    session.microphone.force_refresh(true, true).await;
    tokio::time::advance(Duration::from_millis(10)).await;
    tokio::task::yield_now().await;
    assert!(session.microphone.is_enabled());

    session.microphone.force_refresh(false, false).await;
    tokio::task::yield_now().await;
    assert!(session.microphone.is_enabled(), "holddown should keep the mic on immediately after media stops");

    tokio::time::advance(Duration::from_secs(31)).await;
    tokio::task::yield_now().await;
    assert!(!session.microphone.is_enabled());
    assert!(device.texts().iter().any(|t| t.contains("\"isMicrophoneEnabled\":false")));
}

#[tokio::test(start_paused = true)]
async fn unauthorized_audio_forces_off_and_suppresses_then_refreshes() {
    let (session, _device) = running_session("transcriber").await;

    session.microphone.on_audio_received().await;
    assert!(!session.microphone.is_enabled());

    tokio::time::advance(Duration::from_secs(11)).await;
    tokio::task::yield_now().await;

    // Suppression window elapsed; a further audio event now triggers a
    // re-evaluation against the current (empty) subscription aggregates.
    session.microphone.on_audio_received().await;
    tokio::task::yield_now().await;
    assert!(!session.microphone.is_enabled());
}

#[tokio::test(start_paused = true)]
async fn dispose_cancels_pending_timers_without_panicking() {
    let (session, _device) = running_session("transcriber").await;
    session.microphone.on_subscription_change(true, true);
    session.microphone.dispose();
    tokio::time::advance(Duration::from_secs(1)).await;
    tokio::task::yield_now().await;
}
