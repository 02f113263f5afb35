use super::*;
use crate::collaborators::{AppDescriptor, AppKind, InMemoryAppStore, InMemoryUserStore};
use crate::messages::{DeviceInbound, VadStatus};
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

async fn session_with_app(package: &str) -> (Arc<Session>, Arc<RecordingTransport>, Arc<RecordingTransport>) {
    let app_store = Arc::new(InMemoryAppStore::new());
    app_store.insert(descriptor(package));
    let user_store = Arc::new(InMemoryUserStore::new());
    let session = SessionBuilder::new_test("u1", user_store as Arc<dyn UserStore>)
        .with_app_store(app_store as Arc<dyn AppStore>)
        .build();
    session.initialize().await;

    let device = RecordingTransport::new();
    session.attach_device(device.clone()).await.unwrap();
    let app_transport = RecordingTransport::new();
    session.apps.register_connection(package, "k", "sess-1", app_transport.clone()).await.unwrap();

    (session, device, app_transport)
}

#[tokio::test(start_paused = true)]
async fn attach_device_cancels_pending_reconnect_grace() {
    let (session, device, _app) = session_with_app("tracker").await;

    session.detach_device("transport dropped").await;
    assert!(session.device_transport().is_none());

    let reattached = RecordingTransport::new();
    session.attach_device(reattached.clone()).await.unwrap();

    // The reconnect-grace timer (60s default) must not fire and dispose the
    // session now that a fresh device transport is attached.
    tokio::time::advance(Duration::from_secs(61)).await;
    tokio::task::yield_now().await;

    assert!(!session.is_disposed());
    let _ = device;
}

#[tokio::test(start_paused = true)]
async fn detach_without_reattach_disposes_after_grace() {
    let (session, _device, _app) = session_with_app("tracker").await;

    session.detach_device("transport dropped").await;
    tokio::time::advance(Duration::from_secs(61)).await;
    tokio::task::yield_now().await;

    assert!(session.is_disposed());
}

#[tokio::test(start_paused = true)]
async fn dispose_is_idempotent_and_stops_running_apps() {
    let (session, device, app) = session_with_app("tracker").await;
    assert!(session.apps.is_running("tracker"));

    session.dispose("shutting down").await;
    session.dispose("shutting down again").await;

    assert!(session.is_disposed());
    assert!(!session.apps.is_running("tracker"));
    assert!(app.texts().iter().any(|t| t.contains("app_stopped")));
    assert_eq!(device.close_codes(), vec![close_code::NORMAL]);
}

#[tokio::test(start_paused = true)]
async fn route_device_message_dispatches_vad_without_panicking() {
    let (session, _device, _app) = session_with_app("tracker").await;
    session.route_device_message(DeviceInbound::Vad { status: VadStatus(true) }).await;
}

#[tokio::test(start_paused = true)]
async fn relay_to_apps_reaches_subscribed_package_only() {
    let (session, _device, app) = session_with_app("tracker").await;
    session
        .subscriptions
        .apply("tracker", vec![SubscriptionRequest::Plain("calendar-event".to_owned())])
        .await;

    session.relay_to_apps("calendar-event", serde_json::json!({"title": "standup"})).await;

    assert!(app.texts().iter().any(|t| t.contains("data_stream") && t.contains("standup")));
}

#[tokio::test(start_paused = true)]
async fn send_to_device_is_a_no_op_once_disposed() {
    let (session, device, _app) = session_with_app("tracker").await;
    session.dispose("done").await;

    session.send_error_to_device("INTERNAL_ERROR", "late message");
    // The close frame from dispose is the only frame; the post-dispose send
    // above must not add another text frame on a transport marked closed.
    assert!(device.texts().is_empty());
}
