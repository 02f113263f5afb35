use super::*;
use crate::collaborators::{
    AllowAllPermissionChecker, AppDescriptor, AppKind, FakeWebhookClient, InMemoryAppStore, NoopAnalyticsSink,
    NoopDisplayManager, RequiredHardware,
};
use crate::transport::RecordingTransport;

fn descriptor(package: &str, kind: AppKind) -> AppDescriptor {
    AppDescriptor {
        package_name: package.to_owned(),
        public_url: format!("https://{package}.example"),
        kind,
        required_hardware: vec![],
        api_key: "k".to_owned(),
    }
}

fn manager(store: Arc<InMemoryAppStore>, webhook: Arc<FakeWebhookClient>, deadline_ms: u64) -> Arc<AppConnectionManager> {
    let subscriptions =
        SubscriptionEngine::new(Arc::clone(&store) as Arc<dyn AppStore>, Arc::new(AllowAllPermissionChecker), Duration::from_millis(8_000));
    AppConnectionManager::new(
        "u1",
        store as Arc<dyn AppStore>,
        webhook,
        Arc::new(NoopAnalyticsSink),
        Arc::new(NoopDisplayManager),
        subscriptions,
        Duration::from_millis(deadline_ms),
        2,
        Duration::from_millis(1_000),
        Duration::from_millis(5_000),
    )
}

#[tokio::test]
async fn start_app_fails_not_found_for_unknown_package() {
    let store = Arc::new(InMemoryAppStore::new());
    let mgr = manager(Arc::clone(&store), Arc::new(FakeWebhookClient::new()), 1_000);
    let err = mgr.start_app("missing").await.unwrap_err();
    assert_eq!(err, HubError::NotFound);
}

#[tokio::test]
async fn start_app_waits_for_register_connection_then_succeeds() {
    let store = Arc::new(InMemoryAppStore::new());
    store.insert(descriptor("acme", AppKind::Standard));
    let webhook = Arc::new(FakeWebhookClient::new());
    let mgr = manager(Arc::clone(&store), Arc::clone(&webhook), 2_000);

    let mgr2 = Arc::clone(&mgr);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let transport = RecordingTransport::new();
        mgr2.register_connection("acme", "k", "sess-1", transport).await.unwrap();
    });

    mgr.start_app("acme").await.unwrap();
    assert!(mgr.is_running("acme"));
    assert_eq!(webhook.calls(), vec![("start", "acme".to_owned())]);
}

#[tokio::test]
async fn start_app_is_idempotent_once_running() {
    let store = Arc::new(InMemoryAppStore::new());
    store.insert(descriptor("acme", AppKind::Standard));
    let webhook = Arc::new(FakeWebhookClient::new());
    let mgr = manager(Arc::clone(&store), Arc::clone(&webhook), 2_000);

    mgr.register_connection("acme", "k", "sess-1", RecordingTransport::new()).await.unwrap();
    mgr.start_app("acme").await.unwrap();

    assert!(webhook.calls().is_empty(), "no webhook call should fire for an already-running app");
}

#[tokio::test]
async fn register_connection_rejects_wrong_api_key_and_closes() {
    let store = Arc::new(InMemoryAppStore::new());
    store.insert(descriptor("acme", AppKind::Standard));
    let mgr = manager(Arc::clone(&store), Arc::new(FakeWebhookClient::new()), 1_000);

    let transport = RecordingTransport::new();
    let err = mgr.register_connection("acme", "wrong-key", "sess-1", transport.clone()).await.unwrap_err();
    assert_eq!(err, HubError::Auth);
    assert_eq!(transport.close_codes(), vec![crate::messages::close_code::POLICY_VIOLATION]);
}

#[tokio::test]
async fn starting_a_second_standard_app_stops_the_first() {
    let store = Arc::new(InMemoryAppStore::new());
    store.insert(descriptor("first", AppKind::Standard));
    store.insert(descriptor("second", AppKind::Standard));
    let webhook = Arc::new(FakeWebhookClient::new());
    let mgr = manager(Arc::clone(&store), Arc::clone(&webhook), 2_000);

    mgr.register_connection("first", "k", "sess-1", RecordingTransport::new()).await.unwrap();
    assert!(mgr.is_running("first"));

    let mgr2 = Arc::clone(&mgr);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr2.register_connection("second", "k", "sess-1", RecordingTransport::new()).await.unwrap();
    });
    mgr.start_app("second").await.unwrap();

    assert!(!mgr.is_running("first"));
    assert!(mgr.is_running("second"));
}

#[tokio::test]
async fn start_app_returns_webhook_failure_error_after_webhook_exhausts_retries() {
    let store = Arc::new(InMemoryAppStore::new());
    store.insert(descriptor("acme", AppKind::Standard));
    let webhook = Arc::new(FakeWebhookClient::new());
    webhook.fail_next(2);
    let mgr = manager(Arc::clone(&store), Arc::clone(&webhook), 5_000);

    let err = mgr.start_app("acme").await.unwrap_err();
    assert!(matches!(err, HubError::WebhookFailure(_)));
    assert_eq!(mgr.state_of("acme"), Some(AppLifecycleState::Disconnected));
}

#[tokio::test]
async fn stop_app_clears_subscriptions_and_running_state() {
    let store = Arc::new(InMemoryAppStore::new());
    store.insert(descriptor("acme", AppKind::Standard));
    let mgr = manager(Arc::clone(&store), Arc::new(FakeWebhookClient::new()), 1_000);
    let transport = RecordingTransport::new();

    mgr.register_connection("acme", "k", "sess-1", transport.clone()).await.unwrap();
    mgr.stop_app("acme").await.unwrap();

    assert!(!mgr.is_running("acme"));
    assert!(transport.texts().iter().any(|t| t.contains("app_stopped")));
    assert_eq!(transport.close_codes(), vec![crate::messages::close_code::NORMAL]);
}

#[tokio::test]
async fn start_app_with_required_hardware_still_times_out_without_a_connection() {
    // No Session is bound in this unit test, so the hardware-compatibility
    // check (which needs `Session::get_capabilities`) is skipped entirely;
    // this only exercises that `required_hardware` round-trips without
    // panicking and that an unanswered start still surfaces as a timeout.
    let store = Arc::new(InMemoryAppStore::new());
    let mut app = descriptor("acme", AppKind::Standard);
    app.required_hardware = vec![RequiredHardware::Camera];
    store.insert(app);
    let mgr = manager(Arc::clone(&store), Arc::new(FakeWebhookClient::new()), 200);
    let err = mgr.start_app("acme").await.unwrap_err();
    assert!(matches!(err, HubError::Timeout(_)));
}
