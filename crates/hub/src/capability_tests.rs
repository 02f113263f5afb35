use super::*;
use crate::collaborators::{AppDescriptor, AppKind, InMemoryAppStore, InMemoryUserStore, RequiredHardware, StaticCapabilityTable};
use crate::session::SessionBuilder;
use crate::transport::RecordingTransport;

fn descriptor(package: &str, required_hardware: Vec<RequiredHardware>) -> AppDescriptor {
    AppDescriptor {
        package_name: package.to_owned(),
        public_url: format!("https://{package}.example"),
        kind: AppKind::Standard,
        required_hardware,
        api_key: "k".to_owned(),
    }
}

fn table_with_camera_model() -> StaticCapabilityTable {
    let mut table = StaticCapabilityTable::with_defaults();
    table.insert(EffectiveCapabilities {
        model_name: "Glasshub Pro".to_owned(),
        has_camera: true,
        has_microphone: true,
        has_display: true,
        has_speaker: true,
    });
    table
}

async fn session_with(table: StaticCapabilityTable, package: &str, required_hardware: Vec<RequiredHardware>) -> (Arc<crate::session::Session>, Arc<RecordingTransport>, Arc<RecordingTransport>) {
    let app_store = Arc::new(InMemoryAppStore::new());
    app_store.insert(descriptor(package, required_hardware));
    let user_store = Arc::new(InMemoryUserStore::new());
    let session = SessionBuilder::new_test("u1", user_store as Arc<dyn crate::collaborators::UserStore>)
        .with_app_store(app_store as Arc<dyn crate::collaborators::AppStore>)
        .with_capability_table(Arc::new(table) as Arc<dyn crate::collaborators::CapabilityTable>)
        .build();

    let device = RecordingTransport::new();
    session.attach_device(device.clone()).await.unwrap();
    let app_transport = RecordingTransport::new();
    session.apps.register_connection(package, "k", "sess-1", app_transport.clone()).await.unwrap();

    (session, device, app_transport)
}

#[tokio::test(start_paused = true)]
async fn unknown_model_falls_back_to_default() {
    let (session, device, _app) = session_with(StaticCapabilityTable::with_defaults(), "cam", vec![]).await;

    session.capabilities.set_current_model("Some Unknown Headset").await;

    assert_eq!(session.capabilities.current().model_name, StaticCapabilityTable::FALLBACK_MODEL);
    assert!(device.texts().iter().any(|t| t.contains("capabilities_update") && t.contains(StaticCapabilityTable::FALLBACK_MODEL)));
}

#[tokio::test(start_paused = true)]
async fn same_model_is_a_no_op() {
    let (session, device, _app) = session_with(StaticCapabilityTable::with_defaults(), "cam", vec![]).await;
    session.capabilities.set_current_model(StaticCapabilityTable::FALLBACK_MODEL).await;
    assert!(device.texts().is_empty(), "the session boots already on the fallback model, so re-setting it is a no-op");
}

#[tokio::test(start_paused = true)]
async fn model_change_broadcasts_to_device_and_apps() {
    let (session, device, app) = session_with(table_with_camera_model(), "cam", vec![]).await;

    session.capabilities.set_current_model("Glasshub Pro").await;

    assert!(device.texts().iter().any(|t| t.contains("capabilities_update") && t.contains("Glasshub Pro")));
    assert!(app.texts().iter().any(|t| t.contains("capabilities_update") && t.contains("Glasshub Pro")));
}

#[tokio::test(start_paused = true)]
async fn incompatible_app_is_stopped_on_model_change() {
    // The fallback model has no camera; an app requiring one starts out
    // running regardless (registration doesn't sweep), but any subsequent
    // capability resolution sweeps it.
    let (session, _device, app) = session_with(StaticCapabilityTable::with_defaults(), "cam", vec![RequiredHardware::Camera]).await;

    assert!(session.apps.is_running("cam"));

    session.capabilities.set_current_model("Unrecognized Headset").await;

    assert!(!session.apps.is_running("cam"));
    assert!(app.texts().iter().any(|t| t.contains("app_stopped")));
}

#[tokio::test(start_paused = true)]
async fn compatible_app_survives_model_change() {
    let (session, _device, _app) = session_with(table_with_camera_model(), "cam", vec![RequiredHardware::Camera]).await;

    session.capabilities.set_current_model("Glasshub Pro").await;

    assert!(session.apps.is_running("cam"));
}
