use super::*;

#[test]
fn tier_ordering_matches_spec_hierarchy() {
    assert!(LocationTier::Reduced < LocationTier::ThreeKilometers);
    assert!(LocationTier::ThreeKilometers < LocationTier::Kilometer);
    assert!(LocationTier::Kilometer < LocationTier::HundredMeters);
    assert!(LocationTier::HundredMeters < LocationTier::TenMeters);
    assert!(LocationTier::TenMeters < LocationTier::Standard);
    assert!(LocationTier::Standard < LocationTier::High);
    assert!(LocationTier::High < LocationTier::Realtime);
}

#[test]
fn freshness_table_matches_spec() {
    assert_eq!(LocationTier::Realtime.max_age(), Duration::from_millis(1_000));
    assert_eq!(LocationTier::High.max_age(), Duration::from_millis(10_000));
    assert_eq!(LocationTier::Standard.max_age(), Duration::from_millis(30_000));
    assert_eq!(LocationTier::TenMeters.max_age(), Duration::from_millis(30_000));
    assert_eq!(LocationTier::HundredMeters.max_age(), Duration::from_millis(60_000));
    assert_eq!(LocationTier::Kilometer.max_age(), Duration::from_millis(300_000));
    assert_eq!(LocationTier::ThreeKilometers.max_age(), Duration::from_millis(900_000));
    assert_eq!(LocationTier::Reduced.max_age(), Duration::from_millis(900_000));
}

#[test]
fn parses_plain_and_expo_style_payloads() {
    let now = Instant::now();
    let plain = serde_json::json!({"lat": 1.0, "lng": 2.0, "accuracy": 5.0});
    let loc = parse_location_payload(&plain, now).unwrap();
    assert_eq!(loc.lat, 1.0);
    assert_eq!(loc.lng, 2.0);

    let expo = serde_json::json!({"latitude": 3.0, "longitude": 4.0, "altitude": 10.0});
    let loc2 = parse_location_payload(&expo, now).unwrap();
    assert_eq!(loc2.lat, 3.0);
    assert_eq!(loc2.lng, 4.0);
}

#[test]
fn rejects_non_finite_payloads() {
    let now = Instant::now();
    let bad = serde_json::json!({"lat": f64::NAN, "lng": 1.0});
    assert!(parse_location_payload(&bad, now).is_none());
}

#[tokio::test(start_paused = true)]
async fn handle_poll_request_responds_immediately_when_fresh() {
    use crate::collaborators::InMemoryUserStore;
    use crate::session::SessionBuilder;
    use crate::transport::RecordingTransport;

    let store = Arc::new(InMemoryUserStore::new());
    let session = SessionBuilder::new_test("u1", Arc::clone(&store) as Arc<dyn UserStore>).build();
    let device = RecordingTransport::new();
    session.attach_device(device.clone()).await.unwrap();

    session
        .location
        .update_from_api(
            NormalizedLocation { lat: 1.0, lng: 2.0, accuracy: None, timestamp: Instant::now() },
            None,
        )
        .await;

    session
        .location
        .handle_poll_request("standard", "corr-1".into(), "acme".into())
        .await;

    let texts = device.texts();
    // No REQUEST_SINGLE_LOCATION should have been sent to the device, since the
    // cached fix is fresh for the "standard" tier.
    assert!(!texts.iter().any(|t| t.contains("request_single_location")));
}

#[tokio::test(start_paused = true)]
async fn handle_poll_request_polls_device_when_stale() {
    use crate::collaborators::InMemoryUserStore;
    use crate::session::SessionBuilder;
    use crate::transport::RecordingTransport;

    let store = Arc::new(InMemoryUserStore::new());
    let session = SessionBuilder::new_test("u1", Arc::clone(&store) as Arc<dyn UserStore>).build();
    let device = RecordingTransport::new();
    session.attach_device(device.clone()).await.unwrap();

    session
        .location
        .handle_poll_request("realtime", "corr-2".into(), "acme".into())
        .await;

    let texts = device.texts();
    assert!(texts.iter().any(|t| t.contains("request_single_location") && t.contains("corr-2")));
}
