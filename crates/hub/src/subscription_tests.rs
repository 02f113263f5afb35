use super::*;
use crate::collaborators::{AllowAllPermissionChecker, AppDescriptor, AppKind, InMemoryAppStore};

fn engine(grace_ms: u64) -> Arc<SubscriptionEngine> {
    let store = Arc::new(InMemoryAppStore::new());
    store.insert(AppDescriptor {
        package_name: "acme".into(),
        public_url: "https://acme.example".into(),
        kind: AppKind::Standard,
        required_hardware: vec![],
        api_key: "k".into(),
    });
    SubscriptionEngine::new(store, Arc::new(AllowAllPermissionChecker), Duration::from_millis(grace_ms))
}

#[test]
fn parses_wire_strings() {
    assert_eq!(StreamKey::parse("audio-chunk"), StreamKey::AudioChunk);
    assert_eq!(StreamKey::parse("transcription"), StreamKey::Transcription("en-US".into()));
    assert_eq!(StreamKey::parse("transcription:es-ES"), StreamKey::Transcription("es-ES".into()));
    assert_eq!(
        StreamKey::parse("translation:en-US-to-es-ES"),
        StreamKey::Translation { source: "en-US".into(), target: "es-ES".into() }
    );
    assert_eq!(StreamKey::parse("location-update"), StreamKey::LocationStream);
    assert_eq!(StreamKey::parse("weird-thing"), StreamKey::Other("weird-thing".into()));
}

#[test]
fn needs_pcm_covers_audio_transcription_and_translation() {
    assert!(StreamKey::AudioChunk.needs_pcm());
    assert!(StreamKey::Transcription("en-US".into()).needs_pcm());
    assert!(StreamKey::Translation { source: "en-US".into(), target: "es-ES".into() }.needs_pcm());
    assert!(!StreamKey::LocationStream.needs_pcm());
}

#[tokio::test]
async fn apply_records_allowed_streams_and_newly_added() {
    let engine = engine(8_000);
    let outcome = engine
        .apply("acme", vec![SubscriptionRequest::Plain("audio-chunk".into())])
        .await
        .expect("non-empty update always applies");
    assert_eq!(outcome.allowed.len(), 1);
    assert_eq!(outcome.newly_added, vec![StreamKey::AudioChunk]);
    assert!(engine.has_pcm_media("acme").await);
}

#[tokio::test]
async fn second_apply_only_reports_the_delta_as_newly_added() {
    let engine = engine(8_000);
    engine.apply("acme", vec![SubscriptionRequest::Plain("audio-chunk".into())]).await;
    let second = engine
        .apply(
            "acme",
            vec![
                SubscriptionRequest::Plain("audio-chunk".into()),
                SubscriptionRequest::Plain("calendar-event".into()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(second.newly_added, vec![StreamKey::CalendarEvent]);
    assert_eq!(second.allowed.len(), 2);
}

#[tokio::test]
async fn empty_update_within_reconnect_grace_is_discarded() {
    let engine = engine(8_000);
    engine.apply("acme", vec![SubscriptionRequest::Plain("audio-chunk".into())]).await;
    engine.mark_app_reconnected("acme").await;

    let result = engine.apply("acme", vec![]).await;
    assert!(result.is_none(), "empty update inside grace window must be discarded");
    assert!(engine.has_pcm_media("acme").await, "prior subscriptions must survive the discarded update");
}

#[tokio::test(start_paused = true)]
async fn empty_update_outside_reconnect_grace_clears_subscriptions() {
    let engine = engine(100);
    engine.apply("acme", vec![SubscriptionRequest::Plain("audio-chunk".into())]).await;
    engine.mark_app_reconnected("acme").await;

    tokio::time::advance(Duration::from_millis(200)).await;

    let result = engine.apply("acme", vec![]).await;
    assert!(result.is_some());
    assert!(!engine.has_pcm_media("acme").await);
}

#[tokio::test]
async fn remove_subscriptions_bypasses_grace() {
    let engine = engine(60_000);
    engine.apply("acme", vec![SubscriptionRequest::Plain("audio-chunk".into())]).await;
    engine.mark_app_reconnected("acme").await;
    engine.remove_subscriptions("acme").await;
    assert!(!engine.has_pcm_media("acme").await);
}

#[tokio::test]
async fn location_with_rate_is_tracked_separately_from_plain_location() {
    let engine = engine(8_000);
    engine
        .apply(
            "acme",
            vec![SubscriptionRequest::LocationWithRate { stream: "location-stream".into(), rate: "high".into() }],
        )
        .await;
    let subs = engine.location_subscriptions().await;
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].rate, Some(LocationTier::High));
}

#[tokio::test]
async fn minimal_language_set_dedupes_across_packages() {
    let store = Arc::new(InMemoryAppStore::new());
    for name in ["acme", "beta"] {
        store.insert(AppDescriptor {
            package_name: name.into(),
            public_url: "https://x".into(),
            kind: AppKind::Standard,
            required_hardware: vec![],
            api_key: "k".into(),
        });
    }
    let engine = SubscriptionEngine::new(store, Arc::new(AllowAllPermissionChecker), Duration::from_millis(8_000));
    engine.apply("acme", vec![SubscriptionRequest::Plain("transcription:en-US".into())]).await;
    engine.apply("beta", vec![SubscriptionRequest::Plain("transcription:en-US".into())]).await;

    let langs = engine.get_minimal_language_set().await;
    assert_eq!(langs, vec!["en-US".to_owned()]);
}
