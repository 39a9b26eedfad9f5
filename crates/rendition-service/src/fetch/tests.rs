use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;

use crate::caching::{CacheCoordinator, CacheKey, MemoryStore, PersistentStore};
use crate::config::Config;
use crate::decode::{ImageDecoder, Payload};
use crate::services::Services;
use crate::test::{self, Blob, RecordingDecoder};

use super::*;

/// A config without any persistent cache.
fn config() -> Config {
    Config {
        cache_dir: None,
        fallback_cache_dir: None,
        ..Default::default()
    }
}

fn coordinator(config: &Config) -> (FetchCoordinator<RecordingDecoder>, Arc<RecordingDecoder>) {
    let runtime = Handle::current();
    let decoder = Arc::new(RecordingDecoder::default());
    let persistent = config
        .cache_dir
        .as_ref()
        .map(|dir| PersistentStore::open(&[dir.clone()], 1, 1 << 20).unwrap());
    let cache = CacheCoordinator::new(
        Arc::new(MemoryStore::new(1 << 20)),
        persistent,
        decoder.clone(),
        runtime.clone(),
        config.caches.repopulate_memory_on_disk_hit,
    );
    let downloader = DownloadService::new(config, runtime.clone()).unwrap();
    let failures = FailureRecord::from_config(&config.fetch);

    (
        FetchCoordinator::new(cache, downloader, failures, runtime),
        decoder,
    )
}

fn resource(server: &test::HitCounter, path: &str) -> ResourceId {
    ResourceId::new(server.url(path).as_str())
}

async fn next_outcome(
    outcomes: &mut mpsc::UnboundedReceiver<Outcome<Blob>>,
) -> CacheContents<Arc<Blob>> {
    let (_, result) = outcomes.recv().await.unwrap();
    result
}

#[tokio::test]
async fn test_concurrent_requests_share_fetch() {
    test::setup();
    let server = test::HitCounter::new();
    let (coordinator, decoder) = coordinator(&config());
    let id = resource(&server, "/delay/100ms/bytes/img.png");
    let size = Dimensions::hint(100, 100);

    let mut channels = vec![];
    for _ in 0..5 {
        let (listener, outcomes) = ChannelListener::channel();
        assert_eq!(coordinator.resolve(&id, &listener, size), Resolution::Pending);
        channels.push((listener, outcomes));
    }
    assert!(coordinator.is_fetching(&id));
    assert_eq!(coordinator.waiter_count(&id), 5);

    let mut payloads = vec![];
    for (_listener, outcomes) in &mut channels {
        payloads.push(next_outcome(outcomes).await.unwrap());
    }

    assert!(payloads.iter().all(|p| Arc::ptr_eq(p, &payloads[0])));
    assert_eq!(payloads[0].data, b"img.png");
    assert_eq!(payloads[0].size_hint, size);
    assert_eq!(server.hits("/delay/100ms/bytes/img.png"), 1);
    assert_eq!(decoder.decodes(), 1);
    assert!(!coordinator.is_fetching(&id));
}

#[tokio::test]
async fn test_memory_hit_after_fetch() {
    test::setup();
    let server = test::HitCounter::new();
    let (coordinator, _) = coordinator(&config());
    let id = resource(&server, "/bytes/img.png");

    let fetched = coordinator.fetch(&id, None).await.unwrap();
    assert_eq!(server.accesses(), 1);

    let (listener, mut outcomes) = ChannelListener::channel();
    assert_eq!(coordinator.resolve(&id, &listener, None), Resolution::Found);

    // delivered before `resolve` returned
    let (_, result) = outcomes.try_recv().unwrap();
    assert!(Arc::ptr_eq(&result.unwrap(), &fetched));
    assert!(!coordinator.is_fetching(&id));
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_different_size_hints_decode_full_size() {
    test::setup();
    let server = test::HitCounter::new();
    let (coordinator, decoder) = coordinator(&config());
    let id = resource(&server, "/delay/100ms/bytes/img.png");

    let (small, mut small_outcomes) = ChannelListener::channel();
    let (large, mut large_outcomes) = ChannelListener::channel();
    coordinator.resolve(&id, &small, Dimensions::hint(10, 10));
    coordinator.resolve(&id, &large, Dimensions::hint(500, 500));

    let small_payload = next_outcome(&mut small_outcomes).await.unwrap();
    let large_payload = next_outcome(&mut large_outcomes).await.unwrap();

    assert!(Arc::ptr_eq(&small_payload, &large_payload));
    assert_eq!(small_payload.size_hint, None);
    assert_eq!(decoder.decodes(), 1);
    assert!(
        coordinator
            .cache()
            .memory()
            .contains(&CacheKey::for_resource(&id))
    );
}

#[tokio::test]
async fn test_cancel_one_waiter() {
    test::setup();
    let server = test::HitCounter::new();
    let (coordinator, _) = coordinator(&config());
    let id = resource(&server, "/delay/200ms/bytes/img.png");

    let (first, mut first_outcomes) = ChannelListener::channel();
    let (second, mut second_outcomes) = ChannelListener::channel();
    let (third, mut third_outcomes) = ChannelListener::channel();
    coordinator.resolve(&id, &first, None);
    coordinator.resolve(&id, &second, None);
    coordinator.resolve(&id, &third, None);

    assert!(coordinator.cancel(&first, &id));
    assert!(!coordinator.cancel(&first, &id));
    assert!(coordinator.is_fetching(&id));
    assert_eq!(coordinator.waiter_count(&id), 2);

    assert!(next_outcome(&mut second_outcomes).await.is_ok());
    assert!(next_outcome(&mut third_outcomes).await.is_ok());
    assert!(first_outcomes.try_recv().is_err());
    assert_eq!(server.hits("/delay/200ms/bytes/img.png"), 1);
}

#[tokio::test]
async fn test_cancel_last_waiter_aborts_fetch() {
    test::setup();
    let server = test::HitCounter::new();
    let (coordinator, decoder) = coordinator(&config());
    let id = resource(&server, "/delay/200ms/bytes/img.png");

    let (listener, mut outcomes) = ChannelListener::channel();
    assert_eq!(coordinator.resolve(&id, &listener, None), Resolution::Pending);
    assert!(coordinator.cancel(&listener, &id));
    assert!(!coordinator.is_fetching(&id));

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(outcomes.try_recv().is_err());
    assert_eq!(decoder.decodes(), 0);
    assert!(coordinator.cache().memory().is_empty());
    assert!(!coordinator.failures().contains(&id));
}

#[tokio::test]
async fn test_cancel_all() {
    test::setup();
    let server = test::HitCounter::new();
    let (coordinator, _) = coordinator(&config());
    let a = resource(&server, "/delay/200ms/bytes/a.png");
    let b = resource(&server, "/delay/200ms/bytes/b.png");

    let (listener, _outcomes) = ChannelListener::channel();
    let (other, mut other_outcomes) = ChannelListener::channel();
    coordinator.resolve(&a, &listener, None);
    coordinator.resolve(&b, &listener, None);
    coordinator.resolve(&b, &other, None);

    assert_eq!(coordinator.cancel_all(&listener), 2);
    assert!(!coordinator.is_fetching(&a));
    assert!(coordinator.is_fetching(&b));
    assert!(next_outcome(&mut other_outcomes).await.is_ok());
}

#[tokio::test]
async fn test_dropped_fetch_cancels() {
    test::setup();
    let server = test::HitCounter::new();
    let (coordinator, _) = coordinator(&config());
    let id = resource(&server, "/delay/500ms/bytes/img.png");

    let result = tokio::time::timeout(Duration::from_millis(50), coordinator.fetch(&id, None)).await;

    assert!(result.is_err());
    assert!(!coordinator.is_fetching(&id));
}

#[tokio::test]
async fn test_released_listener() {
    test::setup();
    let server = test::HitCounter::new();
    let (coordinator, _) = coordinator(&config());
    let id = resource(&server, "/delay/100ms/bytes/img.png");

    let (released, mut released_outcomes) = ChannelListener::channel();
    let (kept, mut kept_outcomes) = ChannelListener::channel();
    coordinator.resolve(&id, &released, None);
    coordinator.resolve(&id, &kept, None);
    drop(released);

    assert!(next_outcome(&mut kept_outcomes).await.is_ok());
    // the sender went away together with the listener, without delivering anything
    assert!(released_outcomes.recv().await.is_none());
}

#[tokio::test]
async fn test_retry_policy_never() {
    test::setup();
    let server = test::HitCounter::new();
    let mut config = config();
    config.fetch.retry_policy = RetryPolicy::Never;
    let (coordinator, _) = coordinator(&config);
    let id = resource(&server, "/respond_statuscode/404/img.png");

    let result = coordinator.fetch(&id, None).await;
    assert_eq!(result.unwrap_err(), CacheError::NotFound);
    assert!(coordinator.failures().contains(&id));

    let (listener, mut outcomes) = ChannelListener::channel();
    assert_eq!(coordinator.resolve(&id, &listener, None), Resolution::Failed);
    let (_, result) = outcomes.try_recv().unwrap();
    assert!(matches!(result, Err(CacheError::DownloadError(_))));

    assert_eq!(server.hits("/respond_statuscode/404/img.png"), 1);
}

#[tokio::test]
async fn test_retry_policy_always() {
    test::setup();
    let server = test::HitCounter::new();
    let mut config = config();
    config.fetch.retry_policy = RetryPolicy::Always;
    let (coordinator, _) = coordinator(&config);
    let id = resource(&server, "/respond_statuscode/404/img.png");

    assert_eq!(coordinator.fetch(&id, None).await.unwrap_err(), CacheError::NotFound);
    assert_eq!(coordinator.fetch(&id, None).await.unwrap_err(), CacheError::NotFound);

    assert!(coordinator.failures().contains(&id));
    assert_eq!(server.hits("/respond_statuscode/404/img.png"), 2);
}

#[tokio::test]
async fn test_backoff_and_invalidate() {
    test::setup();
    let server = test::HitCounter::new();
    let (coordinator, _) = coordinator(&config());
    let id = resource(&server, "/respond_statuscode/500/img.png");

    let result = coordinator.fetch(&id, None).await;
    assert!(matches!(result, Err(CacheError::DownloadError(_))));
    // server errors are retried by the downloader
    assert_eq!(server.hits("/respond_statuscode/500/img.png"), 3);

    let result = coordinator.fetch(&id, None).await;
    assert!(matches!(result, Err(CacheError::DownloadError(_))));
    assert_eq!(server.hits("/respond_statuscode/500/img.png"), 3);

    coordinator.invalidate(&id).await;
    assert!(!coordinator.failures().contains(&id));
    let _ = coordinator.fetch(&id, None).await;
    assert_eq!(server.hits("/respond_statuscode/500/img.png"), 6);
}

#[tokio::test]
async fn test_immediate_failures() {
    test::setup();
    let (coordinator, _) = coordinator(&config());

    for raw in ["", "ftp://example.com/img.png", "relative/img.png"] {
        let id = ResourceId::new(raw);
        let (listener, mut outcomes) = ChannelListener::channel();

        assert_eq!(coordinator.resolve(&id, &listener, None), Resolution::Failed);
        let (_, result) = outcomes.try_recv().unwrap();
        assert!(matches!(result, Err(CacheError::Unsupported(_))));
        assert!(!coordinator.is_fetching(&id));
    }
}

#[tokio::test]
async fn test_local_sources_are_not_persisted() {
    test::setup();
    let cache_dir = test::tempdir();
    let files = test::tempdir();
    std::fs::create_dir_all(files.path().join("icons")).unwrap();
    std::fs::write(files.path().join("image.bin"), b"from a file").unwrap();
    std::fs::write(files.path().join("icons/logo.bin"), b"from an asset").unwrap();

    let mut config = config();
    config.cache_dir = Some(cache_dir.path().to_owned());
    config.assets_dir = Some(files.path().to_owned());
    let (coordinator, _) = coordinator(&config);

    let file = ResourceId::new(files.path().join("image.bin").to_str().unwrap());
    let payload = coordinator.fetch(&file, None).await.unwrap();
    assert_eq!(payload.data, b"from a file");

    let asset = ResourceId::new("asset:///icons/logo.bin");
    let payload = coordinator.fetch(&asset, None).await.unwrap();
    assert_eq!(payload.data, b"from an asset");

    let missing = ResourceId::new("asset:///icons/missing.bin");
    let result = coordinator.fetch(&missing, None).await;
    assert_eq!(result.unwrap_err(), CacheError::NotFound);

    assert!(coordinator.cache().persistent().unwrap().is_empty());
}

#[tokio::test]
async fn test_decode_failure() {
    test::setup();
    let files = test::tempdir();
    let path = files.path().join("broken.png");
    std::fs::write(&path, b"garbage, not an image").unwrap();
    let (coordinator, decoder) = coordinator(&config());

    let id = ResourceId::new(path.to_str().unwrap());
    let result = coordinator.fetch(&id, None).await;

    assert!(matches!(result, Err(CacheError::Malformed(_))));
    assert!(coordinator.failures().contains(&id));
    assert_eq!(decoder.decodes(), 1);
}

#[tokio::test]
async fn test_network_bytes_are_persisted() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let mut config = config();
    config.cache_dir = Some(cache_dir.path().to_owned());
    let (coordinator, decoder) = coordinator(&config);
    let id = resource(&server, "/bytes/img.png");

    coordinator.fetch(&id, None).await.unwrap();
    let store = coordinator.cache().persistent().unwrap();
    assert!(store.contains(&CacheKey::for_resource(&id)));

    coordinator.on_low_memory();
    assert!(coordinator.cache().memory().is_empty());

    // served from disk, and written back to memory
    let payload = coordinator.fetch(&id, None).await.unwrap();
    assert_eq!(payload.data, b"img.png");
    assert_eq!(server.hits("/bytes/img.png"), 1);
    assert_eq!(decoder.decodes(), 2);
    assert_eq!(coordinator.cache().memory().len(), 1);
}

#[tokio::test]
async fn test_disk_hit_without_repopulate() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let mut config = config();
    config.cache_dir = Some(cache_dir.path().to_owned());
    config.caches.repopulate_memory_on_disk_hit = false;
    let (coordinator, decoder) = coordinator(&config);
    let id = resource(&server, "/bytes/img.png");

    // fresh downloads always end up in memory
    coordinator.fetch(&id, None).await.unwrap();
    assert_eq!(coordinator.cache().memory().len(), 1);

    coordinator.on_low_memory();
    let payload = coordinator.fetch(&id, None).await.unwrap();

    assert_eq!(payload.data, b"img.png");
    assert_eq!(server.hits("/bytes/img.png"), 1);
    assert_eq!(decoder.decodes(), 2);
    assert!(coordinator.cache().memory().is_empty());
}

#[tokio::test]
async fn test_undecodable_disk_entry_is_refetched() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let mut config = config();
    config.cache_dir = Some(cache_dir.path().to_owned());
    config.fetch.retry_policy = RetryPolicy::Never;
    let (coordinator, decoder) = coordinator(&config);
    let id = resource(&server, "/bytes/img.png");
    let key = CacheKey::for_resource(&id);

    coordinator
        .cache()
        .persist(key.clone(), Bytes::from_static(b"garbage"))
        .await;
    assert!(coordinator.cache().persistent().unwrap().contains(&key));

    let payload = coordinator.fetch(&id, None).await.unwrap();
    assert_eq!(payload.data, b"img.png");
    assert_eq!(server.hits("/bytes/img.png"), 1);
    assert_eq!(decoder.decodes(), 2);
    assert!(!coordinator.failures().contains(&id));

    // the broken entry was replaced by the downloaded bytes
    coordinator.on_low_memory();
    let payload = coordinator.fetch(&id, None).await.unwrap();
    assert_eq!(payload.data, b"img.png");
    assert_eq!(server.hits("/bytes/img.png"), 1);
}

#[tokio::test]
async fn test_services_decode_images() {
    test::setup();
    let server = test::HitCounter::new();
    let services = Services::new(config(), ImageDecoder, Handle::current()).unwrap();
    let id = resource(&server, "/image/64/32.png");

    let image = services
        .fetcher()
        .fetch(&id, Dimensions::hint(16, 8))
        .await
        .unwrap();

    assert_eq!(image.dimensions(), Dimensions::new(32, 16));
    assert_eq!(image.original_dimensions(), Some(Dimensions::new(64, 32)));
    assert!(
        services
            .cache()
            .lookup_memory(&id, Dimensions::hint(16, 8))
            .is_some()
    );
}
