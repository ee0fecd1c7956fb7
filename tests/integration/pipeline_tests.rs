//! End-to-end loading through the TileManager.
//!
//! Tests verify:
//! - Concurrent requests for one tile fetch it once
//! - Failures are remembered and not requested again
//! - A panicking provider still finalizes its tile
//! - Reset and dispose stop all loading

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use map_tile_pipeline::error::{SourceError, TileError};
use map_tile_pipeline::loader::TileEventKind;
use map_tile_pipeline::tile::TileKey;
use map_tile_pipeline::{LoaderConfig, MapProvider, RequestStatus, TileManager};

use super::test_utils::{
    count_events, drain_events, manager_at, within, wait_until, MockProvider, PaintingProvider,
    TEST_TILE_SIZE,
};

// =============================================================================
// Loading
// =============================================================================

#[tokio::test]
async fn test_load_fetches_and_caches_image() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("osm").with_color([10, 20, 30, 255]);
    let fetches = provider.counter();
    let provider = provider.shared();
    let manager = manager_at(dir.path(), 2);

    let key = TileKey::new("osm", 2, 1, 3);
    let image = within(manager.load(key.clone(), &provider)).await.unwrap();

    assert_eq!(image.dimensions(), (TEST_TILE_SIZE, TEST_TILE_SIZE));
    assert_eq!(image.pixels().get_pixel(0, 0).0, [10, 20, 30, 255]);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let cached = manager.tile_image(&key).await.unwrap();
    assert!(cached.ptr_eq(&image));

    let tile = manager.tile_cache().get(&key).await.unwrap();
    assert!(!tile.is_loading());
    assert!(tile.loading_duration().is_some());

    // Loaded tiles are not queued again
    let (_, status) = manager.request(key, &provider).await;
    assert_eq!(status, RequestStatus::Ready);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    manager.dispose().await;
}

#[tokio::test]
async fn test_concurrent_loads_fetch_once() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("osm").with_delay(Duration::from_millis(20));
    let fetches = provider.counter();
    let provider = provider.shared();
    let manager = Arc::new(manager_at(dir.path(), 8));

    let key = TileKey::new("osm", 4, 5, 6);
    let mut handles = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        let provider = provider.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move { manager.load(key, &provider).await }));
    }

    for handle in handles {
        within(handle).await.unwrap().unwrap();
    }

    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    manager.dispose().await;
}

#[tokio::test]
async fn test_many_tiles_each_fetched_once() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("osm").without_offline();
    let fetches = provider.counter();
    let provider = provider.shared();
    let manager = Arc::new(manager_at(dir.path(), 4));

    let mut handles = Vec::new();
    for _ in 0..2 {
        for x in 0..8 {
            let manager = manager.clone();
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                manager.load(TileKey::new("osm", 3, x, 0), &provider).await
            }));
        }
    }

    for handle in handles {
        within(handle).await.unwrap().unwrap();
    }

    assert_eq!(fetches.load(Ordering::SeqCst), 8);
    assert!(manager.queue().is_empty());
    manager.dispose().await;
}

#[tokio::test]
async fn test_events_bracket_loading() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("osm").shared();
    let manager = manager_at(dir.path(), 1);
    let mut events = manager.subscribe();

    let key = TileKey::new("osm", 1, 0, 1);
    within(manager.load(key.clone(), &provider)).await.unwrap();

    let events = drain_events(&mut events);
    assert_eq!(count_events(&events, TileEventKind::StartLoading, &key), 1);
    assert_eq!(count_events(&events, TileEventKind::EndLoading, &key), 1);

    let start = events.iter().position(|e| e.kind == TileEventKind::StartLoading);
    let end = events.iter().position(|e| e.kind == TileEventKind::EndLoading);
    assert!(start < end);
    assert!(events.iter().all(|e| !e.is_error()));

    manager.dispose().await;
}

#[tokio::test]
async fn test_painted_tile_is_never_fetched() {
    let dir = tempfile::tempdir().unwrap();
    let painting = PaintingProvider::new("hillshade", Some([1, 2, 3, 255]));
    let fetches = painting.counter();
    let provider: Arc<dyn MapProvider> = Arc::new(painting);
    let manager = manager_at(dir.path(), 1);
    let mut events = manager.subscribe();

    let key = TileKey::new("hillshade", 6, 10, 20);
    let image = within(manager.load(key.clone(), &provider)).await.unwrap();

    assert_eq!(image.pixels().get_pixel(3, 3).0, [1, 2, 3, 255]);
    assert_eq!(fetches.load(Ordering::SeqCst), 0);

    let events = drain_events(&mut events);
    assert_eq!(count_events(&events, TileEventKind::PaintStart, &key), 1);
    assert_eq!(count_events(&events, TileEventKind::PaintEnd, &key), 1);

    manager.dispose().await;
}

#[tokio::test]
async fn test_paint_error_fails_tile() {
    let dir = tempfile::tempdir().unwrap();
    let provider: Arc<dyn MapProvider> = Arc::new(PaintingProvider::new("hillshade", None));
    let manager = manager_at(dir.path(), 1);
    let mut events = manager.subscribe();

    let key = TileKey::new("hillshade", 6, 10, 20);
    let result = within(manager.load(key.clone(), &provider)).await;

    match result {
        Err(TileError::Failed { message, .. }) => assert!(message.contains("no elevation data")),
        other => panic!("expected a failed tile, got {:?}", other.map(|_| ())),
    }

    let events = drain_events(&mut events);
    assert_eq!(count_events(&events, TileEventKind::PaintError, &key), 1);

    manager.dispose().await;
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_failed_tile_is_not_requested_again() {
    let dir = tempfile::tempdir().unwrap();
    let provider =
        MockProvider::new("osm").failing(SourceError::NotFound("http://tiles/3/1/1.png".into()));
    let fetches = provider.counter();
    let provider = provider.shared();
    let manager = manager_at(dir.path(), 2);
    let mut events = manager.subscribe();

    let key = TileKey::new("osm", 3, 1, 1);
    let result = within(manager.load(key.clone(), &provider)).await;

    match result {
        Err(TileError::Failed { key: failed, message }) => {
            assert_eq!(failed, "osm-3-1-1");
            assert_eq!(message, "Tile not found: http://tiles/3/1/1.png");
        }
        other => panic!("expected a failed tile, got {:?}", other.map(|_| ())),
    }

    assert!(manager.error_cache().contains(&key).await);
    let tile = manager.tile_cache().get(&key).await.unwrap();
    assert!(tile.is_loading_error());
    assert!(!tile.is_loading());

    let (_, status) = manager.request(key.clone(), &provider).await;
    assert_eq!(status, RequestStatus::Failed);
    assert!(within(manager.load(key.clone(), &provider)).await.is_err());
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let events = drain_events(&mut events);
    let end = events
        .iter()
        .find(|e| e.kind == TileEventKind::EndLoading)
        .unwrap();
    assert!(end.is_error());

    manager.dispose().await;
}

#[tokio::test]
async fn test_undecodable_bytes_fail_tile() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("osm").garbage().shared();
    let manager = manager_at(dir.path(), 1);

    let key = TileKey::new("osm", 0, 0, 0);
    let result = within(manager.load(key.clone(), &provider)).await;

    match result {
        Err(TileError::Failed { message, .. }) => assert!(message.contains("decode")),
        other => panic!("expected a decode failure, got {:?}", other.map(|_| ())),
    }

    // Nothing was written for a failed tile
    assert!(!dir.path().join("osm/0/0/0.png").exists());
    manager.dispose().await;
}

#[tokio::test]
async fn test_panicking_provider_finalizes_tile() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("osm").panicking().shared();
    let manager = manager_at(dir.path(), 1);

    let key = TileKey::new("osm", 2, 2, 2);
    let result = within(manager.load(key.clone(), &provider)).await;

    match result {
        Err(TileError::Failed { message, .. }) => assert!(message.contains("exploded")),
        other => panic!("expected a failed tile, got {:?}", other.map(|_| ())),
    }

    let tile = manager.tile_cache().get(&key).await.unwrap();
    assert!(!tile.is_loading());

    // The worker survived and keeps loading
    let healthy = MockProvider::new("other").shared();
    within(manager.load(TileKey::new("other", 2, 2, 2), &healthy))
        .await
        .unwrap();

    manager.dispose().await;
}

// =============================================================================
// Reset and Dispose
// =============================================================================

#[tokio::test]
async fn test_reset_stops_loading_and_forgets_failures() {
    let dir = tempfile::tempdir().unwrap();
    let slow = MockProvider::new("osm").with_delay(Duration::from_secs(30)).shared();
    let failing = MockProvider::new("bad")
        .failing(SourceError::Stream("boom".into()))
        .shared();
    let manager = manager_at(dir.path(), 2);

    let failed_key = TileKey::new("bad", 1, 1, 1);
    assert!(within(manager.load(failed_key.clone(), &failing)).await.is_err());
    assert!(manager.error_cache().contains(&failed_key).await);

    let (tile, status) = manager.request(TileKey::new("osm", 5, 5, 5), &slow).await;
    assert_eq!(status, RequestStatus::Queued);
    wait_until(|| tile.is_loading()).await;

    let mut events = manager.subscribe();
    manager.reset().await;

    assert!(!tile.is_loading());
    assert!(manager.tile_cache().is_empty().await);
    assert!(manager.error_cache().is_empty().await);
    assert!(manager.queue().is_empty());

    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| e.kind == TileEventKind::QueueReset));

    // Forgotten failures are requested again
    let (_, status) = manager.request(failed_key, &failing).await;
    assert_eq!(status, RequestStatus::Queued);

    manager.dispose().await;
}

#[tokio::test]
async fn test_dispose_cancels_waiting_loads() {
    let dir = tempfile::tempdir().unwrap();
    let slow = MockProvider::new("osm").with_delay(Duration::from_secs(30)).shared();
    let manager = Arc::new(manager_at(dir.path(), 1));

    let waiting = {
        let manager = manager.clone();
        let slow = slow.clone();
        tokio::spawn(async move { manager.load(TileKey::new("osm", 5, 0, 0), &slow).await })
    };

    let tile_cache = manager.tile_cache().clone();
    within(async {
        loop {
            if let Some(tile) = tile_cache.get(&TileKey::new("osm", 5, 0, 0)).await {
                if tile.is_loading() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    within(manager.dispose()).await;
    assert!(manager.is_disposed());

    let result = within(waiting).await.unwrap();
    assert!(matches!(result, Err(TileError::Cancelled)));

    // Nothing is loaded after dispose
    let result = within(manager.load(TileKey::new("osm", 5, 1, 1), &slow)).await;
    assert!(matches!(result, Err(TileError::Cancelled)));
    assert!(manager.image_cache().is_empty().await);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let result = TileManager::new(LoaderConfig::new(dir.path()).with_workers(0));
    assert!(result.is_err());
}
