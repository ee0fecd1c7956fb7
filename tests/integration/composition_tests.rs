//! Parent/child composition integration tests.
//!
//! Tests verify:
//! - Layered tiles are stacked from their layers, first layer at the bottom
//! - A parent finalizes exactly once, after its last child
//! - Partial composites are stored as `-part` files
//! - Downsampled tiles are composed recursively from native zoom tiles
//! - Composition finishes under tile cache pressure and when a child's key
//!   is already waiting as a viewport request

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use image::Rgba;

use map_tile_pipeline::error::{SourceError, TileError};
use map_tile_pipeline::loader::TileEventKind;
use map_tile_pipeline::provider::{DownsampleProvider, LayeredProvider, MapProvider};
use map_tile_pipeline::tile::TileKey;
use map_tile_pipeline::{LoaderConfig, RequestStatus, TileManager};

use super::test_utils::{
    count_events, drain_events, manager_at, within, MockProvider, TEST_TILE_SIZE,
};

fn layered(layers: Vec<Arc<dyn MapProvider>>) -> Arc<dyn MapProvider> {
    Arc::new(LayeredProvider::new("combo", layers).unwrap())
}

// =============================================================================
// Layered Composition
// =============================================================================

#[tokio::test]
async fn test_layers_are_stacked_bottom_up() {
    let dir = tempfile::tempdir().unwrap();
    let base = MockProvider::new("base").with_color([255, 0, 0, 255]);
    let labels = MockProvider::new("labels").with_color([0, 0, 0, 0]);
    let (base_fetches, label_fetches) = (base.counter(), labels.counter());
    let provider = layered(vec![base.shared(), labels.shared()]);
    let manager = manager_at(dir.path(), 2);
    let mut events = manager.subscribe();

    let key = TileKey::new("combo", 2, 1, 1);
    let image = within(manager.load(key.clone(), &provider)).await.unwrap();

    assert_eq!(image.dimensions(), (TEST_TILE_SIZE, TEST_TILE_SIZE));
    assert_eq!(image.pixels().get_pixel(4, 4), &Rgba([255, 0, 0, 255]));
    assert!(!image.is_partial());
    assert_eq!(base_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(label_fetches.load(Ordering::SeqCst), 1);

    // Children are cached but hand their pixels to the parent only
    let child = manager
        .tile_cache()
        .get(&key.for_provider("base"))
        .await
        .unwrap();
    assert!(child.is_child());
    assert!(child.image().is_none());
    assert!(Arc::ptr_eq(
        &child.parent().unwrap(),
        &manager.tile_cache().get(&key).await.unwrap()
    ));

    // The parent finalized once, after both children
    let events = drain_events(&mut events);
    assert_eq!(count_events(&events, TileEventKind::EndLoading, &key), 1);
    let parent_end = events
        .iter()
        .position(|e| e.kind == TileEventKind::EndLoading && e.key.as_ref() == Some(&key))
        .unwrap();
    let children_ended = events[..parent_end]
        .iter()
        .filter(|e| e.kind == TileEventKind::EndLoading)
        .count();
    assert_eq!(children_ended, 2);

    // Both the layers and the composite are stored offline
    assert!(dir.path().join("base/2/1/1.png").exists());
    assert!(dir.path().join("labels/2/1/1.png").exists());
    assert!(dir.path().join("combo/2/1/1.png").exists());

    manager.dispose().await;
}

#[tokio::test]
async fn test_failed_layer_gives_partial_composite() {
    let dir = tempfile::tempdir().unwrap();
    let base = MockProvider::new("base").with_color([0, 255, 0, 255]).shared();
    let broken = MockProvider::new("broken")
        .failing(SourceError::NotFound("broken".into()))
        .shared();
    let provider = layered(vec![base, broken]);
    let manager = manager_at(dir.path(), 2);

    let key = TileKey::new("combo", 3, 2, 2);
    let image = within(manager.load(key.clone(), &provider)).await.unwrap();

    assert!(image.is_partial());
    assert_eq!(image.pixels().get_pixel(0, 0), &Rgba([0, 255, 0, 255]));

    let parent = manager.tile_cache().get(&key).await.unwrap();
    assert_eq!(parent.children_with_errors(), vec![key.for_provider("broken")]);
    assert!(manager.error_cache().contains(&key.for_provider("broken")).await);

    assert!(dir.path().join("combo/3/2/2-part.png").exists());
    assert!(!dir.path().join("combo/3/2/2.png").exists());

    manager.dispose().await;
}

#[tokio::test]
async fn test_all_layers_failing_fails_parent() {
    let dir = tempfile::tempdir().unwrap();
    let first = MockProvider::new("a")
        .failing(SourceError::Stream("a".into()))
        .shared();
    let second = MockProvider::new("b")
        .failing(SourceError::UnknownHost("b.invalid".into()))
        .shared();
    let provider = layered(vec![first, second]);
    let manager = manager_at(dir.path(), 2);

    let key = TileKey::new("combo", 1, 0, 0);
    let result = within(manager.load(key.clone(), &provider)).await;

    match result {
        Err(TileError::Failed { message, .. }) => assert!(message.contains("Composition failed")),
        other => panic!("expected a composition failure, got {:?}", other.map(|_| ())),
    }
    assert!(manager.error_cache().contains(&key).await);
    assert!(!dir.path().join("combo").exists());

    manager.dispose().await;
}

#[tokio::test]
async fn test_composite_is_reloaded_offline_after_parent_removal() {
    let dir = tempfile::tempdir().unwrap();
    let base = MockProvider::new("base");
    let fetches = base.counter();
    let provider = layered(vec![base.shared()]);
    let manager = manager_at(dir.path(), 1);

    let key = TileKey::new("combo", 4, 3, 3);
    within(manager.load(key.clone(), &provider)).await.unwrap();

    manager.remove_parent_tiles().await;
    assert!(!manager.tile_cache().contains(&key).await);

    // The new parent tile finds the stored composite
    let image = within(manager.load(key, &provider)).await.unwrap();
    assert!(!image.is_partial());
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    manager.dispose().await;
}

#[tokio::test]
async fn test_child_loaded_on_its_own_after_composition() {
    let dir = tempfile::tempdir().unwrap();
    let base = MockProvider::new("base").with_color([1, 1, 1, 255]).shared();
    let provider = layered(vec![base.clone()]);
    let manager = manager_at(dir.path(), 1);

    let key = TileKey::new("combo", 2, 2, 2);
    within(manager.load(key.clone(), &provider)).await.unwrap();

    let image = within(manager.load(key.for_provider("base"), &base))
        .await
        .unwrap();
    assert_eq!(image.pixels().get_pixel(0, 0), &Rgba([1, 1, 1, 255]));

    manager.dispose().await;
}

// =============================================================================
// Downsampling
// =============================================================================

#[tokio::test]
async fn test_downsample_composes_from_native_zoom() {
    let dir = tempfile::tempdir().unwrap();
    let native = MockProvider::new("native").with_color([30, 60, 90, 255]);
    let fetches = native.counter();
    let provider: Arc<dyn MapProvider> = DownsampleProvider::new("low", native.shared(), 3);
    let manager = manager_at(dir.path(), 3);

    let key = TileKey::new("low", 1, 0, 0);
    let image = within(manager.load(key, &provider)).await.unwrap();

    // 4 tiles at zoom 2, each composed from 4 native tiles at zoom 3
    assert_eq!(fetches.load(Ordering::SeqCst), 16);
    assert_eq!(image.dimensions(), (TEST_TILE_SIZE, TEST_TILE_SIZE));
    assert_eq!(image.pixels().get_pixel(7, 7), &Rgba([30, 60, 90, 255]));

    assert!(dir.path().join("low/1/0/0.png").exists());
    assert!(dir.path().join("low/2/1/1.png").exists());
    assert!(dir.path().join("native/3/3/3.png").exists());

    manager.dispose().await;
}

#[tokio::test]
async fn test_downsample_completes_in_small_tile_cache() {
    let dir = tempfile::tempdir().unwrap();
    let native = MockProvider::new("native").with_color([10, 20, 30, 255]);
    let fetches = native.counter();
    let provider: Arc<dyn MapProvider> = DownsampleProvider::new("low", native.shared(), 3);

    // 21 tiles take part, the cache holds 4
    let config = LoaderConfig::new(dir.path())
        .with_workers(2)
        .with_tile_cache_capacity(4)
        .with_eviction_slack(0);
    let manager = TileManager::new(config).unwrap();

    let key = TileKey::new("low", 1, 1, 0);
    let image = within(manager.load(key.clone(), &provider)).await.unwrap();

    assert_eq!(fetches.load(Ordering::SeqCst), 16);
    assert!(!image.is_partial());
    assert_eq!(image.pixels().get_pixel(0, 0), &Rgba([10, 20, 30, 255]));

    // Nothing is left loading once the composite is done
    for tile in manager.tile_cache().tiles().await {
        assert!(!tile.is_loading(), "{} still loading", tile.key());
    }

    manager.dispose().await;
}

#[tokio::test]
async fn test_layered_completes_while_viewport_churns_tile_cache() {
    let dir = tempfile::tempdir().unwrap();
    let provider = layered(vec![
        MockProvider::new("base").with_delay(Duration::from_millis(20)).shared(),
        MockProvider::new("roads").shared(),
    ]);
    let osm = MockProvider::new("osm").shared();

    let config = LoaderConfig::new(dir.path())
        .with_workers(1)
        .with_tile_cache_capacity(3)
        .with_eviction_slack(0);
    let manager = TileManager::new(config).unwrap();

    let key = TileKey::new("combo", 5, 4, 4);
    let composite = manager.load(key.clone(), &provider);
    // Viewport requests keep evicting while the children wait in the queue
    let churn = async {
        for x in 0..8 {
            manager.request(TileKey::new("osm", 5, x, 9), &osm).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    let (image, ()) = within(async { tokio::join!(composite, churn) }).await;

    let image = image.unwrap();
    assert!(!image.is_partial());
    assert_eq!(image.dimensions(), (TEST_TILE_SIZE, TEST_TILE_SIZE));

    manager.dispose().await;
}

#[tokio::test]
async fn test_child_key_already_requested_by_viewport() {
    let dir = tempfile::tempdir().unwrap();
    let slow = MockProvider::new("slow")
        .with_delay(Duration::from_millis(100))
        .shared();
    let base = MockProvider::new("base").with_color([7, 7, 7, 255]).shared();
    let provider = layered(vec![base.clone(), MockProvider::new("roads").shared()]);
    let manager = manager_at(dir.path(), 1);

    // The only worker is busy while both requests queue up behind it
    manager.request(TileKey::new("slow", 1, 0, 0), &slow).await;

    let key = TileKey::new("combo", 6, 10, 12);
    let (_, status) = manager.request(key.clone(), &provider).await;
    assert_eq!(status, RequestStatus::Queued);

    let base_key = key.for_provider("base");
    let (viewport, status) = manager.request(base_key.clone(), &base).await;
    assert_eq!(status, RequestStatus::Queued);

    let image = within(manager.load(key, &provider)).await.unwrap();
    assert!(!image.is_partial());

    // The viewport tile kept its cache entry and loaded on its own
    let loaded = within(manager.load(base_key.clone(), &base)).await.unwrap();
    assert_eq!(loaded.pixels().get_pixel(0, 0), &Rgba([7, 7, 7, 255]));
    let cached = manager.tile_cache().get(&base_key).await.unwrap();
    assert!(Arc::ptr_eq(&cached, &viewport));
    assert!(!viewport.is_child());

    manager.dispose().await;
}
