//! Cache bound integration tests.
//!
//! Tests verify:
//! - The tile and image caches stay within their bounds while loading
//! - Evicted images are still reachable through their tile
//! - Overlay state and images are reset together

use std::sync::atomic::Ordering;

use image::{Rgba, RgbaImage};

use map_tile_pipeline::raster::TileImage;
use map_tile_pipeline::tile::{OverlayState, TileKey};
use map_tile_pipeline::{LoaderConfig, TileManager};

use super::test_utils::{within, MockProvider};

fn small_manager(root: &std::path::Path, tiles: usize, images: usize) -> TileManager {
    let config = LoaderConfig::new(root)
        .with_workers(2)
        .with_tile_cache_capacity(tiles)
        .with_image_cache_capacity(images)
        .with_eviction_slack(0);
    TileManager::new(config).unwrap()
}

#[tokio::test]
async fn test_tile_cache_stays_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("osm").without_offline().shared();
    let manager = small_manager(dir.path(), 4, 100);

    for x in 0..10 {
        within(manager.load(TileKey::new("osm", 4, x, 0), &provider))
            .await
            .unwrap();
    }

    assert!(manager.tile_cache().len().await <= 4);

    // The oldest tiles went first
    assert!(!manager.tile_cache().contains(&TileKey::new("osm", 4, 0, 0)).await);
    assert!(manager.tile_cache().contains(&TileKey::new("osm", 4, 9, 0)).await);

    manager.dispose().await;
}

#[tokio::test]
async fn test_image_cache_stays_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("osm").without_offline();
    let fetches = provider.counter();
    let provider = provider.shared();
    let manager = small_manager(dir.path(), 100, 3);

    let mut images = Vec::new();
    for x in 0..6 {
        let image = within(manager.load(TileKey::new("osm", 4, x, 1), &provider))
            .await
            .unwrap();
        images.push(image);
    }

    assert!(manager.image_cache().len().await <= 3);
    assert!(!manager.image_cache().contains(&TileKey::new("osm", 4, 0, 1)).await);

    // An evicted image is still held by its tile
    let first = manager
        .tile_image(&TileKey::new("osm", 4, 0, 1))
        .await
        .unwrap();
    assert!(first.ptr_eq(&images[0]));
    assert_eq!(fetches.load(Ordering::SeqCst), 6);

    manager.dispose().await;
}

#[tokio::test]
async fn test_reset_overlays_clears_state_and_images() {
    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("osm").shared();
    let manager = small_manager(dir.path(), 10, 10);

    let key = TileKey::new("osm", 2, 0, 0);
    let tile = manager.get_tile(key.clone(), &provider).await;
    tile.set_overlay_state(OverlayState::HasContent);
    tile.increment_overlay_content();

    let overlay = TileImage::new(RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 128])), false);
    manager.overlay_cache().add(key.to_string(), overlay).await;

    manager.reset_overlays().await;

    assert_eq!(tile.overlay_state(), OverlayState::NotChecked);
    assert_eq!(tile.overlay_content(), 0);
    assert!(manager.overlay_cache().is_empty().await);

    manager.dispose().await;
}
