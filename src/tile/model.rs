//! The per-tile state shared between the viewport, the caches and the loaders.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use image::RgbaImage;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::provider::{ChildSpec, MapProvider};
use crate::raster::TileImage;

use super::composition::{Composition, CompositionResult};
use super::key::TileKey;

// =============================================================================
// Child Placement
// =============================================================================

/// Region of a parent tile covered by one child tile, in parent pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSlot {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ChildSlot {
    /// A slot covering a whole tile of the given size.
    pub fn full(tile_size: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width: tile_size,
            height: tile_size,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    index: usize,
    slot: ChildSlot,
}

// =============================================================================
// Overlay State
// =============================================================================

/// Whether the overlay painter has looked at this tile yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlayState {
    #[default]
    NotChecked,
    Empty,
    HasContent,
}

// =============================================================================
// Tile
// =============================================================================

#[derive(Default)]
struct TileState {
    loading_error: Option<String>,
    offline_path: Option<PathBuf>,
    offline_image_available: bool,
    offline_read_error: bool,
    url: Option<String>,
    time_queued: Option<Instant>,
    time_start_loading: Option<Instant>,
    time_end_loading: Option<Instant>,
}

/// One map tile.
///
/// A tile is either a leaf, a parent waiting for its children, or a finalized
/// parent. Parents own their children; a child only keeps a weak reference
/// back to its parent, which is cleared when the parent is evicted.
///
/// All state lives behind short-lived locks or atomics so a tile can be shared
/// between worker tasks, the caches and the renderer through `Arc<Tile>`.
pub struct Tile {
    key: TileKey,
    provider: Arc<dyn MapProvider>,

    loading: AtomicBool,
    state: Mutex<TileState>,

    /// Set at most once
    image: Mutex<Option<TileImage>>,

    parent: RwLock<Weak<Tile>>,
    is_child: AtomicBool,
    placement: Option<Placement>,

    children: RwLock<Option<Vec<Arc<Tile>>>>,
    composition: Mutex<Option<Composition>>,

    abort_handle: Mutex<Option<AbortHandle>>,
    observers: watch::Sender<u64>,

    overlay_state: Mutex<OverlayState>,
    overlay_content: AtomicU32,
}

impl Tile {
    /// Create a leaf tile for the given key and provider.
    pub fn new(key: TileKey, provider: Arc<dyn MapProvider>) -> Arc<Self> {
        Arc::new(Self::build(key, provider, None))
    }

    fn build(key: TileKey, provider: Arc<dyn MapProvider>, placement: Option<Placement>) -> Self {
        let (observers, _) = watch::channel(0);
        Self {
            key,
            provider,
            loading: AtomicBool::new(false),
            state: Mutex::new(TileState::default()),
            image: Mutex::new(None),
            parent: RwLock::new(Weak::new()),
            is_child: AtomicBool::new(false),
            placement,
            children: RwLock::new(None),
            composition: Mutex::new(None),
            abort_handle: Mutex::new(None),
            observers,
            overlay_state: Mutex::new(OverlayState::NotChecked),
            overlay_content: AtomicU32::new(0),
        }
    }

    pub fn key(&self) -> &TileKey {
        &self.key
    }

    pub fn provider(&self) -> &Arc<dyn MapProvider> {
        &self.provider
    }

    // -------------------------------------------------------------------------
    // Loading state
    // -------------------------------------------------------------------------

    /// Returns `true` while a worker owns this tile.
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::Release);
    }

    /// Atomically claim the tile for loading.
    ///
    /// Returns `false` when another worker already owns it.
    pub fn try_claim(&self) -> bool {
        self.loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The loading error, if loading failed.
    pub fn loading_error(&self) -> Option<String> {
        self.state
            .lock()
            .loading_error
            .clone()
            .filter(|e| !e.is_empty())
    }

    pub fn is_loading_error(&self) -> bool {
        self.loading_error().is_some()
    }

    /// Record a terminal loading error.
    ///
    /// When this is a child tile the error is also registered in the parent.
    pub fn set_loading_error(&self, error: impl Into<String>) {
        self.state.lock().loading_error = Some(error.into());

        if let Some(parent) = self.parent() {
            if let Some(composition) = parent.composition.lock().as_mut() {
                composition.record_child_error(self.key.clone());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Offline state
    // -------------------------------------------------------------------------

    pub fn offline_path(&self) -> Option<PathBuf> {
        self.state.lock().offline_path.clone()
    }

    pub fn set_offline_path(&self, path: PathBuf) {
        self.state.lock().offline_path = Some(path);
    }

    /// Whether an offline file for this tile exists and was not found corrupt.
    pub fn is_offline_image_available(&self) -> bool {
        let state = self.state.lock();
        !state.offline_read_error && state.offline_image_available
    }

    pub fn set_offline_image_available(&self, available: bool) {
        self.state.lock().offline_image_available = available;
    }

    pub fn is_offline_read_error(&self) -> bool {
        self.state.lock().offline_read_error
    }

    pub fn set_offline_read_error(&self, error: bool) {
        self.state.lock().offline_read_error = error;
    }

    /// URL used for the last network load.
    pub fn url(&self) -> Option<String> {
        self.state.lock().url.clone()
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.state.lock().url = Some(url.into());
    }

    // -------------------------------------------------------------------------
    // Timing
    // -------------------------------------------------------------------------

    /// Mark the tile as queued; resets the loading times.
    pub fn mark_queued(&self) {
        let mut state = self.state.lock();
        state.time_queued = Some(Instant::now());
        state.time_start_loading = None;
        state.time_end_loading = None;
    }

    pub fn mark_start_loading(&self) {
        self.state.lock().time_start_loading = Some(Instant::now());
    }

    pub fn mark_end_loading(&self) {
        self.state.lock().time_end_loading = Some(Instant::now());
    }

    /// Time between queueing and the end of loading, when both are known.
    pub fn loading_duration(&self) -> Option<std::time::Duration> {
        let state = self.state.lock();
        match (state.time_queued, state.time_end_loading) {
            (Some(queued), Some(end)) => Some(end.saturating_duration_since(queued)),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Image
    // -------------------------------------------------------------------------

    /// The tile's image, if it was set.
    pub fn image(&self) -> Option<TileImage> {
        self.image.lock().clone()
    }

    pub fn has_image(&self) -> bool {
        self.image.lock().is_some()
    }

    /// Set the tile image.
    ///
    /// An image can be set only once. A second call returns `false` and keeps
    /// the first image.
    pub fn set_image(&self, image: TileImage) -> bool {
        let mut slot = self.image.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(image);
        true
    }

    // -------------------------------------------------------------------------
    // Parent / children
    // -------------------------------------------------------------------------

    /// The parent tile, while it is still alive and attached.
    pub fn parent(&self) -> Option<Arc<Tile>> {
        self.parent.read().upgrade()
    }

    /// Returns `true` when this tile was created as a child, even if the
    /// parent reference has been cleared since.
    pub fn is_child(&self) -> bool {
        self.is_child.load(Ordering::Acquire)
    }

    /// Detach this tile from its parent.
    pub fn clear_parent(&self) {
        *self.parent.write() = Weak::new();
    }

    /// Position of this child inside its parent.
    pub fn child_slot(&self) -> Option<ChildSlot> {
        self.placement.map(|p| p.slot)
    }

    pub fn child_index(&self) -> Option<usize> {
        self.placement.map(|p| p.index)
    }

    /// Children of a parent tile, `None` for leaves.
    pub fn children(&self) -> Option<Vec<Arc<Tile>>> {
        self.children.read().clone()
    }

    pub fn has_children(&self) -> bool {
        self.children
            .read()
            .as_ref()
            .is_some_and(|children| !children.is_empty())
    }

    /// Create the children of this tile from the provider's child specs.
    ///
    /// Children are created once; later calls return the existing list.
    pub fn create_children(self: &Arc<Self>, specs: Vec<ChildSpec>) -> Vec<Arc<Tile>> {
        let mut children = self.children.write();
        if let Some(existing) = children.as_ref() {
            return existing.clone();
        }

        let created: Vec<Arc<Tile>> = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let child = Tile::build(
                    spec.key,
                    spec.provider,
                    Some(Placement {
                        index,
                        slot: spec.slot,
                    }),
                );
                *child.parent.write() = Arc::downgrade(self);
                child.is_child.store(true, Ordering::Release);
                Arc::new(child)
            })
            .collect();

        let slots = created
            .iter()
            .filter_map(|child| child.child_slot())
            .collect();
        *self.composition.lock() = Some(Composition::new(self.provider.tile_size(), slots));

        *children = Some(created.clone());
        created
    }

    /// Report the outcome of one child to this parent.
    ///
    /// `image` is `None` when the child failed. `fresh` tells whether the
    /// child was loaded from its source rather than from the offline cache.
    /// Returns the composed result exactly once: for the report that completes
    /// the set of children.
    pub fn report_child(
        &self,
        index: usize,
        image: Option<RgbaImage>,
        fresh: bool,
    ) -> Option<CompositionResult> {
        let mut composition = self.composition.lock();
        composition.as_mut()?.report(index, image, fresh)
    }

    /// Number of children that reported so far, with the total count.
    pub fn children_progress(&self) -> Option<(usize, usize)> {
        self.composition
            .lock()
            .as_ref()
            .map(|c| (c.reported(), c.len()))
    }

    /// Children that have not reported to this parent yet.
    pub fn pending_children(&self) -> Vec<Arc<Tile>> {
        let Some(children) = self.children() else {
            return Vec::new();
        };
        let composition = self.composition.lock();
        let Some(composition) = composition.as_ref() else {
            return Vec::new();
        };
        if composition.is_done() {
            return Vec::new();
        }

        children
            .into_iter()
            .filter(|child| {
                child
                    .child_index()
                    .is_some_and(|index| !composition.is_reported(index))
            })
            .collect()
    }

    /// Whether the composition still waits for the child at `index`.
    pub fn awaits_child(&self, index: usize) -> bool {
        self.composition
            .lock()
            .as_ref()
            .is_some_and(|c| !c.is_done() && !c.is_reported(index))
    }

    /// Whether a loading parent still waits for this child's report.
    pub fn is_awaited_by_parent(&self) -> bool {
        self.parent()
            .zip(self.child_index())
            .is_some_and(|(parent, index)| parent.is_loading() && parent.awaits_child(index))
    }

    /// Keys of children that finished with a loading error.
    pub fn children_with_errors(&self) -> Vec<TileKey> {
        self.composition
            .lock()
            .as_ref()
            .map(|c| c.children_with_errors().to_vec())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Task handle
    // -------------------------------------------------------------------------

    pub fn set_abort_handle(&self, handle: AbortHandle) {
        *self.abort_handle.lock() = Some(handle);
    }

    pub fn clear_abort_handle(&self) {
        self.abort_handle.lock().take();
    }

    /// Abort the in-flight loading task and clear the loading flag.
    ///
    /// Observers are notified when the tile was loading, so waiters do not
    /// wait for a result that will never come.
    pub fn cancel_loading(&self) {
        if let Some(handle) = self.abort_handle.lock().take() {
            handle.abort();
        }
        if self.loading.swap(false, Ordering::AcqRel) {
            self.notify_observers();
        }
    }

    // -------------------------------------------------------------------------
    // Observers
    // -------------------------------------------------------------------------

    /// Subscribe to image notifications of this tile.
    ///
    /// The value is a counter bumped on every notification.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.observers.subscribe()
    }

    pub fn notify_observers(&self) {
        self.observers.send_modify(|generation| *generation += 1);
    }

    // -------------------------------------------------------------------------
    // Overlay
    // -------------------------------------------------------------------------

    pub fn overlay_state(&self) -> OverlayState {
        *self.overlay_state.lock()
    }

    pub fn set_overlay_state(&self, state: OverlayState) {
        *self.overlay_state.lock() = state;
    }

    pub fn overlay_content(&self) -> u32 {
        self.overlay_content.load(Ordering::Relaxed)
    }

    pub fn increment_overlay_content(&self) {
        self.overlay_content.fetch_add(1, Ordering::Relaxed);
    }

    /// Forget everything the overlay painter knew about this tile.
    pub fn reset_overlay(&self) {
        *self.overlay_state.lock() = OverlayState::NotChecked;
        self.overlay_content.store(0, Ordering::Relaxed);
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tile")
            .field("key", &self.key)
            .field("loading", &self.is_loading())
            .field("has_image", &self.has_image())
            .field("loading_error", &self.loading_error())
            .field("is_child", &self.is_child())
            .field("children", &self.children.read().as_ref().map(Vec::len))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
