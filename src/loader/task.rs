//! The per-tile loading task.
//!
//! # States
//!
//! ```text
//! Claimed ──▶ SourceResolving ──┬──▶ Ready ─────────────▶ Finalized (success | error)
//!                               │
//!                               └──▶ ComposingChildren ──▶ (last child) ──▶ Finalized
//! ```
//!
//! Sources are tried in order: offline file, child composition, painter,
//! byte stream. A child tile does not set its own image; it hands its pixels
//! to the parent's composition and the child whose report completes the set
//! finalizes the parent. Composition nests: a finalized parent that is itself
//! a child reports to its own parent.

use std::sync::Arc;

use tracing::{debug, warn};

use image::RgbaImage;

use crate::error::TileError;
use crate::provider::{ChildSpec, MapProvider};
use crate::raster::SourceImage;
use crate::tile::{CompositionResult, Tile, TileKey};

use super::events::TileEvent;
use super::LoaderContext;

/// How a loader run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The tile was finalized with an image
    Loaded,

    /// The tile was finalized with a loading error
    Failed,

    /// Children were queued; the tile finalizes when the last one reports
    Composing,

    /// A child tile handed its result to its parent
    Reported,
}

/// Image obtained for a tile, ready to be set up.
struct Resolved {
    source: SourceImage,
    should_save: bool,
    partial: bool,
}

enum Resolution {
    Ready(Resolved),
    Composing,
}

/// Loads one claimed tile.
pub struct TileImageLoader {
    tile: Arc<Tile>,
    ctx: Arc<LoaderContext>,
}

impl TileImageLoader {
    pub fn new(tile: Arc<Tile>, ctx: Arc<LoaderContext>) -> Self {
        Self { tile, ctx }
    }

    /// Run the loader to completion.
    ///
    /// Never fails: every error ends up as the tile's loading error.
    pub async fn run(self) -> LoadOutcome {
        let key = self.tile.key().clone();
        self.tile.mark_start_loading();
        self.ctx.events.emit(TileEvent::start_loading(&key));
        debug!(tile = %key, "Loading tile");

        let result = match self.resolve().await {
            Ok(Resolution::Composing) => return LoadOutcome::Composing,
            Ok(Resolution::Ready(resolved)) => Ok(resolved),
            Err(e) => Err(e),
        };

        deliver(&self.ctx, self.tile.clone(), result).await
    }

    async fn resolve(&self) -> Result<Resolution, TileError> {
        let tile = &self.tile;
        let provider = tile.provider().clone();

        if let Some(offline) = self.ctx.image_cache.get_offline_image(tile).await {
            debug!(tile = %tile.key(), path = %offline.path.display(), "Loaded offline image");
            return Ok(Resolution::Ready(Resolved {
                source: offline.source,
                should_save: false,
                partial: offline.partial,
            }));
        }

        if let Some(specs) = provider.tile_children(tile.key()).filter(|s| !s.is_empty()) {
            self.start_children(specs).await?;
            return Ok(Resolution::Composing);
        }

        if provider.painter().is_some() {
            let key = tile.key();
            self.ctx.events.emit(TileEvent::paint_start(key));

            return match paint(provider.clone(), key.clone()).await {
                Ok(image) => {
                    self.ctx.events.emit(TileEvent::paint_end(key));
                    Ok(Resolution::Ready(Resolved {
                        source: SourceImage::from_pixels(image),
                        should_save: true,
                        partial: false,
                    }))
                }
                Err(e) => {
                    self.ctx.events.emit(TileEvent::paint_error(key, e.to_string()));
                    Err(e)
                }
            };
        }

        if let Some(url) = provider.tile_url(tile.key()) {
            tile.set_url(url);
        }
        let bytes = provider.fetch(tile.key()).await?;
        let source = SourceImage::decode(bytes)?;

        Ok(Resolution::Ready(Resolved {
            source,
            should_save: true,
            partial: false,
        }))
    }

    /// Create the children, cache them and queue those still to be loaded
    /// ahead of all other requests.
    async fn start_children(&self, specs: Vec<ChildSpec>) -> Result<(), TileError> {
        let tile = &self.tile;
        let children = tile.create_children(specs);

        for child in &children {
            // A tile already cached under the key keeps its entry and loads on its own
            let (cached, _) = self
                .ctx
                .tile_cache
                .get_or_insert_with(child.key().clone(), || child.clone())
                .await;
            if !Arc::ptr_eq(&cached, child) {
                debug!(tile = %child.key(), "Child key already cached, child kept by parent only");
            }
        }

        let pending = tile.pending_children();
        if pending.is_empty() {
            return Err(TileError::Composition {
                message: format!("{} has no child tiles left to load", tile.key()),
            });
        }

        let mut queued = 0;
        // Reverse so the children keep their order at the front of the queue
        for child in pending.into_iter().rev() {
            if child.is_loading() {
                continue;
            }
            child.mark_queued();
            if self.ctx.queue.push_front(child.clone()) {
                queued += 1;
            } else if self.ctx.queue.is_closed() {
                return Err(TileError::Cancelled);
            }
        }

        debug!(tile = %tile.key(), children = children.len(), queued, "Composing tile from children");
        Ok(())
    }
}

/// Run the provider's painter on the blocking pool.
async fn paint(provider: Arc<dyn MapProvider>, key: TileKey) -> Result<RgbaImage, TileError> {
    let painted = tokio::task::spawn_blocking(move || {
        let size = provider.tile_size();
        provider.painter().map(|painter| painter.paint(&key, size))
    })
    .await;

    match painted {
        Ok(Some(result)) => result,
        Ok(None) => Err(TileError::Paint {
            message: "provider has no painter".to_string(),
        }),
        Err(e) if e.is_panic() => Err(TileError::Paint {
            message: "painter panicked".to_string(),
        }),
        Err(_) => Err(TileError::Cancelled),
    }
}

/// Finalize a tile with its result and walk up the parent chain for every
/// composition the result completes.
async fn deliver(
    ctx: &LoaderContext,
    tile: Arc<Tile>,
    result: Result<Resolved, TileError>,
) -> LoadOutcome {
    let mut tile = tile;
    let mut result = result;
    let mut outcome = None;

    loop {
        let (step, completed) = deliver_one(ctx, &tile, result).await;
        outcome.get_or_insert(step);

        let Some((parent, composition)) = completed else {
            break;
        };

        result = match composition.image {
            Some(image) => Ok(Resolved {
                source: SourceImage::from_pixels(image),
                should_save: composition.fresh,
                partial: composition.partial,
            }),
            None => Err(TileError::Composition {
                message: format!("all {} child tiles failed", composition.failed),
            }),
        };
        tile = parent;
    }

    outcome.unwrap_or(LoadOutcome::Failed)
}

/// Finalize a failed tile that had no result, e.g. after its task panicked.
pub(crate) async fn deliver_error(ctx: &LoaderContext, tile: Arc<Tile>, error: TileError) {
    deliver(ctx, tile, Err(error)).await;
}

async fn deliver_one(
    ctx: &LoaderContext,
    tile: &Arc<Tile>,
    result: Result<Resolved, TileError>,
) -> (LoadOutcome, Option<(Arc<Tile>, CompositionResult)>) {
    // A child loaded again after its parent composed is finalized on its own
    let attached = tile
        .parent()
        .zip(tile.child_index())
        .filter(|(parent, index)| parent.awaits_child(*index));

    match (result, attached) {
        (Ok(resolved), Some((parent, index))) => {
            if resolved.should_save && tile.provider().allows_offline() {
                if let Err(e) = ctx
                    .image_cache
                    .save_offline_image(tile, &resolved.source, resolved.partial)
                    .await
                {
                    warn!(tile = %tile.key(), error = %e, "Failed to save offline image");
                }
            }

            finalize_success(ctx, tile, false);
            let completed = parent.report_child(index, Some(resolved.source.image), resolved.should_save);
            (LoadOutcome::Reported, completed.map(|c| (parent, c)))
        }
        (Ok(resolved), None) => {
            let setup = ctx
                .image_cache
                .setup_image(resolved.source, tile, resolved.should_save, resolved.partial)
                .await;

            match setup {
                Ok(_) => {
                    finalize_success(ctx, tile, true);
                    (LoadOutcome::Loaded, None)
                }
                Err(e) => {
                    finalize_error(ctx, tile, &e, true).await;
                    (LoadOutcome::Failed, None)
                }
            }
        }
        (Err(e), Some((parent, index))) => {
            finalize_error(ctx, tile, &e, false).await;
            let completed = parent.report_child(index, None, false);
            (LoadOutcome::Reported, completed.map(|c| (parent, c)))
        }
        (Err(e), None) => {
            finalize_error(ctx, tile, &e, true).await;
            (LoadOutcome::Failed, None)
        }
    }
}

fn finalize_success(ctx: &LoaderContext, tile: &Tile, notify: bool) {
    tile.mark_end_loading();
    tile.set_loading(false);

    if notify {
        tile.notify_observers();
    }
    ctx.events.emit(TileEvent::end_loading(tile.key(), None));

    debug!(
        tile = %tile.key(),
        elapsed_ms = tile.loading_duration().map(|d| d.as_millis() as u64),
        "Tile loaded"
    );
}

async fn finalize_error(ctx: &LoaderContext, tile: &Tile, error: &TileError, notify: bool) {
    let message = error.to_string();
    warn!(tile = %tile.key(), error = %message, "Tile failed to load");

    ctx.error_cache.add(tile.key().clone(), message.clone()).await;
    tile.set_loading_error(message.clone());
    tile.mark_end_loading();
    tile.set_loading(false);

    if notify {
        tile.notify_observers();
    }
    ctx.events.emit(TileEvent::end_loading(tile.key(), Some(message)));
}
