//! Fixed-size pool of loader workers.
//!
//! Each worker takes the first tile from the waiting queue, claims it and
//! runs its [`TileImageLoader`] as a separate task. The task's abort handle
//! is stored on the tile so loading can be stopped from outside. The worker
//! waits for the task before taking the next tile.
//!
//! A panicking loader is caught at the task boundary and its tile finalized
//! with an error, so no tile stays marked as loading and the worker lives on.

use std::any::Any;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::TileError;

use super::task::{deliver_error, TileImageLoader};
use super::LoaderContext;

/// Default number of concurrent tile loads.
pub const DEFAULT_WORKER_COUNT: usize = 4;

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    ctx: Arc<LoaderContext>,
}

impl WorkerPool {
    /// Spawn `count` workers on the current runtime.
    pub fn start(ctx: Arc<LoaderContext>, count: usize) -> Self {
        let count = count.max(1);
        let workers = (0..count)
            .map(|id| tokio::spawn(worker_loop(id, ctx.clone())))
            .collect();

        info!(workers = count, "Started tile loader workers");
        Self { workers, ctx }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue and wait for the workers to finish their tiles.
    pub async fn shutdown(self) {
        self.ctx.queue.close();
        for worker in self.workers {
            let _ = worker.await;
        }
        debug!("Tile loader workers stopped");
    }

    /// Stop the workers without waiting for their tiles.
    pub fn abort(self) {
        self.ctx.queue.close();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker_loop(id: usize, ctx: Arc<LoaderContext>) {
    while let Some(tile) = ctx.queue.pop().await {
        if !tile.try_claim() {
            debug!(worker = id, tile = %tile.key(), "Tile already claimed");
            continue;
        }
        if tile.has_image() {
            // Re-queued while its previous load was finishing
            tile.set_loading(false);
            continue;
        }

        let task = tokio::spawn(TileImageLoader::new(tile.clone(), ctx.clone()).run());
        tile.set_abort_handle(task.abort_handle());

        match task.await {
            Ok(outcome) => {
                debug!(worker = id, tile = %tile.key(), outcome = ?outcome, "Loader finished");
            }
            Err(e) if e.is_cancelled() => {
                debug!(worker = id, tile = %tile.key(), "Loader cancelled");
                tile.set_loading(false);
            }
            Err(e) => {
                let message = panic_message(e.into_panic());
                error!(worker = id, tile = %tile.key(), panic = %message, "Loader panicked");
                deliver_error(&ctx, tile.clone(), TileError::Unexpected { message }).await;
            }
        }

        tile.clear_abort_handle();
    }

    debug!(worker = id, "Worker stopped");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "loader panicked".to_string()
    }
}
