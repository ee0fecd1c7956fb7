//! The shared waiting queue of tiles to load.
//!
//! A double-ended queue: the viewport appends requests at the back, loaders
//! push child tiles to the front so a composed tile finishes before new
//! requests start. Workers always take from the front.
//!
//! A tile is queued at most once. Viewport requests are also de-duplicated by
//! key: pushing to the back is a no-op while any tile with that key waits.
//! A child pushed to the front is only rejected when that very tile is
//! waiting, so a composition never waits on a viewport tile that happens to
//! share its key.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::tile::{Tile, TileKey};

#[derive(Default)]
struct QueueState {
    tiles: VecDeque<Arc<Tile>>,
    /// Number of waiting tiles per key
    keys: HashMap<TileKey, usize>,
    closed: bool,
}

impl QueueState {
    fn contains_tile(&self, tile: &Arc<Tile>) -> bool {
        self.keys.contains_key(tile.key()) && self.tiles.iter().any(|t| Arc::ptr_eq(t, tile))
    }

    fn take_key(&mut self, key: &TileKey) {
        if let Some(count) = self.keys.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.keys.remove(key);
            }
        }
    }
}

/// Blocking deque of tiles waiting for a worker.
#[derive(Default)]
pub struct WaitingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a tile behind all waiting tiles.
    ///
    /// Returns `false` when the key is already queued or the queue is closed.
    pub fn push_back(&self, tile: Arc<Tile>) -> bool {
        self.push(tile, false)
    }

    /// Queue a tile ahead of all waiting tiles.
    ///
    /// Returns `false` when this tile is already queued or the queue is
    /// closed.
    pub fn push_front(&self, tile: Arc<Tile>) -> bool {
        self.push(tile, true)
    }

    fn push(&self, tile: Arc<Tile>, front: bool) -> bool {
        {
            let mut state = self.state.lock();
            let duplicate = if front {
                state.contains_tile(&tile)
            } else {
                state.keys.contains_key(tile.key())
            };
            if state.closed || duplicate {
                return false;
            }
            *state.keys.entry(tile.key().clone()).or_insert(0) += 1;
            if front {
                state.tiles.push_front(tile);
            } else {
                state.tiles.push_back(tile);
            }
        }
        self.notify.notify_one();
        true
    }

    /// Take the first tile without waiting.
    pub fn poll_first(&self) -> Option<Arc<Tile>> {
        let mut state = self.state.lock();
        let tile = state.tiles.pop_front()?;
        state.take_key(tile.key());
        Some(tile)
    }

    /// Wait for the first tile. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Arc<Tile>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a close in between is not missed
            notified.as_mut().enable();

            if let Some(tile) = self.poll_first() {
                return Some(tile);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Drop all waiting tiles, returning them.
    pub fn clear(&self) -> Vec<Arc<Tile>> {
        let mut state = self.state.lock();
        state.keys.clear();
        state.tiles.drain(..).collect()
    }

    /// Stop accepting tiles and wake every waiting worker.
    ///
    /// Tiles already queued are still handed out.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.state.lock().keys.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tiles.is_empty()
    }
}
