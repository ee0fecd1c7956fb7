//! Tile lifecycle events.
//!
//! The map canvas listens to these to repaint and show progress. Events are
//! broadcast; a slow listener misses old events rather than slowing down the
//! loaders.

use tokio::sync::broadcast;

use crate::tile::TileKey;

/// Default number of events buffered per listener.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileEventKind {
    StartLoading,
    EndLoading,
    PaintStart,
    PaintEnd,
    PaintError,
    QueueReset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileEvent {
    pub kind: TileEventKind,

    /// The tile concerned, `None` for queue-wide events
    pub key: Option<TileKey>,

    /// Error message for failed loads and paints
    pub message: Option<String>,
}

impl TileEvent {
    fn for_tile(kind: TileEventKind, key: &TileKey, message: Option<String>) -> Self {
        Self {
            kind,
            key: Some(key.clone()),
            message,
        }
    }

    pub fn start_loading(key: &TileKey) -> Self {
        Self::for_tile(TileEventKind::StartLoading, key, None)
    }

    /// End of loading, with the error message when loading failed.
    pub fn end_loading(key: &TileKey, error: Option<String>) -> Self {
        Self::for_tile(TileEventKind::EndLoading, key, error)
    }

    pub fn paint_start(key: &TileKey) -> Self {
        Self::for_tile(TileEventKind::PaintStart, key, None)
    }

    pub fn paint_end(key: &TileKey) -> Self {
        Self::for_tile(TileEventKind::PaintEnd, key, None)
    }

    pub fn paint_error(key: &TileKey, error: impl Into<String>) -> Self {
        Self::for_tile(TileEventKind::PaintError, key, Some(error.into()))
    }

    pub fn queue_reset() -> Self {
        Self {
            kind: TileEventKind::QueueReset,
            key: None,
            message: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.message.is_some()
    }
}

/// Broadcast channel of tile events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TileEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TileEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current listeners.
    pub fn emit(&self, event: TileEvent) {
        // No listener is not an error
        let _ = self.sender.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
