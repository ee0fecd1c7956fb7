//! The rendering thread.
//!
//! Dimming composites run on one dedicated OS thread. Loader tasks hand an
//! image over a channel and await the result, so the composite never runs on
//! a runtime worker and never runs concurrently with another composite.
//!
//! ```text
//!   worker task ──(job, oneshot)──▶ tile-render thread
//!        ▲                                │
//!        └────────── dimmed pixels ───────┘
//! ```

use std::thread::JoinHandle;

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::TileError;

use super::DimSettings;

enum RenderJob {
    Dim {
        image: RgbaImage,
        dim: DimSettings,
        reply: oneshot::Sender<RgbaImage>,
    },
}

impl RenderJob {
    fn run(self) {
        match self {
            RenderJob::Dim { image, dim, reply } => {
                let dimmed = dim_image(&image, dim);
                drop(image);
                // The requesting task may have been aborted
                let _ = reply.send(dimmed);
            }
        }
    }
}

/// Handle to the rendering thread.
///
/// The thread stops when [`RenderExecutor::shutdown`] is called or the
/// executor is dropped.
pub struct RenderExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<RenderJob>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RenderExecutor {
    /// Start the rendering thread.
    pub fn start() -> Result<Self, TileError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<RenderJob>();

        let thread = std::thread::Builder::new()
            .name("tile-render".to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    job.run();
                }
                debug!("Render thread stopped");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Blend an image toward the dim color on the rendering thread.
    ///
    /// Returns the image unchanged, without a hand-off, when dimming is off.
    pub async fn dim(&self, image: RgbaImage, dim: DimSettings) -> Result<RgbaImage, TileError> {
        if !dim.is_active() {
            return Ok(image);
        }

        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(TileError::RenderUnavailable)?;

        let (reply, result) = oneshot::channel();
        sender
            .send(RenderJob::Dim { image, dim, reply })
            .map_err(|_| TileError::RenderUnavailable)?;

        result.await.map_err(|_| TileError::RenderUnavailable)
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop accepting jobs and wait for the thread to finish queued ones.
    pub fn shutdown(&self) {
        self.sender.lock().take();

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("Render thread panicked");
            }
        }
    }
}

impl Drop for RenderExecutor {
    fn drop(&mut self) {
        // Closing the channel ends the thread; do not block on it here
        self.sender.lock().take();
    }
}

/// Fill a buffer with the dim color and draw the image over it with opacity
/// `level / 255`.
pub fn dim_image(source: &RgbaImage, dim: DimSettings) -> RgbaImage {
    let [r, g, b] = dim.color;
    let mut canvas = RgbaImage::from_pixel(source.width(), source.height(), Rgba([r, g, b, 255]));

    let level = u32::from(dim.level);
    for (target, pixel) in canvas.pixels_mut().zip(source.pixels()) {
        // Effective opacity of this pixel over the dim color, scaled to 255 * 255
        let alpha = level * u32::from(pixel[3]);
        let inverse = 255 * 255 - alpha;
        for channel in 0..3 {
            let blended = u32::from(pixel[channel]) * alpha + u32::from(target[channel]) * inverse;
            target[channel] = ((blended + 255 * 255 / 2) / (255 * 255)) as u8;
        }
    }

    canvas
}
