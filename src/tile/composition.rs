//! Accumulating buffer of a parent tile that is composed from child tiles.
//!
//! Children report in any order. The report that completes the set builds the
//! parent image; every other report only stores its pixels.

use image::imageops::{self, FilterType};
use image::RgbaImage;

use super::key::TileKey;
use super::model::ChildSlot;

/// Outcome of a completed composition.
#[derive(Debug)]
pub struct CompositionResult {
    /// The composed parent image, `None` when every child failed
    pub image: Option<RgbaImage>,

    /// At least one child failed or was unavailable
    pub partial: bool,

    /// At least one child was loaded from its source and not from disk
    pub fresh: bool,

    /// Number of failed children
    pub failed: usize,
}

#[derive(Debug)]
pub(crate) struct Composition {
    tile_size: u32,
    slots: Vec<ChildSlot>,
    images: Vec<Option<RgbaImage>>,
    reported: Vec<bool>,
    reported_count: usize,
    failed: usize,
    fresh: bool,
    done: bool,
    errors: Vec<TileKey>,
}

impl Composition {
    pub(crate) fn new(tile_size: u32, slots: Vec<ChildSlot>) -> Self {
        let len = slots.len();
        Self {
            tile_size,
            slots,
            images: (0..len).map(|_| None).collect(),
            reported: vec![false; len],
            reported_count: 0,
            failed: 0,
            fresh: false,
            done: false,
            errors: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn reported(&self) -> usize {
        self.reported_count
    }

    pub(crate) fn is_reported(&self, index: usize) -> bool {
        self.reported.get(index).copied().unwrap_or(false)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn record_child_error(&mut self, key: TileKey) {
        if !self.errors.contains(&key) {
            self.errors.push(key);
        }
    }

    pub(crate) fn children_with_errors(&self) -> &[TileKey] {
        &self.errors
    }

    /// Store one child's outcome; returns the result when this was the last
    /// outstanding child.
    pub(crate) fn report(
        &mut self,
        index: usize,
        image: Option<RgbaImage>,
        fresh: bool,
    ) -> Option<CompositionResult> {
        if self.done || index >= self.slots.len() || self.reported[index] {
            return None;
        }

        self.reported[index] = true;
        self.reported_count += 1;

        match image {
            Some(image) => {
                self.fresh |= fresh;
                self.images[index] = Some(image);
            }
            None => self.failed += 1,
        }

        if self.reported_count < self.slots.len() {
            return None;
        }

        self.done = true;
        let images = std::mem::take(&mut self.images);

        let image = if self.failed == self.slots.len() {
            None
        } else {
            Some(compose(self.tile_size, &self.slots, images))
        };

        Some(CompositionResult {
            image,
            partial: self.failed > 0,
            fresh: self.fresh,
            failed: self.failed,
        })
    }
}

/// Draw every child into its slot, in slot order, on a transparent canvas.
fn compose(tile_size: u32, slots: &[ChildSlot], images: Vec<Option<RgbaImage>>) -> RgbaImage {
    let mut canvas = RgbaImage::new(tile_size, tile_size);

    for (slot, image) in slots.iter().zip(images) {
        let Some(image) = image else {
            continue;
        };
        if slot.width == 0 || slot.height == 0 {
            continue;
        }

        let image = if image.dimensions() == (slot.width, slot.height) {
            image
        } else {
            imageops::resize(&image, slot.width, slot.height, FilterType::Triangle)
        };

        imageops::overlay(&mut canvas, &image, i64::from(slot.x), i64::from(slot.y));
    }

    canvas
}
