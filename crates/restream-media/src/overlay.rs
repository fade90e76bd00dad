//! Overlay painting and frame encoding.
//!
//! Overlays paint onto a transparent RGBA canvas that the egress process
//! composites over the video. A paint failure is isolated per overlay and
//! never aborts the tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{imageops, DynamicImage, ImageEncoder, Rgba, RgbaImage};
use tracing::error;

use restream_models::OverlayPlacement;

use crate::error::{MediaError, MediaResult};

/// Transparent compositing surface sized to the egress input resolution.
pub type Canvas = RgbaImage;

/// A paintable, positioned visual element.
pub trait Overlay: Send + Sync {
    fn placement(&self) -> OverlayPlacement;

    /// Paint onto the canvas. Failures are caught at the call site.
    fn paint(&self, canvas: &mut Canvas) -> MediaResult<()>;

    /// Whether this overlay was derived from an external image-segment
    /// result (replaced wholesale on each new result).
    fn is_image_segment(&self) -> bool {
        false
    }
}

fn clipped(placement: &OverlayPlacement, canvas: &Canvas) -> MediaResult<(u32, u32, u32, u32)> {
    if placement.width == 0 || placement.height == 0 {
        return Err(MediaError::overlay_failed(format!(
            "degenerate placement {}x{}",
            placement.width, placement.height
        )));
    }
    if placement.x >= canvas.width() || placement.y >= canvas.height() {
        return Err(MediaError::overlay_failed(format!(
            "placement ({}, {}) outside {}x{} canvas",
            placement.x,
            placement.y,
            canvas.width(),
            canvas.height()
        )));
    }
    let w = placement.width.min(canvas.width() - placement.x);
    let h = placement.height.min(canvas.height() - placement.y);
    Ok((placement.x, placement.y, w, h))
}

/// Opaque cover over a fixed region.
pub struct CoverOverlay {
    placement: OverlayPlacement,
    color: Rgba<u8>,
}

impl CoverOverlay {
    pub fn new(placement: OverlayPlacement) -> Self {
        Self {
            placement,
            color: Rgba([0, 0, 0, 255]),
        }
    }

    pub fn with_color(mut self, color: Rgba<u8>) -> Self {
        self.color = color;
        self
    }
}

impl Overlay for CoverOverlay {
    fn placement(&self) -> OverlayPlacement {
        self.placement
    }

    fn paint(&self, canvas: &mut Canvas) -> MediaResult<()> {
        let (x, y, w, h) = clipped(&self.placement, canvas)?;
        for py in y..y + h {
            for px in x..x + w {
                canvas.put_pixel(px, py, self.color);
            }
        }
        Ok(())
    }
}

/// Blurred snapshot of a region, painted back over itself.
pub struct RegionBlurOverlay {
    placement: OverlayPlacement,
    snapshot: DynamicImage,
    sigma: f32,
}

impl RegionBlurOverlay {
    pub fn new(placement: OverlayPlacement, snapshot: DynamicImage) -> Self {
        Self {
            placement,
            snapshot,
            sigma: 12.0,
        }
    }

    pub fn with_sigma(mut self, sigma: f32) -> Self {
        self.sigma = sigma;
        self
    }
}

impl Overlay for RegionBlurOverlay {
    fn placement(&self) -> OverlayPlacement {
        self.placement
    }

    fn paint(&self, canvas: &mut Canvas) -> MediaResult<()> {
        let (x, y, w, h) = clipped(&self.placement, canvas)?;
        let patch = imageops::resize(&self.snapshot.to_rgba8(), w, h, FilterType::Triangle);
        let blurred = imageops::blur(&patch, self.sigma);
        imageops::overlay(canvas, &blurred, x as i64, y as i64);
        Ok(())
    }
}

/// Overlay derived from an external image-segmentation result.
pub struct ImageSegmentOverlay {
    placement: OverlayPlacement,
    image: DynamicImage,
}

impl ImageSegmentOverlay {
    pub fn new(placement: OverlayPlacement, image: DynamicImage) -> Self {
        Self { placement, image }
    }
}

impl Overlay for ImageSegmentOverlay {
    fn placement(&self) -> OverlayPlacement {
        self.placement
    }

    fn paint(&self, canvas: &mut Canvas) -> MediaResult<()> {
        let (x, y, w, h) = clipped(&self.placement, canvas)?;
        let scaled = imageops::resize(&self.image.to_rgba8(), w, h, FilterType::Triangle);
        imageops::overlay(canvas, &scaled, x as i64, y as i64);
        Ok(())
    }

    fn is_image_segment(&self) -> bool {
        true
    }
}

/// Ordered overlay collection shared between a video, its shadow, and the
/// renderer.
///
/// The encoded-frame cache is keyed by an epoch that bumps on every
/// mutation, so the renderer re-paints only when something changed.
pub struct OverlaySet {
    overlays: Mutex<Vec<Arc<dyn Overlay>>>,
    epoch: AtomicU64,
    cached: Mutex<Option<(u64, Arc<Vec<u8>>)>>,
}

impl OverlaySet {
    pub fn new() -> Self {
        Self {
            overlays: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
            cached: Mutex::new(None),
        }
    }

    fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Add an overlay, keeping the collection ordered by paint index.
    pub fn add(&self, overlay: Arc<dyn Overlay>) {
        let mut overlays = self.overlays.lock().unwrap_or_else(|e| e.into_inner());
        overlays.push(overlay);
        overlays.sort_by_key(|o| o.placement().index);
        drop(overlays);
        self.bump();
    }

    /// Remove every image-segment overlay.
    pub fn remove_image_segments(&self) {
        let mut overlays = self.overlays.lock().unwrap_or_else(|e| e.into_inner());
        let before = overlays.len();
        overlays.retain(|o| !o.is_image_segment());
        let removed = overlays.len() != before;
        drop(overlays);
        if removed {
            self.bump();
        }
    }

    pub fn clear(&self) {
        self.overlays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.bump();
    }

    pub fn is_empty(&self) -> bool {
        self.overlays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.overlays.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Current mutation epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Snapshot of the overlays in paint order.
    pub fn snapshot(&self) -> Vec<Arc<dyn Overlay>> {
        self.overlays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Paint every overlay in collection order. A failing overlay is logged
    /// and skipped; the rest of the tick proceeds.
    pub fn paint_all(&self, canvas: &mut Canvas) {
        for overlay in self.snapshot() {
            if let Err(e) = overlay.paint(canvas) {
                error!(index = overlay.placement().index, "Overlay paint failed: {}", e);
            }
        }
    }

    /// Encoded frame cached for `epoch`, if still current.
    pub fn cached_frame(&self, epoch: u64) -> Option<Arc<Vec<u8>>> {
        let cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        match cached.as_ref() {
            Some((cached_epoch, bytes)) if *cached_epoch == epoch => Some(Arc::clone(bytes)),
            _ => None,
        }
    }

    /// Store the encoded frame for `epoch`.
    pub fn store_frame(&self, epoch: u64, bytes: Arc<Vec<u8>>) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some((epoch, bytes));
    }
}

impl Default for OverlaySet {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode the canvas losslessly with alpha (PNG) for the overlay pipe.
pub fn encode_frame(canvas: &Canvas) -> MediaResult<Vec<u8>> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf).write_image(
        canvas.as_raw(),
        canvas.width(),
        canvas.height(),
        image::ColorType::Rgba8,
    )?;
    Ok(buf)
}

/// Reset the canvas to fully transparent.
pub fn clear_canvas(canvas: &mut Canvas) {
    for pixel in canvas.pixels_mut() {
        *pixel = Rgba([0, 0, 0, 0]);
    }
}
