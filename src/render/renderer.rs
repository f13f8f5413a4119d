//! Rendering engine boundary

use std::sync::Arc;

use image::Rgba;

use super::frame::{RasterImage, encode_png};
use super::layout::DocumentLayout;
use super::request::RenderError;
use super::types::{PageIndex, PagePart};

/// Turns a page into pixels.
///
/// Implementations must be usable from worker threads. Every worker gets its
/// own instance, so an engine with thread-affine state only needs to be
/// `Sync` for the cache's own synchronous renders.
pub trait PageRenderer: Send + Sync {
    /// Render a page at `resolution` pixels per point
    fn render(&self, page: PageIndex, resolution: f64) -> Result<RasterImage, RenderError>;

    /// Render a page straight to PNG bytes.
    ///
    /// Engines able to emit PNG themselves should override this to skip the
    /// raster round trip.
    fn render_compressed(&self, page: PageIndex, resolution: f64) -> Result<Vec<u8>, RenderError> {
        encode_png(&self.render(page, resolution)?)
    }
}

/// Renders every page as a flat colour derived from its index.
///
/// Used by the demo binary and tests; output size follows the document
/// layout and the requested resolution like a real engine would.
pub struct SolidRenderer {
    layout: Arc<dyn DocumentLayout>,
    page_part: PagePart,
}

impl SolidRenderer {
    #[must_use]
    pub fn new(layout: Arc<dyn DocumentLayout>, page_part: PagePart) -> Self {
        Self { layout, page_part }
    }

    fn colour(page: PageIndex) -> Rgba<u8> {
        let seed = (page as u32).wrapping_mul(2_654_435_761);
        Rgba([
            (seed >> 24) as u8,
            (seed >> 16) as u8,
            (seed >> 8) as u8,
            255,
        ])
    }
}

impl PageRenderer for SolidRenderer {
    fn render(&self, page: PageIndex, resolution: f64) -> Result<RasterImage, RenderError> {
        if !(resolution > 0.0 && resolution.is_finite()) {
            return Err(RenderError::InvalidResolution(resolution));
        }
        let size = self
            .layout
            .page_size(page)
            .ok_or(RenderError::InvalidPage {
                page,
                page_count: self.layout.page_count(),
            })?;
        let mut width = size.width;
        if self.page_part != PagePart::FullPage {
            width /= 2.0;
        }
        let width_px = (width * resolution).round().max(1.0) as u32;
        let height_px = (size.height * resolution).round().max(1.0) as u32;
        Ok(RasterImage::from_pixel(
            width_px,
            height_px,
            Self::colour(page),
        ))
    }
}
