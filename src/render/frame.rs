//! Compressed page frames

use image::RgbaImage;

use super::request::RenderError;
use super::types::PageIndex;

/// Raster produced by a renderer
pub type RasterImage = RgbaImage;

/// PNG-compressed rendering of one page at one resolution.
///
/// Frames are immutable; a re-render replaces the whole frame in the cache.
#[derive(Clone, PartialEq)]
pub struct CompressedFrame {
    page: PageIndex,
    /// Pixels per point the page was rendered with
    resolution: f64,
    data: Box<[u8]>,
}

impl CompressedFrame {
    /// Wrap already compressed bytes
    #[must_use]
    pub fn new(page: PageIndex, resolution: f64, data: Vec<u8>) -> Self {
        Self {
            page,
            resolution,
            data: data.into_boxed_slice(),
        }
    }

    /// Compress a raster image to PNG
    pub fn from_image(
        image: &RasterImage,
        page: PageIndex,
        resolution: f64,
    ) -> Result<Self, RenderError> {
        Ok(Self::new(page, resolution, encode_png(image)?))
    }

    #[must_use]
    pub fn page(&self) -> PageIndex {
        self.page
    }

    #[must_use]
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Size of the compressed data in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Decompress to a raster image
    pub fn decode(&self) -> Result<RasterImage, RenderError> {
        let image = image::load_from_memory_with_format(&self.data, image::ImageFormat::Png)?;
        Ok(image.into_rgba8())
    }
}

impl std::fmt::Debug for CompressedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedFrame")
            .field("page", &self.page)
            .field("resolution", &self.resolution)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Encode RGBA pixels as PNG, favouring speed over ratio
pub fn encode_png(image: &RasterImage) -> Result<Vec<u8>, RenderError> {
    let mut png_data = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut png_data, image.width(), image.height());
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(png::Compression::Fast);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(image.as_raw())?;
    }
    Ok(png_data)
}
