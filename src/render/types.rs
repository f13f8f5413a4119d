//! Core types for slide rendering

use serde::{Deserialize, Serialize};

/// Zero-based page index
pub type PageIndex = usize;

/// Two resolutions closer than this are considered equal.
pub const MAX_RESOLUTION_DEVIATION: f64 = 1e-5;

/// Returns true if two resolutions (pixels per point) are interchangeable.
#[inline]
#[must_use]
pub fn same_resolution(a: f64, b: f64) -> bool {
    (a - b).abs() < MAX_RESOLUTION_DEVIATION
}

/// Natural page size in points
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageSize {
    pub width: f64,
    pub height: f64,
}

impl PageSize {
    #[must_use]
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// True if either dimension is zero, negative or not a number
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

/// Size of the area slides are rendered into, in device pixels
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ViewportSize {
    pub width: f64,
    pub height: f64,
}

impl ViewportSize {
    #[must_use]
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    #[must_use]
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

/// How a page is scaled into the viewport
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
    /// Whole page visible, limited by whichever axis is tighter
    #[default]
    Page,
    /// Page width fills the viewport width
    Width,
    /// Page height fills the viewport height
    Height,
}

impl FitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FitMode::Page => "page",
            FitMode::Width => "width",
            FitMode::Height => "height",
        }
    }
}

/// Part of a page shown by a view.
///
/// Beamer documents with notes put slide and notes side by side on one
/// page; a view then shows only one half of it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PagePart {
    #[default]
    FullPage,
    LeftHalf,
    RightHalf,
}

/// Render settings owned by one cache.
///
/// Changed only through the cache manager so that every resolution
/// computed for a page agrees with the frames already cached.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RenderConfig {
    pub fit_mode: FitMode,
    pub page_part: PagePart,
    pub viewport: ViewportSize,
}

impl RenderConfig {
    #[must_use]
    pub fn new(fit_mode: FitMode, page_part: PagePart, viewport: ViewportSize) -> Self {
        Self {
            fit_mode,
            page_part,
            viewport,
        }
    }

    /// Resolution in pixels per point for a page of the given natural size.
    ///
    /// Returns `None` when either the page or the viewport is empty.
    #[must_use]
    pub fn resolution_for_size(&self, page_size: PageSize) -> Option<f64> {
        if page_size.is_empty() || self.viewport.is_empty() {
            return None;
        }
        let mut page = page_size;
        if self.page_part != PagePart::FullPage {
            page.width /= 2.0;
        }
        let frame = self.viewport;
        let resolution = match self.fit_mode {
            FitMode::Width => frame.width / page.width,
            FitMode::Height => frame.height / page.height,
            FitMode::Page => {
                if page.width * frame.height > page.height * frame.width {
                    // page is too wide, width limits the resolution
                    frame.width / page.width
                } else {
                    frame.height / page.height
                }
            }
        };
        Some(resolution)
    }
}
