//! Worker job and report types

use std::sync::Arc;
use std::time::Duration;

use super::frame::CompressedFrame;
use super::types::PageIndex;

/// Job sent to a render worker
#[derive(Debug)]
pub enum WorkerJob {
    /// Render a page into a compressed frame
    Render { page: PageIndex, resolution: f64 },

    /// Stop the worker thread
    Shutdown,
}

/// Result of one job, sent back by the worker that ran it
#[derive(Debug)]
pub struct WorkerReport {
    /// Index of the worker in the pool
    pub worker: usize,
    pub page: PageIndex,
    pub resolution: f64,
    pub outcome: Result<CompressedFrame, RenderError>,
}

/// Notification sent to subscribers whenever a frame lands in the cache
#[derive(Clone, Debug)]
pub struct FrameReady {
    pub page: PageIndex,
    pub frame: Arc<CompressedFrame>,
}

/// Errors from renderers and the synchronous lookup path
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("page {page} out of range (document has {page_count} pages)")]
    InvalidPage { page: PageIndex, page_count: usize },

    #[error("invalid resolution {0}")]
    InvalidResolution(f64),

    #[error("renderer not usable: {0}")]
    InvalidRenderer(String),

    #[error("PNG encoding: {0}")]
    Encode(#[from] png::EncodingError),

    #[error("image decoding: {0}")]
    Decode(#[from] image::ImageError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("rendering page {page} timed out after {timeout:?}")]
    Timeout { page: PageIndex, timeout: Duration },

    #[error("renderer panicked on page {page}")]
    Panicked { page: PageIndex },

    #[error("{detail}")]
    Engine { detail: String },
}

impl RenderError {
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine { detail: msg.into() }
    }
}
