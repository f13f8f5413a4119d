//! Slide rendering cache infrastructure

mod cache;
mod distribute;
mod external;
mod frame;
mod layout;
mod manager;
mod renderer;
mod request;
mod types;
mod worker;

pub use cache::{Budget, CacheEntry, CacheStore, Region};
pub use distribute::{BudgetedCache, distribute_memory, total_used_memory};
pub use external::{ExternalRenderer, MAX_PROCESS_TIME};
pub use frame::{CompressedFrame, RasterImage, encode_png};
pub use layout::{DocumentLayout, StaticLayout};
pub use manager::{CacheLookup, CacheManager, FORWARD_BIAS, SHUTDOWN_TIMEOUT};
pub use renderer::{PageRenderer, SolidRenderer};
pub use request::{FrameReady, RenderError, WorkerJob, WorkerReport};
pub use types::*;
pub use worker::RenderWorker;
