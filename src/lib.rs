// Export modules for use in tests
pub mod render;
pub mod settings;

// Re-export the cache entry points
pub use render::{
    Budget, CacheLookup, CacheManager, CompressedFrame, DocumentLayout, PageRenderer,
    RenderConfig, RenderError,
};
pub use settings::Settings;
