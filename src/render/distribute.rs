//! Sharing one memory budget between several caches

use log::debug;

use super::manager::CacheManager;
use super::renderer::PageRenderer;

/// A cache whose memory limit can be set relative to its frame size
pub trait BudgetedCache {
    /// Pixels of one frame; caches with bigger frames get a bigger share
    fn pixel_budget_hint(&self) -> f64;

    /// Limit memory to `bytes_per_pixel` times the pixel hint
    fn set_scaled_memory(&mut self, bytes_per_pixel: f64);

    fn used_memory_bytes(&self) -> i64;
}

impl<R: PageRenderer + 'static> BudgetedCache for CacheManager<R> {
    fn pixel_budget_hint(&self) -> f64 {
        CacheManager::pixel_budget_hint(self)
    }

    fn set_scaled_memory(&mut self, bytes_per_pixel: f64) {
        CacheManager::set_scaled_memory(self, bytes_per_pixel);
    }

    fn used_memory_bytes(&self) -> i64 {
        CacheManager::used_memory_bytes(self)
    }
}

/// Split `total_bytes` across `caches` in proportion to their pixel hints.
///
/// A negative total means unlimited and leaves every cache as it is.
pub fn distribute_memory(total_bytes: i64, caches: &mut [&mut dyn BudgetedCache]) {
    if total_bytes < 0 {
        return;
    }
    let pixels: f64 = caches.iter().map(|c| c.pixel_budget_hint()).sum();
    if pixels <= 0.0 {
        return;
    }
    let scale = total_bytes as f64 / pixels;
    debug!(
        "Distributing {total_bytes} bytes over {} caches ({scale:.3} bytes per pixel)",
        caches.len()
    );
    for cache in caches.iter_mut() {
        cache.set_scaled_memory(scale);
    }
}

/// Memory held by all `caches` together
#[must_use]
pub fn total_used_memory(caches: &[&dyn BudgetedCache]) -> i64 {
    caches.iter().map(|c| c.used_memory_bytes()).sum()
}
