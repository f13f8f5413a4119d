//! Cache manager - owns the frame store, the worker pool and the scheduling
//!
//! All scheduling state lives on the thread that owns the [`CacheManager`].
//! Only the frame store sits behind a mutex, because synchronous lookups
//! may come from other threads through a [`CacheLookup`].

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use super::cache::{Budget, CacheStore, Region};
use super::frame::{CompressedFrame, RasterImage};
use super::layout::DocumentLayout;
use super::renderer::PageRenderer;
use super::request::{FrameReady, RenderError, WorkerReport};
use super::types::{FitMode, PageIndex, PagePart, RenderConfig, ViewportSize, same_resolution};
use super::worker::RenderWorker;

/// How long `shutdown` waits for busy workers before detaching them
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Weight of the pages behind the current page relative to the pages ahead
/// of it when deciding where to evict and where to grow.
pub const FORWARD_BIAS: i64 = 3;

/// Slot count reported when nothing limits the cache
const UNLIMITED_SLOTS: i64 = (i32::MAX >> 1) as i64;

const SHUTDOWN_POLL: Duration = Duration::from_millis(5);

struct Shared<R> {
    store: Mutex<CacheStore>,
    config: RwLock<RenderConfig>,
    layout: Arc<dyn DocumentLayout>,
    /// Renderer for synchronous lookups
    renderer: R,
    /// False when the pool is empty; lookups then leave the store untouched
    store_lookups: bool,
}

impl<R: PageRenderer> Shared<R> {
    fn lock_store(&self) -> MutexGuard<'_, CacheStore> {
        self.store
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn config(&self) -> RenderConfig {
        *self
            .config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn resolution_for(&self, page: PageIndex) -> Option<f64> {
        let size = self.layout.page_size(page)?;
        self.config().resolution_for_size(size)
    }

    fn target_resolution(
        &self,
        page: PageIndex,
        resolution: Option<f64>,
    ) -> Result<f64, RenderError> {
        let page_count = self.layout.page_count();
        if page >= page_count {
            return Err(RenderError::InvalidPage { page, page_count });
        }
        match resolution {
            Some(res) if res > 0.0 => Ok(res),
            _ => self
                .resolution_for(page)
                .ok_or(RenderError::InvalidResolution(resolution.unwrap_or(-1.0))),
        }
    }

    /// Cached frame at `resolution`. Stale policy frames are dropped.
    fn cached_frame(&self, page: PageIndex, resolution: f64) -> Option<Arc<CompressedFrame>> {
        let policy = self.resolution_for(page);
        self.lock_store().valid_frame(page, resolution, policy)
    }

    /// Keep a synchronously rendered frame if it matches the current policy
    fn keep(&self, frame: &Arc<CompressedFrame>) {
        if !self.store_lookups {
            return;
        }
        let matches = self
            .resolution_for(frame.page())
            .is_some_and(|res| same_resolution(res, frame.resolution()));
        if matches {
            self.lock_store().store(Arc::clone(frame));
        }
    }

    fn lookup(
        &self,
        page: PageIndex,
        resolution: Option<f64>,
    ) -> Result<Arc<CompressedFrame>, RenderError> {
        let resolution = self.target_resolution(page, resolution)?;
        if let Some(frame) = self.cached_frame(page, resolution) {
            return Ok(frame);
        }

        // Not cached, or a worker is still busy with it. Rendering again is
        // cheaper than waiting an unknown time for the worker.
        debug!("Rendering page {page} synchronously at {resolution:.4}");
        let data = self.renderer.render_compressed(page, resolution)?;
        let frame = Arc::new(CompressedFrame::new(page, resolution, data));
        self.keep(&frame);
        Ok(frame)
    }

    fn lookup_image(
        &self,
        page: PageIndex,
        resolution: Option<f64>,
    ) -> Result<RasterImage, RenderError> {
        let resolution = self.target_resolution(page, resolution)?;
        if let Some(frame) = self.cached_frame(page, resolution) {
            return frame.decode();
        }

        debug!("Rendering page {page} synchronously at {resolution:.4}");
        let image = self.renderer.render(page, resolution)?;
        if self.store_lookups {
            match CompressedFrame::from_image(&image, page, resolution) {
                Ok(frame) => self.keep(&Arc::new(frame)),
                Err(e) => warn!("Compressing page {page} failed: {e}"),
            }
        }
        Ok(image)
    }
}

/// Thread-safe handle for synchronous lookups.
///
/// Blocks the calling thread while rendering; meant for export and other
/// callers that cannot wait for the background workers.
pub struct CacheLookup<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for CacheLookup<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: PageRenderer> CacheLookup<R> {
    /// Compressed frame of `page`, rendering it if necessary.
    ///
    /// `resolution` defaults to the one derived from viewport and fit mode.
    pub fn lookup(
        &self,
        page: PageIndex,
        resolution: Option<f64>,
    ) -> Result<Arc<CompressedFrame>, RenderError> {
        self.shared.lookup(page, resolution)
    }

    /// Like [`lookup`](Self::lookup) but returns pixels
    pub fn lookup_image(
        &self,
        page: PageIndex,
        resolution: Option<f64>,
    ) -> Result<RasterImage, RenderError> {
        self.shared.lookup_image(page, resolution)
    }

    #[must_use]
    pub fn resolution_for(&self, page: PageIndex) -> Option<f64> {
        self.shared.resolution_for(page)
    }
}

/// Bounded, locality-biased cache of rendered pages
pub struct CacheManager<R: PageRenderer + 'static> {
    shared: Arc<Shared<R>>,
    workers: Vec<RenderWorker>,
    reports: Receiver<WorkerReport>,
    /// Explicitly requested pages, served before the region is extended
    pending: VecDeque<PageIndex>,
    region: Region,
    current_page: PageIndex,
    budget: Budget,
    /// Pages whose last background render failed. They are left alone
    /// until navigation or a request asks for them again.
    failed: BTreeSet<PageIndex>,
    subscribers: Vec<Sender<FrameReady>>,
}

impl<R: PageRenderer + 'static> CacheManager<R> {
    /// Create a cache with `threads` background workers.
    ///
    /// `factory` builds one renderer for synchronous lookups and one per
    /// worker. Documents with mixed page sizes get no workers at all.
    pub fn new<F>(
        layout: Arc<dyn DocumentLayout>,
        threads: usize,
        config: RenderConfig,
        factory: F,
    ) -> Result<Self, RenderError>
    where
        F: Fn(PagePart) -> Result<R, RenderError>,
    {
        let threads = if layout.has_uniform_page_sizes() {
            threads
        } else {
            info!("Pages differ in size, rendering synchronously only");
            0
        };

        let renderer = factory(config.page_part)?;
        let (report_tx, reports) = flume::unbounded();
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let worker_renderer = factory(config.page_part)?;
            workers.push(RenderWorker::spawn(id, worker_renderer, report_tx.clone())?);
        }
        info!(
            "Render cache for {} pages with {} workers",
            layout.page_count(),
            workers.len()
        );

        let shared = Arc::new(Shared {
            store: Mutex::new(CacheStore::new()),
            config: RwLock::new(config),
            layout,
            renderer,
            store_lookups: threads > 0,
        });

        Ok(Self {
            shared,
            workers,
            reports,
            pending: VecDeque::new(),
            region: Region::empty_at(0),
            current_page: 0,
            budget: Budget::unlimited(),
            failed: BTreeSet::new(),
            subscribers: Vec::new(),
        })
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    /// Set memory and page limits; takes effect on the next dispatch
    pub fn set_budget(&mut self, budget: Budget) {
        debug!("Cache budget set to {budget:?}");
        self.budget = budget;
    }

    /// Limit memory to `bytes_per_pixel` times the viewport area.
    /// A negative factor removes the memory limit.
    pub fn set_scaled_memory(&mut self, bytes_per_pixel: f64) {
        self.budget.max_memory = if bytes_per_pixel < 0.0 {
            None
        } else {
            Some((bytes_per_pixel * self.pixel_budget_hint()) as i64)
        };
        debug!("Cache memory limit scaled to {:?}", self.budget.max_memory);
    }

    /// Change the render area. Clears the cache if cached frames no longer
    /// have the right resolution.
    pub fn update_viewport(&mut self, size: ViewportSize) {
        self.reconfigure(|config| config.viewport = size);
    }

    pub fn set_fit_mode(&mut self, mode: FitMode) {
        self.reconfigure(|config| config.fit_mode = mode);
    }

    fn reconfigure(&mut self, change: impl FnOnce(&mut RenderConfig)) {
        let reference = self.current_page;
        let before = self.shared.resolution_for(reference);
        {
            let mut config = self
                .shared
                .config
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            change(&mut config);
        }
        let after = self.shared.resolution_for(reference);

        let unchanged = match (before, after) {
            (Some(a), Some(b)) => same_resolution(a, b),
            (None, None) => true,
            _ => false,
        };
        if !unchanged && !self.workers.is_empty() {
            debug!("Resolution changed from {before:?} to {after:?}, clearing cache");
            self.clear();
        }
    }

    /// Drop every cached frame
    pub fn clear(&mut self) {
        self.shared.lock_store().clear();
        self.region = Region::empty_at(self.current_page);
        self.failed.clear();
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> RenderConfig {
        self.shared.config()
    }

    #[must_use]
    pub fn budget(&self) -> Budget {
        self.budget
    }

    #[must_use]
    pub fn resolution_for(&self, page: PageIndex) -> Option<f64> {
        self.shared.resolution_for(page)
    }

    /// Total size of all cached frames in bytes
    #[must_use]
    pub fn used_memory_bytes(&self) -> i64 {
        self.shared.lock_store().used_memory()
    }

    /// Pixels of one rendered page, for sharing a global memory budget
    #[must_use]
    pub fn pixel_budget_hint(&self) -> f64 {
        self.shared.config().viewport.area()
    }

    #[must_use]
    pub fn current_page(&self) -> PageIndex {
        self.current_page
    }

    #[must_use]
    pub fn region(&self) -> Region {
        self.region
    }

    #[must_use]
    pub fn pending_pages(&self) -> Vec<PageIndex> {
        self.pending.iter().copied().collect()
    }

    /// Pages with an entry, placeholders included
    #[must_use]
    pub fn cached_pages(&self) -> Vec<PageIndex> {
        self.shared.lock_store().pages().collect()
    }

    #[must_use]
    pub fn is_cached(&self, page: PageIndex) -> bool {
        self.shared.lock_store().contains(page)
    }

    #[must_use]
    pub fn is_rendering(&self, page: PageIndex) -> bool {
        self.shared.lock_store().is_rendering(page)
    }

    #[must_use]
    pub fn workers(&self) -> &[RenderWorker] {
        &self.workers
    }

    #[must_use]
    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_idle()).count()
    }

    #[must_use]
    pub fn verify_memory_invariant(&self) -> bool {
        self.shared.lock_store().memory_invariant_holds()
    }

    /// True if every page inside the region has a cache entry
    #[must_use]
    pub fn verify_region_invariant(&self) -> bool {
        let store = self.shared.lock_store();
        self.region.is_backed_by(|page| store.contains(page))
    }

    // ---------------------------------------------------------------------
    // Synchronous access
    // ---------------------------------------------------------------------

    /// Compressed frame of `page`, rendered on this thread if necessary
    pub fn lookup(
        &self,
        page: PageIndex,
        resolution: Option<f64>,
    ) -> Result<Arc<CompressedFrame>, RenderError> {
        self.shared.lookup(page, resolution)
    }

    /// Decoded image of `page`, rendered on this thread if necessary
    pub fn lookup_image(
        &self,
        page: PageIndex,
        resolution: Option<f64>,
    ) -> Result<RasterImage, RenderError> {
        self.shared.lookup_image(page, resolution)
    }

    /// Handle for lookups from other threads
    #[must_use]
    pub fn lookup_handle(&self) -> CacheLookup<R> {
        CacheLookup {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Receive a notification for every frame stored by the workers
    pub fn subscribe(&mut self) -> Receiver<FrameReady> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.push(tx);
        rx
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Ask for `page` to be rendered in the background soon
    pub fn request_page(&mut self, page: PageIndex) {
        if page >= self.shared.layout.page_count() {
            debug!("Ignoring request for page {page} outside the document");
            return;
        }
        self.failed.remove(&page);
        let cached = self.shared.lock_store().contains(page);
        if !cached && !self.pending.contains(&page) {
            self.pending.push_back(page);
        }
        self.dispatch();
    }

    /// Navigation moved to `page`
    pub fn on_current_page_changed(&mut self, page: PageIndex) {
        if page >= self.shared.layout.page_count() {
            debug!("Ignoring navigation to page {page} outside the document");
            return;
        }
        self.note_current_page(page);
        self.dispatch();
    }

    fn note_current_page(&mut self, page: PageIndex) {
        self.current_page = page;
        self.failed.remove(&page);

        let shared = Arc::clone(&self.shared);
        let store = shared.lock_store();
        if !store.contains(page) {
            self.pending.retain(|p| *p != page);
            self.pending.push_front(page);
            self.region = Region::single(page);
        } else if !self.region.contains(page) {
            self.region = Region::single(page);
        }
        self.region.grow(|p| store.contains(p));
    }

    /// A worker finished `page`; `None` means rendering failed
    pub fn on_frame_ready(&mut self, page: PageIndex, frame: Option<CompressedFrame>) {
        let stored = {
            let shared = Arc::clone(&self.shared);
            let mut store = shared.lock_store();
            match frame {
                None => {
                    store.discard_placeholder(page);
                    self.failed.insert(page);
                    self.settle_region(&store);
                    None
                }
                Some(frame) => {
                    let fresh = shared
                        .resolution_for(frame.page())
                        .is_some_and(|res| same_resolution(res, frame.resolution()));
                    if fresh {
                        let frame = Arc::new(frame);
                        store.store(Arc::clone(&frame));
                        Some(frame)
                    } else {
                        debug!(
                            "Discarding stale frame for page {page} at {:.4}",
                            frame.resolution()
                        );
                        store.discard_placeholder(page);
                        None
                    }
                }
            }
        };

        if let Some(frame) = stored {
            self.notify(page, frame);
        }
        self.dispatch();
    }

    fn notify(&mut self, page: PageIndex, frame: Arc<CompressedFrame>) {
        self.subscribers.retain(|tx| {
            tx.send(FrameReady {
                page,
                frame: Arc::clone(&frame),
            })
            .is_ok()
        });
    }

    fn handle_report(&mut self, report: WorkerReport) {
        if let Some(worker) = self.workers.get_mut(report.worker) {
            worker.finish();
        }
        match report.outcome {
            Ok(frame) => self.on_frame_ready(report.page, Some(frame)),
            Err(e) => {
                warn!("Rendering page {} failed: {e}", report.page);
                self.on_frame_ready(report.page, None);
            }
        }
    }

    /// Process every report that has arrived, without blocking.
    /// Returns the number of reports handled.
    pub fn poll_reports(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(report) = self.reports.try_recv() {
            self.handle_report(report);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for one report and process it
    pub fn wait_for_report(&mut self, timeout: Duration) -> bool {
        match self.reports.recv_timeout(timeout) {
            Ok(report) => {
                self.handle_report(report);
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Keep processing reports until no worker is busy.
    /// Returns false if `timeout` ran out first.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll_reports();
            if self.busy_workers() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.wait_for_report(deadline - now);
        }
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Evict if needed, then hand work to idle workers
    pub fn dispatch(&mut self) {
        self.sweep_abandoned();
        let mut slots = self.reclaim();

        let shared = Arc::clone(&self.shared);
        let mut store = shared.lock_store();
        for idx in 0..self.workers.len() {
            if slots <= 0 {
                break;
            }
            if !self.workers[idx].is_idle() {
                continue;
            }
            let Some(page) = self.pick_next(&store) else {
                break;
            };
            let Some(resolution) = shared.resolution_for(page) else {
                debug!("No resolution for page {page}, not rendering");
                self.pending.push_front(page);
                break;
            };
            store.reserve(page);
            if self.workers[idx].assign(page, resolution) {
                slots -= 1;
            } else {
                store.discard_placeholder(page);
            }
        }
        self.settle_region(&store);
    }

    /// Clear placeholders nobody is rendering any more
    fn sweep_abandoned(&mut self) {
        for worker in &mut self.workers {
            if !worker.is_idle() && !worker.is_alive() {
                if let Some(page) = worker.finish() {
                    warn!("Render worker {} died while rendering page {page}", worker.id());
                }
            }
        }

        let owned: Vec<PageIndex> = self.workers.iter().filter_map(RenderWorker::assigned).collect();
        let mut store = self.shared.lock_store();
        let abandoned: Vec<PageIndex> = store
            .placeholders()
            .filter(|page| !owned.contains(page))
            .collect();
        for page in abandoned {
            debug!("Clearing abandoned placeholder for page {page}");
            store.discard_placeholder(page);
        }
    }

    /// Number of frames the budget still allows for
    fn allowed_slots(&self, store: &CacheStore) -> i64 {
        let workers = self.workers.len() as i64;
        let cached = store.ready_count() as i64;
        let used = store.used_memory();

        let by_memory = self.budget.max_memory.map(|max| {
            if used > 0 && cached > 0 {
                let slots = (i128::from(max - used) * i128::from(cached)).div_euclid(i128::from(used));
                slots.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
            } else {
                workers
            }
        });
        let by_count = self.budget.max_pages.map(|max| max - cached);

        match (by_memory, by_count) {
            (Some(m), Some(c)) => m.min(c),
            (Some(m), None) => m,
            (None, Some(c)) => c,
            (None, None) => UNLIMITED_SLOTS,
        }
    }

    /// Shrink the cache to the budget, keeping pages near the current one.
    /// Returns how many more frames may be rendered.
    fn reclaim(&mut self) -> i64 {
        let workers = self.workers.len() as i64;
        let cur = self.current_page as i64;
        let shared = Arc::clone(&self.shared);
        let mut store = shared.lock_store();

        if self.budget.is_unbounded() {
            if store.ready_count() >= shared.layout.page_count() {
                return 0;
            }
            return UNLIMITED_SLOTS;
        }
        if self.budget.forbids_caching() {
            store.clear();
            self.region = Region::empty_at(self.current_page);
            return 0;
        }

        let mut allowed = self.allowed_slots(&store);
        if allowed >= workers {
            return allowed;
        }
        debug!(
            "Cache over budget: {} bytes in {} frames, {allowed} slots",
            store.used_memory(),
            store.ready_count()
        );

        while store.len() >= 2 {
            let (Some(first), Some(last)) = (store.first_page(), store.last_page()) else {
                break;
            };
            let (first, last) = (first as i64, last as i64);

            // A compact run reaching past the current page and leaning
            // towards the pages ahead is kept as it is.
            let settled = self.budget.allows(store.len(), store.used_memory())
                && last > cur
                && last - first <= store.len() as i64
                && 2 * last + 3 * first > 5 * cur;
            if settled {
                break;
            }

            let evict_last = last + FORWARD_BIAS * first > (FORWARD_BIAS + 1) * cur;
            // against the document end or a failing page the freed slot
            // would only render the same page again
            let refill = if evict_last {
                self.next_candidate(first, last - 1)
            } else {
                self.next_candidate(first + 1, last)
            };
            let victim = if evict_last { last } else { first };
            if self.budget.allows(store.len(), store.used_memory())
                && refill.map(|(page, _)| page) == Some(victim)
            {
                break;
            }

            let evicted = if evict_last {
                store.pop_last()
            } else {
                store.pop_first()
            };
            if let Some((page, entry)) = evicted {
                debug!("Evicted page {page} (ready: {})", entry.is_ready());
            }

            allowed = self.allowed_slots(&store);
            if allowed >= workers {
                break;
            }
        }

        match (store.first_page(), store.last_page()) {
            (Some(first), Some(last)) => {
                self.region.first = self.region.first.max(first as i64);
                self.region.second = self.region.second.min(last as i64);
            }
            _ => self.region = Region::empty_at(self.current_page),
        }
        allowed
    }

    /// Choose the page to render next
    fn pick_next(&mut self, store: &CacheStore) -> Option<PageIndex> {
        while let Some(page) = self.pending.pop_front() {
            if !store.contains(page) {
                return Some(page);
            }
        }

        if self.region.is_empty() || !self.region.contains(self.current_page) {
            self.region = self.region_around_current(store);
        }

        // A failing current page stays out of the region; prefetch spreads
        // from it on both sides without touching the region.
        let pivot_failed = self.failed.contains(&self.current_page);
        let (mut first, mut second) = if pivot_failed {
            let cur = self.current_page as i64;
            (cur, cur)
        } else {
            (self.region.first, self.region.second)
        };
        loop {
            let (page, went_left) = self.next_candidate(first, second)?;
            if went_left {
                first = page;
            } else {
                second = page;
            }
            if !pivot_failed {
                self.region = Region { first, second };
            }
            let page = page as PageIndex;
            if !store.contains(page) {
                return Some(page);
            }
        }
    }

    /// Neighbour a run of pages `first..=second` grows onto next, and
    /// whether it lies to the left. Failed pages block their side.
    fn next_candidate(&self, first: i64, second: i64) -> Option<(i64, bool)> {
        let page_count = self.shared.layout.page_count() as i64;
        let cur = self.current_page as i64;
        let open = |page: i64| {
            (0..page_count).contains(&page) && !self.failed.contains(&(page as PageIndex))
        };

        let left = first - 1;
        let right = second + 1;
        let go_left = match (open(left), open(right)) {
            (false, false) => return None,
            (true, false) => true,
            (false, true) => false,
            // same weighting as eviction, so a grown page is not evicted again
            (true, true) => right + FORWARD_BIAS * left > (FORWARD_BIAS + 1) * cur,
        };
        Some(if go_left { (left, true) } else { (right, false) })
    }

    /// Region grown from the current page, empty if that page has no entry
    fn region_around_current(&self, store: &CacheStore) -> Region {
        if store.contains(self.current_page) {
            let mut region = Region::single(self.current_page);
            region.grow(|page| store.contains(page));
            region
        } else {
            Region::empty_at(self.current_page)
        }
    }

    /// Make sure the region only covers pages present in the store
    fn settle_region(&mut self, store: &CacheStore) {
        if !self.region.is_backed_by(|page| store.contains(page)) {
            self.region = self.region_around_current(store);
        }
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Stop all workers, waiting at most [`SHUTDOWN_TIMEOUT`]
    pub fn shutdown(&mut self) {
        self.shutdown_with_timeout(SHUTDOWN_TIMEOUT);
    }

    pub fn shutdown_with_timeout(&mut self, timeout: Duration) {
        if self.workers.is_empty() {
            return;
        }
        for worker in &self.workers {
            worker.request_shutdown();
        }

        let deadline = Instant::now() + timeout;
        loop {
            let mut all_done = true;
            for worker in &mut self.workers {
                all_done &= worker.join_if_finished();
            }
            if all_done {
                break;
            }
            if Instant::now() >= deadline {
                for worker in &mut self.workers {
                    if worker.is_alive() {
                        warn!("Render worker {} still busy after {timeout:?}, detaching", worker.id());
                    }
                    worker.detach();
                }
                break;
            }
            thread::sleep(SHUTDOWN_POLL);
        }

        self.workers.clear();
        self.pending.clear();
        self.shared.lock_store().clear();
        debug!("Render cache shut down");
    }
}

impl<R: PageRenderer + 'static> Drop for CacheManager<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::super::layout::StaticLayout;
    use super::super::renderer::SolidRenderer;
    use super::super::types::PageSize;
    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    /// Solid renderer that can be told to fail on one page
    struct TestRenderer {
        inner: SolidRenderer,
        fail_on: Option<PageIndex>,
        calls: Arc<AtomicUsize>,
    }

    impl PageRenderer for TestRenderer {
        fn render(&self, page: PageIndex, resolution: f64) -> Result<RasterImage, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(page) {
                return Err(RenderError::engine("engine failure"));
            }
            self.inner.render(page, resolution)
        }
    }

    fn layout(pages: usize) -> Arc<dyn DocumentLayout> {
        Arc::new(StaticLayout::uniform(pages, PageSize::new(40.0, 30.0)))
    }

    fn config() -> RenderConfig {
        RenderConfig::new(FitMode::Page, PagePart::FullPage, ViewportSize::new(80.0, 60.0))
    }

    fn manager_with(
        pages: usize,
        threads: usize,
        fail_on: Option<PageIndex>,
    ) -> (CacheManager<TestRenderer>, Arc<AtomicUsize>) {
        let layout = layout(pages);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let factory_layout = Arc::clone(&layout);
        let manager = CacheManager::new(layout, threads, config(), move |part| {
            Ok(TestRenderer {
                inner: SolidRenderer::new(Arc::clone(&factory_layout), part),
                fail_on,
                calls: Arc::clone(&counter),
            })
        })
        .unwrap();
        (manager, calls)
    }

    fn manager(pages: usize, threads: usize) -> CacheManager<TestRenderer> {
        manager_with(pages, threads, None).0
    }

    fn ready_frame(page: PageIndex, size: usize) -> CompressedFrame {
        CompressedFrame::new(page, 2.0, vec![0; size])
    }

    /// Put frames straight into the store, bypassing the workers
    fn seed(manager: &CacheManager<TestRenderer>, pages: &[PageIndex], size: usize) {
        let mut store = manager.shared.lock_store();
        for &page in pages {
            store.store(Arc::new(ready_frame(page, size)));
        }
    }

    #[test]
    fn navigation_to_uncached_page_queues_it_first() {
        let mut cache = manager(20, 2);
        cache.set_budget(Budget::new(None, Some(3)));

        cache.note_current_page(5);
        assert_eq!(cache.region(), Region::single(5));
        assert_eq!(cache.pending_pages(), vec![5]);

        cache.dispatch();
        assert_eq!(cache.workers()[0].assigned(), Some(5));
        assert!(cache.is_rendering(5));
        assert!(cache.pending_pages().is_empty());
        assert!(cache.verify_region_invariant());
    }

    #[test]
    fn finished_neighbour_extends_region() {
        let mut cache = manager(20, 0);
        seed(&cache, &[3, 4, 5, 6], 10);
        cache.note_current_page(5);
        assert_eq!(cache.region(), Region { first: 3, second: 6 });

        seed(&cache, &[7], 10);
        cache.on_current_page_changed(5);
        assert_eq!(cache.region(), Region { first: 3, second: 7 });
    }

    #[test]
    fn eviction_prefers_pages_behind_current() {
        let mut cache = manager(20, 1);
        seed(&cache, &[1, 2, 3], 10);
        cache.current_page = 2;
        cache.set_budget(Budget::new(None, Some(2)));

        let slots = cache.reclaim();
        assert_eq!(cache.cached_pages(), vec![2, 3]);
        assert!(slots <= 0);
        assert_eq!(cache.used_memory_bytes(), 20);
    }

    #[test]
    fn eviction_drops_far_end_when_cache_leans_ahead() {
        let mut cache = manager(20, 1);
        seed(&cache, &[4, 5, 6, 7, 8, 9], 10);
        cache.current_page = 4;
        cache.set_budget(Budget::new(None, Some(3)));

        cache.reclaim();
        // 9 + 3*4 > 4*4: trim from the top until the run is settled
        assert_eq!(cache.cached_pages(), vec![4, 5, 6]);
    }

    #[test]
    fn memory_budget_limits_slots() {
        let mut cache = manager(20, 1);
        seed(&cache, &[0, 1], 100);
        cache.set_budget(Budget::new(Some(1000), None));
        // (1000 - 200) * 2 / 200
        assert_eq!(cache.reclaim(), 8);
    }

    #[test]
    fn zero_budget_empties_cache() {
        let mut cache = manager(20, 1);
        seed(&cache, &[0, 1, 2], 100);
        cache.set_budget(Budget::new(Some(0), None));
        assert_eq!(cache.reclaim(), 0);
        assert!(cache.cached_pages().is_empty());
        assert_eq!(cache.used_memory_bytes(), 0);
    }

    #[test]
    fn unbounded_full_cache_has_no_slots() {
        let mut cache = manager(3, 1);
        seed(&cache, &[0, 1, 2], 1);
        assert_eq!(cache.reclaim(), 0);
    }

    #[test]
    fn failed_render_clears_placeholder() {
        let (mut cache, _) = manager_with(20, 1, Some(9));
        cache.on_current_page_changed(9);
        assert!(cache.is_rendering(9));
        let before = cache.used_memory_bytes();

        assert!(cache.wait_for_report(WAIT));
        assert!(!cache.is_cached(9));
        assert_eq!(cache.used_memory_bytes(), before);
        assert!(cache.verify_memory_invariant());
    }

    #[test]
    fn null_frame_clears_placeholder_directly() {
        let mut cache = manager(20, 0);
        cache.shared.lock_store().reserve(9);
        cache.on_frame_ready(9, None);
        assert!(!cache.is_cached(9));
        assert_eq!(cache.used_memory_bytes(), 0);
    }

    #[test]
    fn failed_page_is_not_retried_until_asked() {
        let (mut cache, calls) = manager_with(3, 1, Some(1));
        cache.set_budget(Budget::new(None, Some(3)));
        cache.on_current_page_changed(1);
        assert!(cache.run_until_idle(WAIT));

        let after_first_pass = calls.load(Ordering::SeqCst);
        assert!(!cache.is_cached(1));
        assert!(cache.is_cached(0) && cache.is_cached(2));

        // idle cache does not hammer the failing page
        cache.dispatch();
        assert_eq!(cache.busy_workers(), 0);

        cache.request_page(1);
        assert!(cache.run_until_idle(WAIT));
        assert_eq!(calls.load(Ordering::SeqCst), after_first_pass + 1);
    }

    #[test]
    fn failed_page_stops_region_growth() {
        let (mut cache, _) = manager_with(10, 1, Some(6));
        cache.on_current_page_changed(5);
        assert!(cache.run_until_idle(WAIT));

        assert_eq!(cache.cached_pages(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(cache.region(), Region { first: 0, second: 5 });
        assert!(cache.verify_region_invariant());
    }

    #[test]
    fn failed_current_page_prefetches_both_sides() {
        let (mut cache, _) = manager_with(20, 1, Some(9));
        cache.set_budget(Budget::new(None, Some(4)));
        cache.on_current_page_changed(9);
        assert!(cache.run_until_idle(WAIT));

        assert_eq!(cache.cached_pages(), vec![8, 10, 11, 12]);
        assert!(cache.region().is_empty());
        assert!(cache.verify_region_invariant());
    }

    #[test]
    fn full_cache_at_document_end_stays_put() {
        let mut cache = manager(20, 1);
        seed(&cache, &[16, 17, 18, 19], 10);
        cache.current_page = 19;
        cache.set_budget(Budget::new(None, Some(4)));

        // evicting 16 would only render it again
        assert!(cache.reclaim() <= 0);
        assert_eq!(cache.cached_pages(), vec![16, 17, 18, 19]);
    }

    #[test]
    fn page_without_resolution_stays_queued() {
        let mut cache = manager(20, 1);
        cache.update_viewport(ViewportSize::new(0.0, 0.0));
        cache.request_page(4);
        assert_eq!(cache.pending_pages(), vec![4]);
        assert!(!cache.is_rendering(4));
        assert_eq!(cache.busy_workers(), 0);
        assert!(cache.verify_region_invariant());

        cache.update_viewport(ViewportSize::new(80.0, 60.0));
        cache.dispatch();
        assert_eq!(cache.workers()[0].assigned(), Some(4));
        assert!(cache.pending_pages().is_empty());
    }

    #[test]
    fn request_page_is_idempotent() {
        let mut cache = manager(20, 0);
        cache.request_page(4);
        cache.request_page(4);
        assert_eq!(cache.pending_pages(), vec![4]);

        seed(&cache, &[6], 1);
        cache.request_page(6);
        assert_eq!(cache.pending_pages(), vec![4]);
    }

    #[test]
    fn stale_frame_is_discarded() {
        let mut cache = manager(20, 0);
        cache.shared.lock_store().reserve(2);
        cache.on_frame_ready(2, Some(CompressedFrame::new(2, 7.0, vec![1; 10])));
        assert!(!cache.is_cached(2));
        assert_eq!(cache.used_memory_bytes(), 0);
    }

    #[test]
    fn fresh_frame_replaces_entry_and_notifies() {
        let mut cache = manager(20, 0);
        let rx = cache.subscribe();
        seed(&cache, &[2], 50);

        cache.on_frame_ready(2, Some(ready_frame(2, 20)));
        assert_eq!(cache.used_memory_bytes(), 20);
        let note = rx.try_recv().unwrap();
        assert_eq!(note.page, 2);
        assert_eq!(note.frame.size(), 20);
    }

    #[test]
    fn pick_next_leans_forward() {
        let mut cache = manager(20, 1);
        seed(&cache, &[5], 1);
        cache.note_current_page(5);

        let shared = Arc::clone(&cache.shared);
        let mut picks = Vec::new();
        for _ in 0..4 {
            let page = {
                let store = shared.lock_store();
                cache.pick_next(&store).unwrap()
            };
            shared.lock_store().reserve(page);
            picks.push(page);
        }
        // three pages ahead for every page behind
        assert_eq!(picks, vec![6, 7, 8, 4]);
    }

    #[test]
    fn pick_next_turns_at_document_end() {
        let mut cache = manager(6, 1);
        seed(&cache, &[5], 1);
        cache.note_current_page(5);

        let shared = Arc::clone(&cache.shared);
        let store = shared.lock_store();
        assert_eq!(cache.pick_next(&store), Some(4));
    }

    #[test]
    fn viewport_change_clears_incompatible_frames() {
        let mut cache = manager(20, 1);
        let res = cache.resolution_for(0).unwrap();
        seed(&cache, &[0, 1], 10);

        // same resolution under fit-page: nothing happens
        cache.update_viewport(ViewportSize::new(80.0, 90.0));
        assert!(same_resolution(cache.resolution_for(0).unwrap(), res));
        assert_eq!(cache.cached_pages(), vec![0, 1]);

        cache.update_viewport(ViewportSize::new(160.0, 120.0));
        assert!(cache.cached_pages().is_empty());
        assert_eq!(cache.used_memory_bytes(), 0);
    }

    #[test]
    fn fit_width_ignores_height_changes() {
        let mut cache = manager(20, 1);
        cache.set_fit_mode(FitMode::Width);
        seed(&cache, &[0], 10);
        cache.update_viewport(ViewportSize::new(80.0, 500.0));
        assert_eq!(cache.cached_pages(), vec![0]);
    }

    #[test]
    fn lookup_returns_cached_frame_without_rendering() {
        let (cache, calls) = manager_with(20, 1, None);
        seed(&cache, &[3], 10);
        let frame = cache.lookup(3, None).unwrap();
        assert_eq!(frame.size(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lookup_renders_and_stores_missing_page() {
        let (cache, calls) = manager_with(20, 1, None);
        let frame = cache.lookup(3, None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_cached(3));
        assert_eq!(cache.used_memory_bytes(), frame.size() as i64);

        let again = cache.lookup(3, None).unwrap();
        assert!(Arc::ptr_eq(&frame, &again));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lookup_drops_stale_frame() {
        let cache = manager(20, 1);
        cache
            .shared
            .lock_store()
            .store(Arc::new(CompressedFrame::new(3, 9.0, vec![0; 10])));
        let frame = cache.lookup(3, None).unwrap();
        assert!(same_resolution(frame.resolution(), 2.0));
    }

    #[test]
    fn lookup_at_foreign_resolution_keeps_cache() {
        let (mut cache, calls) = manager_with(20, 1, None);
        cache.set_budget(Budget::new(None, Some(4)));
        cache.on_current_page_changed(5);
        assert!(cache.run_until_idle(WAIT));
        let before = cache.cached_pages();
        let rendered = calls.load(Ordering::SeqCst);

        let frame = cache.lookup(6, Some(5.0)).unwrap();
        assert!(same_resolution(frame.resolution(), 5.0));
        assert_eq!(calls.load(Ordering::SeqCst), rendered + 1);
        assert_eq!(cache.cached_pages(), before);
        assert!(cache.verify_region_invariant());

        let policy = cache.lookup(6, None).unwrap();
        assert!(same_resolution(policy.resolution(), 2.0));
        assert_eq!(calls.load(Ordering::SeqCst), rendered + 1);
    }

    #[test]
    fn lookup_reports_errors() {
        let (cache, _) = manager_with(20, 1, Some(4));
        assert!(matches!(cache.lookup(4, None), Err(RenderError::Engine { .. })));
        assert!(matches!(
            cache.lookup(20, None),
            Err(RenderError::InvalidPage { page: 20, page_count: 20 })
        ));
    }

    #[test]
    fn mixed_page_sizes_disable_workers_and_storing() {
        let layout: Arc<dyn DocumentLayout> = Arc::new(StaticLayout::from_sizes(vec![
            PageSize::new(40.0, 30.0),
            PageSize::new(30.0, 40.0),
        ]));
        let factory_layout = Arc::clone(&layout);
        let mut cache = CacheManager::new(layout, 4, config(), move |part| {
            Ok(SolidRenderer::new(Arc::clone(&factory_layout), part))
        })
        .unwrap();
        assert!(cache.workers().is_empty());

        cache.on_current_page_changed(1);
        let image = cache.lookup_image(1, None).unwrap();
        assert_eq!(image.dimensions(), (45, 60));
        assert!(cache.cached_pages().is_empty());
    }

    #[test]
    fn scaled_memory_uses_viewport_area() {
        let mut cache = manager(20, 1);
        cache.set_scaled_memory(2.0);
        assert_eq!(cache.budget().max_memory, Some(2 * 80 * 60));
        cache.set_scaled_memory(-1.0);
        assert_eq!(cache.budget().max_memory, None);
    }

    #[test]
    fn shutdown_joins_workers() {
        let mut cache = manager(20, 2);
        cache.on_current_page_changed(0);
        cache.shutdown();
        assert!(cache.workers().is_empty());
        assert!(cache.cached_pages().is_empty());
    }
}
