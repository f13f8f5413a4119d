//! Ordered frame store, budget and connected region

use std::collections::BTreeMap;
use std::sync::Arc;

use super::frame::CompressedFrame;
use super::types::{PageIndex, same_resolution};

/// Value stored per page
#[derive(Clone, Debug)]
pub enum CacheEntry {
    /// A worker is rendering this page, no data yet
    Rendering,
    Ready(Arc<CompressedFrame>),
}

impl CacheEntry {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    fn size(&self) -> i64 {
        match self {
            Self::Rendering => 0,
            Self::Ready(frame) => frame.size() as i64,
        }
    }
}

/// Page-ordered cache map with byte accounting.
///
/// `used_memory` always equals the summed size of all `Ready` frames; every
/// mutation goes through this type to keep it that way.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: BTreeMap<PageIndex, CacheEntry>,
    used_memory: i64,
    ready_count: usize,
}

impl CacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, page: PageIndex) -> bool {
        self.entries.contains_key(&page)
    }

    #[must_use]
    pub fn get(&self, page: PageIndex) -> Option<&CacheEntry> {
        self.entries.get(&page)
    }

    #[must_use]
    pub fn is_rendering(&self, page: PageIndex) -> bool {
        matches!(self.entries.get(&page), Some(CacheEntry::Rendering))
    }

    /// Frame for `page` if it was rendered at `resolution`.
    ///
    /// When `resolution` is the `policy` resolution a mismatching frame is
    /// stale and dropped on the spot. Lookups at any other resolution leave
    /// the store alone.
    pub fn valid_frame(
        &mut self,
        page: PageIndex,
        resolution: f64,
        policy: Option<f64>,
    ) -> Option<Arc<CompressedFrame>> {
        let frame = match self.entries.get(&page) {
            Some(CacheEntry::Ready(frame)) => Arc::clone(frame),
            _ => return None,
        };
        if same_resolution(frame.resolution(), resolution) {
            return Some(frame);
        }
        if policy.is_some_and(|policy| same_resolution(policy, resolution)) {
            self.remove(page);
        }
        None
    }

    /// Reserve `page` for a worker unless it already has an entry
    pub fn reserve(&mut self, page: PageIndex) {
        self.entries.entry(page).or_insert(CacheEntry::Rendering);
    }

    /// Put a frame into the cache, replacing whatever was there
    pub fn store(&mut self, frame: Arc<CompressedFrame>) {
        let page = frame.page();
        let size = frame.size() as i64;
        if let Some(old) = self.entries.insert(page, CacheEntry::Ready(frame)) {
            self.forget(&old);
        }
        self.used_memory += size;
        self.ready_count += 1;
        self.debug_check();
    }

    /// Remove the placeholder for `page`, leaving finished frames alone.
    /// Returns true if a placeholder was removed.
    pub fn discard_placeholder(&mut self, page: PageIndex) -> bool {
        if self.is_rendering(page) {
            self.entries.remove(&page);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, page: PageIndex) -> Option<CacheEntry> {
        let removed = self.entries.remove(&page)?;
        self.forget(&removed);
        self.debug_check();
        Some(removed)
    }

    pub fn pop_first(&mut self) -> Option<(PageIndex, CacheEntry)> {
        let (page, entry) = self.entries.pop_first()?;
        self.forget(&entry);
        self.debug_check();
        Some((page, entry))
    }

    pub fn pop_last(&mut self) -> Option<(PageIndex, CacheEntry)> {
        let (page, entry) = self.entries.pop_last()?;
        self.forget(&entry);
        self.debug_check();
        Some((page, entry))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used_memory = 0;
        self.ready_count = 0;
    }

    #[must_use]
    pub fn first_page(&self) -> Option<PageIndex> {
        self.entries.keys().next().copied()
    }

    #[must_use]
    pub fn last_page(&self) -> Option<PageIndex> {
        self.entries.keys().next_back().copied()
    }

    /// Number of entries, placeholders included
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of finished frames
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready_count
    }

    #[must_use]
    pub fn used_memory(&self) -> i64 {
        self.used_memory
    }

    /// Pages currently reserved by a worker
    pub fn placeholders(&self) -> impl Iterator<Item = PageIndex> + '_ {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_ready())
            .map(|(page, _)| *page)
    }

    pub fn pages(&self) -> impl Iterator<Item = PageIndex> + '_ {
        self.entries.keys().copied()
    }

    /// Recount the byte total from scratch and compare with the running one
    #[must_use]
    pub fn memory_invariant_holds(&self) -> bool {
        let sum: i64 = self.entries.values().map(CacheEntry::size).sum();
        let ready = self.entries.values().filter(|e| e.is_ready()).count();
        sum == self.used_memory && ready == self.ready_count
    }

    fn forget(&mut self, entry: &CacheEntry) {
        if entry.is_ready() {
            self.used_memory -= entry.size();
            self.ready_count -= 1;
        }
    }

    #[inline]
    fn debug_check(&self) {
        debug_assert!(
            self.memory_invariant_holds(),
            "cache byte count out of sync: {} recorded",
            self.used_memory
        );
    }
}

/// Inclusive bounds of the contiguous run of cached pages around the
/// current page. Every page inside has a cache entry.
/// `first > second` means empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub first: i64,
    pub second: i64,
}

impl Region {
    /// Region holding only `page`
    #[must_use]
    pub fn single(page: PageIndex) -> Self {
        let page = page as i64;
        Self {
            first: page,
            second: page,
        }
    }

    /// Empty region anchored at `page`
    #[must_use]
    pub fn empty_at(page: PageIndex) -> Self {
        let page = page as i64;
        Self {
            first: page,
            second: page - 1,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first > self.second
    }

    #[must_use]
    pub fn contains(&self, page: PageIndex) -> bool {
        let page = page as i64;
        self.first <= page && page <= self.second
    }

    /// Extend outwards over neighbouring pages for which `present` holds
    pub fn grow(&mut self, present: impl Fn(PageIndex) -> bool) {
        if self.is_empty() {
            return;
        }
        while self.first > 0 && present((self.first - 1) as PageIndex) {
            self.first -= 1;
        }
        while present((self.second + 1) as PageIndex) {
            self.second += 1;
        }
    }

    /// True if `present` holds for every page of the region
    #[must_use]
    pub fn is_backed_by(&self, present: impl Fn(PageIndex) -> bool) -> bool {
        self.is_empty()
            || (self.first >= 0 && (self.first..=self.second).all(|page| present(page as PageIndex)))
    }
}

/// Memory and page-count ceiling. `None` means unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Budget {
    pub max_memory: Option<i64>,
    pub max_pages: Option<i64>,
}

impl Budget {
    /// Build a budget; negative limits count as unbounded
    #[must_use]
    pub fn new(max_memory: Option<i64>, max_pages: Option<i32>) -> Self {
        Self {
            max_memory: max_memory.filter(|m| *m >= 0),
            max_pages: max_pages.filter(|n| *n >= 0).map(i64::from),
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.max_memory.is_none() && self.max_pages.is_none()
    }

    /// True if either limit is zero, i.e. nothing may be cached
    #[must_use]
    pub fn forbids_caching(&self) -> bool {
        self.max_memory == Some(0) || self.max_pages == Some(0)
    }

    #[must_use]
    pub fn allows(&self, pages: usize, memory: i64) -> bool {
        self.max_pages.is_none_or(|max| pages as i64 <= max)
            && self.max_memory.is_none_or(|max| memory <= max)
    }
}
