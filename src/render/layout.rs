//! Document facts consumed by the cache

use super::types::{PageIndex, PageSize};

/// Page geometry of the document being presented.
///
/// The cache never looks at document content; it only needs to know how
/// many pages there are and how large each one is.
pub trait DocumentLayout: Send + Sync {
    /// Number of pages in the document
    fn page_count(&self) -> usize;

    /// Natural size of a page in points, `None` for an invalid index
    fn page_size(&self, page: PageIndex) -> Option<PageSize>;

    /// True if all pages share one size.
    ///
    /// When this is false the cache renders synchronously only, because a
    /// single viewport cannot fix the resolution of every page in advance.
    fn has_uniform_page_sizes(&self) -> bool {
        let Some(first) = self.page_size(0) else {
            return true;
        };
        (1..self.page_count()).all(|page| self.page_size(page) == Some(first))
    }
}

/// Layout with page sizes known up front
#[derive(Clone, Debug, Default)]
pub struct StaticLayout {
    sizes: Vec<PageSize>,
}

impl StaticLayout {
    /// `count` pages of the same size
    #[must_use]
    pub fn uniform(count: usize, size: PageSize) -> Self {
        Self {
            sizes: vec![size; count],
        }
    }

    #[must_use]
    pub fn from_sizes(sizes: Vec<PageSize>) -> Self {
        Self { sizes }
    }
}

impl DocumentLayout for StaticLayout {
    fn page_count(&self) -> usize {
        self.sizes.len()
    }

    fn page_size(&self, page: PageIndex) -> Option<PageSize> {
        self.sizes.get(page).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_layout_reports_uniform() {
        let layout = StaticLayout::uniform(12, PageSize::new(400.0, 300.0));
        assert_eq!(layout.page_count(), 12);
        assert!(layout.has_uniform_page_sizes());
        assert_eq!(layout.page_size(12), None);
    }

    #[test]
    fn mixed_layout_is_not_uniform() {
        let layout = StaticLayout::from_sizes(vec![
            PageSize::new(400.0, 300.0),
            PageSize::new(400.0, 300.0),
            PageSize::new(300.0, 400.0),
        ]);
        assert!(!layout.has_uniform_page_sizes());
    }

    #[test]
    fn empty_layout_counts_as_uniform() {
        assert!(StaticLayout::default().has_uniform_page_sizes());
    }
}
