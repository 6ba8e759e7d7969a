use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Clamped pagination parameters shared by every listing.
///
/// `page` is 1-based and never below 1. `page_size` falls back to
/// [`DEFAULT_PAGE_SIZE`] when zero or unparseable, otherwise clamps to
/// `1..=MAX_PAGE_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    page: i64,
    page_size: i64,
}

impl PageRequest {
    pub fn new(page: i64, page_size: i64) -> Self {
        let page = page.max(1);
        let page_size = if page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            page_size.clamp(1, MAX_PAGE_SIZE)
        };
        Self { page, page_size }
    }

    /// Build from raw, possibly missing or non-numeric, query parameters.
    pub fn parse(page: Option<&str>, page_size: Option<&str>) -> Self {
        let page = page.and_then(|p| p.trim().parse().ok()).unwrap_or(1);
        let page_size = page_size
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self::new(page, page_size)
    }

    pub fn page(&self) -> i64 {
        self.page
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

/// One page of a listing plus the total row count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        let page_size = request.page_size();
        Self {
            items,
            total,
            page: request.page(),
            page_size,
            total_pages: (total + page_size - 1) / page_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
