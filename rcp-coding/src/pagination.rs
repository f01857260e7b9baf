//! Pagination of cached analysis output
//!
//! Results are cached whole; pages are cut after cache lookup so the
//! pagination parameters never become part of a cache key.

use serde::{Deserialize, Serialize};

/// Default page size
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Largest accepted page size
pub const MAX_PAGE_SIZE: usize = 500;

/// One page of a result list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    /// Current page number (1-indexed)
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
}

/// Cut one page out of `items`
///
/// `limit` is clamped to `[1, MAX_PAGE_SIZE]` and `page` to `[1, total_pages]`.
///
/// # Examples
/// ```
/// use rcp_coding::pagination::paginate;
///
/// let items: Vec<u32> = (0..250).collect();
/// let p = paginate(&items, 2, 100);
/// assert_eq!(p.items.first(), Some(&100));
/// assert_eq!(p.total_pages, 3);
///
/// // Requesting out-of-bounds page gets clamped
/// let p = paginate(&items, 99, 100);
/// assert_eq!(p.page, 3);
/// assert_eq!(p.items.len(), 50);
/// ```
pub fn paginate<T: Clone>(items: &[T], page: usize, limit: usize) -> Page<T> {
    let limit = limit.clamp(1, MAX_PAGE_SIZE);
    let total = items.len();
    let total_pages = total.div_ceil(limit);
    let page = page.max(1).min(total_pages.max(1));
    let offset = (page - 1) * limit;

    let items = items.iter().skip(offset).take(limit).cloned().collect();

    Page {
        items,
        total,
        page,
        limit,
        total_pages,
    }
}
