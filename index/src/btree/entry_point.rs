//! Page 0 of the data file: tree-wide counters.
//!
//! ```text
//! offset  size  field
//! 28      8     tree size (i64, entries including the null key)
//! 36      4     pages size (i32, highest bucket page handed out)
//! ```
//!
//! Allocation hands out `pages size + 1` while that page already exists in
//! the file, and only extends the file once every existing page is in use.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::ops::{Deref, DerefMut};

use crate::storage::page::{Page, PageIndex, header};

const TREE_SIZE_OFFSET: usize = header::NEXT_FREE_POSITION;
const PAGES_SIZE_OFFSET: usize = TREE_SIZE_OFFSET + 8;

pub struct EntryPoint<P> {
    page: P,
}

impl<P: Deref<Target = Page>> EntryPoint<P> {
    pub const fn new(page: P) -> Self {
        Self { page }
    }

    #[must_use]
    pub fn tree_size(&self) -> i64 {
        self.page.read_i64(TREE_SIZE_OFFSET)
    }

    #[must_use]
    pub fn pages_size(&self) -> PageIndex {
        self.page.read_i32(PAGES_SIZE_OFFSET).max(0) as PageIndex
    }
}

impl<P: DerefMut<Target = Page>> EntryPoint<P> {
    /// Empty tree with only the root bucket allocated.
    pub fn init(&mut self) {
        self.set_tree_size(0);
        self.set_pages_size(1);
    }

    pub fn set_tree_size(&mut self, size: i64) {
        self.page.write_i64(TREE_SIZE_OFFSET, size);
    }

    pub fn set_pages_size(&mut self, pages: PageIndex) {
        self.page.write_i32(PAGES_SIZE_OFFSET, pages as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        let mut entry_point = EntryPoint::new(Box::new(Page::new()));
        entry_point.init();

        assert_eq!(entry_point.tree_size(), 0);
        assert_eq!(entry_point.pages_size(), 1);
    }

    #[test]
    fn test_layout() {
        let mut entry_point = EntryPoint::new(Box::new(Page::new()));
        entry_point.set_tree_size(-3);
        entry_point.set_pages_size(12);
        let page = entry_point.page;

        assert_eq!(page.read_i64(28), -3);
        assert_eq!(page.read_i32(36), 12);
    }
}
