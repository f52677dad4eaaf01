//! Page 0 of the null file: the value stored under the null key.
//!
//! ```text
//! offset  size  field
//! 28      1     presence flag (1 = value present)
//! 29      10    record locator
//! ```

use std::ops::{Deref, DerefMut};

use crate::record::RecordLocator;
use crate::storage::page::{Page, header};

const PRESENCE_OFFSET: usize = header::NEXT_FREE_POSITION;
const VALUE_OFFSET: usize = PRESENCE_OFFSET + 1;

pub struct NullBucket<P> {
    page: P,
}

impl<P: Deref<Target = Page>> NullBucket<P> {
    pub const fn new(page: P) -> Self {
        Self { page }
    }

    #[must_use]
    pub fn value(&self) -> Option<RecordLocator> {
        (self.page.read_u8(PRESENCE_OFFSET) != 0)
            .then(|| RecordLocator::read_from(&self.page, VALUE_OFFSET))
    }
}

impl<P: DerefMut<Target = Page>> NullBucket<P> {
    pub fn init(&mut self) {
        self.page.write_u8(PRESENCE_OFFSET, 0);
    }

    pub fn set_value(&mut self, value: RecordLocator) {
        self.page.write_u8(PRESENCE_OFFSET, 1);
        value.write_to(&mut self.page, VALUE_OFFSET);
    }

    pub fn remove_value(&mut self) {
        self.page.write_u8(PRESENCE_OFFSET, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_after_init() {
        let mut bucket = NullBucket::new(Box::new(Page::new()));
        bucket.set_value(RecordLocator::new(1, 1));
        bucket.init();
        assert_eq!(bucket.value(), None);
    }

    #[test]
    fn test_set_and_remove() {
        let mut bucket = NullBucket::new(Box::new(Page::new()));
        bucket.init();
        bucket.set_value(RecordLocator::new(3, 300));
        assert_eq!(bucket.value(), Some(RecordLocator::new(3, 300)));

        bucket.remove_value();
        assert_eq!(bucket.value(), None);
    }

    #[test]
    fn test_layout() {
        let mut bucket = NullBucket::new(Box::new(Page::new()));
        bucket.set_value(RecordLocator::new(2, 9));
        let page = bucket.page;

        assert_eq!(page.read_u8(28), 1);
        assert_eq!(page.read_i16(29), 2);
        assert_eq!(page.read_i64(31), 9);
    }
}
