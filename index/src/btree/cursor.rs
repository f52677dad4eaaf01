//! Prefetching range cursors.
//!
//! A cursor holds no lock between refills. Each refill takes the shared
//! component latch, searches for the remaining bound, walks leaf siblings
//! until it has `prefetch_size` entries, and releases the latch again. The
//! bound is then moved past the last buffered key, so a cursor never yields
//! a key twice, but entries changed between refills may or may not be seen.
//!
//! A cursor reads committed pages unless it is bound to an atomic operation
//! with [`Cursor::in_operation`], in which case it sees that operation's
//! uncommitted writes as well.

use std::collections::VecDeque;
use std::ops::Bound;

use crate::btree::tree::{IndexError, SingleValueTree};
use crate::key::{Key, KeyCodec};
use crate::record::RecordLocator;
use crate::storage::AtomicOperation;

/// Order in which a cursor yields entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    #[must_use]
    pub const fn from_ascending(ascending: bool) -> Self {
        if ascending {
            Self::Ascending
        } else {
            Self::Descending
        }
    }
}

/// Iterator over the entries of a key range.
///
/// Yields `Err` at most once; the cursor is finished afterwards.
pub struct Cursor<'t, C> {
    tree: &'t SingleValueTree<C>,
    operation: Option<&'t AtomicOperation<'t>>,
    from: Bound<Key>,
    to: Bound<Key>,
    direction: Direction,
    buffer: VecDeque<(Key, RecordLocator)>,
    exhausted: bool,
}

impl<'t, C: KeyCodec> Cursor<'t, C> {
    pub(super) const fn new(
        tree: &'t SingleValueTree<C>,
        from: Bound<Key>,
        to: Bound<Key>,
        direction: Direction,
    ) -> Self {
        Self {
            tree,
            operation: None,
            from,
            to,
            direction,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Read through `op` from the next refill on.
    #[must_use]
    pub const fn in_operation(mut self, op: &'t AtomicOperation<'t>) -> Self {
        self.operation = Some(op);
        self
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    fn refill(&mut self) -> Result<(), IndexError> {
        let limit = self.tree.config().prefetch_size;
        let more = match self.direction {
            Direction::Ascending => self.tree.fetch_ascending(
                self.operation,
                self.from.as_ref(),
                self.to.as_ref(),
                limit,
                &mut self.buffer,
            )?,
            Direction::Descending => self.tree.fetch_descending(
                self.operation,
                self.from.as_ref(),
                self.to.as_ref(),
                limit,
                &mut self.buffer,
            )?,
        };
        tracing::trace!(
            component = %self.tree.name(),
            entries = self.buffer.len(),
            more,
            "cursor refill"
        );

        match (more, self.buffer.back()) {
            (true, Some((last, _))) => match self.direction {
                Direction::Ascending => self.from = Bound::Excluded(last.clone()),
                Direction::Descending => self.to = Bound::Excluded(last.clone()),
            },
            _ => self.exhausted = true,
        }
        Ok(())
    }
}

impl<C: KeyCodec> Iterator for Cursor<'_, C> {
    type Item = Result<(Key, RecordLocator), IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.buffer.pop_front() {
            return Some(Ok(entry));
        }
        if self.exhausted {
            return None;
        }
        if let Err(e) = self.refill() {
            self.exhausted = true;
            return Some(Err(e));
        }
        self.buffer.pop_front().map(Ok)
    }
}
