//! Bucket page layout.
//!
//! A bucket is one tree node stored in one page. Entries are packed backward
//! from the end of the page while an offset table grows forward from the
//! header, so a bucket is full when the two meet.
//!
//! ```text
//! offset  size  field
//! 0       28    durable page header
//! 28      4     free pointer (i32, first byte of the packed entry area)
//! 32      4     entry count (i32)
//! 36      1     leaf flag (1 = leaf, 0 = internal)
//! 37      8     left sibling page (i64, -1 if none, leaves only)
//! 45      8     right sibling page (i64, -1 if none, leaves only)
//! 53      4*n   offset table (i32 per entry, in key order)
//! ...           free space
//! free    ..    packed entries
//! ```
//!
//! Leaf entry: `key bytes ++ record locator (10 bytes)`.
//! Internal entry: `left child (i32) ++ right child (i32) ++ key bytes`.
//!
//! Internal entries keep the adjacency invariant: the right child of entry
//! `i` equals the left child of entry `i + 1`. Keys below a separator live in
//! its left subtree, keys equal to or above it in its right subtree.
//!
//! Index arguments are trusted: callers derive them from [`Bucket::find`].

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]

use std::ops::{Deref, DerefMut};

use crate::key::{Key, KeyCodec, KeyCodecError};
use crate::record::RecordLocator;
use crate::storage::page::{PAGE_SIZE, Page, PageIndex, header};

pub const FREE_POINTER_OFFSET: usize = header::NEXT_FREE_POSITION;
pub const SIZE_OFFSET: usize = FREE_POINTER_OFFSET + 4;
pub const IS_LEAF_OFFSET: usize = SIZE_OFFSET + 4;
pub const LEFT_SIBLING_OFFSET: usize = IS_LEAF_OFFSET + 1;
pub const RIGHT_SIBLING_OFFSET: usize = LEFT_SIBLING_OFFSET + 8;
pub const POSITIONS_ARRAY_OFFSET: usize = RIGHT_SIBLING_OFFSET + 8;

/// Size of one offset table slot.
const POINTER_SIZE: usize = 4;

/// Size of the two child pointers in front of an internal entry's key.
const CHILD_POINTERS_SIZE: usize = 8;

/// Bytes a leaf entry needs besides its key: locator plus offset slot.
pub const LEAF_ENTRY_OVERHEAD: usize = RecordLocator::ENCODED_SIZE + POINTER_SIZE;

/// Sibling link value meaning "no sibling".
const NO_SIBLING: i64 = -1;

/// Errors raised by the bucket overlay. All of them mean the page does not
/// hold what the tree expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketError {
    /// The bucket type may only change while the bucket is empty.
    NotEmpty { size: usize },
    /// The operation does not apply to this kind of bucket.
    WrongKind { leaf: bool },
    /// An offset table slot points outside the entry area.
    InvalidPointer { index: usize, pointer: i32 },
    /// A stored child pointer is negative.
    InvalidChild(i32),
    /// A page index does not fit the on-page child pointer.
    ChildOutOfRange(PageIndex),
    /// A stored key does not decode.
    Codec(KeyCodecError),
}

impl std::fmt::Display for BucketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotEmpty { size } => {
                write!(f, "bucket type can only change while empty (size {size})")
            }
            Self::WrongKind { leaf: true } => write!(f, "operation not valid on a leaf bucket"),
            Self::WrongKind { leaf: false } => {
                write!(f, "operation not valid on an internal bucket")
            }
            Self::InvalidPointer { index, pointer } => {
                write!(f, "entry {index} points outside the page ({pointer})")
            }
            Self::InvalidChild(child) => write!(f, "invalid child pointer {child}"),
            Self::ChildOutOfRange(page) => write!(f, "page {page} does not fit a child pointer"),
            Self::Codec(e) => write!(f, "stored key does not decode: {e}"),
        }
    }
}

impl std::error::Error for BucketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<KeyCodecError> for BucketError {
    fn from(e: KeyCodecError) -> Self {
        Self::Codec(e)
    }
}

/// A decoded bucket entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketEntry {
    Leaf {
        key: Key,
        value: RecordLocator,
    },
    Internal {
        left: PageIndex,
        right: PageIndex,
        key: Key,
    },
}

/// Typed view over a page holding one tree node.
pub struct Bucket<P> {
    page: P,
}

impl<P: Deref<Target = Page>> Bucket<P> {
    pub const fn new(page: P) -> Self {
        Self { page }
    }

    pub fn into_inner(self) -> P {
        self.page
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.page.read_u8(IS_LEAF_OFFSET) > 0
    }

    /// Number of entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.page.read_i32(SIZE_OFFSET).max(0) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[must_use]
    pub fn left_sibling(&self) -> Option<PageIndex> {
        PageIndex::try_from(self.page.read_i64(LEFT_SIBLING_OFFSET)).ok()
    }

    #[must_use]
    pub fn right_sibling(&self) -> Option<PageIndex> {
        PageIndex::try_from(self.page.read_i64(RIGHT_SIBLING_OFFSET)).ok()
    }

    fn free_pointer(&self) -> usize {
        self.page.read_i32(FREE_POINTER_OFFSET).max(0) as usize
    }

    fn pointer(&self, index: usize) -> Result<usize, BucketError> {
        let pointer = self
            .page
            .read_i32(POSITIONS_ARRAY_OFFSET + index * POINTER_SIZE);
        let position = pointer as usize;
        if pointer < 0 || position < POSITIONS_ARRAY_OFFSET || position >= PAGE_SIZE {
            return Err(BucketError::InvalidPointer { index, pointer });
        }
        Ok(position)
    }

    /// `position` if `len` bytes starting there lie inside the page.
    fn span(&self, index: usize, position: usize, len: usize) -> Result<usize, BucketError> {
        if position + len > PAGE_SIZE {
            return Err(BucketError::InvalidPointer {
                index,
                pointer: i32::try_from(position).unwrap_or(i32::MAX),
            });
        }
        Ok(position)
    }

    fn key_position(&self, index: usize) -> Result<usize, BucketError> {
        let position = self.pointer(index)?;
        Ok(if self.is_leaf() {
            position
        } else {
            position + CHILD_POINTERS_SIZE
        })
    }

    fn key_len_at<C: KeyCodec + ?Sized>(
        &self,
        position: usize,
        codec: &C,
    ) -> Result<usize, BucketError> {
        if let Some(len) = codec.fixed_length() {
            return Ok(len);
        }
        Ok(codec.encoded_size(self.bytes_from(position))?)
    }

    fn bytes_from(&self, position: usize) -> &[u8] {
        self.page.as_bytes().get(position..).unwrap_or_default()
    }

    /// Decode the key of entry `index`.
    pub fn key<C: KeyCodec + ?Sized>(&self, index: usize, codec: &C) -> Result<Key, BucketError> {
        let position = self.key_position(index)?;
        Ok(codec.deserialize(self.bytes_from(position))?)
    }

    /// Encoded key of entry `index`.
    pub fn raw_key<C: KeyCodec + ?Sized>(
        &self,
        index: usize,
        codec: &C,
    ) -> Result<Vec<u8>, BucketError> {
        let position = self.key_position(index)?;
        let len = self.key_len_at(position, codec)?;
        let position = self.span(index, position, len)?;
        Ok(self.page.read_bytes(position, len).to_vec())
    }

    /// Encoded value of leaf entry `index`.
    pub fn raw_value<C: KeyCodec + ?Sized>(
        &self,
        index: usize,
        codec: &C,
    ) -> Result<&[u8], BucketError> {
        if !self.is_leaf() {
            return Err(BucketError::WrongKind { leaf: false });
        }
        let position = self.pointer(index)?;
        let position = position + self.key_len_at(position, codec)?;
        let position = self.span(index, position, RecordLocator::ENCODED_SIZE)?;
        Ok(self.page.read_bytes(position, RecordLocator::ENCODED_SIZE))
    }

    /// Record locator of leaf entry `index`.
    pub fn value<C: KeyCodec + ?Sized>(
        &self,
        index: usize,
        codec: &C,
    ) -> Result<RecordLocator, BucketError> {
        if !self.is_leaf() {
            return Err(BucketError::WrongKind { leaf: false });
        }
        let position = self.pointer(index)?;
        let position = position + self.key_len_at(position, codec)?;
        let position = self.span(index, position, RecordLocator::ENCODED_SIZE)?;
        Ok(RecordLocator::read_from(&self.page, position))
    }

    /// Decode entry `index`.
    pub fn entry<C: KeyCodec + ?Sized>(
        &self,
        index: usize,
        codec: &C,
    ) -> Result<BucketEntry, BucketError> {
        if self.is_leaf() {
            Ok(BucketEntry::Leaf {
                key: self.key(index, codec)?,
                value: self.value(index, codec)?,
            })
        } else {
            Ok(BucketEntry::Internal {
                left: self.left_child(index)?,
                right: self.right_child(index)?,
                key: self.key(index, codec)?,
            })
        }
    }

    /// Entry `index` exactly as stored, ready for [`Bucket::add_all`].
    pub fn raw_entry<C: KeyCodec + ?Sized>(
        &self,
        index: usize,
        codec: &C,
    ) -> Result<Vec<u8>, BucketError> {
        let position = self.pointer(index)?;
        let len = if self.is_leaf() {
            self.key_len_at(position, codec)? + RecordLocator::ENCODED_SIZE
        } else {
            CHILD_POINTERS_SIZE + self.key_len_at(position + CHILD_POINTERS_SIZE, codec)?
        };
        let position = self.span(index, position, len)?;
        Ok(self.page.read_bytes(position, len).to_vec())
    }

    fn child_at(&self, position: usize) -> Result<PageIndex, BucketError> {
        let child = self.page.read_i32(position);
        PageIndex::try_from(child).map_err(|_| BucketError::InvalidChild(child))
    }

    /// Left child of internal entry `index`.
    pub fn left_child(&self, index: usize) -> Result<PageIndex, BucketError> {
        if self.is_leaf() {
            return Err(BucketError::WrongKind { leaf: true });
        }
        let position = self.span(index, self.pointer(index)?, CHILD_POINTERS_SIZE)?;
        self.child_at(position)
    }

    /// Right child of internal entry `index`.
    pub fn right_child(&self, index: usize) -> Result<PageIndex, BucketError> {
        if self.is_leaf() {
            return Err(BucketError::WrongKind { leaf: true });
        }
        let position = self.span(index, self.pointer(index)?, CHILD_POINTERS_SIZE)?;
        self.child_at(position + POINTER_SIZE)
    }

    /// Binary search for `key`.
    ///
    /// Returns `Ok(index)` when found, otherwise `Err(insertion point)`.
    pub fn find<C: KeyCodec + ?Sized>(
        &self,
        key: &Key,
        codec: &C,
    ) -> Result<Result<usize, usize>, BucketError> {
        let mut low = 0;
        let mut high = self.size();
        while low < high {
            let mid = low + (high - low) / 2;
            let mid_key = self.key(mid, codec)?;
            match codec.compare(&mid_key, key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(low))
    }

    /// True if `data` more bytes plus `pointers` more offset slots would not fit.
    fn does_overflow(&self, data: usize, pointers: usize) -> bool {
        let table_end = (self.size() + pointers) * POINTER_SIZE + POSITIONS_ARRAY_OFFSET;
        self.free_pointer() < data + table_end
    }
}

impl<P: DerefMut<Target = Page>> Bucket<P> {
    /// Reset to an empty bucket of the given kind.
    pub fn init(&mut self, is_leaf: bool) {
        self.set_free_pointer(PAGE_SIZE);
        self.set_size(0);
        self.page.write_u8(IS_LEAF_OFFSET, u8::from(is_leaf));
        self.page.write_i64(LEFT_SIBLING_OFFSET, NO_SIBLING);
        self.page.write_i64(RIGHT_SIBLING_OFFSET, NO_SIBLING);
    }

    /// Flip between leaf and internal. Only legal on an empty bucket.
    pub fn switch_bucket_type(&mut self) -> Result<(), BucketError> {
        let size = self.size();
        if size != 0 {
            return Err(BucketError::NotEmpty { size });
        }
        let is_leaf = self.is_leaf();
        self.page.write_u8(IS_LEAF_OFFSET, u8::from(!is_leaf));
        Ok(())
    }

    pub fn set_left_sibling(&mut self, page: Option<PageIndex>) {
        self.page
            .write_i64(LEFT_SIBLING_OFFSET, page.map_or(NO_SIBLING, |p| p as i64));
    }

    pub fn set_right_sibling(&mut self, page: Option<PageIndex>) {
        self.page
            .write_i64(RIGHT_SIBLING_OFFSET, page.map_or(NO_SIBLING, |p| p as i64));
    }

    fn set_free_pointer(&mut self, position: usize) {
        self.page.write_i32(FREE_POINTER_OFFSET, position as i32);
    }

    fn set_size(&mut self, size: usize) {
        self.page.write_i32(SIZE_OFFSET, size as i32);
    }

    fn set_pointer(&mut self, index: usize, position: usize) {
        self.page
            .write_i32(POSITIONS_ARRAY_OFFSET + index * POINTER_SIZE, position as i32);
    }

    fn set_child(&mut self, position: usize, child: PageIndex) -> Result<(), BucketError> {
        let child = i32::try_from(child).map_err(|_| BucketError::ChildOutOfRange(child))?;
        self.page.write_i32(position, child);
        Ok(())
    }

    /// Shift offset slots `[from, size)` one slot to the right.
    fn open_slot(&mut self, index: usize, size: usize) {
        if index < size {
            let from = POSITIONS_ARRAY_OFFSET + index * POINTER_SIZE;
            self.page
                .move_bytes(from, from + POINTER_SIZE, (size - index) * POINTER_SIZE);
        }
    }

    /// Reserve `len` bytes at the bottom of the entry area for slot `index`.
    fn allocate(&mut self, index: usize, len: usize) -> usize {
        let position = self.free_pointer() - len;
        self.set_free_pointer(position);
        self.set_pointer(index, position);
        position
    }

    /// Insert a leaf entry at `index`.
    ///
    /// Returns `Ok(false)` without touching the page when the entry does not
    /// fit; the caller must split.
    pub fn add_leaf_entry(
        &mut self,
        index: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool, BucketError> {
        if !self.is_leaf() {
            return Err(BucketError::WrongKind { leaf: false });
        }
        let entry_size = key.len() + value.len();
        if self.does_overflow(entry_size, 1) {
            return Ok(false);
        }

        let size = self.size();
        self.open_slot(index, size);
        let position = self.allocate(index, entry_size);
        self.set_size(size + 1);

        self.page.write_bytes(position, key);
        self.page.write_bytes(position + key.len(), value);
        Ok(true)
    }

    /// Insert an internal entry at `index`.
    ///
    /// With `update_neighbors`, the neighbors' child pointers are patched so
    /// the previous entry's right child is `left` and the next entry's left
    /// child is `right`. Returns `Ok(false)` when the entry does not fit.
    pub fn add_non_leaf_entry(
        &mut self,
        index: usize,
        left: PageIndex,
        right: PageIndex,
        key: &[u8],
        update_neighbors: bool,
    ) -> Result<bool, BucketError> {
        if self.is_leaf() {
            return Err(BucketError::WrongKind { leaf: true });
        }
        let entry_size = CHILD_POINTERS_SIZE + key.len();
        if self.does_overflow(entry_size, 1) {
            return Ok(false);
        }

        let size = self.size();
        self.open_slot(index, size);
        let position = self.allocate(index, entry_size);
        self.set_size(size + 1);

        self.set_child(position, left)?;
        self.set_child(position + POINTER_SIZE, right)?;
        self.page.write_bytes(position + CHILD_POINTERS_SIZE, key);

        if update_neighbors {
            if index < size {
                let next = self.pointer(index + 1)?;
                self.set_child(next, right)?;
            }
            if index > 0 {
                let previous = self.pointer(index - 1)?;
                self.set_child(previous + POINTER_SIZE, left)?;
            }
        }
        Ok(true)
    }

    /// Drop slot `index` and close the gap its `entry_size` bytes leave.
    /// Returns the new entry count.
    fn remove_entry(&mut self, index: usize, entry_size: usize) -> Result<usize, BucketError> {
        let position = self.pointer(index)?;
        let size = self.size();

        let slot = POSITIONS_ARRAY_OFFSET + index * POINTER_SIZE;
        self.page.move_bytes(
            slot + POINTER_SIZE,
            slot,
            (size - index - 1) * POINTER_SIZE,
        );
        let size = size - 1;
        self.set_size(size);

        for i in 0..size {
            let pointer = self.pointer(i)?;
            if pointer < position {
                self.set_pointer(i, pointer + entry_size);
            }
        }

        let free_pointer = self.free_pointer();
        if size > 0 && position > free_pointer {
            self.page
                .move_bytes(free_pointer, free_pointer + entry_size, position - free_pointer);
        }
        self.set_free_pointer(free_pointer + entry_size);
        Ok(size)
    }

    /// Remove leaf entry `index` whose stored key is `key`.
    /// Returns the new entry count.
    pub fn remove_leaf_entry(&mut self, index: usize, key: &[u8]) -> Result<usize, BucketError> {
        if !self.is_leaf() {
            return Err(BucketError::WrongKind { leaf: false });
        }
        self.remove_entry(index, key.len() + RecordLocator::ENCODED_SIZE)
    }

    /// Remove internal entry `index` whose stored key is `key`.
    ///
    /// The surviving child (right if `remove_left_child`, else left) takes
    /// over the neighbors' pointers to the removed entry's children.
    /// Returns the new entry count.
    pub fn remove_non_leaf_entry(
        &mut self,
        index: usize,
        key: &[u8],
        remove_left_child: bool,
    ) -> Result<usize, BucketError> {
        if self.is_leaf() {
            return Err(BucketError::WrongKind { leaf: true });
        }
        let child = if remove_left_child {
            self.right_child(index)?
        } else {
            self.left_child(index)?
        };
        let size = self.remove_entry(index, CHILD_POINTERS_SIZE + key.len())?;

        if size > 0 {
            if index > 0 {
                let previous = self.pointer(index - 1)?;
                self.set_child(previous + POINTER_SIZE, child)?;
            }
            if index < size {
                let next = self.pointer(index)?;
                self.set_child(next, child)?;
            }
        }
        Ok(size)
    }

    /// Overwrite the value of entry `index` in place. `key_len` is the
    /// length of its stored key.
    pub fn update_value(
        &mut self,
        index: usize,
        value: &[u8],
        key_len: usize,
    ) -> Result<(), BucketError> {
        let position = self.key_position(index)?;
        let position = self.span(index, position + key_len, value.len())?;
        self.page.write_bytes(position, value);
        Ok(())
    }

    /// Append raw entries after the current ones.
    ///
    /// Only used on freshly initialized buckets during a split, where the
    /// entries are known to fit.
    pub fn add_all(&mut self, entries: &[Vec<u8>]) {
        let size = self.size();
        for (i, entry) in entries.iter().enumerate() {
            let position = self.allocate(size + i, entry.len());
            self.page.write_bytes(position, entry);
        }
        self.set_size(size + entries.len());
    }

    /// Keep the first `new_size` entries and repack them.
    pub fn shrink<C: KeyCodec + ?Sized>(
        &mut self,
        new_size: usize,
        codec: &C,
    ) -> Result<(), BucketError> {
        let kept = (0..new_size)
            .map(|i| self.raw_entry(i, codec))
            .collect::<Result<Vec<_>, _>>()?;

        self.set_free_pointer(PAGE_SIZE);
        self.set_size(0);
        self.add_all(&kept);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{BinaryKeyCodec, Int64KeyCodec};

    fn leaf() -> Bucket<Box<Page>> {
        let mut bucket = Bucket::new(Box::new(Page::new()));
        bucket.init(true);
        bucket
    }

    fn internal() -> Bucket<Box<Page>> {
        let mut bucket = Bucket::new(Box::new(Page::new()));
        bucket.init(false);
        bucket
    }

    fn int_key(i: i64) -> Vec<u8> {
        Int64KeyCodec.serialize(&Key::int(i)).expect("serialize")
    }

    fn locator(i: i64) -> [u8; 10] {
        RecordLocator::new(1, i).to_bytes()
    }

    fn keys(bucket: &Bucket<Box<Page>>) -> Vec<i64> {
        (0..bucket.size())
            .map(|i| match bucket.key(i, &Int64KeyCodec).expect("key").parts() {
                [crate::key::KeyPart::Value(crate::key::Scalar::Int(v))] => *v,
                other => panic!("unexpected key {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_init_layout() {
        let bucket = leaf();
        let page = bucket.into_inner();

        assert_eq!(page.read_i32(FREE_POINTER_OFFSET), PAGE_SIZE as i32);
        assert_eq!(page.read_i32(SIZE_OFFSET), 0);
        assert_eq!(page.read_u8(IS_LEAF_OFFSET), 1);
        assert_eq!(page.read_i64(LEFT_SIBLING_OFFSET), -1);
        assert_eq!(page.read_i64(RIGHT_SIBLING_OFFSET), -1);
        assert_eq!(POSITIONS_ARRAY_OFFSET, 53);
    }

    #[test]
    fn test_leaf_entries_packed_from_page_end() {
        let mut bucket = leaf();
        assert!(bucket.add_leaf_entry(0, &int_key(5), &locator(50)).expect("add"));

        let page = bucket.into_inner();
        let position = PAGE_SIZE - 18;
        assert_eq!(page.read_i32(FREE_POINTER_OFFSET), position as i32);
        assert_eq!(page.read_i32(POSITIONS_ARRAY_OFFSET), position as i32);
        assert_eq!(page.read_bytes(position, 8), &int_key(5)[..]);
        assert_eq!(page.read_bytes(position + 8, 10), &locator(50));
    }

    #[test]
    fn test_add_and_find_keep_order() {
        let mut bucket = leaf();
        for (slot, key) in [(0, 20), (0, 10), (2, 40), (2, 30)] {
            assert!(bucket.add_leaf_entry(slot, &int_key(key), &locator(key)).expect("add"));
        }

        assert_eq!(keys(&bucket), vec![10, 20, 30, 40]);
        assert_eq!(bucket.find(&Key::int(30), &Int64KeyCodec).expect("find"), Ok(2));
        assert_eq!(bucket.find(&Key::int(25), &Int64KeyCodec).expect("find"), Err(2));
        assert_eq!(bucket.find(&Key::int(99), &Int64KeyCodec).expect("find"), Err(4));
        assert_eq!(
            bucket.value(2, &Int64KeyCodec).expect("value"),
            RecordLocator::new(1, 30)
        );
    }

    #[test]
    fn test_overflow_reported_without_mutation() {
        let mut bucket = leaf();
        let mut added = 0i64;
        while bucket
            .add_leaf_entry(added as usize, &int_key(added), &locator(added))
            .expect("add")
        {
            added += 1;
        }

        // 8 key + 10 value + 4 slot per entry
        assert_eq!(added as usize, (PAGE_SIZE - POSITIONS_ARRAY_OFFSET) / 22);
        assert_eq!(bucket.size(), added as usize);
        assert_eq!(keys(&bucket).last().copied(), Some(added - 1));
    }

    #[test]
    fn test_remove_leaf_entry_compacts() {
        let mut bucket = leaf();
        for i in 0..5 {
            bucket
                .add_leaf_entry(i as usize, &int_key(i), &locator(i * 10))
                .expect("add");
        }

        let size = bucket.remove_leaf_entry(2, &int_key(2)).expect("remove");
        assert_eq!(size, 4);
        assert_eq!(keys(&bucket), vec![0, 1, 3, 4]);
        for (i, key) in [0, 1, 3, 4].into_iter().enumerate() {
            assert_eq!(
                bucket.value(i, &Int64KeyCodec).expect("value"),
                RecordLocator::new(1, key * 10)
            );
        }

        let page = bucket.into_inner();
        assert_eq!(page.read_i32(FREE_POINTER_OFFSET), (PAGE_SIZE - 4 * 18) as i32);
    }

    #[test]
    fn test_removed_space_is_reused() {
        let mut bucket = leaf();
        let mut count = 0usize;
        while bucket
            .add_leaf_entry(count, &int_key(count as i64), &locator(0))
            .expect("add")
        {
            count += 1;
        }
        bucket.remove_leaf_entry(0, &int_key(0)).expect("remove");

        assert!(bucket.add_leaf_entry(0, &int_key(-1), &locator(0)).expect("add"));
        assert!(!bucket.add_leaf_entry(0, &int_key(-2), &locator(0)).expect("add"));
    }

    #[test]
    fn test_update_value_in_place() {
        let mut bucket = leaf();
        bucket.add_leaf_entry(0, &int_key(1), &locator(1)).expect("add");
        bucket
            .update_value(0, &RecordLocator::new(7, 70).to_bytes(), 8)
            .expect("update");

        assert_eq!(
            bucket.value(0, &Int64KeyCodec).expect("value"),
            RecordLocator::new(7, 70)
        );
        assert_eq!(bucket.raw_value(0, &Int64KeyCodec).expect("raw").len(), 10);
    }

    #[test]
    fn test_non_leaf_neighbors_patched() {
        let mut bucket = internal();
        bucket.add_non_leaf_entry(0, 2, 3, &int_key(10), true).expect("add");
        bucket.add_non_leaf_entry(1, 3, 4, &int_key(20), true).expect("add");

        // Child 3 splits into 3 and 5 around key 15.
        bucket.add_non_leaf_entry(1, 3, 5, &int_key(15), true).expect("add");

        assert_eq!(keys(&bucket), vec![10, 15, 20]);
        assert_eq!(bucket.right_child(0).expect("right"), 3);
        assert_eq!(bucket.left_child(1).expect("left"), 3);
        assert_eq!(bucket.right_child(1).expect("right"), 5);
        assert_eq!(bucket.left_child(2).expect("left"), 5);
        assert_eq!(bucket.right_child(2).expect("right"), 4);
    }

    #[test]
    fn test_remove_non_leaf_entry_patches_neighbors() {
        let mut bucket = internal();
        bucket.add_non_leaf_entry(0, 2, 3, &int_key(10), true).expect("add");
        bucket.add_non_leaf_entry(1, 3, 4, &int_key(20), true).expect("add");
        bucket.add_non_leaf_entry(2, 4, 5, &int_key(30), true).expect("add");

        let size = bucket
            .remove_non_leaf_entry(1, &int_key(20), true)
            .expect("remove");

        assert_eq!(size, 2);
        assert_eq!(keys(&bucket), vec![10, 30]);
        assert_eq!(bucket.right_child(0).expect("right"), 4);
        assert_eq!(bucket.left_child(1).expect("left"), 4);
    }

    #[test]
    fn test_shrink_and_add_all_split_halves() {
        let codec = BinaryKeyCodec;
        let mut left = leaf();
        for i in 0..6 {
            let key = codec.serialize(&Key::text(&format!("key-{i}"))).expect("serialize");
            left.add_leaf_entry(i, &key, &locator(i as i64)).expect("add");
        }

        let right_entries: Vec<Vec<u8>> = (3..6)
            .map(|i| left.raw_entry(i, &codec).expect("raw entry"))
            .collect();
        let mut right = leaf();
        right.add_all(&right_entries);
        left.shrink(3, &codec).expect("shrink");

        assert_eq!(left.size(), 3);
        assert_eq!(right.size(), 3);
        assert_eq!(left.key(2, &codec).expect("key"), Key::text("key-2"));
        assert_eq!(right.key(0, &codec).expect("key"), Key::text("key-3"));
        assert_eq!(
            right.value(2, &codec).expect("value"),
            RecordLocator::new(1, 5)
        );
    }

    #[test]
    fn test_entry_decoding() {
        let mut bucket = internal();
        bucket.add_non_leaf_entry(0, 7, 9, &int_key(4), true).expect("add");

        assert_eq!(
            bucket.entry(0, &Int64KeyCodec).expect("entry"),
            BucketEntry::Internal {
                left: 7,
                right: 9,
                key: Key::int(4)
            }
        );
        assert_eq!(
            bucket.value(0, &Int64KeyCodec),
            Err(BucketError::WrongKind { leaf: false })
        );
    }

    #[test]
    fn test_switch_type_requires_empty() {
        let mut bucket = leaf();
        bucket.add_leaf_entry(0, &int_key(1), &locator(1)).expect("add");
        assert_eq!(
            bucket.switch_bucket_type(),
            Err(BucketError::NotEmpty { size: 1 })
        );

        bucket.shrink(0, &Int64KeyCodec).expect("shrink");
        bucket.switch_bucket_type().expect("switch");
        assert!(!bucket.is_leaf());
    }

    #[test]
    fn test_pointer_near_page_end_is_reported() {
        let mut bucket = leaf();
        bucket.add_leaf_entry(0, &int_key(1), &locator(1)).expect("add");
        let pointer = (PAGE_SIZE - 4) as i32;
        bucket.page.write_i32(POSITIONS_ARRAY_OFFSET, pointer);

        let invalid = BucketError::InvalidPointer { index: 0, pointer };
        assert_eq!(bucket.raw_key(0, &Int64KeyCodec), Err(invalid.clone()));
        assert_eq!(bucket.raw_entry(0, &Int64KeyCodec), Err(invalid));
        assert!(matches!(
            bucket.value(0, &Int64KeyCodec),
            Err(BucketError::InvalidPointer { index: 0, .. })
        ));
        assert!(matches!(
            bucket.raw_value(0, &Int64KeyCodec),
            Err(BucketError::InvalidPointer { index: 0, .. })
        ));
        assert!(matches!(
            bucket.update_value(0, &locator(2), 8),
            Err(BucketError::InvalidPointer { index: 0, .. })
        ));

        let mut bucket = internal();
        bucket
            .add_non_leaf_entry(0, 2, 3, &int_key(1), false)
            .expect("add");
        let pointer = (PAGE_SIZE - 6) as i32;
        bucket.page.write_i32(POSITIONS_ARRAY_OFFSET, pointer);
        assert_eq!(
            bucket.right_child(0),
            Err(BucketError::InvalidPointer { index: 0, pointer })
        );
    }

    #[test]
    fn test_siblings() {
        let mut bucket = leaf();
        assert_eq!(bucket.left_sibling(), None);
        bucket.set_left_sibling(Some(4));
        bucket.set_right_sibling(Some(9));
        assert_eq!(bucket.left_sibling(), Some(4));
        assert_eq!(bucket.right_sibling(), Some(9));
        bucket.set_right_sibling(None);
        assert_eq!(bucket.right_sibling(), None);
    }
}
