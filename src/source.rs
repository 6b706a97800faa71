//! Memory providers backing a heap.
use core::{marker::PhantomData, mem::MaybeUninit, ptr::NonNull};

use crate::{segfit::ALIGNMENT, utils::round_up};

/// Types that extend a single contiguous heap on demand.
///
/// # Safety
///
/// Implementations must uphold the following for as long as the source is
/// alive:
///
///  - The first call to [`extend`] returns a region aligned to at least
///    [`ALIGNMENT`] bytes, and every later call returns the address one past
///    the previously extended end, so the heap stays contiguous.
///  - Extended memory stays valid for reads and writes and belongs to one
///    allocated region, so pointers into it may be derived from any
///    previously returned pointer.
///  - Extended memory is never handed out to anyone else.
///
/// [`extend`]: Self::extend
pub unsafe trait HeapSource {
    /// Grows the heap by exactly `size` bytes.
    ///
    /// Returns the first byte of the new region, or `None` when the source
    /// cannot grow; a failed call must leave the heap end unchanged.
    ///
    /// # Safety
    ///
    /// The caller must not ask for a region it then leaves forever
    /// unreachable; the source never reclaims extended memory.
    unsafe fn extend(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Current low and one-past-high addresses of the extended heap, or
    /// `None` before the first extension. Meant for debugging assertions.
    fn bounds(&self) -> Option<(NonNull<u8>, NonNull<u8>)>;
}

/// A [`HeapSource`] handing out a caller-provided arena front to back.
///
/// The arena's start is rounded up to [`ALIGNMENT`]; extension fails once
/// the arena is exhausted.
#[derive(Debug)]
pub struct ArenaSource<'a> {
    base: NonNull<u8>,
    capacity: usize,
    len: usize,
    _pool: PhantomData<&'a mut [MaybeUninit<u8>]>,
}

impl<'a> ArenaSource<'a> {
    /// Creates a source over `arena`.
    ///
    /// # Examples
    ///
    /// ```
    /// use segfit::{ArenaSource, SegFit};
    /// use std::mem::MaybeUninit;
    ///
    /// let mut arena = [MaybeUninit::uninit(); 4096];
    /// let mut heap = SegFit::new(ArenaSource::new(&mut arena)).unwrap();
    /// assert!(heap.allocate(100).is_some());
    /// ```
    pub fn new(arena: &'a mut [MaybeUninit<u8>]) -> Self {
        // Safety: the exclusive borrow keeps the arena alive and untouched
        //         for `'a`.
        unsafe { Self::from_raw(NonNull::new(arena.as_mut_ptr().cast()).unwrap(), arena.len()) }
    }

    /// Creates a source over the `len` bytes at `base`.
    ///
    /// # Safety
    ///
    /// The region must outlive the source and nothing else may access it
    /// while the source (or a heap built over it) is in use.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        let unaligned = base.as_ptr() as usize;
        let start = round_up(unaligned, ALIGNMENT);
        let skip = start - unaligned;
        Self {
            base: NonNull::new_unchecked(base.as_ptr().add(skip.min(len))),
            capacity: len.saturating_sub(skip),
            len: 0,
            _pool: PhantomData,
        }
    }

    /// Total bytes handed out so far.
    pub fn extended(&self) -> usize {
        self.len
    }
}

unsafe impl HeapSource for ArenaSource<'_> {
    unsafe fn extend(&mut self, size: usize) -> Option<NonNull<u8>> {
        let end = self.len.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        let ptr = NonNull::new_unchecked(self.base.as_ptr().add(self.len));
        self.len = end;
        Some(ptr)
    }

    fn bounds(&self) -> Option<(NonNull<u8>, NonNull<u8>)> {
        if self.len == 0 {
            return None;
        }
        // Safety: `base + len` stays within the arena.
        let end = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.len)) };
        Some((self.base, end))
    }
}
