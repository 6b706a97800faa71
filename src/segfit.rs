//! The segregated-fit allocator core.
use core::{
    mem,
    ptr::{self, NonNull},
};

use crate::source::HeapSource;

/// Heap word. Every size the allocator tracks internally is a count of words.
pub(crate) type Word = i32;

/// Size of a heap word in bytes.
pub(crate) const WSIZE: usize = mem::size_of::<Word>();

/// Payload alignment, and the granularity of every block size.
///
/// Every pointer returned by [`SegFit::allocate`] is aligned to this many
/// bytes, and every block occupies a multiple of this many bytes.
pub const ALIGNMENT: usize = 16;

/// Minimum block size in words: a header, two links and a footer.
const MIN_BLOCK_WORDS: Word = (ALIGNMENT / WSIZE) as Word;

/// Number of size-class buckets in the segregated index.
const N_BUCKETS: usize = 10;

/// Header bit: this block is allocated.
const USED: Word = 0b01;

/// Header bit: the block immediately before this one is free.
///
/// Maintained so that a block's previous neighbour can be located through
/// the neighbour's footer, which only free blocks carry.
const PREVFREE: Word = 0b10;

/// Flags value of a free block.
const FREE: Word = 0;

/// Header bits carrying the block size in words. The size is always a
/// multiple of four words, so the flag bits never collide with it.
const SIZE_MASK: Word = !(USED | PREVFREE);

/// Largest block size in words the header can represent.
const MAX_BLOCK_WORDS: Word = Word::MAX & SIZE_MASK;

/// Absent-link sentinel for offset-encoded links and bucket heads.
const NO_LINK: Word = -1;

/// A bucket slot: the word offset of the bucket's first free block, or
/// [`NO_LINK`] when the bucket is empty.
type BucketSlot = isize;

/// The error type returned when constructing an allocator fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// The memory provider could not supply the heap prologue.
    AllocFailed,
}

/// A segregated-fit allocator over a single contiguous heap.
///
/// The heap starts empty and grows on demand through the [`HeapSource`]
/// the allocator owns. Blocks carry their size and two flag bits in a
/// one-word header; free blocks additionally carry a pair of free-list
/// links and a footer mirroring the header, which lets a freed block fuse
/// with either neighbour in constant time. Free blocks are indexed by ten
/// power-of-two size classes and handed out first-fit, splitting off any
/// residual of at least [`ALIGNMENT`] bytes.
///
/// The allocator is single-threaded: entry points take `&mut self` and run
/// to completion. On any failure the heap is left exactly as it was.
#[derive(Debug)]
pub struct SegFit<S: HeapSource> {
    source: S,
    /// The bucket array, reserved at the bottom of the heap.
    buckets: NonNull<BucketSlot>,
    /// First allocatable word; the base of the offset encoding.
    heap_start: NonNull<Word>,
    /// The one-word terminator: size zero, marked used.
    epilogue: NonNull<Word>,
    /// The block adjacent to the epilogue, or `None` while no block exists.
    last: Option<NonNull<Word>>,
}

// Safety: every heap word reachable through a `SegFit` is logically owned by
//         it and carries no interior mutability, so moving the allocator to
//         (or sharing it with) another thread is sound as long as the source
//         can follow.
unsafe impl<S: HeapSource + Send> Send for SegFit<S> {}
unsafe impl<S: HeapSource + Sync> Sync for SegFit<S> {}

#[inline]
unsafe fn bt_size(bt: NonNull<Word>) -> Word {
    *bt.as_ptr() & SIZE_MASK
}

#[inline]
unsafe fn bt_used(bt: NonNull<Word>) -> bool {
    *bt.as_ptr() & USED != 0
}

#[inline]
unsafe fn bt_prevfree(bt: NonNull<Word>) -> Word {
    *bt.as_ptr() & PREVFREE
}

#[inline]
unsafe fn bt_set_prevfree(bt: NonNull<Word>) {
    *bt.as_ptr() |= PREVFREE;
}

#[inline]
unsafe fn bt_clr_prevfree(bt: NonNull<Word>) {
    *bt.as_ptr() &= !PREVFREE;
}

/// The last word of the block headed by `bt`.
#[inline]
unsafe fn bt_footer(bt: NonNull<Word>) -> NonNull<Word> {
    NonNull::new_unchecked(bt.as_ptr().add(bt_size(bt) as usize - 1))
}

/// The payload a client sees for the block headed by `bt`.
#[inline]
unsafe fn bt_payload(bt: NonNull<Word>) -> NonNull<u8> {
    NonNull::new_unchecked(bt.as_ptr().add(1)).cast()
}

/// Maps a block size in words to its size-class bucket.
fn find_bucket(words: Word) -> usize {
    let size = words as usize * WSIZE;
    let mut boundary = ALIGNMENT;
    let mut index = 0;
    while index < N_BUCKETS - 1 {
        if size <= boundary {
            return index;
        }
        boundary <<= 1;
        index += 1;
    }
    N_BUCKETS - 1
}

impl<S: HeapSource> SegFit<S> {
    /// Creates an allocator over `source`, laying out the heap prologue.
    ///
    /// The bucket array is reserved at the bottom of the heap, followed by
    /// padding that parks the first block header one word short of a
    /// 16-byte boundary, followed by the epilogue word. Fails when `source`
    /// cannot supply the prologue.
    pub fn new(mut source: S) -> Result<Self, AllocInitError> {
        // Safety: prologue extensions are contiguous per the `HeapSource`
        //         contract and nothing else references the region yet.
        unsafe {
            let buckets = source
                .extend(N_BUCKETS * mem::size_of::<BucketSlot>())
                .ok_or(AllocInitError::AllocFailed)?
                .cast::<BucketSlot>();

            // A block's payload sits one word past its header, so the first
            // header must land `WSIZE` short of an alignment boundary.
            let end = buckets.as_ptr() as usize + N_BUCKETS * mem::size_of::<BucketSlot>();
            let pad = (ALIGNMENT - WSIZE).wrapping_sub(end) & (ALIGNMENT - 1);
            if pad != 0 {
                source.extend(pad).ok_or(AllocInitError::AllocFailed)?;
            }

            let epilogue = source
                .extend(WSIZE)
                .ok_or(AllocInitError::AllocFailed)?
                .cast::<Word>();
            epilogue.as_ptr().write(USED);

            for index in 0..N_BUCKETS {
                buckets.as_ptr().add(index).write(NO_LINK as BucketSlot);
            }

            Ok(Self {
                source,
                buckets,
                heap_start: epilogue,
                epilogue,
                last: None,
            })
        }
    }

    /// Borrows the memory provider.
    #[inline]
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Mutably borrows the memory provider.
    ///
    /// # Safety
    ///
    /// The caller must not mutate the provider in a way that disturbs the
    /// heap it has already handed out (e.g. moving its end-of-heap).
    #[inline]
    pub unsafe fn source_mut_unchecked(&mut self) -> &mut S {
        &mut self.source
    }

    /// Attempts to allocate `size` bytes.
    ///
    /// Returns the 16-byte-aligned payload address on success, `None` when
    /// `size` is zero or the heap cannot grow to fit the request.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        // Header plus payload, rounded up to the block granularity.
        let rounded = WSIZE.checked_add(size)?.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
        if rounded / WSIZE > MAX_BLOCK_WORDS as usize {
            return None;
        }
        let words = (rounded / WSIZE) as Word;

        unsafe {
            if let Some(bt) = self.find_fit(words) {
                self.place(bt, words);
                return Some(bt_payload(bt));
            }

            // No fit. When the trailing block is free the new growth will
            // fuse with it, so only the shortfall has to be requested.
            let mut needed = rounded;
            if let Some(last) = self.last {
                if !bt_used(last) {
                    debug_assert!(bt_size(last) < words);
                    needed -= bt_size(last) as usize * WSIZE;
                }
            }

            let bt = self.extend_heap(needed)?;
            self.place(bt, words);
            Some(bt_payload(bt))
        }
    }

    /// Returns `ptr`'s block to the heap, fusing it with any free neighbour.
    ///
    /// # Safety
    ///
    /// `ptr` must denote an allocation previously returned by `self` that
    /// has not been freed since.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let bt = NonNull::new_unchecked(ptr.cast::<Word>().as_ptr().sub(1));
        debug_assert!(bt_used(bt));

        self.bt_make(bt, bt_size(bt), FREE | bt_prevfree(bt));

        let next_free = self.bt_next(bt).map_or(false, |next| !bt_used(next));
        if bt_prevfree(bt) != 0 || next_free {
            self.coalesce(bt);
        } else {
            self.free_list_append(bt);
        }
    }

    /// Resizes `ptr`'s allocation to `size` bytes, moving it.
    ///
    /// The common prefix of the old and new payloads is preserved. A `size`
    /// of zero frees the allocation and returns `None`; on any other
    /// failure `None` is returned and the old allocation stays valid.
    ///
    /// # Safety
    ///
    /// `ptr` must denote an allocation previously returned by `self` that
    /// has not been freed since.
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let old_bt = NonNull::new_unchecked(ptr.cast::<Word>().as_ptr().sub(1));
        let new = self.allocate(size)?;
        let new_bt = NonNull::new_unchecked(new.cast::<Word>().as_ptr().sub(1));

        // A used block's payload capacity is its size minus the header word.
        let old_bytes = bt_size(old_bt) as usize * WSIZE - WSIZE;
        let new_bytes = bt_size(new_bt) as usize * WSIZE - WSIZE;

        // Tail bytes past what the client wrote may be uninitialized, so the
        // copy goes through `MaybeUninit`.
        ptr::copy_nonoverlapping(
            ptr.as_ptr() as *const mem::MaybeUninit<u8>,
            new.as_ptr() as *mut mem::MaybeUninit<u8>,
            old_bytes.min(new_bytes),
        );

        self.deallocate(ptr);
        Some(new)
    }

    /// Allocates `n * size` bytes with every byte zeroed.
    ///
    /// Returns `None` when the product overflows, is zero, or the heap
    /// cannot fit it; nothing is zeroed on failure.
    pub fn allocate_zeroed(&mut self, n: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = n.checked_mul(size)?;
        let ptr = self.allocate(bytes)?;
        // Safety: `ptr` is a fresh allocation of at least `bytes` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        Some(ptr)
    }

    /// Number of payload bytes usable through `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation previously returned by `self`.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let bt = NonNull::new_unchecked(ptr.cast::<Word>().as_ptr().sub(1));
        bt_size(bt) as usize * WSIZE - WSIZE
    }

    // ---- offset encoding ------------------------------------------------

    /// Word offset of `bt` from the heap base.
    #[inline]
    fn word_off(&self, bt: NonNull<Word>) -> Word {
        let off = (bt.as_ptr() as usize - self.heap_start.as_ptr() as usize) / WSIZE;
        debug_assert!(off <= MAX_BLOCK_WORDS as usize);
        off as Word
    }

    /// The block at word offset `off`, or `None` for the absent-link value.
    #[inline]
    fn block_at(&self, off: Word) -> Option<NonNull<Word>> {
        if off < 0 {
            None
        } else {
            // Safety: non-negative offsets only ever come from links this
            //         allocator wrote, which reference live heap words.
            Some(unsafe { NonNull::new_unchecked(self.heap_start.as_ptr().add(off as usize)) })
        }
    }

    // ---- boundary tags --------------------------------------------------

    /// The block after `bt`, or `None` when `bt` trails the heap.
    #[inline]
    unsafe fn bt_next(&self, bt: NonNull<Word>) -> Option<NonNull<Word>> {
        let next = bt_footer(bt).as_ptr().add(1);
        if next == self.epilogue.as_ptr() {
            None
        } else {
            Some(NonNull::new_unchecked(next))
        }
    }

    /// The block before `bt`, located through its footer.
    ///
    /// Returns `None` unless `bt`'s PREVFREE flag is set; only a free
    /// previous block carries the footer this walks through.
    #[inline]
    unsafe fn bt_prev(&self, bt: NonNull<Word>) -> Option<NonNull<Word>> {
        if bt_prevfree(bt) == 0 {
            return None;
        }
        let prev_footer = NonNull::new_unchecked(bt.as_ptr().sub(1));
        Some(NonNull::new_unchecked(
            bt.as_ptr().sub(bt_size(prev_footer) as usize),
        ))
    }

    /// Writes the header of a `words`-sized block at `bt` and keeps the
    /// neighbourhood consistent: the next block's PREVFREE flag tracks this
    /// block's state, and free blocks get a footer mirroring the header.
    ///
    /// # Safety
    ///
    /// `bt..bt + words` must lie within the heap, and the word at
    /// `bt + words` must be a valid block header or the epilogue.
    unsafe fn bt_make(&mut self, bt: NonNull<Word>, words: Word, flags: Word) {
        debug_assert!(words >= MIN_BLOCK_WORDS);
        debug_assert_eq!(words % MIN_BLOCK_WORDS, 0);

        bt.as_ptr().write(words | flags);
        if let Some(next) = self.bt_next(bt) {
            if flags & USED != 0 {
                bt_clr_prevfree(next);
                return;
            }
            bt_set_prevfree(next);
        }
        bt_footer(bt).as_ptr().write(words | flags);
    }

    // ---- segregated index -----------------------------------------------

    #[inline]
    unsafe fn bucket_head(&self, index: usize) -> Option<NonNull<Word>> {
        let off = *self.buckets.as_ptr().add(index);
        if off < 0 {
            None
        } else {
            Some(NonNull::new_unchecked(
                self.heap_start.as_ptr().add(off as usize),
            ))
        }
    }

    #[inline]
    unsafe fn set_bucket_head(&mut self, index: usize, bt: Option<NonNull<Word>>) {
        let off = bt.map_or(NO_LINK as BucketSlot, |bt| self.word_off(bt) as BucketSlot);
        self.buckets.as_ptr().add(index).write(off);
    }

    #[inline]
    unsafe fn link_next(&self, bt: NonNull<Word>) -> Option<NonNull<Word>> {
        self.block_at(*bt.as_ptr().add(1))
    }

    #[inline]
    unsafe fn link_prev(&self, bt: NonNull<Word>) -> Option<NonNull<Word>> {
        self.block_at(*bt.as_ptr().add(2))
    }

    #[inline]
    unsafe fn set_link_next(&mut self, bt: NonNull<Word>, to: Option<NonNull<Word>>) {
        bt.as_ptr()
            .add(1)
            .write(to.map_or(NO_LINK, |to| self.word_off(to)));
    }

    #[inline]
    unsafe fn set_link_prev(&mut self, bt: NonNull<Word>, to: Option<NonNull<Word>>) {
        bt.as_ptr()
            .add(2)
            .write(to.map_or(NO_LINK, |to| self.word_off(to)));
    }

    /// Pushes the free block `bt` onto the head of its bucket.
    ///
    /// # Safety
    ///
    /// `bt` must head a free block that is in no bucket.
    unsafe fn free_list_append(&mut self, bt: NonNull<Word>) {
        let index = find_bucket(bt_size(bt));

        self.set_link_prev(bt, None);
        let head = self.bucket_head(index);
        self.set_link_next(bt, head);
        if let Some(head) = head {
            self.set_link_prev(head, Some(bt));
        }
        self.set_bucket_head(index, Some(bt));
    }

    /// Unlinks the free block `bt` from its bucket.
    ///
    /// # Safety
    ///
    /// `bt` must head a free block currently linked into its bucket.
    unsafe fn free_list_delete(&mut self, bt: NonNull<Word>) {
        let next = self.link_next(bt);
        let prev = self.link_prev(bt);

        if let Some(next) = next {
            self.set_link_prev(next, prev);
        }
        if let Some(prev) = prev {
            self.set_link_next(prev, next);
        } else {
            let index = find_bucket(bt_size(bt));
            debug_assert_eq!(self.bucket_head(index), Some(bt));
            self.set_bucket_head(index, next);
        }
    }

    // ---- allocation engine ----------------------------------------------

    /// First free block of at least `words` words, scanning buckets in
    /// increasing size-class order.
    unsafe fn find_fit(&self, words: Word) -> Option<NonNull<Word>> {
        for index in find_bucket(words)..N_BUCKETS {
            let mut cur = self.bucket_head(index);
            while let Some(bt) = cur {
                if bt_size(bt) >= words {
                    return Some(bt);
                }
                cur = self.link_next(bt);
            }
        }
        None
    }

    /// Marks the free block `bt` used for a `words`-sized request, carving
    /// any residual of at least [`MIN_BLOCK_WORDS`] into a new free block.
    ///
    /// # Safety
    ///
    /// `bt` must head a bucketed free block of at least `words` words.
    unsafe fn place(&mut self, bt: NonNull<Word>, words: Word) {
        let have = bt_size(bt);
        debug_assert!(have >= words);

        self.free_list_delete(bt);

        if have - words >= MIN_BLOCK_WORDS {
            // The residual header goes down first so that remarking `bt`
            // finds an initialized neighbour to clear PREVFREE on.
            let rest = NonNull::new_unchecked(bt.as_ptr().add(words as usize));
            self.bt_make(rest, have - words, FREE);
            self.bt_make(bt, words, USED | bt_prevfree(bt));
            self.free_list_append(rest);

            if self.last == Some(bt) {
                self.last = Some(rest);
            }
        } else {
            self.bt_make(bt, have, USED | bt_prevfree(bt));
        }
    }

    // ---- reclamation engine ---------------------------------------------

    /// Fuses the free block `bt` with any free neighbour, links the merged
    /// block into its bucket, and returns it. Keeps `last` pointed at the
    /// trailing block when the merge swallows it.
    ///
    /// # Safety
    ///
    /// `bt` must head a free block that is in no bucket; its neighbours'
    /// headers must be consistent.
    unsafe fn coalesce(&mut self, bt: NonNull<Word>) -> NonNull<Word> {
        let prev = self.bt_prev(bt);
        let next = self.bt_next(bt);
        let next_free = next.map_or(false, |next| !bt_used(next));

        let mut bt = bt;
        let mut words = bt_size(bt);

        let retarget_last = self.last == Some(bt) || (next_free && next == self.last);

        if let Some(next) = next {
            if !bt_used(next) {
                words += bt_size(next);
                self.free_list_delete(next);
            }
        }
        if let Some(prev) = prev {
            debug_assert!(!bt_used(prev));
            words += bt_size(prev);
            self.free_list_delete(prev);
            bt = prev;
        }

        self.bt_make(bt, words, FREE);
        self.free_list_append(bt);

        if retarget_last {
            self.last = Some(bt);
        }
        bt
    }

    // ---- heap extension -------------------------------------------------

    /// Grows the heap by `size` bytes, forming a free block out of the old
    /// epilogue word and the new growth, then coalescing it with a free
    /// trailing block.
    ///
    /// Returns the resulting free block, or `None` when the provider
    /// refuses; the heap is untouched on failure.
    unsafe fn extend_heap(&mut self, size: usize) -> Option<NonNull<Word>> {
        debug_assert!(size >= ALIGNMENT && size % ALIGNMENT == 0);

        let _grown = self.source.extend(size)?;
        debug_assert_eq!(
            _grown.as_ptr() as usize,
            self.epilogue.as_ptr() as usize + WSIZE
        );

        // The old epilogue word becomes the new block's header; the final
        // word of the growth becomes the new epilogue.
        let bt = self.epilogue;
        let words = (size / WSIZE) as Word;

        let mut flags = FREE;
        if let Some(last) = self.last {
            if !bt_used(last) {
                flags |= PREVFREE;
            }
        }

        let epilogue = NonNull::new_unchecked(bt.as_ptr().add(words as usize));
        epilogue.as_ptr().write(USED);
        self.epilogue = epilogue;
        debug_assert_eq!(
            self.epilogue.as_ptr() as usize % ALIGNMENT,
            ALIGNMENT - WSIZE
        );

        self.bt_make(bt, words, flags);
        self.last = Some(bt);

        Some(self.coalesce(bt))
    }
}
