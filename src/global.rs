//! [`SegFit`] as a global allocator.
use core::{
    alloc::{GlobalAlloc, Layout},
    cell::UnsafeCell,
    mem, ops,
    ptr::{self, NonNull},
};

use crate::{init::Init, segfit::SegFit, utils::round_up, ALIGNMENT};

mod unix;
use self::unix as os;

type TheHeap = SegFit<os::Source>;

/// [`SegFit`] as a global allocator, backed by a reserved mapping.
///
/// The heap is created lazily on first use. Entry points are serialized by
/// a process mutex; the allocator itself stays single-threaded underneath.
///
/// # Examples
///
/// ```rust
/// #[global_allocator]
/// static A: segfit::GlobalSegFit = segfit::GlobalSegFit::new();
///
/// let mut m = std::collections::HashMap::new();
/// m.insert(1, 2);
/// m.insert(5, 3);
/// drop(m);
/// ```
pub struct GlobalSegFit {
    inner: UnsafeCell<Option<TheHeap>>,
    mutex: os::Mutex,
}

/// One word below an over-aligned payload records the distance back to the
/// payload the core handed out.
type PadWord = u32;

impl Init for GlobalSegFit {
    const INIT: Self = Self::INIT;
}

impl GlobalSegFit {
    /// The initializer.
    pub const INIT: Self = Self {
        inner: UnsafeCell::new(None),
        mutex: os::Mutex::INIT,
    };

    /// Constructs an empty `GlobalSegFit`.
    pub const fn new() -> Self {
        Self::INIT
    }

    #[inline]
    fn lock_inner(&self) -> impl ops::DerefMut<Target = Option<TheHeap>> + '_ {
        struct LockGuard<'a>(&'a GlobalSegFit);

        impl ops::Deref for LockGuard<'_> {
            type Target = Option<TheHeap>;

            #[inline]
            fn deref(&self) -> &Self::Target {
                // Safety: Protected by `mutex`
                unsafe { &*self.0.inner.get() }
            }
        }

        impl ops::DerefMut for LockGuard<'_> {
            #[inline]
            fn deref_mut(&mut self) -> &mut Self::Target {
                // Safety: Protected by `mutex`
                unsafe { &mut *self.0.inner.get() }
            }
        }

        impl Drop for LockGuard<'_> {
            #[inline]
            fn drop(&mut self) {
                self.0.mutex.unlock();
            }
        }

        self.mutex.lock();
        LockGuard(self)
    }
}

// Safety: `inner` is only reached through `lock_inner`, which serializes
//         every access behind the process mutex.
unsafe impl Send for GlobalSegFit {}
unsafe impl Sync for GlobalSegFit {}

/// Builds the heap on first use.
fn heap_of(inner: &mut Option<TheHeap>) -> Option<&mut TheHeap> {
    if inner.is_none() {
        *inner = SegFit::new(os::Source::INIT).ok();
    }
    inner.as_mut()
}

/// Allocates `layout` out of `heap`, honouring alignments above
/// [`ALIGNMENT`] by over-allocating and recording the way back to the
/// block's own payload just below the address returned.
fn alloc_in(heap: &mut TheHeap, layout: Layout) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
        return heap
            .allocate(layout.size())
            .map(NonNull::as_ptr)
            .unwrap_or(ptr::null_mut());
    }

    let size = match layout.size().checked_add(layout.align()) {
        Some(size) => size,
        None => return ptr::null_mut(),
    };
    let raw = match heap.allocate(size) {
        Some(raw) => raw,
        None => return ptr::null_mut(),
    };

    // Skipping at least one word guarantees room for the back distance.
    let aligned = round_up(
        raw.as_ptr() as usize + mem::size_of::<PadWord>(),
        layout.align(),
    );
    let back = (aligned - raw.as_ptr() as usize) as PadWord;
    // Safety: `aligned - size_of::<PadWord>()` lies within the block's
    //         payload, which spans `raw..raw + size`.
    unsafe { (aligned as *mut PadWord).sub(1).write(back) };
    aligned as *mut u8
}

/// Recovers the payload the core handed out for an allocation returned by
/// [`alloc_in`].
///
/// # Safety
///
/// `ptr` must come from `alloc_in` with the same `align`.
unsafe fn payload_of(ptr: NonNull<u8>, align: usize) -> NonNull<u8> {
    if align <= ALIGNMENT {
        ptr
    } else {
        let back = *ptr.cast::<PadWord>().as_ptr().sub(1);
        NonNull::new_unchecked(ptr.as_ptr().sub(back as usize))
    }
}

unsafe impl GlobalAlloc for GlobalSegFit {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut inner = self.lock_inner();
        match heap_of(&mut inner) {
            Some(heap) => alloc_in(heap, layout),
            None => ptr::null_mut(),
        }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let mut inner = self.lock_inner();
        let heap = match heap_of(&mut inner) {
            Some(heap) => heap,
            None => return ptr::null_mut(),
        };
        if layout.align() <= ALIGNMENT {
            heap.allocate_zeroed(layout.size(), 1)
                .map(NonNull::as_ptr)
                .unwrap_or(ptr::null_mut())
        } else {
            let ptr = alloc_in(heap, layout);
            if !ptr.is_null() {
                ptr.write_bytes(0, layout.size());
            }
            ptr
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut inner = self.lock_inner();
        if let Some(heap) = inner.as_mut() {
            // Safety: All allocations are non-null
            let ptr = NonNull::new_unchecked(ptr);
            // Safety: `ptr` denotes a previous allocation with alignment
            //         `layout.align()`
            heap.deallocate(payload_of(ptr, layout.align()));
        }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if new_size == 0 {
            return ptr::null_mut();
        }
        let mut inner = self.lock_inner();
        let heap = match inner.as_mut() {
            Some(heap) => heap,
            None => return ptr::null_mut(),
        };
        // Safety: All allocations are non-null
        let ptr = NonNull::new_unchecked(ptr);

        if layout.align() <= ALIGNMENT {
            heap.reallocate(ptr, new_size)
                .map(NonNull::as_ptr)
                .unwrap_or(ptr::null_mut())
        } else {
            // Moving to a fresh allocation keeps the recorded back distance
            // scheme intact.
            let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
            let new_ptr = alloc_in(heap, new_layout);
            if !new_ptr.is_null() {
                // The tail past what the client wrote may be uninitialized.
                ptr::copy_nonoverlapping(
                    ptr.as_ptr() as *const mem::MaybeUninit<u8>,
                    new_ptr as *mut mem::MaybeUninit<u8>,
                    layout.size().min(new_size),
                );
                heap.deallocate(payload_of(ptr, layout.align()));
            }
            new_ptr
        }
    }
}
