use core::ptr::{self, NonNull};

use crate::{init::Init, source::HeapSource};

/// Address space reserved for the process heap. The mapping is created
/// lazily and the kernel commits pages on first touch, so the practical
/// cost is only the pages actually used.
const MAX_HEAP_SIZE: usize = 1 << 30;

pub struct Mutex(());

impl Init for Mutex {
    const INIT: Self = Self(());
}

/// `pthread_mutex_t` might be unsafe to move, so it lives in a `static`.
static mut MUTEX: libc::pthread_mutex_t = libc::PTHREAD_MUTEX_INITIALIZER;

impl Mutex {
    #[inline]
    pub fn lock(&self) {
        unsafe {
            libc::pthread_mutex_lock(ptr::addr_of_mut!(MUTEX));
        }
    }

    #[inline]
    pub fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(ptr::addr_of_mut!(MUTEX));
        }
    }
}

/// A [`HeapSource`] over one reserved anonymous mapping, extended by moving
/// a break pointer through it.
pub struct Source {
    base: Option<NonNull<u8>>,
    len: usize,
}

impl Init for Source {
    const INIT: Self = Self { base: None, len: 0 };
}

impl Source {
    #[cold]
    fn reserve(&mut self) -> Option<NonNull<u8>> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        #[cfg(target_os = "linux")]
        let flags = flags | libc::MAP_NORESERVE;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                MAX_HEAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }

        let base = NonNull::new(ptr as *mut u8)?;
        self.base = Some(base);
        Some(base)
    }
}

unsafe impl HeapSource for Source {
    #[inline]
    unsafe fn extend(&mut self, size: usize) -> Option<NonNull<u8>> {
        let base = match self.base {
            Some(base) => base,
            None => self.reserve()?,
        };
        let end = self.len.checked_add(size)?;
        if end > MAX_HEAP_SIZE {
            return None;
        }
        let ptr = NonNull::new_unchecked(base.as_ptr().add(self.len));
        self.len = end;
        Some(ptr)
    }

    fn bounds(&self) -> Option<(NonNull<u8>, NonNull<u8>)> {
        let base = self.base?;
        if self.len == 0 {
            return None;
        }
        // Safety: `base + len` stays within the reservation.
        let end = unsafe { NonNull::new_unchecked(base.as_ptr().add(self.len)) };
        Some((base, end))
    }
}
