//! This crate implements a segregated-fit dynamic memory allocator over a
//! single contiguous heap that grows on demand.
//!
//!  - **Boundary-tagged blocks with an elided footer.** Each block carries a
//!    one-word header packing its size with two flags; only free blocks carry
//!    a footer, so a used block's payload gets those words back. A freed
//!    block fuses with either free neighbour in constant time.
//!
//!  - **Ten size-class buckets, first fit, LIFO.** Free blocks are indexed
//!    by power-of-two size classes and reused front-of-list first, which
//!    keeps recently freed memory hot.
//!
//!  - **The heap is provided by the application.** Any [`HeapSource`] works:
//!    a fixed arena ([`ArenaSource`]), or on Unix the reserved mapping behind
//!    [`GlobalSegFit`], which makes the allocator usable as the process-wide
//!    `#[global_allocator]`.
//!
//!  - **This crate supports `#![no_std]`.** The core has no OS dependency at
//!    all.
//!
//! # Examples
//!
//! ```rust
//! use segfit::{ArenaSource, SegFit};
//! use std::mem::MaybeUninit;
//!
//! let mut arena = [MaybeUninit::uninit(); 65536];
//! let mut heap = SegFit::new(ArenaSource::new(&mut arena)).unwrap();
//!
//! let p = heap.allocate(24).unwrap();
//! assert_eq!(p.as_ptr() as usize % segfit::ALIGNMENT, 0);
//! unsafe {
//!     p.as_ptr().write_bytes(0xab, 24);
//!     heap.deallocate(p);
//! }
//! ```
//!
//! # Heap layout
//!
//! ```text
//! [ bucket array | pad | block 0 | block 1 | ... | block n | epilogue ]
//!                       |                                   '-- 1 word, size 0, used
//!                       '-- header one word below a 16-byte boundary
//!
//! used block:  [ size|flags | payload ... ]
//! free block:  [ size|flags | next | prev | ... | footer ]
//! ```
//!
//! Free-list links are signed 32-bit word offsets from the heap base rather
//! than native pointers, which halves their footprint on 64-bit targets and
//! keeps the heap image position-independent; `-1` marks an absent link.
#![no_std]

mod init;
mod segfit;
mod source;
mod utils;

pub use self::{
    init::Init,
    segfit::{AllocInitError, SegFit, ALIGNMENT},
    source::{ArenaSource, HeapSource},
};

#[cfg(unix)]
mod global;
#[cfg(unix)]
pub use self::global::GlobalSegFit;

#[cfg(any(test, feature = "std"))]
extern crate std;
