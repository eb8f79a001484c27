//! A binary-buddy memory allocator over a single caller-owned byte region.
//!
//! [`BuddyHeap`] turns a region the caller already owns — a static array, a
//! slab returned by a host allocator, a block reserved by firmware before
//! Rust code ever runs — into a general-purpose allocator, without needing
//! an operating system, a heap of its own, or any memory beyond the region
//! itself. The pool descriptor table and the per-class bitmap described in
//! [`heap`] both live inside that region, so a `BuddyHeap` handle carries no
//! state beyond a `NonNull<[u8]>` and is `Copy`: the same design as this
//! crate's `BuddyAllocator`/`PoolAllocator` ancestors, generalized from a
//! fixed tree depth to a caller-chosen minimum block size and bitmap word
//! width.
//!
//! Sizes are rounded up to the smallest power-of-two size class at least as
//! large as the request; every class is tracked by one pool descriptor and
//! one run of bits, one bit per block, in a bitmap shared across classes.
//! Splitting a block on allocation and coalescing its buddy back together
//! on free are the only two structural operations; see [`heap::BuddyHeap`]
//! for both.
#![cfg_attr(target_os = "none", no_std)]
#![feature(allocator_api)]
#![feature(slice_ptr_get)]

mod bitmap;
mod error;
mod heap;
mod pool;
mod word;

pub use error::{AllocError, InitError};
pub use heap::BuddyHeap;
pub use word::Word;
