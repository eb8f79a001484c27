//! Error types for [`crate::BuddyHeap`].
//!
//! The inherent `init`/`alloc`/`alloc_low` entry points return `Result`s
//! built from these, matching how the rest of the fallible surface in this
//! crate reports failure; `alloc`/`alloc_low` additionally collapse to
//! `Option<NonNull<[u8]>>` for callers that just want a pointer or nothing,
//! mirroring the original "return 0 means out of memory" convention.

use core::fmt;

/// Why [`crate::BuddyHeap::init`] refused to build a heap over a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The region is smaller than the requested minimum block size.
    RegionTooSmall {
        /// Length, in bytes, of the region the caller supplied.
        region_len: usize,
        /// Minimum block size the caller requested.
        min_size: usize,
    },
    /// `min_size` was not a power of two.
    MinSizeNotPowerOfTwo {
        /// The offending value.
        min_size: usize,
    },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            InitError::RegionTooSmall {
                region_len,
                min_size,
            } => write!(
                f,
                "region of {region_len} bytes is smaller than the minimum block size of {min_size} bytes"
            ),
            InitError::MinSizeNotPowerOfTwo { min_size } => {
                write!(f, "minimum block size {min_size} is not a power of two")
            }
        }
    }
}

impl core::error::Error for InitError {}

/// Why a [`crate::BuddyHeap::alloc`]/`alloc_low` call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No size class is large enough to serve the request.
    RequestTooLarge {
        /// Bytes requested.
        requested: usize,
        /// Size, in bytes, of the largest size class this heap has.
        largest_class: usize,
    },
    /// The smallest class able to serve the request, and every class above
    /// it, are fully reserved.
    Exhausted {
        /// Size, in bytes, of the smallest class that could have served
        /// the request.
        class_size: usize,
    },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AllocError::RequestTooLarge {
                requested,
                largest_class,
            } => write!(
                f,
                "requested {requested} bytes but the largest size class is {largest_class} bytes"
            ),
            AllocError::Exhausted { class_size } => write!(
                f,
                "size class {class_size} and every class larger than it are fully reserved"
            ),
        }
    }
}

impl core::error::Error for AllocError {}
