//! The allocator itself: a handle over a caller-owned region that carries
//! no state of its own, the same design as the existing `BuddyAllocator`
//! and `PoolAllocator` this crate is modeled on. Every byte of bookkeeping
//! (the pool descriptor table, the per-class bitmap) lives inside the
//! region; `BuddyHeap<W>` is just a `NonNull<[u8]>` plus a marker for which
//! bitmap word width to use, so it is `Copy` and can be handed out freely.

use core::alloc::{AllocError as CoreAllocError, Allocator, Layout};
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::bitmap::{self, ScanDirection};
use crate::error::{AllocError, InitError};
use crate::pool::{self, PoolDescriptor};
use crate::word::Word;

/// A binary-buddy allocator over a single caller-owned byte region.
///
/// Construct with [`BuddyHeap::init`]. The type parameter `W` selects the
/// bitmap word width (`u16`, `u32`, or `u64`); smaller words cost less
/// memory per size class, larger words let the within-class scan (§4.4)
/// examine more candidate blocks per read.
#[derive(Clone, Copy)]
pub struct BuddyHeap<W: Word> {
    region: NonNull<[u8]>,
    _word: PhantomData<W>,
}

impl<W: Word> core::fmt::Debug for BuddyHeap<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BuddyHeap")
            .field("region_len", &self.region.len())
            .finish()
    }
}

impl<W: Word> BuddyHeap<W> {
    #[inline]
    fn region_ptr(&self) -> *mut u8 {
        self.region.as_ptr().cast::<u8>()
    }

    #[inline]
    fn region_len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    unsafe fn descriptor(&self, index: usize) -> PoolDescriptor<W> {
        pool::read_descriptor::<W>(self.region_ptr(), index)
    }

    #[inline]
    unsafe fn set_descriptor(&self, index: usize, desc: PoolDescriptor<W>) {
        pool::write_descriptor::<W>(self.region_ptr(), index, desc);
    }

    #[inline]
    unsafe fn class_count(&self) -> usize {
        pool::class_count::<W>(self.region_ptr())
    }

    #[inline]
    unsafe fn bitmap_base(&self, class_count: usize) -> usize {
        pool::table_bytes::<W>(class_count)
    }

    /// Build a heap over `region`, with `min_size` as the smallest
    /// allocatable block.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for its entire length
    /// for as long as any `BuddyHeap` handle built from it (or any pointer
    /// it hands out) is in use, and must not be aliased by any other live
    /// reference. On success every byte of `region` up to the returned
    /// `bytes_reserved` count has been overwritten with bookkeeping data.
    pub unsafe fn init(region: NonNull<[u8]>, min_size: usize) -> Result<(Self, usize), InitError> {
        let region_len = region.len();

        if !min_size.is_power_of_two() {
            return Err(InitError::MinSizeNotPowerOfTwo { min_size });
        }
        if region_len < min_size {
            return Err(InitError::RegionTooSmall {
                region_len,
                min_size,
            });
        }

        let heap = Self {
            region,
            _word: PhantomData,
        };
        let region_ptr = heap.region_ptr();

        // Steps 1-2 (4.2): build the class table smallest-to-largest,
        // laying out each class's share of the shared bitmap back to back.
        let mut class_count = 0usize;
        let mut size = min_size;
        let mut word_cursor = 0usize;
        while size.checked_mul(2).is_some_and(|doubled| doubled <= region_len) {
            let avail = region_len / size;
            let words = bitmap::words_for(avail, W::WIDTH);
            let desc = PoolDescriptor {
                size: W::from_usize(size),
                offset: W::from_usize(word_cursor),
                avail: W::from_usize(avail),
                alloccou: W::ZERO,
                fbcou: W::from_usize(avail % 2),
            };
            pool::write_descriptor::<W>(region_ptr, class_count, desc);
            word_cursor += words;
            class_count += 1;
            size *= 2;
        }
        pool::write_descriptor::<W>(region_ptr, class_count, PoolDescriptor::sentinel());

        let table_bytes = pool::table_bytes::<W>(class_count);
        let bitmap_bytes = word_cursor * size_of::<W>();

        // Step 3 (4.2): every class starts with its real blocks marked
        // free, and any bitmap padding past `avail` bits permanently
        // reserved.
        for k in 0..class_count {
            let desc = heap.descriptor(k);
            bitmap::fill_class::<W>(region_ptr, table_bytes, desc.offset.as_usize(), desc.avail.as_usize());
        }

        // Step 4 (4.2): carve the table and bitmap themselves out of the
        // heap. Walk classes smallest to largest; every class whose block
        // size covers the bookkeeping gets one block reserved (exposing the
        // rest of that block's buddy pair as a genuinely free sibling), and
        // the first (smallest) such class is the one diagnostics attribute
        // the reservation to.
        let bytes_reserved = table_bytes + bitmap_bytes;
        let mut attributed = false;
        for k in 0..class_count {
            let mut desc = heap.descriptor(k);
            if desc.size.as_usize() >= bytes_reserved {
                bitmap::set_bit::<W>(region_ptr, table_bytes, desc.offset.as_usize(), 1);
                desc.fbcou = W::from_usize(desc.fbcou.as_usize() + 1);
                if !attributed {
                    desc.alloccou = W::from_usize(1);
                    attributed = true;
                }
                heap.set_descriptor(k, desc);
            }
        }
        debug_assert!(
            attributed,
            "bookkeeping of {bytes_reserved} bytes does not fit in any size class"
        );

        #[cfg(feature = "trace")]
        log::debug!(
            "buddy-heap init: region_len={region_len} min_size={min_size} classes={class_count} bytes_reserved={bytes_reserved}"
        );

        Ok((heap, bytes_reserved))
    }

    /// [`Self::init`] collapsed to the sentinel-returning convention of the
    /// original C API: `None`/`0` on failure instead of an `InitError`.
    pub unsafe fn init_checked(region: NonNull<[u8]>, min_size: usize) -> (Option<Self>, usize) {
        match Self::init(region, min_size) {
            Ok((heap, bytes)) => (Some(heap), bytes),
            Err(_) => (None, 0),
        }
    }

    /// Bytes of `region` consumed by the pool descriptor table and bitmap,
    /// as returned by [`Self::init`]. Recomputed from the table rather than
    /// cached, since `BuddyHeap` stores no state of its own.
    pub fn bytes_reserved(&self) -> usize {
        unsafe {
            let class_count = self.class_count();
            let table_bytes = pool::table_bytes::<W>(class_count);
            let mut words = 0usize;
            for k in 0..class_count {
                let desc = self.descriptor(k);
                words += bitmap::words_for(desc.avail.as_usize(), W::WIDTH);
            }
            table_bytes + words * size_of::<W>()
        }
    }

    fn try_alloc(&self, size: usize, direction: ScanDirection) -> Result<NonNull<[u8]>, AllocError> {
        unsafe {
            let class_count = self.class_count();
            let bitmap_base = self.bitmap_base(class_count);

            let mut k = None;
            let mut largest_class = 0;
            for idx in 0..class_count {
                let desc = self.descriptor(idx);
                largest_class = desc.size.as_usize();
                if largest_class >= size {
                    k = Some(idx);
                    break;
                }
            }
            let k = k.ok_or(AllocError::RequestTooLarge {
                requested: size,
                largest_class,
            })?;

            let desc_k = self.descriptor(k);
            if !desc_k.fbcou.is_zero() {
                // `fbcou > 0` is a conservative upper bound (§4.4): it may
                // claim a free buddy that the bitmap no longer has if the
                // heap's invariants have been violated elsewhere. Rather
                // than trust it unconditionally, fall back to reporting
                // exhaustion instead of panicking on a corrupted heap.
                let b = bitmap::search_class::<W>(
                    self.region_ptr(),
                    bitmap_base,
                    desc_k.offset.as_usize(),
                    desc_k.avail.as_usize(),
                    direction,
                )
                .ok_or(AllocError::Exhausted {
                    class_size: desc_k.size.as_usize(),
                })?;
                let mut updated = desc_k;
                updated.fbcou = W::from_usize(updated.fbcou.as_usize() - 1);
                updated.alloccou = W::from_usize(updated.alloccou.as_usize() + 1);
                self.set_descriptor(k, updated);

                #[cfg(feature = "trace")]
                log::trace!("buddy-heap alloc: fast path class={k} size={} block={b}", desc_k.size.as_usize());

                return Ok(self.block_ptr(desc_k.size.as_usize(), b));
            }

            // Slow path (4.3): find the smallest class above k with a free
            // buddy pair, reserve it, then split back down to k.
            let mut j = k + 1;
            loop {
                let desc_j = self.descriptor(j);
                if desc_j.is_sentinel() {
                    return Err(AllocError::Exhausted {
                        class_size: desc_k.size.as_usize(),
                    });
                }
                if !desc_j.fbcou.is_zero() {
                    break;
                }
                j += 1;
            }

            let mut desc_j = self.descriptor(j);
            let mut b = bitmap::search_class::<W>(
                self.region_ptr(),
                bitmap_base,
                desc_j.offset.as_usize(),
                desc_j.avail.as_usize(),
                direction,
            )
            .ok_or(AllocError::Exhausted {
                class_size: desc_k.size.as_usize(),
            })?;
            desc_j.fbcou = W::from_usize(desc_j.fbcou.as_usize() - 1);
            self.set_descriptor(j, desc_j);

            let mut level = j;
            while level > k {
                let child_class = level - 1;
                let mut child_desc = self.descriptor(child_class);
                let left = 2 * b - 1;
                bitmap::set_bit::<W>(self.region_ptr(), bitmap_base, child_desc.offset.as_usize(), left);
                child_desc.fbcou = W::from_usize(child_desc.fbcou.as_usize() + 1);
                self.set_descriptor(child_class, child_desc);
                b = left;
                level -= 1;
            }

            let mut final_desc = self.descriptor(k);
            final_desc.alloccou = W::from_usize(final_desc.alloccou.as_usize() + 1);
            self.set_descriptor(k, final_desc);

            #[cfg(feature = "trace")]
            log::trace!(
                "buddy-heap alloc: split path class={k} size={} from class={j} block={b}",
                final_desc.size.as_usize()
            );

            Ok(self.block_ptr(final_desc.size.as_usize(), b))
        }
    }

    /// Allocate at least `size` bytes from the smallest size class that
    /// fits, preferring blocks near the top of the region when a split is
    /// needed. `None` if no class is large enough or every eligible class
    /// is exhausted.
    pub fn alloc(&self, size: usize) -> Option<NonNull<[u8]>> {
        self.try_alloc(size, ScanDirection::FromTop).ok()
    }

    /// Like [`Self::alloc`], but prefers blocks near the bottom of the
    /// region. Intended for long-lived allocations, so they do not
    /// fragment the space `alloc` draws transient allocations from; see
    /// the module-level note in [`crate`] for why this exists.
    pub fn alloc_low(&self, size: usize) -> Option<NonNull<[u8]>> {
        self.try_alloc(size, ScanDirection::FromBottom).ok()
    }

    /// [`Self::alloc`] collapsed to a raw pointer, null on failure.
    pub fn alloc_ptr(&self, size: usize) -> *mut u8 {
        self.alloc(size).map_or(core::ptr::null_mut(), |p| p.as_ptr().cast::<u8>())
    }

    /// [`Self::alloc_low`] collapsed to a raw pointer, null on failure.
    pub fn alloc_low_ptr(&self, size: usize) -> *mut u8 {
        self.alloc_low(size).map_or(core::ptr::null_mut(), |p| p.as_ptr().cast::<u8>())
    }

    #[inline]
    fn block_ptr(&self, class_size: usize, block_number: usize) -> NonNull<[u8]> {
        unsafe {
            let addr = self.region_ptr().add((block_number - 1) * class_size);
            NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(addr, class_size))
        }
    }

    /// Release a block previously returned by [`Self::alloc`] or
    /// [`Self::alloc_low`] on this same heap.
    ///
    /// # Safety
    ///
    /// `ptr` must point into this heap's region at the start of a block
    /// currently allocated to the caller, and must not be used again after
    /// this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let region_ptr = self.region_ptr();
        let offset = ptr.as_ptr() as usize - region_ptr as usize;

        let class_count = self.class_count();
        let bitmap_base = self.bitmap_base(class_count);

        // 4.5 step 1: rediscover the size class by testing, ascending,
        // whether this address's bit at each class is set.
        let mut k = 0;
        let mut b = 0usize;
        let mut found = false;
        while k < class_count {
            let desc = self.descriptor(k);
            let candidate = offset / desc.size.as_usize() + 1;
            if bitmap::test_bit::<W>(region_ptr, bitmap_base, desc.offset.as_usize(), candidate) {
                b = candidate;
                found = true;
                break;
            }
            k += 1;
        }

        if !found {
            debug_assert!(
                false,
                "free: pointer does not correspond to any live allocation (double free or foreign pointer)"
            );
            return;
        }

        {
            let mut desc = self.descriptor(k);
            desc.alloccou = W::from_usize(desc.alloccou.as_usize().saturating_sub(1));
            self.set_descriptor(k, desc);
        }

        #[cfg(feature = "trace")]
        log::trace!("buddy-heap free: class={k} block={b}");

        // 4.5 step 2: clear the bit, then coalesce upward while the sibling
        // is also free.
        loop {
            let mut desc = self.descriptor(k);
            bitmap::clear_bit::<W>(region_ptr, bitmap_base, desc.offset.as_usize(), b);

            let sibling = if b % 2 == 1 { b + 1 } else { b - 1 };
            let sibling_reserved = bitmap::test_bit::<W>(region_ptr, bitmap_base, desc.offset.as_usize(), sibling);

            if sibling_reserved {
                desc.fbcou = W::from_usize(desc.fbcou.as_usize() + 1);
                self.set_descriptor(k, desc);
                return;
            }

            desc.fbcou = W::from_usize(desc.fbcou.as_usize().saturating_sub(1));
            self.set_descriptor(k, desc);

            let parent_k = k + 1;
            let parent_desc = self.descriptor(parent_k);
            if parent_desc.is_sentinel() {
                return;
            }

            b = b.div_ceil(2);
            k = parent_k;
        }
    }

    /// Sum of `alloccou` across every size class: the number of blocks
    /// currently allocated to callers (the bookkeeping's own reservation
    /// from [`Self::init`] counts as one). Used for diagnostics and by
    /// tests checking invariants, not on any hot path.
    pub fn live_allocations(&self) -> usize {
        unsafe {
            let class_count = self.class_count();
            (0..class_count).map(|k| self.descriptor(k).alloccou.as_usize()).sum()
        }
    }
}

unsafe impl<W: Word> Allocator for BuddyHeap<W> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, CoreAllocError> {
        self.try_alloc(layout.size().max(1), ScanDirection::FromTop)
            .map_err(|_| CoreAllocError)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        self.free(ptr);
    }
}
