//! Physical frame allocator.
//!
//! Every frame at or above the user boundary, except the shared zero frame,
//! starts on one free list kept in ascending address order. Allocation takes
//! the lowest free frame. Freeing puts a frame back in order, which makes a
//! double free visible immediately.
use alloc::collections::BTreeSet;
use bedrock::{
    addressing::{Pa, PAGE_SIZE},
    spin_lock::SpinLock,
};

/// The pool of user frames.
pub struct FrameAllocator {
    free: SpinLock<BTreeSet<Pa>>,
    start: Pa,
    end: Pa,
    zero_frame: Pa,
}

impl FrameAllocator {
    /// Take ownership of the frames in `[start, end)`.
    ///
    /// The first frame is withheld as the zero frame.
    pub fn new(start: Pa, end: Pa) -> Self {
        let free = (start.into_usize() + PAGE_SIZE..end.into_usize())
            .step_by(PAGE_SIZE)
            .map(|pa| Pa::new(pa as u32))
            .collect();
        Self {
            free: SpinLock::new(free),
            start,
            end,
            zero_frame: start,
        }
    }

    /// The frame every zero-fill-on-demand page reads from.
    pub fn zero_frame(&self) -> Pa {
        self.zero_frame
    }

    /// Take a frame. Its content is unspecified.
    pub fn allocate(&self) -> Option<Pa> {
        self.free.lock().pop_first()
    }

    /// Give `pa` back.
    ///
    /// # Panics
    /// Freeing a frame the allocator does not own, the zero frame, or a frame
    /// that is already free corrupts the pool and panics.
    pub fn free(&self, pa: Pa) {
        assert!(
            pa.is_page_aligned() && pa > self.zero_frame && pa >= self.start && pa < self.end,
            "free of foreign frame {:?}",
            pa
        );
        assert!(self.free.lock().insert(pa), "double free of {:?}", pa);
    }

    /// Number of free frames.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Whether `pa` is on the free list.
    pub fn is_free(&self, pa: Pa) -> bool {
        self.free.lock().contains(&pa)
    }
}
