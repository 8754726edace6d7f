//! The scatter allocator. See [`ScatterAllocator`].

use std::ptr::NonNull;

use crate::freelist::FreeList;
use crate::pool::Pool;
use crate::{span, Span};

/// A pool-based bulk allocator for raw `T` slots. One logical allocation
/// may be satisfied by several discontiguous spans, as the allocator
/// fills holes in its pools before breaking fresh ground:
///
/// ```text
///              free list (most recently freed first)
///                +-------------------+
///                |                   |
///            +---|---+           +---|----+
///            | Free  | --------> | Free   | --> (end)
///            +---|---+           +---|----+
///                |                   |
///      +---------|--------+      +---|------------------------+
///      |     ####         |      |   ##   ############        |
///      |  pool 1 (newest) | ---> |  pool 0 (oldest)  ^        |
///      +------------------+      +-------------------|--------+
///             ^ watermark                             watermark
/// ```
///
/// The allocation order is the contract: free blocks are drained first,
/// in list order, then fresh slots are taken from the pools newest
/// first, and only when everything is exhausted does a new pool get
/// mapped in front of the chain. Capacities are powers of two starting
/// at `STARTING_SIZE` and double from pool to pool, bumped up when a
/// single request needs more than the next doubling.
///
/// No element is ever constructed or dropped in here; the allocator
/// traffics in uninitialized slots and the client owns every lifecycle
/// question. Freed spans are poisoned with `0xEE` so use-after-free
/// shows up quickly in a debugger.
///
/// Not thread safe; mutation requires `&mut self`.
pub struct ScatterAllocator<T, const STARTING_SIZE: usize = 16> {
    /// Pool chain, newest first. Storage is only released on drop or
    /// [`reset`](Self::reset).
    pools: Option<Box<Pool<T>>>,
    /// Spans returned by the client, reused before any watermark moves.
    free: FreeList<T>,
}

impl<T, const STARTING_SIZE: usize> ScatterAllocator<T, STARTING_SIZE> {
    const STARTING_SIZE_IS_A_POWER_OF_TWO: () = assert!(
        STARTING_SIZE.is_power_of_two(),
        "STARTING_SIZE must be a nonzero power of two"
    );

    /// Creates an empty allocator. Nothing is mapped until the first
    /// request.
    pub const fn new() -> Self {
        let () = Self::STARTING_SIZE_IS_A_POWER_OF_TWO;
        ScatterAllocator {
            pools: None,
            free: FreeList::new(),
        }
    }

    /// Hands out storage for exactly `count` slots, invoking `callback`
    /// once per contiguous span. The spans are nonempty and their sizes
    /// sum to `count`.
    ///
    /// Out-of-memory while growing diverges through
    /// [`std::alloc::handle_alloc_error`]; there is no in-band error.
    pub fn allocate_with_callback(&mut self, count: usize, mut callback: impl FnMut(Span<T>)) {
        // Free blocks first.
        let mut remaining = self.free.consume(count, &mut callback);

        while remaining > 0 {
            // Fresh space from the pools, newest first.
            let mut pool = self.pools.as_deref_mut();
            while let Some(p) = pool {
                if let Some(taken) = p.take_fresh(remaining) {
                    remaining -= taken.len();
                    callback(taken);
                    if remaining == 0 {
                        return;
                    }
                }
                pool = p.next_mut();
            }

            // Everything is exhausted; grow and go again.
            self.grow(remaining);
        }
    }

    /// Like [`allocate_with_callback`](Self::allocate_with_callback), but
    /// collects the spans in delivery order.
    pub fn allocate(&mut self, count: usize) -> Vec<Span<T>> {
        let mut spans = Vec::new();
        self.allocate_with_callback(count, |span| spans.push(span));
        spans
    }

    /// Hands out a single slot. The policy guarantees the callback sees
    /// exactly one span of size one, so this never scatters.
    pub fn allocate_one(&mut self) -> NonNull<T> {
        let mut slot = None;
        self.allocate_with_callback(1, |span| {
            debug_assert!(slot.is_none());
            debug_assert_eq!(span.len(), 1);
            slot = Some(span.cast::<T>());
        });
        slot.expect("a one-slot request always yields a span")
    }

    /// Returns a previously handed-out region (or a subspan of one) for
    /// reuse. The span must lie inside one of the live pools; anything
    /// else fails a debug assertion. An empty span is a no-op.
    pub fn deallocate(&mut self, span: Span<T>) {
        if span.len() == 0 {
            return;
        }

        debug_assert!(
            self.owns(span),
            "deallocate() called with a span outside any pool"
        );
        log::trace!("freeing {} slots", span.len());

        // Poison the returned slots to make use-after-free loud.
        unsafe { span.cast::<T>().as_ptr().write_bytes(0xEE, span.len()) };

        self.free.push(span);
    }

    /// Drops every pool and forgets every free block, returning the
    /// allocator to its freshly constructed state. Every span handed out
    /// so far is invalidated; the caller must be done with all of them.
    pub fn reset(&mut self) {
        self.pools = None;
        self.free = FreeList::new();
    }

    /// Prepends a pool big enough to cover `remaining` slots in one span.
    fn grow(&mut self, remaining: usize) {
        let capacity = match self.pools.as_deref() {
            Some(newest) => remaining.next_power_of_two().max(newest.capacity() * 2),
            None => remaining.next_power_of_two().max(STARTING_SIZE),
        };

        log::debug!("adding a pool of {capacity} slots ({remaining} still owed)");
        self.pools = Some(Pool::new(capacity, self.pools.take()));
    }

    /// Whether `target` lies entirely within one live pool.
    fn owns(&self, target: Span<T>) -> bool {
        let mut pool = self.pools.as_deref();
        while let Some(p) = pool {
            if span::contains(p.region(), target) {
                return true;
            }
            pool = p.next();
        }
        false
    }

    /// Pool capacities, newest first. Only needed by tests.
    #[cfg(test)]
    pub(crate) fn pool_capacities(&self) -> Vec<usize> {
        let mut capacities = Vec::new();
        let mut pool = self.pools.as_deref();
        while let Some(p) = pool {
            capacities.push(p.capacity());
            pool = p.next();
        }
        capacities
    }

    #[cfg(test)]
    pub(crate) fn free_block_count(&self) -> usize {
        self.free.len()
    }
}

impl<T, const STARTING_SIZE: usize> Default for ScatterAllocator<T, STARTING_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

// The allocator exclusively owns its pools, and `&self` exposes nothing
// but address checks, so ownership transfer and shared reads follow the
// element type.
unsafe impl<T: Send, const STARTING_SIZE: usize> Send for ScatterAllocator<T, STARTING_SIZE> {}
unsafe impl<T: Sync, const STARTING_SIZE: usize> Sync for ScatterAllocator<T, STARTING_SIZE> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hands_out_exactly_what_was_asked() {
        let mut alloc = ScatterAllocator::<i32>::new();
        let mut total = 0;
        alloc.allocate_with_callback(123, |span| total += span.len());
        assert_eq!(total, 123);
    }

    #[test]
    fn scatters_in_free_list_first_order() {
        let mut alloc = ScatterAllocator::<i32, 16>::new();

        let initial = alloc.allocate(10);
        assert_eq!(initial.len(), 1);
        let block = initial[0];
        assert_eq!(block.len(), 10);
        let base = block.cast::<i32>().as_ptr() as usize;

        unsafe {
            alloc.deallocate(span::prefix(span::suffix(block, 2), 2)); // slots [2..4)
            alloc.deallocate(span::prefix(span::suffix(block, 4), 2)); // slots [4..6)
        }

        // The two holes come back first (most recently freed first), then
        // the rest of the first pool, then a fresh pool for what is left.
        let mut spans = Vec::new();
        alloc.allocate_with_callback(20, |span| spans.push(span));

        let sizes: Vec<usize> = spans.iter().map(|s| s.len()).collect();
        assert_eq!(sizes, [2, 2, 6, 10]);

        let addr = |i: usize| spans[i].cast::<i32>().as_ptr() as usize;
        assert_eq!(addr(0), base + 4 * 4);
        assert_eq!(addr(1), base + 2 * 4);
        assert_eq!(addr(2), base + 10 * 4);
    }

    #[test]
    fn construction_and_destruction_are_client_side() {
        let mut alloc = ScatterAllocator::<String>::new();

        let mut spans = Vec::new();
        alloc.allocate_with_callback(12, |span| spans.push(span));

        let mut slots = Vec::new();
        for span in &spans {
            for i in 0..span.len() {
                unsafe {
                    let slot = span::element(*span, i);
                    slot.as_ptr().write(format!("item {i}"));
                    slots.push(slot);
                }
            }
        }
        assert_eq!(slots.len(), 12);

        unsafe {
            for slot in &slots {
                assert!((*slot.as_ptr()).starts_with("item"));
            }
            for slot in slots {
                std::ptr::drop_in_place(slot.as_ptr());
            }
        }

        for span in spans {
            alloc.deallocate(span);
        }
    }

    #[test]
    fn one_slot_requests_reuse_freed_slots() {
        let mut alloc = ScatterAllocator::<i32>::new();

        let a = alloc.allocate_one();
        let b = alloc.allocate_one();
        assert_ne!(a, b);

        alloc.deallocate(span::singleton(a));

        // The freed slot comes back before any fresh space is touched.
        let c = alloc.allocate_one();
        assert_eq!(c, a);
    }

    #[test]
    fn pools_double_and_cover_oversized_requests() {
        let mut alloc = ScatterAllocator::<i32>::new();

        alloc.allocate(20);
        assert_eq!(alloc.pool_capacities(), [32]);

        let mut sizes = Vec::new();
        alloc.allocate_with_callback(40, |span| sizes.push(span.len()));
        assert_eq!(sizes, [12, 28]);
        assert_eq!(alloc.pool_capacities(), [64, 32]);
    }

    #[test]
    fn reset_returns_to_fresh_state() {
        let mut alloc = ScatterAllocator::<i32>::new();
        let spans = alloc.allocate(10);
        alloc.deallocate(spans[0]);

        alloc.reset();
        assert!(alloc.pool_capacities().is_empty());
        assert_eq!(alloc.free_block_count(), 0);

        let fresh = alloc.allocate(10);
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "outside any pool")]
    fn rejects_foreign_spans() {
        let mut alloc = ScatterAllocator::<i32>::new();
        alloc.allocate(4);

        let mut foreign = [0i32; 4];
        let span = span::from_raw_parts(NonNull::new(foreign.as_mut_ptr()).unwrap(), 4);
        alloc.deallocate(span);
    }

    fn overlaps(a: Span<u32>, b: Span<u32>) -> bool {
        let a_start = a.cast::<u32>().as_ptr() as usize;
        let a_end = a_start + a.len() * 4;
        let b_start = b.cast::<u32>().as_ptr() as usize;
        let b_end = b_start + b.len() * 4;
        a_start < b_end && b_start < a_end
    }

    proptest! {
        /// Property: the set of concurrently live spans never overlaps,
        /// and every request is answered with exactly the slot count it
        /// asked for, whatever the allocate/deallocate interleaving.
        #[test]
        fn live_spans_never_overlap(
            ops in proptest::collection::vec((any::<bool>(), 1usize..17), 1..64),
        ) {
            let _ = env_logger::builder().is_test(true).try_init();

            let mut alloc = ScatterAllocator::<u32>::new();
            let mut live: Vec<Span<u32>> = Vec::new();

            for (is_alloc, size) in ops {
                if is_alloc || live.is_empty() {
                    let spans = alloc.allocate(size);
                    let total: usize = spans.iter().map(|s| s.len()).sum();
                    prop_assert_eq!(total, size);

                    for span in &spans {
                        prop_assert!(span.len() > 0);
                        for other in &live {
                            prop_assert!(!overlaps(*other, *span));
                        }
                    }
                    live.extend(spans);
                } else {
                    let span = live.swap_remove(size % live.len());
                    alloc.deallocate(span);
                }
            }
        }
    }
}
