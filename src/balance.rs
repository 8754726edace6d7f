//! Express-lane maintenance. A [`Rebalancer`] walks the list once and
//! rewrites every non-tail express pointer into a geometric cascade:
//! strides of `count, count/2, count/4, …, 1` nodes, one stepper per
//! stride, so that a search can descend from the widest lane down to
//! single steps in logarithmically many hops.
//!
//! Each stepper fires when the traversal index reaches its target: it
//! points its anchor's express pointer just past the current node, moves
//! its anchor here, and schedules itself one stride ahead. The steppers
//! live in a min-heap keyed by target so only the heap front is ever
//! inspected per node. Every splice is a complete local fix-up, which is
//! what lets the traversal be interleaved with other work (iteration,
//! node construction) and abandoned at any point.
//!
//! All field accesses go through raw pointer projections rather than
//! references, since the traversal runs while shared references to node
//! values may be live.

use std::ptr::{self, NonNull};

use crate::node::Node;

/// One stride of the cascade. `from` is the node whose express pointer
/// the next splice rewrites, `target` the traversal index at which that
/// happens.
struct Stepper<T> {
    target: usize,
    stride: usize,
    from: NonNull<Node<T>>,
}

/// Number of strides in the cascade over `count` nodes: the bit width of
/// `count`, so the stride list `count, count/2, …` always bottoms out at
/// one. The stride-one stepper is what sweeps the consecutive run of
/// nodes the wider strides skip over.
pub(crate) fn levels(count: usize) -> usize {
    (usize::BITS - count.leading_zeros()) as usize
}

/// A one-pass express-lane rebuild over a node chain. Advance it with
/// [`step`](Self::step); dropping it drains the remaining traversal and
/// parks every lane on the tail, so a finished *or* abandoned rebalancer
/// always leaves the cascade complete.
pub(crate) struct Rebalancer<T> {
    curr: NonNull<Node<T>>,
    index: usize,
    /// Min-heap by `target`.
    steppers: Vec<Stepper<T>>,
}

impl<T> Rebalancer<T> {
    /// Seeds the stepper heap: stepper `k` anchors at node `k` with
    /// stride `count >> k` and first target `k + stride`.
    ///
    /// # Safety
    ///
    /// `count` must be at least 2 and equal the number of nodes reachable
    /// from `head` along `next`. The first `levels(count) - 1` nodes must
    /// be initialized (their `next` pointers are read here); the rest
    /// only need initializing by the time the traversal reaches them.
    /// The chain must stay intact and unmoved until the rebalancer is
    /// dropped.
    pub unsafe fn new(head: NonNull<Node<T>>, count: usize) -> Self {
        debug_assert!(count >= 2);
        let levels = levels(count);

        let mut steppers = Vec::with_capacity(levels);
        let mut anchor = head;
        for k in 0..levels {
            let stride = count >> k;
            steppers.push(Stepper {
                target: k + stride,
                stride,
                from: anchor,
            });
            if k + 1 < levels {
                anchor = (*anchor.as_ptr()).next.expect("fewer nodes than cascade levels");
            }
        }

        // Anchored back to front the targets are non-decreasing, which is
        // already a valid min-heap.
        steppers.reverse();
        debug_assert!(steppers.windows(2).all(|w| w[0].target <= w[1].target));

        Rebalancer {
            curr: head,
            index: 0,
            steppers,
        }
    }

    /// Fires every stepper due at the current index, then advances one
    /// node. Returns `false` once the tail has been reached.
    ///
    /// # Safety
    ///
    /// The current node and its successor must be initialized.
    pub unsafe fn step(&mut self) -> bool {
        let Some(next) = (*self.curr.as_ptr()).next else {
            return false;
        };

        while self.steppers[0].target == self.index {
            let stepper = &mut self.steppers[0];
            ptr::addr_of_mut!((*stepper.from.as_ptr()).express).write(next);
            stepper.from = self.curr;
            stepper.target += stepper.stride;
            sift_down(&mut self.steppers);
        }

        self.curr = next;
        self.index += 1;
        true
    }
}

impl<T> Drop for Rebalancer<T> {
    fn drop(&mut self) {
        unsafe {
            while self.step() {}

            // Park every lane on the tail so each express chain ends
            // cleanly. The widest stepper never fires during the
            // traversal; this is also what keeps the head's express
            // pointer naming the tail.
            for stepper in &self.steppers {
                ptr::addr_of_mut!((*stepper.from.as_ptr()).express).write(self.curr);
            }
        }
    }
}

/// Restores the min-target heap property after the root's target grew.
fn sift_down<T>(heap: &mut [Stepper<T>]) {
    let mut parent = 0;
    loop {
        let left = 2 * parent + 1;
        let right = 2 * parent + 2;

        let mut smallest = parent;
        if left < heap.len() && heap[left].target < heap[smallest].target {
            smallest = left;
        }
        if right < heap.len() && heap[right].target < heap[smallest].target {
            smallest = right;
        }
        if smallest == parent {
            return;
        }

        heap.swap(parent, smallest);
        parent = smallest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn levels_bottom_out_at_stride_one() {
        assert_eq!(levels(2), 2);
        assert_eq!(levels(3), 2);
        assert_eq!(levels(4), 3);
        assert_eq!(levels(10), 4);
        assert_eq!(levels(16), 5);
        // The narrowest stride is always one.
        for count in 2usize..200 {
            assert_eq!(count >> (levels(count) - 1), 1);
        }
    }

    #[test]
    fn sift_down_restores_heap_order() {
        let stepper = |target| Stepper::<u32> {
            target,
            stride: 1,
            from: NonNull::dangling(),
        };

        let mut heap = vec![stepper(9), stepper(3), stepper(4), stepper(7)];
        sift_down(&mut heap);
        assert_eq!(heap[0].target, 3);

        heap[0].target = 8;
        sift_down(&mut heap);
        assert_eq!(heap[0].target, 4);
    }

    /// Links `count` nodes in place and runs a full rebalance, then
    /// checks that every non-tail express pointer was rewritten to land
    /// strictly ahead. The express pointers start out dangling, so a
    /// node the cascade failed to cover would be caught.
    fn rebuild_and_check(count: usize) {
        let mut nodes: Vec<Node<u32>> = (0..count)
            .map(|i| Node {
                next: None,
                express: NonNull::dangling(),
                value: i as u32,
            })
            .collect();
        let base = nodes.as_mut_ptr();
        let node_size = mem::size_of::<Node<u32>>();

        unsafe {
            for i in 0..count - 1 {
                (*base.add(i)).next = NonNull::new(base.add(i + 1));
            }

            let mut rebalancer = Rebalancer::new(NonNull::new(base).unwrap(), count);
            while rebalancer.step() {}
            drop(rebalancer);

            let addr_of = |i: usize| base.add(i) as usize;
            let express_of = |i: usize| (*base.add(i)).express.as_ptr() as usize;

            // The head's lane reaches the tail directly.
            assert_eq!(express_of(0), addr_of(count - 1));

            for i in 0..count - 1 {
                let addr = express_of(i);
                assert!(addr > addr_of(i), "lane at {i} does not move forward");
                assert!(addr <= addr_of(count - 1), "lane at {i} overshoots");
                assert_eq!((addr - addr_of(0)) % node_size, 0);
            }
        }
    }

    #[test]
    fn full_traversal_covers_every_lane() {
        rebuild_and_check(2);
        rebuild_and_check(3);
        rebuild_and_check(10);
        // Powers of two exercise the stride-one stepper's coverage of the
        // nodes the doubling strides skip.
        rebuild_and_check(16);
        rebuild_and_check(64);
        rebuild_and_check(100);
    }
}
