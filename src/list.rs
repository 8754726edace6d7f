//! The power list. See [`PowerList`].

use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use crate::balance::{self, Rebalancer};
use crate::iter::{Iter, RebalancingIter};
use crate::node::Node;
use crate::scatter::ScatterAllocator;
use crate::{span, Pointer};

/// An ordered, sorted, singly linked list with an express lane: every
/// node carries a second forward pointer, and together they form a
/// geometric cascade that lets a search skip over runs of nodes:
///
/// ```text
///        +--------------------------------------+  head -> tail
///        |         +------------+               |
///        |         |            v               v
///      +---+     +---+     +---+     +---+     +---+
///      | 1 | --> | 3 | --> | 4 | --> | 7 | --> | 9 |
///      +---+     +---+     +---+     +---+     +---+
///                  |         |         ^ |       ^
///                  |         +---------+ +-------+
///                  +-------------------------------  (stale until the
///                                                     next rebalance)
/// ```
///
/// The lane is maintained lazily. `insert` and `remove` splice on the
/// `next` chain and merely mark the lanes stale; searches then degrade
/// to a linear walk until the lanes are rebuilt, either explicitly with
/// [`rebalance`](Self::rebalance) or amortized over a pass of
/// [`iter_rebalancing`](Self::iter_rebalancing). With the lanes intact,
/// [`find`](Self::find) and [`lower_bound`](Self::lower_bound) run in
/// O(log n).
///
/// Two conventions make the boundaries cheap: the head's express pointer
/// always names the tail (so [`back`](Self::back) is O(1), with no
/// separate tail field), and the tail's names itself.
///
/// Node storage comes from a [`ScatterAllocator`]; erased nodes go back
/// to its free list and their slots are reused by later inserts. The
/// list owns its nodes exclusively and is not thread safe under
/// mutation.
pub struct PowerList<T: Ord> {
    head: Pointer<Node<T>>,
    /// Element count in the upper bits, the lanes-stale flag in bit 0.
    state: usize,
    alloc: ScatterAllocator<Node<T>>,
    marker: PhantomData<Box<Node<T>>>,
}

/// A search result: the located node and its in-order predecessor,
/// enough to splice in O(1).
struct Cursor<T> {
    curr: Pointer<Node<T>>,
    prev: Pointer<Node<T>>,
}

impl<T> Cursor<T> {
    fn end() -> Self {
        Cursor {
            curr: None,
            prev: None,
        }
    }
}

impl<T: Ord> PowerList<T> {
    /// Creates an empty list. No allocation happens until the first
    /// insertion.
    pub const fn new() -> Self {
        PowerList {
            head: None,
            state: 0,
            alloc: ScatterAllocator::new(),
            marker: PhantomData,
        }
    }

    /// Builds a list from a sorted range of known size, fully balanced.
    pub fn from_sorted<I>(range: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let mut list = PowerList::new();
        list.assign_range(range);
        list
    }

    pub fn len(&self) -> usize {
        self.state >> 1
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// First (smallest) value.
    pub fn front(&self) -> Option<&T> {
        self.head.map(|node| unsafe { &(*node.as_ptr()).value })
    }

    /// Last (largest) value, in O(1) through the head's express pointer.
    pub fn back(&self) -> Option<&T> {
        self.head.map(|head| unsafe {
            let tail = (*head.as_ptr()).express;
            &(*tail.as_ptr()).value
        })
    }

    pub fn contains(&self, value: &T) -> bool {
        self.find_raw(value).curr.is_some()
    }

    /// First element equal to `value`, if any.
    pub fn find(&self, value: &T) -> Option<&T> {
        self.find_raw(value)
            .curr
            .map(|node| unsafe { &(*node.as_ptr()).value })
    }

    /// First element `>= value`, if any.
    pub fn lower_bound(&self, value: &T) -> Option<&T> {
        self.lower_bound_raw(value)
            .curr
            .map(|node| unsafe { &(*node.as_ptr()).value })
    }

    /// Inserts `value`, keeping the sequence sorted. Equal values are
    /// kept: a duplicate lands in front of the run of its equals. Marks
    /// the express lanes stale.
    pub fn insert(&mut self, value: T) {
        // Allocate up front so the links are never left half spliced.
        let slot = self.alloc.allocate_one();

        unsafe {
            if let Some(head) = self.head {
                if value <= (*head.as_ptr()).value {
                    // New head. It inherits the old head's tail link.
                    slot.as_ptr().write(Node {
                        next: Some(head),
                        express: (*head.as_ptr()).express,
                        value,
                    });
                    self.head = Some(slot);
                } else {
                    let tail = (*head.as_ptr()).express;
                    if (*tail.as_ptr()).value < value {
                        // New tail. The old tail gains a lane to it and
                        // the head's tail link moves along.
                        slot.as_ptr().write(Node {
                            next: None,
                            express: slot,
                            value,
                        });
                        (*tail.as_ptr()).next = Some(slot);
                        (*tail.as_ptr()).express = slot;
                        (*head.as_ptr()).express = slot;
                    } else {
                        // Interior. The lane it copies may be stale;
                        // that is fine, it is not read until rebuilt.
                        let cursor = self.lower_bound_raw(&value);
                        let curr = cursor.curr.expect("interior insert lost its position");
                        let prev = cursor.prev.expect("interior insert lost its predecessor");
                        slot.as_ptr().write(Node {
                            next: Some(curr),
                            express: (*curr.as_ptr()).express,
                            value,
                        });
                        (*prev.as_ptr()).next = Some(slot);
                    }
                }
            } else {
                slot.as_ptr().write(Node {
                    next: None,
                    express: slot,
                    value,
                });
                self.head = Some(slot);
            }
        }

        self.set_len(self.len() + 1);
        self.set_needs_rebalance(true);
    }

    /// Removes at most one element equal to `value`. Returns whether one
    /// was removed.
    pub fn remove(&mut self, value: &T) -> bool {
        let cursor = self.find_raw(value);
        self.erase(cursor)
    }

    /// Drops every node and releases all node storage.
    pub fn clear(&mut self) {
        let mut next = self.head.take();
        while let Some(node) = next {
            unsafe {
                next = (*node.as_ptr()).next;
                ptr::drop_in_place(node.as_ptr());
            }
        }

        self.alloc.reset();
        self.state = 0;
    }

    /// Rebuilds every express lane in one pass. Idempotent; afterwards
    /// searches are logarithmic again.
    pub fn rebalance(&mut self) {
        if !self.needs_rebalance() {
            return;
        }

        if let Some(head) = self.head {
            if self.len() >= 2 {
                log::trace!("rebalancing {} nodes", self.len());
                unsafe {
                    let mut rebalancer = Rebalancer::new(head, self.len());
                    while rebalancer.step() {}
                    // Dropping it parks the remaining lanes on the tail.
                }
            }
        }

        self.set_needs_rebalance(false);
    }

    /// Replaces the contents with a sorted range of known size.
    ///
    /// The nodes are bulk-allocated in one request (which may deliver
    /// several spans; the list is relinked by index, so construction
    /// order only has to match delivery order). The first few nodes seed
    /// the rebalance cascade's anchors and the rest are constructed
    /// under a coincident rebalance traversal, one step per node, so the
    /// finished list is fully balanced.
    ///
    /// Unsorted input fails a debug assertion.
    pub fn assign_range<I>(&mut self, range: I)
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        self.clear();

        let mut values = range.into_iter();
        let count = values.len();
        if count == 0 {
            return;
        }

        let spans = self.alloc.allocate(count);
        log::debug!("assigning {count} nodes across {} spans", spans.len());

        let slots: Vec<NonNull<Node<T>>> = spans
            .iter()
            .flat_map(|&s| (0..s.len()).map(move |i| unsafe { span::element(s, i) }))
            .collect();
        debug_assert_eq!(slots.len(), count);

        // Nodes start out pointing at their successor on both links; the
        // tail closes the chain with a self express pointer.
        let write = |index: usize, value: T| unsafe {
            let slot = slots[index];
            let (next, express) = match slots.get(index + 1) {
                Some(&successor) => (Some(successor), successor),
                None => (None, slot),
            };
            slot.as_ptr().write(Node {
                next,
                express,
                value,
            });
            debug_assert!(
                index == 0 || (*slots[index - 1].as_ptr()).value <= (*slot.as_ptr()).value,
                "assign_range requires sorted input"
            );
        };

        // The cascade's anchors must exist before the rebalancer reads
        // them to seed itself.
        let anchors = balance::levels(count).min(count - 1);
        let mut index = 0;
        while index < anchors {
            write(index, values.next().expect("sized range ended early"));
            index += 1;
        }

        let mut rebalancer = if count >= 2 {
            Some(unsafe { Rebalancer::new(slots[0], count) })
        } else {
            None
        };

        while index < count - 1 {
            write(index, values.next().expect("sized range ended early"));
            if let Some(rebalancer) = rebalancer.as_mut() {
                unsafe { rebalancer.step() };
            }
            index += 1;
        }

        write(index, values.next().expect("sized range ended early"));
        debug_assert!(values.next().is_none(), "sized range longer than its length");

        // Finishes the traversal over the now-complete chain.
        drop(rebalancer);

        self.head = Some(slots[0]);
        self.state = count << 1;
    }

    /// Read-only iteration in sorted order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter::new(self.head, self.len())
    }

    /// Iteration that repairs the express lanes as it walks: each
    /// advance performs one rebalance step, and dropping the iterator
    /// finishes the traversal and clears the pending-rebalance state.
    /// Exclusive because lane pointers are rewritten in place.
    pub fn iter_rebalancing(&mut self) -> RebalancingIter<'_, T> {
        RebalancingIter::new(self)
    }

    /// Core descent shared by `find` and `lower_bound`: locates the
    /// first node whose value is `>= target`, together with its in-order
    /// predecessor.
    ///
    /// With the lanes intact the walk hops a lane whenever the landing
    /// value still lies below `target`, falling back to successor steps
    /// near the goal. While a rebalance is pending, lane pointers may
    /// reference erased nodes, so the walk stays on the `next` chain
    /// entirely; same result, linear time.
    fn lower_bound_raw(&self, target: &T) -> Cursor<T> {
        let Some(head) = self.head else {
            return Cursor::end();
        };

        unsafe {
            if *target <= (*head.as_ptr()).value {
                return Cursor {
                    curr: Some(head),
                    prev: None,
                };
            }
            let tail = (*head.as_ptr()).express;
            if *target > (*tail.as_ptr()).value {
                return Cursor::end();
            }

            let lanes = !self.needs_rebalance();
            let mut prev = None;
            let mut curr = head;
            while *target > (*curr.as_ptr()).value {
                prev = Some(curr);
                let express = (*curr.as_ptr()).express;
                curr = if lanes && *target > (*express.as_ptr()).value {
                    express
                } else {
                    // Never the tail here: the bounds checks above keep
                    // the walk strictly before the first value >= target.
                    (*curr.as_ptr()).next.expect("in-bounds search ran off the tail")
                };
            }

            // The final hop is always a successor step, so `prev` is
            // adjacent and splicing at the cursor is O(1).
            Cursor {
                curr: Some(curr),
                prev,
            }
        }
    }

    fn find_raw(&self, target: &T) -> Cursor<T> {
        let cursor = self.lower_bound_raw(target);
        match cursor.curr {
            Some(node) if unsafe { &(*node.as_ptr()).value } == target => cursor,
            _ => Cursor::end(),
        }
    }

    /// Unlinks and destroys the node under `cursor`. No-op on an end
    /// cursor.
    fn erase(&mut self, cursor: Cursor<T>) -> bool {
        let Some(curr) = cursor.curr else {
            return false;
        };

        unsafe {
            let next = (*curr.as_ptr()).next;
            match cursor.prev {
                None => {
                    // Head removal: the successor inherits the tail link.
                    if let Some(successor) = next {
                        (*successor.as_ptr()).express = (*curr.as_ptr()).express;
                    }
                    self.head = next;
                }
                Some(prev) => {
                    if next.is_none() {
                        // Tail removal: the predecessor becomes the tail
                        // and the head's tail link follows.
                        let head = self.head.expect("tail erase on a headless list");
                        (*head.as_ptr()).express = prev;
                        (*prev.as_ptr()).express = prev;
                        (*prev.as_ptr()).next = None;
                    } else {
                        (*prev.as_ptr()).next = next;
                    }
                }
            }

            ptr::drop_in_place(curr.as_ptr());
            self.alloc.deallocate(span::singleton(curr));
        }

        self.set_len(self.len() - 1);
        self.set_needs_rebalance(true);
        true
    }

    pub(crate) fn head(&self) -> Pointer<Node<T>> {
        self.head
    }

    pub(crate) fn needs_rebalance(&self) -> bool {
        self.state & 1 == 1
    }

    pub(crate) fn set_needs_rebalance(&mut self, stale: bool) {
        self.state = (self.state & !1) | usize::from(stale);
    }

    fn set_len(&mut self, len: usize) {
        debug_assert!(len <= usize::MAX >> 1);
        self.state = (len << 1) | (self.state & 1);
    }
}

impl<T: Ord> Default for PowerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> Drop for PowerList<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: Ord + Clone> Clone for PowerList<T> {
    fn clone(&self) -> Self {
        let mut list = PowerList::new();
        list.assign_range(self.iter().cloned());
        list
    }
}

impl<T: Ord> PartialEq for PowerList<T> {
    /// Structural differences between express lanes are immaterial; two
    /// lists are equal when their sequences are.
    fn eq(&self, other: &Self) -> bool {
        if self.head == other.head {
            return true; // same nodes, or both empty
        }
        if self.len() != other.len() {
            return false;
        }
        // Cheap mismatches first: the ends are O(1).
        if self.front() != other.front() || self.back() != other.back() {
            return false;
        }
        self.iter().eq(other.iter())
    }
}

impl<T: Ord> Eq for PowerList<T> {}

impl<T: Ord + fmt::Debug> fmt::Debug for PowerList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

// The list exclusively owns its nodes, and `&self` methods only read.
unsafe impl<T: Ord + Send> Send for PowerList<T> {}
unsafe impl<T: Ord + Sync> Sync for PowerList<T> {}

#[cfg(test)]
impl<T: Ord> PowerList<T> {
    /// Walks the whole structure and checks every invariant it can.
    pub(crate) fn check_invariants(&self) {
        use std::collections::HashMap;

        let Some(head) = self.head else {
            assert_eq!(self.len(), 0);
            return;
        };

        unsafe {
            let mut nodes = Vec::new();
            let mut walk = Some(head);
            while let Some(node) = walk {
                nodes.push(node);
                walk = (*node.as_ptr()).next;
            }
            assert_eq!(nodes.len(), self.len(), "count does not match the chain");

            for pair in nodes.windows(2) {
                assert!(
                    (*pair[0].as_ptr()).value <= (*pair[1].as_ptr()).value,
                    "sequence out of order"
                );
            }

            let tail = *nodes.last().unwrap();
            assert_eq!(
                (*head.as_ptr()).express,
                tail,
                "head express pointer must name the tail"
            );

            if !self.needs_rebalance() {
                // Balanced: every non-tail lane lands strictly ahead.
                let position: HashMap<NonNull<Node<T>>, usize> =
                    nodes.iter().copied().zip(0..).collect();
                for (index, node) in nodes.iter().enumerate().take(nodes.len() - 1) {
                    let lane = position
                        .get(&(*node.as_ptr()).express)
                        .copied()
                        .expect("lane points outside the list");
                    assert!(lane > index, "lane at {index} does not move forward");
                }
            }
        }
    }
}
