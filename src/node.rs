use std::ptr::NonNull;

use crate::Pointer;

/// Power list node. Ownership flows along `next` only; `express` is a
/// non-owning forward jump.
pub(crate) struct Node<T> {
    /// In-order successor. `None` marks the tail.
    pub next: Pointer<Node<T>>,
    /// Express-lane pointer. On the head it names the tail (the head
    /// itself in a one-element list), on the tail itself, anywhere else a
    /// node further along the sequence. Never null, though it may be
    /// stale while a rebalance is pending.
    pub express: NonNull<Node<T>>,
    pub value: T,
}
