//! Raw storage pools. A pool is one contiguous block of uninitialized
//! `T` slots; pools chain newest-first and are only ever released when
//! the owning allocator goes away.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::mem;
use std::ptr::NonNull;

use crate::{span, Span};

pub(crate) struct Pool<T> {
    /// How many prefix slots have ever been handed out. The range
    /// `watermark..capacity` is fresh, untouched storage.
    watermark: usize,
    data: NonNull<T>,
    capacity: usize,
    next: Option<Box<Pool<T>>>,
}

impl<T> Pool<T> {
    /// Allocates a pool of `capacity` slots in front of `next`.
    /// Out-of-memory diverges through [`handle_alloc_error`].
    pub fn new(capacity: usize, next: Option<Box<Pool<T>>>) -> Box<Pool<T>> {
        assert!(mem::size_of::<T>() != 0, "zero-sized elements need no storage");
        debug_assert!(capacity > 0);

        let layout = Layout::array::<T>(capacity).expect("pool capacity overflows a Layout");
        let Some(data) = NonNull::new(unsafe { alloc(layout) }) else {
            handle_alloc_error(layout);
        };

        Box::new(Pool {
            watermark: 0,
            data: data.cast::<T>(),
            capacity,
            next,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fresh slots remaining above the watermark.
    pub fn fresh(&self) -> usize {
        self.capacity - self.watermark
    }

    /// Hands out up to `want` fresh slots, advancing the watermark.
    /// Returns `None` when the pool is exhausted (or `want` is zero).
    pub fn take_fresh(&mut self, want: usize) -> Option<Span<T>> {
        let taken = want.min(self.fresh());
        if taken == 0 {
            return None;
        }

        let data = unsafe { NonNull::new_unchecked(self.data.as_ptr().add(self.watermark)) };
        self.watermark += taken;

        Some(span::from_raw_parts(data, taken))
    }

    /// The whole data region, handed out or not.
    pub fn region(&self) -> Span<T> {
        span::from_raw_parts(self.data, self.capacity)
    }

    pub fn next(&self) -> Option<&Pool<T>> {
        self.next.as_deref()
    }

    pub fn next_mut(&mut self) -> Option<&mut Pool<T>> {
        self.next.as_deref_mut()
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        let layout = Layout::array::<T>(self.capacity).unwrap();
        unsafe { dealloc(self.data.as_ptr().cast(), layout) };
    }
}
