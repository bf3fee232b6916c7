// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Lock-free single-producer/single-consumer ring buffer.
//!
//! Used for every free-list and hand-off queue between the radio context and
//! the background context: PDU buffer free-lists, rx node free-lists, the rx
//! queue towards the host, and the done queue.
//!
//! The producer owns `tail` and the slot it points at; the consumer owns
//! `head`. A slot is written before `tail` is published with `Release`, and
//! the consumer reads it only after observing that `tail` with `Acquire`.
//! One slot is always kept free to tell "full" from "empty", so a backing
//! buffer of length `n` holds at most `n - 1` elements.

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::collections::sync_queue::SyncQueue;

pub struct AtomicRingBuffer<'a, T: Copy> {
    ring: &'a [Cell<T>],
    head: AtomicUsize,
    tail: AtomicUsize,
}

// Safety: a slot is only written by the producer while it is outside the
// `head..tail` window, and only read by the consumer while inside it. The
// index handoff through `head`/`tail` orders those accesses.
unsafe impl<T: Copy + Send> Send for AtomicRingBuffer<'_, T> {}
unsafe impl<T: Copy + Send> Sync for AtomicRingBuffer<'_, T> {}

impl<'a, T: Copy> AtomicRingBuffer<'a, T> {
    pub fn new(ring: &'a mut [T]) -> AtomicRingBuffer<'a, T> {
        AtomicRingBuffer {
            ring: Cell::from_mut(ring).as_slice_of_cells(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Number of elements the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.ring.len().saturating_sub(1)
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.ring.len()
    }
}

impl<T: Copy + Send> SyncQueue<T> for AtomicRingBuffer<'_, T> {
    fn has_elements(&self) -> bool {
        self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Acquire)
    }

    fn is_full(&self) -> bool {
        if self.ring.len() < 2 {
            return true;
        }
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        self.next(tail) == head
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if tail >= head {
            tail - head
        } else {
            (self.ring.len() - head) + tail
        }
    }

    fn enqueue(&self, val: T) -> bool {
        if self.is_full() {
            return false;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        self.ring[tail].set(val);
        self.tail.store(self.next(tail), Ordering::Release);
        true
    }

    fn peek(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            None
        } else {
            Some(self.ring[head].get())
        }
    }

    fn dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let val = self.ring[head].get();
        self.head.store(self.next(head), Ordering::Release);
        Some(val)
    }

    fn empty(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        self.head.store(tail, Ordering::Release);
    }
}
