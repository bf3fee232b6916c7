// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interface for queues shared between execution contexts.
//!
//! Implementations are single-producer/single-consumer: one context only
//! calls `enqueue`, one context only calls `dequeue`, `peek` and `empty`.
//! The query functions may be called from either side and return a
//! snapshot that may be stale by the time the caller acts on it, but never
//! in the unsafe direction: the producer never sees more free space than
//! there is, and the consumer never sees more elements than were published.

pub trait SyncQueue<T>: Sync + Send {
    /// Returns true if there are any items in the queue, false otherwise.
    fn has_elements(&self) -> bool;

    /// Returns true if the queue is full, false otherwise.
    fn is_full(&self) -> bool;

    /// Returns how many elements are in the queue.
    fn len(&self) -> usize;

    /// If the queue isn't full, add a new element to the back of the queue.
    /// Returns whether the element was added.
    fn enqueue(&self, val: T) -> bool;

    /// Return a copy of the element at the front of the queue without
    /// removing it.
    fn peek(&self) -> Option<T>;

    /// Remove the element from the front of the queue.
    fn dequeue(&self) -> Option<T>;

    /// Remove all elements from the queue. Consumer side only.
    fn empty(&self);
}
