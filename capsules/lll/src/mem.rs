// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! PDU buffer arena.
//!
//! PDU buffers live in a board-allocated static array and are addressed by
//! [`PduHandle`] indices, so ownership moves between contexts by moving a
//! `u8`. Free buffers sit in a single-producer/single-consumer free-list:
//!
//! - `alloc` dequeues and is only called from thread context,
//! - `release` enqueues and is only called from the radio context.
//!
//! Buffers may be linked through `next` to form a chain of auxiliary PDUs.
//! How many chain members go on air is decided by the PDU contents (the
//! AuxPtr of each member); `next` only tracks which buffers belong to the
//! chain so they are released together.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! let bufs: &'static [PduBuf; 8] = /* board static */;
//! let free: &'static mut [PduHandle; 9] = /* board static */;
//! let pool = PduPool::new(bufs, free);
//! ```

use core::cell::Cell;

use kernel::collections::atomic_ring_buffer::AtomicRingBuffer;
use kernel::collections::sync_queue::SyncQueue;

use kernel::config::CONFIG;
use kernel::debug;

use crate::pdu::{self, PDU_SIZE};

pub type PduHandle = u8;

/// One PDU: header, length and payload, as exchanged with the radio.
pub struct PduBuf {
    data: Cell<[u8; PDU_SIZE]>,
    next: Cell<Option<PduHandle>>,
}

impl PduBuf {
    pub const fn new() -> PduBuf {
        PduBuf {
            data: Cell::new([0; PDU_SIZE]),
            next: Cell::new(None),
        }
    }

    fn cells(&self) -> &[Cell<u8>] {
        let data: &Cell<[u8]> = &self.data;
        data.as_slice_of_cells()
    }

    /// Replace the contents with `pdu`, truncated to the buffer size. A
    /// `pdu` shorter than a header leaves an empty PDU.
    pub fn write(&self, pdu: &[u8]) {
        let cells = self.cells();
        for (cell, byte) in cells.iter().zip(pdu.iter()) {
            cell.set(*byte);
        }
        for cell in cells.iter().take(pdu::HEADER_LEN).skip(pdu.len()) {
            cell.set(0);
        }
    }

    /// Copy the PDU (header and payload) into `out`, returning its length.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let len = self.len().min(out.len());
        for (byte, cell) in out[..len].iter_mut().zip(self.cells()) {
            *byte = cell.get();
        }
        len
    }

    /// Header plus payload length.
    pub fn len(&self) -> usize {
        pdu::HEADER_LEN + self.byte(1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.byte(1) == 0
    }

    pub fn byte(&self, index: usize) -> u8 {
        self.cells().get(index).map_or(0, |c| c.get())
    }

    pub fn set_byte(&self, index: usize, value: u8) {
        if let Some(c) = self.cells().get(index) {
            c.set(value);
        }
    }

    pub fn next(&self) -> Option<PduHandle> {
        self.next.get()
    }

    pub fn set_next(&self, next: Option<PduHandle>) {
        self.next.set(next);
    }
}

impl Default for PduBuf {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PduPool<'a> {
    bufs: &'a [PduBuf],
    free: AtomicRingBuffer<'a, PduHandle>,
}

impl<'a> PduPool<'a> {
    /// Create a pool over `bufs` with every buffer free. `free_ring` should
    /// be one element longer than `bufs`; buffers it has no room for are
    /// left out of the pool.
    pub fn new(bufs: &'a [PduBuf], free_ring: &'a mut [PduHandle]) -> PduPool<'a> {
        let free = AtomicRingBuffer::new(free_ring);
        let bufs = &bufs[..bufs.len().min(free.capacity())];
        for handle in 0..bufs.len() {
            free.enqueue(handle as PduHandle);
        }
        PduPool { bufs, free }
    }

    pub fn get(&self, handle: PduHandle) -> Option<&PduBuf> {
        self.bufs.get(handle as usize)
    }

    /// Take a free buffer. Thread context only.
    pub fn alloc(&self) -> Option<PduHandle> {
        let handle = self.free.dequeue()?;
        if let Some(buf) = self.get(handle) {
            buf.set_next(None);
        }
        Some(handle)
    }

    /// Return a buffer to the free-list. Radio context only.
    ///
    /// The free-list has room for every buffer of the pool, so it can only
    /// be full when `handle` is already free.
    pub fn release(&self, handle: PduHandle) {
        if self.get(handle).is_none() {
            return;
        }
        if !self.free.enqueue(handle) && CONFIG.trace_radio_events {
            debug!("pdu: {} released twice", handle);
        }
    }

    /// Release `head` and every buffer linked after it.
    pub fn release_chain(&self, head: PduHandle) {
        let mut cur = Some(head);
        while let Some(handle) = cur {
            cur = self.get(handle).and_then(|b| b.next());
            self.release(handle);
        }
    }

    /// Number of buffers in the chain starting at `head`.
    pub fn chain_len(&self, head: PduHandle) -> usize {
        let mut len = 0;
        let mut cur = self.get(head).map(|_| head);
        // a chain never holds more buffers than the pool
        while let Some(handle) = cur.filter(|_| len < self.bufs.len()) {
            len += 1;
            cur = self.get(handle).and_then(|b| b.next());
        }
        len
    }

    /// The chain member after `prev`, reusing an already linked buffer or
    /// allocating and linking a fresh one. Thread context only.
    pub fn chain_extend(&self, prev: PduHandle) -> Option<PduHandle> {
        let prev_buf = self.get(prev)?;
        if let Some(next) = prev_buf.next() {
            return Some(next);
        }
        let next = self.alloc()?;
        prev_buf.set_next(Some(next));
        Some(next)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// Small FIFO of PDU handles owned by one role, such as a connection's
/// transmit queue. Holds up to `N - 1` handles.
pub struct PduFifo<const N: usize> {
    ring: [PduHandle; N],
    head: usize,
    tail: usize,
}

impl<const N: usize> PduFifo<N> {
    pub const fn new() -> PduFifo<N> {
        PduFifo {
            ring: [0; N],
            head: 0,
            tail: 0,
        }
    }

    pub fn len(&self) -> usize {
        (self.tail + N - self.head) % N
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        (self.tail + 1) % N == self.head
    }

    pub fn push(&mut self, handle: PduHandle) -> bool {
        if N == 0 || self.is_full() {
            return false;
        }
        self.ring[self.tail] = handle;
        self.tail = (self.tail + 1) % N;
        true
    }

    pub fn peek(&self) -> Option<PduHandle> {
        (!self.is_empty()).then(|| self.ring[self.head])
    }

    /// The handle `index` places behind the head.
    pub fn get(&self, index: usize) -> Option<PduHandle> {
        (index < self.len()).then(|| self.ring[(self.head + index) % N])
    }

    pub fn pop(&mut self) -> Option<PduHandle> {
        let handle = self.peek()?;
        self.head = (self.head + 1) % N;
        Some(handle)
    }

    /// Return every queued buffer to `pool`.
    pub fn release_all(&mut self, pool: &PduPool) {
        while let Some(handle) = self.pop() {
            pool.release_chain(handle);
        }
    }
}

impl<const N: usize> Default for PduFifo<N> {
    fn default() -> Self {
        Self::new()
    }
}
