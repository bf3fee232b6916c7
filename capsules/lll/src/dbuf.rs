// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Two-slot PDU exchange between a thread-context producer and a
//! radio-context consumer.
//!
//! `first` is the slot the consumer is using; `last` is the slot most
//! recently published by the producer. The buffer is idle when they are
//! equal. Each slot holds a PDU handle (the head of a chain) and an
//! optional extra-data handle, both owned by the slot until the consumer
//! moves past it.
//!
//! Memory ordering contract:
//!
//! - The producer fills the reserved slot, then publishes it by storing
//!   `last` with `Release`. The consumer loads `last` with `Acquire` before
//!   touching the slot, so it never observes a half-written PDU.
//! - When a publication is still pending, `reserve` speculatively takes it
//!   back by marking `last` as revoked, then re-reads `first` behind a
//!   `SeqCst` fence. A revoked `last` is never consumed. If the consumer
//!   advanced before the mark landed, the slot it advanced to is now in
//!   use: the producer clears the mark and retries from the idle state,
//!   which hands out the other slot.
//! - `first` is only written by the consumer, `last` only by the producer.
//! - The consumer runs in an interrupt that preempts the producer on the
//!   same core, so a consumer poll never overlaps a producer step.
//!
//! There is no error for a full buffer. `reserve` returns `None` when no
//! PDU buffer is free; the caller decides whether to skip the update or,
//! in thread context only, retry with [`DoubleBuffer::reserve_wait`].

use core::sync::atomic::{fence, AtomicU8, Ordering};

use kernel::ErrorCode;

use crate::mem::{PduHandle, PduPool};
use crate::pdu::{HEADER_LEN, PAYLOAD_MAX, PDU_SIZE};

const NO_PDU: u8 = 0xFF;
const SLOTS: u8 = 2;
/// Set in `last` while the producer rewrites a pending slot.
const REVOKED: u8 = 0x80;

fn to_handle(raw: u8) -> Option<PduHandle> {
    (raw != NO_PDU).then_some(raw)
}

pub struct DoubleBuffer {
    first: AtomicU8,
    last: AtomicU8,
    pdu: [AtomicU8; SLOTS as usize],
    extra: [AtomicU8; SLOTS as usize],
}

impl DoubleBuffer {
    pub const fn new() -> DoubleBuffer {
        DoubleBuffer {
            first: AtomicU8::new(0),
            last: AtomicU8::new(0),
            pdu: [AtomicU8::new(NO_PDU), AtomicU8::new(NO_PDU)],
            extra: [AtomicU8::new(NO_PDU), AtomicU8::new(NO_PDU)],
        }
    }

    /// Reserve a slot for the producer. Returns the slot's PDU, allocating
    /// one from `pool` if the slot has none, and the slot index to pass to
    /// [`commit`](DoubleBuffer::commit).
    pub fn reserve(&self, pool: &PduPool) -> Option<(PduHandle, u8)> {
        let (handle, index, _) = self.reserve_slot(pool)?;
        Some((handle, index))
    }

    /// As [`reserve`](DoubleBuffer::reserve), also telling whether the slot
    /// was taken back from a pending publication.
    fn reserve_slot(&self, pool: &PduPool) -> Option<(PduHandle, u8, bool)> {
        let first = self.first.load(Ordering::Acquire);
        let last = self.last.load(Ordering::Relaxed) & !REVOKED;

        let (last, revoked) = if first == last {
            // Also drops the mark of an abandoned reservation.
            self.last.store(first, Ordering::Relaxed);
            ((first + 1) % SLOTS, false)
        } else {
            self.last.store(first | REVOKED, Ordering::Relaxed);
            fence(Ordering::SeqCst);
            let first_now = self.first.load(Ordering::Acquire);
            if first_now == first {
                (last, true)
            } else {
                // The consumer took the pending slot in the meantime.
                self.last.store(first_now, Ordering::Release);
                ((first_now + 1) % SLOTS, false)
            }
        };

        let slot = &self.pdu[last as usize];
        if let Some(handle) = to_handle(slot.load(Ordering::Relaxed)) {
            return Some((handle, last, revoked));
        }
        let handle = pool.alloc()?;
        slot.store(handle, Ordering::Relaxed);
        Some((handle, last, revoked))
    }

    /// Thread-context reserve that spins up to `retries` times for a free
    /// PDU buffer.
    pub fn reserve_wait(&self, pool: &PduPool, retries: usize) -> Option<(PduHandle, u8)> {
        for _ in 0..=retries {
            if let Some(reserved) = self.reserve(pool) {
                return Some(reserved);
            }
            core::hint::spin_loop();
        }
        None
    }

    /// Write `data` into a fresh slot and publish it. Thread context only.
    ///
    /// Each buffer of the slot's chain carries up to `chunk` bytes of `data`
    /// as its payload, behind a zeroed flags octet, ready to be framed into
    /// PDUs by the consumer.
    ///
    /// `NOMEM` if the chain does not fit in the pool. A PDU published
    /// earlier and still pending stays published, unchanged.
    pub fn publish(&self, pool: &PduPool, data: &[u8], chunk: usize) -> Result<(), ErrorCode> {
        let (head, index, revoked) = self.reserve_slot(pool).ok_or(ErrorCode::NOMEM)?;
        let chunk = chunk.clamp(1, PAYLOAD_MAX);
        let needed = data.len().div_ceil(chunk).max(1);
        // Only the consumer frees buffers meanwhile, so the count can only
        // grow once checked.
        if pool.chain_len(head) + pool.free_count() < needed {
            if revoked {
                self.last.store(index, Ordering::Release);
            }
            return Err(ErrorCode::NOMEM);
        }

        let mut chunks = data.chunks(chunk);
        let mut cur = head;
        write_chunk(pool, cur, chunks.next().unwrap_or(&[]));
        for part in chunks {
            cur = pool.chain_extend(cur).ok_or(ErrorCode::NOMEM)?;
            write_chunk(pool, cur, part);
        }
        // a rewritten pending slot may have held a longer chain
        if let Some(last) = pool.get(cur) {
            if let Some(stale) = last.next() {
                last.set_next(None);
                pool.release_chain(stale);
            }
        }
        self.commit(index);
        Ok(())
    }

    /// Attach `extra` to a reserved slot, returning the handle it replaces.
    pub fn set_extra(&self, index: u8, extra: Option<PduHandle>) -> Option<PduHandle> {
        let raw = extra.unwrap_or(NO_PDU);
        to_handle(self.extra[(index % SLOTS) as usize].swap(raw, Ordering::Relaxed))
    }

    /// Publish a reserved slot.
    pub fn commit(&self, index: u8) {
        self.last.store(index % SLOTS, Ordering::Release);
    }

    /// Radio-context poll for the newest published PDU. Releases the
    /// buffers of the slot being left to `pool` and reports whether the
    /// consumer moved to a new slot.
    pub fn consume_latest(&self, pool: &PduPool) -> (Option<PduHandle>, bool) {
        let mut first = self.first.load(Ordering::Relaxed);
        let advanced = self.published(first);
        if advanced {
            let old = first as usize;
            for slot in [&self.pdu[old], &self.extra[old]] {
                if let Some(head) = to_handle(slot.swap(NO_PDU, Ordering::Relaxed)) {
                    pool.release_chain(head);
                }
            }
            first = (first + 1) % SLOTS;
            self.first.store(first, Ordering::Release);
        }
        (to_handle(self.pdu[first as usize].load(Ordering::Relaxed)), advanced)
    }

    /// The consumer's current PDU.
    pub fn peek_current(&self) -> Option<PduHandle> {
        let first = self.first.load(Ordering::Acquire);
        to_handle(self.pdu[first as usize].load(Ordering::Relaxed))
    }

    /// The consumer's current extra data.
    pub fn peek_current_extra(&self) -> Option<PduHandle> {
        let first = self.first.load(Ordering::Acquire);
        to_handle(self.extra[first as usize].load(Ordering::Relaxed))
    }

    /// The most recently published PDU, as seen by the producer.
    pub fn peek_last(&self) -> Option<PduHandle> {
        let last = self.last.load(Ordering::Acquire) & !REVOKED;
        to_handle(self.pdu[last as usize].load(Ordering::Relaxed))
    }

    /// Whether a published slot has not been consumed yet.
    pub fn is_pending(&self) -> bool {
        self.published(self.first.load(Ordering::Acquire))
    }

    fn published(&self, first: u8) -> bool {
        let last = self.last.load(Ordering::Acquire);
        last & REVOKED == 0 && last != first
    }

    /// Drop both slots, returning their buffers to `pool`. Only valid once
    /// neither side uses the buffer anymore.
    pub fn release_all(&self, pool: &PduPool) {
        for slot in self.pdu.iter().chain(self.extra.iter()) {
            if let Some(head) = to_handle(slot.swap(NO_PDU, Ordering::Relaxed)) {
                pool.release_chain(head);
            }
        }
        self.first.store(0, Ordering::Relaxed);
        self.last.store(0, Ordering::Release);
    }
}

fn write_chunk(pool: &PduPool, handle: PduHandle, part: &[u8]) {
    let mut out = [0; PDU_SIZE];
    out[1] = part.len() as u8;
    out[HEADER_LEN..HEADER_LEN + part.len()].copy_from_slice(part);
    if let Some(buf) = pool.get(handle) {
        buf.write(&out[..HEADER_LEN + part.len()]);
    }
}

impl Default for DoubleBuffer {
    fn default() -> Self {
        Self::new()
    }
}
