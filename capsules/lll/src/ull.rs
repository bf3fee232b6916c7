// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Interface to the upper layer.
//!
//! The radio context reports received PDUs and event outcomes through two
//! narrow traits:
//!
//! - [`RxAlloc`] hands out receive nodes. Roles check availability with
//!   `alloc_peek` before committing to a reception and degrade (skip the
//!   reception, NACK, or flag a report incomplete) when nodes run out.
//! - [`RxSink`] takes filled nodes and [`Done`] records.
//!
//! [`RxPool`] implements both over a static node arena. Enqueued items are
//! handed to the background context with a deferred call, which passes them
//! to the registered [`RxClient`] in order and recycles the nodes.
//!
//! ```text
//!   radio context                   background context
//!   -------------                   ------------------
//!   alloc() <------- free ring <--- recycle
//!   enqueue/done --> rx ring ------> RxClient::rx / RxClient::done
//! ```

use core::cell::Cell;

use kernel::collections::atomic_ring_buffer::AtomicRingBuffer;
use kernel::collections::sync_queue::SyncQueue;
use kernel::deferred_call::{DeferredCall, DeferredCallClient};
use kernel::utilities::cells::OptionalCell;

use crate::done::Done;
use crate::mem::PduBuf;

pub type RxHandle = u8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RxKind {
    /// Legacy or extended advertising report; the PDU is the received PDU.
    AdvReport,
    /// A scan request addressed to one of our advertisers.
    ScanReqReport,
    /// Connection established; the PDU is the CONNECT_IND.
    ConnComplete,
    /// Channel selection algorithm of a new connection in `param`.
    ChanSelAlgo,
    Data,
    /// Connection ended with reason `param`.
    Terminate,
    PeriodicReport,
    /// Periodic sync acquired; the PDU is the first AUX_SYNC_IND.
    SyncEstablished,
    SyncLost,
    /// One ISO payload of stream `param`; `counter` is the payload number.
    IsoPdu,
    /// BIG sync lost, reason in `param`.
    BigSyncLost,
    /// BIG ended by the broadcaster, reason in `param`.
    BigTerminate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RxStatus {
    Complete,
    /// More data was on air but could not be received or stored.
    Incomplete,
    /// An expected ISO payload was not received.
    Invalid,
}

/// Metadata of a receive node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RxMeta {
    pub kind: RxKind,
    /// Role slot the node belongs to.
    pub handle: u8,
    pub status: RxStatus,
    /// RSSI magnitude in dBm, 0x7F when not available.
    pub rssi: u8,
    /// Event counter, or payload number for ISO.
    pub counter: u64,
    pub param: u8,
    /// Ticker tick the radio timer of the event was started from.
    pub ticks: u32,
    /// Start of the PDU on air, in microseconds after `ticks`.
    pub offset_us: u32,
}

pub const RSSI_NOT_AVAILABLE: u8 = 0x7F;

impl RxMeta {
    pub fn new(kind: RxKind, handle: u8) -> RxMeta {
        RxMeta {
            kind,
            handle,
            status: RxStatus::Complete,
            rssi: RSSI_NOT_AVAILABLE,
            counter: 0,
            param: 0,
            ticks: 0,
            offset_us: 0,
        }
    }
}

pub struct RxNode {
    meta: Cell<RxMeta>,
    pdu: PduBuf,
    has_pdu: Cell<bool>,
}

impl RxNode {
    pub const fn new() -> RxNode {
        RxNode {
            meta: Cell::new(RxMeta {
                kind: RxKind::Data,
                handle: 0,
                status: RxStatus::Complete,
                rssi: RSSI_NOT_AVAILABLE,
                counter: 0,
                param: 0,
                ticks: 0,
                offset_us: 0,
            }),
            pdu: PduBuf::new(),
            has_pdu: Cell::new(false),
        }
    }

    pub fn meta(&self) -> RxMeta {
        self.meta.get()
    }

    pub fn set_meta(&self, meta: RxMeta) {
        self.meta.set(meta);
    }

    /// The PDU of the record, `None` for records that carry none such as
    /// terminations or payloads that were never received.
    pub fn pdu(&self) -> Option<&PduBuf> {
        self.has_pdu.get().then_some(&self.pdu)
    }

    /// Store `pdu` in the node. An empty `pdu` leaves the node without one.
    pub fn set_pdu(&self, pdu: &[u8]) {
        self.pdu.write(pdu);
        self.has_pdu.set(!pdu.is_empty());
    }
}

impl Default for RxNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive node allocation, used from the radio context.
pub trait RxAlloc {
    /// A free node if at least `count` nodes are free, without taking it.
    fn alloc_peek(&self, count: usize) -> Option<RxHandle>;

    /// Take a free node.
    fn alloc(&self) -> Option<RxHandle>;

    fn node(&self, handle: RxHandle) -> Option<&RxNode>;
}

/// Hand-off of finished nodes and event outcomes, used from the radio
/// context.
pub trait RxSink {
    fn enqueue(&self, handle: RxHandle);

    fn done(&self, done: Done);
}

/// Receives nodes and outcomes in the background context, in the order
/// they were produced.
pub trait RxClient {
    /// `node` is recycled when this returns.
    fn rx(&self, node: &RxNode);

    fn done(&self, done: &Done);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RxItem {
    Node(RxHandle),
    Done(Done),
}

pub struct RxPool<'a> {
    nodes: &'a [RxNode],
    free: AtomicRingBuffer<'a, RxHandle>,
    queue: AtomicRingBuffer<'a, RxItem>,
    deferred_call: DeferredCall,
    client: OptionalCell<&'a dyn RxClient>,
    /// Items lost because the queue was full.
    dropped: Cell<usize>,
}

impl<'a> RxPool<'a> {
    /// `free_ring` must be one longer than `nodes`; `queue_ring` bounds the
    /// number of undelivered items.
    pub fn new(
        nodes: &'a [RxNode],
        free_ring: &'a mut [RxHandle],
        queue_ring: &'a mut [RxItem],
    ) -> RxPool<'a> {
        let pool = RxPool {
            nodes,
            free: AtomicRingBuffer::new(free_ring),
            queue: AtomicRingBuffer::new(queue_ring),
            deferred_call: DeferredCall::new(),
            client: OptionalCell::empty(),
            dropped: Cell::new(0),
        };
        for handle in 0..nodes.len().min(pool.free.capacity()) {
            pool.free.enqueue(handle as RxHandle);
        }
        pool
    }

    pub fn set_client(&self, client: &'a dyn RxClient) {
        self.client.set(client);
    }

    /// Run pending deliveries. Called from the board's main loop.
    pub fn service(&self) -> bool {
        self.deferred_call.service(self)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn dropped(&self) -> usize {
        self.dropped.get()
    }

    fn push(&self, item: RxItem) {
        if self.queue.enqueue(item) {
            self.deferred_call.set();
        } else {
            self.dropped.set(self.dropped.get() + 1);
            if let RxItem::Node(handle) = item {
                self.free.enqueue(handle);
            }
        }
    }
}

impl RxAlloc for RxPool<'_> {
    fn alloc_peek(&self, count: usize) -> Option<RxHandle> {
        if self.free.len() >= count.max(1) {
            self.free.peek()
        } else {
            None
        }
    }

    fn alloc(&self) -> Option<RxHandle> {
        self.free.dequeue()
    }

    fn node(&self, handle: RxHandle) -> Option<&RxNode> {
        self.nodes.get(handle as usize)
    }
}

impl RxSink for RxPool<'_> {
    fn enqueue(&self, handle: RxHandle) {
        self.push(RxItem::Node(handle));
    }

    fn done(&self, done: Done) {
        self.push(RxItem::Done(done));
    }
}

impl DeferredCallClient for RxPool<'_> {
    fn handle_deferred_call(&self) {
        while let Some(item) = self.queue.dequeue() {
            match item {
                RxItem::Node(handle) => {
                    if let Some(node) = self.nodes.get(handle as usize) {
                        self.client.map(|client| client.rx(node));
                    }
                    self.free.enqueue(handle);
                }
                RxItem::Done(done) => {
                    self.client.map(|client| client.done(&done));
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::done::EventKind;
    use core::cell::RefCell;
    use std::vec::Vec;

    #[derive(Default)]
    struct Recorder {
        seen: RefCell<Vec<(RxKind, Option<u8>)>>,
        done: Cell<usize>,
    }

    impl RxClient for Recorder {
        fn rx(&self, node: &RxNode) {
            let tag = node.pdu().map(|pdu| pdu.byte(2));
            self.seen.borrow_mut().push((node.meta().kind, tag));
        }

        fn done(&self, _done: &Done) {
            self.done.set(self.done.get() + 1);
        }
    }

    #[test]
    fn deliver_in_order_and_recycle() {
        let nodes: [RxNode; 2] = Default::default();
        let mut free = [0; 3];
        let mut queue = [RxItem::Node(0); 4];
        let pool = RxPool::new(&nodes, &mut free, &mut queue);
        let recorder = Recorder::default();
        pool.set_client(&recorder);

        assert!(pool.alloc_peek(2).is_some());
        assert!(pool.alloc_peek(3).is_none());

        let a = pool.alloc().unwrap();
        pool.node(a).unwrap().set_meta(RxMeta::new(RxKind::AdvReport, 0));
        pool.node(a).unwrap().set_pdu(&[0, 1, 0xAA]);
        pool.enqueue(a);
        pool.done(Done::new(0, EventKind::Scan));

        let b = pool.alloc().unwrap();
        pool.node(b).unwrap().set_meta(RxMeta::new(RxKind::Data, 1));
        pool.node(b).unwrap().set_pdu(&[0, 1, 0xBB]);
        pool.enqueue(b);
        assert_eq!(pool.alloc(), None);

        assert!(pool.service());
        assert!(!pool.service());
        assert_eq!(
            *recorder.seen.borrow(),
            [(RxKind::AdvReport, Some(0xAA)), (RxKind::Data, Some(0xBB))]
        );
        assert_eq!(recorder.done.get(), 1);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn recycled_node_drops_old_pdu() {
        let nodes: [RxNode; 1] = Default::default();
        let mut free = [0; 2];
        let mut queue = [RxItem::Node(0); 2];
        let pool = RxPool::new(&nodes, &mut free, &mut queue);
        let recorder = Recorder::default();
        pool.set_client(&recorder);

        let a = pool.alloc().unwrap();
        pool.node(a).unwrap().set_pdu(&[0, 3, 0xAA, 0xAB, 0xAC]);
        pool.enqueue(a);
        pool.service();

        // the same node comes back for a record without a PDU
        let b = pool.alloc().unwrap();
        assert_eq!(a, b);
        let node = pool.node(b).unwrap();
        node.set_meta(RxMeta::new(RxKind::Terminate, 0));
        node.set_pdu(&[]);
        assert!(node.pdu().is_none());
        assert!(node.pdu.is_empty());
        pool.enqueue(b);
        pool.service();
        assert_eq!(
            *recorder.seen.borrow(),
            [(RxKind::Data, Some(0xAA)), (RxKind::Terminate, None)]
        );
    }

    #[test]
    fn full_queue_recycles_node() {
        let nodes: [RxNode; 2] = Default::default();
        let mut free = [0; 3];
        let mut queue = [RxItem::Node(0); 2];
        let pool = RxPool::new(&nodes, &mut free, &mut queue);

        pool.done(Done::new(0, EventKind::Adv));
        let a = pool.alloc().unwrap();
        pool.enqueue(a);
        assert_eq!(pool.dropped(), 1);
        assert_eq!(pool.free_count(), 2);
    }
}
