// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Recording radio, ticker and random collaborators for the unit tests.

use core::cell::{Cell, RefCell};
use std::boxed::Box;
use std::vec::Vec;

use kernel::hil::ble::{Phy, Radio, RadioChannel};
use kernel::hil::rng::Random;
use kernel::hil::ticker::{Ticker, TickerStart, TickerUpdate};
use kernel::ErrorCode;

use crate::done::Done;
use crate::mem::{PduBuf, PduHandle, PduPool};
use crate::role::Env;
use crate::ull::{RxClient, RxItem, RxMeta, RxNode, RxPool};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Switch {
    None,
    Rx,
    Tx,
    Disable,
}

pub struct MockRadio {
    pub sent: RefCell<Vec<Vec<u8>>>,
    pub channels: RefCell<Vec<u8>>,
    pub access_address: Cell<u32>,
    pub crc_init: Cell<u32>,
    pub phy: Cell<Option<Phy>>,
    /// (tx, start offset) of every radio enable.
    pub starts: RefCell<Vec<(bool, u32)>>,
    pub rx_armed: Cell<bool>,
    pub hcto: Cell<u32>,
    pub switch: Cell<Switch>,
    pub disabled: Cell<usize>,

    // What the next status queries report.
    pub incoming: RefCell<Vec<u8>>,
    pub done: Cell<bool>,
    pub crc_ok: Cell<bool>,
    pub mic_ok: Cell<bool>,
    pub rssi: Cell<Option<u8>>,
    pub aa_us: Cell<u32>,
    pub ready_us: Cell<u32>,
    pub end_us: Cell<u32>,
}

impl MockRadio {
    pub fn new() -> MockRadio {
        MockRadio {
            sent: RefCell::new(Vec::new()),
            channels: RefCell::new(Vec::new()),
            access_address: Cell::new(0),
            crc_init: Cell::new(0),
            phy: Cell::new(None),
            starts: RefCell::new(Vec::new()),
            rx_armed: Cell::new(false),
            hcto: Cell::new(0),
            switch: Cell::new(Switch::None),
            disabled: Cell::new(0),
            incoming: RefCell::new(Vec::new()),
            done: Cell::new(true),
            crc_ok: Cell::new(true),
            mic_ok: Cell::new(true),
            rssi: Cell::new(None),
            aa_us: Cell::new(0),
            ready_us: Cell::new(0),
            end_us: Cell::new(0),
        }
    }

    /// The next interrupt reports `pdu` received with a valid CRC.
    pub fn receive(&self, pdu: &[u8]) {
        *self.incoming.borrow_mut() = pdu.to_vec();
        self.done.set(true);
        self.crc_ok.set(true);
    }

    /// The next interrupt reports a reception with a CRC error.
    pub fn receive_corrupt(&self) {
        self.done.set(true);
        self.crc_ok.set(false);
    }

    /// The next interrupt reports a receive window that expired.
    pub fn timeout(&self) {
        self.done.set(false);
        self.crc_ok.set(false);
    }

    /// The next interrupt reports the end of a transmission.
    pub fn transmitted(&self) {
        self.done.set(true);
    }

    pub fn last_sent(&self) -> Vec<u8> {
        self.sent.borrow().last().cloned().unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.borrow().len()
    }

    pub fn last_channel(&self) -> Option<u8> {
        self.channels.borrow().last().copied()
    }
}

impl Radio for MockRadio {
    fn reset(&self) {
        self.rx_armed.set(false);
        self.switch.set(Switch::None);
    }

    fn phy_set(&self, phy: Phy) {
        self.phy.set(Some(phy));
    }

    fn aa_set(&self, access_address: u32) {
        self.access_address.set(access_address);
    }

    fn crc_configure(&self, crc_init: u32) {
        self.crc_init.set(crc_init);
    }

    fn freq_chan_set(&self, channel: RadioChannel) {
        self.channels.borrow_mut().push(channel.get_channel_index());
    }

    fn pkt_tx_set(&self, pdu: &[u8]) {
        self.sent.borrow_mut().push(pdu.to_vec());
    }

    fn pkt_rx_set(&self, _max_len: u8) {
        self.rx_armed.set(true);
    }

    fn pkt_rx_get(&self, buf: &mut [u8]) -> usize {
        let incoming = self.incoming.borrow();
        let len = incoming.len().min(buf.len());
        buf[..len].copy_from_slice(&incoming[..len]);
        len
    }

    fn tmr_start(&self, tx: bool, _ticks_start: u32, remainder_us: u32) -> u32 {
        self.starts.borrow_mut().push((tx, remainder_us));
        remainder_us
    }

    fn tmr_start_now(&self, tx: bool) -> u32 {
        self.starts.borrow_mut().push((tx, 0));
        0
    }

    fn tmr_start_us(&self, tx: bool, start_us: u32) -> u32 {
        self.starts.borrow_mut().push((tx, start_us));
        start_us
    }

    fn tmr_tifs_set(&self, _us: u32) {}

    fn tmr_hcto_configure(&self, us: u32) {
        self.hcto.set(us);
    }

    fn tmr_aa_capture(&self) {}

    fn tmr_aa_get(&self) -> u32 {
        self.aa_us.get()
    }

    fn tmr_ready_get(&self) -> u32 {
        self.ready_us.get()
    }

    fn tmr_end_capture(&self) {}

    fn tmr_end_get(&self) -> u32 {
        self.end_us.get()
    }

    fn switch_complete_and_rx(&self, _phy: Phy) {
        self.switch.set(Switch::Rx);
    }

    fn switch_complete_and_tx(&self, _phy: Phy) {
        self.switch.set(Switch::Tx);
    }

    fn switch_complete_and_disable(&self) {
        self.switch.set(Switch::Disable);
    }

    fn disable(&self) {
        self.disabled.set(self.disabled.get() + 1);
    }

    fn status_reset(&self) {}

    fn is_done(&self) -> bool {
        self.done.get()
    }

    fn crc_is_valid(&self) -> bool {
        self.crc_ok.get()
    }

    fn rssi_measure(&self) {}

    fn rssi_is_ready(&self) -> bool {
        self.rssi.get().is_some()
    }

    fn rssi_get(&self) -> u8 {
        self.rssi.get().unwrap_or(0)
    }

    fn ccm_mic_is_valid(&self) -> bool {
        self.mic_ok.get()
    }

    fn rx_ready_delay_us(&self, _phy: Phy) -> u32 {
        40
    }

    fn tx_ready_delay_us(&self, _phy: Phy) -> u32 {
        40
    }

    fn rx_chain_delay_us(&self, _phy: Phy) -> u32 {
        10
    }

    fn tx_chain_delay_us(&self, _phy: Phy) -> u32 {
        1
    }
}

pub struct MockTicker {
    pub now: Cell<u32>,
    pub starts: RefCell<Vec<(u8, TickerStart)>>,
    pub updates: RefCell<Vec<(u8, TickerUpdate)>>,
    pub stops: RefCell<Vec<u8>>,
    pub refuse: Cell<bool>,
}

impl MockTicker {
    pub fn new() -> MockTicker {
        MockTicker {
            now: Cell::new(0),
            starts: RefCell::new(Vec::new()),
            updates: RefCell::new(Vec::new()),
            stops: RefCell::new(Vec::new()),
            refuse: Cell::new(false),
        }
    }
}

impl Ticker for MockTicker {
    fn ticks_now(&self) -> u32 {
        self.now.get()
    }

    fn start(&self, id: u8, params: TickerStart) -> Result<(), ErrorCode> {
        if self.refuse.get() {
            return Err(ErrorCode::BUSY);
        }
        self.starts.borrow_mut().push((id, params));
        Ok(())
    }

    fn update(&self, id: u8, update: TickerUpdate) -> Result<(), ErrorCode> {
        self.updates.borrow_mut().push((id, update));
        Ok(())
    }

    fn stop(&self, id: u8) -> Result<(), ErrorCode> {
        self.stops.borrow_mut().push(id);
        Ok(())
    }
}

/// xorshift32, deterministic per seed.
pub struct MockRandom(Cell<u32>);

impl MockRandom {
    pub fn new(seed: u32) -> MockRandom {
        MockRandom(Cell::new(seed.max(1)))
    }
}

impl Random for MockRandom {
    fn random(&self) -> u32 {
        let mut x = self.0.get();
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0.set(x);
        x
    }

    fn reseed(&self, seed: u32) {
        self.0.set(seed.max(1));
    }
}

#[derive(Default)]
pub struct Recorder {
    pub reports: RefCell<Vec<(RxMeta, Vec<u8>)>>,
    pub dones: RefCell<Vec<Done>>,
}

impl RxClient for Recorder {
    fn rx(&self, node: &RxNode) {
        let mut pdu = [0; crate::pdu::PDU_SIZE];
        let len = node.pdu().map_or(0, |buf| buf.read(&mut pdu));
        self.reports.borrow_mut().push((node.meta(), pdu[..len].to_vec()));
    }

    fn done(&self, done: &Done) {
        self.dones.borrow_mut().push(*done);
    }
}

/// Collaborators wired together with leaked storage, so everything is
/// `'static` like on a board.
pub struct Bench {
    pub radio: &'static MockRadio,
    pub ticker: &'static MockTicker,
    pub rng: &'static MockRandom,
    pub pool: &'static PduPool<'static>,
    pub rx: &'static RxPool<'static>,
    pub recorder: &'static Recorder,
}

impl Bench {
    pub fn new() -> Bench {
        Bench::with_rx_nodes(8)
    }

    pub fn with_rx_nodes(count: usize) -> Bench {
        let bufs: &'static [PduBuf] = Box::leak(Box::new(<[PduBuf; 24]>::default()));
        let free: &'static mut [PduHandle] = Box::leak(Box::new([0u8; 25]));
        let pool: &'static PduPool<'static> = Box::leak(Box::new(PduPool::new(bufs, free)));

        let nodes: Vec<RxNode> = (0..count).map(|_| RxNode::new()).collect();
        let nodes: &'static [RxNode] = Box::leak(nodes.into_boxed_slice());
        let rx_free: &'static mut [u8] = Box::leak(std::vec![0u8; count + 1].into_boxed_slice());
        let queue: &'static mut [RxItem] = Box::leak(Box::new([RxItem::Node(0); 64]));
        let rx: &'static RxPool<'static> = Box::leak(Box::new(RxPool::new(nodes, rx_free, queue)));
        let recorder: &'static Recorder = Box::leak(Box::new(Recorder::default()));
        rx.set_client(recorder);

        Bench {
            radio: Box::leak(Box::new(MockRadio::new())),
            ticker: Box::leak(Box::new(MockTicker::new())),
            rng: Box::leak(Box::new(MockRandom::new(0x1234_5678))),
            pool,
            rx,
            recorder,
        }
    }

    pub fn env(&self) -> Env<'static> {
        Env {
            radio: self.radio,
            pool: self.pool,
            rx: self.rx,
            sink: self.rx,
            rng: self.rng,
        }
    }

    /// Deliver queued items and return the reports received so far.
    pub fn reports(&self) -> Vec<(RxMeta, Vec<u8>)> {
        self.rx.service();
        self.recorder.reports.replace(Vec::new())
    }

    pub fn dones(&self) -> Vec<Done> {
        self.rx.service();
        self.recorder.dones.replace(Vec::new())
    }

    /// Put `pdu` in a fresh PDU buffer.
    pub fn pdu(&self, pdu: &[u8]) -> PduHandle {
        let handle = self.pool.alloc().unwrap();
        self.pool.get(handle).unwrap().write(pdu);
        handle
    }
}
