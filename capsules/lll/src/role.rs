// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Collaborators and helpers shared by the role state machines.
//!
//! Roles never own the radio, the buffer pools or the upper-layer queues.
//! The controller lends them an [`Env`] for the duration of each prepare,
//! radio interrupt or abort.

use kernel::hil::ble::{Phy, Radio, RadioChannel};
use kernel::hil::rng::Random;
use kernel::hil::ticker::{ticks_to_us, us_to_ticks};
use kernel::ErrorCode;

use crate::conn::Connection;
use crate::drift::{offset_unit_us, offset_widening_us};
use crate::mem::{PduHandle, PduPool};
use crate::params::{ACCEPT_LIST_SIZE, EVENT_START_US, TICKER_JITTER_US, TIFS_US};
use crate::pdu::{AuxPtr, DeviceAddress, CONNECT_IND_LEN, HEADER_LEN, PAYLOAD_MAX, PDU_SIZE};
use crate::sched::PrepareParam;
use crate::sync::PeriodicSync;
use crate::ull::{RxAlloc, RxMeta, RxSink, RSSI_NOT_AVAILABLE};

/// Everything a role touches while it runs.
#[derive(Copy, Clone)]
pub struct Env<'a> {
    pub radio: &'a dyn Radio,
    pub pool: &'a PduPool<'a>,
    pub rx: &'a dyn RxAlloc,
    pub sink: &'a dyn RxSink,
    pub rng: &'a dyn Random,
}

/// Tick the radio timer of an event prepared at `param` starts from.
pub fn ticks_start(param: &PrepareParam) -> u32 {
    param
        .ticks_at_expire
        .wrapping_add(us_to_ticks(EVENT_START_US))
}

/// Remainder to start the radio timer with at `ticks_at_expire + EVENT_START`
/// so the event begins `offset_us` after `ticks_anchor`.
pub fn chain_remainder_us(ticks_anchor: u32, offset_us: u32, ticks_at_expire: u32) -> u32 {
    let start = ticks_at_expire.wrapping_add(us_to_ticks(EVENT_START_US));
    offset_us.saturating_sub(ticks_to_us(start.wrapping_sub(ticks_anchor)))
}

/// A one-shot follow-up event of the same role: an auxiliary advertising
/// event, an aux scan or a periodic chain reception.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    /// Tick the offset is relative to.
    pub ticks_anchor: u32,
    /// Radio start of the follow-up event after `ticks_anchor`.
    pub offset_us: u32,
}

impl Schedule {
    /// Ticks from the anchor to the prepare of the follow-up event.
    pub fn ticks_first(&self) -> u32 {
        us_to_ticks(self.offset_us.saturating_sub(EVENT_START_US))
    }
}

/// Receive window of an auxiliary PDU announced by an AuxPtr, on the radio
/// timer of the event that received the pointer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AuxWindow {
    pub channel: u8,
    pub phy: Phy,
    /// Receiver enable.
    pub enable_us: u32,
    pub hcto_us: u32,
}

impl AuxWindow {
    /// Window for `ptr` carried by a PDU whose preamble started at
    /// `pdu_start_us`.
    pub fn new(radio: &dyn Radio, ptr: &AuxPtr, pdu_start_us: u32) -> AuxWindow {
        let start_us = pdu_start_us + ptr.offset_us;
        let widening_us = offset_widening_us(ptr.offset_us, ptr.ca);
        AuxWindow {
            channel: ptr.channel,
            phy: ptr.phy,
            enable_us: start_us.saturating_sub(widening_us + radio.rx_ready_delay_us(ptr.phy)),
            hcto_us: start_us + offset_unit_us(ptr.offset_us) + widening_us + ptr.phy.addr_us(),
        }
    }

    pub fn length_us(&self) -> u32 {
        self.hcto_us - self.enable_us
    }
}

/// Complete CONNECT_IND PDU length.
pub const CONNECT_IND_PDU_LEN: usize = HEADER_LEN + CONNECT_IND_LEN;

/// A radio context created by a role's event, for the controller to
/// install in a slot of its own.
pub enum Handoff {
    /// A connection was established. The advertiser or initiator that
    /// produced it stops.
    Connection {
        conn: Connection,
        /// Radio start of the first connection event.
        first: Schedule,
        /// Ticker period.
        period_us: u32,
        /// The CONNECT_IND as sent or received.
        connect_ind: [u8; CONNECT_IND_PDU_LEN],
        csa2: bool,
    },
    /// A periodic advertising train was found. The scanner carries on.
    Sync {
        sync: PeriodicSync,
        first: Schedule,
        period_us: u32,
    },
}

/// Peer addresses allowed by a filter policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AcceptList {
    entries: [Option<DeviceAddress>; ACCEPT_LIST_SIZE],
}

impl AcceptList {
    pub fn add(&mut self, addr: DeviceAddress) -> Result<(), ErrorCode> {
        if self.contains(&addr) {
            return Ok(());
        }
        let free = self
            .entries
            .iter_mut()
            .find(|e| e.is_none())
            .ok_or(ErrorCode::NOMEM)?;
        *free = Some(addr);
        Ok(())
    }

    pub fn remove(&mut self, addr: &DeviceAddress) {
        for entry in self.entries.iter_mut() {
            if entry.as_ref() == Some(addr) {
                *entry = None;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries = [None; ACCEPT_LIST_SIZE];
    }

    pub fn contains(&self, addr: &DeviceAddress) -> bool {
        self.entries.iter().any(|e| e.as_ref() == Some(addr))
    }
}

impl<'a> Env<'a> {
    /// Reset the radio and tune it for one event.
    pub fn radio_setup(&self, phy: Phy, access_address: u32, crc_init: u32, channel: u8) {
        let radio = self.radio;
        radio.reset();
        radio.phy_set(phy);
        radio.aa_set(access_address);
        radio.crc_configure(crc_init);
        if let Some(channel) = RadioChannel::from_index(channel) {
            radio.freq_chan_set(channel);
        }
        radio.tmr_tifs_set(TIFS_US);
    }

    /// Header complete timeout for a reply expected one inter frame space
    /// after the PDU that just ended.
    pub fn reply_hcto_us(&self, phy: Phy) -> u32 {
        let radio = self.radio;
        (radio.tmr_end_get() + TIFS_US + (TICKER_JITTER_US << 1) + radio.rx_chain_delay_us(phy) + phy.addr_us())
            .saturating_sub(radio.tx_chain_delay_us(phy))
    }

    /// Load the PDU in `handle` into the radio.
    pub fn tx_buf(&self, handle: PduHandle) -> bool {
        let mut out = [0; PDU_SIZE];
        match self.pool.get(handle) {
            Some(buf) => {
                let len = buf.read(&mut out);
                self.radio.pkt_tx_set(&out[..len]);
                true
            }
            None => false,
        }
    }

    /// Copy the received PDU out of the radio into `out`.
    pub fn rx_pdu<'b>(&self, out: &'b mut [u8; PDU_SIZE]) -> &'b [u8] {
        let len = self.radio.pkt_rx_get(out).min(PDU_SIZE);
        &out[..len]
    }

    pub fn rssi(&self) -> u8 {
        if self.radio.rssi_is_ready() {
            self.radio.rssi_get()
        } else {
            RSSI_NOT_AVAILABLE
        }
    }

    /// Receive an auxiliary PDU on the running radio timer. Access address
    /// and CRC stay those of the current event.
    pub fn aux_rx_inline(&self, window: &AuxWindow) {
        let radio = self.radio;
        radio.phy_set(window.phy);
        if let Some(channel) = RadioChannel::data(window.channel) {
            radio.freq_chan_set(channel);
        }
        radio.pkt_rx_set(PAYLOAD_MAX as u8);
        radio.switch_complete_and_disable();
        radio.tmr_start_us(false, window.enable_us);
        radio.tmr_hcto_configure(window.hcto_us);
        radio.tmr_aa_capture();
        radio.tmr_end_capture();
        radio.rssi_measure();
    }

    /// Receive an auxiliary PDU in an event of its own, scheduled at
    /// `when`. Returns the radio start.
    pub fn aux_rx_scheduled(
        &self,
        window: &AuxWindow,
        access_address: u32,
        crc_init: u32,
        param: &PrepareParam,
        when: &Schedule,
    ) -> u32 {
        let radio = self.radio;
        self.radio_setup(window.phy, access_address, crc_init, window.channel);
        radio.pkt_rx_set(PAYLOAD_MAX as u8);
        radio.switch_complete_and_disable();
        let remainder = chain_remainder_us(when.ticks_anchor, when.offset_us, param.ticks_at_expire);
        let start_us = radio.tmr_start(false, ticks_start(param), remainder);
        radio.tmr_hcto_configure(start_us + window.length_us());
        radio.tmr_aa_capture();
        radio.tmr_end_capture();
        radio.rssi_measure();
        start_us
    }

    /// Store `pdu` in a fresh rx node and hand it to the upper layer. The
    /// node is only taken when `reserve` nodes are free, leaving the rest
    /// for reports that must not be lost. Returns false if skipped.
    pub fn report(&self, meta: RxMeta, pdu: &[u8], reserve: usize) -> bool {
        if self.rx.alloc_peek(reserve).is_none() {
            return false;
        }
        let node = match self.rx.alloc() {
            Some(handle) => handle,
            None => return false,
        };
        if let Some(rx) = self.rx.node(node) {
            rx.set_meta(meta);
            rx.set_pdu(pdu);
        }
        self.sink.enqueue(node);
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chain_remainder_covers_tick_loss() {
        // follow-up 10 ms after the anchor, prepared on time
        let offset = 10_000;
        let schedule = Schedule {
            ticks_anchor: 1000,
            offset_us: offset,
        };
        let expire = 1000 + schedule.ticks_first();
        let remainder = chain_remainder_us(1000, offset, expire);
        let start = expire + us_to_ticks(EVENT_START_US);
        let total = ticks_to_us(start - 1000) + remainder;
        assert!(total <= offset && offset - total < 2);
        assert!(remainder < 62);
    }

    #[test]
    fn late_chain_starts_at_once() {
        assert_eq!(chain_remainder_us(0, 100, 1000), 0);
    }

    #[test]
    fn aux_window_brackets_the_offset() {
        let bench = crate::mock::Bench::new();
        let ptr = AuxPtr {
            channel: 7,
            ca: true,
            offset_us: 2400,
            phy: Phy::Le1M,
        };
        let window = AuxWindow::new(bench.radio, &ptr, 100);
        // 100 ppm over 2.4 ms rounds up to 1 us, plus jitter
        assert_eq!(window.enable_us, 100 + 2400 - 17 - 40);
        assert_eq!(window.hcto_us, 100 + 2400 + 30 + 17 + 40);

        bench.env().aux_rx_inline(&window);
        assert_eq!(bench.radio.last_channel(), Some(7));
        assert_eq!(*bench.radio.starts.borrow(), [(false, window.enable_us)]);
        assert_eq!(bench.radio.hcto.get(), window.hcto_us);
        assert!(bench.radio.rx_armed.get());
    }

    #[test]
    fn accept_list_is_bounded() {
        let mut list = AcceptList::default();
        for i in 0..ACCEPT_LIST_SIZE as u8 {
            list.add(DeviceAddress::public([i; 6])).unwrap();
        }
        // already present
        assert_eq!(list.add(DeviceAddress::public([0; 6])), Ok(()));
        assert_eq!(list.add(DeviceAddress::random([0; 6])), Err(ErrorCode::NOMEM));
        list.remove(&DeviceAddress::public([3; 6]));
        assert!(!list.contains(&DeviceAddress::public([3; 6])));
        assert!(list.contains(&DeviceAddress::public([4; 6])));
        list.add(DeviceAddress::random([0; 6])).unwrap();
        list.clear();
        assert!(!list.contains(&DeviceAddress::random([0; 6])));
    }
}
