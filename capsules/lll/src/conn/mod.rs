// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Connected roles.
//!
//! A [`Connection`] is the radio event context of one connection, shared by
//! both sides. The central transmits first in every event (see
//! [`central`]); the peripheral opens a widened receive window and answers
//! (see [`peripheral`]). Everything else lives here:
//!
//! - data channel selection (CSA#1 or CSA#2) and channel map updates at an
//!   instant,
//! - the SN/NESN acknowledgement scheme: a PDU stays at the head of the
//!   transmit queue, and is resent byte for byte, until the peer's NESN
//!   acknowledges it,
//! - event close bookkeeping: supervision and procedure timeouts, the
//!   connection establishment countdown, peripheral latency and the ticker
//!   update carried by the [`Done`] record.
//!
//! ```text
//!   central     | tx | rx |      | tx | rx |   (close on !MD both ways)
//!   peripheral  |    | rx | tx   |    | rx | tx |
//! ```

pub mod central;
pub mod peripheral;

use byteorder::{ByteOrder, LittleEndian};
use kernel::config::CONFIG;
use kernel::debug;
use kernel::hil::ble::Phy;
use kernel::hil::ticker::{us_to_ticks, TickerUpdate};
use kernel::ErrorCode;

use crate::chan::{self, ChannelMap};
use crate::done::{reason, Done, EventKind};
use crate::drift::{Drift, DriftMeasure};
use crate::mem::{PduFifo, PduHandle, PduPool};
use crate::params::{
    CHANNEL_MAP_INSTANT_MARGIN, CONN_ESTABLISH_EVENTS, CONN_TX_QUEUE, CONN_UNIT_US,
    CRC_ERROR_CLOSE, LOCAL_SCA, PROCEDURE_TIMEOUT_US, SUPERVISION_FORCE_EVENTS,
    SUPERVISION_UNIT_US,
};
use crate::pdu::{self, ll_ctrl, ConnectInd, DataHeader, DataHeaderVal, HEADER_LEN, PDU_SIZE};
use crate::role::Env;
use crate::sched::{AbortDecision, PrepareParam};
use crate::ull::{RxKind, RxMeta};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    /// Transmitting, a reply is expected.
    Tx,
    /// Transmitting the last PDU of the event.
    TxLast,
    Rx,
}

/// What the event does after a reception.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Next {
    Continue,
    /// The exchange is over. A peripheral still answers the PDU it got.
    Close,
    /// Stop without transmitting.
    Stop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ChannelMapUpdate {
    map: ChannelMap,
    /// Unset until the central's LL_CHANNEL_MAP_IND goes on air.
    instant: Option<u16>,
}

#[derive(Copy, Clone, Debug, Default)]
struct EventStats {
    tx_count: u16,
    rx_count: u16,
    crc_valid: bool,
    drift: Option<DriftMeasure>,
}

/// Events until `timeout_us` elapses at `interval_us`, rounded up.
pub(crate) fn events(timeout_us: u32, interval_us: u32) -> u16 {
    let interval_us = interval_us.max(1);
    timeout_us.div_ceil(interval_us).min(u16::MAX as u32) as u16
}

pub struct Connection {
    handle: u8,
    central: bool,
    phy: Phy,
    access_address: u32,
    crc_init: u32,

    csa2: bool,
    chan_id: u16,
    hop: u8,
    /// CSA#1 unmapped channel of the last event.
    unmapped: u8,
    channel_map: ChannelMap,
    chm_update: Option<ChannelMapUpdate>,

    interval_us: u32,
    latency: u16,
    /// Counter of the next event.
    event_counter: u16,
    /// Counter of the event on air.
    counter: u16,
    latency_prepare: u16,
    latency_event: u16,
    latency_enabled: bool,
    supervision_reload: u16,
    supervision_expire: u16,
    procedure_reload: u16,
    procedure_expire: u16,
    connect_expire: u16,
    /// Peripheral forced wake-up pattern, rotated each event a timeout is
    /// running.
    force_bits: u32,
    drift: Drift,

    sn: bool,
    nesn: bool,
    /// The last PDU sent was the empty PDU.
    empty: bool,
    crc_expire: u8,
    tx: PduFifo<CONN_TX_QUEUE>,
    encrypted: bool,

    state: State,
    start_us: u32,
    ev: EventStats,
    rssi: u8,
    /// Terminate with this reason at the end of the event.
    terminate: Option<u8>,
    /// The peer's LL_TERMINATE_IND, acknowledged before closing.
    peer_terminate: Option<u8>,
    /// Reason of a local LL_TERMINATE_IND awaiting acknowledgement.
    local_terminate: Option<u8>,
}

impl Connection {
    fn new(central: bool, ind: &ConnectInd, csa2: bool, phy: Phy) -> Connection {
        let interval_us = ind.interval as u32 * CONN_UNIT_US;
        let mut drift = Drift::default();
        if !central {
            drift = Drift::new(LOCAL_SCA, ind.sca, interval_us);
            drift.window_size_prepare_us = ind.win_size as u32 * CONN_UNIT_US;
        }
        Connection {
            handle: 0,
            central,
            phy,
            access_address: ind.access_address,
            crc_init: ind.crc_init,
            csa2,
            chan_id: chan::channel_id(ind.access_address),
            hop: ind.hop,
            unmapped: 0,
            channel_map: ind.channel_map,
            chm_update: None,
            interval_us,
            latency: ind.latency,
            event_counter: 0,
            counter: 0,
            latency_prepare: 0,
            latency_event: 0,
            latency_enabled: false,
            supervision_reload: events(ind.timeout as u32 * SUPERVISION_UNIT_US, interval_us),
            supervision_expire: 0,
            procedure_reload: events(PROCEDURE_TIMEOUT_US, interval_us),
            procedure_expire: 0,
            connect_expire: CONN_ESTABLISH_EVENTS,
            force_bits: ind.access_address,
            drift,
            sn: false,
            nesn: false,
            empty: false,
            crc_expire: 0,
            tx: PduFifo::new(),
            encrypted: false,
            state: State::Idle,
            start_us: 0,
            ev: EventStats::default(),
            rssi: crate::ull::RSSI_NOT_AVAILABLE,
            terminate: None,
            peer_terminate: None,
            local_terminate: None,
        }
    }

    pub fn handle(&self) -> u8 {
        self.handle
    }

    pub fn set_handle(&mut self, handle: u8) {
        self.handle = handle;
    }

    pub fn is_central(&self) -> bool {
        self.central
    }

    pub fn event_counter(&self) -> u16 {
        self.event_counter
    }

    pub fn channel_map(&self) -> ChannelMap {
        self.channel_map
    }

    pub fn interval_us(&self) -> u32 {
        self.interval_us
    }

    /// Last RSSI sampled on a reception.
    pub fn rssi(&self) -> u8 {
        self.rssi
    }

    fn kind(&self) -> EventKind {
        if self.central {
            EventKind::Central
        } else {
            EventKind::Peripheral
        }
    }

    /// Queue a data or control PDU, LLID and length already set.
    pub fn enqueue_tx(&mut self, handle: PduHandle) -> Result<(), ErrorCode> {
        if self.local_terminate.is_some() {
            return Err(ErrorCode::OFF);
        }
        if self.tx.push(handle) {
            Ok(())
        } else {
            Err(ErrorCode::BUSY)
        }
    }

    /// Encryption state of the link. Received PDUs with payload must then
    /// carry a valid MIC.
    pub fn set_encrypted(&mut self, encrypted: bool) {
        self.encrypted = encrypted;
    }

    /// Start a channel map update. Central only; the instant is chosen when
    /// the LL_CHANNEL_MAP_IND first goes on air.
    pub fn channel_map_update(&mut self, pool: &PduPool, map: ChannelMap) -> Result<(), ErrorCode> {
        if !self.central {
            return Err(ErrorCode::NOSUPPORT);
        }
        if !map.is_valid() {
            return Err(ErrorCode::INVAL);
        }
        if self.chm_update.is_some() {
            return Err(ErrorCode::BUSY);
        }
        if self.tx.is_full() {
            return Err(ErrorCode::BUSY);
        }
        let handle = pool.alloc().ok_or(ErrorCode::NOMEM)?;
        let mut out = [0; PDU_SIZE];
        let len = pdu::build_ll_channel_map_ind(&mut out, &map, 0);
        if let Some(buf) = pool.get(handle) {
            buf.write(&out[..len]);
        }
        self.enqueue_tx(handle)?;
        self.chm_update = Some(ChannelMapUpdate { map, instant: None });
        Ok(())
    }

    /// Queue an LL_TERMINATE_IND. The connection ends when the peer
    /// acknowledges it, or with a procedure timeout.
    pub fn terminate(&mut self, pool: &PduPool, reason: u8) -> Result<(), ErrorCode> {
        if self.local_terminate.is_some() {
            return Err(ErrorCode::ALREADY);
        }
        if self.tx.is_full() {
            return Err(ErrorCode::BUSY);
        }
        let handle = pool.alloc().ok_or(ErrorCode::NOMEM)?;
        let mut out = [0; PDU_SIZE];
        let len = pdu::build_ll_terminate_ind(&mut out, reason);
        if let Some(buf) = pool.get(handle) {
            buf.write(&out[..len]);
        }
        self.enqueue_tx(handle)?;
        self.local_terminate = Some(reason);
        self.procedure_expire = self.procedure_reload;
        Ok(())
    }

    /// Return queued buffers once the connection is gone.
    pub fn release(&mut self, pool: &PduPool) {
        self.tx.release_all(pool);
    }

    pub fn is_abort(&self) -> AbortDecision {
        if self.supervision_expire != 0 && self.supervision_expire <= SUPERVISION_FORCE_EVENTS {
            AbortDecision::Continue
        } else {
            AbortDecision::Cancel
        }
    }

    pub fn prepare(&mut self, env: &Env, param: &PrepareParam, resume: bool) -> Option<Done> {
        if resume {
            // A connection event that lost the radio is not picked up again.
            return Some(Done::aborted(self.handle, self.kind()));
        }
        let channel = self.event_setup(param);
        self.ev = EventStats::default();
        self.crc_expire = 0;
        if CONFIG.trace_radio_events {
            debug!("conn {}: event {} on {}", self.handle, self.counter, channel);
        }
        if self.central {
            self.central_prepare(env, param, channel);
        } else {
            self.peripheral_prepare(env, param, channel);
        }
        None
    }

    pub fn isr(&mut self, env: &Env) -> Option<Done> {
        match self.state {
            State::Idle => None,
            State::Tx => {
                self.ev.tx_count += 1;
                self.arm_rx(env);
                None
            }
            State::TxLast => {
                self.ev.tx_count += 1;
                Some(self.close())
            }
            State::Rx => {
                if self.central {
                    self.central_rx(env)
                } else {
                    self.peripheral_rx(env)
                }
            }
        }
    }

    pub fn abort(&mut self, env: &Env, param: Option<&PrepareParam>) -> Done {
        match param {
            Some(param) => {
                self.latency_prepare = self
                    .latency_prepare
                    .saturating_add(param.lazy)
                    .saturating_add(1);
                Done::aborted(self.handle, self.kind())
            }
            None => {
                env.radio.disable();
                let mut done = self.close();
                done.aborted = true;
                done.tx_count = 0;
                done.rx_count = 0;
                done
            }
        }
    }

    /// Counter, channel map instant and channel of the event being
    /// prepared.
    fn event_setup(&mut self, param: &PrepareParam) -> u8 {
        let skipped = self.latency_prepare.saturating_add(param.lazy);
        self.latency_prepare = 0;
        self.latency_event = skipped;
        self.counter = self.event_counter.wrapping_add(skipped);
        self.event_counter = self.counter.wrapping_add(1);
        if self.central {
            self.drift = Drift::default();
        } else {
            self.drift.accumulate(skipped.saturating_add(1));
        }

        if let Some(update) = self.chm_update {
            if let Some(instant) = update.instant {
                if chan::instant_passed(self.counter, instant) {
                    self.channel_map = update.map;
                    self.chm_update = None;
                }
            }
        }

        if self.csa2 {
            chan::csa2_channel(
                self.counter,
                self.chan_id,
                &self.channel_map,
                self.channel_map.count(),
            )
        } else {
            let channel = chan::legacy_channel(self.unmapped, self.hop, skipped, &self.channel_map);
            self.unmapped = chan::legacy_unmapped(self.unmapped, self.hop, skipped);
            channel
        }
    }

    /// Receive the peer's reply to the PDU just sent.
    fn arm_rx(&mut self, env: &Env) {
        let radio = env.radio;
        radio.pkt_rx_set(pdu::DATA_PAYLOAD_MAX as u8);
        radio.switch_complete_and_tx(self.phy);
        radio.tmr_hcto_configure(env.reply_hcto_us(self.phy));
        radio.tmr_aa_capture();
        radio.rssi_measure();
        self.state = State::Rx;
    }

    /// Load the next PDU into the radio: the unacknowledged head of the
    /// queue, or the empty PDU. Returns true if it has no payload.
    fn load_tx(&mut self, env: &Env) -> bool {
        let mut out = [0; PDU_SIZE];
        let head = if self.empty { None } else { self.tx.peek() };
        let len = match head.and_then(|h| env.pool.get(h)) {
            Some(buf) => {
                let len = buf.read(&mut out);
                self.stamp_instant(&mut out);
                // keep the stamped instant for retransmissions
                buf.write(&out[..len]);
                len
            }
            None => {
                self.empty = true;
                out[0] = DataHeader::LLID::Continuation.value;
                out[1] = 0;
                HEADER_LEN
            }
        };
        let md = if self.empty {
            !self.tx.is_empty()
        } else {
            self.tx.len() > 1
        };
        let llid = DataHeaderVal::new(out[0]).read(DataHeader::LLID);
        pdu::write_data_header(&mut out, llid, self.sn, self.nesn, md, len - HEADER_LEN);
        env.radio.pkt_tx_set(&out[..len]);
        len == HEADER_LEN
    }

    /// Fill in the instant of our LL_CHANNEL_MAP_IND on its first
    /// transmission.
    fn stamp_instant(&mut self, out: &mut [u8; PDU_SIZE]) {
        let header = DataHeaderVal::new(out[0]);
        if header.read(DataHeader::LLID) != DataHeader::LLID::Control.value
            || out[2] != ll_ctrl::CHANNEL_MAP_IND
        {
            return;
        }
        if let Some(update) = self.chm_update.as_mut() {
            if update.instant.is_none() {
                let instant = self
                    .counter
                    .wrapping_add(self.latency)
                    .wrapping_add(CHANNEL_MAP_INSTANT_MARGIN);
                update.instant = Some(instant);
                LittleEndian::write_u16(&mut out[8..10], instant);
            }
        }
    }

    /// Acknowledgement and delivery of a received PDU.
    fn rx_process(&mut self, env: &Env, pdu: &[u8], crc_ok: bool) -> Next {
        self.ev.rx_count += 1;
        if !crc_ok {
            if self.crc_expire == 0 {
                self.crc_expire = CRC_ERROR_CLOSE;
            }
            self.crc_expire -= 1;
            return if self.crc_expire == 0 {
                Next::Close
            } else {
                Next::Continue
            };
        }
        self.crc_expire = 0;
        self.ev.crc_valid = true;
        if env.radio.rssi_is_ready() {
            self.rssi = env.radio.rssi_get();
        }

        let header = match pdu.first() {
            Some(h) => DataHeaderVal::new(*h),
            None => return Next::Close,
        };
        let rx_sn = header.is_set(DataHeader::SN);
        let rx_nesn = header.is_set(DataHeader::NESN);
        let rx_md = header.is_set(DataHeader::MD);

        if rx_nesn != self.sn {
            self.sn = !self.sn;
            if self.empty {
                self.empty = false;
            } else if let Some(head) = self.tx.pop() {
                let terminate_acked = env.pool.get(head).map_or(false, |buf| {
                    buf.byte(0) & 0x3 == DataHeader::LLID::Control.value
                        && buf.byte(2) == ll_ctrl::TERMINATE_IND
                });
                env.pool.release_chain(head);
                if terminate_acked {
                    self.terminate = Some(reason::LOCAL_HOST_TERM);
                    return Next::Stop;
                }
            }
        }

        if rx_sn == self.nesn {
            let len = pdu::payload_len(pdu);
            if self.encrypted && len > 0 && !env.radio.ccm_mic_is_valid() {
                self.terminate = Some(reason::TERM_MIC_FAILURE);
                return Next::Stop;
            }
            if len == 0 {
                self.nesn = !self.nesn;
            } else if env.rx.alloc_peek(1).is_some() {
                let llid = header.read(DataHeader::LLID);
                if !(llid == DataHeader::LLID::Control.value && self.rx_ctrl(pdu::payload(pdu))) {
                    let meta = RxMeta {
                        rssi: self.rssi,
                        counter: self.counter as u64,
                        ..RxMeta::new(RxKind::Data, self.handle)
                    };
                    env.report(meta, pdu, 1);
                }
                self.nesn = !self.nesn;
            }
            // without an rx node the PDU is not acknowledged and comes again
        }

        if self.terminate.is_some() {
            return Next::Stop;
        }
        if self.peer_terminate.is_some() {
            return Next::Close;
        }
        if !rx_md && (self.empty || self.tx.is_empty()) {
            Next::Close
        } else {
            Next::Continue
        }
    }

    /// Control PDUs the radio context acts on. Returns true if consumed.
    fn rx_ctrl(&mut self, payload: &[u8]) -> bool {
        match payload.first().copied() {
            Some(ll_ctrl::CHANNEL_MAP_IND) if payload.len() >= ll_ctrl::CHANNEL_MAP_IND_LEN => {
                let instant = LittleEndian::read_u16(&payload[6..8]);
                match ChannelMap::from_slice(&payload[1..6]) {
                    Some(map) if map.is_valid() && !self.central => {
                        if chan::instant_in_past(self.counter, instant) {
                            self.terminate = Some(reason::INSTANT_PASSED);
                        } else {
                            self.chm_update = Some(ChannelMapUpdate {
                                map,
                                instant: Some(instant),
                            });
                        }
                    }
                    // unusable maps leave the current one in place
                    _ => {}
                }
                true
            }
            Some(ll_ctrl::TERMINATE_IND) if payload.len() >= ll_ctrl::TERMINATE_IND_LEN => {
                self.peer_terminate = Some(payload[1]);
                true
            }
            _ => false,
        }
    }

    /// End of the event: timeouts, latency and the ticker update.
    fn close(&mut self) -> Done {
        self.state = State::Idle;
        let mut done = Done::new(self.handle, self.kind());
        done.tx_count = self.ev.tx_count;
        done.rx_count = self.ev.rx_count;
        done.crc_valid = self.ev.crc_valid;
        done.drift = self.ev.drift;

        if let Some(reason) = self.terminate.or(self.peer_terminate) {
            return self.terminated(done, reason);
        }

        let latency_event = self.latency_event;
        let elapsed = latency_event.saturating_add(1);
        let (mut plus_us, mut minus_us) = (0, 0);

        if self.ev.rx_count > 0 {
            if !self.central {
                if let Some(measure) = self.ev.drift {
                    (plus_us, minus_us) = measure.correction_us();
                }
                if !self.tx.is_empty() || !self.latency_enabled {
                    self.latency_event = 0;
                } else {
                    self.latency_event = self.latency;
                }
                self.latency_enabled = true;
            }
            self.connect_expire = 0;
        }

        if self.ev.crc_valid {
            self.supervision_expire = 0;
        } else if self.connect_expire != 0 {
            if self.connect_expire > elapsed {
                self.connect_expire -= elapsed;
            } else {
                return self.terminated(done, reason::CONN_FAIL_TO_ESTAB);
            }
        } else if self.supervision_expire == 0 {
            self.supervision_expire = self.supervision_reload;
        }

        let mut force = false;
        if self.supervision_expire != 0 {
            if self.supervision_expire > elapsed {
                self.supervision_expire -= elapsed;
                self.latency_event = 0;
                if self.supervision_expire <= SUPERVISION_FORCE_EVENTS {
                    force = true;
                } else if !self.central {
                    if latency_event != 0 {
                        force = true;
                    } else {
                        force = self.force_bits & 1 != 0;
                        self.force_bits >>= 1;
                        if force {
                            self.force_bits |= 1 << 31;
                        }
                    }
                }
            } else {
                return self.terminated(done, reason::CONN_TIMEOUT);
            }
        }

        if self.procedure_expire != 0 {
            if self.procedure_expire > elapsed {
                self.procedure_expire -= elapsed;
            } else {
                return self.terminated(done, reason::LL_RESP_TIMEOUT);
            }
        }

        if self.chm_update.is_some() {
            self.latency_event = 0;
        }

        let lazy = if force || latency_event != self.latency_event {
            self.latency_event + 1
        } else {
            0
        };
        if plus_us != 0 || minus_us != 0 || lazy != 0 || force {
            done.ticker = Some(TickerUpdate {
                ticks_drift_plus: us_to_ticks(plus_us),
                ticks_drift_minus: us_to_ticks(minus_us),
                lazy,
                force,
            });
        }
        done
    }

    fn terminated(&mut self, mut done: Done, reason: u8) -> Done {
        if CONFIG.trace_conn_terminate {
            debug!("conn {}: terminated, reason {:#x}", self.handle, reason);
        }
        self.state = State::Idle;
        done.terminate = Some(reason);
        done
    }
}
