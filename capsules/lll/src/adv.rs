// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Advertiser.
//!
//! A legacy advertising event sends the advertising PDU on each enabled
//! primary channel in turn. Connectable and scannable types listen one
//! inter frame space after each PDU: a SCAN_REQ is answered with a
//! SCAN_RSP, an accepted CONNECT_IND ends advertising and hands a
//! peripheral [`Connection`] to the controller.
//!
//! Extended advertising sends ADV_EXT_IND on the primary channels, each
//! pointing at a single AUX_ADV_IND on a secondary channel. The auxiliary
//! event is a one-shot chain event of the same role. Data that does not
//! fit the AUX_ADV_IND follows in AUX_CHAIN_IND PDUs, one auxiliary frame
//! space apart, from the radio interrupt.
//!
//! ```text
//!   | 37 | 38 | 39 |        | AUX_ADV_IND | MAFS | AUX_CHAIN_IND |
//!      \____\____\_AuxPtr__/        \____AuxPtr____/
//! ```
//!
//! Advertising and scan response data reach the radio context through
//! double buffers, so the host can replace them while advertising.

use kernel::config::CONFIG;
use kernel::debug;
use kernel::hil::ble::{Phy, RadioChannel};
use kernel::hil::ticker::{us_to_ticks, TickerUpdate};
use kernel::ErrorCode;

use crate::chan::{
    self, ChannelMap, ADVERTISING_ACCESS_ADDRESS, ADVERTISING_CRC_INIT, DATA_CHANNEL_COUNT,
};
use crate::conn::Connection;
use crate::dbuf::DoubleBuffer;
use crate::done::{Done, EventKind};
use crate::drift::sca_ppm;
use crate::mem::{PduHandle, PduPool};
use crate::params::{
    ADV_INTERVAL_MIN_US, ADV_RANDOM_DELAY_US, AUX_DATA_CHUNK, CONN_UNIT_US, EVENT_START_US,
    EXT_ADV_DATA_MAX, LEGACY_ADV_DATA_MAX, LOCAL_SCA, MAFS_US, TICKER_JITTER_US,
};
use crate::pdu::{
    self, Adi, AdvHeader, AdvHeaderVal, AuxPtr, ConnectInd, DeviceAddress, ExtHeader, SyncInfo,
    ADDR_LEN, AUX_PTR_LEN, CONNECT_IND_LEN, HEADER_LEN, LEGACY_ADV_PAYLOAD_MAX, PDU_SIZE,
};
use crate::role::{
    chain_remainder_us, ticks_start, AcceptList, Env, Handoff, Schedule, CONNECT_IND_PDU_LEN,
};
use crate::sched::{AbortDecision, PrepareParam};
use crate::ull::{RxKind, RxMeta};

/// Payload of an ADV_EXT_IND carrying ADI and AuxPtr only.
const EXT_PRIMARY_PAYLOAD: usize = 2 + 2 + AUX_PTR_LEN;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdvType {
    Ind,
    DirectInd,
    NonconnInd,
    ScanInd,
    /// Non-connectable, non-scannable extended advertising.
    Extended,
}

impl AdvType {
    pub fn is_connectable(self) -> bool {
        matches!(self, AdvType::Ind | AdvType::DirectInd)
    }

    pub fn is_scannable(self) -> bool {
        matches!(self, AdvType::Ind | AdvType::ScanInd)
    }

    fn pdu_type(self) -> u8 {
        match self {
            AdvType::Ind => AdvHeader::PDU_TYPE::AdvInd.value,
            AdvType::DirectInd => AdvHeader::PDU_TYPE::AdvDirectInd.value,
            AdvType::NonconnInd => AdvHeader::PDU_TYPE::AdvNonconnInd.value,
            AdvType::ScanInd => AdvHeader::PDU_TYPE::AdvScanInd.value,
            AdvType::Extended => AdvHeader::PDU_TYPE::AdvExt.value,
        }
    }
}

/// Advertising filter policy bits.
pub mod filter_policy {
    /// Scan requests only from the accept list.
    pub const SCAN: u8 = 1 << 0;
    /// Connect requests only from the accept list.
    pub const CONNECT: u8 = 1 << 1;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AdvParams {
    pub adv_type: AdvType,
    pub own_addr: DeviceAddress,
    /// Target of directed advertising.
    pub peer_addr: Option<DeviceAddress>,
    /// Primary channels, bit 0 for channel 37 through bit 2 for 39.
    pub channel_map: u8,
    pub filter_policy: u8,
    pub interval_us: u32,
    /// Report received scan requests.
    pub scan_req_notify: bool,
    /// PHY of the auxiliary PDUs.
    pub secondary_phy: Phy,
    /// Advertising set id.
    pub sid: u8,
}

impl AdvParams {
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if self.channel_map & 0x7 == 0 || self.interval_us < ADV_INTERVAL_MIN_US {
            return Err(ErrorCode::INVAL);
        }
        if self.adv_type == AdvType::DirectInd && self.peer_addr.is_none() {
            return Err(ErrorCode::INVAL);
        }
        if self.sid > 0xF {
            return Err(ErrorCode::INVAL);
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    /// Sending on a primary channel.
    Primary,
    /// Waiting for a SCAN_REQ or CONNECT_IND.
    Listen,
    ScanRsp,
    /// Sending the AUX_ADV_IND or an AUX_CHAIN_IND.
    Aux,
}

/// Channel index of the lowest primary channel in `mask`.
fn first_channel(mask: u8) -> Option<u8> {
    (0..3).find(|bit| mask & (1 << bit) != 0).map(|bit| 37 + bit)
}

fn connect_params_valid(ind: &ConnectInd) -> bool {
    ind.interval != 0
        && ind.win_size != 0
        && ind.timeout != 0
        && (5..=16).contains(&ind.hop)
        && ind.channel_map.is_valid()
}

pub struct Advertiser<'a> {
    handle: u8,
    params: AdvParams,
    accept: AcceptList,
    adv_data: &'a DoubleBuffer,
    scan_data: &'a DoubleBuffer,

    state: State,
    /// Primary channels left in this event, bit 0 for channel 37.
    chan_left: u8,
    /// Primary PDUs already sent in this event.
    primary_index: u32,
    ticks_start: u32,
    start_us: u32,
    tx_count: u16,
    rx_count: u16,
    handoff: Option<Handoff>,

    did: u16,
    /// Secondary channel selection counter.
    aux_counter: u16,
    aux_channel: u8,
    /// AUX_ADV_IND start after the primary event's radio start.
    aux_offset_us: u32,
    /// Schedule the controller has not started a chain ticker for yet.
    aux_pending: Option<Schedule>,
    /// Schedule of the next auxiliary event.
    aux_scheduled: Option<Schedule>,
    aux_next: Option<PduHandle>,
    aux_next_channel: u8,
    aux_start_us: u32,
    aux_air_us: u32,
    sync_info: Option<SyncInfo>,
    /// Slot of the periodic advertising train of this set.
    periodic: Option<u8>,
}

impl<'a> Advertiser<'a> {
    pub fn new(
        handle: u8,
        params: AdvParams,
        accept: AcceptList,
        adv_data: &'a DoubleBuffer,
        scan_data: &'a DoubleBuffer,
    ) -> Result<Advertiser<'a>, ErrorCode> {
        params.validate()?;
        Ok(Advertiser {
            handle,
            params,
            accept,
            adv_data,
            scan_data,
            state: State::Idle,
            chan_left: 0,
            primary_index: 0,
            ticks_start: 0,
            start_us: 0,
            tx_count: 0,
            rx_count: 0,
            handoff: None,
            did: 0,
            aux_counter: 0,
            aux_channel: 0,
            aux_offset_us: 0,
            aux_pending: None,
            aux_scheduled: None,
            aux_next: None,
            aux_next_channel: 0,
            aux_start_us: 0,
            aux_air_us: 0,
            sync_info: None,
            periodic: None,
        })
    }

    pub fn handle(&self) -> u8 {
        self.handle
    }

    pub fn params(&self) -> &AdvParams {
        &self.params
    }

    /// Replace the advertising data. Thread context.
    pub fn set_adv_data(&self, pool: &PduPool, data: &[u8]) -> Result<(), ErrorCode> {
        let max = match self.params.adv_type {
            AdvType::Extended => EXT_ADV_DATA_MAX,
            AdvType::DirectInd => 0,
            _ => LEGACY_ADV_DATA_MAX,
        };
        if data.len() > max {
            return Err(ErrorCode::INVAL);
        }
        self.adv_data.publish(pool, data, AUX_DATA_CHUNK)
    }

    /// Replace the scan response data. Thread context.
    pub fn set_scan_data(&self, pool: &PduPool, data: &[u8]) -> Result<(), ErrorCode> {
        if self.params.adv_type == AdvType::Extended {
            return Err(ErrorCode::NOSUPPORT);
        }
        if data.len() > LEGACY_ADV_DATA_MAX {
            return Err(ErrorCode::INVAL);
        }
        self.scan_data.publish(pool, data, LEGACY_ADV_DATA_MAX)
    }

    pub fn periodic(&self) -> Option<u8> {
        self.periodic
    }

    pub fn set_periodic(&mut self, periodic: Option<u8>) {
        self.periodic = periodic;
    }

    /// When the next AUX_ADV_IND goes on air.
    pub fn aux_schedule(&self) -> Option<Schedule> {
        self.aux_scheduled
    }

    /// SyncInfo for the next AUX_ADV_IND only.
    pub fn set_sync_info(&mut self, sync_info: Option<SyncInfo>) {
        self.sync_info = sync_info;
    }

    /// The connection an accepted CONNECT_IND created.
    pub fn take_handoff(&mut self) -> Option<Handoff> {
        self.handoff.take()
    }

    /// An auxiliary event to schedule.
    pub fn take_schedule(&mut self) -> Option<Schedule> {
        self.aux_pending.take()
    }

    pub fn release(&mut self, pool: &PduPool) {
        self.adv_data.release_all(pool);
        self.scan_data.release_all(pool);
    }

    pub fn is_abort(&self, own_event: bool) -> AbortDecision {
        if own_event {
            AbortDecision::Continue
        } else {
            AbortDecision::Cancel
        }
    }

    pub fn prepare(&mut self, env: &Env, param: &PrepareParam, resume: bool) -> Option<Done> {
        if resume {
            return Some(Done::aborted(self.handle, self.kind(param.chain)));
        }
        if param.chain {
            return self.aux_prepare(env, param);
        }
        self.primary_prepare(env, param);
        None
    }

    pub fn isr(&mut self, env: &Env) -> Option<Done> {
        match self.state {
            State::Idle => None,
            State::Primary => {
                self.tx_count += 1;
                if self.listens() {
                    self.arm_listen(env);
                    None
                } else {
                    self.next_primary(env)
                }
            }
            State::Listen => self.listen_rx(env),
            State::ScanRsp => {
                self.tx_count += 1;
                self.next_primary(env)
            }
            State::Aux => {
                self.tx_count += 1;
                self.next_chain(env)
            }
        }
    }

    pub fn abort(&mut self, env: &Env, param: Option<&PrepareParam>) -> Done {
        match param {
            Some(param) => {
                if param.chain {
                    self.aux_scheduled = None;
                }
                Done::aborted(self.handle, self.kind(param.chain))
            }
            None => {
                env.radio.disable();
                let aux = self.state == State::Aux;
                self.state = State::Idle;
                Done::aborted(self.handle, self.kind(aux))
            }
        }
    }

    fn kind(&self, aux: bool) -> EventKind {
        if aux {
            EventKind::AdvAux
        } else {
            EventKind::Adv
        }
    }

    fn is_extended(&self) -> bool {
        self.params.adv_type == AdvType::Extended
    }

    fn listens(&self) -> bool {
        self.params.adv_type.is_connectable() || self.params.adv_type.is_scannable()
    }

    fn adi(&self) -> Adi {
        Adi {
            did: self.did,
            sid: self.params.sid,
        }
    }

    fn primary_spacing_us(&self) -> u32 {
        Phy::Le1M.pdu_air_us(EXT_PRIMARY_PAYLOAD) + MAFS_US
    }

    fn secondary_channel(&mut self) -> u8 {
        let channel = chan::csa2_channel(
            self.aux_counter,
            chan::channel_id(ADVERTISING_ACCESS_ADDRESS),
            &ChannelMap::ALL,
            DATA_CHANNEL_COUNT,
        );
        self.aux_counter = self.aux_counter.wrapping_add(1);
        channel
    }

    fn primary_prepare(&mut self, env: &Env, param: &PrepareParam) {
        let (_, advanced) = self.adv_data.consume_latest(env.pool);
        if advanced {
            self.did = (self.did + 1) & 0x0FFF;
        }
        let _ = self.scan_data.consume_latest(env.pool);

        self.chan_left = self.params.channel_map & 0x7;
        self.primary_index = 0;
        self.tx_count = 0;
        self.rx_count = 0;
        self.ticks_start = ticks_start(param);
        if self.is_extended() {
            self.aux_channel = self.secondary_channel();
            self.aux_offset_us =
                self.chan_left.count_ones() * self.primary_spacing_us() + EVENT_START_US;
        }
        let channel = first_channel(self.chan_left).unwrap_or(37);
        if CONFIG.trace_radio_events {
            debug!("adv {}: event on {}", self.handle, channel);
        }

        let radio = env.radio;
        env.radio_setup(
            Phy::Le1M,
            ADVERTISING_ACCESS_ADDRESS,
            ADVERTISING_CRC_INIT,
            channel,
        );
        self.tx_primary(env);
        self.start_us = radio.tmr_start(true, ticks_start(param), param.remainder);
        radio.tmr_end_capture();
    }

    /// Load the PDU for the current primary channel.
    fn tx_primary(&mut self, env: &Env) {
        let mut out = [0; PDU_SIZE];
        let len = if self.is_extended() {
            let header = ExtHeader {
                adi: Some(self.adi()),
                aux_ptr: Some(AuxPtr {
                    channel: self.aux_channel,
                    ca: sca_ppm(LOCAL_SCA) <= 50,
                    offset_us: self.aux_offset_us - self.primary_index * self.primary_spacing_us(),
                    phy: self.params.secondary_phy,
                }),
                ..ExtHeader::default()
            };
            header.build(&mut out, &[])
        } else {
            let mut data = [0; PDU_SIZE];
            let data_len = self
                .adv_data
                .peek_current()
                .and_then(|h| env.pool.get(h))
                .map_or(0, |buf| buf.read(&mut data));
            let target = match self.params.adv_type {
                AdvType::DirectInd => self.params.peer_addr,
                _ => None,
            };
            let len = pdu::build_adv(
                &mut out,
                self.params.adv_type.pdu_type(),
                &self.params.own_addr,
                target.as_ref(),
                pdu::payload(&data[..data_len]),
            );
            if self.params.adv_type.is_connectable() {
                out[0] |= AdvHeader::CH_SEL::SET.value;
            }
            len
        };

        let radio = env.radio;
        radio.pkt_tx_set(&out[..len]);
        if self.listens() {
            radio.switch_complete_and_rx(Phy::Le1M);
        } else {
            radio.switch_complete_and_disable();
        }
        self.state = State::Primary;
    }

    fn arm_listen(&mut self, env: &Env) {
        let radio = env.radio;
        radio.pkt_rx_set(LEGACY_ADV_PAYLOAD_MAX as u8);
        radio.switch_complete_and_tx(Phy::Le1M);
        radio.tmr_hcto_configure(env.reply_hcto_us(Phy::Le1M));
        radio.tmr_aa_capture();
        radio.tmr_end_capture();
        radio.rssi_measure();
        self.state = State::Listen;
    }

    fn listen_rx(&mut self, env: &Env) -> Option<Done> {
        let radio = env.radio;
        if !radio.is_done() || !radio.crc_is_valid() {
            radio.disable();
            return self.next_primary(env);
        }
        self.rx_count += 1;

        let mut buf = [0; PDU_SIZE];
        let rx = env.rx_pdu(&mut buf);
        let pdu_type = rx
            .first()
            .and_then(|h| AdvHeaderVal::new(*h).read_as_enum(AdvHeader::PDU_TYPE));
        match pdu_type {
            Some(AdvHeader::PDU_TYPE::Value::ScanReq) if self.scan_req_accepted(rx) => {
                self.tx_scan_rsp(env, rx);
                None
            }
            Some(AdvHeader::PDU_TYPE::Value::ConnectInd) => {
                radio.disable();
                match self.accept_connect_ind(env, rx) {
                    Some(handoff) => {
                        self.handoff = Some(handoff);
                        Some(self.close(env))
                    }
                    None => self.next_primary(env),
                }
            }
            _ => {
                radio.disable();
                self.next_primary(env)
            }
        }
    }

    fn scan_req_accepted(&self, rx: &[u8]) -> bool {
        if !self.params.adv_type.is_scannable() || pdu::payload_len(rx) != 2 * ADDR_LEN {
            return false;
        }
        match pdu::address_pair(rx) {
            Some((scan_a, adv_a)) => {
                adv_a == self.params.own_addr
                    && (self.params.filter_policy & filter_policy::SCAN == 0
                        || self.accept.contains(&scan_a))
            }
            None => false,
        }
    }

    fn tx_scan_rsp(&mut self, env: &Env, req: &[u8]) {
        let mut data = [0; PDU_SIZE];
        let data_len = self
            .scan_data
            .peek_current()
            .and_then(|h| env.pool.get(h))
            .map_or(0, |buf| buf.read(&mut data));
        let mut out = [0; PDU_SIZE];
        let len = pdu::build_adv(
            &mut out,
            AdvHeader::PDU_TYPE::ScanRsp.value,
            &self.params.own_addr,
            None,
            pdu::payload(&data[..data_len]),
        );
        env.radio.pkt_tx_set(&out[..len]);
        env.radio.switch_complete_and_disable();
        self.state = State::ScanRsp;

        if self.params.scan_req_notify {
            let meta = RxMeta {
                rssi: env.rssi(),
                ticks: self.ticks_start,
                ..RxMeta::new(RxKind::ScanReqReport, self.handle)
            };
            env.report(meta, req, 1);
        }
    }

    /// The peripheral connection of a CONNECT_IND we accept.
    fn accept_connect_ind(&self, env: &Env, rx: &[u8]) -> Option<Handoff> {
        if !self.params.adv_type.is_connectable() || pdu::payload_len(rx) != CONNECT_IND_LEN {
            return None;
        }
        let (init_a, adv_a) = pdu::address_pair(rx)?;
        let allowed = match self.params.adv_type {
            AdvType::DirectInd => self.params.peer_addr == Some(init_a),
            _ => {
                self.params.filter_policy & filter_policy::CONNECT == 0
                    || self.accept.contains(&init_a)
            }
        };
        if adv_a != self.params.own_addr || !allowed {
            return None;
        }
        // connection complete and channel selection reports
        env.rx.alloc_peek(2)?;
        let ind = ConnectInd::parse(&pdu::payload(rx)[2 * ADDR_LEN..])
            .filter(connect_params_valid)?;
        let mut connect_ind = [0; CONNECT_IND_PDU_LEN];
        connect_ind.copy_from_slice(rx.get(..CONNECT_IND_PDU_LEN)?);

        let csa2 = AdvHeaderVal::new(rx[0]).is_set(AdvHeader::CH_SEL);
        let conn = Connection::new_peripheral(&ind, csa2, Phy::Le1M);
        let radio = env.radio;
        let offset_us = (radio.tmr_end_get() + CONN_UNIT_US * (1 + ind.win_offset as u32))
            .saturating_sub(
                radio.rx_chain_delay_us(Phy::Le1M)
                    + radio.rx_ready_delay_us(Phy::Le1M)
                    + (TICKER_JITTER_US << 1),
            );
        let period_us = conn.interval_us() - conn.periodic_widening_us();
        Some(Handoff::Connection {
            conn,
            first: Schedule {
                ticks_anchor: self.ticks_start,
                offset_us,
            },
            period_us,
            connect_ind,
            csa2,
        })
    }

    fn next_primary(&mut self, env: &Env) -> Option<Done> {
        self.chan_left &= self.chan_left.wrapping_sub(1);
        self.primary_index += 1;
        let channel = match first_channel(self.chan_left) {
            Some(channel) => channel,
            None => return Some(self.close(env)),
        };
        let radio = env.radio;
        if let Some(channel) = RadioChannel::from_index(channel) {
            radio.freq_chan_set(channel);
        }
        self.tx_primary(env);
        if self.is_extended() {
            radio.tmr_start_us(
                true,
                self.start_us + self.primary_index * self.primary_spacing_us(),
            );
        } else {
            radio.tmr_start_now(true);
        }
        radio.tmr_end_capture();
        None
    }

    fn close(&mut self, env: &Env) -> Done {
        self.state = State::Idle;
        let mut done = Done::new(self.handle, EventKind::Adv);
        done.tx_count = self.tx_count;
        done.rx_count = self.rx_count;
        if self.handoff.is_some() {
            return done;
        }
        if self.is_extended() {
            let when = Schedule {
                ticks_anchor: self.ticks_start,
                offset_us: self.start_us + self.aux_offset_us,
            };
            self.aux_pending = Some(when);
            self.aux_scheduled = Some(when);
        }
        let delay_us = env.rng.random() % (ADV_RANDOM_DELAY_US + 1);
        done.ticker = Some(TickerUpdate {
            ticks_drift_plus: us_to_ticks(delay_us),
            ..TickerUpdate::default()
        });
        done
    }

    fn aux_prepare(&mut self, env: &Env, param: &PrepareParam) -> Option<Done> {
        let when = match self.aux_scheduled.take() {
            Some(when) => when,
            None => return Some(Done::aborted(self.handle, EventKind::AdvAux)),
        };
        let remainder = chain_remainder_us(when.ticks_anchor, when.offset_us, param.ticks_at_expire);
        self.tx_count = 0;
        self.rx_count = 0;
        env.radio_setup(
            self.params.secondary_phy,
            ADVERTISING_ACCESS_ADDRESS,
            ADVERTISING_CRC_INIT,
            self.aux_channel,
        );
        self.tx_aux(env, self.adv_data.peek_current(), true);
        self.sync_info = None;
        self.aux_start_us = env.radio.tmr_start(true, ticks_start(param), remainder);
        None
    }

    /// Load the auxiliary PDU built from `data`, pointing at the next chain
    /// buffer if there is one.
    fn tx_aux(&mut self, env: &Env, data: Option<PduHandle>, first: bool) {
        let phy = self.params.secondary_phy;
        let mut chunk = [0; PDU_SIZE];
        let (len, next) = data
            .and_then(|h| env.pool.get(h))
            .map_or((0, None), |buf| (buf.read(&mut chunk), buf.next()));

        let mut header = ExtHeader {
            adv_a: first.then_some(self.params.own_addr),
            adi: Some(self.adi()),
            sync_info: if first { self.sync_info } else { None },
            ..ExtHeader::default()
        };
        if next.is_some() {
            self.aux_next_channel = self.secondary_channel();
            header.aux_ptr = Some(AuxPtr {
                channel: self.aux_next_channel,
                ca: sca_ppm(LOCAL_SCA) <= 50,
                offset_us: 0,
                phy,
            });
        }
        let mut out = [0; PDU_SIZE];
        let pdu_len = header.build(&mut out, pdu::payload(&chunk[..len]));
        self.aux_air_us = phy.pdu_air_us(pdu_len - HEADER_LEN);
        // the offset depends on this PDU's own air time
        if let (Some(ptr), Some(at)) = (header.aux_ptr, header.aux_ptr_offset()) {
            AuxPtr {
                offset_us: self.aux_air_us + MAFS_US,
                ..ptr
            }
            .write(&mut out[at..at + AUX_PTR_LEN]);
        }
        env.radio.pkt_tx_set(&out[..pdu_len]);
        env.radio.switch_complete_and_disable();
        self.aux_next = next;
        self.state = State::Aux;
    }

    fn next_chain(&mut self, env: &Env) -> Option<Done> {
        let next = match self.aux_next {
            Some(next) => next,
            None => {
                self.state = State::Idle;
                let mut done = Done::new(self.handle, EventKind::AdvAux);
                done.tx_count = self.tx_count;
                return Some(done);
            }
        };
        if let Some(channel) = RadioChannel::from_index(self.aux_next_channel) {
            env.radio.freq_chan_set(channel);
        }
        self.aux_start_us += self.aux_air_us + MAFS_US;
        self.tx_aux(env, Some(next), false);
        env.radio.tmr_start_us(true, self.aux_start_us);
        None
    }
}
