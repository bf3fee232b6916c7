// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Scanner and initiator.
//!
//! Each scan window listens on one primary advertising channel, rotating
//! 37, 38, 39 from window to window. The receiver is re-armed after every
//! PDU until the window ends, with the header complete timeout pinned to
//! the end of the window.
//!
//! - A passive scanner reports what it hears.
//! - An active scanner also sends one SCAN_REQ per window to a scannable
//!   advertiser and reports the SCAN_RSP.
//! - An initiator answers a connectable advertiser it is allowed to
//!   connect to with a CONNECT_IND and hands a central [`Connection`] to
//!   the controller.
//!
//! ADV_EXT_IND PDUs are followed to their AUX_ADV_IND and chained
//! AUX_CHAIN_IND PDUs, from the radio interrupt when the AuxPtr offset is
//! short and through a one-shot chain event otherwise. A SyncInfo from the
//! advertising set the scanner was asked to sync to creates a
//! [`PeriodicSync`].
//!
//! The scan window yields to overlapping events and resumes after them,
//! except while a CONNECT_IND is on air.

use kernel::config::CONFIG;
use kernel::debug;
use kernel::hil::ble::{Phy, RadioChannel};
use kernel::ErrorCode;

use crate::chan::{self, ChannelMap, ADVERTISING_ACCESS_ADDRESS, ADVERTISING_CRC_INIT};
use crate::conn::Connection;
use crate::done::{Done, EventKind};
use crate::params::{AUX_INLINE_MAX_US, CONN_UNIT_US, LOCAL_SCA, SUPERVISION_UNIT_US};
use crate::pdu::{
    self, Adi, AdvHeader, AdvHeaderVal, AuxPtr, ConnectInd, DeviceAddress, ExtHeader, ADDR_LEN,
    LEGACY_ADV_PAYLOAD_MAX, PAYLOAD_MAX, PDU_SIZE,
};
use crate::role::{ticks_start, AcceptList, AuxWindow, Env, Handoff, Schedule, CONNECT_IND_PDU_LEN};
use crate::sched::{AbortDecision, PrepareParam};
use crate::sync::PeriodicSync;
use crate::ull::{RxKind, RxMeta, RxStatus};

/// Shortest scan interval and window, 2.5 ms.
const SCAN_WINDOW_MIN_US: u32 = 2500;

/// Shortest connection interval, 7.5 ms.
const CONN_INTERVAL_MIN: u16 = 6;

/// Scanner filter policy bits.
pub mod filter_policy {
    /// Advertisers only from the accept list.
    pub const ACCEPT_LIST: u8 = 1 << 0;
    /// Also accept directed advertising to a resolvable private address.
    pub const DIRECTED_RPA: u8 = 1 << 1;
}

/// Connection parameters of an initiator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InitParams {
    /// Advertiser to connect to, or any on the accept list.
    pub peer: Option<DeviceAddress>,
    /// Connection interval in 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub timeout: u16,
    pub channel_map: ChannelMap,
}

/// Periodic advertising train to sync to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncTarget {
    pub adv_addr: DeviceAddress,
    pub sid: u8,
    /// Sync supervision timeout in 10 ms units.
    pub timeout: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScanParams {
    pub active: bool,
    pub own_addr: DeviceAddress,
    pub interval_us: u32,
    pub window_us: u32,
    pub filter_policy: u8,
    /// Connect instead of reporting.
    pub initiate: Option<InitParams>,
    pub sync: Option<SyncTarget>,
}

impl ScanParams {
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if self.window_us < SCAN_WINDOW_MIN_US
            || self.window_us > self.interval_us
            || self.filter_policy > 0x3
        {
            return Err(ErrorCode::INVAL);
        }
        if let Some(init) = self.initiate {
            let interval_us = init.interval as u32 * CONN_UNIT_US;
            // the timeout must outlast two latency-stretched intervals
            let min_timeout_us = 2 * (1 + init.latency as u32) * interval_us;
            if init.interval < CONN_INTERVAL_MIN
                || !init.channel_map.is_valid()
                || init.timeout as u32 * SUPERVISION_UNIT_US <= min_timeout_us
            {
                return Err(ErrorCode::INVAL);
            }
        }
        if let Some(sync) = self.sync {
            if sync.sid > 0xF || sync.timeout == 0 {
                return Err(ErrorCode::INVAL);
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    /// Listening on the primary channel.
    Rx,
    ScanReq,
    /// Waiting for the SCAN_RSP.
    ScanRsp,
    ConnectInd,
    /// Receiving an AUX_ADV_IND or AUX_CHAIN_IND.
    Aux,
}

/// A CONNECT_IND on air.
#[derive(Copy, Clone)]
struct Connecting {
    ind: ConnectInd,
    pdu: [u8; CONNECT_IND_PDU_LEN],
    csa2: bool,
}

/// AdvA of a legacy advertising PDU.
fn adv_address(rx: &[u8]) -> Option<DeviceAddress> {
    let header = AdvHeaderVal::new(*rx.first()?);
    Some(DeviceAddress {
        addr: pdu::payload(rx).get(..ADDR_LEN)?.try_into().ok()?,
        random: header.is_set(AdvHeader::TX_ADD),
    })
}

pub struct Scanner {
    handle: u8,
    params: ScanParams,
    accept: AcceptList,

    state: State,
    /// Primary channel of the next window.
    next_channel: u8,
    channel: u8,
    /// Tick the radio timer of the current event started from.
    ticks: u32,
    window_end_us: u32,
    tx_count: u16,
    rx_count: u16,
    incomplete: bool,

    req_sent: bool,
    req_target: Option<DeviceAddress>,
    connecting: Option<Connecting>,
    handoff: Option<Handoff>,

    /// Advertising set of the auxiliary PDUs being followed.
    aux_adv_a: Option<DeviceAddress>,
    aux_adi: Option<Adi>,
    aux_phy: Phy,
    /// Part of an auxiliary chain went up; losing the rest must be
    /// reported.
    aux_reported: bool,
    chain_event: bool,
    chain_window: Option<AuxWindow>,
    chain_pending: Option<Schedule>,
    chain_scheduled: Option<Schedule>,
}

impl Scanner {
    pub fn new(handle: u8, params: ScanParams, accept: AcceptList) -> Result<Scanner, ErrorCode> {
        params.validate()?;
        Ok(Scanner {
            handle,
            params,
            accept,
            state: State::Idle,
            next_channel: 37,
            channel: 37,
            ticks: 0,
            window_end_us: 0,
            tx_count: 0,
            rx_count: 0,
            incomplete: false,
            req_sent: false,
            req_target: None,
            connecting: None,
            handoff: None,
            aux_adv_a: None,
            aux_adi: None,
            aux_phy: Phy::Le1M,
            aux_reported: false,
            chain_event: false,
            chain_window: None,
            chain_pending: None,
            chain_scheduled: None,
        })
    }

    pub fn handle(&self) -> u8 {
        self.handle
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    pub fn is_initiator(&self) -> bool {
        self.params.initiate.is_some()
    }

    /// A connection or periodic sync created by the last radio interrupt.
    pub fn take_handoff(&mut self) -> Option<Handoff> {
        self.handoff.take()
    }

    /// A chain event to schedule.
    pub fn take_schedule(&mut self) -> Option<Schedule> {
        self.chain_pending.take()
    }

    pub fn is_abort(&self) -> AbortDecision {
        if self.state == State::ConnectInd {
            AbortDecision::Continue
        } else if self.chain_event {
            AbortDecision::Cancel
        } else {
            AbortDecision::Resume
        }
    }

    pub fn prepare(&mut self, env: &Env, param: &PrepareParam, resume: bool) -> Option<Done> {
        if param.chain {
            if resume {
                return Some(Done::aborted(self.handle, EventKind::Scan));
            }
            return self.chain_prepare(env, param);
        }
        if !resume {
            self.channel = self.next_channel;
            self.next_channel = if self.channel >= 39 { 37 } else { self.channel + 1 };
            self.req_sent = false;
        }
        if CONFIG.trace_radio_events {
            debug!("scan {}: window on {}, resume {}", self.handle, self.channel, resume);
        }
        self.tx_count = 0;
        self.rx_count = 0;
        self.incomplete = false;

        let radio = env.radio;
        env.radio_setup(
            Phy::Le1M,
            ADVERTISING_ACCESS_ADDRESS,
            ADVERTISING_CRC_INIT,
            self.channel,
        );
        self.ticks = ticks_start(param);
        self.arm_primary(env);
        // a resumed window gets its full length again
        let start_us = if resume {
            radio.tmr_start_now(false)
        } else {
            radio.tmr_start(false, self.ticks, param.remainder)
        };
        self.window_end_us = start_us + self.params.window_us;
        radio.tmr_hcto_configure(self.window_end_us);
        radio.tmr_aa_capture();
        radio.tmr_end_capture();
        radio.rssi_measure();
        None
    }

    pub fn isr(&mut self, env: &Env) -> Option<Done> {
        match self.state {
            State::Idle => None,
            State::Rx => self.primary_rx(env),
            State::ScanReq => {
                self.tx_count += 1;
                let radio = env.radio;
                radio.pkt_rx_set(LEGACY_ADV_PAYLOAD_MAX as u8);
                radio.switch_complete_and_disable();
                radio.tmr_hcto_configure(env.reply_hcto_us(Phy::Le1M));
                radio.tmr_aa_capture();
                radio.tmr_end_capture();
                radio.rssi_measure();
                self.state = State::ScanRsp;
                None
            }
            State::ScanRsp => self.scan_rsp_rx(env),
            State::ConnectInd => {
                self.tx_count += 1;
                self.connected(env);
                Some(self.close())
            }
            State::Aux => self.aux_rx(env),
        }
    }

    pub fn abort(&mut self, env: &Env, param: Option<&PrepareParam>) -> Done {
        let mut done = Done::aborted(self.handle, EventKind::Scan);
        match param {
            Some(param) => {
                if param.chain {
                    self.chain_scheduled = None;
                    self.chain_window = None;
                    self.aux_lost(env);
                    done.incomplete = true;
                }
            }
            None => {
                env.radio.disable();
                if self.state == State::Aux {
                    self.aux_lost(env);
                    done.incomplete = true;
                }
                self.connecting = None;
                self.chain_event = false;
                self.state = State::Idle;
            }
        }
        done
    }

    /// Receive on the primary channel, replying at T_IFS when we may send
    /// a SCAN_REQ or CONNECT_IND.
    fn arm_primary(&mut self, env: &Env) {
        let radio = env.radio;
        radio.pkt_rx_set(PAYLOAD_MAX as u8);
        if self.params.active || self.is_initiator() {
            radio.switch_complete_and_tx(Phy::Le1M);
        } else {
            radio.switch_complete_and_disable();
        }
        self.state = State::Rx;
    }

    /// Listen again for the rest of the window.
    fn restart_rx(&mut self, env: &Env) -> Option<Done> {
        let radio = env.radio;
        radio.disable();
        let now_us = radio.tmr_end_get();
        if now_us >= self.window_end_us {
            return Some(self.close());
        }
        radio.phy_set(Phy::Le1M);
        if let Some(channel) = RadioChannel::from_index(self.channel) {
            radio.freq_chan_set(channel);
        }
        self.arm_primary(env);
        radio.tmr_start_us(false, now_us);
        radio.tmr_hcto_configure(self.window_end_us);
        radio.tmr_aa_capture();
        radio.tmr_end_capture();
        radio.rssi_measure();
        None
    }

    fn primary_rx(&mut self, env: &Env) -> Option<Done> {
        let radio = env.radio;
        if !radio.is_done() {
            radio.disable();
            return Some(self.close());
        }
        self.rx_count += 1;
        if !radio.crc_is_valid() {
            return self.restart_rx(env);
        }

        let mut buf = [0; PDU_SIZE];
        let rx = env.rx_pdu(&mut buf);
        let pdu_type = rx
            .first()
            .and_then(|h| AdvHeaderVal::new(*h).read_as_enum(AdvHeader::PDU_TYPE));
        match pdu_type {
            Some(AdvHeader::PDU_TYPE::Value::AdvInd)
            | Some(AdvHeader::PDU_TYPE::Value::AdvScanInd)
            | Some(AdvHeader::PDU_TYPE::Value::AdvNonconnInd) => {
                match adv_address(rx) {
                    Some(adv_a) => self.legacy_rx(env, rx, adv_a, None),
                    None => self.restart_rx(env),
                }
            }
            Some(AdvHeader::PDU_TYPE::Value::AdvDirectInd) => match pdu::address_pair(rx) {
                Some((adv_a, target)) => self.legacy_rx(env, rx, adv_a, Some(target)),
                None => self.restart_rx(env),
            },
            Some(AdvHeader::PDU_TYPE::Value::AdvExt) => self.ext_rx(env, rx),
            _ => self.restart_rx(env),
        }
    }

    fn target_is_us(&self, target: &DeviceAddress) -> bool {
        *target == self.params.own_addr
            || (self.params.filter_policy & filter_policy::DIRECTED_RPA != 0
                && target.is_resolvable_private())
    }

    fn adv_allowed(&self, adv_a: &DeviceAddress) -> bool {
        match self.params.initiate {
            Some(InitParams {
                peer: Some(peer), ..
            }) => peer == *adv_a,
            Some(_) => self.accept.contains(adv_a),
            None => {
                self.params.filter_policy & filter_policy::ACCEPT_LIST == 0
                    || self.accept.contains(adv_a)
            }
        }
    }

    fn report_meta(&self, env: &Env, pdu_start_us: u32) -> RxMeta {
        RxMeta {
            rssi: env.rssi(),
            ticks: self.ticks,
            offset_us: pdu_start_us,
            ..RxMeta::new(RxKind::AdvReport, self.handle)
        }
    }

    fn pdu_start_us(&self, env: &Env, phy: Phy) -> u32 {
        env.radio.tmr_aa_get().saturating_sub(phy.addr_us())
    }

    fn legacy_rx(
        &mut self,
        env: &Env,
        rx: &[u8],
        adv_a: DeviceAddress,
        target: Option<DeviceAddress>,
    ) -> Option<Done> {
        if target.map_or(false, |t| !self.target_is_us(&t)) || !self.adv_allowed(&adv_a) {
            return self.restart_rx(env);
        }
        let header = AdvHeaderVal::new(rx[0]);
        let pdu_type = header.read(AdvHeader::PDU_TYPE);
        let connectable = pdu_type == AdvHeader::PDU_TYPE::AdvInd.value
            || pdu_type == AdvHeader::PDU_TYPE::AdvDirectInd.value;

        if let Some(init) = self.params.initiate {
            // connection complete and channel selection reports
            if connectable
                && env.rx.alloc_peek(2).is_some()
                && self.tx_connect_ind(env, &init, adv_a, header.is_set(AdvHeader::CH_SEL))
            {
                return None;
            }
            return self.restart_rx(env);
        }

        let meta = self.report_meta(env, self.pdu_start_us(env, Phy::Le1M));
        if !env.report(meta, rx, 1) {
            return self.restart_rx(env);
        }
        let scannable = pdu_type == AdvHeader::PDU_TYPE::AdvInd.value
            || pdu_type == AdvHeader::PDU_TYPE::AdvScanInd.value;
        if self.params.active && scannable && !self.req_sent && env.rx.alloc_peek(1).is_some() {
            let mut out = [0; PDU_SIZE];
            let len = pdu::build_scan_req(&mut out, &self.params.own_addr, &adv_a);
            env.radio.pkt_tx_set(&out[..len]);
            env.radio.switch_complete_and_rx(Phy::Le1M);
            self.req_sent = true;
            self.req_target = Some(adv_a);
            self.state = State::ScanReq;
            return None;
        }
        self.restart_rx(env)
    }

    fn scan_rsp_rx(&mut self, env: &Env) -> Option<Done> {
        let radio = env.radio;
        if radio.is_done() {
            self.rx_count += 1;
        }
        if radio.is_done() && radio.crc_is_valid() {
            let mut buf = [0; PDU_SIZE];
            let rx = env.rx_pdu(&mut buf);
            let is_rsp = rx.first().map_or(false, |h| {
                AdvHeaderVal::new(*h).read(AdvHeader::PDU_TYPE) == AdvHeader::PDU_TYPE::ScanRsp.value
            });
            if is_rsp && adv_address(rx).is_some() && adv_address(rx) == self.req_target {
                let meta = self.report_meta(env, self.pdu_start_us(env, Phy::Le1M));
                env.report(meta, rx, 1);
            }
        }
        self.req_target = None;
        self.restart_rx(env)
    }

    /// Answer with a CONNECT_IND. False if no access address could be
    /// drawn, leaving the radio to the caller.
    fn tx_connect_ind(
        &mut self,
        env: &Env,
        init: &InitParams,
        adv_a: DeviceAddress,
        csa2: bool,
    ) -> bool {
        let rng = env.rng;
        let access_address = match chan::access_address_generate(rng) {
            Ok(aa) => aa,
            Err(_) => return false,
        };
        let ind = ConnectInd {
            access_address,
            crc_init: rng.random() & 0xFF_FFFF,
            win_size: 1,
            win_offset: 0,
            interval: init.interval,
            latency: init.latency,
            timeout: init.timeout,
            channel_map: init.channel_map,
            hop: 5 + (rng.random() % 12) as u8,
            sca: LOCAL_SCA,
        };
        let mut out = [0; PDU_SIZE];
        let len = ind.build(&mut out, &self.params.own_addr, &adv_a, true);
        env.radio.pkt_tx_set(&out[..len]);
        env.radio.switch_complete_and_disable();
        let mut pdu = [0; CONNECT_IND_PDU_LEN];
        pdu.copy_from_slice(&out[..CONNECT_IND_PDU_LEN]);
        self.connecting = Some(Connecting { ind, pdu, csa2 });
        self.state = State::ConnectInd;
        true
    }

    /// The CONNECT_IND went out: the central's first event starts one
    /// transmit window delay and offset after it.
    fn connected(&mut self, env: &Env) {
        let connecting = match self.connecting.take() {
            Some(connecting) => connecting,
            None => return,
        };
        let ind = connecting.ind;
        let radio = env.radio;
        let offset_us = (radio.tmr_end_get() + CONN_UNIT_US * (1 + ind.win_offset as u32))
            .saturating_sub(
                radio.tx_chain_delay_us(Phy::Le1M) + radio.tx_ready_delay_us(Phy::Le1M),
            );
        let conn = Connection::new_central(&ind, connecting.csa2, Phy::Le1M);
        let period_us = conn.interval_us();
        self.handoff = Some(Handoff::Connection {
            conn,
            first: Schedule {
                ticks_anchor: self.ticks,
                offset_us,
            },
            period_us,
            connect_ind: connecting.pdu,
            csa2: connecting.csa2,
        });
    }

    /// ADV_EXT_IND on the primary channel.
    fn ext_rx(&mut self, env: &Env, rx: &[u8]) -> Option<Done> {
        let ext = match ExtHeader::parse(rx) {
            Some((ext, _)) if !self.is_initiator() => ext,
            _ => return self.restart_rx(env),
        };
        if ext.adv_a.map_or(false, |a| !self.adv_allowed(&a))
            || ext.target_a.map_or(false, |t| !self.target_is_us(&t))
        {
            return self.restart_rx(env);
        }
        let pdu_start_us = self.pdu_start_us(env, Phy::Le1M);
        match ext.aux_ptr {
            Some(ptr) => {
                self.aux_adv_a = ext.adv_a;
                self.aux_adi = ext.adi;
                self.aux_reported = false;
                if self.follow(env, &ptr, pdu_start_us) {
                    None
                } else {
                    self.restart_rx(env)
                }
            }
            None => {
                let meta = self.report_meta(env, pdu_start_us);
                env.report(meta, rx, 1);
                self.restart_rx(env)
            }
        }
    }

    /// Go after the PDU `ptr` points at. Returns true if it is received
    /// from this event.
    fn follow(&mut self, env: &Env, ptr: &AuxPtr, pdu_start_us: u32) -> bool {
        let window = AuxWindow::new(env.radio, ptr, pdu_start_us);
        self.aux_phy = ptr.phy;
        if ptr.offset_us < AUX_INLINE_MAX_US {
            env.radio.disable();
            env.aux_rx_inline(&window);
            self.state = State::Aux;
            return true;
        }
        if self.chain_scheduled.is_some() {
            // one chain event at a time
            self.aux_lost(env);
            return false;
        }
        let when = Schedule {
            ticks_anchor: self.ticks,
            offset_us: window.enable_us,
        };
        self.chain_window = Some(window);
        self.chain_pending = Some(when);
        self.chain_scheduled = Some(when);
        false
    }

    fn chain_prepare(&mut self, env: &Env, param: &PrepareParam) -> Option<Done> {
        let (window, when) = match (self.chain_window.take(), self.chain_scheduled.take()) {
            (Some(window), Some(when)) => (window, when),
            _ => return Some(Done::aborted(self.handle, EventKind::Scan)),
        };
        self.tx_count = 0;
        self.rx_count = 0;
        self.incomplete = false;
        self.ticks = ticks_start(param);
        env.aux_rx_scheduled(
            &window,
            ADVERTISING_ACCESS_ADDRESS,
            ADVERTISING_CRC_INIT,
            param,
            &when,
        );
        self.chain_event = true;
        self.state = State::Aux;
        None
    }

    /// AUX_ADV_IND or AUX_CHAIN_IND.
    fn aux_rx(&mut self, env: &Env) -> Option<Done> {
        let radio = env.radio;
        if !radio.is_done() || !radio.crc_is_valid() {
            radio.disable();
            self.aux_lost(env);
            return self.aux_end(env);
        }
        self.rx_count += 1;

        let mut buf = [0; PDU_SIZE];
        let rx = env.rx_pdu(&mut buf);
        let ext = match ExtHeader::parse(rx) {
            Some((ext, _)) => ext,
            None => {
                self.aux_lost(env);
                return self.aux_end(env);
            }
        };
        if ext.adv_a.is_some() {
            self.aux_adv_a = ext.adv_a;
        }
        if ext.adi.is_some() {
            self.aux_adi = ext.adi;
        }
        let pdu_start_us = self.pdu_start_us(env, self.aux_phy);
        if let Some(info) = ext.sync_info {
            self.sync_found(env, &info, pdu_start_us);
        }

        let meta = RxMeta {
            param: ext.aux_ptr.is_some() as u8,
            ..self.report_meta(env, pdu_start_us)
        };
        if !env.report(meta, rx, 1) {
            self.incomplete = true;
            self.aux_reported = false;
            return self.aux_end(env);
        }
        self.aux_reported = true;
        match ext.aux_ptr {
            Some(ptr) if self.follow(env, &ptr, pdu_start_us) => None,
            Some(_) => self.aux_end(env),
            None => {
                self.aux_reported = false;
                self.aux_end(env)
            }
        }
    }

    /// Sync to the train of the advertising set we are looking for.
    fn sync_found(&mut self, env: &Env, info: &pdu::SyncInfo, pdu_start_us: u32) {
        let target = match self.params.sync {
            Some(target) => target,
            None => return,
        };
        let sid = match self.aux_adi {
            Some(adi) => adi.sid,
            None => return,
        };
        if self.aux_adv_a != Some(target.adv_addr) || sid != target.sid {
            return;
        }
        let sync = PeriodicSync::new(info, target.adv_addr, sid, self.aux_phy, target.timeout);
        let first = Schedule {
            ticks_anchor: self.ticks,
            offset_us: sync.first_offset_us(pdu_start_us, env.radio.rx_ready_delay_us(self.aux_phy)),
        };
        let period_us = sync.interval_us() - sync.periodic_widening_us();
        self.handoff = Some(Handoff::Sync {
            sync,
            first,
            period_us,
        });
        self.params.sync = None;
    }

    /// The rest of an auxiliary chain will not be received.
    fn aux_lost(&mut self, env: &Env) {
        if !self.aux_reported {
            return;
        }
        self.aux_reported = false;
        self.incomplete = true;
        let meta = RxMeta {
            status: RxStatus::Incomplete,
            ticks: self.ticks,
            ..RxMeta::new(RxKind::AdvReport, self.handle)
        };
        env.report(meta, &[], 1);
    }

    fn aux_end(&mut self, env: &Env) -> Option<Done> {
        if self.chain_event {
            env.radio.disable();
            Some(self.close())
        } else {
            self.restart_rx(env)
        }
    }

    fn close(&mut self) -> Done {
        self.state = State::Idle;
        self.chain_event = false;
        let mut done = Done::new(self.handle, EventKind::Scan);
        done.tx_count = self.tx_count;
        done.rx_count = self.rx_count;
        done.incomplete = self.incomplete;
        done
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{Bench, Switch};
    use crate::pdu::SyncInfo;
    use std::vec::Vec;

    const OWN: DeviceAddress = DeviceAddress::random([0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]);
    const PEER: DeviceAddress = DeviceAddress::public([0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6]);
    const STRANGER: DeviceAddress = DeviceAddress::public([0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6]);

    fn params(active: bool) -> ScanParams {
        ScanParams {
            active,
            own_addr: OWN,
            interval_us: 100_000,
            window_us: 50_000,
            filter_policy: 0,
            initiate: None,
            sync: None,
        }
    }

    fn init_params() -> ScanParams {
        ScanParams {
            initiate: Some(InitParams {
                peer: Some(PEER),
                interval: 40,
                latency: 0,
                timeout: 100,
                channel_map: ChannelMap::ALL,
            }),
            ..params(false)
        }
    }

    fn scanner(params: ScanParams) -> Scanner {
        Scanner::new(1, params, AcceptList::default()).unwrap()
    }

    fn adv(pdu_type: u8, adv_a: &DeviceAddress, target: Option<&DeviceAddress>, data: &[u8]) -> Vec<u8> {
        let mut out = [0; PDU_SIZE];
        let len = pdu::build_adv(&mut out, pdu_type, adv_a, target, data);
        out[..len].to_vec()
    }

    fn adv_ind(adv_a: &DeviceAddress) -> Vec<u8> {
        let mut pdu = adv(AdvHeader::PDU_TYPE::AdvInd.value, adv_a, None, &[2, 1, 6]);
        pdu[0] |= AdvHeader::CH_SEL.val(1).value;
        pdu
    }

    fn ext(header: ExtHeader, data: &[u8]) -> Vec<u8> {
        let mut out = [0; PDU_SIZE];
        let len = header.build(&mut out, data);
        out[..len].to_vec()
    }

    fn aux_ptr(channel: u8, offset_us: u32) -> AuxPtr {
        AuxPtr {
            channel,
            ca: true,
            offset_us,
            phy: Phy::Le1M,
        }
    }

    fn start(scanner: &mut Scanner, bench: &Bench) {
        bench.radio.end_us.set(0);
        assert_eq!(scanner.prepare(&bench.env(), &PrepareParam::new(0, 0), false), None);
    }

    #[test]
    fn parameters_are_checked() {
        let mut p = params(false);
        p.window_us = 150_000;
        assert!(Scanner::new(0, p, AcceptList::default()).is_err());
        p.window_us = 1000;
        assert!(Scanner::new(0, p, AcceptList::default()).is_err());

        let mut p = init_params();
        if let Some(init) = p.initiate.as_mut() {
            // 100 ms is not above two 50 ms intervals
            init.timeout = 10;
        }
        assert_eq!(
            Scanner::new(0, p, AcceptList::default()).err(),
            Some(ErrorCode::INVAL)
        );
        assert!(Scanner::new(0, init_params(), AcceptList::default()).is_ok());
    }

    #[test]
    fn windows_rotate_primary_channels() {
        let bench = Bench::new();
        let env = bench.env();
        let mut scanner = scanner(params(false));
        for _ in 0..4 {
            scanner.prepare(&env, &PrepareParam::new(0, 7), false);
            assert_eq!(bench.radio.hcto.get(), 7 + 50_000);
            bench.radio.timeout();
            let done = scanner.isr(&env).unwrap();
            assert_eq!(done.kind, EventKind::Scan);
            assert_eq!(done.rx_count, 0);
        }
        assert_eq!(*bench.radio.channels.borrow(), [37, 38, 39, 37]);
        assert_eq!(bench.radio.access_address.get(), ADVERTISING_ACCESS_ADDRESS);
        assert_eq!(bench.radio.switch.get(), Switch::Disable);
    }

    #[test]
    fn passive_scan_reports_and_keeps_listening() {
        let bench = Bench::new();
        let env = bench.env();
        let mut scanner = scanner(params(false));
        start(&mut scanner, &bench);
        bench.radio.rssi.set(Some(70));
        bench.radio.end_us.set(400);
        bench.radio.receive(&adv_ind(&PEER));
        assert_eq!(scanner.isr(&env), None);
        assert_eq!(bench.radio.starts.borrow().last(), Some(&(false, 400)));
        assert_eq!(bench.radio.hcto.get(), 50_000);
        assert_eq!(bench.radio.sent_count(), 0);

        bench.radio.timeout();
        assert_eq!(scanner.isr(&env).map(|d| d.rx_count), Some(1));
        let reports = bench.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0.kind, RxKind::AdvReport);
        assert_eq!(reports[0].0.rssi, 70);
        assert_eq!(reports[0].1, adv_ind(&PEER));
    }

    #[test]
    fn window_end_closes_the_event() {
        let bench = Bench::new();
        let env = bench.env();
        let mut scanner = scanner(params(false));
        start(&mut scanner, &bench);
        bench.radio.end_us.set(50_000);
        bench.radio.receive_corrupt();
        assert!(scanner.isr(&env).is_some());
    }

    #[test]
    fn active_scan_requests_once_per_window() {
        let bench = Bench::new();
        let env = bench.env();
        let mut scanner = scanner(params(true));
        start(&mut scanner, &bench);
        assert_eq!(bench.radio.switch.get(), Switch::Tx);
        bench.radio.receive(&adv_ind(&PEER));
        assert_eq!(scanner.isr(&env), None);
        let mut req = [0; PDU_SIZE];
        let len = pdu::build_scan_req(&mut req, &OWN, &PEER);
        assert_eq!(bench.radio.last_sent(), req[..len]);
        assert_eq!(bench.radio.switch.get(), Switch::Rx);

        bench.radio.transmitted();
        assert_eq!(scanner.isr(&env), None);
        assert!(bench.radio.rx_armed.get());
        let rsp = adv(AdvHeader::PDU_TYPE::ScanRsp.value, &PEER, None, &[3, 9, b'h', b'i']);
        bench.radio.receive(&rsp);
        assert_eq!(scanner.isr(&env), None);

        // a second advertising PDU in the same window gets no request
        bench.radio.receive(&adv_ind(&PEER));
        assert_eq!(scanner.isr(&env), None);
        assert_eq!(bench.radio.sent_count(), 1);

        let reports: Vec<Vec<u8>> = bench.reports().into_iter().map(|(_, p)| p).collect();
        assert_eq!(reports, [adv_ind(&PEER), rsp, adv_ind(&PEER)]);
    }

    #[test]
    fn nonscannable_advertising_gets_no_request() {
        let bench = Bench::new();
        let env = bench.env();
        let mut scanner = scanner(params(true));
        start(&mut scanner, &bench);
        bench.radio.receive(&adv(AdvHeader::PDU_TYPE::AdvNonconnInd.value, &PEER, None, &[]));
        assert_eq!(scanner.isr(&env), None);
        assert_eq!(bench.radio.sent_count(), 0);
        assert_eq!(bench.reports().len(), 1);
    }

    #[test]
    fn accept_list_filters_advertisers() {
        let bench = Bench::new();
        let env = bench.env();
        let mut p = params(false);
        p.filter_policy = filter_policy::ACCEPT_LIST;
        let mut accept = AcceptList::default();
        accept.add(PEER).unwrap();
        let mut scanner = Scanner::new(1, p, accept).unwrap();
        start(&mut scanner, &bench);
        bench.radio.receive(&adv_ind(&STRANGER));
        scanner.isr(&env);
        bench.radio.receive(&adv_ind(&PEER));
        scanner.isr(&env);
        let reports = bench.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(adv_address(&reports[0].1), Some(PEER));
    }

    #[test]
    fn directed_advertising_must_target_us() {
        let bench = Bench::new();
        let env = bench.env();
        let direct = AdvHeader::PDU_TYPE::AdvDirectInd.value;
        let rpa = DeviceAddress::random([1, 1, 1, 1, 1, 0x45]);

        let mut scanner = scanner(params(false));
        start(&mut scanner, &bench);
        bench.radio.receive(&adv(direct, &PEER, Some(&STRANGER), &[]));
        scanner.isr(&env);
        bench.radio.receive(&adv(direct, &PEER, Some(&rpa), &[]));
        scanner.isr(&env);
        bench.radio.receive(&adv(direct, &PEER, Some(&OWN), &[]));
        scanner.isr(&env);
        assert_eq!(bench.reports().len(), 1);

        let mut p = params(false);
        p.filter_policy = filter_policy::DIRECTED_RPA;
        let mut scanner = Scanner::new(1, p, AcceptList::default()).unwrap();
        start(&mut scanner, &bench);
        bench.radio.receive(&adv(direct, &PEER, Some(&rpa), &[]));
        scanner.isr(&env);
        assert_eq!(bench.reports().len(), 1);
    }

    #[test]
    fn initiator_connects_and_hands_over_central() {
        let bench = Bench::new();
        let env = bench.env();
        let mut scanner = scanner(init_params());
        start(&mut scanner, &bench);
        assert_eq!(bench.radio.switch.get(), Switch::Tx);

        // other advertisers and non-connectable PDUs are ignored
        bench.radio.receive(&adv_ind(&STRANGER));
        assert_eq!(scanner.isr(&env), None);
        bench.radio.receive(&adv(AdvHeader::PDU_TYPE::AdvScanInd.value, &PEER, None, &[]));
        assert_eq!(scanner.isr(&env), None);
        assert_eq!(bench.radio.sent_count(), 0);

        bench.radio.receive(&adv_ind(&PEER));
        assert_eq!(scanner.isr(&env), None);
        assert_eq!(scanner.is_abort(), AbortDecision::Continue);
        assert_eq!(bench.radio.switch.get(), Switch::Disable);
        let sent = bench.radio.last_sent();
        assert_eq!(sent.len(), CONNECT_IND_PDU_LEN);
        assert!(AdvHeaderVal::new(sent[0]).is_set(AdvHeader::CH_SEL));
        assert_eq!(pdu::address_pair(&sent), Some((OWN, PEER)));
        let ind = ConnectInd::parse(&pdu::payload(&sent)[2 * ADDR_LEN..]).unwrap();
        assert!(chan::access_address_is_valid(ind.access_address));
        assert!((5..=16).contains(&ind.hop));
        assert_eq!((ind.interval, ind.timeout, ind.win_size), (40, 100, 1));
        assert_eq!(ind.sca, LOCAL_SCA);

        bench.radio.end_us.set(900);
        bench.radio.transmitted();
        let done = scanner.isr(&env).unwrap();
        assert_eq!(done.tx_count, 1);
        match scanner.take_handoff() {
            Some(Handoff::Connection {
                conn,
                first,
                period_us,
                connect_ind,
                csa2,
            }) => {
                assert!(conn.is_central());
                assert!(csa2);
                assert_eq!(connect_ind[..], sent[..]);
                assert_eq!(period_us, 50_000);
                // window delay 1.25 ms after the CONNECT_IND, minus the
                // chain and ramp-up delays
                assert_eq!(first.offset_us, 900 + 1250 - 1 - 40);
                assert_eq!(first.ticks_anchor, ticks_start(&PrepareParam::new(0, 0)));
            }
            _ => panic!("no connection"),
        }
        // no advertising reports while initiating
        assert!(bench.reports().is_empty());
    }

    #[test]
    fn initiator_waits_for_rx_nodes() {
        let bench = Bench::with_rx_nodes(1);
        let env = bench.env();
        let mut scanner = scanner(init_params());
        start(&mut scanner, &bench);
        bench.radio.receive(&adv_ind(&PEER));
        assert_eq!(scanner.isr(&env), None);
        assert_eq!(bench.radio.sent_count(), 0);
        assert!(scanner.take_handoff().is_none());
    }

    #[test]
    fn extended_advertising_is_followed_inline() {
        let bench = Bench::new();
        let env = bench.env();
        let mut scanner = scanner(params(false));
        start(&mut scanner, &bench);
        let adi = Adi { did: 1, sid: 2 };
        bench.radio.aa_us.set(140);
        bench.radio.receive(&ext(
            ExtHeader {
                adi: Some(adi),
                aux_ptr: Some(aux_ptr(5, 600)),
                ..ExtHeader::default()
            },
            &[],
        ));
        assert_eq!(scanner.isr(&env), None);
        // ADV_EXT_IND started at 100, 17 us widening, 40 us ramp-up
        assert_eq!(bench.radio.starts.borrow().last(), Some(&(false, 100 + 600 - 17 - 40)));
        assert_eq!(bench.radio.last_channel(), Some(5));

        let first = ext(
            ExtHeader {
                adv_a: Some(PEER),
                adi: Some(adi),
                aux_ptr: Some(aux_ptr(9, 900)),
                ..ExtHeader::default()
            },
            &[1, 2, 3],
        );
        bench.radio.aa_us.set(740);
        bench.radio.receive(&first);
        assert_eq!(scanner.isr(&env), None);
        assert_eq!(bench.radio.last_channel(), Some(9));

        let chain = ext(ExtHeader::default(), &[4, 5]);
        bench.radio.end_us.set(2000);
        bench.radio.receive(&chain);
        assert_eq!(scanner.isr(&env), None);
        // back on the primary channel for the rest of the window
        assert_eq!(bench.radio.last_channel(), Some(37));
        assert_eq!(bench.radio.starts.borrow().last(), Some(&(false, 2000)));

        let reports: Vec<(u8, Vec<u8>)> =
            bench.reports().into_iter().map(|(m, p)| (m.param, p)).collect();
        assert_eq!(reports, [(1, first), (0, chain)]);
    }

    #[test]
    fn lost_chain_is_reported_incomplete() {
        let bench = Bench::new();
        let env = bench.env();
        let mut scanner = scanner(params(false));
        start(&mut scanner, &bench);
        bench.radio.receive(&ext(
            ExtHeader {
                aux_ptr: Some(aux_ptr(5, 600)),
                ..ExtHeader::default()
            },
            &[],
        ));
        scanner.isr(&env);
        bench.radio.receive(&ext(
            ExtHeader {
                adv_a: Some(PEER),
                aux_ptr: Some(aux_ptr(9, 600)),
                ..ExtHeader::default()
            },
            &[1],
        ));
        scanner.isr(&env);
        bench.radio.timeout();
        assert_eq!(scanner.isr(&env), None);
        bench.radio.timeout();
        let done = scanner.isr(&env).unwrap();
        assert!(done.incomplete);

        let reports = bench.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].0.status, RxStatus::Incomplete);
        assert!(reports[1].1.is_empty());
    }

    #[test]
    fn distant_aux_gets_a_chain_event() {
        let bench = Bench::new();
        let env = bench.env();
        let mut scanner = scanner(params(false));
        start(&mut scanner, &bench);
        bench.radio.aa_us.set(140);
        bench.radio.end_us.set(300);
        bench.radio.receive(&ext(
            ExtHeader {
                aux_ptr: Some(aux_ptr(22, 30_000)),
                ..ExtHeader::default()
            },
            &[],
        ));
        assert_eq!(scanner.isr(&env), None);
        // scanning goes on meanwhile
        assert_eq!(bench.radio.last_channel(), Some(37));
        let when = scanner.take_schedule().unwrap();
        assert_eq!(scanner.take_schedule(), None);
        // 100 ppm over 30 ms is 3 us, plus jitter
        assert_eq!(when.offset_us, 100 + 30_000 - 19 - 40);

        // the chain event preempts the window, which resumes later
        assert_eq!(scanner.is_abort(), AbortDecision::Resume);
        assert!(scanner.abort(&env, None).aborted);

        let mut param = PrepareParam::new(when.ticks_anchor + when.ticks_first(), 0);
        param.chain = true;
        assert_eq!(scanner.prepare(&env, &param, false), None);
        assert_eq!(scanner.is_abort(), AbortDecision::Cancel);
        assert_eq!(bench.radio.last_channel(), Some(22));
        let aux = ext(
            ExtHeader {
                adv_a: Some(PEER),
                ..ExtHeader::default()
            },
            &[8],
        );
        bench.radio.receive(&aux);
        let done = scanner.isr(&env).unwrap();
        assert_eq!((done.kind, done.rx_count), (EventKind::Scan, 1));
        assert_eq!(bench.reports().last().map(|r| r.1.clone()), Some(aux));

        // the resumed window listens on the same channel at once
        scanner.prepare(&env, &PrepareParam::new(0, 0), true);
        assert_eq!(bench.radio.last_channel(), Some(37));
        assert_eq!(bench.radio.starts.borrow().last(), Some(&(false, 0)));
        assert_eq!(bench.radio.hcto.get(), 50_000);
    }

    #[test]
    fn sync_info_of_target_creates_sync() {
        let bench = Bench::new();
        let env = bench.env();
        let mut p = params(false);
        p.sync = Some(SyncTarget {
            adv_addr: PEER,
            sid: 2,
            timeout: 200,
        });
        let mut scanner = scanner(p);
        start(&mut scanner, &bench);
        bench.radio.receive(&ext(
            ExtHeader {
                adi: Some(Adi { did: 0, sid: 2 }),
                aux_ptr: Some(aux_ptr(5, 600)),
                ..ExtHeader::default()
            },
            &[],
        ));
        scanner.isr(&env);

        let info = SyncInfo {
            offset_us: 60_000,
            interval: 80,
            channel_map: ChannelMap::ALL,
            sca: 5,
            access_address: 0x5065_1A3D,
            crc_init: 0x12_3456,
            event_counter: 7,
        };
        let aux = ext(
            ExtHeader {
                adv_a: Some(PEER),
                adi: Some(Adi { did: 0, sid: 2 }),
                sync_info: Some(info),
                ..ExtHeader::default()
            },
            &[],
        );
        bench.radio.aa_us.set(1040);
        bench.radio.receive(&aux);
        scanner.isr(&env);
        match scanner.take_handoff() {
            Some(Handoff::Sync {
                sync,
                first,
                period_us,
            }) => {
                assert!(sync.is_from(&PEER, 2));
                assert_eq!(sync.event_counter(), 7);
                // 50 ppm both ways over 100 ms
                assert_eq!(period_us, 100_000 - 10);
                assert_eq!(first.offset_us, 1000 + 60_000 - 40 - 32 - 10);
            }
            _ => panic!("no sync"),
        }

        // one sync per request
        bench.radio.receive(&ext(
            ExtHeader {
                adi: Some(Adi { did: 0, sid: 2 }),
                aux_ptr: Some(aux_ptr(5, 600)),
                ..ExtHeader::default()
            },
            &[],
        ));
        scanner.isr(&env);
        bench.radio.receive(&aux);
        scanner.isr(&env);
        assert!(scanner.take_handoff().is_none());
    }

    #[test]
    fn resume_keeps_the_channel() {
        let bench = Bench::new();
        let env = bench.env();
        let mut scanner = scanner(params(false));
        start(&mut scanner, &bench);
        assert_eq!(scanner.is_abort(), AbortDecision::Resume);
        let done = scanner.abort(&env, None);
        assert_eq!(done, Done::aborted(1, EventKind::Scan));
        scanner.prepare(&env, &PrepareParam::new(0, 0), true);
        assert_eq!(*bench.radio.channels.borrow(), [37, 37]);
        scanner.prepare(&env, &PrepareParam::new(0, 0), false);
        assert_eq!(bench.radio.last_channel(), Some(38));
    }
}
