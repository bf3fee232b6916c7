// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Broadcast isochronous group receiver.
//!
//! A [`BigReceiver`] follows up to [`SYNC_ISO_STREAM_MAX`] streams of a BIG
//! whose layout the host learned from the BIGInfo. It walks the subevents
//! in the order the broadcaster sends them, listening only on the streams
//! it follows, and skips a subevent whose payload it already holds (a
//! repetition, or a payload pre-transmitted in an earlier event).
//!
//! Received payloads wait in a per-stream window until their own event
//! ends, so the upper layer sees them in payload order. A payload that was
//! not received in any of its subevents is reported once with
//! [`RxStatus::Invalid`].
//!
//! ```text
//!   payload      0   1   2   3   4   5 ...
//!   event 0    [rx  rx] pre pre
//!   event 1            [held held]  pre pre
//!   reported   <-- after event 0 --><-- after event 1 -->
//! ```
//!
//! A set CSTF bit with a new CSSN makes the receiver listen to the control
//! subevent after the last BIS subevent of the event.

use kernel::config::CONFIG;
use kernel::debug;
use kernel::hil::ble::RadioChannel;
use kernel::hil::ticker::{us_to_ticks, TickerUpdate};
use kernel::ErrorCode;

use crate::adv_iso::{bis_access_address, bis_channel, bis_crc_init, BigParams};
use crate::chan::{self, ChannelMap, IsoWalk};
use crate::conn::events;
use crate::done::{reason, Done, EventKind};
use crate::drift::{Drift, DriftMeasure};
use crate::params::{
    CONN_ESTABLISH_EVENTS, ISO_WINDOW_MAX, LOCAL_SCA, SUPERVISION_UNIT_US, SYNC_ISO_STREAM_MAX,
};
use crate::pdu::{self, BigCtrl, BisHeader, BisHeaderVal, BIS_PAYLOAD_MAX, PDU_SIZE};
use crate::role::{ticks_start, Env};
use crate::sched::{AbortDecision, PrepareParam};
use crate::ull::{RxHandle, RxKind, RxMeta, RxStatus};

/// What the host knows about the group to synchronize to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BigSyncParams {
    pub big: BigParams,
    pub seed_access_address: u32,
    pub base_crc_init: u16,
    pub channel_map: ChannelMap,
    /// Counter of the first event to receive.
    pub event_counter: u64,
    /// Sleep clock accuracy of the broadcaster.
    pub sca: u8,
    /// Streams to receive, bit `n - 1` for BIS `n`.
    pub bis_mask: u32,
    /// Sync timeout in 10 ms units.
    pub timeout: u16,
}

impl BigSyncParams {
    pub fn validate(&self) -> Result<(), ErrorCode> {
        self.big.validate()?;
        let streams = self.bis_mask.count_ones() as usize;
        if !self.channel_map.is_valid()
            || streams == 0
            || streams > SYNC_ISO_STREAM_MAX
            || self.bis_mask >> self.big.num_bis != 0
            || self.timeout == 0
        {
            return Err(ErrorCode::INVAL);
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Bis,
    Control,
}

#[derive(Copy, Clone)]
struct Stream {
    /// BIS index, from 0.
    bis: u8,
    walk: IsoWalk,
    /// Received payloads not reported yet, by payload number modulo the
    /// window.
    slots: [Option<(u64, RxHandle)>; ISO_WINDOW_MAX],
}

/// A BIS subevent to listen to.
#[derive(Copy, Clone, Debug)]
struct Subevent {
    stream: usize,
    payload: u64,
    channel: u8,
    offset_us: u32,
}

#[derive(Copy, Clone, Debug, Default)]
struct EventStats {
    rx_count: u16,
    crc_valid: bool,
    incomplete: bool,
    /// Radio ready to access address of the first valid PDU.
    anchor_us: Option<u32>,
}

pub struct BigReceiver {
    handle: u8,
    params: BigSyncParams,
    channel_map: ChannelMap,
    ctrl: Option<BigCtrl>,
    /// CSSN of the last control PDU received.
    cssn: Option<u8>,
    /// CSSN announced in this event, not received yet.
    cssn_pending: Option<u8>,

    /// Counter of the next event.
    event_counter: u64,
    /// Counter of the event on air.
    counter: u64,
    latency_prepare: u16,
    latency_event: u16,
    /// First payload number not reported yet.
    next_payload: u64,
    streams: [Stream; SYNC_ISO_STREAM_MAX],
    stream_count: usize,
    drift: Drift,

    established: bool,
    establish_expire: u16,
    supervision_reload: u16,
    supervision_expire: u16,

    state: State,
    step: usize,
    current: Option<Subevent>,
    /// The radio timer runs for this event.
    started: bool,
    /// Radio timer time of the BIG anchor point.
    start_us: u32,
    ticks: u32,
    ev: EventStats,
}

impl BigReceiver {
    pub fn new(handle: u8, params: BigSyncParams) -> Result<BigReceiver, ErrorCode> {
        params.validate()?;
        let interval_us = params.big.interval_us();
        let empty = Stream {
            bis: 0,
            walk: IsoWalk::default(),
            slots: [None; ISO_WINDOW_MAX],
        };
        let mut streams = [empty; SYNC_ISO_STREAM_MAX];
        let mut stream_count = 0;
        for bis in 0..params.big.num_bis {
            if params.bis_mask & (1 << bis) != 0 {
                streams[stream_count].bis = bis;
                stream_count += 1;
            }
        }
        Ok(BigReceiver {
            handle,
            params,
            channel_map: params.channel_map,
            ctrl: None,
            cssn: None,
            cssn_pending: None,
            event_counter: params.event_counter,
            counter: params.event_counter,
            latency_prepare: 0,
            latency_event: 0,
            next_payload: params.event_counter * params.big.bn as u64,
            streams,
            stream_count,
            drift: Drift::new(LOCAL_SCA, params.sca, interval_us),
            established: false,
            establish_expire: CONN_ESTABLISH_EVENTS,
            supervision_reload: events(params.timeout as u32 * SUPERVISION_UNIT_US, interval_us),
            supervision_expire: 0,
            state: State::Idle,
            step: 0,
            current: None,
            started: false,
            start_us: 0,
            ticks: 0,
            ev: EventStats::default(),
        })
    }

    pub fn handle(&self) -> u8 {
        self.handle
    }

    pub fn params(&self) -> &BigSyncParams {
        &self.params
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn event_counter(&self) -> u64 {
        self.event_counter
    }

    pub fn channel_map(&self) -> ChannelMap {
        self.channel_map
    }

    pub fn interval_us(&self) -> u32 {
        self.params.big.interval_us()
    }

    /// Per-event widening, which the ticker period leaves out.
    pub fn periodic_widening_us(&self) -> u32 {
        self.drift.periodic_us
    }

    /// Hand every held payload to the upper layer, so its node is
    /// recycled.
    pub fn release(&mut self, env: &Env) {
        self.drain(env);
    }

    pub fn is_abort(&self) -> AbortDecision {
        AbortDecision::Continue
    }

    pub fn prepare(&mut self, env: &Env, param: &PrepareParam, resume: bool) -> Option<Done> {
        if resume {
            return Some(Done::aborted(self.handle, EventKind::SyncIso));
        }
        self.ev = EventStats::default();
        let skipped = self.latency_prepare.saturating_add(param.lazy);
        self.latency_prepare = 0;
        self.latency_event = skipped;
        self.counter = self.event_counter + skipped as u64;
        self.event_counter = self.counter + 1;
        self.drift.accumulate(skipped.saturating_add(1));
        // payloads of skipped events
        let first = self.counter * self.params.big.bn as u64;
        self.report_until(env, first);

        match self.ctrl {
            Some(BigCtrl::ChannelMap { map, instant }) if self.at(instant) => {
                self.channel_map = map;
                self.ctrl = None;
            }
            Some(BigCtrl::Terminate { reason, instant }) if self.at(instant) => {
                if CONFIG.trace_conn_terminate {
                    debug!("big sync {}: terminated, reason {:#x}", self.handle, reason);
                }
                self.ctrl = None;
                self.drain(env);
                let mut done = Done::new(self.handle, EventKind::SyncIso);
                done.terminate = Some(reason);
                return Some(done);
            }
            _ => {}
        }
        if CONFIG.trace_radio_events {
            debug!("big sync {}: event {}", self.handle, self.counter);
        }

        for stream in self.streams.iter_mut() {
            stream.walk = IsoWalk::default();
        }
        self.drift.event_start();
        self.ticks = ticks_start(param);
        self.start_us = param.remainder;
        self.started = false;
        self.step = 0;
        self.cssn_pending = None;
        match self.next_subevent() {
            Some(subevent) => {
                self.rx_bis(env, &subevent);
                None
            }
            // everything of this event arrived early
            None => Some(self.close(env)),
        }
    }

    pub fn isr(&mut self, env: &Env) -> Option<Done> {
        match self.state {
            State::Idle => None,
            State::Bis => {
                self.bis_received(env);
                match self.next_subevent() {
                    Some(subevent) => {
                        self.rx_bis(env, &subevent);
                        None
                    }
                    None if self.cssn_pending.is_some() => {
                        self.rx_control(env);
                        None
                    }
                    None => Some(self.close(env)),
                }
            }
            State::Control => {
                self.control_received(env);
                Some(self.close(env))
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
                Done::aborted(self.handle, EventKind::SyncIso)
            }
            None => {
                env.radio.disable();
                if self.state == State::Idle {
                    return Done::aborted(self.handle, EventKind::SyncIso);
                }
                let mut done = self.close(env);
                done.aborted = true;
                done
            }
        }
    }

    fn at(&self, instant: u16) -> bool {
        chan::instant_passed(self.counter as u16, instant)
    }

    fn stream_of(&self, bis: u8) -> Option<usize> {
        self.streams[..self.stream_count]
            .iter()
            .position(|s| s.bis == bis)
    }

    /// The next subevent on air carrying a payload we still miss. The hop
    /// of every followed stream advances over the subevents passed by.
    fn next_subevent(&mut self) -> Option<Subevent> {
        let big = self.params.big;
        while self.step < big.steps() {
            let (bis, se) = big.subevent(self.step);
            self.step += 1;
            let stream = match self.stream_of(bis) {
                Some(stream) => stream,
                None => continue,
            };
            let aa = bis_access_address(self.params.seed_access_address, bis + 1);
            let channel = bis_channel(
                self.counter as u16,
                chan::channel_id(aa),
                &self.channel_map,
                se,
                &mut self.streams[stream].walk,
            );
            let payload = self.counter * big.bn as u64 + big.payload_offset(se) as u64;
            if self.streams[stream].slots[slot(payload)].is_some_and(|(p, _)| p == payload) {
                continue;
            }
            let subevent = Subevent {
                stream,
                payload,
                channel,
                offset_us: big.subevent_offset_us(bis, se),
            };
            self.current = Some(subevent);
            return Some(subevent);
        }
        self.current = None;
        None
    }

    /// Open a receive window `offset_us` after the anchor.
    fn rx_at(&mut self, env: &Env, aa: u32, crc_init: u32, channel: u8, offset_us: u32) {
        let radio = env.radio;
        let phy = self.params.big.phy;
        let enable_us = if self.started {
            radio.aa_set(aa);
            radio.crc_configure(crc_init);
            if let Some(channel) = RadioChannel::data(channel) {
                radio.freq_chan_set(channel);
            }
            radio.pkt_rx_set(BIS_PAYLOAD_MAX as u8);
            radio.switch_complete_and_disable();
            radio.tmr_start_us(false, self.start_us + offset_us)
        } else {
            env.radio_setup(phy, aa, crc_init, channel);
            radio.pkt_rx_set(BIS_PAYLOAD_MAX as u8);
            radio.switch_complete_and_disable();
            self.started = true;
            let enable_us = radio.tmr_start(false, self.ticks, self.start_us + offset_us);
            self.start_us = enable_us.saturating_sub(offset_us);
            enable_us
        };
        radio.tmr_aa_capture();
        radio.tmr_end_capture();
        radio.rssi_measure();
        radio.tmr_hcto_configure(self.drift.hcto_us(
            enable_us,
            radio.rx_ready_delay_us(phy),
            phy.addr_us(),
        ));
    }

    fn rx_bis(&mut self, env: &Env, subevent: &Subevent) {
        let bis = self.streams[subevent.stream].bis;
        let aa = bis_access_address(self.params.seed_access_address, bis + 1);
        let crc_init = bis_crc_init(self.params.base_crc_init, bis + 1);
        self.rx_at(env, aa, crc_init, subevent.channel, subevent.offset_us);
        self.state = State::Bis;
    }

    fn rx_control(&mut self, env: &Env) {
        let aa = bis_access_address(self.params.seed_access_address, 0);
        let mut walk = IsoWalk::default();
        let channel = bis_channel(
            self.counter as u16,
            chan::channel_id(aa),
            &self.channel_map,
            0,
            &mut walk,
        );
        let crc_init = bis_crc_init(self.params.base_crc_init, 0);
        self.rx_at(env, aa, crc_init, channel, self.params.big.control_offset_us());
        self.state = State::Control;
    }

    /// Radio ready to access address of a valid reception, or `None`.
    fn valid_rx(&mut self, env: &Env) -> Option<u32> {
        let radio = env.radio;
        if !radio.is_done() || !radio.crc_is_valid() {
            radio.disable();
            return None;
        }
        self.ev.rx_count += 1;
        self.ev.crc_valid = true;
        Some(radio.tmr_aa_get().saturating_sub(radio.tmr_ready_get()))
    }

    fn bis_received(&mut self, env: &Env) {
        let subevent = match self.current {
            Some(subevent) => subevent,
            None => return,
        };
        let actual_us = match self.valid_rx(env) {
            Some(actual_us) => actual_us,
            None => return,
        };
        if self.ev.anchor_us.is_none() {
            self.ev.anchor_us = Some(actual_us);
        }

        let mut buf = [0; PDU_SIZE];
        let pdu = env.rx_pdu(&mut buf);
        let header = match pdu.first() {
            Some(h) => BisHeaderVal::new(*h),
            None => return,
        };
        if header.is_set(BisHeader::CSTF) {
            let cssn = header.read(BisHeader::CSSN);
            if self.cssn != Some(cssn) {
                self.cssn_pending = Some(cssn);
            }
        }
        if header.read(BisHeader::LLID) == BisHeader::LLID::Control.value {
            return;
        }

        let rx = env.rx;
        let node = match rx.alloc_peek(1).and_then(|_| rx.alloc()) {
            Some(node) => node,
            None => {
                self.ev.incomplete = true;
                return;
            }
        };
        let stream = &mut self.streams[subevent.stream];
        if let Some(rx_node) = rx.node(node) {
            rx_node.set_meta(RxMeta {
                rssi: env.rssi(),
                counter: subevent.payload,
                param: stream.bis + 1,
                ticks: self.ticks,
                offset_us: env
                    .radio
                    .tmr_aa_get()
                    .saturating_sub(self.params.big.phy.addr_us()),
                ..RxMeta::new(RxKind::IsoPdu, self.handle)
            });
            rx_node.set_pdu(pdu);
        }
        stream.slots[slot(subevent.payload)] = Some((subevent.payload, node));
    }

    fn control_received(&mut self, env: &Env) {
        if self.valid_rx(env).is_none() {
            return;
        }
        let mut buf = [0; PDU_SIZE];
        let pdu = env.rx_pdu(&mut buf);
        let header = match pdu.first() {
            Some(h) => BisHeaderVal::new(*h),
            None => return,
        };
        if header.read(BisHeader::LLID) != BisHeader::LLID::Control.value {
            return;
        }
        let ctrl = match BigCtrl::parse(pdu::payload(pdu)) {
            Some(ctrl) => ctrl,
            None => return,
        };
        match ctrl {
            BigCtrl::ChannelMap { map, instant } => {
                if map.is_valid() && !chan::instant_in_past(self.counter as u16, instant) {
                    self.ctrl = Some(ctrl);
                }
            }
            BigCtrl::Terminate { .. } => self.ctrl = Some(ctrl),
        }
        self.cssn = self.cssn_pending.take();
    }

    /// Report every payload numbered below `end`, received or not.
    fn report_until(&mut self, env: &Env, end: u64) {
        let mut nodes_left = true;
        while self.next_payload < end {
            let payload = self.next_payload;
            if !nodes_left && end - payload > ISO_WINDOW_MAX as u64 {
                // nothing is held this far back
                self.next_payload = end - ISO_WINDOW_MAX as u64;
                continue;
            }
            for stream in self.streams[..self.stream_count].iter_mut() {
                match stream.slots[slot(payload)].take() {
                    Some((p, node)) if p == payload => env.sink.enqueue(node),
                    held => {
                        stream.slots[slot(payload)] = held;
                        let meta = RxMeta {
                            status: RxStatus::Invalid,
                            counter: payload,
                            param: stream.bis + 1,
                            ticks: self.ticks,
                            ..RxMeta::new(RxKind::IsoPdu, self.handle)
                        };
                        if nodes_left && !env.report(meta, &[], 1) {
                            nodes_left = false;
                            self.ev.incomplete = true;
                        }
                    }
                }
            }
            self.next_payload += 1;
        }
    }

    /// Deliver the payloads held for events that will not happen.
    fn drain(&mut self, env: &Env) {
        let first = self.next_payload;
        for payload in first..first + ISO_WINDOW_MAX as u64 {
            for stream in self.streams[..self.stream_count].iter_mut() {
                if let Some((p, node)) = stream.slots[slot(payload)] {
                    if p == payload {
                        stream.slots[slot(payload)] = None;
                        env.sink.enqueue(node);
                    }
                }
            }
        }
        self.next_payload = first + ISO_WINDOW_MAX as u64;
    }

    /// End of the event: reporting, establishment, supervision and the
    /// ticker update.
    fn close(&mut self, env: &Env) -> Done {
        self.state = State::Idle;
        self.current = None;
        let end = (self.counter + 1) * self.params.big.bn as u64;
        self.report_until(env, end);

        let mut done = Done::new(self.handle, EventKind::SyncIso);
        done.rx_count = self.ev.rx_count;
        done.crc_valid = self.ev.crc_valid;
        done.incomplete = self.ev.incomplete;
        if !self.started {
            return done;
        }
        let phy = self.params.big.phy;
        let measure: Option<DriftMeasure> = self
            .ev
            .anchor_us
            .map(|actual_us| self.drift.reset_on_anchor(actual_us, phy.addr_us()));
        done.drift = measure;

        let elapsed = self.latency_event.saturating_add(1);
        if self.ev.crc_valid {
            self.established = true;
            self.supervision_expire = 0;
        } else if !self.established {
            if self.establish_expire > elapsed {
                self.establish_expire -= elapsed;
            } else {
                return self.terminated(env, done, reason::CONN_FAIL_TO_ESTAB);
            }
        } else if self.supervision_expire == 0 {
            self.supervision_expire = self.supervision_reload;
        }

        if self.supervision_expire != 0 {
            if self.supervision_expire > elapsed {
                self.supervision_expire -= elapsed;
            } else {
                return self.terminated(env, done, reason::CONN_TIMEOUT);
            }
        }

        if let Some(measure) = measure {
            let (plus_us, minus_us) = measure.correction_us();
            if plus_us != 0 || minus_us != 0 {
                done.ticker = Some(TickerUpdate {
                    ticks_drift_plus: us_to_ticks(plus_us),
                    ticks_drift_minus: us_to_ticks(minus_us),
                    ..TickerUpdate::default()
                });
            }
        }
        done
    }

    fn terminated(&mut self, env: &Env, mut done: Done, reason: u8) -> Done {
        if CONFIG.trace_conn_terminate {
            debug!("big sync {}: lost, reason {:#x}", self.handle, reason);
        }
        self.drain(env);
        done.terminate = Some(reason);
        done
    }
}

fn slot(payload: u64) -> usize {
    (payload % ISO_WINDOW_MAX as u64) as usize
}
