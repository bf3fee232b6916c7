// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Broadcast isochronous group (BIG) transmitter.
//!
//! Every ISO interval each BIS of the group sends `NSE = BN * (IRC + PTC)`
//! subevents. The subevents of one BIS fall into groups of `BN`:
//!
//! - the first `IRC` groups carry the event's own `BN` payloads, repeated,
//! - each of the `PTC` groups that follow carries the payloads of an event
//!   `PTO` ISO intervals further ahead (pre-transmission).
//!
//! With sequential packing all subevents of BIS 1 go first, then BIS 2.
//! Interleaved packing sends subevent 0 of every BIS, then subevent 1, and
//! so on. Each BIS hops on its own [`IsoWalk`], so both orders visit the
//! same channel per (BIS, subevent).
//!
//! ```text
//!   sequential   | 1.0 1.1 1.2 | 2.0 2.1 2.2 | ctrl |
//!   interleaved  | 1.0 2.0 | 1.1 2.1 | 1.2 2.2 | ctrl |
//! ```
//!
//! Channel map updates and the group's termination are announced in a
//! control subevent after the last BIS subevent, from the event that queued
//! them up to their instant.

use kernel::config::CONFIG;
use kernel::debug;
use kernel::hil::ble::{Phy, RadioChannel};
use kernel::hil::rng::Random;
use kernel::ErrorCode;

use crate::chan::{self, ChannelMap, IsoWalk};
use crate::done::{Done, EventKind};
use crate::mem::{PduFifo, PduPool};
use crate::params::{BIS_MAX, CHANNEL_MAP_INSTANT_MARGIN, CONN_UNIT_US, ISO_WINDOW_MAX, MSS_US};
use crate::pdu::{
    self, big_ctrl, BigCtrl, BisHeader, BisHeaderVal, BIS_PAYLOAD_MAX, HEADER_LEN, PDU_SIZE,
};
use crate::role::{ticks_start, Env};
use crate::sched::{AbortDecision, PrepareParam};

/// Payloads queued per BIS.
const TX_QUEUE: usize = ISO_WINDOW_MAX + 1;

/// Shortest ISO interval, 5 ms.
const ISO_INTERVAL_MIN: u16 = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Packing {
    Sequential,
    Interleaved,
}

/// Layout of a BIG, shared by the broadcaster and synchronized receivers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BigParams {
    pub num_bis: u8,
    /// Burst number: new payloads per BIS and event.
    pub bn: u8,
    /// Immediate repetition count.
    pub irc: u8,
    /// Pre-transmission count.
    pub ptc: u8,
    /// Pre-transmission offset, in events.
    pub pto: u8,
    /// ISO interval in 1.25 ms units.
    pub iso_interval: u16,
    pub sub_interval_us: u32,
    pub bis_spacing_us: u32,
    /// Largest payload.
    pub max_pdu: u8,
    pub phy: Phy,
    pub packing: Packing,
}

impl BigParams {
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if self.num_bis == 0
            || self.num_bis as usize > BIS_MAX
            || !(1..=7).contains(&self.bn)
            || !(1..=15).contains(&self.irc)
            || self.ptc > 15
            || self.pto > 15
            || (self.ptc > 0 && self.pto == 0)
            || self.nse() > 31
            || self.window() > ISO_WINDOW_MAX
            || self.iso_interval < ISO_INTERVAL_MIN
            || self.max_pdu as usize > BIS_PAYLOAD_MAX
        {
            return Err(ErrorCode::INVAL);
        }

        let space_us = self.phy.pdu_air_us(self.max_pdu as usize) + MSS_US;
        let fits = match self.packing {
            Packing::Sequential => {
                self.sub_interval_us >= space_us
                    && self.bis_spacing_us >= self.nse() as u32 * self.sub_interval_us
            }
            Packing::Interleaved => {
                self.bis_spacing_us >= space_us
                    && self.sub_interval_us >= self.num_bis as u32 * self.bis_spacing_us
            }
        };
        let control_end_us = self.control_offset_us()
            + self.phy.pdu_air_us(big_ctrl::CHANNEL_MAP_IND_LEN)
            + MSS_US;
        if !fits || control_end_us > self.interval_us() {
            return Err(ErrorCode::INVAL);
        }
        Ok(())
    }

    /// Subevents per BIS and event.
    pub fn nse(&self) -> u8 {
        self.bn.saturating_mul(self.irc.saturating_add(self.ptc))
    }

    pub fn interval_us(&self) -> u32 {
        self.iso_interval as u32 * CONN_UNIT_US
    }

    /// Payloads of one BIS in flight at any time: those of the current
    /// event and the pre-transmitted ones.
    pub fn window(&self) -> usize {
        self.bn as usize * (1 + self.pto as usize * self.ptc as usize)
    }

    /// BIS subevents per event, all streams.
    pub fn steps(&self) -> usize {
        self.num_bis as usize * self.nse() as usize
    }

    /// BIS index (from 0) and subevent of the `step`th subevent on air.
    pub fn subevent(&self, step: usize) -> (u8, u8) {
        let nse = self.nse() as usize;
        let num_bis = self.num_bis as usize;
        match self.packing {
            Packing::Sequential => ((step / nse) as u8, (step % nse) as u8),
            Packing::Interleaved => ((step % num_bis) as u8, (step / num_bis) as u8),
        }
    }

    /// Start of subevent `se` of BIS `bis` (from 0) after the BIG anchor.
    pub fn subevent_offset_us(&self, bis: u8, se: u8) -> u32 {
        bis as u32 * self.bis_spacing_us + se as u32 * self.sub_interval_us
    }

    /// Start of the control subevent after the BIG anchor.
    pub fn control_offset_us(&self) -> u32 {
        let nse = self.nse() as u32;
        let num_bis = self.num_bis as u32;
        match self.packing {
            Packing::Sequential => {
                num_bis.saturating_sub(1) * self.bis_spacing_us + nse * self.sub_interval_us
            }
            Packing::Interleaved => {
                nse.saturating_sub(1) * self.sub_interval_us + num_bis * self.bis_spacing_us
            }
        }
    }

    /// Payloads after the event's first one that subevent `se` carries.
    pub fn payload_offset(&self, se: u8) -> u32 {
        let (group, burst) = (se / self.bn, (se % self.bn) as u32);
        if group < self.irc {
            burst
        } else {
            (self.pto as u32 * (group - self.irc + 1) as u32) * self.bn as u32 + burst
        }
    }
}

/// Access address of BIS `n`, or of the BIG control subevent for `n == 0`,
/// derived from the group's seed access address.
pub fn bis_access_address(seed: u32, n: u8) -> u32 {
    let d = ((35 * n as u32) + 42) & 0x7F;
    let bit = |i: u32| (d >> i) & 1;
    let mut dw = if bit(0) != 0 { 0xFC00_0000 } else { 0 };
    dw |= bit(1) << 25;
    dw |= bit(6) << 24;
    dw |= bit(1) << 23;
    dw |= bit(5) << 21;
    dw |= bit(4) << 20;
    dw |= bit(3) << 18;
    dw |= bit(2) << 17;
    seed ^ dw
}

/// CRC init of BIS `n`, or of the control subevent for `n == 0`.
pub fn bis_crc_init(base: u16, n: u8) -> u32 {
    ((base as u32) << 8) | n as u32
}

/// Channel of subevent `se` of a stream, advancing `walk`. Subevents must
/// be visited in order, starting from 0 each event.
pub fn bis_channel(
    counter: u16,
    chan_id: u16,
    map: &ChannelMap,
    se: u8,
    walk: &mut IsoWalk,
) -> u8 {
    if se == 0 {
        chan::iso_event_channel(counter, chan_id, map, map.count(), walk)
    } else {
        chan::iso_subevent_channel(chan_id, map, map.count(), walk)
    }
}

/// Stamp the control subevent sequence number and transmission flag into a
/// BIS PDU header.
fn stamp_header(out: &mut [u8], cssn: u8, cstf: bool) {
    let mut header = BisHeaderVal::new(out[0]);
    header.modify(BisHeader::CSSN.val(cssn & 0x7) + BisHeader::CSTF.val(cstf as u8));
    out[0] = header.get();
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Bis,
    Control,
}

pub struct BigBroadcaster {
    handle: u8,
    params: BigParams,
    seed_access_address: u32,
    base_crc_init: u16,
    channel_map: ChannelMap,

    /// Control PDU announced until its instant.
    ctrl: Option<BigCtrl>,
    cssn: u8,

    /// Counter of the next event.
    event_counter: u64,
    /// Counter of the event on air.
    counter: u64,
    latency_prepare: u16,

    /// Queued payloads per BIS. The head is the first payload of the
    /// event on air.
    tx: [PduFifo<TX_QUEUE>; BIS_MAX],
    walks: [IsoWalk; BIS_MAX],

    state: State,
    step: usize,
    start_us: u32,
    tx_count: u16,
}

impl BigBroadcaster {
    pub fn new(
        handle: u8,
        params: BigParams,
        channel_map: ChannelMap,
        rng: &dyn Random,
    ) -> Result<BigBroadcaster, ErrorCode> {
        params.validate()?;
        if !channel_map.is_valid() {
            return Err(ErrorCode::INVAL);
        }
        Ok(BigBroadcaster {
            handle,
            params,
            seed_access_address: chan::access_address_generate(rng)?,
            base_crc_init: rng.random() as u16,
            channel_map,
            ctrl: None,
            cssn: 0,
            event_counter: 0,
            counter: 0,
            latency_prepare: 0,
            tx: core::array::from_fn(|_| PduFifo::new()),
            walks: [IsoWalk::default(); BIS_MAX],
            state: State::Idle,
            step: 0,
            start_us: 0,
            tx_count: 0,
        })
    }

    pub fn handle(&self) -> u8 {
        self.handle
    }

    pub fn params(&self) -> &BigParams {
        &self.params
    }

    pub fn seed_access_address(&self) -> u32 {
        self.seed_access_address
    }

    pub fn base_crc_init(&self) -> u16 {
        self.base_crc_init
    }

    pub fn event_counter(&self) -> u64 {
        self.event_counter
    }

    pub fn channel_map(&self) -> ChannelMap {
        self.channel_map
    }

    /// Queue the next payload of BIS `bis` (from 1). Thread context.
    pub fn send(&mut self, pool: &PduPool, bis: u8, payload: &[u8]) -> Result<(), ErrorCode> {
        if bis == 0 || bis > self.params.num_bis {
            return Err(ErrorCode::INVAL);
        }
        if payload.len() > self.params.max_pdu as usize {
            return Err(ErrorCode::SIZE);
        }
        let queue = &mut self.tx[bis as usize - 1];
        if queue.is_full() {
            return Err(ErrorCode::BUSY);
        }
        let handle = pool.alloc().ok_or(ErrorCode::NOMEM)?;
        let mut out = [0; PDU_SIZE];
        pdu::write_bis_header(
            &mut out,
            BisHeader::LLID::UnframedComplete.value,
            0,
            false,
            payload.len(),
        );
        out[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        if let Some(buf) = pool.get(handle) {
            buf.write(&out[..HEADER_LEN + payload.len()]);
        }
        queue.push(handle);
        Ok(())
    }

    /// Move the group to `map` a few events from now.
    pub fn channel_map_update(&mut self, map: ChannelMap) -> Result<(), ErrorCode> {
        if !map.is_valid() {
            return Err(ErrorCode::INVAL);
        }
        if self.ctrl.is_some() {
            return Err(ErrorCode::BUSY);
        }
        self.announce(BigCtrl::ChannelMap {
            map,
            instant: self.instant(),
        });
        Ok(())
    }

    /// End the group a few events from now.
    pub fn terminate(&mut self, reason: u8) -> Result<(), ErrorCode> {
        match self.ctrl {
            Some(BigCtrl::Terminate { .. }) => Err(ErrorCode::ALREADY),
            Some(_) => Err(ErrorCode::BUSY),
            None => {
                self.announce(BigCtrl::Terminate {
                    reason,
                    instant: self.instant(),
                });
                Ok(())
            }
        }
    }

    pub fn release(&mut self, pool: &PduPool) {
        for queue in self.tx.iter_mut() {
            queue.release_all(pool);
        }
    }

    pub fn is_abort(&self) -> AbortDecision {
        AbortDecision::Continue
    }

    pub fn prepare(&mut self, env: &Env, param: &PrepareParam, resume: bool) -> Option<Done> {
        if resume {
            return Some(Done::aborted(self.handle, EventKind::AdvIso));
        }
        let skipped = self.latency_prepare.saturating_add(param.lazy);
        self.latency_prepare = 0;
        self.counter = self.event_counter + skipped as u64;
        self.event_counter = self.counter + 1;
        // payloads of skipped events are stale
        self.flush(env.pool, skipped as usize);

        if let Some(ctrl) = self.ctrl {
            match ctrl {
                BigCtrl::ChannelMap { map, instant } if self.at(instant) => {
                    self.channel_map = map;
                    self.ctrl = None;
                }
                BigCtrl::Terminate { reason, instant } if self.at(instant) => {
                    if CONFIG.trace_conn_terminate {
                        debug!("big {}: terminated, reason {:#x}", self.handle, reason);
                    }
                    self.ctrl = None;
                    let mut done = Done::new(self.handle, EventKind::AdvIso);
                    done.terminate = Some(reason);
                    return Some(done);
                }
                _ => {}
            }
        }
        if CONFIG.trace_radio_events {
            debug!("big {}: event {}", self.handle, self.counter);
        }

        self.tx_count = 0;
        self.step = 0;
        let (aa, crc_init, channel) = self.step_link(0);
        env.radio_setup(self.params.phy, aa, crc_init, channel);
        self.load_bis(env, 0);
        self.start_us = env
            .radio
            .tmr_start(true, ticks_start(param), param.remainder);
        self.state = State::Bis;
        None
    }

    pub fn isr(&mut self, env: &Env) -> Option<Done> {
        match self.state {
            State::Idle => None,
            State::Bis => {
                self.tx_count += 1;
                self.step += 1;
                if self.step < self.params.steps() {
                    self.tx_bis(env);
                    None
                } else if let Some(ctrl) = self.ctrl {
                    self.tx_control(env, &ctrl);
                    None
                } else {
                    Some(self.close(env))
                }
            }
            State::Control => {
                self.tx_count += 1;
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
            }
            None => {
                env.radio.disable();
                if self.state != State::Idle {
                    self.flush(env.pool, 1);
                }
                self.state = State::Idle;
            }
        }
        Done::aborted(self.handle, EventKind::AdvIso)
    }

    fn instant(&self) -> u16 {
        (self.event_counter as u16).wrapping_add(CHANNEL_MAP_INSTANT_MARGIN)
    }

    fn at(&self, instant: u16) -> bool {
        chan::instant_passed(self.counter as u16, instant)
    }

    fn announce(&mut self, ctrl: BigCtrl) {
        self.cssn = (self.cssn + 1) & 0x7;
        self.ctrl = Some(ctrl);
    }

    /// Access address, CRC init and channel of step `step`.
    fn step_link(&mut self, step: usize) -> (u32, u32, u8) {
        let (bis, se) = self.params.subevent(step);
        let aa = bis_access_address(self.seed_access_address, bis + 1);
        let channel = bis_channel(
            self.counter as u16,
            chan::channel_id(aa),
            &self.channel_map,
            se,
            &mut self.walks[bis as usize],
        );
        (aa, bis_crc_init(self.base_crc_init, bis + 1), channel)
    }

    /// Load the PDU of the current step, or an empty padding PDU when its
    /// payload was not queued in time.
    fn load_bis(&mut self, env: &Env, step: usize) {
        let (bis, se) = self.params.subevent(step);
        let index = self.params.payload_offset(se) as usize;
        let mut out = [0; PDU_SIZE];
        let len = match self.tx[bis as usize]
            .get(index)
            .and_then(|h| env.pool.get(h))
        {
            Some(buf) => buf.read(&mut out),
            None => {
                pdu::write_bis_header(
                    &mut out,
                    BisHeader::LLID::UnframedContinuation.value,
                    0,
                    false,
                    0,
                );
                HEADER_LEN
            }
        };
        stamp_header(&mut out, self.cssn, self.ctrl.is_some());
        env.radio.pkt_tx_set(&out[..len]);
        env.radio.switch_complete_and_disable();
    }

    fn tx_bis(&mut self, env: &Env) {
        let radio = env.radio;
        let step = self.step;
        let (bis, se) = self.params.subevent(step);
        let (aa, crc_init, channel) = self.step_link(step);
        radio.aa_set(aa);
        radio.crc_configure(crc_init);
        if let Some(channel) = RadioChannel::data(channel) {
            radio.freq_chan_set(channel);
        }
        self.load_bis(env, step);
        radio.tmr_start_us(true, self.start_us + self.params.subevent_offset_us(bis, se));
    }

    fn tx_control(&mut self, env: &Env, ctrl: &BigCtrl) {
        let radio = env.radio;
        let aa = bis_access_address(self.seed_access_address, 0);
        let mut walk = IsoWalk::default();
        let channel = bis_channel(
            self.counter as u16,
            chan::channel_id(aa),
            &self.channel_map,
            0,
            &mut walk,
        );
        radio.aa_set(aa);
        radio.crc_configure(bis_crc_init(self.base_crc_init, 0));
        if let Some(channel) = RadioChannel::data(channel) {
            radio.freq_chan_set(channel);
        }
        let mut out = [0; PDU_SIZE];
        let len = ctrl.build(&mut out, self.cssn, false);
        radio.pkt_tx_set(&out[..len]);
        radio.switch_complete_and_disable();
        radio.tmr_start_us(true, self.start_us + self.params.control_offset_us());
        self.state = State::Control;
    }

    /// Drop the payloads of `events` events from every queue.
    fn flush(&mut self, pool: &PduPool, events: usize) {
        let count = events.saturating_mul(self.params.bn as usize);
        for queue in self.tx.iter_mut().take(self.params.num_bis as usize) {
            for _ in 0..count {
                match queue.pop() {
                    Some(handle) => pool.release_chain(handle),
                    None => break,
                }
            }
        }
    }

    fn close(&mut self, env: &Env) -> Done {
        self.state = State::Idle;
        self.flush(env.pool, 1);
        let mut done = Done::new(self.handle, EventKind::AdvIso);
        done.tx_count = self.tx_count;
        done
    }
}
