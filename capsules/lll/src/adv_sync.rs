// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Periodic advertiser.
//!
//! A periodic advertising train sends one AUX_SYNC_IND per interval on a
//! data channel picked with CSA#2 from the train's own access address and
//! event counter. Data that does not fit continues in AUX_CHAIN_IND PDUs,
//! sent from the radio interrupt one auxiliary frame space apart.
//!
//! Scanners find the train through the SyncInfo of the advertising set's
//! AUX_ADV_IND, computed by [`AdvSync::sync_info`] from the radio start of
//! the last prepared event. Channel map updates travel in the ACAD of every
//! AUX_SYNC_IND until their instant.

use kernel::config::CONFIG;
use kernel::debug;
use kernel::hil::ble::{Phy, RadioChannel};
use kernel::hil::rng::Random;
use kernel::hil::ticker::{ticks_to_us, us_to_ticks};
use kernel::ErrorCode;

use crate::chan::{self, ChannelMap};
use crate::dbuf::DoubleBuffer;
use crate::done::{Done, EventKind};
use crate::drift::sca_ppm;
use crate::mem::{PduHandle, PduPool};
use crate::params::{
    AUX_DATA_CHUNK, CHANNEL_MAP_INSTANT_MARGIN, CONN_UNIT_US, EVENT_START_US, EXT_ADV_DATA_MAX,
    LOCAL_SCA, MAFS_US,
};
use crate::pdu::{self, AuxPtr, ChmUpdate, ExtHeader, SyncInfo, AUX_PTR_LEN, HEADER_LEN, PDU_SIZE};
use crate::role::{ticks_start, Env, Schedule};
use crate::sched::{AbortDecision, PrepareParam};

/// Shortest periodic advertising interval, 7.5 ms.
const INTERVAL_MIN: u16 = 6;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PeriodicParams {
    /// Interval in 1.25 ms units.
    pub interval: u16,
    pub channel_map: ChannelMap,
    pub phy: Phy,
}

impl PeriodicParams {
    pub fn validate(&self) -> Result<(), ErrorCode> {
        if self.interval < INTERVAL_MIN || !self.channel_map.is_valid() {
            Err(ErrorCode::INVAL)
        } else {
            Ok(())
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Tx,
}

/// Signed microseconds from tick `from` to tick `to`.
fn ticks_delta_us(from: u32, to: u32) -> i64 {
    let ticks = to.wrapping_sub(from) as i32;
    if ticks >= 0 {
        ticks_to_us(ticks as u32) as i64
    } else {
        -(ticks_to_us(ticks.unsigned_abs()) as i64)
    }
}

/// Radio start of a prepared event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Reference {
    ticks: u32,
    start_us: u32,
    counter: u16,
}

pub struct AdvSync<'a> {
    handle: u8,
    params: PeriodicParams,
    data: &'a DoubleBuffer,
    access_address: u32,
    crc_init: u32,
    chan_id: u16,
    channel_map: ChannelMap,
    chm_update: Option<ChmUpdate>,

    /// Counter of the next event.
    event_counter: u16,
    /// Counter of the event on air.
    counter: u16,
    latency_prepare: u16,
    chain_counter: u16,
    reference: Reference,

    state: State,
    start_us: u32,
    tx_count: u16,
    next: Option<PduHandle>,
    next_channel: u8,
    air_us: u32,
}

impl<'a> AdvSync<'a> {
    pub fn new(
        handle: u8,
        params: PeriodicParams,
        data: &'a DoubleBuffer,
        rng: &dyn Random,
    ) -> Result<AdvSync<'a>, ErrorCode> {
        params.validate()?;
        let access_address = chan::access_address_generate(rng)?;
        Ok(AdvSync {
            handle,
            params,
            data,
            access_address,
            crc_init: rng.random() & 0xFF_FFFF,
            chan_id: chan::channel_id(access_address),
            channel_map: params.channel_map,
            chm_update: None,
            event_counter: 0,
            counter: 0,
            latency_prepare: 0,
            chain_counter: 0,
            reference: Reference {
                ticks: 0,
                start_us: 0,
                counter: 0,
            },
            state: State::Idle,
            start_us: 0,
            tx_count: 0,
            next: None,
            next_channel: 0,
            air_us: 0,
        })
    }

    pub fn handle(&self) -> u8 {
        self.handle
    }

    pub fn access_address(&self) -> u32 {
        self.access_address
    }

    pub fn interval_us(&self) -> u32 {
        self.params.interval as u32 * CONN_UNIT_US
    }

    pub fn event_counter(&self) -> u16 {
        self.event_counter
    }

    pub fn channel_map(&self) -> ChannelMap {
        self.channel_map
    }

    /// Replace the periodic advertising data. Thread context.
    pub fn set_data(&self, pool: &PduPool, data: &[u8]) -> Result<(), ErrorCode> {
        if data.len() > EXT_ADV_DATA_MAX {
            return Err(ErrorCode::INVAL);
        }
        self.data.publish(pool, data, AUX_DATA_CHUNK)
    }

    /// Move the train to `map` a few events from now.
    pub fn channel_map_update(&mut self, map: ChannelMap) -> Result<(), ErrorCode> {
        if !map.is_valid() {
            return Err(ErrorCode::INVAL);
        }
        if self.chm_update.is_some() {
            return Err(ErrorCode::BUSY);
        }
        self.chm_update = Some(ChmUpdate {
            map,
            instant: self.event_counter.wrapping_add(CHANNEL_MAP_INSTANT_MARGIN),
        });
        Ok(())
    }

    /// The ticker was started; its first expiry is at `ticks_first_expiry`.
    pub fn start(&mut self, ticks_first_expiry: u32) {
        self.reference = Reference {
            ticks: ticks_first_expiry.wrapping_add(us_to_ticks(EVENT_START_US)),
            start_us: 0,
            counter: self.event_counter,
        };
    }

    /// SyncInfo for an AUX_ADV_IND going on air at `at`: the first event at
    /// least two event start margins later.
    pub fn sync_info(&self, at: &Schedule) -> SyncInfo {
        let reference = self.reference;
        let interval_us = self.interval_us() as i64;
        let delta_us = ticks_delta_us(reference.ticks, at.ticks_anchor) + at.offset_us as i64
            - reference.start_us as i64;
        let margin_us = (EVENT_START_US << 1) as i64;
        let n = (delta_us + margin_us).div_euclid(interval_us) + 1;
        let event_counter = reference.counter.wrapping_add(n as u16);
        let channel_map = match self.chm_update {
            Some(update) if chan::instant_passed(event_counter, update.instant) => update.map,
            _ => self.channel_map,
        };
        SyncInfo {
            offset_us: (n * interval_us - delta_us) as u32,
            interval: self.params.interval,
            channel_map,
            sca: LOCAL_SCA,
            access_address: self.access_address,
            crc_init: self.crc_init,
            event_counter,
        }
    }

    pub fn release(&mut self, pool: &PduPool) {
        self.data.release_all(pool);
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
            return Some(Done::aborted(self.handle, EventKind::AdvSync));
        }
        let skipped = self.latency_prepare.saturating_add(param.lazy);
        self.latency_prepare = 0;
        self.counter = self.event_counter.wrapping_add(skipped);
        self.event_counter = self.counter.wrapping_add(1);
        if let Some(update) = self.chm_update {
            if chan::instant_passed(self.counter, update.instant) {
                self.channel_map = update.map;
                self.chm_update = None;
            }
        }
        let channel = chan::csa2_channel(
            self.counter,
            self.chan_id,
            &self.channel_map,
            self.channel_map.count(),
        );
        if CONFIG.trace_radio_events {
            debug!("adv sync {}: event {} on {}", self.handle, self.counter, channel);
        }

        let _ = self.data.consume_latest(env.pool);
        env.radio_setup(self.params.phy, self.access_address, self.crc_init, channel);
        self.tx_count = 0;
        self.tx_pdu(env, self.data.peek_current(), true);
        let ticks = ticks_start(param);
        self.start_us = env.radio.tmr_start(true, ticks, param.remainder);
        self.reference = Reference {
            ticks,
            start_us: self.start_us,
            counter: self.counter,
        };
        None
    }

    pub fn isr(&mut self, env: &Env) -> Option<Done> {
        if self.state == State::Idle {
            return None;
        }
        self.tx_count += 1;
        let next = match self.next {
            Some(next) => next,
            None => {
                self.state = State::Idle;
                let mut done = Done::new(self.handle, EventKind::AdvSync);
                done.tx_count = self.tx_count;
                return Some(done);
            }
        };
        if let Some(channel) = RadioChannel::data(self.next_channel) {
            env.radio.freq_chan_set(channel);
        }
        self.start_us += self.air_us + MAFS_US;
        self.tx_pdu(env, Some(next), false);
        env.radio.tmr_start_us(true, self.start_us);
        None
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
                self.state = State::Idle;
            }
        }
        Done::aborted(self.handle, EventKind::AdvSync)
    }

    /// Load AUX_SYNC_IND (`first`) or AUX_CHAIN_IND carrying `data`.
    fn tx_pdu(&mut self, env: &Env, data: Option<PduHandle>, first: bool) {
        let phy = self.params.phy;
        let mut chunk = [0; PDU_SIZE];
        let (len, next) = data
            .and_then(|h| env.pool.get(h))
            .map_or((0, None), |buf| (buf.read(&mut chunk), buf.next()));

        let mut header = ExtHeader {
            chm_update: if first { self.chm_update } else { None },
            ..ExtHeader::default()
        };
        if next.is_some() {
            self.next_channel = chan::csa2_channel(
                self.chain_counter,
                self.chan_id,
                &self.channel_map,
                self.channel_map.count(),
            );
            self.chain_counter = self.chain_counter.wrapping_add(1);
            header.aux_ptr = Some(AuxPtr {
                channel: self.next_channel,
                ca: sca_ppm(LOCAL_SCA) <= 50,
                offset_us: 0,
                phy,
            });
        }
        let mut out = [0; PDU_SIZE];
        let pdu_len = header.build(&mut out, pdu::payload(&chunk[..len]));
        self.air_us = phy.pdu_air_us(pdu_len - HEADER_LEN);
        if let (Some(ptr), Some(at)) = (header.aux_ptr, header.aux_ptr_offset()) {
            AuxPtr {
                offset_us: self.air_us + MAFS_US,
                ..ptr
            }
            .write(&mut out[at..at + AUX_PTR_LEN]);
        }
        env.radio.pkt_tx_set(&out[..pdu_len]);
        env.radio.switch_complete_and_disable();
        self.next = next;
        self.state = State::Tx;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::Bench;
    use std::boxed::Box;
    use std::vec::Vec;

    fn train(bench: &Bench) -> AdvSync<'static> {
        let data: &'static DoubleBuffer = Box::leak(Box::new(DoubleBuffer::new()));
        let params = PeriodicParams {
            interval: 80,
            channel_map: ChannelMap::ALL,
            phy: Phy::Le1M,
        };
        AdvSync::new(2, params, data, bench.rng).unwrap()
    }

    fn event(sync: &mut AdvSync, bench: &Bench, lazy: u16) -> Done {
        let env = bench.env();
        let mut param = PrepareParam::new(0, 0);
        param.lazy = lazy;
        assert_eq!(sync.prepare(&env, &param, false), None);
        loop {
            bench.radio.transmitted();
            if let Some(done) = sync.isr(&env) {
                return done;
            }
        }
    }

    #[test]
    fn parameters_are_checked() {
        let bench = Bench::new();
        let data = DoubleBuffer::new();
        let mut params = PeriodicParams {
            interval: 5,
            channel_map: ChannelMap::ALL,
            phy: Phy::Le1M,
        };
        assert!(AdvSync::new(0, params, &data, bench.rng).is_err());
        params.interval = 6;
        params.channel_map = ChannelMap::new([0, 0, 0, 0, 1]);
        assert!(AdvSync::new(0, params, &data, bench.rng).is_err());
    }

    #[test]
    fn events_hop_with_csa2() {
        let bench = Bench::new();
        let mut sync = train(&bench);
        assert!(chan::access_address_is_valid(sync.access_address()));

        event(&mut sync, &bench, 0);
        event(&mut sync, &bench, 2);
        let done = event(&mut sync, &bench, 0);
        assert_eq!(done.kind, EventKind::AdvSync);
        assert_eq!(done.tx_count, 1);

        let chan_id = chan::channel_id(sync.access_address());
        let expected: Vec<u8> = [0u16, 3, 4]
            .iter()
            .map(|&c| chan::csa2_channel(c, chan_id, &ChannelMap::ALL, 37))
            .collect();
        assert_eq!(*bench.radio.channels.borrow(), expected);
        assert_eq!(sync.event_counter(), 5);
        assert_eq!(bench.radio.access_address.get(), sync.access_address());
    }

    #[test]
    fn long_data_is_chained() {
        let bench = Bench::new();
        let env = bench.env();
        let mut sync = train(&bench);
        let data: Vec<u8> = (0..300).map(|i| i as u8).collect();
        sync.set_data(bench.pool, &data).unwrap();

        sync.prepare(&env, &PrepareParam::new(0, 3), false);
        let first = bench.radio.last_sent();
        let (header, body) = ExtHeader::parse(&first).unwrap();
        assert_eq!(body, &data[..AUX_DATA_CHUNK]);
        let air = Phy::Le1M.pdu_air_us(first.len() - HEADER_LEN);
        let ptr = header.aux_ptr.unwrap();
        assert_eq!(ptr.offset_us, (air + MAFS_US) / 30 * 30);

        bench.radio.transmitted();
        assert_eq!(sync.isr(&env), None);
        assert_eq!(bench.radio.last_channel(), Some(ptr.channel));
        assert_eq!(bench.radio.starts.borrow().last(), Some(&(true, 3 + air + MAFS_US)));
        let chained = bench.radio.last_sent();
        let (header, body) = ExtHeader::parse(&chained).unwrap();
        assert!(header.aux_ptr.is_none());
        assert_eq!(body, &data[AUX_DATA_CHUNK..]);

        bench.radio.transmitted();
        assert_eq!(sync.isr(&env).map(|d| d.tx_count), Some(2));
    }

    #[test]
    fn channel_map_update_at_instant() {
        let bench = Bench::new();
        let mut sync = train(&bench);
        let map = ChannelMap::new([0x00, 0x06, 0xE0, 0x00, 0x1E]);
        assert_eq!(
            sync.channel_map_update(ChannelMap::new([1, 0, 0, 0, 0])),
            Err(ErrorCode::INVAL)
        );
        sync.channel_map_update(map).unwrap();
        assert_eq!(sync.channel_map_update(map), Err(ErrorCode::BUSY));

        let update = ChmUpdate { map, instant: 6 };
        for _ in 0..6 {
            event(&mut sync, &bench, 0);
            let (header, _) = ExtHeader::parse(&bench.radio.last_sent()).unwrap();
            assert_eq!(header.chm_update, Some(update));
            assert_eq!(sync.channel_map(), ChannelMap::ALL);
        }
        event(&mut sync, &bench, 0);
        let (header, _) = ExtHeader::parse(&bench.radio.last_sent()).unwrap();
        assert_eq!(header.chm_update, None);
        assert_eq!(sync.channel_map(), map);
        assert!(map.is_used(bench.radio.last_channel().unwrap()));
    }

    #[test]
    fn sync_info_points_at_a_later_event() {
        let bench = Bench::new();
        let mut sync = train(&bench);
        sync.start(1000);
        let at = Schedule {
            ticks_anchor: 1000 + us_to_ticks(EVENT_START_US),
            offset_us: 250_000,
        };
        let info = sync.sync_info(&at);
        assert_eq!(info.event_counter, 3);
        assert_eq!(info.offset_us, 50_000);
        assert_eq!(info.interval, 80);
        assert_eq!(info.access_address, sync.access_address());
        assert_eq!(info.channel_map, ChannelMap::ALL);

        // an event only 300 us after the AUX_ADV_IND is too close
        sync.prepare(&bench.env(), &PrepareParam::new(5000, 20), false);
        let at = Schedule {
            ticks_anchor: 5000 + us_to_ticks(EVENT_START_US),
            offset_us: 20 + 99_700,
        };
        let info = sync.sync_info(&at);
        assert_eq!(info.event_counter, 2);
        assert_eq!(info.offset_us, 100_300);
    }

    #[test]
    fn pipeline_abort_counts_skipped_events() {
        let bench = Bench::new();
        let env = bench.env();
        let mut sync = train(&bench);
        let mut param = PrepareParam::new(0, 0);
        param.lazy = 1;
        assert!(sync.abort(&env, Some(&param)).aborted);
        event(&mut sync, &bench, 0);
        assert_eq!(sync.event_counter(), 3);
        let chan_id = chan::channel_id(sync.access_address());
        assert_eq!(
            bench.radio.last_channel(),
            Some(chan::csa2_channel(2, chan_id, &ChannelMap::ALL, 37))
        );
    }
}
