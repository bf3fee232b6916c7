// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Periodic advertising sync receiver.
//!
//! A [`PeriodicSync`] follows the AUX_SYNC_IND train described by the
//! SyncInfo a scanner found. Every event opens a widened receive window on
//! the CSA#2 channel of the event counter; the first valid PDU re-anchors
//! the ticker. The first valid PDU after creation establishes the sync.
//!
//! Chained AUX_CHAIN_IND PDUs are received from the radio interrupt when
//! their AuxPtr offset is short. Longer offsets end the event and leave a
//! one-shot chain event for the controller to schedule.
//!
//! ```text
//!   ticker  |<---- interval - widening ---->|
//!   radio     [ rx AUX_SYNC_IND ]  [ rx AUX_CHAIN_IND ]
//!                     |-- AuxPtr offset --->|
//! ```

use kernel::config::CONFIG;
use kernel::debug;
use kernel::hil::ble::Phy;
use kernel::hil::ticker::{us_to_ticks, TickerUpdate};

use crate::chan::{self, ChannelMap};
use crate::conn::events;
use crate::done::{reason, Done, EventKind};
use crate::drift::{offset_unit_us, Drift, DriftMeasure};
use crate::params::{
    AUX_INLINE_MAX_US, CONN_ESTABLISH_EVENTS, CONN_UNIT_US, LOCAL_SCA, SUPERVISION_FORCE_EVENTS,
    SUPERVISION_UNIT_US, TICKER_JITTER_US,
};
use crate::pdu::{self, AdvHeader, AdvHeaderVal, ChmUpdate, DeviceAddress, ExtHeader, PAYLOAD_MAX, PDU_SIZE};
use crate::role::{ticks_start, AuxWindow, Env, Schedule};
use crate::sched::{AbortDecision, PrepareParam};
use crate::ull::{RxKind, RxMeta, RxStatus};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    /// Receiving the AUX_SYNC_IND of a periodic event.
    Anchor,
    /// Receiving an AUX_CHAIN_IND.
    Chain,
}

#[derive(Copy, Clone, Debug, Default)]
struct EventStats {
    rx_count: u16,
    crc_valid: bool,
    incomplete: bool,
    drift: Option<DriftMeasure>,
}

pub struct PeriodicSync {
    handle: u8,
    adv_addr: DeviceAddress,
    sid: u8,
    phy: Phy,
    access_address: u32,
    crc_init: u32,
    chan_id: u16,
    channel_map: ChannelMap,
    chm_update: Option<ChmUpdate>,

    interval_us: u32,
    /// Offset from the AUX_ADV_IND that carried the SyncInfo.
    sync_offset_us: u32,
    /// Counter of the next event.
    event_counter: u16,
    /// Counter of the event on air.
    counter: u16,
    latency_prepare: u16,
    latency_event: u16,
    drift: Drift,

    established: bool,
    establish_expire: u16,
    supervision_reload: u16,
    supervision_expire: u16,

    state: State,
    /// The current event is a scheduled chain event.
    chain_event: bool,
    /// Tick the radio timer of the current event started from.
    ticks: u32,
    ev: EventStats,
    rssi: u8,
    chain_window: Option<AuxWindow>,
    /// Chain event the controller has not started a ticker for yet.
    chain_pending: Option<Schedule>,
    chain_scheduled: Option<Schedule>,
}

impl PeriodicSync {
    /// Sync to the train described by `info`. `timeout` is the sync
    /// supervision timeout in 10 ms units.
    pub fn new(
        info: &pdu::SyncInfo,
        adv_addr: DeviceAddress,
        sid: u8,
        phy: Phy,
        timeout: u16,
    ) -> PeriodicSync {
        let interval_us = info.interval as u32 * CONN_UNIT_US;
        let mut drift = Drift::new(LOCAL_SCA, info.sca, interval_us);
        drift.window_size_prepare_us = offset_unit_us(info.offset_us);
        PeriodicSync {
            handle: 0,
            adv_addr,
            sid,
            phy,
            access_address: info.access_address,
            crc_init: info.crc_init,
            chan_id: chan::channel_id(info.access_address),
            channel_map: info.channel_map,
            chm_update: None,
            interval_us,
            sync_offset_us: info.offset_us,
            event_counter: info.event_counter,
            counter: info.event_counter,
            latency_prepare: 0,
            latency_event: 0,
            drift,
            established: false,
            establish_expire: CONN_ESTABLISH_EVENTS,
            supervision_reload: events(timeout as u32 * SUPERVISION_UNIT_US, interval_us),
            supervision_expire: 0,
            state: State::Idle,
            chain_event: false,
            ticks: 0,
            ev: EventStats::default(),
            rssi: crate::ull::RSSI_NOT_AVAILABLE,
            chain_window: None,
            chain_pending: None,
            chain_scheduled: None,
        }
    }

    pub fn handle(&self) -> u8 {
        self.handle
    }

    pub fn set_handle(&mut self, handle: u8) {
        self.handle = handle;
    }

    /// Advertiser and set this train belongs to.
    pub fn is_from(&self, adv_addr: &DeviceAddress, sid: u8) -> bool {
        self.adv_addr == *adv_addr && self.sid == sid
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn interval_us(&self) -> u32 {
        self.interval_us
    }

    pub fn event_counter(&self) -> u16 {
        self.event_counter
    }

    pub fn channel_map(&self) -> ChannelMap {
        self.channel_map
    }

    /// Per-event widening, which the ticker period leaves out.
    pub fn periodic_widening_us(&self) -> u32 {
        self.drift.periodic_us
    }

    /// Radio start of the first event, on the timer of the event that
    /// received the SyncInfo in a PDU starting at `pdu_start_us`.
    pub fn first_offset_us(&self, pdu_start_us: u32, rx_ready_us: u32) -> u32 {
        (pdu_start_us + self.sync_offset_us)
            .saturating_sub(rx_ready_us + (TICKER_JITTER_US << 1) + self.drift.periodic_us)
    }

    /// A chain event to schedule.
    pub fn take_schedule(&mut self) -> Option<Schedule> {
        self.chain_pending.take()
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
            return Some(Done::aborted(self.handle, EventKind::Sync));
        }
        self.ev = EventStats::default();
        if param.chain {
            return self.chain_prepare(env, param);
        }

        let channel = self.event_setup(param);
        if CONFIG.trace_radio_events {
            debug!("sync {}: event {} on {}", self.handle, self.counter, channel);
        }
        let radio = env.radio;
        env.radio_setup(self.phy, self.access_address, self.crc_init, channel);
        radio.pkt_rx_set(PAYLOAD_MAX as u8);
        radio.switch_complete_and_disable();
        self.drift.event_start();
        self.ticks = ticks_start(param);
        let start_us = radio.tmr_start(false, self.ticks, param.remainder);
        radio.tmr_aa_capture();
        radio.tmr_end_capture();
        radio.rssi_measure();
        radio.tmr_hcto_configure(self.drift.hcto_us(
            start_us,
            radio.rx_ready_delay_us(self.phy),
            self.phy.addr_us(),
        ));
        self.state = State::Anchor;
        None
    }

    pub fn isr(&mut self, env: &Env) -> Option<Done> {
        let anchor = match self.state {
            State::Idle => return None,
            State::Anchor => true,
            State::Chain => false,
        };
        let radio = env.radio;
        if !radio.is_done() || !radio.crc_is_valid() {
            radio.disable();
            if !anchor {
                self.chain_lost(env);
            }
            return Some(self.close());
        }

        self.ev.rx_count += 1;
        self.ev.crc_valid = true;
        if anchor {
            let actual_us = radio.tmr_aa_get().saturating_sub(radio.tmr_ready_get());
            self.ev.drift = Some(self.drift.reset_on_anchor(actual_us, self.phy.addr_us()));
        }
        self.rssi = env.rssi();

        let mut buf = [0; PDU_SIZE];
        let pdu = env.rx_pdu(&mut buf);
        let header = match pdu.first() {
            Some(h) => AdvHeaderVal::new(*h),
            None => return Some(self.close()),
        };
        let ext = match ExtHeader::parse(pdu) {
            Some((ext, _)) if header.read(AdvHeader::PDU_TYPE) == AdvHeader::PDU_TYPE::AdvExt.value => ext,
            _ => {
                radio.disable();
                return Some(self.close());
            }
        };

        if anchor {
            if let Some(update) = ext.chm_update {
                if update.map.is_valid() && !chan::instant_in_past(self.counter, update.instant) {
                    self.chm_update = Some(update);
                }
            }
            if !self.established {
                let meta = RxMeta {
                    rssi: self.rssi,
                    counter: self.counter as u64,
                    ..RxMeta::new(RxKind::SyncEstablished, self.handle)
                };
                self.established = env.report(meta, pdu, 2);
            }
        }

        let pdu_start_us = radio.tmr_aa_get().saturating_sub(self.phy.addr_us());
        let meta = RxMeta {
            rssi: self.rssi,
            counter: self.counter as u64,
            param: ext.aux_ptr.is_some() as u8,
            ticks: self.ticks,
            offset_us: pdu_start_us,
            ..RxMeta::new(RxKind::PeriodicReport, self.handle)
        };
        if !env.report(meta, pdu, 1) {
            // the rest of the chain could not be delivered either
            self.ev.incomplete = true;
            radio.disable();
            return Some(self.close());
        }

        match ext.aux_ptr {
            Some(ptr) => {
                let window = AuxWindow::new(radio, &ptr, pdu_start_us);
                if ptr.offset_us < AUX_INLINE_MAX_US {
                    env.aux_rx_inline(&window);
                    self.state = State::Chain;
                    None
                } else {
                    radio.disable();
                    let when = Schedule {
                        ticks_anchor: self.ticks,
                        offset_us: window.enable_us,
                    };
                    self.chain_window = Some(window);
                    self.chain_pending = Some(when);
                    self.chain_scheduled = Some(when);
                    Some(self.close())
                }
            }
            None => {
                radio.disable();
                Some(self.close())
            }
        }
    }

    pub fn abort(&mut self, env: &Env, param: Option<&PrepareParam>) -> Done {
        match param {
            Some(param) => {
                if param.chain {
                    self.chain_scheduled = None;
                    self.chain_lost(env);
                } else {
                    self.latency_prepare = self
                        .latency_prepare
                        .saturating_add(param.lazy)
                        .saturating_add(1);
                }
                let mut done = Done::aborted(self.handle, EventKind::Sync);
                done.incomplete = param.chain;
                done
            }
            None => {
                env.radio.disable();
                if self.state == State::Chain {
                    self.chain_lost(env);
                }
                let mut done = self.close();
                done.aborted = true;
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
        self.drift.accumulate(skipped.saturating_add(1));

        if let Some(update) = self.chm_update {
            if chan::instant_passed(self.counter, update.instant) {
                self.channel_map = update.map;
                self.chm_update = None;
            }
        }
        chan::csa2_channel(
            self.counter,
            self.chan_id,
            &self.channel_map,
            self.channel_map.count(),
        )
    }

    fn chain_prepare(&mut self, env: &Env, param: &PrepareParam) -> Option<Done> {
        let (window, when) = match (self.chain_window.take(), self.chain_scheduled.take()) {
            (Some(window), Some(when)) => (window, when),
            _ => return Some(Done::aborted(self.handle, EventKind::Sync)),
        };
        self.ticks = ticks_start(param);
        env.aux_rx_scheduled(&window, self.access_address, self.crc_init, param, &when);
        self.state = State::Chain;
        self.chain_event = true;
        None
    }

    /// The rest of a chain will not be received: close the report.
    fn chain_lost(&mut self, env: &Env) {
        self.ev.incomplete = true;
        let meta = RxMeta {
            status: RxStatus::Incomplete,
            rssi: self.rssi,
            counter: self.counter as u64,
            ticks: self.ticks,
            ..RxMeta::new(RxKind::PeriodicReport, self.handle)
        };
        env.report(meta, &[], 1);
    }

    /// End of the event: establishment, supervision and the ticker update.
    fn close(&mut self) -> Done {
        let chain = self.chain_event;
        self.chain_event = false;
        self.state = State::Idle;
        let mut done = Done::new(self.handle, EventKind::Sync);
        done.rx_count = self.ev.rx_count;
        done.crc_valid = self.ev.crc_valid;
        done.incomplete = self.ev.incomplete;
        if chain {
            return done;
        }
        done.drift = self.ev.drift;

        let elapsed = self.latency_event.saturating_add(1);
        if self.ev.crc_valid {
            self.supervision_expire = 0;
        } else if !self.established {
            if self.establish_expire > elapsed {
                self.establish_expire -= elapsed;
            } else {
                return self.terminated(done, reason::CONN_FAIL_TO_ESTAB);
            }
        } else if self.supervision_expire == 0 {
            self.supervision_expire = self.supervision_reload;
        }

        if self.supervision_expire != 0 {
            if self.supervision_expire > elapsed {
                self.supervision_expire -= elapsed;
            } else {
                return self.terminated(done, reason::CONN_TIMEOUT);
            }
        }

        if let Some(measure) = self.ev.drift {
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

    fn terminated(&mut self, mut done: Done, reason: u8) -> Done {
        if CONFIG.trace_conn_terminate {
            debug!("sync {}: lost, reason {:#x}", self.handle, reason);
        }
        self.chain_pending = None;
        self.chain_scheduled = None;
        done.terminate = Some(reason);
        done
    }
}
