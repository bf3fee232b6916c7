// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Glue between the ticker, the radio and the role state machines.
//!
//! The controller owns a fixed set of role slots. A slot's index is the
//! handle of the role in it: the id of its periodic ticker and the `handle`
//! of every report and [`Done`] it produces. Auxiliary and chain events of a
//! role run on a one-shot ticker whose id has [`CHAIN_TICKER`] set.
//!
//! Ticker expiries and radio interrupts enter here, go through the
//! [`Scheduler`] and are dispatched to the role in the slot. After each
//! dispatch the controller collects what the role left behind: follow-up
//! events to schedule, and connections or periodic syncs to install in a
//! slot of their own. `Done` records are forwarded to the upper layer once
//! their ticker adjustments are applied. A `Done` that carries a
//! termination frees the slot and reports why.
//!
//! Usage
//! -----
//!
//! ```rust,ignore
//! let controller = static_init!(
//!     capsules_lll::controller::Controller<'static>,
//!     capsules_lll::controller::Controller::new(radio, ticker, rng, pdu_pool, rx_pool, rx_pool)
//! );
//! radio.set_client(controller);
//! ticker.set_client(controller);
//!
//! let adv = controller.adv_enable(params, AcceptList::default(), &ADV_DATA, &SCAN_DATA)?;
//! controller.adv_set_data(adv, &[0x02, 0x01, 0x06])?;
//! ```

use core::cell::Cell;

use kernel::config::CONFIG;
use kernel::debug;
use kernel::hil::ble::{Radio, RadioClient};
use kernel::hil::rng::Random;
use kernel::hil::ticker::{remainder_us, us_to_ticks, Expiry, Ticker, TickerClient, TickerStart};
use kernel::utilities::cells::MapCell;
use kernel::ErrorCode;

use crate::adv::{AdvParams, AdvType, Advertiser};
use crate::adv_iso::{BigBroadcaster, BigParams};
use crate::adv_sync::{AdvSync, PeriodicParams};
use crate::chan::ChannelMap;
use crate::conn::Connection;
use crate::dbuf::DoubleBuffer;
use crate::done::reason::{CONN_FAIL_TO_ESTAB, CONN_TIMEOUT};
use crate::done::Done;
use crate::mem::{PduHandle, PduPool};
use crate::params::{EVENT_START_US, ROLE_SLOTS};
use crate::role::{AcceptList, Env, Handoff, Schedule};
use crate::scan::{ScanParams, Scanner};
use crate::sched::{AbortDecision, EventHandler, PrepareParam, Scheduler};
use crate::sync::PeriodicSync;
use crate::sync_iso::{BigReceiver, BigSyncParams};
use crate::ull::{RxAlloc, RxKind, RxMeta, RxSink};

/// Ticker id bit of a role's one-shot follow-up event.
pub const CHAIN_TICKER: u8 = 0x80;

/// The radio context of one slot.
pub enum Role<'a> {
    Adv(Advertiser<'a>),
    AdvSync(AdvSync<'a>),
    Scan(Scanner),
    Conn(Connection),
    Sync(PeriodicSync),
    AdvIso(BigBroadcaster),
    SyncIso(BigReceiver),
}

impl<'a> Role<'a> {
    /// `own_event` is set when the prepare comes from this role as well.
    fn is_abort(&self, own_event: bool) -> AbortDecision {
        match self {
            Role::Adv(adv) => adv.is_abort(own_event),
            Role::AdvSync(sync) => sync.is_abort(own_event),
            Role::Scan(scan) => scan.is_abort(),
            Role::Conn(conn) => conn.is_abort(),
            Role::Sync(sync) => sync.is_abort(),
            Role::AdvIso(big) => big.is_abort(),
            Role::SyncIso(big) => big.is_abort(),
        }
    }

    fn prepare(&mut self, env: &Env, param: &PrepareParam, resume: bool) -> Option<Done> {
        match self {
            Role::Adv(adv) => adv.prepare(env, param, resume),
            Role::AdvSync(sync) => sync.prepare(env, param, resume),
            Role::Scan(scan) => scan.prepare(env, param, resume),
            Role::Conn(conn) => conn.prepare(env, param, resume),
            Role::Sync(sync) => sync.prepare(env, param, resume),
            Role::AdvIso(big) => big.prepare(env, param, resume),
            Role::SyncIso(big) => big.prepare(env, param, resume),
        }
    }

    fn isr(&mut self, env: &Env) -> Option<Done> {
        match self {
            Role::Adv(adv) => adv.isr(env),
            Role::AdvSync(sync) => sync.isr(env),
            Role::Scan(scan) => scan.isr(env),
            Role::Conn(conn) => conn.isr(env),
            Role::Sync(sync) => sync.isr(env),
            Role::AdvIso(big) => big.isr(env),
            Role::SyncIso(big) => big.isr(env),
        }
    }

    fn abort(&mut self, env: &Env, param: Option<&PrepareParam>) -> Done {
        match self {
            Role::Adv(adv) => adv.abort(env, param),
            Role::AdvSync(sync) => sync.abort(env, param),
            Role::Scan(scan) => scan.abort(env, param),
            Role::Conn(conn) => conn.abort(env, param),
            Role::Sync(sync) => sync.abort(env, param),
            Role::AdvIso(big) => big.abort(env, param),
            Role::SyncIso(big) => big.abort(env, param),
        }
    }

    fn take_schedule(&mut self) -> Option<Schedule> {
        match self {
            Role::Adv(adv) => adv.take_schedule(),
            Role::Scan(scan) => scan.take_schedule(),
            Role::Sync(sync) => sync.take_schedule(),
            _ => None,
        }
    }

    fn take_handoff(&mut self) -> Option<Handoff> {
        match self {
            Role::Adv(adv) => adv.take_handoff(),
            Role::Scan(scan) => scan.take_handoff(),
            _ => None,
        }
    }

    /// Give back every buffer the role holds.
    fn release(&mut self, env: &Env) {
        match self {
            Role::Adv(adv) => adv.release(env.pool),
            Role::AdvSync(sync) => sync.release(env.pool),
            Role::Conn(conn) => conn.release(env.pool),
            Role::AdvIso(big) => big.release(env.pool),
            Role::SyncIso(big) => big.release(env),
            Role::Scan(_) | Role::Sync(_) => {}
        }
    }

    /// Report ending a role terminated with `reason`.
    fn end_report(&self, reason: u8) -> Option<RxKind> {
        match self {
            Role::Conn(_) => Some(RxKind::Terminate),
            Role::Sync(_) => Some(RxKind::SyncLost),
            Role::SyncIso(_) if reason == CONN_TIMEOUT || reason == CONN_FAIL_TO_ESTAB => {
                Some(RxKind::BigSyncLost)
            }
            Role::SyncIso(_) | Role::AdvIso(_) => Some(RxKind::BigTerminate),
            Role::Adv(_) | Role::AdvSync(_) | Role::Scan(_) => None,
        }
    }
}

pub struct Controller<'a> {
    radio: &'a dyn Radio,
    ticker: &'a dyn Ticker,
    rng: &'a dyn Random,
    pool: &'a PduPool<'a>,
    rx: &'a dyn RxAlloc,
    sink: &'a dyn RxSink,
    sched: Scheduler,
    slots: [MapCell<Role<'a>>; ROLE_SLOTS],
    /// Slots whose one-shot follow-up ticker has not expired yet.
    chains: [Cell<bool>; ROLE_SLOTS],
}

impl<'a> Controller<'a> {
    pub fn new(
        radio: &'a dyn Radio,
        ticker: &'a dyn Ticker,
        rng: &'a dyn Random,
        pool: &'a PduPool<'a>,
        rx: &'a dyn RxAlloc,
        sink: &'a dyn RxSink,
    ) -> Controller<'a> {
        Controller {
            radio,
            ticker,
            rng,
            pool,
            rx,
            sink,
            sched: Scheduler::new(),
            slots: core::array::from_fn(|_| MapCell::empty()),
            chains: core::array::from_fn(|_| Cell::new(false)),
        }
    }

    fn env(&self) -> Env<'a> {
        Env {
            radio: self.radio,
            pool: self.pool,
            rx: self.rx,
            sink: self.sink,
            rng: self.rng,
        }
    }

    fn slot(&self, handle: u8) -> Option<&MapCell<Role<'a>>> {
        self.slots.get(handle as usize)
    }

    fn free_slot(&self) -> Result<u8, ErrorCode> {
        self.slots
            .iter()
            .position(|slot| slot.is_none())
            .map(|index| index as u8)
            .ok_or(ErrorCode::NOMEM)
    }

    /// Run `f` on the role in `handle`. `OFF` if the slot is empty.
    fn with_role<R, F>(&self, handle: u8, f: F) -> Result<R, ErrorCode>
    where
        F: FnOnce(&mut Role<'a>) -> Result<R, ErrorCode>,
    {
        self.slot(handle)
            .and_then(|slot| slot.map(f))
            .unwrap_or(Err(ErrorCode::OFF))
    }

    pub fn is_enabled(&self, handle: u8) -> bool {
        self.slot(handle).map_or(false, |slot| slot.is_some())
    }

    /// Handle of the role owning the radio.
    pub fn current(&self) -> Option<u8> {
        self.sched.current()
    }

    /// Anchor and first expiry of a role enabled now.
    fn start_now(&self) -> (u32, u32) {
        (self.ticker.ticks_now(), us_to_ticks(EVENT_START_US))
    }

    /// Put `role` in slot `handle` and start its periodic ticker.
    fn install(
        &self,
        handle: u8,
        role: Role<'a>,
        ticks_anchor: u32,
        ticks_first: u32,
        period_us: u32,
    ) -> Result<(), ErrorCode> {
        let slot = self.slot(handle).ok_or(ErrorCode::INVAL)?;
        // expiries still queued for a previous occupant of the slot
        self.sched.cancel(self, handle);
        slot.put(role);
        let start = TickerStart {
            ticks_anchor,
            ticks_first,
            ticks_periodic: us_to_ticks(period_us),
            remainder_periodic: remainder_us(period_us),
            lazy: 0,
            ticks_slot: 0,
        };
        if let Err(e) = self.ticker.start(handle, start) {
            slot.take();
            return Err(e);
        }
        if CONFIG.trace_scheduler {
            debug!("ctrl: {} started, period {} us", handle, period_us);
        }
        Ok(())
    }

    fn stop_tickers(&self, handle: u8) {
        if self.ticker.stop(handle).is_err() && CONFIG.trace_scheduler {
            debug!("ctrl: ticker of {} not stopped", handle);
        }
        let armed = self.chains.get(handle as usize).map_or(false, |armed| armed.take());
        if armed && self.ticker.stop(handle | CHAIN_TICKER).is_err() && CONFIG.trace_scheduler {
            debug!("ctrl: follow-up ticker of {} not stopped", handle);
        }
    }

    /// Start legacy or extended advertising. Returns the set's handle.
    pub fn adv_enable(
        &self,
        params: AdvParams,
        accept: AcceptList,
        adv_data: &'a DoubleBuffer,
        scan_data: &'a DoubleBuffer,
    ) -> Result<u8, ErrorCode> {
        let handle = self.free_slot()?;
        let adv = Advertiser::new(handle, params, accept, adv_data, scan_data)?;
        let (ticks_anchor, ticks_first) = self.start_now();
        self.install(handle, Role::Adv(adv), ticks_anchor, ticks_first, params.interval_us)?;
        Ok(handle)
    }

    pub fn adv_set_data(&self, handle: u8, data: &[u8]) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::Adv(adv) => adv.set_adv_data(self.pool, data),
            _ => Err(ErrorCode::INVAL),
        })
    }

    pub fn adv_set_scan_data(&self, handle: u8, data: &[u8]) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::Adv(adv) => adv.set_scan_data(self.pool, data),
            _ => Err(ErrorCode::INVAL),
        })
    }

    /// Start periodic advertising for the extended advertising set `adv`.
    /// Returns the handle of the train.
    pub fn adv_sync_enable(
        &self,
        adv: u8,
        params: PeriodicParams,
        data: &'a DoubleBuffer,
    ) -> Result<u8, ErrorCode> {
        let linked = self.with_role(adv, |role| match role {
            Role::Adv(set) if set.params().adv_type == AdvType::Extended => Ok(set.periodic()),
            _ => Err(ErrorCode::INVAL),
        })?;
        if linked.is_some() {
            return Err(ErrorCode::ALREADY);
        }
        let handle = self.free_slot()?;
        let mut sync = AdvSync::new(handle, params, data, self.rng)?;
        let (ticks_anchor, ticks_first) = self.start_now();
        sync.start(ticks_anchor.wrapping_add(ticks_first));
        let interval_us = sync.interval_us();
        self.install(handle, Role::AdvSync(sync), ticks_anchor, ticks_first, interval_us)?;
        self.with_role(adv, |role| {
            if let Role::Adv(set) = role {
                set.set_periodic(Some(handle));
            }
            Ok(())
        })?;
        Ok(handle)
    }

    pub fn adv_sync_set_data(&self, handle: u8, data: &[u8]) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::AdvSync(sync) => sync.set_data(self.pool, data),
            _ => Err(ErrorCode::INVAL),
        })
    }

    pub fn adv_sync_channel_map_update(&self, handle: u8, map: ChannelMap) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::AdvSync(sync) => sync.channel_map_update(map),
            _ => Err(ErrorCode::INVAL),
        })
    }

    /// Start scanning, initiating or looking for a periodic train, as
    /// `params` says.
    pub fn scan_enable(&self, params: ScanParams, accept: AcceptList) -> Result<u8, ErrorCode> {
        let handle = self.free_slot()?;
        let scan = Scanner::new(handle, params, accept)?;
        let (ticks_anchor, ticks_first) = self.start_now();
        self.install(handle, Role::Scan(scan), ticks_anchor, ticks_first, params.interval_us)?;
        Ok(handle)
    }

    /// Queue a data PDU on a connection. The PDU stays the caller's on
    /// error.
    pub fn conn_tx(&self, handle: u8, pdu: PduHandle) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::Conn(conn) => conn.enqueue_tx(pdu),
            _ => Err(ErrorCode::INVAL),
        })
    }

    pub fn conn_set_encrypted(&self, handle: u8, encrypted: bool) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::Conn(conn) => {
                conn.set_encrypted(encrypted);
                Ok(())
            }
            _ => Err(ErrorCode::INVAL),
        })
    }

    pub fn conn_channel_map_update(&self, handle: u8, map: ChannelMap) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::Conn(conn) => conn.channel_map_update(self.pool, map),
            _ => Err(ErrorCode::INVAL),
        })
    }

    /// Start the termination of a connection. The slot is freed and a
    /// `Terminate` report sent once the peer acknowledged or timed out.
    pub fn conn_terminate(&self, handle: u8, reason: u8) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::Conn(conn) => conn.terminate(self.pool, reason),
            _ => Err(ErrorCode::INVAL),
        })
    }

    /// Create a broadcast isochronous group. Returns its handle.
    pub fn big_create(&self, params: BigParams, map: ChannelMap) -> Result<u8, ErrorCode> {
        let handle = self.free_slot()?;
        let big = BigBroadcaster::new(handle, params, map, self.rng)?;
        let (ticks_anchor, ticks_first) = self.start_now();
        self.install(handle, Role::AdvIso(big), ticks_anchor, ticks_first, params.interval_us())?;
        Ok(handle)
    }

    pub fn big_send(&self, handle: u8, bis: u8, payload: &[u8]) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::AdvIso(big) => big.send(self.pool, bis, payload),
            _ => Err(ErrorCode::INVAL),
        })
    }

    pub fn big_channel_map_update(&self, handle: u8, map: ChannelMap) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::AdvIso(big) => big.channel_map_update(map),
            _ => Err(ErrorCode::INVAL),
        })
    }

    /// Announce the end of a BIG; it stops at the announced instant.
    pub fn big_terminate(&self, handle: u8, reason: u8) -> Result<(), ErrorCode> {
        self.with_role(handle, |role| match role {
            Role::AdvIso(big) => big.terminate(reason),
            _ => Err(ErrorCode::INVAL),
        })
    }

    /// Synchronize to a BIG whose event `params.event_counter` has its
    /// anchor at `first`.
    pub fn big_sync_create(&self, params: BigSyncParams, first: Schedule) -> Result<u8, ErrorCode> {
        let handle = self.free_slot()?;
        let big = BigReceiver::new(handle, params)?;
        let period_us = big.interval_us() - big.periodic_widening_us();
        self.install(
            handle,
            Role::SyncIso(big),
            first.ticks_anchor,
            first.ticks_first(),
            period_us,
        )?;
        Ok(handle)
    }

    /// Stop the role in `handle`. A live event is aborted and waiting
    /// prepares are dropped, each reporting its `Done`. Connections end
    /// with [`Controller::conn_terminate`] instead.
    pub fn disable(&self, handle: u8) -> Result<(), ErrorCode> {
        let conn = self.with_role(handle, |role| Ok(matches!(role, Role::Conn(_))))?;
        if conn {
            return Err(ErrorCode::INVAL);
        }
        self.sched.disable(self, handle);
        self.stop_tickers(handle);
        if let Some(mut role) = self.slot(handle).and_then(|slot| slot.take()) {
            role.release(&self.env());
            if let Role::AdvSync(_) = role {
                self.unlink_periodic(handle);
            }
        }
        if CONFIG.trace_scheduler {
            debug!("ctrl: {} disabled", handle);
        }
        Ok(())
    }

    /// The advertising set carrying train `periodic` stops pointing at it.
    fn unlink_periodic(&self, periodic: u8) {
        for slot in self.slots.iter() {
            slot.map(|role| {
                if let Role::Adv(adv) = role {
                    if adv.periodic() == Some(periodic) {
                        adv.set_periodic(None);
                    }
                }
            });
        }
    }

    /// Apply and forward the outcome of an event of `handle`.
    fn finish(&self, handle: u8, done: Done) {
        if let Some(update) = done.ticker {
            if self.ticker.update(handle, update).is_err() && CONFIG.trace_scheduler {
                debug!("ctrl: ticker update of {} refused", handle);
            }
        }
        let terminate = done.terminate;
        self.sink.done(done);
        if let Some(reason) = terminate {
            self.terminate(handle, reason);
        }
    }

    /// The role in `handle` ended: free the slot and say why.
    fn terminate(&self, handle: u8, reason: u8) {
        self.stop_tickers(handle);
        let mut role = match self.slot(handle).and_then(|slot| slot.take()) {
            Some(role) => role,
            None => return,
        };
        let env = self.env();
        role.release(&env);
        if CONFIG.trace_conn_terminate {
            debug!("ctrl: {} terminated, reason {:#x}", handle, reason);
        }
        if let Some(kind) = role.end_report(reason) {
            let meta = RxMeta {
                param: reason,
                ..RxMeta::new(kind, handle)
            };
            if !env.report(meta, &[], 1) && CONFIG.trace_conn_terminate {
                debug!("ctrl: termination report of {} lost", handle);
            }
        }
    }

    /// Act on what the role in `handle` left behind after a dispatch.
    fn settle(&self, handle: u8) {
        let taken = self
            .slot(handle)
            .and_then(|slot| slot.map(|role| (role.take_schedule(), role.take_handoff())));
        let (schedule, handoff) = match taken {
            Some(taken) => taken,
            None => return,
        };
        if let Some(when) = schedule {
            self.schedule(handle, &when);
        }
        if let Some(handoff) = handoff {
            self.handoff(handle, handoff);
        }
    }

    /// Start the one-shot ticker of a follow-up event of `handle`.
    fn schedule(&self, handle: u8, when: &Schedule) {
        // the AUX_ADV_IND of a set with a periodic train points at it
        let periodic = self
            .slot(handle)
            .and_then(|slot| {
                slot.map(|role| match role {
                    Role::Adv(adv) => adv.periodic(),
                    _ => None,
                })
            })
            .flatten();
        if let Some(periodic) = periodic {
            let info = self
                .slot(periodic)
                .and_then(|slot| {
                    slot.map(|role| match role {
                        Role::AdvSync(sync) => Some(sync.sync_info(when)),
                        _ => None,
                    })
                })
                .flatten();
            if let Some(slot) = self.slot(handle) {
                slot.map(|role| {
                    if let Role::Adv(adv) = role {
                        adv.set_sync_info(info);
                    }
                });
            }
        }

        let start = TickerStart {
            ticks_anchor: when.ticks_anchor,
            ticks_first: when.ticks_first(),
            ticks_periodic: 0,
            remainder_periodic: 0,
            lazy: 0,
            ticks_slot: 0,
        };
        match self.ticker.start(handle | CHAIN_TICKER, start) {
            Ok(()) => {
                if let Some(armed) = self.chains.get(handle as usize) {
                    armed.set(true);
                }
            }
            Err(_) => {
                if CONFIG.trace_scheduler {
                    debug!("ctrl: follow-up event of {} not scheduled", handle);
                }
            }
        }
    }

    /// Install a context created by the event of `source`.
    fn handoff(&self, source: u8, handoff: Handoff) {
        match handoff {
            Handoff::Connection {
                mut conn,
                first,
                period_us,
                connect_ind,
                csa2,
            } => {
                // the advertiser or initiator that connected stops
                self.sched.cancel(self, source);
                self.stop_tickers(source);
                let env = self.env();
                if let Some(mut role) = self.slot(source).and_then(|slot| slot.take()) {
                    role.release(&env);
                }

                let handle = source;
                conn.set_handle(handle);
                let installed = self.install(
                    handle,
                    Role::Conn(conn),
                    first.ticks_anchor,
                    first.ticks_first(),
                    period_us,
                );
                env.report(RxMeta::new(RxKind::ConnComplete, handle), &connect_ind, 1);
                match installed {
                    Ok(()) => {
                        let meta = RxMeta {
                            param: csa2 as u8,
                            ..RxMeta::new(RxKind::ChanSelAlgo, handle)
                        };
                        env.report(meta, &[], 1);
                    }
                    Err(_) => {
                        let meta = RxMeta {
                            param: CONN_FAIL_TO_ESTAB,
                            ..RxMeta::new(RxKind::Terminate, handle)
                        };
                        env.report(meta, &[], 1);
                    }
                }
            }
            Handoff::Sync {
                mut sync,
                first,
                period_us,
            } => {
                let installed = self.free_slot().and_then(|handle| {
                    sync.set_handle(handle);
                    self.install(
                        handle,
                        Role::Sync(sync),
                        first.ticks_anchor,
                        first.ticks_first(),
                        period_us,
                    )
                });
                if installed.is_err() && CONFIG.trace_scheduler {
                    debug!("ctrl: train found by {} dropped", source);
                }
            }
        }
    }
}

impl<'a> EventHandler for Controller<'a> {
    fn is_abort(&self, curr: u8, next: u8, _param: &PrepareParam) -> AbortDecision {
        self.slot(curr)
            .and_then(|slot| slot.map(|role| role.is_abort(curr == next)))
            .unwrap_or(AbortDecision::Cancel)
    }

    fn abort(&self, handle: u8, param: Option<&PrepareParam>) {
        let env = self.env();
        match self
            .slot(handle)
            .and_then(|slot| slot.map(|role| role.abort(&env, param)))
        {
            Some(done) => self.finish(handle, done),
            None if param.is_none() => self.radio.disable(),
            None => {}
        }
    }

    fn prepare(&self, handle: u8, param: &PrepareParam, resume: bool) -> bool {
        let env = self.env();
        let started = match self
            .slot(handle)
            .and_then(|slot| slot.map(|role| role.prepare(&env, param, resume)))
        {
            // stale expiry of a freed slot
            None => false,
            Some(None) => true,
            Some(Some(done)) => {
                self.finish(handle, done);
                false
            }
        };
        self.settle(handle);
        started
    }
}

impl<'a> TickerClient for Controller<'a> {
    fn ticker_expired(&self, id: u8, expiry: Expiry) {
        let chain = id & CHAIN_TICKER != 0;
        let handle = id & !CHAIN_TICKER;
        if chain {
            if let Some(armed) = self.chains.get(handle as usize) {
                armed.set(false);
            }
        }
        let param = PrepareParam {
            ticks_at_expire: expiry.ticks_at_expire,
            remainder: expiry.remainder,
            lazy: expiry.lazy,
            force: expiry.force,
            chain,
        };
        self.sched.prepare(self, handle, param);
    }
}

impl<'a> RadioClient for Controller<'a> {
    fn radio_isr(&self) {
        let handle = match self.sched.current() {
            Some(handle) => handle,
            None => {
                self.radio.disable();
                return;
            }
        };
        let env = self.env();
        let done = match self.slot(handle).and_then(|slot| slot.map(|role| role.isr(&env))) {
            Some(done) => done,
            None => {
                self.radio.disable();
                self.sched.done(self);
                return;
            }
        };
        if let Some(done) = done {
            self.finish(handle, done);
        }
        self.settle(handle);
        if done.is_some() {
            self.sched.done(self);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::done::reason;
    use crate::done::EventKind;
    use crate::mock::Bench;
    use crate::pdu::{ConnectInd, DeviceAddress, ExtHeader, PDU_SIZE};
    use kernel::hil::ble::Phy;
    use std::boxed::Box;
    use std::vec::Vec;

    const OWN: DeviceAddress = DeviceAddress::random([0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]);
    const PEER: DeviceAddress = DeviceAddress::public([0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6]);

    fn controller(bench: &Bench) -> Controller<'static> {
        Controller::new(bench.radio, bench.ticker, bench.rng, bench.pool, bench.rx, bench.rx)
    }

    fn buffer() -> &'static DoubleBuffer {
        Box::leak(Box::new(DoubleBuffer::new()))
    }

    fn adv_params(adv_type: AdvType, channel_map: u8) -> AdvParams {
        AdvParams {
            adv_type,
            own_addr: OWN,
            peer_addr: None,
            channel_map,
            filter_policy: 0,
            interval_us: 100_000,
            scan_req_notify: false,
            secondary_phy: Phy::Le1M,
            sid: 2,
        }
    }

    fn advertise(ctrl: &Controller<'static>, adv_type: AdvType, channel_map: u8) -> Result<u8, ErrorCode> {
        ctrl.adv_enable(adv_params(adv_type, channel_map), AcceptList::default(), buffer(), buffer())
    }

    fn scan_params() -> ScanParams {
        ScanParams {
            active: false,
            own_addr: OWN,
            interval_us: 100_000,
            window_us: 50_000,
            filter_policy: 0,
            initiate: None,
            sync: None,
        }
    }

    fn expire(ctrl: &Controller<'static>, id: u8, ticks: u32) {
        ctrl.ticker_expired(
            id,
            Expiry {
                ticks_at_expire: ticks,
                remainder: 0,
                lazy: 0,
                force: false,
            },
        );
    }

    fn connect_ind() -> Vec<u8> {
        let ind = ConnectInd {
            access_address: 0x7176_4129,
            crc_init: 0x12_3456,
            win_size: 2,
            win_offset: 3,
            interval: 80,
            latency: 0,
            timeout: 100,
            channel_map: ChannelMap::ALL,
            hop: 7,
            sca: 0,
        };
        let mut out = [0; PDU_SIZE];
        let len = ind.build(&mut out, &PEER, &OWN, true);
        out[..len].to_vec()
    }

    fn big_params() -> BigParams {
        BigParams {
            num_bis: 2,
            bn: 1,
            irc: 1,
            ptc: 0,
            pto: 0,
            iso_interval: 16,
            sub_interval_us: 1000,
            bis_spacing_us: 2000,
            max_pdu: 20,
            phy: Phy::Le2M,
            packing: crate::adv_iso::Packing::Sequential,
        }
    }

    #[test]
    fn advertiser_runs_on_its_ticker() {
        let bench = Bench::new();
        let ctrl = controller(&bench);
        let adv = advertise(&ctrl, AdvType::NonconnInd, 0b011).unwrap();
        assert_eq!(adv, 0);
        ctrl.adv_set_data(adv, &[2, 1, 6]).unwrap();
        let (id, start) = bench.ticker.starts.borrow()[0];
        assert_eq!(id, 0);
        assert_eq!(start.ticks_periodic, us_to_ticks(100_000));
        assert_eq!(start.remainder_periodic, remainder_us(100_000));

        expire(&ctrl, 0, 1000);
        assert_eq!(ctrl.current(), Some(0));
        assert_eq!(bench.radio.sent_count(), 1);
        bench.radio.transmitted();
        ctrl.radio_isr();
        bench.radio.transmitted();
        ctrl.radio_isr();
        assert_eq!(ctrl.current(), None);
        assert_eq!(*bench.radio.channels.borrow(), [37, 38]);

        let dones = bench.dones();
        assert_eq!(dones.len(), 1);
        assert_eq!((dones[0].handle, dones[0].kind, dones[0].tx_count), (0, EventKind::Adv, 2));
        // random advertising delay
        let updates = bench.ticker.updates.borrow();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, 0);
    }

    #[test]
    fn slots_are_bounded() {
        let bench = Bench::new();
        let ctrl = controller(&bench);
        for handle in 0..ROLE_SLOTS as u8 {
            assert_eq!(advertise(&ctrl, AdvType::NonconnInd, 0b111), Ok(handle));
        }
        assert_eq!(advertise(&ctrl, AdvType::NonconnInd, 0b111), Err(ErrorCode::NOMEM));
        ctrl.disable(3).unwrap();
        assert_eq!(advertise(&ctrl, AdvType::NonconnInd, 0b111), Ok(3));

        // a ticker that refuses leaves the slot free
        ctrl.disable(5).unwrap();
        bench.ticker.refuse.set(true);
        assert_eq!(advertise(&ctrl, AdvType::NonconnInd, 0b111), Err(ErrorCode::BUSY));
        assert!(!ctrl.is_enabled(5));
        // invalid parameters never take a slot
        bench.ticker.refuse.set(false);
        assert_eq!(advertise(&ctrl, AdvType::NonconnInd, 0), Err(ErrorCode::INVAL));
        assert!(!ctrl.is_enabled(5));
    }

    #[test]
    fn disable_aborts_live_event() {
        let bench = Bench::new();
        let ctrl = controller(&bench);
        let adv = advertise(&ctrl, AdvType::NonconnInd, 0b111).unwrap();
        expire(&ctrl, adv, 0);
        assert_eq!(ctrl.current(), Some(adv));

        ctrl.disable(adv).unwrap();
        assert_eq!(ctrl.current(), None);
        assert_eq!(bench.radio.disabled.get(), 1);
        let dones = bench.dones();
        assert_eq!(dones.len(), 1);
        assert!(dones[0].aborted);
        // no follow-up event was pending
        assert_eq!(*bench.ticker.stops.borrow(), [adv]);

        assert_eq!(ctrl.disable(adv), Err(ErrorCode::OFF));
        assert_eq!(ctrl.adv_set_data(adv, &[1]), Err(ErrorCode::OFF));
        // a late expiry of the freed slot is dropped
        expire(&ctrl, adv, 100);
        assert_eq!(ctrl.current(), None);
        assert!(bench.dones().is_empty());
    }

    #[test]
    fn requests_must_match_the_role() {
        let bench = Bench::new();
        let ctrl = controller(&bench);
        let scan = ctrl.scan_enable(scan_params(), AcceptList::default()).unwrap();
        assert_eq!(ctrl.adv_set_data(scan, &[1]), Err(ErrorCode::INVAL));
        assert_eq!(ctrl.conn_terminate(scan, reason::LOCAL_HOST_TERM), Err(ErrorCode::INVAL));
        assert_eq!(ctrl.big_send(scan, 0, &[1]), Err(ErrorCode::INVAL));
        assert_eq!(
            ctrl.adv_sync_enable(
                scan,
                PeriodicParams {
                    interval: 80,
                    channel_map: ChannelMap::ALL,
                    phy: Phy::Le1M,
                },
                buffer(),
            ),
            Err(ErrorCode::INVAL)
        );
        assert_eq!(ctrl.adv_set_data(7, &[1]), Err(ErrorCode::OFF));
        assert_eq!(ctrl.adv_set_data(200, &[1]), Err(ErrorCode::OFF));
    }

    #[test]
    fn advertiser_preempts_and_scanner_resumes() {
        let bench = Bench::new();
        let ctrl = controller(&bench);
        let scan = ctrl.scan_enable(scan_params(), AcceptList::default()).unwrap();
        let adv = advertise(&ctrl, AdvType::NonconnInd, 0b001).unwrap();

        expire(&ctrl, scan, 100);
        assert_eq!(ctrl.current(), Some(scan));
        expire(&ctrl, adv, 110);
        assert_eq!(ctrl.current(), Some(adv));
        let dones = bench.dones();
        assert_eq!(dones.len(), 1);
        assert_eq!((dones[0].handle, dones[0].aborted), (scan, true));

        bench.radio.transmitted();
        ctrl.radio_isr();
        // the interrupted window starts again at once
        assert_eq!(ctrl.current(), Some(scan));
        assert_eq!(bench.radio.starts.borrow().last(), Some(&(false, 0)));
        let dones = bench.dones();
        assert_eq!(dones.len(), 1);
        assert_eq!((dones[0].handle, dones[0].kind), (adv, EventKind::Adv));
    }

    #[test]
    fn connect_ind_installs_the_connection() {
        let bench = Bench::new();
        let ctrl = controller(&bench);
        let adv = advertise(&ctrl, AdvType::Ind, 0b001).unwrap();
        bench.ticker.starts.borrow_mut().clear();

        expire(&ctrl, adv, 1000);
        bench.radio.transmitted();
        ctrl.radio_isr();
        let ind = connect_ind();
        bench.radio.end_us.set(500);
        bench.radio.receive(&ind);
        ctrl.radio_isr();
        assert_eq!(ctrl.current(), None);

        let reports = bench.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0.kind, RxKind::ConnComplete);
        assert_eq!(reports[0].1, ind);
        assert_eq!((reports[1].0.kind, reports[1].0.param), (RxKind::ChanSelAlgo, 1));
        let conn = reports[0].0.handle;
        assert_eq!(bench.dones()[0].kind, EventKind::Adv);

        assert_eq!(*bench.ticker.stops.borrow(), [adv]);
        let (id, start) = bench.ticker.starts.borrow()[0];
        assert_eq!(id, conn);
        assert_eq!(start.ticks_anchor, 1000 + us_to_ticks(EVENT_START_US));
        assert_eq!(start.ticks_periodic, us_to_ticks(100_000 - 55));

        assert_eq!(ctrl.disable(conn), Err(ErrorCode::INVAL));
        assert_eq!(ctrl.adv_set_data(conn, &[1]), Err(ErrorCode::INVAL));
        assert_eq!(ctrl.conn_set_encrypted(conn, false), Ok(()));
    }

    #[test]
    fn failed_connection_frees_the_slot() {
        let bench = Bench::new();
        let ctrl = controller(&bench);
        let adv = advertise(&ctrl, AdvType::Ind, 0b001).unwrap();
        expire(&ctrl, adv, 1000);
        bench.radio.transmitted();
        ctrl.radio_isr();
        bench.radio.receive(&connect_ind());
        ctrl.radio_isr();
        let conn = bench.reports()[0].0.handle;
        bench.dones();

        // the central is never heard
        for event in 0..6 {
            expire(&ctrl, conn, 2000 + event * 3277);
            assert_eq!(ctrl.current(), Some(conn));
            bench.radio.timeout();
            ctrl.radio_isr();
        }
        let dones = bench.dones();
        assert_eq!(dones.len(), 6);
        assert_eq!(dones[5].terminate, Some(reason::CONN_FAIL_TO_ESTAB));
        let reports = bench.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0.kind, RxKind::Terminate);
        assert_eq!((reports[0].0.handle, reports[0].0.param), (conn, reason::CONN_FAIL_TO_ESTAB));
        assert!(!ctrl.is_enabled(conn));
        assert_eq!(bench.ticker.stops.borrow().last(), Some(&conn));
        assert_eq!(ctrl.conn_terminate(conn, reason::LOCAL_HOST_TERM), Err(ErrorCode::OFF));
    }

    #[test]
    fn aux_event_carries_periodic_sync_info() {
        let bench = Bench::new();
        let ctrl = controller(&bench);
        let adv = advertise(&ctrl, AdvType::Extended, 0b001).unwrap();
        ctrl.adv_set_data(adv, &[0x55; 10]).unwrap();
        let periodic = PeriodicParams {
            interval: 80,
            channel_map: ChannelMap::ALL,
            phy: Phy::Le1M,
        };
        let train = ctrl.adv_sync_enable(adv, periodic, buffer()).unwrap();
        assert_eq!(ctrl.adv_sync_enable(adv, periodic, buffer()), Err(ErrorCode::ALREADY));
        assert_eq!(ctrl.adv_sync_enable(6, periodic, buffer()), Err(ErrorCode::OFF));

        expire(&ctrl, adv, 1000);
        bench.radio.transmitted();
        ctrl.radio_isr();
        assert_eq!(ctrl.current(), None);
        let (id, start) = *bench.ticker.starts.borrow().last().unwrap();
        assert_eq!(id, adv | CHAIN_TICKER);
        assert_eq!(start.ticks_periodic, 0);

        expire(&ctrl, id, start.ticks_anchor + start.ticks_first);
        assert_eq!(ctrl.current(), Some(adv));
        let (header, _) = ExtHeader::parse(&bench.radio.last_sent()).unwrap();
        let info = header.sync_info.unwrap();
        let access_address = ctrl
            .slot(train)
            .and_then(|slot| {
                slot.map(|role| match role {
                    Role::AdvSync(sync) => Some(sync.access_address()),
                    _ => None,
                })
            })
            .flatten();
        assert_eq!(Some(info.access_address), access_address);
        assert_eq!(info.interval, 80);

        // without the train the set advertises on alone
        bench.radio.transmitted();
        ctrl.radio_isr();
        ctrl.disable(train).unwrap();
        let linked = ctrl.with_role(adv, |role| match role {
            Role::Adv(set) => Ok(set.periodic()),
            _ => Err(ErrorCode::INVAL),
        });
        assert_eq!(linked, Ok(None));
    }

    #[test]
    fn pending_follow_up_is_stopped() {
        let bench = Bench::new();
        let ctrl = controller(&bench);
        let adv = advertise(&ctrl, AdvType::Extended, 0b001).unwrap();
        ctrl.adv_set_data(adv, &[0x55; 10]).unwrap();
        expire(&ctrl, adv, 1000);
        bench.radio.transmitted();
        ctrl.radio_isr();
        assert_eq!(bench.ticker.starts.borrow().last().map(|s| s.0), Some(adv | CHAIN_TICKER));

        // the AUX_ADV_IND has not gone out yet
        ctrl.disable(adv).unwrap();
        assert_eq!(*bench.ticker.stops.borrow(), [adv, adv | CHAIN_TICKER]);
    }

    #[test]
    fn termination_report_follows_the_role() {
        let bench = Bench::new();
        let ctrl = controller(&bench);
        let big = ctrl.big_create(big_params(), ChannelMap::ALL).unwrap();
        ctrl.big_send(big, 1, &[1, 2, 3]).unwrap();
        let free = bench.pool.free_count();

        let params = ctrl
            .with_role(big, |role| match role {
                Role::AdvIso(b) => Ok(BigSyncParams {
                    big: *b.params(),
                    seed_access_address: b.seed_access_address(),
                    base_crc_init: b.base_crc_init(),
                    channel_map: b.channel_map(),
                    event_counter: b.event_counter(),
                    sca: 5,
                    bis_mask: 0b01,
                    timeout: 10,
                }),
                _ => Err(ErrorCode::INVAL),
            })
            .unwrap();
        let first = Schedule {
            ticks_anchor: 0,
            offset_us: 10_000,
        };
        let receiver = ctrl.big_sync_create(params, first).unwrap();
        let (id, start) = *bench.ticker.starts.borrow().last().unwrap();
        assert_eq!((id, start.ticks_first), (receiver, first.ticks_first()));

        ctrl.finish(
            big,
            Done {
                terminate: Some(reason::LOCAL_HOST_TERM),
                ..Done::new(big, EventKind::AdvIso)
            },
        );
        ctrl.finish(
            receiver,
            Done {
                terminate: Some(reason::CONN_TIMEOUT),
                ..Done::new(receiver, EventKind::SyncIso)
            },
        );
        let reports: Vec<(RxKind, u8, u8)> = bench
            .reports()
            .iter()
            .map(|(meta, _)| (meta.kind, meta.handle, meta.param))
            .collect();
        assert_eq!(
            reports,
            [
                (RxKind::BigTerminate, big, reason::LOCAL_HOST_TERM),
                (RxKind::BigSyncLost, receiver, reason::CONN_TIMEOUT),
            ]
        );
        assert_eq!(bench.dones().len(), 2);
        // queued payload released
        assert!(bench.pool.free_count() > free);
        assert!(!ctrl.is_enabled(big));
        assert!(!ctrl.is_enabled(receiver));
    }
}
