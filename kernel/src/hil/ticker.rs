// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interface to the ticker, the low-power timer service that invokes each
//! role's prepare callback ahead of its radio event.
//!
//! The ticker counts a 32768 Hz clock. Periodic timers carry a microsecond
//! remainder so that intervals which are not a whole number of ticks do not
//! accumulate error. When an expiry is delivered late because the ticker
//! skipped it (contention or requested latency), `lazy` reports how many
//! periods were skipped.

use crate::ErrorCode;

/// Ticker clock frequency.
pub const TICKER_FREQ_HZ: u32 = 32768;

/// Convert microseconds to whole ticks, rounding down.
pub fn us_to_ticks(us: u32) -> u32 {
    ((us as u64 * TICKER_FREQ_HZ as u64) / 1_000_000) as u32
}

/// Convert ticks to microseconds, rounding down.
pub fn ticks_to_us(ticks: u32) -> u32 {
    ((ticks as u64 * 1_000_000) / TICKER_FREQ_HZ as u64) as u32
}

/// Part of `us` lost by [`us_to_ticks`].
pub fn remainder_us(us: u32) -> u32 {
    us - ticks_to_us(us_to_ticks(us))
}

/// Parameters of a ticker start.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TickerStart {
    /// Reference tick the first expiry is relative to.
    pub ticks_anchor: u32,
    /// First expiry, in ticks after `ticks_anchor`.
    pub ticks_first: u32,
    /// Period in ticks; 0 for a one-shot timer.
    pub ticks_periodic: u32,
    /// Sub-tick part of the period in microseconds.
    pub remainder_periodic: u32,
    /// Number of expiries to skip between callbacks.
    pub lazy: u16,
    /// Radio time reserved per expiry.
    pub ticks_slot: u32,
}

/// Adjustment applied to a running ticker after an event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct TickerUpdate {
    pub ticks_drift_plus: u32,
    pub ticks_drift_minus: u32,
    /// New lazy count plus one; 0 leaves it unchanged.
    pub lazy: u16,
    /// Deliver the next expiry even when it would be skipped.
    pub force: bool,
}

/// One delivered expiry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Expiry {
    pub ticks_at_expire: u32,
    pub remainder: u32,
    pub lazy: u16,
    pub force: bool,
}

pub trait Ticker {
    fn ticks_now(&self) -> u32;

    fn start(&self, id: u8, params: TickerStart) -> Result<(), ErrorCode>;

    fn update(&self, id: u8, update: TickerUpdate) -> Result<(), ErrorCode>;

    fn stop(&self, id: u8) -> Result<(), ErrorCode>;
}

pub trait TickerClient {
    fn ticker_expired(&self, id: u8, expiry: Expiry);
}

pub trait TickerInterrupt<'a> {
    fn set_client(&self, client: &'a dyn TickerClient);
}
