// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Window widening and clock drift compensation.
//!
//! A receiver that follows a peer's anchor points opens its receive window
//! early and keeps it open longer by the worst case drift of both sleep
//! clocks since the last successful synchronization. The widening grows by
//! `periodic_us` per elapsed event, is capped at `max_us`, and collapses to
//! zero once an anchor PDU is received with a valid CRC. The measured
//! offset of that reception is turned into a ticker correction.
//!
//! ```text
//!            window_widening        window_widening
//!            <------------->        <------------->
//!   ---------[      expected anchor point         ]----------
//! ```

use crate::params::{LOCAL_SCA, SCA_PPM, TICKER_JITTER_US, TIFS_US};

pub fn sca_ppm(sca: u8) -> u32 {
    SCA_PPM[(sca & 0x7) as usize]
}

/// Per-event widening for both clock accuracies over `interval_us`, rounded
/// up.
pub fn periodic_widening_us(local_sca: u8, peer_sca: u8, interval_us: u32) -> u32 {
    let ppm = (sca_ppm(local_sca) + sca_ppm(peer_sca)) as u64;
    ((ppm * interval_us as u64 + 999_999) / 1_000_000) as u32
}

/// Widening of a receive window `offset_us` after the PDU announcing it,
/// for a peer whose clock accuracy bit is `ca` (0-50 ppm when set).
pub fn offset_widening_us(offset_us: u32, ca: bool) -> u32 {
    let peer_ppm = if ca { 50 } else { 500 };
    let ppm = (sca_ppm(LOCAL_SCA) + peer_ppm) as u64;
    ((ppm * offset_us as u64 + 999_999) / 1_000_000) as u32 + TICKER_JITTER_US
}

/// Rounding of an AuxPtr or SyncInfo offset: 300 us units beyond what 13
/// bits of 30 us reach.
pub fn offset_unit_us(offset_us: u32) -> u32 {
    if offset_us > 0x1FFF * 30 {
        300
    } else {
        30
    }
}

/// Receive timing of an anchor PDU, kept for the done record.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DriftMeasure {
    /// Radio start to access address when the peer is exactly on time.
    pub expected_us: u32,
    /// Radio start to access address as captured.
    pub actual_us: u32,
    /// Widening applied to this event.
    pub window_widening_us: u32,
}

impl DriftMeasure {
    /// Ticker correction `(plus_us, minus_us)` that moves the next anchor to
    /// where the peer actually is.
    pub fn correction_us(&self) -> (u32, u32) {
        if self.actual_us <= self.expected_us {
            (self.window_widening_us, self.expected_us - self.actual_us)
        } else {
            (
                self.actual_us,
                self.expected_us.saturating_sub(self.window_widening_us),
            )
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Drift {
    pub periodic_us: u32,
    pub max_us: u32,
    /// Widening accumulated by prepares not yet applied to an event.
    pub prepare_us: u32,
    /// Widening of the current event.
    pub event_us: u32,
    /// Transmit window size still to be added, for the first event of a
    /// connection.
    pub window_size_prepare_us: u32,
    pub window_size_event_us: u32,
}

impl Drift {
    pub fn new(local_sca: u8, peer_sca: u8, interval_us: u32) -> Drift {
        Drift {
            periodic_us: periodic_widening_us(local_sca, peer_sca, interval_us),
            max_us: (interval_us >> 1).saturating_sub(TIFS_US),
            ..Drift::default()
        }
    }

    /// Grow the widening for `elapsed_events` events since the previous
    /// prepare.
    pub fn accumulate(&mut self, elapsed_events: u16) {
        self.prepare_us = self
            .prepare_us
            .saturating_add(self.periodic_us.saturating_mul(elapsed_events as u32))
            .min(self.max_us);
    }

    /// Move the accumulated widening into the event about to start and
    /// return it.
    pub fn event_start(&mut self) -> u32 {
        self.event_us = (self.event_us + self.prepare_us).min(self.max_us);
        self.prepare_us = 0;
        self.window_size_event_us += self.window_size_prepare_us;
        self.window_size_prepare_us = 0;
        self.event_us
    }

    /// Radio start to access address for a peer exactly on time.
    pub fn expected_start_to_address_us(&self, addr_us: u32) -> u32 {
        (TICKER_JITTER_US << 1) + addr_us + self.event_us
    }

    /// Header complete timeout of a widened receive window opened at
    /// `remainder_us`, for a radio with `rx_ready_us` ramp-up.
    pub fn hcto_us(&self, remainder_us: u32, rx_ready_us: u32, addr_us: u32) -> u32 {
        remainder_us
            + (TICKER_JITTER_US << 2)
            + (self.event_us << 1)
            + self.window_size_event_us
            + rx_ready_us
            + addr_us
    }

    /// The anchor PDU was received with a valid CRC `actual_us` after the
    /// radio start: record the offset and collapse the widening.
    pub fn reset_on_anchor(&mut self, actual_us: u32, addr_us: u32) -> DriftMeasure {
        let measure = DriftMeasure {
            expected_us: self.expected_start_to_address_us(addr_us),
            actual_us,
            window_widening_us: self.event_us,
        };
        self.event_us = 0;
        self.window_size_event_us = 0;
        measure
    }
}
