// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Per-event outcome records.
//!
//! Every radio event that was prepared produces exactly one [`Done`],
//! whether it ran to completion, was aborted while on air, or was aborted
//! in the pipeline before reaching the radio. The controller applies the
//! ticker parts of it and forwards it to the upper layer, which consumes
//! it once.

use kernel::hil::ticker::TickerUpdate;

use crate::drift::DriftMeasure;

/// Kind of event a [`Done`] belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Adv,
    AdvAux,
    AdvSync,
    AdvIso,
    Scan,
    Central,
    Peripheral,
    Sync,
    SyncIso,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Done {
    pub handle: u8,
    pub kind: EventKind,
    pub tx_count: u16,
    pub rx_count: u16,
    /// The anchor PDU of the event was received with a valid CRC.
    pub crc_valid: bool,
    /// The event was aborted, live or in the pipeline.
    pub aborted: bool,
    /// Part of the event's data could not be delivered (no rx buffer, chain
    /// cut short).
    pub incomplete: bool,
    pub drift: Option<DriftMeasure>,
    /// Adjustment of the role's periodic ticker.
    pub ticker: Option<TickerUpdate>,
    /// The role ended with this HCI reason.
    pub terminate: Option<u8>,
}

impl Done {
    pub fn new(handle: u8, kind: EventKind) -> Done {
        Done {
            handle,
            kind,
            tx_count: 0,
            rx_count: 0,
            crc_valid: false,
            aborted: false,
            incomplete: false,
            drift: None,
            ticker: None,
            terminate: None,
        }
    }

    /// The record of an event that never exchanged a packet.
    pub fn aborted(handle: u8, kind: EventKind) -> Done {
        Done {
            aborted: true,
            ..Done::new(handle, kind)
        }
    }
}

/// HCI reasons used as termination causes.
pub mod reason {
    pub const CONN_TIMEOUT: u8 = 0x08;
    pub const REMOTE_USER_TERM_CONN: u8 = 0x13;
    pub const LOCAL_HOST_TERM: u8 = 0x16;
    pub const LL_RESP_TIMEOUT: u8 = 0x22;
    pub const INSTANT_PASSED: u8 = 0x28;
    pub const TERM_MIC_FAILURE: u8 = 0x3D;
    pub const CONN_FAIL_TO_ESTAB: u8 = 0x3E;
}
