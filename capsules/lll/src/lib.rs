// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Lower half of a Bluetooth Low Energy Link Layer.
//!
//! The crate runs the radio side of every Link Layer role: legacy and
//! extended advertising, periodic advertising, scanning and initiating,
//! central and peripheral connections, periodic sync, and broadcast
//! isochronous groups in both directions.
//!
//! Roles are state machines driven from two interrupt contexts. A ticker
//! expiry prepares an event; the [`sched::Scheduler`] decides whether it may
//! take the radio now, has to wait, or preempts the event on air. Radio
//! interrupts then step the role through its packets until it reports a
//! [`done::Done`]. The [`controller::Controller`] wires roles, scheduler,
//! ticker and radio together and is the entry point for a board.
//!
//! Received PDUs and event outcomes go to the upper layer through
//! [`ull::RxPool`], which hands them over in a deferred call.

#![forbid(unsafe_code)]
#![no_std]

pub mod adv;
pub mod adv_iso;
pub mod adv_sync;
pub mod chan;
pub mod conn;
pub mod controller;
pub mod dbuf;
pub mod done;
pub mod drift;
pub mod mem;
pub mod params;
pub mod pdu;
pub mod role;
pub mod scan;
pub mod sched;
pub mod sync;
pub mod sync_iso;
pub mod ull;

// Used to run the tests on a host
#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(test)]
mod mock;
