// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Core support crate for the BLE Link Layer lower half.
//!
//! This crate holds the pieces that the Link Layer capsules share but that
//! are not Link Layer logic themselves:
//!
//! - the hardware interface layer (HIL) describing the radio, ticker and
//!   random number collaborators,
//! - the standard [`ErrorCode`] type,
//! - compile-time configuration ([`config::CONFIG`]),
//! - the [`debug!`] macro,
//! - deferred calls, which run work in the background context,
//! - small cell utilities and lock-free collections.
//!
//! Everything here is `no_std`. Only the collections use `unsafe`, and each
//! use states the ownership rule that makes it sound.

#![warn(unreachable_pub)]
#![no_std]

pub use tock_registers::{register_bitfields, LocalRegisterCopy};

pub mod collections;
pub mod config;
#[macro_use]
pub mod debug;
pub mod deferred_call;
pub mod errorcode;
pub mod hil;
pub mod utilities;

pub use crate::errorcode::ErrorCode;
