// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Data structure for storing compile-time configuration options.
//!
//! Configuration lives in a typed `const` object rather than behind `#[cfg]`
//! attributes so that every code path is type-checked, even the disabled
//! ones. After type-checking, the compiler folds the constants, so a flag
//! that is `false` costs nothing in the resulting binary.
//!
//! The boolean fields can be flipped from a board crate through the cargo
//! features of the same name (see `kernel/Cargo.toml`).

/// Data structure holding compile-time configuration options.
///
/// To change the configuration, modify the relevant values in the `CONFIG`
/// constant object defined at the end of this file, or enable the matching
/// cargo feature.
pub struct Config {
    /// Whether roles should trace the start and close of each radio event to
    /// the debug output.
    ///
    /// This prints from prepare and close paths, which run in the
    /// high-priority context. Only enable it when the debug writer is fast
    /// enough not to push events past their deadline.
    pub trace_radio_events: bool,

    /// Whether the prepare/abort pipeline should print its decisions:
    /// events that continue, are cancelled, are resumed, or are aborted while
    /// still waiting in the pipeline.
    pub trace_scheduler: bool,

    /// Whether connection and sync roles print the reason they terminated.
    pub trace_conn_terminate: bool,
}

/// A unique instance of `Config` where compile-time configuration options are
/// defined. These options are available in the kernel crate to be used for
/// relevant configuration. Notably, this is the only location in the crate
/// where we permit `#[cfg(x)]` to be used to configure code based on Cargo
/// features.
pub const CONFIG: Config = Config {
    trace_radio_events: cfg!(feature = "trace_radio_events"),
    trace_scheduler: cfg!(feature = "trace_scheduler"),
    trace_conn_terminate: cfg!(feature = "trace_conn_terminate"),
};
