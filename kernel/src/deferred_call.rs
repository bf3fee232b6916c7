// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Hardware-independent kernel interface for deferred calls.
//!
//! A deferred call is how work leaves the high-priority context. Code running
//! from a radio or ticker interrupt sets the call, and the background loop
//! later services it by invoking the client. Setting a call never blocks and
//! setting it again before it is serviced coalesces into one invocation.
//!
//! ```rust
//! use kernel::deferred_call::{DeferredCall, DeferredCallClient};
//!
//! struct RxDrain {
//!     deferred_call: DeferredCall,
//! }
//!
//! impl DeferredCallClient for RxDrain {
//!     fn handle_deferred_call(&self) {
//!         // move finished nodes to the host
//!     }
//! }
//!
//! let drain = RxDrain { deferred_call: DeferredCall::new() };
//! drain.deferred_call.set();
//! assert!(drain.deferred_call.service(&drain));
//! assert!(!drain.deferred_call.service(&drain));
//! ```

use core::sync::atomic::{AtomicBool, Ordering};

/// This trait should be implemented by clients which need to receive
/// [`DeferredCall`]s.
pub trait DeferredCallClient {
    /// Software interrupt function that is called when the deferred call is
    /// serviced by the background context.
    fn handle_deferred_call(&self);
}

/// A pending flag owned by one client.
pub struct DeferredCall {
    pending: AtomicBool,
}

impl DeferredCall {
    pub const fn new() -> Self {
        DeferredCall {
            pending: AtomicBool::new(false),
        }
    }

    /// Mark the call pending. Safe to call from any context.
    pub fn set(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Check if the call is pending.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Run `client` if the call is pending. Returns whether it ran.
    ///
    /// The flag is cleared before the client runs, so a `set()` from inside
    /// the handler, or from an interrupt during it, is not lost.
    pub fn service<C: DeferredCallClient + ?Sized>(&self, client: &C) -> bool {
        if self.pending.swap(false, Ordering::AcqRel) {
            client.handle_deferred_call();
            true
        } else {
            false
        }
    }
}
