// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Synchronous random number source.
//!
//! The Link Layer needs random values inside interrupt handlers (access
//! addresses, CRC seeds, hop increments, advertising delay), where it cannot
//! wait for an asynchronous entropy callback. Boards back this trait with a
//! pool that is refilled from the hardware entropy source in the background.

pub trait Random {
    /// Return a pseudo-random 32-bit value.
    fn random(&self) -> u32;

    /// Mix `seed` into the generator state.
    fn reseed(&self, seed: u32);
}
