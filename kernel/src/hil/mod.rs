// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Public traits for interfaces between the Link Layer and the hardware.

pub mod ble;
pub mod rng;
pub mod ticker;
