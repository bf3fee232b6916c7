// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Data structures shared between the high-priority and background contexts.

pub mod atomic_ring_buffer;
pub mod sync_queue;
