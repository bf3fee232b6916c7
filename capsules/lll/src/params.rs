// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Link Layer timing constants and sizing limits.

/// Inter frame space.
pub const TIFS_US: u32 = 150;
/// Minimum auxiliary frame space.
pub const MAFS_US: u32 = 300;
/// Ticker resolution margin applied on each side of a receive window.
pub const TICKER_JITTER_US: u32 = 16;
/// Minimum subevent space of isochronous streams.
pub const MSS_US: u32 = 150;
/// Time between the prepare callback and the radio event start.
pub const EVENT_START_US: u32 = 300;

/// Sleep clock accuracy in ppm, indexed by the 3-bit SCA field.
pub const SCA_PPM: [u32; 8] = [500, 250, 150, 100, 75, 50, 30, 20];
/// Local sleep clock accuracy index (50 ppm).
pub const LOCAL_SCA: u8 = 5;

/// Connection interval, window size and window offset unit.
pub const CONN_UNIT_US: u32 = 1250;
/// Supervision timeout unit.
pub const SUPERVISION_UNIT_US: u32 = 10_000;
/// Link Layer procedure response timeout.
pub const PROCEDURE_TIMEOUT_US: u32 = 40_000_000;
/// Events a new connection has to establish before it is considered lost.
pub const CONN_ESTABLISH_EVENTS: u16 = 6;
/// Consecutive CRC errors that close a connection event.
pub const CRC_ERROR_CLOSE: u8 = 2;
/// Events between a central's LL_CHANNEL_MAP_IND and its instant, on top of
/// the peripheral latency.
pub const CHANNEL_MAP_INSTANT_MARGIN: u16 = 6;

/// Entries the prepare pipeline can defer.
pub const PIPELINE_DEPTH: usize = 4;
/// Concurrent role instances (advertising sets, scanner, connections,
/// syncs, BIGs).
pub const ROLE_SLOTS: usize = 8;
/// Streams in a BIG.
pub const BIS_MAX: usize = 31;
/// Streams a synchronized receiver follows at once.
pub const SYNC_ISO_STREAM_MAX: usize = 2;
/// Payload window slots per received stream.
pub const ISO_WINDOW_MAX: usize = 32;
/// Accept list entries.
pub const ACCEPT_LIST_SIZE: usize = 8;

/// Aux offsets below this are chained from the radio interrupt, larger ones
/// through a scheduled chain event.
pub const AUX_INLINE_MAX_US: u32 = 5_000;

/// Data PDUs queued for transmission per connection.
pub const CONN_TX_QUEUE: usize = 8;
/// Supervision countdown at which a connection event may no longer be
/// preempted.
pub const SUPERVISION_FORCE_EVENTS: u16 = 6;

/// Shortest advertising interval.
pub const ADV_INTERVAL_MIN_US: u32 = 20_000;
/// Upper bound of the random delay added to each advertising event.
pub const ADV_RANDOM_DELAY_US: u32 = 10_000;
/// Advertising data of a legacy PDU.
pub const LEGACY_ADV_DATA_MAX: usize = 31;
/// Extended and periodic advertising data of one set.
pub const EXT_ADV_DATA_MAX: usize = 1650;
/// Advertising data carried per auxiliary PDU.
pub const AUX_DATA_CHUNK: usize = 200;
