// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Link Layer channel selection.
//!
//! Pure functions mapping event counters and a channel map to a data
//! channel index. Everything here is callable from both the radio interrupt
//! and thread context.
//!
//! - Channel Selection Algorithm #1 (`legacy_channel`): linear hop.
//! - Channel Selection Algorithm #2 (`csa2_channel`): pseudo-random,
//!   Bluetooth Core Specification Vol. 6, Part B, section 4.5.8.3.
//! - The isochronous variants (`iso_event_channel`,
//!   `iso_subevent_channel`) keep per-walk PRNG state in an [`IsoWalk`].
//!
//! Also here: instant arithmetic on the 16-bit event counter and access
//! address generation.

use kernel::hil::rng::Random;
use kernel::ErrorCode;

/// Number of data channels.
pub const DATA_CHANNEL_COUNT: u8 = 37;

/// Access address used on the primary advertising channels.
pub const ADVERTISING_ACCESS_ADDRESS: u32 = 0x8E89_BED6;

/// CRC initialization value for advertising channel PDUs.
pub const ADVERTISING_CRC_INIT: u32 = 0x55_5555;

/// Bitmap of used data channels, bit `n` of the 40-bit little-endian field
/// is channel `n`. Bits 37-39 are reserved and always cleared.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelMap([u8; 5]);

impl ChannelMap {
    pub const ALL: ChannelMap = ChannelMap([0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);

    pub const fn new(mut bytes: [u8; 5]) -> ChannelMap {
        bytes[4] &= 0x1F;
        ChannelMap(bytes)
    }

    pub fn from_slice(buf: &[u8]) -> Option<ChannelMap> {
        let bytes: [u8; 5] = buf.get(..5)?.try_into().ok()?;
        Some(ChannelMap::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 5] {
        &self.0
    }

    pub fn is_used(&self, channel: u8) -> bool {
        channel < DATA_CHANNEL_COUNT && self.0[(channel >> 3) as usize] & (1 << (channel & 7)) != 0
    }

    /// Number of used channels.
    pub fn count(&self) -> u8 {
        self.0.iter().map(|b| b.count_ones() as u8).sum()
    }

    /// A map is usable on air when it has at least two used channels.
    pub fn is_valid(&self) -> bool {
        self.count() >= 2
    }

    /// Number of used channels with an index below `channel`.
    pub fn used_below(&self, channel: u8) -> u8 {
        (0..channel.min(DATA_CHANNEL_COUNT))
            .filter(|c| self.is_used(*c))
            .count() as u8
    }

    /// The `index`-th used channel, wrapping `index` over the used set.
    /// Returns channel 0 for an empty map.
    pub fn remap(&self, index: u8) -> u8 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        let mut index = index % count;
        for channel in 0..DATA_CHANNEL_COUNT {
            if self.is_used(channel) {
                if index == 0 {
                    return channel;
                }
                index -= 1;
            }
        }
        0
    }
}

/// CSA#1 unmapped channel after `latency` skipped events.
pub fn legacy_unmapped(prev_unmapped: u8, hop_increment: u8, latency: u16) -> u8 {
    let hops = hop_increment as u32 * (latency as u32 + 1);
    ((prev_unmapped as u32 + hops) % DATA_CHANNEL_COUNT as u32) as u8
}

/// CSA#1: hop `hop_increment` once per elapsed event (`latency` skipped
/// events plus the current one) from the previous unmapped channel, then
/// remap if the result is unused.
///
/// Callers keep [`legacy_unmapped`] as the running walk state; the returned
/// value is the channel to use.
pub fn legacy_channel(prev_unmapped: u8, hop_increment: u8, latency: u16, map: &ChannelMap) -> u8 {
    let unmapped = legacy_unmapped(prev_unmapped, hop_increment, latency);
    if map.is_used(unmapped) {
        unmapped
    } else {
        map.remap(unmapped % map.count().max(1))
    }
}

/// CSA#2 channel identifier derived from an access address.
pub fn channel_id(access_address: u32) -> u16 {
    ((access_address >> 16) ^ (access_address & 0xFFFF)) as u16
}

fn perm(x: u16) -> u16 {
    let [hi, lo] = x.to_be_bytes();
    u16::from_be_bytes([hi.reverse_bits(), lo.reverse_bits()])
}

fn mam(a: u16, b: u16) -> u16 {
    a.wrapping_mul(17).wrapping_add(b)
}

fn prn_s(counter: u16, chan_id: u16) -> u16 {
    let mut x = counter ^ chan_id;
    for _ in 0..3 {
        x = mam(perm(x), chan_id);
    }
    x
}

fn remap_index(prn_e: u16, channel_count: u8) -> u8 {
    ((channel_count as u32 * prn_e as u32) >> 16) as u8
}

/// CSA#2 channel for `counter`.
pub fn csa2_channel(counter: u16, chan_id: u16, map: &ChannelMap, channel_count: u8) -> u8 {
    let prn_e = prn_s(counter, chan_id) ^ chan_id;
    let unmapped = (prn_e % DATA_CHANNEL_COUNT as u16) as u8;
    if map.is_used(unmapped) {
        unmapped
    } else {
        map.remap(remap_index(prn_e, channel_count))
    }
}

/// Channel walk state of one isochronous stream.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IsoWalk {
    /// Last used PRN.
    pub prn_lu: u16,
    /// Index of the last channel within the used set.
    pub remap_idx: u8,
}

/// Channel for the first subevent of an isochronous event. Seeds `walk`
/// for the subevents that follow.
pub fn iso_event_channel(
    counter: u16,
    chan_id: u16,
    map: &ChannelMap,
    channel_count: u8,
    walk: &mut IsoWalk,
) -> u8 {
    let prn_s = prn_s(counter, chan_id);
    let prn_e = prn_s ^ chan_id;
    let unmapped = (prn_e % DATA_CHANNEL_COUNT as u16) as u8;

    walk.prn_lu = prn_s;
    if map.is_used(unmapped) {
        walk.remap_idx = map.used_below(unmapped);
        unmapped
    } else {
        walk.remap_idx = remap_index(prn_e, channel_count);
        map.remap(walk.remap_idx)
    }
}

/// Channel for the next subevent of the walk.
pub fn iso_subevent_channel(
    chan_id: u16,
    map: &ChannelMap,
    channel_count: u8,
    walk: &mut IsoWalk,
) -> u8 {
    let n = channel_count as u32;
    if n == 0 {
        return 0;
    }

    walk.prn_lu = mam(perm(walk.prn_lu), chan_id);
    let prn_se = (walk.prn_lu ^ chan_id) as u32;

    let d1 = n.saturating_sub(5).min(3);
    let d2 = (n.saturating_sub(10) / 2).min(11);
    let d = d1.max(d2).max(1);
    let x = (n + 1).saturating_sub(2 * d);

    walk.remap_idx = ((((prn_se * x) >> 16) + d + walk.remap_idx as u32) % n) as u8;
    map.remap(walk.remap_idx)
}

/// Whether `counter` has reached `instant`, modulo counter wrap.
pub fn instant_passed(counter: u16, instant: u16) -> bool {
    counter.wrapping_sub(instant) <= 0x7FFF
}

/// Whether a received `instant` is already behind `counter`. Used to
/// validate procedures initiated by the peer.
pub fn instant_in_past(counter: u16, instant: u16) -> bool {
    instant.wrapping_sub(counter) > 0x7FFF
}

/// Check the access address rules of Vol. 6, Part B, section 2.1.2.
pub fn access_address_is_valid(aa: u32) -> bool {
    let adv_diff = aa ^ ADVERTISING_ACCESS_ADDRESS;
    if adv_diff.count_ones() <= 1 {
        return false;
    }

    let octets = aa.to_le_bytes();
    if octets.iter().all(|o| *o == octets[0]) {
        return false;
    }

    // Bit i of `changes` is set when bits i and i + 1 differ.
    let changes = (aa ^ (aa >> 1)) & 0x7FFF_FFFF;
    if changes.count_ones() > 24 {
        return false;
    }
    if (changes >> 26).count_ones() < 2 {
        return false;
    }

    let mut run = 1;
    for i in 0..31 {
        if changes & (1 << i) == 0 {
            run += 1;
            if run > 6 {
                return false;
            }
        } else {
            run = 1;
        }
    }
    true
}

/// Draws before [`access_address_generate`] gives up on the random source.
pub const ACCESS_ADDRESS_RETRIES: usize = 64;

/// Draw random access addresses until one satisfies
/// [`access_address_is_valid`]. `FAIL` if none of
/// [`ACCESS_ADDRESS_RETRIES`] draws does.
pub fn access_address_generate(rng: &dyn Random) -> Result<u32, ErrorCode> {
    (0..ACCESS_ADDRESS_RETRIES)
        .map(|_| rng.random())
        .find(|aa| access_address_is_valid(*aa))
        .ok_or(ErrorCode::FAIL)
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::quickcheck;

    const MAP_9: ChannelMap = ChannelMap::new([0x00, 0x06, 0xE0, 0x00, 0x1E]);

    #[test]
    fn channel_map_basics() {
        assert_eq!(ChannelMap::ALL.count(), 37);
        assert_eq!(MAP_9.count(), 9);
        assert!(MAP_9.is_used(9));
        assert!(!MAP_9.is_used(8));
        assert_eq!(MAP_9.remap(0), 9);
        assert_eq!(MAP_9.remap(8), 36);
        // past the end of the used set wraps to its start
        assert_eq!(MAP_9.remap(9), 9);
        assert_eq!(MAP_9.used_below(21), 2);
        assert_eq!(ChannelMap::new([0xFF; 5]), ChannelMap::ALL);
        assert!(!ChannelMap::new([0x01, 0, 0, 0, 0]).is_valid());
        assert!(ChannelMap::new([0x01, 0, 0, 0, 0x10]).is_valid());
        assert_eq!(ChannelMap::from_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn csa1_walk() {
        let mut unmapped = 0;
        let mut channels = [0; 4];
        for ch in channels.iter_mut() {
            *ch = legacy_channel(unmapped, 7, 0, &MAP_9);
            unmapped = legacy_unmapped(unmapped, 7, 0);
        }
        assert_eq!(channels, [35, 33, 21, 10]);

        // two skipped events hop three times
        assert_eq!(legacy_channel(0, 5, 2, &ChannelMap::ALL), 15);
        assert_eq!(legacy_unmapped(30, 5, 2), 8);
    }

    #[test]
    fn csa2_all_channels() {
        let id = channel_id(0x8E89_BED6);
        assert_eq!(id, 0x305F);
        let channels: [u8; 4] = core::array::from_fn(|c| csa2_channel(c as u16, id, &ChannelMap::ALL, 37));
        assert_eq!(channels, [25, 20, 6, 21]);
    }

    #[test]
    fn csa2_nine_channels() {
        assert_eq!(csa2_channel(6, 0x305F, &MAP_9, 9), 23);
        assert_eq!(csa2_channel(7, 0x305F, &MAP_9, 9), 9);
        assert_eq!(csa2_channel(8, 0x305F, &MAP_9, 9), 34);
    }

    #[test]
    fn iso_walk_all_channels() {
        let mut walk = IsoWalk::default();
        assert_eq!(iso_event_channel(1, 0x305F, &ChannelMap::ALL, 37, &mut walk), 20);
        assert_eq!(walk, IsoWalk { prn_lu: 14026, remap_idx: 20 });
        let subevents: [u8; 3] =
            core::array::from_fn(|_| iso_subevent_channel(0x305F, &ChannelMap::ALL, 37, &mut walk));
        assert_eq!(subevents, [36, 12, 34]);
    }

    #[test]
    fn iso_walk_nine_channels() {
        let mut walk = IsoWalk::default();
        assert_eq!(iso_event_channel(6, 0x305F, &MAP_9, 9, &mut walk), 23);
        assert_eq!(walk.remap_idx, 4);
        let subevents: [u8; 3] =
            core::array::from_fn(|_| iso_subevent_channel(0x305F, &MAP_9, 9, &mut walk));
        assert_eq!(subevents, [35, 21, 36]);
        assert_eq!(walk.remap_idx, 8);
    }

    #[test]
    fn instants_wrap() {
        assert!(instant_passed(10, 10));
        assert!(instant_passed(11, 10));
        assert!(!instant_passed(9, 10));
        assert!(!instant_passed(0xFFFF, 0x0000));
        assert!(instant_passed(0x0000, 0xFFFF));
        assert!(instant_passed(0x0005, 0xFFF0));

        assert!(instant_in_past(0x0001, 0xFFFF));
        assert!(!instant_in_past(0xFFFF, 0x0001));
        assert!(!instant_in_past(5, 5));
    }

    #[test]
    fn access_address_rules() {
        assert!(!access_address_is_valid(ADVERTISING_ACCESS_ADDRESS));
        assert!(!access_address_is_valid(ADVERTISING_ACCESS_ADDRESS ^ 0x0000_0100));
        assert!(!access_address_is_valid(0x5A5A_5A5A));
        // seven zeros in a row
        assert!(!access_address_is_valid(0x5A01_805A));
        assert!(!access_address_is_valid(0x5555_5555));
        // no transition in the top six bits
        assert!(!access_address_is_valid(0xFC5A_3C96));
        assert!(access_address_is_valid(0x7176_4129));
        assert!(access_address_is_valid(0x5065_4C1B));
    }

    struct Counter(core::cell::Cell<u32>);

    impl Random for Counter {
        fn random(&self) -> u32 {
            let v = self.0.get();
            self.0.set(v.wrapping_mul(1_103_515_245).wrapping_add(12345));
            v
        }

        fn reseed(&self, seed: u32) {
            self.0.set(seed);
        }
    }

    #[test]
    fn generated_access_addresses_are_valid() {
        let rng = Counter(core::cell::Cell::new(ADVERTISING_ACCESS_ADDRESS));
        for _ in 0..32 {
            assert!(access_address_is_valid(access_address_generate(&rng).unwrap()));
        }
    }

    struct Stuck;

    impl Random for Stuck {
        fn random(&self) -> u32 {
            ADVERTISING_ACCESS_ADDRESS
        }

        fn reseed(&self, _seed: u32) {}
    }

    #[test]
    fn broken_random_source_gives_up() {
        assert_eq!(access_address_generate(&Stuck), Err(ErrorCode::FAIL));
    }

    quickcheck! {
        fn csa2_picks_used_channel(counter: u16, chan_id: u16, map: (u8, u8, u8, u8, u8)) -> bool {
            let map = ChannelMap::new([map.0, map.1, map.2, map.3, map.4]);
            if !map.is_valid() {
                return true;
            }
            let first = csa2_channel(counter, chan_id, &map, map.count());
            map.is_used(first) && first == csa2_channel(counter, chan_id, &map, map.count())
        }

        fn iso_walk_picks_used_channels(counter: u16, chan_id: u16, map: (u8, u8, u8, u8, u8)) -> bool {
            let map = ChannelMap::new([map.0, map.1, map.2, map.3, map.4]);
            if !map.is_valid() {
                return true;
            }
            let mut walk = IsoWalk::default();
            let mut ok = map.is_used(iso_event_channel(counter, chan_id, &map, map.count(), &mut walk));
            for _ in 0..8 {
                ok &= map.is_used(iso_subevent_channel(chan_id, &map, map.count(), &mut walk));
            }
            ok
        }

        fn csa1_picks_used_channel(prev: u8, hop: u8, latency: u16, map: (u8, u8, u8, u8, u8)) -> bool {
            let map = ChannelMap::new([map.0, map.1, map.2, map.3, map.4]);
            if !map.is_valid() {
                return true;
            }
            map.is_used(legacy_channel(prev % 37, 5 + hop % 12, latency, &map))
        }
    }
}
