// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Interface between the BLE Link Layer and the radio peripheral.
//!
//! ```text
//!        BLE Link Layer (capsules-lll)
//!
//! +-------------------------------------------+
//! |   Radio + RadioInterrupt                  |
//! +-------------------------------------------+
//!
//!        Radio driver (chip crate)
//! ```
//!
//! The Link Layer drives the radio through short register-level commands.
//! None of them return an error: they are fire-and-forget writes whose effect
//! is observed later, from the radio interrupt, through the status queries
//! (`is_done`, `crc_is_valid`, `rssi_is_ready`, `ccm_mic_is_valid`).
//!
//! All timer values are microseconds relative to the instant the radio timer
//! was started with [`Radio::tmr_start`] or [`Radio::tmr_start_now`].
//!
//! Packet buffers are copied. `pkt_tx_set` takes a PDU (2-octet header
//! followed by the payload) and copies it to radio packet memory;
//! `pkt_rx_set` arms reception into radio packet memory and `pkt_rx_get`
//! copies the last received PDU out.

/// LE physical layers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phy {
    Le1M,
    Le2M,
    LeCoded,
}

impl Phy {
    /// Air time from the start of the preamble to the end of the access
    /// address.
    pub fn addr_us(self) -> u32 {
        match self {
            Phy::Le1M => 40,
            Phy::Le2M => 20,
            Phy::LeCoded => 400,
        }
    }

    /// Air time of an empty PDU, preamble to CRC.
    pub fn empty_pdu_us(self) -> u32 {
        match self {
            Phy::Le1M => 80,
            Phy::Le2M => 44,
            Phy::LeCoded => 720,
        }
    }

    /// Air time of a PDU with `payload_len` payload octets, preamble to
    /// CRC. Coded PHY assumes S8 coding.
    pub fn pdu_air_us(self, payload_len: usize) -> u32 {
        let len = payload_len as u32;
        match self {
            Phy::Le1M => (10 + len) * 8,
            Phy::Le2M => (11 + len) * 4,
            Phy::LeCoded => 376 + (43 + len * 8) * 8,
        }
    }

    /// Decode the 3-bit PHY field used in AuxPtr and PHY update PDUs.
    pub fn from_bits(bits: u8) -> Option<Phy> {
        match bits {
            0 => Some(Phy::Le1M),
            1 => Some(Phy::Le2M),
            2 => Some(Phy::LeCoded),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Phy::Le1M => 0,
            Phy::Le2M => 1,
            Phy::LeCoded => 2,
        }
    }
}

/// A Link Layer channel index, 0..=36 for data and secondary advertising
/// channels, 37..=39 for the primary advertising channels.
///
/// Bluetooth Core Specification: Vol. 6, Part B, section 1.4.1 Advertising
/// and Data Channel Indices.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RadioChannel(u8);

impl RadioChannel {
    pub const ADVERTISING_37: RadioChannel = RadioChannel(37);
    pub const ADVERTISING_38: RadioChannel = RadioChannel(38);
    pub const ADVERTISING_39: RadioChannel = RadioChannel(39);

    /// Data (or secondary advertising) channel `index`, if `index < 37`.
    pub fn data(index: u8) -> Option<RadioChannel> {
        (index < 37).then_some(RadioChannel(index))
    }

    /// Any channel index in 0..=39.
    pub fn from_index(index: u8) -> Option<RadioChannel> {
        (index < 40).then_some(RadioChannel(index))
    }

    pub fn get_channel_index(&self) -> u8 {
        self.0
    }

    pub fn is_advertising(&self) -> bool {
        self.0 >= 37
    }

    /// Center frequency as an offset in MHz above 2400 MHz.
    pub fn frequency_offset(&self) -> u8 {
        match self.0 {
            37 => 2,
            38 => 26,
            39 => 80,
            c if c < 11 => 4 + 2 * c,
            c => 28 + 2 * (c - 11),
        }
    }

    /// Data whitening initial value. The whitening LFSR is seeded with the
    /// channel index.
    pub fn whitening_iv(&self) -> u8 {
        self.0
    }
}

/// Register-level radio operations used by the Link Layer roles.
pub trait Radio {
    /// Reset the radio state machine and clear status.
    fn reset(&self);

    fn phy_set(&self, phy: Phy);

    fn aa_set(&self, access_address: u32);

    /// Configure CRC-24 with the given initial value (low 24 bits).
    fn crc_configure(&self, crc_init: u32);

    /// Tune to `channel` and set the matching whitening IV.
    fn freq_chan_set(&self, channel: RadioChannel);

    /// Copy `pdu` into radio packet memory for the next transmission.
    fn pkt_tx_set(&self, pdu: &[u8]);

    /// Arm reception of a PDU with at most `max_len` payload octets.
    fn pkt_rx_set(&self, max_len: u8);

    /// Copy the last received PDU into `buf`, returning its length
    /// including the header.
    fn pkt_rx_get(&self, buf: &mut [u8]) -> usize;

    /// Start the radio timer at `ticks_start` plus `remainder_us` and
    /// enable transmit (`tx`) or receive when it fires. Returns the
    /// microsecond offset of the radio start within the timer.
    fn tmr_start(&self, tx: bool, ticks_start: u32, remainder_us: u32) -> u32;

    /// Start the radio timer and enable the radio as soon as possible.
    fn tmr_start_now(&self, tx: bool) -> u32;

    /// Enable transmit or receive at `start_us` on the already running
    /// timer. Returns the offset actually used.
    fn tmr_start_us(&self, tx: bool, start_us: u32) -> u32;

    /// Inter-frame space used for the next automatic rx/tx switch.
    fn tmr_tifs_set(&self, us: u32);

    /// Header-complete timeout: abort reception if no access address was
    /// detected by `us`.
    fn tmr_hcto_configure(&self, us: u32);

    fn tmr_aa_capture(&self);

    /// Timestamp of the last access address match.
    fn tmr_aa_get(&self) -> u32;

    /// Timestamp at which the radio became ready.
    fn tmr_ready_get(&self) -> u32;

    fn tmr_end_capture(&self);

    /// Timestamp of the end of the last PDU on air.
    fn tmr_end_get(&self) -> u32;

    /// On completion, switch to receive after the configured inter-frame
    /// space.
    fn switch_complete_and_rx(&self, phy: Phy);

    /// On completion, switch to transmit after the configured inter-frame
    /// space.
    fn switch_complete_and_tx(&self, phy: Phy);

    /// On completion, disable the radio.
    fn switch_complete_and_disable(&self);

    /// Disable the radio now and drop any pending completion. No interrupt
    /// is delivered for the transfer cut short.
    fn disable(&self);

    fn status_reset(&self);

    /// The last tx or rx completed (as opposed to timing out or being
    /// disabled).
    fn is_done(&self) -> bool;

    fn crc_is_valid(&self) -> bool;

    fn rssi_measure(&self);

    fn rssi_is_ready(&self) -> bool;

    /// Last RSSI sample as a positive dBm magnitude.
    fn rssi_get(&self) -> u8;

    /// Whether the CCM engine validated the MIC of the last received PDU.
    fn ccm_mic_is_valid(&self) -> bool;

    /// Enable-to-ready delays and chain delays of this radio.
    fn rx_ready_delay_us(&self, phy: Phy) -> u32;
    fn tx_ready_delay_us(&self, phy: Phy) -> u32;
    fn rx_chain_delay_us(&self, phy: Phy) -> u32;
    fn tx_chain_delay_us(&self, phy: Phy) -> u32;
}

/// Receives the radio interrupt.
pub trait RadioClient {
    fn radio_isr(&self);
}

pub trait RadioInterrupt<'a> {
    fn set_client(&self, client: &'a dyn RadioClient);
}

#[cfg(test)]
mod test {
    use super::{Phy, RadioChannel};

    #[test]
    fn channel_frequencies() {
        assert_eq!(RadioChannel::ADVERTISING_37.frequency_offset(), 2);
        assert_eq!(RadioChannel::ADVERTISING_38.frequency_offset(), 26);
        assert_eq!(RadioChannel::ADVERTISING_39.frequency_offset(), 80);
        assert_eq!(RadioChannel::data(0).map(|c| c.frequency_offset()), Some(4));
        assert_eq!(RadioChannel::data(10).map(|c| c.frequency_offset()), Some(24));
        assert_eq!(RadioChannel::data(11).map(|c| c.frequency_offset()), Some(28));
        assert_eq!(RadioChannel::data(36).map(|c| c.frequency_offset()), Some(78));
        assert_eq!(RadioChannel::data(37), None);
        assert_eq!(RadioChannel::from_index(40), None);
    }

    #[test]
    fn phy_bits() {
        for phy in [Phy::Le1M, Phy::Le2M, Phy::LeCoded] {
            assert_eq!(Phy::from_bits(phy.bits()), Some(phy));
        }
        assert_eq!(Phy::from_bits(3), None);
    }

    #[test]
    fn air_time_of_empty_pdu() {
        for phy in [Phy::Le1M, Phy::Le2M, Phy::LeCoded] {
            assert_eq!(phy.pdu_air_us(0), phy.empty_pdu_us());
        }
        assert_eq!(Phy::Le1M.pdu_air_us(37), 376);
    }
}
