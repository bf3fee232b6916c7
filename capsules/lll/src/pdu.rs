// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Link Layer PDU formats.
//!
//! A PDU as handed to and from the radio is a 2-octet header followed by
//! the payload; the access address and CRC are added and checked by the
//! radio. The first header octet differs per PDU family and is described
//! with `register_bitfields!`; the second octet is always the payload
//! length. Multi-octet fields are little endian.
//!
//! ```text
//! +--------+--------+------------------------+
//! | flags  | length | payload (length bytes) |
//! +--------+--------+------------------------+
//! ```

use byteorder::{ByteOrder, LittleEndian};
use kernel::hil::ble::Phy;
use tock_registers::{register_bitfields, LocalRegisterCopy};

use crate::chan::ChannelMap;

pub const HEADER_LEN: usize = 2;
pub const PAYLOAD_MAX: usize = 255;
/// Size of a PDU buffer large enough for any PDU.
pub const PDU_SIZE: usize = HEADER_LEN + PAYLOAD_MAX;
/// Largest legacy advertising channel payload.
pub const LEGACY_ADV_PAYLOAD_MAX: usize = 37;
/// Largest data channel payload.
pub const DATA_PAYLOAD_MAX: usize = 251;
/// Largest BIS payload.
pub const BIS_PAYLOAD_MAX: usize = 251;

pub const ADDR_LEN: usize = 6;

register_bitfields![u8,
    /// Advertising physical channel PDU header
    pub AdvHeader [
        PDU_TYPE OFFSET(0) NUMBITS(4) [
            AdvInd = 0,
            AdvDirectInd = 1,
            AdvNonconnInd = 2,
            ScanReq = 3,
            ScanRsp = 4,
            ConnectInd = 5,
            AdvScanInd = 6,
            /// ADV_EXT_IND, AUX_ADV_IND, AUX_SYNC_IND and AUX_CHAIN_IND
            AdvExt = 7
        ],
        /// Sender supports channel selection algorithm #2
        CH_SEL OFFSET(5) NUMBITS(1) [],
        TX_ADD OFFSET(6) NUMBITS(1) [],
        RX_ADD OFFSET(7) NUMBITS(1) []
    ],

    /// Data physical channel PDU header
    pub DataHeader [
        LLID OFFSET(0) NUMBITS(2) [
            Continuation = 1,
            Start = 2,
            Control = 3
        ],
        NESN OFFSET(2) NUMBITS(1) [],
        SN OFFSET(3) NUMBITS(1) [],
        /// More data
        MD OFFSET(4) NUMBITS(1) []
    ],

    /// Broadcast isochronous PDU header
    pub BisHeader [
        LLID OFFSET(0) NUMBITS(2) [
            UnframedContinuation = 0,
            UnframedComplete = 1,
            Framed = 2,
            Control = 3
        ],
        /// Control subevent sequence number
        CSSN OFFSET(2) NUMBITS(3) [],
        /// Control subevent transmission flag
        CSTF OFFSET(5) NUMBITS(1) []
    ],

    /// Common extended advertising payload flags octet
    pub ExtFlags [
        ADV_A OFFSET(0) NUMBITS(1) [],
        TARGET_A OFFSET(1) NUMBITS(1) [],
        CTE_INFO OFFSET(2) NUMBITS(1) [],
        ADI OFFSET(3) NUMBITS(1) [],
        AUX_PTR OFFSET(4) NUMBITS(1) [],
        SYNC_INFO OFFSET(5) NUMBITS(1) [],
        TX_POWER OFFSET(6) NUMBITS(1) []
    ]
];

register_bitfields![u32,
    /// AuxPtr field, 3 octets
    pub AuxPtrField [
        CHANNEL_INDEX OFFSET(0) NUMBITS(6) [],
        CA OFFSET(6) NUMBITS(1) [],
        OFFSET_UNITS OFFSET(7) NUMBITS(1) [
            Units30us = 0,
            Units300us = 1
        ],
        AUX_OFFSET OFFSET(8) NUMBITS(13) [],
        AUX_PHY OFFSET(21) NUMBITS(3) []
    ]
];

pub type AdvHeaderVal = LocalRegisterCopy<u8, AdvHeader::Register>;
pub type DataHeaderVal = LocalRegisterCopy<u8, DataHeader::Register>;
pub type BisHeaderVal = LocalRegisterCopy<u8, BisHeader::Register>;
pub type ExtFlagsVal = LocalRegisterCopy<u8, ExtFlags::Register>;

/// Payload length from the header, or 0 for a truncated buffer.
pub fn payload_len(pdu: &[u8]) -> usize {
    pdu.get(1).copied().unwrap_or(0) as usize
}

/// The payload of `pdu`, clamped to the buffer.
pub fn payload(pdu: &[u8]) -> &[u8] {
    let end = (HEADER_LEN + payload_len(pdu)).min(pdu.len());
    pdu.get(HEADER_LEN..end).unwrap_or(&[])
}

/// Header plus payload length of `pdu`.
pub fn pdu_len(pdu: &[u8]) -> usize {
    (HEADER_LEN + payload_len(pdu)).min(pdu.len())
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceAddress {
    pub addr: [u8; ADDR_LEN],
    pub random: bool,
}

impl DeviceAddress {
    pub const fn public(addr: [u8; ADDR_LEN]) -> DeviceAddress {
        DeviceAddress {
            addr,
            random: false,
        }
    }

    pub const fn random(addr: [u8; ADDR_LEN]) -> DeviceAddress {
        DeviceAddress { addr, random: true }
    }

    /// A random address whose two most significant bits are `0b01`.
    pub fn is_resolvable_private(&self) -> bool {
        self.random && self.addr[5] >> 6 == 0b01
    }
}

/// Write an advertising channel PDU header. Returns the offset of the first
/// payload byte.
pub fn write_adv_header(
    out: &mut [u8],
    pdu_type: u8,
    ch_sel: bool,
    tx_random: bool,
    rx_random: bool,
    payload_len: usize,
) -> usize {
    let mut header = AdvHeaderVal::new(0);
    header.modify(
        AdvHeader::PDU_TYPE.val(pdu_type)
            + AdvHeader::CH_SEL.val(ch_sel as u8)
            + AdvHeader::TX_ADD.val(tx_random as u8)
            + AdvHeader::RX_ADD.val(rx_random as u8),
    );
    out[0] = header.get();
    out[1] = payload_len as u8;
    HEADER_LEN
}

/// Build a legacy advertising PDU with `adv_a` followed by `data`.
pub fn build_adv(
    out: &mut [u8],
    pdu_type: u8,
    adv_a: &DeviceAddress,
    target: Option<&DeviceAddress>,
    data: &[u8],
) -> usize {
    let data = &data[..data.len().min(LEGACY_ADV_PAYLOAD_MAX - ADDR_LEN)];
    let rx_random = target.map_or(false, |t| t.random);
    let target_len = if target.is_some() { ADDR_LEN } else { 0 };
    let len = ADDR_LEN + target_len + data.len();
    let mut at = write_adv_header(out, pdu_type, false, adv_a.random, rx_random, len);
    out[at..at + ADDR_LEN].copy_from_slice(&adv_a.addr);
    at += ADDR_LEN;
    if let Some(target) = target {
        out[at..at + ADDR_LEN].copy_from_slice(&target.addr);
        at += ADDR_LEN;
    }
    out[at..at + data.len()].copy_from_slice(data);
    at + data.len()
}

/// SCAN_REQ: ScanA followed by AdvA.
pub fn build_scan_req(out: &mut [u8], scan_a: &DeviceAddress, adv_a: &DeviceAddress) -> usize {
    let at = write_adv_header(
        out,
        AdvHeader::PDU_TYPE::ScanReq.value,
        false,
        scan_a.random,
        adv_a.random,
        2 * ADDR_LEN,
    );
    out[at..at + ADDR_LEN].copy_from_slice(&scan_a.addr);
    out[at + ADDR_LEN..at + 2 * ADDR_LEN].copy_from_slice(&adv_a.addr);
    at + 2 * ADDR_LEN
}

/// The two addresses carried by SCAN_REQ, CONNECT_IND and ADV_DIRECT_IND,
/// in order, with their TxAdd and RxAdd types.
pub fn address_pair(pdu: &[u8]) -> Option<(DeviceAddress, DeviceAddress)> {
    let header = AdvHeaderVal::new(*pdu.first()?);
    let payload = payload(pdu);
    let first: [u8; ADDR_LEN] = payload.get(..ADDR_LEN)?.try_into().ok()?;
    let second: [u8; ADDR_LEN] = payload.get(ADDR_LEN..2 * ADDR_LEN)?.try_into().ok()?;
    Some((
        DeviceAddress {
            addr: first,
            random: header.is_set(AdvHeader::TX_ADD),
        },
        DeviceAddress {
            addr: second,
            random: header.is_set(AdvHeader::RX_ADD),
        },
    ))
}

pub const CONNECT_IND_LEN: usize = 34;

/// CONNECT_IND LLData.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConnectInd {
    pub access_address: u32,
    pub crc_init: u32,
    /// Transmit window size in 1.25 ms units.
    pub win_size: u8,
    /// Transmit window offset in 1.25 ms units.
    pub win_offset: u16,
    /// Connection interval in 1.25 ms units.
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in 10 ms units.
    pub timeout: u16,
    pub channel_map: ChannelMap,
    pub hop: u8,
    /// Sleep clock accuracy index of the central.
    pub sca: u8,
}

impl ConnectInd {
    /// Parse the LLData following InitA and AdvA.
    pub fn parse(ll_data: &[u8]) -> Option<ConnectInd> {
        if ll_data.len() < CONNECT_IND_LEN - 2 * ADDR_LEN {
            return None;
        }
        Some(ConnectInd {
            access_address: LittleEndian::read_u32(&ll_data[0..4]),
            crc_init: LittleEndian::read_u24(&ll_data[4..7]),
            win_size: ll_data[7],
            win_offset: LittleEndian::read_u16(&ll_data[8..10]),
            interval: LittleEndian::read_u16(&ll_data[10..12]),
            latency: LittleEndian::read_u16(&ll_data[12..14]),
            timeout: LittleEndian::read_u16(&ll_data[14..16]),
            channel_map: ChannelMap::from_slice(&ll_data[16..21])?,
            hop: ll_data[21] & 0x1F,
            sca: ll_data[21] >> 5,
        })
    }

    /// Build a complete CONNECT_IND PDU.
    pub fn build(
        &self,
        out: &mut [u8],
        init_a: &DeviceAddress,
        adv_a: &DeviceAddress,
        ch_sel: bool,
    ) -> usize {
        let mut at = write_adv_header(
            out,
            AdvHeader::PDU_TYPE::ConnectInd.value,
            ch_sel,
            init_a.random,
            adv_a.random,
            CONNECT_IND_LEN,
        );
        out[at..at + ADDR_LEN].copy_from_slice(&init_a.addr);
        out[at + ADDR_LEN..at + 2 * ADDR_LEN].copy_from_slice(&adv_a.addr);
        at += 2 * ADDR_LEN;

        let ll = &mut out[at..at + CONNECT_IND_LEN - 2 * ADDR_LEN];
        LittleEndian::write_u32(&mut ll[0..4], self.access_address);
        LittleEndian::write_u24(&mut ll[4..7], self.crc_init & 0xFF_FFFF);
        ll[7] = self.win_size;
        LittleEndian::write_u16(&mut ll[8..10], self.win_offset);
        LittleEndian::write_u16(&mut ll[10..12], self.interval);
        LittleEndian::write_u16(&mut ll[12..14], self.latency);
        LittleEndian::write_u16(&mut ll[14..16], self.timeout);
        ll[16..21].copy_from_slice(self.channel_map.as_bytes());
        ll[21] = (self.hop & 0x1F) | (self.sca << 5);
        at + CONNECT_IND_LEN - 2 * ADDR_LEN
    }
}

/// Decoded AuxPtr.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AuxPtr {
    pub channel: u8,
    /// Clock accuracy: set for 0-50 ppm, clear for 51-500 ppm.
    pub ca: bool,
    pub offset_us: u32,
    pub phy: Phy,
}

pub const AUX_PTR_LEN: usize = 3;

/// Largest offset representable in 30 us units.
const AUX_OFFSET_30US_MAX: u32 = 0x1FFF * 30;

impl AuxPtr {
    pub fn parse(field: &[u8]) -> Option<AuxPtr> {
        if field.len() < AUX_PTR_LEN {
            return None;
        }
        let raw = LocalRegisterCopy::<u32, AuxPtrField::Register>::new(LittleEndian::read_u24(field));
        let unit = match raw.read_as_enum(AuxPtrField::OFFSET_UNITS) {
            Some(AuxPtrField::OFFSET_UNITS::Value::Units300us) => 300,
            _ => 30,
        };
        Some(AuxPtr {
            channel: raw.read(AuxPtrField::CHANNEL_INDEX) as u8,
            ca: raw.is_set(AuxPtrField::CA),
            offset_us: raw.read(AuxPtrField::AUX_OFFSET) * unit,
            phy: Phy::from_bits(raw.read(AuxPtrField::AUX_PHY) as u8)?,
        })
    }

    /// Encode, picking 300 us units when the offset does not fit in 30 us
    /// units. The offset is rounded down so the receiver never opens its
    /// window late.
    pub fn write(&self, field: &mut [u8]) {
        let mut raw = LocalRegisterCopy::<u32, AuxPtrField::Register>::new(0);
        let (units, offset) = if self.offset_us > AUX_OFFSET_30US_MAX {
            (AuxPtrField::OFFSET_UNITS::Units300us, self.offset_us / 300)
        } else {
            (AuxPtrField::OFFSET_UNITS::Units30us, self.offset_us / 30)
        };
        raw.modify(
            AuxPtrField::CHANNEL_INDEX.val(self.channel as u32)
                + AuxPtrField::CA.val(self.ca as u32)
                + units
                + AuxPtrField::AUX_OFFSET.val(offset.min(0x1FFF))
                + AuxPtrField::AUX_PHY.val(self.phy.bits() as u32),
        );
        LittleEndian::write_u24(&mut field[..AUX_PTR_LEN], raw.get());
    }
}

pub const SYNC_INFO_LEN: usize = 18;

/// SyncInfo field of AUX_ADV_IND.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyncInfo {
    /// Offset from the AUX_ADV_IND to the first AUX_SYNC_IND.
    pub offset_us: u32,
    /// Periodic advertising interval in 1.25 ms units.
    pub interval: u16,
    pub channel_map: ChannelMap,
    pub sca: u8,
    pub access_address: u32,
    pub crc_init: u32,
    pub event_counter: u16,
}

impl SyncInfo {
    pub fn parse(field: &[u8]) -> Option<SyncInfo> {
        if field.len() < SYNC_INFO_LEN {
            return None;
        }
        let offs = LittleEndian::read_u16(&field[0..2]);
        let unit = if offs & (1 << 13) != 0 { 300 } else { 30 };
        Some(SyncInfo {
            offset_us: (offs & 0x1FFF) as u32 * unit,
            interval: LittleEndian::read_u16(&field[2..4]),
            channel_map: ChannelMap::from_slice(&field[4..9])?,
            sca: field[8] >> 5,
            access_address: LittleEndian::read_u32(&field[9..13]),
            crc_init: LittleEndian::read_u24(&field[13..16]),
            event_counter: LittleEndian::read_u16(&field[16..18]),
        })
    }

    pub fn write(&self, field: &mut [u8]) {
        let offs = if self.offset_us > AUX_OFFSET_30US_MAX {
            (self.offset_us / 300).min(0x1FFF) as u16 | (1 << 13)
        } else {
            (self.offset_us / 30) as u16
        };
        LittleEndian::write_u16(&mut field[0..2], offs);
        LittleEndian::write_u16(&mut field[2..4], self.interval);
        field[4..9].copy_from_slice(self.channel_map.as_bytes());
        field[8] |= self.sca << 5;
        LittleEndian::write_u32(&mut field[9..13], self.access_address);
        LittleEndian::write_u24(&mut field[13..16], self.crc_init & 0xFF_FFFF);
        LittleEndian::write_u16(&mut field[16..18], self.event_counter);
    }
}

/// Advertising data info: data id and set id.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Adi {
    pub did: u16,
    pub sid: u8,
}

impl Adi {
    fn parse(field: &[u8]) -> Adi {
        let v = LittleEndian::read_u16(field);
        Adi {
            did: v & 0x0FFF,
            sid: (v >> 12) as u8,
        }
    }

    fn write(&self, field: &mut [u8]) {
        LittleEndian::write_u16(field, (self.did & 0x0FFF) | ((self.sid as u16) << 12));
    }
}

/// AD type of the ACAD channel map update indication.
pub const AD_TYPE_CHM_UPDATE: u8 = 0x28;

/// ACAD channel map update indication, length octet included.
pub const ACAD_CHM_UPDATE_LEN: usize = 2 + 5 + 2;

/// Channel map update of a periodic advertising train, carried in the
/// additional controller advertising data of AUX_SYNC_IND.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChmUpdate {
    pub map: ChannelMap,
    pub instant: u16,
}

impl ChmUpdate {
    /// Find the indication among the AD structures of `acad`.
    fn parse(mut acad: &[u8]) -> Option<ChmUpdate> {
        while let Some(&len) = acad.first() {
            let len = len as usize;
            let ad = acad.get(1..1 + len)?;
            if len == ACAD_CHM_UPDATE_LEN - 1 && ad[0] == AD_TYPE_CHM_UPDATE {
                return Some(ChmUpdate {
                    map: ChannelMap::from_slice(&ad[1..6])?,
                    instant: LittleEndian::read_u16(&ad[6..8]),
                });
            }
            if len == 0 {
                return None;
            }
            acad = &acad[1 + len..];
        }
        None
    }

    fn write(&self, field: &mut [u8]) {
        field[0] = (ACAD_CHM_UPDATE_LEN - 1) as u8;
        field[1] = AD_TYPE_CHM_UPDATE;
        field[2..7].copy_from_slice(self.map.as_bytes());
        LittleEndian::write_u16(&mut field[7..9], self.instant);
    }
}

fn take<'a>(body: &'a [u8], at: &mut usize, len: usize) -> Option<&'a [u8]> {
    let field = body.get(*at..*at + len)?;
    *at += len;
    Some(field)
}

/// Fields of the common extended advertising payload header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtHeader {
    /// AdvMode: bit 0 connectable, bit 1 scannable.
    pub adv_mode: u8,
    pub adv_a: Option<DeviceAddress>,
    pub target_a: Option<DeviceAddress>,
    pub cte_info: Option<u8>,
    pub adi: Option<Adi>,
    pub aux_ptr: Option<AuxPtr>,
    pub sync_info: Option<SyncInfo>,
    pub tx_power: Option<i8>,
    /// Only ACAD structure understood here.
    pub chm_update: Option<ChmUpdate>,
}

impl ExtHeader {
    /// Parse the extended header of an AdvExt PDU. Returns the header and the
    /// advertising data following it.
    pub fn parse(pdu: &[u8]) -> Option<(ExtHeader, &[u8])> {
        let adv = AdvHeaderVal::new(*pdu.first()?);
        let payload = payload(pdu);
        let first = *payload.first()?;
        let ext_len = (first & 0x3F) as usize;
        let body = payload.get(1..1 + ext_len)?;
        let data = &payload[1 + ext_len..];

        let mut header = ExtHeader {
            adv_mode: first >> 6,
            ..ExtHeader::default()
        };
        if ext_len == 0 {
            return Some((header, data));
        }

        let flags = ExtFlagsVal::new(body[0]);
        let mut at = 1;
        if flags.is_set(ExtFlags::ADV_A) {
            header.adv_a = Some(DeviceAddress {
                addr: take(body, &mut at, ADDR_LEN)?.try_into().ok()?,
                random: adv.is_set(AdvHeader::TX_ADD),
            });
        }
        if flags.is_set(ExtFlags::TARGET_A) {
            header.target_a = Some(DeviceAddress {
                addr: take(body, &mut at, ADDR_LEN)?.try_into().ok()?,
                random: adv.is_set(AdvHeader::RX_ADD),
            });
        }
        if flags.is_set(ExtFlags::CTE_INFO) {
            header.cte_info = Some(take(body, &mut at, 1)?[0]);
        }
        if flags.is_set(ExtFlags::ADI) {
            header.adi = Some(Adi::parse(take(body, &mut at, 2)?));
        }
        if flags.is_set(ExtFlags::AUX_PTR) {
            header.aux_ptr = Some(AuxPtr::parse(take(body, &mut at, AUX_PTR_LEN)?)?);
        }
        if flags.is_set(ExtFlags::SYNC_INFO) {
            header.sync_info = Some(SyncInfo::parse(take(body, &mut at, SYNC_INFO_LEN)?)?);
        }
        if flags.is_set(ExtFlags::TX_POWER) {
            header.tx_power = Some(take(body, &mut at, 1)?[0] as i8);
        }
        header.chm_update = ChmUpdate::parse(&body[at..]);
        Some((header, data))
    }

    /// Length of the extended header including its flags octet, excluding
    /// the length/AdvMode octet.
    pub fn len(&self) -> usize {
        let fields = self.adv_a.map_or(0, |_| ADDR_LEN)
            + self.target_a.map_or(0, |_| ADDR_LEN)
            + self.cte_info.map_or(0, |_| 1)
            + self.adi.map_or(0, |_| 2)
            + self.aux_ptr.map_or(0, |_| AUX_PTR_LEN)
            + self.sync_info.map_or(0, |_| SYNC_INFO_LEN)
            + self.tx_power.map_or(0, |_| 1)
            + self.chm_update.map_or(0, |_| ACAD_CHM_UPDATE_LEN);
        if fields == 0 {
            0
        } else {
            fields + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of the AuxPtr field within the PDU, if present.
    pub fn aux_ptr_offset(&self) -> Option<usize> {
        self.aux_ptr?;
        Some(
            HEADER_LEN
                + 2
                + self.adv_a.map_or(0, |_| ADDR_LEN)
                + self.target_a.map_or(0, |_| ADDR_LEN)
                + self.cte_info.map_or(0, |_| 1)
                + self.adi.map_or(0, |_| 2),
        )
    }

    /// Offset of the SyncInfo field within the PDU, if present.
    pub fn sync_info_offset(&self) -> Option<usize> {
        self.sync_info?;
        Some(
            HEADER_LEN
                + 2
                + self.adv_a.map_or(0, |_| ADDR_LEN)
                + self.target_a.map_or(0, |_| ADDR_LEN)
                + self.cte_info.map_or(0, |_| 1)
                + self.adi.map_or(0, |_| 2)
                + self.aux_ptr.map_or(0, |_| AUX_PTR_LEN),
        )
    }

    /// Build a complete AdvExt PDU with this header and `data`. Data that
    /// does not fit is truncated.
    pub fn build(&self, out: &mut [u8], data: &[u8]) -> usize {
        let ext_len = self.len();
        let room = PAYLOAD_MAX - 1 - ext_len;
        let data = &data[..data.len().min(room)];
        let len = 1 + ext_len + data.len();

        let tx_random = self.adv_a.map_or(false, |a| a.random);
        let rx_random = self.target_a.map_or(false, |a| a.random);
        let mut at = write_adv_header(
            out,
            AdvHeader::PDU_TYPE::AdvExt.value,
            false,
            tx_random,
            rx_random,
            len,
        );
        out[at] = (ext_len as u8) | (self.adv_mode << 6);
        at += 1;

        if ext_len > 0 {
            let mut flags = ExtFlagsVal::new(0);
            flags.modify(
                ExtFlags::ADV_A.val(self.adv_a.is_some() as u8)
                    + ExtFlags::TARGET_A.val(self.target_a.is_some() as u8)
                    + ExtFlags::CTE_INFO.val(self.cte_info.is_some() as u8)
                    + ExtFlags::ADI.val(self.adi.is_some() as u8)
                    + ExtFlags::AUX_PTR.val(self.aux_ptr.is_some() as u8)
                    + ExtFlags::SYNC_INFO.val(self.sync_info.is_some() as u8)
                    + ExtFlags::TX_POWER.val(self.tx_power.is_some() as u8),
            );
            out[at] = flags.get();
            at += 1;

            if let Some(a) = self.adv_a {
                out[at..at + ADDR_LEN].copy_from_slice(&a.addr);
                at += ADDR_LEN;
            }
            if let Some(a) = self.target_a {
                out[at..at + ADDR_LEN].copy_from_slice(&a.addr);
                at += ADDR_LEN;
            }
            if let Some(cte) = self.cte_info {
                out[at] = cte;
                at += 1;
            }
            if let Some(adi) = self.adi {
                adi.write(&mut out[at..at + 2]);
                at += 2;
            }
            if let Some(aux) = self.aux_ptr {
                aux.write(&mut out[at..at + AUX_PTR_LEN]);
                at += AUX_PTR_LEN;
            }
            if let Some(sync) = self.sync_info {
                sync.write(&mut out[at..at + SYNC_INFO_LEN]);
                at += SYNC_INFO_LEN;
            }
            if let Some(power) = self.tx_power {
                out[at] = power as u8;
                at += 1;
            }
            if let Some(update) = self.chm_update {
                update.write(&mut out[at..at + ACAD_CHM_UPDATE_LEN]);
                at += ACAD_CHM_UPDATE_LEN;
            }
        }
        out[at..at + data.len()].copy_from_slice(data);
        at + data.len()
    }
}

/// Connection control PDU opcodes handled in the radio context.
pub mod ll_ctrl {
    pub const CHANNEL_MAP_IND: u8 = 0x01;
    pub const TERMINATE_IND: u8 = 0x02;

    pub const CHANNEL_MAP_IND_LEN: usize = 8;
    pub const TERMINATE_IND_LEN: usize = 2;
}

/// BIG control PDU opcodes.
pub mod big_ctrl {
    pub const CHANNEL_MAP_IND: u8 = 0x00;
    pub const TERMINATE_IND: u8 = 0x01;

    pub const CHANNEL_MAP_IND_LEN: usize = 8;
    pub const TERMINATE_IND_LEN: usize = 4;
}

/// Write a data channel header with LLID, SN, NESN and MD.
pub fn write_data_header(out: &mut [u8], llid: u8, sn: bool, nesn: bool, md: bool, len: usize) {
    let mut header = DataHeaderVal::new(0);
    header.modify(
        DataHeader::LLID.val(llid)
            + DataHeader::SN.val(sn as u8)
            + DataHeader::NESN.val(nesn as u8)
            + DataHeader::MD.val(md as u8),
    );
    out[0] = header.get();
    out[1] = len as u8;
}

/// LL_CHANNEL_MAP_IND as a complete data PDU.
pub fn build_ll_channel_map_ind(out: &mut [u8], map: &ChannelMap, instant: u16) -> usize {
    write_data_header(
        out,
        DataHeader::LLID::Control.value,
        false,
        false,
        false,
        ll_ctrl::CHANNEL_MAP_IND_LEN,
    );
    out[2] = ll_ctrl::CHANNEL_MAP_IND;
    out[3..8].copy_from_slice(map.as_bytes());
    LittleEndian::write_u16(&mut out[8..10], instant);
    HEADER_LEN + ll_ctrl::CHANNEL_MAP_IND_LEN
}

/// LL_TERMINATE_IND as a complete data PDU.
pub fn build_ll_terminate_ind(out: &mut [u8], reason: u8) -> usize {
    write_data_header(
        out,
        DataHeader::LLID::Control.value,
        false,
        false,
        false,
        ll_ctrl::TERMINATE_IND_LEN,
    );
    out[2] = ll_ctrl::TERMINATE_IND;
    out[3] = reason;
    HEADER_LEN + ll_ctrl::TERMINATE_IND_LEN
}

/// Decoded BIG control PDU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BigCtrl {
    ChannelMap { map: ChannelMap, instant: u16 },
    Terminate { reason: u8, instant: u16 },
}

impl BigCtrl {
    pub fn parse(payload: &[u8]) -> Option<BigCtrl> {
        match *payload.first()? {
            big_ctrl::CHANNEL_MAP_IND if payload.len() >= big_ctrl::CHANNEL_MAP_IND_LEN => {
                Some(BigCtrl::ChannelMap {
                    map: ChannelMap::from_slice(&payload[1..6])?,
                    instant: LittleEndian::read_u16(&payload[6..8]),
                })
            }
            big_ctrl::TERMINATE_IND if payload.len() >= big_ctrl::TERMINATE_IND_LEN => {
                Some(BigCtrl::Terminate {
                    reason: payload[1],
                    instant: LittleEndian::read_u16(&payload[2..4]),
                })
            }
            _ => None,
        }
    }

    /// Write as a BIG control PDU with the given CSSN and CSTF.
    pub fn build(&self, out: &mut [u8], cssn: u8, cstf: bool) -> usize {
        let len = match self {
            BigCtrl::ChannelMap { map, instant } => {
                out[2] = big_ctrl::CHANNEL_MAP_IND;
                out[3..8].copy_from_slice(map.as_bytes());
                LittleEndian::write_u16(&mut out[8..10], *instant);
                big_ctrl::CHANNEL_MAP_IND_LEN
            }
            BigCtrl::Terminate { reason, instant } => {
                out[2] = big_ctrl::TERMINATE_IND;
                out[3] = *reason;
                LittleEndian::write_u16(&mut out[4..6], *instant);
                big_ctrl::TERMINATE_IND_LEN
            }
        };
        write_bis_header(out, BisHeader::LLID::Control.value, cssn, cstf, len);
        HEADER_LEN + len
    }
}

pub fn write_bis_header(out: &mut [u8], llid: u8, cssn: u8, cstf: bool, len: usize) {
    let mut header = BisHeaderVal::new(0);
    header.modify(
        BisHeader::LLID.val(llid) + BisHeader::CSSN.val(cssn & 0x7) + BisHeader::CSTF.val(cstf as u8),
    );
    out[0] = header.get();
    out[1] = len as u8;
}

#[cfg(test)]
mod test {
    use super::*;

    const ADV_A: DeviceAddress = DeviceAddress::random([0x11, 0x22, 0x33, 0x44, 0x55, 0xC6]);
    const INIT_A: DeviceAddress = DeviceAddress::public([0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6]);

    #[test]
    fn adv_ind_layout() {
        let mut pdu = [0; PDU_SIZE];
        let len = build_adv(&mut pdu, AdvHeader::PDU_TYPE::AdvInd.value, &ADV_A, None, &[2, 1, 6]);
        assert_eq!(len, 11);
        assert_eq!(pdu[0], 0x40);
        assert_eq!(pdu[1], 9);
        assert_eq!(&pdu[2..8], &ADV_A.addr);
        assert_eq!(payload(&pdu), &[0x11, 0x22, 0x33, 0x44, 0x55, 0xC6, 2, 1, 6]);
    }

    #[test]
    fn connect_ind_fields() {
        let ind = ConnectInd {
            access_address: 0x5065_4C1B,
            crc_init: 0x12_3456,
            win_size: 2,
            win_offset: 3,
            interval: 24,
            latency: 4,
            timeout: 100,
            channel_map: ChannelMap::new([0xFF, 0x00, 0xFF, 0x00, 0x1F]),
            hop: 9,
            sca: 5,
        };
        let mut pdu = [0; PDU_SIZE];
        let len = ind.build(&mut pdu, &INIT_A, &ADV_A, true);
        assert_eq!(len, HEADER_LEN + CONNECT_IND_LEN);

        let header = AdvHeaderVal::new(pdu[0]);
        assert_eq!(
            header.read_as_enum(AdvHeader::PDU_TYPE),
            Some(AdvHeader::PDU_TYPE::Value::ConnectInd)
        );
        assert!(header.is_set(AdvHeader::CH_SEL));
        assert!(!header.is_set(AdvHeader::TX_ADD));
        assert!(header.is_set(AdvHeader::RX_ADD));
        // AA, CRCInit
        assert_eq!(&pdu[14..21], &[0x1B, 0x4C, 0x65, 0x50, 0x56, 0x34, 0x12]);
        // Hop and SCA share the last octet
        assert_eq!(pdu[35], 9 | (5 << 5));

        assert_eq!(address_pair(&pdu), Some((INIT_A, ADV_A)));
        assert_eq!(ConnectInd::parse(&payload(&pdu)[2 * ADDR_LEN..]), Some(ind));
    }

    #[test]
    fn aux_ptr_units() {
        let mut field = [0; AUX_PTR_LEN];
        let near = AuxPtr {
            channel: 12,
            ca: true,
            offset_us: 2400,
            phy: Phy::Le2M,
        };
        near.write(&mut field);
        assert_eq!(field[0], 12 | 1 << 6);
        assert_eq!(AuxPtr::parse(&field), Some(near));

        // 300 ms only fits in 300 us units and is rounded down
        let far = AuxPtr {
            offset_us: 300_100,
            ..near
        };
        far.write(&mut field);
        assert_eq!(field[0] & 0x80, 0x80);
        assert_eq!(AuxPtr::parse(&field).map(|p| p.offset_us), Some(300_000));
    }

    #[test]
    fn ext_header_with_aux_ptr_and_sync_info() {
        let sync = SyncInfo {
            offset_us: 9000,
            interval: 80,
            channel_map: ChannelMap::ALL,
            sca: 2,
            access_address: 0x7176_4129,
            crc_init: 0xAB_CDEF,
            event_counter: 0x1234,
        };
        let header = ExtHeader {
            adv_mode: 0,
            adv_a: Some(ADV_A),
            adi: Some(Adi { did: 0x123, sid: 4 }),
            aux_ptr: Some(AuxPtr {
                channel: 3,
                ca: false,
                offset_us: 600,
                phy: Phy::Le1M,
            }),
            sync_info: Some(sync),
            ..ExtHeader::default()
        };
        let mut pdu = [0; PDU_SIZE];
        let len = header.build(&mut pdu, b"hello");
        assert_eq!(len, HEADER_LEN + 1 + header.len() + 5);
        assert_eq!(header.aux_ptr_offset(), Some(HEADER_LEN + 2 + ADDR_LEN + 2));
        assert_eq!(
            header.sync_info_offset(),
            Some(HEADER_LEN + 2 + ADDR_LEN + 2 + AUX_PTR_LEN)
        );

        let (parsed, data) = ExtHeader::parse(&pdu).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn ext_header_empty() {
        let mut pdu = [0; PDU_SIZE];
        let len = ExtHeader::default().build(&mut pdu, &[1, 2]);
        assert_eq!(len, HEADER_LEN + 3);
        assert_eq!(pdu[2], 0);
        let (parsed, data) = ExtHeader::parse(&pdu).unwrap();
        assert!(parsed.is_empty());
        assert_eq!(data, &[1, 2]);
    }

    #[test]
    fn acad_channel_map_update() {
        let update = ChmUpdate {
            map: ChannelMap::new([0x00, 0x06, 0xE0, 0x00, 0x1E]),
            instant: 0x0102,
        };
        let header = ExtHeader {
            chm_update: Some(update),
            ..ExtHeader::default()
        };
        let mut pdu = [0; PDU_SIZE];
        let len = header.build(&mut pdu, &[7]);
        assert_eq!(&pdu[4..13], &[8, AD_TYPE_CHM_UPDATE, 0x00, 0x06, 0xE0, 0x00, 0x1E, 0x02, 0x01]);
        let (parsed, data) = ExtHeader::parse(&pdu[..len]).unwrap();
        assert_eq!(parsed.chm_update, Some(update));
        assert_eq!(data, &[7]);

        // unknown AD structures are skipped
        assert_eq!(ChmUpdate::parse(&[2, 0xFF, 0xAA]), None);
        let mut acad = [0; 3 + ACAD_CHM_UPDATE_LEN];
        acad[..3].copy_from_slice(&[2, 0xFF, 0xAA]);
        update.write(&mut acad[3..]);
        assert_eq!(ChmUpdate::parse(&acad), Some(update));
    }

    #[test]
    fn big_control() {
        let mut pdu = [0; PDU_SIZE];
        let ctrl = BigCtrl::Terminate {
            reason: 0x16,
            instant: 0xFFFE,
        };
        let len = ctrl.build(&mut pdu, 5, true);
        assert_eq!(len, HEADER_LEN + big_ctrl::TERMINATE_IND_LEN);
        let header = BisHeaderVal::new(pdu[0]);
        assert_eq!(header.read(BisHeader::LLID), 3);
        assert_eq!(header.read(BisHeader::CSSN), 5);
        assert!(header.is_set(BisHeader::CSTF));
        assert_eq!(BigCtrl::parse(payload(&pdu)), Some(ctrl));
        assert_eq!(BigCtrl::parse(&[0x07, 0, 0]), None);
    }

    #[test]
    fn truncated_buffers() {
        assert_eq!(payload(&[]), &[] as &[u8]);
        assert_eq!(payload(&[0, 10, 1, 2]), &[1, 2]);
        assert_eq!(pdu_len(&[0, 10, 1, 2]), 4);
        assert_eq!(address_pair(&[0x03, 6, 1, 2, 3, 4, 5, 6]), None);
        assert_eq!(ConnectInd::parse(&[0; 10]), None);
    }
}
