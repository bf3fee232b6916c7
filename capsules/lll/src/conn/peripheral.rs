// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Peripheral side of a connection event.
//!
//! The peripheral's ticker runs one periodic widening early every interval.
//! Each event opens the receive window at the ticker expiry and keeps it
//! open for twice the accumulated widening, plus the transmit window on the
//! first event. The first PDU received with a valid CRC is the anchor: its
//! access address timestamp re-synchronizes the ticker and collapses the
//! widening. Every reception is answered, the last one with a switch to
//! disable.

use kernel::hil::ble::Phy;

use super::{Connection, Next, State};
use crate::done::Done;
use crate::pdu::{ConnectInd, DATA_PAYLOAD_MAX, PDU_SIZE};
use crate::role::{ticks_start, Env};
use crate::sched::PrepareParam;

impl Connection {
    /// Connection context of an advertiser that accepted `ind`.
    pub fn new_peripheral(ind: &ConnectInd, csa2: bool, phy: Phy) -> Connection {
        Connection::new(false, ind, csa2, phy)
    }

    /// Per-event widening, which the ticker period leaves out.
    pub fn periodic_widening_us(&self) -> u32 {
        self.drift.periodic_us
    }

    pub(super) fn peripheral_prepare(&mut self, env: &Env, param: &PrepareParam, channel: u8) {
        let radio = env.radio;
        env.radio_setup(self.phy, self.access_address, self.crc_init, channel);
        radio.pkt_rx_set(DATA_PAYLOAD_MAX as u8);
        radio.switch_complete_and_tx(self.phy);
        self.drift.event_start();
        self.start_us = radio.tmr_start(false, ticks_start(param), param.remainder);
        radio.tmr_aa_capture();
        radio.rssi_measure();
        radio.tmr_hcto_configure(self.drift.hcto_us(
            self.start_us,
            radio.rx_ready_delay_us(self.phy),
            self.phy.addr_us(),
        ));
        self.state = State::Rx;
    }

    pub(super) fn peripheral_rx(&mut self, env: &Env) -> Option<Done> {
        let radio = env.radio;
        if !radio.is_done() {
            radio.disable();
            return Some(self.close());
        }

        let crc_ok = radio.crc_is_valid();
        if crc_ok && self.ev.rx_count == 0 {
            let actual_us = radio.tmr_aa_get().saturating_sub(radio.tmr_ready_get());
            self.ev.drift = Some(self.drift.reset_on_anchor(actual_us, self.phy.addr_us()));
        }

        let mut buf = [0; PDU_SIZE];
        let pdu = env.rx_pdu(&mut buf);
        match self.rx_process(env, pdu, crc_ok) {
            Next::Continue => {
                self.load_tx(env);
                radio.switch_complete_and_rx(self.phy);
                self.state = State::Tx;
                None
            }
            Next::Close => {
                self.load_tx(env);
                radio.switch_complete_and_disable();
                self.state = State::TxLast;
                None
            }
            Next::Stop => {
                radio.disable();
                Some(self.close())
            }
        }
    }
}
