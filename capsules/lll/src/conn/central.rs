// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2023.

//! Central side of a connection event: transmit at the anchor point, then
//! alternate with the peripheral's replies until neither side has more
//! data.

use kernel::hil::ble::Phy;

use super::{Connection, Next, State};
use crate::done::Done;
use crate::pdu::{ConnectInd, PDU_SIZE};
use crate::role::{ticks_start, Env};
use crate::sched::PrepareParam;

impl Connection {
    /// Connection context of an initiator, from the CONNECT_IND it sent.
    pub fn new_central(ind: &ConnectInd, csa2: bool, phy: Phy) -> Connection {
        Connection::new(true, ind, csa2, phy)
    }

    pub(super) fn central_prepare(&mut self, env: &Env, param: &PrepareParam, channel: u8) {
        let radio = env.radio;
        env.radio_setup(self.phy, self.access_address, self.crc_init, channel);
        self.load_tx(env);
        radio.switch_complete_and_rx(self.phy);
        self.start_us = radio.tmr_start(true, ticks_start(param), param.remainder);
        radio.tmr_end_capture();
        self.state = State::Tx;
    }

    pub(super) fn central_rx(&mut self, env: &Env) -> Option<Done> {
        let radio = env.radio;
        if !radio.is_done() {
            radio.disable();
            return Some(self.close());
        }

        let crc_ok = radio.crc_is_valid();
        let mut buf = [0; PDU_SIZE];
        let pdu = env.rx_pdu(&mut buf);
        match self.rx_process(env, pdu, crc_ok) {
            Next::Continue => {
                self.load_tx(env);
                radio.switch_complete_and_rx(self.phy);
                self.state = State::Tx;
                None
            }
            // acknowledge the peer's LL_TERMINATE_IND before leaving
            Next::Close if self.peer_terminate.is_some() => {
                self.load_tx(env);
                radio.switch_complete_and_disable();
                self.state = State::TxLast;
                None
            }
            Next::Close | Next::Stop => {
                radio.disable();
                Some(self.close())
            }
        }
    }
}
