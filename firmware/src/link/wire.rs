// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire-level machinery shared by both engine variants: bit slots, byte
//! framing, the synchronization handshake, the negotiation bit race and
//! its tie-breaker, and the command/response exchanges.
//!
//! Everything here blocks inside its slot. A bit slot is a few
//! milliseconds during which this code owns the CPU; the wired-AND
//! sampling policy depends on that.

use super::timing::*;
use super::{Role, Session, TapCommand, TapResponse};
use crate::device_id::DeviceId;
use crate::hal::LineHal;
use consts::DEVICE_UID_LEN;

pub(crate) struct Wire<H: LineHal> {
    hal: H,
    self_id: DeviceId,
    /// LCG state for the negotiation tie-breaker.
    seed: u32,
}

impl<H: LineHal> Wire<H> {
    pub(crate) fn new(mut hal: H, self_id: DeviceId) -> Self {
        let mut seed = hal.micros();
        for (i, &b) in self_id.as_bytes().iter().enumerate() {
            seed ^= (b as u32) << ((i % 4) * 8);
        }
        Wire { hal, self_id, seed }
    }

    pub(crate) fn self_id(&self) -> DeviceId {
        self.self_id
    }

    pub(crate) fn micros(&mut self) -> u32 {
        self.hal.micros()
    }

    pub(crate) fn read_line(&mut self) -> crate::hal::Level {
        self.hal.read_line()
    }

    pub(crate) fn drive_low(&mut self, enable: bool) {
        self.hal.drive_low(enable);
    }

    pub(crate) fn delay_us(&mut self, us: u32) {
        self.hal.delay_us(us);
    }

    pub(crate) fn release(&mut self) {
        self.hal.drive_low(false);
    }

    /// Microseconds since `start`, modulo 2^32; a clock wrap mid-interval
    /// does not inflate the result.
    pub(crate) fn elapsed_since(&mut self, start: u32) -> u32 {
        self.hal.micros().wrapping_sub(start)
    }

    /// Wait for the pull-up to take the line HIGH. False on timeout.
    pub(crate) fn wait_for_high(&mut self, timeout_us: u32) -> bool {
        let start = self.hal.micros();
        while self.hal.read_line().is_low() {
            if self.elapsed_since(start) > timeout_us {
                return false;
            }
        }
        true
    }

    /// Wait until the line has stayed HIGH for `quiet_us` straight, then
    /// return. Both peers leave this on the same trailing edge of the
    /// last sync pulse, whichever side sent it, so the bit race starts
    /// aligned no matter how the handshake pulses interleaved. Gives up
    /// after `timeout_us` and proceeds regardless.
    fn wait_for_quiet(&mut self, quiet_us: u32, timeout_us: u32) {
        let start = self.hal.micros();
        let mut quiet_start = self.hal.micros();
        loop {
            if self.hal.read_line().is_low() {
                quiet_start = self.hal.micros();
            } else if self.elapsed_since(quiet_start) >= quiet_us {
                return;
            }
            if self.elapsed_since(start) > timeout_us {
                return;
            }
        }
    }

    /// Three samples 100 µs apart; majority LOW wins.
    fn sample_low_majority(&mut self) -> bool {
        let mut lows = 0;
        for i in 0..3 {
            if i > 0 {
                self.hal.delay_us(100);
            }
            if self.hal.read_line().is_low() {
                lows += 1;
            }
        }
        lows >= 2
    }

    /// Transmit one byte MSB-first: '0' drives LOW for the slot, '1'
    /// releases and lets the pull-up carry it.
    pub(crate) fn send_byte(&mut self, byte: u8) {
        for i in (0..8).rev() {
            let bit = (byte >> i) & 1 != 0;
            self.hal.drive_low(!bit);
            self.hal.delay_us(BIT_DRIVE_US);
            self.hal.drive_low(false);
            self.hal.delay_us(BIT_RECOVERY_US);
        }
    }

    /// Receive one byte on the shared slot schedule. There is no byte-level
    /// failure: an absent peer leaves the pull-up in charge and the read
    /// comes back 0xFF, which no valid exchange produces where it matters.
    pub(crate) fn receive_byte(&mut self) -> u8 {
        let mut byte = 0u8;
        for i in (0..8).rev() {
            self.hal.delay_us(BIT_SAMPLE_US);
            let low = self.sample_low_majority();
            if !low {
                byte |= 1 << i;
            }
            self.hal.delay_us(BIT_DRIVE_US - BIT_SAMPLE_US - 200 + BIT_RECOVERY_US);
        }
        byte
    }

    pub(crate) fn send_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.send_byte(b);
        }
    }

    fn receive_id(&mut self) -> DeviceId {
        let mut id = [0u8; DEVICE_UID_LEN];
        for b in id.iter_mut() {
            *b = self.receive_byte();
        }
        DeviceId::new(id)
    }

    /// A START pulse frames every command; its width separates it from a
    /// stray presence pulse.
    pub(crate) fn send_start_pulse(&mut self) {
        self.hal.drive_low(true);
        self.hal.delay_us(START_PULSE_US);
        self.hal.drive_low(false);
    }

    // ---------------------------------------------------------------
    // Negotiation
    // ---------------------------------------------------------------

    /// Align the two badges to within a few milliseconds. Two sync pulses
    /// with generous waits; every wait tolerates a missing peer so a
    /// lone badge falls through cleanly.
    pub(crate) fn sync_handshake(&mut self) {
        self.hal.drive_low(false);
        self.wait_for_high(100_000);
        self.hal.delay_us(1_000);

        // First sync pulse.
        self.hal.drive_low(true);
        self.hal.delay_us(SYNC_PULSE_US);
        self.hal.drive_low(false);
        self.wait_for_high(20_000);

        // Wait for the peer's first sync pulse.
        let start = self.hal.micros();
        let mut saw_peer = false;
        while self.elapsed_since(start) < 50_000 {
            if self.hal.read_line().is_low() {
                saw_peer = true;
                break;
            }
        }
        if saw_peer {
            self.wait_for_high(20_000);
        }

        // Second sync pulse.
        self.hal.delay_us(SYNC_WAIT_US);
        self.hal.drive_low(true);
        self.hal.delay_us(SYNC_PULSE_US);
        self.hal.drive_low(false);

        self.wait_for_high(20_000);
        // The peer may still owe the line its own second pulse; the race
        // starts a fixed quiet interval after the last LOW either side
        // produced.
        self.wait_for_quiet(SYNC_WAIT_US, 100_000);
    }

    /// Race the top [`NEGOTIATION_BITS`] of the identifiers. In each slot
    /// a '0' drives the line LOW and a '1' releases it, so the wired-AND
    /// tells a '1' sender whether somebody else drove: sampled LOW with
    /// our own bit at '1' means the peer's bit was '0' and our identifier
    /// is larger. Undecided after all slots means the compared prefixes
    /// were equal (or the peer already dropped out).
    pub(crate) fn bit_race(&mut self) -> Option<Role> {
        for i in 0..NEGOTIATION_BITS {
            let my_bit = self.self_id.bit(i);
            self.hal.drive_low(!my_bit);

            self.hal.delay_us(BIT_SAMPLE_US);
            let line_low = self.sample_low_majority();

            // Keep driving to the end of the slot so a slightly late peer
            // still samples our level.
            self.hal.delay_us(BIT_DRIVE_US - BIT_SAMPLE_US - 200);
            self.hal.drive_low(false);
            self.hal.delay_us(BIT_RECOVERY_US);

            if my_bit && line_low {
                return Some(Role::Master);
            }
        }
        None
    }

    /// Tie-breaker when the race ends undecided: one exchanged bit from
    /// the LCG, then identifier sum parity as the last resort.
    pub(crate) fn tie_break(&mut self) -> Role {
        self.seed = self.seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        let my_bit = (self.seed >> 16) & 1 != 0;

        self.hal.drive_low(!my_bit);
        self.hal.delay_us(BIT_SAMPLE_US);
        let peer_bit = self.hal.read_line().is_high();
        self.hal.delay_us(BIT_DRIVE_US - BIT_SAMPLE_US);
        self.hal.drive_low(false);

        if my_bit && !peer_bit {
            Role::Master
        } else if !my_bit && peer_bit {
            Role::Slave
        } else if self.self_id.sum_is_odd() {
            Role::Master
        } else {
            Role::Slave
        }
    }

    // ---------------------------------------------------------------
    // Master-side commands
    // ---------------------------------------------------------------

    /// One command / one response byte. Invalid or missing responses
    /// count as a failure; CHECK_READY also refreshes the peer-ready
    /// cache in both directions.
    pub(crate) fn master_send_command(
        &mut self,
        session: &mut Session,
        cmd: TapCommand,
    ) -> TapResponse {
        self.send_start_pulse();
        self.hal.delay_us(CMD_TURNAROUND_US);
        self.send_byte(cmd.wire_byte());
        self.hal.delay_us(CMD_TURNAROUND_US);

        let response = TapResponse::from_wire(self.receive_byte());
        match response {
            TapResponse::Ack | TapResponse::Nak => {
                session.command_failures = 0;
                if cmd == TapCommand::CheckReady {
                    session.peer_ready = response == TapResponse::Ack;
                }
                session.last_command_us = self.hal.micros();
                response
            }
            TapResponse::None => {
                session.command_failures = session.command_failures.saturating_add(1);
                if cmd == TapCommand::CheckReady {
                    session.peer_ready = false;
                }
                TapResponse::None
            }
        }
    }

    /// REQUEST_ID: command, ACK, then 12 identifier bytes from the slave.
    pub(crate) fn master_request_id(&mut self, session: &mut Session) -> Option<DeviceId> {
        self.send_start_pulse();
        self.hal.delay_us(CMD_TURNAROUND_US);
        self.send_byte(TapCommand::RequestId.wire_byte());
        self.hal.delay_us(CMD_TURNAROUND_US);

        if TapResponse::from_wire(self.receive_byte()) != TapResponse::Ack {
            session.command_failures = session.command_failures.saturating_add(1);
            return None;
        }

        let peer = self.receive_id();
        session.command_failures = 0;
        session.last_command_us = self.hal.micros();
        Some(peer)
    }

    /// SEND_ID: command plus our 12 identifier bytes, then the slave's ACK.
    /// Completes the master's half of the exchange.
    pub(crate) fn master_send_id(&mut self, session: &mut Session) -> bool {
        self.send_start_pulse();
        self.hal.delay_us(CMD_TURNAROUND_US);
        self.send_byte(TapCommand::SendId.wire_byte());
        let id = self.self_id;
        self.send_bytes(id.as_bytes());
        self.hal.delay_us(CMD_TURNAROUND_US);

        if TapResponse::from_wire(self.receive_byte()) != TapResponse::Ack {
            session.command_failures = session.command_failures.saturating_add(1);
            return false;
        }

        session.command_failures = 0;
        session.last_command_us = self.hal.micros();
        session.id_exchange_done = true;
        true
    }

    // ---------------------------------------------------------------
    // Slave-side commands
    // ---------------------------------------------------------------

    /// Measure the LOW width that [`poll`](super::TapLink::poll_for_command)
    /// spotted. Presence-sized pulses are ignored; a START pulse is
    /// followed by the command byte after the turnaround gap.
    pub(crate) fn slave_receive_command(&mut self, session: &mut Session) -> TapCommand {
        let start = self.hal.micros();
        while self.hal.read_line().is_low() {
            if self.elapsed_since(start) > CMD_TIMEOUT_US {
                return TapCommand::None;
            }
        }

        let width = self.elapsed_since(start);
        if width < START_PULSE_MIN_US {
            return TapCommand::None;
        }

        self.hal.delay_us(CMD_TURNAROUND_US);
        let cmd = TapCommand::from_wire(self.receive_byte());
        session.last_command_us = self.hal.micros();
        cmd
    }

    pub(crate) fn slave_respond(&mut self, response: TapResponse) {
        self.hal.delay_us(CMD_TURNAROUND_US);
        self.send_byte(response.wire_byte());
    }

    /// REQUEST_ID handler: ACK, then our identifier.
    pub(crate) fn slave_handle_request_id(&mut self, session: &mut Session) {
        self.hal.delay_us(CMD_TURNAROUND_US);
        self.send_byte(TapResponse::Ack.wire_byte());
        let id = self.self_id;
        self.send_bytes(id.as_bytes());
        session.last_command_us = self.hal.micros();
    }

    /// SEND_ID handler: take the master's identifier, ACK it. Completes
    /// the slave's half of the exchange.
    pub(crate) fn slave_handle_send_id(&mut self, session: &mut Session) -> DeviceId {
        let peer = self.receive_id();
        self.hal.delay_us(CMD_TURNAROUND_US);
        self.send_byte(TapResponse::Ack.wire_byte());
        session.last_command_us = self.hal.micros();
        session.id_exchange_done = true;
        peer
    }
}
