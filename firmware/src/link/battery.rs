// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Battery-powered detection front-end.
//!
//! The MCU sleeps between taps; the HAL arms a line-edge interrupt and
//! forwards it through [`TapLink::handle_wake`]. Waking validates that
//! the line is stable (five agreeing samples, 100 µs apart, held over a
//! 10 ms window) before committing to the negotiation; everything from
//! the sync handshake on is identical to the powered variant.

use super::timing::*;
use super::wire::Wire;
use super::{Role, Session, TapCommand, TapLink, TapResponse};
use crate::device_id::DeviceId;
use crate::hal::LineHal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    Sleeping,
    Waking,
    Negotiating,
    Connected,
    Disconnected,
}

pub struct BatteryTapLink<H: LineHal> {
    wire: Wire<H>,
    state: State,
    session: Session,
    state_start_us: u32,
    /// Last per-tick line validation while connected; a stable check
    /// re-arms the disconnect debounce.
    line_was_stable: bool,
    connection_detected: bool,
    negotiation_complete: bool,
}

impl<H: LineHal> BatteryTapLink<H> {
    pub fn new(hal: H, self_id: DeviceId) -> Self {
        let mut wire = Wire::new(hal, self_id);
        let now = wire.micros();
        BatteryTapLink {
            wire,
            state: State::Sleeping,
            session: Session::idle(),
            state_start_us: now,
            line_was_stable: true,
            connection_detected: false,
            negotiation_complete: false,
        }
    }

    /// Five samples, 100 µs apart, must agree.
    fn line_is_stable(&mut self) -> bool {
        let first = self.wire.read_line();
        for _ in 1..WAKE_SAMPLES {
            self.wire.delay_us(WAKE_SAMPLE_SPACING_US);
            if self.wire.read_line() != first {
                return false;
            }
        }
        true
    }

    fn finish_negotiation(&mut self) {
        let role = match self.wire.bit_race() {
            Some(role) => role,
            None => self.wire.tie_break(),
        };
        let now = self.wire.micros();
        self.session = Session::connected(role, now);
        self.state = State::Connected;
        self.line_was_stable = true;
        self.negotiation_complete = true;
        info!("tap link: negotiated role");
    }

    fn disconnect(&mut self) {
        self.state = State::Disconnected;
        self.session = Session::idle();
        self.wire.release();
    }

    fn enforce_failure_limit(&mut self) {
        if self.session.command_failures >= MAX_COMMAND_FAILURES {
            debug!("tap link: command failures exhausted, dropping");
            self.disconnect();
        }
    }

    fn master_connected(&self) -> bool {
        self.state == State::Connected && self.session.is_master()
    }

    fn slave_connected(&self) -> bool {
        self.state == State::Connected && self.session.is_slave()
    }
}

impl<H: LineHal> TapLink for BatteryTapLink<H> {
    fn tick(&mut self) {
        match self.state {
            // Nothing to do asleep; the wake interrupt re-arms us.
            State::Sleeping => {}
            State::Waking => {
                if !self.line_is_stable() {
                    self.state = State::Sleeping;
                } else if self.wire.elapsed_since(self.state_start_us) >= WAKE_VALIDATION_US {
                    self.connection_detected = true;
                    self.session = Session::idle();
                    self.wire.sync_handshake();
                    self.state = State::Negotiating;
                }
            }
            State::Negotiating => self.finish_negotiation(),
            State::Connected => {
                // Physical separation shows up as a chattering line; one
                // unstable check starts the debounce, a stable check
                // re-arms it.
                if self.line_is_stable() {
                    self.line_was_stable = true;
                } else if self.line_was_stable {
                    self.line_was_stable = false;
                    self.state_start_us = self.wire.micros();
                } else if self.wire.elapsed_since(self.state_start_us)
                    >= DISCONNECT_DEBOUNCE_US
                {
                    debug!("tap link: line unstable, dropping");
                    self.disconnect();
                    return;
                }

                if self.session.is_slave()
                    && self.wire.elapsed_since(self.session.last_command_us)
                        > SLAVE_IDLE_TIMEOUT_US
                {
                    debug!("tap link: slave idle timeout");
                    self.disconnect();
                }
            }
            // Torn down; the orchestrator decides when to re-arm via
            // reset().
            State::Disconnected => {}
        }
    }

    fn reset(&mut self) {
        self.state = State::Sleeping;
        self.session = Session::idle();
        self.connection_detected = false;
        self.negotiation_complete = false;
        self.wire.release();
    }

    fn handle_wake(&mut self) {
        if self.state == State::Sleeping {
            self.state = State::Waking;
            self.state_start_us = self.wire.micros();
        }
    }

    fn self_id(&self) -> DeviceId {
        self.wire.self_id()
    }

    fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    fn is_negotiating(&self) -> bool {
        self.state == State::Negotiating
    }

    fn is_detecting(&self) -> bool {
        self.state == State::Waking
    }

    fn is_idle(&self) -> bool {
        self.state == State::Sleeping
    }

    fn is_faulted(&self) -> bool {
        self.state == State::Disconnected
    }

    fn role(&self) -> Option<Role> {
        self.session.role
    }

    fn peer_ready(&self) -> bool {
        self.session.peer_ready
    }

    fn id_exchange_done(&self) -> bool {
        self.session.id_exchange_done
    }

    fn take_connection_detected(&mut self) -> bool {
        core::mem::take(&mut self.connection_detected)
    }

    fn take_negotiation_complete(&mut self) -> bool {
        core::mem::take(&mut self.negotiation_complete)
    }

    fn check_ready(&mut self) -> TapResponse {
        if !self.master_connected() {
            return TapResponse::None;
        }
        let response = self.wire.master_send_command(&mut self.session, TapCommand::CheckReady);
        self.enforce_failure_limit();
        response
    }

    fn request_peer_id(&mut self) -> Option<DeviceId> {
        if !self.master_connected() {
            return None;
        }
        let peer = self.wire.master_request_id(&mut self.session);
        self.enforce_failure_limit();
        peer
    }

    fn send_own_id(&mut self) -> bool {
        if !self.master_connected() {
            return false;
        }
        let ok = self.wire.master_send_id(&mut self.session);
        self.enforce_failure_limit();
        ok
    }

    fn poll_for_command(&mut self) -> bool {
        self.slave_connected() && self.wire.read_line().is_low()
    }

    fn receive_command(&mut self) -> TapCommand {
        if !self.slave_connected() {
            return TapCommand::None;
        }
        self.wire.slave_receive_command(&mut self.session)
    }

    fn respond(&mut self, response: TapResponse) {
        if self.slave_connected() {
            self.wire.slave_respond(response);
        }
    }

    fn handle_request_id(&mut self) {
        if self.slave_connected() {
            self.wire.slave_handle_request_id(&mut self.session);
        }
    }

    fn handle_send_id(&mut self) -> Option<DeviceId> {
        if !self.slave_connected() {
            return None;
        }
        Some(self.wire.slave_handle_send_id(&mut self.session))
    }
}
