// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Continuously powered detection front-end.
//!
//! While idle the badge announces itself with a 2 ms presence pulse
//! every 50 ms and watches for the peer's. A LOW that either ends like a
//! pulse or persists past the debounce window is a detection; the sync
//! handshake runs immediately and the bit race follows on the next tick.

use super::timing::*;
use super::wire::Wire;
use super::{Role, Session, TapCommand, TapLink, TapResponse};
use crate::device_id::DeviceId;
use crate::hal::LineHal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum State {
    Idle,
    Detecting,
    Negotiating,
    Connected,
}

pub struct UsbTapLink<H: LineHal> {
    wire: Wire<H>,
    state: State,
    session: Session,
    state_start_us: u32,
    last_pulse_us: u32,
    pulsing: bool,
    pulse_start_us: u32,
    connection_detected: bool,
    negotiation_complete: bool,
}

impl<H: LineHal> UsbTapLink<H> {
    pub fn new(hal: H, self_id: DeviceId) -> Self {
        let mut wire = Wire::new(hal, self_id);
        let now = wire.micros();
        UsbTapLink {
            wire,
            state: State::Idle,
            session: Session::idle(),
            state_start_us: now,
            last_pulse_us: now,
            pulsing: false,
            pulse_start_us: now,
            connection_detected: false,
            negotiation_complete: false,
        }
    }

    fn start_presence_pulse(&mut self) {
        self.wire.drive_low(true);
        self.pulsing = true;
        self.pulse_start_us = self.wire.micros();
    }

    /// Detection confirmed: align with the peer now (blocking), race on
    /// the next tick.
    fn start_negotiation(&mut self) {
        self.session = Session::idle();
        self.wire.sync_handshake();
        self.state = State::Negotiating;
    }

    fn finish_negotiation(&mut self) {
        let role = match self.wire.bit_race() {
            Some(role) => role,
            None => self.wire.tie_break(),
        };
        let now = self.wire.micros();
        self.session = Session::connected(role, now);
        self.state = State::Connected;
        self.negotiation_complete = true;
        self.last_pulse_us = now;
        info!("tap link: negotiated role");
    }

    fn drop_to_idle(&mut self) {
        let now = self.wire.micros();
        self.state = State::Idle;
        self.session = Session::idle();
        self.pulsing = false;
        self.last_pulse_us = now;
        self.wire.release();
    }

    /// Master tears the connection down once too many commands failed in
    /// a row.
    fn enforce_failure_limit(&mut self) {
        if self.session.command_failures >= MAX_COMMAND_FAILURES {
            debug!("tap link: command failures exhausted, dropping");
            self.drop_to_idle();
        }
    }

    fn master_connected(&self) -> bool {
        self.state == State::Connected && self.session.is_master()
    }

    fn slave_connected(&self) -> bool {
        self.state == State::Connected && self.session.is_slave()
    }
}

impl<H: LineHal> TapLink for UsbTapLink<H> {
    fn tick(&mut self) {
        let now = self.wire.micros();

        // Finish an in-flight presence pulse before anything else; while
        // driving we cannot observe the peer.
        if self.pulsing {
            if self.wire.elapsed_since(self.pulse_start_us) >= PRESENCE_PULSE_US {
                self.wire.release();
                self.pulsing = false;
                self.last_pulse_us = now;
            }
            return;
        }

        let level = self.wire.read_line();

        match self.state {
            State::Idle => {
                if level.is_low() {
                    // Someone is pulling the line: a peer's pulse.
                    self.state = State::Detecting;
                    self.state_start_us = now;
                } else if self.wire.elapsed_since(self.last_pulse_us) >= PULSE_INTERVAL_US {
                    self.start_presence_pulse();
                }
            }
            State::Detecting => {
                if level.is_high() {
                    // The LOW ended like a pulse: peer present.
                    self.connection_detected = true;
                    self.start_negotiation();
                } else if self.wire.elapsed_since(self.state_start_us) >= DEBOUNCE_TIME_US {
                    // Still held LOW: peer connected and waiting.
                    self.connection_detected = true;
                    self.start_negotiation();
                }
            }
            State::Negotiating => self.finish_negotiation(),
            State::Connected => {
                // The master probes actively; the slave just watches for
                // silence.
                if self.session.is_slave()
                    && self.wire.elapsed_since(self.session.last_command_us)
                        > SLAVE_IDLE_TIMEOUT_US
                {
                    debug!("tap link: slave idle timeout");
                    self.drop_to_idle();
                }
            }
        }
    }

    fn reset(&mut self) {
        self.drop_to_idle();
        self.connection_detected = false;
        self.negotiation_complete = false;
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
        self.state == State::Detecting
    }

    fn is_idle(&self) -> bool {
        self.state == State::Idle
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

#[cfg(test)]
mod tests {
    use super::super::wire::tests::{id, SimLine, SLOT_US};
    use super::*;

    /// Run ticks with ~1 ms of loop delay between them, like the real
    /// main loop does.
    fn run_ms(link: &mut UsbTapLink<SimLine>, sim: &SimLine, ms: u32) {
        for _ in 0..ms {
            link.tick();
            let mut hal = sim.clone();
            hal.delay_us(1_000);
        }
    }

    #[test]
    fn idle_badge_emits_presence_pulses() {
        let sim = SimLine::new();
        let mut link = UsbTapLink::new(sim.clone(), id(0xA1));

        run_ms(&mut link, &sim, 160);

        // Pulses are 2 ms wide, at least 50 ms apart.
        let log = sim.drive_log();
        let asserts: Vec<u32> = log.iter().filter(|&&(_, on)| on).map(|&(t, _)| t).collect();
        let releases: Vec<u32> = log.iter().filter(|&&(_, on)| !on).map(|&(t, _)| t).collect();
        assert!(asserts.len() >= 2, "expected at least two pulses");
        for (&start, &end) in asserts.iter().zip(releases.iter()) {
            let width = end - start;
            assert!((2_000..3_100).contains(&width), "pulse width {width}");
        }
        assert!(asserts[1] - asserts[0] >= PULSE_INTERVAL_US);
    }

    /// Tick with 1 ms loop pacing until a detection fires; panics if it
    /// never does.
    fn run_until_detected(link: &mut UsbTapLink<SimLine>, sim: &SimLine, max_ms: u32) {
        for _ in 0..max_ms {
            link.tick();
            if link.take_connection_detected() {
                return;
            }
            let mut hal = sim.clone();
            hal.delay_us(1_000);
        }
        panic!("no detection within {max_ms} ticks");
    }

    #[test]
    fn peer_pulse_triggers_detection_and_a_lone_negotiation() {
        let sim = SimLine::new();
        // Even byte sum: a lone tie-break resolves to slave.
        let our_id = DeviceId::new([0x21, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let mut link = UsbTapLink::new(sim.clone(), our_id);

        // Peer presence pulse 10 ms in.
        sim.peer_pulse(10_000, PRESENCE_PULSE_US);
        run_until_detected(&mut link, &sim, 30);
        assert!(link.is_negotiating());

        // Next tick runs the race; with nobody driving it ends in the
        // parity fallback.
        link.tick();
        assert!(link.take_negotiation_complete());
        assert!(link.is_connected());
        assert_eq!(link.role(), Some(Role::Slave));
    }

    #[test]
    fn held_low_line_detects_after_the_debounce_window() {
        let sim = SimLine::new();
        let mut link = UsbTapLink::new(sim.clone(), id(0xA1));

        // Peer holds the line LOW for a long time starting at 5 ms.
        sim.peer_pulse(5_000, 40_000);
        run_until_detected(&mut link, &sim, 20);
    }

    #[test]
    fn slave_returns_to_idle_after_command_silence() {
        let sim = SimLine::new();
        let our_id = DeviceId::new([0x21, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let mut link = UsbTapLink::new(sim.clone(), our_id);

        sim.peer_pulse(10_000, PRESENCE_PULSE_US);
        run_until_detected(&mut link, &sim, 30);
        link.tick();
        assert!(link.is_connected());
        assert_eq!(link.role(), Some(Role::Slave));

        // Two seconds of silence drop the link.
        run_ms(&mut link, &sim, 2_100);
        assert!(link.is_idle());
        assert_eq!(link.role(), None);
        assert!(!link.peer_ready());
    }

    #[test]
    fn master_drops_after_three_failed_commands() {
        let sim = SimLine::new();
        // Odd byte sum: a lone tie-break claims master.
        let our_id = DeviceId::new([0x21, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let mut link = UsbTapLink::new(sim.clone(), our_id);

        sim.peer_pulse(10_000, PRESENCE_PULSE_US);
        run_until_detected(&mut link, &sim, 30);
        link.tick();
        assert!(link.is_connected());
        assert_eq!(link.role(), Some(Role::Master));

        // Nobody answers: three strikes and the connection drops.
        assert_eq!(link.check_ready(), TapResponse::None);
        assert!(link.is_connected());
        assert_eq!(link.check_ready(), TapResponse::None);
        assert!(link.is_connected());
        assert_eq!(link.check_ready(), TapResponse::None);
        assert!(link.is_idle());
        assert_eq!(link.role(), None);
    }

    #[test]
    fn master_exchange_against_a_scripted_slave() {
        let sim = SimLine::new();
        let mut link = UsbTapLink::new(sim.clone(), id(0xA1));
        let peer = id(0x51);

        // Peer pulse, then its negotiation bit: 0x51 drives a 0 in slot 0
        // while our 0xA1 releases a 1, which decides the race immediately.
        sim.peer_pulse(10_000, PRESENCE_PULSE_US);
        run_until_detected(&mut link, &sim, 30);
        assert!(link.is_negotiating());
        sim.peer_pulse(sim.now(), BIT_DRIVE_US);
        link.tick();
        assert!(link.is_connected());
        assert_eq!(link.role(), Some(Role::Master));

        // Scripted REQUEST_ID answer: ACK plus the peer identifier.
        let t = sim.now();
        let resp_at = t + START_PULSE_US + CMD_TURNAROUND_US + 8 * SLOT_US + CMD_TURNAROUND_US;
        let id_at = sim.peer_byte(resp_at, TapResponse::Ack.wire_byte());
        sim.peer_bytes(id_at, peer.as_bytes());
        assert_eq!(link.request_peer_id(), Some(peer));

        // Scripted SEND_ID ack.
        let t = sim.now();
        let resp_at =
            t + START_PULSE_US + CMD_TURNAROUND_US + (1 + 12) * 8 * SLOT_US + CMD_TURNAROUND_US;
        sim.peer_byte(resp_at, TapResponse::Ack.wire_byte());
        assert!(link.send_own_id());
        assert!(link.id_exchange_done());
    }
}
