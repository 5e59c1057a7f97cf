// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Composition root and per-tick policy.
//!
//! One cooperative loop drives everything: the tap link engine first,
//! then the event fallout (counters, fast saves, feedback cues), the
//! role-specific command policy, the serial processor, and finally the
//! store's coalescing tick. The platform layer constructs an
//! [`Application`] at startup and calls [`Application::tick`] about once
//! per millisecond so 2 ms presence pulses cannot slip through unseen.

use crate::hal::{BuzzerHal, NvmHal, ReadyPattern, RolePattern, SerialHal, StatusHal, UidSource};
use crate::link::{Role, TapCommand, TapLink, TapResponse};
use crate::serial::CommandProcessor;
use crate::storage::{AddLink, Store};
use consts::{
    COMMAND_INTERVAL_MS, DISCONNECT_COOLDOWN_MS, SUCCESS_DISPLAY_MS, SUCCESS_TONE_DELAY_MS,
};

pub struct Application<L, N, S, D, B>
where
    L: TapLink,
    N: NvmHal,
    S: SerialHal,
    D: StatusHal,
    B: BuzzerHal,
{
    link: L,
    store: Store<N>,
    serial: S,
    display: D,
    buzzer: B,
    processor: CommandProcessor,
    /// When the last tap completed; drives the success display window.
    /// Zero means "never".
    connection_detected_ms: u32,
    /// Master-side command throttle.
    last_command_ms: u32,
    /// When a torn-down link was first seen; drives the re-arm cooldown.
    fault_seen_ms: Option<u32>,
}

impl<L, N, S, D, B> Application<L, N, S, D, B>
where
    L: TapLink,
    N: NvmHal,
    S: SerialHal,
    D: StatusHal,
    B: BuzzerHal,
{
    pub fn new(link: L, store: Store<N>, serial: S, display: D, buzzer: B) -> Self {
        Application {
            link,
            store,
            serial,
            display,
            buzzer,
            processor: CommandProcessor::new(),
            connection_detected_ms: 0,
            last_command_ms: 0,
            fault_seen_ms: None,
        }
    }

    /// Bring up the store (capturing the hardware UID on first boot) and
    /// show the boot pattern. Fails only if the NVM cannot be brought up.
    pub fn init(&mut self, uid: &impl UidSource, now_ms: u32) -> Result<(), N::Error> {
        self.display.set_ready_pattern(ReadyPattern::Booting);
        self.display.set_role_pattern(RolePattern::None);
        self.store.begin(uid, now_ms)?;
        info!("app: up");
        Ok(())
    }

    /// One main-loop iteration.
    pub fn tick(&mut self, now_ms: u32) {
        self.link.tick();

        if self.link.take_connection_detected() {
            self.buzzer.play_detection_tone();
        }

        if self.link.take_negotiation_complete() {
            // A tap can be very brief; persist the counter on the spot
            // through the cheap path.
            self.store.increment_tap_count();
            self.store.save_tap_count_fast(now_ms);
            self.connection_detected_ms = now_ms;
            self.last_command_ms = now_ms;
        }

        if self.link.is_connected() {
            match self.link.role() {
                Some(Role::Master) => self.master_policy(now_ms),
                Some(Role::Slave) => self.slave_policy(now_ms),
                None => {}
            }
        }

        self.rearm_after_fault(now_ms);
        self.update_status(now_ms);
        self.processor.poll(&mut self.serial, &mut self.store, now_ms);
        self.store.tick(now_ms);
    }

    /// Master: at most one command per [`COMMAND_INTERVAL_MS`]. Probe
    /// readiness, run the two-way ID exchange once, then keep-alive.
    fn master_policy(&mut self, now_ms: u32) {
        if now_ms.wrapping_sub(self.last_command_ms) < COMMAND_INTERVAL_MS {
            return;
        }

        if !self.link.peer_ready() {
            self.link.check_ready();
        } else if !self.link.id_exchange_done() {
            if let Some(peer) = self.link.request_peer_id() {
                if self.link.send_own_id() {
                    self.record_link(peer, now_ms);
                    self.buzzer.schedule_success_tone(SUCCESS_TONE_DELAY_MS);
                }
            }
        } else {
            self.link.check_ready();
        }

        self.last_command_ms = now_ms;
    }

    /// Slave: handle at most one inbound command per tick.
    fn slave_policy(&mut self, now_ms: u32) {
        if !self.link.poll_for_command() {
            return;
        }

        match self.link.receive_command() {
            TapCommand::CheckReady => self.link.respond(TapResponse::Ack),
            TapCommand::RequestId => self.link.handle_request_id(),
            TapCommand::SendId => {
                if let Some(peer) = self.link.handle_send_id() {
                    self.record_link(peer, now_ms);
                    self.buzzer.schedule_success_tone(SUCCESS_TONE_DELAY_MS);
                }
            }
            TapCommand::None => {}
            TapCommand::Other(_) => self.link.respond(TapResponse::Nak),
        }
    }

    /// Battery builds park in `Disconnected` after a teardown; give the
    /// line a moment to settle, then re-arm for the next tap. Powered
    /// builds never report a fault and skip this entirely.
    fn rearm_after_fault(&mut self, now_ms: u32) {
        if !self.link.is_faulted() {
            self.fault_seen_ms = None;
            return;
        }
        match self.fault_seen_ms {
            None => self.fault_seen_ms = Some(now_ms),
            Some(since) if now_ms.wrapping_sub(since) >= DISCONNECT_COOLDOWN_MS => {
                self.link.reset();
                self.fault_seen_ms = None;
            }
            Some(_) => {}
        }
    }

    fn record_link(&mut self, peer: crate::device_id::DeviceId, now_ms: u32) {
        if self.store.add_link(peer) == AddLink::AddedNew {
            let index = self.store.last_link_index();
            self.store.save_link_fast(index, now_ms);
            info!("app: new link recorded");
        }
    }

    fn update_status(&mut self, now_ms: u32) {
        let success_window = self.connection_detected_ms != 0
            && now_ms.wrapping_sub(self.connection_detected_ms) < SUCCESS_DISPLAY_MS;

        let ready = if self.link.is_connected()
            && self.link.role() == Some(Role::Master)
            && self.link.peer_ready()
        {
            ReadyPattern::PeerReady
        } else if success_window || self.link.is_connected() {
            ReadyPattern::Success
        } else if self.link.is_negotiating() {
            ReadyPattern::Negotiating
        } else if self.link.is_detecting() {
            ReadyPattern::Detecting
        } else if self.link.is_faulted() {
            ReadyPattern::Error
        } else {
            ReadyPattern::Idle
        };
        self.display.set_ready_pattern(ready);

        let role = match self.link.role() {
            Some(Role::Master) => RolePattern::Master,
            Some(Role::Slave) => RolePattern::Slave,
            None if self.link.is_negotiating() => RolePattern::Unknown,
            None => RolePattern::None,
        };
        self.display.set_role_pattern(role);
    }

    pub fn store(&self) -> &Store<N> {
        &self.store
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }
}
