// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tap link engine.
//!
//! A half-duplex, open-drain, single-wire link between two badges:
//! presence detection, symmetric master/slave negotiation by wired-AND
//! bit racing, then a byte-framed command/response protocol for the ID
//! exchange. Two detection front-ends exist — continuously powered
//! ([`usb::UsbTapLink`]) and wake-on-edge battery ([`battery::BatteryTapLink`])
//! — sharing the wire-level machinery in [`wire`].

pub mod battery;
pub mod timing;
pub mod usb;
mod wire;

pub use battery::BatteryTapLink;
pub use usb::UsbTapLink;

use crate::device_id::DeviceId;

/// Negotiated role. The badge with the numerically larger identifier
/// (big-endian compare) drives the connection as master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    Master,
    Slave,
}

/// Command bytes the master puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TapCommand {
    /// Nothing arrived (stray presence pulse or timeout); never on the wire.
    None,
    /// Probe whether the slave is listening. Response: ACK/NAK.
    CheckReady,
    /// Ask the slave for its identifier. Response: ACK + 12 bytes.
    RequestId,
    /// Push our identifier to the slave. Payload: 12 bytes; response: ACK/NAK.
    SendId,
    /// A byte that is not part of the command set.
    Other(u8),
}

impl TapCommand {
    pub(crate) fn from_wire(byte: u8) -> Self {
        match byte {
            0x01 => TapCommand::CheckReady,
            0x02 => TapCommand::RequestId,
            0x03 => TapCommand::SendId,
            other => TapCommand::Other(other),
        }
    }

    pub(crate) fn wire_byte(self) -> u8 {
        match self {
            TapCommand::None => 0x00,
            TapCommand::CheckReady => 0x01,
            TapCommand::RequestId => 0x02,
            TapCommand::SendId => 0x03,
            TapCommand::Other(b) => b,
        }
    }
}

/// Response bytes the slave puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TapResponse {
    /// No valid response (timeout or garbage); never on the wire.
    None,
    Ack,
    Nak,
}

impl TapResponse {
    pub(crate) fn from_wire(byte: u8) -> Self {
        match byte {
            0x06 => TapResponse::Ack,
            0x15 => TapResponse::Nak,
            _ => TapResponse::None,
        }
    }

    pub(crate) fn wire_byte(self) -> u8 {
        match self {
            TapResponse::None => 0x00,
            TapResponse::Ack => 0x06,
            TapResponse::Nak => 0x15,
        }
    }
}

/// Ephemeral per-connection state. Reinitialized on every drop to idle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Session {
    pub role: Option<Role>,
    /// Master's cache of the slave's last CHECK_READY answer.
    pub peer_ready: bool,
    /// Both directions of the ID transfer succeeded in this connection.
    pub id_exchange_done: bool,
    /// Consecutive failed master commands.
    pub command_failures: u8,
    /// Master: last command sent; slave: last command received.
    pub last_command_us: u32,
}

impl Session {
    pub(crate) fn idle() -> Self {
        Session {
            role: None,
            peer_ready: false,
            id_exchange_done: false,
            command_failures: 0,
            last_command_us: 0,
        }
    }

    pub(crate) fn connected(role: Role, now_us: u32) -> Self {
        Session {
            role: Some(role),
            peer_ready: false,
            id_exchange_done: false,
            command_failures: 0,
            last_command_us: now_us,
        }
    }

    pub(crate) fn is_master(&self) -> bool {
        self.role == Some(Role::Master)
    }

    pub(crate) fn is_slave(&self) -> bool {
        self.role == Some(Role::Slave)
    }
}

/// The engine interface the orchestrator drives. Both power variants
/// implement it; the variant is chosen once at construction.
pub trait TapLink {
    /// Advance the detection state machine. Bounded per call except while
    /// a negotiation or command exchange is in flight, which monopolizes
    /// the CPU by design: the wired-AND sampling only works when the
    /// engine owns the timing of a whole slot.
    fn tick(&mut self);

    /// Drop any connection and return to the idle/sleeping state.
    fn reset(&mut self);

    /// Line-edge wake signal from the HAL. Only the battery variant
    /// listens; the powered variant polls instead.
    fn handle_wake(&mut self) {}

    fn self_id(&self) -> DeviceId;

    fn is_connected(&self) -> bool;
    fn is_negotiating(&self) -> bool;
    fn is_detecting(&self) -> bool;
    fn is_idle(&self) -> bool;

    /// Connection torn down and not yet re-armed; powered builds never
    /// report this.
    fn is_faulted(&self) -> bool {
        false
    }

    /// `Some` once negotiation has completed, until the next idle.
    fn role(&self) -> Option<Role>;

    fn peer_ready(&self) -> bool;
    fn id_exchange_done(&self) -> bool;

    /// One-shot: a peer was detected since the last call.
    fn take_connection_detected(&mut self) -> bool;

    /// One-shot: negotiation finished since the last call.
    fn take_negotiation_complete(&mut self) -> bool;

    // Master operations. No-ops unless connected as master.

    fn check_ready(&mut self) -> TapResponse;
    fn request_peer_id(&mut self) -> Option<DeviceId>;
    fn send_own_id(&mut self) -> bool;

    // Slave operations. No-ops unless connected as slave.

    /// True when the line is LOW, i.e. a START pulse may be in flight.
    fn poll_for_command(&mut self) -> bool;
    fn receive_command(&mut self) -> TapCommand;
    fn respond(&mut self, response: TapResponse);
    fn handle_request_id(&mut self);
    fn handle_send_id(&mut self) -> Option<DeviceId>;
}
