// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Contracts consumed from the platform layer.
//!
//! The core never owns pins, timers or flash pages; it is generic over
//! these traits and the board crate supplies the implementations at
//! composition time.

use consts::DEVICE_UID_LEN;

/// Logic level of the open-drain tap line.
///
/// The line idles `High` through the passive pull-up and reads `Low`
/// while any participant asserts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn is_low(self) -> bool {
        self == Level::Low
    }
}

/// The single-wire line plus the microsecond clock that paces it.
pub trait LineHal {
    /// Sample the line.
    fn read_line(&mut self) -> Level;

    /// `true` asserts the line LOW; `false` releases it to Hi-Z so the
    /// pull-up can take it HIGH.
    fn drive_low(&mut self, enable: bool);

    /// Monotonic microsecond counter; wraps about every 71 minutes.
    fn micros(&mut self) -> u32;

    /// Busy-wait. Accuracy within a few percent is sufficient; every
    /// protocol window carries a ±10% tolerance.
    fn delay_us(&mut self, us: u32);
}

/// Byte-addressable non-volatile memory backing the persisted image.
pub trait NvmHal {
    type Error;

    /// Prepare a contiguous region of `size` bytes.
    fn begin(&mut self, size: usize) -> Result<(), Self::Error>;

    fn read_byte(&mut self, addr: usize) -> u8;

    fn write_byte(&mut self, addr: usize, value: u8) -> Result<(), Self::Error>;

    /// Flush staged writes. The region commits atomically.
    fn commit(&mut self) -> Result<(), Self::Error>;

    /// Busy-wait used between write chunks so serial RX interrupts can
    /// drain their FIFO during multi-hundred-millisecond programming.
    fn delay_ms(&mut self, ms: u32);
}

/// Source of the hardware-unique device identifier.
pub trait UidSource {
    /// The 96-bit MCU unique ID, big-endian.
    fn device_uid(&self) -> [u8; DEVICE_UID_LEN];
}

/// Host-facing serial port. Line buffering is done by the core; the
/// platform only moves bytes.
pub trait SerialHal {
    /// Non-blocking read of one received byte.
    fn read_byte(&mut self) -> Option<u8>;

    /// Blocking write of a complete response.
    fn write(&mut self, bytes: &[u8]);
}

/// Pattern shown on the readiness LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReadyPattern {
    Booting,
    Idle,
    Detecting,
    Negotiating,
    Success,
    PeerReady,
    Error,
}

/// Pattern shown on the role LED: master = steady on, slave = slow
/// blink, unknown = fast blink while negotiating, none = off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RolePattern {
    None,
    Unknown,
    Master,
    Slave,
}

/// Status LED pattern driver. Patterns latch at set time and the driver
/// advances them from its own tick.
pub trait StatusHal {
    fn set_ready_pattern(&mut self, pattern: ReadyPattern);
    fn set_role_pattern(&mut self, pattern: RolePattern);
}

/// Feedback tone player.
pub trait BuzzerHal {
    /// Short beep the moment two badges touch.
    fn play_detection_tone(&mut self);

    /// Ascending melody, delayed so it lands after the (much faster)
    /// ID exchange has finished.
    fn schedule_success_tone(&mut self, delay_ms: u32);
}
