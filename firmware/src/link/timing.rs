// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Protocol timing, all in microseconds. Tolerances are ±10% unless a
//! comment says otherwise; the drive period is deliberately long so both
//! badges are guaranteed to be driving when the sample point lands,
//! even with a few milliseconds of sync error.

/// Width of a presence pulse (LOW).
pub const PRESENCE_PULSE_US: u32 = 2_000;

/// Minimum interval between presence pulses.
pub const PULSE_INTERVAL_US: u32 = 50_000;

/// A LOW must persist this long to count as a detection.
pub const DEBOUNCE_TIME_US: u32 = 5_000;

/// Drive duration of one negotiation/data bit.
pub const BIT_DRIVE_US: u32 = 5_000;

/// Offset within a bit slot at which the line is sampled.
pub const BIT_SAMPLE_US: u32 = 2_500;

/// Idle time between bits.
pub const BIT_RECOVERY_US: u32 = 2_000;

/// Width of each of the two synchronization pulses.
pub const SYNC_PULSE_US: u32 = 10_000;

/// Fixed alignment wait after the sync handshake.
pub const SYNC_WAIT_US: u32 = 5_000;

/// Width of a command START pulse.
pub const START_PULSE_US: u32 = 5_000;

/// A LOW at least this wide is a START pulse; anything shorter is a
/// presence artifact and is ignored.
pub const START_PULSE_MIN_US: u32 = 3_000;

/// Gap between phases of a command.
pub const CMD_TURNAROUND_US: u32 = 2_000;

/// Maximum wait for any single command exchange.
pub const CMD_TIMEOUT_US: u32 = 100_000;

/// Slave drops the connection after this long without a command.
pub const SLAVE_IDLE_TIMEOUT_US: u32 = 2_000_000;

/// Number of identifier bits compared in the negotiation race.
pub const NEGOTIATION_BITS: usize = 32;

/// Consecutive failed commands before the master disconnects.
pub const MAX_COMMAND_FAILURES: u8 = 3;

/// Battery variant: stability samples taken while waking.
pub const WAKE_SAMPLES: usize = 5;

/// Battery variant: spacing of the wake stability samples.
pub const WAKE_SAMPLE_SPACING_US: u32 = 100;

/// Battery variant: how long the line must validate before negotiating.
pub const WAKE_VALIDATION_US: u32 = 10_000;

/// Battery variant: how long the connected line must stay unstable
/// before the connection is declared lost.
pub const DISCONNECT_DEBOUNCE_US: u32 = 2_000;
