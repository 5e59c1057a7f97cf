// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bokaka tap-badge firmware core.
//!
//! Two badges joined by a single conductive wire detect each other,
//! elect a master by racing their identifiers over the wired-AND line,
//! exchange 96-bit device IDs, and persist the peer plus a tap counter
//! in a CRC-protected NVM image. A host on the serial line can query
//! state, provision a 256-bit secret, and request an HMAC-SHA256-signed
//! state report.
//!
//! The crate is hardware-agnostic: every platform resource comes in
//! through the traits in [`hal`], and the board crate composes an
//! [`Application`] at startup. Module map:
//!
//! - [`hal`] — contracts consumed from the platform layer
//! - [`device_id`] — the 96-bit identifier
//! - [`storage`] — persistent store with write coalescing and fast saves
//! - [`link`] — tap link engine (detection, negotiation, commands)
//! - [`serial`] — host command processor
//! - [`app`] — the composition root and per-tick policy

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod app;
pub mod device_id;
pub mod hal;
pub mod link;
pub mod serial;
pub mod storage;

pub use app::Application;
pub use device_id::DeviceId;
