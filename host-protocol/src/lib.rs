// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device to host serial protocol.
//!
//! The host is a computer on the other end of the serial line; the target is
//! the badge MCU. Commands travel host-to-device as ASCII lines, responses
//! come back as single-line JSON objects. This crate also carries the
//! canonical signed-state byte layout so firmware and host tooling agree on
//! HMAC input byte-for-byte.

#![cfg_attr(not(test), no_std)]

pub mod command;
pub mod response;
pub mod sign;

pub use command::{Command, ParseError};
pub use response::{encode_line, EncodeError, RESPONSE_MAX};
pub use sign::{encode_signed_state, hmac_sha256, SIGNED_MSG_MAX};
