// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device responses: single-line JSON objects.
//!
//! Every response starts with an `event` discriminator so the host can
//! route lines without guessing at shapes. Field order is fixed by struct
//! order; tests pin the exact wire text.

use consts::{DEVICE_UID_HEX_LEN, MAX_LINKS, NONCE_MAX_LEN};
use heapless::{String, Vec};
use serde::Serialize;

/// A device identifier rendered as 24 hex chars.
pub type HexId = String<DEVICE_UID_HEX_LEN>;

/// Hex rendering of an HMAC-SHA256 tag.
pub type HexTag = String<64>;

/// Upper bound on one encoded response line, terminator included.
/// The largest response is a full-range `DUMP` of 64 links.
pub const RESPONSE_MAX: usize = 3072;

/// Response to `HELLO`: identity and build provenance.
#[derive(Debug, Serialize)]
pub struct Hello {
    pub event: &'static str,
    pub device_id: HexId,
    pub fw: &'static str,
    pub build: &'static str,
    pub hash: &'static str,
}

impl Hello {
    pub fn new(device_id: HexId, fw: &'static str, build: &'static str, hash: &'static str) -> Self {
        Hello { event: "hello", device_id, fw, build, hash }
    }
}

/// Response to `GET_STATE`: the two counters the host cares about.
#[derive(Debug, Serialize)]
pub struct State {
    pub event: &'static str,
    #[serde(rename = "totalTapCount")]
    pub total_tap_count: u32,
    #[serde(rename = "linkCount")]
    pub link_count: u16,
}

impl State {
    pub fn new(total_tap_count: u32, link_count: u16) -> Self {
        State { event: "state", total_tap_count, link_count }
    }
}

/// Generic acknowledgement, emitted before any slow NVM work starts.
#[derive(Debug, Serialize)]
pub struct Ack {
    pub event: &'static str,
    pub cmd: &'static str,
    #[serde(rename = "keyVersion", skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u8>,
}

impl Ack {
    pub fn new(cmd: &'static str) -> Self {
        Ack { event: "ack", cmd, key_version: None }
    }

    pub fn with_key_version(cmd: &'static str, key_version: u8) -> Self {
        Ack { event: "ack", cmd, key_version: Some(key_version) }
    }
}

/// One recorded peer inside a `links` response.
#[derive(Debug, Serialize)]
pub struct LinkItem {
    pub peer: HexId,
}

/// Response to `DUMP`: a window into the recorded links.
#[derive(Debug, Serialize)]
pub struct Links {
    pub event: &'static str,
    pub offset: u16,
    pub count: u16,
    pub items: Vec<LinkItem, MAX_LINKS>,
}

impl Links {
    pub fn new(offset: u16, items: Vec<LinkItem, MAX_LINKS>) -> Self {
        Links { event: "links", offset, count: items.len() as u16, items }
    }
}

/// The only user-visible failure path.
#[derive(Debug, Serialize)]
pub struct ErrorMsg {
    pub event: &'static str,
    pub msg: String<64>,
}

impl ErrorMsg {
    pub fn new(msg: &str) -> Self {
        let mut out = String::new();
        for c in msg.chars() {
            if out.push(c).is_err() {
                break;
            }
        }
        ErrorMsg { event: "error", msg: out }
    }
}

/// Response to `SIGN_STATE`: the signed snapshot plus its tag.
#[derive(Debug, Serialize)]
pub struct SignedState {
    pub event: &'static str,
    pub device_id: HexId,
    pub nonce: String<{ 2 * NONCE_MAX_LEN }>,
    #[serde(rename = "totalTapCount")]
    pub total_tap_count: u32,
    #[serde(rename = "linkCount")]
    pub link_count: u16,
    #[serde(rename = "keyVersion")]
    pub key_version: u8,
    pub hmac: HexTag,
}

impl SignedState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: HexId,
        nonce: String<{ 2 * NONCE_MAX_LEN }>,
        total_tap_count: u32,
        link_count: u16,
        key_version: u8,
        hmac: HexTag,
    ) -> Self {
        SignedState {
            event: "SIGNED_STATE",
            device_id,
            nonce,
            total_tap_count,
            link_count,
            key_version,
            hmac,
        }
    }
}

/// Response encoding failed; practically means the buffer was too small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeError;

/// Encode one response as a JSON object followed by `\n`.
/// Returns the number of bytes written into `buf`.
pub fn encode_line<T: Serialize>(value: &T, buf: &mut [u8]) -> Result<usize, EncodeError> {
    let n = serde_json_core::to_slice(value, buf).map_err(|_| EncodeError)?;
    if n >= buf.len() {
        return Err(EncodeError);
    }
    buf[n] = b'\n';
    Ok(n + 1)
}
