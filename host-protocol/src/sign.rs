// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Canonical signed-state layout and the HMAC primitive.
//!
//! Firmware and host tooling both link this module, so a disagreement about
//! the byte layout is impossible by construction. The message is:
//!
//! `selfId (12) ‖ nonce (1..=32) ‖ totalTapCount (u32 LE) ‖
//!  linkCount (u16 LE) ‖ links[0..linkCount] (12 each)`

use consts::{DEVICE_UID_LEN, MAX_LINKS, NONCE_MAX_LEN, SECRET_KEY_LEN};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Upper bound of an encoded signed-state message.
pub const SIGNED_MSG_MAX: usize =
    DEVICE_UID_LEN + NONCE_MAX_LEN + 4 + 2 + MAX_LINKS * DEVICE_UID_LEN;

/// Encode the canonical signed-state message into `buf`.
/// Returns the number of bytes used. Oversized inputs are clamped to the
/// protocol bounds (the firmware never produces them; a defect upstream
/// must not turn into an out-of-bounds write here).
pub fn encode_signed_state(
    self_id: &[u8; DEVICE_UID_LEN],
    nonce: &[u8],
    total_tap_count: u32,
    links: &[[u8; DEVICE_UID_LEN]],
    buf: &mut [u8; SIGNED_MSG_MAX],
) -> usize {
    let nonce = &nonce[..nonce.len().min(NONCE_MAX_LEN)];
    let links = &links[..links.len().min(MAX_LINKS)];

    let mut pos = 0;
    buf[pos..pos + DEVICE_UID_LEN].copy_from_slice(self_id);
    pos += DEVICE_UID_LEN;

    buf[pos..pos + nonce.len()].copy_from_slice(nonce);
    pos += nonce.len();

    buf[pos..pos + 4].copy_from_slice(&total_tap_count.to_le_bytes());
    pos += 4;

    buf[pos..pos + 2].copy_from_slice(&(links.len() as u16).to_le_bytes());
    pos += 2;

    for peer in links {
        buf[pos..pos + DEVICE_UID_LEN].copy_from_slice(peer);
        pos += DEVICE_UID_LEN;
    }

    pos
}

/// HMAC-SHA256 over `msg` under the provisioned 32-byte secret.
pub fn hmac_sha256(key: &[u8; SECRET_KEY_LEN], msg: &[u8]) -> [u8; 32] {
    match Hmac::<Sha256>::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(msg);
            mac.finalize().into_bytes().into()
        }
        // Unreachable for a 32-byte key; HMAC accepts any key length.
        Err(_) => [0xFF; 32],
    }
}
