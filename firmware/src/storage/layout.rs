// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Persisted image layout, version 1.
//!
//! ```text
//! offset 0x000  magic          u32   "BOKA"
//! offset 0x004  version        u16   = 1
//! offset 0x006  length         u16   = PAYLOAD_LEN
//! offset 0x008  crc32          u32   over the payload as LE u32 words
//! offset 0x00C  selfId         12 B
//! offset 0x018  totalTapCount  u32
//! offset 0x01C  linkCount      u16
//! offset 0x01E  keyVersion     u8
//! offset 0x01F  reserved       u8
//! offset 0x020  links          64 x 12 B
//! offset 0x320  secretKey      32 B
//! offset 0x340  reserved       64 B
//! ```
//!
//! Everything is little-endian and packed; the payload is 4-byte aligned
//! so the word-fed CRC covers it exactly.

use crate::device_id::DeviceId;
use consts::{DEVICE_UID_LEN, MAX_LINKS, SECRET_KEY_LEN, STORAGE_AREA_SIZE};

pub(crate) const OFF_MAGIC: usize = 0x00;
pub(crate) const OFF_VERSION: usize = 0x04;
pub(crate) const OFF_LENGTH: usize = 0x06;
pub(crate) const OFF_CRC: usize = 0x08;
pub(crate) const OFF_PAYLOAD: usize = 0x0C;

// Payload-relative field offsets.
pub(crate) const P_SELF_ID: usize = 0x00;
pub(crate) const P_TAP_COUNT: usize = P_SELF_ID + DEVICE_UID_LEN;
pub(crate) const P_LINK_COUNT: usize = P_TAP_COUNT + 4;
pub(crate) const P_KEY_VERSION: usize = P_LINK_COUNT + 2;
pub(crate) const P_LINKS: usize = P_KEY_VERSION + 2; // one reserved byte after keyVersion
pub(crate) const P_SECRET: usize = P_LINKS + MAX_LINKS * DEVICE_UID_LEN;
pub(crate) const P_RESERVED: usize = P_SECRET + SECRET_KEY_LEN;

/// Serialized payload size; must stay a multiple of 4 for the CRC.
pub(crate) const PAYLOAD_LEN: usize = P_RESERVED + 64;

/// Full container size: header plus payload.
pub(crate) const IMAGE_LEN: usize = OFF_PAYLOAD + PAYLOAD_LEN;

const _: () = assert!(PAYLOAD_LEN % 4 == 0);
const _: () = assert!(IMAGE_LEN <= STORAGE_AREA_SIZE);
const _: () = assert!(OFF_PAYLOAD + P_TAP_COUNT == 0x18);
const _: () = assert!(OFF_PAYLOAD + P_LINK_COUNT == 0x1C);
const _: () = assert!(OFF_PAYLOAD + P_LINKS == 0x20);
const _: () = assert!(OFF_PAYLOAD + P_SECRET == 0x320);

/// The device state that survives power loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedState {
    /// Captured once from the hardware UID; survives `clear_all`.
    pub self_id: DeviceId,
    /// Completed tap events over the device lifetime.
    pub total_tap_count: u32,
    /// Number of meaningful entries in `links`.
    pub link_count: u16,
    /// 0 = no secret provisioned.
    pub key_version: u8,
    pub secret_key: [u8; SECRET_KEY_LEN],
    pub links: [DeviceId; MAX_LINKS],
}

impl Default for PersistedState {
    fn default() -> Self {
        PersistedState {
            self_id: DeviceId::zero(),
            total_tap_count: 0,
            link_count: 0,
            key_version: 0,
            secret_key: [0; SECRET_KEY_LEN],
            links: [DeviceId::zero(); MAX_LINKS],
        }
    }
}

impl PersistedState {
    /// `link_count` capped at the table size; the counter itself can sit
    /// at MAX_LINKS while the table wraps.
    pub fn clamped_link_count(&self) -> u16 {
        self.link_count.min(MAX_LINKS as u16)
    }

    /// The meaningful prefix of the link table.
    pub fn link_slice(&self) -> &[DeviceId] {
        &self.links[..self.clamped_link_count() as usize]
    }

    pub(crate) fn encode_payload(&self, buf: &mut [u8; PAYLOAD_LEN]) {
        buf.fill(0);
        buf[P_SELF_ID..P_SELF_ID + DEVICE_UID_LEN].copy_from_slice(self.self_id.as_bytes());
        buf[P_TAP_COUNT..P_TAP_COUNT + 4].copy_from_slice(&self.total_tap_count.to_le_bytes());
        buf[P_LINK_COUNT..P_LINK_COUNT + 2].copy_from_slice(&self.link_count.to_le_bytes());
        buf[P_KEY_VERSION] = self.key_version;
        for (i, link) in self.links.iter().enumerate() {
            let at = P_LINKS + i * DEVICE_UID_LEN;
            buf[at..at + DEVICE_UID_LEN].copy_from_slice(link.as_bytes());
        }
        buf[P_SECRET..P_SECRET + SECRET_KEY_LEN].copy_from_slice(&self.secret_key);
    }

    pub(crate) fn decode_payload(buf: &[u8; PAYLOAD_LEN]) -> Self {
        let mut state = PersistedState::default();

        let mut id = [0u8; DEVICE_UID_LEN];
        id.copy_from_slice(&buf[P_SELF_ID..P_SELF_ID + DEVICE_UID_LEN]);
        state.self_id = DeviceId::new(id);

        state.total_tap_count =
            u32::from_le_bytes(buf[P_TAP_COUNT..P_TAP_COUNT + 4].try_into().unwrap());
        state.link_count =
            u16::from_le_bytes(buf[P_LINK_COUNT..P_LINK_COUNT + 2].try_into().unwrap());
        state.key_version = buf[P_KEY_VERSION];

        for (i, link) in state.links.iter_mut().enumerate() {
            let at = P_LINKS + i * DEVICE_UID_LEN;
            let mut id = [0u8; DEVICE_UID_LEN];
            id.copy_from_slice(&buf[at..at + DEVICE_UID_LEN]);
            *link = DeviceId::new(id);
        }

        state
            .secret_key
            .copy_from_slice(&buf[P_SECRET..P_SECRET + SECRET_KEY_LEN]);

        state
    }
}
