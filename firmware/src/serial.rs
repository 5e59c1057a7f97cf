// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host command processor.
//!
//! Accumulates bytes from the serial HAL into lines, parses them with
//! the shared [`host_protocol`] grammar, executes against the store and
//! the signing primitive, and writes single-line JSON responses back.
//! Commands that trigger a slow NVM erase acknowledge first so the host
//! is not left staring at a silent port.

use crate::hal::{NvmHal, SerialHal};
use crate::storage::Store;
use consts::{CMD_LINE_MAX, DEVICE_UID_LEN, FW_BUILD, FW_BUILD_HASH, FW_VERSION, MAX_LINKS};
use core::fmt::Write as _;
use heapless::{String, Vec};
use host_protocol::command::{Command, ParseError};
use host_protocol::response::{
    encode_line, Ack, ErrorMsg, Hello, LinkItem, Links, SignedState, State, RESPONSE_MAX,
};
use host_protocol::sign::{encode_signed_state, hmac_sha256, SIGNED_MSG_MAX};
use serde::Serialize;

pub struct CommandProcessor {
    line: Vec<u8, CMD_LINE_MAX>,
    /// The current line overflowed the buffer; discard through the next
    /// terminator.
    overflow: bool,
}

impl Default for CommandProcessor {
    fn default() -> Self {
        CommandProcessor::new()
    }
}

impl CommandProcessor {
    pub fn new() -> Self {
        CommandProcessor { line: Vec::new(), overflow: false }
    }

    /// Drain the serial RX and handle any completed lines. `\r` is
    /// tolerated and ignored; blank lines are skipped.
    pub fn poll<S: SerialHal, N: NvmHal>(
        &mut self,
        serial: &mut S,
        store: &mut Store<N>,
        now_ms: u32,
    ) {
        while let Some(byte) = serial.read_byte() {
            match byte {
                b'\r' => {}
                b'\n' => {
                    if !self.overflow && !self.line.is_empty() {
                        if let Ok(text) = core::str::from_utf8(&self.line) {
                            handle_line(serial, store, text, now_ms);
                        }
                    }
                    self.line.clear();
                    self.overflow = false;
                }
                other => {
                    if self.line.push(other).is_err() {
                        self.line.clear();
                        self.overflow = true;
                    }
                }
            }
        }
    }
}

fn handle_line<S: SerialHal, N: NvmHal>(
    serial: &mut S,
    store: &mut Store<N>,
    line: &str,
    now_ms: u32,
) {
    if line.split_ascii_whitespace().next().is_none() {
        return;
    }

    match Command::parse(line) {
        Ok(cmd) => dispatch(serial, store, cmd, now_ms),
        Err(ParseError::Invalid(msg)) => send_error(serial, msg),
        Err(ParseError::UnknownCommand(token)) => {
            let mut msg: String<64> = String::new();
            let _ = write!(msg, "unknown command: {token}");
            send(serial, &ErrorMsg { event: "error", msg });
        }
    }
}

fn dispatch<S: SerialHal, N: NvmHal>(
    serial: &mut S,
    store: &mut Store<N>,
    cmd: Command,
    now_ms: u32,
) {
    match cmd {
        Command::Hello => {
            let resp = Hello::new(
                store.state().self_id.to_hex(),
                FW_VERSION,
                FW_BUILD,
                FW_BUILD_HASH,
            );
            send(serial, &resp);
        }
        Command::GetState => {
            let st = store.state();
            send(serial, &State::new(st.total_tap_count, st.link_count));
        }
        Command::Clear => {
            // Acknowledge before the erase: the full save blocks for
            // hundreds of milliseconds.
            send(serial, &Ack::new("CLEAR"));
            store.clear_all(now_ms);
            info!("serial: state cleared");
        }
        Command::Dump { offset, count } => {
            let st = store.state();
            let mut items: Vec<LinkItem, MAX_LINKS> = Vec::new();
            let links = st.link_slice();
            let start = (offset as usize).min(links.len());
            let end = (start + count as usize).min(links.len());
            for link in &links[start..end] {
                let _ = items.push(LinkItem { peer: link.to_hex() });
            }
            send(serial, &Links::new(offset, items));
        }
        Command::ProvisionKey { version, key } => {
            // Ack first, same reason as CLEAR.
            send(serial, &Ack::with_key_version("PROVISION_KEY", version));
            store.set_secret_key(version, &key, now_ms);
            info!("serial: secret provisioned");
        }
        Command::SignState { nonce } => {
            if !store.has_secret_key() {
                send_error(serial, "no_key");
                return;
            }

            let st = store.state();
            let mut links = [[0u8; DEVICE_UID_LEN]; MAX_LINKS];
            let n = st.link_slice().len();
            for (dst, src) in links.iter_mut().zip(st.link_slice()) {
                *dst = *src.as_bytes();
            }

            let mut msg = [0u8; SIGNED_MSG_MAX];
            let len = encode_signed_state(
                st.self_id.as_bytes(),
                &nonce,
                st.total_tap_count,
                &links[..n],
                &mut msg,
            );
            let tag = hmac_sha256(store.secret_key(), &msg[..len]);

            let resp = SignedState::new(
                st.self_id.to_hex(),
                hex_upper(&nonce),
                st.total_tap_count,
                st.clamped_link_count(),
                store.key_version(),
                hex_upper(&tag),
            );
            send(serial, &resp);
        }
    }
}

fn send<S: SerialHal, T: Serialize>(serial: &mut S, value: &T) {
    let mut buf = [0u8; RESPONSE_MAX];
    match encode_line(value, &mut buf) {
        Ok(n) => serial.write(&buf[..n]),
        Err(_) => error!("serial: response did not fit"),
    }
}

fn send_error<S: SerialHal>(serial: &mut S, msg: &str) {
    send(serial, &ErrorMsg::new(msg));
}

/// Uppercase hex of up to 32 bytes.
fn hex_upper(bytes: &[u8]) -> String<64> {
    let mut buf = [0u8; 64];
    let n = bytes.len().min(32) * 2;
    let _ = hex::encode_to_slice(&bytes[..n / 2], &mut buf[..n]);
    buf[..n].make_ascii_uppercase();
    let mut out = String::new();
    for &b in &buf[..n] {
        let _ = out.push(b as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_id::DeviceId;
    use crate::hal::UidSource;
    use consts::{SECRET_KEY_LEN, STORAGE_AREA_SIZE};
    use std::collections::VecDeque;
    use std::string::String as StdString;
    use std::vec::Vec as StdVec;

    const UID: [u8; 12] = [0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 1, 2, 3, 4, 5, 6];

    struct RamNvm {
        mem: StdVec<u8>,
    }

    impl RamNvm {
        fn new() -> Self {
            RamNvm { mem: vec![0xFF; STORAGE_AREA_SIZE] }
        }
    }

    impl NvmHal for RamNvm {
        type Error = ();

        fn begin(&mut self, _size: usize) -> Result<(), ()> {
            Ok(())
        }

        fn read_byte(&mut self, addr: usize) -> u8 {
            self.mem[addr]
        }

        fn write_byte(&mut self, addr: usize, value: u8) -> Result<(), ()> {
            self.mem[addr] = value;
            Ok(())
        }

        fn commit(&mut self) -> Result<(), ()> {
            Ok(())
        }

        fn delay_ms(&mut self, _ms: u32) {}
    }

    struct FixedUid;

    impl UidSource for FixedUid {
        fn device_uid(&self) -> [u8; 12] {
            UID
        }
    }

    #[derive(Default)]
    struct MockSerial {
        rx: VecDeque<u8>,
        tx: StdVec<u8>,
    }

    impl MockSerial {
        fn push_line(&mut self, line: &str) {
            self.rx.extend(line.bytes());
            self.rx.push_back(b'\n');
        }

        fn lines(&mut self) -> StdVec<StdString> {
            let text = StdString::from_utf8(std::mem::take(&mut self.tx)).unwrap();
            text.lines().map(|l| l.to_owned()).collect()
        }
    }

    impl SerialHal for MockSerial {
        fn read_byte(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }

        fn write(&mut self, bytes: &[u8]) {
            self.tx.extend_from_slice(bytes);
        }
    }

    fn setup() -> (CommandProcessor, Store<RamNvm>, MockSerial) {
        let mut store = Store::new(RamNvm::new());
        store.begin(&FixedUid, 0).unwrap();
        (CommandProcessor::new(), store, MockSerial::default())
    }

    fn roundtrip(line: &str) -> StdString {
        let (mut proc, mut store, mut serial) = setup();
        serial.push_line(line);
        proc.poll(&mut serial, &mut store, 0);
        serial.lines().pop().expect("one response")
    }

    #[test]
    fn hello_reports_identity_and_build() {
        let line = roundtrip("HELLO");
        assert!(line.starts_with("{\"event\":\"hello\",\"device_id\":\"A1B2C3D4E5F6010203040506\""));
        assert!(line.contains("\"fw\":"));
        assert!(line.contains("\"hash\":"));
    }

    #[test]
    fn get_state_reports_counters() {
        let (mut proc, mut store, mut serial) = setup();
        store.increment_tap_count();
        store.increment_tap_count();
        store.add_link(DeviceId::new([0x51, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]));

        serial.push_line("get_state");
        proc.poll(&mut serial, &mut store, 0);
        assert_eq!(
            serial.lines().pop().unwrap(),
            "{\"event\":\"state\",\"totalTapCount\":2,\"linkCount\":1}"
        );
    }

    #[test]
    fn clear_acks_then_wipes() {
        let (mut proc, mut store, mut serial) = setup();
        store.increment_tap_count();
        store.add_link(DeviceId::new([0x51, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]));

        serial.push_line("CLEAR");
        proc.poll(&mut serial, &mut store, 0);

        assert_eq!(serial.lines().pop().unwrap(), "{\"event\":\"ack\",\"cmd\":\"CLEAR\"}");
        assert_eq!(store.state().total_tap_count, 0);
        assert_eq!(store.state().link_count, 0);
        assert_eq!(store.state().self_id, DeviceId::new(UID));
    }

    #[test]
    fn dump_windows_and_out_of_range() {
        let (mut proc, mut store, mut serial) = setup();
        for i in 0..3u8 {
            store.add_link(DeviceId::new([0x51 + i, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]));
        }

        serial.push_line("DUMP 1 1");
        proc.poll(&mut serial, &mut store, 0);
        assert_eq!(
            serial.lines().pop().unwrap(),
            "{\"event\":\"links\",\"offset\":1,\"count\":1,\
             \"items\":[{\"peer\":\"5202030405060708090A0B0C\"}]}"
        );

        serial.push_line("DUMP 100 5");
        proc.poll(&mut serial, &mut store, 0);
        assert_eq!(
            serial.lines().pop().unwrap(),
            "{\"event\":\"links\",\"offset\":100,\"count\":0,\"items\":[]}"
        );

        // Bare DUMP defaults to the first ten entries.
        serial.push_line("DUMP");
        proc.poll(&mut serial, &mut store, 0);
        let line = serial.lines().pop().unwrap();
        assert!(line.contains("\"count\":3"));
    }

    #[test]
    fn provision_then_sign_matches_the_canonical_layout() {
        let (mut proc, mut store, mut serial) = setup();
        let peer = DeviceId::new([0x51, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        store.increment_tap_count();
        store.increment_tap_count();
        store.add_link(peer);

        serial.push_line(&format!("PROVISION_KEY 1 {}", "00".repeat(32)));
        proc.poll(&mut serial, &mut store, 0);
        assert_eq!(
            serial.lines().pop().unwrap(),
            "{\"event\":\"ack\",\"cmd\":\"PROVISION_KEY\",\"keyVersion\":1}"
        );
        assert!(store.has_secret_key());
        assert_eq!(store.key_version(), 1);

        serial.push_line("SIGN_STATE deadbeef");
        proc.poll(&mut serial, &mut store, 0);
        let line = serial.lines().pop().unwrap();

        // Independently build the signed byte string, field by field.
        let mut msg = StdVec::new();
        msg.extend_from_slice(&UID);
        msg.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        msg.extend_from_slice(&2u32.to_le_bytes());
        msg.extend_from_slice(&1u16.to_le_bytes());
        msg.extend_from_slice(peer.as_bytes());
        let tag = hmac_sha256(&[0u8; SECRET_KEY_LEN], &msg);
        let mut tag_hex = StdString::new();
        for b in tag {
            tag_hex.push_str(&format!("{b:02X}"));
        }

        let expected = format!(
            "{{\"event\":\"SIGNED_STATE\",\"device_id\":\"A1B2C3D4E5F6010203040506\",\
             \"nonce\":\"DEADBEEF\",\"totalTapCount\":2,\"linkCount\":1,\"keyVersion\":1,\
             \"hmac\":\"{tag_hex}\"}}"
        );
        assert_eq!(line, expected);

        // Determinism: the same nonce yields the same tag.
        serial.push_line("SIGN_STATE deadbeef");
        proc.poll(&mut serial, &mut store, 0);
        assert_eq!(serial.lines().pop().unwrap(), expected);
    }

    #[test]
    fn sign_without_a_key_is_refused() {
        let line = roundtrip("SIGN_STATE deadbeef");
        assert_eq!(line, "{\"event\":\"error\",\"msg\":\"no_key\"}");
    }

    #[test]
    fn sign_with_a_bad_nonce_is_refused() {
        assert_eq!(
            roundtrip("SIGN_STATE abc"),
            "{\"event\":\"error\",\"msg\":\"invalid nonce\"}"
        );
        assert_eq!(
            roundtrip("SIGN_STATE zz"),
            "{\"event\":\"error\",\"msg\":\"invalid nonce hex\"}"
        );
    }

    #[test]
    fn unknown_commands_echo_the_token() {
        assert_eq!(
            roundtrip("FROB 1"),
            "{\"event\":\"error\",\"msg\":\"unknown command: FROB\"}"
        );
    }

    #[test]
    fn carriage_returns_and_blank_lines_are_ignored() {
        let (mut proc, mut store, mut serial) = setup();
        serial.rx.extend(b"\r\n\r\nGET_STATE\r\n".iter());
        proc.poll(&mut serial, &mut store, 0);
        assert_eq!(serial.lines().len(), 1);
    }

    #[test]
    fn overlong_lines_are_discarded_whole() {
        let (mut proc, mut store, mut serial) = setup();
        for _ in 0..(CMD_LINE_MAX + 50) {
            serial.rx.push_back(b'A');
        }
        serial.rx.push_back(b'\n');
        serial.push_line("HELLO");

        proc.poll(&mut serial, &mut store, 0);
        let lines = serial.lines();
        // Only the HELLO response; the garbage line produced nothing.
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"event\":\"hello\""));
    }
}
