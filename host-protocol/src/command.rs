// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host command grammar.
//!
//! Commands are whitespace-separated ASCII tokens on one line. The command
//! word is case-insensitive; arguments are positional.

use consts::{NONCE_MAX_LEN, SECRET_KEY_LEN};
use heapless::{String, Vec};

/// A parsed host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Hello,
    GetState,
    Clear,
    Dump {
        offset: u16,
        count: u16,
    },
    ProvisionKey {
        version: u8,
        key: [u8; SECRET_KEY_LEN],
    },
    SignState {
        nonce: Vec<u8, NONCE_MAX_LEN>,
    },
}

/// Why a line failed to parse. `message` carries the exact text the device
/// reports back in its `error` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Invalid(&'static str),
    UnknownCommand(String<32>),
}

impl ParseError {
    fn invalid(msg: &'static str) -> Self {
        ParseError::Invalid(msg)
    }
}

/// Default `DUMP` window when the host omits the arguments.
const DUMP_DEFAULT_COUNT: u16 = 10;

impl Command {
    /// Parse one command line. The caller strips the terminator and skips
    /// blank lines; `line` is expected to hold at least one token.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut tokens = line.split_ascii_whitespace();
        let cmd = tokens.next().ok_or(ParseError::invalid("empty command"))?;

        if cmd.eq_ignore_ascii_case("HELLO") {
            Ok(Command::Hello)
        } else if cmd.eq_ignore_ascii_case("GET_STATE") {
            Ok(Command::GetState)
        } else if cmd.eq_ignore_ascii_case("CLEAR") {
            Ok(Command::Clear)
        } else if cmd.eq_ignore_ascii_case("DUMP") {
            parse_dump(tokens.next(), tokens.next())
        } else if cmd.eq_ignore_ascii_case("PROVISION_KEY") {
            parse_provision_key(tokens.next(), tokens.next())
        } else if cmd.eq_ignore_ascii_case("SIGN_STATE") {
            parse_sign_state(tokens.next())
        } else {
            let mut token = String::new();
            for c in cmd.chars() {
                if token.push(c).is_err() {
                    break;
                }
            }
            Err(ParseError::UnknownCommand(token))
        }
    }
}

fn parse_dump(offset: Option<&str>, count: Option<&str>) -> Result<Command, ParseError> {
    let offset = match offset {
        Some(tok) => tok
            .parse::<u16>()
            .map_err(|_| ParseError::invalid("DUMP args"))?,
        None => 0,
    };
    let count = match count {
        Some(tok) => tok
            .parse::<u16>()
            .map_err(|_| ParseError::invalid("DUMP args"))?,
        None => DUMP_DEFAULT_COUNT,
    };
    Ok(Command::Dump { offset, count })
}

fn parse_provision_key(
    version: Option<&str>,
    key_hex: Option<&str>,
) -> Result<Command, ParseError> {
    let (Some(version), Some(key_hex)) = (version, key_hex) else {
        return Err(ParseError::invalid("PROVISION_KEY args"));
    };

    let version = version
        .parse::<u8>()
        .ok()
        .filter(|&v| v != 0)
        .ok_or(ParseError::invalid("invalid keyVersion"))?;

    let mut key = [0u8; SECRET_KEY_LEN];
    hex::decode_to_slice(key_hex, &mut key)
        .map_err(|_| ParseError::invalid("invalid key hex"))?;

    Ok(Command::ProvisionKey { version, key })
}

fn parse_sign_state(nonce_hex: Option<&str>) -> Result<Command, ParseError> {
    let Some(nonce_hex) = nonce_hex else {
        return Err(ParseError::invalid("SIGN_STATE args"));
    };

    // The nonce is variable length: 1..=32 bytes, so 2..=64 hex chars.
    if nonce_hex.is_empty() || nonce_hex.len() % 2 != 0 || nonce_hex.len() > 2 * NONCE_MAX_LEN {
        return Err(ParseError::invalid("invalid nonce"));
    }

    let mut buf = [0u8; NONCE_MAX_LEN];
    let len = nonce_hex.len() / 2;
    hex::decode_to_slice(nonce_hex, &mut buf[..len])
        .map_err(|_| ParseError::invalid("invalid nonce hex"))?;

    let mut nonce = Vec::new();
    // Cannot overflow: len <= NONCE_MAX_LEN.
    let _ = nonce.extend_from_slice(&buf[..len]);
    Ok(Command::SignState { nonce })
}
