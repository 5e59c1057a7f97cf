// SPDX-FileCopyrightText: 2025 Bokaka Project
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host-side companion for the badge serial protocol.
//!
//! Feed it a capture of the device's JSON output (a `SIGNED_STATE`
//! response plus the `DUMP` pages covering the recorded links) and it
//! re-derives the HMAC with the same code the firmware links, so a tag
//! mismatch means the transcript or the key is wrong, never a layout
//! disagreement.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use consts::{DEVICE_UID_LEN, NONCE_MAX_LEN, SECRET_KEY_LEN};
use host_protocol::sign::{encode_signed_state, hmac_sha256, SIGNED_MSG_MAX};
use serde::Deserialize;

#[derive(clap::Parser)]
#[command(name = "bokaka-host", about = "Verify and derive badge state signatures")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Verify a SIGNED_STATE response against a captured transcript.
    Verify {
        /// The provisioned secret, 64 hex chars.
        #[clap(long)]
        key: String,
        /// Transcript file; stdin when omitted.
        #[clap(short, long)]
        input: Option<PathBuf>,
    },
    /// Compute the expected tag for explicitly given state.
    Tag {
        /// The provisioned secret, 64 hex chars.
        #[clap(long)]
        key: String,
        /// Device identifier, 24 hex chars.
        #[clap(long)]
        device_id: String,
        /// Host nonce, 2..=64 hex chars.
        #[clap(long)]
        nonce: String,
        /// Total tap count.
        #[clap(long)]
        tap_count: u32,
        /// Recorded peers in table order, 24 hex chars each.
        #[clap(long = "peer")]
        peers: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct SignedStateLine {
    device_id: String,
    nonce: String,
    #[serde(rename = "totalTapCount")]
    total_tap_count: u32,
    #[serde(rename = "linkCount")]
    link_count: u16,
    hmac: String,
}

#[derive(Debug, Deserialize)]
struct LinksLine {
    items: Vec<LinkItem>,
}

#[derive(Debug, Deserialize)]
struct LinkItem {
    peer: String,
}

fn main() -> Result<()> {
    let args = <Args as clap::Parser>::parse();
    match args.command {
        Command::Verify { key, input } => {
            let transcript = read_input(input)?;
            let report = verify_transcript(&key, &transcript)?;
            println!("{report}");
            Ok(())
        }
        Command::Tag { key, device_id, nonce, tap_count, peers } => {
            let tag = derive_tag(&key, &device_id, &nonce, tap_count, &peers)?;
            println!("{tag}");
            Ok(())
        }
    }
}

fn read_input(input: Option<PathBuf>) -> Result<String> {
    match input {
        Some(path) => {
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        }
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
            Ok(buf)
        }
    }
}

fn parse_key(key: &str) -> Result<[u8; SECRET_KEY_LEN]> {
    let mut out = [0u8; SECRET_KEY_LEN];
    hex::decode_to_slice(key, &mut out).context("key must be 64 hex chars")?;
    Ok(out)
}

fn parse_id(id: &str) -> Result<[u8; DEVICE_UID_LEN]> {
    let mut out = [0u8; DEVICE_UID_LEN];
    hex::decode_to_slice(id, &mut out).context("identifier must be 24 hex chars")?;
    Ok(out)
}

fn parse_nonce(nonce: &str) -> Result<Vec<u8>> {
    if nonce.is_empty() || nonce.len() % 2 != 0 || nonce.len() > 2 * NONCE_MAX_LEN {
        bail!("nonce must be 2..=64 hex chars");
    }
    hex::decode(nonce).context("nonce must be hex")
}

fn compute_tag(
    key: &[u8; SECRET_KEY_LEN],
    device_id: &[u8; DEVICE_UID_LEN],
    nonce: &[u8],
    tap_count: u32,
    links: &[[u8; DEVICE_UID_LEN]],
) -> String {
    let mut msg = [0u8; SIGNED_MSG_MAX];
    let len = encode_signed_state(device_id, nonce, tap_count, links, &mut msg);
    let tag = hmac_sha256(key, &msg[..len]);
    hex::encode_upper(tag)
}

/// Pull the SIGNED_STATE line and the link pages out of a transcript and
/// recompute the tag.
fn verify_transcript(key: &str, transcript: &str) -> Result<String> {
    let key = parse_key(key)?;

    let mut signed: Option<SignedStateLine> = None;
    let mut links: Vec<[u8; DEVICE_UID_LEN]> = Vec::new();

    for line in transcript.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value =
            serde_json::from_str(line).with_context(|| format!("bad JSON line: {line}"))?;
        match value.get("event").and_then(|e| e.as_str()) {
            Some("SIGNED_STATE") => {
                signed = Some(serde_json::from_value(value).context("bad SIGNED_STATE line")?);
            }
            Some("links") => {
                let page: LinksLine =
                    serde_json::from_value(value).context("bad links line")?;
                for item in page.items {
                    links.push(parse_id(&item.peer)?);
                }
            }
            _ => {}
        }
    }

    let Some(signed) = signed else {
        bail!("transcript contains no SIGNED_STATE response");
    };
    if links.len() != signed.link_count as usize {
        bail!(
            "transcript carries {} links but the signed state covers {}",
            links.len(),
            signed.link_count
        );
    }

    let device_id = parse_id(&signed.device_id)?;
    let nonce = parse_nonce(&signed.nonce)?;
    let expected = compute_tag(&key, &device_id, &nonce, signed.total_tap_count, &links);

    if !expected.eq_ignore_ascii_case(&signed.hmac) {
        bail!("signature mismatch: expected {expected}, device sent {}", signed.hmac);
    }
    Ok(format!("OK {expected}"))
}

fn derive_tag(
    key: &str,
    device_id: &str,
    nonce: &str,
    tap_count: u32,
    peers: &[String],
) -> Result<String> {
    let key = parse_key(key)?;
    let device_id = parse_id(device_id)?;
    let nonce = parse_nonce(nonce)?;
    let links = peers
        .iter()
        .map(|p| parse_id(p))
        .collect::<Result<Vec<_>>>()?;
    Ok(compute_tag(&key, &device_id, &nonce, tap_count, &links))
}
