#![no_std]

//! Build-time configuration shared by the firmware and the host tooling.

/// Length in bytes of a device unique identifier.
/// The MCU hardware UID is 96 bits, read out in big-endian order.
pub const DEVICE_UID_LEN: usize = 12;

/// Length of a device identifier rendered as hex (two chars per byte).
pub const DEVICE_UID_HEX_LEN: usize = 2 * DEVICE_UID_LEN;

/// Maximum number of peer links the persisted image can hold.
pub const MAX_LINKS: usize = 64;

/// Length in bytes of the provisioned per-device secret.
/// Matches the HMAC-SHA256 output length used for signed state reports.
pub const SECRET_KEY_LEN: usize = 32;

/// Maximum accepted length in bytes of a host-supplied signing nonce.
pub const NONCE_MAX_LEN: usize = 32;

/// Magic number at the start of the persisted image: "BOKA".
pub const STORAGE_MAGIC: u32 = 0x424F_4B41;

/// Persisted image schema version.
pub const STORAGE_VERSION: u16 = 1;

/// Size in bytes of the NVM region reserved for the persisted image.
/// The image container must fit inside this region.
pub const STORAGE_AREA_SIZE: usize = 2048;

/// Base byte address of the persisted image inside the NVM region.
pub const STORAGE_BASE_ADDR: usize = 0;

/// Delay before a dirty in-memory state is flushed to NVM.
/// Batches bursts of changes into one erase/write cycle; the underlying
/// pages are only good for ~10^4 cycles.
pub const STORAGE_COALESCE_MS: u32 = 30_000;

/// Minimum spacing between master-initiated commands on the tap link.
pub const COMMAND_INTERVAL_MS: u32 = 500;

/// How long the success pattern stays on the ready LED after a tap.
pub const SUCCESS_DISPLAY_MS: u32 = 3_000;

/// Delay before the success tone after an ID exchange completes.
/// The exchange itself finishes faster than the ear can follow.
pub const SUCCESS_TONE_DELAY_MS: u32 = 150;

/// Battery builds: pause after a torn-down connection before the link
/// re-arms for the next tap.
pub const DISCONNECT_COOLDOWN_MS: u32 = 500;

/// Maximum accepted length of one serial command line, terminator included.
/// Longer lines are discarded whole.
pub const CMD_LINE_MAX: usize = 256;

/// Firmware version reported by `HELLO`.
pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build timestamp reported by `HELLO`, injected by the build environment.
pub const FW_BUILD: &str = match option_env!("BOKAKA_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// Build hash reported by `HELLO`, injected by the build environment.
pub const FW_BUILD_HASH: &str = match option_env!("BOKAKA_BUILD_HASH") {
    Some(hash) => hash,
    None => "dev",
};

/// Status LED 0: device readiness / handshake progress.
pub const STATUS_LED0_PIN: u8 = 5;

/// Status LED 1: negotiated role indication.
pub const STATUS_LED1_PIN: u8 = 6;

/// Open-drain tap link line.
pub const TAP_LINK_PIN: u8 = 9;

/// Passive piezo buzzer (HS-F02A, resonant around 2.7 kHz).
pub const BUZZER_PIN: u8 = 10;
