//! Stratum v1 wire types.
//!
//! Line-framed JSON-RPC, newline-terminated UTF-8. Requests carry an id
//! the server echoes; notifications go out with a null id. Error results
//! are the conventional three-element tuple `[code, message, null]`.

pub mod fast;

use bitcoin::hash_types::BlockHash;
use bitcoin::hashes::Hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ERR_OTHER: i64 = 20;
pub const ERR_JOB_NOT_FOUND: i64 = 21;
pub const ERR_DUPLICATE: i64 = 22;
pub const ERR_LOW_DIFFICULTY: i64 = 23;
pub const ERR_UNAUTHORIZED: i64 = 24;

/// Longest `client.show_message` text we will send.
pub const MAX_SHOW_MESSAGE_LEN: usize = 512;

/// An incoming JSON-RPC request line.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// An outgoing response. Field order matters to the fast-path parity
/// tests, hence a struct rather than a `json!` map.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: Value::Null,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: serde_json::json!([code, message.into(), Value::Null]),
        }
    }

    pub fn to_line(&self) -> String {
        // SAFETY: a struct of plain JSON values always serialises.
        serde_json::to_string(self).expect("response serialisation cannot fail")
    }
}

/// An outgoing notification (`mining.notify`, `mining.set_difficulty`, ...).
#[derive(Debug, Clone, Serialize)]
struct Notification<'a> {
    id: Value,
    method: &'a str,
    params: Value,
}

pub fn notification(method: &str, params: Value) -> String {
    let frame = Notification {
        id: Value::Null,
        method,
        params,
    };
    // SAFETY: a struct of plain JSON values always serialises.
    serde_json::to_string(&frame).expect("notification serialisation cannot fail")
}

/// Big-endian hex of a u32's little-endian on-wire bytes, as used for the
/// header `version`/`nbits`/`ntime`/`nonce` fields.
pub fn be_hex_u32(value: u32) -> String {
    format!("{:08x}", value)
}

/// The previous-block hash in Stratum's peculiar order: the 32 internal
/// bytes taken as eight 32-bit words, each word hex-encoded big-endian.
pub fn prevhash_hex(hash: &BlockHash) -> String {
    let bytes = hash.to_byte_array();
    let mut out = String::with_capacity(64);
    for chunk in bytes.chunks(4) {
        for byte in chunk.iter().rev() {
            out.push_str(&format!("{:02x}", byte));
        }
    }
    out
}

/// Parse a hex field produced by `prevhash_hex` back to a block hash.
pub fn prevhash_from_hex(hex_str: &str) -> Option<BlockHash> {
    let raw = hex::decode(hex_str).ok()?;
    if raw.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in raw.chunks(4).enumerate() {
        for (j, byte) in chunk.iter().rev().enumerate() {
            bytes[i * 4 + j] = *byte;
        }
    }
    Some(BlockHash::from_byte_array(bytes))
}

/// Format with six significant digits, the way C's `%.6g` renders the
/// difficulties in reject messages: plain decimal in a sane range,
/// exponent notation outside it, trailing zeros trimmed.
pub fn format_sig6(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }

    let exponent = value.abs().log10().floor() as i32;
    if (-4..6).contains(&exponent) {
        let decimals = (5 - exponent).max(0) as usize;
        let s = format!("{:.*}", decimals, value);
        let trimmed = s.trim_end_matches('0').trim_end_matches('.');
        trimmed.to_string()
    } else {
        let s = format!("{:.5e}", value);
        // Rust renders "1.23000e7"; trim the mantissa and pad the
        // exponent to the conventional two digits with a sign.
        let (mantissa, exp) = s.split_once('e').unwrap_or((s.as_str(), "0"));
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        let exp_val: i32 = exp.parse().unwrap_or(0);
        let sign = if exp_val < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp_val.abs())
    }
}
