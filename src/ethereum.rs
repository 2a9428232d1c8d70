//! Address normalization and log topic decoding.
//!
//! Account-model addresses are normalized to lowercase `0x`-prefixed hex. Log topics are
//! 32-byte words; an address stored in a topic is left-padded with 12 zero bytes.

use crate::schemas::Chain;
use alloy_primitives::{hex, Address, B256};
use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

/// Regex pattern for Ethereum addresses (case-insensitive)
static ETH_ADDRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)0x[a-f0-9]{40}$").expect("Invalid regex pattern")
});

/// Regex pattern for 32-byte event signatures (topic0)
static EVENT_SIGNATURE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)0x[a-f0-9]{64}$").expect("Invalid regex pattern")
});

/// Hex length of a topic: `0x` plus 64 nibbles
const TOPIC_HEX_LEN: usize = 66;

/// Number of zero bytes that pad an address up to a 32-byte word
const ADDRESS_PADDING_BYTES: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address format: {0}")]
    InvalidFormat(String),

    #[error("Address is empty")]
    Empty,

    #[error("Invalid event signature: {0}")]
    InvalidSignature(String),
}

/// Normalize a user- or file-supplied address for `chain`.
///
/// EVM chains: `0x` + 40 hex chars (prefix added when missing), lowercased.
/// UTXO chains: trimmed only, since their encodings are case-sensitive.
pub fn normalize_address(input: &str, chain: Chain) -> Result<String, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }

    if chain.is_utxo() {
        return Ok(trimmed.to_string());
    }

    let prefixed = if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
        format!("0x{}", &trimmed[2..])
    } else {
        format!("0x{}", trimmed)
    };

    if !ETH_ADDRESS_PATTERN.is_match(&prefixed) {
        return Err(AddressError::InvalidFormat(input.to_string()));
    }

    Ok(prefixed.to_lowercase())
}

/// Normalize an event signature hash (topic0) to lowercase `0x` + 64 hex.
pub fn normalize_event_signature(input: &str) -> Result<String, AddressError> {
    let trimmed = input.trim();
    if !EVENT_SIGNATURE_PATTERN.is_match(trimmed) {
        return Err(AddressError::InvalidSignature(input.to_string()));
    }
    Ok(trimmed.to_lowercase())
}

/// Lowercase a hex field (hash, topic) read from a record file; empty means absent.
pub fn clean_hex_field(field: Option<&str>) -> Option<String> {
    field
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
}

/// Lowercase an account-model address field read from a record file; empty means absent.
pub fn clean_address_field(field: Option<&str>) -> Option<String> {
    clean_hex_field(field)
}

/// Check if address is the zero address
pub fn is_zero_address(address: &str) -> bool {
    Address::from_str(address).map(|a| a.is_zero()).unwrap_or(false)
}

/// Decode the address stored in a 32-byte log topic.
///
/// Returns the lowercase address iff the topic is `0x` + 64 hex chars and its upper
/// 12 bytes are zero. Anything else, including short or malformed input, is `None`.
pub fn decode_topic_address(topic: &str) -> Option<String> {
    if topic.len() != TOPIC_HEX_LEN || !(topic.starts_with("0x") || topic.starts_with("0X")) {
        return None;
    }

    let word = B256::from_str(&topic[2..]).ok()?;
    if word[..ADDRESS_PADDING_BYTES].iter().any(|b| *b != 0) {
        return None;
    }

    Some(format!("0x{}", hex::encode(&word[ADDRESS_PADDING_BYTES..])))
}
