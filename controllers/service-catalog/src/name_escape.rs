//! Store-legal names for broker-chosen identifiers.
//!
//! Broker external IDs are arbitrary strings. Object names may only contain
//! lowercase alphanumerics, `-` and `.`, must start and end with an
//! alphanumeric, and are capped at [`MAX_NAME_LENGTH`] characters.
//!
//! Every other byte is written as `zXXz` with `XX` the lowercase hex of the
//! byte; `z` itself becomes `z7az` so the mapping stays injective.

use sha2::{Digest, Sha224, Sha256};

/// Longest name the escaper produces
pub const MAX_NAME_LENGTH: usize = 63;

/// Hex characters of the checksum appended to truncated names
const CHECKSUM_LENGTH: usize = 16;

fn escape_byte(out: &mut String, byte: u8) {
    out.push_str(&format!("z{byte:02x}z"));
}

/// Escape `id` into a valid object name
pub fn escape_name(id: &str) -> String {
    let bytes = id.as_bytes();
    let last = bytes.len().saturating_sub(1);
    let mut escaped = String::with_capacity(bytes.len());

    for (i, &b) in bytes.iter().enumerate() {
        let edge = i == 0 || i == last;
        match b {
            b'z' => escape_byte(&mut escaped, b),
            b'a'..=b'y' | b'0'..=b'9' => escaped.push(char::from(b)),
            b'-' | b'.' if !edge => escaped.push(char::from(b)),
            _ => escape_byte(&mut escaped, b),
        }
    }

    if escaped.len() <= MAX_NAME_LENGTH {
        return escaped;
    }

    let digest = Sha256::digest(escaped.as_bytes());
    let checksum: String = digest.iter().map(|b| format!("{b:02x}")).take(CHECKSUM_LENGTH / 2).collect();
    // Escaped output is ASCII, so byte slicing is safe
    let keep = MAX_NAME_LENGTH - CHECKSUM_LENGTH - 1;
    let prefix = escaped[..keep].trim_end_matches(['-', '.']);
    format!("{prefix}-{checksum}")
}

/// Label-safe hash of `value`, used to index classes and plans by broker,
/// external ID and external name
pub fn label_sha(value: &str) -> String {
    Sha224::digest(value.as_bytes()).iter().map(|b| format!("{b:02x}")).collect()
}
