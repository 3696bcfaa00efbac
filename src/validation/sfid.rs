//! Salesforce record id validation.
//!
//! Ids are 15 case-sensitive characters, or 18 characters where the last
//! three encode the case of the first fifteen.

/// Returns true if `input` is a well-formed 15 or 18 character id.
///
/// An 18-character id must carry the correct case-checksum suffix.
pub fn is_valid_id(input: &str) -> bool {
    if !input.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return false;
    }

    match input.len() {
        15 => true,
        18 => checksum_suffix(&input[..15]) == input[15..],
        _ => false,
    }
}

/// Converts a 15-character id to its 18-character form.
///
/// Returns `None` if `input` is not a valid id. 18-character ids are
/// returned unchanged.
pub fn to_18(input: &str) -> Option<String> {
    if !is_valid_id(input) {
        return None;
    }
    if input.len() == 18 {
        return Some(input.to_string());
    }
    Some(format!("{}{}", input, checksum_suffix(input)))
}

/// Computes the 3-character suffix for a 15-character id.
///
/// Each 5-character chunk contributes one character: bit `i` is set when
/// character `i` is uppercase, and the 5-bit value indexes `A-Z0-5`.
fn checksum_suffix(id15: &str) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ012345";

    id15.as_bytes()
        .chunks(5)
        .map(|chunk| {
            let bits = chunk
                .iter()
                .enumerate()
                .filter(|(_, b)| b.is_ascii_uppercase())
                .fold(0usize, |acc, (i, _)| acc | (1 << i));
            ALPHABET[bits] as char
        })
        .collect()
}
