use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::{errors::Error, Result};

// ============== Hashing ==============

/// Hex-encoded SHA-256 of `bytes`, truncated to `len` characters.
pub fn sha256_hex_prefix(bytes: &[u8], len: usize) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    let digest = h.finalize();
    hex_prefix(&digest, len)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(len);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
        if out.len() >= len {
            out.truncate(len);
            break;
        }
    }
    out
}

// ============== Jitter ==============

/// Uniform random delay in `[0, max]`.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis().min(u128::from(u64::MAX)) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

// ============== Phone Numbers ==============

const MIN_PHONE_DIGITS: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;

pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Normalize a destination or pairing phone number to bare digits.
///
/// With `legacy_br` set, Brazilian mobile numbers are rewritten to the older
/// 8-digit subscriber format some accounts are still registered under.
pub fn normalize_phone(raw: &str, legacy_br: bool) -> Result<String> {
    let digits = digits_only(raw);
    if digits.len() < MIN_PHONE_DIGITS || digits.len() > MAX_PHONE_DIGITS {
        return Err(Error::InvalidInput(format!(
            "phone number must have {MIN_PHONE_DIGITS}-{MAX_PHONE_DIGITS} digits, got {raw:?}"
        )));
    }
    if legacy_br {
        return Ok(legacy_br_number(&digits));
    }
    Ok(digits)
}

/// Rewrite a Brazilian number to its 10-digit national form: area code +
/// 8-digit subscriber, without the `55` country code.
///
/// - strips a leading `55` country code
/// - 11 digits (area + 9 + 8): drops the mobile ninth digit
/// - 9 digits (9 + 8, no area): assumes area code 11 and drops the ninth digit
/// - 8 digits (no area): assumes area code 11
///
/// Anything that does not end up as 10 national digits is returned unchanged.
pub fn legacy_br_number(digits: &str) -> String {
    let national = digits.strip_prefix("55").unwrap_or(digits);
    match national.len() {
        11 => format!("{}{}", &national[..2], &national[3..]),
        10 => national.to_string(),
        9 => format!("11{}", &national[1..]),
        8 => format!("11{national}"),
        _ => digits.to_string(),
    }
}
