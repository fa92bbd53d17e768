//! Steam identifier handling.
//!
//! The message API and the roster site disagree on id formats: the API may
//! return Steam3 short forms (`[U:1:33844719]`), bare account ids, or full
//! Steam64 strings. Everything downstream joins on Steam64.

/// Offset between a Steam account id and its 64-bit form.
pub const STEAM64_BASE: i64 = 76_561_197_960_265_728;

/// True when `s` is a bare Steam64: exactly 17 ASCII digits at or above the
/// base offset.
pub fn is_steamid64(s: &str) -> bool {
    let t = s.trim();
    t.len() == 17
        && t.bytes().all(|b| b.is_ascii_digit())
        && t.parse::<i64>().map(|v| v >= STEAM64_BASE).unwrap_or(false)
}

/// Convert any id string to Steam64.
///
/// A string that already is a Steam64 is returned as-is. Otherwise the last
/// run of digits is taken as the account id and added to [`STEAM64_BASE`]
/// (covers `[U:1:N]`, `U:1:N` and bare `N`). Returns `None` when the string
/// holds no digits or the value does not fit; callers treat that as "unknown
/// identifier" and skip the record.
pub fn steamid64_from_any(s: &str) -> Option<i64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if is_steamid64(t) {
        return t.parse().ok();
    }
    let account: i64 = last_digit_run(t)?.parse().ok()?;
    STEAM64_BASE.checked_add(account)
}

fn last_digit_run(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let mut end = bytes.len();
    while end > 0 && !bytes[end - 1].is_ascii_digit() {
        end -= 1;
    }
    if end == 0 {
        return None;
    }
    let mut start = end;
    while start > 0 && bytes[start - 1].is_ascii_digit() {
        start -= 1;
    }
    Some(&s[start..end])
}
