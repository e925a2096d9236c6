//! Recipient phone validation.

use regex::Regex;
use std::sync::OnceLock;

fn e164_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("valid E.164 pattern"))
}

/// Strict E.164 check: `+` then 2-15 digits, no leading zero.
pub fn is_valid_e164(phone: &str) -> bool {
    e164_pattern().is_match(phone)
}
