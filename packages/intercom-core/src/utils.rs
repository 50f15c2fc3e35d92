//! General utilities shared across the application.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::MAX_ROOM_LEN;

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Validates a room name: non-empty, lowercase, at most 31 bytes.
pub fn valid_room_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ROOM_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

/// Validates a chime name: `[a-z0-9_-]+`.
pub fn valid_chime_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_names_are_lowercase_and_bounded() {
        assert!(valid_room_name("kitchen"));
        assert!(valid_room_name("guest-room_2"));
        assert!(!valid_room_name("Kitchen"));
        assert!(!valid_room_name(""));
        assert!(!valid_room_name(&"x".repeat(MAX_ROOM_LEN + 1)));
        assert!(valid_room_name(&"x".repeat(MAX_ROOM_LEN)));
    }

    #[test]
    fn chime_names_match_the_allowed_alphabet() {
        assert!(valid_chime_name("doorbell"));
        assert!(valid_chime_name("two_tone-1"));
        assert!(!valid_chime_name("Door Bell"));
        assert!(!valid_chime_name("chime.wav"));
        assert!(!valid_chime_name(""));
    }
}
