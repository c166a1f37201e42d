//! Candidate text sanitisation shared by the ensemble and the resolver.

/// Length of a CAPTCHA issued by the login backend.
pub const CAPTCHA_LEN: usize = 4;

/// Upper bound kept from a single OCR read before voting.
pub const MAX_CANDIDATE_LEN: usize = 6;

/// Characters the recognizer is told to expect.
pub const CAPTCHA_VOCABULARY: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Keep only ASCII letters and digits.
pub fn sanitize(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_alphanumeric).collect()
}

/// Sanitise and keep at most `max` characters.
pub fn sanitize_truncated(raw: &str, max: usize) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .take(max)
        .collect()
}
