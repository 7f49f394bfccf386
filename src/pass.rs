//! Comparison rules for secret passes.

/// Character participants may put in front of a pass, as in `!mypass`.
const MARKER: char = '!';

/// Bring a pass into the form used for comparisons: without a leading marker, without any
/// whitespace and lowercased.
pub fn normalize(pass: &str) -> String {
    let trimmed = pass.trim();
    let trimmed = trimmed.strip_prefix(MARKER).unwrap_or(trimmed);

    trimmed
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Whether a message matches the pass of an event.
pub fn matches(message: &str, pass: &str) -> bool {
    let message = normalize(message);
    !message.is_empty() && message == normalize(pass)
}
