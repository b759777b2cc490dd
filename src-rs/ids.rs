use once_cell::sync::Lazy;
use regex::Regex;

// Ids end up in outbound URL paths, so anything that could change the path is refused.
static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_\-.:@$]{1,255}$").expect("identifier pattern is valid")
});

pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value) && value != "." && value != ".."
}

/// Trimmed, validated id from an optional request field.
pub fn clean_identifier(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|value| is_valid_identifier(value))
}
