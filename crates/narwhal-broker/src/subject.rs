//! Subject pattern matching.
//!
//! Subjects are dot-separated tokens. In a pattern `*` matches exactly one
//! token and a trailing `>` matches one or more tokens.

use crate::error::BrokerError;

/// Whether `subject` matches `pattern`.
#[must_use]
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Checks that a published subject is concrete and well-formed.
///
/// # Errors
///
/// Returns `BrokerError::Invalid` for empty tokens or wildcards.
pub fn validate_subject(subject: &str) -> Result<(), BrokerError> {
    if subject.is_empty() {
        return Err(BrokerError::Invalid("empty subject".to_owned()));
    }
    for token in subject.split('.') {
        if token.is_empty() || token == "*" || token == ">" || token.contains(char::is_whitespace) {
            return Err(BrokerError::Invalid(format!("malformed subject: {subject}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_wildcard_matches_one_or_more_tokens() {
        assert!(matches("media.>", "media.movie.MediaCreated"));
        assert!(matches("media.>", "media.Movie"));
        assert!(!matches("media.>", "media"));
        assert!(!matches("media.>", "download.DownloadStarted"));
    }

    #[test]
    fn test_single_wildcard_matches_exactly_one_token() {
        assert!(matches("media.*.MediaCreated", "media.movie.MediaCreated"));
        assert!(!matches("media.*", "media.movie.MediaCreated"));
        assert!(matches("dlq.narwhal", "dlq.narwhal"));
        assert!(!matches("dlq.narwhal", "dlq.other"));
    }

    #[test]
    fn test_validate_subject_rejects_wildcards_and_empty_tokens() {
        assert!(validate_subject("media.movie.MediaCreated").is_ok());
        assert!(validate_subject("media..x").is_err());
        assert!(validate_subject("media.>").is_err());
        assert!(validate_subject("").is_err());
    }
}
