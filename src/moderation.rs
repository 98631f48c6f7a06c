use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use std::sync::LazyLock;

use crate::error::{AppError, Result};

const BLOCKED_WORDS: [&str; 7] = ["scam", "rugpull", "rug pull", "ponzi", "hack", "steal", "fraud"];

static BLOCKLIST: LazyLock<Option<AhoCorasick>> = LazyLock::new(|| {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .match_kind(MatchKind::LeftmostFirst)
        .build(BLOCKED_WORDS)
        .map_err(|e| log::error!("Failed to build moderation blocklist: {}", e))
        .ok()
});

/// First blocked word contained in `text`, matched case-insensitively as a
/// substring.
pub fn blocked_word(text: &str) -> Option<&'static str> {
    let matcher = BLOCKLIST.as_ref()?;
    matcher
        .find(text)
        .map(|m| BLOCKED_WORDS[m.pattern().as_usize()])
}

/// Rejects `text` with a validation error naming the blocked word.
pub fn check(text: &str) -> Result<()> {
    match blocked_word(text) {
        Some(word) => Err(AppError::validation(format!(
            "Blocked word detected: \"{}\"",
            word
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_text_passes() {
        assert!(check("A friendly trivia bot").is_ok());
        assert_eq!(blocked_word(""), None);
    }

    #[test]
    fn test_blocked_words_are_case_insensitive_substrings() {
        assert_eq!(blocked_word("Totally not a SCAM"), Some("scam"));
        assert_eq!(blocked_word("life hacks"), Some("hack"));
        assert_eq!(blocked_word("no rug pull here"), Some("rug pull"));
    }

    #[test]
    fn test_check_message() {
        let err = check("ponzi helper").unwrap_err();
        assert_eq!(err.message, "Blocked word detected: \"ponzi\"");
    }
}
