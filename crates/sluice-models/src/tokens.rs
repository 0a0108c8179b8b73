//! Approximate token counting.
//!
//! The gateway never sees the backend's tokenizer, so context budgets are
//! computed from a cheap estimate: every whitespace-separated word costs one
//! token per four characters, rounded up, and at least one token.

/// Average number of characters per token for English text.
const CHARS_PER_TOKEN: usize = 4;

/// Estimates the number of tokens in `text`.
///
/// Deterministic and allocation free. Empty or whitespace-only text counts as 0.
pub fn count_tokens(text: &str) -> u32 {
    text.split_whitespace()
        .map(|word| word.chars().count().div_ceil(CHARS_PER_TOKEN).max(1))
        .sum::<usize>()
        .try_into()
        .unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_is_zero() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("   \n\t "), 0);
    }

    #[test]
    fn test_short_words_cost_one_token() {
        assert_eq!(count_tokens("a b c"), 3);
    }

    #[test]
    fn test_long_words_are_split() {
        // "machine" = 7 chars -> 2, "learning?" = 9 chars -> 3
        assert_eq!(count_tokens("What is machine learning?"), 1 + 1 + 2 + 3);
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        assert_eq!(count_tokens("héllo"), 2);
    }

    #[test]
    fn test_deterministic() {
        let text = "The quick brown fox jumps over the lazy dog";
        assert_eq!(count_tokens(text), count_tokens(text));
    }
}
