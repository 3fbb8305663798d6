//! Token estimation for compression decisions.
//!
//! Deliberately not tied to any model's tokenizer: the proxy only needs a
//! stable, deterministic approximation to compare against configured
//! thresholds. Four characters per token is the usual rule of thumb for
//! English-heavy tool output.

/// Estimate the token count of `text`, rounding up.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count().div_ceil(4)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn counts_chars_not_bytes() {
        // Four multi-byte characters are still one token.
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn deterministic() {
        let body = "x".repeat(4096);
        assert_eq!(estimate_tokens(&body), estimate_tokens(&body));
        assert_eq!(estimate_tokens(&body), 1024);
    }
}
