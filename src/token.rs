use once_cell::sync::Lazy;
use tiktoken_rs::{CoreBPE, cl100k_base};

/// Shared BPE instance; construction parses the embedded rank table once.
static BPE: Lazy<CoreBPE> = Lazy::new(|| cl100k_base().expect("embedded cl100k_base ranks"));

/// Deterministic model-token counter.
///
/// Uses the `cl100k_base` tokenizer family so chunk sizing agrees with how
/// the downstream LLM accounts tokens. Counting is pure: identical input
/// always yields an identical count, and empty input counts 0.
///
/// Concatenation bound: `count(a) + count(b) - count(a ∥ b) <= 1` for any
/// split point, since at most one BPE merge can span the seam.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter;

impl TokenCounter {
    pub fn new() -> Self {
        Self
    }

    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        BPE.encode_ordinary(text).len()
    }

    /// The text of the last `n` tokens of `text`, token-aligned.
    ///
    /// Used for the overlap tail carried between chunks. If the token slice
    /// does not decode back to valid UTF-8 (possible when a multi-byte
    /// scalar spans the cut), the cut is widened one token at a time until
    /// it does.
    pub fn tail(&self, text: &str, n: usize) -> String {
        if n == 0 || text.is_empty() {
            return String::new();
        }

        let ids = BPE.encode_ordinary(text);
        if ids.len() <= n {
            return text.to_string();
        }

        let mut start = ids.len() - n;
        while start > 0 {
            if let Ok(decoded) = BPE.decode(ids[start..].to_vec()) {
                return decoded;
            }
            start -= 1;
        }
        text.to_string()
    }

    /// Split `text` so the first piece holds at most `n` tokens. Never cuts
    /// inside a token. Returns `None` when the text already fits.
    pub fn split_at(&self, text: &str, n: usize) -> Option<(String, String)> {
        let ids = BPE.encode_ordinary(text);
        if ids.len() <= n || n == 0 {
            return None;
        }

        let mut cut = n;
        while cut > 0 {
            if let (Ok(head), Ok(rest)) = (
                BPE.decode(ids[..cut].to_vec()),
                BPE.decode(ids[cut..].to_vec()),
            ) {
                return Some((head, rest));
            }
            cut -= 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_counts_zero() {
        assert_eq!(TokenCounter::new().count(""), 0);
    }

    #[test]
    fn test_count_is_deterministic() {
        let counter = TokenCounter::new();
        let text = "The quick brown fox jumps over the lazy dog.";
        assert_eq!(counter.count(text), counter.count(text));
        assert!(counter.count(text) > 0);
    }

    #[test]
    fn test_concatenation_bound() {
        let counter = TokenCounter::new();
        let a = "A sentence that ends mid";
        let b = "stream and keeps going for a while.";
        let separate = counter.count(a) + counter.count(b);
        let joined = counter.count(&format!("{}{}", a, b));
        assert!(separate >= joined);
        assert!(separate - joined <= 1, "merge effect exceeded bound");
    }

    #[test]
    fn test_tail_is_token_aligned_suffix() {
        let counter = TokenCounter::new();
        let text = "One two three four five six seven eight nine ten.";
        let tail = counter.tail(text, 3);
        assert!(text.ends_with(&tail));
        assert!(counter.count(&tail) <= 3);
        assert!(!tail.is_empty());
    }

    #[test]
    fn test_tail_of_short_text_is_whole_text() {
        let counter = TokenCounter::new();
        assert_eq!(counter.tail("hi", 250), "hi");
    }

    #[test]
    fn test_tail_zero_is_empty() {
        assert_eq!(TokenCounter::new().tail("hello world", 0), "");
    }

    #[test]
    fn test_split_at_respects_budget() {
        let counter = TokenCounter::new();
        let text = "word ".repeat(200);
        let (head, rest) = counter.split_at(&text, 50).expect("should split");
        assert!(counter.count(&head) <= 50);
        assert_eq!(format!("{}{}", head, rest), text);
    }

    #[test]
    fn test_split_at_none_when_fits() {
        let counter = TokenCounter::new();
        assert!(counter.split_at("short", 100).is_none());
    }

    #[test]
    fn test_unicode_round_trip() {
        let counter = TokenCounter::new();
        let text = "日本語のテスト文章です。これは二番目の文です。";
        let tail = counter.tail(text, 5);
        assert!(text.ends_with(&tail));
        assert!(counter.count(text) > 0);
    }
}
