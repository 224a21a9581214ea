//! Token estimation for usage reporting.

/// Counts tokens for usage accounting.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str, model: &str) -> u64;
}

/// Character-class heuristic: roughly four characters per token for Latin
/// text, one token per CJK character, and at least one token per word.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str, _model: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        let mut wide = 0u64;
        let mut narrow = 0u64;
        for c in text.chars() {
            if is_wide(c) {
                wide += 1;
            } else if !c.is_whitespace() {
                narrow += 1;
            }
        }
        let words = text.split_whitespace().count() as u64;
        wide + (narrow.div_ceil(4)).max(words.saturating_sub(wide))
    }
}

fn is_wide(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF // kana
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF // CJK unified ideographs
        | 0xAC00..=0xD7AF // hangul
        | 0xF900..=0xFAFF)
}
