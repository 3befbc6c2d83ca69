use crate::defaults;

/// Decides when captured command text is complete enough to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionPolicy {
    /// Word count at which a command counts as complete without punctuation.
    pub min_words: usize,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self {
            min_words: defaults::MIN_COMMAND_WORDS,
        }
    }
}

impl CompletionPolicy {
    pub fn new(min_words: usize) -> Self {
        Self { min_words }
    }

    /// Complete when the text ends in terminal punctuation or has at least
    /// `min_words` words.
    pub fn is_complete(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        if text.ends_with(['.', '?', '!']) {
            return true;
        }
        text.split_whitespace().count() >= self.min_words
    }
}
