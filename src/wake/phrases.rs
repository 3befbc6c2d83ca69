//! Wake phrase matching on transcripts.
//!
//! The variant list is configuration: it includes the common ways a
//! transcriber mishears the wake phrase and is expected to be tuned against
//! real transcription output.

use crate::error::{Result, VoiceError};
use regex::Regex;

/// Separator allowed between the words of a phrase ("Hey, Razor").
const WORD_GAP: &str = r"[\s,.!?;:-]+";

/// Hesitations a transcriber may put before the wake phrase.
const FILLERS: &str = "um|uh|er|erm|hmm|oh|ok|okay|so|well";

/// A wake phrase found in a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseMatch {
    /// The configured variant that matched.
    pub pattern: String,
    /// Byte offset of the match start.
    pub start: usize,
    /// Text after the wake phrase, if any.
    pub command: Option<String>,
}

/// Compiled set of wake phrase variants.
#[derive(Debug, Clone)]
pub struct WakePhrases {
    variants: Vec<(String, Regex)>,
    any: Regex,
    leading: Regex,
}

impl WakePhrases {
    pub fn new<S: AsRef<str>>(phrases: &[S]) -> Result<Self> {
        let mut variants = Vec::new();
        let mut bodies = Vec::new();

        for phrase in phrases {
            let phrase = phrase.as_ref().trim();
            let words: Vec<String> = phrase.split_whitespace().map(regex::escape).collect();
            if words.is_empty() {
                return Err(VoiceError::WakePhrase {
                    phrase: phrase.to_string(),
                    message: "empty phrase".to_string(),
                });
            }
            let body = format!(r"\b{}\b", words.join(WORD_GAP));
            let regex = Regex::new(&format!("(?i){}", body)).map_err(|e| VoiceError::WakePhrase {
                phrase: phrase.to_string(),
                message: e.to_string(),
            })?;
            variants.push((phrase.to_lowercase(), regex));
            bodies.push(body);
        }

        if variants.is_empty() {
            return Err(VoiceError::WakePhrase {
                phrase: String::new(),
                message: "no wake phrases configured".to_string(),
            });
        }

        let any = Regex::new(&format!(r"(?i)(?:{})[\s,.!?;:-]*", bodies.join("|"))).map_err(
            |e| VoiceError::WakePhrase {
                phrase: String::new(),
                message: e.to_string(),
            },
        )?;

        let leading = Regex::new(&format!(
            r"(?i)^[\s,.!?;:-]*(?:(?:{}){})*(?:(?:{})[\s,.!?;:-]*)+",
            FILLERS,
            WORD_GAP,
            bodies.join("|")
        ))
        .map_err(|e| VoiceError::WakePhrase {
            phrase: String::new(),
            message: e.to_string(),
        })?;

        Ok(Self {
            variants,
            any,
            leading,
        })
    }

    /// Finds the earliest wake phrase in `text`.
    ///
    /// When two variants start at the same offset the longer one wins, so
    /// "hey razor" is preferred over a shorter overlapping variant.
    pub fn find(&self, text: &str) -> Option<PhraseMatch> {
        let (pattern, start, end) = self
            .variants
            .iter()
            .filter_map(|(pattern, regex)| {
                regex.find(text).map(|m| (pattern, m.start(), m.end()))
            })
            .min_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))?;

        let command = clean_command(&text[end..]);
        Some(PhraseMatch {
            pattern: pattern.clone(),
            start,
            command,
        })
    }

    pub fn contains(&self, text: &str) -> bool {
        self.any.is_match(text)
    }

    /// Removes the wake phrase that opens `text`, with any hesitation before
    /// it, and tidies the rest.
    ///
    /// Repeated leading phrases ("hey razor, hey razor, stop") all go. Wake
    /// words later in the text are command content and stay.
    pub fn strip(&self, text: &str) -> String {
        let rest = match self.leading.find(text) {
            Some(m) => &text[m.end()..],
            None => text,
        };
        clean_command(rest).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

/// Trims separators and collapses whitespace; `None` when nothing is left.
fn clean_command(text: &str) -> Option<String> {
    let trimmed = text.trim_start_matches(|c: char| c.is_whitespace() || ",.!?;:-".contains(c));
    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::WAKE_PHRASES;

    fn phrases() -> WakePhrases {
        WakePhrases::new(WAKE_PHRASES).unwrap()
    }

    #[test]
    fn test_finds_phrase_with_trailing_command() {
        let m = phrases().find("Hey Razor, what's my next meeting?").unwrap();
        assert_eq!(m.pattern, "hey razor");
        assert_eq!(m.start, 0);
        assert_eq!(m.command.as_deref(), Some("what's my next meeting?"));
    }

    #[test]
    fn test_matches_misheard_variants() {
        let p = phrases();
        assert_eq!(p.find("hey rosa call mom").unwrap().pattern, "hey rosa");
        assert_eq!(p.find("A razor. Check email").unwrap().pattern, "a razor");
        assert_eq!(
            p.find("hey laser").unwrap().command,
            None,
            "wake phrase alone has no command"
        );
    }

    #[test]
    fn test_earliest_match_wins() {
        let m = phrases()
            .find("um hey raiser set a timer hey razor")
            .unwrap();
        assert_eq!(m.pattern, "hey raiser");
        assert_eq!(m.command.as_deref(), Some("set a timer hey razor"));
    }

    #[test]
    fn test_requires_word_boundaries() {
        let p = phrases();
        assert!(p.find("they razored the budget").is_none());
        assert!(!p.contains("heyrazor"));
    }

    #[test]
    fn test_tolerates_punctuation_between_words() {
        let m = phrases().find("Hey, razor! turn it up").unwrap();
        assert_eq!(m.command.as_deref(), Some("turn it up"));
    }

    #[test]
    fn test_strip_removes_leading_phrase() {
        let p = phrases();
        assert_eq!(p.strip("Hey Razor, open the door"), "open the door");
        assert_eq!(p.strip("hey razor hey razer stop"), "stop");
        assert_eq!(p.strip("Um, hey razor. Lights off"), "Lights off");
        assert_eq!(p.strip("hey razor"), "");
        assert_eq!(p.strip("open the door"), "open the door");
    }

    #[test]
    fn test_strip_keeps_wake_words_inside_the_command() {
        let p = phrases();
        assert_eq!(p.strip("order a razor from amazon"), "order a razor from amazon");
        assert_eq!(p.strip("text hey rosa I'm late"), "text hey rosa I'm late");
        assert_eq!(p.strip("hey razor tell hey rosa hi"), "tell hey rosa hi");
    }

    #[test]
    fn test_filler_alone_is_not_stripped() {
        assert_eq!(phrases().strip("so what's next"), "so what's next");
    }

    #[test]
    fn test_custom_phrases_are_escaped() {
        let p = WakePhrases::new(&["ok c3po"]).unwrap();
        assert!(p.contains("OK C3PO what's up"));
        assert!(!p.contains("ok c3pox"));
    }

    #[test]
    fn test_empty_configuration_is_rejected() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            WakePhrases::new(&empty),
            Err(VoiceError::WakePhrase { .. })
        ));
        assert!(WakePhrases::new(&["   "]).is_err());
    }
}
