//! Classification of free-text operator messages.

use std::sync::LazyLock;

use regex::Regex;

const PAUSE_WORDS: [&str; 3] = ["pause", "stop", "hold"];
const RESUME_WORDS: [&str; 3] = ["resume", "continue", "unpause"];

/// Leading phrases that mark a message as a question.
const QUESTION_PHRASES: [&str; 26] = [
    "what",
    "why",
    "how",
    "when",
    "where",
    "who",
    "which",
    "is",
    "are",
    "am i",
    "was",
    "were",
    "did",
    "does",
    "do you",
    "can you",
    "could you",
    "would you",
    "will you",
    "have you",
    "has",
    "should",
    "status",
    "any update",
    "any progress",
    "confirm",
];

static RESUME_WITH_REMAINDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(?:resume|continue|unpause)\b[\s,:;.!-]*(?:(?:and|then)\b[\s,:;-]*)?(.*)$")
        .unwrap()
});

/// What an operator message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Pause,
    /// Resume the loop; any trailing text is a separate follow-up directive.
    Resume { remainder: Option<String> },
    Question,
    Directive,
    /// Blank or whitespace-only text.
    Empty,
}

pub fn classify_message(text: &str) -> Intent {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Intent::Empty;
    }
    let normalized = trimmed
        .trim_end_matches(['.', '!', '?', ' '])
        .to_lowercase();

    if PAUSE_WORDS.contains(&normalized.as_str()) {
        return Intent::Pause;
    }
    if RESUME_WORDS.contains(&normalized.as_str()) {
        return Intent::Resume { remainder: None };
    }
    if trimmed.ends_with('?')
        || QUESTION_PHRASES
            .iter()
            .any(|phrase| starts_with_phrase(&normalized, phrase))
    {
        return Intent::Question;
    }
    if let Some(caps) = RESUME_WITH_REMAINDER.captures(trimmed) {
        let remainder = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        return Intent::Resume {
            remainder: (!remainder.is_empty()).then(|| remainder.to_string()),
        };
    }
    Intent::Directive
}

/// `phrase` followed by end of text or a non-alphanumeric character.
fn starts_with_phrase(text: &str, phrase: &str) -> bool {
    text.strip_prefix(phrase)
        .is_some_and(|rest| rest.chars().next().is_none_or(|c| !c.is_alphanumeric()))
}
