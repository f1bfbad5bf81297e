//! Success/failure classification of task result text.
//!
//! Results are short free-form strings from the decision engine or a
//! capability. Any failure token (case-insensitive substring) marks the
//! result as a failure. This is a keyword heuristic: legitimate text that
//! mentions "error" also classifies as a failure.

/// Substrings that mark a result as failed.
pub const FAILURE_TOKENS: [&str; 7] = [
    "failed",
    "error",
    "blocked",
    "skipped",
    "timed out",
    "aborted",
    "unconfigured",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    Success,
    Failure,
}

pub fn classify_result(text: &str) -> ResultClass {
    let lowered = text.to_lowercase();
    if lowered.trim().is_empty() || FAILURE_TOKENS.iter().any(|t| lowered.contains(t)) {
        ResultClass::Failure
    } else {
        ResultClass::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_browser_timeout_is_failure() {
        assert_eq!(
            classify_result("Browser task failed: timeout"),
            ResultClass::Failure
        );
    }

    #[test]
    fn classify_is_case_insensitive() {
        assert_eq!(classify_result("ERROR: no route"), ResultClass::Failure);
        assert_eq!(
            classify_result("skipped: deploy capability not configured"),
            ResultClass::Failure
        );
    }

    #[test]
    fn classify_plain_result_is_success() {
        assert_eq!(
            classify_result("Published draft to staging"),
            ResultClass::Success
        );
    }

    #[test]
    fn classify_empty_result_is_failure() {
        assert_eq!(classify_result("   "), ResultClass::Failure);
    }

    #[test]
    fn classify_flags_incidental_mentions() {
        assert_eq!(
            classify_result("Wrote the error-handling guide"),
            ResultClass::Failure
        );
    }
}
