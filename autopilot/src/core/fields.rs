//! `LABEL: value` grammar shared by every decision-engine reply parser.
//!
//! Replies are free text; only lines shaped like `LABEL: value` are read.
//! Markdown decoration around the label (`- `, `**`) is tolerated. Anything
//! else is ignored, so a missing label is simply absent.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static FIELD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\s>*_-]*([A-Za-z][A-Za-z0-9 _-]{0,39}?)[*_]*\s*:[*_]*\s*(.*?)\s*$").unwrap()
});

/// Labeled values parsed from a reply. Labels are normalized to
/// `UPPER_SNAKE_CASE`; the first occurrence of a label wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    values: BTreeMap<String, String>,
}

impl Fields {
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in text.lines() {
            let Some(caps) = FIELD_LINE.captures(line) else {
                continue;
            };
            let (Some(label), Some(value)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let value = value.as_str().trim_matches(['*', '`', '"']).trim();
            if value.is_empty() {
                continue;
            }
            values
                .entry(normalize_label(label.as_str()))
                .or_insert_with(|| value.to_string());
        }
        Self { values }
    }

    /// Value for `label` (any casing), if present and non-empty.
    pub fn get(&self, label: &str) -> Option<&str> {
        self.values.get(&normalize_label(label)).map(String::as_str)
    }

    /// First present label among `labels`.
    pub fn first_of(&self, labels: &[&str]) -> Option<&str> {
        labels.iter().find_map(|label| self.get(label))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn normalize_label(label: &str) -> String {
    label
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}
