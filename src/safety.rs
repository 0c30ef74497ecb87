use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::ContactSettings;

pub const DEFAULT_MIN_ANSWER_CHARS: usize = 100;
pub const DEFAULT_MAX_ANSWER_CHARS: usize = 2000;

pub const DEFAULT_CONTACT_MARKERS: &[&str] = &[
    "support",
    "contact",
    "helpline",
    "hotline",
    "customer service",
    "phone",
    "email",
    "call us",
];

/// International `+CC` numbers or a parenthesized area code, each followed
/// by digit groups. Bare ranges and dates never match.
static PHONE_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"\+\d{1,3}(?:[\s.-]?\d{2,4}){2,5}\b|\(\d{2,4}\)[\s.-]?\d{2,4}(?:[\s.-]\d{2,4}){1,3}\b",
    )
    .ok()
});

pub fn default_contact_markers() -> Vec<String> {
    DEFAULT_CONTACT_MARKERS
        .iter()
        .map(|marker| marker.to_string())
        .collect::<Vec<String>>()
}

pub fn contains_phone_number(text: &str) -> bool {
    PHONE_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(text))
}

pub fn contains_contact_markers(text: &str, markers: &[String]) -> Vec<String> {
    let mut hits = BTreeSet::<String>::new();
    let lower = text.to_lowercase();
    for marker in markers {
        let normalized = marker.trim().to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        if lower.contains(&normalized) {
            hits.insert(normalized);
        }
    }
    hits.into_iter().collect::<Vec<String>>()
}

/// Host part of a support URL, without scheme or `www.`.
pub fn url_host(url: &str) -> Option<String> {
    let without_scheme = url
        .trim()
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url.trim());
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .trim_start_matches("www.")
        .to_lowercase();
    (!host.is_empty()).then_some(host)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCheck {
    TooShort,
    TooLong,
    MissingContactMarker,
}

impl SafetyCheck {
    pub fn name(self) -> &'static str {
        match self {
            SafetyCheck::TooShort => "too_short",
            SafetyCheck::TooLong => "too_long",
            SafetyCheck::MissingContactMarker => "missing_contact_marker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyVerdict {
    pub passed: bool,
    pub char_count: usize,
    pub failures: Vec<SafetyCheck>,
    pub markers_found: Vec<String>,
}

impl SafetyVerdict {
    pub fn failure_names(&self) -> Vec<&'static str> {
        self.failures.iter().map(|check| check.name()).collect()
    }
}

/// Deterministic gate for generated answers: bounded length and at least one
/// reference to a human contact channel.
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    min_chars: usize,
    max_chars: usize,
    markers: Vec<String>,
}

impl SafetyValidator {
    pub fn new(
        min_chars: usize,
        max_chars: usize,
        mut markers: Vec<String>,
        contact: &ContactSettings,
    ) -> Self {
        if let Some(host) = contact.support_url.as_deref().and_then(url_host) {
            markers.push(host);
        }
        if let Some(phone) = contact.support_phone.as_deref() {
            let phone = phone.trim();
            if !phone.is_empty() {
                markers.push(phone.to_string());
            }
        }
        Self {
            min_chars,
            max_chars: max_chars.max(min_chars),
            markers,
        }
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min_chars, self.max_chars)
    }

    pub fn validate(&self, text: &str) -> SafetyVerdict {
        let trimmed = text.trim();
        let char_count = trimmed.chars().count();
        let mut failures = Vec::new();

        if char_count < self.min_chars {
            failures.push(SafetyCheck::TooShort);
        }
        if char_count > self.max_chars {
            failures.push(SafetyCheck::TooLong);
        }

        let mut markers_found = contains_contact_markers(trimmed, &self.markers);
        if contains_phone_number(trimmed) {
            markers_found.push("phone_number".to_string());
        }
        if markers_found.is_empty() {
            failures.push(SafetyCheck::MissingContactMarker);
        }

        SafetyVerdict {
            passed: failures.is_empty(),
            char_count,
            failures,
            markers_found,
        }
    }

    pub fn passes(&self, text: &str) -> bool {
        self.validate(text).passed
    }
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self {
            min_chars: DEFAULT_MIN_ANSWER_CHARS,
            max_chars: DEFAULT_MAX_ANSWER_CHARS,
            markers: default_contact_markers(),
        }
    }
}
