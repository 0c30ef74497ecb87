use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_ACCEPTANCE_FLOOR: f64 = 7.0;
pub const USABLE_PARTIAL_FLOOR: f64 = 5.0;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const AUGMENTATION_ACCEPT_FLOOR: f64 = 7.0;
pub const DOSAGE_INTENT: &str = "dosage";

pub const DEFAULT_INTENT_THRESHOLDS: &[(&str, f64)] = &[
    ("general", 7.0),
    ("dosage", 6.0),
    ("problem_solving", 6.5),
    ("troubleshooting", 6.5),
    ("business", 9.0),
    ("production", 5.0),
    ("support", 6.5),
    ("product_info", 6.5),
    ("technical", 6.5),
    ("setup", 6.0),
    ("maintenance", 6.5),
    ("learning", 7.0),
];

pub const DEFAULT_PROTECTED_INTENTS: &[&str] = &["business", "dosage", "production"];

pub fn default_intent_thresholds() -> BTreeMap<String, f64> {
    DEFAULT_INTENT_THRESHOLDS
        .iter()
        .map(|(intent, threshold)| (intent.to_string(), *threshold))
        .collect()
}

pub fn default_protected_intents() -> BTreeSet<String> {
    DEFAULT_PROTECTED_INTENTS
        .iter()
        .map(|intent| intent.to_string())
        .collect()
}

/// Static acceptance rules consulted by the attempt loop and the augmentation
/// gate. Built once per process from the resolved profile.
#[derive(Debug, Clone)]
pub struct ConfidencePolicy {
    acceptance_floor: f64,
    usable_partial_floor: f64,
    augmentation_accept_floor: f64,
    max_attempts: u32,
    intent_thresholds: BTreeMap<String, f64>,
    protected_intents: BTreeSet<String>,
    dosage_fallback_intents: BTreeSet<String>,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            acceptance_floor: DEFAULT_ACCEPTANCE_FLOOR,
            usable_partial_floor: USABLE_PARTIAL_FLOOR,
            augmentation_accept_floor: AUGMENTATION_ACCEPT_FLOOR,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            intent_thresholds: default_intent_thresholds(),
            protected_intents: default_protected_intents(),
            dosage_fallback_intents: BTreeSet::from([DOSAGE_INTENT.to_string()]),
        }
    }
}

impl ConfidencePolicy {
    pub fn new(
        acceptance_floor: f64,
        usable_partial_floor: f64,
        augmentation_accept_floor: f64,
        max_attempts: u32,
        intent_thresholds: BTreeMap<String, f64>,
        protected_intents: BTreeSet<String>,
    ) -> Self {
        Self {
            acceptance_floor,
            usable_partial_floor,
            augmentation_accept_floor,
            max_attempts: max_attempts.max(1),
            intent_thresholds: intent_thresholds
                .into_iter()
                .map(|(intent, threshold)| (normalize_intent(&intent), threshold))
                .collect(),
            protected_intents: protected_intents
                .iter()
                .map(|intent| normalize_intent(intent))
                .filter(|intent| !intent.is_empty())
                .collect(),
            dosage_fallback_intents: BTreeSet::from([DOSAGE_INTENT.to_string()]),
        }
    }

    /// Unknown intents fall back to the global acceptance floor.
    pub fn threshold_for(&self, intent: &str) -> f64 {
        self.intent_thresholds
            .get(&normalize_intent(intent))
            .copied()
            .unwrap_or(self.acceptance_floor)
    }

    pub fn is_protected(&self, intent: &str) -> bool {
        self.protected_intents.contains(&normalize_intent(intent))
    }

    pub fn has_dosage_fallback(&self, intent: &str) -> bool {
        self.dosage_fallback_intents
            .contains(&normalize_intent(intent))
    }

    pub fn usable_partial_floor(&self) -> f64 {
        self.usable_partial_floor
    }

    pub fn acceptance_floor(&self) -> f64 {
        self.acceptance_floor
    }

    pub fn augmentation_accept_floor(&self) -> f64 {
        self.augmentation_accept_floor
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn intent_thresholds(&self) -> &BTreeMap<String, f64> {
        &self.intent_thresholds
    }

    pub fn protected_intents(&self) -> &BTreeSet<String> {
        &self.protected_intents
    }

    /// Structural problems that would make the state machine misbehave.
    pub fn sanity_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !(1.0..=10.0).contains(&self.acceptance_floor) {
            issues.push(format!(
                "acceptance floor {:.1} is outside the 1-10 score range",
                self.acceptance_floor
            ));
        }
        if self.usable_partial_floor > self.acceptance_floor {
            issues.push(format!(
                "usable partial floor {:.1} exceeds acceptance floor {:.1}",
                self.usable_partial_floor, self.acceptance_floor
            ));
        }
        if !(1.0..=10.0).contains(&self.augmentation_accept_floor) {
            issues.push(format!(
                "augmentation accept floor {:.1} is outside the 1-10 score range",
                self.augmentation_accept_floor
            ));
        }
        for (intent, threshold) in &self.intent_thresholds {
            if !(1.0..=10.0).contains(threshold) {
                issues.push(format!(
                    "threshold {threshold:.1} for intent '{intent}' is outside the 1-10 score range"
                ));
            }
        }
        for intent in &self.dosage_fallback_intents {
            if !self.protected_intents.contains(intent) {
                issues.push(format!(
                    "intent '{intent}' has a dosage fallback but is not protected from augmentation"
                ));
            }
        }
        issues
    }
}

pub fn normalize_intent(intent: &str) -> String {
    intent.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_intent_uses_acceptance_floor() {
        let policy = ConfidencePolicy::default();
        assert_eq!(policy.threshold_for("astrology"), 7.0);
        assert_eq!(policy.threshold_for("Dosage"), 6.0);
        assert_eq!(policy.threshold_for(" business "), 9.0);
    }

    #[test]
    fn protected_set_covers_high_risk_intents() {
        let policy = ConfidencePolicy::default();
        assert!(policy.is_protected("business"));
        assert!(policy.is_protected("DOSAGE"));
        assert!(policy.is_protected("production"));
        assert!(!policy.is_protected("general"));
        assert!(policy.has_dosage_fallback("dosage"));
        assert!(!policy.has_dosage_fallback("general"));
    }

    #[test]
    fn default_policy_is_sane() {
        assert!(ConfidencePolicy::default().sanity_issues().is_empty());
    }

    #[test]
    fn sanity_flags_unprotected_dosage_and_inverted_floors() {
        let policy = ConfidencePolicy::new(
            6.0,
            6.5,
            7.0,
            0,
            default_intent_thresholds(),
            BTreeSet::from(["business".to_string()]),
        );
        let issues = policy.sanity_issues();
        assert_eq!(policy.max_attempts(), 1);
        assert!(issues.iter().any(|issue| issue.contains("usable partial floor")));
        assert!(issues.iter().any(|issue| issue.contains("not protected")));
    }
}
