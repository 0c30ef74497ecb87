use crate::request::AttemptRecord;

/// Keeps the best attempt that cleared the usable-partial floor.
#[derive(Debug, Clone)]
pub struct PartialResultTracker {
    floor: f64,
    best: Option<AttemptRecord>,
}

impl PartialResultTracker {
    pub fn new(floor: f64) -> Self {
        Self { floor, best: None }
    }

    /// Returns true when the attempt replaced the stored partial.
    pub fn observe(&mut self, attempt: &AttemptRecord) -> bool {
        if attempt.score < self.floor {
            return false;
        }
        let improves = self
            .best
            .as_ref()
            .is_none_or(|stored| attempt.score > stored.score);
        if improves {
            self.best = Some(attempt.clone());
        }
        improves
    }

    pub fn best(&self) -> Option<&AttemptRecord> {
        self.best.as_ref()
    }

    pub fn has_usable(&self) -> bool {
        self.best.is_some()
    }
}
