//! Whole-percent progress accounting shared by both transfer roles.

/// Floor-rounded whole percent of `processed` against `total`.
///
/// Clamped to 100, and a zero total reports 100 so empty transfers read as
/// done rather than stuck.
pub fn percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = processed.saturating_mul(100) / total;
    pct.min(100) as u8
}

/// Deduplicating percent tracker.
///
/// Sessions recompute percent from their byte counters on every chunk;
/// the reporter turns that stream into one emission per changed value.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    last: Option<u8>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current counters, returning `Some(percent)` only when the
    /// whole-percent value differs from the previous emission.
    pub fn record(&mut self, processed: u64, total: u64) -> Option<u8> {
        let pct = percent(processed, total);
        if self.last == Some(pct) {
            return None;
        }
        self.last = Some(pct);
        Some(pct)
    }
}
