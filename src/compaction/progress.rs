//! Progress checkpoints for a compaction session.
//!
//! ```text
//!  0 ─ 5 analyzing ─ 10 ── map pass 1 ── 80 ─ 85 reduce ── map pass 2 ── 90 ─ 92 reduce ─ 95 ─ 100
//! ```
//!
//! Full-context runs jump from `ANALYZING` to `FULL_CONTEXT` and then to
//! `FINALIZING`.

pub const ANALYZING: u8 = 5;
pub const FULL_CONTEXT: u8 = 20;
pub const FINALIZING: u8 = 95;
pub const SAVING: u8 = 98;
pub const COMPLETE: u8 = 100;

/// The slice of the progress bar one map pass owns, plus where its reduce
/// call lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassWindow {
    pub start: u8,
    pub end: u8,
    pub reduce: u8,
}

pub const FIRST_PASS: PassWindow = PassWindow {
    start: 10,
    end: 80,
    reduce: 85,
};

pub const SECOND_PASS: PassWindow = PassWindow {
    start: 85,
    end: 90,
    reduce: 92,
};

impl PassWindow {
    pub fn for_pass(pass: u32) -> Self {
        if pass <= 1 { FIRST_PASS } else { SECOND_PASS }
    }

    /// `start + round((end - start) × processed / total)`.
    pub fn mapping(&self, processed: usize, total: usize) -> u8 {
        let span = f64::from(self.end - self.start);
        let fraction = processed.min(total) as f64 / total.max(1) as f64;
        self.start + (span * fraction).round() as u8
    }
}
