//! Baseline learning and adaptive threshold derivation.
//!
//! Before any match judgement is trusted the learner collects a fixed number
//! of valid CPU readings taken in the menu, averages them, and derives the
//! CPU percentage above which a reading counts as "in match".

use crate::sampler::{Attribution, CpuReading};

/// Lower bound of every derived threshold.
pub const MIN_THRESHOLD_PERCENT: f64 = 25.0;
/// Upper bound of every derived threshold.
pub const MAX_THRESHOLD_PERCENT: f64 = 60.0;

/// Threshold parameters for in-session baselines, keyed by baseline ceiling.
///
/// Lower idle usage means faster hardware, which shows a larger relative jump
/// under load, so it gets a higher multiplier.
const SESSION_BUCKETS: &[(f64, f64, f64)] = &[
    // (baseline below, multiplier, additive gap)
    (10.0, 2.5, 12.0),
    (15.0, 2.0, 10.0),
    (20.0, 1.7, 8.0),
    (25.0, 1.5, 7.0),
];
const SESSION_TOP_BUCKET: (f64, f64) = (1.3, 6.0);

/// Derive the detection threshold from a baseline average.
///
/// The result always lies within `[25, 60]`.
pub fn derive_threshold(baseline: f64, attribution: Attribution) -> f64 {
    let threshold = match attribution {
        Attribution::Launcher => (baseline * 4.0).ceil().max(12.0),
        Attribution::Session => {
            let (multiplier, gap) = SESSION_BUCKETS
                .iter()
                .find(|(below, _, _)| baseline < *below)
                .map(|&(_, m, g)| (m, g))
                .unwrap_or(SESSION_TOP_BUCKET);

            let calculated = (baseline * multiplier).ceil();
            let minimum = (baseline + gap).ceil();
            MIN_THRESHOLD_PERCENT.max(minimum).max(calculated)
        }
        Attribution::Unattributed => (baseline * 2.0).ceil().max(15.0),
    };

    // NaN input falls through max() as the other operand, so the clamp stays in range.
    threshold.clamp(MIN_THRESHOLD_PERCENT, MAX_THRESHOLD_PERCENT)
}

/// Outcome of a completed calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub baseline: f64,
    pub threshold: f64,
    pub attribution: Attribution,
}

/// Result of feeding one reading into the learner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearnProgress {
    /// Reading was not positive and did not count.
    Ignored,
    /// Reading counted; `collected` of `required` so far.
    Collecting { collected: usize, required: usize },
    /// This reading completed calibration.
    Calibrated(Calibration),
    /// Calibration already happened this session; the reading was discarded.
    AlreadyCalibrated,
}

/// Accumulates menu-state readings until a baseline can be computed.
///
/// Calibrates at most once; only [`BaselineLearner::reset`] clears it.
#[derive(Debug, Clone)]
pub struct BaselineLearner {
    required: usize,
    readings: Vec<f64>,
    calibration: Option<Calibration>,
}

impl BaselineLearner {
    pub fn new(required: usize) -> Self {
        let required = required.max(1);
        Self {
            required,
            readings: Vec::with_capacity(required),
            calibration: None,
        }
    }

    /// Feed one reading. A missing or non-positive reading is ignored.
    pub fn record(&mut self, reading: Option<&CpuReading>) -> LearnProgress {
        if self.calibration.is_some() {
            return LearnProgress::AlreadyCalibrated;
        }

        let reading = match reading {
            Some(r) if r.percent.is_finite() && r.percent > 0.0 => r,
            _ => return LearnProgress::Ignored,
        };

        self.readings.push(reading.percent);
        if self.readings.len() < self.required {
            return LearnProgress::Collecting {
                collected: self.readings.len(),
                required: self.required,
            };
        }

        let baseline = self.readings.iter().sum::<f64>() / self.readings.len() as f64;
        let calibration = Calibration {
            baseline,
            threshold: derive_threshold(baseline, reading.attribution),
            attribution: reading.attribution,
        };
        self.calibration = Some(calibration);
        LearnProgress::Calibrated(calibration)
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.calibration
    }

    pub fn threshold(&self) -> Option<f64> {
        self.calibration.map(|c| c.threshold)
    }

    /// Number of valid readings collected so far.
    pub fn collected(&self) -> usize {
        self.readings.len()
    }

    pub fn required(&self) -> usize {
        self.required
    }

    /// Start over for a new monitoring session.
    pub fn reset(&mut self) {
        self.readings.clear();
        self.calibration = None;
    }
}
