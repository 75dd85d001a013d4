//! Stability filter for raw match detections.
//!
//! A single CPU sample is noisy, so the filter only reports a state once the
//! last N raw judgements all agree.

use std::collections::VecDeque;
use std::time::Instant;

/// A newly confirmed state, stamped when the agreeing window completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub in_match: bool,
    pub at: Instant,
}

/// Sliding window of raw "load exceeds threshold" judgements.
#[derive(Debug, Clone)]
pub struct StabilityFilter {
    window: VecDeque<bool>,
    capacity: usize,
    confirmed: Option<bool>,
}

impl StabilityFilter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            confirmed: None,
        }
    }

    /// Push one raw judgement.
    ///
    /// Returns a transition only when the full window agrees on a value that
    /// differs from the previously confirmed state.
    pub fn push(&mut self, raw: bool, now: Instant) -> Option<Transition> {
        self.window.push_back(raw);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }

        if self.window.len() < self.capacity || !self.window.iter().all(|&r| r == raw) {
            return None;
        }

        if self.confirmed == Some(raw) {
            return None;
        }

        self.confirmed = Some(raw);
        Some(Transition { in_match: raw, at: now })
    }

    /// Last confirmed state; `None` until the first agreement.
    pub fn confirmed(&self) -> Option<bool> {
        self.confirmed
    }

    /// Confirmed state with "not in match" as the default.
    pub fn in_match(&self) -> bool {
        self.confirmed.unwrap_or(false)
    }

    /// Raw judgements currently in the window, oldest first.
    pub fn window(&self) -> impl Iterator<Item = bool> + '_ {
        self.window.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Clear the window and confirmed state.
    pub fn reset(&mut self) {
        self.window.clear();
        self.confirmed = None;
    }

    /// Bypass the filter: empty the window and pin the state to "not in match".
    pub fn force_out_of_match(&mut self) {
        self.window.clear();
        self.confirmed = Some(false);
    }
}

/// Render a window as `[M, X, M]` for logs.
pub fn describe_window(filter: &StabilityFilter) -> String {
    let marks: Vec<&str> = filter
        .window()
        .map(|r| if r { "M" } else { "X" })
        .collect();
    format!("[{}]", marks.join(", "))
}
