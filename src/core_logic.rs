//! Core Logic module implementing the match state machine.
//!
//! The machine is pure: it consumes observations and deferred-check outcomes
//! stamped with an explicit `Instant` and returns the [`Action`]s the runtime
//! must perform. It never sleeps, spawns, or touches the display itself.

use crate::baseline::{BaselineLearner, Calibration, LearnProgress};
use crate::resolution::ResolutionTarget;
use crate::sampler::{CpuReading, Observation, ReadingSource};
use crate::stability::{describe_window, StabilityFilter};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Factor applied to the threshold when re-checking a match end.
pub const END_CHECK_RELAXATION: f64 = 1.1;

/// Lifecycle of one monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    /// Collecting baseline readings
    Learning,
    /// Baseline known, outside a match
    Armed,
    /// Match detected
    InMatch { since: Instant },
    /// Match looks over, waiting for the delayed confirmation
    ConfirmingEnd { since: Instant, ended_at: Instant },
}

impl MatchState {
    pub fn name(&self) -> &'static str {
        match self {
            MatchState::Learning => "Learning",
            MatchState::Armed => "Armed",
            MatchState::InMatch { .. } => "InMatch",
            MatchState::ConfirmingEnd { .. } => "ConfirmingEnd",
        }
    }

    fn in_match(&self) -> bool {
        matches!(
            self,
            MatchState::InMatch { .. } | MatchState::ConfirmingEnd { .. }
        )
    }
}

/// Timing and window sizes for the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub baseline_readings: usize,
    pub stability_checks: usize,
    pub start_delay: Duration,
    pub end_delay: Duration,
    pub end_check_count: u32,
    pub end_check_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            baseline_readings: 3,
            stability_checks: 3,
            start_delay: Duration::from_secs(5),
            end_delay: Duration::from_secs(5),
            end_check_count: 3,
            end_check_interval: Duration::from_secs(2),
        }
    }
}

/// Side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Notify(String),
    HideUi,
    ShowUi,
    ApplyResolution(ResolutionTarget),
    /// Re-check in-session presence after `after`, then report via
    /// [`MatchStateMachine::on_start_recheck`].
    ScheduleStartRecheck { after: Duration },
    /// Run `checks` end checks spaced by `spacing`, starting after `after`,
    /// then report via [`MatchStateMachine::on_end_verdict`].
    ScheduleEndConfirmation {
        after: Duration,
        checks: u32,
        spacing: Duration,
        bound: f64,
    },
    /// Discard every scheduled re-check whose outcome has not arrived yet.
    CancelDeferred,
}

/// One check of the end-confirmation burst.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EndCheck {
    SessionAbsent,
    Reading(CpuReading),
    /// The process list could not be read.
    Failed,
}

impl EndCheck {
    /// Whether this check counts as "out of match" against `bound`.
    ///
    /// Readings that are not real deltas carry no load information and count as out.
    pub fn is_out_of_match(&self, bound: f64) -> bool {
        match self {
            EndCheck::SessionAbsent | EndCheck::Failed => true,
            EndCheck::Reading(r) => r.source != ReadingSource::Measured || r.percent <= bound,
        }
    }
}

/// Votes collected by an end-confirmation burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndVerdict {
    pub confirmed_out: u32,
    pub total: u32,
}

impl EndVerdict {
    /// Strict majority of checks confirmed the match is over.
    pub fn majority_out(&self) -> bool {
        self.confirmed_out * 2 > self.total
    }
}

/// Count out-of-match votes.
pub fn tally(checks: &[EndCheck], bound: f64) -> EndVerdict {
    EndVerdict {
        confirmed_out: checks.iter().filter(|c| c.is_out_of_match(bound)).count() as u32,
        total: checks.len() as u32,
    }
}

/// Match state machine for one monitoring session.
pub struct MatchStateMachine {
    settings: EngineSettings,
    state: MatchState,
    learner: BaselineLearner,
    filter: StabilityFilter,
    /// Whether the game resolution is currently applied
    display_switched: bool,
}

impl MatchStateMachine {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            learner: BaselineLearner::new(settings.baseline_readings),
            filter: StabilityFilter::new(settings.stability_checks),
            settings,
            state: MatchState::Learning,
            display_switched: false,
        }
    }

    pub fn state(&self) -> MatchState {
        self.state
    }

    pub fn calibration(&self) -> Option<Calibration> {
        self.learner.calibration()
    }

    pub fn learner(&self) -> &BaselineLearner {
        &self.learner
    }

    pub fn filter(&self) -> &StabilityFilter {
        &self.filter
    }

    pub fn display_switched(&self) -> bool {
        self.display_switched
    }

    /// Back to `Learning` with empty baseline and window.
    pub fn reset(&mut self) {
        self.state = MatchState::Learning;
        self.learner.reset();
        self.filter.reset();
        self.display_switched = false;
    }

    /// Stop monitoring: restore the desktop resolution if switched, then reset.
    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.display_switched {
            actions.push(Action::ApplyResolution(ResolutionTarget::Desktop));
        }
        self.reset();
        actions.push(Action::Notify("Monitoring stopped".to_string()));
        actions
    }

    /// Process one tick's observation.
    pub fn observe(&mut self, observation: &Observation, now: Instant) -> Vec<Action> {
        if !observation.snapshot.app_present() {
            return self.on_app_absent();
        }

        if self.state == MatchState::Learning {
            return self.learn(observation.reading.as_ref());
        }

        self.judge(observation, now)
    }

    fn on_app_absent(&mut self) -> Vec<Action> {
        if !self.display_switched {
            return vec![Action::Notify(
                "Game not running - start it and wait in the menu".to_string(),
            )];
        }

        info!(
            state = self.state.name(),
            "Game closed while the game resolution was applied, restoring immediately"
        );
        self.display_switched = false;
        self.filter.reset();
        self.state = MatchState::Armed;
        vec![
            Action::CancelDeferred,
            Action::ShowUi,
            Action::Notify("Game closed! Restoring desktop resolution".to_string()),
            Action::ApplyResolution(ResolutionTarget::Desktop),
        ]
    }

    fn learn(&mut self, reading: Option<&CpuReading>) -> Vec<Action> {
        match self.learner.record(reading) {
            LearnProgress::Ignored => {
                debug!(?reading, "Invalid CPU reading, waiting for valid data");
                vec![Action::Notify(format!(
                    "Waiting for valid CPU data... ({}/{})",
                    self.learner.collected(),
                    self.learner.required()
                ))]
            }
            LearnProgress::Collecting {
                collected,
                required,
            } => {
                let percent = reading.map(|r| r.percent).unwrap_or_default();
                debug!(collected, required, percent, "Learning baseline");
                vec![Action::Notify(format!(
                    "Learning baseline... ({}/{}) - Current: {:.1}%",
                    collected, required, percent
                ))]
            }
            LearnProgress::Calibrated(cal) => {
                info!(
                    baseline = cal.baseline,
                    threshold = cal.threshold,
                    attribution = ?cal.attribution,
                    "Baseline calibrated"
                );
                self.state = MatchState::Armed;
                vec![Action::Notify(format!(
                    "Baseline completed! Threshold: {:.0}% - Ready to detect matches",
                    cal.threshold
                ))]
            }
            LearnProgress::AlreadyCalibrated => Vec::new(),
        }
    }

    fn judge(&mut self, observation: &Observation, now: Instant) -> Vec<Action> {
        let threshold = match self.learner.threshold() {
            Some(t) => t,
            None => return Vec::new(),
        };

        let in_match_now = match observation.reading {
            Some(reading) if observation.snapshot.session_present() => {
                let raw = reading.percent > threshold;
                if let Some(transition) = self.filter.push(raw, now) {
                    info!(
                        in_match = transition.in_match,
                        window = %describe_window(&self.filter),
                        "Stable state change confirmed"
                    );
                }
                debug!(
                    percent = reading.percent,
                    threshold,
                    raw,
                    window = %describe_window(&self.filter),
                    "Match judgement"
                );
                self.filter.in_match()
            }
            _ => {
                self.filter.force_out_of_match();
                false
            }
        };

        match self.state {
            MatchState::Armed if in_match_now => {
                self.state = MatchState::InMatch { since: now };
                vec![
                    Action::HideUi,
                    Action::Notify(format!(
                        "Match started! Resolution will change in {} seconds...",
                        self.settings.start_delay.as_secs()
                    )),
                    Action::ScheduleStartRecheck {
                        after: self.settings.start_delay,
                    },
                ]
            }
            MatchState::Armed => vec![Action::Notify(
                "In game menu - ready to detect matches".to_string(),
            )],
            MatchState::InMatch { since } if !in_match_now => {
                self.state = MatchState::ConfirmingEnd {
                    since,
                    ended_at: now,
                };
                vec![
                    Action::Notify(format!(
                        "Match ended! Resolution will be restored in {} seconds...",
                        self.settings.end_delay.as_secs()
                    )),
                    Action::ScheduleEndConfirmation {
                        after: self.settings.end_delay,
                        checks: self.settings.end_check_count,
                        spacing: self.settings.end_check_interval,
                        bound: threshold * END_CHECK_RELAXATION,
                    },
                ]
            }
            _ => Vec::new(),
        }
    }

    /// Outcome of the delayed check after a match start.
    pub fn on_start_recheck(&mut self, session_present: bool) -> Vec<Action> {
        if !self.state.in_match() || self.display_switched {
            return Vec::new();
        }

        if session_present {
            self.display_switched = true;
            vec![
                Action::Notify("In match - switching to game resolution".to_string()),
                Action::ApplyResolution(ResolutionTarget::Game),
            ]
        } else {
            info!("Session closed before the start delay elapsed, resolution unchanged");
            vec![
                Action::ShowUi,
                Action::Notify("Match closed early - resolution unchanged".to_string()),
            ]
        }
    }

    /// Outcome of the delayed end-confirmation burst.
    pub fn on_end_verdict(&mut self, verdict: EndVerdict) -> Vec<Action> {
        let since = match self.state {
            MatchState::ConfirmingEnd { since, .. } => since,
            _ => return Vec::new(),
        };

        info!(
            confirmed_out = verdict.confirmed_out,
            total = verdict.total,
            "Match end confirmation"
        );

        if !verdict.majority_out() {
            self.state = MatchState::InMatch { since };
            return vec![Action::Notify(
                "Still in match - resolution kept".to_string(),
            )];
        }

        self.state = MatchState::Armed;
        if !self.display_switched {
            return vec![
                Action::ShowUi,
                Action::Notify("Match ended - ready for a new match".to_string()),
            ];
        }

        self.display_switched = false;
        vec![
            Action::ShowUi,
            Action::Notify("Match ended! Restoring desktop resolution".to_string()),
            Action::ApplyResolution(ResolutionTarget::Desktop),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::testing::{launcher, session, unrelated};
    use crate::sampler::{Attribution, ProcessSnapshot};
    use proptest::prelude::*;

    fn reading(percent: f64, attribution: Attribution) -> CpuReading {
        CpuReading {
            percent,
            attribution,
            source: ReadingSource::Measured,
        }
    }

    fn observation(in_session: bool, percent: f64) -> Observation {
        let entries = if in_session {
            vec![launcher(), session()]
        } else {
            vec![launcher()]
        };
        let attribution = if in_session {
            Attribution::Session
        } else {
            Attribution::Launcher
        };
        Observation {
            snapshot: ProcessSnapshot::from_entries(&entries),
            reading: Some(reading(percent, attribution)),
        }
    }

    fn app_gone() -> Observation {
        Observation {
            snapshot: ProcessSnapshot::from_entries(&[unrelated()]),
            reading: None,
        }
    }

    fn has_schedule_start(actions: &[Action]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, Action::ScheduleStartRecheck { .. }))
    }

    fn has_schedule_end(actions: &[Action]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, Action::ScheduleEndConfirmation { .. }))
    }

    /// Machine calibrated on an 8% session baseline (threshold 25).
    fn armed(now: Instant) -> MatchStateMachine {
        let mut machine = MatchStateMachine::new(EngineSettings::default());
        for _ in 0..3 {
            machine.observe(&observation(true, 8.0), now);
        }
        assert_eq!(machine.state(), MatchState::Armed);
        machine
    }

    /// Machine with the game resolution applied.
    fn switched(now: Instant) -> MatchStateMachine {
        let mut machine = armed(now);
        for _ in 0..3 {
            machine.observe(&observation(true, 60.0), now);
        }
        let actions = machine.on_start_recheck(true);
        assert!(actions.contains(&Action::ApplyResolution(ResolutionTarget::Game)));
        assert!(machine.display_switched());
        machine
    }

    #[test]
    fn test_launcher_calibration_scenario() {
        let now = Instant::now();
        let mut machine = MatchStateMachine::new(EngineSettings::default());
        for _ in 0..2 {
            machine.observe(&observation(false, 3.0), now);
            assert_eq!(machine.state(), MatchState::Learning);
        }
        let actions = machine.observe(&observation(false, 3.0), now);
        assert_eq!(machine.state(), MatchState::Armed);
        assert_eq!(
            actions,
            vec![Action::Notify(
                "Baseline completed! Threshold: 25% - Ready to detect matches".to_string()
            )]
        );
        let cal = machine.calibration().unwrap();
        assert_eq!(cal.baseline, 3.0);
        assert_eq!(cal.threshold, 25.0);
    }

    #[test]
    fn test_session_calibration_scenario() {
        let machine = armed(Instant::now());
        let cal = machine.calibration().unwrap();
        assert_eq!(cal.baseline, 8.0);
        assert_eq!(cal.attribution, Attribution::Session);
        assert_eq!(cal.threshold, 25.0);
    }

    #[test]
    fn test_learning_skips_invalid_readings() {
        let now = Instant::now();
        let mut machine = MatchStateMachine::new(EngineSettings::default());
        let empty = Observation {
            snapshot: ProcessSnapshot::from_entries(&[launcher()]),
            reading: Some(reading(0.0, Attribution::Launcher)),
        };
        for _ in 0..5 {
            machine.observe(&empty, now);
        }
        assert_eq!(machine.state(), MatchState::Learning);
        assert_eq!(machine.learner().collected(), 0);
    }

    #[test]
    fn test_unstable_raw_sequence_keeps_state() {
        let now = Instant::now();
        let mut machine = armed(now);
        for percent in [60.0, 5.0, 60.0] {
            let actions = machine.observe(&observation(true, percent), now);
            assert!(!has_schedule_start(&actions));
        }
        assert_eq!(machine.state(), MatchState::Armed);
        assert_eq!(machine.filter().confirmed(), None);
    }

    #[test]
    fn test_match_entry_after_stable_window() {
        let t0 = Instant::now();
        let mut machine = armed(t0);
        machine.observe(&observation(true, 40.0), t0);
        machine.observe(&observation(true, 40.0), t0 + Duration::from_secs(3));
        let t2 = t0 + Duration::from_secs(6);
        let actions = machine.observe(&observation(true, 40.0), t2);

        assert_eq!(machine.state(), MatchState::InMatch { since: t2 });
        assert_eq!(actions[0], Action::HideUi);
        assert!(actions.contains(&Action::ScheduleStartRecheck {
            after: Duration::from_secs(5)
        }));

        // Still in match: no second schedule.
        let actions = machine.observe(&observation(true, 40.0), t2);
        assert!(!has_schedule_start(&actions));
    }

    #[test]
    fn test_start_recheck_without_session_keeps_resolution() {
        let now = Instant::now();
        let mut machine = armed(now);
        for _ in 0..3 {
            machine.observe(&observation(true, 60.0), now);
        }
        let actions = machine.on_start_recheck(false);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::ApplyResolution(_))));
        assert!(actions.contains(&Action::ShowUi));
        assert!(!machine.display_switched());
    }

    #[test]
    fn test_start_recheck_ignored_outside_match() {
        let mut machine = armed(Instant::now());
        assert!(machine.on_start_recheck(true).is_empty());
        assert!(!machine.display_switched());
    }

    #[test]
    fn test_low_load_schedules_end_confirmation() {
        let t0 = Instant::now();
        let mut machine = switched(t0);
        let since = match machine.state() {
            MatchState::InMatch { since } => since,
            other => panic!("unexpected state {:?}", other),
        };

        machine.observe(&observation(true, 10.0), t0);
        machine.observe(&observation(true, 10.0), t0);
        let t_end = t0 + Duration::from_secs(9);
        let actions = machine.observe(&observation(true, 10.0), t_end);

        assert_eq!(
            machine.state(),
            MatchState::ConfirmingEnd {
                since,
                ended_at: t_end
            }
        );
        assert!(actions.contains(&Action::ScheduleEndConfirmation {
            after: Duration::from_secs(5),
            checks: 3,
            spacing: Duration::from_secs(2),
            bound: 25.0 * END_CHECK_RELAXATION,
        }));

        // While confirming, new ticks neither reschedule nor cancel.
        let actions = machine.observe(&observation(true, 90.0), t_end);
        assert!(!has_schedule_end(&actions));
        assert!(matches!(machine.state(), MatchState::ConfirmingEnd { .. }));
    }

    #[test]
    fn test_session_disappearing_counts_as_match_end() {
        let now = Instant::now();
        let mut machine = switched(now);
        let actions = machine.observe(&observation(false, 3.0), now);
        assert!(has_schedule_end(&actions));
        assert_eq!(machine.filter().confirmed(), Some(false));
    }

    #[test]
    fn test_majority_out_restores_desktop() {
        let now = Instant::now();
        let mut machine = switched(now);
        for _ in 0..3 {
            machine.observe(&observation(true, 5.0), now);
        }

        let bound = 25.0 * END_CHECK_RELAXATION;
        let checks = [
            EndCheck::SessionAbsent,
            EndCheck::Reading(reading(20.0, Attribution::Session)),
            EndCheck::Reading(reading(70.0, Attribution::Session)),
        ];
        let verdict = tally(&checks, bound);
        assert_eq!(verdict, EndVerdict { confirmed_out: 2, total: 3 });

        let actions = machine.on_end_verdict(verdict);
        assert!(actions.contains(&Action::ApplyResolution(ResolutionTarget::Desktop)));
        assert!(actions.contains(&Action::ShowUi));
        assert_eq!(machine.state(), MatchState::Armed);
        assert!(!machine.display_switched());
    }

    #[test]
    fn test_minority_out_returns_to_match() {
        let now = Instant::now();
        let mut machine = switched(now);
        for _ in 0..3 {
            machine.observe(&observation(true, 5.0), now);
        }
        let actions = machine.on_end_verdict(EndVerdict {
            confirmed_out: 1,
            total: 3,
        });
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::ApplyResolution(_))));
        assert!(matches!(machine.state(), MatchState::InMatch { .. }));
        assert!(machine.display_switched());

        // The window still says "out", so the next tick starts another confirmation.
        let actions = machine.observe(&observation(true, 5.0), now);
        assert!(has_schedule_end(&actions));
    }

    #[test]
    fn test_end_verdict_ignored_unless_confirming() {
        let now = Instant::now();
        let mut machine = switched(now);
        let actions = machine.on_end_verdict(EndVerdict {
            confirmed_out: 3,
            total: 3,
        });
        assert!(actions.is_empty());
        assert!(machine.display_switched());
    }

    #[test]
    fn test_app_killed_restores_immediately() {
        let now = Instant::now();
        let mut machine = switched(now);
        let actions = machine.observe(&app_gone(), now);
        assert!(actions.contains(&Action::ApplyResolution(ResolutionTarget::Desktop)));
        assert!(actions.contains(&Action::ShowUi));
        assert_eq!(actions[0], Action::CancelDeferred);
        assert_eq!(machine.state(), MatchState::Armed);
        assert!(!machine.display_switched());

        // A confirmation started before the kill no longer applies.
        assert!(machine
            .on_end_verdict(EndVerdict {
                confirmed_out: 3,
                total: 3
            })
            .is_empty());
    }

    #[test]
    fn test_app_absent_without_switch_is_informational() {
        let now = Instant::now();
        let mut machine = armed(now);
        let actions = machine.observe(&app_gone(), now);
        assert!(matches!(actions.as_slice(), [Action::Notify(_)]));
        assert_eq!(machine.state(), MatchState::Armed);
    }

    #[test]
    fn test_stop_restores_once() {
        let now = Instant::now();
        let mut machine = switched(now);
        let first = machine.stop();
        assert_eq!(first[0], Action::ApplyResolution(ResolutionTarget::Desktop));
        assert_eq!(machine.state(), MatchState::Learning);
        assert!(machine.calibration().is_none());

        let second = machine.stop();
        assert!(!second
            .iter()
            .any(|a| matches!(a, Action::ApplyResolution(_))));
    }

    #[test]
    fn test_end_check_votes() {
        let bound = 27.5;
        assert!(EndCheck::SessionAbsent.is_out_of_match(bound));
        assert!(EndCheck::Failed.is_out_of_match(bound));
        assert!(EndCheck::Reading(reading(27.5, Attribution::Session)).is_out_of_match(bound));
        assert!(!EndCheck::Reading(reading(27.6, Attribution::Session)).is_out_of_match(bound));

        let fallback = CpuReading {
            percent: 99.0,
            attribution: Attribution::Session,
            source: ReadingSource::Fallback,
        };
        assert!(EndCheck::Reading(fallback).is_out_of_match(bound));
    }

    proptest! {
        #[test]
        fn prop_majority_is_strict(confirmed_out in 0u32..20, extra in 0u32..20) {
            let total = confirmed_out + extra;
            let verdict = EndVerdict { confirmed_out, total };
            prop_assert_eq!(verdict.majority_out(), confirmed_out > extra);
        }

        #[test]
        fn prop_calibration_happens_once(
            readings in proptest::collection::vec(1.0f64..90.0, 3..20),
        ) {
            let now = Instant::now();
            let mut machine = MatchStateMachine::new(EngineSettings::default());
            let mut calibrations = 0;
            let mut first = None;
            for r in readings {
                machine.observe(&observation(true, r), now);
                if let Some(cal) = machine.calibration() {
                    if first.is_none() {
                        calibrations += 1;
                        first = Some(cal);
                    }
                    prop_assert_eq!(Some(cal), first);
                }
            }
            prop_assert_eq!(calibrations, 1);
        }
    }
}
