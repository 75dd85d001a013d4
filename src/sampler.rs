//! Sampler for the monitored application.
//!
//! Each tick asks a [`ProcessLister`] for the process table, picks out the
//! launcher and in-session processes by name, and turns the cumulative CPU
//! time reported by a [`CpuMeter`] into a utilization percentage.

use crate::error::SampleError;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Executable names of the launcher process, lowercase.
const LAUNCHER_NAMES: &[&str] = &["valorant.exe", "valorant"];

/// Executable names of the in-session process, lowercase.
const SESSION_NAMES: &[&str] = &["valorant-win64-shipping.exe", "valorant-win64-shipping"];

/// Client processes that only signal the application is open.
const AUXILIARY_NAMES: &[&str] = &[
    "riotclientservices.exe",
    "riotclientux.exe",
    "riotclientuxrender.exe",
    "riotclientservices",
    "riotclientux",
    "riotclientuxrender",
];

/// Utilization reported for the first sample of a process identity.
const FIRST_SAMPLE_LAUNCHER_PERCENT: f64 = 3.0;
const FIRST_SAMPLE_SESSION_PERCENT: f64 = 8.0;

/// Utilization substituted when the CPU meter has no data.
const FALLBACK_LAUNCHER_PERCENT: f64 = 4.0;
const FALLBACK_SESSION_PERCENT: f64 = 8.0;

/// One entry of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub name: String,
    pub pid: u32,
}

impl ProcessEntry {
    pub fn new(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid,
        }
    }
}

/// Source of the OS process table.
pub trait ProcessLister: Send + Sync {
    fn list(&self) -> Result<Vec<ProcessEntry>, SampleError>;
}

/// Source of cumulative CPU time for a single process.
pub trait CpuMeter: Send + Sync {
    /// Total CPU seconds consumed by `pid` since it started.
    fn cumulative_cpu_seconds(&self, pid: u32) -> Result<f64, SampleError>;
}

/// What a known executable name means for the monitored application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Launcher,
    Session,
    Auxiliary,
}

/// Map an executable name onto its role using the fixed allow-list.
///
/// Matching is exact after lowercasing; anything not listed is `None`.
pub fn classify(name: &str) -> Option<ProcessRole> {
    let normalized = name.trim().to_lowercase();
    let name = normalized.as_str();

    if LAUNCHER_NAMES.contains(&name) {
        Some(ProcessRole::Launcher)
    } else if SESSION_NAMES.contains(&name) {
        Some(ProcessRole::Session)
    } else if AUXILIARY_NAMES.contains(&name) {
        Some(ProcessRole::Auxiliary)
    } else {
        None
    }
}

/// Which process a CPU reading was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    Launcher,
    Session,
    Unattributed,
}

/// The monitored application's processes as seen in one process table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub launcher: Option<ProcessEntry>,
    pub session: Option<ProcessEntry>,
    pub auxiliary_count: usize,
}

impl ProcessSnapshot {
    pub fn from_entries(entries: &[ProcessEntry]) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            match classify(&entry.name) {
                Some(ProcessRole::Launcher) if snapshot.launcher.is_none() => {
                    snapshot.launcher = Some(entry.clone());
                }
                Some(ProcessRole::Session) if snapshot.session.is_none() => {
                    snapshot.session = Some(entry.clone());
                }
                Some(ProcessRole::Auxiliary) => snapshot.auxiliary_count += 1,
                _ => {}
            }
        }
        snapshot
    }

    /// Whether any known process of the application is running.
    pub fn app_present(&self) -> bool {
        self.launcher.is_some() || self.session.is_some() || self.auxiliary_count > 0
    }

    pub fn session_present(&self) -> bool {
        self.session.is_some()
    }

    /// Process to measure: the in-session process when present, else the launcher.
    pub fn measured_process(&self) -> Option<(&ProcessEntry, Attribution)> {
        self.session
            .as_ref()
            .map(|p| (p, Attribution::Session))
            .or_else(|| self.launcher.as_ref().map(|p| (p, Attribution::Launcher)))
    }
}

/// Cumulative CPU time of one process at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    pub pid: u32,
    pub cumulative_secs: f64,
    pub at: Instant,
}

/// Result of comparing two CPU samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CpuDelta {
    /// Utilization over the interval, in `[0, 100]`.
    Percent(f64),
    /// No usable previous sample for this process identity.
    First,
    /// The cumulative counter went backwards; the process restarted.
    Reset,
}

/// Utilization between two samples of the same process, normalized by core count.
pub fn cpu_delta(prev: Option<&CpuSample>, cur: &CpuSample, cores: usize) -> CpuDelta {
    let prev = match prev {
        Some(p) if p.pid == cur.pid => p,
        _ => return CpuDelta::First,
    };

    if cur.cumulative_secs < prev.cumulative_secs {
        return CpuDelta::Reset;
    }

    let elapsed = cur.at.saturating_duration_since(prev.at).as_secs_f64();
    if elapsed <= 0.0 {
        return CpuDelta::First;
    }

    let cores = cores.max(1) as f64;
    let percent = (cur.cumulative_secs - prev.cumulative_secs) / elapsed * 100.0 / cores;
    CpuDelta::Percent(percent.clamp(0.0, 100.0))
}

/// How a reading's percentage was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingSource {
    Measured,
    FirstSample,
    Reset,
    /// The meter had no data and a conservative default was substituted.
    Fallback,
}

/// One CPU utilization reading attributed to a process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuReading {
    pub percent: f64,
    pub attribution: Attribution,
    pub source: ReadingSource,
}

impl CpuReading {
    fn first_sample(attribution: Attribution) -> Self {
        let percent = match attribution {
            Attribution::Session => FIRST_SAMPLE_SESSION_PERCENT,
            _ => FIRST_SAMPLE_LAUNCHER_PERCENT,
        };
        Self {
            percent,
            attribution,
            source: ReadingSource::FirstSample,
        }
    }

    fn fallback(attribution: Attribution) -> Self {
        let percent = match attribution {
            Attribution::Session => FALLBACK_SESSION_PERCENT,
            _ => FALLBACK_LAUNCHER_PERCENT,
        };
        Self {
            percent,
            attribution,
            source: ReadingSource::Fallback,
        }
    }
}

/// Keeps the previous CPU sample and turns new ones into readings.
#[derive(Debug, Clone)]
pub struct CpuTracker {
    cores: usize,
    last: Option<CpuSample>,
}

impl CpuTracker {
    pub fn new(cores: usize) -> Self {
        Self {
            cores: cores.max(1),
            last: None,
        }
    }

    /// Forget the previous sample.
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Measure `process` and compare with the previous sample.
    ///
    /// Meter failures never propagate: the reading falls back to a default
    /// and the previous sample is kept for the next attempt.
    pub fn measure(
        &mut self,
        meter: &dyn CpuMeter,
        process: &ProcessEntry,
        attribution: Attribution,
        now: Instant,
    ) -> CpuReading {
        let cumulative_secs = match meter.cumulative_cpu_seconds(process.pid) {
            Ok(secs) if secs.is_finite() && secs >= 0.0 => secs,
            Ok(secs) => {
                warn!(pid = process.pid, value = secs, "CPU meter returned an invalid value");
                return CpuReading::fallback(attribution);
            }
            Err(e) => {
                warn!(pid = process.pid, error = %e, "CPU meter unavailable, using fallback");
                return CpuReading::fallback(attribution);
            }
        };

        let sample = CpuSample {
            pid: process.pid,
            cumulative_secs,
            at: now,
        };
        let delta = cpu_delta(self.last.as_ref(), &sample, self.cores);
        self.last = Some(sample);

        match delta {
            CpuDelta::Percent(percent) => CpuReading {
                percent,
                attribution,
                source: ReadingSource::Measured,
            },
            CpuDelta::First => CpuReading::first_sample(attribution),
            CpuDelta::Reset => {
                debug!(pid = process.pid, "CPU counter went backwards, treating as a new process");
                CpuReading {
                    source: ReadingSource::Reset,
                    ..CpuReading::first_sample(attribution)
                }
            }
        }
    }
}

/// Process presence plus the CPU reading for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub snapshot: ProcessSnapshot,
    /// `None` when neither the launcher nor the in-session process exists.
    pub reading: Option<CpuReading>,
}

/// Combines process enumeration and CPU sampling.
pub struct Sampler {
    lister: Arc<dyn ProcessLister>,
    meter: Arc<dyn CpuMeter>,
    tracker: CpuTracker,
}

impl Sampler {
    pub fn new(lister: Arc<dyn ProcessLister>, meter: Arc<dyn CpuMeter>, cores: usize) -> Self {
        Self {
            lister,
            meter,
            tracker: CpuTracker::new(cores),
        }
    }

    /// Current process presence without touching CPU state.
    pub fn snapshot(&self) -> Result<ProcessSnapshot, SampleError> {
        take_snapshot(self.lister.as_ref())
    }

    /// Sample presence and CPU for one tick.
    pub fn observe(&mut self, now: Instant) -> Result<Observation, SampleError> {
        let snapshot = self.snapshot()?;
        let reading = snapshot.measured_process().map(|(process, attribution)| {
            self.tracker
                .measure(self.meter.as_ref(), process, attribution, now)
        });
        Ok(Observation { snapshot, reading })
    }

    /// Collaborators and CPU history for a deferred check.
    pub fn probe(&self) -> SessionProbe {
        SessionProbe {
            lister: Arc::clone(&self.lister),
            meter: Arc::clone(&self.meter),
            tracker: self.tracker.clone(),
        }
    }

    /// Drop CPU history, e.g. when monitoring restarts.
    pub fn reset(&mut self) {
        self.tracker.reset();
    }
}

/// Detached copy of the sampler used by delayed re-checks.
///
/// It owns its own CPU history so deferred work never mutates the engine.
pub struct SessionProbe {
    lister: Arc<dyn ProcessLister>,
    meter: Arc<dyn CpuMeter>,
    tracker: CpuTracker,
}

impl SessionProbe {
    pub fn snapshot(&self) -> Result<ProcessSnapshot, SampleError> {
        take_snapshot(self.lister.as_ref())
    }

    /// Presence of the in-session process plus a fresh reading for it.
    pub fn check_session(&mut self, now: Instant) -> Result<Option<CpuReading>, SampleError> {
        let snapshot = self.snapshot()?;
        Ok(snapshot.session.as_ref().map(|process| {
            self.tracker
                .measure(self.meter.as_ref(), process, Attribution::Session, now)
        }))
    }
}

fn take_snapshot(lister: &dyn ProcessLister) -> Result<ProcessSnapshot, SampleError> {
    let entries = lister.list()?;
    if entries.is_empty() {
        return Err(SampleError::EmptyProcessList);
    }
    Ok(ProcessSnapshot::from_entries(&entries))
}
