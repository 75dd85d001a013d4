//! Monitoring engine.
//!
//! A single task owns the [`MatchStateMachine`] and is the only writer of
//! monitoring state. Control requests arrive through an [`EngineHandle`],
//! periodic sampling comes from an interval that exists only while monitoring
//! is running, and delayed re-checks run as detached jobs that report back
//! over a channel tagged with the session generation that scheduled them.

use crate::core_logic::{
    tally, Action, EndCheck, EndVerdict, EngineSettings, MatchStateMachine,
};
use crate::display_control::DisplayManager;
use crate::error::{DisplayError, EngineError, SampleError};
use crate::notifier::UiNotifier;
use crate::resolution::{Resolution, ResolutionConfig, ResolutionPair, ResolutionTarget};
use crate::sampler::{Sampler, SessionProbe};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Capacity of the control request queue.
const COMMAND_QUEUE: usize = 32;

/// Engine timing: sampling period plus the state machine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub tick_interval: Duration,
    pub engine: EngineSettings,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            engine: EngineSettings::default(),
        }
    }
}

/// Snapshot of the engine for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub state: &'static str,
    pub calibrated: bool,
    pub baseline: Option<f64>,
    pub threshold: Option<f64>,
    pub display_switched: bool,
    pub game_resolution: Resolution,
    pub desktop_resolution: Resolution,
    /// Last resolution the display helper applied successfully.
    pub last_applied: Option<Resolution>,
}

/// Outcome of a delayed job, tagged with the generation that scheduled it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deferred {
    StartRecheck { generation: u64, session_present: bool },
    EndVerdict { generation: u64, verdict: EndVerdict },
}

impl Deferred {
    fn generation(&self) -> u64 {
        match self {
            Deferred::StartRecheck { generation, .. } | Deferred::EndVerdict { generation, .. } => {
                *generation
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum JobKind {
    StartRecheck,
    EndConfirmation {
        checks: u32,
        spacing: Duration,
        bound: f64,
    },
}

/// Delayed re-check waiting to be run.
pub struct DeferredJob {
    generation: u64,
    delay: Duration,
    kind: JobKind,
    probe: SessionProbe,
}

impl DeferredJob {
    /// Wait out the delay, run the checks, and produce the outcome.
    pub async fn run(self) -> Deferred {
        tokio::time::sleep(self.delay).await;

        match self.kind {
            JobKind::StartRecheck => {
                let probe = self.probe;
                let session_present = match off_runtime(move || probe.snapshot()).await {
                    Ok(snapshot) => snapshot.session_present(),
                    Err(e) => {
                        warn!(error = %e, "Start re-check could not read processes");
                        false
                    }
                };
                Deferred::StartRecheck {
                    generation: self.generation,
                    session_present,
                }
            }
            JobKind::EndConfirmation {
                checks,
                spacing,
                bound,
            } => {
                let probe = Arc::new(Mutex::new(self.probe));
                let mut results = Vec::with_capacity(checks as usize);
                for i in 0..checks {
                    if i > 0 {
                        tokio::time::sleep(spacing).await;
                    }
                    let at = now();
                    let probe = Arc::clone(&probe);
                    let reading = off_runtime(move || {
                        probe
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .check_session(at)
                    })
                    .await;
                    let check = match reading {
                        Ok(Some(reading)) => EndCheck::Reading(reading),
                        Ok(None) => EndCheck::SessionAbsent,
                        Err(e) => {
                            debug!(error = %e, "End check without process data");
                            EndCheck::Failed
                        }
                    };
                    debug!(
                        check = i + 1,
                        checks,
                        ?check,
                        out = check.is_out_of_match(bound),
                        "End check"
                    );
                    results.push(check);
                }
                Deferred::EndVerdict {
                    generation: self.generation,
                    verdict: tally(&results, bound),
                }
            }
        }
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Run a process-table query on the blocking pool.
async fn off_runtime<T, F>(query: F) -> Result<T, SampleError>
where
    F: FnOnce() -> Result<T, SampleError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(query)
        .await
        .unwrap_or_else(|e| {
            Err(SampleError::ProcessListUnavailable(format!(
                "sampling task failed: {}",
                e
            )))
        })
}

enum Command {
    Start {
        resolutions: Option<ResolutionPair>,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    UpdateResolutions {
        resolutions: ResolutionPair,
        reply: oneshot::Sender<()>,
    },
    SetResolutionNow {
        resolution: Resolution,
        reply: oneshot::Sender<Result<(), DisplayError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Cloneable control surface of a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Start (or restart) monitoring, optionally replacing the resolution pair.
    pub async fn start(&self, resolutions: Option<ResolutionPair>) -> Result<(), EngineError> {
        self.request(|reply| Command::Start { resolutions, reply })
            .await
    }

    /// Stop monitoring, restoring the desktop resolution if needed.
    pub async fn stop(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn update_resolutions(&self, resolutions: ResolutionPair) -> Result<(), EngineError> {
        self.request(|reply| Command::UpdateResolutions { resolutions, reply })
            .await
    }

    /// Apply a resolution immediately, outside the state machine.
    pub async fn set_resolution_now(&self, resolution: Resolution) -> Result<(), EngineError> {
        self.request(|reply| Command::SetResolutionNow { resolution, reply })
            .await?
            .map_err(EngineError::from)
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| Command::Status { reply }).await
    }
}

/// Owner of all monitoring state.
pub struct MonitorEngine {
    machine: MatchStateMachine,
    sampler: Arc<Mutex<Sampler>>,
    display: Arc<DisplayManager>,
    notifier: Arc<dyn UiNotifier>,
    resolutions: Arc<ResolutionConfig>,
    tick_interval: Duration,
    running: bool,
    /// Bumped on every start; the sampling interval is rebuilt per session.
    session: u64,
    /// Bumped on start, stop and cancellation; outcomes from older
    /// generations are dropped.
    generation: u64,
    pending: Vec<DeferredJob>,
}

impl MonitorEngine {
    pub fn new(
        sampler: Sampler,
        display: Arc<DisplayManager>,
        notifier: Arc<dyn UiNotifier>,
        resolutions: Arc<ResolutionConfig>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            machine: MatchStateMachine::new(settings.engine),
            sampler: Arc::new(Mutex::new(sampler)),
            display,
            notifier,
            resolutions,
            tick_interval: settings.tick_interval,
            running: false,
            session: 0,
            generation: 0,
            pending: Vec::new(),
        }
    }

    /// Run the engine on its own task.
    pub fn spawn(self) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let task = tokio::spawn(self.run(rx));
        (EngineHandle { tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (deferred_tx, mut deferred_rx) = mpsc::unbounded_channel();
        let mut ticker: Option<Interval> = None;
        let mut ticker_session = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All engine handles dropped, exiting");
                        break;
                    }
                },
                Some(outcome) = deferred_rx.recv() => self.handle_deferred(outcome).await,
                _ = next_tick(&mut ticker) => self.tick().await,
            }

            for job in self.take_jobs() {
                let tx = deferred_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(job.run().await);
                });
            }

            if !self.running {
                ticker = None;
                ticker_session = None;
            } else if ticker_session != Some(self.session) {
                let mut interval = tokio::time::interval(self.tick_interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker = Some(interval);
                ticker_session = Some(self.session);
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { resolutions, reply } => {
                self.start(resolutions).await;
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::UpdateResolutions { resolutions, reply } => {
                self.update_resolutions(resolutions);
                let _ = reply.send(());
            }
            Command::SetResolutionNow { resolution, reply } => {
                let result = self.set_resolution_now(resolution).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Begin a fresh monitoring session. A running session is stopped first.
    pub async fn start(&mut self, resolutions: Option<ResolutionPair>) {
        if self.running {
            info!("Monitoring restart requested");
            self.stop().await;
        }
        if let Some(pair) = resolutions {
            self.resolutions.replace(pair);
        }

        self.machine.reset();
        self.sampler().reset();
        self.pending.clear();
        self.session += 1;
        self.generation += 1;
        self.running = true;

        let pair = self.resolutions.get();
        info!(
            game = %pair.game,
            desktop = %pair.desktop,
            tick_ms = self.tick_interval.as_millis() as u64,
            generation = self.generation,
            "Monitoring started"
        );
        self.notifier.show();
        self.notifier
            .notify("Monitoring started - start the game and wait in the menu");
    }

    /// End the session. Idempotent.
    pub async fn stop(&mut self) {
        if !self.running {
            debug!("Stop requested while idle");
            return;
        }
        let actions = self.machine.stop();
        self.execute(actions).await;
        self.running = false;
        self.generation += 1;
        self.pending.clear();
        info!("Monitoring stopped");
    }

    /// Swap the resolution pair; takes effect on the next resolution change.
    pub fn update_resolutions(&mut self, pair: ResolutionPair) {
        self.resolutions.replace(pair);
        info!(game = %pair.game, desktop = %pair.desktop, "Resolutions updated");
        self.notifier.notify(&format!(
            "Resolution settings updated: Game {}, Desktop {}",
            pair.game, pair.desktop
        ));
    }

    /// Apply `resolution` right away without touching monitoring state.
    pub async fn set_resolution_now(&mut self, resolution: Resolution) -> Result<(), DisplayError> {
        let result = self.display.apply(resolution).await;
        match &result {
            Ok(()) => self
                .notifier
                .notify(&format!("Resolution changed to {}", resolution)),
            Err(e) => {
                error!(%resolution, error = %e, "Manual resolution change failed");
                self.notifier
                    .notify(&format!("Resolution change failed: {}", e));
            }
        }
        result
    }

    pub fn status(&self) -> EngineStatus {
        let calibration = self.machine.calibration();
        let pair = self.resolutions.get();
        EngineStatus {
            running: self.running,
            state: if self.running {
                self.machine.state().name()
            } else {
                "Stopped"
            },
            calibrated: self.machine.learner().is_calibrated(),
            baseline: calibration.map(|c| c.baseline),
            threshold: calibration.map(|c| c.threshold),
            display_switched: self.machine.display_switched(),
            game_resolution: pair.game,
            desktop_resolution: pair.desktop,
            last_applied: self.display.last_applied(),
        }
    }

    /// Sample once and advance the state machine.
    pub async fn tick(&mut self) {
        if !self.running {
            return;
        }
        let now = now();
        let sampler = Arc::clone(&self.sampler);
        let observed = off_runtime(move || {
            sampler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .observe(now)
        })
        .await;
        let observation = match observed {
            Ok(observation) => observation,
            Err(e) => {
                warn!(
                    state = self.machine.state().name(),
                    error = %e,
                    "No process data this tick, keeping state"
                );
                return;
            }
        };
        let actions = self.machine.observe(&observation, now);
        self.execute(actions).await;
    }

    /// Feed a deferred outcome back into the state machine.
    pub async fn handle_deferred(&mut self, outcome: Deferred) {
        if !self.running || outcome.generation() != self.generation {
            debug!(
                generation = outcome.generation(),
                current = self.generation,
                "Dropping stale deferred outcome"
            );
            return;
        }
        let actions = match outcome {
            Deferred::StartRecheck {
                session_present, ..
            } => self.machine.on_start_recheck(session_present),
            Deferred::EndVerdict { verdict, .. } => self.machine.on_end_verdict(verdict),
        };
        self.execute(actions).await;
    }

    /// Jobs scheduled since the last call.
    pub fn take_jobs(&mut self) -> Vec<DeferredJob> {
        std::mem::take(&mut self.pending)
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Notify(status) => self.notifier.notify(&status),
                Action::HideUi => self.notifier.hide(),
                Action::ShowUi => self.notifier.show(),
                Action::ApplyResolution(target) => self.apply(target).await,
                Action::CancelDeferred => self.cancel_deferred(),
                Action::ScheduleStartRecheck { after } => {
                    self.schedule(after, JobKind::StartRecheck);
                }
                Action::ScheduleEndConfirmation {
                    after,
                    checks,
                    spacing,
                    bound,
                } => {
                    self.schedule(
                        after,
                        JobKind::EndConfirmation {
                            checks,
                            spacing,
                            bound,
                        },
                    );
                }
            }
        }
    }

    fn schedule(&mut self, delay: Duration, kind: JobKind) {
        if !self.running {
            return;
        }
        debug!(?kind, delay_ms = delay.as_millis() as u64, "Scheduling deferred check");
        let probe = self.sampler().probe();
        self.pending.push(DeferredJob {
            generation: self.generation,
            delay,
            kind,
            probe,
        });
    }

    /// Invalidate every outstanding deferred job of this session.
    fn cancel_deferred(&mut self) {
        self.generation += 1;
        self.pending.clear();
        debug!(generation = self.generation, "Outstanding deferred checks cancelled");
    }

    fn sampler(&self) -> MutexGuard<'_, Sampler> {
        self.sampler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn apply(&self, target: ResolutionTarget) {
        let resolution = self.resolutions.resolve(target);
        let label = match target {
            ResolutionTarget::Game => "Game",
            ResolutionTarget::Desktop => "Desktop",
        };
        match self.display.apply(resolution).await {
            Ok(()) => self
                .notifier
                .notify(&format!("{} resolution set to {}", label, resolution)),
            Err(e) => {
                error!(?target, %resolution, error = %e, "Resolution change failed");
                self.notifier
                    .notify(&format!("Resolution change failed: {}", e));
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
