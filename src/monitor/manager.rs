//! Polling loop that turns pipeline snapshots into notifications
//!
//! A [`Monitor`] owns one background task per `start`. Each cycle runs
//! fetch → diff → notify → commit → publish to completion before the next
//! tick is awaited, so cycles never overlap. `stop` wakes the sleeping task
//! and bumps a generation counter; a cycle that was already waiting on the
//! network when `stop` happened notices the stale generation and drops its
//! results instead of applying them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::differ::diff;
use super::fetcher::{FetchError, StatusFetcher};
use super::gate::{NotificationGate, DEFAULT_COOLDOWN};
use super::ledger::StatusLedger;
use super::model::{PipelineStatus, ProjectId, ProjectSnapshot, Transition};
use crate::notify::{Notification, NotificationSink};

/// Default time between two poll cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Shorter intervals are raised to this value
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive fatal cycle failures before subscribers are alerted
pub const DEFAULT_FAILURE_ALERT_THRESHOLD: u32 = 3;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Called with the full snapshot list after every completed cycle.
/// Runs on the polling task while `stop` is blocked, so it must not call
/// `stop` or `start` itself.
pub type UpdateCallback = Arc<dyn Fn(&[ProjectSnapshot]) + Send + Sync>;

/// Events published to subscribers
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A cycle completed; carries every snapshot it observed
    Updated(Arc<Vec<ProjectSnapshot>>),
    /// Project listing failed; monitoring keeps ticking
    CycleFailed {
        consecutive: u32,
        auth_rejected: bool,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Running,
}

/// Tunables for a monitor instance
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub cooldown: Duration,
    pub notifications_enabled: bool,
    pub failure_alert_threshold: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            notifications_enabled: true,
            failure_alert_threshold: DEFAULT_FAILURE_ALERT_THRESHOLD,
        }
    }
}

/// State mutated only by the cycle logic
struct Tracking {
    ledger: StatusLedger,
    gate: NotificationGate,
    latest: Vec<ProjectSnapshot>,
    consecutive_failures: u32,
}

struct Engine {
    fetcher: Arc<dyn StatusFetcher>,
    sink: Arc<dyn NotificationSink>,
    settings: MonitorSettings,
    tracking: Mutex<Tracking>,
    /// Held from the last generation check until the cycle is published
    publishing: Mutex<()>,
    generation: AtomicU64,
    events: broadcast::Sender<MonitorEvent>,
}

struct ActiveRun {
    cancel: watch::Sender<bool>,
    project_ids: BTreeSet<ProjectId>,
}

/// Pipeline status monitor
pub struct Monitor {
    engine: Arc<Engine>,
    active: Option<ActiveRun>,
}

impl Monitor {
    pub fn new(
        fetcher: Arc<dyn StatusFetcher>,
        sink: Arc<dyn NotificationSink>,
        settings: MonitorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let tracking = Tracking {
            ledger: StatusLedger::new(),
            gate: NotificationGate::new(settings.cooldown),
            latest: Vec::new(),
            consecutive_failures: 0,
        };

        Self {
            engine: Arc::new(Engine {
                fetcher,
                sink,
                settings,
                tracking: Mutex::new(tracking),
                publishing: Mutex::new(()),
                generation: AtomicU64::new(0),
                events,
            }),
            active: None,
        }
    }

    /// Start polling `project_ids` every `interval`.
    ///
    /// Runs the first cycle immediately. Calling this while already running
    /// restarts with the new arguments. Ledger and cooldown entries for
    /// projects outside the new set are purged. Must be called from within a
    /// Tokio runtime.
    pub fn start(
        &mut self,
        project_ids: impl IntoIterator<Item = ProjectId>,
        interval: Duration,
        on_update: UpdateCallback,
    ) {
        self.stop();

        let project_ids: BTreeSet<ProjectId> = project_ids.into_iter().collect();
        let interval = if interval < MIN_POLL_INTERVAL {
            warn!(
                "Poll interval {:?} is below the minimum, using {:?}",
                interval, MIN_POLL_INTERVAL
            );
            MIN_POLL_INTERVAL
        } else {
            interval
        };

        {
            let mut tracking = self.engine.tracking();
            tracking.ledger.retain(&project_ids);
            tracking.gate.retain(&project_ids);
            tracking.latest.retain(|s| project_ids.contains(&s.id));
            tracking.consecutive_failures = 0;
        }

        let generation = self.engine.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, cancel_rx) = watch::channel(false);

        tokio::spawn(poll_loop(
            Arc::clone(&self.engine),
            generation,
            project_ids.clone(),
            interval,
            on_update,
            cancel_rx,
        ));

        info!(
            "Started monitoring {} projects with {}s interval",
            project_ids.len(),
            interval.as_secs()
        );

        self.active = Some(ActiveRun {
            cancel,
            project_ids,
        });
    }

    /// Stop polling. No-op when already idle.
    ///
    /// Waits for a cycle that is being published; nothing is published
    /// once this returns.
    pub fn stop(&mut self) {
        if let Some(run) = self.active.take() {
            {
                let _publishing = self.engine.publishing();
                self.engine.generation.fetch_add(1, Ordering::SeqCst);
            }
            let _ = run.cancel.send(true);
            info!("Stopped monitoring {} projects", run.project_ids.len());
        }
    }

    pub fn state(&self) -> MonitorState {
        if self.active.is_some() {
            MonitorState::Running
        } else {
            MonitorState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Projects of the current run, if any
    pub fn project_ids(&self) -> Option<&BTreeSet<ProjectId>> {
        self.active.as_ref().map(|run| &run.project_ids)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.engine.events.subscribe()
    }

    /// Snapshots published by the last completed cycle
    pub fn latest(&self) -> Vec<ProjectSnapshot> {
        self.engine.tracking().latest.clone()
    }

    pub fn ledger_status(&self, project_id: ProjectId) -> Option<PipelineStatus> {
        self.engine.tracking().ledger.get(project_id)
    }

    pub fn ledger_snapshots(&self) -> Vec<ProjectSnapshot> {
        self.engine.tracking().ledger.snapshots().cloned().collect()
    }

    /// Seed the ledger with previously persisted snapshots (call before `start`)
    pub fn restore_ledger(&self, snapshots: impl IntoIterator<Item = ProjectSnapshot>) {
        self.engine.tracking().ledger.restore(snapshots);
    }

    /// Forget every known status and cooldown
    pub fn reset(&self) {
        let mut tracking = self.engine.tracking();
        tracking.ledger.reset();
        tracking.gate.reset();
        tracking.latest.clear();
        tracking.consecutive_failures = 0;
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    engine: Arc<Engine>,
    generation: u64,
    project_ids: BTreeSet<ProjectId>,
    interval: Duration,
    on_update: UpdateCallback,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            _ = ticker.tick() => {}
        }

        if !engine.is_current(generation) {
            break;
        }
        engine.run_cycle(generation, &project_ids, &on_update).await;
    }

    debug!(generation, "Polling loop finished");
}

impl Engine {
    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publishing(&self) -> MutexGuard<'_, ()> {
        self.publishing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn run_cycle(
        &self,
        generation: u64,
        project_ids: &BTreeSet<ProjectId>,
        on_update: &UpdateCallback,
    ) {
        let snapshots = match self.fetcher.fetch_all(project_ids).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                if self.is_current(generation) {
                    self.record_failure(&e);
                }
                return;
            }
        };

        if !self.is_current(generation) {
            debug!(generation, "Discarding results of a cancelled cycle");
            return;
        }

        let previous = self.tracking().ledger.statuses();
        let transitions = diff(&previous, &snapshots);
        debug!(
            "Cycle observed {} projects, {} transitions",
            snapshots.len(),
            transitions.len()
        );

        for transition in &transitions {
            if !self.is_current(generation) {
                return;
            }
            self.dispatch(transition).await;
        }

        let _publishing = self.publishing();
        if !self.is_current(generation) {
            debug!(generation, "Monitor stopped before the cycle was published");
            return;
        }

        {
            let mut tracking = self.tracking();
            tracking.ledger.commit_all(&snapshots);
            tracking.latest = snapshots.clone();
            tracking.consecutive_failures = 0;
        }

        on_update(&snapshots);
        let _ = self.events.send(MonitorEvent::Updated(Arc::new(snapshots)));
    }

    /// Notify about one transition; failures stay local to this transition.
    async fn dispatch(&self, transition: &Transition) {
        let project_id = transition.project_id;
        let status = transition.to;
        let name = &transition.snapshot.name;

        if !self.settings.notifications_enabled {
            info!(
                "Project {} changed to {} (notifications disabled)",
                name, status
            );
            return;
        }

        let allowed = self.tracking().gate.allow(project_id, status, Instant::now());
        if !allowed {
            debug!("Notification for {} ({}) suppressed by cooldown", name, status);
            return;
        }

        let notification = Notification::for_transition(transition);
        match self.sink.deliver(&notification).await {
            Ok(()) => {
                self.tracking()
                    .gate
                    .mark_fired(project_id, status, Instant::now());
                info!("Notification sent for project {}: {}", name, status);
            }
            Err(e) => {
                warn!("Failed to send notification for project {}: {}", name, e);
            }
        }
    }

    fn record_failure(&self, error: &FetchError) {
        let consecutive = {
            let mut tracking = self.tracking();
            tracking.consecutive_failures += 1;
            tracking.consecutive_failures
        };
        warn!(
            "Failed to get project status (consecutive failures: {}): {}",
            consecutive, error
        );

        let auth_rejected = error.is_auth();
        if auth_rejected || consecutive >= self.settings.failure_alert_threshold {
            let _ = self.events.send(MonitorEvent::CycleFailed {
                consecutive,
                auth_rejected,
                message: error.to_string(),
            });
        }
    }
}
