//! Spawns and retires virtual users to follow a ramp profile

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::RampProfile;
use crate::metrics::Aggregator;
use crate::run::{RunClock, RunState};
use crate::vu::{ExecutorExit, ExecutorSettings, VirtualUserExecutor, VirtualUserId, Workload};

/// Upper bound on the delay before replacing lost workers
const MAX_RESPAWN_BACKOFF: Duration = Duration::from_secs(5);

/// Action needed to move from `current` to `target` virtual users
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    Hold,
    Spawn(u32),
    /// Retire this many of the most recently spawned virtual users
    Retire(u32),
}

pub fn reconcile(current: u32, target: u32) -> Reconcile {
    match current.cmp(&target) {
        std::cmp::Ordering::Less => Reconcile::Spawn(target - current),
        std::cmp::Ordering::Greater => Reconcile::Retire(current - target),
        std::cmp::Ordering::Equal => Reconcile::Hold,
    }
}

/// Why the scheduler is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    /// Profile finished
    Complete,
    /// Threshold or operator abort
    Abort,
}

/// Counters collected by the scheduler over a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub spawned: u64,
    /// Virtual users retired because the target dropped
    pub retired: u64,
    pub lost_workers: u64,
    pub peak_active: u32,
    pub iterations: u64,
}

struct RosterEntry {
    id: VirtualUserId,
    token: CancellationToken,
}

/// Tick-driven ramp scheduler
///
/// Owns every executor task. The roster holds non-retired virtual users in
/// spawn order; `running` holds every task that has not exited yet, including
/// retirees finishing their last iteration. A capacity semaphore sized to the
/// concurrency cap keeps `running` within the cap.
pub(crate) struct RampScheduler<W: Workload> {
    profile: RampProfile,
    workload: Arc<W>,
    aggregator: Arc<Aggregator>,
    settings: ExecutorSettings,
    tick_interval: Duration,
    cap: u32,
    state: Arc<watch::Sender<RunState>>,
    vu_token: CancellationToken,
    roster: Vec<RosterEntry>,
    running: BTreeSet<VirtualUserId>,
    tasks: JoinSet<ExecutorExit>,
    capacity: Arc<Semaphore>,
    next_id: VirtualUserId,
    aborted: bool,
    /// Consecutive ticks that reaped lost workers
    lost_streak: u32,
    respawn_at: Option<Instant>,
    report: SchedulerReport,
}

impl<W: Workload> RampScheduler<W> {
    pub(crate) fn new(profile: RampProfile, workload: Arc<W>, aggregator: Arc<Aggregator>) -> Self {
        let cap = profile.max_target();
        let (state, _) = watch::channel(RunState::default());

        Self {
            profile,
            workload,
            aggregator,
            settings: ExecutorSettings::default(),
            tick_interval: Duration::from_millis(100),
            cap,
            state: Arc::new(state),
            vu_token: CancellationToken::new(),
            roster: Vec::new(),
            running: BTreeSet::new(),
            tasks: JoinSet::new(),
            capacity: Arc::new(Semaphore::new(cap as usize)),
            next_id: 1,
            aborted: false,
            lost_streak: 0,
            respawn_at: None,
            report: SchedulerReport::default(),
        }
    }

    pub(crate) fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub(crate) fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Lower the concurrency cap below the profile maximum
    pub(crate) fn with_cap(mut self, cap: u32) -> Self {
        self.cap = cap.min(self.profile.max_target());
        self.capacity = Arc::new(Semaphore::new(self.cap as usize));
        self
    }

    pub(crate) fn with_state(mut self, state: Arc<watch::Sender<RunState>>) -> Self {
        self.state = state;
        self
    }

    /// Parent token for every executor
    pub(crate) fn with_token(mut self, token: CancellationToken) -> Self {
        self.vu_token = token;
        self
    }

    /// Tick until stopped, then wait for every executor to exit
    #[instrument(skip_all, fields(cap = self.cap))]
    pub(crate) async fn run(
        mut self,
        clock: RunClock,
        mut stop_rx: oneshot::Receiver<StopMode>,
    ) -> SchedulerReport {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                mode = &mut stop_rx => {
                    // A dropped sender means the controller is gone
                    self.stop(mode.unwrap_or(StopMode::Abort));
                    break;
                }
                _ = ticker.tick() => self.tick(clock),
            }
        }

        self.drain(clock).await;
        self.report
    }

    fn tick(&mut self, clock: RunClock) {
        let lost = self.reap();

        if self.state.borrow().aborted {
            self.aborted = true;
        }

        let elapsed = clock.elapsed();
        let target = if self.aborted {
            0
        } else {
            self.profile.target_at(elapsed).min(self.cap)
        };

        match reconcile(self.roster.len() as u32, target) {
            Reconcile::Hold => {
                if lost == 0 {
                    self.lost_streak = 0;
                    self.respawn_at = None;
                }
            }
            Reconcile::Spawn(count) => {
                if self.respawn_at.is_some_and(|at| Instant::now() < at) {
                    debug!(count, target, "Backing off before replacing lost workers");
                } else {
                    self.spawn(count, target);
                }
            }
            Reconcile::Retire(count) => self.retire(count, target),
        }

        self.publish(Some(elapsed), clock);
    }

    fn spawn(&mut self, count: u32, target: u32) {
        let mut spawned = 0;
        for _ in 0..count {
            let permit = match Arc::clone(&self.capacity).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(
                        running = self.running.len(),
                        target, "Capacity exhausted, deferring spawn"
                    );
                    break;
                }
            };

            let id = self.next_id;
            self.next_id += 1;

            let token = self.vu_token.child_token();
            let executor = VirtualUserExecutor::new(
                id,
                Arc::clone(&self.workload),
                Arc::clone(&self.aggregator),
                &self.settings,
                token.clone(),
            );

            self.tasks.spawn(async move {
                let exit = AssertUnwindSafe(executor.run())
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| ExecutorExit::Lost {
                        id,
                        reason: "executor panicked".to_string(),
                    });
                drop(permit);
                exit
            });

            self.roster.push(RosterEntry { id, token });
            self.running.insert(id);
            spawned += 1;
        }

        if spawned > 0 {
            self.report.spawned += spawned;
            self.report.peak_active = self.report.peak_active.max(self.running.len() as u32);
            debug!(count = spawned, target, active = self.roster.len(), "Spawned virtual users");
        }
    }

    /// Newest first
    fn retire(&mut self, count: u32, target: u32) {
        for _ in 0..count {
            if let Some(entry) = self.roster.pop() {
                entry.token.cancel();
                self.report.retired += 1;
            }
        }
        debug!(count, target, active = self.roster.len(), "Retiring virtual users");
    }

    /// Collect finished executors; returns how many were lost
    fn reap(&mut self) -> u32 {
        let mut lost = 0;
        while let Some(result) = self.tasks.try_join_next() {
            if self.handle_exit(result) {
                lost += 1;
            }
        }

        if lost > 0 {
            self.lost_streak += 1;
            let backoff = self
                .tick_interval
                .saturating_mul(1 << (self.lost_streak - 1).min(6))
                .min(MAX_RESPAWN_BACKOFF);
            self.respawn_at = Some(Instant::now() + backoff);

            // Warn on the first batch and then on every doubling of the streak
            if self.lost_streak.is_power_of_two() {
                warn!(
                    lost,
                    total_lost = self.report.lost_workers,
                    streak = self.lost_streak,
                    backoff_ms = backoff.as_millis() as u64,
                    "Lost virtual users, replacing after backoff"
                );
            } else {
                debug!(lost, total_lost = self.report.lost_workers, "Lost virtual users");
            }
        }
        lost
    }

    /// Returns `true` when the executor was lost
    fn handle_exit(&mut self, result: Result<ExecutorExit, JoinError>) -> bool {
        match result {
            Ok(ExecutorExit::Retired { id, iterations }) => {
                self.running.remove(&id);
                self.report.iterations += iterations;
                false
            }
            Ok(ExecutorExit::Lost { id, reason }) => {
                self.running.remove(&id);
                // Freed slot is refilled by a later reconcile
                self.roster.retain(|entry| entry.id != id);
                self.report.lost_workers += 1;
                debug!(vu = id, reason = %reason, "Lost virtual user");
                true
            }
            Err(e) => {
                warn!("Executor task failed: {}", e);
                false
            }
        }
    }

    fn stop(&mut self, mode: StopMode) {
        if mode == StopMode::Abort {
            self.aborted = true;
            self.state.send_modify(|state| state.aborted = true);
        }

        info!(
            mode = ?mode,
            running = self.running.len(),
            "Stopping virtual users"
        );
        self.roster.clear();
        self.vu_token.cancel();
    }

    async fn drain(&mut self, clock: RunClock) {
        while let Some(result) = self.tasks.join_next().await {
            self.handle_exit(result);
            while let Some(result) = self.tasks.try_join_next() {
                self.handle_exit(result);
            }
            self.publish(None, clock);
        }
        // Tasks that failed to join are gone as well
        self.running.clear();
        self.publish(None, clock);
        debug!(spawned = self.report.spawned, "All virtual users exited");
    }

    fn publish(&self, elapsed: Option<Duration>, clock: RunClock) {
        let elapsed = elapsed.unwrap_or_else(|| clock.elapsed());
        let current_stage = if self.aborted {
            None
        } else {
            self.profile.stage_index_at(elapsed)
        };
        let active = self.running.clone();
        let lost_workers = self.report.lost_workers;

        self.state.send_modify(|state| {
            state.elapsed = elapsed;
            state.current_stage = current_stage;
            state.active_vus = active;
            state.lost_workers = lost_workers;
        });
    }
}
