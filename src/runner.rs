//! The runner: owns the global lifecycle of one test run.
//!
//! Mirrors the reference implementation's `Runner`/`Worker.run` split
//! (`asyncio.to_thread(worker.run, n_users)` plus `asyncio.gather`) with
//! Rust's two-level concurrency made explicit: one OS thread per worker,
//! joined tolerantly at the end so one worker's crash never hides the
//! others' results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::scenario::User;
use crate::session::InstrumentedSession;
use crate::stats::{render_error_table, StatsAggregator, StatsHandle};
use crate::worker::{distribute_evenly, spawn_worker};

/// `idle -> running -> draining -> done`, monotone per run. See spec §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Draining,
    Done,
}

/// The knobs `run_test` needs. `event_loops` defaults to half the CPU count
/// (the workload is I/O-bound; more loops than that contend rather than
/// accelerate) when left unset.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub users: usize,
    pub event_loops: Option<usize>,
    /// Virtual users launched per second during ramp-up. `None` launches
    /// every virtual user immediately.
    pub spawn_rate: Option<f64>,
    pub duration: Option<Duration>,
}

impl RunnerConfig {
    pub fn resolved_event_loops(&self) -> usize {
        self.event_loops.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(1))
                .unwrap_or(1)
        })
    }
}

/// One worker thread's crash, collected tolerantly rather than aborting
/// the whole run.
#[derive(Debug)]
pub struct WorkerFailure {
    pub worker_id: usize,
    pub message: String,
}

/// What `run_test` hands back once every worker has joined.
pub struct RunResult {
    pub cumulative: crate::stats::Snapshot,
    pub error_signatures: Vec<(String, u64)>,
    pub worker_failures: Vec<WorkerFailure>,
}

/// Owns one test run's lifecycle. Construct one per run — starting and
/// stopping twice in the same process must produce independent aggregates,
/// so `Runner::new` always creates a fresh `StatsAggregator`.
pub struct Runner<U: User> {
    state: RunnerState,
    running: Arc<AtomicBool>,
    stats: StatsAggregator,
    start_time: Option<Instant>,
    _marker: std::marker::PhantomData<U>,
}

impl<U: User> Runner<U> {
    pub fn new() -> Self {
        Self {
            state: RunnerState::Idle,
            running: Arc::new(AtomicBool::new(false)),
            stats: StatsAggregator::new(),
            start_time: None,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// A handle into this run's aggregator, for sessions and for tests that
    /// want to inspect stats mid-run.
    pub fn stats(&self) -> StatsHandle {
        self.stats.handle()
    }

    /// A clone of the shared `running` flag. Exposed so a caller (e.g. a
    /// custom signal handler, or a test) can trigger shutdown externally
    /// without going through SIGINT.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Flips `running` to false. Idempotent; does nothing once the run has
    /// already started draining.
    pub fn shutdown(&mut self) {
        if self.state == RunnerState::Running {
            self.running.store(false, Ordering::SeqCst);
            self.state = RunnerState::Draining;
        }
    }

    /// Runs the whole test: spawns workers, optionally ramps them up,
    /// drives the periodic printer and duration-based shutdown, installs a
    /// two-state SIGINT handler, then joins every worker tolerantly and
    /// returns the final summary.
    pub async fn run_test(&mut self, config: RunnerConfig, session: InstrumentedSession) -> RunResult {
        assert_eq!(self.state, RunnerState::Idle, "run_test called twice on one Runner");
        self.state = RunnerState::Running;
        self.running.store(true, Ordering::SeqCst);
        self.start_time = Some(Instant::now());

        let event_loops = config.resolved_event_loops().max(1);
        let per_worker = distribute_evenly(config.users, event_loops);
        info!(users = config.users, event_loops, ?per_worker, "starting run");

        let immediate = config.spawn_rate.is_none();
        let mut handles = Vec::with_capacity(event_loops);
        let mut launch_txs = Vec::with_capacity(event_loops);
        for (worker_id, &count) in per_worker.iter().enumerate() {
            let initial = if immediate { count } else { 0 };
            let (handle, tx) = spawn_worker::<U>(
                worker_id,
                initial,
                Arc::clone(&self.running),
                session.clone(),
            );
            handles.push(handle);
            launch_txs.push(tx);
        }

        let printer_handle = {
            let stats = self.stats.handle();
            let running = Arc::clone(&self.running);
            tokio::spawn(async move { print_periodic(stats, running).await })
        };

        let ramp_handle = if !immediate {
            let rate = config.spawn_rate.unwrap();
            let running = Arc::clone(&self.running);
            Some(tokio::spawn(async move {
                ramp_up(rate, per_worker, launch_txs, running).await
            }))
        } else {
            None
        };

        let sigint_running = Arc::clone(&self.running);
        let sigint_handle = tokio::spawn(async move { watch_sigint(sigint_running).await });

        if let Some(duration) = config.duration {
            let running = Arc::clone(&self.running);
            tokio::time::sleep(duration).await;
            running.store(false, Ordering::SeqCst);
        } else {
            // No duration configured: wait until SIGINT or an external
            // `shutdown()` flips `running`. Poll rather than condvar since
            // the flag has many potential writers (signal handler, caller).
            while self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        self.state = RunnerState::Draining;
        sigint_handle.abort();
        if let Some(h) = ramp_handle {
            h.abort();
        }
        printer_handle.abort();

        let mut worker_failures = Vec::new();
        for (worker_id, handle) in handles.into_iter().enumerate() {
            if let Err(panic) = handle.join() {
                let message = panic_message(panic);
                error!(worker_id, message = %message, "worker thread panicked");
                worker_failures.push(WorkerFailure { worker_id, message });
            }
        }

        self.state = RunnerState::Done;

        let cumulative = self.stats.handle().snapshot_cumulative();
        let error_signatures = self.stats.handle().error_signatures();
        print_summary(&cumulative, &error_signatures);

        RunResult {
            cumulative,
            error_signatures,
            worker_failures,
        }
    }
}

impl<U: User> Default for Runner<U> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked with a non-string payload".to_string()
    }
}

/// Prints the live table every 2 seconds, skipping the very first tick so
/// there's at least one interval's worth of data to show.
async fn print_periodic(stats: StatsHandle, running: Arc<AtomicBool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(2));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut first = true;
    loop {
        interval.tick().await;
        if !running.load(Ordering::SeqCst) {
            return;
        }
        if first {
            first = false;
            continue;
        }
        let snapshot = stats.snapshot_interval();
        println!("{}", snapshot.render(None));
    }
}

/// Prints the final "Summary" table followed by the error-signature table,
/// if any errors were recorded.
fn print_summary(cumulative: &crate::stats::Snapshot, error_signatures: &[(String, u64)]) {
    println!("{}", cumulative.render(Some("Summary")));
    if let Some(table) = render_error_table(error_signatures) {
        println!("{table}");
    }
}

/// First SIGINT flips `running` to false (causing the run to drain and the
/// final summary to print via the normal `run_test` return path); a second
/// SIGINT terminates the process immediately without waiting for workers
/// to drain, matching the reference tool's "restore the default handler"
/// behavior.
async fn watch_sigint(running: Arc<AtomicBool>) {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to install SIGINT handler");
        return;
    }
    println!("\nStopping...");
    running.store(false, Ordering::SeqCst);

    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(130);
    }
}

/// Token-bucket spawn-rate ramp: accumulates a fractional budget every
/// tick (tick = 1s) so non-integer rates are honored over time, then
/// dispatches whole VUs round-robin across workers via each worker's
/// `launch_more` channel, never exceeding that worker's share of the
/// even distribution.
async fn ramp_up(
    rate: f64,
    per_worker_targets: Vec<usize>,
    launch_txs: Vec<mpsc::UnboundedSender<usize>>,
    running: Arc<AtomicBool>,
) {
    let mut launched = vec![0usize; per_worker_targets.len()];
    let mut budget = 0.0f64;
    let mut next_worker = 0usize;
    let total_target: usize = per_worker_targets.iter().sum();
    let mut total_launched = 0usize;

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while total_launched < total_target && running.load(Ordering::SeqCst) {
        interval.tick().await;
        budget += rate;
        let mut tokens = budget.floor() as usize;
        budget -= tokens as f64;

        while tokens > 0 && total_launched < total_target {
            let mut dispatched = false;
            for _ in 0..per_worker_targets.len() {
                let w = next_worker;
                next_worker = (next_worker + 1) % per_worker_targets.len();
                if launched[w] < per_worker_targets[w] {
                    if launch_txs[w].send(1).is_err() {
                        warn!(worker = w, "worker's launch channel closed during ramp-up");
                    }
                    launched[w] += 1;
                    total_launched += 1;
                    tokens -= 1;
                    dispatched = true;
                    break;
                }
            }
            if !dispatched {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::SimpleUser;

    fn test_session() -> InstrumentedSession {
        let stats = StatsAggregator::new().handle();
        InstrumentedSession::new(reqwest::Client::new(), stats)
    }

    #[test]
    fn new_runner_starts_idle() {
        let runner: Runner<SimpleUser> = Runner::new();
        assert_eq!(runner.state(), RunnerState::Idle);
    }

    #[tokio::test]
    async fn run_test_with_duration_transitions_through_states_and_returns() {
        let mut runner: Runner<SimpleUser> = Runner::new();
        let config = RunnerConfig {
            users: 2,
            event_loops: Some(1),
            spawn_rate: None,
            duration: Some(Duration::from_millis(50)),
        };
        let result = runner.run_test(config, test_session()).await;
        assert_eq!(runner.state(), RunnerState::Done);
        assert!(result.worker_failures.is_empty());
    }

    #[test]
    fn resolved_event_loops_defaults_to_half_cpu_count_floor_one() {
        let config = RunnerConfig {
            users: 4,
            event_loops: None,
            spawn_rate: None,
            duration: None,
        };
        assert!(config.resolved_event_loops() >= 1);
    }

    #[tokio::test]
    async fn fresh_runner_per_test_has_independent_stats() {
        let a: Runner<SimpleUser> = Runner::new();
        let b: Runner<SimpleUser> = Runner::new();
        a.stats().record(crate::request::RequestEvent::success(
            "/x",
            Duration::from_millis(1),
            Duration::from_millis(1),
        ));
        assert_eq!(a.stats().snapshot_cumulative().entry("/x").unwrap().count, 1);
        assert!(b.stats().snapshot_cumulative().entry("/x").is_none());
    }
}
