//! One worker: a dedicated OS thread running its own single-threaded Tokio
//! runtime, hosting some number of virtual users as concurrent tasks.
//!
//! The two-level concurrency here is deliberate and mirrors the reference
//! implementation's `asyncio.to_thread(worker.run, n_users)` plus a fresh
//! event loop per thread, rather than this crate's usual shared
//! multi-threaded runtime: each worker is independent, so a panic or a
//! slow scenario on one thread never starves virtual users hosted on
//! another.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt as _;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::metrics::ACTIVE_VIRTUAL_USERS;
use crate::scenario::{User, UserError};
use crate::session::InstrumentedSession;

/// Spawns one worker thread hosting `initial_users` virtual users of type
/// `U`. Returns the thread's join handle and a channel the runner uses to
/// ask this worker to launch additional VUs during spawn-rate ramp-up.
///
/// The worker keeps running until `running` is cleared and every hosted
/// user's current iteration returns — existing iterations are allowed to
/// finish rather than being aborted mid-flight, so the last request each
/// VU is mid-way through is still recorded.
pub fn spawn_worker<U>(
    worker_id: usize,
    initial_users: usize,
    running: Arc<AtomicBool>,
    session: InstrumentedSession,
) -> (std::thread::JoinHandle<()>, mpsc::UnboundedSender<usize>)
where
    U: User,
{
    let (launch_tx, mut launch_rx) = mpsc::unbounded_channel::<usize>();

    let handle = std::thread::Builder::new()
        .name(format!("worker-{worker_id}"))
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build worker's event loop");

            runtime.block_on(async move {
                let mut tasks: JoinSet<()> = JoinSet::new();

                debug!(worker_id, initial_users, "worker starting");
                for _ in 0..initial_users {
                    spawn_user_loop::<U>(&mut tasks, session.clone(), Arc::clone(&running));
                }

                loop {
                    if tasks.is_empty() && !running.load(Ordering::Relaxed) {
                        break;
                    }

                    tokio::select! {
                        launched = launch_rx.recv() => {
                            match launched {
                                Some(count) => {
                                    debug!(worker_id, count, "launching additional virtual users");
                                    for _ in 0..count {
                                        spawn_user_loop::<U>(&mut tasks, session.clone(), Arc::clone(&running));
                                    }
                                }
                                None if tasks.is_empty() => break,
                                None => {}
                            }
                        }
                        joined = tasks.join_next(), if !tasks.is_empty() => {
                            if let Some(Err(e)) = joined {
                                if e.is_panic() {
                                    error!(worker_id, "a virtual user task panicked");
                                }
                            }
                        }
                    }
                }

                debug!(worker_id, "worker draining remaining tasks");
                while tasks.join_next().await.is_some() {}
            });
        })
        .expect("failed to spawn worker OS thread");

    (handle, launch_tx)
}

fn spawn_user_loop<U>(
    tasks: &mut JoinSet<()>,
    session: InstrumentedSession,
    running: Arc<AtomicBool>,
) where
    U: User,
{
    let stats = session.stats().clone();
    tasks.spawn(async move {
        ACTIVE_VIRTUAL_USERS.inc();
        let mut user = U::new(session);
        if let Err(e) = user.setup().await {
            record_unexpected(&stats, &e);
            ACTIVE_VIRTUAL_USERS.dec();
            return;
        }
        while running.load(Ordering::Relaxed) {
            let outcome = AssertUnwindSafe(user.run()).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => match e {
                    // Already recorded as a RequestEvent by the session that
                    // raised it (status/connect/timeout/assertion) — the VU
                    // just keeps going.
                    UserError::Request(_) => {
                        debug!(error = %e, "virtual user iteration returned a recorded request error");
                    }
                    // A scenario bug the engine can't classify: record its
                    // string form into the error-signature histogram and
                    // print it, but the VU keeps running.
                    other => record_unexpected(&stats, &other),
                },
                // An assertion (or any other panic) unwound out of this
                // iteration. Catching it here, rather than letting it cross
                // the task boundary, means only this iteration is lost — the
                // VU loops around and keeps working, matching the reference
                // tool's "one failed check doesn't kill the user" behavior.
                Err(panic) => {
                    let message = panic_message(panic);
                    record_unexpected(&stats, &UserError::Other(format!("panicked: {message}")));
                }
            }
        }
        if let Err(e) = user.teardown().await {
            record_unexpected(&stats, &e);
        }
        ACTIVE_VIRTUAL_USERS.dec();
    });
}

/// Extracts a human-readable message from a caught panic payload, falling
/// back to a generic label when the payload is neither a `&str` nor a
/// `String` (the two shapes `panic!`/`assert!` produce).
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Records an unexpected scenario bug (anything other than an already-
/// recorded request failure) and prints its string form so the operator
/// sees it, mirroring the reference tool's "print traceback, keep going"
/// behavior for bugs in user-supplied scenario code.
fn record_unexpected(stats: &crate::stats::StatsHandle, error: &UserError) {
    error!(error = %error, "unexpected error in virtual user scenario");
    eprintln!("unexpected scenario error: {error:?}");
    stats.record_unexpected_error(error.to_string());
}

/// Splits `total` as evenly as possible across `num_buckets`, front-loading
/// the remainder onto the first buckets rather than the last.
pub fn distribute_evenly(total: usize, num_buckets: usize) -> Vec<usize> {
    if num_buckets == 0 {
        return Vec::new();
    }
    let base = total / num_buckets;
    let remainder = total % num_buckets;
    (0..num_buckets)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}
