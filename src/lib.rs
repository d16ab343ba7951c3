//! A distributed HTTP load generator: spawns many virtual users, each
//! repeatedly running a scenario against an HTTP endpoint, while a
//! concurrent stats aggregator turns the resulting request stream into
//! bounded, periodically-rendered summaries.
//!
//! The four load-bearing pieces are [`session`] (the instrumented request
//! lifecycle), [`stats`] (the aggregator and its tables), [`scenario`] (the
//! `User` contract a binary implements), and [`worker`]/[`runner`] (the
//! two-level OS-thread/event-loop supervision model). Everything else —
//! [`client`], [`config`], [`errors`], [`metrics`], [`connection_pool`],
//! [`utils`] — is ambient plumbing those four pieces are built on.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod client;
pub mod config;
pub mod connection_pool;
pub mod errors;
pub mod metrics;
pub mod request;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod stats;
pub mod utils;
pub mod worker;

pub use request::{ErrorKind, ErrorSignal, RequestEvent};
pub use runner::{Runner, RunnerConfig, RunnerState};
pub use scenario::{FnUser, SimpleUser, User, UserError};
pub use session::{InstrumentedSession, RequestOptions, RequestScope, ScenarioError};
pub use stats::{PerNameEntry, Snapshot, StatsAggregator, StatsHandle};
