//! The scenario contract: what a virtual user actually does.
//!
//! The reference tool lets a test file define an arbitrary `User` subclass
//! (or a bare `run` function) and loads it dynamically at startup. Rust has
//! no equivalent to loading arbitrary foreign code at runtime, so the
//! contract here is a compile-time trait: a binary picks exactly one `User`
//! implementation and builds `Runner<U>` against it.

use async_trait::async_trait;

use crate::session::InstrumentedSession;

/// Failures a scenario's lifecycle methods can return. These are distinct
/// from the per-request `ScenarioError` the session's verbs return — a
/// `User::run` is free to ignore individual request errors and keep going,
/// but returning one of these from a lifecycle method aborts the virtual
/// user's current iteration.
#[derive(Debug, thiserror::Error)]
pub enum UserError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("teardown failed: {0}")]
    Teardown(String),
    #[error(transparent)]
    Request(#[from] crate::session::ScenarioError),
    #[error("scenario error: {0}")]
    Other(String),
}

/// One virtual user's behavior. Implementors get an `InstrumentedSession`
/// to issue requests through; every request recorded on it flows into the
/// run's shared stats aggregator regardless of which worker hosts this
/// user.
///
/// `run` is called repeatedly for as long as the run is active — each
/// return starts the next iteration immediately, mirroring the reference
/// tool's `while True: await self.run()` user loop.
#[async_trait]
pub trait User: Send + Sync + 'static {
    /// Constructs a fresh instance for one virtual user slot. Called once
    /// per VU when the worker spawns it.
    fn new(session: InstrumentedSession) -> Self
    where
        Self: Sized;

    /// Runs once before the first iteration. The default does nothing.
    async fn setup(&mut self) -> Result<(), UserError> {
        Ok(())
    }

    /// One iteration of the user's behavior. Called in a loop until the
    /// run ends or draining begins.
    async fn run(&mut self) -> Result<(), UserError>;

    /// Runs once after the run ends or this VU is torn down. The default
    /// does nothing.
    async fn teardown(&mut self) -> Result<(), UserError> {
        Ok(())
    }
}

/// Adapts a bare async closure into a `User`, for scenarios that don't
/// need `setup`/`teardown` and just want a single `run` body — the direct
/// analogue of the reference tool's bare-`run`-function fallback.
pub struct FnUser<F> {
    session: InstrumentedSession,
    run_fn: F,
}

impl<F> FnUser<F>
where
    F: Fn(InstrumentedSession) -> futures_core_fut::BoxFuture<'static, Result<(), UserError>>
        + Send
        + Sync
        + 'static,
{
    pub fn with(session: InstrumentedSession, run_fn: F) -> Self {
        Self { session, run_fn }
    }
}

#[async_trait]
impl<F> User for FnUser<F>
where
    F: Fn(InstrumentedSession) -> futures_core_fut::BoxFuture<'static, Result<(), UserError>>
        + Send
        + Sync
        + 'static,
{
    fn new(_session: InstrumentedSession) -> Self
    where
        Self: Sized,
    {
        unreachable!("FnUser is constructed via FnUser::with, not User::new")
    }

    async fn run(&mut self) -> Result<(), UserError> {
        (self.run_fn)(self.session.clone()).await
    }
}

/// The reference tool's built-in fallback scenario: issues a single GET
/// against the configured target URL every iteration and treats any
/// non-2xx/3xx status as a failed request, without aborting the run.
pub struct SimpleUser {
    session: InstrumentedSession,
    target_url: String,
}

impl SimpleUser {
    pub fn with_target(session: InstrumentedSession, target_url: impl Into<String>) -> Self {
        Self {
            session,
            target_url: target_url.into(),
        }
    }
}

#[async_trait]
impl User for SimpleUser {
    fn new(session: InstrumentedSession) -> Self
    where
        Self: Sized,
    {
        Self {
            session,
            target_url: "/".to_string(),
        }
    }

    async fn run(&mut self) -> Result<(), UserError> {
        match self
            .session
            .get(&self.target_url, crate::session::RequestOptions::default())
            .await
        {
            Ok(_scope) => Ok(()),
            Err(crate::session::ScenarioError::Status(_)) => Ok(()),
            Err(err) => Err(UserError::Request(err)),
        }
    }
}

/// Minimal boxed-future alias so `FnUser` doesn't need a direct dependency
/// on the `futures` crate's full surface for one trait bound.
mod futures_core_fut {
    use std::future::Future;
    use std::pin::Pin;

    pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsAggregator;
    use reqwest::Client;

    fn test_session() -> InstrumentedSession {
        let stats = StatsAggregator::new().handle();
        InstrumentedSession::new(Client::new(), stats)
    }

    struct CountingUser {
        session: InstrumentedSession,
        iterations: u32,
    }

    #[async_trait]
    impl User for CountingUser {
        fn new(session: InstrumentedSession) -> Self {
            Self {
                session,
                iterations: 0,
            }
        }

        async fn run(&mut self) -> Result<(), UserError> {
            self.iterations += 1;
            let _ = &self.session;
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_setup_and_teardown_are_no_ops() {
        let mut user = CountingUser::new(test_session());
        assert!(user.setup().await.is_ok());
        assert!(user.run().await.is_ok());
        assert!(user.teardown().await.is_ok());
        assert_eq!(user.iterations, 1);
    }

    #[test]
    fn simple_user_defaults_to_root_path() {
        let user = SimpleUser::new(test_session());
        assert_eq!(user.target_url, "/");
    }

    #[test]
    fn simple_user_with_target_overrides_path() {
        let user = SimpleUser::with_target(test_session(), "/health");
        assert_eq!(user.target_url, "/health");
    }
}
