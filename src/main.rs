use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rust_loadtest::config::{CliArgs, Config};
use rust_loadtest::metrics;
use rust_loadtest::{InstrumentedSession, Runner, RunnerConfig, SimpleUser};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = CliArgs::parse();
    let config = match Config::from_env_and_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let client_config = config.to_client_config();
    let build_result = match rust_loadtest::client::build_client(&client_config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("failed to build HTTP client: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    config.print_summary(&build_result.parsed_headers);

    if metrics::register_metrics().is_err() {
        // Already registered (e.g. a prior run in the same process during
        // tests); non-fatal.
    }
    if let Some(port) = config.metrics_port {
        let registry = Arc::new(Mutex::new(prometheus::default_registry().clone()));
        tokio::spawn(metrics::start_metrics_server(port, registry));
    }

    let mut runner: Runner<SimpleUser> = Runner::new();
    let session = InstrumentedSession::new(build_result.client, runner.stats())
        .with_base_url(config.target_url.clone());

    let runner_config = RunnerConfig {
        users: config.users,
        event_loops: config.event_loops,
        spawn_rate: config.spawn_rate,
        duration: config.test_duration,
    };

    let result = runner.run_test(runner_config, session).await;

    if result.worker_failures.is_empty() {
        std::process::ExitCode::SUCCESS
    } else {
        for failure in &result.worker_failures {
            eprintln!("worker {} crashed: {}", failure.worker_id, failure.message);
        }
        std::process::ExitCode::FAILURE
    }
}
