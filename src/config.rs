use std::env;

use clap::Parser;
use thiserror::Error;
use tokio::time::Duration;

use crate::client::ClientConfig;
use crate::utils::parse_duration_string;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingValue(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("mTLS configuration incomplete: both CLIENT_CERT_PATH and CLIENT_KEY_PATH must be set together, or neither")]
    IncompleteMtls,

    #[error("URL validation failed: {0}")]
    InvalidUrl(String),
}

/// Command-line surface. Every flag is optional so a run can be driven
/// entirely by environment variables (e.g. under a process supervisor);
/// flags passed here take priority over their environment counterparts.
#[derive(Parser, Debug, Default)]
#[command(name = "rust_loadtest", about = "A Locust-style HTTP load generator")]
pub struct CliArgs {
    /// Number of concurrent virtual users.
    #[arg(short = 'u', long = "users")]
    pub users: Option<usize>,

    /// Stop the run after this many seconds.
    #[arg(short = 'd', long = "duration")]
    pub duration: Option<u64>,

    /// Number of OS-thread event loops hosting virtual users.
    #[arg(long = "event-loops")]
    pub event_loops: Option<usize>,

    /// Virtual users launched per second during ramp-up.
    #[arg(long = "spawn-rate")]
    pub spawn_rate: Option<f64>,

    /// Target URL the built-in scenario issues requests against.
    #[arg(long = "target-url")]
    pub target_url: Option<String>,

    /// Port the optional Prometheus `/metrics` endpoint listens on.
    #[arg(long = "metrics-port")]
    pub metrics_port: Option<u16>,
}

/// Main configuration for the load test.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_url: String,
    pub users: usize,
    /// Virtual users launched per second during ramp-up. `None` means the
    /// caller never set `--spawn-rate`/`SPAWN_RATE`, so the runner launches
    /// every virtual user immediately instead of ramping up.
    pub spawn_rate: Option<f64>,
    pub test_duration: Option<Duration>,
    pub event_loops: Option<usize>,
    pub metrics_port: Option<u16>,
    pub skip_tls_verify: bool,
    pub resolve_target_addr: Option<String>,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub custom_headers: Option<String>,
}

/// Helper to parse an environment variable with a default value.
fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        == "true"
}

impl Config {
    /// Loads configuration from environment variables, then overlays any
    /// CLI flags the caller provided. A `target_url` must come from one of
    /// the two sources or this fails.
    pub fn from_env_and_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let target_url = cli
            .target_url
            .or_else(|| env::var("TARGET_URL").ok())
            .ok_or_else(|| ConfigError::MissingValue("TARGET_URL or --target-url".into()))?;

        let users = cli
            .users
            .map(Ok)
            .unwrap_or_else(|| env_parse_or("USERS", 1usize))?;

        let spawn_rate = match cli.spawn_rate {
            Some(rate) => Some(rate),
            None => match env::var("SPAWN_RATE") {
                Ok(val) => Some(val.parse().map_err(|e: std::num::ParseFloatError| {
                    ConfigError::InvalidValue {
                        var: "SPAWN_RATE".into(),
                        message: e.to_string(),
                    }
                })?),
                Err(_) => None,
            },
        };

        let test_duration = match cli.duration {
            Some(secs) => Some(Duration::from_secs(secs)),
            None => match env::var("TEST_DURATION") {
                Ok(val) => Some(parse_duration_string(&val).map_err(|message| {
                    ConfigError::InvalidValue {
                        var: "TEST_DURATION".into(),
                        message,
                    }
                })?),
                Err(_) => None,
            },
        };

        let event_loops = match cli.event_loops {
            Some(n) => Some(n),
            None => match env::var("EVENT_LOOPS") {
                Ok(val) => Some(val.parse().map_err(|e: std::num::ParseIntError| {
                    ConfigError::InvalidValue {
                        var: "EVENT_LOOPS".into(),
                        message: e.to_string(),
                    }
                })?),
                Err(_) => None,
            },
        };

        let metrics_port = match cli.metrics_port {
            Some(p) => Some(p),
            None => match env::var("METRICS_PORT") {
                Ok(val) => Some(val.parse().map_err(|e: std::num::ParseIntError| {
                    ConfigError::InvalidValue {
                        var: "METRICS_PORT".into(),
                        message: e.to_string(),
                    }
                })?),
                Err(_) => None,
            },
        };

        let skip_tls_verify = env_bool("SKIP_TLS_VERIFY", false);
        let resolve_target_addr = env::var("RESOLVE_TARGET_ADDR").ok();
        let client_cert_path = env::var("CLIENT_CERT_PATH").ok();
        let client_key_path = env::var("CLIENT_KEY_PATH").ok();
        let custom_headers = env::var("CUSTOM_HEADERS").ok();

        let config = Config {
            target_url,
            users,
            spawn_rate,
            test_duration,
            event_loops,
            metrics_port,
            skip_tls_verify,
            resolve_target_addr,
            client_cert_path,
            client_key_path,
            custom_headers,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for consistency and correctness.
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.target_url.starts_with("http://") && !self.target_url.starts_with("https://") {
            return Err(ConfigError::InvalidUrl(
                "target URL must start with http:// or https://".into(),
            ));
        }

        if self.users == 0 {
            return Err(ConfigError::InvalidValue {
                var: "USERS".into(),
                message: "Must be greater than 0".into(),
            });
        }

        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ConfigError::IncompleteMtls);
        }

        Ok(())
    }

    /// Creates a default Config for testing purposes.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Config {
            target_url: "https://example.com".into(),
            users: 10,
            spawn_rate: Some(1.0),
            test_duration: Some(Duration::from_secs(60)),
            event_loops: None,
            metrics_port: None,
            skip_tls_verify: false,
            resolve_target_addr: None,
            client_cert_path: None,
            client_key_path: None,
            custom_headers: None,
        }
    }

    /// Number of worker event loops, resolved to half the CPU count (at
    /// least 1) when the caller left it unset.
    pub fn resolved_event_loops(&self) -> usize {
        self.event_loops.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| (n.get() / 2).max(1))
                .unwrap_or(1)
        })
    }

    /// Creates a ClientConfig from this Config.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            skip_tls_verify: self.skip_tls_verify,
            resolve_target_addr: self.resolve_target_addr.clone(),
            client_cert_path: self.client_cert_path.clone(),
            client_key_path: self.client_key_path.clone(),
            custom_headers: self.custom_headers.clone(),
            pool_config: None,
        }
    }

    /// Prints the configuration summary to stdout.
    pub fn print_summary(&self, parsed_headers: &reqwest::header::HeaderMap) {
        println!("Starting load test:");
        println!("  Target URL: {}", self.target_url);
        println!("  Users: {}", self.users);
        match self.spawn_rate {
            Some(rate) => println!("  Spawn rate: {rate}/s"),
            None => println!("  Spawn rate: unset (launching all users immediately)"),
        }
        println!("  Event loops: {}", self.resolved_event_loops());
        match self.test_duration {
            Some(d) => println!("  Duration: {:?}", d),
            None => println!("  Duration: until interrupted"),
        }
        println!("  Skip TLS Verify: {}", self.skip_tls_verify);

        if self.client_cert_path.is_some() && self.client_key_path.is_some() {
            println!("  mTLS Enabled: Yes (using CLIENT_CERT_PATH and CLIENT_KEY_PATH)");
        } else {
            println!("  mTLS Enabled: No (CLIENT_CERT_PATH or CLIENT_KEY_PATH not set, or only one was set)");
        }

        if let Some(ref headers_str) = self.custom_headers {
            if !headers_str.is_empty() && !parsed_headers.is_empty() {
                println!("  Custom Headers Enabled: Yes");
                for (name, value) in parsed_headers.iter() {
                    println!(
                        "    {}: {}",
                        name,
                        value.to_str().unwrap_or("<non-ASCII or sensitive value>")
                    );
                }
            } else {
                println!("  Custom Headers Enabled: No (CUSTOM_HEADERS was set but resulted in no valid headers or was empty after parsing)");
            }
        } else {
            println!("  Custom Headers Enabled: No (CUSTOM_HEADERS not set)");
        }
    }
}
