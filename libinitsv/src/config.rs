//! Compiled-in tuning constants and the resolved runtime configuration.
//!
//! Pool sizes are baked in as constants, with CLI overrides for a couple of
//! them. `Config` holds what actually varies per invocation (CLI flags).

use std::path::PathBuf;

pub const FD_POOL_SIZE: usize = 256;
pub const SERVICE_POOL_SIZE: usize = 256;
pub const CONTROLLER_POOL_COUNT: usize = 16;
pub const NAME_LIMIT: usize = 64;

/// Minimum time between restarts of the same service, in seconds.
pub const SERVICE_RESTART_INTERVAL_SECS: i64 = 1;
/// Delay before retrying a failed fork, in seconds.
pub const FORK_RETRY_DELAY_SECS: i64 = 1;
/// Interval-timer budget for a single log flush attempt, in milliseconds.
pub const LOG_WRITE_TIMEOUT_MS: u64 = 100;
/// Delay before retrying a blocked log sink, in seconds.
pub const LOG_RETRY_DELAY_SECS: i64 = 2;
/// Backoff after the controller pool is exhausted, in seconds.
pub const ACCEPT_BACKOFF_SECS: i64 = 5;
/// Listen backlog on the control socket.
pub const SOCKET_BACKLOG: i32 = 2;
/// Per-tick selector timeout ceiling, in seconds (`next = now + 200s`).
pub const MAX_WAKE_HORIZON_SECS: i64 = 200;

pub const EXIT_BAD_OPTIONS: i32 = 2;
pub const EXIT_INVALID_ENVIRONMENT: i32 = 3;
pub const EXIT_BROKEN_PROGRAM_STATE: i32 = 4;

pub const DEFAULT_PID1_CONFIG_PATH: &str = "/etc/initsv/init.conf";

/// Resolved settings for one run, assembled from CLI flags by `initsv::cli`.
#[derive(Debug, Clone)]
pub struct Config {
    pub verbosity: i32,
    pub config_file: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub interactive: bool,
    pub mlockall: bool,
    pub terminate_guard: bool,
    pub exec_on_exit: Option<Vec<String>>,
    pub daemonize: bool,
    pub is_pid1: bool,
}

impl Config {
    /// `log::LevelFilter`-shaped verbosity, where 0 is the default (`Info`),
    /// positive is quieter, negative is louder: `-v` decreases the filter,
    /// `-q` increases it.
    pub fn level_filter(&self) -> log::LevelFilter {
        use log::LevelFilter::*;
        match self.verbosity {
            i32::MIN..=-2 => Trace,
            -1 => Debug,
            0 => Info,
            1 => Warn,
            _ => Error,
        }
    }
}
