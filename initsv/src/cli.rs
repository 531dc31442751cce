//! Command-line surface: flags for config file, control socket, interactive
//! mode, and PID-1 behaviors.

use clap::Parser;
use libinitsv::config::Config;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "initsv", about = "A process supervisor")]
pub struct CliArgs {
    /// Decrease the log filter (repeatable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Increase the log filter (repeatable).
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Read control-protocol commands from PATH (`-` for stdin).
    #[arg(short = 'c', long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// Bind stdin/stdout as an interactive controller.
    #[arg(short = 'i', long = "interactive")]
    pub interactive: bool,

    /// Bind a Unix control socket at PATH.
    #[arg(short = 'S', long = "socket")]
    pub socket: Option<PathBuf>,

    /// Lock all process memory.
    #[arg(short = 'M', long = "mlockall")]
    pub mlockall: bool,

    /// Terminate-guard: fatal errors do not exit.
    #[arg(short = 'F', long = "failsafe")]
    pub failsafe: bool,

    /// Exec this program (with args) instead of exiting on termination.
    #[arg(short = 'E', long = "exec-on-exit", num_args = 1.., allow_hyphen_values = true)]
    pub exec_on_exit: Option<Vec<String>>,

    /// Fork, detach from the controlling terminal, and let the parent exit.
    #[arg(long = "daemonize")]
    pub daemonize: bool,
}

impl CliArgs {
    /// Resolve parsed flags into a [`Config`], applying the PID-1 defaults
    /// and validating "at least one of -i, -c, -S is required".
    pub fn into_config(self) -> Result<Config, String> {
        let is_pid1 = nix::unistd::getpid().as_raw() == 1;

        let config_file = self.config_file.or_else(|| {
            if is_pid1 && self.socket.is_none() && !self.interactive {
                Some(PathBuf::from(libinitsv::config::DEFAULT_PID1_CONFIG_PATH))
            } else {
                None
            }
        });

        if !self.interactive && config_file.is_none() && self.socket.is_none() {
            return Err("at least one of -i, -c, -S is required".to_string());
        }

        let daemonize = if self.daemonize && (is_pid1 || self.interactive) {
            log::warn!("--daemonize ignored when running as PID 1 or with -i");
            false
        } else {
            self.daemonize
        };

        Ok(Config {
            verbosity: i32::from(self.quiet) - i32::from(self.verbose),
            config_file,
            socket_path: self.socket,
            interactive: self.interactive,
            mlockall: self.mlockall,
            terminate_guard: self.failsafe || is_pid1,
            exec_on_exit: self.exec_on_exit,
            daemonize,
            is_pid1,
        })
    }
}
