//! Top-level per-process context bundling the FD registry, service pool,
//! controller pool, log sink, and signal relay.
//!
//! Spec §9 ("Process-wide mutable state") asks implementers to "pass a
//! context value through the call graph rather than relying on implicit
//! globals"; `Runtime` is that value.

use crate::config::Config;
use crate::controller::ControllerPool;
use crate::error::Result;
use crate::fd_registry::FdRegistry;
use crate::log_sink::{Level, LogSink};
use crate::service::ServicePool;
use crate::signal_relay::SignalRelay;
use std::os::fd::RawFd;

pub struct Runtime {
    pub config: Config,
    pub registry: FdRegistry,
    pub services: ServicePool,
    pub controllers: ControllerPool,
    pub log_sink: LogSink,
    pub signals: SignalRelay,
    pub listen_fd: Option<RawFd>,
    pub accept_backoff_until: Option<crate::time::MonoTime>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Runtime> {
        let mut registry = FdRegistry::new()?;
        register_open_fds(&mut registry);

        let signals = SignalRelay::install()?;
        let log_sink = LogSink::new(if config.verbosity <= 0 { Level::Info } else { Level::Warning });

        Ok(Runtime {
            config,
            registry,
            services: ServicePool::new(),
            controllers: ControllerPool::new(),
            log_sink,
            signals,
            listen_fd: None,
            accept_backoff_until: None,
        })
    }
}

/// Register any already-open low descriptors beyond the default 0/1/2 as
/// named FDs (`fd_N`), so externally-supplied descriptors (e.g.
/// socket-activation fds) are visible via `fds=`.
fn register_open_fds(registry: &mut FdRegistry) {
    use nix::fcntl::{self, FcntlArg};
    for fd in 3..64 {
        if fcntl::fcntl(fd, FcntlArg::F_GETFD).is_ok() {
            let name = format!("fd_{fd}");
            let _ = registry.assign(name.as_bytes(), fd, false, "inherited");
        }
    }
}
