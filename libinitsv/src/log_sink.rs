//! Buffered, non-blocking log writer with retry-on-block semantics.
//!
//! This is the core, in-scope sink — distinct from the
//! ambient developer diagnostics in [`crate::diag_log`]. Grounded directly
//! on `log.c`: a single ring-less buffer (`log_buffer`), a lost-message
//! counter, and a blocked/deadline pair that gates retries.

use crate::config::{LOG_RETRY_DELAY_SECS, LOG_WRITE_TIMEOUT_MS};
use crate::fd_registry::{FdHandle, FdRegistry};
use crate::time::MonoTime;
use nix::errno::Errno;
use nix::unistd::write;
use std::os::fd::BorrowedFd;

/// Installed once so `SIGALRM` doesn't terminate the process (its default
/// disposition) when [`LogSink::flush`] arms the write-timeout guard; the
/// handler itself does nothing, it only needs to exist so the alarm
/// interrupts the blocking syscall with `EINTR`.
fn install_alarm_handler() -> signal_hook::SigId {
    // SAFETY: the handler runs async-signal-safe code only (none at all).
    unsafe { signal_hook::low_level::register(nix::sys::signal::Signal::SIGALRM as i32, || {}) }
        .expect("SIGALRM handler registration")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    fn prefix(self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }
}

const BUFFER_CAPACITY: usize = 4096;

pub struct LogSink {
    min_level: Level,
    target_name: Option<Vec<u8>>,
    buffer: Vec<u8>,
    lost_count: u64,
    blocked: bool,
    retry_deadline: MonoTime,
    /// Kept alive for the process lifetime: dropping it would unregister
    /// the `SIGALRM` handler the write-timeout guard relies on.
    _alarm_guard: signal_hook::SigId,
}

impl LogSink {
    pub fn new(min_level: Level) -> LogSink {
        LogSink {
            min_level,
            target_name: None,
            buffer: Vec::with_capacity(BUFFER_CAPACITY),
            lost_count: 0,
            blocked: false,
            retry_deadline: MonoTime::ZERO,
            _alarm_guard: install_alarm_handler(),
        }
    }

    pub fn set_target(&mut self, name: Option<Vec<u8>>) {
        self.target_name = name;
        // reattach immediately: a rebind might point at a now-writable fd
        self.blocked = false;
    }

    pub fn set_min_level(&mut self, level: Level) {
        self.min_level = level;
    }

    /// `write(level, fmt, ...)`. Filters by level, renders with a
    /// prefix and trailing newline, drops (incrementing `lost_count`) if the
    /// buffer would overflow.
    pub fn write(&mut self, level: Level, message: &str) {
        if level < self.min_level {
            return;
        }
        let line = format!("{}: {}\n", level.prefix(), message);
        if self.buffer.len() + line.len() > BUFFER_CAPACITY {
            self.lost_count += 1;
            return;
        }
        self.buffer.extend_from_slice(line.as_bytes());
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Next deadline this sink wants the loop to wake it for, if blocked.
    pub fn next_wake(&self) -> Option<MonoTime> {
        self.blocked.then_some(self.retry_deadline)
    }

    /// `flush`: resolve the target FD, attempt one write, shift
    /// the buffer on partial writes, and track the blocked/retry state.
    /// `fd_writable` tells us whether the selector reported the target fd as
    /// writable this tick (gates retry while blocked).
    pub fn flush(&mut self, registry: &FdRegistry, now: MonoTime, fd_writable: bool) {
        if self.buffer.is_empty() && self.lost_count == 0 {
            return;
        }
        if self.blocked && !fd_writable && now.is_before(self.retry_deadline) {
            return;
        }

        let Some(handle) = self.resolve_target(registry) else {
            self.blocked = true;
            self.retry_deadline = now.add_secs(LOG_RETRY_DELAY_SECS);
            return;
        };
        let Some(fd) = registry.get(handle) else {
            self.blocked = true;
            self.retry_deadline = now.add_secs(LOG_RETRY_DELAY_SECS);
            return;
        };
        if fd.fdnum < 0 {
            self.blocked = true;
            self.retry_deadline = now.add_secs(LOG_RETRY_DELAY_SECS);
            return;
        }

        if self.lost_count > 0 && self.buffer.len() + 48 <= BUFFER_CAPACITY {
            let notice = format!("warning: lost {} log messages\n", self.lost_count);
            self.buffer.extend_from_slice(notice.as_bytes());
            self.lost_count = 0;
        }

        // SAFETY: `fd.fdnum` is an open descriptor owned by the registry for
        // the duration of this call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd.fdnum) };

        // Arm an interval timer for the write's duration so a target that
        // can't make progress (a stalled reader, a wedged disk) can't block
        // the loop past LOG_WRITE_TIMEOUT_MS; disarm it the instant the
        // single write attempt returns.
        let timeout_secs = LOG_WRITE_TIMEOUT_MS.div_ceil(1000).max(1) as u32;
        let _ = nix::unistd::alarm::set(timeout_secs);
        let result = write(borrowed, &self.buffer);
        let _ = nix::unistd::alarm::cancel();

        match result {
            Ok(0) => {
                self.blocked = true;
                self.retry_deadline = now.add_secs(LOG_RETRY_DELAY_SECS);
            }
            Ok(n) => {
                self.buffer.drain(..n);
                self.blocked = !self.buffer.is_empty();
                if self.blocked {
                    self.retry_deadline = now.add_secs(LOG_RETRY_DELAY_SECS);
                }
            }
            Err(Errno::EAGAIN | Errno::EWOULDBLOCK | Errno::EINTR) => {
                self.blocked = true;
                self.retry_deadline = now.add_secs(LOG_RETRY_DELAY_SECS);
            }
            Err(_) => {
                self.blocked = true;
                self.retry_deadline = now.add_secs(LOG_RETRY_DELAY_SECS);
            }
        }
    }

    fn resolve_target(&self, registry: &FdRegistry) -> Option<FdHandle> {
        match &self.target_name {
            Some(name) => registry.lookup(name),
            None => registry.lookup(b"stderr"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd_registry::FdRegistry;

    #[test]
    fn filters_below_min_level() {
        let mut sink = LogSink::new(Level::Warning);
        sink.write(Level::Debug, "ignored");
        assert!(sink.buffer.is_empty());
        sink.write(Level::Error, "kept");
        assert!(!sink.buffer.is_empty());
    }

    #[test]
    fn overflow_increments_lost_count() {
        let mut sink = LogSink::new(Level::Trace);
        let huge = "x".repeat(BUFFER_CAPACITY);
        sink.write(Level::Info, &huge);
        sink.write(Level::Info, "more");
        assert_eq!(sink.lost_count, 1);
    }

    #[test]
    fn flush_drains_buffer_to_target_fd() {
        let registry = FdRegistry::new().unwrap();
        let mut sink = LogSink::new(Level::Trace);
        sink.set_target(Some(b"null".to_vec()));
        sink.write(Level::Info, "hello");
        sink.flush(&registry, MonoTime::from_secs(1), true);
        assert!(sink.buffer.is_empty());
        assert!(!sink.is_blocked());
    }
}
