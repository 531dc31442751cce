//! Self-pipe signal relay.
//!
//! A thread-based approach around `signal_hook::iterator::Signals` doesn't fit
//! here (single-threaded, cooperative — the only blocking point is the
//! selector), so this uses `signal_hook`'s lower-level self-pipe primitive
//! instead — a signal handler installed via
//! `signal_hook::low_level::pipe::register` writes one byte to a pipe whose
//! read end is an ordinary fd the event loop polls.

use nix::fcntl::{self, FcntlArg, OFlag};
use nix::sys::signal::Signal;
use nix::unistd::{self, read};
use std::os::fd::RawFd;

use crate::error::{Error, Result};

const RELAYED_SIGNALS: &[Signal] = &[Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT, Signal::SIGHUP];

pub struct SignalRelay {
    read_fd: RawFd,
    /// Kept alive for the process lifetime: dropping these would unregister
    /// the handlers.
    _registrations: Vec<signal_hook::SigId>,
}

impl SignalRelay {
    pub fn install() -> Result<SignalRelay> {
        let (read_fd, write_fd) = unistd::pipe().map_err(|e| Error::fatal(format!("signal pipe: {e}"), crate::config::EXIT_INVALID_ENVIRONMENT))?;
        use std::os::fd::IntoRawFd;
        let read_fd = read_fd.into_raw_fd();
        let write_fd = write_fd.into_raw_fd();
        set_nonblocking(read_fd)?;
        set_nonblocking(write_fd)?;

        let mut registrations = Vec::with_capacity(RELAYED_SIGNALS.len());
        for sig in RELAYED_SIGNALS {
            let id = unsafe {
                signal_hook::low_level::pipe::register(*sig as i32, std::os::fd::BorrowedFd::borrow_raw(write_fd))
            }
            .map_err(|e| Error::fatal(format!("sigaction: {e}"), crate::config::EXIT_INVALID_ENVIRONMENT))?;
            registrations.push(id);
        }

        Ok(SignalRelay { read_fd, _registrations: registrations })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Drain the self-pipe, returning one byte per signal delivered since
    /// the last drain ("emits a controller event per
    /// signal"). Byte values are `Signal as i32 as u8` truncations, which is
    /// what `signal_hook::low_level::pipe` writes.
    pub fn drain(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        // SAFETY: `self.read_fd` is owned by this relay for the process
        // lifetime.
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(self.read_fd) };
        loop {
            match read(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        out
    }

    /// Block all signals, for the window that wraps around drain +
    /// selector setup to close the "handler fires right before sleep" race.
    pub fn block_all() -> Result<nix::sys::signal::SigSet> {
        let mut all = nix::sys::signal::SigSet::all();
        let mut old = nix::sys::signal::SigSet::empty();
        nix::sys::signal::sigprocmask(nix::sys::signal::SigmaskHow::SIG_SETMASK, Some(&mut all), Some(&mut old))
            .map_err(|e| Error::recoverable(format!("sigprocmask: {e}")))?;
        Ok(old)
    }

    pub fn restore(old: nix::sys::signal::SigSet) -> Result<()> {
        nix::sys::signal::sigprocmask(nix::sys::signal::SigmaskHow::SIG_SETMASK, Some(&old), None)
            .map_err(|e| Error::recoverable(format!("sigprocmask restore: {e}")))
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: `fd` is owned by the caller for at least this call's duration.
    let bfd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let flags = fcntl::fcntl(bfd, FcntlArg::F_GETFL).map_err(|e| Error::recoverable(format!("fcntl getfl: {e}")))?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl::fcntl(bfd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::recoverable(format!("fcntl setfl: {e}")))?;
    Ok(())
}
