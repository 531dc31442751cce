//! The single-threaded, cooperative event loop.
//!
//! One tick: signal drain, reap, service advance, accept, controller
//! advance, log flush, sleep. Uses `nix::poll::poll` for readiness
//! multiplexing.

use crate::config;
use crate::control_proto;
use crate::controller::State as CtlState;
use crate::runtime::Runtime;
use crate::service::State as SvcState;
use crate::shutdown;
use crate::time::MonoTime;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::BorrowedFd;

/// Run until termination is requested. Returns the process exit code.
pub fn run(rt: &mut Runtime) -> i32 {
    loop {
        let now = MonoTime::now();
        let mut next = now.add_secs(config::MAX_WAKE_HORIZON_SECS);

        let old_mask = match crate::signal_relay::SignalRelay::block_all() {
            Ok(m) => m,
            Err(e) => {
                log::error!("sigprocmask: {e}");
                std::thread::sleep(std::time::Duration::from_millis(500));
                continue;
            }
        };

        for sig in rt.signals.drain() {
            control_proto::notify_signal_to_all(&mut rt.controllers, sig as i32);
            let sig = sig as i32;
            if sig == nix::sys::signal::Signal::SIGTERM as i32 || sig == nix::sys::signal::Signal::SIGINT as i32 {
                shutdown::request_termination();
            }
        }

        reap_children(rt, now);

        for h in rt.services.active_handles() {
            if let Some(deadline) = rt.services.advance(h, &mut rt.registry, &mut rt.controllers, now)
                && deadline.is_before(next)
            {
                next = deadline;
            }
        }

        let (poll_fds, targets) = build_poll_set(rt);
        let timeout = poll_timeout(now, next);

        if let Err(e) = crate::signal_relay::SignalRelay::restore(old_mask) {
            log::error!("sigprocmask restore: {e}");
        }

        let ready = poll_now(poll_fds, timeout);

        accept_new_controllers(rt, &ready, &targets, now);
        advance_controllers(rt, &ready, &targets, now);

        if let Some(deadline) = rt.log_sink.next_wake()
            && deadline.is_before(next)
        {
            next = deadline;
        }
        let log_writable = writable_flag(&ready, &targets, PollTarget::LogFd);
        rt.log_sink.flush(&rt.registry, now, log_writable);

        if shutdown::termination_requested() {
            return finalize_termination(rt);
        }
    }
}

fn reap_children(rt: &mut Runtime, now: MonoTime) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
            Ok(status) => rt.services.reap_one(status, now, &mut rt.controllers),
            Err(_) => break,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PollTarget {
    SignalFd,
    ListenFd,
    CtlIn(usize),
    CtlOut(usize),
    LogFd,
}

fn build_poll_set(rt: &Runtime) -> (Vec<PollFd<'_>>, Vec<PollTarget>) {
    let mut fds = Vec::new();
    let mut targets = Vec::new();

    // SAFETY: the signal relay owns this fd for the process lifetime.
    let sig_fd = unsafe { BorrowedFd::borrow_raw(rt.signals.read_fd()) };
    fds.push(PollFd::new(sig_fd, PollFlags::POLLIN));
    targets.push(PollTarget::SignalFd);

    if let Some(listen) = rt.listen_fd {
        // SAFETY: the listen socket is kept open by `Runtime` for its
        // lifetime; this borrow does not outlive this function call.
        let bf = unsafe { BorrowedFd::borrow_raw(listen) };
        fds.push(PollFd::new(bf, PollFlags::POLLIN));
        targets.push(PollTarget::ListenFd);
    }

    for h in rt.controllers.active_handles() {
        let ctl = rt.controllers.get(h).unwrap();
        if ctl.state == CtlState::Free {
            continue;
        }
        // SAFETY: the controller keeps these descriptors open while active.
        let in_fd = unsafe { BorrowedFd::borrow_raw(ctl.input_fd()) };
        fds.push(PollFd::new(in_fd, PollFlags::POLLIN));
        targets.push(PollTarget::CtlIn(h));
        let out_fd = unsafe { BorrowedFd::borrow_raw(ctl.output_fd()) };
        fds.push(PollFd::new(out_fd, PollFlags::POLLOUT));
        targets.push(PollTarget::CtlOut(h));
    }

    if let Some(log_handle) = rt.registry.lookup(b"stderr")
        && let Some(fd) = rt.registry.get(log_handle)
    {
        // SAFETY: stderr stays open for the process lifetime.
        let bf = unsafe { BorrowedFd::borrow_raw(fd.fdnum) };
        fds.push(PollFd::new(bf, PollFlags::POLLOUT));
        targets.push(PollTarget::LogFd);
    }

    (fds, targets)
}

fn poll_timeout(now: MonoTime, next: MonoTime) -> PollTimeout {
    let dur = next.diff_as_duration(now);
    let millis = dur.as_millis().min(u16::MAX as u128) as u16;
    PollTimeout::from(millis)
}

fn poll_now(mut fds: Vec<PollFd<'_>>, timeout: PollTimeout) -> Vec<PollFlags> {
    match nix::poll::poll(&mut fds, timeout) {
        Ok(_) => fds.iter().map(|f| f.revents().unwrap_or(PollFlags::empty())).collect(),
        Err(nix::errno::Errno::EINTR) => vec![PollFlags::empty(); fds.len()],
        Err(e) => {
            log::error!("poll: {e}");
            std::thread::sleep(std::time::Duration::from_millis(500));
            vec![PollFlags::empty(); fds.len()]
        }
    }
}

fn writable_flag(ready: &[PollFlags], targets: &[PollTarget], which: PollTarget) -> bool {
    targets.iter().position(|t| *t == which).is_some_and(|i| ready[i].contains(PollFlags::POLLOUT))
}

fn accept_new_controllers(rt: &mut Runtime, ready: &[PollFlags], targets: &[PollTarget], now: MonoTime) {
    let Some(idx) = targets.iter().position(|t| *t == PollTarget::ListenFd) else { return };
    if !ready[idx].contains(PollFlags::POLLIN) {
        return;
    }
    if let Some(until) = rt.accept_backoff_until
        && now.is_before(until)
    {
        return;
    }
    let Some(listen_fd) = rt.listen_fd else { return };
    match nix::sys::socket::accept(listen_fd) {
        Ok(client_fd) => match rt.controllers.alloc(client_fd, client_fd) {
            Ok(_handle) => {}
            Err(_) => {
                let _ = nix::unistd::close(client_fd);
                rt.accept_backoff_until = Some(now.add_secs(config::ACCEPT_BACKOFF_SECS));
                log::warn!("controller pool exhausted, backing off");
            }
        },
        Err(nix::errno::Errno::EAGAIN) => {}
        Err(e) => log::warn!("accept: {e}"),
    }
}

fn advance_controllers(rt: &mut Runtime, ready: &[PollFlags], targets: &[PollTarget], now: MonoTime) {
    for h in rt.controllers.active_handles() {
        let readable = targets
            .iter()
            .position(|t| *t == PollTarget::CtlIn(h))
            .is_some_and(|i| ready[i].contains(PollFlags::POLLIN));
        let writable = targets
            .iter()
            .position(|t| *t == PollTarget::CtlOut(h))
            .is_some_and(|i| ready[i].contains(PollFlags::POLLOUT));

        if readable {
            let lines = rt.controllers.get_mut(h).unwrap().pump_input();
            for line in lines {
                if let Some(cmd) = control_proto::parse_line(&line) {
                    control_proto::dispatch(cmd, &mut rt.services, &mut rt.registry, now, &mut rt.controllers, Some(h));
                }
            }
            rt.controllers.get_mut(h).unwrap().begin_drain();
        }

        rt.controllers.get_mut(h).unwrap().pump_output(writable);

        if rt.controllers.reclaim_if_done(h) && !rt.config.terminate_guard {
            shutdown::request_termination();
        }
    }
}

fn finalize_termination(rt: &mut Runtime) -> i32 {
    let still_running: Vec<Vec<u8>> = rt
        .services
        .active_handles()
        .into_iter()
        .filter_map(|h| rt.services.get(h))
        .filter(|s| s.state == SvcState::Up)
        .map(|s| s.name.clone())
        .collect();
    for name in still_running {
        log::warn!("terminating with service still running: {}", String::from_utf8_lossy(&name));
    }

    if let Some(argv) = rt.config.exec_on_exit.clone() {
        shutdown::fatal("normal termination", 0, Some(&argv), rt.config.terminate_guard);
    }
    0
}
