//! Per-service state machine, variable packing, PID/name indexes.
//!
//! Grounded on `service.c`. The var-packing contract (`svc_get_var`/
//! `svc_set_var`'s NUL-separated records with an in-place memmove) is
//! reproduced with `Vec<u8>` splicing; the state machine switch in `svc_run`
//! and the exec algorithm in `svc_do_exec` are reproduced in
//! [`Service::advance`] and [`exec_into_child`].

use crate::config::{self, EXIT_INVALID_ENVIRONMENT};
use crate::control_proto::notify_svc_state_all;
use crate::controller::{ControllerHandle, ControllerPool};
use crate::error::{Error, Result};
use crate::fd_registry::FdRegistry;
use crate::ordered_map::OrderedMap;
use crate::strutil::split_tokens;
use crate::time::MonoTime;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid};
use std::collections::HashMap;
use std::ffi::CString;

pub type ServiceHandle = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Undefined,
    Down,
    StartPending,
    Start,
    Up,
    Reaped,
    AllocCtl,
}

/// A `key=value` pair packed into the service's variable buffer.
struct Vars {
    buf: Vec<u8>,
}

impl Vars {
    fn new() -> Vars {
        Vars { buf: Vec::new() }
    }

    /// Absent `args` → `""`; absent `fds` → `"null\tnull\tnull"` (spec
    /// §4.5.1).
    fn get(&self, key: &str) -> Vec<u8> {
        for rec in self.buf.split(|&b| b == 0) {
            if rec.is_empty() {
                continue;
            }
            if let Some(eq) = rec.iter().position(|&b| b == b'=')
                && &rec[..eq] == key.as_bytes()
            {
                return rec[eq + 1..].to_vec();
            }
        }
        match key {
            "args" => Vec::new(),
            "fds" => b"null\tnull\tnull".to_vec(),
            _ => Vec::new(),
        }
    }

    fn has(&self, key: &str) -> bool {
        self.buf.split(|&b| b == 0).any(|rec| {
            rec.iter().position(|&b| b == b'=').is_some_and(|eq| &rec[..eq] == key.as_bytes())
        })
    }

    /// In-place grow/shrink/delete of the record for `key`, mirroring
    /// `svc_set_var`'s memmove.
    fn set(&mut self, key: &str, value: Option<&[u8]>) -> Result<()> {
        let mut record_start = None;
        let mut record_end = 0usize;
        let mut pos = 0usize;
        for rec in self.buf.split(|&b| b == 0) {
            let rec_len = rec.len() + 1; // include the NUL
            if let Some(eq) = rec.iter().position(|&b| b == b'=')
                && &rec[..eq] == key.as_bytes()
            {
                record_start = Some(pos);
                record_end = pos + rec_len;
                break;
            }
            pos += rec_len;
        }

        let new_record: Vec<u8> = match value {
            Some(v) => {
                let mut r = Vec::with_capacity(key.len() + 1 + v.len() + 1);
                r.extend_from_slice(key.as_bytes());
                r.push(b'=');
                r.extend_from_slice(v);
                r.push(0);
                r
            }
            None => Vec::new(),
        };

        match record_start {
            Some(start) => {
                let grows_by = new_record.len() as isize - (record_end - start) as isize;
                if grows_by > 0 && self.buf.len() + grows_by as usize > config::NAME_LIMIT * 16 {
                    return Err(Error::resource("variable buffer full"));
                }
                self.buf.splice(start..record_end, new_record);
            }
            None => {
                if new_record.is_empty() {
                    return Ok(()); // unset of an absent key is a no-op
                }
                if self.buf.len() + new_record.len() > config::NAME_LIMIT * 16 {
                    return Err(Error::resource("variable buffer full"));
                }
                self.buf.extend_from_slice(&new_record);
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.buf.len()
    }
}

pub struct Service {
    pub name: Vec<u8>,
    pub state: State,
    vars: Vars,
    pub pid: i32,
    pub start_ts: MonoTime,
    pub reap_ts: MonoTime,
    pub wait_status: i32,
    pub auto_restart: bool,
    pub uses_control_event: bool,
    pub uses_control_cmd: bool,
    /// Set once `alloc-ctl` has bound a controller to this service; cleared
    /// on reap, since the pipe fds it was wired to die with the child.
    pub attached_controller: Option<ControllerHandle>,
    in_active_list: bool,
    pending_start_deadline: MonoTime,
}

impl Service {
    fn new(name: Vec<u8>) -> Service {
        Service {
            name,
            state: State::Down,
            vars: Vars::new(),
            pid: 0,
            start_ts: MonoTime::ZERO,
            reap_ts: MonoTime::ZERO,
            wait_status: -1,
            auto_restart: false,
            uses_control_event: false,
            uses_control_cmd: false,
            attached_controller: None,
            in_active_list: false,
            pending_start_deadline: MonoTime::ZERO,
        }
    }

    pub fn get_var(&self, key: &str) -> Vec<u8> {
        self.vars.get(key)
    }

    pub fn set_var(&mut self, key: &str, value: Option<&[u8]>) -> Result<()> {
        self.vars.set(key, value)
    }

    pub fn has_var(&self, key: &str) -> bool {
        self.vars.has(key)
    }

    pub fn vars_len(&self) -> usize {
        self.vars.len()
    }

    pub fn args(&self) -> Vec<Vec<u8>> {
        let raw = self.vars.get("args");
        split_tokens(&raw, b'\t').into_iter().map(|t| t.to_vec()).collect()
    }

    pub fn fds(&self) -> Vec<Vec<u8>> {
        let raw = self.vars.get("fds");
        split_tokens(&raw, b'\t').into_iter().map(|t| t.to_vec()).collect()
    }

    /// `handle_start`: down → start-pending (future `when`) or start (now).
    pub fn handle_start(&mut self, when: MonoTime, now: MonoTime) {
        if when.is_after(now) {
            self.state = State::StartPending;
            self.pending_start_deadline = when;
        } else {
            self.state = State::Start;
        }
        self.in_active_list = true;
    }

    pub fn send_signal(&self, signum: Signal, group: bool) -> Result<()> {
        if self.pid == 0 {
            return Ok(());
        }
        let pid = Pid::from_raw(self.pid);
        let result = if group { signal::killpg(pid, signum) } else { signal::kill(pid, signum) };
        result.map_err(|e| Error::recoverable(format!("signal {signum}: {e}")))
    }
}

pub struct ServicePool {
    slots: Vec<Option<Service>>,
    free: Vec<ServiceHandle>,
    by_name: OrderedMap<ServiceHandle>,
    by_pid: HashMap<i32, ServiceHandle>,
    active: Vec<ServiceHandle>,
}

impl ServicePool {
    pub fn new() -> ServicePool {
        ServicePool {
            slots: Vec::new(),
            free: Vec::new(),
            by_name: OrderedMap::new(),
            by_pid: HashMap::new(),
            active: Vec::new(),
        }
    }

    pub fn create(&mut self, name: &[u8]) -> Result<ServiceHandle> {
        if name.len() >= config::NAME_LIMIT {
            return Err(Error::resource("service name too long"));
        }
        if self.by_name.contains(name) {
            return Err(Error::recoverable("duplicate service name"));
        }
        let handle = if let Some(h) = self.free.pop() {
            self.slots[h] = Some(Service::new(name.to_vec()));
            h
        } else {
            if self.slots.len() >= config::SERVICE_POOL_SIZE {
                return Err(Error::resource("service pool exhausted"));
            }
            self.slots.push(Some(Service::new(name.to_vec())));
            self.slots.len() - 1
        };
        self.by_name.insert(name.to_vec(), handle);
        Ok(handle)
    }

    pub fn get(&self, handle: ServiceHandle) -> Option<&Service> {
        self.slots.get(handle).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, handle: ServiceHandle) -> Option<&mut Service> {
        self.slots.get_mut(handle).and_then(|s| s.as_mut())
    }

    pub fn by_name(&self, name: &[u8]) -> Option<ServiceHandle> {
        self.by_name.find(name)
    }

    pub fn by_pid(&self, pid: i32) -> Option<ServiceHandle> {
        self.by_pid.get(&pid).copied()
    }

    pub fn active_handles(&self) -> Vec<ServiceHandle> {
        self.active.clone()
    }

    pub fn mark_active(&mut self, handle: ServiceHandle) {
        if let Some(svc) = self.get_mut(handle)
            && !svc.in_active_list
        {
            svc.in_active_list = true;
            self.active.push(handle);
        }
    }

    fn mark_inactive(&mut self, handle: ServiceHandle) {
        if let Some(svc) = self.get_mut(handle) {
            svc.in_active_list = false;
        }
        self.active.retain(|&h| h != handle);
    }

    /// `delete`: SIGTERM if running, removes from both indexes, frees the
    /// slot.
    pub fn delete(&mut self, handle: ServiceHandle) -> Result<()> {
        let (name, pid) = {
            let svc = self.get(handle).ok_or_else(|| Error::recoverable("no such service"))?;
            (svc.name.clone(), svc.pid)
        };
        if pid != 0 {
            self.get(handle).unwrap().send_signal(Signal::SIGTERM, false).ok();
            self.by_pid.remove(&pid);
        }
        self.by_name.remove(&name);
        self.mark_inactive(handle);
        self.slots[handle] = None;
        self.free.push(handle);
        Ok(())
    }

    /// Reap pass: for every exited pid, transition up → reaped and
    /// reactivate. Clears any attached controller binding — its pipe fds die
    /// with the child, so a future start must allocate a fresh one.
    pub fn reap_one(&mut self, status: WaitStatus, now: MonoTime, controllers: &mut ControllerPool) {
        let pid = match status.pid() {
            Some(p) => p.as_raw(),
            None => return,
        };
        let Some(handle) = self.by_pid.remove(&pid) else {
            log::trace!("reaped pid {pid} with no associated service");
            return;
        };
        let wait_status = encode_wait_status(status);
        if let Some(svc) = self.get_mut(handle) {
            svc.pid = 0;
            svc.wait_status = wait_status;
            svc.reap_ts = now.bump_if_zero();
            svc.attached_controller = None;
        }
        self.transition(handle, State::Reaped, controllers);
        self.mark_active(handle);
    }

    /// Set a service's state and broadcast the transition to every active
    /// controller, mirroring the broadcast-to-all convention already used
    /// for signal delivery.
    fn transition(&mut self, handle: ServiceHandle, new_state: State, controllers: &mut ControllerPool) {
        let Some(svc) = self.get_mut(handle) else { return };
        svc.state = new_state;
        let name = svc.name.clone();
        notify_svc_state_all(controllers, &name, new_state);
    }

    /// Advance one service's state machine by one step.
    /// Returns the wake deadline it wants, if any.
    pub fn advance(&mut self, handle: ServiceHandle, registry: &mut FdRegistry, controllers: &mut ControllerPool, now: MonoTime) -> Option<MonoTime> {
        let state = match self.get(handle) {
            Some(svc) => svc.state,
            None => return None,
        };
        match state {
            State::StartPending => {
                let deadline = self.get(handle).unwrap().pending_start_deadline;
                if now.is_after(deadline) || now == deadline {
                    self.transition(handle, State::Start, controllers);
                    self.advance(handle, registry, controllers, now)
                } else {
                    Some(deadline)
                }
            }
            State::Start => {
                let wants_ctl = {
                    let svc = self.get(handle).unwrap();
                    (svc.uses_control_event || svc.uses_control_cmd) && svc.attached_controller.is_none()
                };
                if wants_ctl {
                    self.transition(handle, State::AllocCtl, controllers);
                    return self.advance(handle, registry, controllers, now);
                }
                match fork_and_launch(self.get(handle).unwrap(), registry) {
                    Ok(pid) => {
                        {
                            let svc = self.get_mut(handle).unwrap();
                            svc.pid = pid;
                            svc.start_ts = now.bump_if_zero();
                        }
                        self.by_pid.insert(pid, handle);
                        self.transition(handle, State::Up, controllers);
                        self.mark_inactive(handle);
                        None
                    }
                    Err(e) => {
                        log::warn!("fork failed for service: {e}");
                        let deadline = now.add_secs(config::FORK_RETRY_DELAY_SECS);
                        self.get_mut(handle).unwrap().pending_start_deadline = deadline;
                        self.transition(handle, State::StartPending, controllers);
                        Some(deadline)
                    }
                }
            }
            State::AllocCtl => match alloc_attached_controller(self.get(handle).unwrap(), registry, controllers) {
                Some((ctl_handle, stdin_name, stdout_name)) => {
                    if let Some(svc) = self.get_mut(handle) {
                        svc.attached_controller = Some(ctl_handle);
                        rewire_fds_for_attached_controller(svc, &stdin_name, &stdout_name);
                    }
                    if let Some(ctl) = controllers.get_mut(ctl_handle) {
                        ctl.attached_service = Some(handle);
                    }
                    self.transition(handle, State::Start, controllers);
                    self.advance(handle, registry, controllers, now)
                }
                None => {
                    log::warn!("attached controller allocation failed, retrying next tick");
                    Some(now.add_secs(config::FORK_RETRY_DELAY_SECS))
                }
            },
            State::Reaped => {
                let (auto_restart, interval_ok, start_ts) = {
                    let svc = self.get(handle).unwrap();
                    (svc.auto_restart, svc.reap_ts.diff(svc.start_ts) >= config::SERVICE_RESTART_INTERVAL_SECS << 32, svc.start_ts)
                };
                if auto_restart {
                    if interval_ok {
                        self.transition(handle, State::Start, controllers);
                        self.advance(handle, registry, controllers, now)
                    } else {
                        let deadline = start_ts.add_secs(config::SERVICE_RESTART_INTERVAL_SECS);
                        self.get_mut(handle).unwrap().pending_start_deadline = deadline;
                        self.transition(handle, State::StartPending, controllers);
                        Some(deadline)
                    }
                } else {
                    self.transition(handle, State::Down, controllers);
                    self.mark_inactive(handle);
                    None
                }
            }
            State::Down | State::Up | State::Undefined => {
                self.mark_inactive(handle);
                None
            }
        }
    }
}

fn pipe_names(svc_name: &[u8], tag: &str) -> Vec<u8> {
    let mut n = svc_name.to_vec();
    n.push(b'.');
    n.extend_from_slice(tag.as_bytes());
    n
}

/// Allocate the two named pipes and the controller for a service's
/// attached-controller request: one pipe feeds the service's stdin from the
/// controller, the other carries the service's stdout to the controller.
/// Only the service-facing ends are registered by name (what exec-time
/// `fds=` lookups need); the controller-facing ends are owned solely by the
/// `Controller` so there is exactly one closer for each descriptor. Any
/// failure along the way unwinds everything already created and returns
/// `None`, leaving the service in `alloc-ctl` to retry next tick.
fn alloc_attached_controller(svc: &Service, registry: &mut FdRegistry, controllers: &mut ControllerPool) -> Option<(ControllerHandle, Vec<u8>, Vec<u8>)> {
    use std::os::fd::IntoRawFd;

    let (to_svc_read, to_svc_write) = nix::unistd::pipe().ok()?;
    let (to_svc_read, to_svc_write) = (to_svc_read.into_raw_fd(), to_svc_write.into_raw_fd());

    let from_svc = match nix::unistd::pipe() {
        Ok(p) => p,
        Err(_) => {
            let _ = nix::unistd::close(to_svc_read);
            let _ = nix::unistd::close(to_svc_write);
            return None;
        }
    };
    let (from_svc_read, from_svc_write) = (from_svc.0.into_raw_fd(), from_svc.1.into_raw_fd());

    let stdin_name = pipe_names(&svc.name, "ctl-in");
    let stdout_name = pipe_names(&svc.name, "ctl-out");

    if registry.assign(&stdin_name, to_svc_read, false, "attached controller stdin").is_err() {
        let _ = nix::unistd::close(to_svc_read);
        let _ = nix::unistd::close(to_svc_write);
        let _ = nix::unistd::close(from_svc_read);
        let _ = nix::unistd::close(from_svc_write);
        return None;
    }
    if registry.assign(&stdout_name, from_svc_write, false, "attached controller stdout").is_err() {
        let _ = registry.delete(&stdin_name);
        let _ = nix::unistd::close(to_svc_write);
        let _ = nix::unistd::close(from_svc_read);
        let _ = nix::unistd::close(from_svc_write);
        return None;
    }

    match controllers.alloc(from_svc_read, to_svc_write) {
        Ok(handle) => Some((handle, stdin_name, stdout_name)),
        Err(_) => {
            let _ = registry.delete(&stdin_name);
            let _ = registry.delete(&stdout_name);
            let _ = nix::unistd::close(from_svc_read);
            let _ = nix::unistd::close(to_svc_write);
            None
        }
    }
}

/// Point fd slots 0/1 (stdin/stdout) of the service's `fds` var at the
/// attached controller's pipe ends, padding with `null` if fewer than 3
/// slots were already set. Slot 2 and beyond (e.g. stderr) are untouched.
fn rewire_fds_for_attached_controller(svc: &mut Service, stdin_name: &[u8], stdout_name: &[u8]) {
    let mut fds = svc.fds();
    while fds.len() < 3 {
        fds.push(b"null".to_vec());
    }
    fds[0] = stdin_name.to_vec();
    fds[1] = stdout_name.to_vec();
    let joined = fds.join(&b'\t');
    let _ = svc.set_var("fds", Some(&joined));
}

fn encode_wait_status(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
        _ => -1,
    }
}

/// Fork + exec setup, grounded on `svc_do_exec` /
/// `fork_child.rs: after_fork_child`.
fn fork_and_launch(svc: &Service, registry: &FdRegistry) -> Result<i32> {
    let args = svc.args();
    if args.is_empty() {
        return Err(Error::recoverable("service has no args"));
    }
    let fds = svc.fds();

    // SAFETY: the child immediately execs or exits; only async-signal-safe
    // operations happen between fork and exec/exit.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child.as_raw()),
        Ok(ForkResult::Child) => {
            exec_into_child(&args, &fds, registry);
            std::process::exit(EXIT_INVALID_ENVIRONMENT);
        }
        Err(e) => Err(Error::recoverable(format!("fork: {e}"))),
    }
}

/// Never returns on success (it execs); on failure it returns so the caller
/// can `exit(EXIT_INVALID_ENVIRONMENT)`.
fn exec_into_child(args: &[Vec<u8>], fds: &[Vec<u8>], registry: &FdRegistry) {
    let _ = signal::sigprocmask(signal::SigmaskHow::SIG_SETMASK, Some(&signal::SigSet::empty()), None);
    unsafe {
        signal::sigaction(Signal::SIGCHLD, &signal::SigAction::new(signal::SigHandler::SigDfl, signal::SaFlags::empty(), signal::SigSet::empty())).ok();
    }

    let n = fds.len().max(3);
    let mut sources: Vec<Option<i32>> = Vec::with_capacity(n);
    for slot in fds.iter() {
        if slot == b"-" {
            sources.push(None);
            continue;
        }
        match registry.lookup(slot).and_then(|h| registry.get(h)).map(|fd| fd.fdnum) {
            Some(fdnum) => sources.push(Some(fdnum)),
            None => {
                eprintln!("initsv: unknown fd name in exec setup");
                return;
            }
        }
    }
    // fewer than 3 fds given explicitly still leaves the remaining slots closed
    sources.resize(n, None);

    // step 3: rescue any source fd that collides with a destination slot
    let mut rescued: Vec<Option<i32>> = sources.clone();
    for i in 0..n {
        if let Some(src) = rescued[i]
            && (src as usize) < n
        {
            let mut candidate = src;
            while (candidate as usize) < n {
                match nix::unistd::dup(candidate) {
                    Ok(new_fd) => candidate = new_fd,
                    Err(_) => return,
                }
            }
            rescued[i] = Some(candidate);
        }
    }

    for (i, src) in rescued.iter().enumerate().take(n) {
        match src {
            Some(fdnum) => {
                if *fdnum != i as i32 && nix::unistd::dup2(*fdnum, i as i32).is_err() {
                    return;
                }
            }
            None => {
                let _ = nix::unistd::close(i as i32);
            }
        }
    }

    for fd in (n as i32)..1024 {
        let _ = nix::unistd::close(fd);
    }

    let Ok(argv): std::result::Result<Vec<CString>, _> = args.iter().map(|a| CString::new(a.clone())).collect() else {
        return;
    };
    let env: Vec<CString> = Vec::new();
    let _ = nix::unistd::execve(&argv[0], &argv, &env);
    // execve only returns on failure
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut vars = Vars::new();
        vars.set("args", Some(b"web\t/bin/true")).unwrap();
        assert_eq!(vars.get("args"), b"web\t/bin/true");
        vars.set("args", Some(b"web\t/bin/false")).unwrap();
        assert_eq!(vars.get("args"), b"web\t/bin/false");
    }

    #[test]
    fn unset_returns_documented_default() {
        let mut vars = Vars::new();
        vars.set("args", Some(b"x")).unwrap();
        vars.set("args", None).unwrap();
        assert_eq!(vars.get("args"), Vec::<u8>::new());
        assert_eq!(vars.get("fds"), b"null\tnull\tnull");
    }

    #[test]
    fn pool_rejects_duplicate_names() {
        let mut pool = ServicePool::new();
        pool.create(b"web").unwrap();
        assert!(pool.create(b"web").is_err());
    }

    #[test]
    fn start_pending_advances_once_deadline_passes() {
        let mut pool = ServicePool::new();
        let h = pool.create(b"web").unwrap();
        let now = MonoTime::from_secs(10);
        pool.get_mut(h).unwrap().handle_start(MonoTime::from_secs(20), now);
        assert_eq!(pool.get(h).unwrap().state, State::StartPending);
    }

    /// Forks a real child that writes to a tempfile, drives the pool through
    /// start → up, reaps it, and checks the file landed on disk.
    #[test]
    fn fork_exec_reap_round_trip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();

        let mut registry = FdRegistry::new().unwrap();
        let mut controllers = ControllerPool::new();
        let mut pool = ServicePool::new();
        let h = pool.create(b"writer").unwrap();
        let now = MonoTime::now();
        pool.get_mut(h)
            .unwrap()
            .set_var("args", Some(format!("/bin/sh\t-c\techo hi > {path}").as_bytes()))
            .unwrap();
        pool.get_mut(h).unwrap().handle_start(now, now);
        pool.mark_active(h);

        assert!(pool.advance(h, &mut registry, &mut controllers, now).is_none());
        assert_eq!(pool.get(h).unwrap().state, State::Up);
        let pid = pool.get(h).unwrap().pid;
        assert!(pid > 0);

        let status = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None).unwrap();
        pool.reap_one(status, MonoTime::now(), &mut controllers);
        assert_eq!(pool.get(h).unwrap().state, State::Reaped);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "hi\n");
    }

    /// A service that wants an attached controller goes through `alloc-ctl`
    /// before it ever forks, and ends up with its stdin/stdout rewired to
    /// the new pipe pair.
    #[test]
    fn alloc_ctl_binds_controller_before_fork() {
        let mut registry = FdRegistry::new().unwrap();
        let mut controllers = ControllerPool::new();
        let mut pool = ServicePool::new();
        let h = pool.create(b"ctld").unwrap();
        pool.get_mut(h).unwrap().uses_control_cmd = true;
        pool.get_mut(h).unwrap().set_var("args", Some(b"/bin/true")).unwrap();
        let now = MonoTime::now();
        pool.get_mut(h).unwrap().handle_start(now, now);
        pool.mark_active(h);

        pool.advance(h, &mut registry, &mut controllers, now);
        assert!(pool.get(h).unwrap().attached_controller.is_some());
        let fds = pool.get(h).unwrap().fds();
        assert_eq!(fds[0], b"ctld.ctl-in");
        assert_eq!(fds[1], b"ctld.ctl-out");
        assert_eq!(pool.get(h).unwrap().state, State::Up);
    }
}
