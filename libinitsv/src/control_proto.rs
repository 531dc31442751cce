//! Control protocol: parses incoming tab-separated command lines and renders
//! outgoing `notify_*` events.
//!
//! The command *vocabulary* (what `start`/`signal`/`args` etc. actually
//! do) is specified here explicitly; the broader
//! "high-level text-command vocabulary beyond what the protocol state
//! machine needs to know" remains out of scope.

use crate::controller::{Controller, ControllerHandle, ControllerPool};
use crate::fd_registry::{FdRegistry, OpenOpts};
use crate::service::ServicePool;
use crate::strutil::split_tokens;
use crate::time::MonoTime;

pub enum Command {
    ServiceStart { name: Vec<u8> },
    ServiceSetArgs { name: Vec<u8>, args: Vec<Vec<u8>> },
    ServiceSetFds { name: Vec<u8>, fds: Vec<Vec<u8>> },
    ServiceSetAutoRestart { name: Vec<u8>, enabled: bool },
    ServiceSetUsesControlEvent { name: Vec<u8>, enabled: bool },
    ServiceSetUsesControlCmd { name: Vec<u8>, enabled: bool },
    ServiceSignal { name: Vec<u8>, signum: i32 },
    FdOpen { name: Vec<u8>, path: Vec<u8>, opts: Vec<u8> },
    FdPipe { name1: Vec<u8>, name2: Vec<u8> },
    FdState { name: Vec<u8> },
    FdDelete { name: Vec<u8> },
    Exit,
    Unknown { verb: Vec<u8> },
}

/// Parse one tab-separated, already newline-stripped line into a [`Command`].
pub fn parse_line(line: &[u8]) -> Option<Command> {
    let fields = split_tokens(line, b'\t');
    let verb = *fields.first()?;
    let cmd = match verb {
        b"service.start" => Command::ServiceStart { name: fields.get(1)?.to_vec() },
        b"service.args" => Command::ServiceSetArgs {
            name: fields.get(1)?.to_vec(),
            args: fields[2..].iter().map(|f| f.to_vec()).collect(),
        },
        b"service.fds" => Command::ServiceSetFds {
            name: fields.get(1)?.to_vec(),
            fds: fields[2..].iter().map(|f| f.to_vec()).collect(),
        },
        b"service.auto-restart" => Command::ServiceSetAutoRestart {
            name: fields.get(1)?.to_vec(),
            enabled: fields.get(2) == Some(&b"true".as_slice()),
        },
        b"service.uses-control-event" => Command::ServiceSetUsesControlEvent {
            name: fields.get(1)?.to_vec(),
            enabled: fields.get(2) == Some(&b"true".as_slice()),
        },
        b"service.uses-control-cmd" => Command::ServiceSetUsesControlCmd {
            name: fields.get(1)?.to_vec(),
            enabled: fields.get(2) == Some(&b"true".as_slice()),
        },
        b"service.signal" => Command::ServiceSignal {
            name: fields.get(1)?.to_vec(),
            signum: std::str::from_utf8(fields.get(2)?).ok()?.parse().ok()?,
        },
        b"fd.open" => Command::FdOpen {
            name: fields.get(1)?.to_vec(),
            path: fields.get(2)?.to_vec(),
            opts: fields.get(3).copied().unwrap_or(b"").to_vec(),
        },
        b"fd.pipe" => Command::FdPipe { name1: fields.get(1)?.to_vec(), name2: fields.get(2)?.to_vec() },
        b"fd.state" => Command::FdState { name: fields.get(1)?.to_vec() },
        b"fd.delete" => Command::FdDelete { name: fields.get(1)?.to_vec() },
        b"exit" => Command::Exit,
        other => Command::Unknown { verb: other.to_vec() },
    };
    Some(cmd)
}

/// Apply a parsed command against the running state. Error/info replies go
/// only to `issuer` (if any — a config file has no peer to answer); state
/// changes are broadcast to every active controller by [`ServicePool::advance`]
/// and [`ServicePool::reap_one`] themselves, not from here, since most
/// transitions happen later and asynchronously with respect to the command
/// that triggered them.
pub fn dispatch(
    cmd: Command,
    services: &mut ServicePool,
    registry: &mut FdRegistry,
    now: MonoTime,
    controllers: &mut ControllerPool,
    issuer: Option<ControllerHandle>,
) {
    match cmd {
        Command::ServiceStart { name } => {
            let Some(h) = services.by_name(&name) else {
                reply(controllers, issuer, &[b"error", b"no such service", &name]);
                return;
            };
            services.get_mut(h).unwrap().handle_start(now, now);
            services.mark_active(h);
            notify_svc_state_all(controllers, &name, services.get(h).unwrap().state);
        }
        Command::ServiceSetArgs { name, args } => {
            let Some(h) = services.by_name(&name) else {
                reply(controllers, issuer, &[b"error", b"no such service", &name]);
                return;
            };
            let joined = args.join(&b'\t');
            if let Err(e) = services.get_mut(h).unwrap().set_var("args", Some(&joined)) {
                reply(controllers, issuer, &[b"error", e.to_string().as_bytes(), &name]);
            }
        }
        Command::ServiceSetFds { name, fds } => {
            let Some(h) = services.by_name(&name) else {
                reply(controllers, issuer, &[b"error", b"no such service", &name]);
                return;
            };
            let joined = fds.join(&b'\t');
            if let Err(e) = services.get_mut(h).unwrap().set_var("fds", Some(&joined)) {
                reply(controllers, issuer, &[b"error", e.to_string().as_bytes(), &name]);
            }
        }
        Command::ServiceSetAutoRestart { name, enabled } => {
            if let Some(h) = services.by_name(&name) {
                services.get_mut(h).unwrap().auto_restart = enabled;
            } else {
                reply(controllers, issuer, &[b"error", b"no such service", &name]);
            }
        }
        Command::ServiceSetUsesControlEvent { name, enabled } => {
            if let Some(h) = services.by_name(&name) {
                services.get_mut(h).unwrap().uses_control_event = enabled;
            } else {
                reply(controllers, issuer, &[b"error", b"no such service", &name]);
            }
        }
        Command::ServiceSetUsesControlCmd { name, enabled } => {
            if let Some(h) = services.by_name(&name) {
                services.get_mut(h).unwrap().uses_control_cmd = enabled;
            } else {
                reply(controllers, issuer, &[b"error", b"no such service", &name]);
            }
        }
        Command::ServiceSignal { name, signum } => {
            let Some(h) = services.by_name(&name) else {
                reply(controllers, issuer, &[b"error", b"no such service", &name]);
                return;
            };
            if let Ok(sig) = nix::sys::signal::Signal::try_from(signum)
                && let Err(e) = services.get(h).unwrap().send_signal(sig, false)
            {
                reply(controllers, issuer, &[b"error", e.to_string().as_bytes(), &name]);
            }
        }
        Command::FdOpen { name, path, opts } => {
            let path_str = String::from_utf8_lossy(&path).into_owned();
            let opts_str = String::from_utf8_lossy(&opts).into_owned();
            match registry.open(&name, &path_str, OpenOpts::parse(&opts_str)) {
                Ok(_) => notify_fd_state_all(controllers, registry, &name),
                Err(e) => reply(controllers, issuer, &[b"error", e.to_string().as_bytes(), &name]),
            }
        }
        Command::FdPipe { name1, name2 } => match registry.pipe(&name1, &name2) {
            Ok(_) => {
                notify_fd_state_all(controllers, registry, &name1);
                notify_fd_state_all(controllers, registry, &name2);
            }
            Err(e) => reply(controllers, issuer, &[b"error", e.to_string().as_bytes()]),
        },
        Command::FdState { name } => notify_fd_state_all(controllers, registry, &name),
        Command::FdDelete { name } => {
            if let Err(e) = registry.delete(&name) {
                reply(controllers, issuer, &[b"error", e.to_string().as_bytes(), &name]);
            }
        }
        Command::Exit => reply(controllers, issuer, &[b"info", b"exit requested"]),
        Command::Unknown { verb } => reply(controllers, issuer, &[b"error", b"unknown command", &verb]),
    }
}

/// Queue an event on the single controller that issued the command, if any.
fn reply(controllers: &mut ControllerPool, issuer: Option<ControllerHandle>, fields: &[&[u8]]) {
    match issuer.and_then(|h| controllers.get_mut(h)) {
        Some(ctl) => ctl.queue_event(fields),
        None => {
            let rendered: Vec<String> = fields.iter().map(|f| String::from_utf8_lossy(f).into_owned()).collect();
            log::warn!("dropped reply with no issuing controller: {}", rendered.join("\t"));
        }
    }
}

pub fn notify_svc_state(out: &mut Controller, name: &[u8], state: crate::service::State) {
    let state_str: &[u8] = match state {
        crate::service::State::Undefined => b"undefined",
        crate::service::State::Down => b"down",
        crate::service::State::StartPending => b"start-pending",
        crate::service::State::Start => b"start",
        crate::service::State::Up => b"up",
        crate::service::State::Reaped => b"reaped",
        crate::service::State::AllocCtl => b"alloc-ctl",
    };
    out.queue_event(&[b"service.state", name, state_str]);
}

/// Broadcast a `service.state` event to every active controller, mirroring
/// [`notify_signal_to_all`]'s broadcast-to-all convention. Called on every
/// actual state transition, not just ones triggered by an incoming command.
pub fn notify_svc_state_all(controllers: &mut ControllerPool, name: &[u8], state: crate::service::State) {
    for h in controllers.active_handles() {
        if let Some(ctl) = controllers.get_mut(h) {
            notify_svc_state(ctl, name, state);
        }
    }
}

pub fn notify_fd_state(out: &mut Controller, registry: &FdRegistry, name: &[u8]) {
    let Some(handle) = registry.lookup(name) else {
        out.queue_event(&[b"fd.state", name, b"(unknown)"]);
        return;
    };
    let peer = registry.peer_name(handle);
    out.queue_event(&[b"fd.state", name, b"", b"", peer.as_bytes()]);
}

/// Broadcast an `fd.state` event to every active controller.
pub fn notify_fd_state_all(controllers: &mut ControllerPool, registry: &FdRegistry, name: &[u8]) {
    for h in controllers.active_handles() {
        if let Some(ctl) = controllers.get_mut(h) {
            notify_fd_state(ctl, registry, name);
        }
    }
}

pub fn notify_signal(out: &mut Controller, signum: i32) {
    out.queue_event(&[b"signal", signum.to_string().as_bytes()]);
}

/// Broadcast a `signal` event to every active controller (step
/// (b): "emits a controller event per signal").
pub fn notify_signal_to_all(controllers: &mut ControllerPool, signum: i32) {
    for h in controllers.active_handles() {
        if let Some(ctl) = controllers.get_mut(h) {
            notify_signal(ctl, signum);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_start() {
        let cmd = parse_line(b"service.start\tweb").unwrap();
        assert!(matches!(cmd, Command::ServiceStart { name } if name == b"web"));
    }

    #[test]
    fn unknown_verb_is_unknown() {
        let cmd = parse_line(b"bogus.verb\tx").unwrap();
        assert!(matches!(cmd, Command::Unknown { .. }));
    }
}
