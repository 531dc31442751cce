//! The fatal-error handler and termination machinery.
//!
//! Preserves a three-way branch order: exec-on-exit is always attempted first
//! regardless of terminate-guard; only if that exec itself fails (or isn't
//! configured) does terminate-guard or a real exit come into play.

use std::ffi::CString;

/// Global termination request, set by signal handling or a control command;
/// checked once per tick.
pub static TERMINATE_REQUESTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

pub fn request_termination() {
    TERMINATE_REQUESTED.store(true, std::sync::atomic::Ordering::SeqCst);
}

pub fn termination_requested() -> bool {
    TERMINATE_REQUESTED.load(std::sync::atomic::Ordering::SeqCst)
}

/// `fatal(detail, exit_code)`: exec into the cleanup program if configured;
/// otherwise either log-and-continue under terminate-guard (returning to the
/// caller) or exit the process for good.
///
/// Unlike the original, this does not force `-> !`: under terminate-guard
/// the event loop must keep ticking, so this returns control to it instead
/// of parking. Callers that are *not* under terminate-guard never see this
/// return — the process is gone by the time it would.
pub fn fatal(detail: &str, exit_code: i32, exec_on_exit: Option<&[String]>, terminate_guard: bool) {
    log::error!("fatal: {detail} (exit code {exit_code})");

    if let Some(argv) = exec_on_exit {
        // SAFETY: called from the single supervisor thread before any exec;
        // no other thread observes these env vars.
        unsafe {
            std::env::set_var("INIT_FRAME_ERROR", detail);
            std::env::set_var("INIT_FRAME_EXITCODE", exit_code.to_string());
        }
        if let Some(cargv) = build_cstring_argv(argv) {
            let env: Vec<CString> = std::env::vars()
                .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
                .collect();
            let _ = nix::unistd::execve(&cargv[0], &cargv, &env);
            log::error!("exec-on-exit failed to exec, falling through");
        }
    }

    if terminate_guard {
        log::warn!("terminate-guard set: continuing despite fatal error");
        return;
    }

    std::process::exit(exit_code);
}

fn build_cstring_argv(argv: &[String]) -> Option<Vec<CString>> {
    if argv.is_empty() {
        return None;
    }
    argv.iter().map(|a| CString::new(a.as_str())).collect::<Result<Vec<_>, _>>().ok()
}
