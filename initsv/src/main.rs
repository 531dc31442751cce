mod cli;

use clap::Parser;
use libinitsv::config::{EXIT_BAD_OPTIONS, EXIT_BROKEN_PROGRAM_STATE};
use libinitsv::runtime::Runtime;
use nix::sys::stat::Mode;
use std::os::fd::{IntoRawFd, RawFd};

fn main() {
    let args = cli::CliArgs::parse();
    let config = match args.into_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("initsv: {e}");
            std::process::exit(EXIT_BAD_OPTIONS);
        }
    };

    if let Err(e) = libinitsv::diag_log::init(config.level_filter()) {
        eprintln!("initsv: {e}");
    }

    if config.is_pid1 {
        nix::sys::stat::umask(Mode::from_bits_truncate(0o77));
    }

    if config.daemonize {
        daemonize();
    }

    if config.mlockall {
        // SAFETY: called once at startup, before any other allocation-heavy
        // work; failure is logged and non-fatal (spec doesn't list it among
        // the fatal conditions).
        if let Err(e) = unsafe {
            nix::sys::mman::mlockall(nix::sys::mman::MlockAllFlags::MCL_CURRENT | nix::sys::mman::MlockAllFlags::MCL_FUTURE)
        } {
            log::warn!("mlockall failed: {e}");
        }
    }

    let mut runtime = match Runtime::new(config.clone()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("initsv: {e}");
            std::process::exit(EXIT_BROKEN_PROGRAM_STATE);
        }
    };

    if let Some(socket_path) = &config.socket_path {
        match bind_control_socket(socket_path) {
            Ok(fd) => runtime.listen_fd = Some(fd),
            Err(e) => {
                eprintln!("initsv: bind {}: {e}", socket_path.display());
                std::process::exit(EXIT_BROKEN_PROGRAM_STATE);
            }
        }
    }

    if let Some(path) = &config.config_file {
        if let Err(e) = load_config_file(&mut runtime, path) {
            eprintln!("initsv: config file {}: {e}", path.display());
            std::process::exit(EXIT_BROKEN_PROGRAM_STATE);
        }
    }

    if config.interactive {
        setup_interactive_controller(&mut runtime);
    }

    let exit_code = libinitsv::event_loop::run(&mut runtime);
    std::process::exit(exit_code);
}

/// Fork once; the parent prints the child's PID and exits 0, the child
/// detaches.
fn daemonize() {
    // SAFETY: called before any other threads exist and before the runtime
    // has opened any resources that would need parent-side cleanup.
    match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Parent { child }) => {
            println!("{}", child.as_raw());
            std::process::exit(0);
        }
        Ok(nix::unistd::ForkResult::Child) => {
            let _ = nix::unistd::setsid();
            redirect_std_fds_to_null();
        }
        Err(e) => {
            eprintln!("initsv: daemonize fork failed: {e}");
            std::process::exit(EXIT_BROKEN_PROGRAM_STATE);
        }
    }
}

/// Replace stdin/stdout/stderr with `/dev/null`.
fn redirect_std_fds_to_null() {
    let Ok(devnull) = nix::fcntl::open("/dev/null", nix::fcntl::OFlag::O_RDWR, Mode::empty()) else {
        return;
    };
    for target in [0, 1, 2] {
        let _ = nix::unistd::dup2(devnull, target);
    }
    if devnull > 2 {
        let _ = nix::unistd::close(devnull);
    }
}

fn bind_control_socket(path: &std::path::Path) -> nix::Result<RawFd> {
    use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, UnixAddr};

    if let Ok(meta) = std::fs::metadata(path) {
        use std::os::unix::fs::MetadataExt;
        let is_socket = meta.file_type().is_socket();
        let owned_by_us = meta.uid() == nix::unistd::geteuid().as_raw();
        if is_socket && owned_by_us {
            let _ = std::fs::remove_file(path);
        }
    }

    let sock = socket::socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)?;
    let sock_fd = sock.into_raw_fd();
    let addr = UnixAddr::new(path)?;
    socket::bind(sock_fd, &addr)?;
    socket::listen(
        unsafe { std::os::fd::BorrowedFd::borrow_raw(sock_fd) },
        socket::Backlog::new(libinitsv::config::SOCKET_BACKLOG).unwrap_or(socket::Backlog::new(2).unwrap()),
    )?;
    Ok(sock_fd)
}

/// A config file is driven through the same command vocabulary as a live
/// controller, just fed from a string instead of a socket. It has no peer to
/// talk back to, so error/info replies are dropped (logged at `warn`); any
/// resulting state-change broadcasts still reach whatever controllers are
/// already attached.
fn load_config_file(runtime: &mut Runtime, path: &std::path::Path) -> std::io::Result<()> {
    let contents = if path.as_os_str() == "-" {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)?
    };

    use libinitsv::control_proto;
    use libinitsv::time::MonoTime;

    let now = MonoTime::now();
    for line in contents.lines() {
        if let Some(cmd) = control_proto::parse_line(line.as_bytes()) {
            control_proto::dispatch(cmd, &mut runtime.services, &mut runtime.registry, now, &mut runtime.controllers, None);
        }
    }
    Ok(())
}

/// Binds stdin/stdout as the interactive controller and re-points the named
/// `stdin`/`stdout` FDs at `/dev/null`, since descriptors 0/1 are now owned
/// by the controller.
fn setup_interactive_controller(runtime: &mut Runtime) {
    match runtime.controllers.alloc(0, 1) {
        Ok(handle) => {
            runtime.controllers.get_mut(handle).unwrap().set_auto_final_newline(false);
            runtime.controllers.mark_interactive(handle);
            log::info!("interactive controller attached on stdin/stdout");
            let null_fd = runtime.registry.lookup(b"null").and_then(|h| runtime.registry.get(h)).map(|fd| fd.fdnum).unwrap_or(-1);
            let _ = runtime.registry.assign(b"stdin", null_fd, false, "/dev/null (stdin owned by interactive controller)");
            let _ = runtime.registry.assign(b"stdout", null_fd, false, "/dev/null (stdout owned by interactive controller)");
        }
        Err(e) => {
            eprintln!("initsv: cannot allocate interactive controller: {e}");
            std::process::exit(EXIT_BROKEN_PROGRAM_STATE);
        }
    }
}
