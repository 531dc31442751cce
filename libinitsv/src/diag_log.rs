//! Ambient developer-facing diagnostics — distinct from the in-band
//! [`crate::log_sink`]. A `fern::Dispatch` with a `chrono`-stamped,
//! level-colored line format.
//!
//! Writes to stderr rather than stdout, since stdout/stdin may be handed to
//! an interactive controller (`-i`).

use log::LevelFilter;

pub fn init(level: LevelFilter) -> Result<(), String> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            let level = record.level();
            let colored_level = match level {
                log::Level::Error => format!("\x1b[31m{}\x1b[0m", level),
                log::Level::Warn => format!("\x1b[33m{}\x1b[0m", level),
                log::Level::Info => format!("\x1b[32m{}\x1b[0m", level),
                log::Level::Debug => format!("\x1b[34m{}\x1b[0m", level),
                log::Level::Trace => format!("\x1b[36m{}\x1b[0m", level),
            };
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                colored_level,
                message
            ));
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .map_err(|e| format!("error setting up logger: {e}"))
}
