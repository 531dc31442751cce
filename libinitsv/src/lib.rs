#![allow(clippy::result_large_err)]

//! `libinitsv` is the core library behind `initsv`, a process supervisor
//! that can run as an init (PID 1) or as an ordinary daemon. It contains:
//!
//! - An ordered map substituting for an intrusive red-black tree
//! - A named FD registry (files, pipe pairs, special handles)
//! - A self-pipe signal relay
//! - A buffered, retry-guarded log sink
//! - The per-service state machine (fork/exec/reap/restart)
//! - The per-connection controller protocol state machine
//! - The control-protocol command/event vocabulary
//! - The single-threaded event loop tying all of the above together

pub mod config;
pub mod control_proto;
pub mod controller;
pub mod diag_log;
pub mod error;
pub mod event_loop;
pub mod fd_registry;
pub mod log_sink;
pub mod ordered_map;
pub mod runtime;
pub mod service;
pub mod shutdown;
pub mod signal_relay;
pub mod strutil;
pub mod time;
