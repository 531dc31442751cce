//! Per-connection controller: line-framed input/output buffers, overflow
//! recovery, attached-service pairing.
//!
//! Per-connection line framing with overflow recovery and accept/backoff.

use crate::error::{Error, Result};
use crate::service::ServiceHandle;
use nix::errno::Errno;
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::unistd::{close, read, write};
use std::os::fd::{BorrowedFd, RawFd};

pub type ControllerHandle = usize;

const OUTPUT_BUFFER_CAPACITY: usize = 8192;
const INPUT_BUFFER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Free,
    Active,
    Draining,
    Overflowed,
}

pub struct Controller {
    pub state: State,
    input_fd: RawFd,
    output_fd: RawFd,
    input_buf: Vec<u8>,
    output_buf: Vec<u8>,
    pub auto_final_newline: bool,
    pub attached_service: Option<ServiceHandle>,
    eof_seen: bool,
}

impl Controller {
    fn new() -> Controller {
        Controller {
            state: State::Free,
            input_fd: -1,
            output_fd: -1,
            input_buf: Vec::new(),
            output_buf: Vec::new(),
            auto_final_newline: true,
            attached_service: None,
            eof_seen: false,
        }
    }

    /// `ctor(ctl, in_fd, out_fd)`: install descriptors, mark nonblocking,
    /// reset buffers.
    fn bind(&mut self, in_fd: RawFd, out_fd: RawFd) -> Result<()> {
        set_nonblocking(in_fd)?;
        if out_fd != in_fd {
            set_nonblocking(out_fd)?;
        }
        self.input_fd = in_fd;
        self.output_fd = out_fd;
        self.input_buf.clear();
        self.output_buf.clear();
        self.state = State::Active;
        self.eof_seen = false;
        self.attached_service = None;
        Ok(())
    }

    pub fn set_auto_final_newline(&mut self, b: bool) {
        self.auto_final_newline = b;
    }

    pub fn queue_event(&mut self, fields: &[&[u8]]) {
        if self.state == State::Overflowed {
            return;
        }
        let mut line = Vec::new();
        for (i, f) in fields.iter().enumerate() {
            if i > 0 {
                line.push(b'\t');
            }
            line.extend_from_slice(f);
        }
        line.push(b'\n');
        if self.output_buf.len() + line.len() > OUTPUT_BUFFER_CAPACITY {
            self.state = State::Overflowed;
            return;
        }
        self.output_buf.extend_from_slice(&line);
    }

    /// Read available input, split complete lines, and return them for
    /// dispatch by the caller ("dispatch each to the command processor
    /// (external)").
    pub fn pump_input(&mut self) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        if self.state != State::Active && self.state != State::Overflowed {
            return lines;
        }
        let mut buf = [0u8; 1024];
        loop {
            let borrowed = unsafe { BorrowedFd::borrow_raw(self.input_fd) };
            match read(borrowed, &mut buf) {
                Ok(0) => {
                    self.eof_seen = true;
                    break;
                }
                Ok(n) => {
                    if self.input_buf.len() + n > INPUT_BUFFER_CAPACITY {
                        self.state = State::Overflowed;
                    } else {
                        self.input_buf.extend_from_slice(&buf[..n]);
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(_) => {
                    self.eof_seen = true;
                    break;
                }
            }
        }
        while let Some(pos) = self.input_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.input_buf.drain(..=pos).collect();
            lines.push(line[..line.len() - 1].to_vec());
        }
        if self.eof_seen && !self.input_buf.is_empty() {
            if self.auto_final_newline {
                lines.push(std::mem::take(&mut self.input_buf));
            } else {
                self.input_buf.clear();
            }
        }
        lines
    }

    /// Write pending output if the descriptor is writable; handles the
    /// overflow→single-"reset"-event transition back to normal operation.
    pub fn pump_output(&mut self, writable: bool) {
        if !writable {
            return;
        }
        if self.state == State::Overflowed {
            self.output_buf.clear();
            self.queue_event_raw(b"reset\n");
            self.state = State::Active;
            return;
        }
        if self.output_buf.is_empty() {
            if self.state == State::Draining {
                self.destroy();
            }
            return;
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.output_fd) };
        match write(borrowed, &self.output_buf) {
            Ok(n) => {
                self.output_buf.drain(..n);
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(_) => self.destroy(),
        }
    }

    fn queue_event_raw(&mut self, line: &[u8]) {
        self.output_buf.extend_from_slice(line);
    }

    pub fn should_destroy(&self) -> bool {
        self.eof_seen && self.output_buf.is_empty()
    }

    /// EOF/error: drain remaining output then destruct.
    pub fn begin_drain(&mut self) {
        if self.eof_seen {
            self.state = State::Draining;
        }
    }

    fn destroy(&mut self) {
        if self.input_fd >= 0 {
            let _ = close(self.input_fd);
        }
        if self.output_fd >= 0 && self.output_fd != self.input_fd {
            let _ = close(self.output_fd);
        }
        self.input_fd = -1;
        self.output_fd = -1;
        self.state = State::Free;
        self.attached_service = None;
    }

    pub fn input_fd(&self) -> RawFd {
        self.input_fd
    }

    pub fn output_fd(&self) -> RawFd {
        self.output_fd
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: `fd` is owned by the caller for at least this call's duration.
    let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = fcntl::fcntl(bfd, FcntlArg::F_GETFL).map_err(|e| Error::recoverable(format!("fcntl getfl: {e}")))?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl::fcntl(bfd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::recoverable(format!("fcntl setfl: {e}")))?;
    Ok(())
}

pub struct ControllerPool {
    slots: Vec<Controller>,
    interactive: Option<ControllerHandle>,
}

impl ControllerPool {
    pub fn new() -> ControllerPool {
        let mut slots = Vec::with_capacity(crate::config::CONTROLLER_POOL_COUNT);
        for _ in 0..crate::config::CONTROLLER_POOL_COUNT {
            slots.push(Controller::new());
        }
        ControllerPool { slots, interactive: None }
    }

    pub fn alloc(&mut self, in_fd: RawFd, out_fd: RawFd) -> Result<ControllerHandle> {
        let handle = self.slots.iter().position(|c| c.state == State::Free).ok_or_else(|| Error::resource("controller pool exhausted"))?;
        self.slots[handle].bind(in_fd, out_fd)?;
        Ok(handle)
    }

    pub fn mark_interactive(&mut self, handle: ControllerHandle) {
        self.interactive = Some(handle);
    }

    pub fn is_interactive(&self, handle: ControllerHandle) -> bool {
        self.interactive == Some(handle)
    }

    pub fn get(&self, handle: ControllerHandle) -> Option<&Controller> {
        self.slots.get(handle)
    }

    pub fn get_mut(&mut self, handle: ControllerHandle) -> Option<&mut Controller> {
        self.slots.get_mut(handle)
    }

    pub fn active_handles(&self) -> Vec<ControllerHandle> {
        self.slots.iter().enumerate().filter(|(_, c)| c.state != State::Free).map(|(i, _)| i).collect()
    }

    /// Free a controller that has finished draining; returns whether it was
    /// the designated interactive controller ("loop is asked to
    /// terminate unless terminate-guard is set").
    pub fn reclaim_if_done(&mut self, handle: ControllerHandle) -> bool {
        let Some(ctl) = self.slots.get_mut(handle) else { return false };
        if ctl.should_destroy() {
            ctl.destroy();
            if self.interactive == Some(handle) {
                self.interactive = None;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_then_reset_cycle() {
        let mut ctl = Controller::new();
        ctl.bind(-1, -1).ok(); // fcntl on -1 fails; test the buffer logic directly instead
        ctl.state = State::Active;
        ctl.output_buf.clear();
        let big = vec![b'x'; OUTPUT_BUFFER_CAPACITY];
        ctl.queue_event(&[&big]);
        assert_eq!(ctl.state, State::Overflowed);
    }
}
