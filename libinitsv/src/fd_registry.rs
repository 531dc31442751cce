//! Named FD registry: files, pipe endpoints, special handles.
//!
//! Grounded directly on `fd.c`. Entries live in a preallocated slab
//! ([`Fd`] in a `Vec<Slot>` that never grows past [`crate::config::FD_POOL_SIZE`]);
//! a free list of slab indices threads through freed slots; an
//! [`OrderedMap<usize>`](crate::ordered_map::OrderedMap) indexes names onto
//! slab handles, mirroring `fd_by_name`'s create-if-absent tree lookup.

use crate::error::{Error, Result};
use crate::ordered_map::OrderedMap;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use std::os::fd::RawFd;

pub type FdHandle = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    Undefined,
    File,
    PipeRead,
    PipeWrite,
    Special,
}

#[derive(Debug, Clone)]
pub enum Payload {
    None,
    Path(String),
    /// Non-owning link to the peer end of a pipe pair; `None` means "peer
    /// gone" and renders as `(closed)`.
    Peer(Option<FdHandle>),
    Description(String),
}

#[derive(Debug, Clone)]
pub struct Fd {
    pub name: Vec<u8>,
    pub kind: FdKind,
    pub fdnum: RawFd,
    pub is_const: bool,
    pub payload: Payload,
}

enum Slot {
    Occupied(Fd),
    Free { next: Option<FdHandle> },
}

/// Parsed `open()` option set. Unknown tokens are silently ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOpts {
    pub append: bool,
    pub create: bool,
    pub mkdir: bool,
    pub read: bool,
    pub write: bool,
    pub trunc: bool,
    pub nonblock: bool,
}

impl OpenOpts {
    /// Parse a comma-separated option list by prefix match against the fixed
    /// keyword set, mirroring `fd.c`'s `STRMATCH` dispatch.
    pub fn parse(spec: &str) -> OpenOpts {
        let mut opts = OpenOpts::default();
        for tok in spec.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            if "append".starts_with(tok) {
                opts.append = true;
            } else if "create".starts_with(tok) {
                opts.create = true;
            } else if "mkdir".starts_with(tok) {
                opts.mkdir = true;
            } else if "read".starts_with(tok) {
                opts.read = true;
            } else if "write".starts_with(tok) {
                opts.write = true;
            } else if "trunc".starts_with(tok) {
                opts.trunc = true;
            } else if "nonblock".starts_with(tok) {
                opts.nonblock = true;
            }
            // unknown tokens: ignored
        }
        opts
    }

    fn to_oflag(self) -> OFlag {
        let mut flags = OFlag::empty();
        flags.set(OFlag::O_APPEND, self.append);
        flags.set(OFlag::O_CREAT, self.create);
        flags.set(OFlag::O_TRUNC, self.trunc);
        flags.set(OFlag::O_NONBLOCK, self.nonblock);
        match (self.read, self.write) {
            (true, true) => flags | OFlag::O_RDWR,
            (false, true) => flags | OFlag::O_WRONLY,
            _ => flags | OFlag::O_RDONLY,
        }
    }
}

pub struct FdRegistry {
    slots: Vec<Slot>,
    free_head: Option<FdHandle>,
    names: OrderedMap<FdHandle>,
}

impl FdRegistry {
    /// Build a registry with `null`/`stdin`/`stdout`/`stderr` pre-installed.
    pub fn new() -> Result<FdRegistry> {
        let mut reg = FdRegistry { slots: Vec::new(), free_head: None, names: OrderedMap::new() };

        let null_fd = fcntl::open("/dev/null", OFlag::O_RDWR, Mode::empty())
            .map_err(|e| Error::fatal(format!("open /dev/null: {e}"), crate::config::EXIT_INVALID_ENVIRONMENT))?;
        reg.install_const(b"null", FdKind::Special, null_fd, Payload::Description("/dev/null".into()))?;
        reg.install_const(b"stdin", FdKind::Special, 0, Payload::Description("stdin".into()))?;
        reg.install_const(b"stdout", FdKind::Special, 1, Payload::Description("stdout".into()))?;
        reg.install_const(b"stderr", FdKind::Special, 2, Payload::Description("stderr".into()))?;
        Ok(reg)
    }

    fn install_const(&mut self, name: &[u8], kind: FdKind, fdnum: RawFd, payload: Payload) -> Result<FdHandle> {
        let handle = self.alloc_slot(Fd { name: name.to_vec(), kind, fdnum, is_const: true, payload })?;
        if !self.names.insert(name.to_vec(), handle) {
            return Err(Error::resource("duplicate const FD name"));
        }
        Ok(handle)
    }

    fn alloc_slot(&mut self, fd: Fd) -> Result<FdHandle> {
        if let Some(h) = self.free_head {
            let next = match &self.slots[h] {
                Slot::Free { next } => *next,
                Slot::Occupied(_) => unreachable!(),
            };
            self.free_head = next;
            self.slots[h] = Slot::Occupied(fd);
            return Ok(h);
        }
        if self.slots.len() >= crate::config::FD_POOL_SIZE {
            return Err(Error::resource("FD pool exhausted"));
        }
        self.slots.push(Slot::Occupied(fd));
        Ok(self.slots.len() - 1)
    }

    fn free_slot(&mut self, handle: FdHandle) {
        self.slots[handle] = Slot::Free { next: self.free_head };
        self.free_head = Some(handle);
    }

    pub fn get(&self, handle: FdHandle) -> Option<&Fd> {
        match self.slots.get(handle) {
            Some(Slot::Occupied(fd)) => Some(fd),
            _ => None,
        }
    }

    fn get_mut(&mut self, handle: FdHandle) -> Option<&mut Fd> {
        match self.slots.get_mut(handle) {
            Some(Slot::Occupied(fd)) => Some(fd),
            _ => None,
        }
    }

    pub fn lookup(&self, name: &[u8]) -> Option<FdHandle> {
        self.names.find(name)
    }

    pub fn iterate(&self, from_name: &[u8]) -> impl Iterator<Item = (&[u8], FdHandle)> {
        self.names.iter_from(from_name)
    }

    /// `open(name, path, opts)`.
    pub fn open(&mut self, name: &[u8], path: &str, opts: OpenOpts) -> Result<FdHandle> {
        if name.len() > crate::config::NAME_LIMIT {
            return Err(Error::resource("FD name too long"));
        }
        if opts.mkdir
            && let Some(parent) = std::path::Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::recoverable(format!("mkdir: {e}")))?;
        }
        let raw = fcntl::open(path, opts.to_oflag(), Mode::from_bits_truncate(0o644))
            .map_err(|e| Error::recoverable(format!("open {path}: {e}")))?;

        if let Some(existing) = self.names.find(name) {
            let fd = self.get(existing).ok_or_else(|| Error::recoverable("stale FD handle"))?;
            if fd.is_const {
                let _ = unistd::close(raw);
                return Err(Error::recoverable("cannot replace const FD"));
            }
            self.replace_descriptor(existing, FdKind::File, raw, Payload::Path(path.to_string()))?;
            return Ok(existing);
        }

        let handle = self.alloc_slot(Fd {
            name: name.to_vec(),
            kind: FdKind::File,
            fdnum: raw,
            is_const: false,
            payload: Payload::Path(path.to_string()),
        })?;
        if !self.names.insert(name.to_vec(), handle) {
            self.free_slot(handle);
            return Err(Error::resource("duplicate FD name"));
        }
        Ok(handle)
    }

    /// `pipe(name1, name2)`: name1 becomes the read end, name2 the write end.
    pub fn pipe(&mut self, name1: &[u8], name2: &[u8]) -> Result<(FdHandle, FdHandle)> {
        if let Some(h) = self.names.find(name1)
            && self.get(h).is_some_and(|fd| fd.is_const)
        {
            return Err(Error::recoverable("cannot rebind const FD"));
        }
        if let Some(h) = self.names.find(name2)
            && self.get(h).is_some_and(|fd| fd.is_const)
        {
            return Err(Error::recoverable("cannot rebind const FD"));
        }
        let (read_fd, write_fd) = unistd::pipe().map_err(|e| Error::recoverable(format!("pipe: {e}")))?;
        use std::os::fd::IntoRawFd;
        let read_fd = read_fd.into_raw_fd();
        let write_fd = write_fd.into_raw_fd();

        let h_read = self.bind(name1, FdKind::PipeRead, read_fd, Payload::Peer(None))?;
        let h_write = match self.bind(name2, FdKind::PipeWrite, write_fd, Payload::Peer(Some(h_read))) {
            Ok(h) => h,
            Err(e) => {
                self.delete(name1).ok();
                return Err(e);
            }
        };
        if let Some(fd) = self.get_mut(h_read) {
            fd.payload = Payload::Peer(Some(h_write));
        }
        Ok((h_read, h_write))
    }

    fn bind(&mut self, name: &[u8], kind: FdKind, raw: RawFd, payload: Payload) -> Result<FdHandle> {
        if name.len() > crate::config::NAME_LIMIT {
            return Err(Error::resource("FD name too long"));
        }
        if let Some(existing) = self.names.find(name) {
            self.replace_descriptor(existing, kind, raw, payload)?;
            return Ok(existing);
        }
        let handle = self.alloc_slot(Fd { name: name.to_vec(), kind, fdnum: raw, is_const: false, payload })?;
        if !self.names.insert(name.to_vec(), handle) {
            self.free_slot(handle);
            return Err(Error::resource("duplicate FD name"));
        }
        Ok(handle)
    }

    fn replace_descriptor(&mut self, handle: FdHandle, kind: FdKind, raw: RawFd, payload: Payload) -> Result<()> {
        let old_fd = self.get(handle).map(|fd| fd.fdnum);
        if let Some(fd) = self.get_mut(handle) {
            fd.kind = kind;
            fd.fdnum = raw;
            fd.payload = payload;
        }
        if let Some(old) = old_fd
            && old >= 0
        {
            let _ = unistd::close(old);
        }
        Ok(())
    }

    /// `assign(name, fdnum, is_const, description)`.
    pub fn assign(&mut self, name: &[u8], fdnum: RawFd, is_const: bool, description: &str) -> Result<FdHandle> {
        if name.len() > crate::config::NAME_LIMIT {
            return Err(Error::resource("FD name too long"));
        }
        if let Some(existing) = self.names.find(name) {
            if self.get(existing).is_some_and(|fd| fd.is_const) {
                return Err(Error::recoverable("cannot replace const FD"));
            }
            self.replace_descriptor(existing, FdKind::Special, fdnum, Payload::Description(description.to_string()))?;
            if let Some(fd) = self.get_mut(existing) {
                fd.is_const = is_const;
            }
            return Ok(existing);
        }
        let handle = self.alloc_slot(Fd {
            name: name.to_vec(),
            kind: FdKind::Special,
            fdnum,
            is_const,
            payload: Payload::Description(description.to_string()),
        })?;
        if !self.names.insert(name.to_vec(), handle) {
            self.free_slot(handle);
            return Err(Error::resource("duplicate FD name"));
        }
        Ok(handle)
    }

    /// `delete(name)`: closes the descriptor, nulls a pipe peer's back-link.
    pub fn delete(&mut self, name: &[u8]) -> Result<()> {
        let handle = self.names.find(name).ok_or_else(|| Error::recoverable("no such FD"))?;
        let fd = self.get(handle).ok_or_else(|| Error::recoverable("stale FD handle"))?.clone();
        if fd.is_const {
            return Err(Error::recoverable("cannot delete const FD"));
        }
        if let Payload::Peer(Some(peer)) = fd.payload
            && let Some(peer_fd) = self.get_mut(peer)
        {
            peer_fd.payload = Payload::Peer(None);
        }
        if fd.fdnum >= 0 {
            let _ = unistd::close(fd.fdnum);
        }
        self.names.remove(name);
        self.free_slot(handle);
        Ok(())
    }

    /// Render a peer link as the control-protocol expects: `(closed)` if the
    /// peer is gone.
    pub fn peer_name(&self, handle: FdHandle) -> String {
        match self.get(handle).map(|fd| &fd.payload) {
            Some(Payload::Peer(Some(peer))) => self
                .get(*peer)
                .map(|fd| String::from_utf8_lossy(&fd.name).into_owned())
                .unwrap_or_else(|| "(closed)".to_string()),
            Some(Payload::Peer(None)) => "(closed)".to_string(),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preinstalled_entries_exist() {
        let reg = FdRegistry::new().unwrap();
        assert!(reg.lookup(b"null").is_some());
        assert!(reg.lookup(b"stdin").is_some());
        assert!(reg.lookup(b"stdout").is_some());
        assert!(reg.lookup(b"stderr").is_some());
    }

    #[test]
    fn pipe_peers_link_and_unlink() {
        let mut reg = FdRegistry::new().unwrap();
        let (r, w) = reg.pipe(b"a", b"b").unwrap();
        assert_eq!(reg.peer_name(r), "b");
        assert_eq!(reg.peer_name(w), "a");
        reg.delete(b"b").unwrap();
        assert_eq!(reg.peer_name(r), "(closed)");
    }

    #[test]
    fn open_option_parsing_ignores_unknown_tokens() {
        let opts = OpenOpts::parse("wr,bogus,nonbl");
        assert!(opts.write);
        assert!(opts.nonblock);
    }

    #[test]
    fn const_entries_reject_delete() {
        let mut reg = FdRegistry::new().unwrap();
        assert!(reg.delete(b"null").is_err());
    }
}
