// SPDX-License-Identifier: MIT

//! Per-shard wake pipe (§2, "Wake pipe"): a self-connected pipe whose read
//! end is registered with the shard's notifier like any other fd, so a
//! single `write` from any thread breaks the shard out of a blocking `wait`.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{pipe, read, write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct WakePipe {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    waking: AtomicBool,
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

impl WakePipe {
    pub fn new() -> std::io::Result<Self> {
        let (read_fd, write_fd) = pipe()?;
        set_nonblocking(&read_fd)?;
        set_nonblocking(&write_fd)?;
        Ok(Self { read_fd, write_fd, waking: AtomicBool::new(false) })
    }

    pub fn read_raw_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Write one byte, unless a wake is already pending (multiple pending
    /// wakes coalesce into one, per §5 "Wakeup protocol").
    pub fn wake(&self) {
        if self.waking.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = write(&self.write_fd, &[0u8]);
    }

    /// Drain the entire pending buffer in one non-blocking sweep and clear
    /// the waking flag, per §4.2 step 5.
    pub fn drain(&self) {
        let mut buf = [0u8; 256];
        loop {
            match read(self.read_fd.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EWOULDBLOCK) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
        self.waking.store(false, Ordering::Release);
    }
}
