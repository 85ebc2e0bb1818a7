// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! A SIGCHLD handler that wakes up the event loop.
//!
//! The handler only sets a flag and writes one byte to a non-blocking
//! pipe, whose read end is part of the poll set. Children are reaped
//! by the loop itself, with SIGCHLD blocked.
//!
//! There is one handler per process, so at most one `Notify` should
//! be alive at a time (a server forks one process per connection).
use crate::fd::{self, Fd, PollSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static CHILD_TERMINATED: AtomicBool = AtomicBool::new(false);
static NOTIFY_WRITE: AtomicI32 = AtomicI32::new(-1);

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno()
}

extern "C" fn sigchld_handler(_: libc::c_int) {
    unsafe {
        let errno = errno_location();
        let save = *errno;
        notify_parent();
        *errno = save;
    }
}

/// Record that a child terminated, and wake up the loop. Only
/// async-signal-safe operations are performed.
pub fn notify_parent() {
    CHILD_TERMINATED.store(true, Ordering::SeqCst);
    let fd = NOTIFY_WRITE.load(Ordering::SeqCst);
    if fd >= 0 {
        let b = 0u8;
        unsafe {
            libc::write(fd, &b as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Whether a child terminated since the last call to
/// `Notify::collect_children`.
pub fn child_terminated() -> bool {
    CHILD_TERMINATED.load(Ordering::SeqCst)
}

/// Blocks SIGCHLD until dropped.
struct SigchldBlock {
    old: libc::sigset_t,
}

impl SigchldBlock {
    fn new() -> Self {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGCHLD);
            libc::sigprocmask(libc::SIG_BLOCK, &set, &mut old);
            SigchldBlock { old }
        }
    }
}

impl Drop for SigchldBlock {
    fn drop(&mut self) {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

/// The notification pipe, and the SIGCHLD handler writing to it.
#[derive(Debug)]
pub struct Notify {
    read: Fd,
    write: Fd,
    installed: bool,
}

impl Notify {
    /// Create the pipe. The handler is not installed yet, see
    /// `install`.
    pub fn new() -> io::Result<Self> {
        let (read, write) = fd::pipe()?;
        read.set_nonblocking()?;
        write.set_nonblocking()?;
        if let Some(w) = write.raw() {
            NOTIFY_WRITE.store(w, Ordering::SeqCst);
        }
        Ok(Notify {
            read,
            write,
            installed: false,
        })
    }

    /// Install the SIGCHLD handler.
    pub fn install(&mut self) -> io::Result<()> {
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = sigchld_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
            sa.sa_flags = libc::SA_RESTART | libc::SA_NOCLDSTOP;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(libc::SIGCHLD, &sa, std::ptr::null_mut()) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        self.installed = true;
        Ok(())
    }

    /// Restore the default SIGCHLD disposition, so that children can
    /// be waited for explicitly.
    pub fn uninstall(&mut self) {
        if self.installed {
            unsafe {
                libc::signal(libc::SIGCHLD, libc::SIG_DFL);
            }
            self.installed = false
        }
    }

    /// Add the read end of the pipe to the poll set.
    pub fn prepare(&self, set: &mut PollSet) {
        if let Some(fd) = self.read.raw() {
            set.want_read(fd)
        }
    }

    /// Drain the pipe if it was readable.
    pub fn done(&self, set: &PollSet) {
        if set.readable(self.read.raw()) {
            let mut buf = [0; 128];
            loop {
                match self.read.read(&mut buf) {
                    Ok(n) if n > 0 => {}
                    Ok(_) => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        }
    }

    /// Reap every terminated child, calling `f` with its pid and raw
    /// wait status. SIGCHLD is blocked while the flag is consulted, so
    /// a child terminating during the call is not missed.
    pub fn collect_children<F: FnMut(libc::pid_t, libc::c_int)>(&self, mut f: F) {
        let _block = SigchldBlock::new();
        if CHILD_TERMINATED.load(Ordering::SeqCst) {
            loop {
                let mut status = 0;
                let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                if pid > 0 {
                    f(pid, status)
                } else {
                    if pid < 0 {
                        let e = io::Error::last_os_error();
                        if e.kind() == io::ErrorKind::Interrupted {
                            continue;
                        }
                        if e.raw_os_error() != Some(libc::ECHILD) {
                            error!("waitpid: {}", e);
                        }
                    }
                    break;
                }
            }
            CHILD_TERMINATED.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for Notify {
    fn drop(&mut self) {
        if self.installed {
            unsafe {
                libc::signal(libc::SIGCHLD, libc::SIG_DFL);
            }
        }
        if self.write.raw() == Some(NOTIFY_WRITE.load(Ordering::SeqCst)) {
            NOTIFY_WRITE.store(-1, Ordering::SeqCst);
        }
        self.write.close();
        self.read.close();
    }
}
