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
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// A file descriptor with a single owner. The descriptor is closed
/// when the `Fd` is dropped or explicitly closed, and closing twice
/// is a no-op.
#[derive(Debug, Default)]
pub struct Fd(Option<OwnedFd>);

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "descriptor closed")
}

fn cvt(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

impl Fd {
    /// No descriptor.
    pub fn none() -> Self {
        Fd(None)
    }

    /// Take ownership of a descriptor (anything convertible into an
    /// `OwnedFd`: streams, pipes of a child process, sockets).
    pub fn new<F: Into<OwnedFd>>(fd: F) -> Self {
        Fd(Some(fd.into()))
    }

    /// The raw descriptor, if still open.
    pub fn raw(&self) -> Option<RawFd> {
        self.0.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// The owned descriptor, if still open.
    pub fn get(&self) -> Option<&OwnedFd> {
        self.0.as_ref()
    }

    /// Whether the descriptor is still open.
    pub fn is_open(&self) -> bool {
        self.0.is_some()
    }

    /// Close the descriptor. Returns whether there was one to close.
    pub fn close(&mut self) -> bool {
        self.0.take().is_some()
    }

    /// Give up ownership of the descriptor.
    pub fn take(&mut self) -> Option<OwnedFd> {
        self.0.take()
    }

    /// Put the descriptor in non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        match self.raw() {
            Some(fd) => set_nonblocking(fd),
            None => Err(closed()),
        }
    }

    /// Read into `buf`. Returns 0 on end of file.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.raw().ok_or_else(closed)?;
        cvt(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
    }

    /// Write from `buf`, returning the number of bytes written.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.raw().ok_or_else(closed)?;
        cvt(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
    }

    /// Whether the descriptor is a terminal.
    pub fn isatty(&self) -> bool {
        match self.raw() {
            Some(fd) => unsafe { libc::isatty(fd) == 1 },
            None => false,
        }
    }
}

impl From<OwnedFd> for Fd {
    fn from(fd: OwnedFd) -> Self {
        Fd(Some(fd))
    }
}

/// Set `O_NONBLOCK` on a raw descriptor.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK == 0
            && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// A close-on-exec pipe, returned as `(read end, write end)`.
pub fn pipe() -> io::Result<(Fd, Fd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(r.as_raw_fd())?;
    set_cloexec(w.as_raw_fd())?;
    Ok((Fd::from(r), Fd::from(w)))
}

/// Whether the terminal on `fd` has echo turned off while still in
/// canonical mode, i.e. is most likely reading a password.
pub fn tty_reading_password(fd: RawFd) -> bool {
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return false;
    }
    tio.c_lflag & libc::ECHO == 0 && tio.c_lflag & libc::ICANON != 0
}

/// Change the window size of the terminal on `fd`.
pub fn set_window_size(fd: RawFd, row: u32, col: u32, xpixel: u32, ypixel: u32) -> io::Result<()> {
    let ws = libc::winsize {
        ws_row: row as libc::c_ushort,
        ws_col: col as libc::c_ushort,
        ws_xpixel: xpixel as libc::c_ushort,
        ws_ypixel: ypixel as libc::c_ushort,
    };
    if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// The set of descriptors waited on by one iteration of the event
/// loop. Interests are registered before the wait, and readiness is
/// queried after it. A descriptor registered twice (for instance a
/// socket used for both directions) occupies a single `pollfd`.
#[derive(Debug, Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
    interrupted: bool,
}

const READ_READY: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
const WRITE_READY: libc::c_short = libc::POLLOUT | libc::POLLHUP | libc::POLLERR;

impl PollSet {
    /// An empty set.
    pub fn new() -> Self {
        PollSet::default()
    }

    /// Forget all interests and readiness.
    pub fn clear(&mut self) {
        self.fds.clear();
        self.index.clear();
        self.interrupted = false;
    }

    fn entry(&mut self, fd: RawFd) -> &mut libc::pollfd {
        let fds = &mut self.fds;
        let i = *self.index.entry(fd).or_insert_with(|| {
            fds.push(libc::pollfd {
                fd,
                events: 0,
                revents: 0,
            });
            fds.len() - 1
        });
        &mut self.fds[i]
    }

    /// Wait until `fd` is readable.
    pub fn want_read(&mut self, fd: RawFd) {
        self.entry(fd).events |= libc::POLLIN
    }

    /// Wait until `fd` is writable.
    pub fn want_write(&mut self, fd: RawFd) {
        self.entry(fd).events |= libc::POLLOUT
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    /// Whether no descriptor is registered.
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Wait for readiness, at most `timeout` (forever if `None`).
    /// Returns the number of ready descriptors, 0 on timeout. An
    /// interrupted wait clears all readiness and returns 0.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.interrupted = false;
        for p in self.fds.iter_mut() {
            p.revents = 0
        }
        let ms = match timeout {
            None => -1,
            Some(t) => {
                let ms = t.as_millis() + if t.subsec_nanos() % 1_000_000 > 0 { 1 } else { 0 };
                std::cmp::min(ms, libc::c_int::max_value() as u128) as libc::c_int
            }
        };
        let n = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, ms) };
        if n < 0 {
            let e = io::Error::last_os_error();
            for p in self.fds.iter_mut() {
                p.revents = 0
            }
            if e.kind() == io::ErrorKind::Interrupted {
                self.interrupted = true;
                return Ok(0);
            }
            return Err(e);
        }
        Ok(n as usize)
    }

    /// Whether the last wait was interrupted by a signal, rather than
    /// timed out.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    fn revents(&self, fd: RawFd) -> (libc::c_short, libc::c_short) {
        match self.index.get(&fd) {
            Some(&i) => (self.fds[i].events, self.fds[i].revents),
            None => (0, 0),
        }
    }

    /// Whether `fd` was registered for reading and is readable (or
    /// hung up, so that the next read reports the condition).
    pub fn readable(&self, fd: Option<RawFd>) -> bool {
        match fd {
            Some(fd) => {
                let (ev, rev) = self.revents(fd);
                ev & libc::POLLIN != 0 && rev & READ_READY != 0
            }
            None => false,
        }
    }

    /// Whether `fd` was registered for writing and is writable.
    pub fn writable(&self, fd: Option<RawFd>) -> bool {
        match fd {
            Some(fd) => {
                let (ev, rev) = self.revents(fd);
                ev & libc::POLLOUT != 0 && rev & WRITE_READY != 0
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pipe_readiness() {
        let (r, w) = pipe().unwrap();
        r.set_nonblocking().unwrap();
        let mut set = PollSet::new();
        set.want_read(r.raw().unwrap());
        set.want_write(w.raw().unwrap());
        assert_eq!(set.len(), 2);
        assert_eq!(set.wait(Some(Duration::from_millis(10))).unwrap(), 1);
        assert!(!set.readable(r.raw()));
        assert!(set.writable(w.raw()));
        // Not registered for reading.
        assert!(!set.readable(w.raw()));

        assert_eq!(w.write(b"x").unwrap(), 1);
        assert_eq!(set.wait(None).unwrap(), 2);
        assert!(set.readable(r.raw()));
        let mut buf = [0; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 1);
        match r.read(&mut buf) {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            x => panic!("{:?}", x),
        }
    }

    #[test]
    fn close_once() {
        let (mut r, mut w) = pipe().unwrap();
        assert!(w.close());
        assert!(!w.close());
        assert!(w.write(b"x").is_err());
        let mut buf = [0; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert!(r.close());
        assert!(!r.is_open());
    }

    #[test]
    fn same_fd_twice() {
        let (r, _w) = pipe().unwrap();
        let mut set = PollSet::new();
        set.want_read(r.raw().unwrap());
        set.want_write(r.raw().unwrap());
        assert_eq!(set.len(), 1);
        set.clear();
        assert!(set.is_empty());
    }
}
