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
use super::forward::{self, ListenSocket};
use super::nchan;
use super::window::check_window;
use super::{Channel, ChannelState, ChannelTable, CloseFlags, ExtendedUsage, Filter, InputState, OutputState};
use crate::fd::{self, Fd, PollSet};
use crate::server::Session;
use socket2::SockRef;
use std::io;
use std::net::Shutdown;
use std::os::unix::io::RawFd;

const READ_SIZE: usize = 16384;

/// The descriptors of a channel.
pub enum Io {
    /// No descriptor yet (larval sessions) or any more.
    None,
    /// Separate descriptors for each direction, as for the pipes or
    /// pty of a session. `efd` carries stderr.
    Pipes {
        /// Read side.
        rfd: Fd,
        /// Write side.
        wfd: Fd,
        /// Extended data.
        efd: Fd,
    },
    /// A connected socket, whose directions are shut down separately.
    Socket {
        /// The socket.
        sock: Fd,
        /// The read direction is still open.
        read_open: bool,
        /// The write direction is still open.
        write_open: bool,
    },
    /// A listening socket.
    Listener(ListenSocket),
}

impl std::fmt::Debug for Io {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match *self {
            Io::None => fmt.write_str("None"),
            Io::Pipes { .. } => write!(
                fmt,
                "Pipes({:?}, {:?}, {:?})",
                self.rfd(),
                self.wfd(),
                self.efd()
            ),
            Io::Socket { ref sock, read_open, write_open } => write!(
                fmt,
                "Socket({:?}, r: {}, w: {})",
                sock.raw(),
                read_open,
                write_open
            ),
            Io::Listener(ref l) => write!(fmt, "Listener({:?})", l),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "descriptor closed")
}

impl Io {
    /// A connected socket, both directions open.
    pub fn socket(sock: Fd) -> Self {
        Io::Socket {
            sock,
            read_open: true,
            write_open: true,
        }
    }

    /// Separate descriptors. Any of them may be `Fd::none()`.
    pub fn pipes(rfd: Fd, wfd: Fd, efd: Fd) -> Self {
        Io::Pipes { rfd, wfd, efd }
    }

    /// The descriptor data is read from, if still open.
    pub fn rfd(&self) -> Option<RawFd> {
        match *self {
            Io::Pipes { ref rfd, .. } => rfd.raw(),
            Io::Socket { ref sock, read_open: true, .. } => sock.raw(),
            _ => None,
        }
    }

    /// The descriptor data is written to, if still open.
    pub fn wfd(&self) -> Option<RawFd> {
        match *self {
            Io::Pipes { ref wfd, .. } => wfd.raw(),
            Io::Socket { ref sock, write_open: true, .. } => sock.raw(),
            _ => None,
        }
    }

    /// The extended data descriptor, if still open.
    pub fn efd(&self) -> Option<RawFd> {
        match *self {
            Io::Pipes { ref efd, .. } => efd.raw(),
            _ => None,
        }
    }

    /// The socket of a connection or listener.
    pub fn sock(&self) -> Option<RawFd> {
        match *self {
            Io::Socket { ref sock, .. } => sock.raw(),
            Io::Listener(ref l) => Some(l.raw()),
            _ => None,
        }
    }

    /// Set all descriptors non-blocking.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        match *self {
            Io::None => Ok(()),
            Io::Pipes { ref rfd, ref wfd, ref efd } => {
                for fd in &[rfd, wfd, efd] {
                    if fd.is_open() {
                        fd.set_nonblocking()?
                    }
                }
                Ok(())
            }
            Io::Socket { ref sock, .. } => sock.set_nonblocking(),
            Io::Listener(ref l) => fd::set_nonblocking(l.raw()),
        }
    }

    /// Read from the read side.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Io::Pipes { ref rfd, .. } => rfd.read(buf),
            Io::Socket { ref sock, read_open: true, .. } => sock.read(buf),
            _ => Err(closed()),
        }
    }

    /// Write to the write side.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Io::Pipes { ref wfd, .. } => wfd.write(buf),
            Io::Socket { ref sock, write_open: true, .. } => sock.write(buf),
            _ => Err(closed()),
        }
    }

    /// Read from the extended descriptor.
    pub fn read_extended(&self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Io::Pipes { ref efd, .. } => efd.read(buf),
            _ => Err(closed()),
        }
    }

    /// Write to the extended descriptor.
    pub fn write_extended(&self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Io::Pipes { ref efd, .. } => efd.write(buf),
            _ => Err(closed()),
        }
    }

    /// Close the extended descriptor.
    pub fn close_efd(&mut self) -> bool {
        match *self {
            Io::Pipes { ref mut efd, .. } => efd.close(),
            _ => false,
        }
    }

    /// Stop reading: close the read descriptor, or shut the read
    /// direction of a socket down.
    pub fn shutdown_read(&mut self) -> io::Result<()> {
        match *self {
            Io::Pipes { ref mut rfd, .. } => {
                rfd.close();
                Ok(())
            }
            Io::Socket { ref sock, ref mut read_open, .. } => {
                if !*read_open {
                    return Ok(());
                }
                *read_open = false;
                if let Some(s) = sock.get() {
                    if let Err(e) = SockRef::from(s).shutdown(Shutdown::Read) {
                        if e.raw_os_error() != Some(libc::ENOTCONN) {
                            return Err(e);
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Stop writing: close the write descriptor, or shut the write
    /// direction of a socket down (so that the other end sees EOF).
    pub fn shutdown_write(&mut self) -> io::Result<()> {
        match *self {
            Io::Pipes { ref mut wfd, .. } => {
                wfd.close();
                Ok(())
            }
            Io::Socket { ref sock, ref mut write_open, .. } => {
                if !*write_open {
                    return Ok(());
                }
                *write_open = false;
                if let Some(s) = sock.get() {
                    if let Err(e) = SockRef::from(s).shutdown(Shutdown::Write) {
                        if e.raw_os_error() != Some(libc::ENOTCONN) {
                            return Err(e);
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted
}

/// Register the descriptors of a channel in `set`, according to its
/// state. Channels whose output has drained move on to the next
/// state here. When `congested`, nothing more is read from the
/// channel.
pub fn prepare(c: &mut Channel, s: &mut Session, set: &mut PollSet, congested: bool) {
    if c.kind.is_listener() {
        if c.state == ChannelState::Open {
            if let Some(fd) = c.io.sock() {
                set.want_read(fd)
            }
        }
        return;
    }
    match c.state {
        ChannelState::Connecting => {
            if let Some(fd) = c.io.sock() {
                set.want_write(fd)
            }
        }
        ChannelState::Open if s.protocol().is_13() => pre_open_13(c, s, set, congested),
        ChannelState::Open => pre_open(c, s, set, congested),
        ChannelState::InputDraining => pre_input_draining(c, s),
        ChannelState::OutputDraining => pre_output_draining(c, set),
        _ => {}
    }
}

fn pre_open_13(c: &mut Channel, s: &mut Session, set: &mut PollSet, congested: bool) {
    if !congested && c.input.len() < s.max_packet_size() {
        if let Some(fd) = c.io.rfd() {
            set.want_read(fd)
        }
    }
    if !c.output.is_empty() {
        if let Some(fd) = c.io.wfd() {
            set.want_write(fd)
        }
    }
}

fn pre_open(c: &mut Channel, s: &mut Session, set: &mut PollSet, congested: bool) {
    let proto = s.protocol();
    let limit = if proto.is_v2() {
        c.window.remote_window as usize
    } else {
        s.max_packet_size()
    };
    if !congested && c.istate == InputState::Open && limit > 0 && c.input.len() < limit {
        if let Some(fd) = c.io.rfd() {
            set.want_read(fd)
        }
    }
    if c.ostate == OutputState::Open || c.ostate == OutputState::WaitDrain {
        if !c.output.is_empty() {
            if let Some(fd) = c.io.wfd() {
                set.want_write(fd)
            }
        } else if c.ostate == OutputState::WaitDrain {
            if c.efd_output_active(proto) {
                debug!("channel {}: obuf_empty delayed efd {:?}", c.id, c.io.efd());
            } else {
                nchan::obuf_empty(c, s)
            }
        }
    }
    if proto.is_v2() {
        if let Some(efd) = c.io.efd() {
            if c.extended_usage == ExtendedUsage::Write && !c.extended.is_empty() {
                set.want_write(efd)
            } else if !congested
                && !c.flags.contains(CloseFlags::EOF_SENT)
                && c.extended_usage == ExtendedUsage::Read
                && c.extended.len() < c.window.remote_window as usize
            {
                set.want_read(efd)
            }
        }
    }
}

fn pre_input_draining(c: &mut Channel, s: &mut Session) {
    if c.input.is_empty() {
        s.close(c);
        c.state = ChannelState::Closed;
        debug!("channel {}: closing after input drain.", c.id);
    }
}

fn pre_output_draining(c: &mut Channel, set: &mut PollSet) {
    if c.output.is_empty() {
        nchan::mark_dead(c)
    } else if let Some(fd) = c.io.wfd() {
        set.want_write(fd)
    }
}

/// Service the descriptors of a channel after the wait. Listeners are
/// handled by `forward::post_listener`, since they create channels.
pub fn post(c: &mut Channel, s: &mut Session, set: &PollSet) {
    match c.state {
        ChannelState::Connecting => forward::post_connecting(c, s, set),
        ChannelState::Open => {
            handle_rfd(c, s, set);
            handle_wfd(c, s, set);
            if s.protocol().is_v2() {
                handle_efd(c, set);
                check_window(c, s)
            }
        }
        ChannelState::OutputDraining => post_output_drain_13(c, set),
        _ => {}
    }
}

/// The read side reached EOF or failed.
fn read_or_write_failed(c: &mut Channel, s: &mut Session, read: bool) {
    if c.state != ChannelState::Open {
        debug!("channel {}: not open", c.id);
        nchan::mark_dead(c)
    } else if s.protocol().is_13() {
        c.output.clear();
        c.state = ChannelState::InputDraining;
        debug!("channel {}: input draining.", c.id);
    } else if read {
        nchan::read_failed(c, s)
    } else {
        nchan::write_failed(c, s)
    }
}

fn handle_rfd(c: &mut Channel, s: &mut Session, set: &PollSet) {
    if !set.readable(c.io.rfd()) {
        return;
    }
    let mut buf = [0; READ_SIZE];
    let len = match c.io.read(&mut buf) {
        Err(ref e) if would_block(e) => return,
        Ok(0) => {
            debug!("channel {}: read<=0 rfd {:?} len 0", c.id, c.io.rfd());
            return read_or_write_failed(c, s, true);
        }
        Err(e) => {
            debug!("channel {}: read<=0 rfd {:?}: {}", c.id, c.io.rfd(), e);
            return read_or_write_failed(c, s, true);
        }
        Ok(n) => n,
    };
    let verdict = match c.input_filter {
        Some(ref mut filter) => filter(&buf[..len], &mut c.input),
        None => {
            c.input.append(&buf[..len]);
            Filter::Accept
        }
    };
    if verdict == Filter::Reject {
        debug!("channel {}: filter stops", c.id);
        nchan::read_failed(c, s)
    }
}

fn handle_wfd(c: &mut Channel, s: &mut Session, set: &PollSet) {
    if c.output.is_empty() || !set.writable(c.io.wfd()) {
        return;
    }
    let len = match c.io.write(c.output.peek()) {
        Err(ref e) if would_block(e) => return,
        Ok(0) => return read_or_write_failed(c, s, false),
        Err(e) => {
            debug!("channel {}: write failed: {}", c.id, e);
            return read_or_write_failed(c, s, false);
        }
        Ok(n) => n,
    };
    if s.protocol().is_v2() && c.is_tty && c.output.peek()[0] != b'\r' {
        if let Some(wfd) = c.io.wfd() {
            if fd::tty_reading_password(wfd) {
                // Match the size of a data message (4 bytes of channel
                // id, then the data) for echo that did not happen.
                s.ignore(4 + len)
            }
        }
    }
    c.output.consume(len);
    if s.protocol().is_v2() {
        c.window.consumed(len)
    }
}

fn handle_efd(c: &mut Channel, set: &PollSet) {
    let efd = match c.io.efd() {
        Some(efd) => efd,
        None => return,
    };
    match c.extended_usage {
        ExtendedUsage::Write if !c.extended.is_empty() && set.writable(Some(efd)) => {
            match c.io.write_extended(c.extended.peek()) {
                Err(ref e) if would_block(e) => {}
                Ok(n) if n > 0 => {
                    debug!("channel {}: written {} to efd {}", c.id, n, efd);
                    c.extended.consume(n);
                    c.window.consumed(n)
                }
                _ => {
                    debug!("channel {}: closing write-efd {}", c.id, efd);
                    c.io.close_efd();
                }
            }
        }
        ExtendedUsage::Read if set.readable(Some(efd)) => {
            let mut buf = [0; READ_SIZE];
            match c.io.read_extended(&mut buf) {
                Err(ref e) if would_block(e) => {}
                Ok(n) if n > 0 => {
                    debug!("channel {}: read {} from efd {}", c.id, n, efd);
                    c.extended.append(&buf[..n])
                }
                _ => {
                    debug!("channel {}: closing read-efd {}", c.id, efd);
                    c.io.close_efd();
                }
            }
        }
        _ => {}
    }
}

fn post_output_drain_13(c: &mut Channel, set: &PollSet) {
    if c.output.is_empty() || !set.writable(c.io.wfd()) {
        return;
    }
    match c.io.write(c.output.peek()) {
        Err(ref e) if would_block(e) => {}
        Ok(n) if n > 0 => c.output.consume(n),
        _ => c.output.clear(),
    }
}

/// Move buffered input of every channel to the peer, within the
/// windows and packet sizes it granted, and complete the input half
/// of channels whose input has drained.
pub fn output_poll(channels: &mut ChannelTable, s: &mut Session) {
    let proto = s.protocol();
    for c in channels.iter_mut() {
        if c.kind.is_listener() {
            continue;
        }
        if proto.is_13() {
            if c.state != ChannelState::Open && c.state != ChannelState::InputDraining {
                continue;
            }
        } else if c.state != ChannelState::Open {
            continue;
        }
        if proto.is_v2()
            && c
                .flags
                .intersects(CloseFlags::CLOSE_SENT | CloseFlags::CLOSE_RCVD)
        {
            continue;
        }
        if (c.istate == InputState::Open || c.istate == InputState::WaitDrain) && !c.input.is_empty() {
            let len = c.input.len();
            let len = if proto.is_v2() {
                c.window.outbound_chunk(len)
            } else if s.is_interactive() {
                if len > 1024 {
                    512
                } else {
                    len
                }
            } else {
                std::cmp::min(len, s.max_packet_size() / 2)
            };
            if len > 0 {
                s.data(c, &c.input.peek()[..len]);
                c.input.consume(len);
                if proto.is_v2() {
                    c.window.sent(len)
                }
            }
        } else if c.istate == InputState::WaitDrain {
            if proto.is_v2()
                && !c.flags.contains(CloseFlags::EOF_SENT)
                && c.efd_input_active(proto)
            {
                debug!("channel {}: ibuf_empty delayed efd {:?}/({})", c.id, c.io.efd(), c.extended.len());
            } else {
                nchan::ibuf_empty(c, s)
            }
        }
        if proto.is_v2()
            && !c.flags.contains(CloseFlags::EOF_SENT)
            && c.extended_usage == ExtendedUsage::Read
            && !c.extended.is_empty()
        {
            let len = c.window.outbound_chunk(c.extended.len());
            if len > 0 {
                debug!(
                    "channel {}: rwin {} elen {}",
                    c.id,
                    c.window.remote_window,
                    c.extended.len()
                );
                s.extended_data(c, crate::msg::EXTENDED_DATA_STDERR, &c.extended.peek()[..len]);
                c.extended.consume(len);
                c.window.sent(len);
                debug!("channel {}: sent ext data {}", c.id, len);
            }
        }
    }
}
