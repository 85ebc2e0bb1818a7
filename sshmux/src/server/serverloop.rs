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
//! The event loop. Each iteration dispatches the messages the
//! transport has buffered, moves channel data to the peer, waits for
//! readiness on every descriptor at once, then services what became
//! ready.
use super::{Connection, ExitStatus, Handler};
use crate::buffer::Buffer;
use crate::channels::{forward, io, nchan};
use crate::channels::{ChannelState, CloseFlags, OutputState};
use crate::fd::{self, Fd};
use crate::msg;
use crate::notify;
use crate::transport::Transport;
use crate::{Disconnect, Error, Sig};
use socket2::SockRef;
use std::net::Shutdown;
use std::time::Duration;

const READ_SIZE: usize = 16384;

/// Delay letting a child's output accumulate in the stdout buffer.
const STDOUT_COALESCE: Duration = Duration::from_millis(10);
/// Wait after a child terminated, so that its exit status is
/// reported soon.
const CHILD_EXIT_WAIT: Duration = Duration::from_millis(100);

/// The program of a protocol 1 session, whose standard descriptors
/// are served directly by the loop rather than through channels.
#[derive(Debug, Default)]
pub(crate) struct Legacy {
    pub(crate) fdin: Fd,
    fdout: Fd,
    fderr: Fd,
    pub(crate) stdin: Buffer,
    stdout: Buffer,
    stderr: Buffer,
    pub(crate) stdin_eof: bool,
    fdout_eof: bool,
    fderr_eof: bool,
    pub(crate) fdin_is_tty: bool,
    /// Stop reading from the client above this much buffered stdin.
    buffer_high: usize,
    stdin_bytes: u64,
    stdout_bytes: u64,
    stderr_bytes: u64,
}

impl Legacy {
    pub(crate) fn new(interactive: bool) -> Self {
        Legacy {
            buffer_high: if interactive { 4 * 1024 } else { 64 * 1024 },
            ..Legacy::default()
        }
    }
}

fn would_block(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::Interrupted
}

impl<T: Transport, H: Handler> Connection<T, H> {
    /// Run the protocol 2.0 loop until the client closes the
    /// connection. On protocol violations and keepalive timeouts, a
    /// disconnect message is sent before the error is returned.
    pub fn run(&mut self) -> Result<(), Error> {
        if !self.session.protocol().is_v2() {
            error!("run: protocol 1 sessions are served by server_loop");
            return Err(Error::Inconsistent);
        }
        debug!("Entering interactive session for SSH2.");
        self.notify.install()?;
        let mut result = Ok(());
        loop {
            match self.iterate() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.collect_children();
        self.channels.free_all(&mut self.handler);
        if let Err(ref e) = result {
            self.disconnect_on_error(e)
        }
        result
    }

    /// One iteration of the protocol 2.0 loop. Returns `Ok(false)`
    /// once the client closed the connection.
    pub fn iterate(&mut self) -> Result<bool, Error> {
        self.process_buffered_input_packets()?;
        if self.transport.not_very_much_data_to_write() {
            self.output_poll();
        }
        self.wait_until_can_do_something(None)?;
        self.collect_children();
        self.channel_after_select();
        if !self.process_input()? {
            return Ok(false);
        }
        self.process_output()?;
        Ok(true)
    }

    fn output_poll(&mut self) {
        io::output_poll(&mut self.channels, &mut self.session);
        if self.session.protocol().is_v2() {
            self.send_exit_statuses()
        }
    }

    /// Garbage-collect channels and collect their interests in the
    /// poll set.
    fn channel_prepare(&mut self) {
        let congested = !self.transport.not_very_much_data_to_write();
        for id in self.channels.ids() {
            if let Ok(c) = self.channels.lookup_mut(id) {
                io::prepare(c, &mut self.session, &mut self.poll, congested)
            }
            self.channels.garbage_collect(id, &mut self.session, &mut self.handler)
        }
    }

    /// Service the channel descriptors that became ready.
    fn channel_after_select(&mut self) {
        for id in self.channels.ids() {
            let listener = match self.channels.lookup(id) {
                Ok(c) => c.kind.is_listener(),
                Err(_) => continue,
            };
            if listener {
                forward::post_listener(&mut self.channels, id, &mut self.session, &self.poll)
            } else if let Ok(c) = self.channels.lookup_mut(id) {
                io::post(c, &mut self.session, &self.poll)
            }
            self.channels.garbage_collect(id, &mut self.session, &mut self.handler)
        }
    }

    fn legacy_prepare(&mut self) {
        let proto = self.session.protocol();
        let (connection_in, _) = self.transport.connection_fds();
        // Read packets from the client unless too much stdin or
        // channel data is buffered.
        if self.legacy.stdin.len() < self.legacy.buffer_high
            && self
                .channels
                .not_very_much_buffered_data(proto, self.session.max_packet_size())
        {
            if let Some(fd) = connection_in {
                self.poll.want_read(fd)
            }
        }
        if self.transport.not_very_much_data_to_write() {
            if !self.legacy.fdout_eof {
                if let Some(fd) = self.legacy.fdout.raw() {
                    self.poll.want_read(fd)
                }
            }
            if !self.legacy.fderr_eof {
                if let Some(fd) = self.legacy.fderr.raw() {
                    self.poll.want_read(fd)
                }
            }
        }
        if !self.legacy.stdin.is_empty() {
            if let Some(fd) = self.legacy.fdin.raw() {
                self.poll.want_write(fd)
            }
        }
    }

    /// Wait until the transport, a channel, the program or the notify
    /// pipe is ready, at most `max_time`. Runs the keepalive check if
    /// the wait timed out on the keepalive interval.
    fn wait_until_can_do_something(&mut self, max_time: Option<Duration>) -> Result<(), Error> {
        let mut max_time = max_time;
        let mut client_alive_scheduled = false;
        self.poll.clear();
        self.channel_prepare();

        if self.session.protocol().is_v2() {
            if max_time.is_none() {
                if let Some(interval) = self.config.client_alive_interval {
                    client_alive_scheduled = true;
                    max_time = Some(interval)
                }
            }
            if let (Some(fd), _) = self.transport.connection_fds() {
                self.poll.want_read(fd)
            }
        } else {
            self.legacy_prepare()
        }
        self.notify.prepare(&mut self.poll);

        self.session.flush(&mut self.transport);
        if self.transport.has_pending_output() {
            if let (_, Some(fd)) = self.transport.connection_fds() {
                self.poll.want_write(fd)
            }
        }

        // Report the exit status of terminated children soon.
        if notify::child_terminated()
            && self.transport.not_very_much_data_to_write()
            && (max_time.is_none() || client_alive_scheduled)
        {
            max_time = Some(CHILD_EXIT_WAIT);
            client_alive_scheduled = false;
        }

        let n = self.poll.wait(max_time)?;
        self.notify.done(&self.poll);
        if n == 0 && !self.poll.interrupted() && client_alive_scheduled {
            self.client_alive_check()?
        }
        Ok(())
    }

    /// The client sent nothing during a whole keepalive interval: ask
    /// it for a reply on an open channel.
    fn client_alive_check(&mut self) -> Result<(), Error> {
        let id = match self.channels.find_open() {
            Some(id) => id,
            None => {
                if !self.had_channel {
                    return Ok(());
                }
                info!("No open channels after timeout!");
                return Err(Error::NoOpenChannels);
            }
        };
        self.had_channel = true;
        self.client_alive_timeouts += 1;
        if self.client_alive_timeouts > self.config.client_alive_count_max {
            info!("Timeout, client not responding.");
            return Err(Error::ConnectionTimeout);
        }
        debug!(
            "keepalive on channel {} ({} unanswered)",
            id, self.client_alive_timeouts
        );
        if let Ok(c) = self.channels.lookup(id) {
            self.session.keepalive(c)
        }
        Ok(())
    }

    /// Reap terminated children, and attach their exit status to the
    /// channel the session collaborator names.
    pub(crate) fn collect_children(&mut self) {
        let mut terminated = Vec::new();
        self.notify.collect_children(|pid, status| terminated.push((pid, status)));
        for (pid, status) in terminated {
            let status = match ExitStatus::from_raw(status) {
                Some(status) => status,
                None => continue,
            };
            debug!("child {} terminated: {:?}", pid, status);
            if let Some(id) = self.handler.close_by_pid(pid, status) {
                match self.channels.lookup_mut(id) {
                    Ok(c) => c.pending_exit = Some(status),
                    Err(_) => debug!("close_by_pid: channel {} is gone", id),
                }
            }
        }
    }

    /// Send the exit status of every channel whose program terminated,
    /// once all its output has been read and queued (or the channel is
    /// closing anyway).
    fn send_exit_statuses(&mut self) {
        let proto = self.session.protocol();
        for c in self.channels.iter_mut() {
            let status = match c.pending_exit {
                Some(status) => status,
                None => continue,
            };
            let drained = c.io.rfd().is_none() && c.input.is_empty() && !c.efd_input_active(proto);
            if !drained
                && c.state == ChannelState::Open
                && !c
                    .flags
                    .intersects(CloseFlags::CLOSE_SENT | CloseFlags::CLOSE_RCVD)
            {
                continue;
            }
            c.pending_exit = None;
            if !c.flags.contains(CloseFlags::CLOSE_SENT) {
                match status {
                    ExitStatus::Exited(code) => {
                        debug!("channel {}: exit-status {}", c.id, code);
                        self.session.exit_status_request(c, code)
                    }
                    ExitStatus::Signaled { signal, core_dumped } => {
                        debug!("channel {}: exit-signal {}", c.id, signal);
                        let sig = Sig::from_signal(signal).unwrap_or(Sig::Custom("SIG@openssh.com"));
                        self.session.exit_signal_request(c, sig, core_dumped, "", "")
                    }
                }
            }
            // The program is gone: stop feeding its input, and let the
            // channel be freed without asking the collaborator.
            c.cleanup = None;
            if c.ostate != OutputState::Closed {
                nchan::write_failed(c, &mut self.session)
            }
        }
    }

    /// Read from the transport, and in protocol 1 from the program's
    /// stdout and stderr. Returns `Ok(false)` if the client closed the
    /// connection.
    fn process_input(&mut self) -> Result<bool, Error> {
        let (connection_in, _) = self.transport.connection_fds();
        if self.poll.readable(connection_in) && !self.transport.read_poll()? {
            info!("Connection closed by remote host.");
            self.connection_closed = true;
            if self.session.protocol().is_v2() {
                return Ok(false);
            }
            return Err(Error::HUP);
        }
        if self.session.protocol().is_v2() {
            return Ok(true);
        }
        let mut buf = [0; READ_SIZE];
        if !self.legacy.fdout_eof && self.poll.readable(self.legacy.fdout.raw()) {
            match self.legacy.fdout.read(&mut buf) {
                Err(ref e) if would_block(e) => {}
                Ok(0) | Err(_) => self.legacy.fdout_eof = true,
                Ok(n) => {
                    self.legacy.stdout.append(&buf[..n]);
                    self.legacy.stdout_bytes += n as u64
                }
            }
        }
        if !self.legacy.fderr_eof && self.poll.readable(self.legacy.fderr.raw()) {
            match self.legacy.fderr.read(&mut buf) {
                Err(ref e) if would_block(e) => {}
                Ok(0) | Err(_) => self.legacy.fderr_eof = true,
                Ok(n) => {
                    self.legacy.stderr.append(&buf[..n]);
                    self.legacy.stderr_bytes += n as u64
                }
            }
        }
        Ok(true)
    }

    /// Write to the transport, and in protocol 1 to the program's
    /// stdin.
    fn process_output(&mut self) -> Result<(), Error> {
        if !self.session.protocol().is_v2() && self.poll.writable(self.legacy.fdin.raw()) {
            match self.legacy.fdin.write(self.legacy.stdin.peek()) {
                Err(ref e) if would_block(e) => {}
                Ok(0) | Err(_) => self.close_fdin(),
                Ok(n) => {
                    if self.legacy.fdin_is_tty && self.legacy.stdin.peek()[0] != b'\r' {
                        if let Some(fdin) = self.legacy.fdin.raw() {
                            if fd::tty_reading_password(fdin) {
                                // Simulate the echo that did not happen:
                                // a stdout message of the same length.
                                self.session.ignore(4 + n)
                            }
                        }
                    }
                    self.legacy.stdin.consume(n);
                    self.legacy.stdin_bytes += n as u64
                }
            }
        }
        self.session.flush(&mut self.transport);
        let (_, connection_out) = self.transport.connection_fds();
        if self.poll.writable(connection_out) {
            self.transport.write_poll()?
        }
        Ok(())
    }

    /// Close the program's stdin, so that it sees EOF even if the same
    /// socket also carries its stdout.
    fn close_fdin(&mut self) {
        if let Some(fdin) = self.legacy.fdin.get() {
            if let Err(e) = SockRef::from(fdin).shutdown(Shutdown::Write) {
                if e.raw_os_error() != Some(libc::ENOTSOCK) {
                    debug!("shutdown fdin: {}", e)
                }
            }
        }
        self.legacy.fdin.close();
    }

    /// Send a disconnect message for fatal error `e`, and try to
    /// write it out. Errors that mean the connection is gone send
    /// nothing.
    pub(crate) fn disconnect_on_error(&mut self, e: &Error) {
        let reason = if e.is_protocol_violation() {
            error!("protocol error: {}", e);
            Disconnect::ProtocolError
        } else {
            match *e {
                Error::ConnectionTimeout | Error::NoOpenChannels | Error::ChildSignaled(_) => {
                    info!("{}", e);
                    Disconnect::ByApplication
                }
                _ => {
                    debug!("connection closed: {}", e);
                    return;
                }
            }
        };
        self.session.disconnect(reason, &e.to_string(), "");
        self.session.flush(&mut self.transport);
        if let Err(e) = self.transport.flush_blocking() {
            debug!("disconnect: {}", e)
        }
    }

    /// Serve a protocol 1 session: `pid` runs with stdin `fdin`,
    /// stdout `fdout` and stderr `fderr`. Returns once the program has
    /// exited, its output has been sent, and the client confirmed the
    /// exit status.
    pub fn server_loop(&mut self, pid: libc::pid_t, fdin: Fd, fdout: Fd, fderr: Fd) -> Result<(), Error> {
        if self.session.protocol().is_v2() {
            error!("server_loop: protocol 2.0 sessions are served by run");
            return Err(Error::Inconsistent);
        }
        debug!("Entering interactive session.");
        self.notify.install()?;
        for fd in &[&fdin, &fdout, &fderr] {
            if fd.is_open() {
                fd.set_nonblocking()?
            }
        }
        self.legacy.fdin_is_tty = fdin.isatty();
        self.legacy.fdin = fdin;
        self.legacy.fdout = fdout;
        self.legacy.fderr = fderr;
        // Descriptors that are not provided are at EOF already.
        self.legacy.fdout_eof = !self.legacy.fdout.is_open();
        self.legacy.fderr_eof = !self.legacy.fderr.is_open();

        let result = match self.legacy_loop() {
            Ok(()) => self.legacy_exit(pid),
            Err(e) => Err(e),
        };
        if let Err(ref e) = result {
            self.disconnect_on_error(e)
        }
        result
    }

    fn legacy_loop(&mut self) -> Result<(), Error> {
        let proto = self.session.protocol();
        let mut waiting_termination = false;
        let mut previous_stdout_len = 0;
        loop {
            self.process_buffered_input_packets()?;

            // EOF from the client and nothing left to write: the
            // program gets a real EOF.
            if self.legacy.stdin_eof && self.legacy.fdin.is_open() && self.legacy.stdin.is_empty() {
                self.close_fdin()
            }

            self.make_packets_from_stderr_data();

            // Very little stdout: wait a bit for more, as some systems
            // wake pty readers up after each character.
            let mut max_time = None;
            let stdout_len = self.legacy.stdout.len();
            if stdout_len > 0 && stdout_len < 256 && stdout_len != previous_stdout_len {
                max_time = Some(STDOUT_COALESCE)
            } else {
                self.make_packets_from_stdout_data()
            }
            previous_stdout_len = self.legacy.stdout.len();

            if self.transport.not_very_much_data_to_write() {
                self.output_poll()
            }

            if self.legacy.fdout_eof
                && self.legacy.fderr_eof
                && self.session.is_empty()
                && !self.transport.has_pending_output()
                && self.legacy.stdout.is_empty()
                && self.legacy.stderr.is_empty()
            {
                if !self.channels.still_open(proto) {
                    break;
                }
                if !waiting_termination {
                    waiting_termination = true;
                    let s = "Waiting for forwarded connections to terminate...\r\n";
                    self.legacy.stderr.append(s.as_bytes());
                    let open = self.channels.open_message();
                    self.legacy.stderr.append(open.as_bytes());
                }
            }

            self.wait_until_can_do_something(max_time)?;
            self.channel_after_select();
            self.process_input()?;
            self.process_output()?;
        }
        Ok(())
    }

    /// Size of the next stdout or stderr message.
    fn legacy_chunk(&self, len: usize) -> usize {
        if self.session.is_interactive() {
            std::cmp::min(len, 512)
        } else {
            std::cmp::min(len, self.session.max_packet_size())
        }
    }

    fn make_packets_from_stderr_data(&mut self) {
        while !self.legacy.stderr.is_empty() && self.transport.not_very_much_data_to_write() {
            let len = self.legacy_chunk(self.legacy.stderr.len());
            self.session.stderr_data(&self.legacy.stderr.peek()[..len]);
            self.session.flush(&mut self.transport);
            self.legacy.stderr.consume(len);
        }
    }

    fn make_packets_from_stdout_data(&mut self) {
        while !self.legacy.stdout.is_empty() && self.transport.not_very_much_data_to_write() {
            let len = self.legacy_chunk(self.legacy.stdout.len());
            self.session.stdout_data(&self.legacy.stdout.peek()[..len]);
            self.session.flush(&mut self.transport);
            self.legacy.stdout.consume(len);
        }
    }

    /// Send whatever output is left, and wait until it is written.
    fn drain_output(&mut self) -> Result<(), Error> {
        if !self.legacy.stdout.is_empty() {
            self.session.stdout_data(self.legacy.stdout.peek());
            self.legacy.stdout.clear()
        }
        if !self.legacy.stderr.is_empty() {
            self.session.stderr_data(self.legacy.stderr.peek());
            self.legacy.stderr.clear()
        }
        self.session.flush(&mut self.transport);
        self.transport.flush_blocking()
    }

    fn legacy_exit(&mut self, pid: libc::pid_t) -> Result<(), Error> {
        self.drain_output()?;
        debug!(
            "End of interactive session; stdin {}, stdout {}, stderr {} bytes.",
            self.legacy.stdin_bytes, self.legacy.stdout_bytes, self.legacy.stderr_bytes
        );
        self.legacy.fdout.close();
        self.legacy.fderr.close();
        self.legacy.fdin.close();
        self.legacy.fdout_eof = true;
        self.legacy.fderr_eof = true;
        self.channels.free_all(&mut self.handler);

        // We no longer want our SIGCHLD handler to be called.
        self.notify.uninstall();
        let mut status = 0;
        let wait_pid = loop {
            let p = unsafe { libc::waitpid(-1, &mut status, 0) };
            if p >= 0 {
                break p;
            }
            let e = std::io::Error::last_os_error();
            if e.kind() != std::io::ErrorKind::Interrupted {
                error!("wait: {}", e);
                return Err(e.into());
            }
        };
        if wait_pid != pid {
            error!("Strange, wait returned pid {}, expected {}", wait_pid, pid)
        }
        match ExitStatus::from_raw(status) {
            Some(ExitStatus::Exited(code)) => {
                debug!("Command exited with status {}.", code);
                self.session.exit_status1(code);
                self.session.flush(&mut self.transport);
                self.transport.flush_blocking()?;
                // Wait for the client to confirm, so that it has read
                // everything before the connection is closed.
                loop {
                    let packet = self.transport.read_packet_blocking()?;
                    if exit_confirmed(&packet)? {
                        return Ok(());
                    }
                }
            }
            Some(ExitStatus::Signaled { signal, .. }) => Err(Error::ChildSignaled(signal)),
            None => {
                error!("wait returned status {:x}", status);
                Err(Error::Inconsistent)
            }
        }
    }
}

/// Whether `packet` is the client's exit confirmation. Other messages
/// are discarded.
fn exit_confirmed(packet: &[u8]) -> Result<bool, Error> {
    match packet.get(0) {
        Some(&msg::ssh1::CMSG_EXIT_CONFIRMATION) => Ok(true),
        Some(n) => {
            debug!("discarding message {} while waiting for exit confirmation", n);
            Ok(false)
        }
        None => Err(Error::IndexOutOfBounds),
    }
}
