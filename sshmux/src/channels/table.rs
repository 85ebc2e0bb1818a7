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
use super::forward::ListenSocket;
use super::nchan;
use super::{Channel, ChannelKind, ChannelState, Cleanup, ExtendedUsage, Io, Protocol};
use crate::fd::Fd;
use crate::server::{Handler, Session};
use crate::{ChannelId, Error};

/// All the channels of a connection, indexed by their local id.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: Vec<Option<Channel>>,
}

impl ChannelTable {
    /// An empty table.
    pub fn new() -> Self {
        ChannelTable::default()
    }

    /// Create a channel with the lowest free id. Its descriptors are
    /// set non-blocking.
    pub fn allocate(
        &mut self,
        kind: ChannelKind,
        state: ChannelState,
        io: Io,
        window: u32,
        maxpacket: u32,
        remote_name: &str,
    ) -> ChannelId {
        let n = match self.channels.iter().position(|c| c.is_none()) {
            Some(n) => n,
            None => {
                self.channels.push(None);
                self.channels.len() - 1
            }
        };
        let id = ChannelId(n as u32);
        if let Err(e) = io.set_nonblocking() {
            error!("channel {}: set_nonblocking: {}", id, e)
        }
        let mut c = Channel::new(id, kind, state, io, window, maxpacket, remote_name);
        c.is_tty = is_tty(&c.io);
        debug!("channel {}: new [{}]", id, remote_name);
        self.channels[n] = Some(c);
        id
    }

    /// The channel with local id `id`.
    pub fn lookup(&self, id: ChannelId) -> Result<&Channel, Error> {
        match self.channels.get(id.0 as usize) {
            Some(&Some(ref c)) => Ok(c),
            _ => Err(Error::WrongChannel(id.0)),
        }
    }

    /// The channel with local id `id`, mutably.
    pub fn lookup_mut(&mut self, id: ChannelId) -> Result<&mut Channel, Error> {
        match self.channels.get_mut(id.0 as usize) {
            Some(&mut Some(ref mut c)) => Ok(c),
            _ => Err(Error::WrongChannel(id.0)),
        }
    }

    /// Remove a channel, run its cleanup hook, and close its
    /// descriptors. Freeing an id that is not allocated is an error,
    /// and runs nothing.
    pub fn free<H: Handler + ?Sized>(&mut self, id: ChannelId, handler: &mut H) -> Result<(), Error> {
        let mut c = match self.channels.get_mut(id.0 as usize) {
            Some(slot) => slot.take().ok_or(Error::WrongChannel(id.0))?,
            None => return Err(Error::WrongChannel(id.0)),
        };
        debug!(
            "channel {}: free: {}, nchannels {}",
            id,
            c.remote_name,
            self.len() + 1
        );
        match c.cleanup.take() {
            Some(Cleanup::Session) => {
                handler.close_by_channel(id);
            }
            Some(Cleanup::Callback(f)) => f(id),
            None => {}
        }
        Ok(())
    }

    /// Free every channel.
    pub fn free_all<H: Handler + ?Sized>(&mut self, handler: &mut H) {
        debug!("channel_free_all");
        for id in self.ids() {
            if let Err(e) = self.free(id, handler) {
                error!("channel {}: free: {}", id, e)
            }
        }
    }

    /// Free channel `id` if it is dead. A registered cleanup is run
    /// first: the session collaborator may refuse to detach (while the
    /// session's process is running), in which case the channel stays.
    pub fn garbage_collect<H: Handler + ?Sized>(
        &mut self,
        id: ChannelId,
        session: &mut Session,
        handler: &mut H,
    ) {
        {
            let c = match self.lookup_mut(id) {
                Ok(c) => c,
                Err(_) => return,
            };
            if let Some(cleanup) = c.cleanup.take() {
                if !nchan::is_dead(c, session, false) {
                    c.cleanup = Some(cleanup);
                    return;
                }
                debug!("channel {}: gc: notify user", id);
                match cleanup {
                    Cleanup::Session => {
                        if !handler.close_by_channel(id) {
                            c.cleanup = Some(Cleanup::Session);
                            return;
                        }
                    }
                    Cleanup::Callback(f) => f(id),
                }
                debug!("channel {}: gc: user detached", id);
            }
            if !nchan::is_dead(c, session, true) {
                return;
            }
            debug!("channel {}: garbage collecting", id);
        }
        if let Err(e) = self.free(id, handler) {
            error!("channel {}: gc: {}", id, e)
        }
    }

    /// Iterate over live channels.
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter_map(|c| c.as_ref())
    }

    /// Iterate mutably over live channels.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.iter_mut().filter_map(|c| c.as_mut())
    }

    /// Ids of the live channels, in increasing order.
    pub fn ids(&self) -> Vec<ChannelId> {
        self.iter().map(|c| c.id).collect()
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether there is no live channel.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A human readable list of the connections that are still open,
    /// terminated by "\r\n".
    pub fn open_message(&self) -> String {
        let mut s = String::from("The following connections are open:\r\n");
        for c in self.iter() {
            if c.kind.is_listener() {
                continue;
            }
            match c.state {
                ChannelState::Closed | ChannelState::Zombie => {}
                _ => s.push_str(&c.describe()),
            }
        }
        s
    }

    /// Whether any channel still carries data (listeners and dead
    /// channels do not count).
    pub fn still_open(&self, proto: Protocol) -> bool {
        for c in self.iter() {
            if c.kind.is_listener() {
                continue;
            }
            match c.state {
                ChannelState::Closed | ChannelState::Zombie => {}
                ChannelState::Larval => {
                    if !proto.is_v2() {
                        error!("channel {}: larval channel in protocol 1", c.id)
                    }
                }
                ChannelState::Opening | ChannelState::Connecting | ChannelState::Open => return true,
                ChannelState::InputDraining | ChannelState::OutputDraining => {
                    if !proto.is_13() {
                        error!("channel {}: draining state outside protocol 1.3", c.id)
                    }
                    return true;
                }
            }
        }
        false
    }

    /// The first channel a keepalive request can be sent on.
    pub fn find_open(&self) -> Option<ChannelId> {
        self.iter()
            .find(|c| {
                !c.kind.is_listener()
                    && c.remote_id.is_some()
                    && match c.state {
                        ChannelState::Larval
                        | ChannelState::Open
                        | ChannelState::InputDraining
                        | ChannelState::OutputDraining => true,
                        _ => false,
                    }
            })
            .map(|c| c.id)
    }

    /// Whether no open channel has more than `maxsize` bytes waiting,
    /// in which case more messages may be read from the peer.
    pub fn not_very_much_buffered_data(&self, proto: Protocol, maxsize: usize) -> bool {
        for c in self.iter() {
            if c.state != ChannelState::Open || c.kind.is_listener() {
                continue;
            }
            if !proto.is_v2() && c.input.len() > maxsize {
                debug!("channel {}: big input buffer {}", c.id, c.input.len());
                return false;
            }
            if c.output.len() > maxsize {
                debug!("channel {}: big output buffer {} > {}", c.id, c.output.len(), maxsize);
                return false;
            }
        }
        true
    }

    /// The listener of kind `kind` bound to `address` and `port`.
    pub fn find_listener(&self, kind: ChannelKind, address: &str, port: u16) -> Option<ChannelId> {
        self.iter()
            .find(|c| {
                c.kind == kind
                    && c.listening_port == port
                    && c.path.as_ref().map(|p| p.as_str()) == Some(address)
            })
            .map(|c| c.id)
    }

    /// Attach descriptors to a larval session channel, open it, and
    /// grant the peer the window reserved when the channel was
    /// allocated.
    pub fn set_fds(
        &mut self,
        id: ChannelId,
        session: &mut Session,
        rfd: Fd,
        wfd: Fd,
        efd: Fd,
        extended_usage: ExtendedUsage,
    ) -> Result<(), Error> {
        let c = self.lookup_mut(id)?;
        if c.state != ChannelState::Larval {
            error!("channel {}: set_fds for non-larval channel", id);
            return Err(Error::Inconsistent);
        }
        c.io = Io::pipes(rfd, wfd, efd);
        if let Err(e) = c.io.set_nonblocking() {
            error!("channel {}: set_nonblocking: {}", id, e)
        }
        c.is_tty = is_tty(&c.io);
        c.extended_usage = extended_usage;
        c.state = ChannelState::Open;
        let window_max = c.window.local_window_max;
        c.window.local_window = window_max;
        session.window_adjust(c, window_max);
        Ok(())
    }

    /// Create a listener channel for `sock`, forwarding connections
    /// to `path`:`port`.
    pub fn add_listener(
        &mut self,
        kind: ChannelKind,
        sock: ListenSocket,
        path: &str,
        port: u16,
        window: u32,
        maxpacket: u32,
    ) -> ChannelId {
        let name = match kind {
            ChannelKind::X11Listener => "X11 inet listener",
            ChannelKind::AuthSocket => "auth socket",
            _ => "port listener",
        };
        let listening_port = sock.local_port().unwrap_or(port);
        let id = self.allocate(kind, ChannelState::Open, Io::Listener(sock), window, maxpacket, name);
        if let Ok(c) = self.lookup_mut(id) {
            c.path = Some(path.to_string());
            c.listening_port = listening_port;
            c.host_port = port;
        }
        id
    }
}

fn is_tty(io: &Io) -> bool {
    match *io {
        Io::Pipes { ref wfd, .. } => wfd.isatty(),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channels::{CloseFlags, InputState, OutputState};
    use crate::server::test_session;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Counter {
        closed: Vec<ChannelId>,
        detach: bool,
    }

    impl Handler for Counter {
        fn close_by_channel(&mut self, id: ChannelId) -> bool {
            self.closed.push(id);
            self.detach
        }
    }

    fn counter() -> Counter {
        Counter {
            closed: Vec::new(),
            detach: true,
        }
    }

    fn open(t: &mut ChannelTable) -> ChannelId {
        let id = t.allocate(
            ChannelKind::DirectTcpip,
            ChannelState::Open,
            Io::None,
            1000,
            100,
            "test",
        );
        t.lookup_mut(id).unwrap().remote_id = Some(id.0 + 100);
        id
    }

    #[test]
    fn lowest_free_id() {
        let mut h = counter();
        let mut t = ChannelTable::new();
        let ids: Vec<_> = (0..4).map(|_| open(&mut t)).collect();
        assert_eq!(ids, vec![ChannelId(0), ChannelId(1), ChannelId(2), ChannelId(3)]);
        t.free(ChannelId(1), &mut h).unwrap();
        t.free(ChannelId(2), &mut h).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(open(&mut t), ChannelId(1));
        assert_eq!(open(&mut t), ChannelId(2));
        assert_eq!(open(&mut t), ChannelId(4));
        match t.lookup(ChannelId(5)) {
            Err(Error::WrongChannel(5)) => {}
            x => panic!("{:?}", x),
        }
    }

    #[test]
    fn double_free() {
        let mut h = counter();
        let mut t = ChannelTable::new();
        let id = open(&mut t);
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        t.lookup_mut(id).unwrap().cleanup = Some(Cleanup::Callback(Box::new(move |_| {
            f.set(f.get() + 1)
        })));
        t.free(id, &mut h).unwrap();
        assert_eq!(fired.get(), 1);
        match t.free(id, &mut h) {
            Err(Error::WrongChannel(0)) => {}
            x => panic!("{:?}", x),
        }
        assert_eq!(fired.get(), 1);
    }

    // Drive a channel through one ordering of the four close events,
    // with garbage collection after each.
    fn close_sequence(order: &[usize]) {
        let mut h = counter();
        let mut s = test_session(Protocol::V2);
        let mut t = ChannelTable::new();
        let id = open(&mut t);
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        t.lookup_mut(id).unwrap().cleanup = Some(Cleanup::Callback(Box::new(move |_| {
            f.set(f.get() + 1)
        })));
        let mut freed = 0;
        for &ev in order {
            if let Ok(c) = t.lookup_mut(id) {
                match ev {
                    // Local EOF.
                    0 => {
                        if c.istate == InputState::Open {
                            nchan::read_failed(c, &mut s)
                        }
                        if c.istate == InputState::WaitDrain {
                            nchan::ibuf_empty(c, &mut s)
                        }
                    }
                    // Local close of the write side.
                    1 => {
                        if c.ostate == OutputState::Open || c.ostate == OutputState::WaitDrain {
                            nchan::write_failed(c, &mut s)
                        }
                    }
                    // Remote EOF.
                    2 => {
                        if !c.flags.contains(CloseFlags::CLOSE_RCVD) {
                            nchan::rcvd_ieof(c, &mut s);
                            if c.ostate == OutputState::WaitDrain {
                                nchan::obuf_empty(c, &mut s)
                            }
                        }
                    }
                    // Remote close.
                    _ => {
                        nchan::rcvd_oclose(c, &mut s);
                        if c.ostate == OutputState::WaitDrain {
                            nchan::obuf_empty(c, &mut s)
                        }
                    }
                }
            }
            let before = t.len();
            t.garbage_collect(id, &mut s, &mut h);
            freed += before - t.len();
        }
        assert_eq!(freed, 1, "order {:?}", order);
        assert_eq!(fired.get(), 1, "order {:?}", order);
        assert!(t.lookup(id).is_err());
        let msgs = s.drain_messages();
        assert_eq!(
            msgs.iter().filter(|m| m[0] == crate::msg::CHANNEL_CLOSE).count(),
            1,
            "order {:?}",
            order
        );
    }

    #[test]
    fn every_close_order_frees_once() {
        let _ = env_logger::try_init();
        let mut order = [0, 1, 2, 3];
        // Heap's algorithm.
        let mut c = [0; 4];
        close_sequence(&order);
        let mut i = 0;
        while i < 4 {
            if c[i] < i {
                if i % 2 == 0 {
                    order.swap(0, i)
                } else {
                    order.swap(c[i], i)
                }
                close_sequence(&order);
                c[i] += 1;
                i = 0
            } else {
                c[i] = 0;
                i += 1
            }
        }
    }

    #[test]
    fn session_cleanup_can_delay() {
        let mut h = counter();
        h.detach = false;
        let mut s = test_session(Protocol::V2);
        let mut t = ChannelTable::new();
        let id = open(&mut t);
        {
            let c = t.lookup_mut(id).unwrap();
            c.cleanup = Some(Cleanup::Session);
            nchan::rcvd_oclose(c, &mut s);
            nchan::obuf_empty(c, &mut s);
        }
        t.garbage_collect(id, &mut s, &mut h);
        assert!(t.lookup(id).is_ok());
        assert_eq!(h.closed, vec![id]);
        h.detach = true;
        t.garbage_collect(id, &mut s, &mut h);
        assert!(t.lookup(id).is_err());
        assert_eq!(h.closed, vec![id, id]);
    }

    #[test]
    fn open_message_and_buffers() {
        let mut t = ChannelTable::new();
        let id = open(&mut t);
        assert!(t.still_open(Protocol::V2));
        assert_eq!(t.find_open(), Some(id));
        let m = t.open_message();
        assert!(m.starts_with("The following connections are open:\r\n  #0 test (t4 r100 "));
        assert!(m.ends_with("\r\n"));
        t.lookup_mut(id).unwrap().output.append(&[0; 200]);
        assert!(!t.not_very_much_buffered_data(Protocol::V2, 100));
        assert!(t.not_very_much_buffered_data(Protocol::V2, 1000));
    }
}
