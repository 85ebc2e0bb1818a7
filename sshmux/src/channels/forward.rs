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
use super::nchan;
use super::{Channel, ChannelKind, ChannelState, ChannelTable, Io};
use super::{CHAN_TCP_PACKET_DEFAULT, CHAN_TCP_WINDOW_DEFAULT};
use crate::fd::{Fd, PollSet};
use crate::server::Session;
use crate::{ChannelId, ChannelOpenFailure};
use socket2::{Domain, SockAddr, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;

/// A listening socket owned by a listener channel.
#[derive(Debug)]
pub enum ListenSocket {
    /// TCP (port forwarding, X11 displays).
    Tcp(TcpListener),
    /// Unix domain (agent sockets).
    Unix(UnixListener),
}

impl ListenSocket {
    /// The raw descriptor.
    pub fn raw(&self) -> RawFd {
        match *self {
            ListenSocket::Tcp(ref l) => l.as_raw_fd(),
            ListenSocket::Unix(ref l) => l.as_raw_fd(),
        }
    }

    /// The port the socket is bound to, for TCP sockets.
    pub fn local_port(&self) -> Option<u16> {
        match *self {
            ListenSocket::Tcp(ref l) => l.local_addr().ok().map(|a| a.port()),
            ListenSocket::Unix(_) => None,
        }
    }

    /// Accept a connection. Returns the connected socket, and the
    /// address and port of the originator ("127.0.0.1" and 0 for Unix
    /// sockets).
    pub fn accept(&self) -> io::Result<(Fd, String, u16)> {
        match *self {
            ListenSocket::Tcp(ref l) => {
                let (s, addr) = l.accept()?;
                Ok((Fd::new(s), addr.ip().to_string(), addr.port()))
            }
            ListenSocket::Unix(ref l) => {
                let (s, _) = l.accept()?;
                Ok((Fd::new(s), "127.0.0.1".to_string(), 0))
            }
        }
    }
}

/// Start a non-blocking connection to `host`:`port`, trying every
/// address the name resolves to. Completion is reported by the
/// socket becoming writable.
pub fn connect_to(host: &str, port: u16) -> io::Result<Fd> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    let mut last_err = None;
    for addr in addrs {
        let sock = match Socket::new(Domain::for_address(addr), Type::STREAM, None) {
            Ok(s) => s,
            Err(e) => {
                error!("socket: {}", e);
                last_err = Some(e);
                continue;
            }
        };
        sock.set_nonblocking(true)?;
        match sock.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => {
                error!("connect_to {} port {}: {}", host, port, e);
                last_err = Some(e);
                continue;
            }
        }
        debug!("connect_to {} port {}: in progress", host, port);
        return Ok(Fd::new(TcpStream::from(sock)));
    }
    error!("connect_to {} port {}: failed.", host, port);
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "no address to connect to")
    }))
}

/// The address a remote forward listens on. Without `gateway_ports`
/// this is always the loopback interface. Otherwise `""` and `"*"`
/// mean every interface, `"localhost"` the loopback interface, and
/// anything else is resolved.
pub fn fwd_bind_addr(address: &str, port: u16, gateway_ports: bool) -> io::Result<SocketAddr> {
    if !gateway_ports || address == "localhost" {
        return Ok(([127, 0, 0, 1], port).into());
    }
    if address.is_empty() || address == "*" {
        return Ok(([0, 0, 0, 0], port).into());
    }
    match (address, port).to_socket_addrs()?.next() {
        Some(addr) => Ok(addr),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no address to listen on",
        )),
    }
}

/// Bind a listener for a remote forward (`tcpip-forward`) on
/// `address`:`port`, as chosen by `fwd_bind_addr`. Returns the
/// listener channel and the bound port.
pub fn setup_remote_fwd_listener(
    channels: &mut ChannelTable,
    address: &str,
    port: u16,
    gateway_ports: bool,
) -> io::Result<(ChannelId, u16)> {
    let bind = fwd_bind_addr(address, port, gateway_ports)?;
    debug!("Local forwarding listening on {} port {}.", bind.ip(), port);
    let sock = Socket::new(Domain::for_address(bind), Type::STREAM, None)?;
    sock.set_reuse_address(true)?;
    sock.bind(&SockAddr::from(bind))?;
    sock.listen(5)?;
    sock.set_nonblocking(true)?;
    let listener = ListenSocket::Tcp(TcpListener::from(sock));
    let id = channels.add_listener(
        ChannelKind::RportListener,
        listener,
        address,
        port,
        CHAN_TCP_WINDOW_DEFAULT,
        CHAN_TCP_PACKET_DEFAULT,
    );
    let bound = channels.lookup(id).map(|c| c.listening_port).unwrap_or(port);
    Ok((id, bound))
}

/// A non-blocking connect completed (or failed): confirm or refuse
/// the channel to the peer.
pub fn post_connecting(c: &mut Channel, s: &mut Session, set: &PollSet) {
    let sock = c.io.sock();
    if !set.writable(sock) {
        return;
    }
    let err = match c.io {
        Io::Socket { ref sock, .. } => match sock.get() {
            Some(fd) => SockRef::from(fd).take_error(),
            None => return,
        },
        _ => return,
    };
    match err {
        Ok(None) => {
            debug!("channel {}: connected", c.id);
            c.state = ChannelState::Open;
            s.channel_open_confirmation(c)
        }
        Ok(Some(e)) | Err(e) => {
            debug!("channel {}: not connected: {}", c.id, e);
            if let Some(remote) = c.remote_id {
                s.channel_open_failure(remote, ChannelOpenFailure::ConnectFailed, &e.to_string(), "")
            }
            nchan::mark_dead(c)
        }
    }
}

/// Accept a connection on listener `id`, and ask the peer to open a
/// channel for it.
pub fn post_listener(channels: &mut ChannelTable, id: ChannelId, s: &mut Session, set: &PollSet) {
    let (conn, kind, ctype, path, host_port, listening_port, window, maxpacket) = {
        let c = match channels.lookup_mut(id) {
            Ok(c) => c,
            Err(_) => return,
        };
        if c.state != ChannelState::Open || !set.readable(c.io.sock()) {
            return;
        }
        let (kind, ctype) = match c.kind.accepted() {
            Some(k) => k,
            None => return,
        };
        let conn = match c.io {
            Io::Listener(ref l) => match l.accept() {
                Ok(conn) => conn,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => return,
                Err(e) => {
                    error!("accept: {}", e);
                    return;
                }
            },
            _ => return,
        };
        if c.single_connection {
            debug!("single_connection: closing X11 listener.");
            c.io = Io::None;
            nchan::mark_dead(c)
        }
        (
            conn,
            kind,
            ctype,
            c.path.clone().unwrap_or_default(),
            c.host_port,
            c.listening_port,
            c.window.local_window_max,
            c.window.local_maxpacket,
        )
    };
    let (sock, originator, originator_port) = conn;
    let remote_name = match kind {
        ChannelKind::X11 => format!("X11 connection from {} port {}", originator, originator_port),
        ChannelKind::AuthAgent => "accepted auth socket".to_string(),
        _ => format!(
            "listen port {} for {} port {}, connect from {} port {}",
            listening_port, path, host_port, originator, originator_port
        ),
    };
    let nid = channels.allocate(kind, ChannelState::Opening, Io::socket(sock), window, maxpacket, &remote_name);
    let c = match channels.lookup_mut(nid) {
        Ok(c) => c,
        Err(_) => return,
    };
    c.ctype = ctype.to_string();
    c.path = Some(path.clone());
    c.host_port = host_port;
    c.listening_port = listening_port;
    match kind {
        ChannelKind::X11 => s.channel_open_x11(c, &originator, originator_port as u32),
        ChannelKind::AuthAgent => s.channel_open_agent(c),
        ChannelKind::ForwardedTcpip => s.channel_open_tcpip(
            c,
            &path,
            listening_port as u32,
            &originator,
            originator_port as u32,
        ),
        _ => s.channel_open_tcpip(c, &path, host_port as u32, &originator, originator_port as u32),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channels::Protocol;
    use crate::encoding::Reader;
    use crate::msg;
    use crate::server::test_session;
    use std::time::Duration;

    #[test]
    fn accept_opens_forwarded_channel() {
        let _ = env_logger::try_init();
        let mut s = test_session(Protocol::V2);
        let mut t = ChannelTable::new();
        let (lid, port) = setup_remote_fwd_listener(&mut t, "localhost", 0, false).unwrap();
        assert!(port > 0);
        assert_eq!(t.find_listener(ChannelKind::RportListener, "localhost", port), Some(lid));

        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut set = PollSet::new();
        set.want_read(t.lookup(lid).unwrap().io.sock().unwrap());
        set.wait(Some(Duration::from_secs(5))).unwrap();
        post_listener(&mut t, lid, &mut s, &set);

        assert_eq!(t.len(), 2);
        let c = t.iter().find(|c| c.kind == ChannelKind::ForwardedTcpip).unwrap();
        assert_eq!(c.state, ChannelState::Opening);
        let m = s.drain_messages();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0][0], msg::CHANNEL_OPEN);
        let mut r = m[0].reader(1);
        assert_eq!(r.read_str().unwrap(), "forwarded-tcpip");
        assert_eq!(r.read_u32().unwrap(), c.id.0);
        assert_eq!(r.read_u32().unwrap(), CHAN_TCP_WINDOW_DEFAULT);
        assert_eq!(r.read_u32().unwrap(), CHAN_TCP_PACKET_DEFAULT);
        assert_eq!(r.read_str().unwrap(), "localhost");
        assert_eq!(r.read_u32().unwrap(), port as u32);
        assert_eq!(r.read_str().unwrap(), "127.0.0.1");
        r.read_u32().unwrap();
        assert!(r.check_eom().is_ok());
    }

    #[test]
    fn bind_address() {
        let any: SocketAddr = ([0, 0, 0, 0], 22).into();
        let lo: SocketAddr = ([127, 0, 0, 1], 22).into();
        assert_eq!(fwd_bind_addr("", 22, false).unwrap(), lo);
        assert_eq!(fwd_bind_addr("192.0.2.1", 22, false).unwrap(), lo);
        assert_eq!(fwd_bind_addr("localhost", 22, true).unwrap(), lo);
        assert_eq!(fwd_bind_addr("", 22, true).unwrap(), any);
        assert_eq!(fwd_bind_addr("*", 22, true).unwrap(), any);
        assert_eq!(
            fwd_bind_addr("192.0.2.1", 22, true).unwrap(),
            ([192, 0, 2, 1], 22).into()
        );
        assert_eq!(
            fwd_bind_addr("::1", 22, true).unwrap(),
            "[::1]:22".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn gateway_listener_on_given_address() {
        let mut t = ChannelTable::new();
        let (lid, port) = setup_remote_fwd_listener(&mut t, "127.0.0.1", 0, true).unwrap();
        match t.lookup(lid).unwrap().io {
            Io::Listener(ListenSocket::Tcp(ref l)) => {
                assert_eq!(l.local_addr().unwrap(), SocketAddr::from(([127, 0, 0, 1], port)))
            }
            ref io => panic!("{:?}", io),
        }
    }

    #[test]
    fn refused_connect() {
        let _ = env_logger::try_init();
        // Find a port nobody listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut s = test_session(Protocol::V2);
        let mut t = ChannelTable::new();
        let fd = match connect_to("127.0.0.1", port) {
            Ok(fd) => fd,
            // Some systems refuse loopback connections synchronously.
            Err(_) => return,
        };
        let id = t.allocate(
            ChannelKind::DirectTcpip,
            ChannelState::Connecting,
            Io::socket(fd),
            CHAN_TCP_WINDOW_DEFAULT,
            CHAN_TCP_PACKET_DEFAULT,
            "direct-tcpip",
        );
        t.lookup_mut(id).unwrap().remote_id = Some(3);
        let mut set = PollSet::new();
        set.want_write(t.lookup(id).unwrap().io.sock().unwrap());
        set.wait(Some(Duration::from_secs(5))).unwrap();
        post_connecting(t.lookup_mut(id).unwrap(), &mut s, &set);
        assert_eq!(t.lookup(id).unwrap().state, ChannelState::Zombie);
        let m = s.drain_messages();
        assert_eq!(m[0][0], msg::CHANNEL_OPEN_FAILURE);
        let mut r = m[0].reader(1);
        assert_eq!(r.read_u32().unwrap(), 3);
        assert_eq!(r.read_u32().unwrap(), ChannelOpenFailure::ConnectFailed as u32);
    }
}
