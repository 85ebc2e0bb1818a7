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
//! Requests from the client that are not plain channel traffic:
//! opening channels, channel and global requests, and the protocol 1
//! session messages.
use super::{Connection, Handler};
use crate::channels::forward;
use crate::channels::{ChannelKind, ChannelState, Cleanup, Io};
use crate::channels::{CHAN_TCP_PACKET_DEFAULT, CHAN_TCP_WINDOW_DEFAULT};
use crate::encoding::Reader;
use crate::fd;
use crate::transport::Transport;
use crate::{ChannelId, ChannelOpenFailure, Error};

/// CHANNEL_OPEN: the client asks for a new channel.
pub fn channel_open<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let ctype = r.read_str()?;
    let remote_id = r.read_u32()?;
    let remote_window = r.read_u32()?;
    let remote_maxpacket = r.read_u32()?;
    debug!(
        "server_input_channel_open: ctype {} rchan {} win {} max {}",
        ctype, remote_id, remote_window, remote_maxpacket
    );
    let id = match ctype {
        "session" => {
            r.check_eom()?;
            open_session(conn)?
        }
        "direct-tcpip" => {
            let target = r.read_str()?;
            let target_port = r.read_u32()?;
            let originator = r.read_str()?;
            let originator_port = r.read_u32()?;
            r.check_eom()?;
            debug!(
                "server_request_direct_tcpip: originator {} port {}, target {} port {}",
                originator, originator_port, target, target_port
            );
            open_direct_tcpip(conn, target, target_port as u16)
        }
        _ => {
            debug!("server_input_channel_open: unsupported channel type {}", ctype);
            None
        }
    };
    match id {
        Some(id) => {
            let c = conn.channels.lookup_mut(id)?;
            debug!("server_input_channel_open: confirm {}", ctype);
            c.remote_id = Some(remote_id);
            c.window.remote_window = remote_window;
            c.window.remote_maxpacket = remote_maxpacket;
            c.ctype = ctype.to_string();
            if c.state != ChannelState::Connecting {
                conn.session.channel_open_confirmation(c)
            }
        }
        None => {
            debug!("server_input_channel_open: failure {}", ctype);
            conn.session.channel_open_failure(
                remote_id,
                ChannelOpenFailure::AdministrativelyProhibited,
                "open failed",
                "",
            )
        }
    }
    Ok(())
}

fn open_session<T: Transport, H: Handler>(conn: &mut Connection<T, H>) -> Result<Option<ChannelId>, Error> {
    // The window is granted in set_fds, once the program runs.
    let id = conn.channels.allocate(
        ChannelKind::Session,
        ChannelState::Larval,
        Io::None,
        0,
        conn.config.maximum_packet_size,
        "server-session",
    );
    conn.channels.lookup_mut(id)?.window.local_window_max = conn.config.window_size;
    if !conn.handler.open(&conn.auth, id) {
        debug!("session open failed, free channel {}", id);
        conn.channels.free(id, &mut conn.handler)?;
        return Ok(None);
    }
    conn.channels.lookup_mut(id)?.cleanup = Some(Cleanup::Session);
    Ok(Some(id))
}

fn open_direct_tcpip<T: Transport, H: Handler>(
    conn: &mut Connection<T, H>,
    target: &str,
    port: u16,
) -> Option<ChannelId> {
    if !conn.config.allow_tcp_forwarding {
        info!("refused local port forward to {} port {}", target, port);
        return None;
    }
    let sock = forward::connect_to(target, port).ok()?;
    let id = conn.channels.allocate(
        ChannelKind::DirectTcpip,
        ChannelState::Connecting,
        Io::socket(sock),
        CHAN_TCP_WINDOW_DEFAULT,
        CHAN_TCP_PACKET_DEFAULT,
        "direct-tcpip",
    );
    if let Ok(c) = conn.channels.lookup_mut(id) {
        c.path = Some(target.to_string());
        c.host_port = port
    }
    Some(id)
}

/// CHANNEL_REQUEST: handed to the session collaborator while the
/// channel is larval or open.
pub fn channel_request<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let id = ChannelId(r.read_u32()?);
    let rtype = r.read_str()?;
    let want_reply = r.read_bool()?;
    debug!("server_input_channel_req: channel {} request {} reply {}", id, rtype, want_reply);
    let state = conn.channels.lookup(id)?.state;
    let success = if state == ChannelState::Larval || state == ChannelState::Open {
        conn.handler.channel_request(&mut conn.channels, &mut conn.session, id, rtype, &mut r)?
    } else {
        false
    };
    if want_reply {
        // The collaborator may have freed the channel.
        if let Ok(c) = conn.channels.lookup(id) {
            if success {
                conn.session.channel_success(c)
            } else {
                conn.session.channel_failure(c)
            }
        }
    }
    Ok(())
}

/// GLOBAL_REQUEST: remote forwards.
pub fn global_request<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let rtype = r.read_str()?;
    let want_reply = r.read_bool()?;
    debug!("server_input_global_request: rtype {} want_reply {}", rtype, want_reply);
    let mut allocated_port = None;
    let success = match rtype {
        "tcpip-forward" => {
            let address = r.read_str()?;
            let port = r.read_u32()? as u16;
            r.check_eom()?;
            debug!("server_input_global_request: tcpip-forward listen {} port {}", address, port);
            if !conn.config.allow_tcp_forwarding || (port < 1024 && port != 0 && !conn.auth.is_root()) {
                conn.session.debug("Server has disabled port forwarding.");
                false
            } else {
                match forward::setup_remote_fwd_listener(
                    &mut conn.channels,
                    address,
                    port,
                    conn.config.gateway_ports,
                ) {
                    Ok((_, bound)) => {
                        if port == 0 {
                            allocated_port = Some(bound)
                        }
                        true
                    }
                    Err(e) => {
                        error!("tcpip-forward {} port {}: {}", address, port, e);
                        false
                    }
                }
            }
        }
        "cancel-tcpip-forward" => {
            let address = r.read_str()?;
            let port = r.read_u32()? as u16;
            r.check_eom()?;
            debug!("server_input_global_request: cancel-tcpip-forward addr {} port {}", address, port);
            match conn.channels.find_listener(ChannelKind::RportListener, address, port) {
                Some(id) => {
                    conn.channels.free(id, &mut conn.handler)?;
                    true
                }
                None => false,
            }
        }
        _ => false,
    };
    if want_reply {
        match (success, allocated_port) {
            (true, Some(port)) => conn.session.request_success_port(port),
            (true, None) => conn.session.request_success(),
            (false, _) => conn.session.request_failure(),
        }
    }
    Ok(())
}

/// CHANNEL_SUCCESS and CHANNEL_FAILURE: the only requests we send
/// with want-reply are keepalives, so any reply proves the client is
/// alive.
pub fn keepalive_reply<T: Transport, H: Handler>(conn: &mut Connection<T, H>, _: &[u8]) -> Result<(), Error> {
    conn.client_alive_timeouts = 0;
    Ok(())
}

/// Protocol 1: data for the program's standard input.
pub fn stdin_data<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let data = r.read_string()?;
    r.check_eom()?;
    // Stdin closed: the program does not want any more input.
    if !conn.legacy.fdin.is_open() {
        return Ok(());
    }
    conn.legacy.stdin.append(data);
    Ok(())
}

/// Protocol 1: end of the client's standard input.
pub fn stdin_eof<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    buf.reader(1).check_eom()?;
    debug!("EOF received for stdin.");
    conn.legacy.stdin_eof = true;
    Ok(())
}

/// Protocol 1: the client's terminal was resized.
pub fn window_size<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let row = r.read_u32()?;
    let col = r.read_u32()?;
    let xpixel = r.read_u32()?;
    let ypixel = r.read_u32()?;
    r.check_eom()?;
    debug!("Window change received.");
    if conn.legacy.fdin_is_tty {
        if let Some(fdin) = conn.legacy.fdin.raw() {
            if let Err(e) = fd::set_window_size(fdin, row, col, xpixel, ypixel) {
                error!("set_window_size: {}", e)
            }
        }
    }
    conn.handler.window_change(row, col, xpixel, ypixel);
    Ok(())
}
