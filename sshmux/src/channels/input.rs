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
//! Channel messages received from the peer. Every handler decodes
//! its fields and checks that nothing is left before touching the
//! channel. A message for a channel that does not exist is a
//! protocol violation.
use super::forward;
use super::nchan;
use super::{ChannelKind, ChannelState, ExtendedUsage, InputState, Io, OutputState};
use super::{CHAN_TCP_PACKET_DEFAULT, CHAN_TCP_WINDOW_DEFAULT};
use crate::encoding::Reader;
use crate::msg;
use crate::server::{Connection, Handler};
use crate::transport::Transport;
use crate::{ChannelId, ChannelOpenFailure, Error};

/// Data for a channel, to be written to its local descriptor.
pub fn data<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let proto = conn.session.protocol();
    let mut r = buf.reader(1);
    let id = ChannelId(r.read_u32()?);
    let data = r.read_string()?;
    r.check_eom()?;
    let c = conn.channels.lookup_mut(id)?;
    // Data for non-open channels might arrive while closing.
    if c.state != ChannelState::Open {
        return Ok(());
    }
    if !proto.is_13() && c.ostate != OutputState::Open {
        debug!("channel {}: data after eof or close, ignored", id);
        return Ok(());
    }
    if proto.is_v2() {
        if data.len() > c.window.local_maxpacket as usize {
            info!(
                "channel {}: rcvd big packet {}, maxpack {}",
                id,
                data.len(),
                c.window.local_maxpacket
            )
        }
        c.window.received(id, data.len())?;
    }
    c.output.append(data);
    Ok(())
}

/// Extended data (stderr) for a channel.
pub fn extended_data<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let id = ChannelId(r.read_u32()?);
    let code = r.read_u32()?;
    let data = r.read_string()?;
    r.check_eom()?;
    let c = conn.channels.lookup_mut(id)?;
    if c.state != ChannelState::Open {
        info!("channel {}: ext data for non open", id);
        return Ok(());
    }
    if c.io.efd().is_none() || c.extended_usage != ExtendedUsage::Write || code != msg::EXTENDED_DATA_STDERR {
        info!("channel {}: bad ext data", id);
        return Ok(());
    }
    c.window.received(id, data.len())?;
    c.extended.append(data);
    Ok(())
}

/// The peer will not send more data on this channel.
pub fn ieof<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let id = ChannelId(r.read_u32()?);
    r.check_eom()?;
    let c = conn.channels.lookup_mut(id)?;
    nchan::rcvd_ieof(c, &mut conn.session);
    if c.force_drain && c.istate == InputState::Open {
        debug!("channel {}: FORCE input drain", id);
        c.istate = InputState::WaitDrain;
        if c.input.is_empty() {
            nchan::ibuf_empty(c, &mut conn.session)
        }
    }
    Ok(())
}

/// The peer closed the channel (CHANNEL_CLOSE in protocol 2.0, and
/// CLOSE_CONFIRMATION in protocol 1.5).
pub fn oclose<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let id = ChannelId(r.read_u32()?);
    r.check_eom()?;
    let c = conn.channels.lookup_mut(id)?;
    nchan::rcvd_oclose(c, &mut conn.session);
    Ok(())
}

/// Protocol 1.3: the peer closed the channel. We confirm, and free
/// the channel once its output has drained (or once our own close is
/// confirmed, if we sent one).
pub fn close13<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let id = ChannelId(r.read_u32()?);
    r.check_eom()?;
    let c = conn.channels.lookup_mut(id)?;
    conn.session.close_confirmation(c);
    if c.state != ChannelState::Closed {
        c.input.clear();
        c.state = ChannelState::OutputDraining;
    }
    Ok(())
}

/// Protocol 1.3: the peer confirmed our close.
pub fn close_confirmation13<T: Transport, H: Handler>(
    conn: &mut Connection<T, H>,
    buf: &[u8],
) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let id = ChannelId(r.read_u32()?);
    r.check_eom()?;
    let c = conn.channels.lookup(id)?;
    if c.state != ChannelState::Closed {
        error!("Received close confirmation for non-closed channel {} (type {})", id, c.state.code());
        return Err(Error::Inconsistent);
    }
    conn.channels.free(id, &mut conn.handler)
}

/// The peer accepted a channel we asked it to open.
pub fn open_confirmation<T: Transport, H: Handler>(
    conn: &mut Connection<T, H>,
    buf: &[u8],
) -> Result<(), Error> {
    let proto = conn.session.protocol();
    let mut r = buf.reader(1);
    let id = ChannelId(r.read_u32()?);
    let remote_id = r.read_u32()?;
    let window = if proto.is_v2() {
        Some((r.read_u32()?, r.read_u32()?))
    } else {
        None
    };
    r.check_eom()?;
    let c = conn.channels.lookup_mut(id)?;
    if c.state != ChannelState::Opening {
        error!("Received open confirmation for non-opening channel {}.", id);
        return Err(Error::Inconsistent);
    }
    c.state = ChannelState::Open;
    c.remote_id = Some(remote_id);
    if let Some((window, maxpacket)) = window {
        c.window.remote_window = window;
        c.window.remote_maxpacket = maxpacket;
    }
    if let Some(f) = c.on_confirm.take() {
        debug!("channel {}: callback start", id);
        f(id, true)
    }
    Ok(())
}

/// The peer refused a channel we asked it to open.
pub fn open_failure<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let proto = conn.session.protocol();
    let mut r = buf.reader(1);
    let id = ChannelId(r.read_u32()?);
    if proto.is_v2() {
        let reason = r.read_u32()?;
        let description = r.read_str()?;
        let _language = r.read_string()?;
        r.check_eom()?;
        info!(
            "channel {}: open failed: {}{}{}",
            id,
            ChannelOpenFailure::from_u32(reason)
                .map(|r| r.as_str())
                .unwrap_or("unknown reason"),
            if description.is_empty() { "" } else { ": " },
            description
        );
    } else {
        r.check_eom()?;
    }
    let c = conn.channels.lookup_mut(id)?;
    if c.state != ChannelState::Opening {
        error!("Received open failure for non-opening channel {}.", id);
        return Err(Error::Inconsistent);
    }
    if let Some(f) = c.on_confirm.take() {
        f(id, false)
    }
    conn.channels.free(id, &mut conn.handler)
}

/// The peer lets us send more data.
pub fn window_adjust<T: Transport, H: Handler>(
    conn: &mut Connection<T, H>,
    buf: &[u8],
) -> Result<(), Error> {
    if !conn.session.protocol().is_v2() {
        return Ok(());
    }
    let mut r = buf.reader(1);
    let id = ChannelId(r.read_u32()?);
    let adjust = r.read_u32()?;
    r.check_eom()?;
    let c = conn.channels.lookup_mut(id)?;
    if c.state != ChannelState::Open {
        info!("Received window adjust for non-open channel {}.", id);
        return Ok(());
    }
    debug!("channel {}: rcvd adjust {}", id, adjust);
    c.window.adjust_remote(id, adjust)
}

/// Protocol 1: the peer asks us to connect to a host (a local port
/// forward).
pub fn port_open<T: Transport, H: Handler>(conn: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    let mut r = buf.reader(1);
    let remote_id = r.read_u32()?;
    let host = r.read_str()?;
    let port = r.read_u32()?;
    let originator = if r.remaining() > 0 {
        r.read_str()?.to_string()
    } else {
        "unknown (remote did not supply name)".to_string()
    };
    r.check_eom()?;
    let sock = if conn.config.allow_tcp_forwarding {
        forward::connect_to(host, port as u16).ok()
    } else {
        None
    };
    match sock {
        Some(sock) => {
            let id = conn.channels.allocate(
                ChannelKind::DirectTcpip,
                ChannelState::Connecting,
                Io::socket(sock),
                CHAN_TCP_WINDOW_DEFAULT,
                CHAN_TCP_PACKET_DEFAULT,
                &originator,
            );
            let c = conn.channels.lookup_mut(id)?;
            c.ctype = "connected socket".to_string();
            c.path = Some(host.to_string());
            c.host_port = port as u16;
            c.remote_id = Some(remote_id);
        }
        None => conn.session.channel_open_failure(
            remote_id,
            ChannelOpenFailure::AdministrativelyProhibited,
            "open failed",
            "",
        ),
    }
    Ok(())
}
