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
//! Half-close of channels.
//!
//! The receive half ("input", local descriptor to peer) and the
//! transmit half ("output", peer to local descriptor) are closed
//! independently:
//!
//! ```text
//! input:  OPEN -> WAIT_DRAIN -> CLOSED                  (2.0)
//!         OPEN -> WAIT_DRAIN -> WAIT_OCLOSE -> CLOSED   (1.5)
//! output: OPEN -> WAIT_DRAIN -> CLOSED                  (2.0)
//!         OPEN -> WAIT_IEOF / WAIT_DRAIN -> CLOSED      (1.5)
//! ```
//!
//! In protocol 2.0, the input half ends with an EOF message, and the
//! channel is dead once both halves are closed and CLOSE was both
//! sent and received. In protocol 1.5, CHANNEL_CLOSE means "input
//! EOF" and CLOSE_CONFIRMATION means "output closed".
use super::{Channel, ChannelState, CloseFlags, ExtendedUsage, InputState, OutputState};
use crate::server::Session;

fn set_istate(c: &mut Channel, next: InputState) {
    debug!("channel {}: input {:?} -> {:?}", c.id, c.istate, next);
    c.istate = next
}

fn set_ostate(c: &mut Channel, next: OutputState) {
    debug!("channel {}: output {:?} -> {:?}", c.id, c.ostate, next);
    c.ostate = next
}

/// The local read side failed or reached EOF.
pub fn read_failed(c: &mut Channel, s: &mut Session) {
    debug!("channel {}: read failed", c.id);
    match c.istate {
        InputState::Open => {
            shutdown_read(c, s);
            set_istate(c, InputState::WaitDrain)
        }
        st => error!("channel {}: chan_read_failed for istate {:?}", c.id, st),
    }
}

/// All buffered input was sent after the read side failed.
pub fn ibuf_empty(c: &mut Channel, s: &mut Session) {
    debug!("channel {}: ibuf empty", c.id);
    if !c.input.is_empty() {
        error!("channel {}: chan_ibuf_empty for non empty buffer", c.id);
        return;
    }
    if s.protocol().is_v2() {
        match c.istate {
            InputState::WaitDrain => {
                if !c.flags.contains(CloseFlags::CLOSE_SENT) {
                    send_eof2(c, s)
                }
                set_istate(c, InputState::Closed)
            }
            st => error!("channel {}: chan_ibuf_empty for istate {:?}", c.id, st),
        }
    } else {
        match c.istate {
            InputState::WaitDrain => {
                send_ieof1(c, s);
                set_istate(c, InputState::WaitOclose)
            }
            st => error!("channel {}: chan_ibuf_empty for istate {:?}", c.id, st),
        }
    }
}

/// The peer will not send more data.
pub fn rcvd_ieof(c: &mut Channel, s: &mut Session) {
    debug!("channel {}: rcvd eof", c.id);
    if s.protocol().is_v2() {
        c.flags.insert(CloseFlags::EOF_RCVD);
        if c.ostate == OutputState::Open {
            set_ostate(c, OutputState::WaitDrain)
        }
    } else {
        match c.ostate {
            OutputState::Open => set_ostate(c, OutputState::WaitDrain),
            OutputState::WaitIeof => set_ostate(c, OutputState::Closed),
            st => error!("channel {}: protocol error: rcvd_ieof for ostate {:?}", c.id, st),
        }
    }
}

/// The peer closed the channel (2.0), or closed its output (1.5).
pub fn rcvd_oclose(c: &mut Channel, s: &mut Session) {
    debug!("channel {}: rcvd close", c.id);
    if s.protocol().is_v2() {
        if c.flags.contains(CloseFlags::CLOSE_RCVD) {
            error!("channel {}: protocol error: close rcvd twice", c.id)
        }
        c.flags.insert(CloseFlags::CLOSE_RCVD);
        if c.state == ChannelState::Larval {
            // Nothing was attached, tear both halves down at once.
            set_ostate(c, OutputState::Closed);
            set_istate(c, InputState::Closed);
            return;
        }
        if c.ostate == OutputState::Open {
            // Write what was already received.
            set_ostate(c, OutputState::WaitDrain)
        }
        match c.istate {
            InputState::Open => {
                shutdown_read(c, s);
                set_istate(c, InputState::Closed)
            }
            InputState::WaitDrain => {
                send_eof2(c, s);
                set_istate(c, InputState::Closed)
            }
            _ => {}
        }
    } else {
        match c.istate {
            InputState::Open => {
                shutdown_read(c, s);
                send_ieof1(c, s);
                set_istate(c, InputState::Closed)
            }
            InputState::WaitDrain => {
                send_ieof1(c, s);
                set_istate(c, InputState::Closed)
            }
            InputState::WaitOclose => set_istate(c, InputState::Closed),
            st => error!("channel {}: protocol error: rcvd_oclose for istate {:?}", c.id, st),
        }
    }
}

/// Writing to the local descriptor failed: nobody reads what the peer
/// sends any more.
pub fn write_failed(c: &mut Channel, s: &mut Session) {
    debug!("channel {}: write failed", c.id);
    if s.protocol().is_v2() {
        match c.ostate {
            OutputState::Open | OutputState::WaitDrain => {
                shutdown_write(c, s);
                set_ostate(c, OutputState::Closed)
            }
            st => error!("channel {}: chan_write_failed for ostate {:?}", c.id, st),
        }
    } else {
        match c.ostate {
            OutputState::Open => {
                send_oclose1(c, s);
                set_ostate(c, OutputState::WaitIeof)
            }
            OutputState::WaitDrain => {
                send_oclose1(c, s);
                set_ostate(c, OutputState::Closed)
            }
            st => error!("channel {}: chan_write_failed for ostate {:?}", c.id, st),
        }
    }
}

/// Everything received after the peer's EOF was written.
pub fn obuf_empty(c: &mut Channel, s: &mut Session) {
    debug!("channel {}: obuf empty", c.id);
    if !c.output.is_empty() {
        error!("channel {}: chan_obuf_empty for non empty buffer", c.id);
        return;
    }
    match c.ostate {
        OutputState::WaitDrain => {
            if s.protocol().is_v2() {
                shutdown_write(c, s)
            } else {
                send_oclose1(c, s)
            }
            set_ostate(c, OutputState::Closed)
        }
        st => error!("channel {}: internal error: obuf_empty for ostate {:?}", c.id, st),
    }
}

/// Whether the channel can be freed. With `send`, a CLOSE message is
/// sent if it is the last thing missing.
pub fn is_dead(c: &mut Channel, s: &mut Session, send: bool) -> bool {
    if c.state == ChannelState::Zombie {
        debug!("channel {}: zombie", c.id);
        return true;
    }
    if c.istate != InputState::Closed || c.ostate != OutputState::Closed {
        return false;
    }
    if !s.protocol().is_v2() {
        debug!("channel {}: is dead", c.id);
        return true;
    }
    if c.extended_usage == ExtendedUsage::Write && c.io.efd().is_some() && !c.extended.is_empty() {
        debug!("channel {}: active efd: {:?} len {}", c.id, c.io.efd(), c.extended.len());
        return false;
    }
    if c.pending_exit.is_some() && !c.flags.contains(CloseFlags::CLOSE_SENT) {
        debug!("channel {}: exit status not sent yet", c.id);
        return false;
    }
    if !c.flags.contains(CloseFlags::CLOSE_SENT) {
        if send {
            send_close2(c, s)
        } else if c.flags.contains(CloseFlags::CLOSE_RCVD) {
            // Dead as soon as we send our close.
            debug!("channel {}: almost dead", c.id);
            return true;
        }
    }
    if c.flags.contains(CloseFlags::CLOSE_SENT | CloseFlags::CLOSE_RCVD) {
        debug!("channel {}: is dead", c.id);
        return true;
    }
    false
}

/// Mark the channel for freeing regardless of its halves.
pub fn mark_dead(c: &mut Channel) {
    c.state = ChannelState::Zombie
}

fn send_eof2(c: &mut Channel, s: &mut Session) {
    debug!("channel {}: send eof", c.id);
    match c.istate {
        InputState::WaitDrain => {
            s.eof(c);
            c.flags.insert(CloseFlags::EOF_SENT)
        }
        st => error!("channel {}: cannot send eof for istate {:?}", c.id, st),
    }
}

fn send_close2(c: &mut Channel, s: &mut Session) {
    debug!("channel {}: send close", c.id);
    if c.ostate != OutputState::Closed || c.istate != InputState::Closed {
        error!(
            "channel {}: cannot send close for istate/ostate {:?}/{:?}",
            c.id, c.istate, c.ostate
        );
    } else if c.flags.contains(CloseFlags::CLOSE_SENT) {
        error!("channel {}: already sent close", c.id);
    } else {
        s.close(c);
        c.flags.insert(CloseFlags::CLOSE_SENT)
    }
}

fn send_ieof1(c: &mut Channel, s: &mut Session) {
    debug!("channel {}: send ieof", c.id);
    match c.istate {
        InputState::Open | InputState::WaitDrain => s.close(c),
        st => error!("channel {}: cannot send ieof for istate {:?}", c.id, st),
    }
}

fn send_oclose1(c: &mut Channel, s: &mut Session) {
    debug!("channel {}: send oclose", c.id);
    match c.ostate {
        OutputState::Open | OutputState::WaitDrain => {
            shutdown_write(c, s);
            s.close_confirmation(c)
        }
        st => error!("channel {}: cannot send oclose for ostate {:?}", c.id, st),
    }
}

fn shutdown_write(c: &mut Channel, s: &mut Session) {
    c.output.clear();
    if s.protocol().is_v2() && c.state == ChannelState::Larval {
        return;
    }
    debug!("channel {}: close_write", c.id);
    if let Err(e) = c.io.shutdown_write() {
        debug!("channel {}: chan_shutdown_write: shutdown() failed: {}", c.id, e)
    }
}

fn shutdown_read(c: &mut Channel, s: &mut Session) {
    if s.protocol().is_v2() && c.state == ChannelState::Larval {
        return;
    }
    debug!("channel {}: close_read", c.id);
    if let Err(e) = c.io.shutdown_read() {
        error!("channel {}: chan_shutdown_read: shutdown() failed: {}", c.id, e)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channels::{ChannelKind, Io};
    use crate::server::test_session;
    use crate::channels::Protocol;
    use crate::encoding::Reader;
    use crate::msg;
    use crate::ChannelId;

    fn open_channel() -> Channel {
        let mut c = Channel::new(
            ChannelId(0),
            ChannelKind::DirectTcpip,
            ChannelState::Open,
            Io::None,
            1024,
            512,
            "test",
        );
        c.remote_id = Some(7);
        c
    }

    fn sent(s: &mut Session) -> Vec<u8> {
        s.drain_messages().into_iter().map(|m| m[0]).collect()
    }

    #[test]
    fn local_eof_then_remote_close() {
        let mut s = test_session(Protocol::V2);
        let mut c = open_channel();
        read_failed(&mut c, &mut s);
        assert_eq!(c.istate, InputState::WaitDrain);
        ibuf_empty(&mut c, &mut s);
        assert_eq!(c.istate, InputState::Closed);
        assert!(c.flags.contains(CloseFlags::EOF_SENT));
        assert_eq!(sent(&mut s), vec![msg::CHANNEL_EOF]);

        assert!(!is_dead(&mut c, &mut s, true));
        rcvd_oclose(&mut c, &mut s);
        assert_eq!(c.ostate, OutputState::WaitDrain);
        obuf_empty(&mut c, &mut s);
        assert_eq!(c.ostate, OutputState::Closed);
        // Close received but not sent: almost dead.
        assert!(is_dead(&mut c, &mut s, false));
        assert!(sent(&mut s).is_empty());
        assert!(is_dead(&mut c, &mut s, true));
        assert_eq!(sent(&mut s), vec![msg::CHANNEL_CLOSE]);
    }

    #[test]
    fn remote_close_while_draining_sends_eof() {
        let mut s = test_session(Protocol::V2);
        let mut c = open_channel();
        read_failed(&mut c, &mut s);
        c.input.append(b"pending");
        rcvd_oclose(&mut c, &mut s);
        assert_eq!(c.istate, InputState::Closed);
        let m = s.drain_messages();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0][0], msg::CHANNEL_EOF);
        let mut r = m[0].reader(1);
        assert_eq!(r.read_u32().unwrap(), 7);
    }

    #[test]
    fn close_twice_is_logged() {
        let mut s = test_session(Protocol::V2);
        let mut c = open_channel();
        rcvd_oclose(&mut c, &mut s);
        rcvd_oclose(&mut c, &mut s);
        assert!(c.flags.contains(CloseFlags::CLOSE_RCVD));
        assert_eq!(c.istate, InputState::Closed);
    }

    #[test]
    fn larval_close() {
        let mut s = test_session(Protocol::V2);
        let mut c = open_channel();
        c.state = ChannelState::Larval;
        rcvd_oclose(&mut c, &mut s);
        assert_eq!(c.istate, InputState::Closed);
        assert_eq!(c.ostate, OutputState::Closed);
        assert!(is_dead(&mut c, &mut s, true));
        assert_eq!(sent(&mut s), vec![msg::CHANNEL_CLOSE]);
    }

    #[test]
    fn write_failure_closes_output() {
        let mut s = test_session(Protocol::V2);
        let mut c = open_channel();
        c.output.append(b"lost");
        write_failed(&mut c, &mut s);
        assert_eq!(c.ostate, OutputState::Closed);
        assert!(c.output.is_empty());
        rcvd_ieof(&mut c, &mut s);
        assert!(c.flags.contains(CloseFlags::EOF_RCVD));
        assert_eq!(c.ostate, OutputState::Closed);
    }

    #[test]
    fn protocol_15_handshake() {
        let mut s = test_session(Protocol::Legacy15);
        let mut c = open_channel();
        read_failed(&mut c, &mut s);
        ibuf_empty(&mut c, &mut s);
        assert_eq!(c.istate, InputState::WaitOclose);
        write_failed(&mut c, &mut s);
        assert_eq!(c.ostate, OutputState::WaitIeof);
        assert_eq!(
            sent(&mut s),
            vec![msg::ssh1::CHANNEL_CLOSE, msg::ssh1::CHANNEL_CLOSE_CONFIRMATION]
        );
        assert!(!is_dead(&mut c, &mut s, true));
        rcvd_oclose(&mut c, &mut s);
        rcvd_ieof(&mut c, &mut s);
        assert_eq!(c.istate, InputState::Closed);
        assert_eq!(c.ostate, OutputState::Closed);
        assert!(is_dead(&mut c, &mut s, true));
        assert!(sent(&mut s).is_empty());
    }

    #[test]
    fn zombie() {
        let mut s = test_session(Protocol::V2);
        let mut c = open_channel();
        mark_dead(&mut c);
        assert!(is_dead(&mut c, &mut s, false));
    }
}
