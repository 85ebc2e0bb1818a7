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
use super::requests;
use super::{Connection, Handler, Protocol};
use crate::channels::input;
use crate::msg;
use crate::transport::Transport;
use crate::Error;

/// A handler for one message number. The payload starts with the
/// message number.
pub type MessageHandler<T, H> = fn(&mut Connection<T, H>, &[u8]) -> Result<(), Error>;

/// The message number → handler table of a connection. The table is
/// chosen once, from the protocol spoken.
pub struct Dispatcher<T: Transport, H: Handler> {
    table: [Option<MessageHandler<T, H>>; 256],
}

impl<T: Transport, H: Handler> std::fmt::Debug for Dispatcher<T, H> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        let set: Vec<usize> = (0..256).filter(|&i| self.table[i].is_some()).collect();
        fmt.debug_struct("Dispatcher").field("set", &set).finish()
    }
}

fn ignore<T: Transport, H: Handler>(_: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    debug!("ignoring message {}", buf[0]);
    Ok(())
}

fn disconnect<T: Transport, H: Handler>(_: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    use crate::encoding::Reader;
    let mut r = buf.reader(1);
    let reason = r.read_u32().unwrap_or(0);
    let description = r.read_str().unwrap_or("");
    info!("Received disconnect: {} {}", reason, description);
    Err(Error::Disconnect)
}

fn disconnect1<T: Transport, H: Handler>(_: &mut Connection<T, H>, buf: &[u8]) -> Result<(), Error> {
    use crate::encoding::Reader;
    let mut r = buf.reader(1);
    info!("Received disconnect: {}", r.read_str().unwrap_or(""));
    Err(Error::Disconnect)
}

impl<T: Transport, H: Handler> Dispatcher<T, H> {
    /// The table for `protocol`.
    pub fn new(protocol: Protocol) -> Self {
        let mut d = Dispatcher { table: [None; 256] };
        match protocol {
            Protocol::V2 => d.init_v2(),
            Protocol::Legacy13 => d.init_13(),
            Protocol::Legacy15 => {
                d.init_13();
                d.set(msg::ssh1::CHANNEL_CLOSE, input::ieof);
                d.set(msg::ssh1::CHANNEL_CLOSE_CONFIRMATION, input::oclose);
            }
        }
        d
    }

    fn init_v2(&mut self) {
        self.set(msg::DISCONNECT, disconnect);
        self.set(msg::IGNORE, ignore);
        self.set(msg::UNIMPLEMENTED, ignore);
        self.set(msg::DEBUG, ignore);
        self.set(msg::CHANNEL_CLOSE, input::oclose);
        self.set(msg::CHANNEL_DATA, input::data);
        self.set(msg::CHANNEL_EOF, input::ieof);
        self.set(msg::CHANNEL_EXTENDED_DATA, input::extended_data);
        self.set(msg::CHANNEL_OPEN, requests::channel_open);
        self.set(msg::CHANNEL_OPEN_CONFIRMATION, input::open_confirmation);
        self.set(msg::CHANNEL_OPEN_FAILURE, input::open_failure);
        self.set(msg::CHANNEL_REQUEST, requests::channel_request);
        self.set(msg::CHANNEL_WINDOW_ADJUST, input::window_adjust);
        self.set(msg::GLOBAL_REQUEST, requests::global_request);
        self.set(msg::CHANNEL_SUCCESS, requests::keepalive_reply);
        self.set(msg::CHANNEL_FAILURE, requests::keepalive_reply);
    }

    fn init_13(&mut self) {
        self.set(msg::ssh1::DISCONNECT, disconnect1);
        self.set(msg::ssh1::IGNORE, ignore);
        self.set(msg::ssh1::DEBUG, ignore);
        self.set(msg::ssh1::CMSG_EOF, requests::stdin_eof);
        self.set(msg::ssh1::CMSG_STDIN_DATA, requests::stdin_data);
        self.set(msg::ssh1::CMSG_WINDOW_SIZE, requests::window_size);
        self.set(msg::ssh1::CHANNEL_CLOSE, input::close13);
        self.set(msg::ssh1::CHANNEL_CLOSE_CONFIRMATION, input::close_confirmation13);
        self.set(msg::ssh1::CHANNEL_DATA, input::data);
        self.set(msg::ssh1::CHANNEL_OPEN_CONFIRMATION, input::open_confirmation);
        self.set(msg::ssh1::CHANNEL_OPEN_FAILURE, input::open_failure);
        self.set(msg::ssh1::PORT_OPEN, input::port_open);
    }

    /// Register `handler` for message number `n`, returning the
    /// handler it replaces.
    pub fn set(&mut self, n: u8, handler: MessageHandler<T, H>) -> Option<MessageHandler<T, H>> {
        std::mem::replace(&mut self.table[n as usize], Some(handler))
    }

    /// Forget the handler of message number `n`.
    pub fn unset(&mut self, n: u8) -> Option<MessageHandler<T, H>> {
        self.table[n as usize].take()
    }

    /// The handler of message number `n`.
    pub fn get(&self, n: u8) -> Option<MessageHandler<T, H>> {
        self.table[n as usize]
    }
}

impl<T: Transport, H: Handler> Connection<T, H> {
    /// Dispatch every complete packet the transport has buffered.
    pub(crate) fn process_buffered_input_packets(&mut self) -> Result<(), Error> {
        while let Some(packet) = self.transport.next_packet()? {
            if packet.len() == 0 {
                return Err(Error::IndexOutOfBounds);
            }
            let n = packet[0];
            let h = match self.dispatch.get(n) {
                Some(h) => h,
                None => {
                    error!("dispatch: unexpected message type {}", n);
                    return Err(Error::UnknownMessage(n));
                }
            };
            h(self, &packet)?;
        }
        self.session.flush(&mut self.transport);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::ClearTransport;

    struct Nothing;
    impl Handler for Nothing {}

    fn claimed(_: &mut Connection<ClearTransport, Nothing>, _: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    #[test]
    fn tables() {
        let d: Dispatcher<ClearTransport, Nothing> = Dispatcher::new(Protocol::V2);
        assert!(d.get(msg::CHANNEL_DATA).is_some());
        assert!(d.get(msg::CHANNEL_SUCCESS).is_some());
        assert!(d.get(msg::KEXINIT).is_none());
        assert!(d.get(msg::ssh1::CMSG_STDIN_DATA).is_none());

        let d13: Dispatcher<ClearTransport, Nothing> = Dispatcher::new(Protocol::Legacy13);
        let d15: Dispatcher<ClearTransport, Nothing> = Dispatcher::new(Protocol::Legacy15);
        assert!(d13.get(msg::ssh1::CMSG_STDIN_DATA).is_some());
        assert!(d13.get(msg::CHANNEL_OPEN).is_none());
        let f13 = d13.get(msg::ssh1::CHANNEL_CLOSE).unwrap() as usize;
        let f15 = d15.get(msg::ssh1::CHANNEL_CLOSE).unwrap() as usize;
        assert_ne!(f13, f15);
        assert_eq!(
            d13.get(msg::ssh1::CHANNEL_DATA).unwrap() as usize,
            d15.get(msg::ssh1::CHANNEL_DATA).unwrap() as usize
        );
    }

    #[test]
    fn claim_and_release() {
        let mut d: Dispatcher<ClearTransport, Nothing> = Dispatcher::new(Protocol::V2);
        assert!(d.set(60, claimed).is_none());
        assert!(d.get(60).is_some());
        assert!(d.set(60, claimed).is_some());
        assert!(d.unset(60).is_some());
        assert!(d.get(60).is_none());
    }
}
