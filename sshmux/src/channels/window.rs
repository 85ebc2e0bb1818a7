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
use super::{Channel, ChannelState, CloseFlags};
use crate::server::Session;
use crate::{ChannelId, Error};

/// Flow control state of a channel, in both directions.
///
/// The *local* window is what we granted the peer: it shrinks when
/// data arrives, and grows again (by a window adjustment sent to the
/// peer) once the data has been written to the local descriptor. The
/// *remote* window is what the peer granted us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Bytes the peer may still send.
    pub local_window: u32,
    /// Size of the local window when fully open.
    pub local_window_max: u32,
    /// Bytes written to the local descriptor since the last adjustment.
    pub local_consumed: u32,
    /// Largest data payload we accept.
    pub local_maxpacket: u32,
    /// Bytes we may still send.
    pub remote_window: u32,
    /// Largest data payload the peer accepts.
    pub remote_maxpacket: u32,
}

impl Window {
    /// A window granting `window` bytes to the peer, in packets of at
    /// most `maxpacket` bytes. The remote side is closed until the
    /// peer tells us its window.
    pub fn new(window: u32, maxpacket: u32) -> Self {
        Window {
            local_window: window,
            local_window_max: window,
            local_consumed: 0,
            local_maxpacket: maxpacket,
            remote_window: 0,
            remote_maxpacket: 0,
        }
    }

    /// Size of the next data packet to send, given `len` buffered bytes.
    pub fn outbound_chunk(&self, len: usize) -> usize {
        std::cmp::min(
            len,
            std::cmp::min(self.remote_window, self.remote_maxpacket) as usize,
        )
    }

    /// Account for `n` bytes sent to the peer. Chunks come from
    /// `outbound_chunk`, so the window never goes below zero.
    pub fn sent(&mut self, n: usize) {
        if n > self.remote_window as usize {
            error!("sent {} bytes beyond remote window {}", n, self.remote_window);
            self.remote_window = 0
        } else {
            self.remote_window -= n as u32
        }
    }

    /// Account for `len` bytes received from the peer on channel `id`.
    pub fn received(&mut self, id: ChannelId, len: usize) -> Result<(), Error> {
        if len > self.local_window as usize {
            return Err(Error::WindowExceeded {
                channel: id.0,
                len: len as u32,
                window: self.local_window,
            });
        }
        self.local_window -= len as u32;
        Ok(())
    }

    /// Account for `n` bytes written to the local descriptor.
    pub fn consumed(&mut self, n: usize) {
        self.local_consumed = self.local_consumed.saturating_add(n as u32)
    }

    /// Apply a window adjustment received from the peer.
    pub fn adjust_remote(&mut self, id: ChannelId, adjust: u32) -> Result<(), Error> {
        match self.remote_window.checked_add(adjust) {
            Some(w) => {
                self.remote_window = w;
                Ok(())
            }
            None => Err(Error::WindowOverflow(id.0)),
        }
    }

    /// If more than half of the local window has been consumed,
    /// reopen it. Returns the size of the adjustment to send.
    pub fn grant(&mut self) -> Option<u32> {
        if self.local_window < self.local_window_max / 2 && self.local_consumed > 0 {
            let adjust = self.local_consumed;
            self.local_window = self.local_window.saturating_add(adjust);
            self.local_consumed = 0;
            Some(adjust)
        } else {
            None
        }
    }
}

/// Send a window adjustment if the channel is open, not closing, and
/// more than half of its local window has been consumed.
pub fn check_window(c: &mut Channel, s: &mut Session) {
    if c.state == ChannelState::Open
        && !c
            .flags
            .intersects(CloseFlags::CLOSE_SENT | CloseFlags::CLOSE_RCVD)
    {
        if let Some(adjust) = c.window.grant() {
            debug!("channel {}: window {} sent adjust {}", c.id, c.window.local_window, adjust);
            s.window_adjust(c, adjust)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn receive_all_then_adjust() {
        let id = ChannelId(0);
        let mut w = Window::new(32768, 16384);
        w.received(id, 16384).unwrap();
        w.received(id, 16384).unwrap();
        assert_eq!(w.local_window, 0);
        match w.received(id, 1) {
            Err(Error::WindowExceeded { channel: 0, len: 1, window: 0 }) => {}
            x => panic!("{:?}", x),
        }
        assert_eq!(w.grant(), None);
        w.consumed(32768);
        assert_eq!(w.grant(), Some(32768));
        assert_eq!(w.local_window, 32768);
        assert_eq!(w.local_consumed, 0);
    }

    #[test]
    fn no_adjust_above_half() {
        let id = ChannelId(0);
        let mut w = Window::new(1000, 100);
        w.received(id, 400).unwrap();
        w.consumed(400);
        assert_eq!(w.grant(), None);
        w.received(id, 200).unwrap();
        w.consumed(200);
        assert_eq!(w.grant(), Some(600));
        assert_eq!(w.local_window, 1000);
    }

    #[test]
    fn remote_window() {
        let id = ChannelId(3);
        let mut w = Window::new(0, 0);
        assert_eq!(w.outbound_chunk(100), 0);
        w.remote_maxpacket = 40;
        w.adjust_remote(id, 100).unwrap();
        assert_eq!(w.outbound_chunk(100), 40);
        w.sent(40);
        w.sent(40);
        assert_eq!(w.outbound_chunk(100), 20);
        w.sent(20);
        assert_eq!(w.remote_window, 0);
        w.sent(1);
        assert_eq!(w.remote_window, 0);
        w.adjust_remote(id, std::u32::MAX).unwrap();
        match w.adjust_remote(id, 1) {
            Err(Error::WindowOverflow(3)) => {}
            x => panic!("{:?}", x),
        }
        assert_eq!(w.remote_window, std::u32::MAX);
    }
}
