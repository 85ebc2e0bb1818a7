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
//! The transport layer, as seen from the connection layer: something
//! that accepts message payloads, frames (and possibly encrypts)
//! them, and hands back the payloads of received packets.
use crate::buffer::Buffer;
use crate::fd::{Fd, PollSet};
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use cryptovec::CryptoVec;
use std::io;
use std::num::Wrapping;
use std::os::unix::io::{OwnedFd, RawFd};

/// The transport collaborator. All methods are non-blocking, except
/// `flush_blocking` and `read_packet_blocking`.
pub trait Transport {
    /// Queue one message payload (starting with its message number).
    fn send(&mut self, payload: &[u8]);

    /// Write as much queued output as the descriptor accepts.
    fn write_poll(&mut self) -> Result<(), Error>;

    /// Write all queued output, waiting as needed.
    fn flush_blocking(&mut self) -> Result<(), Error>;

    /// Whether queued output remains to be written.
    fn has_pending_output(&self) -> bool;

    /// Whether little enough output is queued that more channel data
    /// should be read and sent.
    fn not_very_much_data_to_write(&self) -> bool;

    /// Read what is available from the input descriptor into the
    /// receive buffer. Returns `Ok(false)` on end of file.
    fn read_poll(&mut self) -> Result<bool, Error>;

    /// The payload of the next complete packet in the receive buffer.
    fn next_packet(&mut self) -> Result<Option<CryptoVec>, Error>;

    /// The payload of the next packet, waiting for it as needed.
    fn read_packet_blocking(&mut self) -> Result<CryptoVec, Error>;

    /// The input and output descriptors, to be waited on.
    fn connection_fds(&self) -> (Option<RawFd>, Option<RawFd>);

    /// Maximal payload size of a packet.
    fn max_packet_size(&self) -> usize {
        32768
    }

    /// Whether the session is interactive (a terminal was allocated).
    fn is_interactive(&self) -> bool {
        false
    }
}

const PACKET_LENGTH_LEN: usize = 4;
const PADDING_LENGTH_LEN: usize = 1;
const BLOCK_SIZE: usize = 8;
const MINIMUM_PADDING_LEN: usize = 4;

/// Largest packet_length accepted from the peer.
pub const MAXIMUM_PACKET_LEN: usize = 256 * 1024;

const READ_SIZE: usize = 16384;

fn padding_length(payload: &[u8]) -> usize {
    // https://tools.ietf.org/html/rfc4253#section-6
    let padding_len = BLOCK_SIZE - ((PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + payload.len()) % BLOCK_SIZE);
    if padding_len < MINIMUM_PADDING_LEN {
        padding_len + BLOCK_SIZE
    } else {
        padding_len
    }
}

/// An unencrypted transport: SSH binary packets with the "none"
/// cipher and MAC, over a pair of non-blocking descriptors. This is
/// what an embedder uses when encryption is terminated elsewhere, and
/// what the tests use on both ends of a socket pair.
#[derive(Debug)]
pub struct ClearTransport {
    input: Fd,
    output: Fd,
    read_buffer: Buffer,
    write_buffer: Buffer,
    read_seqn: Wrapping<u32>,
    write_seqn: Wrapping<u32>,
    max_packet_size: usize,
    interactive: bool,
}

impl ClearTransport {
    /// Create a transport reading from `input` and writing to
    /// `output`. Both are set non-blocking.
    pub fn new(input: Fd, output: Fd) -> io::Result<Self> {
        input.set_nonblocking()?;
        output.set_nonblocking()?;
        Ok(ClearTransport {
            input,
            output,
            read_buffer: Buffer::new(),
            write_buffer: Buffer::new(),
            read_seqn: Wrapping(0),
            write_seqn: Wrapping(0),
            max_packet_size: 32768,
            interactive: false,
        })
    }

    /// Create a transport over a bidirectional stream (a TCP or Unix
    /// socket).
    pub fn from_stream<S: Into<OwnedFd>>(stream: S) -> io::Result<Self> {
        let input: OwnedFd = stream.into();
        let output = input.try_clone()?;
        ClearTransport::new(Fd::from(input), Fd::from(output))
    }

    /// Set the maximal payload size reported by `max_packet_size`.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size
    }

    /// Mark the session as interactive.
    pub fn set_interactive(&mut self, interactive: bool) {
        self.interactive = interactive
    }

    fn wait(&self, fd: Option<RawFd>, write: bool) -> Result<(), Error> {
        let fd = fd.ok_or(Error::HUP)?;
        let mut set = PollSet::new();
        if write {
            set.want_write(fd)
        } else {
            set.want_read(fd)
        }
        set.wait(None)?;
        Ok(())
    }
}

impl Transport for ClearTransport {
    fn send(&mut self, payload: &[u8]) {
        let padding_length = padding_length(payload);
        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding_length;
        debug!(
            "writing, seqn = {:?}, packet_length {:?}",
            self.write_seqn.0, packet_length
        );
        let mut header = [0; PACKET_LENGTH_LEN + PADDING_LENGTH_LEN];
        BigEndian::write_u32(&mut header, packet_length as u32);
        header[PACKET_LENGTH_LEN] = padding_length as u8;
        self.write_buffer.append(&header);
        self.write_buffer.append(payload);
        self.write_buffer.append(&[0; BLOCK_SIZE + MINIMUM_PADDING_LEN][..padding_length]);
        // Sequence numbers are on 32 bits and wrap.
        // https://tools.ietf.org/html/rfc4253#section-6.4
        self.write_seqn += Wrapping(1);
    }

    fn write_poll(&mut self) -> Result<(), Error> {
        while !self.write_buffer.is_empty() {
            match self.output.write(self.write_buffer.peek()) {
                Ok(0) => break,
                Ok(n) => self.write_buffer.consume(n),
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    break
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn flush_blocking(&mut self) -> Result<(), Error> {
        loop {
            self.write_poll()?;
            if self.write_buffer.is_empty() {
                return Ok(());
            }
            self.wait(self.output.raw(), true)?
        }
    }

    fn has_pending_output(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    fn not_very_much_data_to_write(&self) -> bool {
        if self.interactive {
            self.write_buffer.len() < 16384
        } else {
            self.write_buffer.len() < 128 * 1024
        }
    }

    fn read_poll(&mut self) -> Result<bool, Error> {
        let mut buf = [0; READ_SIZE];
        match self.input.read(&mut buf) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.read_buffer.append(&buf[..n]);
                Ok(true)
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn next_packet(&mut self) -> Result<Option<CryptoVec>, Error> {
        let payload = {
            let avail = self.read_buffer.peek();
            if avail.len() < PACKET_LENGTH_LEN + PADDING_LENGTH_LEN {
                return Ok(None);
            }
            let packet_length = BigEndian::read_u32(avail) as usize;
            if packet_length > MAXIMUM_PACKET_LEN {
                return Err(Error::PacketTooLong(packet_length));
            }
            if avail.len() < PACKET_LENGTH_LEN + packet_length {
                return Ok(None);
            }
            let padding_length = avail[PACKET_LENGTH_LEN] as usize;
            let payload_length = packet_length
                .checked_sub(PADDING_LENGTH_LEN + padding_length)
                .ok_or(Error::IndexOutOfBounds)?;
            if payload_length == 0 {
                return Err(Error::IndexOutOfBounds);
            }
            let start = PACKET_LENGTH_LEN + PADDING_LENGTH_LEN;
            let mut payload = CryptoVec::new();
            payload.extend(&avail[start..start + payload_length]);
            self.read_buffer.consume(PACKET_LENGTH_LEN + packet_length);
            payload
        };
        debug!("reading, seqn = {:?}, msg {:?}", self.read_seqn.0, payload[0]);
        self.read_seqn += Wrapping(1);
        Ok(Some(payload))
    }

    fn read_packet_blocking(&mut self) -> Result<CryptoVec, Error> {
        loop {
            if let Some(packet) = self.next_packet()? {
                return Ok(packet);
            }
            self.wait(self.input.raw(), false)?;
            if !self.read_poll()? {
                return Err(Error::HUP);
            }
        }
    }

    fn connection_fds(&self) -> (Option<RawFd>, Option<RawFd>) {
        (self.input.raw(), self.output.raw())
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn is_interactive(&self) -> bool {
        self.interactive
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn padding_is_block_aligned() {
        for len in 1..100 {
            let payload = vec![0; len];
            let p = padding_length(&payload);
            assert!(p >= MINIMUM_PADDING_LEN);
            assert_eq!((PACKET_LENGTH_LEN + PADDING_LENGTH_LEN + len + p) % BLOCK_SIZE, 0);
        }
    }

    #[test]
    fn packets_across_a_socket() {
        let _ = env_logger::try_init();
        let (a, b) = UnixStream::pair().unwrap();
        let mut a = ClearTransport::from_stream(a).unwrap();
        let mut b = ClearTransport::from_stream(b).unwrap();
        a.send(&[94, 0, 0, 0, 1]);
        a.send(b"\x60hello");
        assert!(a.has_pending_output());
        a.flush_blocking().unwrap();
        assert!(!a.has_pending_output());
        assert_eq!(&*b.read_packet_blocking().unwrap(), &[94, 0, 0, 0, 1]);
        assert_eq!(&*b.read_packet_blocking().unwrap(), b"\x60hello");
        assert!(b.next_packet().unwrap().is_none());

        drop(a);
        match b.read_packet_blocking() {
            Err(Error::HUP) => {}
            x => panic!("{:?}", x),
        }
    }

    #[test]
    fn oversized_packet() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let mut b = ClearTransport::from_stream(b).unwrap();
        use std::io::Write;
        a.write_all(&[0x10, 0, 0, 0, 4, 0, 0, 0]).unwrap();
        match b.read_packet_blocking() {
            Err(Error::PacketTooLong(_)) => {}
            x => panic!("{:?}", x),
        }
    }
}
