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
use super::Config;
use crate::channels::{Channel, Protocol};
use crate::encoding::Encoding;
use crate::transport::Transport;
use crate::{msg, ChannelOpenFailure, Disconnect, Sig};
use byteorder::{BigEndian, ByteOrder};
use cryptovec::CryptoVec;
use std::sync::Arc;

/// The outgoing side of a connection. Messages are queued here by
/// the channel code and the message handlers, and handed to the
/// transport in order by `flush`.
pub struct Session {
    write: CryptoVec,
    protocol: Protocol,
    config: Arc<Config>,
    max_packet_size: usize,
    interactive: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.debug_struct("Session")
            .field("protocol", &self.protocol)
            .field("queued", &self.write.len())
            .finish()
    }
}

macro_rules! remote_id {
    ($c:expr, $what:expr) => {
        match $c.remote_id {
            Some(id) => id,
            None => {
                debug!("channel {}: {}: no remote id", $c.id, $what);
                return;
            }
        }
    };
}

impl Session {
    /// A session speaking `protocol`, on a transport whose packets
    /// carry at most `max_packet_size` bytes of payload.
    pub fn new(config: Arc<Config>, protocol: Protocol, max_packet_size: usize, interactive: bool) -> Self {
        Session {
            write: CryptoVec::new(),
            protocol,
            config,
            max_packet_size,
            interactive,
        }
    }

    /// The protocol spoken on this connection.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Retrieves the configuration of this session.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Maximal payload size of a transport packet.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Whether a terminal was allocated (legacy sessions send smaller
    /// packets then).
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Whether messages are waiting to be handed to the transport.
    pub fn is_empty(&self) -> bool {
        self.write.len() == 0
    }

    /// Hand all queued messages to the transport.
    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        {
            let buf: &[u8] = &self.write;
            let mut i = 0;
            while i + 4 <= buf.len() {
                let len = BigEndian::read_u32(&buf[i..]) as usize;
                transport.send(&buf[i + 4..i + 4 + len]);
                i += 4 + len
            }
        }
        self.write.clear()
    }

    #[cfg(test)]
    pub(crate) fn drain_messages(&mut self) -> Vec<Vec<u8>> {
        let mut v = Vec::new();
        {
            let buf: &[u8] = &self.write;
            let mut i = 0;
            while i + 4 <= buf.len() {
                let len = BigEndian::read_u32(&buf[i..]) as usize;
                v.push(buf[i + 4..i + 4 + len].to_vec());
                i += 4 + len
            }
        }
        self.write.clear();
        v
    }

    /// Sends a disconnect message.
    pub fn disconnect(&mut self, reason: Disconnect, description: &str, language_tag: &str) {
        if self.protocol.is_v2() {
            push_packet!(self.write, {
                self.write.push(msg::DISCONNECT);
                self.write.push_u32_be(reason as u32);
                self.write.extend_ssh_string(description.as_bytes());
                self.write.extend_ssh_string(language_tag.as_bytes());
            })
        } else {
            push_packet!(self.write, {
                self.write.push(msg::ssh1::DISCONNECT);
                self.write.extend_ssh_string(description.as_bytes());
            })
        }
    }

    /// Send a debug message, displayed by clients in verbose mode.
    pub fn debug(&mut self, message: &str) {
        if self.protocol.is_v2() {
            push_packet!(self.write, {
                self.write.push(msg::DEBUG);
                self.write.push_ssh_bool(false);
                self.write.extend_ssh_string(message.as_bytes());
                self.write.extend_ssh_string(b"");
            })
        } else {
            push_packet!(self.write, {
                self.write.push(msg::ssh1::DEBUG);
                self.write.extend_ssh_string(message.as_bytes());
            })
        }
    }

    /// Send an ignore message with `len` bytes of payload.
    pub fn ignore(&mut self, len: usize) {
        let ignore = if self.protocol.is_v2() {
            msg::IGNORE
        } else {
            msg::ssh1::IGNORE
        };
        push_packet!(self.write, {
            self.write.push(ignore);
            self.write.push_u32_be(len as u32);
            let i0 = self.write.len();
            self.write.resize(i0 + len);
        })
    }

    /// Send a "success" reply to a global request.
    pub fn request_success(&mut self) {
        push_packet!(self.write, self.write.push(msg::REQUEST_SUCCESS))
    }

    /// Send a "success" reply to a `tcpip-forward` request that asked
    /// for port 0, with the port actually bound.
    pub fn request_success_port(&mut self, port: u16) {
        push_packet!(self.write, {
            self.write.push(msg::REQUEST_SUCCESS);
            self.write.push_u32_be(port as u32);
        })
    }

    /// Send a "failure" reply to a global request.
    pub fn request_failure(&mut self) {
        push_packet!(self.write, self.write.push(msg::REQUEST_FAILURE))
    }

    /// Send a "success" reply to a channel request.
    pub fn channel_success(&mut self, c: &Channel) {
        let remote = remote_id!(c, "channel success");
        push_packet!(self.write, {
            self.write.push(msg::CHANNEL_SUCCESS);
            self.write.push_u32_be(remote);
        })
    }

    /// Send a "failure" reply to a channel request.
    pub fn channel_failure(&mut self, c: &Channel) {
        let remote = remote_id!(c, "channel failure");
        push_packet!(self.write, {
            self.write.push(msg::CHANNEL_FAILURE);
            self.write.push_u32_be(remote);
        })
    }

    /// Confirm the opening of a channel requested by the peer.
    pub fn channel_open_confirmation(&mut self, c: &Channel) {
        let remote = remote_id!(c, "open confirmation");
        if self.protocol.is_v2() {
            push_packet!(self.write, {
                self.write.push(msg::CHANNEL_OPEN_CONFIRMATION);
                self.write.push_u32_be(remote);
                self.write.push_u32_be(c.id.0);
                self.write.push_u32_be(c.window.local_window);
                self.write.push_u32_be(c.window.local_maxpacket);
            })
        } else {
            push_packet!(self.write, {
                self.write.push(msg::ssh1::CHANNEL_OPEN_CONFIRMATION);
                self.write.push_u32_be(remote);
                self.write.push_u32_be(c.id.0);
            })
        }
    }

    /// Refuse to open the peer's channel `remote`.
    pub fn channel_open_failure(
        &mut self,
        remote: u32,
        reason: ChannelOpenFailure,
        description: &str,
        language: &str,
    ) {
        if self.protocol.is_v2() {
            push_packet!(self.write, {
                self.write.push(msg::CHANNEL_OPEN_FAILURE);
                self.write.push_u32_be(remote);
                self.write.push_u32_be(reason as u32);
                self.write.extend_ssh_string(description.as_bytes());
                self.write.extend_ssh_string(language.as_bytes());
            })
        } else {
            push_packet!(self.write, {
                self.write.push(msg::ssh1::CHANNEL_OPEN_FAILURE);
                self.write.push_u32_be(remote);
            })
        }
    }

    fn channel_open_header(&mut self, c: &Channel) {
        self.write.push(msg::CHANNEL_OPEN);
        self.write.extend_ssh_string(c.ctype.as_bytes());
        self.write.push_u32_be(c.id.0);
        self.write.push_u32_be(c.window.local_window);
        self.write.push_u32_be(c.window.local_maxpacket);
    }

    /// Ask the peer to open a TCP/IP channel (`c.ctype` is
    /// "forwarded-tcpip" or "direct-tcpip"), for a connection accepted
    /// on a listener. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-7).
    pub fn channel_open_tcpip(
        &mut self,
        c: &Channel,
        address: &str,
        port: u32,
        originator_address: &str,
        originator_port: u32,
    ) {
        if self.protocol.is_v2() {
            push_packet!(self.write, {
                self.channel_open_header(c);
                self.write.extend_ssh_string(address.as_bytes());
                self.write.push_u32_be(port);
                self.write.extend_ssh_string(originator_address.as_bytes());
                self.write.push_u32_be(originator_port);
            })
        } else {
            push_packet!(self.write, {
                self.write.push(msg::ssh1::PORT_OPEN);
                self.write.push_u32_be(c.id.0);
                self.write.extend_ssh_string(address.as_bytes());
                self.write.push_u32_be(port);
            })
        }
    }

    /// Ask the peer to open an X11 channel.
    pub fn channel_open_x11(&mut self, c: &Channel, originator_address: &str, originator_port: u32) {
        if self.protocol.is_v2() {
            push_packet!(self.write, {
                self.channel_open_header(c);
                self.write.extend_ssh_string(originator_address.as_bytes());
                self.write.push_u32_be(originator_port);
            })
        } else {
            push_packet!(self.write, {
                self.write.push(msg::ssh1::SMSG_X11_OPEN);
                self.write.push_u32_be(c.id.0);
            })
        }
    }

    /// Ask the peer to open an agent channel.
    pub fn channel_open_agent(&mut self, c: &Channel) {
        if self.protocol.is_v2() {
            push_packet!(self.write, self.channel_open_header(c))
        } else {
            push_packet!(self.write, {
                self.write.push(msg::ssh1::SMSG_AGENT_OPEN);
                self.write.push_u32_be(c.id.0);
            })
        }
    }

    /// Send data to a channel.
    pub fn data(&mut self, c: &Channel, data: &[u8]) {
        let remote = remote_id!(c, "data");
        let m = if self.protocol.is_v2() {
            msg::CHANNEL_DATA
        } else {
            msg::ssh1::CHANNEL_DATA
        };
        push_packet!(self.write, {
            self.write.push(m);
            self.write.push_u32_be(remote);
            self.write.extend_ssh_string(data);
        })
    }

    /// Send extended data (`code` 1 is stderr) to a channel.
    pub fn extended_data(&mut self, c: &Channel, code: u32, data: &[u8]) {
        let remote = remote_id!(c, "extended data");
        push_packet!(self.write, {
            self.write.push(msg::CHANNEL_EXTENDED_DATA);
            self.write.push_u32_be(remote);
            self.write.push_u32_be(code);
            self.write.extend_ssh_string(data);
        })
    }

    /// Send EOF to a channel.
    pub fn eof(&mut self, c: &Channel) {
        let remote = remote_id!(c, "eof");
        push_packet!(self.write, {
            self.write.push(msg::CHANNEL_EOF);
            self.write.push_u32_be(remote);
        })
    }

    /// Close a channel. In protocol 1, this is also the input EOF.
    pub fn close(&mut self, c: &Channel) {
        let remote = remote_id!(c, "close");
        let m = if self.protocol.is_v2() {
            msg::CHANNEL_CLOSE
        } else {
            msg::ssh1::CHANNEL_CLOSE
        };
        push_packet!(self.write, {
            self.write.push(m);
            self.write.push_u32_be(remote);
        })
    }

    /// Protocol 1 only: confirm a close (1.3), or close the output (1.5).
    pub fn close_confirmation(&mut self, c: &Channel) {
        let remote = remote_id!(c, "close confirmation");
        push_packet!(self.write, {
            self.write.push(msg::ssh1::CHANNEL_CLOSE_CONFIRMATION);
            self.write.push_u32_be(remote);
        })
    }

    /// Grant `adjust` more bytes to the peer.
    pub fn window_adjust(&mut self, c: &Channel, adjust: u32) {
        let remote = remote_id!(c, "window adjust");
        push_packet!(self.write, {
            self.write.push(msg::CHANNEL_WINDOW_ADJUST);
            self.write.push_u32_be(remote);
            self.write.push_u32_be(adjust);
        })
    }

    fn channel_request_header(&mut self, remote: u32, name: &[u8], want_reply: bool) {
        self.write.push(msg::CHANNEL_REQUEST);
        self.write.push_u32_be(remote);
        self.write.extend_ssh_string(name);
        self.write.push_ssh_bool(want_reply);
    }

    /// Send the exit status of a program.
    pub fn exit_status_request(&mut self, c: &Channel, exit_status: u32) {
        let remote = remote_id!(c, "exit-status");
        push_packet!(self.write, {
            self.channel_request_header(remote, b"exit-status", false);
            self.write.push_u32_be(exit_status)
        })
    }

    /// If the program was killed by a signal, send the details about the signal to the client.
    pub fn exit_signal_request(
        &mut self,
        c: &Channel,
        signal: Sig,
        core_dumped: bool,
        error_message: &str,
        language_tag: &str,
    ) {
        let remote = remote_id!(c, "exit-signal");
        push_packet!(self.write, {
            self.channel_request_header(remote, b"exit-signal", false);
            self.write.extend_ssh_string(signal.name().as_bytes());
            self.write.push_ssh_bool(core_dumped);
            self.write.extend_ssh_string(error_message.as_bytes());
            self.write.extend_ssh_string(language_tag.as_bytes());
        })
    }

    /// A request the client does not know, to which it must reply
    /// with a failure: proof that it is still alive.
    pub fn keepalive(&mut self, c: &Channel) {
        let remote = remote_id!(c, "keepalive");
        push_packet!(self.write, {
            self.channel_request_header(remote, b"keepalive@openssh.com", true)
        })
    }

    /// Protocol 1: the session's standard output.
    pub fn stdout_data(&mut self, data: &[u8]) {
        push_packet!(self.write, {
            self.write.push(msg::ssh1::SMSG_STDOUT_DATA);
            self.write.extend_ssh_string(data);
        })
    }

    /// Protocol 1: the session's standard error.
    pub fn stderr_data(&mut self, data: &[u8]) {
        push_packet!(self.write, {
            self.write.push(msg::ssh1::SMSG_STDERR_DATA);
            self.write.extend_ssh_string(data);
        })
    }

    /// Protocol 1: the exit status of the session's program.
    pub fn exit_status1(&mut self, status: u32) {
        push_packet!(self.write, {
            self.write.push(msg::ssh1::SMSG_EXITSTATUS);
            self.write.push_u32_be(status);
        })
    }
}
