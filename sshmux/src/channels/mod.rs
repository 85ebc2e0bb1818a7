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
use crate::buffer::Buffer;
use crate::server::ExitStatus;
use crate::ChannelId;

/// Descriptors attached to channels, listeners and non-blocking connects.
pub mod forward;
/// Handlers of channel messages received from the peer.
pub mod input;
/// Per-channel descriptor handling around the wait.
pub mod io;
/// The half-close state machine.
pub mod nchan;
/// The channel table.
pub mod table;
/// Flow control.
pub mod window;

pub use self::forward::ListenSocket;
pub use self::io::Io;
pub use self::table::ChannelTable;
pub use self::window::Window;

/// Default maximal packet size of session channels.
pub const CHAN_SES_PACKET_DEFAULT: u32 = 32 * 1024;
/// Default window of session channels.
pub const CHAN_SES_WINDOW_DEFAULT: u32 = 4 * CHAN_SES_PACKET_DEFAULT;
/// Default maximal packet size of TCP forwarding channels.
pub const CHAN_TCP_PACKET_DEFAULT: u32 = 32 * 1024;
/// Default window of TCP forwarding channels.
pub const CHAN_TCP_WINDOW_DEFAULT: u32 = 4 * CHAN_TCP_PACKET_DEFAULT;
/// Default maximal packet size of X11 channels.
pub const CHAN_X11_PACKET_DEFAULT: u32 = 16 * 1024;
/// Default window of X11 channels.
pub const CHAN_X11_WINDOW_DEFAULT: u32 = 4 * CHAN_X11_PACKET_DEFAULT;

/// The protocol spoken on the connection. Version 1.3 and 1.5 peers
/// have a different close handshake, and no flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Protocol 1.3: one CLOSE and one CLOSE_CONFIRMATION per channel.
    Legacy13,
    /// Protocol 1.5: CLOSE and CLOSE_CONFIRMATION act as input EOF and
    /// output close.
    Legacy15,
    /// Protocol 2.0.
    V2,
}

impl Protocol {
    /// Whether this is protocol 2.0.
    pub fn is_v2(&self) -> bool {
        *self == Protocol::V2
    }
    /// Whether this is protocol 1.3.
    pub fn is_13(&self) -> bool {
        *self == Protocol::Legacy13
    }
}

/// What kind of channel this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// An interactive or exec session.
    Session,
    /// A listening X11 display.
    X11Listener,
    /// A local port forward listener.
    PortListener,
    /// A remote (`tcpip-forward`) listener.
    RportListener,
    /// A connection opened at the peer's request (`direct-tcpip`).
    DirectTcpip,
    /// A connection accepted on a remote forward listener.
    ForwardedTcpip,
    /// A connection accepted on the X11 listener.
    X11,
    /// A listening authentication agent socket.
    AuthSocket,
    /// A connection accepted on the agent socket.
    AuthAgent,
}

impl ChannelKind {
    /// Whether channels of this kind own a listening socket.
    pub fn is_listener(&self) -> bool {
        match *self {
            ChannelKind::X11Listener
            | ChannelKind::PortListener
            | ChannelKind::RportListener
            | ChannelKind::AuthSocket => true,
            _ => false,
        }
    }

    /// Type of the channels opened for connections accepted on a
    /// listener of this kind.
    pub fn accepted(&self) -> Option<(ChannelKind, &'static str)> {
        match *self {
            ChannelKind::X11Listener => Some((ChannelKind::X11, "x11")),
            ChannelKind::PortListener => Some((ChannelKind::DirectTcpip, "direct-tcpip")),
            ChannelKind::RportListener => Some((ChannelKind::ForwardedTcpip, "forwarded-tcpip")),
            ChannelKind::AuthSocket => Some((ChannelKind::AuthAgent, "auth-agent@openssh.com")),
            _ => None,
        }
    }
}

/// Lifecycle of a channel as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Accepted from the peer, not yet attached to descriptors.
    Larval,
    /// We sent an open request, waiting for the confirmation.
    Opening,
    /// Waiting for a non-blocking connect to complete.
    Connecting,
    /// Open (or listening, for listeners).
    Open,
    /// Protocol 1.3: waiting for our input to drain before closing.
    InputDraining,
    /// Protocol 1.3: waiting for our output to drain before freeing.
    OutputDraining,
    /// Protocol 1.3: CLOSE sent, waiting for the confirmation.
    Closed,
    /// Dead, to be freed by the garbage collector.
    Zombie,
}

impl ChannelState {
    /// Numeric code of the state, as shown in the list of open
    /// connections.
    pub fn code(&self) -> u32 {
        match *self {
            ChannelState::Opening => 3,
            ChannelState::Open => 4,
            ChannelState::Closed => 5,
            ChannelState::InputDraining => 8,
            ChannelState::OutputDraining => 9,
            ChannelState::Larval => 10,
            ChannelState::Connecting => 12,
            ChannelState::Zombie => 14,
        }
    }
}

/// State of the receive half (local descriptor to peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum InputState {
    Open,
    WaitDrain,
    WaitOclose,
    Closed,
}

/// State of the transmit half (peer to local descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum OutputState {
    Open,
    WaitDrain,
    WaitIeof,
    Closed,
}

impl InputState {
    fn code(&self) -> u32 {
        *self as u32
    }
}

impl OutputState {
    fn code(&self) -> u32 {
        *self as u32
    }
}

bitflags! {
    /// Progress of the EOF and CLOSE handshake.
    pub struct CloseFlags: u8 {
        /// We sent CLOSE.
        const CLOSE_SENT = 0x01;
        /// We received CLOSE.
        const CLOSE_RCVD = 0x02;
        /// We sent EOF.
        const EOF_SENT = 0x04;
        /// We received EOF.
        const EOF_RCVD = 0x08;
    }
}

/// What the extended (stderr) descriptor is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedUsage {
    /// Not used.
    Ignore,
    /// Read locally, sent as extended data (a session's stderr).
    Read,
    /// Extended data received from the peer is written to it.
    Write,
}

/// Verdict of an input filter on data read from the local descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// The data was accepted (and possibly consumed by the filter).
    Accept,
    /// Treat the read side as failed.
    Reject,
}

/// Called when the peer confirms (`true`) or refuses (`false`) the
/// opening of a channel we requested.
pub type ConfirmHook = Box<dyn FnOnce(ChannelId, bool)>;

/// Called on data read from the local descriptor, before it is sent.
pub type InputFilter = Box<dyn FnMut(&[u8], &mut Buffer) -> Filter>;

/// What to do when a channel is about to be freed.
pub enum Cleanup {
    /// Hand the channel back to the session collaborator
    /// (`Handler::close_by_channel`), which may delay the free while
    /// the session's process is running.
    Session,
    /// Call a function.
    Callback(Box<dyn FnOnce(ChannelId)>),
}

impl std::fmt::Debug for Cleanup {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match *self {
            Cleanup::Session => fmt.write_str("Session"),
            Cleanup::Callback(_) => fmt.write_str("Callback"),
        }
    }
}

/// A channel.
pub struct Channel {
    /// Our identifier.
    pub id: ChannelId,
    /// The peer's identifier, known once the open is confirmed.
    pub remote_id: Option<u32>,
    /// Kind of the channel.
    pub kind: ChannelKind,
    /// Lifecycle state.
    pub state: ChannelState,
    /// Receive half.
    pub istate: InputState,
    /// Transmit half.
    pub ostate: OutputState,
    /// Close handshake.
    pub flags: CloseFlags,
    /// Attached descriptors.
    pub io: Io,
    /// The write descriptor is a terminal.
    pub is_tty: bool,
    /// Use of the extended descriptor.
    pub extended_usage: ExtendedUsage,
    /// Read from the local descriptor, to be sent to the peer.
    pub input: Buffer,
    /// Received from the peer, to be written to the local descriptor.
    pub output: Buffer,
    /// Extended data, in the direction given by `extended_usage`.
    pub extended: Buffer,
    /// Flow control.
    pub window: Window,
    /// Wire type of the channel, such as "session".
    pub ctype: String,
    /// Human readable description.
    pub remote_name: String,
    /// Listen address or forwarding target host.
    pub path: Option<String>,
    /// Port of a listener.
    pub listening_port: u16,
    /// Target port of a forward.
    pub host_port: u16,
    /// Close a listener after its first connection.
    pub single_connection: bool,
    /// Close the input half as soon as the peer sends EOF.
    pub force_drain: bool,
    /// Exit status of the session's process, sent once output is drained.
    pub pending_exit: Option<ExitStatus>,
    /// Open confirmation hook.
    pub on_confirm: Option<ConfirmHook>,
    /// Free hook.
    pub cleanup: Option<Cleanup>,
    /// Filter on input data.
    pub input_filter: Option<InputFilter>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.debug_struct("Channel")
            .field("id", &self.id)
            .field("remote_id", &self.remote_id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("istate", &self.istate)
            .field("ostate", &self.ostate)
            .field("flags", &self.flags)
            .field("io", &self.io)
            .field("window", &self.window)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        kind: ChannelKind,
        state: ChannelState,
        io: Io,
        window: u32,
        maxpacket: u32,
        remote_name: &str,
    ) -> Self {
        Channel {
            id,
            remote_id: None,
            kind,
            state,
            istate: InputState::Open,
            ostate: OutputState::Open,
            flags: CloseFlags::empty(),
            io,
            is_tty: false,
            extended_usage: ExtendedUsage::Ignore,
            input: Buffer::new(),
            output: Buffer::new(),
            extended: Buffer::new(),
            window: Window::new(window, maxpacket),
            ctype: String::new(),
            remote_name: remote_name.to_string(),
            path: None,
            listening_port: 0,
            host_port: 0,
            single_connection: false,
            force_drain: false,
            pending_exit: None,
            on_confirm: None,
            cleanup: None,
            input_filter: None,
        }
    }

    /// Whether the extended descriptor still produces data to send.
    pub fn efd_input_active(&self, proto: Protocol) -> bool {
        proto.is_v2()
            && self.extended_usage == ExtendedUsage::Read
            && (self.io.efd().is_some() || !self.extended.is_empty())
    }

    /// Whether the extended descriptor still expects data from the peer.
    pub fn efd_output_active(&self, proto: Protocol) -> bool {
        proto.is_v2()
            && self.extended_usage == ExtendedUsage::Write
            && ((self.io.efd().is_some()
                && !self
                    .flags
                    .intersects(CloseFlags::EOF_RCVD | CloseFlags::CLOSE_RCVD))
                || !self.extended.is_empty())
    }

    /// One line of the list of open connections.
    pub fn describe(&self) -> String {
        format!(
            "  #{} {} (t{} r{} i{}/{} o{}/{} fd {}/{})\r\n",
            self.id,
            self.remote_name.chars().take(300).collect::<String>(),
            self.state.code(),
            self.remote_id.map(|r| r as i64).unwrap_or(-1),
            self.istate.code(),
            self.input.len(),
            self.ostate.code(),
            self.output.len(),
            self.io.rfd().unwrap_or(-1),
            self.io.wfd().unwrap_or(-1),
        )
    }
}
