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

#![deny(unstable_features,
        unused_import_braces)]
#![warn(missing_docs)]

//! The connection layer of an SSH server: channels, flow control,
//! message dispatch, and the single-threaded loop that moves bytes
//! between local file descriptors and the transport.
//!
//! A server process that has finished key exchange and user
//! authentication hands its transport to a
//! [`server::Connection`](server/struct.Connection.html), together
//! with a [`server::Handler`](server/trait.Handler.html) that knows how
//! to start sessions (allocate ptys, exec shells). The connection then
//! runs until the client goes away:
//!
//! ```no_run
//! extern crate sshmux;
//! use std::sync::Arc;
//! use sshmux::auth::AuthContext;
//! use sshmux::server::{self, Connection, Handler, Protocol};
//! use sshmux::transport::ClearTransport;
//!
//! struct Sessions;
//! impl Handler for Sessions {}
//!
//! fn main() {
//!     let (stream, _) = std::net::TcpListener::bind("127.0.0.1:2222")
//!         .unwrap()
//!         .accept()
//!         .unwrap();
//!     let transport = ClearTransport::from_stream(stream).unwrap();
//!     let auth = AuthContext::new("pe", 1000);
//!     let config = Arc::new(server::Config::default());
//!     let mut connection =
//!         Connection::new(config, transport, Sessions, auth, Protocol::V2).unwrap();
//!     connection.run().unwrap();
//! }
//! ```
//!
//! # Channels
//!
//! Each channel has two independent halves. The *input* half carries
//! bytes read from a local descriptor to the peer, the *output* half
//! carries bytes received from the peer to a local descriptor. Each
//! half is closed on its own (EOF, write error, peer close), and a
//! channel is only freed once both halves are closed and the CLOSE
//! handshake has completed in both directions.
//!
//! # Flow control
//!
//! Every channel has a window in each direction. Data is only sent to
//! the peer within the window it granted us, and data received beyond
//! the window we granted is a protocol violation. Window adjustments
//! are sent back once half of the local window has been consumed by
//! the local descriptor, so a slow local reader slows the peer down
//! without blocking other channels.
//!
//! # Internal details of the event loop
//!
//! Exactly one `poll(2)` call is outstanding at any time. Before each
//! call, every channel says which of its descriptors it wants to read
//! or write; the transport and a self-pipe written by the SIGCHLD
//! handler are added to the same set. After the call, incoming
//! messages are dispatched, channel descriptors are serviced, and the
//! buffered outgoing messages are handed to the transport.
#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate log;
extern crate byteorder;
extern crate cryptovec;
extern crate libc;
extern crate socket2;

pub use cryptovec::CryptoVec;

macro_rules! push_packet {
    ( $buffer:expr, $x:expr ) => {
        {
            use byteorder::{BigEndian, ByteOrder};
            let i0 = $buffer.len();
            $buffer.extend(b"\0\0\0\0");
            let x = $x;
            let i1 = $buffer.len();
            use std::ops::DerefMut;
            let buf = $buffer.deref_mut();
            BigEndian::write_u32(&mut buf[i0..], (i1-i0-4) as u32);
            x
        }
    };
}

/// Authentication context handed over by the authentication layer.
pub mod auth;
/// Byte queues used to stage channel and transport I/O.
pub mod buffer;
/// Encoding and decoding of SSH wire fields.
pub mod encoding;
/// Owned file descriptors and the readiness set.
pub mod fd;
/// Message numbers.
pub mod msg;
/// The SIGCHLD self-pipe.
pub mod notify;
/// The transport collaborator.
pub mod transport;

/// Channels, their state machine and their flow control.
pub mod channels;

/// Server side of this library.
pub mod server;

#[derive(Debug)]
/// Errors.
pub enum Error {
    /// The message is not valid in the current state of the channel
    /// or connection.
    Inconsistent,

    /// No handler is registered for this message number.
    UnknownMessage(u8),

    /// Index out of bounds (a field extends past the end of the message).
    IndexOutOfBounds,

    /// Bytes remain after the last field of a message.
    TrailingData(usize),

    /// A packet announced a length above what we accept.
    PacketTooLong(usize),

    /// UTF-8 decoding error (most probably ASCII error).
    Utf8(std::str::Utf8Error),

    /// Message received for a channel that does not exist.
    WrongChannel(u32),

    /// The peer sent more data than the window we granted it.
    WindowExceeded {
        /// Local channel number.
        channel: u32,
        /// Length of the offending payload.
        len: u32,
        /// Window that was available.
        window: u32,
    },

    /// A window adjustment overflowed the 32-bit window.
    WindowOverflow(u32),

    /// I/O error.
    IO(std::io::Error),

    /// The peer sent a disconnect message.
    Disconnect,

    /// Connection closed by the remote side.
    HUP,

    /// The peer did not answer enough keepalive requests.
    ConnectionTimeout,

    /// A keepalive fired after all channels were closed.
    NoOpenChannels,

    /// The session's child process was killed by a signal.
    ChildSignaled(i32),
}

impl Error {
    /// Whether this error means the peer violated the protocol, in
    /// which case the connection is closed with a `ProtocolError`
    /// disconnect message.
    pub fn is_protocol_violation(&self) -> bool {
        match *self {
            Error::Inconsistent
            | Error::UnknownMessage(_)
            | Error::IndexOutOfBounds
            | Error::TrailingData(_)
            | Error::PacketTooLong(_)
            | Error::Utf8(_)
            | Error::WrongChannel(_)
            | Error::WindowExceeded { .. }
            | Error::WindowOverflow(_) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::Inconsistent => write!(f, "Unexpected message"),
            Error::UnknownMessage(m) => write!(f, "Unknown message type {}", m),
            Error::IndexOutOfBounds => write!(f, "Index out of bounds in a packet"),
            Error::TrailingData(n) => write!(f, "Packet integrity error: {} bytes left", n),
            Error::PacketTooLong(n) => write!(f, "Packet too long: {} bytes", n),
            Error::Utf8(ref e) => e.fmt(f),
            Error::WrongChannel(c) => write!(f, "Inexistent channel {}", c),
            Error::WindowExceeded { channel, len, window } => write!(
                f,
                "channel {}: rcvd too much data {}, win {}",
                channel, len, window
            ),
            Error::WindowOverflow(c) => write!(f, "channel {}: window adjust overflow", c),
            Error::IO(ref e) => e.fmt(f),
            Error::Disconnect => write!(f, "Disconnected"),
            Error::HUP => write!(f, "Connection closed by the remote side"),
            Error::ConnectionTimeout => write!(f, "Timeout, your session not responding."),
            Error::NoOpenChannels => write!(f, "No open channels after timeout!"),
            Error::ChildSignaled(s) => write!(f, "Command terminated on signal {}.", s),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Utf8(ref e) => Some(e),
            Error::IO(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::IO(e)
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Error {
        Error::Utf8(e)
    }
}

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    #[doc(hidden)]
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig<'a> {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(&'a str),
}

impl<'a> Sig<'a> {
    /// The name of this signal on the wire (without the `SIG` prefix).
    pub fn name(&self) -> &'a str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(c) => c,
        }
    }

    /// Map a local signal number to its wire name. Signals without a
    /// standard name are reported as `Custom("SIG<n>@openssh.com")`-style
    /// names by the caller; here they map to `None`.
    pub fn from_signal(signal: i32) -> Option<Sig<'static>> {
        match signal {
            libc::SIGABRT => Some(Sig::ABRT),
            libc::SIGALRM => Some(Sig::ALRM),
            libc::SIGFPE => Some(Sig::FPE),
            libc::SIGHUP => Some(Sig::HUP),
            libc::SIGILL => Some(Sig::ILL),
            libc::SIGINT => Some(Sig::INT),
            libc::SIGKILL => Some(Sig::KILL),
            libc::SIGPIPE => Some(Sig::PIPE),
            libc::SIGQUIT => Some(Sig::QUIT),
            libc::SIGSEGV => Some(Sig::SEGV),
            libc::SIGTERM => Some(Sig::TERM),
            libc::SIGUSR1 => Some(Sig::USR1),
            _ => None,
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl ChannelOpenFailure {
    /// Decode a reason code received in an open failure message.
    pub fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }

    /// Human-readable description of the reason.
    pub fn as_str(&self) -> &'static str {
        match *self {
            ChannelOpenFailure::AdministrativelyProhibited => "administratively prohibited",
            ChannelOpenFailure::ConnectFailed => "connect failed",
            ChannelOpenFailure::UnknownChannelType => "unknown channel type",
            ChannelOpenFailure::ResourceShortage => "resource shortage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// The identifier of a channel, as allocated by this side.
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
