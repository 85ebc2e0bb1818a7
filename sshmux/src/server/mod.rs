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
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthContext;
use crate::channels::{ChannelTable, CHAN_SES_WINDOW_DEFAULT};
use crate::encoding::Position;
use crate::fd::PollSet;
use crate::notify::Notify;
use crate::transport::Transport;
use crate::{ChannelId, Error};

mod dispatch;
mod requests;
mod serverloop;
mod session;

pub use self::dispatch::{Dispatcher, MessageHandler};
pub use self::session::Session;
pub use crate::channels::Protocol;

use self::serverloop::Legacy;

#[derive(Debug, Clone)]
/// Configuration of the connection layer.
pub struct Config {
    /// The window granted on session channels, once their program
    /// runs.
    pub window_size: u32,
    /// The maximal size of a single data packet.
    pub maximum_packet_size: u32,
    /// If set, send a keepalive request on an open channel after this
    /// much time without any message from the client.
    pub client_alive_interval: Option<Duration>,
    /// Number of unanswered keepalive requests before the client is
    /// disconnected.
    pub client_alive_count_max: u32,
    /// Whether clients may open `direct-tcpip` channels and request
    /// remote forwards.
    pub allow_tcp_forwarding: bool,
    /// Whether remote forwards listen on all interfaces, instead of the
    /// loopback interface only.
    pub gateway_ports: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            window_size: CHAN_SES_WINDOW_DEFAULT,
            maximum_packet_size: 32768,
            client_alive_interval: None,
            client_alive_count_max: 3,
            allow_tcp_forwarding: true,
            gateway_ports: false,
        }
    }
}

/// How a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit, with its status code.
    Exited(u32),
    /// Killed by a signal.
    Signaled {
        /// The signal number.
        signal: i32,
        /// Whether a core was dumped.
        core_dumped: bool,
    },
}

impl ExitStatus {
    /// Decode a status returned by `waitpid`. Stopped and continued
    /// children are not terminated, and yield `None`.
    pub fn from_raw(status: libc::c_int) -> Option<Self> {
        if libc::WIFEXITED(status) {
            Some(ExitStatus::Exited(libc::WEXITSTATUS(status) as u32))
        } else if libc::WIFSIGNALED(status) {
            Some(ExitStatus::Signaled {
                signal: libc::WTERMSIG(status),
                core_dumped: libc::WCOREDUMP(status),
            })
        } else {
            None
        }
    }
}

/// The session collaborator: starts sessions, and knows which process
/// runs in which channel. Every method has a default implementation
/// refusing the request.
#[allow(unused_variables)]
pub trait Handler {
    /// The client asks to open a session channel. Returning `false`
    /// refuses it.
    fn open(&mut self, auth: &AuthContext, id: ChannelId) -> bool {
        false
    }

    /// A channel request ("pty-req", "shell", "exec", "window-change",
    /// ...) on channel `id`. The fields following the request name and
    /// the want-reply flag are read from `request`.
    ///
    /// Starting a program is done by attaching its descriptors with
    /// [`ChannelTable::set_fds`](../channels/table/struct.ChannelTable.html#method.set_fds).
    /// Returns whether the request succeeded.
    fn channel_request(
        &mut self,
        channels: &mut ChannelTable,
        session: &mut Session,
        id: ChannelId,
        name: &str,
        request: &mut Position,
    ) -> Result<bool, Error> {
        Ok(false)
    }

    /// Channel `id` is about to be freed. Returning `false` delays the
    /// free, for instance while the session's process is still
    /// running.
    fn close_by_channel(&mut self, id: ChannelId) -> bool {
        true
    }

    /// Child `pid` terminated. Returns the channel its exit status
    /// must be reported on, if any.
    fn close_by_pid(&mut self, pid: libc::pid_t, status: ExitStatus) -> Option<ChannelId> {
        None
    }

    /// Protocol 1: the client's terminal was resized.
    fn window_change(&mut self, row: u32, col: u32, xpixel: u32, ypixel: u32) {}
}

/// The connection layer of one client connection, after
/// authentication.
pub struct Connection<T: Transport, H: Handler> {
    pub(crate) config: Arc<Config>,
    pub(crate) transport: T,
    pub(crate) handler: H,
    pub(crate) auth: AuthContext,
    pub(crate) channels: ChannelTable,
    pub(crate) session: Session,
    pub(crate) dispatch: Dispatcher<T, H>,
    pub(crate) notify: Notify,
    pub(crate) poll: PollSet,
    /// Unanswered keepalive requests.
    pub(crate) client_alive_timeouts: u32,
    /// Whether a channel was ever open when a keepalive fired.
    pub(crate) had_channel: bool,
    pub(crate) connection_closed: bool,
    pub(crate) legacy: Legacy,
}

impl<T: Transport, H: Handler> std::fmt::Debug for Connection<T, H> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        fmt.debug_struct("Connection")
            .field("protocol", &self.session.protocol())
            .field("channels", &self.channels.len())
            .field("client_alive_timeouts", &self.client_alive_timeouts)
            .finish()
    }
}

impl<T: Transport, H: Handler> Connection<T, H> {
    /// Create the connection layer on top of an established
    /// `transport`, speaking `protocol`.
    pub fn new(
        config: Arc<Config>,
        transport: T,
        handler: H,
        auth: AuthContext,
        protocol: Protocol,
    ) -> Result<Self, Error> {
        let session = Session::new(
            config.clone(),
            protocol,
            transport.max_packet_size(),
            transport.is_interactive(),
        );
        let legacy = Legacy::new(transport.is_interactive());
        Ok(Connection {
            config,
            transport,
            handler,
            auth,
            channels: ChannelTable::new(),
            session,
            dispatch: Dispatcher::new(protocol),
            notify: Notify::new()?,
            poll: PollSet::new(),
            client_alive_timeouts: 0,
            had_channel: false,
            connection_closed: false,
            legacy,
        })
    }

    /// The session collaborator.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The session collaborator, mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Give the session collaborator back.
    pub fn into_handler(self) -> H {
        self.handler
    }

    /// The channels of this connection.
    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    /// The authenticated user.
    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// The message table, for collaborators that need to claim
    /// message numbers (such as an interactive authentication device
    /// waiting for responses).
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<T, H> {
        &mut self.dispatch
    }

    /// Whether the client closed the connection.
    pub fn is_closed(&self) -> bool {
        self.connection_closed
    }
}

#[cfg(test)]
pub(crate) fn test_session(protocol: Protocol) -> Session {
    Session::new(Arc::new(Config::default()), protocol, 32768, false)
}
