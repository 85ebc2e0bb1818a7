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
#![allow(dead_code)]

use sshmux::auth::AuthContext;
use sshmux::encoding::{Encoding, Reader};
use sshmux::msg;
use sshmux::server::{Config, Connection, Handler, Protocol};
use sshmux::transport::{ClearTransport, Transport};
use sshmux::{CryptoVec, Error};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

/// The client end of a connection, speaking through a blocking
/// clear transport.
pub struct Client {
    pub transport: ClearTransport,
}

pub type Server<H> = thread::JoinHandle<(Result<(), Error>, H)>;

/// Run a protocol 2.0 server loop in a thread, on one end of a socket
/// pair. The connection is created in the thread, since it owns the
/// SIGCHLD pipe of the process.
pub fn serve<H: Handler + Send + 'static>(config: Config, handler: H) -> (Client, Server<H>) {
    let _ = env_logger::try_init();
    let (a, b) = UnixStream::pair().unwrap();
    let server = thread::spawn(move || {
        let transport = ClearTransport::from_stream(b).unwrap();
        let auth = AuthContext::new("test", 1000);
        let mut connection =
            Connection::new(Arc::new(config), transport, handler, auth, Protocol::V2).unwrap();
        let result = connection.run();
        (result, connection.into_handler())
    });
    let client = Client {
        transport: ClearTransport::from_stream(a).unwrap(),
    };
    (client, server)
}

impl Client {
    /// Send one message, built by `f`.
    pub fn send<F: FnOnce(&mut CryptoVec)>(&mut self, f: F) {
        let mut v = CryptoVec::new();
        f(&mut v);
        self.transport.send(&v);
        self.transport.flush_blocking().unwrap();
    }

    /// The next message.
    pub fn recv(&mut self) -> CryptoVec {
        self.transport.read_packet_blocking().unwrap()
    }

    /// Ask for a channel of type `ctype`, with our id `id`.
    pub fn channel_open(&mut self, ctype: &str, id: u32, window: u32, maxpacket: u32) {
        self.send(|v| {
            v.push(msg::CHANNEL_OPEN);
            v.extend_ssh_string(ctype.as_bytes());
            v.push_u32_be(id);
            v.push_u32_be(window);
            v.push_u32_be(maxpacket);
        })
    }

    /// Open a session channel, and return the server's id for it.
    pub fn open_session(&mut self, window: u32, maxpacket: u32) -> u32 {
        self.channel_open("session", 0, window, maxpacket);
        let m = self.recv();
        assert_eq!(m[0], msg::CHANNEL_OPEN_CONFIRMATION);
        let mut r = m.reader(1);
        assert_eq!(r.read_u32().unwrap(), 0);
        r.read_u32().unwrap()
    }

    /// Send a channel request with want-reply set.
    pub fn exec(&mut self, channel: u32, command: &str) {
        self.send(|v| {
            v.push(msg::CHANNEL_REQUEST);
            v.push_u32_be(channel);
            v.extend_ssh_string(b"exec");
            v.push_ssh_bool(true);
            v.extend_ssh_string(command.as_bytes());
        })
    }

    pub fn window_adjust(&mut self, channel: u32, adjust: u32) {
        self.send(|v| {
            v.push(msg::CHANNEL_WINDOW_ADJUST);
            v.push_u32_be(channel);
            v.push_u32_be(adjust);
        })
    }

    pub fn eof(&mut self, channel: u32) {
        self.send(|v| {
            v.push(msg::CHANNEL_EOF);
            v.push_u32_be(channel);
        })
    }

    pub fn close(&mut self, channel: u32) {
        self.send(|v| {
            v.push(msg::CHANNEL_CLOSE);
            v.push_u32_be(channel);
        })
    }
}
