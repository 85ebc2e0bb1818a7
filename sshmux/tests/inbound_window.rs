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
extern crate sshmux;

mod common;

use sshmux::auth::AuthContext;
use sshmux::channels::{ChannelTable, ExtendedUsage};
use sshmux::encoding::{Encoding, Position, Reader};
use sshmux::fd::Fd;
use sshmux::msg;
use sshmux::server::{Config, Handler, Session};
use sshmux::{ChannelId, Disconnect, Error};
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::thread;

const WINDOW: u32 = 1000;
const CHUNK: usize = 300;
const TOTAL: usize = 3000;

fn pattern(i: usize) -> u8 {
    (i % 251) as u8
}

fn config() -> Config {
    Config {
        window_size: WINDOW,
        ..Config::default()
    }
}

/// "exec" runs a program that reads everything the client sends,
/// and writes nothing.
#[derive(Default)]
struct Sink {
    reader: Option<thread::JoinHandle<Vec<u8>>>,
}

impl Handler for Sink {
    fn open(&mut self, _: &AuthContext, _: ChannelId) -> bool {
        true
    }

    fn channel_request(
        &mut self,
        channels: &mut ChannelTable,
        session: &mut Session,
        id: ChannelId,
        name: &str,
        request: &mut Position,
    ) -> Result<bool, Error> {
        if name != "exec" {
            return Ok(false);
        }
        request.read_string()?;
        let (stdin, mut program_in) = UnixStream::pair()?;
        let (stdout, program_out) = UnixStream::pair()?;
        channels.set_fds(
            id,
            session,
            Fd::new(stdout),
            Fd::new(stdin),
            Fd::none(),
            ExtendedUsage::Ignore,
        )?;
        self.reader = Some(thread::spawn(move || {
            let mut data = Vec::new();
            program_in.read_to_end(&mut data).unwrap();
            // Exit once the input is closed.
            drop(program_out);
            data
        }));
        Ok(true)
    }
}

/// Open a session, run a program, and return the window granted to
/// the client.
fn start(client: &mut common::Client) -> (u32, u32) {
    let channel = client.open_session(1 << 20, 32768);
    client.exec(channel, "sink");
    let mut window = 0;
    loop {
        let m = client.recv();
        let mut r = m.reader(1);
        match m[0] {
            msg::CHANNEL_WINDOW_ADJUST => {
                assert_eq!(r.read_u32().unwrap(), 0);
                window += r.read_u32().unwrap()
            }
            msg::CHANNEL_SUCCESS => return (channel, window),
            m => panic!("unexpected message {}", m),
        }
    }
}

fn send_data(client: &mut common::Client, channel: u32, data: &[u8]) {
    client.send(|v| {
        v.push(msg::CHANNEL_DATA);
        v.push_u32_be(channel);
        v.extend_ssh_string(data);
    })
}

#[test]
fn data_beyond_window_disconnects() {
    let (mut client, server) = common::serve(config(), Sink::default());
    let (channel, window) = start(&mut client);
    assert_eq!(window, WINDOW);

    send_data(&mut client, channel, &vec![0; WINDOW as usize + 1]);
    let m = client.recv();
    assert_eq!(m[0], msg::DISCONNECT);
    let mut r = m.reader(1);
    assert_eq!(r.read_u32().unwrap(), Disconnect::ProtocolError as u32);

    drop(client);
    let (result, mut handler) = server.join().unwrap();
    match result {
        Err(Error::WindowExceeded {
            channel: 0,
            len,
            window,
        }) => {
            assert_eq!(len, WINDOW + 1);
            assert_eq!(window, WINDOW)
        }
        x => panic!("{:?}", x),
    }
    assert!(handler.reader.take().unwrap().join().unwrap().is_empty());
}

#[test]
fn consumed_data_reopens_window() {
    let (mut client, server) = common::serve(config(), Sink::default());
    let (channel, mut window) = start(&mut client);
    assert_eq!(window, WINDOW);

    let data: Vec<u8> = (0..TOTAL).map(pattern).collect();
    let mut sent = 0;
    let mut adjusts = 0;
    while sent < TOTAL {
        let n = std::cmp::min(CHUNK, TOTAL - sent);
        if n <= window as usize {
            send_data(&mut client, channel, &data[sent..sent + n]);
            window -= n as u32;
            sent += n;
            continue;
        }
        let m = client.recv();
        assert_eq!(m[0], msg::CHANNEL_WINDOW_ADJUST);
        let mut r = m.reader(1);
        assert_eq!(r.read_u32().unwrap(), 0);
        let adjust = r.read_u32().unwrap();
        assert!(adjust > 0);
        window += adjust;
        assert!(window <= WINDOW);
        adjusts += 1;
    }
    assert!(adjusts >= 2);

    client.eof(channel);
    loop {
        let m = client.recv();
        let mut r = m.reader(1);
        match m[0] {
            msg::CHANNEL_WINDOW_ADJUST => {
                r.read_u32().unwrap();
                window += r.read_u32().unwrap();
                assert!(window <= WINDOW);
            }
            msg::CHANNEL_EOF => client.close(channel),
            msg::CHANNEL_CLOSE => break,
            m => panic!("unexpected message {}", m),
        }
    }

    drop(client);
    let (result, mut handler) = server.join().unwrap();
    result.unwrap();
    assert_eq!(handler.reader.take().unwrap().join().unwrap(), data);
}
