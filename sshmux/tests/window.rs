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
use sshmux::encoding::{Position, Reader};
use sshmux::fd::Fd;
use sshmux::msg;
use sshmux::server::{Handler, Session};
use sshmux::{ChannelId, Error};
use std::io::Write;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::thread;

const WINDOW: u32 = 32 * 1024;
const MAXPACKET: u32 = 16 * 1024;
const BURST: usize = 100 * 1024;

fn pattern(i: usize) -> u8 {
    (i % 251) as u8
}

/// "exec" attaches a socket whose other end writes a burst of data.
#[derive(Default)]
struct Burst {
    writer: Option<thread::JoinHandle<()>>,
}

impl Handler for Burst {
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
        let (ours, mut program) = UnixStream::pair()?;
        let rfd = Fd::new(ours.try_clone()?);
        channels.set_fds(
            id,
            session,
            rfd,
            Fd::new(ours),
            Fd::none(),
            ExtendedUsage::Ignore,
        )?;
        self.writer = Some(thread::spawn(move || {
            let data: Vec<u8> = (0..BURST).map(pattern).collect();
            program.write_all(&data).unwrap();
            program.shutdown(Shutdown::Write).unwrap();
        }));
        Ok(true)
    }
}

#[test]
fn burst_within_window() {
    let (mut client, server) = common::serve(Default::default(), Burst::default());
    let channel = client.open_session(WINDOW, MAXPACKET);
    client.exec(channel, "burst");

    let mut received = Vec::new();
    let mut since_adjust = 0;
    let mut adjusts = 0;
    let mut eof = false;
    loop {
        let m = client.recv();
        let mut r = m.reader(1);
        match m[0] {
            msg::CHANNEL_WINDOW_ADJUST | msg::CHANNEL_SUCCESS => {}
            msg::CHANNEL_DATA => {
                assert_eq!(r.read_u32().unwrap(), 0);
                let data = r.read_string().unwrap();
                assert!(data.len() <= MAXPACKET as usize);
                received.extend_from_slice(data);
                since_adjust += data.len();
                assert!(since_adjust <= WINDOW as usize);
                if since_adjust == WINDOW as usize {
                    client.window_adjust(channel, WINDOW);
                    adjusts += 1;
                    since_adjust = 0
                }
            }
            msg::CHANNEL_EOF => {
                eof = true;
                client.eof(channel);
                client.close(channel);
            }
            msg::CHANNEL_CLOSE => break,
            m => panic!("unexpected message {}", m),
        }
    }
    assert!(eof);
    assert_eq!(received.len(), BURST);
    assert!(received.iter().enumerate().all(|(i, &b)| b == pattern(i)));
    assert_eq!(adjusts, 3);

    drop(client);
    let (result, mut handler) = server.join().unwrap();
    result.unwrap();
    handler.writer.take().unwrap().join().unwrap();
}
