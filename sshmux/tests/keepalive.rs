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
use sshmux::encoding::Reader;
use sshmux::msg;
use sshmux::server::{Config, Handler};
use sshmux::{ChannelId, Disconnect, Error};
use std::time::Duration;

struct Accept;
impl Handler for Accept {
    fn open(&mut self, _: &AuthContext, _: ChannelId) -> bool {
        true
    }
}

fn config() -> Config {
    Config {
        client_alive_interval: Some(Duration::from_millis(50)),
        client_alive_count_max: 2,
        ..Config::default()
    }
}

fn expect_keepalive(m: &[u8]) {
    assert_eq!(m[0], msg::CHANNEL_REQUEST);
    let mut r = m.reader(1);
    assert_eq!(r.read_u32().unwrap(), 0);
    assert_eq!(r.read_str().unwrap(), "keepalive@openssh.com");
    assert!(r.read_bool().unwrap());
}

#[test]
fn unanswered_keepalives_disconnect() {
    let (mut client, server) = common::serve(config(), Accept);
    let channel = client.open_session(1000, 100);
    assert_eq!(channel, 0);

    expect_keepalive(&client.recv());
    expect_keepalive(&client.recv());
    let m = client.recv();
    assert_eq!(m[0], msg::DISCONNECT);
    let mut r = m.reader(1);
    assert_eq!(r.read_u32().unwrap(), Disconnect::ByApplication as u32);
    assert_eq!(r.read_str().unwrap(), "Timeout, your session not responding.");

    let (result, _) = server.join().unwrap();
    match result {
        Err(Error::ConnectionTimeout) => {}
        x => panic!("{:?}", x),
    }
}

#[test]
fn answered_keepalives_keep_the_connection() {
    let (mut client, server) = common::serve(config(), Accept);
    let channel = client.open_session(1000, 100);
    for _ in 0..5 {
        expect_keepalive(&client.recv());
        client.send(|v| {
            v.push(msg::CHANNEL_FAILURE);
            v.push_u32_be(channel);
        })
    }
    drop(client);
    let (result, _) = server.join().unwrap();
    result.unwrap();
}

#[test]
fn no_keepalive_without_channels() {
    let (mut client, server) = common::serve(config(), Accept);
    std::thread::sleep(Duration::from_millis(300));
    // Nothing was sent: the first message we get is the reply to this.
    client.send(|v| {
        use sshmux::encoding::Encoding;
        v.push(msg::GLOBAL_REQUEST);
        v.extend_ssh_string(b"unknown@example.com");
        v.push_ssh_bool(true);
    });
    assert_eq!(client.recv()[0], msg::REQUEST_FAILURE);
    drop(client);
    let (result, _) = server.join().unwrap();
    result.unwrap();
}
