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
use sshmux::encoding::{Encoding, Reader};
use sshmux::fd::Fd;
use sshmux::msg::ssh1;
use sshmux::server::{Connection, Handler, Protocol};
use sshmux::transport::ClearTransport;
use std::os::unix::net::UnixStream;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

struct Nothing;
impl Handler for Nothing {}

// The loop reaps any child with waitpid(-1): one test per binary.
#[test]
fn interactive_session() {
    let _ = env_logger::try_init();
    let (a, b) = UnixStream::pair().unwrap();
    let mut child = Command::new("sh")
        .arg("-c")
        .arg("read x; echo got $x")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let pid = child.id() as libc::pid_t;
    let stdin = Fd::new(child.stdin.take().unwrap());
    let stdout = Fd::new(child.stdout.take().unwrap());
    let stderr = Fd::new(child.stderr.take().unwrap());

    let server = thread::spawn(move || {
        let transport = ClearTransport::from_stream(b).unwrap();
        let mut connection = Connection::new(
            Arc::new(Default::default()),
            transport,
            Nothing,
            AuthContext::new("test", 1000),
            Protocol::Legacy15,
        )
        .unwrap();
        connection.server_loop(pid, stdin, stdout, stderr)
    });

    let mut client = common::Client {
        transport: ClearTransport::from_stream(a).unwrap(),
    };
    client.send(|v| {
        v.push(ssh1::CMSG_STDIN_DATA);
        v.extend_ssh_string(b"hello\n");
    });
    client.send(|v| v.push(ssh1::CMSG_EOF));

    let mut stdout = Vec::new();
    let status = loop {
        let m = client.recv();
        let mut r = m.reader(1);
        match m[0] {
            ssh1::SMSG_STDOUT_DATA => stdout.extend_from_slice(r.read_string().unwrap()),
            ssh1::SMSG_EXITSTATUS => break r.read_u32().unwrap(),
            m => panic!("unexpected message {}", m),
        }
    };
    assert_eq!(stdout, b"got hello\n");
    assert_eq!(status, 0);
    client.send(|v| v.push(ssh1::CMSG_EXIT_CONFIRMATION));

    server.join().unwrap().unwrap();
}
