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

use sshmux::fd::PollSet;
use sshmux::notify::{self, Notify};
use std::time::{Duration, Instant};

// The handler state is per process, hence a single test in this binary.
#[test]
fn sigchld_wakes_up_poll_and_reaps() {
    let mut notify = Notify::new().unwrap();
    let mut set = PollSet::new();
    notify.prepare(&mut set);
    assert_eq!(set.wait(Some(Duration::from_millis(0))).unwrap(), 0);

    notify.install().unwrap();
    let child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;

    // The signal may interrupt the wait before the pipe is readable.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        set.clear();
        notify.prepare(&mut set);
        if set.wait(Some(Duration::from_millis(100))).unwrap() == 1 {
            break;
        }
        assert!(Instant::now() < deadline);
    }
    notify.done(&set);
    assert!(notify::child_terminated());

    let mut reaped = Vec::new();
    notify.collect_children(|p, status| reaped.push((p, status)));
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].0, pid);
    assert!(exited_zero(reaped[0].1));
    assert!(!notify::child_terminated());

    // The pipe was drained.
    set.clear();
    notify.prepare(&mut set);
    assert_eq!(set.wait(Some(Duration::from_millis(0))).unwrap(), 0);
    std::mem::forget(child);
}

fn exited_zero(status: i32) -> bool {
    status & 0x7f == 0 && (status >> 8) & 0xff == 0
}
