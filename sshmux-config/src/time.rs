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
use regex::Regex;
use std::time::Duration;

lazy_static! {
    static ref TIME: Regex = Regex::new("^([0-9]+)([sSmMhHdDwW]?)").unwrap();
}

/// Parse a time value in the `sshd_config` format: a sequence of
/// numbers, each optionally followed by a unit (`s`, `m`, `h`, `d`,
/// `w`), seconds if no unit is given. For instance, `1h30m` or `90`.
pub fn parse_time(value: &str) -> Option<Duration> {
    let mut rest = value.trim();
    if rest.is_empty() {
        return None;
    }
    let mut secs: u64 = 0;
    while !rest.is_empty() {
        let cap = TIME.captures(rest)?;
        let n: u64 = cap.get(1)?.as_str().parse().ok()?;
        let unit = match cap.get(2).map(|m| m.as_str()).unwrap_or("") {
            "" | "s" | "S" => 1,
            "m" | "M" => 60,
            "h" | "H" => 60 * 60,
            "d" | "D" => 24 * 60 * 60,
            _ => 7 * 24 * 60 * 60,
        };
        secs = secs.checked_add(n.checked_mul(unit)?)?;
        rest = &rest[cap.get(0)?.end()..];
    }
    Some(Duration::from_secs(secs))
}

#[test]
fn test_parse_time() {
    assert_eq!(parse_time("90"), Some(Duration::from_secs(90)));
    assert_eq!(parse_time("10s"), Some(Duration::from_secs(10)));
    assert_eq!(parse_time("1h30m"), Some(Duration::from_secs(5400)));
    assert_eq!(parse_time("1W2d"), Some(Duration::from_secs(9 * 24 * 3600)));
    assert_eq!(parse_time("0"), Some(Duration::from_secs(0)));
    assert_eq!(parse_time(""), None);
    assert_eq!(parse_time("1x"), None);
    assert_eq!(parse_time("h"), None);
}
