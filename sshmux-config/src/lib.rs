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
//! Read the connection-layer settings of an `sshd_config`-style file
//! into a [`sshmux::server::Config`].
//!
//! Keywords are case-insensitive. Unknown keywords are skipped, and
//! parsing stops at the first `Match` block.
extern crate regex;
extern crate sshmux;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

use std::io::Read;
use std::path::Path;

use sshmux::server::Config;

mod time;
pub use crate::time::parse_time;

/// Errors while reading a configuration file.
#[derive(Debug)]
pub enum Error {
    /// The file could not be read.
    IO(std::io::Error),
    /// A keyword has an invalid value.
    Value {
        line: usize,
        keyword: String,
        value: String,
    },
    /// A known keyword has no value.
    MissingValue { line: usize, keyword: String },
}

impl std::convert::From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IO(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::IO(ref e) => e.fmt(f),
            Error::Value {
                line,
                ref keyword,
                ref value,
            } => write!(f, "line {}: bad value {:?} for {}", line, value, keyword),
            Error::MissingValue { line, ref keyword } => {
                write!(f, "line {}: missing argument for {}", line, keyword)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Error::IO(ref e) = *self {
            Some(e)
        } else {
            None
        }
    }
}

/// Read and parse the file at `path`.
pub fn parse_path<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
    let mut s = String::new();
    let mut b = std::fs::File::open(path)?;
    b.read_to_string(&mut s)?;
    parse(&s)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

/// `AllowTcpForwarding` also accepts `all`, `local` and `remote`;
/// only `no` disables forwarding here.
fn parse_forwarding(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "yes" | "all" | "local" | "remote" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

/// `GatewayPorts` also accepts `clientspecified`, treated as `yes`.
fn parse_gateway(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "yes" | "clientspecified" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

/// Parse the contents of a configuration file. Settings that are
/// not mentioned keep their default value.
pub fn parse(file: &str) -> Result<Config, Error> {
    let mut config = Config::default();
    for (n, line) in file.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.find(|c: char| c.is_whitespace() || c == '=') {
            Some(i) => {
                let (key, value) = line.split_at(i);
                (key, value.trim_start_matches(|c: char| c.is_whitespace() || c == '=').trim_end())
            }
            None => (line, ""),
        };
        let lower = key.to_lowercase();
        let bad = || Error::Value {
            line: n + 1,
            keyword: key.to_string(),
            value: value.to_string(),
        };
        let known = match lower.as_str() {
            "clientaliveinterval" | "clientalivecountmax" | "allowtcpforwarding" | "gatewayports"
            | "maxpacketsize" | "windowsize" => true,
            "match" => {
                debug!("line {}: stopping at Match block", n + 1);
                break;
            }
            _ => false,
        };
        if !known {
            debug!("{:?}", key);
            continue;
        }
        if value.is_empty() {
            return Err(Error::MissingValue {
                line: n + 1,
                keyword: key.to_string(),
            });
        }
        match lower.as_str() {
            "clientaliveinterval" => {
                let t = parse_time(value).ok_or_else(bad)?;
                config.client_alive_interval = if t.as_secs() == 0 { None } else { Some(t) }
            }
            "clientalivecountmax" => config.client_alive_count_max = value.parse().map_err(|_| bad())?,
            "allowtcpforwarding" => config.allow_tcp_forwarding = parse_forwarding(value).ok_or_else(bad)?,
            "gatewayports" => config.gateway_ports = parse_gateway(value).ok_or_else(bad)?,
            "maxpacketsize" => {
                let size: u32 = value.parse().map_err(|_| bad())?;
                if size == 0 {
                    return Err(bad());
                }
                config.maximum_packet_size = size
            }
            _ => {
                let size: u32 = value.parse().map_err(|_| bad())?;
                if size == 0 {
                    return Err(bad());
                }
                config.window_size = size
            }
        }
    }
    Ok(config)
}

#[cfg(test)]
mod test {
    extern crate tempdir;
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn defaults() {
        let c = parse("# nothing\n\nPort 22\n").unwrap();
        let d = Config::default();
        assert_eq!(c.client_alive_interval, d.client_alive_interval);
        assert_eq!(c.client_alive_count_max, d.client_alive_count_max);
        assert_eq!(c.allow_tcp_forwarding, d.allow_tcp_forwarding);
        assert_eq!(c.window_size, d.window_size);
    }

    #[test]
    fn keywords() {
        let c = parse(
            "ClientAliveInterval 1m30s\n\
             clientalivecountmax=5\n\
             AllowTcpForwarding no\n\
             GatewayPorts clientspecified\n\
             MaxPacketSize 16384\n\
             WindowSize 65536\n",
        )
        .unwrap();
        assert_eq!(c.client_alive_interval, Some(Duration::from_secs(90)));
        assert_eq!(c.client_alive_count_max, 5);
        assert!(!c.allow_tcp_forwarding);
        assert!(c.gateway_ports);
        assert_eq!(c.maximum_packet_size, 16384);
        assert_eq!(c.window_size, 65536);
    }

    #[test]
    fn zero_interval_disables_keepalives() {
        let c = parse("ClientAliveInterval 10\nClientAliveInterval 0\n").unwrap();
        assert_eq!(c.client_alive_interval, None);
    }

    #[test]
    fn match_block() {
        let c = parse("AllowTcpForwarding yes\nMatch User pe\n  AllowTcpForwarding no\n").unwrap();
        assert!(c.allow_tcp_forwarding);
    }

    #[test]
    fn errors() {
        match parse("\nClientAliveCountMax lots\n") {
            Err(Error::Value { line: 2, .. }) => {}
            x => panic!("{:?}", x),
        }
        match parse("GatewayPorts\n") {
            Err(Error::MissingValue { line: 1, .. }) => {}
            x => panic!("{:?}", x),
        }
        assert!(parse("WindowSize 0\n").is_err());
    }

    #[test]
    fn from_file() {
        let dir = tempdir::TempDir::new("sshmux-config").unwrap();
        let path = dir.path().join("sshd_config");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "ClientAliveInterval 2h").unwrap();
        drop(f);
        let c = parse_path(&path).unwrap();
        assert_eq!(c.client_alive_interval, Some(Duration::from_secs(7200)));
        assert!(parse_path(dir.path().join("missing")).is_err());
    }
}
