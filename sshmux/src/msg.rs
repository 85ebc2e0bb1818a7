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
#![allow(missing_docs)]
// https://tools.ietf.org/html/rfc4250#section-4.1
pub const DISCONNECT: u8 = 1;
pub const IGNORE: u8 = 2;
pub const UNIMPLEMENTED: u8 = 3;
pub const DEBUG: u8 = 4;

pub const KEXINIT: u8 = 20;

// https://tools.ietf.org/html/rfc4254#section-9
pub const GLOBAL_REQUEST: u8 = 80;
pub const REQUEST_SUCCESS: u8 = 81;
pub const REQUEST_FAILURE: u8 = 82;

pub const CHANNEL_OPEN: u8 = 90;
pub const CHANNEL_OPEN_CONFIRMATION: u8 = 91;
pub const CHANNEL_OPEN_FAILURE: u8 = 92;
pub const CHANNEL_WINDOW_ADJUST: u8 = 93;
pub const CHANNEL_DATA: u8 = 94;
pub const CHANNEL_EXTENDED_DATA: u8 = 95;
pub const CHANNEL_EOF: u8 = 96;
pub const CHANNEL_CLOSE: u8 = 97;
pub const CHANNEL_REQUEST: u8 = 98;
pub const CHANNEL_SUCCESS: u8 = 99;
pub const CHANNEL_FAILURE: u8 = 100;

/// Data type code of extended data carrying standard error.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Message numbers of protocol versions 1.3 and 1.5.
pub mod ssh1 {
    pub const DISCONNECT: u8 = 1;
    pub const CMSG_WINDOW_SIZE: u8 = 11;
    pub const SMSG_SUCCESS: u8 = 14;
    pub const SMSG_FAILURE: u8 = 15;
    pub const CMSG_STDIN_DATA: u8 = 16;
    pub const SMSG_STDOUT_DATA: u8 = 17;
    pub const SMSG_STDERR_DATA: u8 = 18;
    pub const CMSG_EOF: u8 = 19;
    pub const SMSG_EXITSTATUS: u8 = 20;
    pub const CHANNEL_OPEN_CONFIRMATION: u8 = 21;
    pub const CHANNEL_OPEN_FAILURE: u8 = 22;
    pub const CHANNEL_DATA: u8 = 23;
    /// Input EOF in protocol 1.5.
    pub const CHANNEL_CLOSE: u8 = 24;
    /// Output close in protocol 1.5.
    pub const CHANNEL_CLOSE_CONFIRMATION: u8 = 25;
    pub const SMSG_X11_OPEN: u8 = 27;
    pub const CMSG_PORT_FORWARD_REQUEST: u8 = 28;
    pub const PORT_OPEN: u8 = 29;
    pub const SMSG_AGENT_OPEN: u8 = 30;
    pub const IGNORE: u8 = 32;
    pub const CMSG_EXIT_CONFIRMATION: u8 = 33;
    pub const DEBUG: u8 = 36;
}
