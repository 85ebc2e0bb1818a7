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
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use cryptovec::CryptoVec;

/// Encode in the SSH format.
pub trait Encoding {
    /// Push an SSH-encoded string to `self`.
    fn extend_ssh_string(&mut self, s: &[u8]);
    /// Push an SSH-encoded boolean.
    fn push_ssh_bool(&mut self, b: bool);
}

impl Encoding for CryptoVec {
    fn extend_ssh_string(&mut self, s: &[u8]) {
        self.push_u32_be(s.len() as u32);
        self.extend(s);
    }
    fn push_ssh_bool(&mut self, b: bool) {
        self.push(if b { 1 } else { 0 })
    }
}

/// A cursor-like trait to read SSH-encoded things.
pub trait Reader {
    /// Create an SSH reader for `self`.
    fn reader<'a>(&'a self, starting_at: usize) -> Position<'a>;
}

impl Reader for CryptoVec {
    fn reader<'a>(&'a self, starting_at: usize) -> Position<'a> {
        Position {
            s: &**self,
            position: starting_at,
        }
    }
}

impl Reader for [u8] {
    fn reader<'a>(&'a self, starting_at: usize) -> Position<'a> {
        Position {
            s: self,
            position: starting_at,
        }
    }
}

/// A cursor-like type to read SSH-encoded values. Every read is
/// bounds-checked: a field extending past the end of the message
/// yields `Error::IndexOutOfBounds`.
#[derive(Debug)]
pub struct Position<'a> {
    s: &'a [u8],
    #[doc(hidden)]
    pub position: usize,
}

impl<'a> Position<'a> {
    /// Read one string from this reader.
    pub fn read_string(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u32()? as usize;
        if self.position + len <= self.s.len() {
            let result = &self.s[self.position..(self.position + len)];
            self.position += len;
            Ok(result)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read one string and check that it is valid UTF-8.
    pub fn read_str(&mut self) -> Result<&'a str, Error> {
        Ok(std::str::from_utf8(self.read_string()?)?)
    }

    /// Read a `u32` from this reader.
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        if self.position + 4 <= self.s.len() {
            let u = BigEndian::read_u32(&self.s[self.position..]);
            self.position += 4;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read one byte from this reader.
    pub fn read_byte(&mut self) -> Result<u8, Error> {
        if self.position + 1 <= self.s.len() {
            let u = self.s[self.position];
            self.position += 1;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read a boolean (any non-zero byte is true).
    pub fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_byte()? != 0)
    }

    /// Number of bytes not read yet.
    pub fn remaining(&self) -> usize {
        self.s.len().saturating_sub(self.position)
    }

    /// Fail if any byte is left after the last field.
    pub fn check_eom(&self) -> Result<(), Error> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(Error::TrailingData(n)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_fields() {
        let mut v = CryptoVec::new();
        v.push(94);
        v.push_u32_be(3);
        v.extend_ssh_string(b"hello");
        v.push_ssh_bool(true);
        let mut r = v.reader(1);
        assert_eq!(r.read_u32().unwrap(), 3);
        assert_eq!(r.read_str().unwrap(), "hello");
        assert!(r.read_bool().unwrap());
        assert!(r.check_eom().is_ok());
        match r.read_byte() {
            Err(Error::IndexOutOfBounds) => {}
            x => panic!("{:?}", x),
        }
    }

    #[test]
    fn truncated_string() {
        let mut v = CryptoVec::new();
        v.push_u32_be(10);
        v.extend(b"abc");
        match v.reader(0).read_string() {
            Err(Error::IndexOutOfBounds) => {}
            x => panic!("{:?}", x),
        }
    }

    #[test]
    fn trailing_bytes() {
        let data = [0u8, 0, 0, 1, 7, 7];
        let mut r = data.reader(0);
        assert_eq!(r.read_u32().unwrap(), 1);
        match r.check_eom() {
            Err(Error::TrailingData(2)) => {}
            x => panic!("{:?}", x),
        }
    }
}
