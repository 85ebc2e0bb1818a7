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
use cryptovec::CryptoVec;

/// Consumed bytes are only moved back to the front once at least
/// this many have accumulated.
const COMPACT_THRESHOLD: usize = 4096;

/// A FIFO byte queue. Bytes are appended at the back and consumed
/// from the front. The storage is a `CryptoVec`, so it is zeroed when
/// the buffer is dropped.
#[derive(Debug)]
pub struct Buffer {
    buf: CryptoVec,
    offset: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Buffer {
            buf: CryptoVec::new(),
            offset: 0,
        }
    }

    /// Number of bytes available to consume.
    pub fn len(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Whether no bytes are available.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bytes available, without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    /// Append `data` at the back.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend(data)
    }

    /// Drop the first `n` available bytes.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume {} > {}", n, self.len());
        self.offset += n;
        if self.offset == self.buf.len() {
            self.buf.clear();
            self.offset = 0
        } else if self.offset >= COMPACT_THRESHOLD && 2 * self.offset >= self.buf.len() {
            let len = self.buf.len();
            {
                let s: &mut [u8] = &mut self.buf;
                s.copy_within(self.offset..len, 0);
            }
            self.buf.resize(len - self.offset);
            self.offset = 0
        }
    }

    /// Remove all bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.offset = 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fifo() {
        let mut b = Buffer::new();
        assert!(b.is_empty());
        b.append(b"hello ");
        b.append(b"world");
        assert_eq!(b.len(), 11);
        b.consume(6);
        assert_eq!(b.peek(), b"world");
        b.consume(5);
        assert!(b.is_empty());
        b.append(b"again");
        assert_eq!(b.peek(), b"again");
    }

    #[test]
    fn compaction_keeps_order() {
        let mut b = Buffer::new();
        let data: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
        b.append(&data);
        b.consume(15000);
        assert_eq!(b.peek(), &data[15000..]);
        b.append(b"tail");
        assert_eq!(b.len(), 5004);
        assert_eq!(&b.peek()[5000..], b"tail");
    }

    #[test]
    #[should_panic]
    fn over_consume() {
        let mut b = Buffer::new();
        b.append(b"ab");
        b.consume(3)
    }
}
