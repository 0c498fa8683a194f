//! Lazy cursor over a compound RTCP buffer (component C).
//!
//! Not thread-safe: callers that iterate from multiple threads must supply
//! their own synchronization.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::wire;
use bytes::BytesMut;

/// A view of one sub-packet within a compound buffer: start offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpSpan {
    pub offset: usize,
    pub length: usize,
}

pub struct RtcpIterator<'a> {
    buf: &'a [u8],
    cursor: usize,
    last_yielded: Option<RtcpSpan>,
}

impl<'a> RtcpIterator<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        RtcpIterator {
            buf,
            cursor: 0,
            last_yielded: None,
        }
    }

    /// True iff the remaining prefix parses as a valid RTCP sub-packet header.
    pub fn has_next(&self) -> bool {
        let remaining = self.buf.len() - self.cursor;
        wire::rtcp_is_valid(self.buf, self.cursor, remaining)
    }

    /// Yields the next sub-packet's span and advances the cursor past it.
    pub fn next(&mut self) -> Option<RtcpSpan> {
        if !self.has_next() {
            return None;
        }
        let remaining = self.buf.len() - self.cursor;
        let length = wire::rtcp_length_bytes(self.buf, self.cursor, remaining).ok()?;
        if length > remaining {
            return None;
        }
        let span = RtcpSpan {
            offset: self.cursor,
            length,
        };
        self.cursor += length;
        self.last_yielded = Some(span);
        Some(span)
    }

    pub fn span_bytes(&self, span: RtcpSpan) -> &'a [u8] {
        &self.buf[span.offset..span.offset + span.length]
    }

    /// Deletes the most recently yielded sub-packet from `out` in place, by
    /// shifting everything after it left by its length. The caller must then
    /// truncate `out` by `span.length`. Rewinds the cursor so a subsequent
    /// `next()` resumes at the same logical position.
    pub fn remove(&mut self, out: &mut BytesMut) -> Option<usize> {
        let span = self.last_yielded.take()?;
        let tail_start = span.offset + span.length;
        out.copy_within(tail_start.., span.offset);
        self.cursor = span.offset;
        Some(span.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn rr_sub_packet(ssrc: u32) -> Vec<u8> {
        let mut buf = vec![0x80, 201, 0x00, 0x01]; // RR, 0 reports, length=1 word
        let mut body = BytesMut::new();
        body.put_u32(ssrc);
        buf.extend_from_slice(&body);
        buf
    }

    #[test]
    fn walks_two_sub_packets() {
        let mut compound = rr_sub_packet(1);
        compound.extend_from_slice(&rr_sub_packet(2));

        let mut it = RtcpIterator::new(&compound);
        assert!(it.has_next());
        let first = it.next().unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.length, 8);

        assert!(it.has_next());
        let second = it.next().unwrap();
        assert_eq!(second.offset, 8);
        assert_eq!(second.length, 8);

        assert!(!it.has_next());
        assert!(it.next().is_none());
    }

    #[test]
    fn remove_shifts_tail_left() {
        let mut compound = BytesMut::from(&rr_sub_packet(1)[..]);
        compound.extend_from_slice(&rr_sub_packet(2));
        let original_len = compound.len();

        let mut it = RtcpIterator::new(&compound.clone());
        let first = it.next().unwrap();
        assert_eq!(first.offset, 0);

        let removed_len = it.remove(&mut compound).unwrap();
        compound.truncate(original_len - removed_len);

        assert_eq!(compound.len(), 8);
        // what remains is the second sub-packet's SSRC=2
        assert_eq!(u32::from_be_bytes([compound[4], compound[5], compound[6], compound[7]]), 2);
    }

    #[test]
    fn stops_on_invalid_header() {
        let garbage = [0x00, 0x00, 0x00, 0x00];
        let it = RtcpIterator::new(&garbage);
        assert!(!it.has_next());
    }
}
