//! SDES, BYE and APP sub-packets (RFC 3550 §6.5-6.7).
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

use super::report::{RtcpHeader, RtcpPacketType};
use crate::error::{MediaEngineError, MediaEngineResult};
use bytes::{BufMut, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdesItemType {
    Cname = 1,
    Name = 2,
    Email = 3,
    Phone = 4,
    Loc = 5,
    Tool = 6,
    Note = 7,
    Priv = 8,
}

impl SdesItemType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Cname),
            2 => Some(Self::Name),
            3 => Some(Self::Email),
            4 => Some(Self::Phone),
            5 => Some(Self::Loc),
            6 => Some(Self::Tool),
            7 => Some(Self::Note),
            8 => Some(Self::Priv),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SdesItem {
    pub item_type: SdesItemType,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub items: Vec<SdesItem>,
}

impl SdesChunk {
    fn parse(data: &[u8]) -> MediaEngineResult<(Self, usize)> {
        if data.len() < 4 {
            return Err(MediaEngineError::ParseError(
                "SDES chunk too short for SSRC".to_string(),
            ));
        }
        let ssrc = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let mut items = Vec::new();
        let mut offset = 4;
        loop {
            if offset >= data.len() {
                return Err(MediaEngineError::ParseError(
                    "SDES chunk missing terminating null item".to_string(),
                ));
            }
            let type_byte = data[offset];
            if type_byte == 0 {
                offset += 1;
                break;
            }
            let item_type = SdesItemType::from_u8(type_byte)
                .ok_or_else(|| MediaEngineError::ParseError(format!("unknown SDES item type {}", type_byte)))?;
            if offset + 1 >= data.len() {
                return Err(MediaEngineError::ParseError(
                    "SDES item missing length byte".to_string(),
                ));
            }
            let len = data[offset + 1] as usize;
            if offset + 2 + len > data.len() {
                return Err(MediaEngineError::ParseError(
                    "SDES item value truncated".to_string(),
                ));
            }
            let value = String::from_utf8_lossy(&data[offset + 2..offset + 2 + len]).into_owned();
            items.push(SdesItem { item_type, value });
            offset += 2 + len;
        }
        // pad the chunk to a 32-bit boundary
        let padded = (offset + 3) / 4 * 4;
        Ok((SdesChunk { ssrc, items }, padded))
    }

    fn serialize(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32(self.ssrc);
        for item in &self.items {
            buf.put_u8(item.item_type as u8);
            let bytes = item.value.as_bytes();
            buf.put_u8(bytes.len().min(255) as u8);
            buf.put_slice(&bytes[..bytes.len().min(255)]);
        }
        buf.put_u8(0); // terminating null item
        let written = buf.len() - start;
        let padded = (written + 3) / 4 * 4;
        for _ in 0..(padded - written) {
            buf.put_u8(0);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceDescription {
    pub header: RtcpHeader,
    pub chunks: Vec<SdesChunk>,
}

impl SourceDescription {
    pub fn parse(header: RtcpHeader, data: &[u8]) -> MediaEngineResult<Self> {
        let mut chunks = Vec::with_capacity(header.count as usize);
        let mut rest = data;
        for _ in 0..header.count {
            let (chunk, consumed) = SdesChunk::parse(rest)?;
            chunks.push(chunk);
            if consumed > rest.len() {
                return Err(MediaEngineError::ParseError(
                    "SDES chunk overran buffer".to_string(),
                ));
            }
            rest = &rest[consumed..];
        }
        Ok(SourceDescription { header, chunks })
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let header_start = buf.len();
        let header = RtcpHeader {
            count: self.chunks.len().min(31) as u8,
            packet_type: RtcpPacketType::SourceDescription,
            ..self.header.clone()
        };
        buf.put_slice(&header.serialize());
        for chunk in &self.chunks {
            chunk.serialize(&mut buf);
        }
        let total_length = buf.len();
        let length_words = (total_length / 4) - 1;
        buf[header_start + 2..header_start + 4]
            .copy_from_slice(&(length_words as u16).to_be_bytes());
        buf
    }
}

#[derive(Debug, Clone)]
pub struct Goodbye {
    pub header: RtcpHeader,
    pub ssrcs: Vec<u32>,
    pub reason: Option<String>,
}

impl Goodbye {
    pub fn new(ssrcs: Vec<u32>, reason: Option<String>) -> Self {
        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: ssrcs.len().min(31) as u8,
            packet_type: RtcpPacketType::Goodbye,
            length: 0,
        };
        Goodbye {
            header,
            ssrcs,
            reason,
        }
    }

    pub fn parse(header: RtcpHeader, data: &[u8]) -> MediaEngineResult<Self> {
        let needed = header.count as usize * 4;
        if data.len() < needed {
            return Err(MediaEngineError::InvalidPacket(
                "BYE body too short for SSRC list".to_string(),
            ));
        }
        let mut ssrcs = Vec::with_capacity(header.count as usize);
        for i in 0..header.count as usize {
            let off = i * 4;
            ssrcs.push(u32::from_be_bytes([
                data[off],
                data[off + 1],
                data[off + 2],
                data[off + 3],
            ]));
        }
        let rest = &data[needed..];
        let reason = if !rest.is_empty() {
            let len = rest[0] as usize;
            if rest.len() < 1 + len {
                None
            } else {
                Some(String::from_utf8_lossy(&rest[1..1 + len]).into_owned())
            }
        } else {
            None
        };

        Ok(Goodbye {
            header,
            ssrcs,
            reason,
        })
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let header_start = buf.len();
        buf.put_slice(&self.header.serialize());
        for &ssrc in &self.ssrcs {
            buf.put_u32(ssrc);
        }
        if let Some(ref reason) = self.reason {
            let bytes = reason.as_bytes();
            buf.put_u8(bytes.len().min(255) as u8);
            buf.put_slice(&bytes[..bytes.len().min(255)]);
        }
        // pad to 32-bit boundary
        while buf.len() % 4 != 0 {
            buf.put_u8(0);
        }
        let total_length = buf.len();
        let length_words = (total_length / 4) - 1;
        buf[header_start + 2..header_start + 4]
            .copy_from_slice(&(length_words as u16).to_be_bytes());
        buf
    }
}

/// Application-defined packet (RFC 3550 §6.7). Not used on the hot path; kept
/// only so the compound iterator can skip over it without erroring.
#[derive(Debug, Clone)]
pub struct ApplicationDefined {
    pub header: RtcpHeader,
    pub ssrc: u32,
    pub name: [u8; 4],
    pub data: Vec<u8>,
}

impl ApplicationDefined {
    pub fn parse(header: RtcpHeader, data: &[u8]) -> MediaEngineResult<Self> {
        if data.len() < 8 {
            return Err(MediaEngineError::InvalidPacket(
                "APP body too short".to_string(),
            ));
        }
        let ssrc = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let name = [data[4], data[5], data[6], data[7]];
        Ok(ApplicationDefined {
            header,
            ssrc,
            name,
            data: data[8..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdes_round_trip() {
        let chunk = SdesChunk {
            ssrc: 7,
            items: vec![SdesItem {
                item_type: SdesItemType::Cname,
                value: "peer@conf".to_string(),
            }],
        };
        let sdes = SourceDescription {
            header: RtcpHeader {
                version: 2,
                padding: false,
                count: 1,
                packet_type: RtcpPacketType::SourceDescription,
                length: 0,
            },
            chunks: vec![chunk],
        };
        let serialized = sdes.serialize();
        let (header, rest) = RtcpHeader::parse(&serialized).unwrap();
        let parsed = SourceDescription::parse(header, rest).unwrap();
        assert_eq!(parsed.chunks.len(), 1);
        assert_eq!(parsed.chunks[0].ssrc, 7);
        assert_eq!(parsed.chunks[0].items[0].value, "peer@conf");
    }

    #[test]
    fn bye_round_trip_with_reason() {
        let bye = Goodbye::new(vec![1, 2], Some("bye".to_string()));
        let serialized = bye.serialize();
        let (header, rest) = RtcpHeader::parse(&serialized).unwrap();
        let parsed = Goodbye::parse(header, rest).unwrap();
        assert_eq!(parsed.ssrcs, vec![1, 2]);
        assert_eq!(parsed.reason.as_deref(), Some("bye"));
    }
}
