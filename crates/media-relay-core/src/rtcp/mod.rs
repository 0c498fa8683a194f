//! RTCP (RTP Control Protocol) packet model (component B) and compound iterator (C).
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

pub mod feedback;
pub mod iterator;
pub mod report;
pub mod sdes_bye_app;

pub use feedback::{
    FeedbackBody, FeedbackClass, FeedbackPacket, FirEntry, FirFci, NackEntry, NackFci,
    PacketStatus, RembFci, TccFci,
};
pub use iterator::{RtcpIterator, RtcpSpan};
pub use report::{calculate_jitter, ReceiverReport, ReceptionReport, RtcpHeader, RtcpPacketType, SenderReport};
pub use sdes_bye_app::{ApplicationDefined, Goodbye, SdesChunk, SdesItem, SdesItemType, SourceDescription};

use crate::error::{MediaEngineError, MediaEngineResult};
use bytes::BytesMut;

/// The flattened sum type §4.2/§9 call for: what was, in the original source,
/// an inheritance chain (`FIRPacket extends RTCPFBPacket extends RTCPPacket`)
/// collapses into one tagged enum with shared SSRC fields folded into the
/// feedback variant itself.
#[derive(Debug, Clone)]
pub enum RtcpPacket {
    Sr(SenderReport),
    Rr(ReceiverReport),
    Sdes(SourceDescription),
    Bye(Goodbye),
    App(ApplicationDefined),
    Fb(FeedbackPacket),
}

impl RtcpPacket {
    pub fn parse_one(data: &[u8]) -> MediaEngineResult<Self> {
        let (header, rest) = RtcpHeader::parse(data)?;
        match header.packet_type {
            RtcpPacketType::SenderReport => Ok(RtcpPacket::Sr(SenderReport::parse(header, rest)?)),
            RtcpPacketType::ReceiverReport => {
                Ok(RtcpPacket::Rr(ReceiverReport::parse(header, rest)?))
            }
            RtcpPacketType::SourceDescription => {
                Ok(RtcpPacket::Sdes(SourceDescription::parse(header, rest)?))
            }
            RtcpPacketType::Goodbye => Ok(RtcpPacket::Bye(Goodbye::parse(header, rest)?)),
            RtcpPacketType::ApplicationDefined => {
                Ok(RtcpPacket::App(ApplicationDefined::parse(header, rest)?))
            }
            RtcpPacketType::TransportFeedback | RtcpPacketType::PayloadSpecificFeedback => {
                Ok(RtcpPacket::Fb(FeedbackPacket::parse(header, rest)?))
            }
        }
    }

    pub fn serialize(&self) -> MediaEngineResult<BytesMut> {
        Ok(match self {
            RtcpPacket::Sr(sr) => sr.serialize(),
            RtcpPacket::Rr(rr) => rr.serialize(),
            RtcpPacket::Sdes(sdes) => sdes.serialize(),
            RtcpPacket::Bye(bye) => bye.serialize(),
            RtcpPacket::App(_) => {
                return Err(MediaEngineError::NotSupported(
                    "serializing APP packets is not needed by this core".to_string(),
                ))
            }
            RtcpPacket::Fb(fb) => fb.serialize()?,
        })
    }
}

/// Parses every sub-packet in a compound RTCP buffer. A malformed sub-packet
/// stops the walk but does not discard sub-packets already parsed, matching
/// §7's "remainder of the compound RTCP is still processed" policy applied at
/// the level above (the terminator logs and keeps what parsed so far).
pub fn parse_compound(data: &[u8]) -> MediaEngineResult<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    let mut it = iterator::RtcpIterator::new(data);
    while let Some(span) = it.next() {
        let bytes = it.span_bytes(span);
        packets.push(RtcpPacket::parse_one(bytes)?);
    }
    Ok(packets)
}

/// Concatenates a list of sub-packets into one compound buffer.
pub fn assemble(packets: &[RtcpPacket]) -> MediaEngineResult<BytesMut> {
    let mut buf = BytesMut::new();
    for packet in packets {
        buf.extend_from_slice(&packet.serialize()?);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compound_round_trip_sr_then_bye() {
        let sr = SenderReport::new(1, 1000, 5, 500, vec![]);
        let bye = Goodbye::new(vec![1], None);
        let packets = vec![RtcpPacket::Sr(sr), RtcpPacket::Bye(bye)];

        let assembled = assemble(&packets).unwrap();
        let parsed = parse_compound(&assembled).unwrap();

        assert_eq!(parsed.len(), 2);
        assert!(matches!(parsed[0], RtcpPacket::Sr(_)));
        assert!(matches!(parsed[1], RtcpPacket::Bye(_)));
    }

    #[test]
    fn compound_round_trip_with_feedback() {
        let nack = FeedbackPacket {
            header: RtcpHeader {
                version: 2,
                padding: false,
                count: feedback::NACK_FMT,
                packet_type: RtcpPacketType::TransportFeedback,
                length: 0,
            },
            class: FeedbackClass::TransportLayer,
            sender_ssrc: 1,
            source_ssrc: 2,
            body: FeedbackBody::Nack(NackFci::pack(&[100, 101])),
        };
        let packets = vec![RtcpPacket::Fb(nack)];
        let assembled = assemble(&packets).unwrap();
        let parsed = parse_compound(&assembled).unwrap();
        assert_eq!(parsed.len(), 1);
        match &parsed[0] {
            RtcpPacket::Fb(fb) => {
                assert_eq!(fb.sender_ssrc, 1);
                assert_eq!(fb.source_ssrc, 2);
                match &fb.body {
                    FeedbackBody::Nack(n) => {
                        let mut lost = n.unpack();
                        lost.sort_unstable();
                        assert_eq!(lost, vec![100, 101]);
                    }
                    _ => panic!("expected NACK body"),
                }
            }
            _ => panic!("expected feedback packet"),
        }
    }
}
