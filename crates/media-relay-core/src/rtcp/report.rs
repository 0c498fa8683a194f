//! Sender/Receiver Reports (RFC 3550 §6.4).
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

use crate::error::{MediaEngineError, MediaEngineResult};
use bytes::{BufMut, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// RTCP packet types (RFC 3550 §6, plus the feedback types from RFC 4585).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacketType {
    SenderReport = 200,
    ReceiverReport = 201,
    SourceDescription = 202,
    Goodbye = 203,
    ApplicationDefined = 204,
    TransportFeedback = 205,
    PayloadSpecificFeedback = 206,
}

impl RtcpPacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            200 => Some(Self::SenderReport),
            201 => Some(Self::ReceiverReport),
            202 => Some(Self::SourceDescription),
            203 => Some(Self::Goodbye),
            204 => Some(Self::ApplicationDefined),
            205 => Some(Self::TransportFeedback),
            206 => Some(Self::PayloadSpecificFeedback),
            _ => None,
        }
    }
}

/// Common 4-byte RTCP sub-packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpHeader {
    pub version: u8,
    pub padding: bool,
    /// Reception-report count for SR/RR, source count for SDES/BYE, FMT for FB.
    pub count: u8,
    pub packet_type: RtcpPacketType,
    /// Length in 32-bit words, minus one.
    pub length: u16,
}

impl RtcpHeader {
    pub fn parse(data: &[u8]) -> MediaEngineResult<(Self, &[u8])> {
        if data.len() < 4 {
            return Err(MediaEngineError::InvalidPacket(
                "RTCP header too short".to_string(),
            ));
        }

        let first_byte = data[0];
        let version = (first_byte >> 6) & 0x03;
        if version != 2 {
            return Err(MediaEngineError::InvalidPacket(format!(
                "invalid RTCP version: {}",
                version
            )));
        }
        let padding = (first_byte & 0x20) != 0;
        let count = first_byte & 0x1F;

        let packet_type = RtcpPacketType::from_u8(data[1]).ok_or_else(|| {
            MediaEngineError::InvalidPacket(format!("unknown RTCP packet type: {}", data[1]))
        })?;
        let length = u16::from_be_bytes([data[2], data[3]]);

        Ok((
            RtcpHeader {
                version,
                padding,
                count,
                packet_type,
                length,
            },
            &data[4..],
        ))
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4);
        let mut first_byte = (self.version & 0x03) << 6;
        if self.padding {
            first_byte |= 0x20;
        }
        first_byte |= self.count & 0x1F;

        buf.put_u8(first_byte);
        buf.put_u8(self.packet_type as u8);
        buf.put_u16(self.length);
        buf
    }
}

/// One reception-report block (RFC 3550 §6.4.1), 24 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionReport {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit signed on the wire, widened here.
    pub cumulative_packets_lost: i32,
    pub extended_sequence_number: u32,
    pub jitter: u32,
    pub last_sr_timestamp: u32,
    pub delay_since_last_sr: u32,
}

impl ReceptionReport {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> MediaEngineResult<Self> {
        if data.len() < Self::SIZE {
            return Err(MediaEngineError::InvalidPacket(
                "reception report block too short".to_string(),
            ));
        }
        let ssrc = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let fraction_lost = data[4];
        // sign-extend the 24-bit cumulative loss counter
        let sign_byte = if data[5] & 0x80 != 0 { 0xFF } else { 0x00 };
        let cumulative_packets_lost =
            i32::from_be_bytes([sign_byte, data[5], data[6], data[7]]);
        let extended_sequence_number = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let jitter = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let last_sr_timestamp = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
        let delay_since_last_sr = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);

        Ok(ReceptionReport {
            ssrc,
            fraction_lost,
            cumulative_packets_lost,
            extended_sequence_number,
            jitter,
            last_sr_timestamp,
            delay_since_last_sr,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        let lost_bytes = self.cumulative_packets_lost.to_be_bytes();
        buf.put_u8(lost_bytes[1]);
        buf.put_u8(lost_bytes[2]);
        buf.put_u8(lost_bytes[3]);
        buf.put_u32(self.extended_sequence_number);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr_timestamp);
        buf.put_u32(self.delay_since_last_sr);
    }
}

/// RFC 3550 §6.4.1.
#[derive(Debug, Clone)]
pub struct SenderReport {
    pub header: RtcpHeader,
    pub ssrc: u32,
    pub ntp_timestamp_msw: u32,
    pub ntp_timestamp_lsw: u32,
    pub rtp_timestamp: u32,
    pub sender_packet_count: u32,
    pub sender_octet_count: u32,
    pub reception_reports: Vec<ReceptionReport>,
}

const NTP_UNIX_EPOCH_OFFSET_SECS: u64 = 2_208_988_800;

impl SenderReport {
    pub fn new(
        ssrc: u32,
        rtp_timestamp: u32,
        sender_packet_count: u32,
        sender_octet_count: u32,
        reception_reports: Vec<ReceptionReport>,
    ) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let ntp_msw = (now.as_secs() + NTP_UNIX_EPOCH_OFFSET_SECS) as u32;
        let ntp_lsw = (((now.subsec_nanos() as u64) << 32) / 1_000_000_000) as u32;

        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: reception_reports.len().min(31) as u8,
            packet_type: RtcpPacketType::SenderReport,
            length: 0,
        };

        SenderReport {
            header,
            ssrc,
            ntp_timestamp_msw: ntp_msw,
            ntp_timestamp_lsw: ntp_lsw,
            rtp_timestamp,
            sender_packet_count,
            sender_octet_count,
            reception_reports,
        }
    }

    pub fn parse(header: RtcpHeader, data: &[u8]) -> MediaEngineResult<Self> {
        if data.len() < 24 {
            return Err(MediaEngineError::InvalidPacket(
                "sender report body too short".to_string(),
            ));
        }
        let ssrc = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let ntp_timestamp_msw = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ntp_timestamp_lsw = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let rtp_timestamp = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let sender_packet_count = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
        let sender_octet_count = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);

        let mut reception_reports = Vec::with_capacity(header.count as usize);
        let mut rest = &data[24..];
        for _ in 0..header.count {
            let report = ReceptionReport::parse(rest)?;
            reception_reports.push(report);
            rest = &rest[ReceptionReport::SIZE..];
        }

        Ok(SenderReport {
            header,
            ssrc,
            ntp_timestamp_msw,
            ntp_timestamp_lsw,
            rtp_timestamp,
            sender_packet_count,
            sender_octet_count,
            reception_reports,
        })
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let header_start = buf.len();
        buf.put_slice(&self.header.serialize());

        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp_timestamp_msw);
        buf.put_u32(self.ntp_timestamp_lsw);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.sender_packet_count);
        buf.put_u32(self.sender_octet_count);

        for report in &self.reception_reports {
            report.serialize(&mut buf);
        }

        let total_length = buf.len();
        let length_words = (total_length / 4) - 1;
        buf[header_start + 2..header_start + 4]
            .copy_from_slice(&(length_words as u16).to_be_bytes());

        buf
    }
}

/// RFC 3550 §6.4.2.
#[derive(Debug, Clone)]
pub struct ReceiverReport {
    pub header: RtcpHeader,
    pub ssrc: u32,
    pub reception_reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    pub fn new(ssrc: u32, reception_reports: Vec<ReceptionReport>) -> Self {
        let header = RtcpHeader {
            version: 2,
            padding: false,
            count: reception_reports.len().min(31) as u8,
            packet_type: RtcpPacketType::ReceiverReport,
            length: 0,
        };

        ReceiverReport {
            header,
            ssrc,
            reception_reports,
        }
    }

    pub fn parse(header: RtcpHeader, data: &[u8]) -> MediaEngineResult<Self> {
        if data.len() < 4 {
            return Err(MediaEngineError::InvalidPacket(
                "receiver report body too short".to_string(),
            ));
        }
        let ssrc = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let mut reception_reports = Vec::with_capacity(header.count as usize);
        let mut rest = &data[4..];
        for _ in 0..header.count {
            let report = ReceptionReport::parse(rest)?;
            reception_reports.push(report);
            rest = &rest[ReceptionReport::SIZE..];
        }

        Ok(ReceiverReport {
            header,
            ssrc,
            reception_reports,
        })
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let header_start = buf.len();
        buf.put_slice(&self.header.serialize());

        buf.put_u32(self.ssrc);
        for report in &self.reception_reports {
            report.serialize(&mut buf);
        }

        let total_length = buf.len();
        let length_words = (total_length / 4) - 1;
        buf[header_start + 2..header_start + 4]
            .copy_from_slice(&(length_words as u16).to_be_bytes());

        buf
    }
}

/// Interarrival jitter, RFC 3550 §6.4.1: `J(i) = J(i-1) + (|D(i-1,i)| - J(i-1)) / 16`.
pub fn calculate_jitter(
    previous_jitter: u32,
    previous_timestamp: u32,
    current_timestamp: u32,
    arrival_time: u32,
) -> u32 {
    let d = (arrival_time as i64 - previous_timestamp as i64)
        - (current_timestamp as i64 - previous_timestamp as i64);
    let d_abs = d.unsigned_abs() as i64;
    (previous_jitter as i64 + (d_abs - previous_jitter as i64) / 16) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let data = [0x81, 0xC8, 0x00, 0x06];
        let (header, _) = RtcpHeader::parse(&data).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.count, 1);
        assert_eq!(header.packet_type, RtcpPacketType::SenderReport);
        assert_eq!(header.length, 6);

        let serialized = header.serialize();
        assert_eq!(&serialized[..], &data[..]);
    }

    #[test]
    fn sender_report_round_trip() {
        let report = SenderReport::new(12345, 1000, 100, 10000, vec![]);
        let serialized = report.serialize();
        assert!(serialized.len() >= 28);

        let (header, rest) = RtcpHeader::parse(&serialized).unwrap();
        let parsed = SenderReport::parse(header, rest).unwrap();
        assert_eq!(parsed.ssrc, 12345);
        assert_eq!(parsed.rtp_timestamp, 1000);
        assert_eq!(parsed.sender_packet_count, 100);
        assert_eq!(parsed.sender_octet_count, 10000);
    }

    #[test]
    fn receiver_report_round_trip_with_blocks() {
        let blocks = vec![ReceptionReport {
            ssrc: 42,
            fraction_lost: 3,
            cumulative_packets_lost: -5,
            extended_sequence_number: 1000,
            jitter: 20,
            last_sr_timestamp: 555,
            delay_since_last_sr: 11,
        }];
        let rr = ReceiverReport::new(99, blocks.clone());
        let serialized = rr.serialize();

        let (header, rest) = RtcpHeader::parse(&serialized).unwrap();
        let parsed = ReceiverReport::parse(header, rest).unwrap();
        assert_eq!(parsed.ssrc, 99);
        assert_eq!(parsed.reception_reports, blocks);
    }

    #[test]
    fn jitter_accumulates_toward_absolute_delta() {
        let j = calculate_jitter(0, 0, 100, 110);
        assert_eq!(j, 0); // (|110-0 - (100-0)|) / 16 = 10/16 = 0
        let j2 = calculate_jitter(0, 0, 100, 260);
        assert_eq!(j2, 10); // |260-160| = 160, /16 = 10
    }
}
