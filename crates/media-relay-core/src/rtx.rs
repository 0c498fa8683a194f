//! RFC 4588 RTP retransmission wrap/unwrap.
//!
//! The terminator (J) calls [`RtxTransformer::wrap`] when a NACK'd packet is
//! found in the external packet cache, instead of retransmitting the bare
//! original bit-for-bit. The sent-packet cache itself is an external
//! collaborator (the "Packet cache contract"), not owned here.
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

use crate::rtp_handler::RtpPacket;

/// How a peer has negotiated retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtxMode {
    /// RFC 4588: wrap in a distinct SSRC/PT, prefixing the original sequence
    /// number to the payload.
    Rfc4588 { rtx_ssrc: u32, rtx_payload_type: u8 },
    /// No RTX payload type negotiated; resend the original packet verbatim.
    Bare,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RtxTransformer;

impl RtxTransformer {
    /// Wraps `original` for retransmission per the peer's negotiated mode.
    /// `rtx_seq` is the sender's own RTX-stream sequence counter, which is
    /// independent of the original stream's sequence numbers.
    pub fn wrap(&self, original: &RtpPacket, rtx_seq: u16, mode: RtxMode) -> RtpPacket {
        match mode {
            RtxMode::Bare => original.clone(),
            RtxMode::Rfc4588 {
                rtx_ssrc,
                rtx_payload_type,
            } => {
                let mut header = original.header.clone();
                let original_seq = header.sequence_number;
                header.payload_type = rtx_payload_type;
                header.ssrc = rtx_ssrc;
                header.sequence_number = rtx_seq;
                header.marker = false;

                let mut payload = Vec::with_capacity(2 + original.payload.len());
                payload.extend_from_slice(&original_seq.to_be_bytes());
                payload.extend_from_slice(&original.payload);

                RtpPacket {
                    header,
                    payload: payload.into(),
                }
            }
        }
    }

    /// Reverses [`Self::wrap`] for a received RTX packet, given the original
    /// SSRC and payload type negotiated for the protected stream.
    pub fn unwrap(
        &self,
        rtx_packet: &RtpPacket,
        original_ssrc: u32,
        original_payload_type: u8,
        mode: RtxMode,
    ) -> Option<RtpPacket> {
        match mode {
            RtxMode::Bare => Some(rtx_packet.clone()),
            RtxMode::Rfc4588 { .. } => {
                if rtx_packet.payload.len() < 2 {
                    return None;
                }
                let original_seq = u16::from_be_bytes([rtx_packet.payload[0], rtx_packet.payload[1]]);
                let mut header = rtx_packet.header.clone();
                header.ssrc = original_ssrc;
                header.payload_type = original_payload_type;
                header.sequence_number = original_seq;

                Some(RtpPacket {
                    header,
                    payload: rtx_packet.payload.slice(2..),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp_handler::RtpHeader;
    use bytes::Bytes;

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: true,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 1000,
                ssrc: 0x1111,
                csrc: vec![],
                extension_header: None,
            },
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn rfc4588_wrap_unwrap_round_trip() {
        let transformer = RtxTransformer;
        let mode = RtxMode::Rfc4588 {
            rtx_ssrc: 0x2222,
            rtx_payload_type: 97,
        };
        let original = packet(42);

        let wrapped = transformer.wrap(&original, 7, mode);
        assert_eq!(wrapped.header.ssrc, 0x2222);
        assert_eq!(wrapped.header.payload_type, 97);
        assert_eq!(wrapped.header.sequence_number, 7);
        assert!(!wrapped.header.marker);

        let unwrapped = transformer
            .unwrap(&wrapped, 0x1111, 96, mode)
            .expect("round trip should recover original");
        assert_eq!(unwrapped.header.ssrc, 0x1111);
        assert_eq!(unwrapped.header.payload_type, 96);
        assert_eq!(unwrapped.header.sequence_number, 42);
        assert_eq!(unwrapped.payload, original.payload);
    }

    #[test]
    fn bare_mode_resends_verbatim() {
        let transformer = RtxTransformer;
        let original = packet(5);
        let wrapped = transformer.wrap(&original, 0, RtxMode::Bare);
        assert_eq!(wrapped.header.sequence_number, 5);
        assert_eq!(wrapped.payload, original.payload);
    }
}
