//! Cross-component scenarios, assembled from the public API the way a
//! deployer would wire up a conference: attach connectors to a
//! [`Translator`], feed bytes in on one side, assert on what comes out the
//! other. Each test is named for the scenario it covers.

use bytes::Bytes;
use media_relay_core::connector::{CachedPacket, Connector, DataInput, DataOutput, NoEstimate, NoReceiveStatistics, PacketCache};
use media_relay_core::{
    flexfec_decode, flexfec_encode, wire, Direction, FecConfig, FecReceiver, FecScheme, FecSender,
    FeedbackBody, FeedbackClass, FeedbackPacket, Format, MediaEngineResult, NackFci, RtcpHeader,
    RtcpPacketType, RtpHeader, RtpPacket, TccFci, Terminator, TerminatorConfig, Translator,
};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

struct ChannelOutput {
    tx: Mutex<mpsc::Sender<Vec<u8>>>,
}

impl DataOutput for ChannelOutput {
    fn write(&self, buf: &[u8]) -> MediaEngineResult<usize> {
        let _ = self.tx.lock().unwrap().send(buf.to_vec());
        Ok(buf.len())
    }
}

struct ChannelInput {
    handler: Mutex<Option<Box<dyn Fn(&[u8]) + Send + Sync>>>,
}

impl DataInput for ChannelInput {
    fn set_on_data(&self, handler: Box<dyn Fn(&[u8]) + Send + Sync>) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}

impl ChannelInput {
    fn feed(&self, buf: &[u8]) {
        if let Some(h) = self.handler.lock().unwrap().as_ref() {
            h(buf);
        }
    }
}

struct FakePeer {
    data_output: ChannelOutput,
    control_output: ChannelOutput,
    data_input: ChannelInput,
    control_input: ChannelInput,
}

impl Connector for FakePeer {
    fn data_output(&self) -> &dyn DataOutput {
        &self.data_output
    }
    fn control_output(&self) -> &dyn DataOutput {
        &self.control_output
    }
    fn data_input(&self) -> &dyn DataInput {
        &self.data_input
    }
    fn control_input(&self) -> &dyn DataInput {
        &self.control_input
    }
    fn close(&self) {}
}

fn fake_peer() -> (Arc<FakePeer>, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
    let (data_tx, data_rx) = mpsc::channel();
    let (control_tx, control_rx) = mpsc::channel();
    let peer = Arc::new(FakePeer {
        data_output: ChannelOutput { tx: Mutex::new(data_tx) },
        control_output: ChannelOutput { tx: Mutex::new(control_tx) },
        data_input: ChannelInput { handler: Mutex::new(None) },
        control_input: ChannelInput { handler: Mutex::new(None) },
    });
    (peer, data_rx, control_rx)
}

fn rtp_bytes(pt: u8, seq: u16, ssrc: u32) -> Vec<u8> {
    let mut buf = vec![0x80, pt, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    buf[2..4].copy_from_slice(&seq.to_be_bytes());
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
    buf
}

/// S1: two sendrecv peers sharing PT=96 (VP8). A sends 3 packets; B receives
/// all 3 unchanged (same SSRC, sequence, PT); A never sees its own packets.
#[test]
fn s1_two_peer_relay_is_transparent_when_formats_match() {
    let translator = Translator::new();
    let (peer_a, a_data_rx, _a_ctrl_rx) = fake_peer();
    let (peer_b, b_data_rx, _b_ctrl_rx) = fake_peer();

    let mgr_a = translator.attach("a", Direction::SendRecv, peer_a.clone());
    let mgr_b = translator.attach("b", Direction::SendRecv, peer_b.clone());
    mgr_a.add_format(Format::new("VP8"), 96);
    mgr_b.add_format(Format::new("VP8"), 96);

    for seq in [100u16, 101, 102] {
        peer_a.data_input.feed(&rtp_bytes(96, seq, 0x1111_1111));
        let forwarded = b_data_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(wire::rtp_ssrc(&forwarded, 0, forwarded.len()).unwrap(), 0x1111_1111);
        assert_eq!(wire::rtp_seq(&forwarded, 0, forwarded.len()).unwrap(), seq);
        assert_eq!(wire::rtp_pt(&forwarded, 0, forwarded.len()).unwrap(), 96);
    }
    assert!(a_data_rx.try_recv().is_err(), "sender must never receive its own packets");
}

/// S2: three peers; A sends PT=96, B maps VP8 to PT=98, C has no VP8 map.
/// B receives a PT-rewritten packet with the marker bit preserved; C
/// receives the original PT unchanged.
#[test]
fn s2_payload_type_is_rewritten_per_destination_format_map() {
    let translator = Translator::new();
    let (peer_a, _a_data_rx, _a_ctrl_rx) = fake_peer();
    let (peer_b, b_data_rx, _b_ctrl_rx) = fake_peer();
    let (peer_c, c_data_rx, _c_ctrl_rx) = fake_peer();

    let mgr_a = translator.attach("a", Direction::SendRecv, peer_a.clone());
    let mgr_b = translator.attach("b", Direction::SendRecv, peer_b.clone());
    let _mgr_c = translator.attach("c", Direction::SendRecv, peer_c.clone());

    mgr_a.add_format(Format::new("VP8"), 96);
    mgr_b.add_format(Format::new("VP8"), 98);
    // c advertises no VP8 mapping at all.

    let mut marked = rtp_bytes(96, 5, 0x2222_2222);
    marked[1] |= 0x80; // set the marker bit alongside PT=96

    peer_a.data_input.feed(&marked);

    let to_b = b_data_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(wire::rtp_pt(&to_b, 0, to_b.len()).unwrap(), 98);
    assert_eq!(to_b[1] & 0x80, 0x80, "marker bit must survive the PT rewrite");

    let to_c = c_data_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(wire::rtp_pt(&to_c, 0, to_c.len()).unwrap(), 96);
}

/// S3: ULPFEC single-loss recovery. Media 100..104 folded into one F=0xFE
/// FEC packet; 102 is dropped before the receiver sees it; recovery
/// reconstructs it with the original payload.
#[test]
fn s3_ulpfec_recovers_a_single_lost_packet() {
    let ssrc = 0xAAAA;
    let mut sender = FecSender::new(ssrc, FecConfig { rate: 5, fec_payload_type: 0xFE });
    let mut media_packets = Vec::new();
    let mut fec_packet = None;
    for i in 0..5u16 {
        let mut pkt = RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: false,
                payload_type: 96,
                sequence_number: 100 + i,
                timestamp: 9000 + i as u32,
                ssrc,
                csrc: vec![],
                extension_header: None,
            },
            payload: Bytes::from(vec![0xAB, i as u8, 0x00, 0xFF]),
        };
        if let Some(fec) = sender.process_outgoing(&mut pkt) {
            fec_packet = Some(fec);
        }
        media_packets.push(pkt);
    }
    let fec_packet = fec_packet.expect("one FEC packet after 5 folded media packets");

    let mut receiver = FecReceiver::new(ssrc);
    for (i, pkt) in media_packets.iter().enumerate() {
        if i == 2 {
            continue; // 102 lost in transit
        }
        receiver.observe_media(pkt.clone());
    }
    let recovered = receiver.observe_fec(FecScheme::UlpFec, fec_packet);

    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].header.sequence_number, 102);
    assert_eq!(recovered[0].payload.as_ref(), media_packets[2].payload.as_ref());
}

/// S4: NACK-driven retransmit honoring the RTT threshold. A packet cache
/// with two packets "old enough" relative to the configured RTT is hit by a
/// NACK covering both; both are retransmitted and neither counts as missing.
#[test]
fn s4_nack_driven_retransmit_honors_rtt_threshold() {
    struct FixedCache {
        entries: Mutex<HashMap<(u32, u16), CachedPacket>>,
    }
    impl PacketCache for FixedCache {
        fn get(&self, ssrc: u32, seq: u16) -> Option<CachedPacket> {
            self.entries.lock().unwrap().get(&(ssrc, seq)).cloned()
        }
    }

    let translator = Translator::new();
    let (peer, _data_rx, _ctrl_rx) = fake_peer();
    translator.attach("sender", Direction::SendRecv, peer);

    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
    let mut entries = HashMap::new();
    for seq in 1000u16..=1001 {
        entries.insert(
            (0xDEADBEEFu32, seq),
            CachedPacket { buffer: rtp_bytes(96, seq, 0xDEADBEEF), time_added_ms: now_ms - 200 },
        );
    }
    let cache: Arc<dyn PacketCache> = Arc::new(FixedCache { entries: Mutex::new(entries) });

    let terminator = Terminator::new(
        "sender",
        translator.clone(),
        Arc::new(NoReceiveStatistics),
        cache,
        Arc::new(NoEstimate),
    );
    terminator.set_rtt_ms(100);
    terminator.set_config(TerminatorConfig { nack_termination_enabled: true });

    let nack = NackFci::pack(&[1000, 1001]);
    let fb = FeedbackPacket {
        header: RtcpHeader {
            version: 2,
            padding: false,
            count: 0,
            packet_type: RtcpPacketType::TransportFeedback,
            length: 0,
        },
        class: FeedbackClass::TransportLayer,
        sender_ssrc: 1,
        source_ssrc: 0xDEADBEEF,
        body: FeedbackBody::Nack(nack),
    };
    terminator.handle_feedback(&fb, now_ms);

    let (retransmitted, _not_retransmitted, missing) = terminator.stats();
    assert_eq!(retransmitted, 2);
    assert_eq!(missing, 0);
}

/// S5: TCC round trip. base_seq=17, arrivals {0,10,missing,25} ms; the built
/// packet quantizes deltas to 250us units and decoding reconstructs the same
/// receipt pattern.
#[test]
fn s5_tcc_round_trips_deltas_and_missing_packets() {
    let built = TccFci::build(17, 0, 1, &[Some(0), Some(10), None, Some(25)]).unwrap();
    assert_eq!(built.packet_status_count(), 4);
    assert_eq!(built.reference_time_64ms, 0);

    let packet = FeedbackPacket {
        header: RtcpHeader {
            version: 2,
            padding: false,
            count: 0,
            packet_type: RtcpPacketType::TransportFeedback,
            length: 0,
        },
        class: FeedbackClass::TransportLayer,
        sender_ssrc: 1,
        source_ssrc: 2,
        body: FeedbackBody::Tcc(built.clone()),
    };
    let serialized = packet.serialize().unwrap();
    let (header, rest) = RtcpHeader::parse(&serialized).unwrap();
    let parsed = FeedbackPacket::parse(header, rest).unwrap();

    match parsed.body {
        FeedbackBody::Tcc(tcc) => {
            assert_eq!(tcc.base_sequence, 17);
            assert_eq!(tcc.packet_deltas, built.packet_deltas);
            assert_eq!(tcc.packet_deltas[1], Some(40)); // 10ms -> 40 * 250us
        }
        other => panic!("expected Tcc body, got {:?}", other),
    }
}

/// S6: FlexFEC mask tier boundary. base=1000: protected up to delta 14 still
/// fits the 2-byte small tier; delta 15 forces the 6-byte medium tier.
#[test]
fn s6_flexfec_mask_switches_tier_at_the_boundary() {
    let small = flexfec_encode(1000, &[1000, 1014]).unwrap();
    assert_eq!(small.len(), 2);
    assert_eq!(flexfec_decode(&small, 1000).unwrap(), vec![1000, 1014]);

    let medium = flexfec_encode(1000, &[1000, 1015]).unwrap();
    assert_eq!(medium.len(), 6);
    assert_eq!(flexfec_decode(&medium, 1000).unwrap(), vec![1000, 1015]);
}
