//! Periodic RTCP terminator (component J).
//!
//! Generates compound RR(+REMB) packets at a fixed 500 ms cadence and
//! terminates NACK/FIR/PLI locally instead of forwarding them further:
//! NACKs are resolved against the outbound packet cache and answered with a
//! retransmission; FIR/PLI are delegated to the translator's feedback-message
//! sender (§4.10). One [`Terminator`] serves one peer's received stream(s);
//! a [`TerminatorScheduler`] owns the single periodic thread that ticks every
//! registered terminator (§5).
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

use crate::connector::{PacketCache, ReceiveStatistics, RemoteBitrateEstimator};
use crate::error::MediaEngineResult;
use crate::rtcp::{self, FeedbackBody, FeedbackPacket, ReceiverReport, RembFci, RtcpPacket};
use crate::rtp_handler::RtpPacket;
use crate::rtx::{RtxMode, RtxTransformer};
use crate::translator::Translator;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Fixed reporting cadence (§4.10).
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);
/// RFC 3550 limit on reception-report blocks per RR packet.
const MAX_BLOCKS_PER_RR: usize = 31;

#[derive(Debug, Clone, Copy)]
pub struct TerminatorConfig {
    /// Mirrors `DISABLE_NACK_TERMINATION` (§6): when true, NACKs are not
    /// answered locally (they still pass through dispersal untouched).
    pub nack_termination_enabled: bool,
}

impl Default for TerminatorConfig {
    fn default() -> Self {
        TerminatorConfig { nack_termination_enabled: true }
    }
}

#[derive(Debug, Default)]
pub struct TerminatorStats {
    pub packets_retransmitted: AtomicU64,
    pub packets_not_retransmitted: AtomicU64,
    pub packets_missing_from_cache: AtomicU64,
}

/// Terminates RTCP feedback for one peer's incoming stream(s) and generates
/// that peer's periodic RR/REMB reports.
pub struct Terminator {
    peer_id: String,
    local_ssrc: Mutex<Option<u32>>,
    rtt_ms: AtomicU64,
    config: Mutex<TerminatorConfig>,
    stats: TerminatorStats,
    translator: Arc<Translator>,
    receive_stats: Arc<dyn ReceiveStatistics>,
    packet_cache: Arc<dyn PacketCache>,
    bitrate_estimator: Arc<dyn RemoteBitrateEstimator>,
    rtx: RtxTransformer,
    rtx_mode: Mutex<RtxMode>,
    rtx_seq: AtomicU16,
}

impl Terminator {
    pub fn new(
        peer_id: impl Into<String>,
        translator: Arc<Translator>,
        receive_stats: Arc<dyn ReceiveStatistics>,
        packet_cache: Arc<dyn PacketCache>,
        bitrate_estimator: Arc<dyn RemoteBitrateEstimator>,
    ) -> Arc<Self> {
        Arc::new(Terminator {
            peer_id: peer_id.into(),
            local_ssrc: Mutex::new(None),
            rtt_ms: AtomicU64::new(100),
            config: Mutex::new(TerminatorConfig::default()),
            stats: TerminatorStats::default(),
            translator,
            receive_stats,
            packet_cache,
            bitrate_estimator,
            rtx: RtxTransformer,
            rtx_mode: Mutex::new(RtxMode::Bare),
            rtx_seq: AtomicU16::new(0),
        })
    }

    pub fn set_local_ssrc(&self, ssrc: u32) {
        *self.local_ssrc.lock().unwrap() = Some(ssrc);
    }

    pub fn set_rtt_ms(&self, rtt_ms: u64) {
        self.rtt_ms.store(rtt_ms, Ordering::Relaxed);
    }

    pub fn set_rtx_mode(&self, mode: RtxMode) {
        *self.rtx_mode.lock().unwrap() = mode;
    }

    pub fn set_config(&self, config: TerminatorConfig) {
        *self.config.lock().unwrap() = config;
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.packets_retransmitted.load(Ordering::Relaxed),
            self.stats.packets_not_retransmitted.load(Ordering::Relaxed),
            self.stats.packets_missing_from_cache.load(Ordering::Relaxed),
        )
    }

    /// §4.10's periodic tick: build and inject a compound RR(+REMB) packet.
    /// `now_ms` is supplied by the caller (the scheduler thread, in
    /// production) so the logic itself stays deterministic and testable.
    pub fn tick(&self, now_ms: u64) {
        let Some(local_ssrc) = *self.local_ssrc.lock().unwrap() else {
            return;
        };
        let blocks = self.receive_stats.snapshot();

        let mut packets: Vec<RtcpPacket> = Vec::new();
        if blocks.is_empty() {
            packets.push(RtcpPacket::Rr(ReceiverReport::new(local_ssrc, vec![])));
        } else {
            for chunk in blocks.chunks(MAX_BLOCKS_PER_RR) {
                packets.push(RtcpPacket::Rr(ReceiverReport::new(local_ssrc, chunk.to_vec())));
            }
        }

        let estimate = self.bitrate_estimator.latest_estimate_bps();
        if estimate >= 0 {
            let ssrcs = self.bitrate_estimator.observed_ssrcs();
            let remb = FeedbackPacket {
                header: crate::rtcp::RtcpHeader {
                    version: 2,
                    padding: false,
                    count: rtcp::feedback::REMB_FMT,
                    packet_type: crate::rtcp::RtcpPacketType::PayloadSpecificFeedback,
                    length: 0,
                },
                class: crate::rtcp::FeedbackClass::PayloadSpecific,
                sender_ssrc: local_ssrc,
                source_ssrc: 0,
                body: FeedbackBody::Remb(RembFci::new(ssrcs, estimate as u64)),
            };
            packets.push(RtcpPacket::Fb(remb));
        }

        match rtcp::assemble(&packets) {
            Ok(buf) => {
                if let Err(err) = self.translator.send_to_peer(&self.peer_id, &buf, true) {
                    warn!(peer = %self.peer_id, error = %err, "failed to inject periodic RTCP");
                }
            }
            Err(err) => warn!(peer = %self.peer_id, error = %err, "failed to assemble periodic RTCP"),
        }
        trace!(peer = %self.peer_id, now_ms, "periodic RTCP tick");
    }

    /// Handles one feedback sub-packet received from this terminator's peer.
    pub fn handle_feedback(&self, fb: &FeedbackPacket, now_ms: u64) {
        match &fb.body {
            FeedbackBody::Nack(nack) => {
                if !self.config.lock().unwrap().nack_termination_enabled {
                    return;
                }
                for seq in nack.unpack() {
                    self.handle_one_nack(fb.source_ssrc, seq, now_ms);
                }
            }
            FeedbackBody::Fir(_) => {
                if let Err(err) = self.translator.send_fir(fb.source_ssrc, fb.sender_ssrc, 0) {
                    warn!(error = %err, source_ssrc = fb.source_ssrc, "failed to deliver FIR");
                }
            }
            FeedbackBody::Pli => {
                if let Err(err) = self.translator.send_pli(fb.source_ssrc, fb.sender_ssrc) {
                    warn!(error = %err, source_ssrc = fb.source_ssrc, "failed to deliver PLI");
                }
            }
            _ => {}
        }
    }

    fn handle_one_nack(&self, source_ssrc: u32, seq: u16, now_ms: u64) {
        let Some(cached) = self.packet_cache.get(source_ssrc, seq) else {
            self.stats.packets_missing_from_cache.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let rtt_ms = self.rtt_ms.load(Ordering::Relaxed);
        let threshold_ms = ((rtt_ms * 9) / 10).min(rtt_ms.saturating_sub(5));
        let age_ms = now_ms.saturating_sub(cached.time_added_ms);
        if age_ms < threshold_ms {
            self.stats.packets_not_retransmitted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let original = match RtpPacket::parse(&cached.buffer) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, source_ssrc, seq, "cached packet failed to parse, dropping retransmit");
                self.stats.packets_missing_from_cache.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let mode = *self.rtx_mode.lock().unwrap();
        let rtx_seq = self.rtx_seq.fetch_add(1, Ordering::Relaxed);
        let wrapped = self.rtx.wrap(&original, rtx_seq, mode);
        let buf = wrapped.serialize();
        if let Err(err) = self.translator.send_to_peer(&self.peer_id, &buf, false) {
            warn!(peer = %self.peer_id, error = %err, "retransmit write failed");
        }
        self.stats.packets_retransmitted.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %self.peer_id, source_ssrc, seq, "retransmitted NACK'd packet");
    }
}

/// Owns the single periodic-scheduler thread that ticks every registered
/// terminator (§5: "a single periodic scheduler that fires each
/// terminator's tick").
pub struct TerminatorScheduler {
    terminators: Mutex<Vec<Arc<Terminator>>>,
    closed: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TerminatorScheduler {
    pub fn new() -> Arc<Self> {
        let scheduler = Arc::new(TerminatorScheduler {
            terminators: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        });
        scheduler.clone().start();
        scheduler
    }

    pub fn register(&self, terminator: Arc<Terminator>) {
        self.terminators.lock().unwrap().push(terminator);
    }

    fn start(self: Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let scheduler = self.clone();
        *worker = Some(thread::spawn(move || loop {
            if scheduler.closed.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(TICK_INTERVAL);
            if scheduler.closed.load(Ordering::Acquire) {
                break;
            }
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            for terminator in scheduler.terminators.lock().unwrap().iter() {
                terminator.tick(now_ms);
            }
        }));
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TerminatorScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{CachedPacket, NoEstimate, NoReceiveStatistics};
    use crate::rtcp::{NackFci, RtcpHeader, RtcpPacketType};
    use crate::rtp_handler::RtpHeader;
    use crate::stream_manager::Direction;
    use bytes::Bytes;
    use std::sync::mpsc;

    struct FixedCache {
        entries: Mutex<std::collections::HashMap<(u32, u16), CachedPacket>>,
    }
    impl PacketCache for FixedCache {
        fn get(&self, ssrc: u32, seq: u16) -> Option<CachedPacket> {
            self.entries.lock().unwrap().get(&(ssrc, seq)).cloned()
        }
    }

    fn make_rtp(seq: u16, ssrc: u32) -> Vec<u8> {
        let packet = RtpPacket {
            header: RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: false,
                payload_type: 96,
                sequence_number: seq,
                timestamp: 0,
                ssrc,
                csrc: vec![],
                extension_header: None,
            },
            payload: Bytes::from_static(b"x"),
        };
        packet.serialize().to_vec()
    }

    fn nack_feedback(source_ssrc: u32, pid: u16) -> FeedbackPacket {
        FeedbackPacket {
            header: RtcpHeader {
                version: 2,
                padding: false,
                count: rtcp::feedback::NACK_FMT,
                packet_type: RtcpPacketType::TransportFeedback,
                length: 0,
            },
            class: crate::rtcp::FeedbackClass::TransportLayer,
            sender_ssrc: 1,
            source_ssrc,
            body: FeedbackBody::Nack(NackFci::pack(&[pid])),
        }
    }

    fn nack_feedback_range(source_ssrc: u32, pids: &[u16]) -> FeedbackPacket {
        FeedbackPacket {
            header: RtcpHeader {
                version: 2,
                padding: false,
                count: rtcp::feedback::NACK_FMT,
                packet_type: RtcpPacketType::TransportFeedback,
                length: 0,
            },
            class: crate::rtcp::FeedbackClass::TransportLayer,
            sender_ssrc: 1,
            source_ssrc,
            body: FeedbackBody::Nack(NackFci::pack(pids)),
        }
    }

    #[test]
    fn s4_nack_driven_retransmit_honors_rtt_threshold() {
        let translator = Translator::new();
        let (conn, data_rx, _ctrl_rx) = {
            use crate::connector::{Connector, DataInput, DataOutput};
            struct Out(mpsc::Sender<Vec<u8>>);
            impl DataOutput for Out {
                fn write(&self, buf: &[u8]) -> MediaEngineResult<usize> {
                    let _ = self.0.send(buf.to_vec());
                    Ok(buf.len())
                }
            }
            struct In;
            impl DataInput for In {
                fn set_on_data(&self, _handler: Box<dyn Fn(&[u8]) + Send + Sync>) {}
            }
            struct C {
                data_output: Out,
                control_output: Out,
            }
            impl Connector for C {
                fn data_output(&self) -> &dyn DataOutput {
                    &self.data_output
                }
                fn control_output(&self) -> &dyn DataOutput {
                    &self.control_output
                }
                fn data_input(&self) -> &dyn DataInput {
                    static IN: In = In;
                    &IN
                }
                fn control_input(&self) -> &dyn DataInput {
                    static IN: In = In;
                    &IN
                }
                fn close(&self) {}
            }
            let (tx, rx) = mpsc::channel();
            let (ctx, crx) = mpsc::channel();
            (
                Arc::new(C { data_output: Out(tx), control_output: Out(ctx) }),
                rx,
                crx,
            )
        };
        translator.attach("sender", Direction::SendRecv, conn);

        let mut entries = std::collections::HashMap::new();
        entries.insert((0xDEADBEEFu32, 1000u16), CachedPacket { buffer: make_rtp(1000, 0xDEADBEEF), time_added_ms: 0 });
        entries.insert((0xDEADBEEFu32, 1001u16), CachedPacket { buffer: make_rtp(1001, 0xDEADBEEF), time_added_ms: 0 });
        let cache = Arc::new(FixedCache { entries: Mutex::new(entries) });

        let terminator = Terminator::new(
            "sender",
            translator.clone(),
            Arc::new(NoReceiveStatistics),
            cache,
            Arc::new(NoEstimate),
        );
        terminator.set_rtt_ms(100);

        // PID=1000, BLP=0x0001 covers both 1000 and 1001.
        let fb = nack_feedback_range(0xDEADBEEF, &[1000, 1001]);
        terminator.handle_feedback(&fb, 200);

        let (retransmitted, not_retransmitted, missing) = terminator.stats();
        assert_eq!(retransmitted, 2);
        assert_eq!(not_retransmitted, 0);
        assert_eq!(missing, 0);

        data_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        data_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn nack_too_recent_is_not_retransmitted() {
        let translator = Translator::new();
        let cache = Arc::new(FixedCache { entries: Mutex::new(std::collections::HashMap::new()) });
        let terminator = Terminator::new(
            "p",
            translator,
            Arc::new(NoReceiveStatistics),
            cache.clone(),
            Arc::new(NoEstimate),
        );
        cache.entries.lock().unwrap().insert(
            (1, 5),
            CachedPacket { buffer: make_rtp(5, 1), time_added_ms: 100 },
        );
        terminator.set_rtt_ms(100);
        terminator.handle_one_nack(1, 5, 105); // age 5ms < threshold
        let (retransmitted, not_retransmitted, _) = terminator.stats();
        assert_eq!(retransmitted, 0);
        assert_eq!(not_retransmitted, 1);
    }

    #[test]
    fn nack_cache_miss_counts_as_missing() {
        let translator = Translator::new();
        let cache = Arc::new(FixedCache { entries: Mutex::new(std::collections::HashMap::new()) });
        let terminator = Terminator::new("p", translator, Arc::new(NoReceiveStatistics), cache, Arc::new(NoEstimate));
        terminator.handle_one_nack(1, 999, 1_000_000);
        let (_, _, missing) = terminator.stats();
        assert_eq!(missing, 1);
    }

    #[test]
    fn disabled_nack_termination_skips_handling() {
        let translator = Translator::new();
        let cache = Arc::new(FixedCache { entries: Mutex::new(std::collections::HashMap::new()) });
        let terminator = Terminator::new("p", translator, Arc::new(NoReceiveStatistics), cache, Arc::new(NoEstimate));
        terminator.set_config(TerminatorConfig { nack_termination_enabled: false });
        terminator.handle_feedback(&nack_feedback(1, 5), 0);
        let (retransmitted, not_retransmitted, missing) = terminator.stats();
        assert_eq!((retransmitted, not_retransmitted, missing), (0, 0, 0));
    }
}
