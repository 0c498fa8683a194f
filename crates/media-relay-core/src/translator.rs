//! Peer fan-out core (component I).
//!
//! One [`Translator`] serves a conference. Peers attach and detach their
//! connectors; every RTP/RTCP buffer arriving from one peer is dispersed to
//! every other eligible peer, with a per-destination payload-type rewrite,
//! an SSRC-ownership gate that prevents cross-talk, and (for payload-specific
//! feedback) a per-destination receive-SSRC filter (§4.8).
//!
//! Ingestion is decoupled from the connectors' own I/O threads via a shared
//! [`MuxInput`]; dispersal is decoupled from the ingestion path via a shared
//! [`MuxOutput`] per plane (data, control) — so one slow destination can
//! never block delivery to the others, and a stalled connector can never
//! block the peer that is still sending (§4.9, §5).
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

use crate::connector::Connector;
use crate::error::{MediaEngineError, MediaEngineResult};
use crate::mux::{MuxInput, MuxOutput, DEFAULT_QUEUE_CAPACITY};
use crate::rtcp::{self, FeedbackClass, RtcpPacket};
use crate::stream_manager::{Direction, Format, SendStreamKey, SendStreamRegistry, StreamManager};
use crate::wire;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{trace, warn};

struct PeerEntry {
    manager: Arc<StreamManager>,
}

/// The fan-out core shared by every peer attached to one conference.
/// Always held behind an `Arc` — attach/detach register closures that need
/// to outlive the call that created them.
pub struct Translator {
    peers: Mutex<HashMap<String, PeerEntry>>,
    /// Global SSRC ownership, arbitrated across all peers (not per-peer):
    /// the first peer to emit a given SSRC owns it for the life of the
    /// conference; any other peer emitting the same SSRC is cross-talk and
    /// is dropped (§4.8 step 4).
    ssrc_owners: Mutex<HashMap<u32, String>>,
    index_to_peer: Mutex<HashMap<usize, String>>,
    next_index: AtomicUsize,
    send_streams: SendStreamRegistry,
    data_in: MuxInput,
    control_in: MuxInput,
    data_out: MuxOutput,
    control_out: MuxOutput,
    /// Mirrors the `REMOVE_RTP_HEADER_EXTENSIONS` configuration key (§6):
    /// when set, the extension header is stripped from every outbound RTP
    /// packet during dispersal.
    remove_rtp_header_extensions: std::sync::atomic::AtomicBool,
}

impl Translator {
    pub fn new() -> Arc<Self> {
        let translator = Arc::new(Translator {
            peers: Mutex::new(HashMap::new()),
            ssrc_owners: Mutex::new(HashMap::new()),
            index_to_peer: Mutex::new(HashMap::new()),
            next_index: AtomicUsize::new(0),
            send_streams: SendStreamRegistry::new(),
            data_in: MuxInput::new(DEFAULT_QUEUE_CAPACITY),
            control_in: MuxInput::new(DEFAULT_QUEUE_CAPACITY),
            data_out: MuxOutput::new(DEFAULT_QUEUE_CAPACITY),
            control_out: MuxOutput::new(DEFAULT_QUEUE_CAPACITY),
            remove_rtp_header_extensions: std::sync::atomic::AtomicBool::new(false),
        });

        let for_data_in = translator.clone();
        translator
            .data_in
            .set_handler(move |tagged| for_data_in.on_ingested(tagged.source, tagged.buf, false));

        let for_control_in = translator.clone();
        translator
            .control_in
            .set_handler(move |tagged| for_control_in.on_ingested(tagged.source, tagged.buf, true));

        let for_data_out = translator.clone();
        translator.data_out.start(move |packet| for_data_out.dispatch_rtp(packet));

        let for_control_out = translator.clone();
        translator
            .control_out
            .start(move |packet| for_control_out.dispatch_rtcp(packet));

        translator
    }

    /// Attaches a peer: opens its four sub-streams via `connector` and wires
    /// the data/control inputs into the shared ingestion muxes (§4.8 step 1).
    /// Returns the peer's [`StreamManager`] for format/direction/listener
    /// configuration.
    pub fn attach(
        self: &Arc<Self>,
        peer_id: impl Into<String>,
        direction: Direction,
        connector: Arc<dyn Connector>,
    ) -> Arc<StreamManager> {
        let peer_id = peer_id.into();
        let manager = Arc::new(StreamManager::new(peer_id.clone(), direction));
        manager.bind_connector(Some(connector.clone()));

        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.index_to_peer.lock().unwrap().insert(index, peer_id.clone());

        let for_data = self.clone();
        connector
            .data_input()
            .set_on_data(Box::new(move |buf| for_data.data_in.push(index, buf.to_vec())));

        let for_control = self.clone();
        connector
            .control_input()
            .set_on_data(Box::new(move |buf| for_control.control_in.push(index, buf.to_vec())));

        self.peers.lock().unwrap().insert(peer_id, PeerEntry { manager: manager.clone() });
        manager
    }

    /// Detaches a peer: closes its connector, releases any SSRCs it owned,
    /// and removes it from dispersal (§4.8 step 1, reverse direction).
    pub fn detach(&self, peer_id: &str) {
        let Some(entry) = self.peers.lock().unwrap().remove(peer_id) else {
            return;
        };
        self.ssrc_owners.lock().unwrap().retain(|_, owner| owner != peer_id);
        self.index_to_peer.lock().unwrap().retain(|_, p| p != peer_id);
        if let Some(connector) = entry.manager.connector() {
            connector.close();
        }
        entry.manager.bind_connector(None);
    }

    /// Sets whether outbound RTP packets have their extension header
    /// stripped during dispersal, mirroring the `REMOVE_RTP_HEADER_EXTENSIONS`
    /// configuration key (§6).
    pub fn set_remove_rtp_header_extensions(&self, enabled: bool) {
        self.remove_rtp_header_extensions.store(enabled, Ordering::Relaxed);
    }

    /// Registers a payload-type mapping for `peer_id` (§4.8 step 2).
    pub fn add_format(&self, peer_id: &str, format: Format, pt: u8) -> MediaEngineResult<()> {
        let peers = self.peers.lock().unwrap();
        let entry = peers
            .get(peer_id)
            .ok_or_else(|| MediaEngineError::StreamNotFound { stream_id: peer_id.to_string() })?;
        entry.manager.add_format(format, pt);
        Ok(())
    }

    /// Creates (or adds a reference to) a named send stream (§3). The first
    /// caller to reference a given key starts it; see [`SendStreamRegistry`].
    pub fn create_send_stream(&self, key: SendStreamKey) -> MediaEngineResult<bool> {
        self.send_streams.create_send_stream(key)
    }

    pub fn release_send_stream(&self, key: &SendStreamKey) -> MediaEngineResult<(bool, bool)> {
        self.send_streams.release_send_stream(key)
    }

    /// Writes `buf` directly to one peer's data or control output, bypassing
    /// dispersal. Used by the terminator to deliver synthesized RTCP (RR,
    /// REMB, NACK-triggered retransmits) that targets exactly one peer.
    pub fn send_to_peer(&self, peer_id: &str, buf: &[u8], is_rtcp: bool) -> MediaEngineResult<()> {
        let peers = self.peers.lock().unwrap();
        let entry = peers
            .get(peer_id)
            .ok_or_else(|| MediaEngineError::StreamNotFound { stream_id: peer_id.to_string() })?;
        let connector = entry
            .manager
            .connector()
            .ok_or_else(|| MediaEngineError::InvalidStreamState { state: "peer has no connector bound".to_string() })?;
        let output = if is_rtcp { connector.control_output() } else { connector.data_output() };
        output.write(buf)?;
        Ok(())
    }

    /// Sends a Full Intra Request to whichever peer owns `source_ssrc`, on
    /// behalf of `local_ssrc` (§4.10: the terminator delegates FIR/PLI to
    /// the translator's feedback-message sender).
    pub fn send_fir(&self, source_ssrc: u32, local_ssrc: u32, seq_nr: u8) -> MediaEngineResult<()> {
        let owner = self.owner_of(source_ssrc)?;
        let fir = RtcpPacket::Fb(rtcp::FeedbackPacket {
            header: crate::rtcp::RtcpHeader {
                version: 2,
                padding: false,
                count: rtcp::feedback::FIR_FMT,
                packet_type: crate::rtcp::RtcpPacketType::PayloadSpecificFeedback,
                length: 0,
            },
            class: FeedbackClass::PayloadSpecific,
            sender_ssrc: local_ssrc,
            source_ssrc,
            body: crate::rtcp::FeedbackBody::Fir(crate::rtcp::FirFci {
                entries: vec![crate::rtcp::FirEntry { ssrc: source_ssrc, seq_nr }],
            }),
        });
        let buf = rtcp::assemble(&[fir])?;
        self.send_to_peer(&owner, &buf, true)
    }

    /// Sends a Picture Loss Indication to whichever peer owns `source_ssrc`.
    pub fn send_pli(&self, source_ssrc: u32, local_ssrc: u32) -> MediaEngineResult<()> {
        let owner = self.owner_of(source_ssrc)?;
        let pli = RtcpPacket::Fb(rtcp::FeedbackPacket {
            header: crate::rtcp::RtcpHeader {
                version: 2,
                padding: false,
                count: rtcp::feedback::PLI_FMT,
                packet_type: crate::rtcp::RtcpPacketType::PayloadSpecificFeedback,
                length: 0,
            },
            class: FeedbackClass::PayloadSpecific,
            sender_ssrc: local_ssrc,
            source_ssrc,
            body: crate::rtcp::FeedbackBody::Pli,
        });
        let buf = rtcp::assemble(&[pli])?;
        self.send_to_peer(&owner, &buf, true)
    }

    fn owner_of(&self, ssrc: u32) -> MediaEngineResult<String> {
        self.ssrc_owners
            .lock()
            .unwrap()
            .get(&ssrc)
            .cloned()
            .ok_or_else(|| MediaEngineError::StreamNotFound { stream_id: format!("ssrc {}", ssrc) })
    }

    pub fn peer(&self, peer_id: &str) -> Option<Arc<StreamManager>> {
        self.peers.lock().unwrap().get(peer_id).map(|e| e.manager.clone())
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.lock().unwrap().keys().cloned().collect()
    }

    fn on_ingested(&self, index: usize, buf: Vec<u8>, is_rtcp: bool) {
        let Some(peer_id) = self.index_to_peer.lock().unwrap().get(&index).cloned() else {
            return;
        };
        let Some(manager) = self.peer(&peer_id) else {
            return;
        };
        if !manager.direction().can_receive() {
            trace!(peer = %peer_id, "dropping input from a peer whose direction forbids receiving");
            return;
        }

        if is_rtcp {
            self.control_out.write(&buf, true, Some(peer_id), None);
            return;
        }

        let ssrc = match wire::rtp_ssrc(&buf, 0, buf.len()) {
            Ok(ssrc) => ssrc,
            Err(err) => {
                warn!(peer = %peer_id, error = %err, "dropping unparseable RTP buffer");
                return;
            }
        };

        {
            let mut owners = self.ssrc_owners.lock().unwrap();
            match owners.get(&ssrc) {
                None => {
                    owners.insert(ssrc, peer_id.clone());
                    manager.claim_receive_ssrc(ssrc);
                }
                Some(owner) if owner == &peer_id => {
                    manager.claim_receive_ssrc(ssrc);
                }
                Some(owner) => {
                    warn!(peer = %peer_id, other = %owner, ssrc, "dropping cross-talk: SSRC already owned by another peer");
                    return;
                }
            }
        }

        let source_format = match wire::rtp_pt(&buf, 0, buf.len()) {
            Ok(pt) => manager.format_for_pt(pt),
            Err(_) => None,
        };
        self.data_out.write(&buf, false, Some(peer_id), source_format);
    }

    fn dispatch_rtp(&self, packet: crate::mux::OutboundPacket) {
        let peers = self.peers.lock().unwrap();
        for (peer_id, entry) in peers.iter() {
            if packet.exclude_source.as_deref() == Some(peer_id.as_str()) {
                continue;
            }
            let manager = &entry.manager;
            if !manager.direction().can_send() {
                continue;
            }
            let Some(connector) = manager.connector() else {
                continue;
            };

            let mut buf = packet.buf.clone();
            if let Some(ref format) = packet.source_format {
                if let Some(dest_pt) = manager.pt_for_format(format) {
                    if let Err(err) = wire::rtp_set_pt(&mut buf, 0, dest_pt) {
                        warn!(peer = %peer_id, error = %err, "failed to rewrite payload type");
                        continue;
                    }
                }
                // Destination never negotiated this format: leave the PT
                // byte unchanged and forward the packet as-is (§4.8 step 4).
            }

            if self.remove_rtp_header_extensions.load(Ordering::Relaxed) {
                wire::rtp_strip_extension(&mut buf);
            }

            if let Err(err) = connector.data_output().write(&buf) {
                warn!(peer = %peer_id, error = %err, "dispersal write failed");
            }
        }
    }

    fn dispatch_rtcp(&self, packet: crate::mux::OutboundPacket) {
        let sub_packets = match rtcp::parse_compound(&packet.buf) {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "dropping unparseable compound RTCP");
                return;
            }
        };

        let peers = self.peers.lock().unwrap();
        for (peer_id, entry) in peers.iter() {
            if packet.exclude_source.as_deref() == Some(peer_id.as_str()) {
                continue;
            }
            let manager = &entry.manager;
            if !manager.direction().can_send() {
                continue;
            }
            let Some(connector) = manager.connector() else {
                continue;
            };

            let filtered: Vec<RtcpPacket> = sub_packets
                .iter()
                .filter(|p| match p {
                    RtcpPacket::Fb(fb) if fb.class == FeedbackClass::PayloadSpecific => {
                        manager.owns_receive_ssrc(fb.source_ssrc)
                    }
                    _ => true,
                })
                .cloned()
                .collect();
            if filtered.is_empty() {
                continue;
            }

            match rtcp::assemble(&filtered) {
                Ok(buf) => {
                    if let Err(err) = connector.control_output().write(&buf) {
                        warn!(peer = %peer_id, error = %err, "RTCP dispersal write failed");
                    }
                }
                Err(err) => warn!(peer = %peer_id, error = %err, "failed to assemble filtered RTCP"),
            }
        }
    }
}
