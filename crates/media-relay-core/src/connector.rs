//! External connector, packet-cache, and remote-bitrate-estimator contracts
//! (component L, §6). These are the seams the translator and terminator
//! depend on as trait objects; the core never owns a connector or implements
//! transport/caching/estimation itself (§1's external collaborators).
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

use crate::error::MediaEngineResult;

/// A push-style byte source: data arrives asynchronously (from the network,
/// in the real deployment) and the mux reads it out via [`DataOutput::write`]
/// style pull semantics is the wrong direction here — inbound streams push
/// into the mux's `on_data` callback, which the connector owns the other end
/// of. The core never drives this itself; it registers interest.
pub trait DataInput: Send + Sync {
    /// Minimum number of bytes the mux should allocate before issuing a read
    /// against this source (§4.9). A connector backed by UDP typically
    /// reports the link MTU; 2 KiB is this core's own default when a
    /// concrete connector doesn't override it.
    fn minimum_transfer_size(&self) -> usize {
        2048
    }

    /// Registers interest in arriving bytes. The connector invokes `handler`
    /// once per received buffer, from whatever thread its own I/O lives on;
    /// the handler must not block (it typically just calls
    /// [`crate::mux::MuxInput::push`]).
    fn set_on_data(&self, handler: Box<dyn Fn(&[u8]) + Send + Sync>);
}

/// A write sink for outbound bytes. `write` returns the number of bytes
/// actually accepted; the core treats a short write as `io` error territory
/// but does not retry — retry policy belongs to the connector.
pub trait DataOutput: Send + Sync {
    fn write(&self, buf: &[u8]) -> MediaEngineResult<usize>;
}

/// Per-peer connector: four abstract byte streams (data in/out, control
/// in/out). `close` releases all four. The translator never takes ownership
/// — the caller supplies the connector and is responsible for the
/// underlying network I/O (UDP/DTLS/SRTP all live below this line).
pub trait Connector: Send + Sync {
    fn data_output(&self) -> &dyn DataOutput;
    fn control_output(&self) -> &dyn DataOutput;
    fn data_input(&self) -> &dyn DataInput;
    fn control_input(&self) -> &dyn DataInput;
    fn close(&self);
}

/// One packet retained by the external packet cache (consumed, not owned,
/// by this core — §6).
#[derive(Debug, Clone)]
pub struct CachedPacket {
    pub buffer: Vec<u8>,
    pub time_added_ms: u64,
}

/// `get(ssrc, seq) -> CachedPacket | absent`. Bounded and lossy; used only
/// for retransmission decisions by the terminator (J).
pub trait PacketCache: Send + Sync {
    fn get(&self, ssrc: u32, seq: u16) -> Option<CachedPacket>;
}

/// `latest_estimate_bps() -> -1 for "no estimate"`; `observed_ssrcs()` lists
/// the SSRCs the estimate currently covers. Bandwidth estimation algorithms
/// themselves are out of scope (§1) — this core only consumes the result.
pub trait RemoteBitrateEstimator: Send + Sync {
    fn latest_estimate_bps(&self) -> i64;
    fn observed_ssrcs(&self) -> Vec<u32>;
}

/// A fixed estimator useful for tests and for peers with no estimator wired
/// up; reports "no estimate" unconditionally.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEstimate;

impl RemoteBitrateEstimator for NoEstimate {
    fn latest_estimate_bps(&self) -> i64 {
        -1
    }

    fn observed_ssrcs(&self) -> Vec<u32> {
        Vec::new()
    }
}

/// Per-track receive statistics consumed by the terminator (J) to build RR
/// blocks (§4.10 step 2). The core never computes loss/jitter itself — that
/// bookkeeping lives with whatever tracks incoming sequence numbers per SSRC.
pub trait ReceiveStatistics: Send + Sync {
    fn snapshot(&self) -> Vec<crate::rtcp::ReceptionReport>;
}

/// A stats provider with nothing to report; useful before any receive
/// statistics have been wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReceiveStatistics;

impl ReceiveStatistics for NoReceiveStatistics {
    fn snapshot(&self) -> Vec<crate::rtcp::ReceptionReport> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_estimate_reports_sentinel() {
        let estimator = NoEstimate;
        assert_eq!(estimator.latest_estimate_bps(), -1);
        assert!(estimator.observed_ssrcs().is_empty());
    }
}
