//! Remote-clock estimator (component D).
//!
//! Maintains, per SSRC, the last NTP↔RTP timestamp sample observed from a
//! Sender Report and a derived clock rate, so the terminator can project an
//! RTP timestamp forward/backward to wall-clock time (used by jitter/RTT
//! reporting and by feedback generators that need to align streams).
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
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

/// Video streams always report a fixed 90 kHz clock (§4.4), regardless of
/// what successive SR deltas would otherwise compute.
pub const VIDEO_CLOCK_RATE_HZ: u32 = 90_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    sample_system_ms: u64,
    sample_rtp_ts: u32,
    frequency_hz: Option<i64>,
    captured_local_ms: u64,
    /// Set when the computed frequency is outside a sane range — the
    /// sender's clock is non-monotone or wrapped. Tolerated, not rejected
    /// (§4.4 note), but surfaced so callers can down-weight the sample.
    suspect: bool,
}

/// The 64-bit NTP timestamp from an SR, split into seconds-since-1900 and a
/// Q32.32 fraction, converted here to milliseconds since the Unix epoch.
pub fn ntp_to_unix_ms(ntp_seconds: u32, ntp_fraction: u32) -> u64 {
    const NTP_UNIX_EPOCH_DELTA_SECS: u64 = 2_208_988_800; // 1900-01-01 -> 1970-01-01
    let secs = ntp_seconds as u64;
    let unix_secs = secs.saturating_sub(NTP_UNIX_EPOCH_DELTA_SECS);
    let frac_ms = (ntp_fraction as u64 * 1000) >> 32;
    unix_secs * 1000 + frac_ms
}

/// Per-SSRC clock estimator. One instance serves every peer's streams; SSRC
/// collisions across peers cannot happen because the translator only ever
/// feeds it SSRCs a stream manager has claimed.
#[derive(Default)]
pub struct RemoteClockEstimator {
    samples: Mutex<HashMap<u32, Sample>>,
}

impl RemoteClockEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new Sender Report sample for `ssrc`, replacing whatever
    /// sample existed wholesale (§4.4: "replace the sample wholesale").
    pub fn on_sender_report(
        &self,
        ssrc: u32,
        ntp_seconds: u32,
        ntp_fraction: u32,
        rtp_ts: u32,
        media_kind: MediaKind,
        local_ms: u64,
    ) {
        let sample_system_ms = ntp_to_unix_ms(ntp_seconds, ntp_fraction);
        let mut samples = self.samples.lock().unwrap();

        let (frequency_hz, suspect) = match media_kind {
            MediaKind::Video => (Some(VIDEO_CLOCK_RATE_HZ as i64), false),
            MediaKind::Audio => match samples.get(&ssrc) {
                Some(prev) => {
                    let dt_ms = sample_system_ms as i64 - prev.sample_system_ms as i64;
                    if dt_ms == 0 {
                        (prev.frequency_hz, true)
                    } else {
                        let dts = rtp_ts.wrapping_sub(prev.sample_rtp_ts) as i32 as i64;
                        let freq = (dts * 1000) / dt_ms;
                        // Sources sometimes emit non-monotone timestamps,
                        // producing implausible or negative rates (§4.4);
                        // tolerate it but flag it as suspect.
                        let suspect = !(1_000..=200_000).contains(&freq);
                        (Some(freq), suspect)
                    }
                }
                None => (None, false),
            },
        };

        samples.insert(
            ssrc,
            Sample {
                sample_system_ms,
                sample_rtp_ts: rtp_ts,
                frequency_hz,
                captured_local_ms: local_ms,
                suspect,
            },
        );
        trace!(ssrc, frequency_hz = ?frequency_hz, suspect, "remote clock sample updated");
    }

    /// Projects the last sample forward by `local_ms - captured_local_ms`,
    /// returning `(rtp_ts, system_ms)`.
    pub fn estimate(&self, ssrc: u32, local_ms: u64) -> MediaEngineResult<(u32, u64)> {
        let samples = self.samples.lock().unwrap();
        let sample = samples
            .get(&ssrc)
            .ok_or_else(|| MediaEngineError::StreamNotFound {
                stream_id: format!("ssrc {}", ssrc),
            })?;
        let freq = sample
            .frequency_hz
            .ok_or_else(|| MediaEngineError::NotSupported("no-frequency".to_string()))?;

        let elapsed_ms = local_ms as i64 - sample.captured_local_ms as i64;
        let rtp_delta = (freq * elapsed_ms) / 1000;
        let rtp_ts = sample.sample_rtp_ts.wrapping_add(rtp_delta as i32 as u32);
        let system_ms = (sample.sample_system_ms as i64 + elapsed_ms).max(0) as u64;
        Ok((rtp_ts, system_ms))
    }

    /// Linear extrapolation from the last sample: given an RTP timestamp,
    /// what wall-clock time (ms) does it correspond to.
    pub fn rtp_to_remote_system_ms(&self, ssrc: u32, rtp_ts: u32) -> MediaEngineResult<u64> {
        let samples = self.samples.lock().unwrap();
        let sample = samples
            .get(&ssrc)
            .ok_or_else(|| MediaEngineError::StreamNotFound {
                stream_id: format!("ssrc {}", ssrc),
            })?;
        let freq = sample
            .frequency_hz
            .ok_or_else(|| MediaEngineError::NotSupported("no-frequency".to_string()))?;
        if freq == 0 {
            return Err(MediaEngineError::NotSupported("no-frequency".to_string()));
        }

        let ts_delta = rtp_ts.wrapping_sub(sample.sample_rtp_ts) as i32 as i64;
        let ms_delta = (ts_delta * 1000) / freq;
        Ok((sample.sample_system_ms as i64 + ms_delta).max(0) as u64)
    }

    /// Inverse of [`Self::rtp_to_remote_system_ms`]: what RTP timestamp
    /// corresponds to a given wall-clock time.
    pub fn system_ms_to_rtp(&self, ssrc: u32, system_ms: u64) -> MediaEngineResult<u32> {
        let samples = self.samples.lock().unwrap();
        let sample = samples
            .get(&ssrc)
            .ok_or_else(|| MediaEngineError::StreamNotFound {
                stream_id: format!("ssrc {}", ssrc),
            })?;
        let freq = sample
            .frequency_hz
            .ok_or_else(|| MediaEngineError::NotSupported("no-frequency".to_string()))?;

        let ms_delta = system_ms as i64 - sample.sample_system_ms as i64;
        let ts_delta = (freq * ms_delta) / 1000;
        Ok(sample.sample_rtp_ts.wrapping_add(ts_delta as i32 as u32))
    }

    pub fn is_suspect(&self, ssrc: u32) -> bool {
        self.samples
            .lock()
            .unwrap()
            .get(&ssrc)
            .map(|s| s.suspect)
            .unwrap_or(false)
    }
}
