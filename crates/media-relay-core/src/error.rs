//! Error types for the realtime media engine
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


use thiserror::Error;

/// Result type for media engine operations
pub type MediaEngineResult<T> = Result<T, MediaEngineError>;

/// Errors that can occur in the media relay core.
///
/// Each variant maps to one of the error kinds the core is expected to raise:
/// a malformed packet is never allowed to propagate as a panic or tear down a peer,
/// so every parser returns one of these instead of unwinding.
#[derive(Error, Debug)]
pub enum MediaEngineError {
    /// Buffer too short, wrong RTP/RTCP version, or an inconsistent length field.
    /// Counted by the caller, then the packet is dropped.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// FCI (or other sub-structure) malformed mid-parse. The remainder of a
    /// compound RTCP buffer is still processed by the caller.
    #[error("parse error: {0}")]
    ParseError(String),

    /// A bounded queue was full; the oldest entry was dropped instead.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A configuration change was vetoed by a listener; no mutation occurred.
    #[error("configuration change vetoed: {0}")]
    Veto(String),

    /// The underlying connector failed. The affected peer is not torn down
    /// automatically; the signaling layer decides.
    #[error("io error: {0}")]
    Io(String),

    /// A feature the wire format allows but this core does not implement
    /// (e.g. FlexFEC with more than one protected SSRC). Packet dropped.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Stream manager has no entry for the given peer or SSRC.
    #[error("stream not found: {stream_id}")]
    StreamNotFound { stream_id: String },

    /// A peer or send-stream key is already registered.
    #[error("stream already exists: {stream_id}")]
    StreamExists { stream_id: String },

    /// A state transition that the stream/send-stream lifecycle forbids.
    #[error("invalid stream state: {state}")]
    InvalidStreamState { state: String },
}

impl From<std::io::Error> for MediaEngineError {
    fn from(err: std::io::Error) -> Self {
        MediaEngineError::Io(err.to_string())
    }
}

