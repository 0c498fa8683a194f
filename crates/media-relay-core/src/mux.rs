//! Multiplexed input/output streams (§4.9).
//!
//! `MuxInput` fans in N push-style byte sources onto one bounded FIFO,
//! drained by a single pusher thread. `MuxOutput` fans out to M
//! destinations from one bounded FIFO, drained by a single writer thread.
//! Both exist to keep the translator's hot path non-blocking and to bound
//! memory under backpressure (§4.9, §5): a full queue drops its oldest
//! entry and counts it rather than blocking the caller.
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

use crate::stream_manager::Format;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{trace, warn};

/// Default bounded-queue capacity, matching a typical output connector's own
/// packet-queue depth (§4.8 concurrency notes).
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// How often the pusher/writer threads re-check their `closed` flag while
/// idle, so `close()` is observed promptly even with nothing queued (§5).
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One packet tagged with which source produced it, delivered to the
/// `MuxInput`'s transfer handler.
#[derive(Debug, Clone)]
pub struct TaggedPacket {
    pub source: usize,
    pub buf: Vec<u8>,
}

/// Fan-in of N push-style sources onto one bounded FIFO. Call [`push`] from
/// each source's "data available" callback; the pusher thread invokes the
/// registered handler for each packet in arrival order.
pub struct MuxInput {
    sender: Sender<TaggedPacket>,
    receiver: Receiver<TaggedPacket>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    handler: Arc<std::sync::Mutex<Option<Box<dyn FnMut(TaggedPacket) + Send>>>>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MuxInput {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        MuxInput {
            sender,
            receiver,
            closed: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            handler: Arc::new(std::sync::Mutex::new(None)),
            worker: std::sync::Mutex::new(None),
        }
    }

    /// Registers the transfer handler and starts the pusher thread. Calling
    /// this twice replaces the handler without restarting the thread.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnMut(TaggedPacket) + Send + 'static,
    {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
        self.ensure_started();
    }

    fn ensure_started(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let receiver = self.receiver.clone();
        let closed = self.closed.clone();
        let handler = self.handler.clone();
        *worker = Some(thread::spawn(move || loop {
            if closed.load(Ordering::Acquire) {
                break;
            }
            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(packet) => {
                    if let Some(f) = handler.lock().unwrap().as_mut() {
                        f(packet);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }));
    }

    /// Called by a source when a buffer is available. Drops and counts the
    /// oldest queued packet if the FIFO is full (§4.9's resource-exhausted
    /// policy); never blocks the caller.
    pub fn push(&self, source: usize, buf: Vec<u8>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let packet = TaggedPacket { source, buf };
        match self.sender.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                let _ = self.receiver.try_recv();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(source = packet.source, "MuxInput queue full, dropped oldest packet");
                let _ = self.sender.try_send(packet);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MuxInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// One packet queued for fan-out: the bytes, whether the translator should
/// rewrite the payload-type byte per destination, and which source (if any)
/// must be excluded from delivery (§4.8 step 4: a peer never receives its
/// own packet back).
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub buf: Vec<u8>,
    pub is_rtcp: bool,
    pub exclude_source: Option<String>,
    /// The format the source peer advertised for this RTP payload type, if
    /// known. `None` for RTCP packets, or when the source never registered
    /// a format for the PT it used.
    pub source_format: Option<Format>,
}

/// Fan-out over M destinations. A single writer thread drains the queue and
/// invokes `dispatch` for each packet; `dispatch` owns the per-destination
/// exclusion/PT-rewrite policy (kept out of this generic mux so it can be
/// reused by both the data and control planes).
pub struct MuxOutput {
    sender: Sender<OutboundPacket>,
    receiver: Receiver<OutboundPacket>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MuxOutput {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        MuxOutput {
            sender,
            receiver,
            closed: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: std::sync::Mutex::new(None),
        }
    }

    pub fn start<F>(&self, mut dispatch: F)
    where
        F: FnMut(OutboundPacket) + Send + 'static,
    {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let receiver = self.receiver.clone();
        let closed = self.closed.clone();
        *worker = Some(thread::spawn(move || loop {
            if closed.load(Ordering::Acquire) {
                break;
            }
            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(packet) => dispatch(packet),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }));
    }

    /// Enqueues a deep copy of `buf` for fan-out. Drops the oldest queued
    /// packet (and counts it) if the queue is full; never blocks.
    pub fn write(
        &self,
        buf: &[u8],
        is_rtcp: bool,
        exclude_source: Option<String>,
        source_format: Option<Format>,
    ) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let packet = OutboundPacket {
            buf: buf.to_vec(),
            is_rtcp,
            exclude_source,
            source_format,
        };
        match self.sender.try_send(packet) {
            Ok(()) => {}
            Err(TrySendError::Full(packet)) => {
                let _ = self.receiver.try_recv();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("MuxOutput queue full, dropped oldest packet");
                let _ = self.sender.try_send(packet);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MuxOutput {
    fn drop(&mut self) {
        self.close();
    }
}
