//! Per-stream and per-circuit observation accumulators.
//!
//! A packet accumulator coalesces byte-level cell events into packet-sized
//! observations: bytes flowing in one direction are buffered until the
//! direction flips or [`PACKET_TIME_TOLERANCE_USEC`] elapses, then committed
//! in [`PACKET_BYTE_COUNT`] chunks. The tolerance merges cells that arrived
//! together into the same packets without the relay having to expose
//! packetisation. A stream accumulator records stream-began events with
//! inter-stream delays.
//!
//! Dropping an accumulator finalises it: the pending buffer is committed, a
//! terminal record is appended if one was not already recorded, and the
//! sequence is handed to decoding (queued to a worker, or run inline when
//! the pool is disabled). When telemetry is inactive the drop releases the
//! records silently.

use std::sync::Arc;
use std::time::Instant;

use crate::engine::EngineCore;
use crate::model::{ObsCode, Observation};
use crate::pool::Track;

/// Approximate payload bytes per packet-sized observation.
pub const PACKET_BYTE_COUNT: u64 = 1434;

/// Cells arriving within this many microseconds count as simultaneous.
pub const PACKET_TIME_TOLERANCE_USEC: u64 = 2;

/// Cell-level event on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketEvent {
    /// Payload moved away from the client end.
    ToServer,
    /// Payload moved toward the client end.
    ToClient,
    /// The stream closed.
    Finished,
}

/// Stream-level event on a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// A new stream appeared on the circuit.
    NewStream,
    /// The circuit closed.
    Finished,
}

// ---------------------------------------------------------------------------
// Recorders: the pure coalescing state, timed by explicit microsecond stamps
// ---------------------------------------------------------------------------

/// Packet coalescing state. Invariant: `buf_code` is set whenever
/// `buf_len > 0`, and is cleared by every commit.
#[derive(Debug, Default)]
pub(crate) struct PacketRecorder {
    buf_start_usec: u64,
    buf_len: u64,
    buf_code: Option<ObsCode>,
    observations: Vec<Observation>,
    terminated: bool,
}

impl PacketRecorder {
    pub(crate) fn observe_at(&mut self, now_usec: u64, event: PacketEvent, payload_len: u64) {
        if self.terminated {
            return;
        }
        let code = match event {
            PacketEvent::ToServer => ObsCode::ToServer,
            PacketEvent::ToClient => ObsCode::ToClient,
            PacketEvent::Finished => {
                self.commit_at(now_usec);
                self.observations.push(Observation::new(0, ObsCode::End));
                self.terminated = true;
                return;
            }
        };

        if self.buf_len > 0 {
            let elapsed = now_usec.saturating_sub(self.buf_start_usec);
            if self.buf_code != Some(code) || elapsed >= PACKET_TIME_TOLERANCE_USEC {
                self.commit_at(now_usec);
            }
        }
        if payload_len > 0 {
            if self.buf_len == 0 {
                self.buf_code = Some(code);
                self.buf_start_usec = now_usec;
            }
            self.buf_len += payload_len;
        }
    }

    /// Commit the buffered run: one zero-delay observation per full packet,
    /// then the remainder carrying the elapsed delay.
    fn commit_at(&mut self, now_usec: u64) {
        if self.buf_len == 0 {
            return;
        }
        let Some(code) = self.buf_code else {
            log::warn!("packet buffer holds bytes with no direction; dropping them");
            self.buf_len = 0;
            return;
        };
        let mut remaining = self.buf_len;
        while remaining > PACKET_BYTE_COUNT {
            self.observations.push(Observation::new(0, code));
            remaining -= PACKET_BYTE_COUNT;
        }
        let delay = now_usec.saturating_sub(self.buf_start_usec);
        self.observations.push(Observation::new(delay, code));
        self.buf_len = 0;
        self.buf_code = None;
    }

    /// Finalise: commit anything pending, terminate if the caller never sent
    /// a finished event, and take the committed sequence.
    pub(crate) fn take_records(&mut self, now_usec: u64) -> Vec<Observation> {
        self.commit_at(now_usec);
        if !self.terminated {
            self.observations.push(Observation::new(0, ObsCode::End));
            self.terminated = true;
        }
        std::mem::take(&mut self.observations)
    }
}

/// Stream arrival state: at most one buffered stream-began event.
#[derive(Debug, Default)]
pub(crate) struct StreamRecorder {
    buf: Option<(u64, ObsCode)>,
    observations: Vec<Observation>,
    terminated: bool,
}

impl StreamRecorder {
    pub(crate) fn observe_at(&mut self, now_usec: u64, event: StreamEvent) {
        if self.terminated {
            return;
        }
        if let Some((start, code)) = self.buf.take() {
            self.observations
                .push(Observation::new(now_usec.saturating_sub(start), code));
        }
        match event {
            StreamEvent::NewStream => self.buf = Some((now_usec, ObsCode::StreamNew)),
            StreamEvent::Finished => {
                self.observations.push(Observation::new(0, ObsCode::End));
                self.terminated = true;
            }
        }
    }

    pub(crate) fn take_records(&mut self, now_usec: u64) -> Vec<Observation> {
        if let Some((start, code)) = self.buf.take() {
            self.observations
                .push(Observation::new(now_usec.saturating_sub(start), code));
        }
        if !self.terminated {
            self.observations.push(Observation::new(0, ObsCode::End));
            self.terminated = true;
        }
        std::mem::take(&mut self.observations)
    }
}

// ---------------------------------------------------------------------------
// Public accumulators: recorders bound to an engine and a monotonic clock
// ---------------------------------------------------------------------------

/// Tracks cell transfers for one stream. Created through
/// [`Engine::packet_accumulator`](crate::Engine::packet_accumulator); drop to
/// finalise and decode.
pub struct PacketAccumulator {
    core: Arc<EngineCore>,
    epoch: Instant,
    rec: PacketRecorder,
}

impl PacketAccumulator {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        core.stats().packet_accumulators_opened();
        Self {
            core,
            epoch: Instant::now(),
            rec: PacketRecorder::default(),
        }
    }

    fn now_usec(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Record a cell-level event. A no-op once telemetry goes inactive or
    /// after a finished event.
    pub fn observe(&mut self, event: PacketEvent, payload_len: u64) {
        if !self.core.is_active() {
            return;
        }
        self.rec.observe_at(self.now_usec(), event, payload_len);
    }

    #[cfg(test)]
    pub(crate) fn observe_at(&mut self, now_usec: u64, event: PacketEvent, payload_len: u64) {
        if !self.core.is_active() {
            return;
        }
        self.rec.observe_at(now_usec, event, payload_len);
    }
}

impl Drop for PacketAccumulator {
    fn drop(&mut self) {
        self.core.stats().packet_accumulators_closed();
        if !self.core.is_active() {
            return;
        }
        let records = self.rec.take_records(self.now_usec());
        self.core.finalize(Track::Packets, records);
    }
}

/// Tracks stream arrivals for one circuit. Created through
/// [`Engine::stream_accumulator`](crate::Engine::stream_accumulator); drop to
/// finalise and decode.
pub struct StreamAccumulator {
    core: Arc<EngineCore>,
    epoch: Instant,
    rec: StreamRecorder,
}

impl StreamAccumulator {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        core.stats().stream_accumulators_opened();
        Self {
            core,
            epoch: Instant::now(),
            rec: StreamRecorder::default(),
        }
    }

    fn now_usec(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Record a stream-level event. A no-op once telemetry goes inactive or
    /// after a finished event.
    pub fn observe(&mut self, event: StreamEvent) {
        if !self.core.is_active() {
            return;
        }
        self.rec.observe_at(self.now_usec(), event);
    }

    #[cfg(test)]
    pub(crate) fn observe_at(&mut self, now_usec: u64, event: StreamEvent) {
        if !self.core.is_active() {
            return;
        }
        self.rec.observe_at(now_usec, event);
    }
}

impl Drop for StreamAccumulator {
    fn drop(&mut self) {
        self.core.stats().stream_accumulators_closed();
        if !self.core.is_active() {
            return;
        }
        let records = self.rec.take_records(self.now_usec());
        self.core.finalize(Track::Streams, records);
    }
}
