//! Per-node request pipeline.
//!
//! A pipeline owns the send queue and the in-flight table for one node
//! connection. A packet is in exactly one of the two, or has been handed back
//! to the dispatcher. The pipeline does not decide what happens to packets it
//! gives back; it only reports why.
//!
//! ```text
//!   Clean ──socket error──▶ ErrorDraining ──closed──▶ Clean (reconnect on demand)
//!                                        └──closed, node removed──▶ Closed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::command::Command;
use crate::correlation::CorrelationTable;
use crate::error::ErrorKind;
use crate::io::{IoHandler, TimerId};
use crate::packet::Packet;
use crate::protocol::{CodecError, Decoder, Frame, MAGIC_RESPONSE, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Clean,
    ErrorDraining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    /// Transport is up, session setup still running.
    Negotiating,
    Ready,
    ErrorDraining,
    Closed,
}

/// One decoded frame, classified against the in-flight table.
#[derive(Debug)]
pub enum Inbound {
    /// Last response for a packet, which has left the in-flight table.
    Final { packet: Packet, frame: Frame },
    /// Intermediate entry of a streaming reply; the packet stays in flight.
    Partial { opaque: u32, frame: Frame },
    /// No packet is waiting on this correlation id.
    Stale { opaque: u32, opcode: u8 },
}

#[derive(Debug, Default)]
pub struct ReadBatch {
    pub inbound: Vec<Inbound>,
    /// Set when the stream turned out to be corrupt; the connection is unusable.
    pub error: Option<CodecError>,
}

#[derive(Debug)]
pub struct Pipeline {
    id: NodeId,
    addr: String,
    /// Position in the current topology; `None` once removed from it.
    index: Option<usize>,
    state: PipelineState,
    conn: ConnState,
    queue: VecDeque<Packet>,
    in_flight: CorrelationTable<Packet>,
    decoder: Decoder,
    drain_error: Option<ErrorKind>,
    armed: Option<Instant>,
    dirty: bool,
}

impl Pipeline {
    pub fn new(id: NodeId, addr: impl Into<String>, index: usize) -> Self {
        Self {
            id,
            addr: addr.into(),
            index: Some(index),
            state: PipelineState::Clean,
            conn: ConnState::Disconnected,
            queue: VecDeque::new(),
            in_flight: CorrelationTable::new(),
            decoder: Decoder::new(),
            drain_error: None,
            armed: None,
            dirty: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn set_index(&mut self, index: Option<usize>) {
        self.index = index;
    }

    pub fn is_retired(&self) -> bool {
        self.index.is_none()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn conn_state(&self) -> ConnState {
        self.conn
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty() || !self.in_flight.is_empty()
    }

    pub fn in_flight_packet(&self, opaque: u32) -> Option<&Packet> {
        self.in_flight.get(opaque)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn accepts_work(&self) -> bool {
        self.state == PipelineState::Clean
    }

    /// Appends `packet` to the send queue under a fresh correlation id.
    /// Only a clean pipeline takes packets; otherwise the packet is handed back.
    pub fn enqueue(&mut self, mut packet: Packet) -> Result<u32, Packet> {
        if self.state != PipelineState::Clean {
            return Err(packet);
        }
        let opaque = self.in_flight.reserve();
        packet.assign(opaque);
        trace!(node = %self.addr, opaque, partition = packet.partition, "queued");
        self.queue.push_back(packet);
        self.dirty = true;
        Ok(opaque)
    }

    /// Hands queued bytes to the transport, connecting first if needed.
    /// Returns the number of packets moved in flight.
    pub fn flush(&mut self, io: &mut dyn IoHandler) -> usize {
        self.dirty = false;
        if self.state != PipelineState::Clean {
            return 0;
        }
        let moved = match self.conn {
            ConnState::Disconnected if !self.queue.is_empty() => {
                debug!(node = %self.addr, id = %self.id, "connecting");
                self.conn = ConnState::Connecting;
                io.connect(self.id, &self.addr);
                0
            }
            ConnState::Ready if !self.queue.is_empty() => self.write_queue(io),
            _ => 0,
        };
        self.rearm(io);
        moved
    }

    fn write_queue(&mut self, io: &mut dyn IoHandler) -> usize {
        let mut out = BytesMut::new();
        for packet in &self.queue {
            if let Some(bytes) = packet.encoded() {
                out.extend_from_slice(bytes);
            }
        }
        if !io.schedule_write(self.id, out.freeze()) {
            self.dirty = true;
            return 0;
        }
        let moved = self.queue.len();
        for mut packet in self.queue.drain(..) {
            packet.flushed = true;
            self.in_flight.insert(packet.opaque, packet);
        }
        moved
    }

    pub fn mark_negotiating(&mut self) {
        if self.conn == ConnState::Connecting {
            self.conn = ConnState::Negotiating;
        }
    }

    /// The connection is usable. Returns whether anything is waiting to be sent.
    pub fn mark_ready(&mut self) -> bool {
        if matches!(self.conn, ConnState::Connecting | ConnState::Negotiating) {
            self.conn = ConnState::Ready;
            self.dirty = !self.queue.is_empty();
        }
        self.dirty
    }

    /// Decodes `bytes` and matches every complete frame against the in-flight
    /// table. Frames decoded before a malformed one are still returned.
    pub fn read(&mut self, bytes: &[u8]) -> ReadBatch {
        self.decoder.feed(bytes);
        let mut batch = ReadBatch::default();
        loop {
            let frame = match self.decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    batch.error = Some(err);
                    break;
                }
            };
            if frame.header.magic != MAGIC_RESPONSE {
                batch.error = Some(CodecError::BadMagic(frame.header.magic));
                break;
            }
            let opaque = frame.opaque();
            let streaming = match self.in_flight.get(opaque) {
                None => {
                    batch.inbound.push(Inbound::Stale {
                        opaque,
                        opcode: frame.header.opcode,
                    });
                    continue;
                }
                Some(packet) => {
                    matches!(packet.request.command, Command::Stats { .. })
                        && frame.status() == Status::Success
                        && !frame.key.is_empty()
                }
            };
            if streaming {
                batch.inbound.push(Inbound::Partial { opaque, frame });
            } else if let Some(packet) = self.in_flight.remove(opaque) {
                batch.inbound.push(Inbound::Final { packet, frame });
            }
        }
        batch
    }

    /// Stops taking work after a transport failure. Queued packets never
    /// reached the node and are returned now; in-flight packets wait for
    /// [`finish_drain`](Self::finish_drain).
    pub fn begin_drain(&mut self, error: ErrorKind) -> Vec<Packet> {
        if self.state == PipelineState::Clean {
            debug!(node = %self.addr, id = %self.id, error = %error, in_flight = self.in_flight.len(), "draining pipeline");
            self.state = PipelineState::ErrorDraining;
            self.conn = ConnState::ErrorDraining;
            self.drain_error = Some(error);
        }
        self.decoder.clear();
        self.dirty = false;
        self.take_queued()
    }

    /// Completes draining once the transport reports the socket closed.
    /// Returns the error that started the drain and the packets that were
    /// still waiting for a response.
    pub fn finish_drain(&mut self) -> (ErrorKind, Vec<Packet>) {
        let error = self.drain_error.take().unwrap_or(ErrorKind::Network);
        let mut packets = self.in_flight.drain();
        packets.extend(self.take_queued());
        for packet in &mut packets {
            packet.renew();
        }
        self.decoder.clear();
        if self.is_retired() {
            self.state = PipelineState::Closed;
            self.conn = ConnState::Closed;
        } else {
            self.state = PipelineState::Clean;
            self.conn = ConnState::Disconnected;
        }
        (error, packets)
    }

    /// Returns every queued packet, unrouted.
    pub fn take_queued(&mut self) -> Vec<Packet> {
        let mut packets: Vec<Packet> = self.queue.drain(..).collect();
        for packet in &mut packets {
            self.in_flight.release(packet.opaque);
            packet.renew();
        }
        packets
    }

    /// Removes and returns packets whose deadline has passed, queued ones included.
    pub fn timeout_sweep(&mut self, now: Instant) -> Vec<Packet> {
        let mut expired = self.in_flight.take_expired(now);
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for mut packet in self.queue.drain(..) {
            if packet.deadline <= now {
                self.in_flight.release(packet.opaque);
                packet.renew();
                expired.push(packet);
            } else {
                kept.push_back(packet);
            }
        }
        self.queue = kept;
        if !expired.is_empty() {
            debug!(node = %self.addr, count = expired.len(), "timed out packets");
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let queued = self.queue.iter().map(|packet| packet.deadline).min();
        match (queued, self.in_flight.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Points the pipeline timer at the earliest deadline, or disarms it.
    pub fn rearm(&mut self, io: &mut dyn IoHandler) {
        let next = self.next_deadline();
        if next == self.armed {
            return;
        }
        match next {
            Some(deadline) => io.arm_timer(TimerId::Pipeline(self.id), deadline),
            None => io.cancel_timer(TimerId::Pipeline(self.id)),
        }
        self.armed = next;
    }

    /// The timer fired and is no longer armed.
    pub fn timer_fired(&mut self) {
        self.armed = None;
    }

    /// Tears the pipeline down, returning everything it still held.
    pub fn close(&mut self, io: &mut dyn IoHandler) -> Vec<Packet> {
        let mut packets = self.take_queued();
        packets.extend(self.in_flight.drain());
        if self.armed.take().is_some() {
            io.cancel_timer(TimerId::Pipeline(self.id));
        }
        self.state = PipelineState::Closed;
        self.conn = ConnState::Closed;
        packets
    }

    /// Whether a transport connection exists or is being set up.
    pub fn has_transport(&self) -> bool {
        matches!(
            self.conn,
            ConnState::Connecting | ConnState::Negotiating | ConnState::Ready | ConnState::ErrorDraining
        )
    }
}
