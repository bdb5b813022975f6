//! Deterministic harness for driving a dispatcher without sockets or a clock.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use kv_dispatch::callbacks::Completion;
use kv_dispatch::dispatch::Dispatcher;
use kv_dispatch::io::{ConfigProvider, IoHandler, StaticConfig, TimerId};
use kv_dispatch::partition;
use kv_dispatch::pipeline::NodeId;
use kv_dispatch::protocol::{self, Decoded, Frame, Status};
use kv_dispatch::settings::Settings;
use kv_dispatch::topology::{NodeInfo, TopologySnapshot};

#[derive(Debug)]
pub struct SimState {
    pub now: Instant,
    pub connects: Vec<(NodeId, String)>,
    pub writes: Vec<(NodeId, Bytes)>,
    pub closes: Vec<NodeId>,
    pub timers: BTreeMap<TimerId, Instant>,
    pub flush_requests: usize,
    pub pending_flush: bool,
    pub refuse_writes: bool,
}

/// Records everything the dispatcher asks of the event loop; time only moves
/// when a test says so.
#[derive(Debug, Clone)]
pub struct SimIo(pub Rc<RefCell<SimState>>);

impl SimIo {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SimState {
            now: Instant::now(),
            connects: Vec::new(),
            writes: Vec::new(),
            closes: Vec::new(),
            timers: BTreeMap::new(),
            flush_requests: 0,
            pending_flush: false,
            refuse_writes: false,
        })))
    }

    pub fn flush_requests(&self) -> usize {
        self.0.borrow().flush_requests
    }

    pub fn connects(&self) -> Vec<NodeId> {
        self.0.borrow().connects.iter().map(|(id, _)| *id).collect()
    }

    pub fn closes(&self) -> Vec<NodeId> {
        self.0.borrow().closes.clone()
    }

    pub fn timer(&self, id: TimerId) -> Option<Instant> {
        self.0.borrow().timers.get(&id).copied()
    }

    fn take_flush(&self) -> bool {
        std::mem::replace(&mut self.0.borrow_mut().pending_flush, false)
    }

    /// Removes and returns the earliest timer due at or before `limit`.
    fn pop_due(&self, limit: Instant) -> Option<(TimerId, Instant)> {
        let mut state = self.0.borrow_mut();
        let (id, at) = state
            .timers
            .iter()
            .filter(|(_, at)| **at <= limit)
            .min_by_key(|(_, at)| **at)
            .map(|(id, at)| (*id, *at))?;
        state.timers.remove(&id);
        Some((id, at))
    }
}

impl IoHandler for SimIo {
    fn connect(&mut self, node: NodeId, addr: &str) {
        self.0.borrow_mut().connects.push((node, addr.to_string()));
    }

    fn schedule_write(&mut self, node: NodeId, bytes: Bytes) -> bool {
        let mut state = self.0.borrow_mut();
        if state.refuse_writes {
            return false;
        }
        state.writes.push((node, bytes));
        true
    }

    fn close(&mut self, node: NodeId) {
        self.0.borrow_mut().closes.push(node);
    }

    fn arm_timer(&mut self, id: TimerId, deadline: Instant) {
        self.0.borrow_mut().timers.insert(id, deadline);
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.0.borrow_mut().timers.remove(&id);
    }

    fn request_flush(&mut self) {
        let mut state = self.0.borrow_mut();
        state.flush_requests += 1;
        state.pending_flush = true;
    }

    fn now(&self) -> Instant {
        self.0.borrow().now
    }
}

/// Shares a [`StaticConfig`] with the test so refresh requests stay visible.
#[derive(Debug, Clone)]
pub struct SharedConfig(pub Rc<RefCell<StaticConfig>>);

impl SharedConfig {
    pub fn refreshes(&self) -> u64 {
        self.0.borrow().refreshes_requested()
    }
}

impl ConfigProvider for SharedConfig {
    fn current_snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        self.0.borrow().current_snapshot()
    }

    fn update_from_node(&mut self, host: &str, payload: &[u8]) -> Option<Arc<TopologySnapshot>> {
        self.0.borrow_mut().update_from_node(host, payload)
    }

    fn request_refresh(&mut self) {
        self.0.borrow_mut().request_refresh();
    }
}

pub fn nodes(n: u16) -> Vec<NodeInfo> {
    (0..n).map(|i| NodeInfo::new("127.0.0.1", 12000 + i)).collect()
}

pub fn cluster(n: u16, partitions: usize, replicas: usize) -> TopologySnapshot {
    TopologySnapshot::uniform(1, nodes(n), partitions, replicas).expect("topology")
}

/// First key of the form `{prefix}{i}` whose master is `node`.
pub fn key_on(topo: &TopologySnapshot, node: usize, prefix: &str) -> String {
    (0..10_000)
        .map(|i| format!("{prefix}{i}"))
        .find(|key| partition::locate(key.as_bytes(), topo).map(|l| l.node) == Ok(node))
        .expect("some key maps to the node")
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub io: SimIo,
    pub config: SharedConfig,
    pub completions: Rc<RefCell<Vec<Completion>>>,
    connected: usize,
    closed: usize,
}

impl Harness {
    pub fn new(topology: TopologySnapshot) -> Self {
        Self::with_settings(topology, Settings::default())
    }

    pub fn with_settings(topology: TopologySnapshot, settings: Settings) -> Self {
        Self::build(StaticConfig::new(topology), settings)
    }

    pub fn build(config: StaticConfig, settings: Settings) -> Self {
        let io = SimIo::new();
        let config = SharedConfig(Rc::new(RefCell::new(config)));
        let mut dispatcher = Dispatcher::new(settings, Box::new(io.clone()), Box::new(config.clone()));
        let completions = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&completions);
        dispatcher.set_default_callback(Rc::new(move |_: &mut Dispatcher, completion: Completion| {
            sink.borrow_mut().push(completion);
        }));
        Self {
            dispatcher,
            io,
            config,
            completions,
            connected: 0,
            closed: 0,
        }
    }

    pub fn now(&self) -> Instant {
        self.io.now()
    }

    /// Runs requested flushes and completes every pending connect until
    /// nothing changes.
    pub fn run(&mut self) {
        loop {
            let mut progressed = false;
            if self.io.take_flush() {
                self.dispatcher.flush_dirty();
                progressed = true;
            }
            let connects = self.io.connects();
            while self.connected < connects.len() {
                let id = connects[self.connected];
                self.connected += 1;
                self.dispatcher.on_connected(id);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    /// Only runs a requested flush; connects stay pending.
    pub fn flush(&mut self) {
        if self.io.take_flush() {
            self.dispatcher.flush_dirty();
        }
    }

    /// Reports every close the dispatcher asked for as finished.
    pub fn deliver_closes(&mut self) {
        let closes = self.io.closes();
        while self.closed < closes.len() {
            let id = closes[self.closed];
            self.closed += 1;
            self.dispatcher.on_closed(id);
        }
        self.run();
    }

    /// Moves the clock forward, firing due timers in deadline order.
    pub fn advance(&mut self, by: Duration) {
        let target = self.io.now() + by;
        while let Some((id, at)) = self.io.pop_due(target) {
            {
                let mut state = self.io.0.borrow_mut();
                state.now = state.now.max(at);
            }
            self.dispatcher.on_timer(id);
            self.run();
        }
        self.io.0.borrow_mut().now = target;
    }

    /// Decodes every frame written since the last call.
    pub fn take_writes(&mut self) -> Vec<(NodeId, Frame)> {
        let writes = std::mem::take(&mut self.io.0.borrow_mut().writes);
        let mut frames = Vec::new();
        for (node, bytes) in writes {
            let mut rest = &bytes[..];
            while !rest.is_empty() {
                match protocol::decode(rest).expect("valid request frame") {
                    Decoded::Complete { frame, consumed } => {
                        frames.push((node, frame));
                        rest = &rest[consumed..];
                    }
                    Decoded::Incomplete { .. } => panic!("partial frame written"),
                }
            }
        }
        frames
    }

    pub fn reply(&mut self, node: NodeId, frames: &[Frame]) {
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode_into(&mut buf);
        }
        self.dispatcher.on_readable(node, &buf);
        self.run();
    }

    pub fn node_id(&self, index: usize) -> NodeId {
        self.dispatcher
            .pipeline(index)
            .map(|p| p.id())
            .expect("pipeline for node index")
    }

    pub fn completions(&self) -> Vec<Completion> {
        self.completions.borrow().clone()
    }

    pub fn take_completions(&self) -> Vec<Completion> {
        std::mem::take(&mut *self.completions.borrow_mut())
    }
}

pub fn respond(request: &Frame, status: Status, extras: Bytes, key: Bytes, value: Bytes) -> Frame {
    Frame::response(request.header.opcode, status, extras, key, value).with_opaque(request.opaque())
}

pub fn status_only(request: &Frame, status: Status) -> Frame {
    respond(request, status, Bytes::new(), Bytes::new(), Bytes::new())
}

pub fn get_ok(request: &Frame, value: &'static [u8], flags: u32) -> Frame {
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(flags);
    respond(
        request,
        Status::Success,
        extras.freeze(),
        Bytes::new(),
        Bytes::from_static(value),
    )
    .with_cas(0x1234)
}

pub fn mutation_ok(request: &Frame, cas: u64, uuid: u64, seqno: u64) -> Frame {
    let mut extras = BytesMut::with_capacity(16);
    extras.put_u64(uuid);
    extras.put_u64(seqno);
    respond(request, Status::Success, extras.freeze(), Bytes::new(), Bytes::new()).with_cas(cas)
}

pub fn not_my_partition(request: &Frame, map: Option<&TopologySnapshot>) -> Frame {
    let body = map
        .map(|topo| Bytes::from(topo.to_json().expect("map json")))
        .unwrap_or_default();
    respond(request, Status::NotMyPartition, Bytes::new(), Bytes::new(), body)
}
