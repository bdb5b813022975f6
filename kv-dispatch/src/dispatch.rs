//! The dispatcher: one client instance's routing and recovery state machine.
//!
//! All state for an instance lives here and is touched from one thread only.
//! The event loop feeds readiness in through the `on_*` methods; callers feed
//! commands in through [`Dispatcher::submit`] and the scheduling-context
//! methods. Every packet that is accepted ends in exactly one final callback,
//! unless the instance is destroyed first.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::callbacks::{CallbackKind, CallbackTable, Completion, Cookie, Handler};
use crate::command::{Command, Request, Response};
use crate::durability::DurabilityTable;
use crate::error::{ErrorKind, OpError, SchedError};
use crate::io::{ConfigProvider, IoHandler, RefreshThrottle, TimerId};
use crate::packet::{Packet, Sink, StreamGroup, Target};
use crate::partition::{self, LocateError, Located, PartitionMap};
use crate::pipeline::{Inbound, NodeId, Pipeline, PipelineState};
use crate::protocol::{self, Frame};
use crate::retry::{RetryPolicy, RetryQueue};
use crate::sched::SchedContext;
use crate::settings::Settings;
use crate::subdoc;
use crate::topology::{Distribution, TopologySnapshot};

/// Counters an external metrics collector can read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub remaps: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub stale_responses: u64,
}

/// Returned for a submission that was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Packets created for the command; more than one for broadcasts.
    pub packets: usize,
}

/// Asks a running `wait` loop to return early. Cheap to clone and safe to use
/// from inside a completion callback.
#[derive(Debug, Clone, Default)]
pub struct Breakout(Rc<Cell<bool>>);

impl Breakout {
    pub fn request(&self) {
        self.0.set(true);
    }

    pub fn is_requested(&self) -> bool {
        self.0.get()
    }

    /// Clears the request, returning whether one was pending.
    pub fn take(&self) -> bool {
        self.0.replace(false)
    }
}

pub struct Dispatcher {
    pub(crate) settings: Settings,
    pub(crate) policy: RetryPolicy,
    pub(crate) io: Box<dyn IoHandler>,
    config: Box<dyn ConfigProvider>,
    pub(crate) topology: Option<Arc<TopologySnapshot>>,
    map: PartitionMap,
    pipelines: BTreeMap<NodeId, Pipeline>,
    by_index: Vec<Option<NodeId>>,
    next_node_id: u64,
    retry: RetryQueue,
    /// Packets whose partition has no owner in the current map, released by
    /// the next map that gives them one.
    awaiting_map: Vec<Packet>,
    map_wait_armed: Option<Instant>,
    refresh: RefreshThrottle,
    sched: SchedContext,
    callbacks: CallbackTable,
    pub(crate) durability: DurabilityTable,
    stats: DispatchStats,
    breakout: Breakout,
    flush_requested: bool,
    destroyed: bool,
    destroy_notify: Option<Box<dyn FnOnce()>>,
}

impl Dispatcher {
    pub fn new(settings: Settings, io: Box<dyn IoHandler>, config: Box<dyn ConfigProvider>) -> Self {
        let topology = config.current_snapshot();
        let mut map = PartitionMap::new();
        if let Some(topo) = &topology {
            map.sync(topo);
        }
        let by_index = vec![None; topology.as_ref().map_or(0, |t| t.num_nodes())];
        Self {
            policy: RetryPolicy::from_settings(&settings),
            refresh: RefreshThrottle::new(settings.config_refresh_throttle),
            settings,
            io,
            config,
            topology,
            map,
            pipelines: BTreeMap::new(),
            by_index,
            next_node_id: 1,
            retry: RetryQueue::new(),
            awaiting_map: Vec::new(),
            map_wait_armed: None,
            sched: SchedContext::new(),
            callbacks: CallbackTable::default(),
            durability: DurabilityTable::default(),
            stats: DispatchStats::default(),
            breakout: Breakout::default(),
            flush_requested: false,
            destroyed: false,
            destroy_notify: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn topology(&self) -> Option<&Arc<TopologySnapshot>> {
        self.topology.as_ref()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn install_callback(&mut self, kind: CallbackKind, handler: Handler) -> Option<Handler> {
        self.callbacks.install(kind, handler)
    }

    pub fn set_default_callback(&mut self, handler: Handler) {
        self.callbacks.set_default(handler);
    }

    pub fn breakout(&self) -> Breakout {
        self.breakout.clone()
    }

    pub fn request_breakout(&self) {
        self.breakout.request();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn pipeline(&self, index: usize) -> Option<&Pipeline> {
        let id = self.by_index.get(index).copied().flatten()?;
        self.pipelines.get(&id)
    }

    pub fn pipeline_by_id(&self, id: NodeId) -> Option<&Pipeline> {
        self.pipelines.get(&id)
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.values()
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry.len()
    }

    /// Packets held until a cluster map assigns their partition an owner.
    pub fn awaiting_map_len(&self) -> usize {
        self.awaiting_map.len()
    }

    /// Whether anything still owes a callback or a teardown notification.
    pub fn has_pending(&self) -> bool {
        if self.destroyed {
            return self.destroy_notify.is_some();
        }
        self.pipelines.values().any(Pipeline::has_pending)
            || !self.retry.is_empty()
            || !self.awaiting_map.is_empty()
            || !self.durability.is_empty()
    }

    // ----- submission -----

    pub fn submit(&mut self, request: Request, cookie: Cookie) -> Result<Accepted, SchedError> {
        self.submit_with(request, cookie, Sink::Table)
    }

    pub(crate) fn submit_with(
        &mut self,
        request: Request,
        cookie: Cookie,
        sink: Sink,
    ) -> Result<Accepted, SchedError> {
        if self.destroyed {
            return Err(SchedError::ShuttingDown);
        }
        self.validate(&request)?;
        let packets = self.build_packets(request, cookie, sink)?;
        let accepted = Accepted {
            packets: packets.len(),
        };
        let implicit = self.sched.enter_implicit();
        self.sched.stage(packets);
        if implicit {
            self.sched_leave()?;
        }
        Ok(accepted)
    }

    fn validate(&self, request: &Request) -> Result<(), SchedError> {
        if let Some(key) = request.command.key() {
            if key.is_empty() {
                return Err(SchedError::EmptyKey);
            }
            self.check_key_len(key.len())?;
        }
        match &request.command {
            // The group travels in the key field.
            Command::Stats { group: Some(group) } => self.check_key_len(group.len())?,
            Command::LookupIn { specs, .. } => subdoc::validate(specs, true)?,
            Command::MutateIn { specs, .. } => subdoc::validate(specs, false)?,
            _ => {}
        }
        let value_len = request.command.value_len();
        let max = self.settings.max_value_size.min(protocol::max_value_len(self.key_limit()));
        if value_len > max {
            return Err(SchedError::ValueTooLarge {
                len: value_len,
                max,
            });
        }
        Ok(())
    }

    /// Settings built by hand skip validation; the frame header still bounds them.
    fn key_limit(&self) -> usize {
        self.settings.max_key_len.min(protocol::MAX_KEY_LEN)
    }

    fn check_key_len(&self, len: usize) -> Result<(), SchedError> {
        let max = self.key_limit();
        if len > max {
            return Err(SchedError::KeyTooLong { len, max });
        }
        Ok(())
    }

    fn build_packets(
        &mut self,
        request: Request,
        cookie: Cookie,
        sink: Sink,
    ) -> Result<Vec<Packet>, SchedError> {
        let topo = self.topology.clone().ok_or(SchedError::NoTopology)?;
        self.map.sync(&topo);
        let now = self.io.now();
        let deadline = now + self.settings.operation_timeout;
        let generation = topo.generation();
        let packet = |request: Request, located: Located, target: Target| {
            Packet::new(
                request,
                located.partition,
                target,
                located.node,
                generation,
                now,
                deadline,
                cookie,
                sink.clone(),
            )
        };

        let (located, target) = match &request.command {
            Command::Stats { .. } => {
                let group = StreamGroup::new(topo.num_nodes());
                let packets = (0..topo.num_nodes())
                    .map(|node| {
                        let mut p = packet(
                            request.clone(),
                            Located { partition: 0, node },
                            Target::Server(node),
                        );
                        p.stream = Some(Rc::clone(&group));
                        p
                    })
                    .collect();
                return Ok(packets);
            }
            Command::Noop { server } | Command::ObserveSeqno { server, .. } => {
                if *server >= topo.num_nodes() {
                    return Err(SchedError::InvalidServer {
                        index: *server,
                        count: topo.num_nodes(),
                    });
                }
                let partition = match &request.command {
                    Command::ObserveSeqno { partition, .. } => {
                        if topo.distribution() == Distribution::Ketama {
                            return Err(SchedError::NotSupported);
                        }
                        *partition
                    }
                    _ => 0,
                };
                (
                    Located {
                        partition,
                        node: *server,
                    },
                    Target::Server(*server),
                )
            }
            Command::GetReplica { key, index } => (
                partition::locate_replica(key, &topo, *index)?,
                Target::Replica(*index),
            ),
            other => {
                let key = other.key().map(|k| &k[..]).unwrap_or_default();
                (self.map.locate(key, &topo)?, Target::Master)
            }
        };
        Ok(vec![packet(request, located, target)])
    }

    // ----- scheduling context -----

    pub fn sched_enter(&mut self) -> Result<(), SchedError> {
        self.sched.enter()
    }

    /// Queues everything staged since [`sched_enter`](Self::sched_enter) and
    /// asks for a flush.
    pub fn sched_leave(&mut self) -> Result<usize, SchedError> {
        let packets = self.sched.leave()?;
        let count = packets.len();
        for packet in packets {
            self.route(packet);
        }
        if count > 0 && self.settings.implicit_flush {
            self.request_flush();
        }
        Ok(count)
    }

    /// Drops everything staged since [`sched_enter`](Self::sched_enter).
    /// No callback is ever delivered for the discarded commands.
    pub fn sched_fail(&mut self) -> Result<usize, SchedError> {
        let discarded = self.sched.fail()?;
        debug!(discarded, "scheduling context failed");
        Ok(discarded)
    }

    /// Explicit flush request, for use with `implicit_flush` disabled.
    pub fn sched_flush(&mut self) {
        self.request_flush();
    }

    fn request_flush(&mut self) {
        if !self.flush_requested {
            self.flush_requested = true;
            self.io.request_flush();
        }
    }

    /// Writes every pipeline that has unsent packets. Called once per loop
    /// pass after `request_flush`.
    pub fn flush_dirty(&mut self) {
        self.flush_requested = false;
        if self.destroyed {
            return;
        }
        for pipeline in self.pipelines.values_mut() {
            if pipeline.is_dirty() {
                let moved = pipeline.flush(self.io.as_mut());
                trace!(node = %pipeline.addr(), moved, "flushed");
            }
        }
    }

    // ----- routing -----

    fn pipeline_for(&mut self, index: usize) -> Option<NodeId> {
        let topo = self.topology.as_ref()?;
        let node = topo.node(index)?;
        if let Some(id) = self.by_index.get(index).copied().flatten() {
            return Some(id);
        }
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        debug!(node = %node, id = %id, index, "new pipeline");
        self.pipelines
            .insert(id, Pipeline::new(id, node.kv_addr(), index));
        if self.by_index.len() <= index {
            self.by_index.resize(index + 1, None);
        }
        self.by_index[index] = Some(id);
        Some(id)
    }

    /// Puts a located packet on its node's send queue. A node the map no
    /// longer lists sends it to the map wait list; a draining pipeline parks it.
    fn route(&mut self, packet: Packet) {
        let Some(id) = self.pipeline_for(packet.node) else {
            self.await_map(packet);
            return;
        };
        let Some(pipeline) = self.pipelines.get_mut(&id) else {
            self.await_map(packet);
            return;
        };
        if let Err(packet) = pipeline.enqueue(packet) {
            self.park(packet, ErrorKind::Network);
        }
    }

    /// Holds a packet for one base backoff without spending a retry, for when
    /// no pipeline can take it yet.
    fn park(&mut self, packet: Packet, reason: ErrorKind) {
        let now = self.io.now();
        let not_before = (now + self.policy.backoff_base).min(packet.deadline);
        trace!(partition = packet.partition, reason = %reason, "parking packet");
        self.retry.push(packet, not_before, reason);
        self.rearm_retry();
    }

    /// Holds a packet that has nowhere to go until a map gives its partition
    /// an owner, or its deadline passes.
    fn await_map(&mut self, mut packet: Packet) {
        debug!(partition = packet.partition, "no owner yet, waiting for a new cluster map");
        packet.last_error.get_or_insert(ErrorKind::NoOwner);
        self.awaiting_map.push(packet);
        self.refresh_config("no owner");
        self.rearm_map_wait();
    }

    fn rearm_map_wait(&mut self) {
        let next = self.awaiting_map.iter().map(|p| p.deadline).min();
        if next == self.map_wait_armed {
            return;
        }
        self.map_wait_armed = next;
        match next {
            Some(at) => self.io.arm_timer(TimerId::MapWait, at),
            None => self.io.cancel_timer(TimerId::MapWait),
        }
    }

    fn expire_awaiting_map(&mut self, now: Instant) {
        let (expired, waiting): (Vec<Packet>, Vec<Packet>) = std::mem::take(&mut self.awaiting_map)
            .into_iter()
            .partition(|packet| now >= packet.deadline);
        self.awaiting_map = waiting;
        for packet in expired {
            if self.destroyed {
                return;
            }
            self.expire(packet);
        }
    }

    /// Asks the configuration provider for a fresh map, at most once per
    /// generation within the throttle interval.
    fn refresh_config(&mut self, reason: &'static str) {
        let generation = self.topology.as_ref().map_or(0, |t| t.generation());
        if self.refresh.permit(generation, self.io.now()) {
            debug!(generation, reason, "requesting cluster map refresh");
            self.config.request_refresh();
        } else {
            trace!(generation, reason, "cluster map refresh throttled");
        }
    }

    fn locate_target(
        &mut self,
        packet: &Packet,
        topo: &TopologySnapshot,
    ) -> Result<Located, LocateError> {
        self.map.sync(topo);
        let key = packet.key().map(|k| &k[..]).unwrap_or_default();
        match packet.target {
            Target::Master => self.map.locate(key, topo),
            Target::Replica(index) => partition::locate_replica(key, topo, index),
            Target::Server(node) if node < topo.num_nodes() => Ok(Located {
                partition: packet.partition,
                node,
            }),
            Target::Server(_) => Err(LocateError::NoNodes),
        }
    }

    /// Runs the partition map again for a packet coming back from the retry
    /// queue or a removed node, then queues it.
    fn redispatch(&mut self, mut packet: Packet) {
        let Some(topo) = self.topology.clone() else {
            self.await_map(packet);
            return;
        };
        match self.locate_target(&packet, &topo) {
            Ok(located) => {
                packet.partition = located.partition;
                packet.node = located.node;
                packet.generation = topo.generation();
                self.route(packet);
                self.request_flush();
            }
            Err(LocateError::NoOwner { .. } | LocateError::NoReplica { .. } | LocateError::NoNodes) => {
                self.await_map(packet)
            }
            Err(LocateError::Unsupported) => self.deliver(packet, Err(ErrorKind::NotSupported)),
        }
    }

    // ----- failure handling -----

    fn distribution(&self) -> Distribution {
        self.topology
            .as_ref()
            .map_or(Distribution::Partitioned, |t| t.distribution())
    }

    /// Applies the retry policy to a packet that failed with `error`.
    fn fail_or_retry(&mut self, mut packet: Packet, error: ErrorKind) {
        let now = self.io.now();
        if self
            .policy
            .should_retry(error, &packet, self.distribution(), now)
        {
            packet.record_retry(error);
            self.stats.retries += 1;
            debug!(
                partition = packet.partition,
                retries = packet.retries,
                error = %error,
                "retrying"
            );
            let not_before = self.policy.not_before(&packet, now);
            self.retry.push(packet, not_before, error);
            self.rearm_retry();
        } else {
            let error = if error == ErrorKind::Timeout {
                packet.timeout_error()
            } else {
                error
            };
            self.deliver(packet, Err(error));
        }
    }

    fn expire(&mut self, packet: Packet) {
        self.stats.timeouts += 1;
        let error = packet.timeout_error();
        debug!(
            partition = packet.partition,
            retries = packet.retries,
            error = %error,
            "operation timed out"
        );
        self.deliver(packet, Err(error));
    }

    fn rearm_retry(&mut self) {
        if let Some(change) = self.retry.update_armed() {
            match change {
                Some(at) => self.io.arm_timer(TimerId::Retry, at),
                None => self.io.cancel_timer(TimerId::Retry),
            }
        }
    }

    fn drain_retry_queue(&mut self, now: Instant) {
        for entry in self.retry.take_due(now) {
            if self.destroyed {
                return;
            }
            if now >= entry.packet.deadline {
                self.expire(entry.packet);
            } else {
                self.redispatch(entry.packet);
            }
        }
    }

    // ----- delivery -----

    fn server_name(&self, node: usize) -> String {
        self.topology
            .as_ref()
            .and_then(|t| t.node(node))
            .map(|n| n.kv_addr())
            .unwrap_or_default()
    }

    /// Delivers the terminal outcome of `packet`.
    fn deliver(&mut self, mut packet: Packet, result: Result<Response, ErrorKind>) {
        let mut result = result;
        let mut retries = packet.retries;
        if let Some(group) = packet.stream.take() {
            let server = match &result {
                Ok(Response::StatsDone { server }) => server.clone(),
                _ => self.server_name(packet.node),
            };
            let Some(outcome) = group.finish_member(&server, result.as_ref().err().copied(), retries)
            else {
                return;
            };
            retries = outcome.retries;
            result = match outcome.error {
                None => Ok(Response::StatsDone {
                    server: outcome.server,
                }),
                Some(kind) => Err(kind),
            };
        }
        let completion = Completion {
            cookie: packet.cookie,
            kind: packet.kind(),
            key: packet.key().cloned(),
            result: result.map_err(|kind| OpError { kind, retries }),
            retries,
            is_final: true,
        };
        self.invoke(&packet.sink, completion);
    }

    pub(crate) fn invoke(&mut self, sink: &Sink, completion: Completion) {
        if self.destroyed {
            return;
        }
        let handler = match sink {
            Sink::Table => self.callbacks.get(completion.kind),
            Sink::Private(handler) => Rc::clone(handler),
        };
        handler(self, completion);
    }

    // ----- event loop entry points -----

    pub fn on_negotiating(&mut self, id: NodeId) {
        if let Some(pipeline) = self.pipelines.get_mut(&id) {
            pipeline.mark_negotiating();
        }
    }

    pub fn on_connected(&mut self, id: NodeId) {
        if self.destroyed {
            return;
        }
        let Some(pipeline) = self.pipelines.get_mut(&id) else {
            return;
        };
        debug!(node = %pipeline.addr(), id = %id, "connected");
        if pipeline.mark_ready() {
            pipeline.flush(self.io.as_mut());
        }
    }

    pub fn on_connect_failed(&mut self, id: NodeId) {
        if self.destroyed {
            self.forget_pipeline(id);
            return;
        }
        let Some(pipeline) = self.pipelines.get_mut(&id) else {
            return;
        };
        if pipeline.state() != PipelineState::Clean {
            return;
        }
        warn!(node = %pipeline.addr(), id = %id, "connection failed");
        let mut packets = pipeline.begin_drain(ErrorKind::ConnectFailed);
        let (_, in_flight) = pipeline.finish_drain();
        packets.extend(in_flight);
        pipeline.rearm(self.io.as_mut());
        let retired = pipeline.state() == PipelineState::Closed;
        if retired {
            self.forget_pipeline(id);
        }
        self.refresh_config("connect failed");
        for packet in packets {
            self.fail_or_retry(packet, ErrorKind::ConnectFailed);
        }
    }

    pub fn on_readable(&mut self, id: NodeId, bytes: &[u8]) {
        if self.destroyed {
            return;
        }
        let Some(pipeline) = self.pipelines.get_mut(&id) else {
            return;
        };
        if pipeline.state() != PipelineState::Clean {
            trace!(node = %pipeline.addr(), len = bytes.len(), "ignoring bytes on draining pipeline");
            return;
        }
        let batch = pipeline.read(bytes);
        for inbound in batch.inbound {
            if self.destroyed {
                return;
            }
            self.handle_inbound(id, inbound);
        }
        if let Some(err) = batch.error {
            warn!(id = %id, error = %err, "malformed response stream");
            self.on_socket_error(id, ErrorKind::Protocol);
        } else if let Some(pipeline) = self.pipelines.get_mut(&id) {
            pipeline.rearm(self.io.as_mut());
        }
    }

    fn handle_inbound(&mut self, id: NodeId, inbound: Inbound) {
        match inbound {
            Inbound::Final { packet, frame } => self.handle_response(id, packet, frame),
            Inbound::Partial { opaque, frame } => self.handle_partial(id, opaque, frame),
            Inbound::Stale { opaque, opcode } => {
                self.stats.stale_responses += 1;
                let node = self
                    .pipelines
                    .get(&id)
                    .map(|p| p.addr().to_string())
                    .unwrap_or_default();
                warn!(node = %node, opaque, opcode, "response for unknown correlation id dropped");
            }
        }
    }

    fn handle_partial(&mut self, id: NodeId, opaque: u32, frame: Frame) {
        let Some(pipeline) = self.pipelines.get(&id) else {
            return;
        };
        let Some(packet) = pipeline.in_flight_packet(opaque) else {
            return;
        };
        let retries = packet.retries;
        let completion = Completion {
            cookie: packet.cookie,
            kind: packet.kind(),
            key: None,
            result: packet
                .request
                .command
                .parse_response(packet.partition, pipeline.addr(), &frame)
                .map_err(|kind| OpError { kind, retries }),
            retries,
            is_final: false,
        };
        let sink = packet.sink.clone();
        self.invoke(&sink, completion);
    }

    fn handle_response(&mut self, id: NodeId, packet: Packet, frame: Frame) {
        let status = frame.status();
        match ErrorKind::from_status(status) {
            Some(kind) if !packet.request.command.answers_per_path(status) => {
                if kind == ErrorKind::NotMyPartition {
                    self.handle_not_my_partition(id, packet, frame.value);
                } else if kind.is_application() {
                    self.deliver(packet, Err(kind));
                } else {
                    self.fail_or_retry(packet, kind);
                }
            }
            _ => {
                let server = self
                    .pipelines
                    .get(&id)
                    .map(|p| p.addr().to_string())
                    .unwrap_or_default();
                let result = packet
                    .request
                    .command
                    .parse_response(packet.partition, &server, &frame);
                self.deliver(packet, result);
            }
        }
    }

    fn handle_not_my_partition(&mut self, id: NodeId, mut packet: Packet, body: Bytes) {
        let host = self
            .pipelines
            .get(&id)
            .map(|p| p.addr().to_string())
            .unwrap_or_default();
        debug!(node = %host, partition = packet.partition, generation = packet.generation, "not my partition");

        if body.is_empty() {
            self.refresh_config("not my partition");
        } else if let Some(snapshot) = self.config.update_from_node(&host, &body) {
            self.apply_topology(snapshot);
        }

        let now = self.io.now();
        if !self
            .policy
            .should_retry(ErrorKind::NotMyPartition, &packet, self.distribution(), now)
        {
            self.deliver(packet, Err(ErrorKind::NotMyPartition));
            return;
        }
        packet.record_retry(ErrorKind::NotMyPartition);
        self.stats.retries += 1;

        if packet.target == Target::Master && self.settings.nmv_retry_immediate {
            if let Some(topo) = self.topology.clone() {
                let remapped = self.map.remap_after_mismatch(
                    packet.node,
                    packet.partition,
                    packet.generation,
                    &topo,
                );
                match remapped {
                    Ok(Some(node)) => {
                        self.stats.remaps += 1;
                        debug!(
                            partition = packet.partition,
                            from = packet.node,
                            to = node,
                            retries = packet.retries,
                            "remapped"
                        );
                        packet.node = node;
                        packet.generation = topo.generation();
                        self.route(packet);
                        self.request_flush();
                        return;
                    }
                    Ok(None) => {}
                    Err(LocateError::Unsupported) => {
                        self.deliver(packet, Err(ErrorKind::NotSupported));
                        return;
                    }
                    Err(_) => {
                        self.await_map(packet);
                        return;
                    }
                }
            }
        }
        let not_before = self.policy.not_before(&packet, now);
        self.retry.push(packet, not_before, ErrorKind::NotMyPartition);
        self.rearm_retry();
    }

    pub fn on_socket_error(&mut self, id: NodeId, error: ErrorKind) {
        if self.destroyed {
            return;
        }
        let Some(pipeline) = self.pipelines.get_mut(&id) else {
            return;
        };
        if pipeline.state() != PipelineState::Clean {
            return;
        }
        warn!(
            node = %pipeline.addr(),
            id = %id,
            error = %error,
            queued = pipeline.queued(),
            in_flight = pipeline.in_flight(),
            "socket error"
        );
        let queued = pipeline.begin_drain(error);
        pipeline.rearm(self.io.as_mut());
        self.io.close(id);
        self.refresh_config("socket error");
        for packet in queued {
            self.fail_or_retry(packet, error);
        }
    }

    /// The transport finished closing `id`; in-flight packets are failed now.
    pub fn on_closed(&mut self, id: NodeId) {
        if self.destroyed {
            self.forget_pipeline(id);
            self.maybe_finish_destroy();
            return;
        }
        let Some(pipeline) = self.pipelines.get_mut(&id) else {
            return;
        };
        if pipeline.state() != PipelineState::ErrorDraining {
            return;
        }
        let (error, packets) = pipeline.finish_drain();
        pipeline.rearm(self.io.as_mut());
        debug!(node = %pipeline.addr(), id = %id, failed = packets.len(), "pipeline drained");
        if pipeline.state() == PipelineState::Closed {
            self.forget_pipeline(id);
        }
        for packet in packets {
            self.fail_or_retry(packet, error);
        }
    }

    fn forget_pipeline(&mut self, id: NodeId) {
        if let Some(mut pipeline) = self.pipelines.remove(&id) {
            pipeline.close(self.io.as_mut());
            for slot in self.by_index.iter_mut() {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }
    }

    pub fn on_timer(&mut self, id: TimerId) {
        if self.destroyed {
            return;
        }
        let now = self.io.now();
        match id {
            TimerId::Pipeline(node) => {
                let Some(pipeline) = self.pipelines.get_mut(&node) else {
                    return;
                };
                pipeline.timer_fired();
                let expired = pipeline.timeout_sweep(now);
                pipeline.rearm(self.io.as_mut());
                if !expired.is_empty() {
                    self.refresh_config("operation timeout");
                }
                for packet in expired {
                    self.expire(packet);
                }
            }
            TimerId::Retry => {
                self.retry.timer_fired();
                self.drain_retry_queue(now);
                self.rearm_retry();
            }
            TimerId::Durability(set) => self.durability_timer(set),
            TimerId::MapWait => {
                self.map_wait_armed = None;
                self.expire_awaiting_map(now);
                self.rearm_map_wait();
            }
        }
    }

    // ----- topology -----

    /// Entry point for the configuration collaborator.
    pub fn on_topology_changed(&mut self, snapshot: Arc<TopologySnapshot>) {
        if self.destroyed {
            return;
        }
        self.apply_topology(snapshot);
    }

    fn apply_topology(&mut self, snapshot: Arc<TopologySnapshot>) {
        if let Some(current) = &self.topology {
            if snapshot.generation() <= current.generation() {
                debug!(
                    generation = snapshot.generation(),
                    current = current.generation(),
                    "ignoring cluster map that is not newer"
                );
                return;
            }
        }
        info!(
            generation = snapshot.generation(),
            nodes = snapshot.num_nodes(),
            partitions = snapshot.num_partitions(),
            "applying cluster map"
        );
        self.map.sync(&snapshot);
        self.by_index = vec![None; snapshot.num_nodes()];

        let mut relocate = Vec::new();
        let mut removed = Vec::new();
        for (id, pipeline) in self.pipelines.iter_mut() {
            match snapshot.position_of(pipeline.addr()) {
                Some(index) => {
                    pipeline.set_index(Some(index));
                    self.by_index[index] = Some(*id);
                }
                None => {
                    info!(node = %pipeline.addr(), id = %id, "node removed from cluster map");
                    pipeline.set_index(None);
                    let was_clean = pipeline.state() == PipelineState::Clean;
                    let had_transport = pipeline.has_transport();
                    relocate.extend(pipeline.begin_drain(ErrorKind::MapChanged));
                    if !had_transport {
                        removed.push(*id);
                    } else if was_clean {
                        self.io.close(*id);
                    }
                }
            }
        }
        self.topology = Some(snapshot);
        for id in removed {
            self.forget_pipeline(id);
        }
        let now = self.io.now();
        self.expire_awaiting_map(now);
        if self.destroyed {
            return;
        }
        relocate.append(&mut self.awaiting_map);
        for packet in relocate {
            self.redispatch(packet);
        }
        self.rearm_map_wait();
    }

    // ----- teardown -----

    /// Abandons all outstanding work. No callback fires afterwards.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        info!(pipelines = self.pipelines.len(), "destroying dispatcher");
        self.teardown_common();
        let pipelines = std::mem::take(&mut self.pipelines);
        for (id, mut pipeline) in pipelines {
            let connected = pipeline.has_transport();
            pipeline.close(self.io.as_mut());
            if connected {
                self.io.close(id);
            }
        }
        self.by_index.clear();
    }

    /// Like [`destroy`](Self::destroy), but `notify` fires once every open
    /// connection has reported closed.
    pub fn destroy_async(&mut self, notify: impl FnOnce() + 'static) {
        if self.destroyed {
            return;
        }
        info!(pipelines = self.pipelines.len(), "destroying dispatcher asynchronously");
        self.teardown_common();
        self.destroy_notify = Some(Box::new(notify));
        let ids: Vec<NodeId> = self.pipelines.keys().copied().collect();
        for id in ids {
            let Some(pipeline) = self.pipelines.get_mut(&id) else {
                continue;
            };
            if pipeline.has_transport() {
                pipeline.close(self.io.as_mut());
                self.io.close(id);
            } else {
                self.forget_pipeline(id);
            }
        }
        self.maybe_finish_destroy();
    }

    fn teardown_common(&mut self) {
        self.destroyed = true;
        let _ = self.sched.fail();
        self.retry.drain();
        if self.retry.update_armed().is_some() {
            self.io.cancel_timer(TimerId::Retry);
        }
        self.awaiting_map.clear();
        self.rearm_map_wait();
        for set in self.durability.drain() {
            self.io.cancel_timer(TimerId::Durability(set));
        }
    }

    fn maybe_finish_destroy(&mut self) {
        if self.pipelines.is_empty() {
            if let Some(notify) = self.destroy_notify.take() {
                info!("dispatcher destroyed");
                notify();
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("generation", &self.topology.as_ref().map(|t| t.generation()))
            .field("pipelines", &self.pipelines.len())
            .field("retry_queue", &self.retry.len())
            .field("awaiting_map", &self.awaiting_map.len())
            .field("stats", &self.stats)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
