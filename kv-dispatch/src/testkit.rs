//! In-process cluster speaking the binary protocol.
//!
//! Every node listens on its own loopback port and serves a single shared
//! item store, but only answers for partitions the cluster map says it owns.
//! Requests for other partitions get a not-my-partition reply carrying the
//! current map. Ownership can be moved and nodes can be made to swallow
//! requests, which is what the end-to-end tests and `kvd cluster` use.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, broadcast},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    command::{MutationToken, SeqnoStatus},
    protocol::{Decoder, Frame, MAGIC_REQUEST, Opcode, Status},
    topology::{NodeInfo, TopologySnapshot},
};

const UUID_BASE: u64 = 0x5eed_0000;

#[derive(Debug, Clone)]
struct Item {
    value: Bytes,
    flags: u32,
    cas: u64,
}

struct ClusterState {
    topology: Mutex<TopologySnapshot>,
    items: Mutex<HashMap<Bytes, Item>>,
    seqnos: Mutex<HashMap<u16, u64>>,
    black_holed: Mutex<HashSet<usize>>,
    nmv_carries_map: Mutex<bool>,
    next_cas: AtomicU64,
    served: AtomicU64,
}

impl ClusterState {
    fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed)
    }

    async fn bump_seqno(&self, partition: u16) -> MutationToken {
        let mut seqnos = self.seqnos.lock().await;
        let seqno = seqnos.entry(partition).or_insert(0);
        *seqno += 1;
        MutationToken {
            partition,
            uuid: UUID_BASE + u64::from(partition),
            seqno: *seqno,
        }
    }
}

/// A running cluster. Dropping it without [`shutdown`](Self::shutdown)
/// leaves the node tasks running until the runtime stops.
pub struct TestCluster {
    addrs: Vec<SocketAddr>,
    state: Arc<ClusterState>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestCluster {
    /// Binds `nodes` loopback listeners and starts serving a uniform map of
    /// `partitions` partitions with `replicas` replicas at generation 1.
    pub async fn start(nodes: usize, partitions: usize, replicas: usize) -> Result<Self> {
        let mut listeners = Vec::with_capacity(nodes);
        for _ in 0..nodes {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .context("failed to bind test node")?;
            listeners.push(listener);
        }
        let addrs = listeners
            .iter()
            .map(TcpListener::local_addr)
            .collect::<std::io::Result<Vec<_>>>()
            .context("failed to read listener address")?;
        let infos = addrs
            .iter()
            .map(|addr| NodeInfo::new(addr.ip().to_string(), addr.port()))
            .collect();
        let topology = TopologySnapshot::uniform(1, infos, partitions, replicas)
            .context("failed to build cluster map")?;

        let state = Arc::new(ClusterState {
            topology: Mutex::new(topology),
            items: Mutex::new(HashMap::new()),
            seqnos: Mutex::new(HashMap::new()),
            black_holed: Mutex::new(HashSet::new()),
            nmv_carries_map: Mutex::new(true),
            next_cas: AtomicU64::new(1),
            served: AtomicU64::new(0),
        });
        let (shutdown_tx, _) = broadcast::channel(1);
        let tasks = listeners
            .into_iter()
            .enumerate()
            .map(|(index, listener)| {
                let node = NodeServer {
                    index,
                    listener,
                    state: Arc::clone(&state),
                };
                let mut shutdown_rx = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let shutdown = async move {
                        let _ = shutdown_rx.recv().await;
                    };
                    if let Err(err) = node.run_until(shutdown).await {
                        warn!(node = index, error = ?err, "test node stopped with error");
                    }
                })
            })
            .collect();

        info!(nodes, partitions, replicas, "test cluster started");
        Ok(Self {
            addrs,
            state,
            shutdown_tx,
            tasks,
        })
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// The map the nodes currently enforce.
    pub async fn topology(&self) -> TopologySnapshot {
        self.state.topology.lock().await.clone()
    }

    /// Makes `to` the master of `partition` under a new generation. The
    /// previous master keeps a replica slot if `to` held one.
    pub async fn move_partition(&self, partition: u16, to: usize) -> Result<TopologySnapshot> {
        let mut topology = self.state.topology.lock().await;
        let mut owners = topology.owners(partition).to_vec();
        anyhow::ensure!(!owners.is_empty(), "partition {partition} does not exist");
        match owners.iter().position(|owner| *owner == Some(to)) {
            Some(pos) => owners.swap(0, pos),
            None => owners[0] = Some(to),
        }
        let next = topology
            .with_owners(topology.generation() + 1, usize::from(partition), owners)
            .context("invalid partition move")?;
        info!(partition, to, generation = next.generation(), "partition moved");
        *topology = next.clone();
        Ok(next)
    }

    /// Sets whether node `index` silently drops every request it receives.
    pub async fn black_hole(&self, index: usize, enabled: bool) {
        let mut black_holed = self.state.black_holed.lock().await;
        if enabled {
            black_holed.insert(index);
        } else {
            black_holed.remove(&index);
        }
    }

    /// Sets whether not-my-partition replies include the current map.
    pub async fn set_nmv_carries_map(&self, enabled: bool) {
        *self.state.nmv_carries_map.lock().await = enabled;
    }

    /// Requests answered so far, across all nodes.
    pub fn served(&self) -> u64 {
        self.state.served.load(Ordering::Relaxed)
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            task.await.context("test node task panicked")?;
        }
        info!("test cluster stopped");
        Ok(())
    }
}

struct NodeServer {
    index: usize,
    listener: TcpListener,
    state: Arc<ClusterState>,
}

impl NodeServer {
    async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let NodeServer {
            index,
            listener,
            state,
        } = self;
        tokio::pin!(shutdown);
        let mut connections: Vec<JoinHandle<()>> = Vec::new();

        loop {
            select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(node = index, peer = %peer, "client connected");
                        let state = Arc::clone(&state);
                        connections.push(tokio::spawn(async move {
                            if let Err(err) = serve_connection(index, stream, state).await {
                                debug!(node = index, peer = %peer, error = ?err, "client connection ended");
                            }
                        }));
                    }
                    Err(err) => warn!(node = index, error = ?err, "failed to accept connection"),
                },
            }
        }

        for connection in connections {
            connection.abort();
        }
        Ok(())
    }
}

async fn serve_connection(index: usize, stream: TcpStream, state: Arc<ClusterState>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf).await.context("read failed")?;
        if n == 0 {
            return Ok(());
        }
        decoder.feed(&buf[..n]);
        let mut out = BytesMut::new();
        while let Some(frame) = decoder.next_frame().context("malformed request")? {
            anyhow::ensure!(
                frame.header.magic == MAGIC_REQUEST,
                "expected request magic, got 0x{:02x}",
                frame.header.magic
            );
            if state.black_holed.lock().await.contains(&index) {
                debug!(node = index, opaque = frame.opaque(), "dropping request");
                continue;
            }
            state.served.fetch_add(1, Ordering::Relaxed);
            for reply in handle_request(index, &frame, &state).await {
                reply.with_opaque(frame.opaque()).encode_into(&mut out);
            }
        }
        if !out.is_empty() {
            writer.write_all(&out).await.context("write failed")?;
        }
    }
}

fn reply(request: &Frame, status: Status) -> Frame {
    Frame::response(request.header.opcode, status, Bytes::new(), Bytes::new(), Bytes::new())
}

fn reply_with(request: &Frame, extras: Bytes, value: Bytes, cas: u64) -> Frame {
    Frame::response(request.header.opcode, Status::Success, extras, Bytes::new(), value).with_cas(cas)
}

async fn handle_request(index: usize, frame: &Frame, state: &ClusterState) -> Vec<Frame> {
    let Some(opcode) = frame.opcode() else {
        return vec![reply(frame, Status::UnknownCommand)];
    };
    let partition = frame.header.partition();
    match opcode {
        Opcode::Noop => return vec![reply(frame, Status::Success)],
        Opcode::Stat => return stats(index, frame, state).await,
        Opcode::GetClusterConfig => {
            let map = state.topology.lock().await.to_json().unwrap_or_default();
            return vec![reply_with(frame, Bytes::new(), Bytes::from(map), 0)];
        }
        _ => {}
    }

    {
        let topology = state.topology.lock().await;
        let owners = topology.owners(partition);
        let owns = match opcode {
            Opcode::GetReplica => owners.iter().skip(1).any(|owner| *owner == Some(index)),
            Opcode::ObserveSeqno => owners.contains(&Some(index)),
            _ => owners.first() == Some(&Some(index)),
        };
        if !owns {
            let value = if *state.nmv_carries_map.lock().await {
                Bytes::from(topology.to_json().unwrap_or_default())
            } else {
                Bytes::new()
            };
            debug!(node = index, partition, generation = topology.generation(), "not my partition");
            return vec![Frame::response(
                frame.header.opcode,
                Status::NotMyPartition,
                Bytes::new(),
                Bytes::new(),
                value,
            )];
        }
    }

    let single = match opcode {
        Opcode::Get | Opcode::GetReplica => get(frame, state).await,
        Opcode::Set | Opcode::Add | Opcode::Replace => store(opcode, partition, frame, state).await,
        Opcode::Append | Opcode::Prepend => concat(opcode, partition, frame, state).await,
        Opcode::Delete => delete(partition, frame, state).await,
        Opcode::Increment | Opcode::Decrement => counter(opcode, partition, frame, state).await,
        Opcode::Touch => touch(frame, state).await,
        Opcode::UnlockKey => reply(frame, Status::Success),
        Opcode::ObserveSeqno => observe(index, partition, frame, state).await,
        _ => reply(frame, Status::NotSupported),
    };
    vec![single]
}

async fn get(frame: &Frame, state: &ClusterState) -> Frame {
    match state.items.lock().await.get(&frame.key) {
        Some(item) => {
            let mut extras = BytesMut::with_capacity(4);
            extras.put_u32(item.flags);
            reply_with(frame, extras.freeze(), item.value.clone(), item.cas)
        }
        None => reply(frame, Status::KeyNotFound),
    }
}

async fn store(opcode: Opcode, partition: u16, frame: &Frame, state: &ClusterState) -> Frame {
    let flags = if frame.extras.len() >= 4 {
        (&frame.extras[..]).get_u32()
    } else {
        0
    };
    let mut items = state.items.lock().await;
    let existing = items.get(&frame.key);
    let status = match (opcode, existing) {
        (Opcode::Add, Some(_)) => Some(Status::KeyExists),
        (Opcode::Replace, None) => Some(Status::KeyNotFound),
        (_, Some(item)) if frame.cas() != 0 && frame.cas() != item.cas => Some(Status::KeyExists),
        _ => None,
    };
    if let Some(status) = status {
        return reply(frame, status);
    }
    let cas = state.next_cas();
    items.insert(
        frame.key.clone(),
        Item {
            value: frame.value.clone(),
            flags,
            cas,
        },
    );
    drop(items);
    mutated(frame, state.bump_seqno(partition).await, Bytes::new(), cas)
}

async fn concat(opcode: Opcode, partition: u16, frame: &Frame, state: &ClusterState) -> Frame {
    let mut items = state.items.lock().await;
    let Some(item) = items.get_mut(&frame.key) else {
        return reply(frame, Status::NotStored);
    };
    let mut value = BytesMut::with_capacity(item.value.len() + frame.value.len());
    if opcode == Opcode::Append {
        value.put_slice(&item.value);
        value.put_slice(&frame.value);
    } else {
        value.put_slice(&frame.value);
        value.put_slice(&item.value);
    }
    item.value = value.freeze();
    item.cas = state.next_cas();
    let cas = item.cas;
    drop(items);
    mutated(frame, state.bump_seqno(partition).await, Bytes::new(), cas)
}

async fn delete(partition: u16, frame: &Frame, state: &ClusterState) -> Frame {
    let mut items = state.items.lock().await;
    match items.get(&frame.key) {
        None => return reply(frame, Status::KeyNotFound),
        Some(item) if frame.cas() != 0 && frame.cas() != item.cas => {
            return reply(frame, Status::KeyExists);
        }
        Some(_) => {}
    }
    items.remove(&frame.key);
    drop(items);
    mutated(frame, state.bump_seqno(partition).await, Bytes::new(), state.next_cas())
}

async fn counter(opcode: Opcode, partition: u16, frame: &Frame, state: &ClusterState) -> Frame {
    if frame.extras.len() != 20 {
        return reply(frame, Status::Invalid);
    }
    let mut extras = &frame.extras[..];
    let delta = extras.get_u64();
    let initial = extras.get_u64();
    let expiry = extras.get_u32();

    let mut items = state.items.lock().await;
    let next = match items.get(&frame.key) {
        None if expiry == 0xffff_ffff => return reply(frame, Status::KeyNotFound),
        None => initial,
        Some(item) => {
            let Some(current) = std::str::from_utf8(&item.value)
                .ok()
                .and_then(|text| text.trim().parse::<u64>().ok())
            else {
                return reply(frame, Status::DeltaBadValue);
            };
            if opcode == Opcode::Increment {
                current.wrapping_add(delta)
            } else {
                current.saturating_sub(delta)
            }
        }
    };
    let cas = state.next_cas();
    items.insert(
        frame.key.clone(),
        Item {
            value: Bytes::from(next.to_string()),
            flags: 0,
            cas,
        },
    );
    drop(items);
    let mut value = BytesMut::with_capacity(8);
    value.put_u64(next);
    mutated(frame, state.bump_seqno(partition).await, value.freeze(), cas)
}

async fn touch(frame: &Frame, state: &ClusterState) -> Frame {
    match state.items.lock().await.get(&frame.key) {
        Some(item) => reply_with(frame, Bytes::new(), Bytes::new(), item.cas),
        None => reply(frame, Status::KeyNotFound),
    }
}

fn mutated(frame: &Frame, token: MutationToken, value: Bytes, cas: u64) -> Frame {
    reply_with(frame, token.to_extras(), value, cas)
}

/// The test cluster persists synchronously, so both seqnos are always equal.
async fn observe(index: usize, partition: u16, frame: &Frame, state: &ClusterState) -> Frame {
    let seqno = state.seqnos.lock().await.get(&partition).copied().unwrap_or(0);
    let status = SeqnoStatus {
        server: index,
        partition,
        uuid: UUID_BASE + u64::from(partition),
        persisted_seqno: seqno,
        current_seqno: seqno,
        failover: None,
    };
    reply_with(frame, Bytes::new(), status.encode(), 0)
}

async fn stats(index: usize, frame: &Frame, state: &ClusterState) -> Vec<Frame> {
    let items = state.items.lock().await.len();
    let generation = state.topology.lock().await.generation();
    let entries = [
        ("node_index", index.to_string()),
        ("curr_items", items.to_string()),
        ("cluster_map_rev", generation.to_string()),
    ];
    let mut replies: Vec<Frame> = entries
        .into_iter()
        .map(|(key, value)| {
            Frame::response(
                frame.header.opcode,
                Status::Success,
                Bytes::new(),
                Bytes::from_static(key.as_bytes()),
                Bytes::from(value),
            )
        })
        .collect();
    replies.push(reply(frame, Status::Success));
    replies
}
