//! Key to partition to node resolution.
//!
//! Stateless lookups live in free functions ([`locate`], [`locate_replica`]).
//! [`PartitionMap`] adds the per-instance guess table used after a node refuses
//! a partition it was believed to own.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::topology::{Distribution, NodeInfo, TopologySnapshot};

/// Points placed on the continuum per node in ketama mode.
const KETAMA_POINTS_PER_NODE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LocateError {
    #[error("topology has no nodes")]
    NoNodes,
    #[error("partition {partition} has no master")]
    NoOwner { partition: u16 },
    #[error("partition {partition} has no replica {index}")]
    NoReplica { partition: u16, index: usize },
    #[error("not supported by this distribution mode")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub partition: u16,
    pub node: usize,
}

pub fn partition_for_key(key: &[u8], num_partitions: usize) -> u16 {
    let digest = crc32fast::hash(key);
    (((digest >> 16) & 0x7fff) as usize % num_partitions.max(1)) as u16
}

pub fn ketama_continuum(nodes: &[NodeInfo]) -> Vec<(u32, usize)> {
    let mut points: Vec<(u32, usize)> = nodes
        .iter()
        .enumerate()
        .flat_map(|(index, node)| {
            (0..KETAMA_POINTS_PER_NODE).map(move |i| {
                let label = format!("{}-{}", node.kv_addr(), i);
                (crc32fast::hash(label.as_bytes()), index)
            })
        })
        .collect();
    points.sort_unstable();
    points
}

fn ketama_node(key: &[u8], continuum: &[(u32, usize)]) -> Option<usize> {
    let hash = crc32fast::hash(key);
    let at = continuum.partition_point(|&(point, _)| point < hash);
    continuum
        .get(at)
        .or_else(|| continuum.first())
        .map(|&(_, node)| node)
}

/// Master location of `key`.
pub fn locate(key: &[u8], topo: &TopologySnapshot) -> Result<Located, LocateError> {
    if topo.num_nodes() == 0 {
        return Err(LocateError::NoNodes);
    }
    match topo.distribution() {
        Distribution::Ketama => {
            let node = ketama_node(key, topo.continuum()).ok_or(LocateError::NoNodes)?;
            Ok(Located { partition: 0, node })
        }
        Distribution::Partitioned => {
            let partition = partition_for_key(key, topo.num_partitions());
            let node = topo
                .master(partition)
                .ok_or(LocateError::NoOwner { partition })?;
            Ok(Located { partition, node })
        }
    }
}

/// Location of replica `index` (0-based) of `key`'s partition.
pub fn locate_replica(
    key: &[u8],
    topo: &TopologySnapshot,
    index: usize,
) -> Result<Located, LocateError> {
    if topo.num_nodes() == 0 {
        return Err(LocateError::NoNodes);
    }
    if topo.distribution() == Distribution::Ketama {
        return Err(LocateError::Unsupported);
    }
    let partition = partition_for_key(key, topo.num_partitions());
    let node = topo
        .replica(partition, index)
        .ok_or(LocateError::NoReplica { partition, index })?;
    Ok(Located { partition, node })
}

/// Owner guesses made while the cluster map is known to be stale.
///
/// A guess sticks to its partition until the topology generation changes,
/// so later keys in the same partition go straight to the node that last
/// accepted it.
#[derive(Debug, Default)]
pub struct PartitionMap {
    generation: u64,
    guesses: HashMap<u16, usize>,
}

impl PartitionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all guesses once a newer generation is in use.
    pub fn sync(&mut self, topo: &TopologySnapshot) {
        if topo.generation() != self.generation {
            if !self.guesses.is_empty() {
                debug!(
                    old = self.generation,
                    new = topo.generation(),
                    dropped = self.guesses.len(),
                    "discarding partition guesses"
                );
            }
            self.guesses.clear();
            self.generation = topo.generation();
        }
    }

    pub fn guess_for(&self, partition: u16) -> Option<usize> {
        self.guesses.get(&partition).copied()
    }

    /// Like [`locate`], but prefers a guessed owner for this generation.
    pub fn locate(&self, key: &[u8], topo: &TopologySnapshot) -> Result<Located, LocateError> {
        if topo.distribution() == Distribution::Partitioned
            && topo.generation() == self.generation
            && topo.num_nodes() > 0
        {
            let partition = partition_for_key(key, topo.num_partitions());
            if let Some(node) = self.guess_for(partition) {
                return Ok(Located { partition, node });
            }
        }
        locate(key, topo)
    }

    /// Picks the next node to try after `old_node` refused `partition`.
    ///
    /// With a newer generation than the packet was sent under, the new map
    /// decides: its master is used unless it is the node that just refused,
    /// and a partition it leaves without a master is [`LocateError::NoOwner`].
    /// Otherwise the next listed owner after `old_node` is tried, then the
    /// following node in index order. `Ok(None)` means there is no other node
    /// to try.
    pub fn remap_after_mismatch(
        &mut self,
        old_node: usize,
        partition: u16,
        sent_generation: u64,
        topo: &TopologySnapshot,
    ) -> Result<Option<usize>, LocateError> {
        self.sync(topo);
        if topo.distribution() == Distribution::Ketama {
            return Ok(None);
        }
        let n = topo.num_nodes();
        if n == 0 {
            return Err(LocateError::NoNodes);
        }
        if topo.generation() != sent_generation {
            let master = topo
                .master(partition)
                .ok_or(LocateError::NoOwner { partition })?;
            if master != old_node {
                return Ok(Some(master));
            }
        }
        if n == 1 {
            return Ok(None);
        }
        let owners = topo.owners(partition);
        let next_owner = owners
            .iter()
            .position(|&owner| owner == Some(old_node))
            .and_then(|pos| owners[pos + 1..].iter().flatten().copied().find(|&node| node != old_node));
        let guess = next_owner.unwrap_or((old_node + 1) % n);
        debug!(partition, old_node, guess, "guessing partition owner");
        self.guesses.insert(partition, guess);
        Ok(Some(guess))
    }
}
