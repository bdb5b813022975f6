//! Immutable cluster layout snapshots.
//!
//! A [`TopologySnapshot`] is one generation of the cluster map: the ordered
//! node list, the partition table (master first, then replicas) and the
//! distribution mode. Snapshots are shared as `Arc` and replaced wholesale.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::partition;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("invalid cluster map document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("partition {partition} references node {node} but only {nodes} nodes exist")]
    InvalidOwner {
        partition: usize,
        node: usize,
        nodes: usize,
    },
    #[error("invalid node address `{0}`")]
    BadAddress(String),
    #[error("cluster map has no nodes")]
    Empty,
    #[error("partitioned map has no partitions")]
    NoPartitions,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub host: String,
    pub kv_port: u16,
    pub mgmt_port: Option<u16>,
    pub query_port: Option<u16>,
}

impl NodeInfo {
    pub fn new(host: impl Into<String>, kv_port: u16) -> Self {
        Self {
            host: host.into(),
            kv_port,
            mgmt_port: None,
            query_port: None,
        }
    }

    /// Parses `host:port` into a node whose data port is `port`.
    pub fn parse(addr: &str) -> Result<Self, TopologyError> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| TopologyError::BadAddress(addr.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| TopologyError::BadAddress(addr.to_string()))?;
        if host.is_empty() {
            return Err(TopologyError::BadAddress(addr.to_string()));
        }
        Ok(Self::new(host, port))
    }

    /// Address of the data service, which is what pipelines connect to.
    pub fn kv_addr(&self) -> String {
        format!("{}:{}", self.host, self.kv_port)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.kv_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Keys hash to partitions, partitions map to nodes through the table.
    Partitioned,
    /// Keys hash straight onto a continuum of nodes; no partitions, no replicas.
    Ketama,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    generation: u64,
    nodes: Vec<NodeInfo>,
    partitions: Vec<Vec<Option<usize>>>,
    num_replicas: usize,
    distribution: Distribution,
    continuum: Vec<(u32, usize)>,
}

impl TopologySnapshot {
    pub fn partitioned(
        generation: u64,
        nodes: Vec<NodeInfo>,
        partitions: Vec<Vec<Option<usize>>>,
        num_replicas: usize,
    ) -> Result<Self, TopologyError> {
        if nodes.is_empty() {
            return Err(TopologyError::Empty);
        }
        if partitions.is_empty() {
            return Err(TopologyError::NoPartitions);
        }
        for (partition, owners) in partitions.iter().enumerate() {
            if let Some(&node) = owners.iter().flatten().find(|&&node| node >= nodes.len()) {
                return Err(TopologyError::InvalidOwner {
                    partition,
                    node,
                    nodes: nodes.len(),
                });
            }
        }
        Ok(Self {
            generation,
            nodes,
            partitions,
            num_replicas,
            distribution: Distribution::Partitioned,
            continuum: Vec::new(),
        })
    }

    pub fn ketama(generation: u64, nodes: Vec<NodeInfo>) -> Result<Self, TopologyError> {
        if nodes.is_empty() {
            return Err(TopologyError::Empty);
        }
        let continuum = partition::ketama_continuum(&nodes);
        Ok(Self {
            generation,
            nodes,
            partitions: Vec::new(),
            num_replicas: 0,
            distribution: Distribution::Ketama,
            continuum,
        })
    }

    /// Spreads `num_partitions` masters round-robin across `nodes`, with
    /// replica `k` of partition `p` on node `(p + k + 1) % n` when enough
    /// nodes exist.
    pub fn uniform(
        generation: u64,
        nodes: Vec<NodeInfo>,
        num_partitions: usize,
        num_replicas: usize,
    ) -> Result<Self, TopologyError> {
        let n = nodes.len();
        if n == 0 {
            return Err(TopologyError::Empty);
        }
        let partitions = (0..num_partitions)
            .map(|p| {
                (0..=num_replicas)
                    .map(|k| (k < n).then_some((p + k) % n))
                    .collect()
            })
            .collect();
        Self::partitioned(generation, nodes, partitions, num_replicas)
    }

    /// Copy of this snapshot under a new generation with one partition's
    /// owner list replaced.
    pub fn with_owners(
        &self,
        generation: u64,
        partition: usize,
        owners: Vec<Option<usize>>,
    ) -> Result<Self, TopologyError> {
        let mut partitions = self.partitions.clone();
        if let Some(slot) = partitions.get_mut(partition) {
            *slot = owners;
        }
        Self::partitioned(generation, self.nodes.clone(), partitions, self.num_replicas)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&NodeInfo> {
        self.nodes.get(index)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    pub fn continuum(&self) -> &[(u32, usize)] {
        &self.continuum
    }

    pub fn owners(&self, partition: u16) -> &[Option<usize>] {
        self.partitions
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn master(&self, partition: u16) -> Option<usize> {
        self.owners(partition).first().copied().flatten()
    }

    /// Node serving replica `index` (0-based) of `partition`.
    pub fn replica(&self, partition: u16, index: usize) -> Option<usize> {
        self.owners(partition).get(index + 1).copied().flatten()
    }

    /// Index of the node whose data address is `addr`.
    pub fn position_of(&self, addr: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.kv_addr() == addr)
    }

    /// Parses the JSON cluster map document served by the cluster, both as
    /// the bootstrap config and embedded in not-my-partition replies.
    pub fn from_json(raw: &[u8]) -> Result<Self, TopologyError> {
        let doc: ClusterMapDoc = serde_json::from_slice(raw)?;
        match doc.vbucket_server_map {
            Some(map) if doc.node_locator != "ketama" => {
                let mut nodes = map
                    .server_list
                    .iter()
                    .map(|addr| NodeInfo::parse(addr))
                    .collect::<Result<Vec<_>, _>>()?;
                for node in &mut nodes {
                    if let Some(doc_node) = doc.nodes.iter().find(|n| n.matches(node)) {
                        node.mgmt_port = doc_node.ports.mgmt;
                        node.query_port = doc_node.ports.query;
                    }
                }
                let partitions = map
                    .vbucket_map
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|&idx| usize::try_from(idx).ok())
                            .collect()
                    })
                    .collect();
                Self::partitioned(doc.rev, nodes, partitions, map.num_replicas)
            }
            _ => {
                let nodes = doc
                    .nodes
                    .iter()
                    .map(DocNode::to_node_info)
                    .collect::<Result<Vec<_>, _>>()?;
                Self::ketama(doc.rev, nodes)
            }
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, TopologyError> {
        let nodes = self
            .nodes
            .iter()
            .map(|node| DocNode {
                hostname: node.host.clone(),
                ports: DocPorts {
                    direct: node.kv_port,
                    mgmt: node.mgmt_port,
                    query: node.query_port,
                },
            })
            .collect();
        let vbucket_server_map = match self.distribution {
            Distribution::Ketama => None,
            Distribution::Partitioned => Some(DocServerMap {
                num_replicas: self.num_replicas,
                server_list: self.nodes.iter().map(NodeInfo::kv_addr).collect(),
                vbucket_map: self
                    .partitions
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|owner| owner.map_or(-1, |idx| idx as i64))
                            .collect()
                    })
                    .collect(),
            }),
        };
        let doc = ClusterMapDoc {
            rev: self.generation,
            node_locator: match self.distribution {
                Distribution::Partitioned => "vbucket".to_string(),
                Distribution::Ketama => "ketama".to_string(),
            },
            nodes,
            vbucket_server_map,
        };
        Ok(serde_json::to_vec(&doc)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterMapDoc {
    rev: u64,
    #[serde(default = "default_locator")]
    node_locator: String,
    #[serde(default)]
    nodes: Vec<DocNode>,
    #[serde(
        rename = "vBucketServerMap",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    vbucket_server_map: Option<DocServerMap>,
}

fn default_locator() -> String {
    "vbucket".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct DocNode {
    hostname: String,
    ports: DocPorts,
}

impl DocNode {
    fn host(&self) -> &str {
        self.hostname
            .rsplit_once(':')
            .map_or(self.hostname.as_str(), |(host, _)| host)
    }

    fn matches(&self, node: &NodeInfo) -> bool {
        self.host() == node.host && self.ports.direct == node.kv_port
    }

    fn to_node_info(&self) -> Result<NodeInfo, TopologyError> {
        if self.host().is_empty() {
            return Err(TopologyError::BadAddress(self.hostname.clone()));
        }
        Ok(NodeInfo {
            host: self.host().to_string(),
            kv_port: self.ports.direct,
            mgmt_port: self.ports.mgmt,
            query_port: self.ports.query,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DocPorts {
    direct: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mgmt: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    query: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocServerMap {
    num_replicas: usize,
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> Vec<NodeInfo> {
        (0..3)
            .map(|i| NodeInfo::new("10.0.0.1", 11210 + i))
            .collect()
    }

    #[test]
    fn uniform_layout_spreads_masters_and_replicas() {
        let topo = TopologySnapshot::uniform(1, three_nodes(), 8, 1).expect("topology");
        assert_eq!(topo.master(0), Some(0));
        assert_eq!(topo.master(4), Some(1));
        assert_eq!(topo.replica(4, 0), Some(2));
        assert_eq!(topo.replica(4, 1), None);
        assert_eq!(topo.position_of("10.0.0.1:11212"), Some(2));
    }

    #[test]
    fn rejects_owner_outside_node_list() {
        let err = TopologySnapshot::partitioned(1, three_nodes(), vec![vec![Some(7)]], 0)
            .expect_err("owner out of range");
        assert!(matches!(err, TopologyError::InvalidOwner { node: 7, .. }));
    }

    #[test]
    fn parses_cluster_map_document() {
        let doc = br#"{
            "rev": 42,
            "nodes": [
                {"hostname": "a.example:8091", "ports": {"direct": 11210, "mgmt": 8091}},
                {"hostname": "b.example:8091", "ports": {"direct": 11210}}
            ],
            "vBucketServerMap": {
                "numReplicas": 1,
                "serverList": ["a.example:11210", "b.example:11210"],
                "vBucketMap": [[0, 1], [1, -1]]
            }
        }"#;
        let topo = TopologySnapshot::from_json(doc).expect("parse");
        assert_eq!(topo.generation(), 42);
        assert_eq!(topo.distribution(), Distribution::Partitioned);
        assert_eq!(topo.num_partitions(), 2);
        assert_eq!(topo.replica(0, 0), Some(1));
        assert_eq!(topo.replica(1, 0), None);
        assert_eq!(topo.nodes()[0].mgmt_port, Some(8091));

        let reparsed = TopologySnapshot::from_json(&topo.to_json().expect("encode")).expect("parse");
        assert_eq!(reparsed, topo);
    }

    #[test]
    fn ketama_document_builds_continuum() {
        let doc = br#"{
            "rev": 3,
            "nodeLocator": "ketama",
            "nodes": [
                {"hostname": "m1:8091", "ports": {"direct": 11211}},
                {"hostname": "m2:8091", "ports": {"direct": 11211}}
            ]
        }"#;
        let topo = TopologySnapshot::from_json(doc).expect("parse");
        assert_eq!(topo.distribution(), Distribution::Ketama);
        assert_eq!(topo.num_partitions(), 0);
        assert!(!topo.continuum().is_empty());
        assert_eq!(topo.nodes()[1].kv_addr(), "m2:11211");
    }
}
