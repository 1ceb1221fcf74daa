use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Result};
use protocol::{
    task::{CodecSet, Task},
    NodeId, NodeState,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::assignment::Assignments;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    /// Maximum number of concurrent tasks.
    pub threads: u32,
    pub codecs: CodecSet,
    pub status: NodeState,
    pub non_fatal_crashes: u32,
    #[serde(skip, default = "Instant::now")]
    pub last_seen: Instant,
}

/// What a node tells about itself when connecting.
#[derive(Debug, Clone)]
pub struct NodeProfile {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub threads: u32,
    pub codecs: CodecSet,
}

impl Node {
    fn new(id: NodeId, profile: NodeProfile) -> Self {
        let mut node = Self {
            id,
            name: String::new(),
            address: profile.address,
            port: 0,
            threads: 0,
            codecs: CodecSet::empty(),
            status: NodeState::NotConnected,
            non_fatal_crashes: 0,
            last_seen: Instant::now(),
        };
        node.refresh(profile);
        node
    }

    fn refresh(&mut self, profile: NodeProfile) {
        self.name = profile.name;
        self.address = profile.address;
        self.port = profile.port;
        self.threads = profile.threads;
        self.codecs = profile.codecs;
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn can_handle(&self, task: &Task) -> bool {
        self.codecs.supports(task.kind.codec())
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

/// Known nodes, iterated in order of first registration.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, Node>,
    order: Vec<NodeId>,
    minted: u64,
}

impl NodeRegistry {
    /// Registers a node that is about to shake hands.
    ///
    /// A missing id is minted. A known id is accepted only while that node
    /// is `NotConnected`, which makes it a reconnection.
    pub fn add_node(&mut self, unid: Option<NodeId>, profile: NodeProfile) -> Result<NodeId> {
        let (id, minted) = match unid {
            Some(id) => (id, false),
            None => (self.mint_id(&profile.name), true),
        };

        match self.nodes.get_mut(&id) {
            Some(_) if minted => {
                bail!("minted node id {id} collides with a known node, retry");
            }
            Some(existing) if existing.status == NodeState::NotConnected => {
                info!(node_id = %id, name = %existing.name, "node reconnecting");
                existing.status = NodeState::NotConnected;
            }
            Some(existing) => {
                bail!("node {id} is already registered as {}", existing.status);
            }
            None => {
                info!(node_id = %id, name = %profile.name, "added node");
                self.order.push(id.clone());
                self.nodes.insert(id.clone(), Node::new(id.clone(), profile));
            }
        }
        Ok(id)
    }

    /// Handshake done: the node may receive work.
    pub fn complete_handshake(&mut self, id: &NodeId, profile: NodeProfile) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        node.refresh(profile);
        node.status = NodeState::Free;
        node.non_fatal_crashes = 0;
        node.touch();
        true
    }

    /// SHA-256 of the current time, the node name and a per-registry counter.
    fn mint_id(&mut self, name: &str) -> NodeId {
        self.minted += 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let digest = Sha256::digest(format!("{millis}{name}{}", self.minted).as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        NodeId::new(hex).unwrap_or_else(|| unreachable!("a sha-256 hex digest is never blank"))
    }

    /// Looks up the sender of a report. Unknown senders are logged.
    pub fn identify(&self, id: &NodeId) -> Option<&Node> {
        let node = self.nodes.get(id);
        if node.is_none() {
            warn!(node_id = %id, known = self.nodes.len(), "could not find node");
        }
        node
    }

    pub fn identify_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let known = self.nodes.len();
        let node = self.nodes.get_mut(id);
        if node.is_none() {
            warn!(node_id = %id, known, "could not find node");
        }
        node
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts a node restored from a snapshot, disconnected.
    pub fn restore(&mut self, mut node: Node) {
        if self.nodes.contains_key(&node.id) {
            return;
        }
        node.status = NodeState::NotConnected;
        node.touch();
        self.order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    /// Nodes able to start a video task: free and running nothing.
    pub fn free_video_nodes(&self, assignments: &Assignments) -> Vec<NodeId> {
        self.iter()
            .filter(|n| n.status == NodeState::Free)
            .filter(|n| n.threads > 0 && assignments.count(&n.id) == 0)
            .map(|n| n.id.clone())
            .collect()
    }

    /// Nodes able to start an audio task: accepting work, no video task
    /// running and at least one thread left.
    pub fn free_audio_nodes(&self, assignments: &Assignments) -> Vec<NodeId> {
        self.iter()
            .filter(|n| matches!(n.status, NodeState::Free | NodeState::Working))
            .filter(|n| !assignments.runs_video(&n.id))
            .filter(|n| assignments.count(&n.id) < n.threads as usize)
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn online_nodes(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|n| n.status.is_online())
            .map(|n| n.id.clone())
            .collect()
    }

    /// Connected nodes silent for longer than `timeout`.
    pub fn silent_nodes(&self, timeout: Duration) -> Vec<NodeId> {
        self.iter()
            .filter(|n| n.status != NodeState::NotConnected)
            .filter(|n| n.last_seen.elapsed() > timeout)
            .map(|n| n.id.clone())
            .collect()
    }
}
