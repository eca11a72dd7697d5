use itertools::Itertools;
use parse_display::Display;
use rand::Rng;
use rand_seeder::{Seeder, SipRng};

use crate::config::{NetworkConfig, NodeFeatures, TopologyConfig};
use crate::types::Duration;
use crate::utils::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("N{0}")]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("DC{0}")]
pub struct DatacenterId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "lowercase")]
pub enum NodeKind {
    Cloud,
    Fog,
    /// the mobile gateway, never a placement target
    Gateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "lowercase")]
pub enum NodeState {
    Idle,
    Busy,
}

/// Power drawn grows linearly with utilization between idle and busy power
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearPowerModel {
    pub busy: f64,
    pub idle: f64,
}

impl LinearPowerModel {
    /// power at utilization `u`, clamped to `[0, 1]`
    pub fn power(&self, utilization: f64) -> f64 {
        let u = utilization.max(0.0).min(1.0);
        self.idle + (self.busy - self.idle) * u
    }

    pub fn static_power(&self) -> f64 {
        self.idle
    }
}

/// A fog, cloud or gateway device. Only the gateway's admission logic flips `state`.
#[derive(Debug, Clone)]
pub struct ComputeNode {
    pub id: NodeId,
    pub host: usize,
    pub datacenter: DatacenterId,
    pub kind: NodeKind,
    /// processing speed in MIPS
    pub mips: f64,
    /// speed of the hosting machine, `mips / host_mips` is the utilization while busy
    pub host_mips: f64,
    pub ram: f64,
    pub storage: f64,
    pub power: LinearPowerModel,
    state: NodeState,
}

impl ComputeNode {
    fn new(id: usize, datacenter: DatacenterId, kind: NodeKind, f: &NodeFeatures) -> Self {
        Self {
            id: NodeId(id),
            host: id,
            datacenter,
            kind,
            mips: f.mips,
            host_mips: f.host_mips.unwrap_or(f.mips),
            ram: f.ram,
            storage: f.storage,
            power: LinearPowerModel {
                busy: f.busy_power,
                idle: f.idle_power,
            },
            state: NodeState::Idle,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == NodeState::Idle
    }

    pub fn accepts_work(&self) -> bool {
        self.kind != NodeKind::Gateway
    }

    pub fn utilization(&self) -> f64 {
        if self.host_mips > 0.0 {
            self.mips / self.host_mips
        } else {
            1.0
        }
    }

    /// pure execution time of `length` MI on this node
    pub fn running_time(&self, length: f64) -> Duration {
        Duration(length / self.mips)
    }

    pub(crate) fn mark_busy(&mut self) {
        self.state = NodeState::Busy;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = NodeState::Idle;
    }
}

/// Per device-class latency/upload pair between the gateway and a node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkModel {
    pub fog_latency: f64,
    /// MB/s
    pub fog_upload: f64,
    pub cloud_latency: f64,
    /// MB/s
    pub cloud_upload: f64,
    pub cloud_datacenter: Option<DatacenterId>,
}

impl NetworkModel {
    pub fn new(cfg: &NetworkConfig, cloud_datacenter: Option<DatacenterId>) -> Self {
        // bandwidths are configured in Mb/s
        Self {
            fog_latency: cfg.fog_latency,
            fog_upload: cfg.fog_upload_bandwidth / 8.0,
            cloud_latency: cfg.cloud_latency,
            cloud_upload: cfg.cloud_upload_bandwidth / 8.0,
            cloud_datacenter,
        }
    }

    /// latency plus the upload time of `data_size` MB to the node's datacenter
    pub fn transfer_delay(&self, datacenter: DatacenterId, data_size: f64) -> Duration {
        if Some(datacenter) == self.cloud_datacenter {
            Duration(self.cloud_latency + data_size / self.cloud_upload)
        } else {
            Duration(self.fog_latency + data_size / self.fog_upload)
        }
    }
}

/// The static device list of an episode
#[derive(Debug, Clone)]
pub struct Topology {
    pub nodes: Vec<ComputeNode>,
    pub cloud_datacenter: Option<DatacenterId>,
}

impl Topology {
    /// Build the topology: `cloud_nodes` cloud hosts in one datacenter, `fog_nodes` hosts drawn
    /// from the fog catalogue in a second one, and the gateway in its own datacenter.
    ///
    /// Invalid node specs are skipped. The run proceeds as long as at least one
    /// placement target remains.
    pub fn from_config(cfg: &TopologyConfig) -> Result<Self> {
        if cfg.fog_catalogue.is_empty() && cfg.fog_nodes > 0 {
            return Err(Error::InvalidTopology("fog nodes requested with an empty catalogue".into()));
        }

        let mut rng: SipRng = Seeder::from(cfg.seed.as_str()).make_rng();
        let fog_features = (0..cfg.fog_nodes)
            .map(|_| cfg.fog_catalogue[rng.gen_range(0..cfg.fog_catalogue.len())].clone())
            .collect_vec();

        let mut nodes = vec![];
        let mut next_dc = 0;
        let cloud_datacenter = if cfg.cloud_nodes > 0 {
            let dc = DatacenterId(next_dc);
            next_dc += 1;
            for _ in 0..cfg.cloud_nodes {
                nodes.push(ComputeNode::new(nodes.len(), dc, NodeKind::Cloud, &cfg.cloud));
            }
            Some(dc)
        } else {
            None
        };

        let fog_dc = DatacenterId(next_dc);
        next_dc += 1;
        for f in &fog_features {
            nodes.push(ComputeNode::new(nodes.len(), fog_dc, NodeKind::Fog, f));
        }

        nodes.push(ComputeNode::new(
            nodes.len(),
            DatacenterId(next_dc),
            NodeKind::Gateway,
            &cfg.gateway,
        ));

        let nodes = nodes
            .into_iter()
            .filter(|n| {
                let ok = n.mips > 0.0 && n.host_mips >= n.mips;
                if !ok {
                    warn!(node = %n.id, kind = %n.kind, mips = n.mips, "skipping node that can not run tasks");
                }
                ok
            })
            // keep ids dense, they are the node indices
            .enumerate()
            .map(|(idx, mut n)| {
                n.id = NodeId(idx);
                n.host = idx;
                n
            })
            .collect_vec();

        let this = Self { nodes, cloud_datacenter };
        if this.candidates().next().is_none() {
            return Err(Error::InvalidTopology("no fog or cloud node can accept work".into()));
        }
        if this.gateway().is_none() {
            return Err(Error::InvalidTopology("the gateway node is missing".into()));
        }
        info!(
            nodes.len = this.nodes.len(),
            cloud = ?this.cloud_datacenter,
            "topology built"
        );
        Ok(this)
    }

    /// placement targets in a stable order, the order of the observation vector
    pub fn candidates(&self) -> impl Iterator<Item = &ComputeNode> {
        self.nodes.iter().filter(|n| n.accepts_work())
    }

    pub fn candidate_ids(&self) -> Vec<NodeId> {
        self.candidates().map(|n| n.id).collect()
    }

    pub fn gateway(&self) -> Option<&ComputeNode> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Gateway)
    }

    pub fn any_candidate_idle(&self) -> bool {
        self.candidates().any(ComputeNode::is_idle)
    }

    pub fn node(&self, id: NodeId) -> &ComputeNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ComputeNode {
        &mut self.nodes[id.0]
    }

    /// `[mips, ram, storage, busy power, idle power]` of every node of `kind`
    pub fn features_of(&self, kind: NodeKind) -> Vec<[f64; 5]> {
        self.nodes
            .iter()
            .filter(|n| n.kind == kind)
            .map(|n| [n.mips, n.ram, n.storage, n.power.busy, n.power.idle])
            .collect()
    }

    pub fn reset(&mut self) {
        self.nodes.iter_mut().for_each(ComputeNode::mark_idle);
    }
}
