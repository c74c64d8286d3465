//! YAML description of a subnet.
//!
//! ```yaml
//! sm_lid: 1
//! nodes:
//!   - {name: sw, kind: switch, ports: 8, lid: 3, routes: {1: 1, 2: 2, 3: 0}}
//!   - {name: h1, kind: ca, ports: 1, lid: 1}
//!   - {name: h2, kind: ca, ports: 2, lid: 4, lmc: 1, description: "h2 HCA-1"}
//! links:
//!   - [h1/1, sw/1]
//!   - [h2/1, sw/2]
//! ```
//!
//! Every link in the file comes up Active. Channel adapter port `p` is given
//! `lid + ((p - 1) << lmc)`. A node may carry a loss model applied to each of its
//! ports, e.g. `error: {rate: 0.1, variance: 2}` or `error: {rate: 0.5, hold: 4}`.

use crate::{node::NodeKind, random::Random, Error, Fabric};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap, fs::File, num::NonZeroU32, path::Path, str::FromStr, sync::Arc,
};
use tracing::{debug, info};

/// A complete subnet: its nodes and the cables between them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// LID of the subnet manager, recorded on every port that doesn't override it.
    #[serde(default)]
    pub sm_lid: Option<u16>,
    pub nodes: Vec<NodeSpec>,
    /// Pairs of `node/port` references.
    #[serde(default)]
    pub links: Vec<[String; 2]>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub ports: u8,
    /// Base LID (port 0 of a switch, port 1 of a channel adapter).
    #[serde(default)]
    pub lid: u16,
    #[serde(default)]
    pub lmc: u8,
    #[serde(default)]
    pub sm_lid: Option<u16>,
    #[serde(default)]
    pub description: Option<String>,
    /// Initial linear forwarding table (switches only).
    #[serde(default)]
    pub routes: BTreeMap<u16, u8>,
    /// Override the forwarding table top (defaults to one past the highest route).
    #[serde(default)]
    pub top: Option<u16>,
    /// Initial vendor register contents.
    #[serde(default)]
    pub cr_space: BTreeMap<u32, u32>,
    /// Loss model of every port.
    #[serde(default)]
    pub error: Option<ErrorSpec>,
}

/// Packet loss settings for a node's ports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorSpec {
    pub rate: f64,
    #[serde(default)]
    pub variance: f64,
    /// Fixed decision streak length (random, from `variance`, when absent).
    #[serde(default)]
    pub hold: Option<NonZeroU32>,
}

impl Topology {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let topology = serde_yaml::from_reader(file)?;
        Ok(topology)
    }

    /// Instantiate the described fabric. Management agents are not registered; call
    /// [Fabric::populate] before dispatching.
    pub fn build(&self, random: Arc<Random>) -> Result<Fabric, Error> {
        let mut fabric = Fabric::new(random);
        for spec in &self.nodes {
            if spec.ports == 0 {
                return Err(Error::Topology(format!("{} has no ports", spec.name)));
            }
            if spec.lmc > 7 {
                return Err(Error::Topology(format!(
                    "{} has lmc {}",
                    spec.name, spec.lmc
                )));
            }
            fabric.add_node(&spec.name, spec.kind, spec.ports)?;
        }
        for spec in &self.nodes {
            self.configure(&fabric, spec)?;
        }
        for [left, right] in &self.links {
            let (a, b) = (fabric.port_ref(left)?, fabric.port_ref(right)?);
            fabric.wire(a, b)?;
            debug!(left, right, "wired");
        }
        fabric.assign_guids();
        info!(
            nodes = fabric.len(),
            links = self.links.len(),
            "built fabric"
        );
        Ok(fabric)
    }

    fn configure(&self, fabric: &Fabric, spec: &NodeSpec) -> Result<(), Error> {
        let node = fabric.node(&spec.name)?;
        match spec.kind {
            NodeKind::Switch => node.set_lid(0, spec.lid, Some(spec.lmc))?,
            NodeKind::ChannelAdapter => {
                for port in node.ports() {
                    let lid = match spec.lid {
                        0 => 0,
                        base => u16::from(port - 1)
                            .checked_shl(u32::from(spec.lmc))
                            .and_then(|offset| base.checked_add(offset))
                            .ok_or_else(|| {
                                Error::Topology(format!("{} runs out of lids", spec.name))
                            })?,
                    };
                    node.set_lid(port, lid, Some(spec.lmc))?;
                }
            }
        }
        if let Some(sm_lid) = spec.sm_lid.or(self.sm_lid) {
            node.set_sm_lid(sm_lid);
        }
        if let Some(description) = &spec.description {
            node.set_description(description);
        }
        for (lid, port) in &spec.routes {
            if *port > node.num_ports() {
                return Err(Error::InvalidPort(spec.name.clone(), *port));
            }
            node.set_route(*lid, *port)?;
        }
        if let Some(top) = spec.top {
            node.set_lft_top(top)?;
        }
        for (address, value) in &spec.cr_space {
            node.cr_map(*address, *value);
        }
        if let Some(error) = &spec.error {
            for port in node.ports() {
                node.set_error_rate(port, error.rate, error.variance, error.hold)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Topology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_yaml::from_str(s)?)
    }
}
