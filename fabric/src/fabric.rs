//! The fabric: a flat arena of nodes addressed by [NodeId].
//!
//! Links are stored on the ports themselves as [PortRef]s, so the adjacency graph can
//! contain cycles without any ownership cycles. Administrative edits (link, unlink,
//! relink) lock one node at a time.

use crate::{
    dispatcher::Submitter,
    node::{Node, NodeId, NodeKind, PortRef},
    port::PortState,
    processor::Processor,
    random::Random,
    Error,
};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
    path::Path,
    sync::Arc,
};
use tracing::info;

/// GUIDs are handed out sequentially after this value.
pub const GUID_BASE: u64 = 0x0002_c900_0000_0000;

/// A simulated subnet.
#[derive(Debug)]
pub struct Fabric {
    nodes: Vec<Node>,
    names: BTreeMap<String, NodeId>,
    random: Arc<Random>,
}

impl Fabric {
    pub fn new(random: Arc<Random>) -> Self {
        Self {
            nodes: Vec::new(),
            names: BTreeMap::new(),
            random,
        }
    }

    /// Add a node with `ports` external ports. Every port starts unlinked and Down.
    pub fn add_node(&mut self, name: &str, kind: NodeKind, ports: u8) -> Result<NodeId, Error> {
        if name.is_empty() || name.contains('/') || name.contains(char::is_whitespace) {
            return Err(Error::Topology(format!("invalid node name: {name:?}")));
        }
        if self.names.contains_key(name) {
            return Err(Error::DuplicateNode(name.to_string()));
        }
        let id = NodeId::new(self.nodes.len());
        self.nodes
            .push(Node::new(id, name, kind, ports, self.random.clone()));
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Register the management agents (subnet, performance and vendor-specific) on
    /// every node.
    pub fn populate(&self) {
        for node in &self.nodes {
            node.register(Processor::Sma);
            node.register(Processor::Pma);
            node.register(Processor::VendorSpecific);
        }
    }

    pub fn random(&self) -> &Arc<Random> {
        &self.random
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Look a node up by name.
    pub fn node(&self, name: &str) -> Result<&Node, Error> {
        self.names
            .get(name)
            .and_then(|id| self.get(*id))
            .ok_or_else(|| Error::UnknownNode(name.to_string()))
    }

    /// Nodes in the order they were added.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Parse a `node/port` reference.
    pub fn port_ref(&self, text: &str) -> Result<PortRef, Error> {
        let (name, port) = text
            .rsplit_once('/')
            .ok_or_else(|| Error::InvalidPortRef(text.to_string()))?;
        let port: u8 = port
            .parse()
            .map_err(|_| Error::InvalidPortRef(text.to_string()))?;
        let node = self.node(name)?;
        node.check_port(port)?;
        Ok(PortRef::new(node.id(), port))
    }

    /// Render a port as `node/port`.
    pub fn port_name(&self, port: PortRef) -> String {
        match self.get(port.node) {
            Some(node) => format!("{}/{}", node.name(), port.port),
            None => port.to_string(),
        }
    }

    fn endpoint(&self, port: PortRef) -> Result<&Node, Error> {
        let node = self
            .get(port.node)
            .ok_or_else(|| Error::UnknownNode(port.node.to_string()))?;
        if port.port == 0 {
            return Err(Error::InvalidPort(node.name().to_string(), 0));
        }
        node.check_port(port.port)?;
        Ok(node)
    }

    fn connect(
        &self,
        a: PortRef,
        b: PortRef,
        state: PortState,
        submitter: Option<&dyn Submitter>,
    ) -> Result<(), Error> {
        if a == b {
            return Err(Error::LinkingSelf(self.port_name(a)));
        }
        let left = self.endpoint(a)?;
        let right = self.endpoint(b)?;
        let announce = submitter.is_some();
        let before = left.port_info(a.port)?;
        let left_trap = left.connect(a.port, b, state, announce)?;
        let right_trap = match right.connect(b.port, a, state, announce) {
            Ok(trap) => trap,
            Err(err) => {
                left.release(a.port, before.state, before.phys_state)?;
                return Err(err);
            }
        };
        let traps = [(left, left_trap), (right, right_trap)];
        if let Some(submitter) = submitter {
            for (node, trap) in traps {
                if let Some(trap) = trap {
                    submitter.dispatch(node.id(), 0, trap);
                }
            }
        }
        Ok(())
    }

    /// Connect two unlinked ports with an Active link (used while building a fabric).
    pub fn wire(&self, a: PortRef, b: PortRef) -> Result<(), Error> {
        self.connect(a, b, PortState::Active, None)
    }

    /// Connect two unlinked ports. Both come up in Init, as after physical link training.
    pub fn link(&self, a: PortRef, b: PortRef, submitter: &dyn Submitter) -> Result<(), Error> {
        self.connect(a, b, PortState::Init, Some(submitter))?;
        info!(left = %self.port_name(a), right = %self.port_name(b), "linked");
        Ok(())
    }

    fn selected_ports(node: &Node, port: Option<u8>) -> Result<Vec<u8>, Error> {
        match port {
            Some(port) => {
                node.check_port(port)?;
                Ok(vec![port])
            }
            None => Ok(node.ports().collect()),
        }
    }

    /// Disconnect `port` of `node` (or every linked port when `port` is `None`).
    ///
    /// Both ends go Down and remember their peer so [Fabric::relink] can restore the
    /// link. Returns the disconnected pairs.
    pub fn unlink(
        &self,
        node: NodeId,
        port: Option<u8>,
        submitter: &dyn Submitter,
    ) -> Result<Vec<(PortRef, PortRef)>, Error> {
        let local = self
            .get(node)
            .ok_or_else(|| Error::UnknownNode(node.to_string()))?;
        let mut unlinked = Vec::new();
        for number in Self::selected_ports(local, port)? {
            if local.remote(number)?.is_none() {
                if port.is_some() {
                    return Err(Error::NotLinked(self.port_name(PortRef::new(node, number))));
                }
                continue;
            }
            let (remote, trap) = local.disconnect(number)?;
            if let Some(trap) = trap {
                submitter.dispatch(node, 0, trap);
            }
            let Some(remote) = remote else {
                continue;
            };
            if let Some(far) = self.get(remote.node) {
                let (_, trap) = far.disconnect(remote.port)?;
                if let Some(trap) = trap {
                    submitter.dispatch(remote.node, 0, trap);
                }
            }
            let local_port = PortRef::new(node, number);
            info!(left = %self.port_name(local_port), right = %self.port_name(remote), "unlinked");
            unlinked.push((local_port, remote));
        }
        Ok(unlinked)
    }

    /// Restore links removed by [Fabric::unlink]. Ports whose previous peer has since
    /// been linked elsewhere are skipped (or rejected when named explicitly).
    pub fn relink(
        &self,
        node: NodeId,
        port: Option<u8>,
        submitter: &dyn Submitter,
    ) -> Result<Vec<(PortRef, PortRef)>, Error> {
        let local = self
            .get(node)
            .ok_or_else(|| Error::UnknownNode(node.to_string()))?;
        let mut relinked = Vec::new();
        for number in Self::selected_ports(local, port)? {
            let local_port = PortRef::new(node, number);
            if local.remote(number)?.is_some() {
                if port.is_some() {
                    return Err(Error::PortInUse(self.port_name(local_port)));
                }
                continue;
            }
            let Some(previous) = local.previous(number)? else {
                if port.is_some() {
                    return Err(Error::NoPreviousPeer(self.port_name(local_port)));
                }
                continue;
            };
            match self.connect(local_port, previous, PortState::Init, Some(submitter)) {
                Ok(()) => {
                    info!(
                        left = %self.port_name(local_port),
                        right = %self.port_name(previous),
                        "relinked"
                    );
                    relinked.push((local_port, previous));
                }
                Err(err) if port.is_some() => return Err(err),
                Err(_) => continue,
            }
        }
        Ok(relinked)
    }

    /// Assign node and port GUIDs. Nodes are numbered in name order starting after
    /// [GUID_BASE]; switch ports share the node GUID while channel adapter ports get
    /// their own.
    pub fn assign_guids(&self) {
        let mut next = GUID_BASE;
        for id in self.names.values() {
            if let Some(node) = self.get(*id) {
                node.assign_guids(&mut next);
            }
        }
    }

    /// `NODE` and `PORT` lines describing every assigned GUID, in name order.
    pub fn guid_dump(&self) -> String {
        let mut out = String::new();
        for node in self.names.values().filter_map(|id| self.get(*id)) {
            let _ = writeln!(out, "NODE {} 0x{:016x}", node.name(), node.node_guid());
            for port in node.ports() {
                let guid = node.port_guid(port).unwrap_or_default();
                let _ = writeln!(out, "PORT {}/{} 0x{:016x}", node.name(), port, guid);
            }
        }
        out
    }

    pub fn write_guid_dump(&self, path: &Path) -> Result<(), Error> {
        fs::write(path, self.guid_dump())?;
        info!(path = %path.display(), "wrote guid dump");
        Ok(())
    }

    /// The port that answers `lid`, if any (switches answer on port 0).
    pub fn find_lid(&self, lid: u16) -> Option<PortRef> {
        self.nodes.iter().find_map(|node| {
            let ports: Vec<u8> = match node.kind() {
                NodeKind::Switch => vec![0],
                NodeKind::ChannelAdapter => node.ports().collect(),
            };
            ports
                .into_iter()
                .find(|port| node.port_answers(*port, lid))
                .map(|port| PortRef::new(node.id(), port))
        })
    }

    /// Human readable description of a node, its ports and forwarding table.
    pub fn dump(&self, name: &str) -> Result<String, Error> {
        let node = self.node(name)?;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {} guid=0x{:016x} ports={} desc={:?}",
            node.name(),
            node.kind(),
            node.node_guid(),
            node.num_ports(),
            node.description()
        );
        let first = if node.is_switch() { 0 } else { 1 };
        for port in first..=node.num_ports() {
            let info = node.port_info(port)?;
            let remote = node
                .remote(port)?
                .map(|remote| self.port_name(remote))
                .unwrap_or_else(|| "-".to_string());
            let errors = node.error_profile(port)?;
            let counters = node.counters(port)?;
            let _ = write!(
                out,
                "  port {port} lid={} lmc={} state={} phys={} remote={remote}",
                info.base_lid,
                info.lmc,
                info.state,
                info.phys_state,
            );
            let _ = writeln!(
                out,
                " error_rate={} xmit={} rcv={} discards={}",
                errors.rate(),
                counters.xmit_packets,
                counters.rcv_packets,
                counters.xmit_discards,
            );
        }
        if node.is_switch() {
            let _ = writeln!(out, "  lft top={}", node.lft_top());
            for (lid, port) in node.routes() {
                let _ = writeln!(out, "    lid {lid} -> port {port}");
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mad::method, node::tests::Recorder, port::PhysState};
    use ibsim_macros::test_traced;

    fn small() -> Fabric {
        let mut fabric = Fabric::new(Arc::new(Random::new(0)));
        fabric.add_node("sw", NodeKind::Switch, 4).unwrap();
        fabric.add_node("h1", NodeKind::ChannelAdapter, 1).unwrap();
        fabric.add_node("h2", NodeKind::ChannelAdapter, 2).unwrap();
        let sw = fabric.node("sw").unwrap();
        sw.set_lid(0, 3, None).unwrap();
        sw.set_sm_lid(1);
        fabric
    }

    fn port(fabric: &Fabric, text: &str) -> PortRef {
        fabric.port_ref(text).unwrap()
    }

    #[test]
    fn test_add_node() {
        let mut fabric = small();
        assert!(matches!(
            fabric.add_node("sw", NodeKind::Switch, 2),
            Err(Error::DuplicateNode(_))
        ));
        assert!(matches!(
            fabric.add_node("a/b", NodeKind::Switch, 2),
            Err(Error::Topology(_))
        ));
        assert_eq!(fabric.len(), 3);
        assert!(matches!(fabric.node("nope"), Err(Error::UnknownNode(_))));
    }

    #[test]
    fn test_port_ref() {
        let fabric = small();
        let sw = fabric.node("sw").unwrap().id();
        assert_eq!(port(&fabric, "sw/2"), PortRef::new(sw, 2));
        assert_eq!(fabric.port_name(PortRef::new(sw, 2)), "sw/2");
        assert!(matches!(fabric.port_ref("sw"), Err(Error::InvalidPortRef(_))));
        assert!(matches!(fabric.port_ref("sw/x"), Err(Error::InvalidPortRef(_))));
        assert!(matches!(fabric.port_ref("sw/5"), Err(Error::InvalidPort(_, 5))));
        assert!(matches!(fabric.port_ref("x/1"), Err(Error::UnknownNode(_))));
    }

    #[test]
    fn test_wire() {
        let fabric = small();
        let (a, b) = (port(&fabric, "sw/1"), port(&fabric, "h1/1"));
        fabric.wire(a, b).unwrap();
        let sw = fabric.node("sw").unwrap();
        assert_eq!(sw.remote(1).unwrap(), Some(b));
        assert_eq!(fabric.node("h1").unwrap().remote(1).unwrap(), Some(a));
        assert_eq!(sw.link_status(1).unwrap(), PortState::Active);

        // Building the fabric does not raise traps
        assert!(!sw.switch_info().unwrap().port_state_change);

        assert!(matches!(
            fabric.wire(port(&fabric, "sw/2"), b),
            Err(Error::PortInUse(_))
        ));
        assert!(matches!(fabric.wire(a, a), Err(Error::LinkingSelf(_))));
        assert!(matches!(
            fabric.wire(port(&fabric, "sw/0"), port(&fabric, "h2/1")),
            Err(Error::InvalidPort(_, 0))
        ));
    }

    #[test_traced]
    fn test_unlink_relink() {
        let fabric = small();
        let recorder = Recorder::default();
        let (a, b) = (port(&fabric, "sw/1"), port(&fabric, "h1/1"));
        fabric.wire(a, b).unwrap();
        fabric
            .wire(port(&fabric, "sw/2"), port(&fabric, "h2/1"))
            .unwrap();
        let sw = fabric.node("sw").unwrap();

        // Unlink every port of the switch
        let unlinked = fabric.unlink(sw.id(), None, &recorder).unwrap();
        assert_eq!(unlinked.len(), 2);
        assert_eq!(sw.remote(1).unwrap(), None);
        assert_eq!(sw.previous(1).unwrap(), Some(b));
        assert_eq!(sw.link_status(1).unwrap(), PortState::Down);
        let h1 = fabric.node("h1").unwrap();
        assert_eq!(h1.link_status(1).unwrap(), PortState::Down);
        assert_eq!(sw.counters(1).unwrap().link_downed, 1);

        // Only the switch raises traps, one per port
        let traps = recorder.take();
        assert_eq!(traps.len(), 2);
        assert!(traps.iter().all(|(origin, port, mad)| {
            *origin == sw.id() && *port == 0 && mad.header.method == method::TRAP
        }));

        assert!(matches!(
            fabric.unlink(sw.id(), Some(1), &recorder),
            Err(Error::NotLinked(_))
        ));

        // Restore a single port from the channel adapter side
        let h1 = fabric.node("h1").unwrap();
        let relinked = fabric.relink(h1.id(), Some(1), &recorder).unwrap();
        assert_eq!(relinked, vec![(b, a)]);
        assert_eq!(sw.remote(1).unwrap(), Some(b));
        assert_eq!(sw.link_status(1).unwrap(), PortState::Init);
        assert_eq!(recorder.take().len(), 1);

        // Restore the rest
        let relinked = fabric.relink(sw.id(), None, &recorder).unwrap();
        assert_eq!(relinked.len(), 1);
        assert!(matches!(
            fabric.relink(sw.id(), Some(3), &recorder),
            Err(Error::NoPreviousPeer(_))
        ));
    }

    #[test]
    fn test_link_busy_peer() {
        let fabric = small();
        let recorder = Recorder::default();
        fabric
            .wire(port(&fabric, "sw/1"), port(&fabric, "h1/1"))
            .unwrap();

        // The free side is left exactly as it was
        let h2 = fabric.node("h2").unwrap();
        assert!(matches!(
            fabric.link(port(&fabric, "h2/1"), port(&fabric, "h1/1"), &recorder),
            Err(Error::PortInUse(_))
        ));
        assert_eq!(h2.remote(1).unwrap(), None);
        assert_eq!(h2.previous(1).unwrap(), None);
        assert_eq!(h2.link_status(1).unwrap(), PortState::Down);
        assert_eq!(h2.port_info(1).unwrap().phys_state, PhysState::Polling);
        assert!(recorder.take().is_empty());

        // And can still be linked elsewhere
        fabric
            .link(port(&fabric, "h2/1"), port(&fabric, "sw/2"), &recorder)
            .unwrap();
        assert_eq!(h2.link_status(1).unwrap(), PortState::Init);
    }

    #[test]
    fn test_link_new_peer() {
        let fabric = small();
        let recorder = Recorder::default();
        fabric
            .link(port(&fabric, "h1/1"), port(&fabric, "h2/2"), &recorder)
            .unwrap();
        let h2 = fabric.node("h2").unwrap();
        assert_eq!(h2.link_status(2).unwrap(), PortState::Init);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_guid_assignment() {
        let fabric = small();
        fabric.assign_guids();

        // Name order: h1, h2, sw
        let h1 = fabric.node("h1").unwrap();
        let h2 = fabric.node("h2").unwrap();
        let sw = fabric.node("sw").unwrap();
        assert_eq!(h1.node_guid(), GUID_BASE + 1);
        assert_eq!(h1.port_guid(1).unwrap(), GUID_BASE + 2);
        assert_eq!(h2.node_guid(), GUID_BASE + 3);
        assert_eq!(h2.port_guid(2).unwrap(), GUID_BASE + 5);
        assert_eq!(sw.node_guid(), GUID_BASE + 6);
        assert_eq!(sw.port_guid(4).unwrap(), GUID_BASE + 6);

        let dump = fabric.guid_dump();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 3 + 1 + 2 + 4);
        assert_eq!(lines[0], "NODE h1 0x0002c90000000001");
        assert_eq!(lines[1], "PORT h1/1 0x0002c90000000002");
        assert_eq!(lines[5], "NODE sw 0x0002c90000000006");
    }

    #[test]
    fn test_find_lid() {
        let fabric = small();
        let h2 = fabric.node("h2").unwrap();
        h2.set_lid(2, 8, Some(1)).unwrap();
        let sw = fabric.node("sw").unwrap().id();
        assert_eq!(fabric.find_lid(3), Some(PortRef::new(sw, 0)));
        assert_eq!(fabric.find_lid(9), Some(PortRef::new(h2.id(), 2)));
        assert_eq!(fabric.find_lid(10), None);
    }

    #[test]
    fn test_dump() {
        let fabric = small();
        fabric
            .wire(port(&fabric, "sw/1"), port(&fabric, "h1/1"))
            .unwrap();
        fabric.node("sw").unwrap().set_route(7, 1).unwrap();
        let dump = fabric.dump("sw").unwrap();
        assert!(dump.starts_with("sw SW "));
        assert!(dump.contains("port 1 lid=0 lmc=0 state=ACTIVE phys=LINKUP remote=h1/1"));
        assert!(dump.contains("lft top=8"));
        assert!(dump.contains("lid 7 -> port 1"));
    }
}
