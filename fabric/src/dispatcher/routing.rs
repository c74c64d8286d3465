//! Hop-by-hop routing of MADs through the fabric.
//!
//! Routing never holds more than one node lock: each hop asks the current node for the
//! neighbor on the chosen port (which takes and releases that node's lock) before moving
//! on.

use crate::{
    mad::{Mad, MAX_HOPS, PERMISSIVE_LID},
    node::{Node, NodeId, NodeKind, PortRef, Step},
    port::PortState,
    Fabric,
};
use thiserror::Error;
use tracing::trace;

/// Why a MAD could not reach its destination.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("{node}/{port} has no link")]
    NoLink { node: String, port: u8 },
    #[error("{node}/{port} link is {state}")]
    LinkNotActive {
        node: String,
        port: u8,
        state: PortState,
    },
    #[error("{node} has no forwarding entry for lid {lid}")]
    NoEntry { node: String, lid: u16 },
    #[error("lid {lid} does not belong to {node}/{port}")]
    WrongTarget { node: String, port: u8, lid: u16 },
    #[error("lid {lid} unresolved after {hops} hops")]
    Loop { lid: u16, hops: usize },
    #[error("direct route combined with non-permissive lids")]
    MixedRouting,
    #[error("direct route of {0} hops is too long")]
    PathTooLong(u8),
    #[error("{node}/{port} lost the mad")]
    Dropped { node: String, port: u8 },
}

impl RouteError {
    /// Returns true if the MAD was lost by the simulated error model (rather than
    /// misrouted).
    pub fn is_loss(&self) -> bool {
        matches!(self, RouteError::Dropped { .. })
    }

    /// Short label used for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            RouteError::UnknownNode(_) => "unknown node",
            RouteError::NoLink { .. } => "no link",
            RouteError::LinkNotActive { .. } => "link not active",
            RouteError::NoEntry { .. } => "no forwarding entry",
            RouteError::WrongTarget { .. } => "wrong target",
            RouteError::Loop { .. } => "loop",
            RouteError::MixedRouting => "mixed routing",
            RouteError::PathTooLong(_) => "path too long",
            RouteError::Dropped { .. } => "simulated loss",
        }
    }
}

/// How a routing walk treats the links it crosses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Traversal {
    /// Draw from the loss model and update counters.
    Deliver,
    /// Check link state only (no counters, no loss).
    DryRun,
}

/// The walk a MAD took.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Every node visited, starting with the origin.
    pub path: Vec<NodeId>,
    /// Node and port the MAD is delivered on.
    pub destination: PortRef,
}

impl Route {
    /// Switches traversed between the origin and the destination.
    pub fn hops(&self) -> usize {
        self.path.len().saturating_sub(2)
    }
}

fn node(fabric: &Fabric, id: NodeId) -> Result<&Node, RouteError> {
    fabric.get(id).ok_or(RouteError::UnknownNode(id))
}

/// Route `mad` by its destination LID, starting at `port` of `origin`.
pub fn route_by_lid(
    fabric: &Fabric,
    origin: NodeId,
    port: u8,
    mad: &Mad,
    traversal: Traversal,
) -> Result<Route, RouteError> {
    let lid = mad.address.dlid;
    let vl15 = mad.is_vl15();
    let mut current = node(fabric, origin)?;
    let mut in_port = port;
    let mut path = vec![origin];
    loop {
        match current.kind() {
            NodeKind::ChannelAdapter if path.len() == 1 => {
                if current.port_answers(port, lid) {
                    break;
                }
                let next = current.remote_by_out_port(fabric, port, vl15, traversal)?;
                in_port = next.port;
                current = node(fabric, next.node)?;
            }
            NodeKind::ChannelAdapter => {
                // A channel adapter never forwards
                if current.port_answers(in_port, lid) {
                    break;
                }
                return Err(RouteError::WrongTarget {
                    node: current.name().to_string(),
                    port: in_port,
                    lid,
                });
            }
            NodeKind::Switch => match current.remote_by_lid(fabric, lid, vl15, traversal)? {
                Step::Here => break,
                Step::Next(next) => {
                    in_port = next.port;
                    current = node(fabric, next.node)?;
                }
            },
        }
        path.push(current.id());
        trace!(lid, node = current.name(), port = in_port, "lid route hop");
        if path.len() > MAX_HOPS {
            return Err(RouteError::Loop {
                lid,
                hops: path.len(),
            });
        }
    }
    Ok(Route {
        path,
        destination: PortRef::new(current.id(), in_port),
    })
}

/// Route a direct-routed `mad` along its path, starting at `port` of `origin`.
///
/// The hop pointer and (on the outbound leg) the return path are updated in place so
/// that a response built from the delivered MAD can retrace the walk.
pub fn route_by_direct_route(
    fabric: &Fabric,
    origin: NodeId,
    port: u8,
    mad: &mut Mad,
    traversal: Traversal,
) -> Result<Route, RouteError> {
    if mad.smp.dr_slid != PERMISSIVE_LID || mad.smp.dr_dlid != PERMISSIVE_LID {
        return Err(RouteError::MixedRouting);
    }
    let returning = mad.is_returning();
    let smp = &mut mad.smp;
    if smp.hop_count as usize >= MAX_HOPS {
        return Err(RouteError::PathTooLong(smp.hop_count));
    }
    let mut current = node(fabric, origin)?;
    let mut in_port = port;
    let mut path = vec![origin];
    if returning {
        smp.hop_pointer = smp.hop_pointer.saturating_sub(1).min(smp.hop_count);
        while smp.hop_pointer > 0 {
            let out_port = smp.return_path[smp.hop_pointer as usize];
            let next = current.remote_by_out_port(fabric, out_port, true, traversal)?;
            smp.hop_pointer -= 1;
            in_port = next.port;
            current = node(fabric, next.node)?;
            path.push(next.node);
            trace!(
                node = current.name(),
                port = in_port,
                "direct route return hop"
            );
        }
    } else {
        smp.hop_pointer = smp.hop_pointer.saturating_add(1);
        while smp.hop_pointer <= smp.hop_count {
            let hop = smp.hop_pointer as usize;
            let next = current.remote_by_out_port(fabric, smp.initial_path[hop], true, traversal)?;
            smp.return_path[hop] = next.port;
            smp.hop_pointer += 1;
            in_port = next.port;
            current = node(fabric, next.node)?;
            path.push(next.node);
            trace!(node = current.name(), port = in_port, "direct route hop");
        }
    }
    Ok(Route {
        path,
        destination: PortRef::new(current.id(), in_port),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mad::{attribute, class, method, status, Payload},
        node::tests::Recorder,
        random::Random,
        topology::{tests::TWO_SWITCHES, Topology},
    };
    use ibsim_macros::test_traced;
    use std::sync::Arc;

    fn fabric() -> Fabric {
        TWO_SWITCHES
            .parse::<Topology>()
            .unwrap()
            .build(Arc::new(Random::new(0)))
            .unwrap()
    }

    fn id(fabric: &Fabric, name: &str) -> NodeId {
        fabric.node(name).unwrap().id()
    }

    fn lid_mad(dlid: u16) -> Mad {
        Mad::new(class::PERF, method::GET, attribute::PORT_COUNTERS, 0).with_dlid(dlid)
    }

    #[test_traced]
    fn test_route_two_switches() {
        let fabric = fabric();
        let a = id(&fabric, "a");
        let route = route_by_lid(&fabric, a, 1, &lid_mad(4), Traversal::Deliver).unwrap();
        assert_eq!(route.hops(), 2);
        assert_eq!(
            route.path,
            vec![a, id(&fabric, "s1"), id(&fabric, "s2"), id(&fabric, "d")]
        );
        assert_eq!(route.destination, PortRef::new(id(&fabric, "d"), 1));

        // Counters were credited on both ends of every link crossed
        let s1 = fabric.node("s1").unwrap();
        let s2 = fabric.node("s2").unwrap();
        let a_counters = fabric.node("a").unwrap().counters(1).unwrap();
        assert_eq!(a_counters.xmit_packets, 1);
        assert_eq!(s1.counters(1).unwrap().rcv_packets, 1);
        assert_eq!(s1.counters(3).unwrap().xmit_packets, 1);
        assert_eq!(s2.counters(3).unwrap().rcv_packets, 1);
        assert_eq!(fabric.node("d").unwrap().counters(1).unwrap().rcv_data, 256);

        // Take the inter-switch link down on the first switch
        let recorder = Recorder::default();
        s1.set_link_status(3, PortState::Down, &recorder).unwrap();
        let err = route_by_lid(&fabric, a, 1, &lid_mad(4), Traversal::Deliver).unwrap_err();
        assert!(matches!(err, RouteError::LinkNotActive { port: 3, .. }));
        assert!(!err.is_loss());

        // Traffic local to the first switch is unaffected
        let route = route_by_lid(&fabric, a, 1, &lid_mad(2), Traversal::Deliver).unwrap();
        assert_eq!(route.hops(), 1);
        assert_eq!(route.destination, PortRef::new(id(&fabric, "b"), 1));
    }

    #[test]
    fn test_route_deterministic() {
        let fabric = fabric();
        let c = id(&fabric, "c");
        let first = route_by_lid(&fabric, c, 1, &lid_mad(2), Traversal::Deliver).unwrap();
        for _ in 0..20 {
            let route = route_by_lid(&fabric, c, 1, &lid_mad(2), Traversal::Deliver).unwrap();
            assert_eq!(route, first);
        }
    }

    #[test]
    fn test_route_top_boundary() {
        let fabric = fabric();
        let a = id(&fabric, "a");
        let s1 = fabric.node("s1").unwrap();
        let top = s1.lft_top();
        assert_eq!(top, 7);

        // Last valid entry resolves to the second switch itself
        let route = route_by_lid(&fabric, a, 1, &lid_mad(top - 1), Traversal::Deliver).unwrap();
        assert_eq!(route.destination, PortRef::new(id(&fabric, "s2"), 3));

        let err = route_by_lid(&fabric, a, 1, &lid_mad(top), Traversal::Deliver).unwrap_err();
        assert!(matches!(err, RouteError::NoEntry { lid: 7, .. }));
    }

    #[test]
    fn test_route_block_above_top() {
        let fabric = fabric();
        let a = id(&fabric, "a");
        let s1 = fabric.node("s1").unwrap();

        // Writing a block with an entry past the top leaves that lid unroutable
        let mut block = s1.lft_block(0).unwrap();
        block[20] = 3;
        s1.set_lft_block(0, &block).unwrap();
        assert_eq!(s1.lft_top(), 7);
        let err = route_by_lid(&fabric, a, 1, &lid_mad(20), Traversal::Deliver).unwrap_err();
        assert!(matches!(err, RouteError::NoEntry { lid: 20, .. }));
    }

    #[test]
    fn test_route_self_delivery() {
        let fabric = fabric();
        let a = id(&fabric, "a");
        let route = route_by_lid(&fabric, a, 1, &lid_mad(1), Traversal::Deliver).unwrap();
        assert_eq!(route.path, vec![a]);
        assert_eq!(route.destination, PortRef::new(a, 1));
        assert_eq!(route.hops(), 0);

        // A switch addressed by its own lid resolves locally
        let s2 = id(&fabric, "s2");
        let route = route_by_lid(&fabric, s2, 0, &lid_mad(6), Traversal::Deliver).unwrap();
        assert_eq!(route.destination, PortRef::new(s2, 0));
    }

    #[test]
    fn test_route_wrong_target() {
        let fabric = fabric();

        // Misprogram the second switch so lid 4 lands on c
        fabric.node("s2").unwrap().set_route(4, 1).unwrap();
        let a = id(&fabric, "a");
        let err = route_by_lid(&fabric, a, 1, &lid_mad(4), Traversal::Deliver).unwrap_err();
        assert!(matches!(err, RouteError::WrongTarget { lid: 4, .. }));
    }

    #[test]
    fn test_route_loop() {
        let fabric = fabric();

        // Bounce lid 9 between the switches forever
        fabric.node("s1").unwrap().set_route(9, 3).unwrap();
        fabric.node("s2").unwrap().set_route(9, 3).unwrap();
        let a = id(&fabric, "a");
        let err = route_by_lid(&fabric, a, 1, &lid_mad(9), Traversal::DryRun).unwrap_err();
        assert!(matches!(err, RouteError::Loop { lid: 9, .. }));
    }

    #[test]
    fn test_route_vl15_on_init_link() {
        let fabric = fabric();
        let recorder = Recorder::default();
        let s1 = fabric.node("s1").unwrap();
        s1.set_link_status(3, PortState::Armed, &recorder).unwrap();

        // Data traffic needs an active link, management traffic does not
        let a = id(&fabric, "a");
        let data = route_by_lid(&fabric, a, 1, &lid_mad(4), Traversal::DryRun);
        assert!(data.is_err());
        let smp = Mad::new(class::SUBN_LID, method::GET, attribute::NODE_INFO, 0).with_dlid(4);
        assert!(route_by_lid(&fabric, a, 1, &smp, Traversal::DryRun).is_ok());
    }

    #[test]
    fn test_route_loss() {
        let fabric = fabric();
        let s1 = fabric.node("s1").unwrap();
        s1.set_error_rate(3, 1.0, 0.0, None).unwrap();
        let a = id(&fabric, "a");
        let err = route_by_lid(&fabric, a, 1, &lid_mad(4), Traversal::Deliver).unwrap_err();
        assert!(err.is_loss());
        assert_eq!(s1.counters(3).unwrap().xmit_discards, 1);
        let s2 = fabric.node("s2").unwrap();
        assert_eq!(s2.counters(3).unwrap().rcv_errors, 1);
        assert_eq!(s2.counters(3).unwrap().rcv_remote_physical_errors, 1);

        // A dry run ignores the loss model and leaves counters alone
        let route = route_by_lid(&fabric, a, 1, &lid_mad(4), Traversal::DryRun).unwrap();
        assert_eq!(route.hops(), 2);
        assert_eq!(s1.counters(3).unwrap().xmit_discards, 1);
    }

    #[test]
    fn test_direct_route_round_trip() {
        let fabric = fabric();
        fabric.populate();
        let a = id(&fabric, "a");
        let s2 = id(&fabric, "s2");

        // a -> s1 (out 1) -> s2 (out 3)
        let mut request = Mad::direct_routed(method::GET, attribute::NODE_DESC, 0, &[1, 3]);
        let route = route_by_direct_route(&fabric, a, 1, &mut request, Traversal::Deliver).unwrap();
        assert_eq!(route.destination, PortRef::new(s2, 3));
        assert_eq!(route.path.len(), 3);
        assert_eq!(request.smp.hop_pointer, 3);
        assert_eq!(request.smp.return_path[1], 1);
        assert_eq!(request.smp.return_path[2], 3);

        // The response retraces the path back to the origin port
        let outgoing = fabric
            .get(s2)
            .unwrap()
            .process_mad(route.destination.port, &request)
            .unwrap();
        let mut response = outgoing.into_iter().next().unwrap().mad;
        assert_eq!(response.header.status, status::DIRECTION);
        assert_eq!(response.payload, Payload::NodeDescription("s2".into()));
        let back =
            route_by_direct_route(&fabric, s2, 3, &mut response, Traversal::Deliver).unwrap();
        assert_eq!(back.destination, PortRef::new(a, 1));
        assert_eq!(response.smp.hop_pointer, 0);
    }

    #[test]
    fn test_direct_route_local() {
        let fabric = fabric();
        let s1 = id(&fabric, "s1");
        let mut request = Mad::direct_routed(method::GET, attribute::NODE_INFO, 0, &[]);
        let route =
            route_by_direct_route(&fabric, s1, 0, &mut request, Traversal::Deliver).unwrap();
        assert_eq!(route.destination, PortRef::new(s1, 0));
        assert_eq!(route.path, vec![s1]);
    }

    #[test]
    fn test_direct_route_failures() {
        let fabric = fabric();
        let a = id(&fabric, "a");

        // s1 port 4 is not wired
        let mut request = Mad::direct_routed(method::GET, attribute::NODE_INFO, 0, &[1, 4]);
        let err =
            route_by_direct_route(&fabric, a, 1, &mut request, Traversal::Deliver).unwrap_err();
        assert!(matches!(err, RouteError::NoLink { port: 4, .. }));

        let mut request = Mad::direct_routed(method::GET, attribute::NODE_INFO, 0, &[1]);
        request.smp.dr_slid = 1;
        let err =
            route_by_direct_route(&fabric, a, 1, &mut request, Traversal::Deliver).unwrap_err();
        assert_eq!(err, RouteError::MixedRouting);

        let mut request = Mad::direct_routed(method::GET, attribute::NODE_INFO, 0, &[1]);
        request.smp.hop_count = 64;
        let err =
            route_by_direct_route(&fabric, a, 1, &mut request, Traversal::Deliver).unwrap_err();
        assert_eq!(err, RouteError::PathTooLong(64));
    }
}
