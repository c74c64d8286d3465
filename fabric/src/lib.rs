//! Simulate the management plane of an InfiniBand subnet.
//!
//! A [Fabric] is a set of switches and channel adapters joined by links. Management
//! datagrams ([mad::Mad]) injected at any port are routed hop by hop, either by
//! destination LID through switch forwarding tables or along an explicit direct route,
//! and are answered by the agents registered on the destination node. Delivery is
//! asynchronous: a [Dispatcher] holds every MAD for a randomized delay before a worker
//! routes it, and a per-port loss model can drop MADs in bursts.
//!
//! Subnet managers and other tools attach to a node as clients ([processor::Filter])
//! and see the MADs routed to it. A [console::Console] and the [simulator::Simulator]
//! that owns the fabric tie everything together for the `ibsim` binary.
//!
//! # Status
//!
//! `ibsim-fabric` is **ALPHA** software. Expect breaking changes.

pub mod console;
pub mod dispatcher;
pub mod fabric;
pub mod mad;
pub mod node;
pub mod port;
pub mod processor;
pub mod random;
pub mod simulator;
pub mod topology;

pub use dispatcher::{routing, Dispatcher, Submitter};
pub use fabric::Fabric;
pub use node::{Node, NodeId, NodeKind, PortRef};
pub use port::PortState;
pub use random::Random;
pub use topology::Topology;

use routing::RouteError;
use thiserror::Error;

/// Errors that can occur while building or operating a fabric.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("{0} has no port {1}")]
    InvalidPort(String, u8),
    #[error("duplicate node: {0}")]
    DuplicateNode(String),
    #[error("not valid to link {0} to itself")]
    LinkingSelf(String),
    #[error("port already linked: {0}")]
    PortInUse(String),
    #[error("port not linked: {0}")]
    NotLinked(String),
    #[error("no previous peer for {0}")]
    NoPreviousPeer(String),
    #[error("invalid port reference (expected node/port): {0}")]
    InvalidPortRef(String),
    #[error("invalid error rate (must be in [0, 1]): {0}")]
    InvalidRate(f64),
    #[error("invalid error variance (must be non-negative): {0}")]
    InvalidVariance(f64),
    #[error("invalid port state: {0}")]
    InvalidState(String),
    #[error("{0} is not a switch")]
    NotSwitch(String),
    #[error("{0} block {1} out of range")]
    BlockOutOfRange(&'static str, u32),
    #[error("lid {0} exceeds table capacity {1}")]
    LidOutOfRange(u16, u16),
    #[error("unmapped address: 0x{0:x}")]
    UnmappedAddress(u32),
    #[error("{node} has no processor for class 0x{class:02x}")]
    NoProcessor { node: String, class: u8 },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid topology: {0}")]
    Topology(String),
    #[error("failed to spawn thread: {0}")]
    Spawn(std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("route failed: {0}")]
    Route(#[from] RouteError),
}
