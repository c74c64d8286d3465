//! Nodes of the simulated fabric.
//!
//! A [Node] owns the subnet-management attributes of a switch or channel adapter and
//! the attribute processors registered on it. All of its mutable state sits behind a
//! single lock; the only state touched without it are the per-port [PortCounters],
//! which are atomics so that traversing a link can credit the far end without taking a
//! second node lock.

use crate::{
    dispatcher::Submitter,
    mad::{attribute, class, method, Mad, Notice, Payload},
    port::{CounterSnapshot, ErrorProfile, PhysState, PortCounters, PortInfo, PortState},
    processor::{Context, Filter, Outgoing, Processor},
    random::Random,
    routing::{RouteError, Traversal},
    Error, Fabric,
};
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    num::NonZeroU32,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, info, trace};

/// Entries in a linear forwarding table block.
pub const LFT_BLOCK_SIZE: usize = 64;

/// Entries in a multicast forwarding table block.
pub const MFT_BLOCK_SIZE: usize = 32;

/// Entries in a P_Key table block.
pub const PKEY_BLOCK_SIZE: usize = 32;

/// Entries in a GUIDInfo block.
pub const GUID_BLOCK_SIZE: usize = 8;

/// Entries in a VL arbitration table block.
pub const VL_ARB_BLOCK_SIZE: usize = 32;

/// Number of VL arbitration blocks (low priority 1-2, high priority 3-4).
pub const VL_ARB_BLOCKS: usize = 4;

/// Default number of unicast LIDs a switch can forward.
pub const LINEAR_FDB_CAP: u16 = 0xC000;

/// Default number of multicast LIDs a switch can forward.
pub const MCAST_FDB_CAP: u16 = 0x200;

/// Forwarding table value of an unassigned LID.
pub const UNASSIGNED: u8 = 0xFF;

/// Default partition key (full membership).
pub const DEFAULT_PKEY: u16 = 0xFFFF;

const PARTITION_CAP: u16 = 64;
const PKEY_BLOCKS: usize = PARTITION_CAP as usize / PKEY_BLOCK_SIZE;
const GUID_BLOCKS: usize = 1;
const VENDOR_ID: u32 = 0x0002c9;
const SWITCH_DEVICE_ID: u16 = 0xB924;
const CA_DEVICE_ID: u16 = 0x5A44;
const TRAP_LINK_STATE_CHANGE: u16 = 128;
const PRODUCER_SWITCH: u32 = 2;

/// Transaction identifiers of generated traps.
static TRAP_TRANSACTION: AtomicU64 = AtomicU64::new(19927);

pub type LftBlock = [u8; LFT_BLOCK_SIZE];
pub type MftBlock = [u16; MFT_BLOCK_SIZE];
pub type PKeyBlock = [u16; PKEY_BLOCK_SIZE];
pub type GuidBlock = [u64; GUID_BLOCK_SIZE];
pub type SlToVlTable = [u8; 16];
/// `(vl, weight)` pairs.
pub type VlArbBlock = [(u8, u8); VL_ARB_BLOCK_SIZE];

/// Index of a node in its [Fabric].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A port of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRef {
    pub node: NodeId,
    pub port: u8,
}

impl PortRef {
    pub fn new(node: NodeId, port: u8) -> Self {
        Self { node, port }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    #[serde(rename = "switch", alias = "sw")]
    Switch,
    #[serde(rename = "ca", alias = "hca")]
    ChannelAdapter,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Switch => f.write_str("SW"),
            NodeKind::ChannelAdapter => f.write_str("CA"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub base_version: u8,
    pub class_version: u8,
    pub kind: NodeKind,
    pub num_ports: u8,
    pub system_guid: u64,
    pub node_guid: u64,
    pub port_guid: u64,
    pub partition_cap: u16,
    pub device_id: u16,
    pub revision: u32,
    pub local_port: u8,
    pub vendor_id: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchInfo {
    pub linear_fdb_cap: u16,
    pub random_fdb_cap: u16,
    pub mcast_fdb_cap: u16,
    /// One past the highest LID the linear forwarding table resolves.
    pub linear_fdb_top: u16,
    pub default_port: u8,
    pub default_mcast_primary_port: u8,
    pub default_mcast_not_primary_port: u8,
    pub life_time_value: u8,
    /// Set when a port crosses the Down boundary. Writing `true` clears it.
    pub port_state_change: bool,
    pub lids_per_port: u16,
    pub partition_enf_cap: u16,
    pub enhanced_port0: bool,
}

impl Default for SwitchInfo {
    fn default() -> Self {
        Self {
            linear_fdb_cap: LINEAR_FDB_CAP,
            random_fdb_cap: 0,
            mcast_fdb_cap: MCAST_FDB_CAP,
            linear_fdb_top: 0,
            default_port: 0,
            default_mcast_primary_port: 0,
            default_mcast_not_primary_port: 0,
            life_time_value: 0x13,
            port_state_change: false,
            lids_per_port: 0,
            partition_enf_cap: 32,
            enhanced_port0: false,
        }
    }
}

/// Linear (unicast) forwarding table of a switch.
///
/// LIDs at or above `top` are unassigned regardless of their stored value.
#[derive(Clone, Debug)]
pub struct ForwardingTable {
    entries: Vec<u8>,
    capacity: u16,
    top: u16,
}

impl ForwardingTable {
    pub fn new(capacity: u16) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            top: 0,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn top(&self) -> u16 {
        self.top
    }

    pub fn set_top(&mut self, top: u16) -> Result<(), Error> {
        if top > self.capacity {
            return Err(Error::LidOutOfRange(top, self.capacity));
        }
        self.top = top;
        Ok(())
    }

    /// Output port for `lid`, if assigned.
    pub fn get(&self, lid: u16) -> Option<u8> {
        if lid >= self.top {
            return None;
        }
        self.entries
            .get(lid as usize)
            .copied()
            .filter(|port| *port != UNASSIGNED)
    }

    /// Store one entry. `top` is left alone, so an entry at or above it stays hidden.
    pub fn set(&mut self, lid: u16, port: u8) -> Result<(), Error> {
        if lid >= self.capacity {
            return Err(Error::LidOutOfRange(lid, self.capacity));
        }
        let index = lid as usize;
        if self.entries.len() <= index {
            self.entries.resize(index + 1, UNASSIGNED);
        }
        self.entries[index] = port;
        Ok(())
    }

    /// Store one entry and raise `top` past `lid` when it is assigned.
    pub fn program(&mut self, lid: u16, port: u8) -> Result<(), Error> {
        self.set(lid, port)?;
        if port != UNASSIGNED && lid >= self.top {
            self.top = lid + 1;
        }
        Ok(())
    }

    fn blocks(&self) -> u32 {
        (self.capacity as u32).div_ceil(LFT_BLOCK_SIZE as u32)
    }

    pub fn block(&self, index: u32) -> Result<LftBlock, Error> {
        if index >= self.blocks() {
            return Err(Error::BlockOutOfRange("LinearForwardingTable", index));
        }
        let mut block = [UNASSIGNED; LFT_BLOCK_SIZE];
        let start = index as usize * LFT_BLOCK_SIZE;
        for (offset, entry) in block.iter_mut().enumerate() {
            if let Some(port) = self.entries.get(start + offset) {
                *entry = *port;
            }
        }
        Ok(block)
    }

    pub fn set_block(&mut self, index: u32, block: &LftBlock) -> Result<(), Error> {
        if index >= self.blocks() {
            return Err(Error::BlockOutOfRange("LinearForwardingTable", index));
        }
        let start = index as usize * LFT_BLOCK_SIZE;
        for (offset, port) in block.iter().enumerate() {
            let lid = start + offset;
            if lid >= self.capacity as usize {
                break;
            }
            self.set(lid as u16, *port)?;
        }
        Ok(())
    }

    /// Assigned `(lid, port)` pairs below `top`.
    pub fn routes(&self) -> impl Iterator<Item = (u16, u8)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .take(self.top as usize)
            .filter(|(_, port)| **port != UNASSIGNED)
            .map(|(lid, port)| (lid as u16, *port))
    }
}

/// Result of a link state request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Changed { from: PortState, to: PortState },
    NoChange,
}

/// Result of resolving a LID at one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// The LID resolves to this node (forwarding table port 0).
    Here,
    /// The packet crossed a link and arrived at this port.
    Next(PortRef),
}

#[derive(Clone, Debug)]
pub(crate) struct Port {
    pub(crate) number: u8,
    pub(crate) info: PortInfo,
    pub(crate) guid: u64,
    pub(crate) remote: Option<PortRef>,
    pub(crate) previous: Option<PortRef>,
    pub(crate) errors: ErrorProfile,
    pkeys: Vec<PKeyBlock>,
    guids: Vec<GuidBlock>,
    sl2vl: Vec<SlToVlTable>,
    vl_arb: [VlArbBlock; VL_ARB_BLOCKS],
}

impl Port {
    fn new(number: u8, num_ports: u8) -> Self {
        let mut pkeys = vec![[0; PKEY_BLOCK_SIZE]; PKEY_BLOCKS];
        pkeys[0][0] = DEFAULT_PKEY;
        Self {
            number,
            info: PortInfo::new(number),
            guid: 0,
            remote: None,
            previous: None,
            errors: ErrorProfile::default(),
            pkeys,
            guids: vec![[0; GUID_BLOCK_SIZE]; GUID_BLOCKS],
            sl2vl: vec![[0; 16]; num_ports as usize + 1],
            vl_arb: Default::default(),
        }
    }
}

/// Subnet-management state of a node. Only accessed with the node lock held.
#[derive(Debug)]
pub(crate) struct Attributes {
    pub(crate) name: String,
    pub(crate) info: NodeInfo,
    pub(crate) description: String,
    pub(crate) switch: Option<SwitchInfo>,
    pub(crate) ports: Vec<Port>,
    pub(crate) lft: ForwardingTable,
    mft: BTreeMap<(u32, u8), MftBlock>,
    cr_space: BTreeMap<u32, u32>,
}

impl Attributes {
    fn new(name: &str, kind: NodeKind, num_ports: u8) -> Self {
        let mut ports: Vec<Port> = (0..=num_ports).map(|n| Port::new(n, num_ports)).collect();
        let switch = match kind {
            NodeKind::Switch => {
                // The management port is always up
                ports[0].info.state = PortState::Active;
                ports[0].info.phys_state = PhysState::LinkUp;
                Some(SwitchInfo::default())
            }
            NodeKind::ChannelAdapter => None,
        };
        Self {
            name: name.to_string(),
            info: NodeInfo {
                base_version: 1,
                class_version: 1,
                kind,
                num_ports,
                system_guid: 0,
                node_guid: 0,
                port_guid: 0,
                partition_cap: PARTITION_CAP,
                device_id: match kind {
                    NodeKind::Switch => SWITCH_DEVICE_ID,
                    NodeKind::ChannelAdapter => CA_DEVICE_ID,
                },
                revision: 0xA0,
                local_port: 0,
                vendor_id: VENDOR_ID,
            },
            description: name.to_string(),
            switch,
            ports,
            lft: ForwardingTable::new(LINEAR_FDB_CAP),
            mft: BTreeMap::new(),
            cr_space: BTreeMap::new(),
        }
    }

    pub(crate) fn is_switch(&self) -> bool {
        self.switch.is_some()
    }

    pub(crate) fn port(&self, port: u8) -> Result<&Port, Error> {
        self.ports
            .get(port as usize)
            .ok_or_else(|| Error::InvalidPort(self.name.clone(), port))
    }

    pub(crate) fn port_mut(&mut self, port: u8) -> Result<&mut Port, Error> {
        let name = &self.name;
        self.ports
            .get_mut(port as usize)
            .ok_or_else(|| Error::InvalidPort(name.clone(), port))
    }

    /// Node info as seen from `port`.
    pub(crate) fn node_info(&self, port: u8) -> Result<NodeInfo, Error> {
        let guid = self.port(port)?.guid;
        let mut info = self.info.clone();
        info.local_port = port;
        info.port_guid = guid;
        Ok(info)
    }

    pub(crate) fn port_info(&self, port: u8) -> Result<PortInfo, Error> {
        Ok(self.port(port)?.info.clone())
    }

    /// Apply the writable fields of `requested` and then request its link state.
    ///
    /// An illegal state change is refused before any field is written.
    pub(crate) fn update_port_info(
        &mut self,
        counters: &[PortCounters],
        port: u8,
        requested: &PortInfo,
    ) -> Result<(Transition, Option<Mad>), Error> {
        let current = &mut self.port_mut(port)?.info;
        if current.state != requested.state && !current.state.can_transition(requested.state) {
            return Err(Error::InvalidState(format!(
                "{} -> {}",
                current.state, requested.state
            )));
        }
        current.m_key = requested.m_key;
        current.gid_prefix = requested.gid_prefix;
        current.base_lid = requested.base_lid;
        current.master_sm_lid = requested.master_sm_lid;
        current.capability_mask = requested.capability_mask;
        current.lmc = requested.lmc.min(7);
        current.m_key_lease_period = requested.m_key_lease_period;
        if current.state == requested.state {
            return Ok((Transition::NoChange, None));
        }
        self.set_link_status(counters, port, requested.state)
    }

    /// Request a link state change, emitting a trap when a switch port crosses the
    /// Down boundary.
    pub(crate) fn set_link_status(
        &mut self,
        counters: &[PortCounters],
        port: u8,
        state: PortState,
    ) -> Result<(Transition, Option<Mad>), Error> {
        let from = self.port(port)?.info.state;
        if !from.can_transition(state) {
            debug!(node = %self.name, port, %from, to = %state, "rejecting link state change");
            return Ok((Transition::NoChange, None));
        }
        let info = &mut self.port_mut(port)?.info;
        info.state = state;
        info.phys_state = match state {
            PortState::Down => PhysState::Polling,
            _ => PhysState::LinkUp,
        };
        if let Some(counters) = counters.get(port as usize) {
            counters.record_link_change();
        }
        info!(node = %self.name, port, %from, to = %state, "link state changed");
        let trap = if from == PortState::Down || state == PortState::Down {
            self.trap()
        } else {
            None
        };
        Ok((Transition::Changed { from, to: state }, trap))
    }

    /// Build a trap 128 notice for the subnet manager (switches only).
    pub(crate) fn trap(&mut self) -> Option<Mad> {
        let switch = self.switch.as_mut()?;
        switch.port_state_change = true;
        let management = &self.ports.first()?.info;
        let lid = management.base_lid;
        let notice = Notice {
            generic: true,
            notice_type: 1,
            producer_type: PRODUCER_SWITCH,
            trap_number: TRAP_LINK_STATE_CHANGE,
            issuer_lid: lid,
            toggle_count: 0,
            switch_lid: lid,
        };
        let mut mad = Mad::new(class::SUBN_LID, method::TRAP, attribute::NOTICE, 0)
            .with_slid(lid)
            .with_dlid(management.master_sm_lid)
            .with_transaction_id(TRAP_TRANSACTION.fetch_add(1, Ordering::Relaxed))
            .with_payload(Payload::Notice(notice));
        mad.address.sl = 15;
        debug!(node = %self.name, sm_lid = management.master_sm_lid, "raising trap 128");
        Some(mad)
    }

    fn switch_ref(&self) -> Result<&SwitchInfo, Error> {
        self.switch
            .as_ref()
            .ok_or_else(|| Error::NotSwitch(self.name.clone()))
    }

    fn switch_mut(&mut self) -> Result<&mut SwitchInfo, Error> {
        let name = &self.name;
        self.switch
            .as_mut()
            .ok_or_else(|| Error::NotSwitch(name.clone()))
    }

    pub(crate) fn switch_info(&self) -> Result<SwitchInfo, Error> {
        let mut info = self.switch_ref()?.clone();
        info.linear_fdb_top = self.lft.top();
        Ok(info)
    }

    pub(crate) fn set_switch_info(&mut self, requested: &SwitchInfo) -> Result<(), Error> {
        if requested.linear_fdb_top > self.lft.capacity() {
            return Err(Error::LidOutOfRange(
                requested.linear_fdb_top,
                self.lft.capacity(),
            ));
        }
        let switch = self.switch_mut()?;
        switch.default_port = requested.default_port;
        switch.default_mcast_primary_port = requested.default_mcast_primary_port;
        switch.default_mcast_not_primary_port = requested.default_mcast_not_primary_port;
        switch.life_time_value = requested.life_time_value;
        if requested.port_state_change {
            switch.port_state_change = false;
        }
        self.lft.set_top(requested.linear_fdb_top)?;
        Ok(())
    }

    pub(crate) fn lft_block(&self, index: u32) -> Result<LftBlock, Error> {
        self.switch_ref()?;
        self.lft.block(index)
    }

    pub(crate) fn set_lft_block(&mut self, index: u32, block: &LftBlock) -> Result<(), Error> {
        self.switch_ref()?;
        self.lft.set_block(index, block)
    }

    fn check_mft(&self, block: u32, position: u8) -> Result<(), Error> {
        let switch = self.switch_ref()?;
        let blocks = (switch.mcast_fdb_cap as u32).div_ceil(MFT_BLOCK_SIZE as u32);
        if block >= blocks {
            return Err(Error::BlockOutOfRange("MulticastForwardingTable", block));
        }
        // Each position covers 16 ports
        if position as u32 > self.info.num_ports as u32 / 16 {
            return Err(Error::BlockOutOfRange(
                "MulticastForwardingTable",
                position as u32,
            ));
        }
        Ok(())
    }

    pub(crate) fn mft_block(&self, block: u32, position: u8) -> Result<MftBlock, Error> {
        self.check_mft(block, position)?;
        Ok(self
            .mft
            .get(&(block, position))
            .copied()
            .unwrap_or([0; MFT_BLOCK_SIZE]))
    }

    pub(crate) fn set_mft_block(
        &mut self,
        block: u32,
        position: u8,
        entries: &MftBlock,
    ) -> Result<(), Error> {
        self.check_mft(block, position)?;
        self.mft.insert((block, position), *entries);
        Ok(())
    }

    pub(crate) fn pkey_block(&self, port: u8, block: u32) -> Result<PKeyBlock, Error> {
        self.port(port)?
            .pkeys
            .get(block as usize)
            .copied()
            .ok_or(Error::BlockOutOfRange("PKeyTable", block))
    }

    pub(crate) fn set_pkey_block(
        &mut self,
        port: u8,
        block: u32,
        entries: &PKeyBlock,
    ) -> Result<(), Error> {
        let slot = self
            .port_mut(port)?
            .pkeys
            .get_mut(block as usize)
            .ok_or(Error::BlockOutOfRange("PKeyTable", block))?;
        *slot = *entries;
        Ok(())
    }

    pub(crate) fn guid_block(&self, port: u8, block: u32) -> Result<GuidBlock, Error> {
        self.port(port)?
            .guids
            .get(block as usize)
            .copied()
            .ok_or(Error::BlockOutOfRange("GuidInfo", block))
    }

    pub(crate) fn set_guid_block(
        &mut self,
        port: u8,
        block: u32,
        entries: &GuidBlock,
    ) -> Result<(), Error> {
        let slot = self
            .port_mut(port)?
            .guids
            .get_mut(block as usize)
            .ok_or(Error::BlockOutOfRange("GuidInfo", block))?;
        // The first entry is the port GUID and is read only
        let guid = slot[0];
        *slot = *entries;
        slot[0] = guid;
        Ok(())
    }

    pub(crate) fn sl2vl(&self, in_port: u8, out_port: u8) -> Result<SlToVlTable, Error> {
        self.port(in_port)?
            .sl2vl
            .get(out_port as usize)
            .copied()
            .ok_or_else(|| Error::InvalidPort(self.name.clone(), out_port))
    }

    pub(crate) fn set_sl2vl(
        &mut self,
        in_port: u8,
        out_port: u8,
        table: &SlToVlTable,
    ) -> Result<(), Error> {
        let name = self.name.clone();
        let slot = self
            .port_mut(in_port)?
            .sl2vl
            .get_mut(out_port as usize)
            .ok_or(Error::InvalidPort(name, out_port))?;
        *slot = *table;
        Ok(())
    }

    /// VL arbitration block (numbered 1 through 4).
    pub(crate) fn vl_arb(&self, port: u8, block: u32) -> Result<VlArbBlock, Error> {
        let index = Self::vl_arb_index(block)?;
        Ok(self.port(port)?.vl_arb[index])
    }

    pub(crate) fn set_vl_arb(
        &mut self,
        port: u8,
        block: u32,
        entries: &VlArbBlock,
    ) -> Result<(), Error> {
        let index = Self::vl_arb_index(block)?;
        self.port_mut(port)?.vl_arb[index] = *entries;
        Ok(())
    }

    fn vl_arb_index(block: u32) -> Result<usize, Error> {
        match block {
            1..=4 => Ok(block as usize - 1),
            _ => Err(Error::BlockOutOfRange("VlArbitration", block)),
        }
    }

    pub(crate) fn cr_read(&self, address: u32) -> Result<u32, Error> {
        self.cr_space
            .get(&address)
            .copied()
            .ok_or(Error::UnmappedAddress(address))
    }

    pub(crate) fn cr_write(&mut self, address: u32, value: u32) -> Result<(), Error> {
        let word = self
            .cr_space
            .get_mut(&address)
            .ok_or(Error::UnmappedAddress(address))?;
        *word = value;
        Ok(())
    }
}

struct NodeState {
    attributes: Attributes,
    processors: BTreeMap<u8, Vec<Processor>>,
}

/// A switch or channel adapter.
pub struct Node {
    id: NodeId,
    name: String,
    kind: NodeKind,
    num_ports: u8,
    state: Mutex<NodeState>,
    counters: Vec<PortCounters>,
    random: Arc<Random>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("num_ports", &self.num_ports)
            .finish()
    }
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        name: &str,
        kind: NodeKind,
        num_ports: u8,
        random: Arc<Random>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            num_ports,
            state: Mutex::new(NodeState {
                attributes: Attributes::new(name, kind, num_ports),
                processors: BTreeMap::new(),
            }),
            counters: (0..=num_ports).map(|_| PortCounters::default()).collect(),
            random,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_switch(&self) -> bool {
        self.kind == NodeKind::Switch
    }

    /// Number of external ports (port 0 is not counted).
    pub fn num_ports(&self) -> u8 {
        self.num_ports
    }

    /// Ports that can carry a link.
    pub fn ports(&self) -> impl Iterator<Item = u8> {
        1..=self.num_ports
    }

    /// Check that `port` exists on this node.
    pub fn check_port(&self, port: u8) -> Result<(), Error> {
        if port > self.num_ports {
            return Err(Error::InvalidPort(self.name.clone(), port));
        }
        Ok(())
    }

    pub fn port_counters(&self, port: u8) -> Option<&PortCounters> {
        self.counters.get(port as usize)
    }

    pub fn node_info(&self, port: u8) -> Result<NodeInfo, Error> {
        self.state.lock().unwrap().attributes.node_info(port)
    }

    pub fn description(&self) -> String {
        self.state.lock().unwrap().attributes.description.clone()
    }

    pub fn set_description(&self, description: &str) {
        self.state.lock().unwrap().attributes.description = description.to_string();
    }

    pub fn node_guid(&self) -> u64 {
        self.state.lock().unwrap().attributes.info.node_guid
    }

    pub fn port_guid(&self, port: u8) -> Result<u64, Error> {
        Ok(self.state.lock().unwrap().attributes.port(port)?.guid)
    }

    pub fn port_info(&self, port: u8) -> Result<PortInfo, Error> {
        self.state.lock().unwrap().attributes.port_info(port)
    }

    /// Apply `info` to `port`. A state different from the current one is requested
    /// through the link state machine; a resulting trap is handed to `submitter`.
    pub fn set_port_info(
        &self,
        port: u8,
        info: &PortInfo,
        submitter: &dyn Submitter,
    ) -> Result<Transition, Error> {
        let (transition, trap) = {
            let mut state = self.state.lock().unwrap();
            state
                .attributes
                .update_port_info(&self.counters, port, info)?
        };
        self.raise(trap, submitter);
        Ok(transition)
    }

    pub fn link_status(&self, port: u8) -> Result<PortState, Error> {
        Ok(self.state.lock().unwrap().attributes.port(port)?.info.state)
    }

    /// Request a link state change on `port`.
    pub fn set_link_status(
        &self,
        port: u8,
        state: PortState,
        submitter: &dyn Submitter,
    ) -> Result<Transition, Error> {
        let (transition, trap) = {
            let mut guard = self.state.lock().unwrap();
            guard
                .attributes
                .set_link_status(&self.counters, port, state)?
        };
        self.raise(trap, submitter);
        Ok(transition)
    }

    fn raise(&self, trap: Option<Mad>, submitter: &dyn Submitter) {
        if let Some(trap) = trap {
            submitter.dispatch(self.id, 0, trap);
        }
    }

    /// Returns true if `lid` addresses `port` (honoring its LMC).
    pub fn port_answers(&self, port: u8, lid: u16) -> bool {
        let state = self.state.lock().unwrap();
        state
            .attributes
            .port(port)
            .map(|port| port.info.answers(lid))
            .unwrap_or(false)
    }

    /// Set the base LID (and optionally LMC) of `port`.
    pub fn set_lid(&self, port: u8, lid: u16, lmc: Option<u8>) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let info = &mut state.attributes.port_mut(port)?.info;
        info.base_lid = lid;
        if let Some(lmc) = lmc {
            info.lmc = lmc.min(7);
        }
        Ok(())
    }

    /// Record the subnet manager LID on every port.
    pub fn set_sm_lid(&self, lid: u16) {
        let mut state = self.state.lock().unwrap();
        for port in state.attributes.ports.iter_mut() {
            port.info.master_sm_lid = lid;
        }
    }

    pub fn switch_info(&self) -> Result<SwitchInfo, Error> {
        self.state.lock().unwrap().attributes.switch_info()
    }

    pub fn set_switch_info(&self, info: &SwitchInfo) -> Result<(), Error> {
        self.state.lock().unwrap().attributes.set_switch_info(info)
    }

    pub fn lft_block(&self, index: u32) -> Result<LftBlock, Error> {
        self.state.lock().unwrap().attributes.lft_block(index)
    }

    pub fn set_lft_block(&self, index: u32, block: &LftBlock) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .attributes
            .set_lft_block(index, block)
    }

    /// Program a single forwarding entry, raising the table top to cover it.
    pub fn set_route(&self, lid: u16, port: u8) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.attributes.is_switch() {
            return Err(Error::NotSwitch(self.name.clone()));
        }
        state.attributes.lft.program(lid, port)
    }

    /// Assigned forwarding entries below the table top.
    pub fn routes(&self) -> Vec<(u16, u8)> {
        self.state.lock().unwrap().attributes.lft.routes().collect()
    }

    pub fn lft_top(&self) -> u16 {
        self.state.lock().unwrap().attributes.lft.top()
    }

    /// Move the forwarding table top (at most the table capacity).
    pub fn set_lft_top(&self, top: u16) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.attributes.is_switch() {
            return Err(Error::NotSwitch(self.name.clone()));
        }
        state.attributes.lft.set_top(top)
    }

    pub fn mft_block(&self, block: u32, position: u8) -> Result<MftBlock, Error> {
        self.state
            .lock()
            .unwrap()
            .attributes
            .mft_block(block, position)
    }

    pub fn set_mft_block(&self, block: u32, position: u8, entries: &MftBlock) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .attributes
            .set_mft_block(block, position, entries)
    }

    pub fn pkey_block(&self, port: u8, block: u32) -> Result<PKeyBlock, Error> {
        self.state.lock().unwrap().attributes.pkey_block(port, block)
    }

    pub fn set_pkey_block(&self, port: u8, block: u32, entries: &PKeyBlock) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .attributes
            .set_pkey_block(port, block, entries)
    }

    pub fn guid_block(&self, port: u8, block: u32) -> Result<GuidBlock, Error> {
        self.state.lock().unwrap().attributes.guid_block(port, block)
    }

    pub fn set_guid_block(&self, port: u8, block: u32, entries: &GuidBlock) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .attributes
            .set_guid_block(port, block, entries)
    }

    pub fn sl2vl(&self, in_port: u8, out_port: u8) -> Result<SlToVlTable, Error> {
        self.state.lock().unwrap().attributes.sl2vl(in_port, out_port)
    }

    pub fn set_sl2vl(&self, in_port: u8, out_port: u8, table: &SlToVlTable) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .attributes
            .set_sl2vl(in_port, out_port, table)
    }

    pub fn vl_arb(&self, port: u8, block: u32) -> Result<VlArbBlock, Error> {
        self.state.lock().unwrap().attributes.vl_arb(port, block)
    }

    pub fn set_vl_arb(&self, port: u8, block: u32, entries: &VlArbBlock) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .attributes
            .set_vl_arb(port, block, entries)
    }

    pub fn counters(&self, port: u8) -> Result<CounterSnapshot, Error> {
        self.port_counters(port)
            .map(PortCounters::snapshot)
            .ok_or_else(|| Error::InvalidPort(self.name.clone(), port))
    }

    /// Overwrite the counters of `port` selected by `mask`.
    pub fn set_counters(&self, port: u8, values: &CounterSnapshot, mask: u16) -> Result<(), Error> {
        let counters = self
            .port_counters(port)
            .ok_or_else(|| Error::InvalidPort(self.name.clone(), port))?;
        counters.store(values, mask);
        Ok(())
    }

    /// Read `len` words of CR space starting at `start`. Each word fails on its own if
    /// its address is unmapped.
    pub fn cr_read(&self, start: u32, len: u32) -> Vec<Result<u32, Error>> {
        let state = self.state.lock().unwrap();
        (0..len)
            .map(|i| state.attributes.cr_read(start.wrapping_add(4 * i)))
            .collect()
    }

    /// Write consecutive words of CR space starting at `start`.
    pub fn cr_write(&self, start: u32, words: &[u32]) -> Vec<Result<(), Error>> {
        let mut state = self.state.lock().unwrap();
        words
            .iter()
            .enumerate()
            .map(|(i, word)| {
                state
                    .attributes
                    .cr_write(start.wrapping_add(4 * i as u32), *word)
            })
            .collect()
    }

    /// Map a CR space word.
    pub fn cr_map(&self, address: u32, value: u32) {
        self.state
            .lock()
            .unwrap()
            .attributes
            .cr_space
            .insert(address, value);
    }

    pub fn error_profile(&self, port: u8) -> Result<ErrorProfile, Error> {
        let state = self.state.lock().unwrap();
        Ok(state.attributes.port(port)?.errors.clone())
    }

    /// Change the loss model of `port`, keeping its current decision streak.
    ///
    /// With a `hold`, every decision lasts exactly that many packets.
    pub fn set_error_rate(
        &self,
        port: u8,
        rate: f64,
        variance: f64,
        hold: Option<NonZeroU32>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let errors = &mut state.attributes.port_mut(port)?.errors;
        let mut updated = errors.clone();
        updated.set_rate(rate)?;
        updated.set_variance(variance)?;
        updated.set_hold(hold);
        *errors = updated;
        Ok(())
    }

    pub fn remote(&self, port: u8) -> Result<Option<PortRef>, Error> {
        Ok(self.state.lock().unwrap().attributes.port(port)?.remote)
    }

    pub fn previous(&self, port: u8) -> Result<Option<PortRef>, Error> {
        Ok(self.state.lock().unwrap().attributes.port(port)?.previous)
    }

    /// Wire `port` to `remote` and bring it to `state`. With `announce`, a switch port
    /// leaving Down raises a trap.
    pub(crate) fn connect(
        &self,
        port: u8,
        remote: PortRef,
        state: PortState,
        announce: bool,
    ) -> Result<Option<Mad>, Error> {
        if port == 0 {
            return Err(Error::InvalidPort(self.name.clone(), port));
        }
        let mut guard = self.state.lock().unwrap();
        let attributes = &mut guard.attributes;
        let entry = attributes.port_mut(port)?;
        if entry.remote.is_some() {
            return Err(Error::PortInUse(format!("{}/{}", self.name, port)));
        }
        entry.remote = Some(remote);
        let from = entry.info.state;
        entry.info.state = state;
        entry.info.phys_state = PhysState::LinkUp;
        if announce && from == PortState::Down && state != PortState::Down {
            return Ok(attributes.trap());
        }
        Ok(None)
    }

    /// Undo a [Node::connect] whose peer could not be linked back.
    pub(crate) fn release(
        &self,
        port: u8,
        state: PortState,
        phys_state: PhysState,
    ) -> Result<(), Error> {
        let mut guard = self.state.lock().unwrap();
        let entry = guard.attributes.port_mut(port)?;
        entry.remote = None;
        entry.info.state = state;
        entry.info.phys_state = phys_state;
        Ok(())
    }

    /// Drop the link on `port`, remembering the peer for a later relink.
    pub(crate) fn disconnect(&self, port: u8) -> Result<(Option<PortRef>, Option<Mad>), Error> {
        let mut guard = self.state.lock().unwrap();
        let attributes = &mut guard.attributes;
        let entry = attributes.port_mut(port)?;
        let remote = entry.remote.take();
        if remote.is_some() {
            entry.previous = remote;
        }
        let from = entry.info.state;
        entry.info.state = PortState::Down;
        entry.info.phys_state = PhysState::Polling;
        if from == PortState::Down {
            return Ok((remote, None));
        }
        self.counters[port as usize].record_link_change();
        Ok((remote, attributes.trap()))
    }

    /// Assign GUIDs starting after `*next`. Returns the node GUID and the GUID of every
    /// external port.
    pub(crate) fn assign_guids(&self, next: &mut u64) -> (u64, Vec<(u8, u64)>) {
        let mut state = self.state.lock().unwrap();
        let attributes = &mut state.attributes;
        *next += 1;
        let node_guid = *next;
        attributes.info.node_guid = node_guid;
        attributes.info.system_guid = node_guid;
        let mut assigned = Vec::with_capacity(self.num_ports as usize);
        for port in attributes.ports.iter_mut() {
            let guid = match self.kind {
                NodeKind::Switch => node_guid,
                NodeKind::ChannelAdapter if port.number == 0 => continue,
                NodeKind::ChannelAdapter => {
                    *next += 1;
                    *next
                }
            };
            port.guid = guid;
            port.guids[0][0] = guid;
            if port.number != 0 {
                assigned.push((port.number, guid));
            }
        }
        (node_guid, assigned)
    }

    /// Register `processor` for each management class it serves.
    pub fn register(&self, processor: Processor) {
        let mut state = self.state.lock().unwrap();
        for class in processor.classes() {
            state
                .processors
                .entry(class)
                .or_default()
                .push(processor.clone());
        }
    }

    /// Attach a client on `port`, returning the stream of MADs that match `filter`.
    pub fn attach_client(
        &self,
        port: u8,
        filter: Filter,
    ) -> Result<mpsc::UnboundedReceiver<Mad>, Error> {
        self.check_port(port)?;
        let (sender, receiver) = mpsc::unbounded();
        self.register(Processor::client(port, filter, sender));
        info!(node = %self.name, port, class = filter.class, "client attached");
        Ok(receiver)
    }

    /// Remove every client attached on `port`. Returns the number of bindings removed.
    pub fn detach_clients(&self, port: u8) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;
        for registered in state.processors.values_mut() {
            let before = registered.len();
            registered.retain(|processor| processor.client_port() != Some(port));
            removed += before - registered.len();
        }
        removed
    }

    /// Attached clients as `(port, filter)` pairs.
    pub fn clients(&self) -> Vec<(u8, Filter)> {
        let state = self.state.lock().unwrap();
        state
            .processors
            .values()
            .flatten()
            .filter_map(|processor| processor.binding())
            .collect()
    }

    /// Deliver `mad`, received on `in_port`, to the processors of its class.
    ///
    /// Returns the MADs the processors want sent (responses, traps). They must be
    /// dispatched after this call returns so no lock is held while they are queued.
    pub fn process_mad(&self, in_port: u8, mad: &Mad) -> Result<Vec<Outgoing>, Error> {
        let class = mad.header.mgmt_class;
        let mut state = self.state.lock().unwrap();
        let NodeState {
            attributes,
            processors,
        } = &mut *state;
        let registered = match processors.get_mut(&class) {
            Some(registered) if !registered.is_empty() => registered,
            _ => {
                return Err(Error::NoProcessor {
                    node: self.name.clone(),
                    class,
                })
            }
        };
        let mut context = Context {
            attributes,
            counters: &self.counters,
        };
        let mut outgoing = Vec::new();
        for processor in registered.iter() {
            outgoing.extend(processor.process(&mut context, in_port, mad));
        }
        registered.retain(|processor| !processor.is_closed());
        Ok(outgoing)
    }

    /// Cross the link on `out_port`.
    ///
    /// Fails if the port has no neighbor, if the link is not Active (or at least Init
    /// for VL15 traffic), or if the loss model drops the packet. Delivering traversals
    /// update the counters of both ends.
    pub fn remote_by_out_port(
        &self,
        fabric: &Fabric,
        out_port: u8,
        vl15: bool,
        traversal: Traversal,
    ) -> Result<PortRef, RouteError> {
        let mut state = self.state.lock().unwrap();
        let port = match state.attributes.ports.get_mut(out_port as usize) {
            Some(port) => port,
            None => {
                return Err(RouteError::NoLink {
                    node: self.name.clone(),
                    port: out_port,
                })
            }
        };
        let remote = port.remote.ok_or_else(|| RouteError::NoLink {
            node: self.name.clone(),
            port: out_port,
        })?;
        let link = port.info.state;
        let usable = link == PortState::Active || (vl15 && link > PortState::Down);
        if !usable {
            return Err(RouteError::LinkNotActive {
                node: self.name.clone(),
                port: out_port,
                state: link,
            });
        }
        if traversal == Traversal::DryRun {
            return Ok(remote);
        }
        let far = fabric
            .get(remote.node)
            .and_then(|node| node.port_counters(remote.port));
        if port.errors.is_dropped(&self.random) {
            self.counters[out_port as usize].record_discard();
            if let Some(far) = far {
                far.record_rcv_error();
            }
            return Err(RouteError::Dropped {
                node: self.name.clone(),
                port: out_port,
            });
        }
        self.counters[out_port as usize].record_xmit(crate::mad::MAD_SIZE);
        if let Some(far) = far {
            far.record_rcv(crate::mad::MAD_SIZE);
        }
        trace!(node = %self.name, port = out_port, remote = %remote, "crossed link");
        Ok(remote)
    }

    /// Resolve `lid` through the forwarding table.
    pub fn remote_by_lid(
        &self,
        fabric: &Fabric,
        lid: u16,
        vl15: bool,
        traversal: Traversal,
    ) -> Result<Step, RouteError> {
        let out_port = {
            let state = self.state.lock().unwrap();
            state.attributes.lft.get(lid)
        };
        match out_port {
            None => Err(RouteError::NoEntry {
                node: self.name.clone(),
                lid,
            }),
            Some(0) => Ok(Step::Here),
            Some(port) => self
                .remote_by_out_port(fabric, port, vl15, traversal)
                .map(Step::Next),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ibsim_macros::test_traced;

    /// Records submitted MADs instead of routing them.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub(crate) sent: Mutex<Vec<(NodeId, u8, Mad)>>,
    }

    impl Submitter for Recorder {
        fn dispatch(&self, origin: NodeId, port: u8, mad: Mad) {
            self.sent.lock().unwrap().push((origin, port, mad));
        }
    }

    impl Recorder {
        pub(crate) fn take(&self) -> Vec<(NodeId, u8, Mad)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    fn switch() -> Node {
        let node = Node::new(
            NodeId::new(0),
            "sw",
            NodeKind::Switch,
            4,
            Arc::new(Random::new(0)),
        );
        node.set_lid(0, 10, None).unwrap();
        node.set_sm_lid(1);
        node
    }

    #[test]
    fn test_forwarding_table_top() {
        let mut table = ForwardingTable::new(LINEAR_FDB_CAP);
        table.program(1, 1).unwrap();
        table.program(4, 2).unwrap();
        assert_eq!(table.top(), 5);
        assert_eq!(table.get(4), Some(2));
        assert_eq!(table.get(3), None);

        // Lowering top hides entries at or above it
        table.set_top(4).unwrap();
        assert_eq!(table.get(3), None);
        assert_eq!(table.get(4), None);
        assert_eq!(table.get(1), Some(1));

        // A plain store above top stays hidden
        table.set(9, 3).unwrap();
        assert_eq!(table.top(), 4);
        assert_eq!(table.get(9), None);

        // Top covers at most the whole table
        table.set_top(LINEAR_FDB_CAP).unwrap();
        assert_eq!(table.get(9), Some(3));
        assert!(matches!(
            table.set_top(LINEAR_FDB_CAP + 1),
            Err(Error::LidOutOfRange(_, _))
        ));
        assert_eq!(table.top(), LINEAR_FDB_CAP);

        assert!(matches!(
            table.set(LINEAR_FDB_CAP, 1),
            Err(Error::LidOutOfRange(_, _))
        ));
    }

    #[test]
    fn test_forwarding_table_blocks() {
        let mut table = ForwardingTable::new(LINEAR_FDB_CAP);
        let mut block = [UNASSIGNED; LFT_BLOCK_SIZE];
        block[3] = 7;
        table.set_block(2, &block).unwrap();

        // Blocks are stored as written but stay hidden until top covers them
        assert_eq!(table.top(), 0);
        assert_eq!(table.get(2 * 64 + 3), None);
        assert_eq!(table.block(2).unwrap(), block);
        table.set_top(3 * 64).unwrap();
        assert_eq!(table.get(2 * 64 + 3), Some(7));
        assert_eq!(table.block(0).unwrap(), [UNASSIGNED; LFT_BLOCK_SIZE]);
        assert!(table.block(LINEAR_FDB_CAP as u32 / 64).is_err());
        assert_eq!(table.routes().collect::<Vec<_>>(), vec![(131, 7)]);
    }

    #[test_traced]
    fn test_link_state_machine_switch() {
        let node = switch();
        let recorder = Recorder::default();

        // Down cannot jump to Active
        assert_eq!(
            node.set_link_status(1, PortState::Active, &recorder).unwrap(),
            Transition::NoChange
        );
        assert_eq!(node.link_status(1).unwrap(), PortState::Down);
        assert!(recorder.take().is_empty());

        for (from, to) in [
            (PortState::Down, PortState::Init),
            (PortState::Init, PortState::Armed),
            (PortState::Armed, PortState::Active),
        ] {
            assert_eq!(
                node.set_link_status(1, to, &recorder).unwrap(),
                Transition::Changed { from, to }
            );
        }
        assert_eq!(node.link_status(1).unwrap(), PortState::Active);

        // Only leaving Down raised a trap
        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        let (origin, port, trap) = &sent[0];
        assert_eq!(*origin, node.id());
        assert_eq!(*port, 0);
        assert_eq!(trap.header.method, method::TRAP);
        assert_eq!(trap.address.dlid, 1);
        assert_eq!(trap.address.slid, 10);
        match &trap.payload {
            Payload::Notice(notice) => {
                assert_eq!(notice.trap_number, 128);
                assert_eq!(notice.issuer_lid, 10);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(node.switch_info().unwrap().port_state_change);

        // Accepted transitions are counted
        let counters = node.counters(1).unwrap();
        assert_eq!(counters.link_error_recovery, 3);
        assert_eq!(counters.link_downed, 3);
    }

    #[test]
    fn test_link_state_machine_ca_no_trap() {
        let node = Node::new(
            NodeId::new(0),
            "h1",
            NodeKind::ChannelAdapter,
            1,
            Arc::new(Random::new(0)),
        );
        let recorder = Recorder::default();
        node.set_link_status(1, PortState::Init, &recorder).unwrap();
        node.set_link_status(1, PortState::Down, &recorder).unwrap();
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_port_info_illegal_state() {
        let node = switch();
        let recorder = Recorder::default();
        let mut info = node.port_info(2).unwrap();
        info.state = PortState::Active;
        info.base_lid = 33;
        assert!(matches!(
            node.set_port_info(2, &info, &recorder),
            Err(Error::InvalidState(_))
        ));

        // Nothing was applied
        let current = node.port_info(2).unwrap();
        assert_eq!(current.state, PortState::Down);
        assert_eq!(current.base_lid, 0);
        assert!(recorder.take().is_empty());

        info.state = PortState::Init;
        assert_eq!(
            node.set_port_info(2, &info, &recorder).unwrap(),
            Transition::Changed {
                from: PortState::Down,
                to: PortState::Init
            }
        );
        assert_eq!(node.port_info(2).unwrap().base_lid, 33);
        assert_eq!(recorder.take().len(), 1);
    }

    #[test]
    fn test_invalid_port() {
        let node = switch();
        let recorder = Recorder::default();
        assert!(matches!(
            node.set_link_status(9, PortState::Init, &recorder),
            Err(Error::InvalidPort(_, 9))
        ));
        assert!(node.port_info(5).is_err());
        assert!(node.port_info(4).is_ok());
    }

    #[test]
    fn test_queries_idempotent() {
        let node = switch();
        node.set_route(3, 2).unwrap();
        assert_eq!(node.port_info(2).unwrap(), node.port_info(2).unwrap());
        assert_eq!(node.switch_info().unwrap(), node.switch_info().unwrap());
        assert_eq!(node.switch_info().unwrap().linear_fdb_top, 4);
        assert_eq!(node.lft_block(0).unwrap(), node.lft_block(0).unwrap());
    }

    #[test]
    fn test_switch_only_attributes() {
        let node = Node::new(
            NodeId::new(0),
            "h1",
            NodeKind::ChannelAdapter,
            1,
            Arc::new(Random::new(0)),
        );
        assert!(matches!(node.switch_info(), Err(Error::NotSwitch(_))));
        assert!(matches!(node.lft_block(0), Err(Error::NotSwitch(_))));
        assert!(matches!(node.set_route(1, 1), Err(Error::NotSwitch(_))));
    }

    #[test]
    fn test_tables() {
        let node = switch();

        let mut pkeys = [0; PKEY_BLOCK_SIZE];
        pkeys[1] = 0x8001;
        node.set_pkey_block(1, 1, &pkeys).unwrap();
        assert_eq!(node.pkey_block(1, 1).unwrap(), pkeys);
        assert_eq!(node.pkey_block(1, 0).unwrap()[0], DEFAULT_PKEY);
        assert!(node.pkey_block(1, 2).is_err());

        let table = [1; 16];
        node.set_sl2vl(1, 3, &table).unwrap();
        assert_eq!(node.sl2vl(1, 3).unwrap(), table);
        assert!(node.sl2vl(1, 5).is_err());

        let mut arb: VlArbBlock = Default::default();
        arb[0] = (1, 64);
        node.set_vl_arb(2, 3, &arb).unwrap();
        assert_eq!(node.vl_arb(2, 3).unwrap()[0], (1, 64));
        assert!(node.vl_arb(2, 0).is_err());
        assert!(node.vl_arb(2, 5).is_err());

        let mut mft = [0; MFT_BLOCK_SIZE];
        mft[0] = 0b110;
        node.set_mft_block(1, 0, &mft).unwrap();
        assert_eq!(node.mft_block(1, 0).unwrap(), mft);
        assert_eq!(node.mft_block(2, 0).unwrap(), [0; MFT_BLOCK_SIZE]);
        assert!(node.mft_block(1, 1).is_err());
        assert!(node.mft_block(MCAST_FDB_CAP as u32 / 32, 0).is_err());
    }

    #[test]
    fn test_guid_block_keeps_port_guid() {
        let node = switch();
        let mut next = 0x100;
        let (node_guid, ports) = node.assign_guids(&mut next);
        assert_eq!(node_guid, 0x101);
        assert_eq!(ports.len(), 4);
        assert!(ports.iter().all(|(_, guid)| *guid == node_guid));

        node.set_guid_block(1, 0, &[7; GUID_BLOCK_SIZE]).unwrap();
        let block = node.guid_block(1, 0).unwrap();
        assert_eq!(block[0], node_guid);
        assert_eq!(block[1], 7);
    }

    #[test]
    fn test_cr_space() {
        let node = switch();
        node.cr_map(0x100, 1);
        node.cr_map(0x104, 2);
        let words = node.cr_read(0x100, 3);
        assert_eq!(*words[0].as_ref().unwrap(), 1);
        assert_eq!(*words[1].as_ref().unwrap(), 2);
        assert!(matches!(words[2], Err(Error::UnmappedAddress(0x108))));

        let written = node.cr_write(0x104, &[5, 6]);
        assert!(written[0].is_ok());
        assert!(written[1].is_err());
        assert_eq!(*node.cr_read(0x104, 1)[0].as_ref().unwrap(), 5);
    }

    #[test]
    fn test_processor_registry() {
        let node = switch();
        node.register(Processor::Sma);
        node.register(Processor::Pma);
        let _receiver = node.attach_client(1, Filter::class(class::SUBN_LID)).unwrap();
        assert_eq!(node.clients(), vec![(1, Filter::class(class::SUBN_LID))]);
        assert_eq!(node.detach_clients(1), 1);
        assert!(node.clients().is_empty());

        // No processor for the vendor class
        let mad = Mad::new(class::VENDOR, method::GET, attribute::CR_SPACE, 0);
        assert!(matches!(
            node.process_mad(1, &mad),
            Err(Error::NoProcessor { class: 0x09, .. })
        ));
    }

    #[test]
    fn test_error_rate_validation() {
        let node = switch();
        let hold = NonZeroU32::new(3);
        assert!(node.set_error_rate(1, 0.5, 2.0, hold).is_ok());
        assert_eq!(node.error_profile(1).unwrap().rate(), 0.5);
        assert_eq!(node.error_profile(1).unwrap().hold(), hold);
        assert!(node.set_error_rate(1, 2.0, 0.0, None).is_err());
        assert_eq!(node.error_profile(1).unwrap().rate(), 0.5);
        assert_eq!(node.error_profile(1).unwrap().hold(), hold);
    }
}
