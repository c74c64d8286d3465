//! Management datagrams (MADs) and the attributes they carry.
//!
//! The layout mirrors the fields management software inspects (address, common header,
//! and the subnet-management specific direct-route section) without committing to the
//! exact wire encoding. Attribute contents are carried as a typed [Payload].

use crate::{
    node::{
        GuidBlock, LftBlock, MftBlock, NodeInfo, PKeyBlock, SlToVlTable, SwitchInfo, VlArbBlock,
    },
    port::{CounterSnapshot, PortInfo},
};
use bytes::Bytes;

/// Management classes understood by the simulator.
pub mod class {
    /// Subnet management, LID routed.
    pub const SUBN_LID: u8 = 0x01;
    /// Performance management.
    pub const PERF: u8 = 0x04;
    /// First vendor-specific class.
    pub const VENDOR: u8 = 0x09;
    /// Second vendor-specific class.
    pub const VENDOR_EXT: u8 = 0x0A;
    /// Subnet management, direct routed.
    pub const SUBN_DIRECTED_ROUTE: u8 = 0x81;
}

/// MAD methods.
pub mod method {
    pub const GET: u8 = 0x01;
    pub const SET: u8 = 0x02;
    pub const TRAP: u8 = 0x05;
    pub const TRAP_REPRESS: u8 = 0x07;
    pub const GET_RESP: u8 = 0x81;
    /// Set on every response method.
    pub const RESP_MASK: u8 = 0x80;
}

/// Attribute identifiers.
pub mod attribute {
    pub const NOTICE: u16 = 0x0002;
    pub const NODE_DESC: u16 = 0x0010;
    pub const NODE_INFO: u16 = 0x0011;
    pub const SWITCH_INFO: u16 = 0x0012;
    pub const GUID_INFO: u16 = 0x0014;
    pub const PORT_INFO: u16 = 0x0015;
    pub const P_KEY_TABLE: u16 = 0x0016;
    pub const SLVL_TABLE: u16 = 0x0017;
    pub const VL_ARBITRATION: u16 = 0x0018;
    pub const LIN_FWD_TBL: u16 = 0x0019;
    pub const MCAST_FWD_TBL: u16 = 0x001B;

    /// Performance management port counters (shares its value with SwitchInfo
    /// but lives in a different class).
    pub const PORT_COUNTERS: u16 = 0x0012;

    /// Vendor-specific configuration (CR) space access.
    pub const CR_SPACE: u16 = 0x0050;
}

/// MAD status values.
pub mod status {
    pub const OK: u16 = 0x0000;
    pub const UNSUP_METHOD_ATTR: u16 = 0x000C;
    pub const INVALID_FIELD: u16 = 0x001C;
    /// Direction bit of a direct-routed SMP (set on the returning leg).
    pub const DIRECTION: u16 = 0x8000;
}

/// LID that matches any port (used to mark direct-route end points).
pub const PERMISSIVE_LID: u16 = 0xFFFF;

/// Maximum number of hops a direct-route path can describe.
pub const MAX_HOPS: usize = 64;

/// Number of bytes a MAD occupies on the wire (used for data counters).
pub const MAD_SIZE: u64 = 256;

/// Addressing information that accompanies a MAD.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Address {
    pub sl: u8,
    pub pkey_index: u16,
    pub slid: u16,
    pub dlid: u16,
    pub sqpn: u32,
    pub dqpn: u32,
}

/// The common MAD header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub base_version: u8,
    pub mgmt_class: u8,
    pub class_version: u8,
    pub method: u8,
    pub status: u16,
    pub class_specific: u16,
    pub transaction_id: u64,
    pub attribute_id: u16,
    pub attribute_modifier: u32,
}

/// Subnet-management specific fields (only meaningful for SMPs).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Smp {
    pub m_key: u64,
    pub hop_pointer: u8,
    pub hop_count: u8,
    pub dr_slid: u16,
    pub dr_dlid: u16,
    pub initial_path: [u8; MAX_HOPS],
    pub return_path: [u8; MAX_HOPS],
}

impl Default for Smp {
    fn default() -> Self {
        Self {
            m_key: 0,
            hop_pointer: 0,
            hop_count: 0,
            dr_slid: PERMISSIVE_LID,
            dr_dlid: PERMISSIVE_LID,
            initial_path: [0; MAX_HOPS],
            return_path: [0; MAX_HOPS],
        }
    }
}

/// Notice attribute (only the generic trap fields the simulator emits).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Notice {
    pub generic: bool,
    pub notice_type: u8,
    pub producer_type: u32,
    pub trap_number: u16,
    pub issuer_lid: u16,
    pub toggle_count: u16,
    pub switch_lid: u16,
}

/// Performance management port counters attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CountersAttribute {
    pub port_select: u8,
    pub counter_select: u16,
    pub counters: CounterSnapshot,
}

/// Attribute data carried by a MAD.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Empty,
    NodeDescription(String),
    NodeInfo(NodeInfo),
    PortInfo(PortInfo),
    SwitchInfo(SwitchInfo),
    LinearForwarding(LftBlock),
    MulticastForwarding(MftBlock),
    PKeys(PKeyBlock),
    Guids(GuidBlock),
    SlToVl(SlToVlTable),
    VlArbitration(VlArbBlock),
    Notice(Notice),
    PortCounters(CountersAttribute),
    CrSpace(Vec<u32>),
    /// Opaque attribute data (second vendor class).
    Raw(Bytes),
}

/// A management datagram.
#[derive(Clone, Debug, PartialEq)]
pub struct Mad {
    pub address: Address,
    pub header: Header,
    pub smp: Smp,
    pub payload: Payload,
}

impl Mad {
    /// Create a request of the given class, method and attribute.
    pub fn new(mgmt_class: u8, method: u8, attribute_id: u16, attribute_modifier: u32) -> Self {
        Self {
            address: Address::default(),
            header: Header {
                base_version: 1,
                mgmt_class,
                class_version: 1,
                method,
                status: status::OK,
                class_specific: 0,
                transaction_id: 0,
                attribute_id,
                attribute_modifier,
            },
            smp: Smp::default(),
            payload: Payload::Empty,
        }
    }

    /// Create a direct-routed SMP that follows `path` (the out port taken at each hop).
    ///
    /// An empty path addresses the local node.
    pub fn direct_routed(
        method: u8,
        attribute_id: u16,
        attribute_modifier: u32,
        path: &[u8],
    ) -> Self {
        let mut mad = Self::new(
            class::SUBN_DIRECTED_ROUTE,
            method,
            attribute_id,
            attribute_modifier,
        );
        let hops = path.len().min(MAX_HOPS - 1);
        mad.smp.initial_path[1..=hops].copy_from_slice(&path[..hops]);
        mad.smp.hop_count = hops as u8;
        mad.address.slid = PERMISSIVE_LID;
        mad.address.dlid = PERMISSIVE_LID;
        mad
    }

    /// Set the destination LID.
    pub fn with_dlid(mut self, dlid: u16) -> Self {
        self.address.dlid = dlid;
        self
    }

    /// Set the source LID.
    pub fn with_slid(mut self, slid: u16) -> Self {
        self.address.slid = slid;
        self
    }

    /// Set the transaction identifier.
    pub fn with_transaction_id(mut self, transaction_id: u64) -> Self {
        self.header.transaction_id = transaction_id;
        self
    }

    /// Set the attribute payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Set the M_Key carried by an SMP.
    pub fn with_m_key(mut self, m_key: u64) -> Self {
        self.smp.m_key = m_key;
        self
    }

    /// Returns true if the MAD must be routed hop-by-hop along its direct-route path.
    pub fn is_direct_routed(&self) -> bool {
        self.header.mgmt_class == class::SUBN_DIRECTED_ROUTE
    }

    /// Returns true if the MAD travels on the management virtual lane (VL15) when LID routed.
    pub fn is_vl15(&self) -> bool {
        self.header.mgmt_class == class::SUBN_LID
    }

    /// Returns true if a direct-routed MAD is on its returning leg.
    pub fn is_returning(&self) -> bool {
        self.header.status & status::DIRECTION != 0
    }

    /// Returns true if the method is a response.
    pub fn is_response(&self) -> bool {
        self.header.method & method::RESP_MASK != 0
    }

    /// Build the response to this request.
    ///
    /// LIDs are swapped, the method becomes the matching response method and, for
    /// direct-routed requests, the direction bit is set and the DR LIDs are swapped so
    /// the reply retraces the recorded return path.
    pub fn response(&self, status: u16, payload: Payload) -> Self {
        let mut response = self.clone();
        response.address.slid = self.address.dlid;
        response.address.dlid = self.address.slid;
        response.header.method = if self.header.method == method::SET {
            method::GET_RESP
        } else {
            self.header.method | method::RESP_MASK
        };
        response.header.status = status;
        if self.is_direct_routed() {
            response.header.status |= status::DIRECTION;
            response.smp.dr_slid = self.smp.dr_dlid;
            response.smp.dr_dlid = self.smp.dr_slid;
        }
        response.payload = payload;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_routed_path() {
        let mad = Mad::direct_routed(method::GET, attribute::NODE_INFO, 0, &[1, 3, 2]);
        assert!(mad.is_direct_routed());
        assert!(!mad.is_returning());
        assert_eq!(mad.smp.hop_count, 3);
        assert_eq!(mad.smp.hop_pointer, 0);
        assert_eq!(&mad.smp.initial_path[..4], &[0, 1, 3, 2]);
        assert_eq!(mad.smp.dr_slid, PERMISSIVE_LID);
        assert_eq!(mad.smp.dr_dlid, PERMISSIVE_LID);
    }

    #[test]
    fn test_response_lid_routed() {
        let request = Mad::new(class::SUBN_LID, method::GET, attribute::PORT_INFO, 1)
            .with_slid(1)
            .with_dlid(7)
            .with_transaction_id(42);
        let response = request.response(status::OK, Payload::Empty);
        assert_eq!(response.address.slid, 7);
        assert_eq!(response.address.dlid, 1);
        assert_eq!(response.header.method, method::GET_RESP);
        assert_eq!(response.header.transaction_id, 42);
        assert!(!response.is_returning());
        assert!(response.is_response());
    }

    #[test]
    fn test_response_to_set() {
        let request = Mad::new(class::PERF, method::SET, attribute::PORT_COUNTERS, 0);
        let response = request.response(status::INVALID_FIELD, Payload::Empty);
        assert_eq!(response.header.method, method::GET_RESP);
        assert_eq!(response.header.status, status::INVALID_FIELD);
    }

    #[test]
    fn test_response_direct_routed() {
        let mut request = Mad::direct_routed(method::GET, attribute::NODE_DESC, 0, &[2]);
        request.smp.dr_dlid = 9;
        let response = request.response(status::OK, Payload::NodeDescription("sw".into()));
        assert!(response.is_returning());
        assert_eq!(response.smp.dr_slid, 9);
        assert_eq!(response.smp.dr_dlid, PERMISSIVE_LID);
        assert_eq!(response.header.status & !status::DIRECTION, status::OK);
    }

    #[test]
    fn test_vl15_only_for_lid_routed_smp() {
        assert!(Mad::new(class::SUBN_LID, method::GET, 0, 0).is_vl15());
        assert!(!Mad::new(class::PERF, method::GET, 0, 0).is_vl15());
        let direct = Mad::new(class::SUBN_DIRECTED_ROUTE, method::GET, 0, 0);
        assert!(!direct.is_vl15());
    }
}
