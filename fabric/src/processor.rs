//! Attribute processors invoked when a MAD is delivered to a node.
//!
//! Processors are registered per management class and run, in registration order, with
//! the node lock held. They answer through [Outgoing] MADs which the caller dispatches
//! once the lock is released.

use crate::{
    mad::{attribute, class, method, status, CountersAttribute, Mad, Payload},
    node::Attributes,
    port::PortCounters,
    Error,
};
use futures::channel::mpsc;
use tracing::{debug, trace, warn};

/// Mask of the CR-space word count carried in the attribute modifier.
const CR_LENGTH_MASK: u32 = 0x3F;

/// A MAD a processor wants sent from its node.
#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    /// Port of the node the MAD leaves from.
    pub port: u8,
    pub mad: Mad,
}

/// Node state handed to a processor.
pub(crate) struct Context<'a> {
    pub(crate) attributes: &'a mut Attributes,
    pub(crate) counters: &'a [PortCounters],
}

/// Selects which MADs a client receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Filter {
    pub class: u8,
    pub method: Option<u8>,
    pub attribute: Option<u16>,
}

impl Filter {
    /// Match every MAD of `class`.
    pub fn class(class: u8) -> Self {
        Self {
            class,
            method: None,
            attribute: None,
        }
    }

    pub fn with_method(mut self, method: u8) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_attribute(mut self, attribute: u16) -> Self {
        self.attribute = Some(attribute);
        self
    }

    pub fn matches(&self, mad: &Mad) -> bool {
        mad.header.mgmt_class == self.class
            && self.method.map_or(true, |method| method == mad.header.method)
            && self
                .attribute
                .map_or(true, |attribute| attribute == mad.header.attribute_id)
    }
}

/// Forwards matching MADs to an attached client.
#[derive(Clone, Debug)]
pub struct Client {
    port: u8,
    filter: Filter,
    sender: mpsc::UnboundedSender<Mad>,
}

/// The processors a node can host.
#[derive(Clone, Debug)]
pub enum Processor {
    /// Subnet management agent (LID and direct routed SMPs).
    Sma,
    /// Performance management agent.
    Pma,
    /// Vendor-specific agent (CR-space access).
    VendorSpecific,
    /// Client forwarding.
    Client(Client),
}

impl Processor {
    pub fn client(port: u8, filter: Filter, sender: mpsc::UnboundedSender<Mad>) -> Self {
        Processor::Client(Client {
            port,
            filter,
            sender,
        })
    }

    /// Management classes this processor is registered for.
    pub fn classes(&self) -> Vec<u8> {
        match self {
            Processor::Sma => vec![class::SUBN_LID, class::SUBN_DIRECTED_ROUTE],
            Processor::Pma => vec![class::PERF],
            Processor::VendorSpecific => vec![class::VENDOR, class::VENDOR_EXT],
            Processor::Client(client) => vec![client.filter.class],
        }
    }

    /// Port and filter of a client binding.
    pub fn binding(&self) -> Option<(u8, Filter)> {
        match self {
            Processor::Client(client) => Some((client.port, client.filter)),
            _ => None,
        }
    }

    pub(crate) fn client_port(&self) -> Option<u8> {
        self.binding().map(|(port, _)| port)
    }

    /// Returns true if the client side of a binding has gone away.
    pub(crate) fn is_closed(&self) -> bool {
        match self {
            Processor::Client(client) => client.sender.is_closed(),
            _ => false,
        }
    }

    pub(crate) fn process(
        &self,
        context: &mut Context<'_>,
        in_port: u8,
        mad: &Mad,
    ) -> Vec<Outgoing> {
        match self {
            Processor::Sma => subnet_management(context, in_port, mad),
            Processor::Pma => performance_management(context, in_port, mad),
            Processor::VendorSpecific => vendor_specific(context, in_port, mad),
            Processor::Client(client) => {
                forward(client, context, in_port, mad);
                Vec::new()
            }
        }
    }
}

fn status_of(err: Error) -> u16 {
    match err {
        Error::NotSwitch(_) => status::UNSUP_METHOD_ATTR,
        _ => status::INVALID_FIELD,
    }
}

fn port_number(value: u32) -> Result<u8, u16> {
    u8::try_from(value).map_err(|_| status::INVALID_FIELD)
}

fn respond(in_port: u8, mad: &Mad, result: Result<Payload, u16>) -> Outgoing {
    let (status, payload) = match result {
        Ok(payload) => (status::OK, payload),
        Err(status) => (status, Payload::Empty),
    };
    Outgoing {
        port: in_port,
        mad: mad.response(status, payload),
    }
}

fn subnet_management(context: &mut Context<'_>, in_port: u8, mad: &Mad) -> Vec<Outgoing> {
    let method = mad.header.method;

    // Responses and traps are for clients
    if mad.is_response() || method == method::TRAP {
        return Vec::new();
    }
    if method == method::TRAP_REPRESS {
        debug!(node = %context.attributes.name, "trap repressed");
        return Vec::new();
    }

    // A set must carry the protecting key when one is configured
    let key_port = if context.attributes.is_switch() { 0 } else { in_port };
    let m_key = context
        .attributes
        .port(key_port)
        .map(|port| port.info.m_key)
        .unwrap_or(0);
    if method == method::SET && m_key != 0 && mad.smp.m_key != m_key {
        warn!(
            node = %context.attributes.name,
            port = in_port,
            attribute = mad.header.attribute_id,
            "ignoring set with mismatched m_key"
        );
        return Vec::new();
    }

    let mut traps = Vec::new();
    let result = subnet_attribute(context, in_port, mad, &mut traps);
    let mut outgoing = vec![respond(in_port, mad, result)];
    outgoing.extend(traps);
    outgoing
}

fn subnet_attribute(
    context: &mut Context<'_>,
    in_port: u8,
    mad: &Mad,
    traps: &mut Vec<Outgoing>,
) -> Result<Payload, u16> {
    let set = match mad.header.method {
        method::GET => false,
        method::SET => true,
        _ => return Err(status::UNSUP_METHOD_ATTR),
    };
    let attributes = &mut *context.attributes;
    let switch = attributes.is_switch();
    let modifier = mad.header.attribute_modifier;
    match mad.header.attribute_id {
        attribute::NODE_DESC if !set => {
            Ok(Payload::NodeDescription(attributes.description.clone()))
        }
        attribute::NODE_INFO if !set => attributes
            .node_info(in_port)
            .map(Payload::NodeInfo)
            .map_err(status_of),
        attribute::PORT_INFO => {
            let port = if !switch && modifier == 0 {
                in_port
            } else {
                port_number(modifier)?
            };
            if set {
                let Payload::PortInfo(requested) = &mad.payload else {
                    return Err(status::INVALID_FIELD);
                };
                let (_, trap) = attributes
                    .update_port_info(context.counters, port, requested)
                    .map_err(status_of)?;
                traps.extend(trap.map(|mad| Outgoing { port: 0, mad }));
            }
            attributes
                .port_info(port)
                .map(Payload::PortInfo)
                .map_err(status_of)
        }
        attribute::SWITCH_INFO => {
            if set {
                let Payload::SwitchInfo(requested) = &mad.payload else {
                    return Err(status::INVALID_FIELD);
                };
                attributes.set_switch_info(requested).map_err(status_of)?;
            }
            attributes
                .switch_info()
                .map(Payload::SwitchInfo)
                .map_err(status_of)
        }
        attribute::LIN_FWD_TBL => {
            if set {
                let Payload::LinearForwarding(block) = &mad.payload else {
                    return Err(status::INVALID_FIELD);
                };
                attributes
                    .set_lft_block(modifier, block)
                    .map_err(status_of)?;
            }
            attributes
                .lft_block(modifier)
                .map(Payload::LinearForwarding)
                .map_err(status_of)
        }
        attribute::MCAST_FWD_TBL => {
            let block = modifier & 0x1FF;
            let position = ((modifier >> 28) & 0xF) as u8;
            if set {
                let Payload::MulticastForwarding(entries) = &mad.payload else {
                    return Err(status::INVALID_FIELD);
                };
                attributes
                    .set_mft_block(block, position, entries)
                    .map_err(status_of)?;
            }
            attributes
                .mft_block(block, position)
                .map(Payload::MulticastForwarding)
                .map_err(status_of)
        }
        attribute::P_KEY_TABLE => {
            let port = if switch {
                port_number(modifier >> 16)?
            } else {
                in_port
            };
            let block = modifier & 0xFFFF;
            if set {
                let Payload::PKeys(entries) = &mad.payload else {
                    return Err(status::INVALID_FIELD);
                };
                attributes
                    .set_pkey_block(port, block, entries)
                    .map_err(status_of)?;
            }
            attributes
                .pkey_block(port, block)
                .map(Payload::PKeys)
                .map_err(status_of)
        }
        attribute::GUID_INFO => {
            if set {
                let Payload::Guids(entries) = &mad.payload else {
                    return Err(status::INVALID_FIELD);
                };
                attributes
                    .set_guid_block(in_port, modifier, entries)
                    .map_err(status_of)?;
            }
            attributes
                .guid_block(in_port, modifier)
                .map(Payload::Guids)
                .map_err(status_of)
        }
        attribute::SLVL_TABLE => {
            let (input, output) = if switch {
                (port_number((modifier >> 8) & 0xFF)?, port_number(modifier & 0xFF)?)
            } else {
                (in_port, in_port)
            };
            if set {
                let Payload::SlToVl(table) = &mad.payload else {
                    return Err(status::INVALID_FIELD);
                };
                attributes
                    .set_sl2vl(input, output, table)
                    .map_err(status_of)?;
            }
            attributes
                .sl2vl(input, output)
                .map(Payload::SlToVl)
                .map_err(status_of)
        }
        attribute::VL_ARBITRATION => {
            let block = (modifier >> 16) & 0xFF;
            let port = if switch {
                port_number(modifier & 0xFF)?
            } else {
                in_port
            };
            if set {
                let Payload::VlArbitration(entries) = &mad.payload else {
                    return Err(status::INVALID_FIELD);
                };
                attributes
                    .set_vl_arb(port, block, entries)
                    .map_err(status_of)?;
            }
            attributes
                .vl_arb(port, block)
                .map(Payload::VlArbitration)
                .map_err(status_of)
        }
        _ => Err(status::UNSUP_METHOD_ATTR),
    }
}

fn performance_management(context: &mut Context<'_>, in_port: u8, mad: &Mad) -> Vec<Outgoing> {
    if mad.is_response() {
        return Vec::new();
    }
    let set = mad.header.method == method::SET;
    let result = match (mad.header.method, mad.header.attribute_id, &mad.payload) {
        (method::GET | method::SET, attribute::PORT_COUNTERS, Payload::PortCounters(request)) => {
            match context.counters.get(request.port_select as usize) {
                Some(counters) => {
                    if set {
                        counters.store(&request.counters, request.counter_select);
                    }
                    Ok(Payload::PortCounters(CountersAttribute {
                        port_select: request.port_select,
                        counter_select: request.counter_select,
                        counters: counters.snapshot(),
                    }))
                }
                None => Err(status::INVALID_FIELD),
            }
        }
        (method::GET | method::SET, attribute::PORT_COUNTERS, _) => Err(status::INVALID_FIELD),
        _ => Err(status::UNSUP_METHOD_ATTR),
    };
    vec![respond(in_port, mad, result)]
}

/// Decode the CR-space start address and word count from an attribute modifier.
fn cr_range(modifier: u32) -> (u32, u32) {
    let start = (modifier & 0xFFFF) | ((modifier & 0xFF00_0000) >> 8);
    let len = (modifier >> 16) & CR_LENGTH_MASK;
    (start, len)
}

fn vendor_specific(context: &mut Context<'_>, in_port: u8, mad: &Mad) -> Vec<Outgoing> {
    if mad.is_response() {
        return Vec::new();
    }

    // The second vendor range is acknowledged, echoing any opaque data
    if mad.header.mgmt_class != class::VENDOR {
        let data = match &mad.payload {
            Payload::Raw(data) => Payload::Raw(data.clone()),
            _ => Payload::Empty,
        };
        return vec![respond(in_port, mad, Ok(data))];
    }
    let attributes = &mut *context.attributes;
    let (start, len) = cr_range(mad.header.attribute_modifier);
    let address = |i: u32| start.wrapping_add(4 * i);
    let mut failed = false;
    match (mad.header.method, mad.header.attribute_id) {
        (method::GET, attribute::CR_SPACE) => {}
        (method::SET, attribute::CR_SPACE) => {
            let Payload::CrSpace(words) = &mad.payload else {
                return vec![respond(in_port, mad, Err(status::INVALID_FIELD))];
            };
            for (i, word) in words.iter().take(len as usize).enumerate() {
                if let Err(err) = attributes.cr_write(address(i as u32), *word) {
                    debug!(node = %attributes.name, ?err, "cr space write failed");
                    failed = true;
                }
            }
        }
        _ => return vec![respond(in_port, mad, Err(status::UNSUP_METHOD_ATTR))],
    }
    let words = (0..len)
        .map(|i| {
            attributes.cr_read(address(i)).unwrap_or_else(|_| {
                failed = true;
                0
            })
        })
        .collect();
    let status = if failed { status::INVALID_FIELD } else { status::OK };
    vec![Outgoing {
        port: in_port,
        mad: mad.response(status, Payload::CrSpace(words)),
    }]
}

fn forward(client: &Client, context: &Context<'_>, in_port: u8, mad: &Mad) {
    // A client bound to a port only sees traffic arriving there
    if client.port != 0 && in_port != 0 && in_port != client.port {
        return;
    }
    if !client.filter.matches(mad) {
        return;
    }
    if client.sender.unbounded_send(mad.clone()).is_err() {
        debug!(node = %context.attributes.name, port = client.port, "client gone");
        return;
    }
    trace!(
        node = %context.attributes.name,
        port = client.port,
        method = mad.header.method,
        attribute = mad.header.attribute_id,
        "forwarded to client"
    );
}
