//! Port state, counters and the per-port loss model.

use crate::{random::Random, Error};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    num::NonZeroU32,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

/// Logical link state of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Down,
    Init,
    Armed,
    Active,
}

impl PortState {
    /// Returns true if the link may move from `self` to `next`.
    pub fn can_transition(self, next: PortState) -> bool {
        use PortState::*;
        matches!(
            (self, next),
            (Down, Init)
                | (Init, Down)
                | (Init, Armed)
                | (Armed, Down)
                | (Armed, Active)
                | (Active, Down)
                | (Active, Armed)
        )
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortState::Down => "DOWN",
            PortState::Init => "INIT",
            PortState::Armed => "ARMED",
            PortState::Active => "ACTIVE",
        };
        f.write_str(name)
    }
}

impl FromStr for PortState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "down" | "1" => Ok(PortState::Down),
            "init" | "2" => Ok(PortState::Init),
            "armed" | "3" => Ok(PortState::Armed),
            "active" | "4" => Ok(PortState::Active),
            _ => Err(Error::InvalidState(s.to_string())),
        }
    }
}

/// Physical link state of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhysState {
    Sleep,
    Polling,
    Disabled,
    Training,
    LinkUp,
    ErrorRecovery,
}

impl fmt::Display for PhysState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhysState::Sleep => "SLEEP",
            PhysState::Polling => "POLLING",
            PhysState::Disabled => "DISABLED",
            PhysState::Training => "TRAINING",
            PhysState::LinkUp => "LINKUP",
            PhysState::ErrorRecovery => "ERROR_RECOVERY",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkWidth {
    X1,
    X4,
    X8,
    X12,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkSpeed {
    Sdr,
    Ddr,
    Qdr,
}

/// Subnet-management view of a port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub m_key: u64,
    pub gid_prefix: u64,
    pub base_lid: u16,
    pub master_sm_lid: u16,
    pub capability_mask: u32,
    pub lmc: u8,
    pub local_port: u8,
    pub state: PortState,
    pub phys_state: PhysState,
    pub width: LinkWidth,
    pub speed: LinkSpeed,
    pub neighbor_mtu: u8,
    pub m_key_lease_period: u16,
}

impl PortInfo {
    pub fn new(local_port: u8) -> Self {
        Self {
            m_key: 0,
            gid_prefix: 0xfe80_0000_0000_0000,
            base_lid: 0,
            master_sm_lid: 0,
            capability_mask: 0,
            lmc: 0,
            local_port,
            state: PortState::Down,
            phys_state: PhysState::Polling,
            width: LinkWidth::X4,
            speed: LinkSpeed::Sdr,
            neighbor_mtu: 4,
            m_key_lease_period: 0,
        }
    }

    /// Returns true if `lid` falls in the range `base_lid .. base_lid + 2^lmc`.
    pub fn answers(&self, lid: u16) -> bool {
        let base = self.base_lid as u32;
        let span = 1u32 << self.lmc.min(7);
        base != 0 && (base..base + span).contains(&(lid as u32))
    }
}

/// Point-in-time copy of a port's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub symbol_errors: u64,
    pub link_error_recovery: u64,
    pub link_downed: u64,
    pub rcv_errors: u64,
    pub rcv_remote_physical_errors: u64,
    pub xmit_discards: u64,
    pub xmit_data: u64,
    pub rcv_data: u64,
    pub xmit_packets: u64,
    pub rcv_packets: u64,
}

/// Bits of the performance-management counter select mask.
pub mod select {
    pub const SYMBOL_ERRORS: u16 = 0x0001;
    pub const LINK_ERROR_RECOVERY: u16 = 0x0002;
    pub const LINK_DOWNED: u16 = 0x0004;
    pub const RCV_ERRORS: u16 = 0x0008;
    pub const RCV_REMOTE_PHYSICAL_ERRORS: u16 = 0x0010;
    pub const XMIT_DISCARDS: u16 = 0x0040;
    pub const XMIT_DATA: u16 = 0x1000;
    pub const RCV_DATA: u16 = 0x2000;
    pub const XMIT_PACKETS: u16 = 0x4000;
    pub const RCV_PACKETS: u16 = 0x8000;
    pub const ALL: u16 = 0xFFFF;
}

/// Traffic and error counters of one port.
///
/// Counters are atomics so the far end of a link can be credited without taking the
/// remote node's lock.
#[derive(Debug, Default)]
pub struct PortCounters {
    symbol_errors: AtomicU64,
    link_error_recovery: AtomicU64,
    link_downed: AtomicU64,
    rcv_errors: AtomicU64,
    rcv_remote_physical_errors: AtomicU64,
    xmit_discards: AtomicU64,
    xmit_data: AtomicU64,
    rcv_data: AtomicU64,
    xmit_packets: AtomicU64,
    rcv_packets: AtomicU64,
}

impl PortCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            symbol_errors: self.symbol_errors.load(Ordering::Relaxed),
            link_error_recovery: self.link_error_recovery.load(Ordering::Relaxed),
            link_downed: self.link_downed.load(Ordering::Relaxed),
            rcv_errors: self.rcv_errors.load(Ordering::Relaxed),
            rcv_remote_physical_errors: self.rcv_remote_physical_errors.load(Ordering::Relaxed),
            xmit_discards: self.xmit_discards.load(Ordering::Relaxed),
            xmit_data: self.xmit_data.load(Ordering::Relaxed),
            rcv_data: self.rcv_data.load(Ordering::Relaxed),
            xmit_packets: self.xmit_packets.load(Ordering::Relaxed),
            rcv_packets: self.rcv_packets.load(Ordering::Relaxed),
        }
    }

    /// Overwrite the counters selected by `mask` (see [select]).
    pub fn store(&self, values: &CounterSnapshot, mask: u16) {
        let fields = [
            (select::SYMBOL_ERRORS, &self.symbol_errors, values.symbol_errors),
            (
                select::LINK_ERROR_RECOVERY,
                &self.link_error_recovery,
                values.link_error_recovery,
            ),
            (select::LINK_DOWNED, &self.link_downed, values.link_downed),
            (select::RCV_ERRORS, &self.rcv_errors, values.rcv_errors),
            (
                select::RCV_REMOTE_PHYSICAL_ERRORS,
                &self.rcv_remote_physical_errors,
                values.rcv_remote_physical_errors,
            ),
            (select::XMIT_DISCARDS, &self.xmit_discards, values.xmit_discards),
            (select::XMIT_DATA, &self.xmit_data, values.xmit_data),
            (select::RCV_DATA, &self.rcv_data, values.rcv_data),
            (select::XMIT_PACKETS, &self.xmit_packets, values.xmit_packets),
            (select::RCV_PACKETS, &self.rcv_packets, values.rcv_packets),
        ];
        for (bit, counter, value) in fields {
            if mask & bit != 0 {
                counter.store(value, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn record_xmit(&self, bytes: u64) {
        self.xmit_packets.fetch_add(1, Ordering::Relaxed);
        self.xmit_data.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_rcv(&self, bytes: u64) {
        self.rcv_packets.fetch_add(1, Ordering::Relaxed);
        self.rcv_data.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self) {
        self.xmit_discards.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rcv_error(&self) {
        self.rcv_errors.fetch_add(1, Ordering::Relaxed);
        self.rcv_remote_physical_errors
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_link_change(&self) {
        self.link_error_recovery.fetch_add(1, Ordering::Relaxed);
        self.link_downed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bursty loss model of a port.
///
/// A pass/drop decision is held for a number of packets before it is re-rolled. The
/// hold is either fixed or drawn as `1 + 2 * u * variance` for a uniform `u`.
#[derive(Clone, Debug)]
pub struct ErrorProfile {
    rate: f64,
    variance: f64,
    fixed_hold: Option<NonZeroU32>,
    dropping: bool,
    remaining: u32,
    packets: u64,
}

impl Default for ErrorProfile {
    fn default() -> Self {
        Self {
            rate: 0.0,
            variance: 0.0,
            fixed_hold: None,
            dropping: false,
            remaining: 1,
            packets: 0,
        }
    }
}

impl ErrorProfile {
    /// Create a profile dropping with probability `rate` and hold variance `variance`.
    pub fn new(rate: f64, variance: f64) -> Result<Self, Error> {
        let mut profile = Self::default();
        profile.set_rate(rate)?;
        profile.set_variance(variance)?;
        Ok(profile)
    }

    /// Hold every decision for exactly `hold` packets, or for a random count drawn from
    /// the variance when `None`. The current decision streak is kept.
    pub fn set_hold(&mut self, hold: Option<NonZeroU32>) {
        self.fixed_hold = hold;
    }

    /// Change the drop probability. The current decision streak is kept.
    pub fn set_rate(&mut self, rate: f64) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(Error::InvalidRate(rate));
        }
        self.rate = rate;
        Ok(())
    }

    pub fn set_variance(&mut self, variance: f64) -> Result<(), Error> {
        if !variance.is_finite() || variance < 0.0 {
            return Err(Error::InvalidVariance(variance));
        }
        self.variance = variance;
        Ok(())
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn hold(&self) -> Option<NonZeroU32> {
        self.fixed_hold
    }

    /// Packets evaluated so far.
    pub fn packets(&self) -> u64 {
        self.packets
    }

    /// Decide whether the next packet is lost.
    pub fn is_dropped(&mut self, random: &Random) -> bool {
        self.packets = self.packets.wrapping_add(1);
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.remaining = match self.fixed_hold {
                Some(hold) => hold.get(),
                None => ((2.0 * random.uniform() * self.variance + 1.0) as u32).max(1),
            };
            self.dropping = self.rate > 0.0 && random.uniform() < self.rate;
        }
        self.dropping
    }
}
