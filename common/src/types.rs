//! Common Types for the Multi-Connectivity UE
//!
//! Defines fundamental identifiers used throughout the UE protocol stack

use bitflags::bitflags;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Rnti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(pub u16);

impl CellId {
    /// Cell id 0 is never assigned to a real cell
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Downlink carrier frequency (EARFCN / NR-ARFCN)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Earfcn(pub u32);

/// International Mobile Subscriber Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Imsi(pub u64);

impl fmt::Display for Imsi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015}", self.0)
    }
}

/// Logical channel identity of a radio bearer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lcid(pub u8);

/// QoS Class Identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qci(pub u8);

impl Qci {
    /// Voice QCI
    pub const VOICE: Self = Self(1);
    /// Video QCI
    pub const VIDEO: Self = Self(2);
    /// Default bearer QCI
    pub const DEFAULT: Self = Self(9);
}

bitflags! {
    /// Traffic direction a packet filter applies to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Direction: u8 {
        const DOWNLINK = 0b01;
        const UPLINK = 0b10;
        const BIDIRECTIONAL = Self::DOWNLINK.bits() | Self::UPLINK.bits();
    }
}

/// Target of an RRC reconfiguration relayed by the primary leg during
/// secondary-cell handover
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum HandoverCase {
    /// Reconfiguration already consumed
    None = 0,
    /// Addressed to the second secondary leg
    SecondSecondary = 1,
    /// Addressed to the first secondary leg
    FirstSecondary = 2,
}
