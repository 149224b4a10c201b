//! Traffic Flow Templates
//!
//! Uplink packets are mapped to an EPS bearer by matching their IPv4
//! 5-tuple against the packet filters installed for each bearer. Bearer
//! id 0 means no filter matched.

use bytes::Bytes;
use common::types::Direction;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{debug, trace};

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// Fields of an IPv4 packet a filter can match on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub tos: u8,
}

impl FlowTuple {
    /// Parse the IPv4 header and, for TCP and UDP, the port numbers.
    /// Returns `None` for anything that is not a well-formed IPv4 packet.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < 20 || packet[0] >> 4 != 4 {
            return None;
        }
        let ihl = usize::from(packet[0] & 0x0f) * 4;
        if ihl < 20 || packet.len() < ihl {
            return None;
        }

        let protocol = packet[9];
        let (src_port, dst_port) = match protocol {
            PROTO_TCP | PROTO_UDP if packet.len() >= ihl + 4 => (
                u16::from_be_bytes([packet[ihl], packet[ihl + 1]]),
                u16::from_be_bytes([packet[ihl + 2], packet[ihl + 3]]),
            ),
            _ => (0, 0),
        };

        Some(Self {
            src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
            protocol,
            src_port,
            dst_port,
            tos: packet[1],
        })
    }
}

/// One packet filter of a TFT. The default filter matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketFilter {
    /// Directions the filter applies to
    pub direction: FilterDirection,
    pub remote_address: Ipv4Addr,
    pub remote_mask: Ipv4Addr,
    pub local_address: Ipv4Addr,
    pub local_mask: Ipv4Addr,
    pub remote_port_start: u16,
    pub remote_port_end: u16,
    pub local_port_start: u16,
    pub local_port_end: u16,
    pub type_of_service: u8,
    pub type_of_service_mask: u8,
}

impl Default for PacketFilter {
    fn default() -> Self {
        Self {
            direction: FilterDirection::Bidirectional,
            remote_address: Ipv4Addr::UNSPECIFIED,
            remote_mask: Ipv4Addr::UNSPECIFIED,
            local_address: Ipv4Addr::UNSPECIFIED,
            local_mask: Ipv4Addr::UNSPECIFIED,
            remote_port_start: 0,
            remote_port_end: u16::MAX,
            local_port_start: 0,
            local_port_end: u16::MAX,
            type_of_service: 0,
            type_of_service_mask: 0,
        }
    }
}

/// Serializable form of [`Direction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterDirection {
    Downlink,
    Uplink,
    Bidirectional,
}

impl From<FilterDirection> for Direction {
    fn from(d: FilterDirection) -> Self {
        match d {
            FilterDirection::Downlink => Direction::DOWNLINK,
            FilterDirection::Uplink => Direction::UPLINK,
            FilterDirection::Bidirectional => Direction::BIDIRECTIONAL,
        }
    }
}

fn masked_eq(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    u32::from(a) & mask == u32::from(b) & mask
}

impl PacketFilter {
    /// Match a packet travelling in `direction`. On the UE, uplink packets
    /// have the local address as source; downlink packets as destination.
    pub fn matches(&self, direction: Direction, flow: &FlowTuple) -> bool {
        if !Direction::from(self.direction).intersects(direction) {
            return false;
        }

        let (local, remote, local_port, remote_port) = if direction.contains(Direction::UPLINK) {
            (flow.src, flow.dst, flow.src_port, flow.dst_port)
        } else {
            (flow.dst, flow.src, flow.dst_port, flow.src_port)
        };

        masked_eq(remote, self.remote_address, self.remote_mask)
            && masked_eq(local, self.local_address, self.local_mask)
            && (self.remote_port_start..=self.remote_port_end).contains(&remote_port)
            && (self.local_port_start..=self.local_port_end).contains(&local_port)
            && flow.tos & self.type_of_service_mask
                == self.type_of_service & self.type_of_service_mask
    }
}

/// Packet filters of one bearer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficFlowTemplate {
    pub filters: Vec<PacketFilter>,
}

impl TrafficFlowTemplate {
    /// Template with a single match-all filter
    pub fn match_all() -> Self {
        Self {
            filters: vec![PacketFilter::default()],
        }
    }

    pub fn add(&mut self, filter: PacketFilter) {
        self.filters.push(filter);
    }

    pub fn matches(&self, direction: Direction, flow: &FlowTuple) -> bool {
        self.filters.iter().any(|f| f.matches(direction, flow))
    }
}

/// Maps packets to bearer ids through the installed templates
#[derive(Debug, Default)]
pub struct TftClassifier {
    /// (bearer id, template), in installation order
    templates: Vec<(u8, TrafficFlowTemplate)>,
}

impl TftClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the template of bearer `bid`
    pub fn add(&mut self, tft: TrafficFlowTemplate, bid: u8) {
        debug!("Installing TFT for bearer {} ({} filters)", bid, tft.filters.len());
        self.templates.push((bid, tft));
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Bearer id of the first template matching `packet`, or 0
    pub fn classify(&self, packet: &Bytes, direction: Direction) -> u8 {
        let Some(flow) = FlowTuple::parse(packet) else {
            trace!("Packet of {} bytes is not IPv4, unclassified", packet.len());
            return 0;
        };
        self.templates
            .iter()
            .find(|(_, tft)| tft.matches(direction, &flow))
            .map_or(0, |(bid, _)| *bid)
    }
}
