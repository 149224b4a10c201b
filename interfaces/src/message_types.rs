//! Message Types crossing the SAPs
//!
//! Parameter blocks exchanged between PDCP and its neighbours, and the RRC
//! messages the NAS relays between radio legs.

use bytes::Bytes;
use common::types::{CellId, HandoverCase, Lcid, Rnti};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// PDCP PDU kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PdcpPduType {
    /// Data PDU
    Data,
    /// Control PDU
    Control,
}

/// PDCP header fields carried alongside the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdcpHeader {
    /// PDU type
    pub pdu_type: PdcpPduType,
    /// Sequence number
    pub sn: u32,
    /// Cell that transmitted the PDU, when known
    pub source_cell: Option<CellId>,
}

/// PDCP PDU as exchanged with RLC
#[derive(Debug, Clone)]
pub struct PdcpPdu {
    /// Header
    pub header: PdcpHeader,
    /// Sender timestamp (virtual time)
    pub tx_time: Duration,
    /// SDU payload
    pub payload: Bytes,
}

/// Parameters of a PDCP PDU handed to RLC
#[derive(Debug, Clone)]
pub struct TransmitPdcpPduParameters {
    /// RNTI of the leg the PDU is sent on
    pub rnti: Rnti,
    /// Logical channel
    pub lcid: Lcid,
    /// The PDU
    pub pdu: PdcpPdu,
}

/// Parameters of an SDU delivered above PDCP
#[derive(Debug, Clone)]
pub struct ReceivePdcpSduParameters {
    /// UE RNTI on the primary leg
    pub rnti: Rnti,
    /// Logical channel
    pub lcid: Lcid,
    /// COUNT (HFN and SN) of the SDU
    pub count: u64,
    /// SDU payload
    pub sdu: Bytes,
}

/// Dedicated data radio bearer entry of a reconfiguration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrbToAddMod {
    /// EPS bearer identity
    pub eps_bearer_identity: u8,
    /// DRB identity
    pub drb_identity: u8,
    /// Logical channel
    pub lcid: u8,
}

/// Dedicated radio resource configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadioResourceConfigDedicated {
    /// DRBs to add or modify
    pub drb_to_add_mod_list: Vec<DrbToAddMod>,
    /// DRBs to release
    pub drb_to_release_list: Vec<u8>,
}

/// RRC connection reconfiguration relayed through the primary leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RrcConnectionReconfiguration {
    /// Transaction identifier
    pub transaction_id: u8,
    /// Which secondary leg the message is for
    pub handover_case: HandoverCase,
    /// Target cell of the handover, if any
    pub target_cell: Option<CellId>,
    /// New RNTI on the target cell, if any
    pub new_rnti: Option<Rnti>,
    /// Radio resources to apply
    pub radio_resource_config: Option<RadioResourceConfigDedicated>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconfiguration_serialization() {
        let msg = RrcConnectionReconfiguration {
            transaction_id: 3,
            handover_case: HandoverCase::FirstSecondary,
            target_cell: Some(CellId(4)),
            new_rnti: Some(Rnti::new(0x4601)),
            radio_resource_config: Some(RadioResourceConfigDedicated {
                drb_to_add_mod_list: vec![DrbToAddMod {
                    eps_bearer_identity: 5,
                    drb_identity: 1,
                    lcid: 3,
                }],
                drb_to_release_list: vec![],
            }),
        };

        // Serialize
        let serialized = serde_json::to_string(&msg).unwrap();

        // Deserialize
        let deserialized: RrcConnectionReconfiguration = serde_json::from_str(&serialized).unwrap();

        assert_eq!(msg, deserialized);
    }
}
