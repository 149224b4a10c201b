//! Service Access Points
//!
//! Plain traits injected into the protocol entities at construction. The
//! owner of an entity decides what sits behind each seam: the real adjacent
//! layer, a simulated radio leg, or a recorder in tests.

use bytes::Bytes;
use common::types::{CellId, Earfcn, Rnti};

use crate::message_types::{
    RadioResourceConfigDedicated, ReceivePdcpSduParameters, RrcConnectionReconfiguration,
    TransmitPdcpPduParameters,
};

/// Receiver of in-order SDUs above PDCP
pub trait UpperLayer {
    /// Called once per delivered SDU, in increasing COUNT order
    fn deliver_to_upper_layer(&mut self, params: ReceivePdcpSduParameters);
}

/// RLC entity of one radio leg, as seen from PDCP
pub trait LowerLayer {
    /// Hand a PDCP PDU to the leg for transmission
    fn transmit_to_lower_layer(&mut self, params: TransmitPdcpPduParameters);
}

/// Access-stratum (RRC) provider of one radio leg, as seen from NAS
pub trait AsSapProvider {
    /// Start searching for a cell on the given carrier
    fn start_cell_selection(&mut self, earfcn: Earfcn);

    /// Camp on a specific cell
    fn force_camped_on_enb(&mut self, cell_id: CellId, earfcn: Earfcn);

    /// Request RRC connection establishment
    fn connect(&mut self);

    /// Send an uplink packet on the given EPS bearer
    fn send_data(&mut self, packet: Bytes, bid: u8);

    /// Release the RRC connection
    fn disconnect(&mut self);

    /// Install the closed subscriber group white list
    fn set_csg_white_list(&mut self, csg_id: u32);

    /// Mark whether this leg carries the additional secondary PHY
    fn set_additional_leg(&mut self, _additional: bool) {}

    /// Tell the primary leg a secondary cell is available
    fn notify_secondary_cell_connected(&mut self, _rnti: Rnti, _cell_id: CellId) {}

    /// Tell the primary leg both secondary legs are attached
    fn notify_dual_secondary_connected(
        &mut self,
        _first_rnti: Rnti,
        _second_rnti: Rnti,
        _first_cell: CellId,
        _second_cell: CellId,
    ) {
    }

    /// Relay a secondary-cell handover to the primary leg
    fn notify_secondary_cell_handover(
        &mut self,
        _old_rnti: Rnti,
        _new_rnti: Rnti,
        _cell_id: CellId,
        _config: RadioResourceConfigDedicated,
    ) {
    }

    /// Deliver an RRC reconfiguration to a secondary leg
    fn send_rrc_reconfiguration(&mut self, _msg: RrcConnectionReconfiguration) {}
}
