//! PDCP reordering buffer
//!
//! Holds PDUs that arrived ahead of a gap, keyed by COUNT so that the
//! in-order run can be read straight off the front of the map.

use bytes::Bytes;
use common::types::CellId;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use super::sn::{RxWindow, SnPlacement, SnSpace};

/// A PDU waiting in (or leaving) the reordering buffer
#[derive(Debug, Clone)]
pub struct BufferedSdu {
    /// SN as received
    pub sn: u32,
    /// COUNT assigned on admission
    pub count: u64,
    /// SDU payload
    pub payload: Bytes,
    /// Arrival time (virtual)
    pub arrival: Duration,
    /// Cell the PDU came from
    pub source_cell: Option<CellId>,
}

/// Outcome of offering a PDU to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stored under the given COUNT
    Buffered { count: u64, placement: SnPlacement },
    /// Outside the receive window or already delivered
    Stale,
    /// An entry with the same SN is already buffered
    Duplicate,
}

/// Receive window plus the out-of-order PDUs it is holding
#[derive(Debug)]
pub struct ReorderingBuffer {
    window: RxWindow,
    pdus: BTreeMap<u64, BufferedSdu>,
}

impl ReorderingBuffer {
    /// Empty buffer with a fresh window
    pub fn new(space: SnSpace) -> Self {
        Self::with_window(RxWindow::new(space))
    }

    /// Empty buffer around an existing window
    pub fn with_window(window: RxWindow) -> Self {
        Self {
            window,
            pdus: BTreeMap::new(),
        }
    }

    pub fn window(&self) -> &RxWindow {
        &self.window
    }

    pub fn len(&self) -> usize {
        self.pdus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pdus.is_empty()
    }

    /// Whether a PDU with this SN is buffered
    pub fn contains_sn(&self, sn: u32) -> bool {
        self.pdus.values().any(|pdu| pdu.sn == sn)
    }

    /// COUNTs currently buffered, ascending
    pub fn buffered_counts(&self) -> Vec<u64> {
        self.pdus.keys().copied().collect()
    }

    /// COUNT of the last SDU handed up
    pub fn last_delivered(&self) -> Option<u64> {
        self.window.last_delivered()
    }

    /// COUNT the receiver is waiting for next
    pub fn next_expected_count(&self) -> u64 {
        self.window.next_expected_count()
    }

    /// Classify `sn` and store it. Rejected PDUs leave the window and the
    /// buffer untouched.
    pub fn admit(
        &mut self,
        sn: u32,
        payload: Bytes,
        arrival: Duration,
        source_cell: Option<CellId>,
    ) -> Admission {
        if self.window.is_stale(sn) {
            debug!(
                "Discarding stale SN {} (last delivered {:?}, next expected {})",
                sn,
                self.window.last_delivered(),
                self.window.next_expected_sn()
            );
            return Admission::Stale;
        }

        if self.contains_sn(sn) {
            debug!("Discarding duplicate SN {}", sn);
            return Admission::Duplicate;
        }

        let Some(located) = self.window.receive(sn) else {
            debug!("Discarding SN {}: COUNT already delivered", sn);
            return Admission::Stale;
        };

        trace!(
            "Buffered SN {} as COUNT {} ({:?}), hfn now {}",
            sn,
            located.count,
            located.placement,
            self.window.hfn()
        );
        self.pdus.insert(
            located.count,
            BufferedSdu {
                sn,
                count: located.count,
                payload,
                arrival,
                source_cell,
            },
        );

        Admission::Buffered {
            count: located.count,
            placement: located.placement,
        }
    }

    /// Remove and return the contiguous run starting right after the last
    /// delivered COUNT. Stops at the first gap.
    pub fn drain_in_order(&mut self) -> Vec<BufferedSdu> {
        let mut run = Vec::new();
        while let Some(entry) = self.pdus.first_entry() {
            if *entry.key() != self.window.next_deliverable() {
                break;
            }
            let pdu = entry.remove();
            self.window.mark_delivered(pdu.count);
            run.push(pdu);
        }
        run
    }

    /// Remove and return every PDU with COUNT below `limit`, ascending,
    /// regardless of gaps.
    pub fn flush_before(&mut self, limit: u64) -> Vec<BufferedSdu> {
        let mut flushed = Vec::new();
        while let Some(entry) = self.pdus.first_entry() {
            if *entry.key() >= limit {
                break;
            }
            let pdu = entry.remove();
            self.window.mark_delivered(pdu.count);
            flushed.push(pdu);
        }
        flushed
    }

    /// Drop everything still buffered, returning how many PDUs were lost
    pub fn clear(&mut self) -> usize {
        let dropped = self.pdus.len();
        self.pdus.clear();
        dropped
    }
}
