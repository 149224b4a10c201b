//! PDCP sequence number and hyperframe arithmetic
//!
//! A received SN is only meaningful relative to the receiver's window: the
//! SN space wraps far more often than end-to-end delay allows a plain
//! integer comparison to disambiguate. [`RxWindow`] turns a raw SN into a
//! COUNT (`hfn * M + sn`), which is totally ordered and safe to compare.

use crate::LayerError;

/// Size of the SN space and of the reordering window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnSpace {
    modulus: u32,
    window: u32,
}

impl SnSpace {
    /// SN space for an SN field of `sn_bits` bits (12, 15 or 18)
    pub fn new(sn_bits: u8) -> Result<Self, LayerError> {
        match sn_bits {
            12 | 15 | 18 => Ok(Self::with_modulus(1 << sn_bits)),
            _ => Err(LayerError::InvalidConfiguration(format!(
                "Invalid SN size {}: must be 12, 15 or 18 bits",
                sn_bits
            ))),
        }
    }

    fn with_modulus(modulus: u32) -> Self {
        Self {
            modulus,
            window: modulus / 2,
        }
    }

    /// Number of distinct SN values (M)
    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    /// Reordering window (W = M / 2)
    pub fn window(&self) -> u32 {
        self.window
    }

    /// Largest SN value
    pub fn max_sn(&self) -> u32 {
        self.modulus - 1
    }

    /// SN following `sn`, wrapping at M
    pub fn next_sn(&self, sn: u32) -> u32 {
        (sn + 1) % self.modulus
    }

    /// `(to - from) mod M`
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        (to + self.modulus - from % self.modulus) % self.modulus
    }

    /// COUNT of `sn` in hyperframe `hfn`
    pub fn count(&self, sn: u32, hfn: u32) -> u64 {
        u64::from(hfn) * u64::from(self.modulus) + u64::from(sn)
    }

    /// SN part of a COUNT
    pub fn sn_of(&self, count: u64) -> u32 {
        (count % u64::from(self.modulus)) as u32
    }

    /// HFN part of a COUNT
    pub fn hfn_of(&self, count: u64) -> u32 {
        (count / u64::from(self.modulus)) as u32
    }
}

/// Where a received SN falls relative to the receive window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnPlacement {
    /// Wrapped ahead of the receiver: opens the next hyperframe
    NextHyperframe,
    /// Late arrival from before the last wrap
    PreviousHyperframe,
    /// At or beyond the next expected SN in the current hyperframe
    InWindow,
    /// Behind the next expected SN in the current hyperframe
    Late,
}

/// Result of locating an SN: its COUNT and the window state it implies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    /// COUNT assigned to the SN
    pub count: u64,
    /// Which branch of the window rules applied
    pub placement: SnPlacement,
    next_expected: u32,
    hfn: u32,
}

/// Receive-side window state of one radio bearer
#[derive(Debug, Clone)]
pub struct RxWindow {
    space: SnSpace,
    /// Next SN expected in order (raw, `Next_PDCP_RX_SN`)
    next_expected: u32,
    /// Current receive hyperframe
    hfn: u32,
    /// COUNT of the last SDU handed to the upper layer
    last_delivered: Option<u64>,
}

impl RxWindow {
    /// Fresh window expecting SN 0 of hyperframe 0
    pub fn new(space: SnSpace) -> Self {
        Self {
            space,
            next_expected: 0,
            hfn: 0,
            last_delivered: None,
        }
    }

    /// Window resuming at `rx_sn`, e.g. after a status transfer
    pub fn resume_at(space: SnSpace, rx_sn: u32) -> Self {
        let rx_sn = rx_sn % space.modulus();
        Self {
            space,
            next_expected: rx_sn,
            hfn: 0,
            last_delivered: rx_sn.checked_sub(1).map(u64::from),
        }
    }

    pub fn space(&self) -> SnSpace {
        self.space
    }

    pub fn hfn(&self) -> u32 {
        self.hfn
    }

    pub fn next_expected_sn(&self) -> u32 {
        self.next_expected
    }

    /// COUNT of the next expected SN
    pub fn next_expected_count(&self) -> u64 {
        self.space.count(self.next_expected, self.hfn)
    }

    pub fn last_delivered(&self) -> Option<u64> {
        self.last_delivered
    }

    /// COUNT that would extend the in-order run
    pub fn next_deliverable(&self) -> u64 {
        self.last_delivered.map_or(0, |c| c + 1)
    }

    /// True when `sn` is at or behind the last delivered SN, or more than a
    /// window ahead of it. Before anything is delivered the reference is
    /// SN -1, i.e. `M - 1`.
    pub fn is_stale(&self, sn: u32) -> bool {
        let last_sn = self
            .last_delivered
            .map_or(self.space.max_sn(), |c| self.space.sn_of(c));
        let ahead = self.space.distance(last_sn, sn);
        ahead == 0 || ahead > self.space.window()
    }

    /// Compute the COUNT of `sn` without touching the window. Returns `None`
    /// for stale SNs and for SNs whose COUNT would not lie after the last
    /// delivered one.
    pub fn locate(&self, sn: u32) -> Option<Located> {
        if sn >= self.space.modulus() || self.is_stale(sn) {
            return None;
        }

        let n = i64::from(self.next_expected);
        let r = i64::from(sn);
        let w = i64::from(self.space.window());

        let located = if n - r > w {
            Located {
                count: self.space.count(sn, self.hfn + 1),
                placement: SnPlacement::NextHyperframe,
                next_expected: sn + 1,
                hfn: self.hfn + 1,
            }
        } else if r - n >= w {
            Located {
                count: self.space.count(sn, self.hfn.saturating_sub(1)),
                placement: SnPlacement::PreviousHyperframe,
                next_expected: self.next_expected,
                hfn: self.hfn,
            }
        } else if r >= n {
            let (next_expected, hfn) = if sn + 1 >= self.space.modulus() {
                (0, self.hfn + 1)
            } else {
                (sn + 1, self.hfn)
            };
            Located {
                count: self.space.count(sn, self.hfn),
                placement: SnPlacement::InWindow,
                next_expected,
                hfn,
            }
        } else {
            Located {
                count: self.space.count(sn, self.hfn),
                placement: SnPlacement::Late,
                next_expected: self.next_expected,
                hfn: self.hfn,
            }
        };

        match self.last_delivered {
            Some(last) if located.count <= last => None,
            _ => Some(located),
        }
    }

    /// Apply the window update implied by a located SN
    pub fn commit(&mut self, located: &Located) {
        self.next_expected = located.next_expected;
        self.hfn = self.hfn.max(located.hfn);
    }

    /// Locate and commit in one step
    pub fn receive(&mut self, sn: u32) -> Option<Located> {
        let located = self.locate(sn)?;
        self.commit(&located);
        Some(located)
    }

    /// Record delivery of `count`. Delivery never moves backwards.
    pub fn mark_delivered(&mut self, count: u64) {
        if self.last_delivered.map_or(true, |last| count > last) {
            self.last_delivered = Some(count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space15() -> SnSpace {
        SnSpace::new(15).unwrap()
    }

    #[test]
    fn test_sn_space_sizes() {
        assert_eq!(SnSpace::new(12).unwrap().modulus(), 4096);
        assert_eq!(space15().modulus(), 32768);
        assert_eq!(space15().window(), 16384);
        assert_eq!(SnSpace::new(18).unwrap().max_sn(), 262_143);
        assert!(SnSpace::new(16).is_err());
    }

    #[test]
    fn test_count_split() {
        let s = space15();
        let c = s.count(5, 3);
        assert_eq!(c, 3 * 32768 + 5);
        assert_eq!(s.sn_of(c), 5);
        assert_eq!(s.hfn_of(c), 3);
        assert_eq!(s.distance(32760, 4), 12);
        assert_eq!(s.next_sn(32767), 0);
    }

    #[test]
    fn test_sn_at_next_expected() {
        let mut w = RxWindow::new(space15());
        let loc = w.receive(0).unwrap();
        assert_eq!(loc.placement, SnPlacement::InWindow);
        assert_eq!(loc.count, 0);
        assert_eq!(w.next_expected_sn(), 1);
    }

    #[test]
    fn test_initial_window_rejects_upper_half() {
        let w = RxWindow::new(space15());
        assert!(!w.is_stale(0));
        assert!(!w.is_stale(16383));
        assert!(w.is_stale(16384));
        assert!(w.is_stale(32767));
    }

    #[test]
    fn test_stale_boundary_relative_to_last_delivered() {
        let mut w = RxWindow::resume_at(space15(), 101);
        assert_eq!(w.last_delivered(), Some(100));
        // Exactly W ahead is still accepted, W + 1 is not
        assert!(!w.is_stale(100 + 16384));
        assert!(w.is_stale(100 + 16385));
        // The last delivered SN itself and anything up to W behind is stale
        assert!(w.is_stale(100));
        assert!(w.is_stale(99));
        w.mark_delivered(150);
        assert!(w.is_stale(120));
    }

    #[test]
    fn test_next_hyperframe_boundary() {
        let s = space15();
        let mut w = RxWindow::resume_at(s, 30000);
        w.mark_delivered(s.count(29999, 0));
        // next_expected - sn == W + 1: belongs to the next hyperframe
        let sn = 30000 - 16385;
        let loc = w.locate(sn).unwrap();
        assert_eq!(loc.placement, SnPlacement::NextHyperframe);
        assert_eq!(loc.count, s.count(sn, 1));

        let mut w = RxWindow::resume_at(s, 20000);
        let loc = w.receive(3000).unwrap();
        assert_eq!(loc.placement, SnPlacement::NextHyperframe);
        assert_eq!(loc.count, s.count(3000, 1));
        assert_eq!(w.hfn(), 1);
        assert_eq!(w.next_expected_sn(), 3001);
    }

    #[test]
    fn test_exactly_window_behind_next_expected_is_late() {
        let s = space15();
        let mut w = RxWindow::resume_at(s, 16384);
        w.last_delivered = None;
        // next_expected - sn == W: not the next hyperframe
        let loc = w.receive(0).unwrap();
        assert_eq!(loc.placement, SnPlacement::Late);
        assert_eq!(loc.count, 0);
        assert_eq!(w.hfn(), 0);
    }

    #[test]
    fn test_previous_hyperframe() {
        let s = space15();
        let mut w = RxWindow::new(s);
        w.next_expected = 10;
        w.hfn = 1;
        w.last_delivered = Some(s.count(16000, 0));
        // sn - next_expected == W exactly: previous hyperframe
        let loc = w.receive(10 + 16384).unwrap();
        assert_eq!(loc.placement, SnPlacement::PreviousHyperframe);
        assert_eq!(loc.count, s.count(16394, 0));
        assert_eq!(w.hfn(), 1);
        assert_eq!(w.next_expected_sn(), 10);
    }

    #[test]
    fn test_wrap_increments_hfn_once() {
        let s = space15();
        let mut w = RxWindow::resume_at(s, 32766);
        let counts: Vec<u64> = [32766, 32767, 0, 1]
            .iter()
            .map(|&sn| {
                let loc = w.receive(sn).unwrap();
                w.mark_delivered(loc.count);
                loc.count
            })
            .collect();
        assert_eq!(counts, vec![32766, 32767, 32768, 32769]);
        assert_eq!(w.hfn(), 1);
    }

    #[test]
    fn test_locate_does_not_mutate() {
        let w = RxWindow::new(space15());
        let before = (w.next_expected_sn(), w.hfn());
        let _ = w.locate(40);
        assert_eq!((w.next_expected_sn(), w.hfn()), before);
    }

    #[test]
    fn test_mark_delivered_is_monotonic() {
        let mut w = RxWindow::new(space15());
        w.mark_delivered(10);
        w.mark_delivered(4);
        assert_eq!(w.last_delivered(), Some(10));
    }
}
