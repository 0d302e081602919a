//! Splits a raw per-clock TMS vector into spans that adapters can execute in bulk.
//!
//! Adapters clock "N bits of TMS" and "N bits of TDI/TDO" efficiently, but cannot interleave the
//! two bit by bit.  `analyze` cuts a request wherever the TAP enters or leaves Shift-DR /
//! Shift-IR, so each span is either pure state navigation or pure data.  A data span that ends
//! by leaving the shift state is flagged `exits_shift`: its last bit is clocked with TMS=1.
use log::debug;

use crate::bits::get_bit;
use crate::statemachine::JtagState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Tms,
    Data,
}

/// Bits `begin..end` of one client request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub exits_shift: bool,
    pub begin: usize,
    pub end: usize,
}

impl Region {
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn is_tms(&self) -> bool {
        self.kind == RegionKind::Tms
    }

    pub fn contains(&self, bit: usize) -> bool {
        self.begin <= bit && bit < self.end
    }
}

/// Partition the first `num_bits` bits of `tms`, starting from `start`.  Returns the state after
/// the last bit together with the regions, which tile `0..num_bits` in order.
pub fn analyze(tms: &[u8], num_bits: usize, start: JtagState) -> (JtagState, Vec<Region>) {
    let mut regions = Vec::new();
    let mut state = start;
    let mut begin = 0;

    for i in 0..num_bits {
        let next = state.next(get_bit(tms, i));
        if !state.is_shift() && next.is_shift() {
            regions.push(Region {
                kind: RegionKind::Tms,
                exits_shift: false,
                begin,
                end: i + 1,
            });
            begin = i + 1;
        } else if state.is_shift() && !next.is_shift() {
            regions.push(Region {
                kind: RegionKind::Data,
                exits_shift: true,
                begin,
                end: i + 1,
            });
            begin = i + 1;
        }
        state = next;
    }

    if begin != num_bits {
        // TMS is irrelevant while shifting, so a trailing shift run is plain data
        let kind = if state.is_shift() {
            RegionKind::Data
        } else {
            RegionKind::Tms
        };
        regions.push(Region {
            kind,
            exits_shift: false,
            begin,
            end: num_bits,
        });
    }

    for r in &regions {
        debug!("[{}:{}]: {:?}{}", r.begin, r.end, r.kind, if r.exits_shift { " +exit" } else { "" });
    }
    (state, regions)
}
