//! This provides a higher-level interface than the `Cable` trait.  Specifically, it keeps track of
//! the state of the JTAG state machine while bit streams are clocked through the bound cable, and
//! allows setting the state to any desired state.  `JtagSM` will get to that state by the most
//! efficient path, based on the current state.
use core::fmt;

use log::{debug, trace};

use crate::bits::{byte_len, check_len, get_bit, BitDisplay};
use crate::cable::Cable;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JtagState {
    TestLogicReset = 0,
    RunTestIdle = 1,
    SelectDRScan = 2,
    CaptureDR = 3,
    ShiftDR = 4,
    Exit1DR = 5,
    PauseDR = 6,
    Exit2DR = 7,
    UpdateDR = 8,
    SelectIRScan = 9,
    CaptureIR = 10,
    ShiftIR = 11,
    Exit1IR = 12,
    PauseIR = 13,
    Exit2IR = 14,
    UpdateIR = 15,
}

use JtagState::*;

/// Successor of every state, indexed by `[state][tms]`.
const EDGES: [[JtagState; 2]; 16] = [
    [RunTestIdle, TestLogicReset], // TestLogicReset
    [RunTestIdle, SelectDRScan],   // RunTestIdle
    [CaptureDR, SelectIRScan],     // SelectDRScan
    [ShiftDR, Exit1DR],            // CaptureDR
    [ShiftDR, Exit1DR],            // ShiftDR
    [PauseDR, UpdateDR],           // Exit1DR
    [PauseDR, Exit2DR],            // PauseDR
    [ShiftDR, UpdateDR],           // Exit2DR
    [RunTestIdle, SelectDRScan],   // UpdateDR
    [CaptureIR, TestLogicReset],   // SelectIRScan
    [ShiftIR, Exit1IR],            // CaptureIR
    [ShiftIR, Exit1IR],            // ShiftIR
    [PauseIR, UpdateIR],           // Exit1IR
    [PauseIR, Exit2IR],            // PauseIR
    [ShiftIR, UpdateIR],           // Exit2IR
    [RunTestIdle, SelectDRScan],   // UpdateIR
];

const ALL: [JtagState; 16] = [
    TestLogicReset, RunTestIdle,
    SelectDRScan, CaptureDR, ShiftDR, Exit1DR, PauseDR, Exit2DR, UpdateDR,
    SelectIRScan, CaptureIR, ShiftIR, Exit1IR, PauseIR, Exit2IR, UpdateIR,
];

impl JtagState {
    /// The state reached after one TCK rising edge with TMS at `tms`.
    pub const fn next(self, tms: bool) -> JtagState {
        EDGES[self as usize][tms as usize]
    }

    pub const fn is_shift(self) -> bool {
        matches!(self, ShiftDR | ShiftIR)
    }

    pub fn all() -> impl Iterator<Item = JtagState> {
        ALL.into_iter()
    }

    pub const fn name(self) -> &'static str {
        match self {
            TestLogicReset => "TestLogicReset",
            RunTestIdle => "RunTestIdle",
            SelectDRScan => "SelectDRScan",
            CaptureDR => "CaptureDR",
            ShiftDR => "ShiftDR",
            Exit1DR => "Exit1DR",
            PauseDR => "PauseDR",
            Exit2DR => "Exit2DR",
            UpdateDR => "UpdateDR",
            SelectIRScan => "SelectIRScan",
            CaptureIR => "CaptureIR",
            ShiftIR => "ShiftIR",
            Exit1IR => "Exit1IR",
            PauseIR => "PauseIR",
            Exit2IR => "Exit2IR",
            UpdateIR => "UpdateIR",
        }
    }
}

impl fmt::Display for JtagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn next_state(state: JtagState, tms: bool) -> JtagState {
    state.next(tms)
}

/// Replay `num_bits` bits of `tms` from `state`.
pub fn walk(mut state: JtagState, tms: &[u8], num_bits: usize) -> JtagState {
    for i in 0..num_bits {
        state = state.next(get_bit(tms, i));
    }
    state
}

/// Shortest TMS sequence from `from` to `to`, one element per clock.
pub fn path(from: JtagState, to: JtagState) -> Vec<bool> {
    if from == to {
        return Vec::new();
    }

    // breadth-first over the transition table, remembering how each state was reached
    let mut via: [Option<(JtagState, bool)>; 16] = [None; 16];
    let mut frontier = vec![from];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for state in frontier {
            for tms in [false, true] {
                let succ = state.next(tms);
                if succ == from || via[succ as usize].is_some() {
                    continue;
                }
                via[succ as usize] = Some((state, tms));
                if succ == to {
                    let mut path = Vec::new();
                    let mut cur = to;
                    while let Some((prev, tms)) = via[cur as usize] {
                        path.push(tms);
                        if prev == from {
                            break;
                        }
                        cur = prev;
                    }
                    path.reverse();
                    return path;
                }
                next.push(succ);
            }
        }
        frontier = next;
    }
    unreachable!("every TAP state is reachable from every other");
}

/// A scan whose TDO has been requested from the cable but not yet collected.  Hand it back to
/// `JtagSM::scan_chain_recv` exactly once, in the order the sends were issued.
#[must_use = "the cable holds TDO for this scan until it is received"]
#[derive(Debug)]
pub struct PendingRead {
    seq: u64,
    num_bits: usize,
    exits_shift: bool,
}

impl PendingRead {
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }
}

pub struct JtagSM {
    cable: Box<dyn Cable>,
    state: JtagState,
    bits_sent: u64,
    // sequence numbers of issued and collected reads
    sent_reads: u64,
    recv_reads: u64,
}

impl JtagSM {
    /// Create a JTAG state machine using an existing `Cable`.  The TAP is assumed to sit in
    /// Test-Logic-Reset, as it does after `init`.
    pub fn new(cable: Box<dyn Cable>) -> Self {
        Self {
            cable,
            state: TestLogicReset,
            bits_sent: 0,
            sent_reads: 0,
            recv_reads: 0,
        }
    }

    /// Initialise the cable and force the chain into Test-Logic-Reset.
    pub fn init(&mut self) -> Result<()> {
        self.cable.init()?;
        self.state = TestLogicReset;
        self.mode_reset()?;
        self.flush()
    }

    pub fn deinit(&mut self) -> Result<()> {
        self.flush()?;
        self.cable.deinit()
    }

    pub fn state(&self) -> JtagState {
        self.state
    }

    /// Total number of bits clocked so far, for throughput reporting.
    pub fn bits_sent(&self) -> u64 {
        self.bits_sent
    }

    pub fn set_tck_freq(&mut self, hz: u64) -> Result<u64> {
        self.cable.set_tck_freq(hz)
    }

    pub fn tck_freq(&self) -> Option<u64> {
        self.cable.tck_freq()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.cable.flush()
    }

    /// Clock `num_bits` bits of `tms` (LSB-first) out on TMS.
    pub fn tms_seq(&mut self, tms: &[u8], num_bits: usize) -> Result<()> {
        if num_bits == 0 {
            return Ok(());
        }
        check_len(tms, num_bits)?;
        self.bits_sent += num_bits as u64;
        trace!("TMS seq {}", BitDisplay::new(tms, num_bits));

        let new_state = walk(self.state, tms, num_bits);
        debug!("JTAG state: {} -> {}", self.state, new_state);
        self.state = new_state;

        self.cable.tms_seq(tms, num_bits)
    }

    /// Reset the scan chain by driving TMS high for 5 clocks
    pub fn mode_reset(&mut self) -> Result<()> {
        self.tms_seq(&[0x1f], 5)
    }

    /// Use TMS to get into `state` by the most efficient path
    pub fn change_mode(&mut self, state: JtagState) -> Result<()> {
        let path = path(self.state, state);
        let mut tms = vec![0u8; byte_len(path.len())];
        for (i, bit) in path.iter().enumerate() {
            if *bit {
                tms[i / 8] |= 1 << (i % 8);
            }
        }
        self.tms_seq(&tms, path.len())
    }

    fn send(&mut self, tdi: &[u8], num_bits: usize, exits_shift: bool, read: bool) -> Result<()> {
        check_len(tdi, num_bits)?;
        self.bits_sent += num_bits as u64;
        trace!(
            "Write TDI{} {} bits: {}",
            if exits_shift { "+TMS" } else { "" },
            num_bits,
            BitDisplay::new(tdi, num_bits)
        );

        self.cable.scan_chain_send(tdi, num_bits, exits_shift, read)?;
        if exits_shift {
            let new_state = self.state.next(true);
            debug!("JTAG state: {} -> {}", self.state, new_state);
            self.state = new_state;
        }
        Ok(())
    }

    /// Shift `num_bits` bits of `tdi` without reading TDO.
    pub fn scan_chain_write(&mut self, tdi: &[u8], num_bits: usize, exits_shift: bool) -> Result<()> {
        if num_bits == 0 {
            return Ok(());
        }
        self.send(tdi, num_bits, exits_shift, false)
    }

    /// Shift `num_bits` bits of `tdi` and ask the cable to sample TDO.  The TDO is fetched by
    /// passing the returned handle to `scan_chain_recv`, which lets several scans be in flight
    /// before the first result is waited for.
    pub fn scan_chain_send(&mut self, tdi: &[u8], num_bits: usize, exits_shift: bool)
        -> Result<PendingRead>
    {
        if num_bits > 0 {
            self.send(tdi, num_bits, exits_shift, true)?;
        }
        let seq = self.sent_reads;
        self.sent_reads += 1;
        Ok(PendingRead {
            seq,
            num_bits,
            exits_shift: exits_shift && num_bits > 0,
        })
    }

    pub fn scan_chain_recv(&mut self, pending: PendingRead) -> Result<Vec<u8>> {
        if pending.seq != self.recv_reads {
            return Err(Error::ReceiveOrder {
                expected: self.recv_reads,
                got: pending.seq,
            });
        }
        self.recv_reads += 1;
        if pending.num_bits == 0 {
            return Ok(Vec::new());
        }

        let tdo = self.cable.scan_chain_recv(pending.num_bits, pending.exits_shift)?;
        trace!("Read TDO {} bits: {}", pending.num_bits, BitDisplay::new(&tdo, pending.num_bits));
        Ok(tdo)
    }

    /// Receive a batch of handles in order.  If one fails the rest are discarded so the next
    /// batch starts in step.
    pub fn recv_all<I>(&mut self, pending: I) -> Result<Vec<Vec<u8>>>
    where
        I: IntoIterator<Item = PendingRead>,
    {
        let mut pending = pending.into_iter();
        let mut out = Vec::new();
        for p in pending.by_ref() {
            match self.scan_chain_recv(p) {
                Ok(tdo) => out.push(tdo),
                Err(e) => {
                    for p in pending {
                        self.discard(p);
                    }
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    /// Collect and drop the TDO of a scan nobody is waiting for any more.
    pub fn discard(&mut self, pending: PendingRead) {
        if let Err(e) = self.scan_chain_recv(pending) {
            debug!("discarding read: {}", e);
        }
    }

    /// Shift `num_bits` bits of `tdi`.  If `exits_shift` is set the last bit leaves Shift-DR /
    /// Shift-IR.  Returns the sampled TDO when `read` is set.
    pub fn scan_chain(&mut self, tdi: &[u8], num_bits: usize, exits_shift: bool, read: bool)
        -> Result<Option<Vec<u8>>>
    {
        if read {
            let pending = self.scan_chain_send(tdi, num_bits, exits_shift)?;
            self.scan_chain_recv(pending).map(Some)
        } else {
            self.scan_chain_write(tdi, num_bits, exits_shift)?;
            Ok(None)
        }
    }

    /// Pulse TCK `times` times without touching TMS or TDI.
    pub fn clock_tck(&mut self, times: usize) -> Result<()> {
        if times == 0 {
            return Ok(());
        }
        self.bits_sent += times as u64;
        self.cable.clock_tck(times)
    }
}
