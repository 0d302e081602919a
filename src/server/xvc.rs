//! Xilinx Virtual Cable 1.0.
//!
//! `getinfo:` reports the largest vector, `settck:<period ns>` retunes TCK, and
//! `shift:<bits><tms><tdi>` clocks a vector and answers with TDO.  Every shift in a batch is
//! issued before any of them is read back.
use std::collections::VecDeque;
use std::io::Write;

use log::{debug, info, trace};

use crate::bits::{byte_len, extract, paste, BitDisplay};
use crate::region::{analyze, Region};
use crate::server::{Bridge, RecvBuffer, Session};
use crate::statemachine::{JtagSM, JtagState, PendingRead};
use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 2542;

/// Largest TMS (and TDI) vector accepted in one `shift:`, in bytes.
pub const MAX_VECTOR_LEN: usize = 2048;

const GETINFO: &[u8] = b"getinfo:";
const SETTCK: &[u8] = b"settck:";
const SHIFT: &[u8] = b"shift:";
const INFO: &[u8] = b"xvcServer_v1.0:2048\n";

/// A shift whose data regions are in flight.
struct PendingShift {
    bits: usize,
    reads: Vec<(Region, PendingRead)>,
}

#[derive(Default)]
pub struct Xvc {
    pending: VecDeque<PendingShift>,
}

enum Parsed {
    GetInfo,
    SetTck(u32),
    Shift { bits: usize, len: usize },
    Incomplete,
}

fn le32(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

fn parse(data: &[u8]) -> Result<Parsed> {
    if data.starts_with(GETINFO) {
        return Ok(Parsed::GetInfo);
    }
    if data.starts_with(SETTCK) {
        let rest = &data[SETTCK.len()..];
        if rest.len() < 4 {
            return Ok(Parsed::Incomplete);
        }
        return Ok(Parsed::SetTck(le32(rest)));
    }
    if data.starts_with(SHIFT) {
        let rest = &data[SHIFT.len()..];
        if rest.len() < 4 {
            return Ok(Parsed::Incomplete);
        }
        let bits = le32(rest) as usize;
        let bytes = byte_len(bits);
        if bytes > MAX_VECTOR_LEN {
            return Err(Error::Protocol(format!("xvc shift of {} bits", bits)));
        }
        return Ok(Parsed::Shift {
            bits,
            len: SHIFT.len() + 4 + 2 * bytes,
        });
    }
    if [GETINFO, SETTCK, SHIFT].iter().any(|tag| tag.starts_with(data)) {
        return Ok(Parsed::Incomplete);
    }
    Err(Error::Protocol(format!(
        "unknown xvc command {:?}",
        String::from_utf8_lossy(&data[..data.len().min(16)])
    )))
}

fn issue(
    jtag: &mut JtagSM,
    regions: &[Region],
    tms: &[u8],
    tdi: &[u8],
    reads: &mut Vec<(Region, PendingRead)>,
) -> Result<()> {
    for region in regions {
        if region.is_tms() {
            let seq = extract(tms, region.begin, region.end);
            let clock_only = jtag.state() == JtagState::RunTestIdle && seq.iter().all(|b| *b == 0);
            if clock_only {
                // Run-Test/Idle loop: one real TMS bit, the rest as bare clocks
                jtag.tms_seq(&seq, 1)?;
                jtag.clock_tck(region.len() - 1)?;
            } else {
                jtag.tms_seq(&seq, region.len())?;
            }
        } else {
            let data = extract(tdi, region.begin, region.end);
            let pending = jtag.scan_chain_send(&data, region.len(), region.exits_shift)?;
            reads.push((*region, pending));
        }
    }
    Ok(())
}

impl Xvc {
    pub fn new() -> Self {
        Self::default()
    }

    fn shift(&mut self, jtag: &mut JtagSM, bits: usize, tms: &[u8], tdi: &[u8]) -> Result<()> {
        trace!(" tms:{}", BitDisplay::new(tms, bits));
        trace!(" tdi:{}", BitDisplay::new(tdi, bits));

        let (end, regions) = analyze(tms, bits, jtag.state());
        let mut reads = Vec::new();
        let res = issue(jtag, &regions, tms, tdi, &mut reads);
        // queued even on failure so the handles are collected
        self.pending.push_back(PendingShift { bits, reads });
        res?;
        debug_assert_eq!(jtag.state(), end);
        Ok(())
    }

    /// Collect the TDO of every issued shift and send the replies in order.
    fn drain(&mut self, jtag: &mut JtagSM, out: &mut dyn Write) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        jtag.flush()?;
        while let Some(shift) = self.pending.pop_front() {
            let (regions, handles): (Vec<Region>, Vec<PendingRead>) = shift.reads.into_iter().unzip();
            let mut tdo = vec![0u8; byte_len(shift.bits)];
            for (region, data) in regions.iter().zip(jtag.recv_all(handles)?) {
                paste(&mut tdo, region.begin, region.end, &data);
            }
            trace!(" tdo:{}", BitDisplay::new(&tdo, shift.bits));
            out.write_all(&tdo)?;
        }
        Ok(())
    }

    fn discard(&mut self, jtag: &mut JtagSM) {
        for shift in self.pending.drain(..) {
            for (_, p) in shift.reads {
                jtag.discard(p);
            }
        }
    }

    fn process(&mut self, jtag: &mut JtagSM, input: &mut RecvBuffer, out: &mut dyn Write)
        -> Result<()>
    {
        while !input.is_empty() {
            match parse(input.as_slice())? {
                Parsed::Incomplete => break,
                Parsed::GetInfo => {
                    debug!("getinfo:");
                    input.consume(GETINFO.len());
                    self.drain(jtag, out)?;
                    out.write_all(INFO)?;
                }
                Parsed::SetTck(period) => {
                    input.consume(SETTCK.len() + 4);
                    self.drain(jtag, out)?;
                    if period > 0 {
                        let hz = (1_000_000_000 + u64::from(period) / 2) / u64::from(period);
                        let actual = jtag.set_tck_freq(hz)?;
                        info!("settck: {} ns, tck {} Hz", period, actual);
                    }
                    out.write_all(&period.to_le_bytes())?;
                }
                Parsed::Shift { bits, len } => {
                    if input.len() < len {
                        break;
                    }
                    let bytes = byte_len(bits);
                    let body = &input.as_slice()[SHIFT.len() + 4..len];
                    let tms = body[..bytes].to_vec();
                    let tdi = body[bytes..].to_vec();
                    input.consume(len);
                    debug!("shift: {} bits", bits);
                    self.shift(jtag, bits, &tms, &tdi)?;
                }
            }
        }
        self.drain(jtag, out)
    }
}

impl Bridge for Xvc {
    fn name(&self) -> &'static str {
        "xvc"
    }

    fn buffer_len(&self) -> usize {
        2 * (SHIFT.len() + 4 + 2 * MAX_VECTOR_LEN)
    }

    fn on_data(&mut self, jtag: &mut JtagSM, input: &mut RecvBuffer, out: &mut dyn Write)
        -> Result<Session>
    {
        let res = self.process(jtag, input, out);
        if res.is_err() {
            self.discard(jtag);
        }
        res.map(|()| Session::Continue)
    }

    fn on_disconnect(&mut self, jtag: &mut JtagSM) {
        self.discard(jtag);
    }
}
