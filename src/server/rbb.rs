//! OpenOCD remote_bitbang protocol.
//!
//! Each byte is one command: `'0'..='7'` sets TCK/TMS/TDI (bits 2/1/0), `'R'` asks for TDO,
//! `'r'..='u'` drive the reset lines, `'B'`/`'b'` the LED, and `'Q'` ends the session.  Only
//! samples with TCK high are clocked; a whole chunk of samples is batched through the region
//! analyzer before it reaches the adapter.
use std::io::Write;

use bitvec::prelude::*;
use log::{debug, info, trace};

use crate::bits::{extract, get_bit};
use crate::region::{analyze, Region};
use crate::server::{Bridge, RecvBuffer, Session};
use crate::statemachine::{JtagSM, PendingRead};
use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 12345;

#[derive(Default)]
pub struct RemoteBitbang {
    // 'R's from an earlier chunk waiting for their rising edge
    carried_reads: usize,
}

impl RemoteBitbang {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One chunk of commands reduced to the edges it clocks and the edges it reads.
#[derive(Default)]
struct Chunk {
    tms: BitVec<u8, Lsb0>,
    tdi: BitVec<u8, Lsb0>,
    // For every 'R', the index of the rising edge whose TDO it reports
    reads: Vec<usize>,
    quit: bool,
}

fn parse(input: &[u8], carried_reads: usize) -> Result<Chunk> {
    let mut chunk = Chunk {
        reads: vec![0; carried_reads],
        ..Default::default()
    };
    for &cmd in input {
        match cmd {
            b'0'..=b'7' => {
                let bits = cmd - b'0';
                if bits & 0b100 != 0 {
                    chunk.tms.push(bits & 0b010 != 0);
                    chunk.tdi.push(bits & 0b001 != 0);
                }
            }
            b'R' => chunk.reads.push(chunk.tms.len()),
            // reset lines and LED are not wired up
            b'r' | b's' | b't' | b'u' | b'B' | b'b' => {}
            b'Q' => {
                chunk.quit = true;
                break;
            }
            // some clients terminate commands with newlines
            b'\n' | b'\r' => {}
            other => {
                return Err(Error::Protocol(format!("unknown remote bitbang command {:#04x}", other)))
            }
        }
    }
    Ok(chunk)
}

fn issue(jtag: &mut JtagSM, chunk: &Chunk, regions: &[Region], pending: &mut Vec<(usize, PendingRead)>)
    -> Result<()>
{
    let tms = chunk.tms.as_raw_slice();
    let tdi = chunk.tdi.as_raw_slice();
    for (i, region) in regions.iter().enumerate() {
        if region.is_tms() {
            jtag.tms_seq(&extract(tms, region.begin, region.end), region.len())?;
        } else {
            let data = extract(tdi, region.begin, region.end);
            if chunk.reads.iter().any(|r| region.contains(*r)) {
                let p = jtag.scan_chain_send(&data, region.len(), region.exits_shift)?;
                pending.push((i, p));
            } else {
                jtag.scan_chain_write(&data, region.len(), region.exits_shift)?;
            }
        }
    }
    Ok(())
}

impl Bridge for RemoteBitbang {
    fn name(&self) -> &'static str {
        "remote bitbang"
    }

    fn on_connect(&mut self, _jtag: &mut JtagSM, _out: &mut dyn Write) -> Result<()> {
        self.carried_reads = 0;
        Ok(())
    }

    fn on_data(&mut self, jtag: &mut JtagSM, input: &mut RecvBuffer, out: &mut dyn Write)
        -> Result<Session>
    {
        let chunk = parse(input.as_slice(), self.carried_reads)?;
        input.clear();

        let bits = chunk.tms.len();
        let (end, regions) = analyze(chunk.tms.as_raw_slice(), bits, jtag.state());

        // Issue everything first, then collect the reads
        let mut pending: Vec<(usize, PendingRead)> = Vec::new();
        let issued = issue(jtag, &chunk, &regions, &mut pending);
        if let Err(e) = issued {
            for (_, p) in pending {
                jtag.discard(p);
            }
            return Err(e);
        }
        debug_assert_eq!(jtag.state(), end);

        let (index, handles): (Vec<usize>, Vec<PendingRead>) = pending.into_iter().unzip();
        let mut tdo: Vec<Option<Vec<u8>>> = vec![None; regions.len()];
        for (i, data) in index.into_iter().zip(jtag.recv_all(handles)?) {
            tdo[i] = Some(data);
        }

        let mut reply = Vec::with_capacity(chunk.reads.len());
        let mut answered = 0;
        for &edge in &chunk.reads {
            if edge >= bits {
                break;
            }
            let bit = regions
                .iter()
                .zip(&tdo)
                .find(|(r, _)| r.contains(edge))
                .and_then(|(r, data)| data.as_ref().map(|d| get_bit(d, edge - r.begin)))
                .unwrap_or(false);
            reply.push(if bit { b'1' } else { b'0' });
            answered += 1;
        }
        self.carried_reads = chunk.reads.len() - answered;
        if self.carried_reads > 0 {
            trace!("{} reads wait for the next chunk", self.carried_reads);
        }
        out.write_all(&reply)?;

        if chunk.quit {
            info!("remote bitbang client quit");
            return Ok(Session::Close);
        }
        if bits > 0 {
            debug!("{} edges, {} reads", bits, answered);
        }
        Ok(Session::Continue)
    }

    fn on_disconnect(&mut self, _jtag: &mut JtagSM) {
        self.carried_reads = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{Op, Recorder, SimChain};
    use crate::statemachine::JtagState;

    fn feed(bridge: &mut RemoteBitbang, sm: &mut JtagSM, bytes: &[u8]) -> (Vec<u8>, Session) {
        let mut input = RecvBuffer::new(4096);
        input.extend(bytes).unwrap();
        let mut out = Vec::new();
        let session = bridge.on_data(sm, &mut input, &mut out).unwrap();
        (out, session)
    }

    fn idle_sm() -> JtagSM {
        let mut sm = JtagSM::new(Box::new(SimChain::new(&[0x12345678])));
        sm.change_mode(JtagState::RunTestIdle).unwrap();
        sm
    }

    #[test]
    fn high_tck_sample_moves_the_tap() {
        let mut sm = idle_sm();
        let mut bridge = RemoteBitbang::new();
        let (out, _) = feed(&mut bridge, &mut sm, b"6");
        assert!(out.is_empty());
        assert_eq!(sm.state(), JtagState::SelectDRScan);
    }

    #[test]
    fn low_tck_samples_are_not_clocked() {
        let recorder = Recorder::default();
        let log = recorder.log();
        let mut sm = JtagSM::new(Box::new(recorder));
        let mut bridge = RemoteBitbang::new();
        feed(&mut bridge, &mut sm, b"0123rstu");
        assert!(log.borrow().ops.is_empty());
        assert_eq!(sm.state(), JtagState::TestLogicReset);
    }

    #[test]
    fn reads_idcode_bit_by_bit() {
        let mut sm = idle_sm();
        let mut bridge = RemoteBitbang::new();
        // Idle -> SelectDR -> CaptureDR -> ShiftDR
        feed(&mut bridge, &mut sm, b"260404");
        assert_eq!(sm.state(), JtagState::ShiftDR);

        // 32 reads, the last one leaving ShiftDR
        let mut cmds = Vec::new();
        for i in 0..32 {
            cmds.extend_from_slice(if i == 31 { b"2R6" } else { b"0R4" });
        }
        let (out, _) = feed(&mut bridge, &mut sm, &cmds);
        assert_eq!(sm.state(), JtagState::Exit1DR);

        let value = out
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, c)| acc | (((*c == b'1') as u32) << i));
        assert_eq!(out.len(), 32);
        assert_eq!(value, 0x12345678);
    }

    #[test]
    fn read_after_last_edge_is_answered_next_chunk() {
        let mut sm = idle_sm();
        let mut bridge = RemoteBitbang::new();
        feed(&mut bridge, &mut sm, b"260404");
        let (out, _) = feed(&mut bridge, &mut sm, b"0R");
        assert!(out.is_empty());
        let (out, _) = feed(&mut bridge, &mut sm, b"4");
        // IDCODE bit 0 of 0x12345678
        assert_eq!(out, b"0");
        let (out, _) = feed(&mut bridge, &mut sm, b"0R4R4R4");
        // bits 1 to 3
        assert_eq!(out, b"001");
    }

    #[test]
    fn reads_on_tms_edges_reply_zero() {
        let recorder = Recorder::default();
        let log = recorder.log();
        let mut sm = JtagSM::new(Box::new(recorder));
        let mut bridge = RemoteBitbang::new();
        let (out, _) = feed(&mut bridge, &mut sm, b"R4R6");
        assert_eq!(out, b"00");
        assert!(matches!(log.borrow().ops[..], [Op::Tms(_, 2)]));
    }

    #[test]
    fn unread_data_is_write_only() {
        let recorder = Recorder::default();
        let log = recorder.log();
        let mut sm = JtagSM::new(Box::new(recorder));
        sm.change_mode(JtagState::ShiftDR).unwrap();
        let mut bridge = RemoteBitbang::new();
        feed(&mut bridge, &mut sm, b"5454");
        let log = log.borrow();
        assert!(matches!(
            log.ops.last(),
            Some(Op::Scan { bits: 4, exits_shift: false, read: false, .. })
        ));
    }

    #[test]
    fn quit_and_garbage() {
        let mut sm = idle_sm();
        let mut bridge = RemoteBitbang::new();
        assert_eq!(feed(&mut bridge, &mut sm, b"BbQ").1, Session::Close);

        let mut input = RecvBuffer::new(16);
        input.extend(b"4x").unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            bridge.on_data(&mut sm, &mut input, &mut out),
            Err(Error::Protocol(_))
        ));
    }
}
