//! The jtag_vpi protocol spoken by OpenOCD's `jtag_vpi` driver: fixed 1036 byte records in
//! host (little-endian) byte order.
use std::io::Write;

use log::{debug, info};

use crate::bits::byte_len;
use crate::server::{Bridge, RecvBuffer, Session};
use crate::statemachine::JtagSM;
use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 12345;

pub const XFERT_MAX_SIZE: usize = 512;
pub const RECORD_LEN: usize = 4 + 2 * XFERT_MAX_SIZE + 4 + 4;

const CMD_RESET: u32 = 0;
const CMD_TMS_SEQ: u32 = 1;
const CMD_SCAN_CHAIN: u32 = 2;
const CMD_SCAN_CHAIN_FLIP_TMS: u32 = 3;
const CMD_STOP_SIMU: u32 = 4;

const OUT: usize = 4;
const IN: usize = OUT + XFERT_MAX_SIZE;
const LENGTH: usize = IN + XFERT_MAX_SIZE;
const NB_BITS: usize = LENGTH + 4;

fn le32(record: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]])
}

#[derive(Default)]
pub struct JtagVpi;

impl JtagVpi {
    pub fn new() -> Self {
        Self
    }

    fn handle(&mut self, jtag: &mut JtagSM, record: &mut [u8], out: &mut dyn Write) -> Result<()> {
        let cmd = le32(record, 0);
        let nb_bits = le32(record, NB_BITS) as usize;
        if nb_bits > XFERT_MAX_SIZE * 8 {
            return Err(Error::Protocol(format!("jtag_vpi transfer of {} bits", nb_bits)));
        }
        record[IN..LENGTH].fill(0);

        match cmd {
            CMD_RESET => {
                debug!("jtag_vpi reset");
                jtag.mode_reset()
            }
            CMD_TMS_SEQ => jtag.tms_seq(&record[OUT..IN], nb_bits),
            CMD_SCAN_CHAIN | CMD_SCAN_CHAIN_FLIP_TMS => {
                let exits_shift = cmd == CMD_SCAN_CHAIN_FLIP_TMS;
                let tdo = jtag
                    .scan_chain(&record[OUT..IN], nb_bits, exits_shift, true)?
                    .unwrap_or_default();
                let n = byte_len(nb_bits).min(tdo.len());
                record[IN..IN + n].copy_from_slice(&tdo[..n]);
                out.write_all(record)?;
                Ok(())
            }
            CMD_STOP_SIMU => {
                info!("jtag_vpi client asked to stop the simulation, ignoring");
                Ok(())
            }
            other => Err(Error::Protocol(format!("unknown jtag_vpi command {}", other))),
        }
    }
}

impl Bridge for JtagVpi {
    fn name(&self) -> &'static str {
        "jtag_vpi"
    }

    fn buffer_len(&self) -> usize {
        RECORD_LEN * 4
    }

    fn on_data(&mut self, jtag: &mut JtagSM, input: &mut RecvBuffer, out: &mut dyn Write)
        -> Result<Session>
    {
        while input.len() >= RECORD_LEN {
            let mut record = input.as_slice()[..RECORD_LEN].to_vec();
            input.consume(RECORD_LEN);
            self.handle(jtag, &mut record, out)?;
        }
        Ok(Session::Continue)
    }
}
