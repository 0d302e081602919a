//! Implement the `Cable` trait for Altera USB Blaster and clones
//!
//! Every byte written is either a bitbang command (one pin state per byte, so a full TCK cycle
//! takes two) or a byte-shift header followed by up to 32 bytes clocked out LSB first.  TDO
//! comes back inline, one byte per read-flagged bitbang command or one byte per shifted byte.
use std::collections::VecDeque;

use log::{debug, trace};

use crate::bits::{byte_len, get_bit};
use crate::cable::{read_exact, write_all, Cable, Transport, MAX_RETRIES};
use crate::{Error, Result};

const TCK: u8 = 1 << 0;
const TMS: u8 = 1 << 1;
const NCE: u8 = 1 << 2;
const NCS: u8 = 1 << 3;
const TDI: u8 = 1 << 4;
const LED: u8 = 1 << 5;
const READ_CMD: u8 = 1 << 6;
const BYTE_SHIFT: u8 = 1 << 7;

/// Longest run a single byte-shift command carries.
pub const MAX_SHIFT_BYTES: usize = 32;

// Toggles written on init to drain a half-finished byte-shift from a previous session
const INIT_FLUSH_LEN: usize = 4096;

/// One bitbang command byte.
pub fn build_command(tms: bool, tdi: bool, tck: bool, read: bool) -> u8 {
    let mut cmd = NCE | NCS | LED;
    if tck {
        cmd |= TCK;
    }
    if tms {
        cmd |= TMS;
    }
    if tdi {
        cmd |= TDI;
    }
    if read {
        cmd |= READ_CMD;
    }
    cmd
}

pub struct UsbBlaster<T> {
    ft: T,
    // TDO bytes read back but not yet handed out by scan_chain_recv
    recv: VecDeque<u8>,
}

impl<T: Transport> UsbBlaster<T> {
    /// Wrap a transport opened in plain (non-bitbang) FIFO mode.
    pub fn new(ft: T) -> Self {
        Self {
            ft,
            recv: VecDeque::new(),
        }
    }

    fn send(&mut self, buf: &[u8], reads: usize) -> Result<()> {
        write_all(&mut self.ft, buf)?;
        if reads > 0 {
            let mut data = vec![0u8; reads];
            read_exact(&mut self.ft, &mut data)?;
            self.recv.extend(data);
        }
        Ok(())
    }

    fn pop(&mut self, expected: usize) -> Result<u8> {
        let got = self.recv.len();
        self.recv.pop_front().ok_or(Error::ShortRead { expected, got })
    }
}

impl<T: Transport> Cable for UsbBlaster<T> {
    fn init(&mut self) -> Result<()> {
        let buf: Vec<u8> = (0..INIT_FLUSH_LEN)
            .map(|i| build_command(false, false, i % 2 == 1, false))
            .collect();
        write_all(&mut self.ft, &buf)?;

        let mut scratch = [0u8; 64];
        for _ in 0..MAX_RETRIES {
            if self.ft.read(&mut scratch)? == 0 {
                break;
            }
        }
        self.recv.clear();
        debug!("usb blaster queue drained");

        self.tms_seq(&[0xff], 5)
    }

    fn set_tck_freq(&mut self, hz: u64) -> Result<u64> {
        // TCK rate is fixed by the adapter firmware
        Ok(hz)
    }

    fn tms_seq(&mut self, tms: &[u8], num_bits: usize) -> Result<()> {
        let mut buf = Vec::with_capacity(num_bits * 2 + 1);
        let mut bit = false;
        for i in 0..num_bits {
            bit = get_bit(tms, i);
            buf.push(build_command(bit, false, false, false));
            buf.push(build_command(bit, false, true, false));
        }
        buf.push(build_command(bit, false, false, false));
        self.send(&buf, 0)
    }

    fn scan_chain_send(&mut self, tdi: &[u8], num_bits: usize, exits_shift: bool, read: bool)
        -> Result<()>
    {
        let bulk_bits = num_bits - exits_shift as usize;
        let bytes = bulk_bits / 8;
        let read_flag = if read { READ_CMD } else { 0 };

        for chunk in tdi[..bytes].chunks(MAX_SHIFT_BYTES) {
            let mut buf = Vec::with_capacity(chunk.len() + 1);
            buf.push(BYTE_SHIFT | read_flag | chunk.len() as u8);
            buf.extend_from_slice(chunk);
            trace!("byte shift {} bytes", chunk.len());
            self.send(&buf, if read { chunk.len() } else { 0 })?;
        }

        let rest = bulk_bits % 8;
        if rest > 0 {
            let mut buf = Vec::with_capacity(rest * 2);
            for i in bytes * 8..bulk_bits {
                let bit = get_bit(tdi, i);
                buf.push(build_command(false, bit, false, false));
                buf.push(build_command(false, bit, true, read));
            }
            self.send(&buf, if read { rest } else { 0 })?;
        }

        if exits_shift {
            let bit = get_bit(tdi, num_bits - 1);
            let buf = [
                build_command(true, bit, false, false),
                build_command(true, bit, true, read),
                build_command(true, bit, false, false),
            ];
            self.send(&buf, read as usize)?;
        }
        Ok(())
    }

    fn scan_chain_recv(&mut self, num_bits: usize, exits_shift: bool) -> Result<Vec<u8>> {
        let bulk_bits = num_bits - exits_shift as usize;
        let bytes = bulk_bits / 8;
        let needed = bytes + bulk_bits % 8 + exits_shift as usize;
        if self.recv.len() < needed {
            return Err(Error::ShortRead {
                expected: needed,
                got: self.recv.len(),
            });
        }

        let mut tdo = vec![0u8; byte_len(num_bits)];
        for slot in &mut tdo[..bytes] {
            *slot = self.pop(needed)?;
        }
        for i in bytes * 8..num_bits {
            if self.pop(needed)? & 1 != 0 {
                tdo[i / 8] |= 1 << (i % 8);
            }
        }
        Ok(tdo)
    }

    fn clock_tck(&mut self, _times: usize) -> Result<()> {
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        self.ft.close()
    }
}
