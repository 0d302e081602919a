//! Implement the `Cable` trait for FTDI MPSSE based adapters (FT2232H, FT4232H, FT232H)
//!
//! Commands are collected in a bounded write-combine buffer and only pushed to the transport
//! when the buffer fills up or TDO has to be read back.  The chip answers strictly in command
//! order, so every read first flushes everything queued before it.
use ftdi_mpsse::{ClockBits, ClockBitsOut, ClockData, ClockDataOut, ClockTMS, ClockTMSOut};
use ftdi_mpsse::MpsseCmdBuilder;
use log::{debug, info};

use crate::bits::{byte_len, get_bit};
use crate::cable::{read_exact, write_all, Cable, Transport};
use crate::{Error, Result};

/// Size of the write-combine buffer.
pub const BUFFER_LEN: usize = 16384;
/// Clock feeding the TCK divider with divide-by-5 disabled.
pub const BASE_CLOCK_HZ: u64 = 60_000_000;

// Largest payload put in one clock-data command
const DATA_CHUNK: usize = 4096;
// TMS commands carry at most 7 bits; bit 7 holds TDI
const TMS_CHUNK: usize = 7;

const TCK_DIVISOR: u8 = 0x86;
const DISABLE_CLK_DIV5: u8 = 0x8a;
const CLOCK_N_BITS: u8 = 0x8e;
const CLOCK_N8_BITS: u8 = 0x8f;

/// Initial level and direction of the 16 GPIO pins, low byte first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    /// TCK/TDI/TMS outputs, TDO input, GPIOL3 high.  Matches Xilinx-style FT2232/FT4232 boards.
    Generic,
    /// Digilent JTAG-HS2 buffer enables.
    DigilentHs2,
}

impl Layout {
    /// `(output, direction)`
    pub fn pins(self) -> (u16, u16) {
        match self {
            Layout::Generic => (0x0088, 0x008b),
            Layout::DigilentHs2 => (0x00e8, 0x60eb),
        }
    }
}

/// TCK divisor for `hz` and the frequency it really produces.
pub fn clock_divisor(hz: u64) -> (u16, u64) {
    let half = BASE_CLOCK_HZ / 2;
    let divisor = if hz == 0 {
        u16::MAX as u64
    } else {
        ((half + hz - 1) / hz).saturating_sub(1).min(u16::MAX as u64)
    };
    (divisor as u16, BASE_CLOCK_HZ / ((1 + divisor) * 2))
}

pub struct Mpsse<T> {
    ft: T,
    layout: Layout,
    freq_hz: u64,
    // Commands not yet handed to the transport
    buffer: Vec<u8>,
}

impl<T: Transport> Mpsse<T> {
    /// Wrap a transport that is already switched into MPSSE mode.  `freq_hz` is applied by
    /// `init`.
    pub fn new(ft: T, layout: Layout, freq_hz: u64) -> Self {
        Self {
            ft,
            layout,
            freq_hz,
            buffer: Vec::with_capacity(BUFFER_LEN),
        }
    }

    fn append(&mut self, cmd: &[u8]) -> Result<()> {
        if cmd.len() >= BUFFER_LEN {
            return Err(Error::BufferOverflow {
                capacity: BUFFER_LEN,
                requested: cmd.len(),
            });
        }
        if self.buffer.len() + cmd.len() >= BUFFER_LEN {
            self.flush_buffer()?;
        }
        self.buffer.extend_from_slice(cmd);
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        debug!("mpsse flush {} bytes", self.buffer.len());
        let res = write_all(&mut self.ft, &self.buffer);
        self.buffer.clear();
        res
    }
}

impl<T: Transport> Cable for Mpsse<T> {
    fn init(&mut self) -> Result<()> {
        let (output, direction) = self.layout.pins();
        let builder = MpsseCmdBuilder::new()
            .set_gpio_lower(output as u8, direction as u8)
            .set_gpio_upper((output >> 8) as u8, (direction >> 8) as u8)
            .disable_3phase_data_clocking()
            .disable_adaptive_data_clocking()
            .send_immediate();
        write_all(&mut self.ft, builder.as_slice())?;
        self.set_tck_freq(self.freq_hz)?;
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        self.flush_buffer()?;
        self.ft.close()
    }

    fn set_tck_freq(&mut self, hz: u64) -> Result<u64> {
        self.flush_buffer()?;
        let (divisor, actual) = clock_divisor(hz);
        info!("Requested jtag tck: {} Hz, actual: {} Hz", hz, actual);
        let [lo, hi] = divisor.to_le_bytes();
        write_all(&mut self.ft, &[TCK_DIVISOR, lo, hi, DISABLE_CLK_DIV5])?;
        self.freq_hz = actual;
        Ok(actual)
    }

    fn tck_freq(&self) -> Option<u64> {
        Some(self.freq_hz)
    }

    fn tms_seq(&mut self, tms: &[u8], num_bits: usize) -> Result<()> {
        let mut pos = 0;
        while pos < num_bits {
            let count = TMS_CHUNK.min(num_bits - pos);
            let mut chunk = 0u8;
            for i in 0..count {
                if get_bit(tms, pos + i) {
                    chunk |= 1 << i;
                }
            }
            let builder = MpsseCmdBuilder::new()
                .clock_tms_out(ClockTMSOut::NegEdge, chunk, false, count as u8);
            self.append(builder.as_slice())?;
            pos += count;
        }
        Ok(())
    }

    fn scan_chain_send(&mut self, tdi: &[u8], num_bits: usize, exits_shift: bool, read: bool)
        -> Result<()>
    {
        // With exits_shift the last bit goes out with the TMS command below
        let bulk_bits = num_bits - exits_shift as usize;
        let bytes = bulk_bits / 8;
        let rest = bulk_bits % 8;

        for chunk in tdi[..bytes].chunks(DATA_CHUNK) {
            let builder = if read {
                MpsseCmdBuilder::new().clock_data(ClockData::LsbPosIn, chunk)
            } else {
                MpsseCmdBuilder::new().clock_data_out(ClockDataOut::LsbNeg, chunk)
            };
            self.append(builder.as_slice())?;
        }

        let mut builder = MpsseCmdBuilder::new();
        if rest > 0 {
            builder = if read {
                builder.clock_bits(ClockBits::LsbPosIn, tdi[bytes], rest as u8)
            } else {
                builder.clock_bits_out(ClockBitsOut::LsbNeg, tdi[bytes], rest as u8)
            };
        }
        if exits_shift {
            let last = get_bit(tdi, num_bits - 1);
            builder = if read {
                builder.clock_tms(ClockTMS::NegTMSPosTDO, 0x01, last, 1)
            } else {
                builder.clock_tms_out(ClockTMSOut::NegEdge, 0x01, last, 1)
            };
        }
        self.append(builder.as_slice())
    }

    fn scan_chain_recv(&mut self, num_bits: usize, exits_shift: bool) -> Result<Vec<u8>> {
        let bulk_bits = num_bits - exits_shift as usize;
        let bulk_len = byte_len(bulk_bits);

        let builder = MpsseCmdBuilder::new().send_immediate();
        self.append(builder.as_slice())?;
        self.flush_buffer()?;

        let mut raw = vec![0u8; bulk_len + exits_shift as usize];
        read_exact(&mut self.ft, &mut raw)?;

        let mut tdo = raw[..bulk_len].to_vec();
        if bulk_bits % 8 != 0 {
            // a partial byte is sampled into its top bits
            tdo[bulk_bits / 8] >>= 8 - (bulk_bits % 8);
        }
        if exits_shift {
            // the TMS command samples its single bit into bit 7
            tdo.resize(byte_len(num_bits), 0);
            let last = (raw[bulk_len] >> 7) & 1;
            tdo[(num_bits - 1) / 8] |= last << ((num_bits - 1) % 8);
        }
        Ok(tdo)
    }

    fn clock_tck(&mut self, times: usize) -> Result<()> {
        let mut bytes = times / 8;
        while bytes > 0 {
            let n = bytes.min(0x10000);
            let [lo, hi] = ((n - 1) as u16).to_le_bytes();
            self.append(&[CLOCK_N8_BITS, lo, hi])?;
            bytes -= n;
        }
        if times % 8 != 0 {
            self.append(&[CLOCK_N_BITS, (times % 8 - 1) as u8])?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_buffer()
    }
}
