//! Implementations for different JTAG hardware adapters live here.  Hardware adapters should
//! implement the `Cable` trait; the byte pipe underneath them implements `Transport`.
use log::warn;

use crate::{Error, Result};

#[cfg(feature = "d2xx")]
pub mod d2xx;
pub mod mpsse;
#[cfg(test)]
pub(crate) mod sim;
pub mod usbblaster;

/// How many partial transfers `read_exact` and `write_all` tolerate before giving up.
pub const MAX_RETRIES: usize = 100;
/// Consecutive empty transfers after which the adapter is taken to be gone.  Each one already
/// waited out the driver timeout.
pub const MAX_IDLE_RETRIES: usize = 3;

/// The capability set every adapter backend provides.  Callers above `JtagSM` never know which
/// backend is bound.
///
/// All bit vectors are packed LSB-first: bit `i` lives in byte `i / 8` at position `i % 8`.
pub trait Cable {
    /// Bring the adapter into JTAG mode.
    fn init(&mut self) -> Result<()>;

    /// Release the adapter.
    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Retune TCK.  Returns the frequency actually achieved, which may differ from `hz`.
    fn set_tck_freq(&mut self, hz: u64) -> Result<u64>;

    /// The TCK frequency currently programmed, for adapters that have a clock divider.
    fn tck_freq(&self) -> Option<u64> {
        None
    }

    /// Clock `num_bits` bits of `tms` out on TMS.
    fn tms_seq(&mut self, tms: &[u8], num_bits: usize) -> Result<()>;

    /// Shift `num_bits` bits of `tdi` out on TDI.  When `exits_shift` is set the last bit goes
    /// out together with TMS=1.  When `read` is set the sampled TDO must later be collected with
    /// exactly one `scan_chain_recv` carrying the same `num_bits` and `exits_shift`.
    fn scan_chain_send(&mut self, tdi: &[u8], num_bits: usize, exits_shift: bool, read: bool)
        -> Result<()>;

    /// Collect the TDO of the oldest outstanding `scan_chain_send` that requested a read.
    fn scan_chain_recv(&mut self, num_bits: usize, exits_shift: bool) -> Result<Vec<u8>>;

    /// Pulse TCK `times` times leaving TMS and TDI where they are.
    fn clock_tck(&mut self, times: usize) -> Result<()>;

    /// Push any buffered commands to the hardware.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The raw byte pipe to an adapter.  Both calls may transfer fewer bytes than asked.
pub trait Transport {
    fn write(&mut self, data: &[u8]) -> Result<usize>;
    fn read(&mut self, data: &mut [u8]) -> Result<usize>;

    /// Hand the device back in its power-on mode.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write(data)
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize> {
        (**self).read(data)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Write all of `data`, retrying partial writes at most `MAX_RETRIES` times and empty ones at
/// most `MAX_IDLE_RETRIES` times in a row.
pub fn write_all<T: Transport + ?Sized>(transport: &mut T, data: &[u8]) -> Result<()> {
    let mut sent = 0;
    let mut idle = 0;
    for _ in 0..MAX_RETRIES {
        if sent == data.len() || idle == MAX_IDLE_RETRIES {
            break;
        }
        let n = transport.write(&data[sent..])?;
        idle = if n == 0 { idle + 1 } else { 0 };
        sent += n;
    }
    if sent == data.len() {
        return Ok(());
    }
    warn!("adapter write stalled after {} of {} bytes", sent, data.len());
    Err(Error::ShortWrite {
        expected: data.len(),
        got: sent,
    })
}

/// Fill all of `data`, retrying partial reads at most `MAX_RETRIES` times and empty ones at most
/// `MAX_IDLE_RETRIES` times in a row.
pub fn read_exact<T: Transport + ?Sized>(transport: &mut T, data: &mut [u8]) -> Result<()> {
    let mut got = 0;
    let mut idle = 0;
    for _ in 0..MAX_RETRIES {
        if got == data.len() || idle == MAX_IDLE_RETRIES {
            break;
        }
        let n = transport.read(&mut data[got..])?;
        idle = if n == 0 { idle + 1 } else { 0 };
        got += n;
    }
    if got == data.len() {
        return Ok(());
    }
    warn!("adapter read stalled after {} of {} bytes", got, data.len());
    Err(Error::ShortRead {
        expected: data.len(),
        got,
    })
}
