//! Open FTDI-based adapters through the vendor D2XX driver.
use std::time::Duration;

use libftd2xx::{BitMode, DeviceInfo, Ftdi, FtdiCommon};
use log::{debug, info};

use crate::cable::Transport;
use crate::{Error, Result};

const LATENCY: Duration = Duration::from_millis(1);
const TIMEOUT: Duration = Duration::from_millis(1000);

impl Transport for Ftdi {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(FtdiCommon::write(self, data)?)
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize> {
        Ok(FtdiCommon::read(self, data)?)
    }

    fn close(&mut self) -> Result<()> {
        self.set_bit_mode(0, BitMode::Reset)?;
        Ok(())
    }
}

// Multi-channel parts enumerate one entry per channel, suffixed "A", "B", ...
fn matches_channel(dev: &DeviceInfo, channel: char) -> bool {
    dev.serial_number.ends_with(channel) || dev.description.ends_with(channel)
}

/// Find and open channel `channel` of the first device with the given VID/PID.
pub fn open(vid: u16, pid: u16, channel: char) -> Result<Ftdi> {
    #[cfg(not(windows))]
    libftd2xx::set_vid_pid(vid, pid)?;

    let candidates: Vec<DeviceInfo> = libftd2xx::list_devices()?
        .into_iter()
        .filter(|d| d.vendor_id == vid && d.product_id == pid)
        .collect();
    for d in &candidates {
        debug!("found {:04x}:{:04x} {:?} {:?}", d.vendor_id, d.product_id, d.description, d.serial_number);
    }

    let dev = match candidates.len() {
        1 => candidates.first(),
        _ => candidates.iter().find(|d| matches_channel(d, channel)),
    }
    .ok_or(Error::DeviceNotFound { vid, pid, channel })?;

    info!("Open device vid=0x{:04x} pid=0x{:04x} {}", vid, pid, dev.description);
    let mut ft = Ftdi::with_serial_number(&dev.serial_number)?;
    ft.reset()?;
    ft.purge_all()?;
    ft.set_latency_timer(LATENCY)?;
    ft.set_timeouts(TIMEOUT, TIMEOUT)?;
    Ok(ft)
}

/// Open a device and switch it into MPSSE mode.
pub fn open_mpsse(vid: u16, pid: u16, channel: char) -> Result<Ftdi> {
    let mut ft = open(vid, pid, channel)?;
    ft.set_bit_mode(0, BitMode::Reset)?;
    ft.set_bit_mode(0, BitMode::Mpsse)?;
    Ok(ft)
}

/// Open a device in plain FIFO mode, as USB Blaster firmware expects.
pub fn open_fifo(vid: u16, pid: u16, channel: char) -> Result<Ftdi> {
    let mut ft = open(vid, pid, channel)?;
    ft.set_baud_rate(115_200)?;
    ft.set_bit_mode(0, BitMode::Reset)?;
    Ok(ft)
}
