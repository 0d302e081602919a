//! Scan chain discovery, and access to one TAP of a daisy chain as if it were the only TAP
//! present.  Devices are indexed from the one nearest TDI.
use log::{debug, info, warn};

use crate::bits::{byte_len, extract, get_bit, paste};
use crate::statemachine::{JtagSM, JtagState};
use crate::{Error, Result};

/// Most TAPs the prober will count.
pub const MAX_TAPS: usize = 8;
/// Longest instruction register assumed while flooding the chain with BYPASS.
pub const MAX_IR: usize = 16;

const MAX_IR_BITS: usize = MAX_TAPS * MAX_IR;

/// Count the devices on the chain and read their IDCODEs, index 0 nearest TDI.  Every device is
/// assumed to select IDCODE after reset; a BYPASS-only device skews the words read behind it.
pub fn probe_devices(sm: &mut JtagSM) -> Result<Vec<u32>> {
    // Every device in BYPASS is a one bit delay line
    sm.mode_reset()?;
    sm.change_mode(JtagState::ShiftIR)?;
    sm.scan_chain_write(&[0xff; MAX_IR_BITS / 8], MAX_IR_BITS, true)?;
    sm.change_mode(JtagState::ShiftDR)?;
    sm.scan_chain_write(&[0x00; byte_len(MAX_TAPS)], MAX_TAPS, false)?;
    let tdo = sm
        .scan_chain(&[0xff; byte_len(MAX_TAPS)], MAX_TAPS, true, true)?
        .unwrap_or_default();

    let count = match (0..MAX_TAPS).find(|i| get_bit(&tdo, *i)) {
        Some(count) => count,
        None => {
            warn!("no ones came back through BYPASS, chain is open or longer than {}", MAX_TAPS);
            0
        }
    };
    info!("Found {} devices on the chain", count);
    if count == 0 {
        sm.mode_reset()?;
        return Ok(Vec::new());
    }

    // Reset selects IDCODE; every device shifts out one 32-bit word
    sm.mode_reset()?;
    sm.change_mode(JtagState::ShiftDR)?;
    let bits = count * 32;
    let tdo = sm
        .scan_chain(&vec![0x00; byte_len(bits)], bits, true, true)?
        .unwrap_or_default();
    sm.mode_reset()?;

    let mut ids: Vec<u32> = tdo
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();

    // TDO delivers the device nearest to it first
    ids.reverse();
    for (i, id) in ids.iter().enumerate() {
        debug!("Device {} has IDCODE=0x{:08X}", i, id);
    }
    Ok(ids)
}

/// Find the instruction register length of each of `count` devices, index 0 nearest TDI.
///
/// Every IR captures `..01` on entry to Shift-IR.  The chain is read once for the captured
/// pattern and once more with a known fill to get the total length, and the pattern is split at
/// each set bit.
pub fn detect_ir_lengths(sm: &mut JtagSM, count: usize) -> Result<Vec<usize>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let ones = [0xff; MAX_IR_BITS / 8];

    sm.mode_reset()?;
    sm.change_mode(JtagState::ShiftIR)?;
    let captured = sm
        .scan_chain(&ones, MAX_IR_BITS, false, true)?
        .unwrap_or_default();
    sm.scan_chain_write(&[0x00; MAX_IR_BITS / 8], MAX_IR_BITS, false)?;
    let fill = sm
        .scan_chain(&ones, MAX_IR_BITS, true, true)?
        .unwrap_or_default();
    sm.mode_reset()?;

    let total = (0..MAX_IR_BITS)
        .find(|i| get_bit(&fill, *i))
        .ok_or_else(|| Error::Chain(format!("IR chain longer than {} bits", MAX_IR_BITS)))?;

    let starts: Vec<usize> = (0..total).filter(|i| get_bit(&captured, *i)).collect();
    if starts.first() != Some(&0) || starts.len() != count {
        return Err(Error::Chain(format!(
            "IR capture of {} bits does not split into {} devices",
            total, count
        )));
    }

    let mut lens: Vec<usize> = starts
        .iter()
        .zip(starts.iter().skip(1).chain(Some(&total)))
        .map(|(begin, end)| end - begin)
        .collect();
    lens.reverse();
    debug!("IR lengths {:?}", lens);
    Ok(lens)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tap {
    pub idcode: u32,
    pub irlen: usize,
}

/// The devices found by `Chain::detect`.  Accesses put every other TAP into BYPASS and pad the
/// shifted vectors so the selected TAP sees exactly the bits given.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    pub taps: Vec<Tap>,
}

impl Chain {
    pub fn detect(sm: &mut JtagSM) -> Result<Self> {
        let ids = probe_devices(sm)?;
        let lens = detect_ir_lengths(sm, ids.len())?;
        let taps = ids
            .into_iter()
            .zip(lens)
            .map(|(idcode, irlen)| Tap { idcode, irlen })
            .collect();
        Ok(Self { taps })
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    fn check(&self, tap: usize) -> Result<()> {
        if tap >= self.taps.len() {
            return Err(Error::Chain(format!("no TAP {} in a chain of {}", tap, self.taps.len())));
        }
        Ok(())
    }

    /// Shift `ir` into the instruction register of `tap`, BYPASS into the others, and return
    /// the bits `tap` captured.  Ends in Run-Test/Idle.
    pub fn write_ir(&self, sm: &mut JtagSM, tap: usize, ir: &[u8]) -> Result<Vec<u8>> {
        self.check(tap)?;
        let irlen = self.taps[tap].irlen;
        // TAPs nearer TDO take the first bits shifted in
        let offset: usize = self.taps[tap + 1..].iter().map(|t| t.irlen).sum();
        let total: usize = self.taps.iter().map(|t| t.irlen).sum();

        let mut tdi = vec![0xff; byte_len(total)];
        paste(&mut tdi, offset, offset + irlen, ir);
        sm.change_mode(JtagState::ShiftIR)?;
        let tdo = sm.scan_chain(&tdi, total, true, true)?.unwrap_or_default();
        sm.change_mode(JtagState::RunTestIdle)?;
        Ok(extract(&tdo, offset, offset + irlen))
    }

    /// Shift `bits` bits of `dr` through the data register of `tap`, with every other TAP
    /// assumed to be in BYPASS.  Returns what `tap` shifted out.  Ends in Run-Test/Idle.
    pub fn write_dr(&self, sm: &mut JtagSM, tap: usize, dr: &[u8], bits: usize) -> Result<Vec<u8>> {
        self.check(tap)?;
        if bits == 0 {
            return Ok(Vec::new());
        }
        let offset = self.taps.len() - tap - 1;
        let total = bits + self.taps.len() - 1;

        let mut tdi = vec![0x00; byte_len(total)];
        paste(&mut tdi, offset, offset + bits, dr);
        sm.change_mode(JtagState::ShiftDR)?;
        let tdo = sm.scan_chain(&tdi, total, true, true)?.unwrap_or_default();
        sm.change_mode(JtagState::RunTestIdle)?;
        Ok(extract(&tdo, offset, offset + bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cable::sim::{Device, SimChain, USER};

    fn sm(chain: SimChain) -> JtagSM {
        JtagSM::new(Box::new(chain))
    }

    #[test]
    fn single_device() {
        let mut sm = sm(SimChain::new(&[0x12345678]));
        assert_eq!(probe_devices(&mut sm).unwrap(), vec![0x12345678]);
        assert_eq!(sm.state(), JtagState::TestLogicReset);
    }

    #[test]
    fn order_is_nearest_tdi_first() {
        let mut sm = sm(SimChain::new(&[0x1000_0001, 0x2000_0003, 0x3000_0005]));
        assert_eq!(
            probe_devices(&mut sm).unwrap(),
            vec![0x1000_0001, 0x2000_0003, 0x3000_0005]
        );
    }

    #[test]
    fn even_idcode_is_read_whole() {
        let mut sm = sm(SimChain::new(&[0x0000_0001, 0x1234_5678]));
        assert_eq!(probe_devices(&mut sm).unwrap(), vec![0x0000_0001, 0x1234_5678]);

        let mut sm = self::sm(SimChain::new(&[0x1234_5678, 0x0000_0002, 0x4ba0_0477]));
        assert_eq!(
            probe_devices(&mut sm).unwrap(),
            vec![0x1234_5678, 0x0000_0002, 0x4ba0_0477]
        );
    }

    #[test]
    fn bypass_only_device_is_counted() {
        let chain = SimChain::with_devices(vec![
            Device::new(5, Some(0x0362_d093)),
            Device::new(4, None),
            Device::new(6, Some(0x4ba0_0477)),
        ]);
        let mut sm = sm(chain);
        let ids = probe_devices(&mut sm).unwrap();
        assert_eq!(ids.len(), 3);
        // nothing sits between the last device and TDO
        assert_eq!(ids[2], 0x4ba0_0477);
        // the one-bit BYPASS register delays the word behind it
        assert_eq!(ids[1], 0x0362_d093 << 1);
    }

    #[test]
    fn open_chain_has_no_devices() {
        for level in [false, true] {
            let mut sm = sm(SimChain::open(level));
            assert!(probe_devices(&mut sm).unwrap().is_empty());
            assert_eq!(sm.state(), JtagState::TestLogicReset);
        }
    }

    #[test]
    fn empty_chain() {
        let mut sm = sm(SimChain::with_devices(Vec::new()));
        assert!(probe_devices(&mut sm).unwrap().is_empty());
    }

    #[test]
    fn ir_lengths() {
        let chain = SimChain::with_devices(vec![
            Device::new(5, Some(0x0000_0001)),
            Device::new(8, Some(0x0000_0003)),
            Device::new(4, None),
        ]);
        let mut sm = sm(chain);
        assert_eq!(detect_ir_lengths(&mut sm, 3).unwrap(), vec![5, 8, 4]);
        assert!(detect_ir_lengths(&mut sm, 2).is_err());
    }

    #[test]
    fn detect_then_access_one_tap() {
        let chain = SimChain::with_devices(vec![
            Device::new(5, Some(0x0000_0011)),
            Device::new(8, Some(0x0000_0023)),
            Device::new(6, Some(0x0000_0035)),
        ]);
        let mut sm = sm(chain);
        let chain = Chain::detect(&mut sm).unwrap();
        assert_eq!(
            chain.taps,
            vec![
                Tap { idcode: 0x11, irlen: 5 },
                Tap { idcode: 0x23, irlen: 8 },
                Tap { idcode: 0x35, irlen: 6 },
            ]
        );

        // the IR capture pattern comes back
        let captured = chain.write_ir(&mut sm, 1, &[USER as u8]).unwrap();
        assert_eq!(captured, vec![0b01]);
        assert_eq!(sm.state(), JtagState::RunTestIdle);

        assert_eq!(chain.write_dr(&mut sm, 1, &[0xa5], 8).unwrap(), vec![0x00]);
        assert_eq!(chain.write_dr(&mut sm, 1, &[0x3c], 8).unwrap(), vec![0xa5]);
        assert!(chain.write_dr(&mut sm, 3, &[0], 1).is_err());
    }
}
