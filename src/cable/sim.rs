//! Cables that never touch hardware, for unit tests.  `Recorder` logs every call and loops TDI
//! back as TDO; `SimChain` models a daisy chain of TAPs bit by bit.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::bits::{byte_len, get_bit};
use crate::cable::Cable;
use crate::statemachine::JtagState;
use crate::Result;

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Tms(Vec<u8>, usize),
    Scan {
        tdi: Vec<u8>,
        bits: usize,
        exits_shift: bool,
        read: bool,
    },
    Recv(usize),
    Clock(usize),
    Freq(u64),
    Flush,
}

#[derive(Default)]
pub struct Log {
    pub ops: Vec<Op>,
}

#[derive(Default)]
pub struct Recorder {
    log: Rc<RefCell<Log>>,
    pending: VecDeque<Vec<u8>>,
}

impl Recorder {
    pub fn log(&self) -> Rc<RefCell<Log>> {
        self.log.clone()
    }
}

impl Cable for Recorder {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_tck_freq(&mut self, hz: u64) -> Result<u64> {
        self.log.borrow_mut().ops.push(Op::Freq(hz));
        Ok(hz)
    }

    fn tms_seq(&mut self, tms: &[u8], num_bits: usize) -> Result<()> {
        let tms = tms[..byte_len(num_bits)].to_vec();
        self.log.borrow_mut().ops.push(Op::Tms(tms, num_bits));
        Ok(())
    }

    fn scan_chain_send(&mut self, tdi: &[u8], num_bits: usize, exits_shift: bool, read: bool)
        -> Result<()>
    {
        let tdi = tdi[..byte_len(num_bits)].to_vec();
        if read {
            self.pending.push_back(tdi.clone());
        }
        self.log.borrow_mut().ops.push(Op::Scan {
            tdi,
            bits: num_bits,
            exits_shift,
            read,
        });
        Ok(())
    }

    fn scan_chain_recv(&mut self, num_bits: usize, _exits_shift: bool) -> Result<Vec<u8>> {
        self.log.borrow_mut().ops.push(Op::Recv(num_bits));
        Ok(self.pending.pop_front().unwrap_or_default())
    }

    fn clock_tck(&mut self, times: usize) -> Result<()> {
        self.log.borrow_mut().ops.push(Op::Clock(times));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.log.borrow_mut().ops.push(Op::Flush);
        Ok(())
    }
}

pub const IDCODE: u64 = 0b0001;
pub const USER: u64 = 0b0010;

pub struct Device {
    ir_len: usize,
    idcode: Option<u32>,
    instr: u64,
    shift: u64,
    len: usize,
    /// An 8-bit data register selected by `USER`.
    pub user: u8,
}

impl Device {
    pub fn new(ir_len: usize, idcode: Option<u32>) -> Self {
        let mut dev = Self {
            ir_len,
            idcode,
            instr: 0,
            shift: 0,
            len: 1,
            user: 0,
        };
        dev.reset();
        dev
    }

    fn bypass(&self) -> u64 {
        (1 << self.ir_len) - 1
    }

    fn reset(&mut self) {
        self.instr = if self.idcode.is_some() { IDCODE } else { self.bypass() };
    }
}

pub struct SimChain {
    /// Index 0 is wired to TDI.
    pub devices: Vec<Device>,
    pub state: JtagState,
    tms: bool,
    // TDO pinned to a level, as on a broken or unpowered chain
    stuck_tdo: Option<bool>,
    pending: VecDeque<Vec<u8>>,
}

impl SimChain {
    /// A chain of 5-bit-IR devices with the given IDCODEs, index 0 nearest TDI.
    pub fn new(idcodes: &[u32]) -> Self {
        Self::with_devices(idcodes.iter().map(|id| Device::new(5, Some(*id))).collect())
    }

    pub fn with_devices(devices: Vec<Device>) -> Self {
        Self {
            devices,
            state: JtagState::TestLogicReset,
            tms: true,
            stuck_tdo: None,
            pending: VecDeque::new(),
        }
    }

    /// No devices, TDO held at `level`.
    pub fn open(level: bool) -> Self {
        Self {
            stuck_tdo: Some(level),
            ..Self::with_devices(Vec::new())
        }
    }

    /// One TCK rising edge.  Returns TDO as sampled on that edge.
    pub fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        let mut tdo = false;
        match self.state {
            JtagState::CaptureIR => {
                for d in &mut self.devices {
                    d.shift = 0b01;
                    d.len = d.ir_len;
                }
            }
            JtagState::CaptureDR => {
                for d in &mut self.devices {
                    if d.instr == IDCODE {
                        d.shift = d.idcode.unwrap_or(0) as u64;
                        d.len = 32;
                    } else if d.instr == USER {
                        d.shift = d.user as u64;
                        d.len = 8;
                    } else {
                        d.shift = 0;
                        d.len = 1;
                    }
                }
            }
            JtagState::ShiftIR | JtagState::ShiftDR => {
                let mut carry = tdi;
                for d in &mut self.devices {
                    let out = d.shift & 1 != 0;
                    d.shift = (d.shift >> 1) | ((carry as u64) << (d.len - 1));
                    carry = out;
                }
                tdo = carry;
            }
            _ => {}
        }

        let next = self.state.next(tms);
        match next {
            JtagState::UpdateIR => {
                for d in &mut self.devices {
                    d.instr = d.shift & d.bypass();
                }
            }
            JtagState::UpdateDR => {
                for d in &mut self.devices {
                    if d.instr == USER {
                        d.user = d.shift as u8;
                    }
                }
            }
            JtagState::TestLogicReset => {
                for d in &mut self.devices {
                    d.reset();
                }
            }
            _ => {}
        }
        self.state = next;
        self.tms = tms;
        self.stuck_tdo.unwrap_or(tdo)
    }
}

impl Cable for SimChain {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_tck_freq(&mut self, hz: u64) -> Result<u64> {
        Ok(hz)
    }

    fn tms_seq(&mut self, tms: &[u8], num_bits: usize) -> Result<()> {
        for i in 0..num_bits {
            self.clock(get_bit(tms, i), false);
        }
        Ok(())
    }

    fn scan_chain_send(&mut self, tdi: &[u8], num_bits: usize, exits_shift: bool, read: bool)
        -> Result<()>
    {
        let mut tdo = vec![0u8; byte_len(num_bits)];
        for i in 0..num_bits {
            let tms = exits_shift && i == num_bits - 1;
            if self.clock(tms, get_bit(tdi, i)) {
                tdo[i / 8] |= 1 << (i % 8);
            }
        }
        if read {
            self.pending.push_back(tdo);
        }
        Ok(())
    }

    fn scan_chain_recv(&mut self, _num_bits: usize, _exits_shift: bool) -> Result<Vec<u8>> {
        Ok(self.pending.pop_front().unwrap_or_default())
    }

    fn clock_tck(&mut self, times: usize) -> Result<()> {
        let tms = self.tms;
        for _ in 0..times {
            self.clock(tms, false);
        }
        Ok(())
    }
}
