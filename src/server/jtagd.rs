//! The Intel jtagd / AJI client protocol.
//!
//! Frames carry a 2-byte big-endian header `(mux << 12) | (payload_len - 1)`.  A request
//! payload holds one or more records `{opcode, 0, be16 record_len}` followed by arguments;
//! integers are 4-byte big-endian and strings are a length byte followed by the text.  Each
//! request record gets one response record with the same layout, the opcode replaced by a
//! response code.  Right after accepting a client the server sends an unsolicited hello.
use std::io::Write;

use log::{debug, info, trace, warn};

use crate::bits::{byte_len, extract, paste};
use crate::server::{Bridge, RecvBuffer, Session};
use crate::statemachine::{JtagSM, JtagState};
use crate::taps::Chain;
use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 1309;

/// Largest payload one frame can describe.
pub const MAX_PAYLOAD: usize = 1 << 12;

const SIGNATURE: &[u8] = b"JTAG Server\r\n";
const SERVER_VERSION: u32 = 13;
const AUTH_NONE: u32 = 0;
const VERSION_INFO: &[u8] = b"1.0";
const SERVER_PATH: &[u8] = b"jtagd";
const HARDWARE_NAME: &[u8] = b"jtag-bridge";
const HARDWARE_PORT: &[u8] = b"usb";

/// The only chain this server drives.
const CHAIN_ID: u32 = 1;
/// Longest register access accepted, in bits.
const MAX_SCAN_BITS: usize = 16384;
const PARAM_JTAG_CLOCK: &[u8] = b"JtagClock";
const FLAG_READ: u32 = 1;

// Response codes
const AJI_NO_ERROR: u8 = 0;
const AJI_FAILURE: u8 = 1;
const AJI_INVALID_CHAIN_ID: u8 = 33;
const AJI_NOT_LOCKED: u8 = 35;
const AJI_NO_DEVICES: u8 = 37;
const AJI_BAD_TAP_POSITION: u8 = 39;
const AJI_INVALID_PARAMETER: u8 = 45;
const AJI_UNIMPLEMENTED: u8 = 126;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    GetHardware,
    LockChain,
    UnlockChain,
    ReadChain,
    OpenDevice,
    CloseDevice,
    LockDevice,
    UnlockDevice,
    GetParam,
    SetParam,
    AccessIr,
    AccessDr,
    RunIdle,
    AccessIr2,
    AccessDr2,
    GetVersionInfo,
    UseProtocolVersion,
}

impl Command {
    fn from_opcode(op: u8) -> Option<Self> {
        use Command::*;
        Some(match op {
            0x01 => GetHardware,
            0x02 => LockChain,
            0x03 => UnlockChain,
            0x04 => ReadChain,
            0x05 => OpenDevice,
            0x06 => CloseDevice,
            0x07 => LockDevice,
            0x08 => UnlockDevice,
            0x09 => GetParam,
            0x0a => SetParam,
            0x0b => AccessIr,
            0x0c => AccessDr,
            0x0d => RunIdle,
            0x11 => AccessIr2,
            0x12 => AccessDr2,
            0x83 => GetVersionInfo,
            0xfe => UseProtocolVersion,
            _ => return None,
        })
    }
}

pub fn encode_header(mux: u8, len: usize) -> [u8; 2] {
    debug_assert!((1..=MAX_PAYLOAD).contains(&len));
    (((mux as u16 & 0xf) << 12) | (len - 1) as u16).to_be_bytes()
}

/// `(mux, payload_len)`
pub fn decode_header(header: [u8; 2]) -> (u8, usize) {
    let h = u16::from_be_bytes(header);
    ((h >> 12) as u8, (h & 0xfff) as usize + 1)
}

/// Why a record could not be answered with `AJI_NO_ERROR`.
enum Fail {
    Code(u8),
    Fatal(Error),
}

impl From<Error> for Fail {
    fn from(e: Error) -> Self {
        match e {
            Error::Chain(msg) => {
                warn!("jtagd: {}", msg);
                Fail::Code(AJI_FAILURE)
            }
            e => Fail::Fatal(e),
        }
    }
}

type Handled = core::result::Result<(), Fail>;

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> core::result::Result<&'a [u8], Fail> {
        if self.data.len() < n {
            return Err(Fail::Code(AJI_INVALID_PARAMETER));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn int(&mut self) -> core::result::Result<u32, Fail> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn len(&mut self) -> core::result::Result<usize, Fail> {
        Ok(self.int()? as usize)
    }

    fn string(&mut self) -> core::result::Result<&'a [u8], Fail> {
        let n = self.bytes(1)?[0] as usize;
        self.bytes(n)
    }
}

/// A response record under construction.  The header is filled in by `finish`, once the
/// length is known.
struct Record {
    buf: Vec<u8>,
}

impl Record {
    fn new() -> Self {
        Self { buf: vec![0; 4] }
    }

    fn add_int(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn add_string(&mut self, s: &[u8]) {
        let n = s.len().min(0xff);
        self.buf.push(n as u8);
        self.buf.extend_from_slice(&s[..n]);
    }

    fn add_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn finish(mut self, code: u8) -> Vec<u8> {
        if code != AJI_NO_ERROR {
            self.buf.truncate(4);
        }
        let len = self.buf.len() as u16;
        self.buf[0] = code;
        self.buf[1] = 0;
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
        self.buf
    }
}

/// Pack `records` into frames of at most `MAX_PAYLOAD` bytes, never splitting a record.
fn frame_records(mux: u8, records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut payload: Vec<u8> = Vec::new();
    for record in records {
        if !payload.is_empty() && payload.len() + record.len() > MAX_PAYLOAD {
            out.extend_from_slice(&encode_header(mux, payload.len()));
            out.append(&mut payload);
        }
        payload.extend_from_slice(record);
    }
    if !payload.is_empty() {
        out.extend_from_slice(&encode_header(mux, payload.len()));
        out.append(&mut payload);
    }
    out
}

pub struct Jtagd {
    chain: Chain,
    chain_locked: bool,
    // Open device handles; handle `n` is slot `n - 1` and names a TAP position
    handles: Vec<Option<usize>>,
    locked_device: Option<u32>,
    clock_hz: u64,
}

impl Jtagd {
    /// `clock_hz` is what `JtagClock` reports until a client sets it.
    pub fn new(clock_hz: u64) -> Self {
        Self {
            chain: Chain::default(),
            chain_locked: false,
            handles: Vec::new(),
            locked_device: None,
            clock_hz,
        }
    }

    fn reset_session(&mut self) {
        self.chain_locked = false;
        self.handles.clear();
        self.locked_device = None;
    }

    fn check_chain(&self, id: u32) -> Handled {
        if id != CHAIN_ID {
            return Err(Fail::Code(AJI_INVALID_CHAIN_ID));
        }
        Ok(())
    }

    fn require_lock(&self) -> Handled {
        if !self.chain_locked {
            return Err(Fail::Code(AJI_NOT_LOCKED));
        }
        Ok(())
    }

    fn tap(&self, handle: u32) -> core::result::Result<usize, Fail> {
        let slot = (handle as usize).checked_sub(1);
        match slot.and_then(|s| self.handles.get(s).copied().flatten()) {
            Some(tap) => Ok(tap),
            None => Err(Fail::Code(AJI_INVALID_PARAMETER)),
        }
    }

    fn scan_len(&self, args: &mut Reader) -> core::result::Result<usize, Fail> {
        let bits = args.len()?;
        if bits == 0 || bits > MAX_SCAN_BITS {
            return Err(Fail::Code(AJI_INVALID_PARAMETER));
        }
        Ok(bits)
    }

    /// Run one command.  Arguments and results, all integers 32-bit:
    ///
    /// | command | arguments | result |
    /// |---|---|---|
    /// | GET_HARDWARE | | count, then per entry chain, name, port |
    /// | LOCK_CHAIN | chain, timeout | |
    /// | UNLOCK_CHAIN | chain | |
    /// | READ_CHAIN | chain | count, then per device idcode, irlen |
    /// | OPEN_DEVICE | chain, position | handle |
    /// | CLOSE_DEVICE, UNLOCK_DEVICE | handle | |
    /// | LOCK_DEVICE | handle, timeout | |
    /// | GET_PARAM | chain, name | value |
    /// | SET_PARAM | chain, name, value | value achieved |
    /// | ACCESS_IR | handle, instruction, flags | captured IR |
    /// | ACCESS_IR_2 | handle, bits, flags, IR bytes | bits, captured bytes |
    /// | ACCESS_DR | handle, bits, flags, DR bytes | bits, TDO bytes |
    /// | ACCESS_DR_2 | handle, bits, flags, write offset, write bits, read offset, read bits, write bytes | read bits, TDO bytes |
    /// | RUN_IDLE | handle, cycles | |
    ///
    /// Flag bit 0 asks for the captured bits; without it the result is a length of 0.
    fn dispatch(&mut self, jtag: &mut JtagSM, cmd: Command, args: &mut Reader, rec: &mut Record)
        -> Handled
    {
        match cmd {
            Command::GetVersionInfo => {
                rec.add_string(VERSION_INFO);
                rec.add_int(0);
                rec.add_string(SERVER_PATH);
            }
            Command::UseProtocolVersion => {
                // flags
                rec.add_int(0);
            }
            Command::GetHardware => {
                rec.add_int(1);
                rec.add_int(CHAIN_ID);
                rec.add_string(HARDWARE_NAME);
                rec.add_string(HARDWARE_PORT);
            }
            Command::LockChain => {
                self.check_chain(args.int()?)?;
                self.chain_locked = true;
            }
            Command::UnlockChain => {
                self.check_chain(args.int()?)?;
                self.require_lock()?;
                self.chain_locked = false;
                self.locked_device = None;
            }
            Command::ReadChain => {
                self.check_chain(args.int()?)?;
                self.require_lock()?;
                self.chain = Chain::detect(jtag)?;
                info!("jtagd chain scan found {} devices", self.chain.len());
                if self.chain.is_empty() {
                    return Err(Fail::Code(AJI_NO_DEVICES));
                }
                rec.add_int(self.chain.len() as u32);
                for tap in &self.chain.taps {
                    rec.add_int(tap.idcode);
                    rec.add_int(tap.irlen as u32);
                }
            }
            Command::OpenDevice => {
                self.check_chain(args.int()?)?;
                let position = args.len()?;
                if position >= self.chain.len() {
                    return Err(Fail::Code(AJI_BAD_TAP_POSITION));
                }
                self.handles.push(Some(position));
                rec.add_int(self.handles.len() as u32);
            }
            Command::CloseDevice => {
                let handle = args.int()?;
                self.tap(handle)?;
                self.handles[handle as usize - 1] = None;
                if self.locked_device == Some(handle) {
                    self.locked_device = None;
                }
            }
            Command::LockDevice => {
                let handle = args.int()?;
                self.tap(handle)?;
                self.require_lock()?;
                self.locked_device = Some(handle);
            }
            Command::UnlockDevice => {
                let handle = args.int()?;
                self.tap(handle)?;
                if self.locked_device == Some(handle) {
                    self.locked_device = None;
                }
            }
            Command::GetParam => {
                self.check_chain(args.int()?)?;
                if args.string()? != PARAM_JTAG_CLOCK {
                    return Err(Fail::Code(AJI_INVALID_PARAMETER));
                }
                rec.add_int(self.clock_hz.min(u32::MAX as u64) as u32);
            }
            Command::SetParam => {
                self.check_chain(args.int()?)?;
                if args.string()? != PARAM_JTAG_CLOCK {
                    return Err(Fail::Code(AJI_INVALID_PARAMETER));
                }
                let hz = args.int()?;
                if hz == 0 {
                    return Err(Fail::Code(AJI_INVALID_PARAMETER));
                }
                self.clock_hz = jtag.set_tck_freq(u64::from(hz))?;
                rec.add_int(self.clock_hz.min(u32::MAX as u64) as u32);
            }
            Command::AccessIr => {
                let tap = self.tap(args.int()?)?;
                let instruction = args.int()?;
                let flags = args.int()?;
                self.require_lock()?;
                let irlen = self.chain.taps.get(tap).map_or(0, |t| t.irlen);
                if irlen == 0 || irlen > 32 {
                    return Err(Fail::Code(AJI_INVALID_PARAMETER));
                }
                let captured = self.chain.write_ir(jtag, tap, &instruction.to_le_bytes())?;
                let mut word = [0u8; 4];
                word[..captured.len()].copy_from_slice(&captured);
                rec.add_int(if flags & FLAG_READ != 0 { u32::from_le_bytes(word) } else { 0 });
            }
            Command::AccessIr2 => {
                let tap = self.tap(args.int()?)?;
                let bits = self.scan_len(args)?;
                let flags = args.int()?;
                let ir = args.bytes(byte_len(bits))?;
                self.require_lock()?;
                if self.chain.taps.get(tap).map(|t| t.irlen) != Some(bits) {
                    return Err(Fail::Code(AJI_INVALID_PARAMETER));
                }
                let captured = self.chain.write_ir(jtag, tap, ir)?;
                if flags & FLAG_READ != 0 {
                    rec.add_int(bits as u32);
                    rec.add_bytes(&captured);
                } else {
                    rec.add_int(0);
                }
            }
            Command::AccessDr => {
                let tap = self.tap(args.int()?)?;
                let bits = self.scan_len(args)?;
                let flags = args.int()?;
                let dr = args.bytes(byte_len(bits))?;
                self.require_lock()?;
                let tdo = self.chain.write_dr(jtag, tap, dr, bits)?;
                if flags & FLAG_READ != 0 {
                    rec.add_int(bits as u32);
                    rec.add_bytes(&tdo);
                } else {
                    rec.add_int(0);
                }
            }
            Command::AccessDr2 => {
                let tap = self.tap(args.int()?)?;
                let bits = self.scan_len(args)?;
                let _flags = args.int()?;
                let write_offset = args.len()?;
                let write_len = args.len()?;
                let read_offset = args.len()?;
                let read_len = args.len()?;
                if write_offset.saturating_add(write_len) > bits
                    || read_offset.saturating_add(read_len) > bits
                {
                    return Err(Fail::Code(AJI_INVALID_PARAMETER));
                }
                let write = args.bytes(byte_len(write_len))?;
                self.require_lock()?;

                let mut dr = vec![0u8; byte_len(bits)];
                if write_len > 0 {
                    paste(&mut dr, write_offset, write_offset + write_len, write);
                }
                let tdo = self.chain.write_dr(jtag, tap, &dr, bits)?;
                rec.add_int(read_len as u32);
                if read_len > 0 {
                    rec.add_bytes(&extract(&tdo, read_offset, read_offset + read_len));
                }
            }
            Command::RunIdle => {
                self.tap(args.int()?)?;
                let cycles = args.len()?;
                self.require_lock()?;
                jtag.change_mode(JtagState::RunTestIdle)?;
                jtag.clock_tck(cycles)?;
            }
        }
        Ok(())
    }

    /// Answer every record of one request payload.
    fn handle_payload(&mut self, jtag: &mut JtagSM, mut payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut responses = Vec::new();
        while !payload.is_empty() {
            if payload.len() < 4 {
                return Err(Error::Protocol(format!("{} stray bytes after jtagd records", payload.len())));
            }
            let len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
            if len < 4 || len > payload.len() {
                return Err(Error::Protocol(format!("jtagd record length {}", len)));
            }
            let (record, rest) = payload.split_at(len);
            payload = rest;

            let op = record[0];
            let mut rec = Record::new();
            let code = match Command::from_opcode(op) {
                None => {
                    debug!("Unrecognized jtagd command: {:#04x}", op);
                    AJI_UNIMPLEMENTED
                }
                Some(cmd) => {
                    debug!("jtagd {:?}", cmd);
                    let mut args = Reader { data: &record[4..] };
                    match self.dispatch(jtag, cmd, &mut args, &mut rec) {
                        Ok(()) => AJI_NO_ERROR,
                        Err(Fail::Code(code)) => {
                            debug!("jtagd {:?} failed with {}", cmd, code);
                            code
                        }
                        Err(Fail::Fatal(e)) => return Err(e),
                    }
                }
            };
            responses.push(rec.finish(code));
        }
        Ok(responses)
    }
}

impl Bridge for Jtagd {
    fn name(&self) -> &'static str {
        "jtagd"
    }

    fn buffer_len(&self) -> usize {
        2 * (2 + MAX_PAYLOAD)
    }

    fn on_connect(&mut self, _jtag: &mut JtagSM, out: &mut dyn Write) -> Result<()> {
        self.reset_session();
        let mut hello = Vec::with_capacity(1 + SIGNATURE.len() + 8);
        hello.push(SIGNATURE.len() as u8);
        hello.extend_from_slice(SIGNATURE);
        hello.extend_from_slice(&SERVER_VERSION.to_be_bytes());
        hello.extend_from_slice(&AUTH_NONE.to_be_bytes());
        out.write_all(&encode_header(0, hello.len()))?;
        out.write_all(&hello)?;
        debug!("Sent hello message");
        Ok(())
    }

    fn on_data(&mut self, jtag: &mut JtagSM, input: &mut RecvBuffer, out: &mut dyn Write)
        -> Result<Session>
    {
        while input.len() >= 2 {
            let data = input.as_slice();
            let (mux, len) = decode_header([data[0], data[1]]);
            if data.len() < 2 + len {
                break;
            }
            trace!("jtagd frame mux {} len {}", mux, len);
            let payload = data[2..2 + len].to_vec();
            input.consume(2 + len);

            let responses = self.handle_payload(jtag, &payload)?;
            out.write_all(&frame_records(mux, &responses))?;
        }
        Ok(Session::Continue)
    }

    fn on_disconnect(&mut self, _jtag: &mut JtagSM) {
        self.reset_session();
    }
}
