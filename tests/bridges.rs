use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use jtag_bridge::bits::byte_len;
use jtag_bridge::cable::Cable;
use jtag_bridge::server::jtagd::{decode_header, Jtagd};
use jtag_bridge::server::rbb::RemoteBitbang;
use jtag_bridge::server::vpi::{JtagVpi, RECORD_LEN};
use jtag_bridge::server::xvc::Xvc;
use jtag_bridge::server::{Bridge, RecvBuffer, Server, Session};
use jtag_bridge::statemachine::{JtagSM, JtagState};
use jtag_bridge::Result;

#[derive(Default)]
struct Stats {
    tms_bits: usize,
    scans: usize,
    flushes: usize,
}

/// Wires TDI straight to TDO.
#[derive(Default)]
struct Loopback {
    stats: Rc<RefCell<Stats>>,
    pending: VecDeque<Vec<u8>>,
}

impl Cable for Loopback {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_tck_freq(&mut self, hz: u64) -> Result<u64> {
        Ok(hz)
    }

    fn tms_seq(&mut self, _tms: &[u8], num_bits: usize) -> Result<()> {
        self.stats.borrow_mut().tms_bits += num_bits;
        Ok(())
    }

    fn scan_chain_send(&mut self, tdi: &[u8], num_bits: usize, _exits_shift: bool, read: bool)
        -> Result<()>
    {
        self.stats.borrow_mut().scans += 1;
        if read {
            self.pending.push_back(tdi[..byte_len(num_bits)].to_vec());
        }
        Ok(())
    }

    fn scan_chain_recv(&mut self, _num_bits: usize, _exits_shift: bool) -> Result<Vec<u8>> {
        Ok(self.pending.pop_front().unwrap_or_default())
    }

    fn clock_tck(&mut self, _times: usize) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.stats.borrow_mut().flushes += 1;
        Ok(())
    }
}

fn loopback() -> (JtagSM, Rc<RefCell<Stats>>) {
    let cable = Loopback::default();
    let stats = cable.stats.clone();
    (JtagSM::new(Box::new(cable)), stats)
}

fn feed(bridge: &mut dyn Bridge, jtag: &mut JtagSM, bytes: &[u8]) -> Vec<u8> {
    let mut input = RecvBuffer::new(bridge.buffer_len());
    input.extend(bytes).unwrap();
    let mut out = Vec::new();
    assert_eq!(bridge.on_data(jtag, &mut input, &mut out).unwrap(), Session::Continue);
    out
}

/// Run the server on this thread while `client` talks to it from another.
fn with_server<F>(bridge: Box<dyn Bridge>, client: F) -> JtagSM
where
    F: FnOnce(SocketAddr) + Send + 'static,
{
    let (mut jtag, _) = loopback();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut server = Server::bind(addr, bridge).unwrap();
    let addr = server.local_addr().unwrap();

    let handle = thread::spawn(move || client(addr));
    let mut ticks = 0;
    while !(handle.is_finished() && !server.has_client()) {
        server.tick(&mut jtag).unwrap();
        ticks += 1;
        assert!(ticks < 400, "server never saw the client finish");
    }
    handle.join().unwrap();
    jtag
}

#[test]
fn xvc_over_tcp() {
    let jtag = with_server(Box::new(Xvc::new()), |addr| {
        let mut s = TcpStream::connect(addr).unwrap();
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        s.write_all(b"getinfo:").unwrap();
        let mut info = [0u8; 20];
        s.read_exact(&mut info).unwrap();
        assert_eq!(&info, b"xvcServer_v1.0:2048\n");

        // Reset -> Idle -> SelectDR -> CaptureDR -> ShiftDR, then 12 bits of data
        let mut cmd = b"shift:".to_vec();
        cmd.extend_from_slice(&16u32.to_le_bytes());
        cmd.extend_from_slice(&[0b0000_0010, 0x00]);
        cmd.extend_from_slice(&[0xa0, 0x5f]);
        s.write_all(&cmd).unwrap();
        let mut tdo = [0u8; 2];
        s.read_exact(&mut tdo).unwrap();
        assert_eq!(tdo, [0xa0, 0x5f]);
    });
    assert_eq!(jtag.state(), JtagState::ShiftDR);
}

#[test]
fn jtagd_hello_and_version_over_tcp() {
    with_server(Box::new(Jtagd::new(1_000_000)), |addr| {
        let mut s = TcpStream::connect(addr).unwrap();
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut header = [0u8; 2];
        s.read_exact(&mut header).unwrap();
        let (mux, len) = decode_header(header);
        assert_eq!((mux, len), (0, 22));
        let mut hello = vec![0u8; len];
        s.read_exact(&mut hello).unwrap();
        assert_eq!(&hello[1..14], b"JTAG Server\r\n");

        // GET_VERSION_INFO on mux 2
        s.write_all(&[0x20, 0x03, 0x83, 0x00, 0x00, 0x04]).unwrap();
        s.read_exact(&mut header).unwrap();
        let (mux, len) = decode_header(header);
        assert_eq!(mux, 2);
        let mut reply = vec![0u8; len];
        s.read_exact(&mut reply).unwrap();
        assert_eq!(reply[0], 0);
        assert_eq!(&reply[5..8], b"1.0");
    });
}

#[test]
fn failed_client_leaves_server_usable() {
    with_server(Box::new(Xvc::new()), |addr| {
        let mut s = TcpStream::connect(addr).unwrap();
        s.write_all(b"bogus:").unwrap();
        // the server hangs up on garbage
        let mut buf = [0u8; 1];
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(s.read(&mut buf).unwrap_or(0), 0);

        let mut s = TcpStream::connect(addr).unwrap();
        s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        s.write_all(b"getinfo:").unwrap();
        let mut info = [0u8; 20];
        s.read_exact(&mut info).unwrap();
        assert_eq!(&info, b"xvcServer_v1.0:2048\n");
    });
}

#[test]
fn rbb_loopback_reads() {
    let (mut jtag, stats) = loopback();
    let mut bridge = RemoteBitbang::new();
    // Reset -> Idle -> SelectDR -> CaptureDR -> ShiftDR
    assert!(feed(&mut bridge, &mut jtag, b"0426040404").is_empty());
    assert_eq!(jtag.state(), JtagState::ShiftDR);

    // TDI 1, 0, 1, last bit leaves ShiftDR with TDI 1
    let out = feed(&mut bridge, &mut jtag, b"1R50R41R53R7");
    assert_eq!(out, b"1011");
    assert_eq!(jtag.state(), JtagState::Exit1DR);
    assert_eq!(stats.borrow().scans, 1);
}

#[test]
fn vpi_loopback_scan() {
    let (mut jtag, stats) = loopback();
    let mut bridge = JtagVpi::new();

    let mut record = vec![0u8; RECORD_LEN];
    record[..4].copy_from_slice(&1u32.to_le_bytes());
    record[4] = 0b0010;
    record[RECORD_LEN - 4..].copy_from_slice(&5u32.to_le_bytes());
    // Reset -> Idle -> SelectDR -> CaptureDR -> ShiftDR -> ShiftDR
    assert!(feed(&mut bridge, &mut jtag, &record).is_empty());
    assert_eq!(jtag.state(), JtagState::ShiftDR);
    assert_eq!(stats.borrow().tms_bits, 5);

    let mut record = vec![0u8; RECORD_LEN];
    record[..4].copy_from_slice(&2u32.to_le_bytes());
    record[4] = 0x5a;
    record[RECORD_LEN - 4..].copy_from_slice(&8u32.to_le_bytes());
    let out = feed(&mut bridge, &mut jtag, &record);
    assert_eq!(out.len(), RECORD_LEN);
    assert_eq!(out[4 + 512], 0x5a);
    assert_eq!(jtag.state(), JtagState::ShiftDR);
}
