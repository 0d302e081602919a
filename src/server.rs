//! TCP plumbing shared by the protocol bridges.  A `Server` owns the listening socket and at
//! most one client; each `tick` either accepts a client or hands whatever the client sent to the
//! bound `Bridge`.
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use log::{error, info, trace, warn};

use crate::statemachine::JtagSM;
use crate::{Error, Result};

pub mod jtagd;
pub mod rbb;
pub mod vpi;
pub mod xvc;

/// How long a tick waits for a client to connect or send before returning to the caller.  The
/// client is never dropped for being idle; this only bounds how late the stop flag is seen.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether the bridge wants to keep the client after a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Session {
    Continue,
    Close,
}

/// One wire protocol.  Implementations parse complete requests out of the receive buffer,
/// drive the adapter, and write replies.  Incomplete requests stay in the buffer until more
/// bytes arrive.
pub trait Bridge {
    /// Protocol name for log messages.
    fn name(&self) -> &'static str;

    /// Size of the receive buffer; must hold the largest request the protocol allows.
    fn buffer_len(&self) -> usize {
        4096
    }

    fn on_connect(&mut self, _jtag: &mut JtagSM, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    fn on_data(&mut self, jtag: &mut JtagSM, input: &mut RecvBuffer, out: &mut dyn Write)
        -> Result<Session>;

    fn on_disconnect(&mut self, _jtag: &mut JtagSM) {}
}

/// A fixed-capacity receive buffer.  Consumed bytes are dropped from the front and the rest is
/// moved down before each fill.
pub struct RecvBuffer {
    data: Vec<u8>,
    begin: usize,
    end: usize,
}

impl RecvBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            begin: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.begin..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        self.begin = (self.begin + n).min(self.end);
        if self.begin == self.end {
            self.begin = 0;
            self.end = 0;
        }
    }

    pub fn clear(&mut self) {
        self.begin = 0;
        self.end = 0;
    }

    fn compact(&mut self) {
        if self.begin > 0 {
            self.data.copy_within(self.begin..self.end, 0);
            self.end -= self.begin;
            self.begin = 0;
        }
    }

    /// Append `bytes`, failing if they do not fit next to what is already buffered.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        self.compact();
        if self.end + bytes.len() > self.data.len() {
            return Err(Error::BufferOverflow {
                capacity: self.data.len(),
                requested: self.len() + bytes.len(),
            });
        }
        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        Ok(())
    }

    /// One `read` into the free space.  Fails with `BufferOverflow` if there is no free space,
    /// which means the client sent a request larger than the protocol allows.
    pub fn fill<R: Read + ?Sized>(&mut self, src: &mut R) -> Result<usize> {
        self.compact();
        if self.end == self.data.len() {
            return Err(Error::BufferOverflow {
                capacity: self.data.len(),
                requested: self.data.len() + 1,
            });
        }
        let n = src.read(&mut self.data[self.end..])?;
        self.end += n;
        Ok(n)
    }
}

struct Client {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: RecvBuffer,
}

pub struct Server {
    listener: TcpListener,
    bridge: Box<dyn Bridge>,
    client: Option<Client>,
}

impl Server {
    pub fn bind(addr: SocketAddr, bridge: Box<dyn Bridge>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("Start {} server at {}", bridge.name(), listener.local_addr()?);
        Ok(Self {
            listener,
            bridge,
            client: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Service the client for one read, or try to accept one.  Client failures are logged and
    /// end the session; only listener failures are returned.
    pub fn tick(&mut self, jtag: &mut JtagSM) -> Result<()> {
        match self.client.take() {
            None => self.accept(jtag),
            Some(mut client) => {
                match self.service(jtag, &mut client) {
                    Ok(Session::Continue) => self.client = Some(client),
                    Ok(Session::Close) => self.detach(jtag, client),
                    Err(e) => {
                        error!("{} client {}: {}", self.bridge.name(), client.peer, e);
                        self.detach(jtag, client);
                    }
                }
                Ok(())
            }
        }
    }

    fn accept(&mut self, jtag: &mut JtagSM) -> Result<()> {
        let (stream, peer) = match self.listener.accept() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        stream.set_nonblocking(false)?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("set_nodelay: {}", e);
        }
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        info!("JTAG debugger attached from {}", peer);

        let mut client = Client {
            stream,
            peer,
            buffer: RecvBuffer::new(self.bridge.buffer_len()),
        };
        match self.bridge.on_connect(jtag, &mut client.stream) {
            Ok(()) => self.client = Some(client),
            Err(e) => {
                error!("{} client {}: {}", self.bridge.name(), peer, e);
                self.detach(jtag, client);
            }
        }
        Ok(())
    }

    fn service(&mut self, jtag: &mut JtagSM, client: &mut Client) -> Result<Session> {
        let n = match client.buffer.fill(&mut client.stream) {
            Ok(n) => n,
            Err(Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                return Ok(Session::Continue);
            }
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(Session::Close);
        }
        trace!("received {} bytes", n);

        let session = self
            .bridge
            .on_data(jtag, &mut client.buffer, &mut client.stream)?;
        jtag.flush()?;
        Ok(session)
    }

    fn detach(&mut self, jtag: &mut JtagSM, client: Client) {
        info!("JTAG debugger detached from {}", client.peer);
        self.bridge.on_disconnect(jtag);
        if let Err(e) = jtag.flush() {
            warn!("flush after detach: {}", e);
        }
    }
}
