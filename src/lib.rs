//! This crate shares one physical JTAG adapter with a debugger running elsewhere.  The
//! debugger connects over TCP and speaks one of four protocols: OpenOCD remote_bitbang,
//! OpenOCD jtag_vpi, Xilinx Virtual Cable, or the Intel jtagd client protocol.
//!
//! At the lowest level sits the Cable trait, implemented by the FTDI MPSSE backend and by a
//! USB-Blaster style bitbang backend.  Both sit on a Transport, the raw byte pipe to the USB
//! device, so they can be driven by a scripted mock in tests.
//!
//! Above that, JtagSM keeps track of the TAP state, moves between states with the fewest TMS
//! clocks, and hands out a PendingRead for every scan whose TDO must be collected later.  The
//! region module splits a client's TMS/TDI vector into TMS-only moves and data shifts, so
//! bridges can send each run to the adapter with the best command for it.
//!
//! The taps module probes the chain for devices, IDCODEs and IR lengths, and accesses one TAP
//! with the others in BYPASS.  The server module owns the listening socket and the bridges.
//!
//! # Example
//! ```no_run
//! use jtag_bridge::cable::d2xx;
//! use jtag_bridge::cable::mpsse::{Layout, Mpsse};
//! use jtag_bridge::statemachine::JtagSM;
//! use jtag_bridge::taps::Chain;
//!
//! let ft = d2xx::open_mpsse(0x0403, 0x6011, 'A')?;
//! let mut jtag = JtagSM::new(Box::new(Mpsse::new(ft, Layout::Generic, 1_000_000)));
//! jtag.init()?;
//! let chain = Chain::detect(&mut jtag)?;
//! for tap in &chain.taps {
//!     println!("{:08x} ir={}", tap.idcode, tap.irlen);
//! }
//! # Ok::<(), jtag_bridge::Error>(())
//! ```

pub mod bits;
pub mod cable;
pub mod error;
pub mod region;
pub mod server;
pub mod statemachine;
pub mod taps;

pub use error::{Error, Result};
