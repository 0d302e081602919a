use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use log::{debug, error, info, LevelFilter};
use signal_hook::consts::{SIGINT, SIGTERM};

use jtag_bridge::cable::mpsse::Layout;
use jtag_bridge::cable::Cable;
use jtag_bridge::server::{jtagd, rbb, vpi, xvc, Bridge, Server};
use jtag_bridge::statemachine::JtagSM;
use jtag_bridge::Result;

const TELEMETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Protocol {
    Rbb,
    Vpi,
    Xvc,
    Jtagd,
}

impl Protocol {
    fn default_port(self) -> u16 {
        match self {
            Protocol::Rbb => rbb::DEFAULT_PORT,
            Protocol::Vpi => vpi::DEFAULT_PORT,
            Protocol::Xvc => xvc::DEFAULT_PORT,
            Protocol::Jtagd => jtagd::DEFAULT_PORT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Adapter {
    Mpsse,
    UsbBlaster,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PinLayout {
    Generic,
    DigilentHs2,
}

impl From<PinLayout> for Layout {
    fn from(l: PinLayout) -> Self {
        match l {
            PinLayout::Generic => Layout::Generic,
            PinLayout::DigilentHs2 => Layout::DigilentHs2,
        }
    }
}

fn parse_hex(s: &str) -> core::result::Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("{}: {}", s, e))
}

fn parse_channel(s: &str) -> core::result::Result<char, String> {
    match s.to_ascii_uppercase().as_str() {
        c @ ("A" | "B" | "C" | "D") => Ok(c.chars().next().unwrap_or('A')),
        _ => Err(format!("channel must be one of A, B, C, D, not {}", s)),
    }
}

/// Share one USB JTAG adapter with a debugger over TCP.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Wire protocol served to the client
    #[arg(short, long, value_enum, default_value_t = Protocol::Vpi)]
    protocol: Protocol,

    /// TCP port, defaults to the protocol's usual port
    #[arg(long)]
    port: Option<u16>,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(short, long, value_enum, default_value_t = Adapter::Mpsse)]
    adapter: Adapter,

    /// MPSSE pin layout
    #[arg(long, value_enum, default_value_t = PinLayout::Generic)]
    layout: PinLayout,

    #[arg(long, value_parser = parse_hex, default_value = "0403")]
    vid: u16,

    #[arg(long, value_parser = parse_hex, default_value = "6011")]
    pid: u16,

    /// Interface of a multi-channel FTDI part
    #[arg(short, long, value_parser = parse_channel, default_value = "A")]
    channel: char,

    /// TCK frequency in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    freq: u64,

    /// Log everything down to individual bit vectors
    #[arg(short, long)]
    debug: bool,
}

#[cfg(feature = "d2xx")]
fn open_cable(args: &Args) -> Result<Box<dyn Cable>> {
    use jtag_bridge::cable::d2xx;
    use jtag_bridge::cable::mpsse::Mpsse;
    use jtag_bridge::cable::usbblaster::UsbBlaster;

    Ok(match args.adapter {
        Adapter::Mpsse => {
            let ft = d2xx::open_mpsse(args.vid, args.pid, args.channel)?;
            Box::new(Mpsse::new(ft, args.layout.into(), args.freq))
        }
        Adapter::UsbBlaster => {
            let ft = d2xx::open_fifo(args.vid, args.pid, args.channel)?;
            Box::new(UsbBlaster::new(ft))
        }
    })
}

#[cfg(not(feature = "d2xx"))]
fn open_cable(args: &Args) -> Result<Box<dyn Cable>> {
    error!("built without the d2xx feature, no USB adapters are available");
    Err(jtag_bridge::Error::DeviceNotFound {
        vid: args.vid,
        pid: args.pid,
        channel: args.channel,
    })
}

fn make_bridge(protocol: Protocol, freq: u64) -> Box<dyn Bridge> {
    match protocol {
        Protocol::Rbb => Box::new(rbb::RemoteBitbang::new()),
        Protocol::Vpi => Box::new(vpi::JtagVpi::new()),
        Protocol::Xvc => Box::new(xvc::Xvc::new()),
        Protocol::Jtagd => Box::new(jtagd::Jtagd::new(freq)),
    }
}

fn serve(jtag: &mut JtagSM, server: &mut Server, stop: &AtomicBool) -> Result<()> {
    let mut last_report = Instant::now();
    let mut last_bits = jtag.bits_sent();
    while !stop.load(Ordering::Relaxed) {
        server.tick(jtag)?;

        let elapsed = last_report.elapsed();
        if elapsed >= TELEMETRY_INTERVAL {
            let bits = jtag.bits_sent();
            if bits != last_bits {
                let rate = (bits - last_bits) as f64 / elapsed.as_secs_f64();
                debug!("{:.0} bits/s ({} bits total)", rate, bits);
            }
            last_bits = bits;
            last_report = Instant::now();
        }
    }
    info!("Stopping");
    Ok(())
}

fn run(args: &Args, stop: &AtomicBool) -> Result<()> {
    let cable = open_cable(args)?;
    let mut jtag = JtagSM::new(cable);
    jtag.init()?;
    let hz = jtag.tck_freq().unwrap_or(args.freq);

    let addr = SocketAddr::new(args.bind, args.port.unwrap_or(args.protocol.default_port()));
    let served = Server::bind(addr, make_bridge(args.protocol, hz))
        .and_then(|mut server| serve(&mut jtag, &mut server, stop));
    let closed = jtag.deinit();
    served?;
    closed
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug { LevelFilter::Trace } else { LevelFilter::Info })
        .parse_default_env()
        .format_timestamp(None)
        .init();

    let stop = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        if let Err(e) = signal_hook::flag::register(sig, Arc::clone(&stop)) {
            error!("cannot install handler for signal {}: {}", sig, e);
            return ExitCode::FAILURE;
        }
    }

    match run(&args, &stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
