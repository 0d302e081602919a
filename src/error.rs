//! Error type shared by the adapter layer and the protocol bridges.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "d2xx")]
    #[error("FTDI driver error: {0}")]
    Ftdi(#[from] libftd2xx::FtStatus),

    #[error("no FTDI device {vid:04x}:{pid:04x} on channel {channel}")]
    DeviceNotFound { vid: u16, pid: u16, channel: char },

    #[error("adapter read returned {got} of {expected} bytes")]
    ShortRead { expected: usize, got: usize },

    #[error("adapter write accepted {got} of {expected} bytes")]
    ShortWrite { expected: usize, got: usize },

    #[error("{requested} bytes do not fit in a {capacity} byte buffer")]
    BufferOverflow { capacity: usize, requested: usize },

    #[error("{bits} bits need {needed} bytes but only {actual} were supplied")]
    BufferTooShort { bits: usize, needed: usize, actual: usize },

    #[error("scan chain receive #{got} issued while #{expected} is outstanding")]
    ReceiveOrder { expected: u64, got: u64 },

    #[error("scan chain discovery failed: {0}")]
    Chain(String),

    #[error("malformed client request: {0}")]
    Protocol(String),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
