use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected 6 octets, found {0}")]
    OctetCount(usize),

    #[error("octet '{0}' is not two hex digits")]
    InvalidOctet(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid MAC address '{text}': {source}")]
    InvalidMac {
        text: String,
        #[source]
        source: ParseError,
    },

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },

    #[error("cannot expand config path '{0}'")]
    ExpandPath(String),

    #[error("timeout must be at least one second")]
    ZeroTimeout,
}

/// Everything that can go wrong while talking to the BMC.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("cannot resolve controller address {0}")]
    Resolve(String),

    #[error("network error: {0}")]
    Io(#[from] io::Error),

    #[error("no response from controller")]
    NoResponse,

    #[error("controller deadline exceeded")]
    Timeout,

    #[error("authentication failed: {0}")]
    Auth(&'static str),

    #[error("session rejected by controller (status {0:#04x})")]
    SessionRejected(u8),

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("command rejected with completion code {0:#04x}")]
    Completion(u8),

    #[error("crypto error: {0}")]
    Crypto(&'static str),
}
