//! Error types for the ECH gateway

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("ECH error: {0}")]
    Ech(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),

    #[error("pipe listener closed")]
    PipeClosed,

    #[error("server closed")]
    ServerClosed,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
