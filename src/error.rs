//! Error types for the firewall core

use thiserror::Error;

/// Firewall core error type
#[derive(Error, Debug)]
pub enum FirewallError {
    /// A verdict was already applied to this packet
    #[error("verdict already applied to packet")]
    VerdictAlreadyApplied,

    /// Packet payload was accessed before being loaded
    #[error("packet payload not loaded")]
    PayloadNotLoaded,

    /// Packet data too short for the claimed layers
    #[error("truncated packet: {0}")]
    TruncatedPacket(&'static str),

    /// Driver rejected or failed an operation
    #[error("driver error: {0}")]
    Driver(String),

    /// The packet channel is closed
    #[error("packet channel closed")]
    ChannelClosed,

    /// The nameserver IP matcher was set twice
    #[error("nameserver IP matcher already set")]
    MatcherAlreadySet,

    /// Interception was started twice
    #[error("interception already started")]
    AlreadyStarted,

    /// A collaborator did not answer within its deadline
    #[error("collaborator deadline exceeded: {0}")]
    DeadlineExceeded(&'static str),

    /// Deep inspection failed on this packet
    #[error("inspection error: {0}")]
    Inspection(String),

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for the firewall core
pub type FirewallResult<T> = Result<T, FirewallError>;
