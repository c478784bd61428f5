//! Verdict lattice and structured decision reasons

use serde::{Deserialize, Serialize};
use std::fmt;

/// Decision applied to a packet or cached on a connection.
///
/// The numeric order is the monotonic verdict order: once a connection's
/// verdict reached some level it never moves below it again. Reroute
/// verdicts never downgrade to a plain accept, block and drop never
/// downgrade to a reroute, and `Failed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Verdict {
    /// No decision yet
    Undecided = 0,
    /// Let the packet pass
    Accept = 1,
    /// Redirect the flow into the encrypted overlay tunnel
    RerouteToTunnel = 2,
    /// Redirect the flow to the local nameserver
    RerouteToNameserver = 3,
    /// Reject the packet, visible to the sender
    Block = 4,
    /// Discard the packet silently
    Drop = 5,
    /// Decision process failed, packet is discarded
    Failed = 6,
}

impl Verdict {
    /// Whether the driver has a permanent variant of this verdict.
    #[inline]
    pub fn supports_permanent(self) -> bool {
        matches!(self, Verdict::Accept | Verdict::Block | Verdict::Drop)
    }

    /// Short lowercase name, used in log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Undecided => "undecided",
            Verdict::Accept => "accept",
            Verdict::RerouteToTunnel => "reroute-to-tunnel",
            Verdict::RerouteToNameserver => "reroute-to-nameserver",
            Verdict::Block => "block",
            Verdict::Drop => "drop",
            Verdict::Failed => "failed",
        }
    }
}

impl Default for Verdict {
    fn default() -> Self {
        Verdict::Undecided
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured explanation attached to a verdict
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reason {
    /// Human readable message
    pub msg: String,
    /// Configuration option that produced the decision, if any
    pub option_key: Option<String>,
}

impl Reason {
    /// Reason with a message only
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            option_key: None,
        }
    }

    /// Reason tied to a configuration option
    pub fn from_option(msg: impl Into<String>, option_key: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            option_key: Some(option_key.into()),
        }
    }

    /// True if no reason was recorded
    pub fn is_empty(&self) -> bool {
        self.msg.is_empty() && self.option_key.is_none()
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_order() {
        assert!(Verdict::Undecided < Verdict::Accept);
        assert!(Verdict::Accept < Verdict::RerouteToTunnel);
        assert!(Verdict::RerouteToTunnel < Verdict::RerouteToNameserver);
        assert!(Verdict::RerouteToNameserver < Verdict::Block);
        assert!(Verdict::Block < Verdict::Drop);
        assert!(Verdict::Drop < Verdict::Failed);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(Verdict::Block.to_string(), "block");
        assert_eq!(Verdict::RerouteToNameserver.to_string(), "reroute-to-nameserver");
        assert_eq!(Reason::new("blocked by rulebook").to_string(), "blocked by rulebook");
    }

    #[test]
    fn test_permanent_support() {
        assert!(Verdict::Accept.supports_permanent());
        assert!(Verdict::Block.supports_permanent());
        assert!(Verdict::Drop.supports_permanent());
        assert!(!Verdict::RerouteToNameserver.supports_permanent());
        assert!(!Verdict::RerouteToTunnel.supports_permanent());
        assert!(!Verdict::Failed.supports_permanent());
    }
}
