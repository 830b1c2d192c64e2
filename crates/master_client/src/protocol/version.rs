//! Protocol versions negotiated at session start.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A wire protocol version.
///
/// Row encoders and decoders branch on the negotiated version to add, omit or
/// reorder fields as the master's schema evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion(u16);

impl ProtocolVersion {
    /// Baseline protocol.
    pub const V1: Self = Self(1);
    /// Adds optional row fields.
    pub const V2: Self = Self(2);
    /// Newest version this client speaks.
    pub const CURRENT: Self = Self::V2;
    /// Versions offered during the handshake, newest first.
    pub const SUPPORTED: &'static [Self] = &[Self::V2, Self::V1];

    /// Create a version from its wire number.
    pub const fn new(number: u16) -> Self {
        Self(number)
    }

    /// The wire number.
    pub const fn number(self) -> u16 {
        self.0
    }

    /// Whether this client can speak `self`.
    pub fn is_supported(self) -> bool {
        Self::SUPPORTED.contains(&self)
    }

    /// Pick the newest version both sides support.
    pub fn negotiate(offered: &[ProtocolVersion]) -> Option<ProtocolVersion> {
        offered.iter().copied().filter(|v| v.is_supported()).max()
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
