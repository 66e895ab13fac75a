//! Peer identity primitives: `PeerAddress` and `PeerHint`.

use std::fmt;

/// Opaque stable identifier for a BLE peer as exposed by the platform driver
/// (commonly a UUID or MAC address string). Equality defines the key for
/// every `LinkLedger` map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(pub String);

impl PeerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerAddress {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Short opaque token broadcast alongside advertisements, letting a
/// rotated-MAC peer be recognised across address changes.
///
/// `PeerHint::NO_HINT` is the reserved sentinel meaning "peer publishes no
/// hint" — it participates in equality/ordering like any other value, so
/// callers must check [`PeerHint::is_no_hint`] rather than relying on
/// `Option`-style absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHint(pub [u8; 8]);

impl PeerHint {
    pub const NO_HINT: PeerHint = PeerHint([0u8; 8]);

    pub fn is_no_hint(&self) -> bool {
        *self == Self::NO_HINT
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Hex-encodes the hint for logging/token comparisons.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_hint() {
            write!(f, "<no-hint>")
        } else {
            write!(f, "{}", self.to_hex())
        }
    }
}
