//! Error taxonomy for the connection core, one `thiserror` enum per
//! component boundary. Control-plane errors never cross component
//! boundaries as exceptions; they are returned as typed results.

use thiserror::Error;

use crate::peer::PeerAddress;

/// Errors surfaced by [`crate::gatt::GattController`] dial/discovery operations.
#[derive(Debug, Error)]
pub enum GattError {
    #[error("connect to {0} failed after exhausting retries")]
    ConnectFailed(PeerAddress),
    #[error("GATT service/characteristic discovery failed for {0}")]
    DiscoveryFailed(PeerAddress),
    #[error("message characteristic missing on {0}")]
    CharacteristicMissing(PeerAddress),
    #[error("driver error on {peer}: {reason}")]
    Driver { peer: PeerAddress, reason: String },
}

/// Errors surfaced by [`crate::transport::queue::TransportQueue`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no usable egress link for {0}")]
    NoUsableLink(PeerAddress),
    #[error("encryption is required but unavailable")]
    EncryptionRequired,
    #[error("write to {0} failed transiently")]
    WriteFailedTransient(PeerAddress),
    #[error("write to {0} failed fatally")]
    WriteFailedFatal(PeerAddress),
    #[error("handshake send to {0} failed")]
    HandshakeSendFailed(PeerAddress),
    #[error("malformed inbound fragment from {0}")]
    MalformedFragment(PeerAddress),
}

/// Errors surfaced by [`crate::ledger::LinkLedger`] invariant checks.
///
/// Ledger mutators are otherwise total (idempotent no-ops rather than
/// errors); this type is reserved for malformed wire input.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("malformed fragment: {0}")]
    MalformedFragment(&'static str),
}
