use std::{fmt, sync::Arc};

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use thiserror::Error;

/// Recorded per-address leaves are capped; a pathological peer can
/// advertise hundreds of addresses.
const MAX_DIAL_ERRORS: usize = 16;

/// Failure of a dial to a single address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrDialError {
    /// The address is inside a backoff window; no dial was attempted.
    #[error("dial backoff")]
    Backoff,
    /// The black-hole detector refused the dial.
    #[error("dial refused: address is suspected unreachable")]
    BlackHoleRefused,
    #[error("dial canceled")]
    Canceled,
    #[error("dialed unexpected peer: expected {expected}, got {actual}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },
    #[error("{0}")]
    Transport(Arc<str>),
}

impl AddrDialError {
    pub fn transport(message: impl Into<Arc<str>>) -> Self {
        AddrDialError::Transport(message.into())
    }
}

/// One failed address inside a composite [`DialError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{address}] {cause}")]
pub struct TransportError {
    pub address: Multiaddr,
    pub cause: AddrDialError,
}

/// Overall verdict of a dial request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialErrorCause {
    #[error("all dials failed")]
    AllDialsFailed,
    #[error("no addresses")]
    NoAddresses,
    #[error("{0}")]
    Other(Arc<str>),
}

/// Aggregate error for a dial request: every per-address failure plus
/// the overall cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialError {
    pub peer: PeerId,
    pub dial_errors: Vec<TransportError>,
    pub cause: Option<DialErrorCause>,
    skipped: usize,
}

impl DialError {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            dial_errors: Vec::new(),
            cause: None,
            skipped: 0,
        }
    }

    pub fn with_transport_errors(mut self, errors: Vec<TransportError>) -> Self {
        for err in errors {
            self.record(err.address, err.cause);
        }
        self
    }

    pub fn with_cause(mut self, cause: DialErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Records one failed address, counting overflow past the cap.
    pub fn record(&mut self, address: Multiaddr, cause: AddrDialError) {
        if self.dial_errors.len() < MAX_DIAL_ERRORS {
            self.dial_errors.push(TransportError { address, cause });
        } else {
            self.skipped += 1;
        }
    }
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to dial {}", self.peer)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        for err in &self.dial_errors {
            write!(f, "\n  * {err}")?;
        }
        if self.skipped > 0 {
            write!(f, "\n  * ({} more errors omitted)", self.skipped)?;
        }
        Ok(())
    }
}

impl std::error::Error for DialError {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::{arb_multiaddr, arb_peer_id};

    #[test]
    fn display_lists_cause_and_leaves() {
        let peer = libp2p_identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id();
        let addr: Multiaddr = "/ip4/192.0.2.1/udp/4001/quic-v1"
            .parse()
            .expect("valid multiaddr");
        let mut err = DialError::new(peer).with_cause(DialErrorCause::AllDialsFailed);
        err.record(addr.clone(), AddrDialError::transport("connection refused"));

        let rendered = err.to_string();
        assert!(rendered.contains("all dials failed"));
        assert!(rendered.contains(&addr.to_string()));
        assert!(rendered.contains("connection refused"));
    }

    proptest! {
        #[test]
        fn leaf_count_is_capped(
            peer in arb_peer_id(),
            addrs in prop::collection::vec(arb_multiaddr(), 0..64),
        ) {
            let mut err = DialError::new(peer);
            for addr in &addrs {
                err.record(addr.clone(), AddrDialError::Canceled);
            }
            prop_assert!(err.dial_errors.len() <= MAX_DIAL_ERRORS);
            let expected_skipped = addrs.len().saturating_sub(MAX_DIAL_ERRORS);
            prop_assert_eq!(err.skipped, expected_skipped);
            if expected_skipped > 0 {
                prop_assert!(err.to_string().contains("more errors omitted"));
            }
        }

        #[test]
        fn backoff_sentinel_is_distinguishable(
            peer_a in arb_peer_id(),
            peer_b in arb_peer_id(),
        ) {
            prop_assert_eq!(AddrDialError::Backoff, AddrDialError::Backoff);
            prop_assert_ne!(
                AddrDialError::Backoff,
                AddrDialError::UnexpectedPeer { expected: peer_a, actual: peer_b }
            );
            // Sentinel comparisons must survive a round of cloning.
            prop_assert_eq!(AddrDialError::Backoff.clone(), AddrDialError::Backoff);
        }
    }
}
