use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

pub const BACKOFF_BASE: Duration = Duration::from_secs(5);
pub const BACKOFF_COEF: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    tries: u32,
    until: Instant,
}

/// Tracks which (peer, address) pairs are temporarily ineligible for
/// dialing. Windows grow quadratically with consecutive failures and a
/// refused dial surfaces as a backoff error without a dial attempt.
#[derive(Debug, Default)]
pub struct DialBackoff {
    entries: HashMap<PeerId, HashMap<Multiaddr, BackoffEntry>>,
}

impl DialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether dialing the address should currently be refused.
    pub fn is_backoff(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        self.is_backoff_at(peer, addr, Instant::now())
    }

    fn is_backoff_at(&self, peer: &PeerId, addr: &Multiaddr, now: Instant) -> bool {
        self.entries
            .get(peer)
            .and_then(|addrs| addrs.get(addr))
            .is_some_and(|entry| now < entry.until)
    }

    /// Extends the pair's backoff window after a failed dial.
    pub fn add_backoff(&mut self, peer: PeerId, addr: Multiaddr) {
        self.add_backoff_at(peer, addr, Instant::now());
    }

    fn add_backoff_at(&mut self, peer: PeerId, addr: Multiaddr, now: Instant) {
        let entry = self
            .entries
            .entry(peer)
            .or_default()
            .entry(addr)
            .or_insert(BackoffEntry {
                tries: 0,
                until: now,
            });
        let delay = BACKOFF_BASE
            .saturating_add(BACKOFF_COEF.saturating_mul(entry.tries.saturating_mul(entry.tries)))
            .min(BACKOFF_MAX);
        entry.until = now + delay;
        entry.tries = entry.tries.saturating_add(1);
    }

    /// Clears every window for the peer, e.g. after a successful
    /// connection.
    pub fn clear_peer(&mut self, peer: &PeerId) {
        self.entries.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::{arb_multiaddr, arb_peer_id};

    fn expected_delay(tries: u32) -> Duration {
        (BACKOFF_BASE + BACKOFF_COEF * (tries * tries)).min(BACKOFF_MAX)
    }

    proptest! {
        #[test]
        fn fresh_pair_is_not_in_backoff(peer in arb_peer_id(), addr in arb_multiaddr()) {
            let backoff = DialBackoff::new();
            prop_assert!(!backoff.is_backoff(&peer, &addr));
        }

        #[test]
        fn window_opens_and_expires(peer in arb_peer_id(), addr in arb_multiaddr()) {
            let now = Instant::now();
            let mut backoff = DialBackoff::new();
            backoff.add_backoff_at(peer, addr.clone(), now);
            prop_assert!(backoff.is_backoff_at(&peer, &addr, now));
            prop_assert!(!backoff.is_backoff_at(&peer, &addr, now + BACKOFF_BASE));
        }

        #[test]
        fn window_grows_quadratically(
            peer in arb_peer_id(),
            addr in arb_multiaddr(),
            failures in 1u32..12,
        ) {
            let now = Instant::now();
            let mut backoff = DialBackoff::new();
            for _ in 0..failures {
                backoff.add_backoff_at(peer, addr.clone(), now);
            }
            let delay = expected_delay(failures - 1);
            if delay > Duration::ZERO {
                prop_assert!(backoff.is_backoff_at(
                    &peer,
                    &addr,
                    now + delay - Duration::from_millis(1)
                ));
            }
            prop_assert!(!backoff.is_backoff_at(&peer, &addr, now + delay));
        }

        #[test]
        fn window_never_exceeds_max(
            peer in arb_peer_id(),
            addr in arb_multiaddr(),
            failures in 1u32..40,
        ) {
            let now = Instant::now();
            let mut backoff = DialBackoff::new();
            for _ in 0..failures {
                backoff.add_backoff_at(peer, addr.clone(), now);
            }
            prop_assert!(!backoff.is_backoff_at(&peer, &addr, now + BACKOFF_MAX));
        }

        #[test]
        fn pairs_back_off_independently(
            peer in arb_peer_id(),
            addr_a in arb_multiaddr(),
            addr_b in arb_multiaddr(),
        ) {
            prop_assume!(addr_a != addr_b);
            let now = Instant::now();
            let mut backoff = DialBackoff::new();
            backoff.add_backoff_at(peer, addr_a.clone(), now);
            prop_assert!(backoff.is_backoff_at(&peer, &addr_a, now));
            prop_assert!(!backoff.is_backoff_at(&peer, &addr_b, now));
        }

        #[test]
        fn clear_peer_resets_all_windows(
            peer in arb_peer_id(),
            addrs in prop::collection::vec(arb_multiaddr(), 1..6),
        ) {
            let now = Instant::now();
            let mut backoff = DialBackoff::new();
            for addr in &addrs {
                backoff.add_backoff_at(peer, addr.clone(), now);
            }
            backoff.clear_peer(&peer);
            for addr in &addrs {
                prop_assert!(!backoff.is_backoff_at(&peer, addr, now));
            }
        }
    }
}
