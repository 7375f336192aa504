use super::network::AddrDelay;

/// Delay-ordered queue of scheduled address dials.
///
/// A flat vector keeps ordering simple and makes replace-by-address
/// cheap; queues here stay in the low tens of entries.
#[derive(Debug, Default)]
pub(crate) struct DialQueue {
    q: Vec<AddrDelay>,
}

impl DialQueue {
    pub(crate) fn new() -> Self {
        Self {
            q: Vec::with_capacity(16),
        }
    }

    /// Adds an entry, replacing any existing entry for the same address.
    pub(crate) fn add(&mut self, entry: AddrDelay) {
        if let Some(i) = self.q.iter().position(|e| e.addr == entry.addr) {
            if self.q[i].delay == entry.delay {
                return;
            }
            self.q.remove(i);
        }
        let at = self
            .q
            .iter()
            .position(|e| e.delay > entry.delay)
            .unwrap_or(self.q.len());
        self.q.insert(at, entry);
    }

    /// Pops every entry tied for the lowest delay.
    pub(crate) fn next_batch(&mut self) -> Vec<AddrDelay> {
        let Some(front) = self.q.first() else {
            return Vec::new();
        };
        let delay = front.delay;
        let split = self
            .q
            .iter()
            .position(|e| e.delay != delay)
            .unwrap_or(self.q.len());
        let rest = self.q.split_off(split);
        std::mem::replace(&mut self.q, rest)
    }

    /// The entry with the lowest delay, if any.
    pub(crate) fn top(&self) -> Option<&AddrDelay> {
        self.q.first()
    }

    pub(crate) fn len(&self) -> usize {
        self.q.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use multiaddr::Multiaddr;
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::{arb_delay, arb_multiaddr};

    fn entry(addr: &Multiaddr, millis: u64) -> AddrDelay {
        AddrDelay {
            addr: addr.clone(),
            delay: Duration::from_millis(millis),
        }
    }

    #[test]
    fn add_replaces_entry_for_same_address() {
        let addr: Multiaddr = "/ip4/192.0.2.7/udp/4001/quic-v1"
            .parse()
            .expect("valid multiaddr");
        let mut dq = DialQueue::new();
        dq.add(entry(&addr, 10));
        dq.add(entry(&addr, 0));
        assert_eq!(dq.len(), 1);
        assert_eq!(
            dq.top().expect("queue nonempty").delay,
            Duration::from_millis(0)
        );
    }

    #[test]
    fn next_batch_returns_all_entries_tied_for_minimum() {
        let a: Multiaddr = "/ip4/192.0.2.1/udp/1/quic-v1".parse().expect("valid");
        let b: Multiaddr = "/ip4/192.0.2.2/udp/2/quic-v1".parse().expect("valid");
        let c: Multiaddr = "/ip4/192.0.2.3/udp/3/quic-v1".parse().expect("valid");
        let mut dq = DialQueue::new();
        dq.add(entry(&a, 5));
        dq.add(entry(&b, 5));
        dq.add(entry(&c, 20));

        let batch = dq.next_batch();
        let addrs: HashSet<_> = batch.iter().map(|e| e.addr.clone()).collect();
        assert_eq!(addrs, HashSet::from([a, b]));
        assert_eq!(dq.len(), 1);
        assert_eq!(
            dq.top().expect("queue nonempty").addr,
            c
        );
    }

    #[test]
    fn next_batch_on_empty_queue_is_empty() {
        let mut dq = DialQueue::new();
        assert!(dq.next_batch().is_empty());
    }

    proptest! {
        // After any add sequence the queue holds unique addresses in
        // non-decreasing delay order.
        #[test]
        fn sorted_and_duplicate_free(
            entries in prop::collection::vec((arb_multiaddr(), arb_delay()), 0..24),
        ) {
            let mut dq = DialQueue::new();
            for (addr, delay) in entries {
                dq.add(AddrDelay { addr, delay });
            }
            let mut seen = HashSet::new();
            let mut last = Duration::ZERO;
            while let Some(top) = dq.top().cloned() {
                prop_assert!(top.delay >= last);
                last = top.delay;
                for e in dq.next_batch() {
                    prop_assert!(seen.insert(e.addr), "duplicate address in queue");
                }
            }
        }

        // add(a, d) followed by one next_batch returns a iff d is the
        // minimum delay currently queued.
        #[test]
        fn batch_contains_added_entry_iff_minimal(
            entries in prop::collection::vec((arb_multiaddr(), arb_delay()), 1..16),
            addr in arb_multiaddr(),
            delay in arb_delay(),
        ) {
            let mut dq = DialQueue::new();
            for (a, d) in entries {
                dq.add(AddrDelay { addr: a, delay: d });
            }
            dq.add(AddrDelay { addr: addr.clone(), delay });
            let min = dq.top().expect("queue nonempty").delay;
            let batch = dq.next_batch();
            let contains = batch.iter().any(|e| e.addr == addr);
            prop_assert_eq!(contains, delay == min);
        }

        // Re-adding with the same delay never duplicates an entry.
        #[test]
        fn readd_same_delay_is_a_noop(addr in arb_multiaddr(), delay in arb_delay()) {
            let mut dq = DialQueue::new();
            dq.add(AddrDelay { addr: addr.clone(), delay });
            dq.add(AddrDelay { addr, delay });
            prop_assert_eq!(dq.len(), 1);
        }
    }
}
