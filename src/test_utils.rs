use std::time::Duration;

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use proptest::prelude::*;

// ─── Peer / address generators ──────────────────────────────────────────────

pub fn arb_peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 32]>().prop_map(|bytes| {
        // Infallible: any 32 bytes is a valid ed25519 seed
        let secret = libp2p_identity::ed25519::SecretKey::try_from_bytes(bytes)
            .expect("any 32 bytes is a valid ed25519 seed");
        let ed_kp = libp2p_identity::ed25519::Keypair::from(secret);
        let keypair = libp2p_identity::Keypair::from(ed_kp);
        PeerId::from(keypair.public())
    })
}

pub fn arb_multiaddr() -> impl Strategy<Value = Multiaddr> {
    (
        1u8..=254,
        0u8..=255,
        0u8..=255,
        1u8..=254,
        1024u16..65535u16,
    )
        .prop_map(|(a, b, c, d, port)| {
            // Infallible: formatted string is always a valid multiaddr
            format!("/ip4/{a}.{b}.{c}.{d}/udp/{port}/quic-v1")
                .parse()
                .expect("generated IP4/UDP/QUIC multiaddr is always valid")
        })
}

// ─── Scheduling generators ──────────────────────────────────────────────────

pub fn arb_delay() -> impl Strategy<Value = Duration> {
    (0u64..500).prop_map(Duration::from_millis)
}
