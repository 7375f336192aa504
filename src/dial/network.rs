use std::time::Duration;

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tokio::sync::mpsc;

use super::{
    error::{AddrDialError, DialError, TransportError},
    scope::DialScope,
};

/// Direction of an established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// An address paired with the pacing delay its ranking assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrDelay {
    pub addr: Multiaddr,
    pub delay: Duration,
}

/// Outcome events for one address dial, reported on the worker's result
/// channel. `Started` precedes the terminal `Finished` for any address.
#[derive(Debug)]
pub enum DialResult<C> {
    /// The transport has begun dialing the address.
    Started { addr: Multiaddr },
    /// The dial reached a terminal outcome.
    Finished {
        addr: Multiaddr,
        result: Result<C, AddrDialError>,
    },
}

impl<C> DialResult<C> {
    pub fn addr(&self) -> &Multiaddr {
        match self {
            DialResult::Started { addr } => addr,
            DialResult::Finished { addr, .. } => addr,
        }
    }
}

/// An established connection to a peer.
///
/// Handles are cheap to clone; one successful dial is delivered to every
/// request waiting on its address.
pub trait Connection: Clone + Send + Sync + 'static {
    fn remote_peer(&self) -> PeerId;
    fn remote_addr(&self) -> Multiaddr;
    /// Closes the connection. Must tolerate repeated calls.
    fn close(&self);
}

/// The swarm-side collaborator the dial worker drives.
///
/// Every method must return promptly; `dial_next_addr` spawns the actual
/// dial and reports [`DialResult`]s on the supplied channel.
pub trait Network: Send + Sync + 'static {
    type Conn: Connection;

    /// An existing connection to the peer usable for this request, if
    /// any.
    fn best_acceptable_conn(
        &self,
        scope: &DialScope,
        peer: &PeerId,
    ) -> Result<Option<Self::Conn>, DialError>;

    /// The peer's dialable addresses together with per-address pre-flight
    /// errors. A fatal error fails the whole request.
    fn addrs_for_dial(
        &self,
        scope: &DialScope,
        peer: &PeerId,
    ) -> Result<(Vec<Multiaddr>, Vec<TransportError>), DialError>;

    /// Orders candidate addresses and assigns pacing delays.
    fn dial_ranker(&self, addrs: &[Multiaddr]) -> Vec<AddrDelay>;

    /// Spawns a dial to one address. Returns an error without queueing
    /// any result when the dial is refused outright, typically backoff.
    fn dial_next_addr(
        &self,
        scope: &DialScope,
        peer: &PeerId,
        addr: &Multiaddr,
        results: mpsc::Sender<DialResult<Self::Conn>>,
    ) -> Result<(), AddrDialError>;

    /// Registers a raw connection with the swarm.
    fn add_conn(&self, conn: Self::Conn, direction: Direction) -> Result<Self::Conn, AddrDialError>;

    /// Notes that dials to this address should back off.
    fn add_backoff(&self, peer: &PeerId, addr: &Multiaddr);

    /// Black-hole detector sample for a finished dial.
    fn record_dial_outcome(&self, addr: &Multiaddr, success: bool);
}

/// Ranking for simultaneous-connect requests: dial everything at once.
pub fn no_delay_dial_ranker(addrs: &[Multiaddr]) -> Vec<AddrDelay> {
    addrs
        .iter()
        .map(|addr| AddrDelay {
            addr: addr.clone(),
            delay: Duration::ZERO,
        })
        .collect()
}
