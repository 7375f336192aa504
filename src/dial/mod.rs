pub mod backoff;
pub mod error;
pub mod network;
mod queue;
mod scope;

pub use self::scope::DialScope;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, error, info};

use self::{
    error::{AddrDialError, DialError, DialErrorCause, TransportError},
    network::{AddrDelay, Connection, DialResult, Direction, Network, no_delay_dial_ranker},
    queue::DialQueue,
};

// ─── Request surface ────────────────────────────────────────────────────────

/// A single ask to dial the worker's peer.
pub struct DialRequest<C> {
    /// Scope governing this request. Concurrent requests may lend their
    /// scope to dials of the peer's addresses; simultaneous-connect
    /// scopes take priority over normal ones.
    pub scope: DialScope,
    /// One-shot channel carrying the response for this request.
    pub resch: oneshot::Sender<DialResponse<C>>,
}

/// The connection on success, or the aggregated dial failure.
pub type DialResponse<C> = Result<C, DialError>;

impl<C> DialRequest<C> {
    /// Builds a request and the receiver its response arrives on.
    pub fn new(scope: DialScope) -> (Self, oneshot::Receiver<DialResponse<C>>) {
        let (resch, rx) = oneshot::channel();
        (Self { scope, resch }, rx)
    }
}

// ─── Worker bookkeeping ─────────────────────────────────────────────────────

/// Progress of one in-flight [`DialRequest`].
struct PendRequest<C> {
    scope: DialScope,
    resch: oneshot::Sender<DialResponse<C>>,
    /// Accumulates the errors of all failed dials.
    err: DialError,
    /// Addresses this request still waits on. Initialised from the
    /// ranked candidate list and shrinks as dials fail; a successful
    /// dial to any member completes the request.
    addrs: HashSet<Multiaddr>,
}

/// Tracks the dial to one address of the peer. An entry here ensures an
/// address is dialed at most once for the worker's lifetime.
struct AddrDial<C> {
    scope: DialScope,
    conn: Option<C>,
    err: Option<AddrDialError>,
    dialed: bool,
    created_at: Instant,
    ranking_delay: Duration,
    start_time: Option<Instant>,
}

// ─── Worker ─────────────────────────────────────────────────────────────────

/// Synchronises concurrent dial requests to one peer.
///
/// The worker owns all mutable dial state; callers talk to it
/// exclusively through the request channel and per-request response
/// channels. Closing the request channel ends the loop once in-flight
/// dials have drained.
pub struct DialWorker<N: Network> {
    network: Arc<N>,
    peer: PeerId,
    reqch: mpsc::Receiver<DialRequest<N::Conn>>,
    pending_requests: BTreeMap<u64, PendRequest<N::Conn>>,
    next_request_id: u64,
    tracked_dials: HashMap<Multiaddr, AddrDial<N::Conn>>,
    results_tx: mpsc::Sender<DialResult<N::Conn>>,
    results_rx: mpsc::Receiver<DialResult<N::Conn>>,
    /// Latched on the first successful connection.
    connected: bool,
    dq: DialQueue,
    /// Dials triggered but without a terminal result yet.
    dials_in_flight: usize,
    total_dials: usize,
}

impl<N: Network> DialWorker<N> {
    pub fn new(network: Arc<N>, peer: PeerId, reqch: mpsc::Receiver<DialRequest<N::Conn>>) -> Self {
        let (results_tx, results_rx) = mpsc::channel(16);
        Self {
            network,
            peer,
            reqch,
            pending_requests: BTreeMap::new(),
            next_request_id: 0,
            tracked_dials: HashMap::new(),
            results_tx,
            results_rx,
            connected: false,
            dq: DialQueue::new(),
            dials_in_flight: 0,
            total_dials: 0,
        }
    }

    /// Runs the worker loop until the request channel closes, then
    /// drains in-flight dials.
    pub async fn run(mut self) {
        let start = Instant::now();

        loop {
            // The loop has three inputs: new requests, the dial timer for
            // the next scheduled batch, and completions of in-flight
            // dials. The timer deadline is derived from queue state on
            // every turn, so each arm leaves it implicitly rescheduled.
            let dial_deadline = self.next_dial_deadline(start);

            tokio::select! {
                req = self.reqch.recv() => {
                    let Some(req) = req else { break };
                    self.handle_request(req);
                }
                _ = async {
                    match dial_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.trigger_due_dials();
                }
                res = self.results_rx.recv() => {
                    // The worker holds a sender, so the channel stays open.
                    let Some(res) = res else { break };
                    self.handle_result(res);
                }
            }
        }

        self.drain_in_flight().await;
    }

    /// When the next batch of scheduled dials is due. With nothing in
    /// flight and no connection yet, pacing is abandoned and the next
    /// batch goes out immediately.
    fn next_dial_deadline(&self, start: Instant) -> Option<Instant> {
        let top = self.dq.top()?;
        if self.dials_in_flight == 0 && !self.connected {
            Some(start)
        } else {
            Some(start + top.delay)
        }
    }

    // ─── Request ingestion ──────────────────────────────────────────────

    fn handle_request(&mut self, req: DialRequest<N::Conn>) {
        // A suitable connection may already exist, established by an
        // earlier request.
        match self.network.best_acceptable_conn(&req.scope, &self.peer) {
            Ok(Some(conn)) => {
                let _ = req.resch.send(Ok(conn));
                return;
            }
            Err(err) => {
                let _ = req.resch.send(Err(err));
                return;
            }
            Ok(None) => {}
        }

        let (addrs, addr_errs) = match self.network.addrs_for_dial(&req.scope, &self.peer) {
            Ok(candidates) => candidates,
            Err(err) => {
                let _ = req.resch.send(Err(err));
                return;
            }
        };

        // A concurrent dial may have finished between the probe above
        // and now; answer with its connection instead of re-entering.
        for addr in &addrs {
            if let Some(ad) = self.tracked_dials.get(addr)
                && let Some(conn) = &ad.conn
            {
                let _ = req.resch.send(Ok(conn.clone()));
                return;
            }
        }

        self.add_new_request(req, addrs, addr_errs);
    }

    fn add_new_request(
        &mut self,
        req: DialRequest<N::Conn>,
        addrs: Vec<Multiaddr>,
        addr_errs: Vec<TransportError>,
    ) {
        let ranking = self.rank_addrs(&addrs, req.scope.is_sim_connect());

        let mut pr = PendRequest {
            scope: req.scope.clone(),
            resch: req.resch,
            err: DialError::new(self.peer).with_transport_errors(addr_errs),
            addrs: ranking.iter().map(|entry| entry.addr.clone()).collect(),
        };

        for AddrDelay { addr, delay } in ranking {
            match self.tracked_dials.get_mut(&addr) {
                None => {
                    self.tracked_dials.insert(
                        addr.clone(),
                        AddrDial {
                            scope: req.scope.clone(),
                            conn: None,
                            err: None,
                            dialed: false,
                            created_at: Instant::now(),
                            ranking_delay: Duration::ZERO,
                            start_time: None,
                        },
                    );
                    self.dq.add(AddrDelay { addr, delay });
                }
                Some(ad) => {
                    if let Some(err) = &ad.err {
                        // This address already failed for an earlier
                        // request; carry the recorded error instead of
                        // redialing.
                        pr.err.record(addr.clone(), err.clone());
                        pr.addrs.remove(&addr);
                    } else if !ad.dialed
                        && req.scope.is_sim_connect()
                        && !ad.scope.is_sim_connect()
                    {
                        // Upgrade the tracked dial to simultaneous
                        // connect and reschedule at the tighter delay.
                        ad.scope.upgrade_to_sim_connect();
                        self.dq.add(AddrDelay { addr, delay });
                    }
                }
            }
        }

        if pr.addrs.is_empty() {
            // Every applicable address has already errored out.
            let PendRequest { resch, err, .. } = pr;
            let _ = resch.send(Err(err.with_cause(DialErrorCause::AllDialsFailed)));
        } else {
            let id = self.next_request_id;
            self.next_request_id += 1;
            self.pending_requests.insert(id, pr);
        }
    }

    fn rank_addrs(&self, addrs: &[Multiaddr], sim_connect: bool) -> Vec<AddrDelay> {
        if sim_connect {
            no_delay_dial_ranker(addrs)
        } else {
            self.network.dial_ranker(addrs)
        }
    }

    // ─── Dial triggering ────────────────────────────────────────────────

    fn trigger_due_dials(&mut self) {
        let now = Instant::now();
        for AddrDelay { addr, .. } in self.dq.next_batch() {
            let scope = match self.tracked_dials.get_mut(&addr) {
                Some(ad) => {
                    ad.dialed = true;
                    ad.ranking_delay = now.duration_since(ad.created_at);
                    ad.scope.clone()
                }
                None => {
                    error!(addr = %addr, "no tracked dial for scheduled address");
                    continue;
                }
            };
            match self
                .network
                .dial_next_addr(&scope, &self.peer, &addr, self.results_tx.clone())
            {
                Ok(()) => {
                    self.dials_in_flight += 1;
                    self.total_dials += 1;
                }
                // Refused without a dial attempt, typically backoff.
                Err(err) => self.dispatch_error(&addr, err),
            }
        }
    }

    // ─── Result handling ────────────────────────────────────────────────

    fn handle_result(&mut self, res: DialResult<N::Conn>) {
        if !self.tracked_dials.contains_key(res.addr()) {
            // Accounting bug upstream; prefer a defensive decrement over
            // a worker that never drains.
            error!(addr = %res.addr(), "dial result for untracked address");
            if let DialResult::Finished {
                result: Ok(conn), ..
            } = &res
            {
                conn.close();
            }
            self.dials_in_flight = self.dials_in_flight.saturating_sub(1);
            return;
        }

        match res {
            DialResult::Started { addr } => {
                if let Some(ad) = self.tracked_dials.get_mut(&addr) {
                    ad.start_time = Some(Instant::now());
                }
            }
            DialResult::Finished { addr, result } => {
                self.dials_in_flight = self.dials_in_flight.saturating_sub(1);
                self.network.record_dial_outcome(&addr, result.is_ok());
                match result {
                    Ok(conn) => self.handle_success(&addr, conn),
                    Err(err) => self.handle_error(&addr, err),
                }
            }
        }
    }

    fn handle_success(&mut self, addr: &Multiaddr, conn: N::Conn) {
        // The security layer has already verified the remote peer; a
        // mismatch here is a transport bug.
        let remote = conn.remote_peer();
        if remote != self.peer {
            error!(
                expected = %self.peer,
                actual = %remote,
                addr = %addr,
                "transport dialed the wrong peer"
            );
            conn.close();
            self.dispatch_error(
                addr,
                AddrDialError::UnexpectedPeer {
                    expected: self.peer,
                    actual: remote,
                },
            );
            return;
        }

        let conn = match self.network.add_conn(conn.clone(), Direction::Outbound) {
            Ok(conn) => conn,
            Err(err) => {
                conn.close();
                self.dispatch_error(addr, err);
                return;
            }
        };

        info!(
            peer = %self.peer,
            addr = %addr,
            direction = "outbound",
            "connection established"
        );

        let (ranking_delay, dial_elapsed) = match self.tracked_dials.get_mut(addr) {
            Some(ad) => {
                ad.conn = Some(conn.clone());
                (ad.ranking_delay, ad.start_time.map(|t| t.elapsed()))
            }
            None => (Duration::ZERO, None),
        };

        let ids: Vec<u64> = self
            .pending_requests
            .iter()
            .filter(|(_, pr)| pr.addrs.contains(addr))
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            if let Some(pr) = self.pending_requests.remove(&id) {
                let _ = pr.resch.send(Ok(conn.clone()));
            }
        }

        if !self.connected {
            self.connected = true;
            debug!(
                peer = %self.peer,
                ranking_delay_ms = ranking_delay.as_millis() as u64,
                dial_elapsed_ms = dial_elapsed.map(|d| d.as_millis() as u64),
                "first dial success"
            );
        }
    }

    fn handle_error(&mut self, addr: &Multiaddr, err: AddrDialError) {
        // Backoff only applies while no connection has been established;
        // cancellations are expected when another attempt won the race.
        match &err {
            AddrDialError::BlackHoleRefused => {
                error!(
                    peer = %self.peer,
                    addr = %addr,
                    "unexpected black-hole refusal for an attempted dial"
                );
            }
            AddrDialError::Canceled => {}
            _ if !self.connected => self.network.add_backoff(&self.peer, addr),
            _ => {}
        }
        self.dispatch_error(addr, err);
    }

    fn dispatch_error(&mut self, addr: &Multiaddr, err: AddrDialError) {
        if let Some(ad) = self.tracked_dials.get_mut(addr) {
            ad.err = Some(err.clone());
        }

        let ids: Vec<u64> = self
            .pending_requests
            .iter()
            .filter(|(_, pr)| pr.addrs.contains(addr))
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            let Some(pr) = self.pending_requests.get_mut(&id) else {
                continue;
            };
            pr.err.record(addr.clone(), err.clone());
            pr.addrs.remove(addr);
            if !pr.addrs.is_empty() {
                continue;
            }
            // All of this request's addresses have failed. A concurrent
            // later request may still have landed a connection through
            // an address outside this set; probe once more before
            // failing.
            let Some(pr) = self.pending_requests.remove(&id) else {
                continue;
            };
            let PendRequest {
                scope, resch, err, ..
            } = pr;
            let response = match self.network.best_acceptable_conn(&scope, &self.peer) {
                Ok(Some(conn)) => Ok(conn),
                _ => Err(err.with_cause(DialErrorCause::AllDialsFailed)),
            };
            let _ = resch.send(response);
        }

        // A backoff refusal must not poison the address for future
        // requests; forget the record so they may re-enter it.
        if matches!(err, AddrDialError::Backoff) {
            self.tracked_dials.remove(addr);
        }
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    async fn drain_in_flight(&mut self) {
        debug!(
            peer = %self.peer,
            connected = self.connected,
            total_dials = self.total_dials,
            queued = self.dq.len(),
            "dial worker shutting down"
        );
        while self.dials_in_flight > 0 {
            let Some(res) = self.results_rx.recv().await else {
                break;
            };
            if let DialResult::Finished { addr, result } = res {
                self.network.record_dial_outcome(&addr, result.is_ok());
                if let Ok(conn) = result {
                    conn.close();
                }
                self.dials_in_flight -= 1;
            }
        }
    }
}
