mod conn;
mod pool;

pub use self::{
    conn::MuxedConn,
    pool::{BufferPool, PooledBuf},
};

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use anyhow::Context;
use parking_lot::Mutex;
use stun::{
    attributes::ATTR_USERNAME,
    message::{BINDING_REQUEST, Message, is_message},
    textattrs::TextAttribute,
};
use tokio::{net::UdpSocket, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Largest datagram the mux accepts; receive buffers are pooled at this
/// size.
pub const RECEIVE_MTU: usize = 1500;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("mux closed")]
    Closed,
    #[error("receive queue full")]
    QueueFull,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Called when a validated binding request arrives for a ufrag no flow
/// exists for. An error rejects the remote and discards the new flow.
type UnknownUfragCallback = Arc<dyn Fn(&str, SocketAddr) -> anyhow::Result<()> + Send + Sync>;

// ─── Mux ────────────────────────────────────────────────────────────────────

/// Multiplexes many logical ICE connections over a single UDP socket.
///
/// Flows are indexed by (ufrag, address family) and by the remote
/// address packets have been validated from. An inbound datagram goes to
/// the flow registered for its source address when one exists; otherwise
/// it must be a STUN binding request, whose USERNAME selects (or
/// creates) the flow.
pub struct UdpMux {
    socket: Arc<UdpSocket>,
    table: Arc<FlowTable>,
    pool: BufferPool,
    unknown_ufrag: UnknownUfragCallback,
    cancel: CancellationToken,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpMux {
    pub fn new(
        socket: UdpSocket,
        unknown_ufrag: impl Fn(&str, SocketAddr) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            table: Arc::new(FlowTable::default()),
            pool: BufferPool::new(RECEIVE_MTU),
            unknown_ufrag: Arc::new(unknown_ufrag),
            cancel: CancellationToken::new(),
            read_task: Mutex::new(None),
        }
    }

    /// Launches the socket read loop. Calling again is a no-op.
    pub fn start(&self) {
        let mut task = self.read_task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }
        *task = Some(tokio::spawn(read_loop(
            self.socket.clone(),
            self.table.clone(),
            self.pool.clone(),
            self.unknown_ufrag.clone(),
            self.cancel.clone(),
        )));
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The flow for a ufrag, created if absent. `addr` only selects the
    /// address family; `None` keys the flow as IPv4.
    pub fn get_conn(&self, ufrag: &str, addr: Option<SocketAddr>) -> Result<MuxedConn, MuxError> {
        if self.cancel.is_cancelled() {
            return Err(MuxError::Closed);
        }
        let is_ipv6 = addr.is_some_and(|a| is_ipv6_addr(&a));
        let (_created, conn) = self.table.get_or_create(ufrag, is_ipv6, addr, &self.socket);
        Ok(conn)
    }

    /// Drops both address-family flows for the ufrag, if present.
    pub fn remove_conn_by_ufrag(&self, ufrag: &str) {
        if !ufrag.is_empty() {
            self.table.remove_by_ufrag(ufrag);
        }
    }

    /// Stops the read loop and waits for it to exit. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.read_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }
}

// ─── Read loop ──────────────────────────────────────────────────────────────

async fn read_loop(
    socket: Arc<UdpSocket>,
    table: Arc<FlowTable>,
    pool: BufferPool,
    unknown_ufrag: UnknownUfragCallback,
    cancel: CancellationToken,
) {
    loop {
        let mut buf = pool.get();
        let (n, src) = tokio::select! {
            _ = cancel.cancelled() => return,
            res = socket.recv_from(&mut buf) => match res {
                Ok(recv) => recv,
                Err(err) => {
                    error!(error = %err, "udp mux socket read failed");
                    return;
                }
            },
        };
        buf.truncate(n);
        process_packet(buf, src, &socket, &table, &unknown_ufrag);
    }
}

/// Routes one datagram: known flows by source address, otherwise a STUN
/// binding request may create a flow. Ownership of the buffer transfers
/// to the flow on a successful push; every other path drops the guard,
/// releasing it to the pool.
fn process_packet(
    buf: PooledBuf,
    src: SocketAddr,
    socket: &Arc<UdpSocket>,
    table: &Arc<FlowTable>,
    unknown_ufrag: &UnknownUfragCallback,
) {
    if let Some(conn) = table.get_by_addr(&src) {
        if let Err(err) = conn.push(buf, src) {
            debug!(%src, error = %err, "could not push packet");
        }
        return;
    }

    if !is_message(&buf) {
        debug!(%src, "dropping non-STUN packet from unknown source");
        return;
    }
    let mut msg = Message::new();
    if let Err(err) = msg.write(&buf) {
        debug!(%src, error = %err, "failed to decode STUN message");
        return;
    }
    if msg.typ != BINDING_REQUEST {
        debug!(%src, typ = %msg.typ, "expected a STUN binding request");
        return;
    }
    let ufrag = match local_ufrag(&msg) {
        Ok(ufrag) => ufrag,
        Err(err) => {
            debug!(%src, error = %err, "could not read STUN username");
            return;
        }
    };

    let (created, conn) = table.get_or_create(&ufrag, is_ipv6_addr(&src), Some(src), socket);
    if created && let Err(err) = (unknown_ufrag)(&ufrag, src) {
        debug!(%src, ufrag = %ufrag, error = %err, "remote rejected, discarding flow");
        conn.close();
        return;
    }
    if let Err(err) = conn.push(buf, src) {
        debug!(%src, error = %err, "could not push packet");
    }
}

/// The local side's ufrag from a binding request USERNAME, which is laid
/// out as `remote_ufrag:local_ufrag`.
fn local_ufrag(msg: &Message) -> anyhow::Result<String> {
    let username = TextAttribute::get_from_as(msg, ATTR_USERNAME)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("binding request carries no USERNAME")?;
    let (_, local) = username
        .text
        .split_once(':')
        .context("malformed USERNAME attribute")?;
    Ok(local.to_string())
}

/// IPv4-mapped IPv6 sources classify as IPv4.
fn is_ipv6_addr(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(_) => false,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().is_none(),
    }
}

// ─── Flow table ─────────────────────────────────────────────────────────────

/// Key for the ufrag index. Flows are tracked per address family because
/// the same ufrag may legitimately be bound separately on v4 and v6.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UfragKey {
    ufrag: String,
    is_ipv6: bool,
}

/// Dual index over the live flows. Both maps update together under one
/// lock; every address entry points at a flow that is also registered by
/// ufrag.
#[derive(Default)]
struct FlowTable {
    maps: Mutex<FlowMaps>,
}

#[derive(Default)]
struct FlowMaps {
    by_ufrag: HashMap<UfragKey, MuxedConn>,
    by_addr: HashMap<SocketAddr, MuxedConn>,
}

impl FlowTable {
    fn get_or_create(
        self: &Arc<Self>,
        ufrag: &str,
        is_ipv6: bool,
        addr: Option<SocketAddr>,
        socket: &Arc<UdpSocket>,
    ) -> (bool, MuxedConn) {
        let key = UfragKey {
            ufrag: ufrag.to_string(),
            is_ipv6,
        };
        let mut maps = self.maps.lock();
        if let Some(conn) = maps.by_ufrag.get(&key) {
            return (false, conn.clone());
        }

        let table = Arc::downgrade(self);
        let hook_ufrag = ufrag.to_string();
        let conn = MuxedConn::new(
            ufrag.to_string(),
            addr,
            socket.clone(),
            Box::new(move || {
                if let Some(table) = table.upgrade() {
                    table.remove_by_ufrag(&hook_ufrag);
                }
            }),
        );
        maps.by_ufrag.insert(key, conn.clone());
        if let Some(addr) = addr {
            maps.by_addr.insert(addr, conn.clone());
        }
        (true, conn)
    }

    fn get_by_addr(&self, addr: &SocketAddr) -> Option<MuxedConn> {
        self.maps.lock().by_addr.get(addr).cloned()
    }

    fn remove_by_ufrag(&self, ufrag: &str) {
        let mut maps = self.maps.lock();
        for is_ipv6 in [false, true] {
            let key = UfragKey {
                ufrag: ufrag.to_string(),
                is_ipv6,
            };
            if let Some(conn) = maps.by_ufrag.remove(&key)
                && let Some(addr) = conn.address()
            {
                maps.by_addr.remove(&addr);
            }
        }
    }
}
