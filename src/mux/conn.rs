use std::{io, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::sync::CancellationToken;

use super::{MuxError, pool::PooledBuf};

/// Packets queued per flow before push starts failing.
const RECEIVE_QUEUE_PACKETS: usize = 128;

struct InboundPacket {
    buf: PooledBuf,
    src: SocketAddr,
}

/// A logical packet connection bound to one remote ufrag, multiplexed
/// over the shared socket.
///
/// Handles are cheap to clone and compare equal when they reference the
/// same flow.
#[derive(Clone)]
pub struct MuxedConn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    ufrag: String,
    remote: Mutex<Option<SocketAddr>>,
    socket: Arc<UdpSocket>,
    queue_tx: mpsc::Sender<InboundPacket>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<InboundPacket>>,
    closed: CancellationToken,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MuxedConn {
    pub(crate) fn new(
        ufrag: String,
        remote: Option<SocketAddr>,
        socket: Arc<UdpSocket>,
        on_close: Box<dyn FnOnce() + Send>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(RECEIVE_QUEUE_PACKETS);
        Self {
            inner: Arc::new(ConnInner {
                ufrag,
                remote: Mutex::new(remote),
                socket,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                closed: CancellationToken::new(),
                on_close: Mutex::new(Some(on_close)),
            }),
        }
    }

    /// Queues an inbound packet. Non-blocking; on failure the buffer's
    /// guard releases it back to the pool.
    pub(crate) fn push(&self, buf: PooledBuf, src: SocketAddr) -> Result<(), MuxError> {
        if self.inner.closed.is_cancelled() {
            return Err(MuxError::Closed);
        }
        self.inner
            .queue_tx
            .try_send(InboundPacket { buf, src })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => MuxError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => MuxError::Closed,
            })
    }

    /// Receives one packet, copying at most `buf.len()` bytes of it.
    pub async fn read(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), MuxError> {
        let mut queue = self.inner.queue_rx.lock().await;
        tokio::select! {
            _ = self.inner.closed.cancelled() => Err(MuxError::Closed),
            pkt = queue.recv() => {
                let Some(pkt) = pkt else {
                    return Err(MuxError::Closed);
                };
                let n = pkt.buf.len().min(buf.len());
                buf[..n].copy_from_slice(&pkt.buf[..n]);
                Ok((n, pkt.src))
            }
        }
    }

    /// Sends a datagram to `target` through the shared socket.
    pub async fn write_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, MuxError> {
        if self.inner.closed.is_cancelled() {
            return Err(MuxError::Closed);
        }
        Ok(self.inner.socket.send_to(buf, target).await?)
    }

    /// Closes the flow and unregisters it from the mux. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        if let Some(hook) = self.inner.on_close.lock().take() {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// The remote address this flow is currently bound to.
    pub fn address(&self) -> Option<SocketAddr> {
        *self.inner.remote.lock()
    }

    pub fn ufrag(&self) -> &str {
        &self.inner.ufrag
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }
}

impl PartialEq for MuxedConn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MuxedConn {}

impl std::fmt::Debug for MuxedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxedConn")
            .field("ufrag", &self.inner.ufrag)
            .field("remote", &self.address())
            .field("closed", &self.is_closed())
            .finish()
    }
}
