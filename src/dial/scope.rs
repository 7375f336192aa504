use tokio_util::sync::CancellationToken;

/// Cancellation scope threaded through dial requests and address dials.
///
/// Clones share the underlying token. An address dial keeps the scope of
/// the request that first referenced it, so cancelling a later joining
/// request never tears down a dial another waiter depends on.
#[derive(Debug, Clone, Default)]
pub struct DialScope {
    token: CancellationToken,
    sim_connect: bool,
}

impl DialScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags the scope as a simultaneous-connect request, which dials all
    /// candidate addresses without pacing delays.
    pub fn with_sim_connect(mut self) -> Self {
        self.sim_connect = true;
        self
    }

    // Upgrades never downgrade: an address dial stays simultaneous
    // connect once any request demanded it.
    pub(crate) fn upgrade_to_sim_connect(&mut self) {
        self.sim_connect = true;
    }

    pub fn is_sim_connect(&self) -> bool {
        self.sim_connect
    }

    /// Derives a scope that is cancelled together with this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            sim_connect: self.sim_connect,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
