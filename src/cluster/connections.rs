//! Request/response client to named peers.

use crate::error::{Error, Result};
use crate::network::{ClusterRequest, ClusterResponse, WireError};
use crate::ring::Ring;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-call request options.
#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    /// Timeout for one attempt.
    pub timeout: Duration,

    /// Attempts allowed while the peer answers that its ring is not ready.
    pub max_attempts: u32,
}

impl RequestOptions {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }
}

/// Sends requests to specific peers over the ring.
pub struct ClusterConnections {
    ring: Arc<dyn Ring>,

    /// Wait before retrying a peer that answered `RingNotReady`.
    retry_on_warning: Duration,

    requests: AtomicU64,
    timeouts: AtomicU64,
    warnings: AtomicU64,
}

/// Statistics for peer requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Requests sent, retries included.
    pub requests: u64,
    /// Attempts that timed out.
    pub timeouts: u64,
    /// `RingNotReady` answers that were retried or exhausted.
    pub warnings: u64,
}

impl ClusterConnections {
    pub fn new(ring: Arc<dyn Ring>, retry_on_warning: Duration) -> Self {
        Self {
            ring,
            retry_on_warning,
            requests: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
        }
    }

    /// Send `payload` to `peer` and wait for its reply.
    ///
    /// - A local ring that is not ready is waited for once; that wait does
    ///   not count as an attempt.
    /// - An unknown peer fails with `PeerNotFound`.
    /// - An attempt that exceeds `options.timeout` fails with `Timeout`.
    /// - A peer answering `RingNotReady` is retried after `retry_on_warning`
    ///   until `options.max_attempts` is exhausted.
    ///
    /// The returned response may still carry an application error; use the
    /// `into_*` helpers on [`ClusterResponse`] to extract it.
    pub async fn request(
        &self,
        peer: &str,
        payload: ClusterRequest,
        options: RequestOptions,
    ) -> Result<ClusterResponse> {
        let mut attempts: u32 = 0;
        let mut waited_for_ring = false;

        loop {
            if !self.ring.is_ready() {
                if waited_for_ring {
                    return Err(Error::RingNotReady);
                }
                waited_for_ring = true;
                tracing::debug!(peer, "Local ring not ready, waiting");
                tokio::time::timeout(options.timeout, self.ring.ready())
                    .await
                    .map_err(|_| self.timeout_error(peer, &payload))?;
                continue;
            }

            if !self.ring.peers().iter().any(|p| p == peer) {
                return Err(Error::PeerNotFound(peer.to_string()));
            }

            attempts += 1;
            self.requests.fetch_add(1, Ordering::Relaxed);
            let outcome =
                tokio::time::timeout(options.timeout, self.ring.send(peer, payload.clone())).await;

            match outcome {
                Err(_) => return Err(self.timeout_error(peer, &payload)),
                Ok(Err(Error::RingNotReady)) if !waited_for_ring => {
                    // Our ring went away between the check and the send.
                    attempts -= 1;
                    waited_for_ring = true;
                    tokio::time::timeout(options.timeout, self.ring.ready())
                        .await
                        .map_err(|_| self.timeout_error(peer, &payload))?;
                }
                Ok(Ok(ClusterResponse::Error(WireError::RingNotReady))) => {
                    self.warnings.fetch_add(1, Ordering::Relaxed);
                    if attempts >= options.max_attempts {
                        return Err(Error::retries_exceeded(payload.kind(), attempts));
                    }
                    tracing::warn!(
                        peer,
                        attempts,
                        request = payload.kind(),
                        "Peer ring not ready, retrying"
                    );
                    tokio::time::sleep(self.retry_on_warning).await;
                }
                Ok(result) => return result,
            }
        }
    }

    fn timeout_error(&self, peer: &str, payload: &ClusterRequest) -> Error {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        Error::Timeout {
            peer: peer.to_string(),
            payload: format!("{:?}", payload),
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            requests: self.requests.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
        }
    }
}
