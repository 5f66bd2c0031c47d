use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use hyper::{Request, Response, body::Incoming, client::conn::http1};
use hyper_util::rt::TokioIo;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::watch,
    time::{self, Instant},
};

use crate::ferry::{
    net,
    protocol::RequestHead,
    telemetry,
    tunnel::pool::{ConnectionPool, PoolError, PoolEvent, PoolEvents, PoolStats},
};

/// How long a tunnel may sit with zero connected sockets before it is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracePeriod {
    Disabled,
    After(Duration),
}

impl Default for GracePeriod {
    fn default() -> Self {
        GracePeriod::After(Duration::from_millis(3000))
    }
}

impl GracePeriod {
    /// `0` disables the countdown.
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            GracePeriod::Disabled
        } else {
            GracePeriod::After(Duration::from_millis(ms))
        }
    }

    fn deadline(self) -> Option<Instant> {
        match self {
            GracePeriod::Disabled => None,
            GracePeriod::After(d) => Some(Instant::now() + d),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no tunnel socket: {0}")]
    Pool(#[from] PoolError),
    #[error("tunnel handshake: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("tunnel request: {0}")]
    Request(#[source] hyper::Error),
}

/// One registered tunnel: its identity, its socket pool, and the countdown
/// that retires it once the pool has been empty for the grace period.
pub struct TunnelClient {
    id: String,
    secret: String,
    pool: ConnectionPool,
    closing: AtomicBool,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for TunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl TunnelClient {
    /// Wraps `pool` and starts the lifecycle task. The countdown starts armed,
    /// since a new pool has no sockets yet.
    pub fn new(
        id: impl Into<String>,
        secret: impl Into<String>,
        pool: ConnectionPool,
        events: PoolEvents,
        grace: GracePeriod,
    ) -> Arc<Self> {
        let (closed, closed_rx) = watch::channel(false);
        let client = Arc::new(Self {
            id: id.into(),
            secret: secret.into(),
            pool,
            closing: AtomicBool::new(false),
            closed,
        });
        tokio::spawn(lifecycle(
            Arc::downgrade(&client),
            client.id.clone(),
            events,
            closed_rx,
            grace,
        ));
        client
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Resolves once the client has been closed (immediately if it already is).
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Closes the pool and signals `closed()` subscribers. Idempotent.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close();
        self.closed.send_replace(true);
        tracing::info!(client = %self.id, "client: closed");
    }

    /// Sends one HTTP request through a pooled socket and returns the
    /// response, whose body keeps streaming from that socket.
    ///
    /// The socket serves this exchange only and is closed when the response
    /// body is done.
    pub async fn proxy_request<B>(&self, req: Request<B>) -> Result<Response<Incoming>, ProxyError>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        metrics::counter!(telemetry::PROXY_REQUESTS).increment(1);
        let socket = self.pool.acquire().await?;
        let peer = socket.peer_addr();

        let (mut sender, conn) = http1::handshake(TokioIo::new(socket))
            .await
            .map_err(ProxyError::Handshake)?;

        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(client = %id, peer = ?peer, err = %err, "client: tunnel connection ended");
            }
        });

        tracing::debug!(
            client = %self.id,
            method = %req.method(),
            uri = %req.uri(),
            "client: proxying request"
        );
        sender.send_request(req).await.map_err(ProxyError::Request)
    }

    /// Splices an upgraded public connection onto a pooled socket.
    ///
    /// The request head is replayed as raw header pairs, followed by `early`
    /// (bytes the public peer already sent past its head). Errors end the
    /// exchange; nothing is reported back.
    pub async fn proxy_upgrade(&self, head: &RequestHead, mut public: TcpStream, early: Bytes) {
        metrics::counter!(telemetry::PROXY_UPGRADES).increment(1);

        let mut tunnel = match self.pool.acquire().await {
            Ok(socket) => socket,
            Err(err) => {
                tracing::debug!(client = %self.id, err = %err, "client: upgrade without socket");
                let _ = public.shutdown().await;
                return;
            }
        };

        if !net::is_connected(&public).await {
            tracing::debug!(client = %self.id, "client: public side gone before upgrade");
            drop(tunnel);
            let _ = public.shutdown().await;
            return;
        }

        let mut preamble = head.upgrade_preamble();
        preamble.extend_from_slice(&early);
        if let Err(err) = tunnel.write_all(&preamble).await {
            tracing::debug!(client = %self.id, err = %err, "client: write upgrade preamble");
            let _ = public.shutdown().await;
            return;
        }

        match tokio::io::copy_bidirectional(&mut public, &mut tunnel).await {
            Ok((up, down)) => {
                tracing::debug!(client = %self.id, up, down, "client: upgrade finished");
            }
            Err(err) if net::is_benign_io_error(&err) => {
                tracing::debug!(client = %self.id, err = %err, "client: upgrade ended");
            }
            Err(err) => {
                tracing::warn!(client = %self.id, err = %err, "client: upgrade failed");
            }
        }
    }
}

async fn lifecycle(
    client: Weak<TunnelClient>,
    id: String,
    mut events: PoolEvents,
    mut closed: watch::Receiver<bool>,
    grace: GracePeriod,
) {
    let close = |reason: &str| {
        if let Some(client) = client.upgrade() {
            tracing::debug!(client = %id, reason, "client: closing");
            client.close();
        }
    };

    let mut deadline = grace.deadline();
    loop {
        let expiry = async move {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => break,
            ev = events.recv() => match ev {
                Some(PoolEvent::Online) => {
                    deadline = None;
                    tracing::debug!(client = %id, "client: online");
                }
                Some(PoolEvent::Offline) => {
                    deadline = grace.deadline();
                    tracing::debug!(client = %id, "client: offline");
                }
                Some(PoolEvent::End) | None => {
                    close("pool ended");
                    break;
                }
            },
            _ = expiry => {
                close("grace period elapsed");
                break;
            }
        }
    }
}
