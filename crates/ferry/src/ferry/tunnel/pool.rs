//! Per-tunnel pool of inbound sockets.
//!
//! A tunnel client dials the acceptance endpoint once per socket it is willing
//! to lend; each such socket is admitted here and later handed, exclusively, to
//! one public request or upgrade. Both hand-out orders are strict FIFO: the
//! oldest idle socket goes to the next acquirer, and a freshly admitted socket
//! goes to the oldest waiting acquirer instead of becoming idle.
//!
//! Every admitted socket carries a [`Lease`]. Whoever owns the socket owns the
//! lease, and dropping it is how the pool learns that a socket is gone.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    net::TcpStream,
    sync::{mpsc, oneshot},
};

use crate::ferry::{net, telemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool closed")]
    Closed,
}

/// Pool state transitions, delivered in order to the pool's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// First socket admitted while none were connected.
    Online,
    /// Last connected socket went away.
    Offline,
    /// The pool was closed; nothing can be admitted or acquired anymore.
    End,
}

pub type PoolEvents = mpsc::UnboundedReceiver<PoolEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub connected_sockets: usize,
}

/// Sent by an acquirer to an idle socket's watcher to take the socket.
type Claim = oneshot::Sender<PooledSocket>;
type Waiter = oneshot::Sender<Result<PooledSocket, PoolError>>;

struct Idle {
    seq: u64,
    claim: oneshot::Sender<Claim>,
}

struct State {
    connected: usize,
    available: VecDeque<Idle>,
    pending: VecDeque<Waiter>,
    closed: bool,
    next_seq: u64,
}

struct Shared {
    client_id: String,
    capacity: usize,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("client_id", &self.shared.client_id)
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates an empty pool and the receiving end of its event stream.
    pub fn new(client_id: impl Into<String>, capacity: usize) -> (Self, PoolEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            client_id: client_id.into(),
            capacity,
            state: Mutex::new(State {
                connected: 0,
                available: VecDeque::new(),
                pending: VecDeque::new(),
                closed: false,
                next_seq: 0,
            }),
            events: tx,
        });
        (Self { shared }, rx)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn can_admit(&self) -> bool {
        let st = self.shared.lock();
        !st.closed && st.connected < self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connected_sockets: self.shared.lock().connected,
        }
    }

    /// Takes ownership of a socket volunteered by the tunnel client.
    ///
    /// Returns false, and closes the socket, when the pool is full or closed;
    /// the connected count is left untouched in that case.
    pub fn admit(&self, stream: TcpStream) -> bool {
        let peer = stream.peer_addr().ok();
        {
            let mut st = self.shared.lock();
            if st.closed || st.connected >= self.shared.capacity {
                let closed = st.closed;
                drop(st);
                drop(stream);
                metrics::counter!(telemetry::SOCKETS_REJECTED).increment(1);
                tracing::debug!(
                    client = %self.shared.client_id,
                    peer = ?peer,
                    closed,
                    "pool: no more sockets allowed"
                );
                return false;
            }
            st.connected += 1;
            if st.connected == 1 {
                let _ = self.shared.events.send(PoolEvent::Online);
            }
        }

        metrics::counter!(telemetry::SOCKETS_ADMITTED).increment(1);
        metrics::gauge!(telemetry::SOCKETS_CONNECTED).increment(1.0);
        tracing::debug!(client = %self.shared.client_id, peer = ?peer, "pool: new connection");

        let socket = PooledSocket {
            stream,
            early: BytesMut::new(),
            peer,
            _lease: Lease {
                shared: self.shared.clone(),
            },
        };
        self.shared.offer(socket);
        true
    }

    /// Takes the oldest idle socket, or waits for the next admitted one.
    pub async fn acquire(&self) -> Result<PooledSocket, PoolError> {
        enum Next {
            Idle(Idle),
            Wait(oneshot::Receiver<Result<PooledSocket, PoolError>>),
        }

        loop {
            let next = {
                let mut st = self.shared.lock();
                if st.closed {
                    return Err(PoolError::Closed);
                }
                match st.available.pop_front() {
                    Some(idle) => Next::Idle(idle),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        st.pending.retain(|waiter| !waiter.is_closed());
                        st.pending.push_back(tx);
                        tracing::debug!(
                            client = %self.shared.client_id,
                            connected = st.connected,
                            waiting = st.pending.len(),
                            "pool: waiting for a socket"
                        );
                        Next::Wait(rx)
                    }
                }
            };

            match next {
                Next::Idle(idle) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if idle.claim.send(reply_tx).is_err() {
                        // Watcher already saw the socket die.
                        continue;
                    }
                    if let Ok(socket) = reply_rx.await {
                        tracing::debug!(client = %self.shared.client_id, "pool: socket given");
                        return Ok(socket);
                    }
                }
                Next::Wait(rx) => {
                    return rx.await.unwrap_or(Err(PoolError::Closed));
                }
            }
        }
    }

    /// Closes the pool: every waiting acquirer fails with [`PoolError::Closed`]
    /// and idle sockets are released. Sockets already handed out stay open
    /// until their exchange ends. Idempotent.
    pub fn close(&self) {
        let (pending, idle) = {
            let mut st = self.shared.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            (
                std::mem::take(&mut st.pending),
                std::mem::take(&mut st.available),
            )
        };

        let waiting = pending.len();
        for waiter in pending {
            let _ = waiter.send(Err(PoolError::Closed));
        }
        // Dropping the claim senders tells each idle watcher to let go.
        drop(idle);

        tracing::debug!(client = %self.shared.client_id, waiting, "pool: closed");
        let _ = self.shared.events.send(PoolEvent::End);
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self) -> usize {
        self.shared.lock().pending.len()
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.shared.lock().available.len()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes a socket to the oldest live waiter, or parks it as idle.
    ///
    /// Channel sends happen outside the lock: a failed send hands the socket
    /// back, and a dropped socket re-enters the lock through its lease.
    fn offer(self: &Arc<Self>, socket: PooledSocket) {
        let mut socket = socket;
        loop {
            let waiter = {
                let mut st = self.lock();
                if st.closed {
                    drop(st);
                    drop(socket);
                    return;
                }
                match st.pending.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        let seq = st.next_seq;
                        st.next_seq += 1;
                        let (claim_tx, claim_rx) = oneshot::channel();
                        st.available.push_back(Idle {
                            seq,
                            claim: claim_tx,
                        });
                        drop(st);
                        tokio::spawn(park(self.clone(), seq, socket, claim_rx));
                        return;
                    }
                }
            };

            match waiter.send(Ok(socket)) {
                Ok(()) => {
                    tracing::debug!(client = %self.client_id, "pool: giving socket to queued acquirer");
                    return;
                }
                // The waiter gave up; try the next one.
                Err(Ok(returned)) => socket = returned,
                Err(Err(_)) => return,
            }
        }
    }

    fn forget_idle(&self, seq: u64) {
        let mut st = self.lock();
        st.available.retain(|idle| idle.seq != seq);
    }

    fn release(&self) {
        let mut st = self.lock();
        st.connected = st.connected.saturating_sub(1);
        let connected = st.connected;
        if connected == 0 {
            let _ = self.events.send(PoolEvent::Offline);
        }
        drop(st);

        metrics::gauge!(telemetry::SOCKETS_CONNECTED).decrement(1.0);
        tracing::debug!(client = %self.client_id, connected, "pool: closed socket");
        if connected == 0 {
            tracing::debug!(client = %self.client_id, "pool: all sockets disconnected");
        }
    }
}

/// Most unsolicited bytes an idle socket may buffer before it is dropped.
const MAX_EARLY_BYTES: usize = 64 * 1024;

enum Watch {
    Read(io::Result<usize>),
    Claimed(Result<Claim, oneshot::error::RecvError>),
}

/// Owns an idle socket until an acquirer claims it or its peer goes away.
///
/// Bytes the peer sends while idle are kept on the socket and replayed to
/// whoever takes it, so a close that follows them is still seen here.
async fn park(
    shared: Arc<Shared>,
    seq: u64,
    mut socket: PooledSocket,
    mut claim_rx: oneshot::Receiver<Claim>,
) {
    loop {
        // A visible EOF wins over a simultaneous claim.
        let watch = tokio::select! {
            biased;
            res = socket.stream.read_buf(&mut socket.early) => Watch::Read(res),
            claim = &mut claim_rx => Watch::Claimed(claim),
        };

        match watch {
            Watch::Read(Ok(0)) => {
                shared.forget_idle(seq);
                tracing::debug!(client = %shared.client_id, peer = ?socket.peer, "pool: idle socket closed by peer");
                return;
            }
            Watch::Read(Ok(_)) => {
                if socket.early.len() > MAX_EARLY_BYTES {
                    shared.forget_idle(seq);
                    tracing::warn!(
                        client = %shared.client_id,
                        peer = ?socket.peer,
                        buffered = socket.early.len(),
                        "pool: idle socket sent too much unsolicited data"
                    );
                    return;
                }
            }
            Watch::Read(Err(err)) => {
                shared.forget_idle(seq);
                if net::is_benign_io_error(&err) {
                    tracing::debug!(client = %shared.client_id, err = %err, "pool: idle socket dropped");
                } else {
                    tracing::warn!(client = %shared.client_id, err = %err, "pool: idle socket error");
                }
                return;
            }
            Watch::Claimed(claim) => {
                if let Ok(reply) = claim {
                    hand_over(&shared, socket, reply);
                }
                return;
            }
        }
    }
}

fn hand_over(shared: &Arc<Shared>, socket: PooledSocket, reply: Claim) {
    if let Err(socket) = reply.send(socket) {
        // Acquirer vanished between claiming and receiving.
        shared.offer(socket);
    }
}

/// Keeps a socket counted as connected for as long as it lives.
struct Lease {
    shared: Arc<Shared>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// A tunnel socket on loan from a [`ConnectionPool`].
///
/// Reads first replay anything the peer sent while the socket sat idle, then
/// go to the TCP stream. Dropping it closes the socket and releases its slot
/// in the pool.
pub struct PooledSocket {
    stream: TcpStream,
    early: BytesMut,
    peer: Option<SocketAddr>,
    _lease: Lease,
}

impl std::fmt::Debug for PooledSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSocket")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl PooledSocket {
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl AsyncRead for PooledSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.early.is_empty() {
            let n = this.early.len().min(buf.remaining());
            buf.put_slice(&this.early[..n]);
            this.early.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        time::timeout,
    };

    use super::*;
    use crate::ferry::net::testing::tcp_pair;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_event(events: &mut PoolEvents) -> PoolEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("event timeout")
            .expect("event stream open")
    }

    #[tokio::test]
    async fn empty_pool_stats() {
        let (pool, _events) = ConnectionPool::new("any", 10);
        assert_eq!(pool.stats(), PoolStats { connected_sockets: 0 });
        assert!(pool.can_admit());
        assert!(!pool.is_closed());
        pool.close();
        assert!(pool.is_closed());
        assert!(!pool.can_admit());
    }

    #[tokio::test]
    async fn capacity_one_online_offline_cycle() {
        let (pool, mut events) = ConnectionPool::new("any", 1);

        let (a_remote, a) = tcp_pair().await;
        assert!(pool.admit(a));
        assert_eq!(next_event(&mut events).await, PoolEvent::Online);
        assert_eq!(pool.stats().connected_sockets, 1);
        assert!(!pool.can_admit());

        let (mut b_remote, b) = tcp_pair().await;
        assert!(!pool.admit(b));
        assert_eq!(pool.stats().connected_sockets, 1);
        let mut buf = [0u8; 1];
        let n = timeout(WAIT, b_remote.read(&mut buf))
            .await
            .expect("rejected socket closes")
            .unwrap_or(0);
        assert_eq!(n, 0);

        drop(a_remote);
        assert_eq!(next_event(&mut events).await, PoolEvent::Offline);
        assert_eq!(pool.stats().connected_sockets, 0);
        assert_eq!(pool.idle(), 0);

        let (_c_remote, c) = tcp_pair().await;
        assert!(pool.admit(c));
        assert_eq!(next_event(&mut events).await, PoolEvent::Online);
        assert_eq!(pool.stats().connected_sockets, 1);
    }

    #[tokio::test]
    async fn offline_only_after_last_socket() {
        let (pool, mut events) = ConnectionPool::new("any", 10);
        let (a_remote, a) = tcp_pair().await;
        let (b_remote, b) = tcp_pair().await;
        assert!(pool.admit(a));
        assert!(pool.admit(b));
        assert_eq!(next_event(&mut events).await, PoolEvent::Online);

        drop(a_remote);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(pool.stats().connected_sockets, 1);

        drop(b_remote);
        assert_eq!(next_event(&mut events).await, PoolEvent::Offline);
    }

    #[tokio::test]
    async fn idle_socket_that_talks_then_closes_is_released() {
        let (pool, mut events) = ConnectionPool::new("any", 10);
        let (mut remote, local) = tcp_pair().await;
        assert!(pool.admit(local));
        assert_eq!(next_event(&mut events).await, PoolEvent::Online);

        remote.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(remote);

        assert_eq!(next_event(&mut events).await, PoolEvent::Offline);
        assert_eq!(pool.stats().connected_sockets, 0);
        assert_eq!(pool.idle(), 0);
    }

    #[tokio::test]
    async fn bytes_sent_while_idle_reach_the_acquirer() {
        let (pool, _events) = ConnectionPool::new("any", 10);
        let (mut remote, local) = tcp_pair().await;
        assert!(pool.admit(local));

        remote.write_all(b"early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.idle(), 1);

        let mut socket = timeout(WAIT, pool.acquire()).await.unwrap().unwrap();
        remote.write_all(b"-late").await.unwrap();
        let mut buf = [0u8; 10];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early-late");
    }

    #[tokio::test]
    async fn idle_socket_is_handed_out_and_carries_bytes() {
        let (pool, _events) = ConnectionPool::new("any", 10);
        let (mut remote, local) = tcp_pair().await;
        assert!(pool.admit(local));

        let mut socket = timeout(WAIT, pool.acquire()).await.unwrap().unwrap();
        socket.write_all(b"foo").await.unwrap();

        let mut buf = [0u8; 3];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"foo");
        assert_eq!(pool.stats().connected_sockets, 1);

        drop(socket);
        assert_eq!(pool.stats().connected_sockets, 0);
    }

    #[tokio::test]
    async fn pending_acquire_waits_for_next_admit() {
        let (pool, _events) = ConnectionPool::new("any", 10);
        let pool = Arc::new(pool);

        let acquirer = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!acquirer.is_finished());
        assert_eq!(pool.waiting(), 1);

        let (mut remote, local) = tcp_pair().await;
        assert!(pool.admit(local));
        assert_eq!(pool.idle(), 0);

        let mut socket = timeout(WAIT, acquirer).await.unwrap().unwrap().unwrap();
        remote.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn queued_acquirers_are_served_fifo() {
        let (pool, _events) = ConnectionPool::new("any", 10);
        let pool = Arc::new(pool);

        let mut acquirers = Vec::new();
        for k in 0..3 {
            let pool2 = pool.clone();
            acquirers.push(tokio::spawn(async move {
                let mut socket = pool2.acquire().await.unwrap();
                let mut tag = [0u8; 1];
                socket.read_exact(&mut tag).await.unwrap();
                tag[0]
            }));
            while pool.waiting() < k + 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        let mut remotes = Vec::new();
        for k in 0..3u8 {
            let (mut remote, local) = tcp_pair().await;
            assert!(pool.admit(local));
            remote.write_all(&[k]).await.unwrap();
            remotes.push(remote);
        }

        for (k, acquirer) in acquirers.into_iter().enumerate() {
            let tag = timeout(WAIT, acquirer).await.unwrap().unwrap();
            assert_eq!(tag as usize, k);
        }
    }

    #[tokio::test]
    async fn idle_sockets_are_handed_out_fifo() {
        let (pool, _events) = ConnectionPool::new("any", 10);
        let mut remotes = Vec::new();
        for k in 0..3u8 {
            let (mut remote, local) = tcp_pair().await;
            assert!(pool.admit(local));
            remote.write_all(&[k]).await.unwrap();
            remotes.push(remote);
        }

        for k in 0..3u8 {
            let mut socket = timeout(WAIT, pool.acquire()).await.unwrap().unwrap();
            let mut tag = [0u8; 1];
            socket.read_exact(&mut tag).await.unwrap();
            assert_eq!(tag[0], k);
        }
    }

    #[tokio::test]
    async fn close_fails_every_waiter() {
        let (pool, mut events) = ConnectionPool::new("any", 10);
        let pool = Arc::new(pool);

        let mut acquirers = Vec::new();
        for k in 0..3 {
            let pool2 = pool.clone();
            acquirers.push(tokio::spawn(async move { pool2.acquire().await }));
            while pool.waiting() < k + 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        pool.close();
        assert_eq!(pool.waiting(), 0);
        for acquirer in acquirers {
            let res = timeout(WAIT, acquirer).await.unwrap().unwrap();
            assert_eq!(res.unwrap_err(), PoolError::Closed);
        }
        assert_eq!(next_event(&mut events).await, PoolEvent::End);

        assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed);
        let (_remote, local) = tcp_pair().await;
        assert!(!pool.admit(local));
    }

    #[tokio::test]
    async fn close_releases_idle_but_not_leased_sockets() {
        let (pool, _events) = ConnectionPool::new("any", 10);
        let (mut idle_remote, idle_local) = tcp_pair().await;
        let (mut leased_remote, leased_local) = tcp_pair().await;
        assert!(pool.admit(leased_local));
        let mut leased = pool.acquire().await.unwrap();
        assert!(pool.admit(idle_local));

        pool.close();

        let mut buf = [0u8; 1];
        let n = timeout(WAIT, idle_remote.read(&mut buf))
            .await
            .expect("idle socket released")
            .unwrap_or(0);
        assert_eq!(n, 0);

        leased.write_all(b"y").await.unwrap();
        leased_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"y");
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped() {
        let (pool, _events) = ConnectionPool::new("any", 10);
        let pool = Arc::new(pool);

        let gone = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        while pool.waiting() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        gone.abort();
        let _ = gone.await;

        let (_remote, local) = tcp_pair().await;
        assert!(pool.admit(local));
        let socket = timeout(WAIT, pool.acquire()).await.unwrap();
        assert!(socket.is_ok());
    }

    #[tokio::test]
    async fn abandoned_waiters_do_not_pile_up() {
        let (pool, _events) = ConnectionPool::new("any", 10);

        for _ in 0..5 {
            let gave_up = timeout(Duration::from_millis(10), pool.acquire()).await;
            assert!(gave_up.is_err());
        }
        assert!(pool.waiting() <= 1);

        let pool = Arc::new(pool);
        let acquirer = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.waiting(), 1);

        let (_remote, local) = tcp_pair().await;
        assert!(pool.admit(local));
        let socket = timeout(WAIT, acquirer).await.unwrap().unwrap();
        assert!(socket.is_ok());
    }
}
