//! The endpoint tunnel clients dial to lend a socket to their pool.
//!
//! Each connection carries exactly one HTTP/1.x request. A rejected request
//! gets a plain-text answer and the connection is closed; an accepted one gets
//! `200 Connection created.` and from then on the socket is raw bytes owned by
//! the client's pool.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use http::StatusCode;
use tokio::net::{TcpListener, TcpStream};

use crate::ferry::{
    net,
    protocol::{self, RequestHead},
    tunnel::registry::ClientRegistry,
};

pub const SECRET_HEADER: &str = "x-client-secret";

const HEALTHY: &str = "All systems are operational.";

#[derive(Debug, Clone)]
pub struct AcceptorOptions {
    pub listen_addr: String,
    pub handshake_timeout: Duration,
    pub max_head_bytes: usize,
    pub registry: Arc<ClientRegistry>,
}

pub struct Acceptor {
    opts: AcceptorOptions,
}

impl Acceptor {
    pub fn new(opts: AcceptorOptions) -> Self {
        Self { opts }
    }

    pub async fn listen_and_serve(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind tunnel listener {}", self.opts.listen_addr))?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: TcpListener,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(addr = %ln.local_addr()?, "tunnel: listening");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!(err = %err, "tunnel: accept failed");
                            continue;
                        }
                    };
                    let registry = self.opts.registry.clone();
                    let handshake_timeout = self.opts.handshake_timeout;
                    let max_head_bytes = self.opts.max_head_bytes;
                    tokio::spawn(async move {
                        tracing::debug!(peer = %peer, "tunnel: accepted");
                        let res = tokio::time::timeout(
                            handshake_timeout,
                            handle_conn(registry, conn, max_head_bytes),
                        )
                        .await;
                        match res {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                tracing::debug!(peer = %peer, err = %err, "tunnel: handshake failed");
                            }
                            Err(_) => {
                                tracing::debug!(peer = %peer, "tunnel: handshake timed out");
                            }
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict<'a> {
    Health,
    Connect(&'a str),
    Reject(StatusCode, &'static str),
}

/// Checks that need nothing but the request head, in answer order.
fn decide(head: &RequestHead) -> Verdict<'_> {
    let path = head.route_path();
    if head.method == "GET" && path == "/" {
        return Verdict::Health;
    }
    if head.method != "GET" && head.method != "POST" {
        return Verdict::Reject(
            StatusCode::METHOD_NOT_ALLOWED,
            "Only GET/POST methods are supported.",
        );
    }
    if path != "/connect" {
        return Verdict::Reject(StatusCode::NOT_FOUND, "Not found.");
    }

    let values: Vec<&[u8]> = head.header_values(SECRET_HEADER).collect();
    match values.as_slice() {
        [] => Verdict::Reject(StatusCode::BAD_REQUEST, "Client secret is missing."),
        [raw] => match std::str::from_utf8(raw).map(str::trim) {
            Ok("") => Verdict::Reject(StatusCode::BAD_REQUEST, "Client secret is missing."),
            Ok(secret) => Verdict::Connect(secret),
            Err(_) => Verdict::Reject(StatusCode::BAD_REQUEST, "Client secret is invalid."),
        },
        _ => Verdict::Reject(StatusCode::BAD_REQUEST, "Client secret is invalid."),
    }
}

async fn handle_conn(
    registry: Arc<ClientRegistry>,
    mut conn: TcpStream,
    max_head_bytes: usize,
) -> anyhow::Result<()> {
    let mut buf = Vec::with_capacity(1024);
    let (head, len) = protocol::read_request_head(&mut conn, &mut buf, max_head_bytes).await?;

    let secret = match decide(&head) {
        Verdict::Health => return reply(&mut conn, StatusCode::OK, HEALTHY, false).await,
        Verdict::Reject(status, body) => return reply(&mut conn, status, body, false).await,
        Verdict::Connect(secret) => secret,
    };

    let Ok(client) = registry.lookup_by_secret(secret) else {
        return reply(&mut conn, StatusCode::NOT_FOUND, "Client not found.", false).await;
    };
    if !client.pool().can_admit() {
        return reply(&mut conn, StatusCode::FORBIDDEN, "Too many connections.", false).await;
    }
    if conn.peer_addr().is_err() {
        return reply(
            &mut conn,
            StatusCode::INTERNAL_SERVER_ERROR,
            "Socket was not created.",
            false,
        )
        .await;
    }

    reply(&mut conn, StatusCode::OK, "Connection created.", true).await?;
    if buf.len() > len {
        tracing::debug!(
            client = %client.id(),
            discarded = buf.len() - len,
            "tunnel: bytes after connect request dropped"
        );
    }
    drop(buf);

    if client.pool().admit(conn) {
        tracing::debug!(client = %client.id(), "tunnel: socket admitted");
    }
    Ok(())
}

async fn reply(
    conn: &mut TcpStream,
    status: StatusCode,
    body: &str,
    keep_alive: bool,
) -> anyhow::Result<()> {
    protocol::write_text_response(conn, status, body, keep_alive).await?;
    Ok(())
}
