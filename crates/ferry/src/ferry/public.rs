//! Public listener. The `Host` header decides where a connection goes: a
//! tunnel subdomain is forwarded to that tunnel, anything else reaches the API.

use std::{convert::Infallible, net::IpAddr, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full, combinators::UnsyncBoxBody};
use hyper::{Request, Response, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use tokio::net::{TcpListener, TcpStream};

use crate::ferry::{
    net::{self, PrefixedStream},
    protocol::{self, RequestHead},
    tunnel::{client::TunnelClient, registry::ClientRegistry},
};

#[derive(Clone)]
pub struct PublicFront {
    registry: Arc<ClientRegistry>,
    domain: Option<Arc<str>>,
    api: axum::Router,
    handshake_timeout: Duration,
    max_head_bytes: usize,
}

impl PublicFront {
    pub fn new(
        registry: Arc<ClientRegistry>,
        domain: Option<String>,
        api: axum::Router,
        handshake_timeout: Duration,
        max_head_bytes: usize,
    ) -> Self {
        Self {
            registry,
            domain: domain.map(Arc::from),
            api,
            handshake_timeout,
            max_head_bytes,
        }
    }

    async fn handle(&self, mut conn: TcpStream) {
        let mut buf = Vec::with_capacity(1024);
        let read = tokio::time::timeout(
            self.handshake_timeout,
            protocol::read_request_head(&mut conn, &mut buf, self.max_head_bytes),
        )
        .await;
        let (head, len) = match read {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(err)) => {
                tracing::debug!(err = %err, "public: bad request head");
                let _ = protocol::write_text_response(
                    &mut conn,
                    StatusCode::BAD_REQUEST,
                    "Bad request.",
                    false,
                )
                .await;
                return;
            }
            Err(_) => {
                tracing::debug!("public: request head timed out");
                return;
            }
        };

        let id = head
            .host()
            .and_then(|host| tunnel_id_from_host(host, self.domain.as_deref()));
        let Some(id) = id else {
            self.serve_api(conn, buf).await;
            return;
        };

        let client = match self.registry.lookup_by_id(&id) {
            Ok(client) => client,
            Err(_) if head.is_upgrade() => {
                tracing::debug!(client = %id, "public: upgrade for unknown client");
                return;
            }
            Err(_) => {
                let body = format!("Client \"{id}\" not found.");
                let _ =
                    protocol::write_text_response(&mut conn, StatusCode::NOT_FOUND, &body, false)
                        .await;
                return;
            }
        };

        if head.is_upgrade() {
            let early = Bytes::copy_from_slice(&buf[len..]);
            drop(buf);
            client.proxy_upgrade(&head, conn, early).await;
        } else {
            serve_proxied(client, &head, conn, buf).await;
        }
    }

    async fn serve_api(&self, conn: TcpStream, buf: Vec<u8>) {
        let io = TokioIo::new(PrefixedStream::new(buf, conn));
        let svc = TowerToHyperService::new(self.api.clone());
        if let Err(err) = http1::Builder::new()
            .keep_alive(false)
            .serve_connection(io, svc)
            .await
        {
            tracing::debug!(err = %err, "public: api connection ended");
        }
    }
}

type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Runs one request/response exchange through `client`. The connection is
/// closed afterwards so the next request on it is routed afresh.
async fn serve_proxied(client: Arc<TunnelClient>, head: &RequestHead, conn: TcpStream, buf: Vec<u8>) {
    tracing::debug!(client = %client.id(), method = %head.method, path = %head.path, "public: proxy request");

    let io = TokioIo::new(PrefixedStream::new(buf, conn));
    let svc = service_fn(move |req: Request<Incoming>| {
        let client = client.clone();
        async move {
            let resp = match client.proxy_request(req).await {
                Ok(resp) => resp.map(BodyExt::boxed_unsync),
                Err(err) => {
                    tracing::debug!(client = %client.id(), err = %err, "public: proxy failed");
                    bad_gateway()
                }
            };
            Ok::<_, Infallible>(resp)
        }
    });

    if let Err(err) = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(io, svc)
        .await
    {
        tracing::debug!(err = %err, "public: proxied connection ended");
    }
}

fn bad_gateway() -> Response<ProxyBody> {
    let body = Full::new(Bytes::from_static(b"Bad Gateway"))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut resp = Response::new(body);
    *resp.status_mut() = StatusCode::BAD_GATEWAY;
    resp
}

/// The tunnel id a `Host` header addresses, if any.
///
/// With a configured `domain` the host must be a strict subdomain of it.
/// Without one, any host of three or more labels qualifies (`localhost`
/// counts as a two-label suffix). IP literals never carry an id.
pub fn tunnel_id_from_host(host: &str, domain: Option<&str>) -> Option<String> {
    let host = host.trim();
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty()
        || host.starts_with('[')
        || host.parse::<IpAddr>().is_ok()
    {
        return None;
    }

    let sub = match domain {
        Some(domain) => {
            let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
            host.strip_suffix(domain.as_str())?.strip_suffix('.')?.to_string()
        }
        None => {
            let labels: Vec<&str> = host.split('.').collect();
            let suffix_labels = if labels.last() == Some(&"localhost") { 1 } else { 2 };
            if labels.len() <= suffix_labels {
                return None;
            }
            labels[..labels.len() - suffix_labels].join(".")
        }
    };

    sub.split('.')
        .next()
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}

pub async fn serve_with_shutdown(
    listen_addr: &str,
    front: PublicFront,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind public listener {listen_addr}"))?;
    serve(ln, front, shutdown).await
}

pub async fn serve(
    ln: TcpListener,
    front: PublicFront,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(addr = %ln.local_addr()?, "public: listening");

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
                        tracing::warn!(err = %err, "public: accept failed");
                        continue;
                    }
                };
                let front = front.clone();
                tokio::spawn(async move {
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(client = %peer, "public: accepted");
                    }
                    front.handle(conn).await;
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        time::timeout,
    };

    use super::*;
    use crate::ferry::{
        api::{self, ApiState},
        tunnel::{
            acceptor::{Acceptor, AcceptorOptions},
            client::GracePeriod,
        },
    };

    const WAIT: Duration = Duration::from_secs(3);

    #[test]
    fn tunnel_ids_from_hosts() {
        let d = Some("example.com");
        assert_eq!(tunnel_id_from_host("abcd.example.com", d).as_deref(), Some("abcd"));
        assert_eq!(tunnel_id_from_host("ABCD.Example.com:8080", d).as_deref(), Some("abcd"));
        assert_eq!(tunnel_id_from_host("a.b.example.com", d).as_deref(), Some("a"));
        assert_eq!(tunnel_id_from_host("example.com", d), None);
        assert_eq!(tunnel_id_from_host("abcd.other.com", d), None);
        assert_eq!(tunnel_id_from_host("xexample.com", d), None);

        assert_eq!(tunnel_id_from_host("abcd.example.com", None).as_deref(), Some("abcd"));
        assert_eq!(tunnel_id_from_host("example.com", None), None);
        assert_eq!(tunnel_id_from_host("abcd.localhost:3000", None).as_deref(), Some("abcd"));
        assert_eq!(tunnel_id_from_host("localhost", None), None);
        assert_eq!(tunnel_id_from_host("127.0.0.1:80", None), None);
        assert_eq!(tunnel_id_from_host("[::1]:80", None), None);
    }

    struct Harness {
        registry: Arc<ClientRegistry>,
        public: SocketAddr,
        tunnel: SocketAddr,
        _stop: tokio::sync::watch::Sender<bool>,
    }

    async fn harness() -> Harness {
        let registry = Arc::new(ClientRegistry::new(4, GracePeriod::Disabled));
        let (stop, rx) = tokio::sync::watch::channel(false);

        let tunnel_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel = tunnel_ln.local_addr().unwrap();
        let acceptor = Acceptor::new(AcceptorOptions {
            listen_addr: tunnel.to_string(),
            handshake_timeout: Duration::from_secs(1),
            max_head_bytes: 16 * 1024,
            registry: registry.clone(),
        });
        let acceptor_rx = rx.clone();
        tokio::spawn(async move { acceptor.serve(tunnel_ln, acceptor_rx).await });

        let public_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public = public_ln.local_addr().unwrap();
        let api = api::router(ApiState {
            registry: registry.clone(),
            metrics: None,
        });
        let front = PublicFront::new(
            registry.clone(),
            Some("example.com".into()),
            api,
            Duration::from_secs(1),
            16 * 1024,
        );
        tokio::spawn(serve(public_ln, front, rx));

        Harness {
            registry,
            public,
            tunnel,
            _stop: stop,
        }
    }

    /// Dials the acceptance endpoint the way a tunnel client does and returns
    /// the raw socket once it has been admitted.
    async fn lend_socket(tunnel: SocketAddr, secret: &str) -> TcpStream {
        let mut conn = TcpStream::connect(tunnel).await.unwrap();
        conn.write_all(format!("POST /connect HTTP/1.1\r\nX-Client-Secret: {secret}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut got = Vec::new();
        let mut byte = [0u8; 1];
        while !got.ends_with(b"Connection created.") {
            let n = timeout(WAIT, conn.read(&mut byte)).await.unwrap().unwrap();
            assert!(n > 0, "tunnel socket refused");
            got.push(byte[0]);
        }
        conn
    }

    async fn read_until(conn: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
        let mut got = Vec::new();
        let mut chunk = [0u8; 512];
        while !got.windows(needle.len()).any(|w| w == needle) {
            let n = timeout(WAIT, conn.read(&mut chunk)).await.unwrap().unwrap();
            assert!(n > 0, "closed before {:?}", String::from_utf8_lossy(needle));
            got.extend_from_slice(&chunk[..n]);
        }
        got
    }

    async fn public_request(addr: SocketAddr, raw: &str) -> String {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        timeout(WAIT, conn.read_to_end(&mut out)).await.unwrap().unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn bare_domain_reaches_api() {
        let h = harness().await;
        h.registry.register("abcd", "s1", None).unwrap();

        let resp = public_request(h.public, "GET /api/status HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"), "got: {resp}");
        assert!(resp.ends_with(r#"{"tunnels":1}"#), "got: {resp}");
    }

    #[tokio::test]
    async fn unknown_tunnel_is_404() {
        let h = harness().await;
        let resp = public_request(h.public, "GET / HTTP/1.1\r\nHost: nope.example.com\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {resp}");
        assert!(resp.ends_with("Client \"nope\" not found."));
    }

    #[tokio::test]
    async fn request_is_forwarded_through_tunnel() {
        let h = harness().await;
        h.registry.register("abcd", "s1", None).unwrap();
        let mut local = lend_socket(h.tunnel, "s1").await;

        let upstream = tokio::spawn(async move {
            let seen = read_until(&mut local, b"\r\n\r\nping").await;
            local
                .write_all(b"HTTP/1.1 201 Created\r\nx-powered-by: dummy\r\ncontent-length: 4\r\n\r\npong")
                .await
                .unwrap();
            String::from_utf8(seen).unwrap()
        });

        let resp = public_request(
            h.public,
            "POST /submit?x=1 HTTP/1.1\r\nHost: abcd.example.com\r\nContent-Length: 4\r\n\r\nping",
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 201 Created\r\n"), "got: {resp}");
        assert!(resp.to_ascii_lowercase().contains("x-powered-by: dummy"));
        assert!(resp.ends_with("pong"));

        let seen = upstream.await.unwrap();
        assert!(seen.starts_with("POST /submit?x=1 HTTP/1.1\r\n"), "got: {seen}");
        assert!(seen.to_ascii_lowercase().contains("host: abcd.example.com"));
    }

    #[tokio::test]
    async fn broken_tunnel_yields_bad_gateway() {
        let h = harness().await;
        h.registry.register("abcd", "s1", None).unwrap();
        let mut local = lend_socket(h.tunnel, "s1").await;
        tokio::spawn(async move {
            read_until(&mut local, b"\r\n\r\n").await;
            drop(local);
        });

        let resp = public_request(h.public, "GET / HTTP/1.1\r\nHost: abcd.example.com\r\n\r\n").await;
        assert!(resp.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "got: {resp}");
    }

    #[tokio::test]
    async fn upgrade_is_spliced_through_tunnel() {
        let h = harness().await;
        h.registry.register("abcd", "s1", None).unwrap();
        let mut local = lend_socket(h.tunnel, "s1").await;

        let mut public = TcpStream::connect(h.public).await.unwrap();
        public
            .write_all(b"GET /ws HTTP/1.1\r\nHost: abcd.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
            .await
            .unwrap();

        let seen = read_until(&mut local, b"\r\n\r\n").await;
        assert_eq!(
            String::from_utf8(seen).unwrap(),
            "GET /ws HTTP/1.1\r\nHost: abcd.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n"
        );

        local
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\nhello")
            .await
            .unwrap();
        let got = read_until(&mut public, b"hello").await;
        assert!(got.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));

        public.write_all(b"frame").await.unwrap();
        let mut buf = [0u8; 5];
        timeout(WAIT, local.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"frame");
    }
}
