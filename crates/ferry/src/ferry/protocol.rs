use http::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on header lines accepted in a single request head.
pub const MAX_HEADERS: usize = 100;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("need more data")]
    NeedMoreData,
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("connection closed before request head completed")]
    Eof,
    #[error("read request head: {0}")]
    Io(#[from] std::io::Error),
}

/// An HTTP/1.x request line plus its header lines, exactly as they were sent.
///
/// Header pairs keep wire order, duplicates and original name casing; values
/// are kept as raw bytes. Nothing here goes through a normalized header map,
/// so the head can be replayed byte-for-byte onto a tunnel socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor HTTP version (`0` for HTTP/1.0, `1` for HTTP/1.1).
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Parses a complete request head from the start of `buf`.
    ///
    /// Returns the head and the number of bytes it occupies (including the
    /// terminating blank line). Bytes past that offset belong to the body or to
    /// whatever protocol follows an upgrade.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ParseError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Err(ParseError::NeedMoreData),
        };

        let head = RequestHead {
            method: req.method.unwrap_or_default().to_string(),
            path: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        };
        Ok((head, len))
    }

    /// All values of header `name` (case-insensitive), in wire order.
    pub fn header_values<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a [u8]> + use<'a, 'n> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// First value of header `name`, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
            .map(str::trim)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host").filter(|h| !h.is_empty())
    }

    /// Path without the query string.
    pub fn route_path(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }

    /// A request asking to switch protocols (`Connection: upgrade` plus an
    /// `Upgrade` header).
    pub fn is_upgrade(&self) -> bool {
        let has_upgrade = self.header_values("upgrade").any(|v| !v.is_empty());
        let connection_upgrade = self.header_values("connection").any(|v| {
            String::from_utf8_lossy(v)
                .split(',')
                .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
        });
        has_upgrade && connection_upgrade
    }

    /// Rebuilds the head for replay onto a tunnel socket:
    /// `METHOD PATH HTTP/1.x`, every raw header pair, then a blank line.
    pub fn upgrade_preamble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.headers.len() * 32);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.path.as_bytes());
        out.extend_from_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Reads from `r` into `buf` until a full request head is buffered.
///
/// `buf` keeps every byte read, so the caller can replay whatever arrived
/// after the head (`buf[len..]`).
pub async fn read_request_head<R>(
    r: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<(RequestHead, usize), ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        if !buf.is_empty() {
            match RequestHead::parse(buf) {
                Ok(done) => return Ok(done),
                Err(ParseError::NeedMoreData) => {}
                Err(err) => return Err(err),
            }
        }
        if buf.len() >= max_bytes {
            return Err(ParseError::TooLarge(max_bytes));
        }
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return Err(ParseError::Eof);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Writes a complete plain-text HTTP/1.1 response. With `keep_alive` false
/// the write side is shut down afterwards.
pub async fn write_text_response<W>(
    w: &mut W,
    status: StatusCode,
    body: &str,
    keep_alive: bool,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
    );
    w.write_all(head.as_bytes()).await?;
    w.write_all(body.as_bytes()).await?;
    w.flush().await?;
    if !keep_alive {
        let _ = w.shutdown().await;
    }
    Ok(())
}
