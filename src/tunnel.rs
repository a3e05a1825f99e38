//! Tunnel relay: one listener per source port
//!
//! Each accepted connection runs a sequential forward loop that reads a
//! request head, routes it by `Host`, splices in the rewritten host and path,
//! and forwards the body using its framing. The remote side is opened lazily
//! on the first forwarded request; its read half is then handed to a reverse
//! copier that streams responses back unmodified.

use crate::buffer::{BufferPool, PooledBuffer, DEFAULT_BUFFER_SIZE};
use crate::http::{self, HeaderValue, Headers, RequestLine, END_OF_CHUNKED, END_OF_HEADERS};
use crate::mime::mime_for_path;
use crate::routing::{PortRoutes, TunnelRoute};
use crate::stream::TunnelStream;
use chrono::{DateTime, Utc};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Server header sent with override responses
pub const SERVER_NAME: &str = "SnapTunnel/1.0";

/// Pause after a failed accept, so a persistent error does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bytes kept back when no chunk terminator was found, so one split across reads still matches
const CHUNK_TAIL: usize = END_OF_CHUNKED.len() - 1;

type SharedWriter<W> = Arc<Mutex<W>>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Request line not found")]
    MissingRequestLine,

    #[error("Request head is incomplete")]
    IncompleteHead,

    #[error("Host header not found")]
    MissingHost,

    #[error("No tunnel configured for host {0}")]
    UnknownHost(String),

    #[error("Destination {0} has no resolved address")]
    NoDestination(String),

    #[error("Invalid TLS server name {0}")]
    InvalidServerName(String),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Port {0} terminates TLS but no server certificate was configured")]
    MissingServerConfig(u16),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How the request body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Chunked,
    Length(usize),
}

impl BodyFraming {
    pub fn from_headers(headers: &Headers) -> Self {
        let chunked = headers
            .get("transfer-encoding")
            .is_some_and(|te| te.value.to_ascii_lowercase().contains("chunked"));
        if chunked {
            return BodyFraming::Chunked;
        }

        let length = headers
            .get("content-length")
            .and_then(|cl| cl.value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        BodyFraming::Length(length)
    }
}

/// Piece of an outgoing request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Range of the original head
    Original(Range<usize>),
    Replacement(&'a [u8]),
}

impl<'a> Segment<'a> {
    fn bytes<'b>(&'b self, head: &'b [u8]) -> &'b [u8] {
        match self {
            Segment::Original(range) => &head[range.clone()],
            Segment::Replacement(bytes) => bytes,
        }
    }
}

/// Byte ranges and replacements that make up the forwarded head.
///
/// The path always precedes the `Host` value since it sits on the request line.
pub fn splice_plan<'a>(
    head_end: usize,
    line: &RequestLine,
    host: &HeaderValue,
    new_path: Option<&'a str>,
    new_host: Option<&'a str>,
) -> Vec<Segment<'a>> {
    if new_path.is_none() && new_host.is_none() {
        return vec![Segment::Original(0..head_end)];
    }

    let path = match new_path {
        Some(path) => Segment::Replacement(path.as_bytes()),
        None => Segment::Original(line.path_offset..line.path_end()),
    };
    let host_value = match new_host {
        Some(host) => Segment::Replacement(host.as_bytes()),
        None => Segment::Original(host.offset..host.end()),
    };

    let plan = vec![
        Segment::Original(0..line.path_offset),
        path,
        Segment::Original(line.path_end()..host.offset),
        host_value,
        Segment::Original(host.end()..head_end),
    ];
    plan.into_iter()
        .filter(|segment| !matches!(segment, Segment::Original(range) if range.is_empty()))
        .collect()
}

/// Concatenate a splice plan into the bytes to send
pub fn assemble(head: &[u8], plan: &[Segment<'_>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len() + 64);
    for segment in plan {
        out.extend_from_slice(segment.bytes(head));
    }
    out
}

/// Full override response for a file
pub fn override_response(content: &[u8], content_type: &str, date: DateTime<Utc>) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nServer: {}\r\nDate: {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        SERVER_NAME,
        date.format("%a, %d %b %Y %H:%M:%S GMT"),
        content_type,
        content.len()
    );
    let mut response = Vec::with_capacity(head.len() + content.len());
    response.extend_from_slice(head.as_bytes());
    response.extend_from_slice(content);
    response
}

/// Move `buffer[from..to]` to the front; returns its length
fn compact(buffer: &mut [u8], from: usize, to: usize) -> usize {
    buffer.copy_within(from..to, 0);
    to - from
}

/// Read until the buffer holds a complete request head.
/// Returns `false` when the peer closed the connection first.
async fn read_head<R>(
    reader: &mut R,
    buffer: &mut PooledBuffer,
    filled: &mut usize,
) -> Result<bool, TunnelError>
where
    R: AsyncRead + Unpin,
{
    // Only bytes past this offset, plus a terminator's worth of overlap, are rescanned.
    let mut scanned: usize = 0;
    loop {
        let from = scanned.saturating_sub(END_OF_HEADERS.len() - 1);
        if http::headers_complete(&buffer[from..*filled]) {
            return Ok(true);
        }
        scanned = *filled;
        if *filled == buffer.len() {
            buffer.grow(*filled);
        }

        let n = reader.read(&mut buffer[*filled..]).await?;
        if n == 0 {
            if *filled > 0 {
                debug!(bytes = *filled, "Connection closed with a partial request head");
            }
            return Ok(false);
        }
        *filled += n;
    }
}

/// Forward the body that starts at `body_start` in `buffer`.
///
/// Bytes of the next request that arrived with the body are moved to the
/// front of the buffer; their count is returned. `None` means the peer
/// closed the connection before the body ended.
pub async fn forward_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer: &mut PooledBuffer,
    body_start: usize,
    filled: usize,
    framing: BodyFraming,
) -> Result<Option<usize>, TunnelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::Chunked => {
            let mut start = body_start;
            let mut end = filled;
            loop {
                if let Some(pos) = http::find_chunk_terminator(&buffer[start..end]) {
                    let terminator_end = start + pos + END_OF_CHUNKED.len();
                    writer.write_all(&buffer[start..terminator_end]).await?;
                    writer.flush().await?;
                    return Ok(Some(compact(buffer, terminator_end, end)));
                }

                let keep_from = end.saturating_sub(CHUNK_TAIL).max(start);
                if keep_from > start {
                    writer.write_all(&buffer[start..keep_from]).await?;
                    writer.flush().await?;
                    trace!(bytes = keep_from - start, "Forwarded chunked body data");
                }
                end = compact(buffer, keep_from, end);
                start = 0;
                if end == buffer.len() {
                    buffer.grow(end);
                }

                let n = reader.read(&mut buffer[end..]).await?;
                if n == 0 {
                    warn!("Connection closed before the end of the chunked body");
                    return Ok(None);
                }
                end += n;
            }
        }
        BodyFraming::Length(length) => {
            let buffered = (filled - body_start).min(length);
            if buffered > 0 {
                writer
                    .write_all(&buffer[body_start..body_start + buffered])
                    .await?;
                writer.flush().await?;
            }
            let carry = compact(buffer, body_start + buffered, filled);

            // A carry-over only exists once the whole body was buffered.
            let mut remaining = length - buffered;
            while remaining > 0 {
                let max = remaining.min(buffer.len());
                let n = reader.read(&mut buffer[..max]).await?;
                if n == 0 {
                    warn!(remaining, "Connection closed before the end of the body");
                    return Ok(None);
                }
                writer.write_all(&buffer[..n]).await?;
                writer.flush().await?;
                trace!(bytes = n, "Forwarded body data");
                remaining -= n;
            }
            Ok(Some(carry))
        }
    }
}

/// Run `accept` until it succeeds, pausing after every failure
async fn accept_retrying<T, F, Fut>(port: u16, mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!(port, error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Relay for every route sharing one source port
pub struct TunnelRelay {
    routes: Arc<PortRoutes>,
    bind: IpAddr,
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
}

impl TunnelRelay {
    pub fn new(
        routes: Arc<PortRoutes>,
        bind: IpAddr,
        server_config: Option<Arc<ServerConfig>>,
        client_config: Arc<ClientConfig>,
        pool: Arc<BufferPool>,
        cancel: CancellationToken,
    ) -> Result<Self, TunnelError> {
        let acceptor = if routes.use_tls {
            let config = server_config.ok_or(TunnelError::MissingServerConfig(routes.port))?;
            Some(TlsAcceptor::from(config))
        } else {
            None
        };

        Ok(Self {
            routes,
            bind,
            acceptor,
            connector: TlsConnector::from(client_config),
            pool,
            cancel,
        })
    }

    pub fn port(&self) -> u16 {
        self.routes.port
    }

    pub async fn bind(&self) -> Result<TcpListener, TunnelError> {
        let addr = SocketAddr::new(self.bind, self.routes.port);
        TcpListener::bind(addr)
            .await
            .map_err(|source| TunnelError::Bind { addr, source })
    }

    /// Bind the listener and serve until cancelled
    pub async fn run(self: Arc<Self>) -> Result<(), TunnelError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), TunnelError> {
        let addr = listener.local_addr()?;
        info!(
            "Tunnel listening on {} ({})",
            addr,
            if self.acceptor.is_some() { "https" } else { "http" }
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(port = self.routes.port, "Tunnel listener stopped");
                    return Ok(());
                }
                accepted = accept_retrying(self.routes.port, || listener.accept()) => accepted,
            };

            let relay = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = relay.cancel.cancelled() => {
                        debug!(%peer, "Connection cancelled");
                    }
                    result = relay.handle_connection(stream, peer) => match result {
                        Ok(()) => debug!(%peer, "Connection closed"),
                        Err(TunnelError::Io(e)) => debug!(%peer, error = %e, "Connection closed"),
                        Err(e) => error!(%peer, error = %e, "Connection aborted"),
                    },
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), TunnelError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let local: TunnelStream = match &self.acceptor {
            Some(acceptor) => acceptor
                .accept(stream)
                .await
                .map_err(TunnelError::Handshake)?
                .into(),
            None => stream.into(),
        };
        debug!(%peer, tls = local.is_tls(), "Accepted connection");

        let (local_read, local_write) = tokio::io::split(local);
        let local_write = Arc::new(Mutex::new(local_write));
        let (remote_tx, mut remote_rx) = oneshot::channel();

        let forward = self.forward_requests(local_read, Arc::clone(&local_write), remote_tx, peer);
        tokio::pin!(forward);

        // `forward_done` is set when the client finished sending and the
        // remote write side was shut down; the reverse copy then drains.
        let (remote_read, forward_done) = tokio::select! {
            result = &mut forward => {
                result?;
                match remote_rx.try_recv() {
                    Ok(remote_read) => (remote_read, true),
                    Err(_) => return Ok(()),
                }
            }
            remote = &mut remote_rx => match remote {
                Ok(remote_read) => (remote_read, false),
                Err(_) => return Ok(()),
            },
        };

        let reverse = Self::copy_to_local(remote_read, Arc::clone(&local_write), &self.pool);
        tokio::pin!(reverse);

        let mut result = if forward_done {
            Ok(true)
        } else {
            tokio::select! {
                result = &mut forward => result.map(|()| true),
                result = &mut reverse => result.map(|()| false),
            }
        };
        if let Ok(true) = result {
            debug!(%peer, "Client finished sending, draining responses");
            result = reverse.await.map(|()| false);
        }

        if let Err(e) = local_write.lock().await.shutdown().await {
            trace!(%peer, error = %e, "Local shutdown failed");
        }
        result.map(|_| ())
    }

    async fn copy_to_local<W>(
        mut remote: ReadHalf<TunnelStream>,
        local: SharedWriter<W>,
        pool: &Arc<BufferPool>,
    ) -> Result<(), TunnelError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buffer = pool.checkout(DEFAULT_BUFFER_SIZE);
        loop {
            let n = remote.read(&mut buffer).await?;
            if n == 0 {
                debug!("Remote closed the connection");
                return Ok(());
            }
            trace!(bytes = n, "Relaying response data");

            let mut writer = local.lock().await;
            writer.write_all(&buffer[..n]).await?;
            writer.flush().await?;
        }
    }

    /// Forward requests until the client stops sending. On a clean end the
    /// remote write side is shut down so the remote sees end of input.
    async fn forward_requests<R, W>(
        &self,
        local: R,
        local_write: SharedWriter<W>,
        remote_tx: oneshot::Sender<ReadHalf<TunnelStream>>,
        peer: SocketAddr,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut remote = None;
        self.forward_loop(local, local_write, remote_tx, peer, &mut remote)
            .await?;
        if let Some(remote_write) = remote.as_mut() {
            if let Err(e) = remote_write.shutdown().await {
                trace!(%peer, error = %e, "Remote shutdown failed");
            }
        }
        Ok(())
    }

    async fn forward_loop<R, W>(
        &self,
        mut local: R,
        local_write: SharedWriter<W>,
        remote_tx: oneshot::Sender<ReadHalf<TunnelStream>>,
        peer: SocketAddr,
        remote: &mut Option<WriteHalf<TunnelStream>>,
    ) -> Result<(), TunnelError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut remote_tx = Some(remote_tx);
        let mut buffer = self.pool.checkout(DEFAULT_BUFFER_SIZE);
        let mut filled = 0;

        loop {
            if !read_head(&mut local, &mut buffer, &mut filled).await? {
                return Ok(());
            }

            let line = http::parse_request_line(&buffer, 0, filled)
                .ok_or(TunnelError::MissingRequestLine)?;
            let (headers, head_end) =
                http::parse_headers(&buffer, line.end_offset, filled - line.end_offset);
            let head_end = head_end.ok_or(TunnelError::IncompleteHead)?;
            let host = headers.get("host").ok_or(TunnelError::MissingHost)?;

            let (route, upstream_host) = self
                .routes
                .find(&host.value)
                .ok_or_else(|| TunnelError::UnknownHost(host.value.clone()))?;
            let route = Arc::clone(route);
            let framing = BodyFraming::from_headers(&headers);

            debug!(%peer, method = %line.method, path = %line.path, host = %host.value, "Request");
            trace!(head = %String::from_utf8_lossy(&buffer[..head_end]), "Request head");

            if let Some(file) = route.override_for(&line.path) {
                match tokio::fs::read(file).await {
                    Ok(content) => {
                        info!(path = %line.path, file = %file.display(), "Serving override");
                        let response = override_response(&content, &mime_for_path(file), Utc::now());
                        {
                            let mut writer = local_write.lock().await;
                            writer.write_all(&response).await?;
                            writer.flush().await?;
                        }

                        let mut discard = tokio::io::sink();
                        match forward_body(&mut local, &mut discard, &mut buffer, head_end, filled, framing)
                            .await?
                        {
                            Some(carry) => filled = carry,
                            None => return Ok(()),
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!(file = %file.display(), error = %e, "Override file unavailable, forwarding request");
                    }
                }
            }

            let mut remote_write = match remote.take() {
                Some(remote_write) => remote_write,
                None => {
                    let stream = self.connect_remote(&route).await?;
                    let (remote_read, remote_write) = tokio::io::split(stream);
                    if let Some(tx) = remote_tx.take() {
                        if tx.send(remote_read).is_err() {
                            return Ok(());
                        }
                    }
                    remote_write
                }
            };

            let new_path = route.rewrite_path(&line.path);
            let new_host = (upstream_host != host.value).then_some(upstream_host);
            let plan = splice_plan(head_end, &line, host, new_path.as_deref(), new_host.as_deref());
            if plan.len() == 1 {
                remote_write.write_all(&buffer[..head_end]).await?;
            } else {
                debug!(
                    path = new_path.as_deref().unwrap_or(&line.path),
                    host = new_host.as_deref().unwrap_or(&host.value),
                    "Rewrote request head"
                );
                remote_write
                    .write_all(&assemble(&buffer[..head_end], &plan))
                    .await?;
            }
            remote_write.flush().await?;

            let carry = forward_body(&mut local, &mut remote_write, &mut buffer, head_end, filled, framing).await?;
            *remote = Some(remote_write);
            match carry {
                Some(carry) => filled = carry,
                None => return Ok(()),
            }
        }
    }

    async fn connect_remote(&self, route: &TunnelRoute) -> Result<TunnelStream, TunnelError> {
        let addr = route
            .destination_addr()
            .ok_or_else(|| TunnelError::NoDestination(route.destination.host.clone()))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TunnelError::Connect { addr, source })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "Failed to set TCP_NODELAY");
        }

        if !route.destination.scheme.is_tls() {
            debug!(destination = %route.destination, %addr, "Connected to remote");
            return Ok(stream.into());
        }

        let host = route.destination.host.as_str();
        let server_name = ServerName::try_from(host)
            .map_err(|_| TunnelError::InvalidServerName(host.to_string()))?
            .to_owned();
        let tls = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(TunnelError::Handshake)?;
        debug!(destination = %route.destination, %addr, "Connected to remote over TLS");
        Ok(tls.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(head: &[u8]) -> (RequestLine, Headers, usize) {
        let line = http::parse_request_line(head, 0, head.len()).unwrap();
        let (headers, end) = http::parse_headers(head, line.end_offset, head.len() - line.end_offset);
        (line, headers, end.unwrap())
    }

    fn pooled(content: &[u8], size: usize) -> PooledBuffer {
        let pool = Arc::new(BufferPool::default());
        let mut buffer = pool.checkout(size);
        buffer[..content.len()].copy_from_slice(content);
        buffer
    }

    #[test]
    fn test_unchanged_head_is_one_segment() {
        let head = b"GET /a HTTP/1.1\r\nHost: local.test\r\n\r\n";
        let (line, headers, end) = parse(head);
        let plan = splice_plan(end, &line, headers.get("host").unwrap(), None, None);
        assert_eq!(plan, vec![Segment::Original(0..head.len())]);
        assert_eq!(assemble(head, &plan), head.to_vec());
    }

    #[test]
    fn test_host_only_rewrite() {
        let head = b"GET /a HTTP/1.1\r\nHost: local.test\r\nAccept: */*\r\n\r\n";
        let (line, headers, end) = parse(head);
        let plan = splice_plan(end, &line, headers.get("host").unwrap(), None, Some("backend.test"));
        assert_eq!(
            assemble(head, &plan),
            b"GET /a HTTP/1.1\r\nHost: backend.test\r\nAccept: */*\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_path_and_host_rewrite() {
        let head = b"POST /api/users?x=1 HTTP/1.1\r\nUser-Agent: t\r\nHost: local.test:8080\r\n\r\n";
        let (line, headers, end) = parse(head);
        let plan = splice_plan(
            end,
            &line,
            headers.get("host").unwrap(),
            Some("/v2/users?x=1"),
            Some("backend.test:9090"),
        );
        assert_eq!(
            assemble(head, &plan),
            b"POST /v2/users?x=1 HTTP/1.1\r\nUser-Agent: t\r\nHost: backend.test:9090\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_body_framing() {
        let (_, headers, _) = parse(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: gzip, Chunked\r\nContent-Length: 4\r\n\r\n");
        assert_eq!(BodyFraming::from_headers(&headers), BodyFraming::Chunked);

        let (_, headers, _) = parse(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 12\r\n\r\n");
        assert_eq!(BodyFraming::from_headers(&headers), BodyFraming::Length(12));

        let (_, headers, _) = parse(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: lots\r\n\r\n");
        assert_eq!(BodyFraming::from_headers(&headers), BodyFraming::Length(0));
    }

    #[test]
    fn test_override_response() {
        let date = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let response = override_response(b"hello", "text/plain", date);
        assert_eq!(
            response,
            b"HTTP/1.1 200 OK\r\nServer: SnapTunnel/1.0\r\nDate: Tue, 02 Jan 2024 03:04:05 GMT\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello".to_vec()
        );
    }

    #[tokio::test]
    async fn test_chunked_terminator_split_across_reads() {
        let mut buffer = pooled(b"5\r\nhello\r\n0\r\n", 64);
        let mut reader: &[u8] = b"\r\nGET /next";
        let mut out = Vec::new();

        let carry = forward_body(&mut reader, &mut out, &mut buffer, 0, 13, BodyFraming::Chunked)
            .await
            .unwrap();
        assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n".to_vec());
        assert_eq!(carry, Some(9));
        assert_eq!(&buffer[..9], b"GET /next");
    }

    #[tokio::test]
    async fn test_chunked_body_after_head() {
        let data = b"HEAD\r\n\r\n3\r\nabc\r\n0\r\n\r\nGET";
        let mut buffer = pooled(data, 64);
        let mut reader: &[u8] = b"";
        let mut out = Vec::new();

        let carry = forward_body(&mut reader, &mut out, &mut buffer, 8, data.len(), BodyFraming::Chunked)
            .await
            .unwrap();
        assert_eq!(out, b"3\r\nabc\r\n0\r\n\r\n".to_vec());
        assert_eq!(carry, Some(3));
        assert_eq!(&buffer[..3], b"GET");
    }

    #[tokio::test]
    async fn test_chunked_eof_before_terminator() {
        let mut buffer = pooled(b"5\r\nhel", 64);
        let mut reader: &[u8] = b"";
        let mut out = Vec::new();

        let carry = forward_body(&mut reader, &mut out, &mut buffer, 0, 6, BodyFraming::Chunked)
            .await
            .unwrap();
        assert_eq!(carry, None);
    }

    #[tokio::test]
    async fn test_fixed_length_keeps_excess() {
        let mut buffer = pooled(b"abcNEXT", 64);
        let mut reader: &[u8] = b"";
        let mut out = Vec::new();

        let carry = forward_body(&mut reader, &mut out, &mut buffer, 0, 7, BodyFraming::Length(3))
            .await
            .unwrap();
        assert_eq!(out, b"abc".to_vec());
        assert_eq!(carry, Some(4));
        assert_eq!(&buffer[..4], b"NEXT");
    }

    #[tokio::test]
    async fn test_fixed_length_reads_only_the_remainder() {
        let mut buffer = pooled(b"ab", 64);
        let mut reader: &[u8] = b"cdeXYZ";
        let mut out = Vec::new();

        let carry = forward_body(&mut reader, &mut out, &mut buffer, 0, 2, BodyFraming::Length(5))
            .await
            .unwrap();
        assert_eq!(out, b"abcde".to_vec());
        assert_eq!(carry, Some(0));
        assert_eq!(reader, b"XYZ");
    }

    /// Records what reached the writer at each flush
    #[derive(Default)]
    struct FlushLog {
        pending: Vec<u8>,
        flushed: Vec<Vec<u8>>,
    }

    impl AsyncWrite for FlushLog {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            self.pending.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            if !self.pending.is_empty() {
                let pending = std::mem::take(&mut self.pending);
                self.flushed.push(pending);
            }
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_fixed_length_flushes_every_write() {
        let mut buffer = pooled(b"ab", 4);
        let mut reader: &[u8] = b"cdefgh";
        let mut out = FlushLog::default();

        let carry = forward_body(&mut reader, &mut out, &mut buffer, 0, 2, BodyFraming::Length(8))
            .await
            .unwrap();
        assert_eq!(carry, Some(0));
        assert!(out.pending.is_empty());
        assert_eq!(out.flushed.concat(), b"abcdefgh".to_vec());
        assert_eq!(out.flushed[0], b"ab".to_vec());
        assert!(out.flushed.len() >= 3);
    }

    #[tokio::test]
    async fn test_fixed_length_early_eof() {
        let mut buffer = pooled(b"abc", 64);
        let mut reader: &[u8] = b"de";
        let mut out = Vec::new();

        let carry = forward_body(&mut reader, &mut out, &mut buffer, 0, 3, BodyFraming::Length(10))
            .await
            .unwrap();
        assert_eq!(carry, None);
        assert_eq!(out, b"abcde".to_vec());
    }

    #[tokio::test]
    async fn test_accept_pauses_after_failures() {
        let mut attempts = 0;
        let started = std::time::Instant::now();
        let accepted = accept_retrying(0, || {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < 3 {
                    Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(accepted, 3);
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 2);
    }

    #[tokio::test]
    async fn test_read_head_grows_buffer() {
        let head = b"GET / HTTP/1.1\r\nHost: local.test\r\nX-Long: aaaaaaaaaaaaaaaaaaaa\r\n\r\n";
        let pool = Arc::new(BufferPool::default());
        let mut buffer = pool.checkout(16);
        let mut reader: &[u8] = head;
        let mut filled = 0;

        assert!(read_head(&mut reader, &mut buffer, &mut filled).await.unwrap());
        assert_eq!(filled, head.len());
        assert!(buffer.len() >= head.len());
        assert_eq!(&buffer[..filled], head);
    }

    #[tokio::test]
    async fn test_read_head_has_no_size_cap() {
        let mut head = b"GET / HTTP/1.1\r\nHost: local.test\r\nX-Big: ".to_vec();
        head.extend(std::iter::repeat(b'a').take(1_200_000));
        head.extend_from_slice(b"\r\n\r\n");
        let pool = Arc::new(BufferPool::default());
        let mut buffer = pool.checkout(DEFAULT_BUFFER_SIZE);
        let mut reader: &[u8] = &head;
        let mut filled = 0;

        assert!(read_head(&mut reader, &mut buffer, &mut filled).await.unwrap());
        assert_eq!(filled, head.len());
        assert_eq!(&buffer[..filled], &head[..]);
    }

    #[tokio::test]
    async fn test_read_head_clean_eof() {
        let pool = Arc::new(BufferPool::default());
        let mut buffer = pool.checkout(64);
        let mut reader: &[u8] = b"GET / HT";
        let mut filled = 0;

        assert!(!read_head(&mut reader, &mut buffer, &mut filled).await.unwrap());
    }
}
