//! Origin-side collaborators: the dispatcher that picks an origin, the
//! handle that accepts one request submission, and the worker task that
//! talks to the origin and delivers reply events back to the connection
//! handler.

use bytes::{Buf, Bytes, BytesMut};
use dynosaur::dynosaur;
use n0_error::{Result, StdResultExt, ensure_any, stack_error};
use n0_future::task::AbortOnDropHandle;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    parse::{self, Authority, HeaderList, ReplyHead, Request},
    reply::Reply,
};

/// Events delivered by an origin worker.
///
/// Contract order: exactly one `Reply`; when the reply is chunked, zero or
/// more `Chunk`s followed by exactly one `Trailer`. The event channel closing
/// before that sequence completes means the worker terminated.
#[derive(Debug)]
pub enum OriginEvent {
    Reply(Reply),
    Chunk(Bytes),
    Trailer(HeaderList),
}

/// Failure to produce an origin handle or submit a request.
#[stack_error(derive)]
pub enum DispatchError {
    /// No origin is configured or available.
    NoOrigin,
    /// The request carries no host to connect to.
    MissingHost,
}

#[dynosaur(pub DynOriginDispatcher = dyn(box) OriginDispatcher)]
/// Source of origin workers for the forwarding bridge.
pub trait OriginDispatcher: Send + Sync {
    /// Returns a handle on the closest available origin.
    fn get_closest_origin<'a>(
        &'a self,
    ) -> impl Future<Output = Result<OriginHandle, DispatchError>> + Send + 'a;
}

/// Dispatcher over a fixed set of origins; the first configured origin
/// counts as closest.
#[derive(Debug, Clone)]
pub struct StaticOrigins {
    origins: Vec<Authority>,
}

impl StaticOrigins {
    pub fn new(origins: Vec<Authority>) -> Self {
        Self { origins }
    }
}

impl OriginDispatcher for StaticOrigins {
    async fn get_closest_origin(&self) -> Result<OriginHandle, DispatchError> {
        let target = self.origins.first().cloned().ok_or(DispatchError::NoOrigin)?;
        Ok(OriginHandle::fixed(target))
    }
}

/// Dispatcher whose workers connect to the host and port carried by the
/// request itself (forward-proxy behavior).
#[derive(Debug, Clone, Default)]
pub struct DirectOrigins;

impl OriginDispatcher for DirectOrigins {
    async fn get_closest_origin(&self) -> Result<OriginHandle, DispatchError> {
        Ok(OriginHandle::direct())
    }
}

/// A claim on one origin, good for a single request submission.
#[derive(Debug, Clone)]
pub struct OriginHandle {
    /// Fixed upstream authority, or `None` to use the request's own
    /// host and port.
    target: Option<Authority>,
}

impl OriginHandle {
    pub fn fixed(target: Authority) -> Self {
        Self {
            target: Some(target),
        }
    }

    pub fn direct() -> Self {
        Self { target: None }
    }

    /// Hands the parsed request to a freshly spawned origin worker.
    ///
    /// The returned worker is the lifetime link: dropping it aborts the
    /// task, and the task ending before the reply completed surfaces to the
    /// receiver as termination.
    pub fn submit(
        &self,
        request: Request,
        headers: HeaderList,
        body: Option<Bytes>,
    ) -> Result<OriginWorker, DispatchError> {
        let authority = match &self.target {
            Some(target) => target.clone(),
            None => {
                let host = request.host.clone().ok_or(DispatchError::MissingHost)?;
                Authority {
                    host,
                    port: request.port,
                }
            }
        };
        let (events_tx, events_rx) = mpsc::channel(8);
        let span = error_span!("origin", %authority);
        let task = tokio::spawn(
            async move {
                if let Err(err) = forward(&authority, request, headers, body, &events_tx).await {
                    warn!("origin worker failed: {err:#}");
                }
                // Dropping the sender closes the event stream; the handler
                // reads an early close as worker termination.
            }
            .instrument(span),
        );
        Ok(OriginWorker {
            events: events_rx,
            _task: AbortOnDropHandle::new(task),
        })
    }
}

/// Live link to a spawned origin worker.
pub struct OriginWorker {
    events: mpsc::Receiver<OriginEvent>,
    _task: AbortOnDropHandle<()>,
}

impl OriginWorker {
    /// Next event from the worker; `None` once the worker has terminated.
    pub async fn next_event(&mut self) -> Option<OriginEvent> {
        self.events.recv().await
    }
}

/// Sends the request upstream and pumps the reply back as events.
async fn forward(
    authority: &Authority,
    request: Request,
    headers: HeaderList,
    body: Option<Bytes>,
    events: &mpsc::Sender<OriginEvent>,
) -> Result<()> {
    let stream = TcpStream::connect(authority.to_addr())
        .await
        .std_context("failed to connect to origin")?;
    let mut conn = UpstreamConn::new(stream);
    conn.write_request(&request, &headers, body.as_deref())
        .await?;

    let head = loop {
        if let Some((header_len, head)) = ReplyHead::parse(conn.buffer())? {
            conn.discard(header_len);
            break head;
        }
        ensure_any!(conn.fill().await? != 0, "origin closed before reply head");
    };
    debug!(status = %head.status, chunked = head.is_chunked(), "reply head from origin");

    if head.is_chunked() {
        let reply = Reply::streamed(head.status, head.reason, head.headers);
        if events.send(OriginEvent::Reply(reply)).await.is_err() {
            return Ok(());
        }
        loop {
            let line = conn.read_line().await?;
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                break;
            }
            let payload = conn.read_exact(size).await?;
            let crlf = conn.read_exact(2).await?;
            ensure_any!(&crlf[..] == b"\r\n", "missing CRLF after chunk payload");
            if events.send(OriginEvent::Chunk(payload)).await.is_err() {
                return Ok(());
            }
        }
        let mut trailers = HeaderList::new();
        loop {
            let line = conn.read_line().await?;
            if line.is_empty() {
                break;
            }
            let line = std::str::from_utf8(&line).std_context("non-ASCII trailer field")?;
            let (name, value) = parse::parse_header_line(line)?;
            trailers.push(name, value);
        }
        events.send(OriginEvent::Trailer(trailers)).await.ok();
    } else {
        let body = match content_length(&head.headers)? {
            Some(n) => conn.read_exact(n).await?,
            // The request went out with `Connection: close`, so EOF delimits.
            None => conn.read_to_eof().await?,
        };
        let reply = Reply {
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            body: Some(body),
        };
        events.send(OriginEvent::Reply(reply)).await.ok();
    }
    Ok(())
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    // Chunk extensions after ';' are ignored.
    let size_end = line.iter().position(|c| *c == b';').unwrap_or(line.len());
    let size = std::str::from_utf8(&line[..size_end]).std_context("non-ASCII chunk size")?;
    usize::from_str_radix(size.trim(), 16).std_context("invalid chunk size")
}

fn content_length(headers: &HeaderList) -> Result<Option<usize>> {
    match headers.get("content-length") {
        None => Ok(None),
        Some(value) => {
            let n = value
                .trim()
                .parse::<usize>()
                .std_context("invalid Content-Length from origin")?;
            Ok(Some(n))
        }
    }
}

/// Buffered reader/writer over the upstream connection.
struct UpstreamConn {
    stream: TcpStream,
    buf: BytesMut,
}

impl UpstreamConn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
    }

    async fn fill(&mut self) -> Result<usize> {
        self.stream
            .read_buf(&mut self.buf)
            .await
            .std_context("origin read failed")
    }

    /// One CRLF-terminated line, without the CRLF.
    async fn read_line(&mut self) -> Result<Bytes> {
        loop {
            if let Some(end) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(end).freeze();
                self.buf.advance(2);
                return Ok(line);
            }
            ensure_any!(self.fill().await? != 0, "origin closed mid chunk frame");
        }
    }

    /// Exactly `n` bytes.
    async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.buf.len() < n {
            ensure_any!(self.fill().await? != 0, "origin closed mid reply body");
        }
        Ok(self.buf.split_to(n).freeze())
    }

    async fn read_to_eof(&mut self) -> Result<Bytes> {
        while self.fill().await? != 0 {}
        Ok(self.buf.split().freeze())
    }

    /// Writes the request head and body. The hop carries `Connection: close`
    /// so EOF delimits unframed reply bodies; everything else goes out as
    /// received.
    async fn write_request(
        &mut self,
        request: &Request,
        headers: &HeaderList,
        body: Option<&[u8]>,
    ) -> Result<()> {
        let path = request.path.as_deref().unwrap_or("/");
        let mut head = format!("{} {} {:?}\r\n", request.method, path, request.version);
        for (name, value) in headers.iter() {
            if name.eq_ignore_ascii_case("connection") {
                continue;
            }
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");
        self.stream
            .write_all(head.as_bytes())
            .await
            .std_context("origin write failed")?;
        if let Some(body) = body {
            self.stream
                .write_all(body)
                .await
                .std_context("origin write failed")?;
        }
        self.stream.flush().await.std_context("origin write failed")?;
        Ok(())
    }
}
