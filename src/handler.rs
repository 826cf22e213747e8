//! The per-connection state machine.
//!
//! One handler owns one accepted client socket. It drives the receive states
//! `request → head → body` on parsed tokens, answers OPTIONS locally, rejects
//! CONNECT, and hands everything else to an origin worker. Worker events
//! (`reply`, then `chunk`*/`trailer` when chunked) are serialized back to the
//! client strictly in request order, while the next pipelined request may
//! already be parsing.

use std::{collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use n0_error::{Result, anyerr};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    MAX_HEADER_SECTION_LENGTH,
    error::ProxyError,
    origin::{DynOriginDispatcher, OriginDispatcher, OriginEvent, OriginWorker},
    parse::{Authority, HeaderList, Request, RequestTarget, Token},
    reply::{self, Reply},
    sock::{TokenError, TokenEvent, TokenReader},
};

/// Methods advertised on locally answered OPTIONS requests.
const ALLOWED_METHODS: &str = "OPTIONS, GET, HEAD, POST, PUT, DELETE, TRACE";

/// Receive-side parse state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    /// Awaiting a request line.
    Request,
    /// Absorbing header lines.
    Head,
    /// Reading the expected body length in raw mode.
    Body,
}

/// Transmit-side progress of the front in-flight reply.
#[derive(Debug)]
enum SendState {
    /// No reply bytes are outstanding.
    Idle,
    /// Chunked reply head retained until the first chunk arrives.
    ChunkPending(Reply),
    /// Chunked body emission has begun.
    ChunkStreaming,
}

/// A request whose reply has not been fully written yet. Replies go out
/// strictly in queue order.
struct Pending {
    source: InFlight,
    version: Version,
    close_after: bool,
}

enum InFlight {
    /// Reply produced locally, ready to transmit.
    Local { reply: Reply },
    /// Forwarded; events arrive from the linked worker.
    Forwarded { worker: OriginWorker },
}

enum UaInput {
    Token(Token),
    Body(Bytes),
    Closed,
}

enum Input {
    Ua(UaInput),
    Origin(Option<OriginEvent>),
}

enum Flow {
    Continue,
    Done,
}

/// Handler for a single client connection.
pub struct UaHandler<R, W> {
    reader: TokenReader<R>,
    writer: W,
    banner: String,
    dispatcher: Arc<DynOriginDispatcher<'static>>,

    recv: RecvState,
    version: Version,
    request: Option<Request>,
    latched_status: Option<StatusCode>,
    headers: HeaderList,
    body: BytesMut,
    expected_length: Option<usize>,
    pipeline: VecDeque<Pending>,
    send: SendState,
    /// The client stopped sending (EOF); pending replies still drain.
    ua_gone: bool,
}

impl<R, W> UaHandler<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a handler around a freshly accepted socket.
    pub fn new(
        read: R,
        write: W,
        banner: String,
        dispatcher: Arc<DynOriginDispatcher<'static>>,
    ) -> Self {
        Self {
            reader: TokenReader::new(read, MAX_HEADER_SECTION_LENGTH),
            writer: write,
            banner,
            dispatcher,
            recv: RecvState::Request,
            version: Version::HTTP_11,
            request: None,
            latched_status: None,
            headers: HeaderList::new(),
            body: BytesMut::new(),
            expected_length: None,
            pipeline: VecDeque::new(),
            send: SendState::Idle,
            ua_gone: false,
        }
    }

    /// Drives the connection until the client goes away, a non-keepalive
    /// response completes, or an unrecoverable error occurs.
    pub async fn run(mut self) -> Result<(), ProxyError> {
        let result = self.drive().await;
        self.writer.shutdown().await.ok();
        result
    }

    async fn drive(&mut self) -> Result<(), ProxyError> {
        loop {
            if let Flow::Done = self.flush_local().await? {
                return Ok(());
            }
            if self.ua_gone && self.pipeline.is_empty() {
                return Ok(());
            }
            let flow = match self.next_input().await {
                Ok(input) => self.dispatch(input).await?,
                Err(TokenError::HeadTooLarge) => {
                    warn!("request head exceeded {MAX_HEADER_SECTION_LENGTH} bytes");
                    let version = self.version;
                    self.write_reply(&Reply::status_only(StatusCode::BAD_REQUEST), version)
                        .await?;
                    Flow::Done
                }
                Err(TokenError::Malformed(err)) => {
                    debug!("unparseable request, closing: {err:#}");
                    Flow::Done
                }
                Err(TokenError::Io(err)) => return Err(err.into()),
            };
            if let Flow::Done = flow {
                return Ok(());
            }
        }
    }

    /// Transmits locally produced replies sitting at the front of the
    /// pipeline.
    async fn flush_local(&mut self) -> Result<Flow, ProxyError> {
        while matches!(
            self.pipeline.front(),
            Some(Pending {
                source: InFlight::Local { .. },
                ..
            })
        ) {
            let Some(Pending {
                source: InFlight::Local { reply },
                version,
                close_after,
            }) = self.pipeline.pop_front()
            else {
                break;
            };
            self.write_reply(&reply, version).await?;
            if close_after {
                return Ok(Flow::Done);
            }
        }
        Ok(Flow::Continue)
    }

    /// Awaits the next event from either the client socket or the front
    /// in-flight origin worker.
    async fn next_input(&mut self) -> Result<Input, TokenError> {
        let Self {
            reader,
            recv,
            pipeline,
            ua_gone,
            ..
        } = self;
        match pipeline.front_mut() {
            Some(Pending {
                source: InFlight::Forwarded { worker },
                ..
            }) if *ua_gone => Ok(Input::Origin(worker.next_event().await)),
            Some(Pending {
                source: InFlight::Forwarded { worker },
                ..
            }) => {
                tokio::select! {
                    event = worker.next_event() => Ok(Input::Origin(event)),
                    input = read_ua(reader, *recv) => Ok(Input::Ua(input?)),
                }
            }
            _ => Ok(Input::Ua(read_ua(reader, *recv).await?)),
        }
    }

    async fn dispatch(&mut self, input: Input) -> Result<Flow, ProxyError> {
        match input {
            Input::Ua(UaInput::Closed) => {
                debug!(pending = self.pipeline.len(), "client stopped sending");
                self.ua_gone = true;
                if self.pipeline.is_empty() {
                    Ok(Flow::Done)
                } else {
                    Ok(Flow::Continue)
                }
            }
            Input::Ua(UaInput::Token(token)) => self.on_token(token).await,
            Input::Ua(UaInput::Body(bytes)) => self.on_body(bytes).await,
            Input::Origin(Some(event)) => self.on_origin_event(event).await,
            Input::Origin(None) => self.on_origin_terminated().await,
        }
    }

    async fn on_token(&mut self, token: Token) -> Result<Flow, ProxyError> {
        match (self.recv, token) {
            (
                RecvState::Request,
                Token::RequestLine {
                    method,
                    target,
                    version,
                },
            ) => {
                self.begin_request(method, target, version);
                Ok(Flow::Continue)
            }
            (RecvState::Head, Token::Header { name, value }) => {
                self.on_header(name, value);
                Ok(Flow::Continue)
            }
            (RecvState::Head, Token::EndOfHeaders) => self.on_end_of_headers().await,
            (state, token) => {
                // Stray input for the state; drop it and re-arm.
                debug!(?state, ?token, "token out of place, ignoring");
                Ok(Flow::Continue)
            }
        }
    }

    fn begin_request(&mut self, method: Method, target: RequestTarget, version: Version) {
        self.version = version;
        let mut request = Request::new(method, version);
        match target {
            RequestTarget::Absolute {
                scheme,
                authority,
                path,
            } => {
                request.scheme = Some(scheme);
                request.host = Some(authority.host);
                request.port = authority.port;
                request.path = Some(path);
            }
            RequestTarget::Path(path) => request.path = Some(path),
            RequestTarget::Asterisk => request.path = Some("*".to_string()),
            // Disposition of scheme-form targets is deferred to end-of-headers.
            RequestTarget::Scheme(_) => {}
        }
        self.request = Some(request);
        self.recv = RecvState::Head;
    }

    fn on_header(&mut self, name: String, value: String) {
        if name.eq_ignore_ascii_case("content-length") && value != "0" {
            match value.parse::<usize>() {
                Ok(n) => self.expected_length = Some(n),
                Err(err) => {
                    debug!("bad Content-Length {value:?}: {err}");
                    self.latched_status = Some(StatusCode::BAD_REQUEST);
                }
            }
        } else if name.eq_ignore_ascii_case("host") {
            if let Some(request) = self.request.as_mut()
                && request.host.is_none()
            {
                match Authority::from_host_header(&value) {
                    Ok(authority) => {
                        request.host = Some(authority.host);
                        request.port = authority.port;
                    }
                    Err(err) => {
                        // Keep absorbing headers; the 400 goes out at end of
                        // headers.
                        debug!("bad Host header {value:?}: {err:#}");
                        self.latched_status = Some(StatusCode::BAD_REQUEST);
                    }
                }
            }
        }
        self.headers.push(name, value);
    }

    async fn on_end_of_headers(&mut self) -> Result<Flow, ProxyError> {
        if let Some(status) = self.latched_status.take() {
            return self.respond_local(Reply::status_only(status));
        }
        let Some(request) = self.request.as_ref() else {
            return Err(ProxyError::upstream(anyerr!(
                "end of headers without a request"
            )));
        };
        let method = request.method.clone();
        if method == Method::OPTIONS && self.expected_length.is_none() {
            return self.do_options().await;
        }
        if method == Method::CONNECT {
            debug!("CONNECT is not supported");
            return self.respond_local(Reply::status_only(StatusCode::NOT_IMPLEMENTED));
        }
        match self.expected_length {
            None | Some(0) => self.forward(None).await,
            Some(n) => {
                self.reader.set_raw(n);
                self.recv = RecvState::Body;
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_body(&mut self, bytes: Bytes) -> Result<Flow, ProxyError> {
        let Some(expected) = self.expected_length else {
            return Err(ProxyError::upstream(anyerr!(
                "body bytes without an expected length"
            )));
        };
        if bytes.is_empty() {
            debug!("client closed before the body completed");
            return Ok(Flow::Done);
        }
        if bytes.len() == expected {
            let body = if self.body.is_empty() {
                bytes
            } else {
                let mut acc = std::mem::take(&mut self.body);
                acc.extend_from_slice(&bytes);
                acc.freeze()
            };
            self.forward(Some(body)).await
        } else {
            // Short read: decrement and keep accumulating.
            self.expected_length = Some(expected - bytes.len());
            self.body.extend_from_slice(&bytes);
            Ok(Flow::Continue)
        }
    }

    async fn do_options(&mut self) -> Result<Flow, ProxyError> {
        let target_is_asterisk = self
            .request
            .as_ref()
            .is_some_and(|request| request.path.as_deref() == Some("*"));
        if target_is_asterisk {
            return self.respond_options();
        }
        match self.headers.get("max-forwards") {
            None => self.forward(None).await,
            Some(value) => match value.parse::<i64>() {
                Ok(0) => self.respond_options(),
                Ok(n) if n > 0 => {
                    self.headers.set("max-forwards", (n - 1).to_string());
                    self.forward(None).await
                }
                // Negative or non-integer values forward unchanged.
                Ok(_) | Err(_) => self.forward(None).await,
            },
        }
    }

    fn respond_options(&mut self) -> Result<Flow, ProxyError> {
        let headers: HeaderList = [("Server", self.banner.as_str()), ("Allow", ALLOWED_METHODS)]
            .into_iter()
            .collect();
        self.respond_local(Reply::new(StatusCode::NO_CONTENT, headers, Bytes::new()))
    }

    /// Queues a locally produced reply and rearms for the next request.
    fn respond_local(&mut self, reply: Reply) -> Result<Flow, ProxyError> {
        let version = self.version;
        let close_after = self.request_wants_close();
        self.reset_recv();
        self.pipeline.push_back(Pending {
            source: InFlight::Local { reply },
            version,
            close_after,
        });
        Ok(Flow::Continue)
    }

    /// Hands the request to an origin worker and rearms for the next one.
    async fn forward(&mut self, body: Option<Bytes>) -> Result<Flow, ProxyError> {
        let version = self.version;
        let close_after = self.request_wants_close();
        let Some(request) = self.request.take() else {
            return Err(ProxyError::upstream(anyerr!("forward without a request")));
        };
        let headers = std::mem::take(&mut self.headers);
        debug!(
            method = %request.method,
            host = ?request.host,
            port = request.port,
            body = body.as_ref().map(|b| b.len()),
            "forwarding request"
        );
        let origin = self
            .dispatcher
            .get_closest_origin()
            .await
            .map_err(ProxyError::dispatch)?;
        let worker = origin
            .submit(request, headers, body)
            .map_err(ProxyError::dispatch)?;
        self.reset_recv();
        self.pipeline.push_back(Pending {
            source: InFlight::Forwarded { worker },
            version,
            close_after,
        });
        Ok(Flow::Continue)
    }

    async fn on_origin_event(&mut self, event: OriginEvent) -> Result<Flow, ProxyError> {
        let version = self
            .pipeline
            .front()
            .map(|pending| pending.version)
            .unwrap_or(self.version);
        match (std::mem::replace(&mut self.send, SendState::Idle), event) {
            (SendState::Idle, OriginEvent::Reply(reply)) if reply.body.is_none() => {
                // Chunked reply: hold the head back until the first chunk.
                self.send = SendState::ChunkPending(reply);
                Ok(Flow::Continue)
            }
            (SendState::Idle, OriginEvent::Reply(reply)) => {
                self.write_reply(&reply, version).await?;
                Ok(self.complete_front(&reply))
            }
            (SendState::ChunkPending(head), OriginEvent::Chunk(payload)) => {
                head.write_head(version, &mut self.writer).await?;
                reply::write_chunk(&mut self.writer, &payload).await?;
                self.send = SendState::ChunkStreaming;
                Ok(Flow::Continue)
            }
            (SendState::ChunkStreaming, OriginEvent::Chunk(payload)) => {
                reply::write_chunk(&mut self.writer, &payload).await?;
                self.send = SendState::ChunkStreaming;
                Ok(Flow::Continue)
            }
            (SendState::ChunkPending(head), OriginEvent::Trailer(trailers)) => {
                // A chunked reply with no body chunks at all.
                head.write_head(version, &mut self.writer).await?;
                reply::write_trailer(&mut self.writer, &trailers).await?;
                Ok(self.finish_front())
            }
            (SendState::ChunkStreaming, OriginEvent::Trailer(trailers)) => {
                reply::write_trailer(&mut self.writer, &trailers).await?;
                Ok(self.finish_front())
            }
            (send, event) => {
                self.send = send;
                Err(ProxyError::upstream(anyerr!(
                    "origin event {event:?} violates the reply contract"
                )))
            }
        }
    }

    /// The linked worker went away. Before any reply bytes this becomes a
    /// 500; mid chunk stream the connection can only be torn down.
    async fn on_origin_terminated(&mut self) -> Result<Flow, ProxyError> {
        match std::mem::replace(&mut self.send, SendState::Idle) {
            SendState::ChunkStreaming => Err(ProxyError::upstream(anyerr!(
                "origin worker terminated mid chunk stream"
            ))),
            SendState::Idle | SendState::ChunkPending(_) => {
                warn!("origin worker terminated, synthesizing 500");
                let version = self
                    .pipeline
                    .front()
                    .map(|pending| pending.version)
                    .unwrap_or(self.version);
                self.write_reply(
                    &Reply::status_only(StatusCode::INTERNAL_SERVER_ERROR),
                    version,
                )
                .await?;
                Ok(self.finish_front())
            }
        }
    }

    /// Finishes a complete (non-chunked) reply, forcing a close when the
    /// body cannot be delimited on a kept-alive connection.
    fn complete_front(&mut self, reply: &Reply) -> Flow {
        let unframed = reply
            .body
            .as_ref()
            .is_some_and(|body| !body.is_empty() && reply.headers.get("content-length").is_none());
        match self.finish_front() {
            Flow::Done => Flow::Done,
            Flow::Continue if unframed => Flow::Done,
            Flow::Continue => Flow::Continue,
        }
    }

    fn finish_front(&mut self) -> Flow {
        self.send = SendState::Idle;
        match self.pipeline.pop_front() {
            Some(pending) if pending.close_after => Flow::Done,
            _ => Flow::Continue,
        }
    }

    fn request_wants_close(&self) -> bool {
        self.version == Version::HTTP_10 || self.headers.has_token("connection", "close")
    }

    /// Clears per-request receive state after a response decision.
    fn reset_recv(&mut self) {
        self.recv = RecvState::Request;
        self.request = None;
        self.latched_status = None;
        self.headers = HeaderList::new();
        self.body.clear();
        self.expected_length = None;
    }

    async fn write_reply(&mut self, reply: &Reply, version: Version) -> Result<(), ProxyError> {
        debug!(status = %reply.status, "writing reply");
        reply.write(version, &mut self.writer).await?;
        Ok(())
    }
}

async fn read_ua<R: AsyncRead + Unpin>(
    reader: &mut TokenReader<R>,
    recv: RecvState,
) -> Result<UaInput, TokenError> {
    match recv {
        RecvState::Body => Ok(UaInput::Body(reader.read_body().await?)),
        _ => match reader.next_token().await? {
            TokenEvent::Token(token) => Ok(UaInput::Token(token)),
            TokenEvent::Closed => Ok(UaInput::Closed),
        },
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::origin::{OriginDispatcher, StaticOrigins};

    /// Runs a handler over an in-memory duplex, feeding it `input` and
    /// collecting everything it writes back.
    async fn drive(input: &[u8], dispatcher: impl OriginDispatcher + 'static) -> Vec<u8> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(server);
        let handler = UaHandler::new(
            read,
            write,
            "hopgate/test".to_string(),
            DynOriginDispatcher::new_arc(dispatcher),
        );
        let task = tokio::spawn(handler.run());
        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(input).await.unwrap();
        client_write.shutdown().await.unwrap();
        let mut out = Vec::new();
        client_read.read_to_end(&mut out).await.unwrap();
        task.await.unwrap().ok();
        out
    }

    fn no_origins() -> StaticOrigins {
        StaticOrigins::new(vec![Authority {
            host: "localhost".to_string(),
            port: 9,
        }])
    }

    #[tokio::test]
    async fn options_asterisk_is_answered_locally() {
        let out = drive(b"OPTIONS * HTTP/1.1\r\nHost: h\r\n\r\n", no_origins()).await;
        assert_eq!(
            out,
            b"HTTP/1.1 204 No Content\r\nServer: hopgate/test\r\n\
              Allow: OPTIONS, GET, HEAD, POST, PUT, DELETE, TRACE\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn options_max_forwards_zero_is_answered_locally() {
        let out = drive(
            b"OPTIONS /x HTTP/1.1\r\nHost: h\r\nMax-Forwards: 0\r\n\r\n",
            no_origins(),
        )
        .await;
        assert!(out.starts_with(b"HTTP/1.1 204 No Content\r\n"));
    }

    #[tokio::test]
    async fn connect_is_rejected_with_501() {
        let out = drive(
            b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
            no_origins(),
        )
        .await;
        assert_eq!(out, b"HTTP/1.1 501 Not Implemented\r\n\r\n");
    }

    #[tokio::test]
    async fn bad_host_port_latches_400() {
        let out = drive(
            b"GET / HTTP/1.1\r\nHost: h:not-a-port\r\nX-After: 1\r\n\r\n",
            no_origins(),
        )
        .await;
        assert_eq!(out, b"HTTP/1.1 400 Bad Request\r\n\r\n");
    }

    #[tokio::test]
    async fn http10_reply_uses_request_version() {
        let out = drive(b"OPTIONS * HTTP/1.0\r\n\r\n", no_origins()).await;
        assert!(out.starts_with(b"HTTP/1.0 204 No Content\r\n"));
    }

    #[tokio::test]
    async fn unreachable_origin_synthesizes_500() {
        // Take a port and release it so the connect is refused.
        let listener = TcpListener::bind("localhost:0").await.unwrap();
        let authority = Authority {
            host: "localhost".to_string(),
            port: listener.local_addr().unwrap().port(),
        };
        drop(listener);
        let out = drive(
            b"GET / HTTP/1.1\r\nHost: h\r\n\r\n",
            StaticOrigins::new(vec![authority]),
        )
        .await;
        assert_eq!(out, b"HTTP/1.1 500 Internal Server Error\r\n\r\n");
    }

    #[tokio::test]
    async fn local_replies_keep_the_connection_open() {
        let out = drive(
            b"OPTIONS * HTTP/1.1\r\nHost: h\r\n\r\nOPTIONS * HTTP/1.1\r\nHost: h\r\n\r\n",
            no_origins(),
        )
        .await;
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("204 No Content").count(), 2);
    }
}
