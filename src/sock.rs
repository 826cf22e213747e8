//! Socket activation control: tokenizing reads over the client socket.
//!
//! The socket is driven in one of two framing modes. In [`ReadMode::HttpToken`]
//! every call to [`TokenReader::next_token`] yields exactly one parsed unit
//! (request line, header line, or the end-of-headers sentinel), re-arming the
//! underlying read as needed. In [`ReadMode::Raw`] the next
//! [`TokenReader::read_body`] returns at most the remaining expected body
//! bytes. HTTP/1.x framing is protocol-dependent, so the mode switch is
//! explicit rather than fused into a single parser.

use std::io;

use bytes::{Bytes, BytesMut};
use n0_error::{AnyError, anyerr, stack_error};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::parse::{self, Token};

/// Initial capacity for the inbound buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Framing mode for the client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadMode {
    /// Parse one HTTP token per call.
    HttpToken,
    /// Deliver raw bytes, at most this many per read.
    Raw(usize),
}

/// Outcome of arming the socket for one token.
#[derive(Debug)]
pub(crate) enum TokenEvent {
    Token(Token),
    /// Peer closed the connection with no buffered input pending.
    Closed,
}

#[stack_error(derive, from_sources)]
pub(crate) enum TokenError {
    /// Accumulated header bytes exceeded the section cap.
    HeadTooLarge,
    /// The request line or a header line failed to parse, or the peer closed
    /// mid-token.
    Malformed(#[error(source)] AnyError),
    /// Reading from the socket failed.
    Io(#[error(source)] io::Error),
}

/// Tokenizing reader over the client socket.
pub(crate) struct TokenReader<R> {
    inner: R,
    buf: BytesMut,
    mode: ReadMode,
    /// Whether the next token-mode line is a header line rather than a
    /// request line.
    in_head: bool,
    /// Header bytes consumed for the request head in progress.
    head_bytes: usize,
    max_head_bytes: usize,
}

impl<R: AsyncRead + Unpin> TokenReader<R> {
    pub(crate) fn new(inner: R, max_head_bytes: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            mode: ReadMode::HttpToken,
            in_head: false,
            head_bytes: 0,
            max_head_bytes,
        }
    }

    /// Switches to raw body mode expecting `n` bytes. The mode reverts to
    /// token framing once they have been consumed.
    pub(crate) fn set_raw(&mut self, n: usize) {
        debug_assert!(n > 0);
        self.mode = ReadMode::Raw(n);
    }

    /// Arms the socket for one token and yields it.
    ///
    /// Cancellation-safe: a partially received line stays buffered.
    pub(crate) async fn next_token(&mut self) -> Result<TokenEvent, TokenError> {
        debug_assert_eq!(self.mode, ReadMode::HttpToken);
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(TokenEvent::Token(self.parse_line(&line)?));
            }
            if self.head_bytes + self.buf.len() > self.max_head_bytes {
                return Err(TokenError::HeadTooLarge);
            }
            let n = self.fill().await?;
            if n == 0 {
                if self.buf.is_empty() && !self.in_head {
                    return Ok(TokenEvent::Closed);
                }
                return Err(TokenError::Malformed(anyerr!(
                    "connection closed mid request head"
                )));
            }
        }
    }

    /// Reads up to the remaining expected body bytes.
    ///
    /// An empty buffer means the peer closed before the body completed.
    pub(crate) async fn read_body(&mut self) -> Result<Bytes, TokenError> {
        let ReadMode::Raw(remaining) = self.mode else {
            return Err(TokenError::Malformed(anyerr!("socket not in raw mode")));
        };
        if !self.buf.is_empty() {
            // Bytes already received ahead of the mode switch.
            let n = self.buf.len().min(remaining);
            let chunk = self.buf.split_to(n).freeze();
            self.advance_raw(chunk.len());
            return Ok(chunk);
        }
        let mut out = BytesMut::with_capacity(remaining.min(INITIAL_CAPACITY * 16));
        let n = (&mut self.inner)
            .take(remaining as u64)
            .read_buf(&mut out)
            .await?;
        self.advance_raw(n);
        Ok(out.freeze())
    }

    fn advance_raw(&mut self, n: usize) {
        if let ReadMode::Raw(remaining) = self.mode {
            let left = remaining - n;
            self.mode = if left == 0 {
                ReadMode::HttpToken
            } else {
                ReadMode::Raw(left)
            };
        }
    }

    /// Takes one CRLF-terminated line off the buffer, or `None` when no
    /// complete line has arrived yet.
    fn take_line(&mut self) -> Result<Option<Bytes>, TokenError> {
        let Some(end) = self.buf.windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let line = self.buf.split_to(end).freeze();
        let _ = self.buf.split_to(2);
        self.head_bytes += end + 2;
        if self.head_bytes > self.max_head_bytes {
            return Err(TokenError::HeadTooLarge);
        }
        Ok(Some(line))
    }

    fn parse_line(&mut self, line: &[u8]) -> Result<Token, TokenError> {
        if line.is_empty() && self.in_head {
            self.in_head = false;
            self.head_bytes = 0;
            return Ok(Token::EndOfHeaders);
        }
        let line = std::str::from_utf8(line)
            .map_err(|err| TokenError::Malformed(anyerr!("non-ASCII token: {err}")))?;
        if self.in_head {
            let (name, value) = parse::parse_header_line(line).map_err(TokenError::Malformed)?;
            Ok(Token::Header { name, value })
        } else {
            let token = parse::parse_request_line(line).map_err(TokenError::Malformed)?;
            self.in_head = true;
            Ok(token)
        }
    }

    /// Buffers more data from the socket. One read per call, so callers can
    /// drop the future without losing input.
    async fn fill(&mut self) -> Result<usize, io::Error> {
        self.inner.read_buf(&mut self.buf).await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use http::Method;

    use super::*;
    use crate::parse::RequestTarget;

    fn reader(data: &'static [u8]) -> TokenReader<Cursor<&'static [u8]>> {
        TokenReader::new(Cursor::new(data), 1024)
    }

    async fn expect_token(r: &mut TokenReader<Cursor<&'static [u8]>>) -> Token {
        match r.next_token().await.unwrap() {
            TokenEvent::Token(token) => token,
            TokenEvent::Closed => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn token_sequence() {
        let mut r = reader(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
        let Token::RequestLine { method, target, .. } = expect_token(&mut r).await else {
            panic!("expected request line");
        };
        assert_eq!(method, Method::GET);
        assert_eq!(target, RequestTarget::Path("/x".into()));
        let Token::Header { name, value } = expect_token(&mut r).await else {
            panic!("expected header");
        };
        assert_eq!((name.as_str(), value.as_str()), ("Host", "h"));
        assert!(matches!(expect_token(&mut r).await, Token::EndOfHeaders));
        assert!(matches!(r.next_token().await.unwrap(), TokenEvent::Closed));
    }

    #[tokio::test]
    async fn close_mid_head_is_malformed() {
        let mut r = reader(b"GET / HTTP/1.1\r\nHost: h\r\n");
        expect_token(&mut r).await;
        expect_token(&mut r).await;
        assert!(matches!(
            r.next_token().await,
            Err(TokenError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn head_cap_enforced() {
        let mut r = TokenReader::new(Cursor::new(b"GET / HTTP/1.1\r\n".as_slice()), 8);
        assert!(matches!(
            r.next_token().await,
            Err(TokenError::HeadTooLarge)
        ));
    }

    #[tokio::test]
    async fn head_cap_without_any_crlf() {
        let data: &'static [u8] = Box::leak(vec![b'a'; 64].into_boxed_slice());
        let mut r = TokenReader::new(Cursor::new(data), 16);
        assert!(matches!(
            r.next_token().await,
            Err(TokenError::HeadTooLarge)
        ));
    }

    #[tokio::test]
    async fn raw_mode_serves_buffered_pipeline_bytes() {
        let mut r = reader(b"PUT /r HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET");
        for _ in 0..3 {
            expect_token(&mut r).await;
        }
        r.set_raw(5);
        let body = r.read_body().await.unwrap();
        assert_eq!(&body[..], b"hello");
        // Mode reverted; the pipelined bytes stay queued for token parsing.
        assert_eq!(r.mode, ReadMode::HttpToken);
    }

    #[tokio::test]
    async fn raw_mode_partial_reads_decrement() {
        let mut r = reader(b"abcdef");
        r.set_raw(4);
        let first = r.read_body().await.unwrap();
        assert!(!first.is_empty());
        let mut got = first.to_vec();
        while got.len() < 4 {
            let more = r.read_body().await.unwrap();
            assert!(!more.is_empty());
            got.extend_from_slice(&more);
        }
        assert_eq!(&got, b"abcd");
        assert_eq!(r.mode, ReadMode::HttpToken);
    }

    #[tokio::test]
    async fn raw_mode_eof_yields_empty() {
        let mut r = reader(b"ab");
        r.set_raw(5);
        let chunk = r.read_body().await.unwrap();
        assert_eq!(&chunk[..], b"ab");
        let rest = r.read_body().await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn head_accounting_resets_between_requests() {
        let mut r = TokenReader::new(
            Cursor::new(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n".as_slice()),
            24,
        );
        for _ in 0..4 {
            expect_token(&mut r).await;
        }
        assert!(matches!(r.next_token().await.unwrap(), TokenEvent::Closed));
    }
}
