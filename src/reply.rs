use bytes::Bytes;
use http::{StatusCode, Version};
use tokio::io::{self, AsyncWrite, AsyncWriteExt};

use crate::parse::HeaderList;

/// A reply to be transmitted to the client.
///
/// `body == None` means the body arrives separately as chunk events and the
/// headers carry `Transfer-Encoding: chunked`; otherwise the buffer is the
/// complete body.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    /// Reason phrase; the serializer falls back to the canonical one.
    pub reason: Option<String>,
    pub headers: HeaderList,
    pub body: Option<Bytes>,
}

impl Reply {
    pub fn new(status: StatusCode, headers: HeaderList, body: Bytes) -> Self {
        Self {
            status,
            reason: None,
            headers,
            body: Some(body),
        }
    }

    /// A response with the given status, no headers and an empty body.
    pub fn status_only(status: StatusCode) -> Self {
        Self::new(status, HeaderList::new(), Bytes::new())
    }

    /// A reply whose body will follow as chunk events.
    pub fn streamed(status: StatusCode, reason: Option<String>, headers: HeaderList) -> Self {
        Self {
            status,
            reason,
            headers,
            body: None,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("transfer-encoding", "chunked")
    }

    fn status_line(&self, version: Version) -> String {
        let reason = self
            .reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("");
        format!("{:?} {} {}\r\n", version, self.status.as_u16(), reason)
    }

    /// Writes the status line and header section, including the terminating
    /// CRLF. Headers go out in insertion order.
    pub(crate) async fn write_head(
        &self,
        version: Version,
        writer: &mut (impl AsyncWrite + Unpin),
    ) -> io::Result<()> {
        let mut head = self.status_line(version);
        for (name, value) in self.headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        writer.write_all(head.as_bytes()).await
    }

    /// Writes the complete reply: head plus body when present.
    pub(crate) async fn write(
        &self,
        version: Version,
        writer: &mut (impl AsyncWrite + Unpin),
    ) -> io::Result<()> {
        self.write_head(version, writer).await?;
        if let Some(body) = &self.body {
            writer.write_all(body).await?;
        }
        writer.flush().await
    }
}

/// Writes one chunked-transfer frame: lowercase hex size, CRLF, payload,
/// CRLF.
pub(crate) async fn write_chunk(
    writer: &mut (impl AsyncWrite + Unpin),
    payload: &[u8],
) -> io::Result<()> {
    let mut frame = Vec::with_capacity(payload.len() + 16);
    frame.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Writes the zero-length terminator chunk with optional trailer fields.
pub(crate) async fn write_trailer(
    writer: &mut (impl AsyncWrite + Unpin),
    trailers: &HeaderList,
) -> io::Result<()> {
    let mut tail = String::from("0\r\n");
    for (name, value) in trailers.iter() {
        tail.push_str(name);
        tail.push_str(": ");
        tail.push_str(value);
        tail.push_str("\r\n");
    }
    tail.push_str("\r\n");
    writer.write_all(tail.as_bytes()).await?;
    writer.flush().await
}
