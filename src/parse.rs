use std::str::FromStr;

use http::{Method, StatusCode, Version, uri::Uri};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};

use crate::DEFAULT_PORT;

/// Host and port of an origin, as resolved from a request target or `Host`
/// header.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_host_header(s)
    }
}

impl Authority {
    /// Splits `host[:port]` at the first colon, defaulting the port to 80.
    pub fn from_host_header(value: &str) -> Result<Self> {
        ensure_any!(!value.is_empty(), "Empty authority");
        match value.split_once(':') {
            None => Ok(Self {
                host: value.to_string(),
                port: DEFAULT_PORT,
            }),
            Some((host, port)) => {
                let port = port.parse::<u16>().std_context("Invalid port")?;
                Ok(Self {
                    host: host.to_string(),
                    port,
                })
            }
        }
    }

    pub(crate) fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Request-target forms accepted on the request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// Origin-form: a literal path such as `/index.html`.
    Path(String),
    /// Absolute-form: scheme, authority and path.
    Absolute {
        scheme: String,
        authority: Authority,
        path: String,
    },
    /// Asterisk-form, only meaningful for OPTIONS.
    Asterisk,
    /// Authority-like form as produced by CONNECT targets; final disposition
    /// is deferred to end-of-headers.
    Scheme(String),
}

impl RequestTarget {
    /// Classifies a request target string.
    pub fn parse(target: &str) -> Result<Self> {
        if target == "*" {
            return Ok(Self::Asterisk);
        }
        if target.starts_with('/') {
            return Ok(Self::Path(target.to_string()));
        }
        let uri = Uri::from_str(target).std_context("Invalid request target")?;
        match (uri.scheme_str(), uri.authority()) {
            (Some(scheme), Some(authority)) => {
                let port = authority.port_u16().unwrap_or(DEFAULT_PORT);
                let path = uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .filter(|pq| !pq.is_empty())
                    .unwrap_or("/")
                    .to_string();
                Ok(Self::Absolute {
                    scheme: scheme.to_string(),
                    authority: Authority {
                        host: authority.host().to_string(),
                        port,
                    },
                    path,
                })
            }
            _ => Ok(Self::Scheme(target.to_string())),
        }
    }
}

/// A request accepted from the client, as handed to the forwarding bridge.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub scheme: Option<String>,
    /// Set by end-of-headers, from the target or the `Host` header, unless a
    /// 400 has been latched.
    pub host: Option<String>,
    pub port: u16,
    pub path: Option<String>,
    pub version: Version,
}

impl Request {
    pub(crate) fn new(method: Method, version: Version) -> Self {
        Self {
            method,
            scheme: None,
            host: None,
            port: DEFAULT_PORT,
            path: None,
            version,
        }
    }
}

/// Ordered header sequence.
///
/// Arrival order is preserved and duplicates are permitted; names keep their
/// wire case and compare ASCII-case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Value of the first header with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the value of the first header with the given name, keeping
    /// its position. No-op when the header is absent.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        if let Some((_, v)) = self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            *v = value.into();
        }
    }

    /// Whether any header with the given name lists the token in its
    /// comma-separated value.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .any(|(_, v)| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

/// One parsed unit from the client socket in token mode.
#[derive(Debug)]
pub enum Token {
    RequestLine {
        method: Method,
        target: RequestTarget,
        version: Version,
    },
    Header {
        name: String,
        value: String,
    },
    EndOfHeaders,
}

/// Parses a request line `METHOD target HTTP/x.y`.
pub(crate) fn parse_request_line(line: &str) -> Result<Token> {
    let mut parts = line.split_ascii_whitespace();
    let method = parts.next().context("Missing method")?;
    let target = parts.next().context("Missing request target")?;
    let version = parts.next().context("Missing HTTP version")?;
    ensure_any!(parts.next().is_none(), "Trailing data on request line");
    let method = Method::from_str(method).std_context("Invalid method")?;
    let target = RequestTarget::parse(target)?;
    let version = parse_version(version)?;
    Ok(Token::RequestLine {
        method,
        target,
        version,
    })
}

/// Splits a header line at the first colon; the value is trimmed of optional
/// whitespace.
pub(crate) fn parse_header_line(line: &str) -> Result<(String, String)> {
    let (name, value) = line.split_once(':').context("Missing colon in header")?;
    ensure_any!(
        !name.is_empty() && !name.contains(' '),
        "Invalid header field name"
    );
    Ok((name.to_string(), value.trim().to_string()))
}

pub(crate) fn parse_version(version: &str) -> Result<Version> {
    match version {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(anyerr!("Unsupported HTTP version {other:?}")),
    }
}

/// A reply head parsed from the upstream wire.
#[derive(Debug)]
pub(crate) struct ReplyHead {
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<String>,
    pub(crate) headers: HeaderList,
}

impl ReplyHead {
    /// Parses a response head from a buffer and returns `None` when
    /// incomplete. Returns the length of the header section and the head.
    pub(crate) fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("Invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let reason = res
                    .reason
                    .filter(|reason| !reason.is_empty())
                    .map(ToOwned::to_owned);
                let mut list = HeaderList::new();
                for h in res.headers.iter() {
                    let value =
                        std::str::from_utf8(h.value).std_context("Non-UTF-8 header value")?;
                    list.push(h.name, value);
                }
                Ok(Some((
                    header_len,
                    Self {
                        status,
                        reason,
                        headers: list,
                    },
                )))
            }
        }
    }

    pub(crate) fn is_chunked(&self) -> bool {
        self.headers.has_token("transfer-encoding", "chunked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_default_port() {
        let a = Authority::from_host_header("example.com").unwrap();
        assert_eq!(a.host, "example.com");
        assert_eq!(a.port, 80);
    }

    #[test]
    fn authority_explicit_port() {
        let a = Authority::from_host_header("h:8080").unwrap();
        assert_eq!(a.host, "h");
        assert_eq!(a.port, 8080);
        assert_eq!(a.to_addr(), "h:8080");
    }

    #[test]
    fn authority_bad_port() {
        assert!(Authority::from_host_header("h:http").is_err());
        assert!(Authority::from_host_header("").is_err());
    }

    #[test]
    fn target_forms() {
        assert_eq!(RequestTarget::parse("*").unwrap(), RequestTarget::Asterisk);
        assert_eq!(
            RequestTarget::parse("/a/b?q=1").unwrap(),
            RequestTarget::Path("/a/b?q=1".into())
        );
        assert_eq!(
            RequestTarget::parse("http://h:8080/p").unwrap(),
            RequestTarget::Absolute {
                scheme: "http".into(),
                authority: Authority {
                    host: "h".into(),
                    port: 8080
                },
                path: "/p".into(),
            }
        );
        // No explicit port: absorbed as 80.
        assert_eq!(
            RequestTarget::parse("http://h").unwrap(),
            RequestTarget::Absolute {
                scheme: "http".into(),
                authority: Authority {
                    host: "h".into(),
                    port: 80
                },
                path: "/".into(),
            }
        );
        // CONNECT-style authority form has no scheme.
        assert_eq!(
            RequestTarget::parse("example.com:443").unwrap(),
            RequestTarget::Scheme("example.com:443".into())
        );
    }

    #[test]
    fn request_line_tokens() {
        let Token::RequestLine {
            method,
            target,
            version,
        } = parse_request_line("GET / HTTP/1.1").unwrap()
        else {
            panic!("expected request line");
        };
        assert_eq!(method, Method::GET);
        assert_eq!(target, RequestTarget::Path("/".into()));
        assert_eq!(version, Version::HTTP_11);

        assert!(parse_request_line("GET /").is_err());
        assert!(parse_request_line("GET / HTTP/2.0").is_err());
        assert!(parse_request_line("GET / HTTP/1.1 junk").is_err());
    }

    #[test]
    fn header_lines() {
        let (name, value) = parse_header_line("Host:  h:8080 ").unwrap();
        assert_eq!(name, "Host");
        assert_eq!(value, "h:8080");
        assert!(parse_header_line("no colon here").is_err());
    }

    #[test]
    fn header_list_order_and_case() {
        let mut headers = HeaderList::new();
        headers.push("Via", "a");
        headers.push("X-One", "1");
        headers.push("Via", "b");
        assert_eq!(headers.get("via"), Some("a"));
        let collected: Vec<_> = headers.iter().collect();
        assert_eq!(collected, vec![("Via", "a"), ("X-One", "1"), ("Via", "b")]);

        headers.set("x-one", "2");
        assert_eq!(headers.get("X-One"), Some("2"));
        assert!(headers.has_token("VIA", "B"));
    }

    #[test]
    fn connection_close_token() {
        let headers: HeaderList = [("Connection", "keep-alive, close")].into_iter().collect();
        assert!(headers.has_token("connection", "close"));
        let headers: HeaderList = [("Connection", "keep-alive")].into_iter().collect();
        assert!(!headers.has_token("connection", "close"));
    }

    #[test]
    fn reply_head_parse() {
        let wire = b"HTTP/1.1 201 Created\r\nEtag: \"abc\"\r\nContent-Length: 0\r\n\r\nrest";
        let (len, head) = ReplyHead::parse(wire).unwrap().unwrap();
        assert_eq!(len, wire.len() - 4);
        assert_eq!(head.status, StatusCode::CREATED);
        assert_eq!(head.reason.as_deref(), Some("Created"));
        assert_eq!(head.headers.get("etag"), Some("\"abc\""));
        assert!(!head.is_chunked());

        assert!(ReplyHead::parse(b"HTTP/1.1 200 OK\r\n").unwrap().is_none());
    }

    #[test]
    fn reply_head_chunked() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (_, head) = ReplyHead::parse(wire).unwrap().unwrap();
        assert!(head.is_chunked());
    }
}
