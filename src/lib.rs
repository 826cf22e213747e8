//! User-agent-side HTTP/1.x proxy engine.
//!
//! One [`handler::UaHandler`] runs per accepted client connection. It parses
//! requests incrementally, hands them to an origin worker obtained from an
//! [`origin::OriginDispatcher`], and streams the worker's reply (complete or
//! chunked) back to the client, looping while the connection is keep-alive.

pub mod handler;
pub mod origin;
pub mod server;

mod error;
mod parse;
mod reply;
mod sock;

pub use error::ProxyError;
pub use origin::{
    DirectOrigins, DispatchError, OriginDispatcher, OriginEvent, OriginHandle, OriginWorker,
    StaticOrigins,
};
pub use parse::{Authority, HeaderList, Request, RequestTarget};
pub use reply::Reply;
pub use server::ProxyServer;

/// Cap on accumulated header bytes for a single request head. Over cap the
/// client gets a `400` and the connection is closed.
pub(crate) const MAX_HEADER_SECTION_LENGTH: usize = 64 * 1024;

/// Port assumed when a request target or `Host` header carries none.
pub(crate) const DEFAULT_PORT: u16 = 80;
