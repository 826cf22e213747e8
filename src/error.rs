use std::io;

use http::StatusCode;
use n0_error::{AnyError, stack_error};

/// Error type for per-connection proxy failures.
///
/// Carries the status code to surface to the client when a response can
/// still be written; `None` means the connection is torn down without one.
#[stack_error(add_meta, derive)]
pub struct ProxyError {
    response_status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl From<io::Error> for ProxyError {
    fn from(value: io::Error) -> Self {
        Self::io(value)
    }
}

impl ProxyError {
    /// Returns the HTTP status code to surface to the client, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    pub(crate) fn upstream(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::INTERNAL_SERVER_ERROR), source.into())
    }

    pub(crate) fn dispatch(source: impl Into<AnyError>) -> Self {
        Self::new(None, source.into())
    }

    pub(crate) fn io(source: impl Into<AnyError>) -> Self {
        Self::new(None, source.into())
    }
}
