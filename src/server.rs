//! Accept-side server: one handler task per client connection.

use std::{sync::Arc, time::Duration};

use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker, time::FutureExt};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    handler::UaHandler,
    origin::{DynOriginDispatcher, OriginDispatcher},
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Accepts client connections and runs a [`UaHandler`] per connection.
pub struct ProxyServer {
    banner: String,
    dispatcher: Arc<DynOriginDispatcher<'static>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ProxyServer {
    /// Creates a server with the default banner.
    pub fn new(dispatcher: impl OriginDispatcher + 'static) -> Self {
        Self::with_banner(
            dispatcher,
            format!("hopgate/{}", env!("CARGO_PKG_VERSION")),
        )
    }

    /// Creates a server announcing `banner` in locally produced replies.
    pub fn with_banner(dispatcher: impl OriginDispatcher + 'static, banner: String) -> Self {
        Self {
            banner,
            dispatcher: DynOriginDispatcher::new_arc(dispatcher),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Accepts connections on the listener until it errors or the server is
    /// shut down.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut conn_id = 0u64;
        loop {
            let (stream, peer_addr) = tokio::select! {
                res = listener.accept() => res.std_context("failed to accept connection")?,
                _ = self.shutdown.cancelled() => return Ok(()),
            };
            debug!(%peer_addr, "accepted connection");
            let banner = self.banner.clone();
            let dispatcher = self.dispatcher.clone();
            let token = self.shutdown.child_token();
            self.tasks.spawn(
                async move {
                    let (read, write) = stream.into_split();
                    let handler = UaHandler::new(read, write, banner, dispatcher);
                    match token.run_until_cancelled_owned(handler.run()).await {
                        None => debug!("connection aborted at shutdown"),
                        Some(Ok(())) => debug!("connection finished"),
                        Some(Err(err)) => warn!("connection failed: {err:#}"),
                    }
                }
                .instrument(error_span!("ua-conn", id = conn_id)),
            );
            conn_id += 1;
        }
    }

    /// Stops accepting and waits briefly for connection tasks to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} pending tasks)", self.tasks.len());
        match self.tasks.wait().timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await {
            Ok(_) => debug!("all connections closed cleanly"),
            Err(_) => debug!(
                remaining = self.tasks.len(),
                "not all connections closed in time, abort"
            ),
        }
    }
}
