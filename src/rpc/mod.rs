//! RPC server for client communication.
//!
//! Provides a JSON-RPC 2.0 interface over TCP for querying job history,
//! active jobs, targets and upcoming schedule fires, and for triggering a
//! backup by hand.
//!
//! ## Architecture
//!
//! - `protocol`: JSON-RPC 2.0 request/response types
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: Method dispatcher and handlers
//! - `client`: Client for connecting to the daemon

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::core::Orchestrator;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{ErrorCode, Request, Response, RpcError};

/// RPC server that exposes daemon functionality to clients.
pub struct RpcServer {
    transport: Transport,
}

impl RpcServer {
    /// Bind the listener. Failing to bind is a startup error.
    pub async fn bind(orchestrator: Arc<Orchestrator>, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let handler = MethodHandler::new(orchestrator);
        Ok(Self {
            transport: Transport::new(listener, handler),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve clients until `shutdown` is cancelled.
    pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.transport.listen(shutdown).await
    }
}
