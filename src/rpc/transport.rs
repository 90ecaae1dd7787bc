//! TCP transport layer for the RPC server.
//!
//! Newline-delimited JSON framing, one task per connection. Open connections
//! are closed when the server shuts down.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

/// Manages the TCP transport layer.
pub struct Transport {
    listener: TcpListener,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub fn new(listener: TcpListener, handler: MethodHandler) -> Self {
        Self {
            listener,
            handler: Arc::new(handler),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn listen(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "RPC server listening");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Client connected");
                            let handler = self.handler.clone();
                            let closed = shutdown.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, handler, closed).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection error");
                                }
                                debug!(peer = %peer_addr, "Client disconnected");
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// What to do with one received line.
#[derive(Debug)]
enum Frame {
    /// Dispatch and answer.
    Call(Request),
    /// Dispatch without answering.
    Notification(Request),
    /// Answer immediately with an error.
    Reject(Response),
}

fn parse_frame(line: &str) -> Frame {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => match request.validate() {
            Err(reason) => Frame::Reject(Response::invalid_request(
                request.id.clone().unwrap_or(Value::Null),
                reason,
            )),
            Ok(()) if request.is_notification() => Frame::Notification(request),
            Ok(()) => Frame::Call(request),
        },
        Err(_) => Frame::Reject(Response::parse_error()),
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<MethodHandler>,
    closed: CancellationToken,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = tokio::select! {
            read = reader.read_line(&mut line) => read?,
            _ = closed.cancelled() => break,
        };
        if bytes_read == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match parse_frame(trimmed) {
            Frame::Call(request) => {
                debug!(peer = %peer_addr, method = %request.method, "RPC call");
                handler.handle(request).await
            }
            Frame::Notification(request) => {
                debug!(peer = %peer_addr, method = %request.method, "Notification received");
                handler.handle(request).await;
                continue;
            }
            Frame::Reject(response) => {
                warn!(peer = %peer_addr, "Rejected malformed request");
                response
            }
        };

        let mut response_json = serde_json::to_string(&response)?;
        response_json.push('\n');
        writer.write_all(response_json.as_bytes()).await?;
    }

    Ok(())
}
