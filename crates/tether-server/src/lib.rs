// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! # tether server
//!
//! A networked REPL server. Clients connect over TCP, send evaluation
//! requests framed in the tether wire format, and receive streamed values,
//! captured output, and status transitions. Evaluation runs inside
//! sessions that can be retained under an opaque id and rebound from later
//! connections.
//!
//! The language being evaluated sits behind the [`Runtime`] trait; the
//! bundled [`lang::Interp`] is a small Lisp that makes the server usable
//! out of the box.
//!
//! ## Quick start
//!
//! ```no_run
//! use tether_server::{lang::Interp, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Port 0 binds an ephemeral port; no ack peer.
//!     let server = Server::start(Interp::new(), 0, 0).await?;
//!     println!("listening on {}", server.local_addr());
//!
//!     // ... serve until shutdown ...
//!     server.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Structure
//!
//! - [`Runtime`] / [`Context`]: the seam to the evaluated language
//! - [`SessionStore`]: retained sessions, by opaque id
//! - the driver (internal): the per-request read-eval-print loop
//! - dispatch (internal): blocking workers supervised with deadlines
//! - [`Server`]: listener, accept loop, and the ack promise

mod connection;
mod driver;
mod error;
pub mod lang;
mod runtime;
mod session;
mod sink;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tether_proto::codec::{self, MessageReader};
use tether_proto::{key, Message};

pub use error::{Result, ServerError};
pub use runtime::{Context, ControlHooks, PrinterOptions, Runtime, StrInput};
pub use session::{SessionHandle, SessionState, SessionStore};
pub use sink::{OutputSink, StreamKey};

use worker::{AckSender, PendingRequests};

/// A running REPL server.
///
/// Owns the accept task and the two process-wide tables (pending requests
/// and retained sessions), so several servers can live in one process.
/// Dropping the handle stops accepting; in-flight requests run to
/// completion on the blocking pool.
pub struct Server<R: Runtime> {
    local_addr: SocketAddr,
    sessions: SessionStore<R>,
    accept_task: JoinHandle<()>,
    ack_rx: watch::Receiver<Option<u16>>,
}

impl<R: Runtime> Server<R> {
    /// Bind `127.0.0.1:port` (0 = ephemeral) and start accepting.
    ///
    /// When `ack_port > 0`, a short-lived connection to
    /// `localhost:ack_port` delivers this server's bound port by
    /// evaluating `(deliver-ack <port>)` against the peer; the peer
    /// observes it through [`Server::await_ack`].
    pub async fn start(runtime: R, port: u16, ack_port: u16) -> Result<Self> {
        let runtime = Arc::new(runtime);
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let local_addr = listener.local_addr()?;

        let sessions = SessionStore::new();
        let pending = PendingRequests::new();
        let (ack_tx, ack_rx) = watch::channel(None);
        let ack: AckSender = Arc::new(ack_tx);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&runtime),
            pending,
            sessions.clone(),
            Arc::clone(&ack),
        ));
        tracing::info!(addr = %local_addr, "REPL server listening");

        if ack_port > 0 {
            send_ack(local_addr.port(), ack_port).await?;
        }

        Ok(Self {
            local_addr,
            sessions,
            accept_task,
            ack_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The retained-session store, for embedders that manage sessions
    /// host-side rather than over the wire.
    pub fn sessions(&self) -> &SessionStore<R> {
        &self.sessions
    }

    /// Wait for a peer server to deliver its bound port, up to `timeout`.
    pub async fn await_ack(&self, timeout: Duration) -> Option<u16> {
        let mut rx = self.ack_rx.clone();
        let result = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(port)) => *port,
            _ => None,
        };
        result
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl<R: Runtime> Drop for Server<R> {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Free-function form of [`Server::start`].
pub async fn start_server<R: Runtime>(runtime: R, port: u16, ack_port: u16) -> Result<Server<R>> {
    Server::start(runtime, port, ack_port).await
}

/// The supervised accept loop: accept errors are logged and the loop keeps
/// going; each connection runs in its own task.
async fn accept_loop<R: Runtime>(
    listener: TcpListener,
    runtime: Arc<R>,
    pending: PendingRequests,
    sessions: SessionStore<R>,
    ack: AckSender,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "accepted connection");
                tokio::spawn(connection::handle_connection(
                    Arc::clone(&runtime),
                    pending.clone(),
                    sessions.clone(),
                    Arc::clone(&ack),
                    stream,
                ));
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to accept connection");
            }
        }
    }
}

/// Deliver our bound port to the ack server with a single evaluation, then
/// drain that request to its terminal status.
async fn send_ack(local_port: u16, ack_port: u16) -> Result<()> {
    let stream = TcpStream::connect(("127.0.0.1", ack_port)).await?;
    let (read_half, mut write_half) = stream.into_split();

    let request = Message::new()
        .with(key::ID, Uuid::new_v4().to_string())
        .with(key::CODE, format!("(deliver-ack {})", local_port));
    codec::write_message(&mut write_half, &request).await?;
    tracing::debug!(ack_port, "delivered bound port to ack server");

    let mut reader = MessageReader::new(read_half);
    let drain = async {
        while let Ok(Some(reply)) = reader.read_message().await {
            if reply.is_terminal() {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(10), drain).await;
    Ok(())
}
