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

//! # tether client
//!
//! An async client for the tether REPL protocol. A dedicated reader task
//! demultiplexes server responses back to their requests by message id, so
//! any number of requests can be in flight on one connection.
//!
//! ## Quick start
//!
//! ```no_run
//! use tether_client::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect_local(7888).await?;
//!
//!     let responses = client.send("(+ 1 2)").await?;
//!     for response in responses.collect().await {
//!         if let Some(value) = response.value() {
//!             println!("=> {}", value); // => 3
//!         }
//!     }
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Response handles and expiry
//!
//! [`Client::send`] returns a [`Responses`] handle yielding that request's
//! responses in order. The client holds only a *weak* reference to the
//! handle's queue: dropping the handle makes the entry reclaimable, and
//! later server responses for that id are discarded instead of piling up.
//! Abandoning a request therefore never leaks memory.
//!
//! ## Interrupting
//!
//! ```no_run
//! # use std::time::Duration;
//! # use tether_client::Client;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect_local(7888).await?;
//! let responses = client.send("(sleep 60000)").await?;
//!
//! // Changed our minds: cancel it server-side.
//! responses.interrupt().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Debug logging
//!
//! Set the `TETHER_DEBUG` environment variable to log reader activity and
//! request/response correlation to stderr.

mod error;
mod responses;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tether_proto::codec::{self, MessageReader};
use tether_proto::{key, Message};

pub use error::{ClientError, Result};
pub use responses::{combine_responses, read_response_value, Responses};

/// Check if debug logging is enabled via the TETHER_DEBUG environment variable
pub(crate) fn debug_enabled() -> bool {
    static DEBUG: OnceLock<bool> = OnceLock::new();
    *DEBUG.get_or_init(|| std::env::var("TETHER_DEBUG").is_ok())
}

macro_rules! debug_log {
    ($($arg:tt)*) => {
        if $crate::debug_enabled() {
            eprintln!($($arg)*);
        }
    };
}

pub(crate) use debug_log;

/// One request's response queue. The outstanding map holds only a weak
/// reference to this; the [`Responses`] handle owns the strong one. The
/// sending side is closed by the reader when the connection ends, so a
/// blocked receive observes end of stream instead of waiting forever.
pub(crate) struct Slot {
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pub(crate) rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Slot {
    fn push(&self, msg: Message) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = &*tx {
            let _ = tx.send(msg);
        }
    }

    fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

pub(crate) type Outstanding = Arc<Mutex<HashMap<String, Weak<Slot>>>>;

pub(crate) type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Register a fresh slot for `id`, pruning entries whose handles are gone.
pub(crate) fn register_slot(outstanding: &Outstanding, id: &str) -> Arc<Slot> {
    let (tx, rx) = mpsc::unbounded_channel();
    let slot = Arc::new(Slot {
        tx: Mutex::new(Some(tx)),
        rx: tokio::sync::Mutex::new(rx),
    });
    let mut map = outstanding.lock().unwrap_or_else(PoisonError::into_inner);
    map.retain(|_, weak| weak.strong_count() > 0);
    map.insert(id.to_string(), Arc::downgrade(&slot));
    slot
}

/// Close every live queue so pending receives end instead of hanging.
fn close_outstanding(outstanding: &Outstanding) {
    let mut map = outstanding.lock().unwrap_or_else(PoisonError::into_inner);
    for (_, weak) in map.drain() {
        if let Some(slot) = weak.upgrade() {
            slot.close();
        }
    }
}

/// Write one request under the connection's write lock.
pub(crate) async fn write_request(writer: &SharedWriter, request: &Message) -> Result<()> {
    let mut guard = writer.lock().await;
    codec::write_message(&mut *guard, request).await?;
    Ok(())
}

/// Options for [`Client::send_with`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Evaluate inside this namespace instead of the session's current one.
    pub ns: Option<String>,
    /// Per-request evaluation deadline. Server default: 60 seconds.
    pub timeout: Option<Duration>,
    /// Text exposed as the evaluator's stdin.
    pub input: Option<String>,
    /// Attach to a retained session by id.
    pub session_id: Option<String>,
}

/// An async tether client.
///
/// Cheap to share: `send` takes `&self`, and concurrent in-flight requests
/// are demultiplexed by the reader task. Writes are serialized by the
/// write-half mutex so a request is never interleaved on the wire.
pub struct Client {
    writer: SharedWriter,
    outstanding: Outstanding,
    reader_task: JoinHandle<()>,
}

impl Client {
    /// Connect to a tether server.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Connection` if the connection fails (server
    /// not running, invalid address, network error).
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let outstanding: Outstanding = Arc::new(Mutex::new(HashMap::new()));
        let reader_task = tokio::spawn(reader_loop(read_half, Arc::clone(&outstanding)));

        Ok(Self {
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            outstanding,
            reader_task,
        })
    }

    /// Connect to `localhost:port`, the default host.
    pub async fn connect_local(port: u16) -> Result<Self> {
        Self::connect(("localhost", port)).await
    }

    /// Send code for evaluation with default options.
    ///
    /// Returns the request's [`Responses`] handle. The request is on the
    /// wire when this returns; responses stream in as the server produces
    /// them.
    pub async fn send(&self, code: impl Into<String>) -> Result<Responses> {
        self.send_with(code, SendOptions::default()).await
    }

    /// Send code for evaluation.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::time::Duration;
    /// use tether_client::{Client, SendOptions};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = Client::connect_local(7888).await?;
    /// let responses = client
    ///     .send_with(
    ///         "(read-line)",
    ///         SendOptions {
    ///             input: Some("piped input\n".to_string()),
    ///             timeout: Some(Duration::from_secs(5)),
    ///             ..Default::default()
    ///         },
    ///     )
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn send_with(&self, code: impl Into<String>, options: SendOptions) -> Result<Responses> {
        let id = Uuid::new_v4().to_string();
        let code = code.into();
        debug_log!(
            "[tether DEBUG] Sending request {} ({} bytes of code)",
            id,
            code.len()
        );

        let mut request = Message::new()
            .with(key::ID, id.as_str())
            .with(key::CODE, code);
        if let Some(ns) = options.ns {
            request.insert(key::NS, ns);
        }
        if let Some(timeout) = options.timeout {
            request.insert(key::TIMEOUT, timeout.as_millis() as i64);
        }
        if let Some(input) = options.input {
            request.insert(key::IN, input);
        }
        if let Some(session_id) = options.session_id {
            request.insert(key::SESSION_ID, session_id);
        }

        // Register before writing so the reader cannot race the first
        // response past us.
        let slot = register_slot(&self.outstanding, &id);
        write_request(&self.writer, &request).await?;

        Ok(Responses::new(
            id,
            slot,
            Arc::clone(&self.writer),
            Arc::clone(&self.outstanding),
        ))
    }

    /// Count of outstanding entries whose handles are still alive.
    #[doc(hidden)]
    pub fn outstanding_live(&self) -> usize {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Shut the connection down. Outstanding response handles see end of
    /// stream on their next receive.
    pub async fn close(self) -> Result<()> {
        debug_log!("[tether DEBUG] Closing connection");
        self.reader_task.abort();
        close_outstanding(&self.outstanding);
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_task.abort();
        close_outstanding(&self.outstanding);
    }
}

/// The dedicated reader: decode one response, route it to the slot for its
/// id, or discard it when the handle is gone.
async fn reader_loop(read_half: OwnedReadHalf, outstanding: Outstanding) {
    let mut reader = MessageReader::new(read_half);
    loop {
        match reader.read_message().await {
            Ok(Some(response)) => {
                let id = match response.id() {
                    Some(id) => id.to_string(),
                    None => {
                        debug_log!("[tether DEBUG] Discarding response without an id");
                        continue;
                    }
                };
                let slot = {
                    let mut map = outstanding.lock().unwrap_or_else(PoisonError::into_inner);
                    match map.get(&id).and_then(Weak::upgrade) {
                        Some(slot) => Some(slot),
                        None => {
                            // The handle is gone (or never existed); drop
                            // the stale entry along with the response.
                            map.remove(&id);
                            None
                        }
                    }
                };
                match slot {
                    Some(slot) => {
                        debug_log!("[tether DEBUG] Routing response for {}", id);
                        slot.push(response);
                    }
                    None => {
                        debug_log!("[tether DEBUG] Discarding response for {}", id);
                    }
                }
            }
            Ok(None) => {
                debug_log!("[tether DEBUG] Server closed the connection");
                break;
            }
            Err(e) => {
                debug_log!("[tether DEBUG] Reader stopping: {}", e);
                break;
            }
        }
    }
    close_outstanding(&outstanding);
}
