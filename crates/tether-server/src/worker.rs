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

//! Request dispatch: one blocking worker per evaluation, one supervising
//! task that enforces the deadline and emits the terminal status.
//!
//! The blocking pool grows on demand and recycles idle threads, which is
//! the scheduling policy the request workers need; a worker that outlives
//! its deadline keeps running, but everything it emits afterwards is
//! suppressed by its interrupt flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use tether_proto::{key, status, Message, DEFAULT_TIMEOUT_MS};

use crate::driver::{self, DriverOutcome};
use crate::runtime::{ControlHooks, Runtime};
use crate::session::{SessionHandle, SessionStore};

pub(crate) type AckSender = Arc<watch::Sender<Option<u16>>>;

/// Emits responses for one request id.
///
/// Every message is stamped with the id. Ordinary emission is dropped once
/// the interrupt flag is set, so neither values nor a `done` status can
/// escape a cancelled or timed-out request; only the supervisor's terminal
/// status bypasses the filter.
#[derive(Clone)]
pub(crate) struct Responder {
    id: String,
    interrupt: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Responder {
    pub(crate) fn new(
        id: String,
        interrupt: Arc<AtomicBool>,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self { id, interrupt, tx }
    }

    pub(crate) fn send(&self, msg: Message) {
        if self.interrupt.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(msg.with(key::ID, self.id.as_str()));
    }

    fn send_terminal(&self, msg: Message) {
        let _ = self.tx.send(msg.with(key::ID, self.id.as_str()));
    }
}

struct PendingRequest {
    interrupt: Arc<AtomicBool>,
    deadline: Instant,
}

/// The table of in-flight requests: id to interrupt flag and deadline.
/// Entries are inserted at dispatch and removed when the supervisor
/// resolves the request, whichever way it ends.
#[derive(Clone)]
pub(crate) struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, PendingRequest>>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn insert(&self, id: &str, interrupt: Arc<AtomicBool>, deadline: Instant) {
        self.lock()
            .insert(id.to_string(), PendingRequest { interrupt, deadline });
    }

    fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Best-effort cancel: set the request's interrupt flag.
    pub(crate) fn interrupt(&self, id: &str) -> bool {
        match self.lock().get(id) {
            Some(pending) => {
                pending.interrupt.store(true, Ordering::SeqCst);
                tracing::debug!(
                    id,
                    remaining = ?pending.deadline.saturating_duration_since(Instant::now()),
                    "interrupt requested"
                );
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The per-request implementation of the control hooks evaluated one-liners
/// reach: interrupt, session retention, ack delivery.
struct RequestHooks<R: Runtime> {
    pending: PendingRequests,
    sessions: SessionStore<R>,
    session: SessionHandle<R>,
    ack: AckSender,
}

impl<R: Runtime> ControlHooks for RequestHooks<R> {
    fn interrupt(&self, request_id: &str) -> bool {
        self.pending.interrupt(request_id)
    }

    fn retain_session(&self, existing_id: Option<&str>) -> String {
        // The caller evaluates against a snapshot, so the session mutex is
        // free here and the store-side retain can mint the id atomically.
        // The caller records the id in its snapshot; write-back keeps it.
        match existing_id {
            Some(id) => {
                self.sessions.install(id, Arc::clone(&self.session));
                id.to_string()
            }
            None => self.sessions.retain(&self.session),
        }
    }

    fn release_session(&self, id: &str) -> bool {
        self.sessions.remove(id)
    }

    fn deliver_ack(&self, port: u16) {
        let _ = self.ack.send(Some(port));
    }
}

/// Schedule one evaluation request. Returns immediately; the caller goes
/// back to its read loop while the worker and its supervisor run.
pub(crate) fn dispatch<R: Runtime>(
    runtime: Arc<R>,
    pending: PendingRequests,
    sessions: SessionStore<R>,
    ack: AckSender,
    session: SessionHandle<R>,
    request: Message,
    reply_tx: mpsc::UnboundedSender<Message>,
) -> String {
    let id = request
        .id()
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let timeout_ms = request
        .timeout_ms()
        .filter(|t| *t > 0)
        .unwrap_or(DEFAULT_TIMEOUT_MS) as u64;
    let timeout = Duration::from_millis(timeout_ms);

    let interrupt = Arc::new(AtomicBool::new(false));
    pending.insert(&id, Arc::clone(&interrupt), Instant::now() + timeout);

    let responder = Responder::new(id.clone(), Arc::clone(&interrupt), reply_tx);
    let hooks: Arc<dyn ControlHooks> = Arc::new(RequestHooks {
        pending: pending.clone(),
        sessions,
        session: Arc::clone(&session),
        ack,
    });

    let worker = {
        let runtime = Arc::clone(&runtime);
        let responder = responder.clone();
        let interrupt = Arc::clone(&interrupt);
        tokio::task::spawn_blocking(move || {
            driver::run_request(runtime.as_ref(), &session, &request, &responder, hooks, interrupt)
        })
    };

    let request_id = id.clone();
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(DriverOutcome::Completed)) => {
                // A cancel that landed while the last form was finishing
                // must not surface as done.
                let st = if interrupt.load(Ordering::SeqCst) {
                    status::INTERRUPTED
                } else {
                    status::DONE
                };
                responder.send_terminal(Message::new().with(key::STATUS, st));
            }
            Ok(Ok(DriverOutcome::Interrupted)) => {
                responder.send_terminal(Message::new().with(key::STATUS, status::INTERRUPTED));
            }
            Ok(Ok(DriverOutcome::Failed(error))) => {
                tracing::error!(id = %id, error = %error, "evaluation worker failed");
                responder.send_terminal(
                    Message::new()
                        .with(key::STATUS, status::SERVER_FAILURE)
                        .with(key::ERROR, error),
                );
            }
            Ok(Err(join_error)) => {
                tracing::error!(id = %id, error = %join_error, "evaluation worker panicked");
                responder.send_terminal(
                    Message::new()
                        .with(key::STATUS, status::SERVER_FAILURE)
                        .with(key::ERROR, "internal evaluation error"),
                );
            }
            Err(_elapsed) => {
                interrupt.store(true, Ordering::SeqCst);
                responder.send_terminal(Message::new().with(key::STATUS, status::TIMEOUT));
            }
        }
        pending.remove(&id);
    });

    request_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responder_suppressed_after_interrupt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let interrupt = Arc::new(AtomicBool::new(false));
        let responder = Responder::new("r1".to_string(), Arc::clone(&interrupt), tx);

        responder.send(Message::new().with(key::VALUE, "1"));
        interrupt.store(true, Ordering::SeqCst);
        responder.send(Message::new().with(key::VALUE, "2"));
        responder.send_terminal(Message::new().with(key::STATUS, status::INTERRUPTED));

        assert_eq!(rx.try_recv().unwrap().value(), Some("1"));
        let terminal = rx.try_recv().unwrap();
        assert_eq!(terminal.status(), Some(status::INTERRUPTED));
        assert!(rx.try_recv().is_err(), "suppressed value must not arrive");
    }

    #[test]
    fn test_pending_interrupt_sets_flag() {
        let pending = PendingRequests::new();
        let flag = Arc::new(AtomicBool::new(false));
        pending.insert("r1", Arc::clone(&flag), Instant::now());

        assert!(pending.interrupt("r1"));
        assert!(flag.load(Ordering::SeqCst));
        assert!(!pending.interrupt("r2"), "unknown id is false");

        pending.remove("r1");
        assert!(!pending.interrupt("r1"), "removed entry is gone");
    }
}
