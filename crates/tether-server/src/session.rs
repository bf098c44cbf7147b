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

//! Session state and the store of retained sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::runtime::{PrinterOptions, Runtime};

/// The mutable evaluation bindings of one logical user.
///
/// A fresh state is owned by the connection that created it and dropped
/// when that connection closes; retaining it in the [`SessionStore`] lets
/// later connections rebind it by id.
#[derive(Debug)]
pub struct SessionState<R: Runtime> {
    /// The opaque store id, set once the session has been retained.
    pub id: Option<String>,
    /// Current namespace.
    pub ns: String,
    /// The last three printed values, most recent first.
    pub v1: Option<R::Value>,
    pub v2: Option<R::Value>,
    pub v3: Option<R::Value>,
    /// The last caught evaluation exception.
    pub last_exception: Option<R::Exception>,
    pub printer: PrinterOptions,
    /// The runtime's own bindings (`def` results and the like).
    pub env: R::Env,
}

impl<R: Runtime> SessionState<R> {
    pub fn new(ns: impl Into<String>) -> Self {
        Self {
            id: None,
            ns: ns.into(),
            v1: None,
            v2: None,
            v3: None,
            last_exception: None,
            printer: PrinterOptions::default(),
            env: R::Env::default(),
        }
    }

    pub fn handle(ns: impl Into<String>) -> SessionHandle<R> {
        Arc::new(Mutex::new(Self::new(ns)))
    }
}

impl<R: Runtime> Clone for SessionState<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            ns: self.ns.clone(),
            v1: self.v1.clone(),
            v2: self.v2.clone(),
            v3: self.v3.clone(),
            last_exception: self.last_exception.clone(),
            printer: self.printer.clone(),
            env: self.env.clone(),
        }
    }
}

pub type SessionHandle<R> = Arc<Mutex<SessionState<R>>>;

/// Lock a session, recovering the guard if a worker panicked while holding
/// it; a crashed evaluation must not brick the session.
pub(crate) fn lock_session<R: Runtime>(
    handle: &SessionHandle<R>,
) -> std::sync::MutexGuard<'_, SessionState<R>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Concurrent map of retained sessions, keyed by opaque id.
///
/// A retained session is referenced under exactly one id; releasing
/// removes it. Both the host-facing retain/release API and the wire-level
/// one-liners go through here.
pub struct SessionStore<R: Runtime> {
    inner: Arc<Mutex<HashMap<String, SessionHandle<R>>>>,
}

impl<R: Runtime> std::fmt::Debug for SessionStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field(
                "inner",
                &self
                    .inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<R: Runtime> Clone for SessionStore<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Runtime> Default for SessionStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> SessionStore<R> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Retain a session, minting a fresh id unless it already has one.
    /// Idempotent: retaining twice returns the same id.
    pub fn retain(&self, session: &SessionHandle<R>) -> String {
        let mut state = lock_session(session);
        let id = match &state.id {
            Some(id) => id.clone(),
            None => Uuid::new_v4().to_string(),
        };
        state.id = Some(id.clone());
        self.install(&id, Arc::clone(session));
        id
    }

    /// Remove a session from the store. Returns whether it was retained.
    pub fn release(&self, session: &SessionHandle<R>) -> bool {
        let state = lock_session(session);
        match &state.id {
            Some(id) => self.remove(id),
            None => false,
        }
    }

    pub fn lookup(&self, id: &str) -> Option<SessionHandle<R>> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Install a handle under an id without touching the session state.
    /// The wire-level retain one-liner uses this while the worker already
    /// holds a snapshot of the state.
    pub(crate) fn install(&self, id: &str, session: SessionHandle<R>) {
        self.lock().insert(id.to_string(), session);
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionHandle<R>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::Interp;

    #[test]
    fn test_retain_is_idempotent() {
        let store: SessionStore<Interp> = SessionStore::new();
        let session = SessionState::<Interp>::handle("user");

        let id1 = store.retain(&session);
        let id2 = store.retain(&session);
        assert_eq!(id1, id2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_lookup_returns_same_handle() {
        let store: SessionStore<Interp> = SessionStore::new();
        let session = SessionState::<Interp>::handle("user");

        let id = store.retain(&session);
        let found = store.lookup(&id).expect("retained session should be found");
        assert!(Arc::ptr_eq(&found, &session));
        assert!(store.lookup("no-such-id").is_none());
    }

    #[test]
    fn test_release_removes_entry() {
        let store: SessionStore<Interp> = SessionStore::new();
        let session = SessionState::<Interp>::handle("user");

        assert!(!store.release(&session), "unretained release is false");

        let id = store.retain(&session);
        assert!(store.release(&session));
        assert!(store.lookup(&id).is_none());
        assert!(!store.release(&session), "second release is false");
    }

    #[test]
    fn test_rerelease_then_retain_reuses_id() {
        let store: SessionStore<Interp> = SessionStore::new();
        let session = SessionState::<Interp>::handle("user");

        let id1 = store.retain(&session);
        store.release(&session);
        let id2 = store.retain(&session);
        assert_eq!(id1, id2, "a state keeps its id across release");
    }
}
