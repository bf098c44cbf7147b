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

//! The seam between the server and the language it evaluates.
//!
//! The server never inspects code: it reads forms, evaluates them, and
//! prints results through the [`Runtime`] trait. Everything an evaluation
//! may touch (session bindings, captured output, the request's stdin text,
//! the interrupt flag, the server control hooks) travels in an explicit
//! [`Context`] rather than in thread-local state.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::session::SessionState;
use crate::sink::OutputSink;

/// Printer toggles carried per session.
///
/// `detail_on_error` selects between the short exception form and the full
/// cause trace written to the err stream when an evaluation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterOptions {
    pub pretty: bool,
    pub print_length: Option<usize>,
    pub print_level: Option<usize>,
    pub detail_on_error: bool,
}

impl Default for PrinterOptions {
    fn default() -> Self {
        Self {
            pretty: false,
            print_length: None,
            print_level: None,
            detail_on_error: false,
        }
    }
}

/// Server operations reachable from evaluated code.
///
/// Interrupt, session retention, and ack delivery are all invoked as
/// evaluated one-liners rather than dedicated message kinds, so the
/// evaluator needs a narrow path back into the server.
pub trait ControlHooks: Send + Sync {
    /// Set the interrupt flag of the in-flight request with this id.
    /// Returns whether such a request was pending.
    fn interrupt(&self, request_id: &str) -> bool;

    /// Install the current session in the session store and return its id.
    /// Passing the id of an already-retained session returns it unchanged.
    fn retain_session(&self, existing_id: Option<&str>) -> String;

    /// Remove a retained session from the store. Returns whether it was
    /// present.
    fn release_session(&self, id: &str) -> bool;

    /// Fulfil this server's ack promise with a peer server's bound port.
    fn deliver_ack(&self, port: u16);
}

/// A cursor over the request's `in` text, standing in for stdin so that
/// code reading input never blocks on the network.
#[derive(Debug, Clone)]
pub struct StrInput {
    text: String,
    pos: usize,
}

impl StrInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            pos: 0,
        }
    }

    /// The next line, without its terminator. `None` once the text is
    /// exhausted.
    pub fn read_line(&mut self) -> Option<String> {
        if self.pos >= self.text.len() {
            return None;
        }
        let rest = &self.text[self.pos..];
        match rest.find('\n') {
            Some(idx) => {
                self.pos += idx + 1;
                Some(rest[..idx].to_string())
            }
            None => {
                self.pos = self.text.len();
                Some(rest.to_string())
            }
        }
    }
}

/// Everything one evaluation may touch.
pub struct Context<'s, R: Runtime> {
    /// The working session bindings: namespace, `v1`/`v2`/`v3`, the last
    /// exception, printer options, and the runtime's environment.
    pub session: &'s mut SessionState<R>,
    /// Reader over the request's `in` text.
    pub stdin: StrInput,
    /// Captured stdout; flushed chunks become `out` responses.
    pub out: OutputSink,
    /// Captured stderr; flushed chunks become `err` responses.
    pub err: OutputSink,
    /// The request's interrupt flag. Long-running operations poll it at
    /// their blocking points and raise the runtime's interrupt signal.
    pub interrupt: Arc<AtomicBool>,
    /// Path back into the server for the evaluated one-liners.
    pub hooks: Arc<dyn ControlHooks>,
}

/// A language runtime the server can drive.
///
/// The four operations mirror what the driver needs and nothing more: a
/// reader that yields one top-level form at a time, an evaluator for a
/// single form, a printer for results, and a trace formatter for
/// exceptions.
pub trait Runtime: Send + Sync + Sized + 'static {
    /// One parsed top-level form.
    type Form: Send;
    /// An evaluation result.
    type Value: Clone + Send + Sync + 'static;
    /// An evaluation (or read) failure.
    type Exception: Clone + Send + Sync + 'static;
    /// The mutable environment `def`-style bindings live in.
    type Env: Default + Clone + Send + 'static;

    /// Parse the next top-level form from `source`, advancing `pos`.
    /// `Ok(None)` at end of input.
    fn next_form(
        &self,
        source: &str,
        pos: &mut usize,
    ) -> std::result::Result<Option<Self::Form>, Self::Exception>;

    /// Evaluate one form under the given context.
    fn eval(
        &self,
        ctx: &mut Context<'_, Self>,
        form: Self::Form,
    ) -> std::result::Result<Self::Value, Self::Exception>;

    /// Print a result readably; honors the pretty toggle when the runtime
    /// has a pretty printer.
    fn print_value(&self, value: &Self::Value, options: &PrinterOptions) -> String;

    /// Render an exception: the short form, or the full cause trace when
    /// `detail` is set.
    fn format_trace(&self, exception: &Self::Exception, detail: bool) -> String;

    /// Whether this exception is the cooperative interrupt signal rather
    /// than an ordinary evaluation error.
    fn is_interrupt(&self, exception: &Self::Exception) -> bool;

    /// The namespace fresh sessions start in.
    fn initial_ns(&self) -> &str {
        "user"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_input_lines() {
        let mut input = StrInput::new("one\ntwo\nthree");
        assert_eq!(input.read_line().as_deref(), Some("one"));
        assert_eq!(input.read_line().as_deref(), Some("two"));
        assert_eq!(input.read_line().as_deref(), Some("three"));
        assert_eq!(input.read_line(), None);
    }

    #[test]
    fn test_str_input_empty() {
        let mut input = StrInput::new("");
        assert_eq!(input.read_line(), None);
    }

    #[test]
    fn test_str_input_trailing_newline() {
        let mut input = StrInput::new("line\n");
        assert_eq!(input.read_line().as_deref(), Some("line"));
        assert_eq!(input.read_line(), None);
    }
}
