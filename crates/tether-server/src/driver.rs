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

//! The evaluator driver: a read-eval-print loop over one request.
//!
//! The driver works on a snapshot of the session state and writes the
//! whole state back when it finishes. Concurrent requests against the same
//! retained session therefore race with last-writer-wins semantics on the
//! session fields rather than blocking each other, which also lets the
//! interrupt one-liner evaluate while its target is still running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tether_proto::{key, status, Message};

use crate::runtime::{Context, ControlHooks, Runtime, StrInput};
use crate::session::{lock_session, SessionHandle};
use crate::sink::{OutputSink, StreamKey};
use crate::worker::Responder;

/// How one evaluation ended. The driver never emits a terminal status; the
/// supervisor maps this outcome onto one.
pub(crate) enum DriverOutcome {
    Completed,
    Interrupted,
    Failed(String),
}

pub(crate) fn run_request<R: Runtime>(
    runtime: &R,
    session: &SessionHandle<R>,
    request: &Message,
    responder: &Responder,
    hooks: Arc<dyn ControlHooks>,
    interrupt: Arc<AtomicBool>,
) -> DriverOutcome {
    let code = match request.code() {
        Some(code) => code,
        None => return DriverOutcome::Failed("request has no code".to_string()),
    };

    let mut work = lock_session(session).clone();
    if let Some(ns) = request.ns() {
        work.ns = ns.to_string();
    }

    let out = OutputSink::new(StreamKey::Out, responder.clone());
    let err = OutputSink::new(StreamKey::Err, responder.clone());

    let outcome = {
        let mut ctx = Context {
            session: &mut work,
            stdin: StrInput::new(request.input().unwrap_or("")),
            out: out.clone(),
            err: err.clone(),
            interrupt: Arc::clone(&interrupt),
            hooks,
        };

        let mut pos = 0;
        loop {
            if interrupt.load(Ordering::SeqCst) {
                break DriverOutcome::Interrupted;
            }
            let form = match runtime.next_form(code, &mut pos) {
                Ok(Some(form)) => form,
                Ok(None) => break DriverOutcome::Completed,
                Err(e) => {
                    // A reader error poisons the rest of the source; report
                    // it like an evaluation error and stop reading.
                    report_exception(runtime, &mut ctx, responder, e);
                    break DriverOutcome::Completed;
                }
            };
            match runtime.eval(&mut ctx, form) {
                Ok(value) => {
                    let printed = runtime.print_value(&value, &ctx.session.printer);
                    responder.send(
                        Message::new()
                            .with(key::VALUE, printed)
                            .with(key::NS, ctx.session.ns.as_str()),
                    );
                    ctx.session.v3 = ctx.session.v2.take();
                    ctx.session.v2 = ctx.session.v1.take();
                    ctx.session.v1 = Some(value);
                    // Side-effect output lands before the next value.
                    ctx.out.flush();
                    ctx.err.flush();
                }
                Err(e) if runtime.is_interrupt(&e) => break DriverOutcome::Interrupted,
                Err(e) => {
                    report_exception(runtime, &mut ctx, responder, e);
                }
            }
        }
    };

    out.flush();
    err.flush();
    *lock_session(session) = work;
    outcome
}

/// Record the exception on the session, write its trace to the err stream,
/// and emit the non-terminal `error` status. The top-level loop recovers
/// form by form, so evaluation continues afterwards.
fn report_exception<R: Runtime>(
    runtime: &R,
    ctx: &mut Context<'_, R>,
    responder: &Responder,
    exception: R::Exception,
) {
    let mut trace = runtime.format_trace(&exception, ctx.session.printer.detail_on_error);
    if !trace.ends_with('\n') {
        trace.push('\n');
    }
    ctx.err.write(&trace);
    ctx.session.last_exception = Some(exception);
    ctx.out.flush();
    ctx.err.flush();
    responder.send(Message::new().with(key::STATUS, status::ERROR));
}
