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

//! The bundled reference runtime: a small Lisp.
//!
//! Enough language to make the server real: namespaced `def` bindings,
//! closures, arithmetic, printing, stdin, a cooperative `sleep`, plus the
//! control one-liners (`interrupt`, `retain-session`, `release-session`,
//! `deliver-ack`) that reach the server through [`ControlHooks`].
//!
//! [`ControlHooks`]: crate::runtime::ControlHooks

mod eval;
mod printer;
mod reader;

use std::collections::HashMap;
use std::sync::Arc;

use crate::runtime::{Context, PrinterOptions, Runtime};

/// A runtime value. Forms and values share this representation; the reader
/// produces it and the evaluator consumes and returns it.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Sym(String),
    Keyword(String),
    List(Vec<Val>),
    Vector(Vec<Val>),
    Map(Vec<(Val, Val)>),
    Fn(FnVal),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FnVal {
    Builtin(&'static str),
    Closure(Arc<Closure>),
}

/// A `fn` form closed over the lexical bindings at its creation site.
#[derive(Debug, PartialEq)]
pub struct Closure {
    pub params: Vec<String>,
    pub body: Vec<Val>,
    pub captured: Vec<(String, Val)>,
}

/// An evaluation (or read) failure, with an optional cause chain.
#[derive(Debug, Clone)]
pub struct Exception {
    message: String,
    cause: Option<Box<Exception>>,
    interrupt: bool,
}

impl Exception {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            interrupt: false,
        }
    }

    pub fn with_cause(message: impl Into<String>, cause: Exception) -> Self {
        Self {
            message: message.into(),
            cause: Some(Box::new(cause)),
            interrupt: false,
        }
    }

    /// The cooperative interrupt signal raised at blocking points once the
    /// request's flag is set.
    pub(crate) fn interrupted() -> Self {
        Self {
            message: "Evaluation interrupted".to_string(),
            cause: None,
            interrupt: true,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_interrupt(&self) -> bool {
        self.interrupt
    }

    /// The short form, or the full cause trace when `detail` is set.
    pub fn render(&self, detail: bool) -> String {
        if !detail {
            return self.message.clone();
        }
        let mut out = self.message.clone();
        let mut cause = self.cause.as_deref();
        while let Some(c) = cause {
            out.push_str("\ncaused by: ");
            out.push_str(&c.message);
            cause = c.cause.as_deref();
        }
        out
    }
}

/// Namespaced global bindings. Cheap to clone; the driver snapshots it per
/// request and writes it back.
#[derive(Debug, Clone, Default)]
pub struct Env {
    namespaces: HashMap<String, HashMap<String, Val>>,
}

impl Env {
    pub fn define(&mut self, ns: &str, name: &str, value: Val) {
        self.namespaces
            .entry(ns.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn get(&self, ns: &str, name: &str) -> Option<&Val> {
        self.namespaces.get(ns)?.get(name)
    }
}

/// The bundled interpreter.
#[derive(Debug, Default)]
pub struct Interp;

impl Interp {
    pub fn new() -> Self {
        Self
    }
}

impl Runtime for Interp {
    type Form = Val;
    type Value = Val;
    type Exception = Exception;
    type Env = Env;

    fn next_form(
        &self,
        source: &str,
        pos: &mut usize,
    ) -> Result<Option<Val>, Exception> {
        reader::read_form(source, pos)
    }

    fn eval(&self, ctx: &mut Context<'_, Self>, form: Val) -> Result<Val, Exception> {
        eval::eval_form(ctx, &form)
    }

    fn print_value(&self, value: &Val, options: &PrinterOptions) -> String {
        printer::print(value, options)
    }

    fn format_trace(&self, exception: &Exception, detail: bool) -> String {
        exception.render(detail)
    }

    fn is_interrupt(&self, exception: &Exception) -> bool {
        exception.is_interrupt()
    }
}
