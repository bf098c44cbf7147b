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

//! Printers for runtime values.
//!
//! `print` is the readable printer responses carry; it honors the
//! session's `print-length`/`print-level` truncation and, when the pretty
//! toggle is on, breaks wide collections across indented lines. `print_plain`
//! is the display form used by `str` and `print`: strings unquoted.

use super::{FnVal, Val};
use crate::runtime::PrinterOptions;

/// Line width beyond which the pretty printer goes multi-line.
const PRETTY_WIDTH: usize = 60;

pub(crate) fn print(val: &Val, options: &PrinterOptions) -> String {
    if options.pretty {
        pretty(val, options, 0)
    } else {
        readable(val, options, 0)
    }
}

/// Display form: strings print their contents, everything else readably.
pub(crate) fn print_plain(val: &Val) -> String {
    match val {
        Val::Str(s) => s.clone(),
        other => readable(other, &PrinterOptions::default(), 0),
    }
}

fn readable(val: &Val, options: &PrinterOptions, level: usize) -> String {
    match val {
        Val::Nil => "nil".to_string(),
        Val::Bool(b) => b.to_string(),
        Val::Int(n) => n.to_string(),
        Val::Str(s) => quote(s),
        Val::Sym(s) => s.clone(),
        Val::Keyword(k) => format!(":{}", k),
        Val::Fn(FnVal::Builtin(name)) => format!("#<builtin {}>", name),
        Val::Fn(FnVal::Closure(_)) => "#<fn>".to_string(),
        Val::List(items) => seq("(", ")", items, options, level),
        Val::Vector(items) => seq("[", "]", items, options, level),
        Val::Map(pairs) => {
            if exceeds_level(options, level) {
                return "#".to_string();
            }
            let mut parts = Vec::new();
            for (i, (k, v)) in pairs.iter().enumerate() {
                if truncated(options, i) {
                    parts.push("...".to_string());
                    break;
                }
                parts.push(format!(
                    "{} {}",
                    readable(k, options, level + 1),
                    readable(v, options, level + 1)
                ));
            }
            format!("{{{}}}", parts.join(" "))
        }
    }
}

fn seq(open: &str, close: &str, items: &[Val], options: &PrinterOptions, level: usize) -> String {
    if exceeds_level(options, level) {
        return "#".to_string();
    }
    let mut parts = Vec::new();
    for (i, item) in items.iter().enumerate() {
        if truncated(options, i) {
            parts.push("...".to_string());
            break;
        }
        parts.push(readable(item, options, level + 1));
    }
    format!("{}{}{}", open, parts.join(" "), close)
}

fn exceeds_level(options: &PrinterOptions, level: usize) -> bool {
    matches!(options.print_level, Some(max) if level >= max)
}

fn truncated(options: &PrinterOptions, index: usize) -> bool {
    matches!(options.print_length, Some(max) if index >= max)
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Pretty mode: short forms stay inline, wide collections break one item
/// per line, indented two spaces per depth.
fn pretty(val: &Val, options: &PrinterOptions, indent: usize) -> String {
    let inline = readable(val, options, 0);
    if inline.len() <= PRETTY_WIDTH {
        return inline;
    }
    let pad = "  ".repeat(indent + 1);
    match val {
        Val::List(items) => pretty_seq("(", ")", items, options, indent, &pad),
        Val::Vector(items) => pretty_seq("[", "]", items, options, indent, &pad),
        Val::Map(pairs) => {
            let body = pairs
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}{} {}",
                        pad,
                        pretty(k, options, indent + 1),
                        pretty(v, options, indent + 1)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("{{\n{}\n{}}}", body, "  ".repeat(indent))
        }
        _ => inline,
    }
}

fn pretty_seq(
    open: &str,
    close: &str,
    items: &[Val],
    options: &PrinterOptions,
    indent: usize,
    pad: &str,
) -> String {
    let body = items
        .iter()
        .map(|item| format!("{}{}", pad, pretty(item, options, indent + 1)))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{}\n{}\n{}{}", open, body, "  ".repeat(indent), close)
}
