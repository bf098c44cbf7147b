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

//! Evaluator for the bundled runtime.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::printer;
use super::{Closure, Exception, FnVal, Interp, Val};
use crate::runtime::Context;

/// Closure application depth limit; deeper recursion raises instead of
/// overflowing the worker's stack.
const MAX_DEPTH: usize = 512;

/// Names resolvable without a `def`.
const BUILTINS: &[&str] = &[
    "+",
    "-",
    "*",
    "/",
    "=",
    "<",
    ">",
    "str",
    "print",
    "println",
    "eprintln",
    "read-line",
    "sleep",
    "throw",
    "set-option!",
    "interrupt",
    "retain-session",
    "release-session",
    "deliver-ack",
];

pub(crate) fn eval_form(ctx: &mut Context<'_, Interp>, form: &Val) -> Result<Val, Exception> {
    let mut scope = Scope {
        bindings: Vec::new(),
        depth: 0,
    };
    eval(ctx, &mut scope, form)
}

/// Lexical bindings: `let` and `fn` parameters. Global `def` bindings live
/// on the session environment instead.
struct Scope {
    bindings: Vec<(String, Val)>,
    depth: usize,
}

fn eval(ctx: &mut Context<'_, Interp>, scope: &mut Scope, form: &Val) -> Result<Val, Exception> {
    match form {
        Val::Sym(name) => resolve(ctx, scope, name),
        Val::List(items) if items.is_empty() => Ok(Val::List(Vec::new())),
        Val::List(items) => eval_list(ctx, scope, items),
        Val::Vector(items) => {
            let evaluated = items
                .iter()
                .map(|item| eval(ctx, scope, item))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Val::Vector(evaluated))
        }
        Val::Map(pairs) => {
            let mut evaluated = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                evaluated.push((eval(ctx, scope, k)?, eval(ctx, scope, v)?));
            }
            Ok(Val::Map(evaluated))
        }
        other => Ok(other.clone()),
    }
}

fn resolve(ctx: &Context<'_, Interp>, scope: &Scope, name: &str) -> Result<Val, Exception> {
    if let Some((_, value)) = scope.bindings.iter().rev().find(|(n, _)| n == name) {
        return Ok(value.clone());
    }
    // REPL history: the last three printed values and the last exception.
    match name {
        "*1" => return Ok(ctx.session.v1.clone().unwrap_or(Val::Nil)),
        "*2" => return Ok(ctx.session.v2.clone().unwrap_or(Val::Nil)),
        "*3" => return Ok(ctx.session.v3.clone().unwrap_or(Val::Nil)),
        "*e" => {
            return Ok(ctx
                .session
                .last_exception
                .as_ref()
                .map(|e| Val::Str(e.render(true)))
                .unwrap_or(Val::Nil))
        }
        _ => {}
    }
    if let Some(value) = ctx.session.env.get(&ctx.session.ns, name) {
        return Ok(value.clone());
    }
    if let Some(builtin) = BUILTINS.iter().copied().find(|b| *b == name) {
        return Ok(Val::Fn(FnVal::Builtin(builtin)));
    }
    if let Some((ns, unqualified)) = name.split_once('/') {
        if !ns.is_empty() && !unqualified.is_empty() {
            if let Some(value) = ctx.session.env.get(ns, unqualified) {
                return Ok(value.clone());
            }
        }
    }
    Err(Exception::new(format!("Unable to resolve symbol: {}", name)))
}

fn eval_list(
    ctx: &mut Context<'_, Interp>,
    scope: &mut Scope,
    items: &[Val],
) -> Result<Val, Exception> {
    if let Val::Sym(head) = &items[0] {
        match head.as_str() {
            "def" => return special_def(ctx, scope, items),
            "quote" => {
                expect_arity("quote", items, 1)?;
                return Ok(items[1].clone());
            }
            "if" => return special_if(ctx, scope, items),
            "do" => {
                let mut result = Val::Nil;
                for form in &items[1..] {
                    result = eval(ctx, scope, form)?;
                }
                return Ok(result);
            }
            "let" => return special_let(ctx, scope, items),
            "fn" => return special_fn(scope, items),
            "ns" => return special_ns(ctx, items),
            _ => {}
        }
    }

    let f = eval(ctx, scope, &items[0])?;
    let mut args = Vec::with_capacity(items.len() - 1);
    for arg in &items[1..] {
        args.push(eval(ctx, scope, arg)?);
    }
    apply(ctx, scope, f, args)
}

fn special_def(
    ctx: &mut Context<'_, Interp>,
    scope: &mut Scope,
    items: &[Val],
) -> Result<Val, Exception> {
    expect_arity("def", items, 2)?;
    let name = expect_sym(&items[1], "def")?;
    let value = eval(ctx, scope, &items[2])?;
    let ns = ctx.session.ns.clone();
    ctx.session.env.define(&ns, &name, value);
    Ok(Val::Sym(format!("#'{}/{}", ns, name)))
}

fn special_if(
    ctx: &mut Context<'_, Interp>,
    scope: &mut Scope,
    items: &[Val],
) -> Result<Val, Exception> {
    if items.len() != 3 && items.len() != 4 {
        return Err(Exception::new("if expects a test, a then, and an optional else"));
    }
    let test = eval(ctx, scope, &items[1])?;
    if truthy(&test) {
        eval(ctx, scope, &items[2])
    } else if items.len() == 4 {
        eval(ctx, scope, &items[3])
    } else {
        Ok(Val::Nil)
    }
}

fn special_let(
    ctx: &mut Context<'_, Interp>,
    scope: &mut Scope,
    items: &[Val],
) -> Result<Val, Exception> {
    if items.len() < 2 {
        return Err(Exception::new("let expects a binding vector"));
    }
    let bindings = match &items[1] {
        Val::Vector(b) if b.len() % 2 == 0 => b,
        _ => {
            return Err(Exception::new(
                "let expects an even number of binding forms",
            ))
        }
    };

    let saved = scope.bindings.len();
    for pair in bindings.chunks(2) {
        let name = expect_sym(&pair[0], "let")?;
        let value = match eval(ctx, scope, &pair[1]) {
            Ok(v) => v,
            Err(e) => {
                scope.bindings.truncate(saved);
                return Err(e);
            }
        };
        scope.bindings.push((name, value));
    }

    let mut result = Ok(Val::Nil);
    for form in &items[2..] {
        result = eval(ctx, scope, form);
        if result.is_err() {
            break;
        }
    }
    scope.bindings.truncate(saved);
    result
}

fn special_fn(scope: &Scope, items: &[Val]) -> Result<Val, Exception> {
    if items.len() < 2 {
        return Err(Exception::new("fn expects a parameter vector"));
    }
    let params = match &items[1] {
        Val::Vector(params) => params
            .iter()
            .map(|p| expect_sym(p, "fn"))
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(Exception::new("fn expects a parameter vector")),
    };
    Ok(Val::Fn(FnVal::Closure(Arc::new(Closure {
        params,
        body: items[2..].to_vec(),
        captured: scope.bindings.clone(),
    }))))
}

fn special_ns(ctx: &mut Context<'_, Interp>, items: &[Val]) -> Result<Val, Exception> {
    expect_arity("ns", items, 1)?;
    let name = expect_sym(&items[1], "ns")?;
    ctx.session.ns = name;
    Ok(Val::Nil)
}

fn apply(
    ctx: &mut Context<'_, Interp>,
    scope: &Scope,
    f: Val,
    args: Vec<Val>,
) -> Result<Val, Exception> {
    match f {
        Val::Fn(FnVal::Builtin(name)) => call_builtin(ctx, name, args),
        Val::Fn(FnVal::Closure(closure)) => {
            if args.len() != closure.params.len() {
                return Err(Exception::new(format!(
                    "wrong number of arguments: expected {}, got {}",
                    closure.params.len(),
                    args.len()
                )));
            }
            if scope.depth + 1 > MAX_DEPTH {
                return Err(Exception::new("stack overflow"));
            }
            let mut bindings = closure.captured.clone();
            bindings.extend(closure.params.iter().cloned().zip(args));
            let mut inner = Scope {
                bindings,
                depth: scope.depth + 1,
            };
            let mut result = Val::Nil;
            for form in &closure.body {
                result = eval(ctx, &mut inner, form)?;
            }
            Ok(result)
        }
        other => Err(Exception::new(format!(
            "{} is not a function",
            printer::print(&other, &Default::default())
        ))),
    }
}

fn call_builtin(
    ctx: &mut Context<'_, Interp>,
    name: &str,
    args: Vec<Val>,
) -> Result<Val, Exception> {
    match name {
        "+" => fold_ints(name, args, 0, |a, b| a.wrapping_add(b)),
        "*" => fold_ints(name, args, 1, |a, b| a.wrapping_mul(b)),
        "-" => {
            let ints = all_ints(name, &args)?;
            match ints.split_first() {
                None => Err(Exception::new("- expects at least one argument")),
                Some((first, [])) => Ok(Val::Int(first.wrapping_neg())),
                Some((first, rest)) => Ok(Val::Int(
                    rest.iter().fold(*first, |acc, n| acc.wrapping_sub(*n)),
                )),
            }
        }
        "/" => {
            let ints = all_ints(name, &args)?;
            match ints.split_first() {
                None => Err(Exception::new("/ expects at least one argument")),
                Some((first, rest)) => {
                    let mut acc = *first;
                    for n in rest {
                        if *n == 0 {
                            return Err(Exception::new("Divide by zero"));
                        }
                        acc = acc.wrapping_div(*n);
                    }
                    Ok(Val::Int(acc))
                }
            }
        }
        "=" => Ok(Val::Bool(args.windows(2).all(|w| w[0] == w[1]))),
        "<" => compare(name, &args, |a, b| a < b),
        ">" => compare(name, &args, |a, b| a > b),
        "str" => {
            let mut out = String::new();
            for arg in &args {
                out.push_str(&printer::print_plain(arg));
            }
            Ok(Val::Str(out))
        }
        "print" | "println" => {
            let text = join_plain(&args);
            ctx.out.write(&text);
            if name == "println" {
                ctx.out.write("\n");
            }
            Ok(Val::Nil)
        }
        "eprintln" => {
            let text = join_plain(&args);
            ctx.err.write(&text);
            ctx.err.write("\n");
            Ok(Val::Nil)
        }
        "read-line" => Ok(match ctx.stdin.read_line() {
            Some(line) => Val::Str(line),
            None => Val::Nil,
        }),
        "sleep" => {
            let ms = one_int(name, &args)?;
            let deadline = Instant::now() + Duration::from_millis(ms.max(0) as u64);
            // Chunked so the interrupt flag is observed promptly.
            loop {
                if ctx.interrupt.load(Ordering::SeqCst) {
                    return Err(Exception::interrupted());
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Val::Nil);
                }
                std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
            }
        }
        "throw" => {
            let message = match args.first() {
                Some(Val::Str(s)) => s.clone(),
                Some(other) => printer::print_plain(other),
                None => "thrown".to_string(),
            };
            match args.get(1) {
                Some(Val::Str(cause)) => Err(Exception::with_cause(
                    message,
                    Exception::new(cause.clone()),
                )),
                _ => Err(Exception::new(message)),
            }
        }
        "set-option!" => set_option(ctx, &args),
        "interrupt" => {
            let id = one_str(name, &args)?;
            Ok(Val::Bool(ctx.hooks.interrupt(&id)))
        }
        "retain-session" => {
            let hooks = Arc::clone(&ctx.hooks);
            let id = hooks.retain_session(ctx.session.id.as_deref());
            ctx.session.id = Some(id.clone());
            Ok(Val::Str(id))
        }
        "release-session" => match ctx.session.id.clone() {
            Some(id) => Ok(Val::Bool(ctx.hooks.release_session(&id))),
            None => Ok(Val::Bool(false)),
        },
        "deliver-ack" => {
            let port = one_int(name, &args)?;
            if !(0..=i64::from(u16::MAX)).contains(&port) {
                return Err(Exception::new("deliver-ack expects a port number"));
            }
            ctx.hooks.deliver_ack(port as u16);
            Ok(Val::Nil)
        }
        _ => Err(Exception::new(format!("unknown builtin: {}", name))),
    }
}

fn set_option(ctx: &mut Context<'_, Interp>, args: &[Val]) -> Result<Val, Exception> {
    let (option, value) = match args {
        [Val::Keyword(k), v] => (k.as_str(), v),
        _ => {
            return Err(Exception::new(
                "set-option! expects an option keyword and a value",
            ))
        }
    };
    let printer = &mut ctx.session.printer;
    match (option, value) {
        ("pretty", Val::Bool(b)) => printer.pretty = *b,
        ("detail-on-error", Val::Bool(b)) => printer.detail_on_error = *b,
        ("print-length", Val::Int(n)) if *n >= 0 => printer.print_length = Some(*n as usize),
        ("print-length", Val::Nil) => printer.print_length = None,
        ("print-level", Val::Int(n)) if *n >= 0 => printer.print_level = Some(*n as usize),
        ("print-level", Val::Nil) => printer.print_level = None,
        _ => {
            return Err(Exception::new(format!(
                "unsupported option: :{} {}",
                option,
                printer::print_plain(value)
            )))
        }
    }
    Ok(Val::Nil)
}

fn truthy(v: &Val) -> bool {
    !matches!(v, Val::Nil | Val::Bool(false))
}

fn expect_arity(name: &str, items: &[Val], arity: usize) -> Result<(), Exception> {
    if items.len() != arity + 1 {
        return Err(Exception::new(format!(
            "{} expects {} argument{}",
            name,
            arity,
            if arity == 1 { "" } else { "s" }
        )));
    }
    Ok(())
}

fn expect_sym(form: &Val, who: &str) -> Result<String, Exception> {
    match form {
        Val::Sym(name) => Ok(name.clone()),
        other => Err(Exception::new(format!(
            "{} expects a symbol, got {}",
            who,
            printer::print_plain(other)
        ))),
    }
}

fn all_ints(name: &str, args: &[Val]) -> Result<Vec<i64>, Exception> {
    args.iter()
        .map(|v| match v {
            Val::Int(n) => Ok(*n),
            other => Err(Exception::new(format!(
                "{} expects integer arguments, got {}",
                name,
                printer::print_plain(other)
            ))),
        })
        .collect()
}

fn fold_ints(
    name: &str,
    args: Vec<Val>,
    init: i64,
    op: impl Fn(i64, i64) -> i64,
) -> Result<Val, Exception> {
    let ints = all_ints(name, &args)?;
    Ok(Val::Int(ints.into_iter().fold(init, op)))
}

fn compare(name: &str, args: &[Val], op: impl Fn(i64, i64) -> bool) -> Result<Val, Exception> {
    let ints = all_ints(name, args)?;
    Ok(Val::Bool(ints.windows(2).all(|w| op(w[0], w[1]))))
}

fn one_int(name: &str, args: &[Val]) -> Result<i64, Exception> {
    match args {
        [Val::Int(n)] => Ok(*n),
        _ => Err(Exception::new(format!("{} expects one integer", name))),
    }
}

fn one_str(name: &str, args: &[Val]) -> Result<String, Exception> {
    match args {
        [Val::Str(s)] => Ok(s.clone()),
        _ => Err(Exception::new(format!("{} expects one string", name))),
    }
}

fn join_plain(args: &[Val]) -> String {
    args.iter()
        .map(printer::print_plain)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ControlHooks, StrInput};
    use crate::session::SessionState;
    use crate::sink::{OutputSink, StreamKey};
    use crate::worker::Responder;
    use std::sync::atomic::AtomicBool;
    use tether_proto::Message;
    use tokio::sync::mpsc;

    struct NoHooks;

    impl ControlHooks for NoHooks {
        fn interrupt(&self, _request_id: &str) -> bool {
            false
        }
        fn retain_session(&self, existing_id: Option<&str>) -> String {
            existing_id.unwrap_or("fresh-id").to_string()
        }
        fn release_session(&self, _id: &str) -> bool {
            true
        }
        fn deliver_ack(&self, _port: u16) {}
    }

    struct Fixture {
        state: SessionState<Interp>,
        rx: mpsc::UnboundedReceiver<Message>,
        out: OutputSink,
        err: OutputSink,
        interrupt: Arc<AtomicBool>,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let interrupt = Arc::new(AtomicBool::new(false));
            let responder = Responder::new("t".to_string(), Arc::clone(&interrupt), tx);
            Fixture {
                state: SessionState::new("user"),
                rx,
                out: OutputSink::new(StreamKey::Out, responder.clone()),
                err: OutputSink::new(StreamKey::Err, responder),
                interrupt,
            }
        }

        fn eval(&mut self, source: &str) -> Result<Val, Exception> {
            self.eval_with_input(source, "")
        }

        fn eval_with_input(&mut self, source: &str, input: &str) -> Result<Val, Exception> {
            let mut ctx = Context {
                session: &mut self.state,
                stdin: StrInput::new(input),
                out: self.out.clone(),
                err: self.err.clone(),
                interrupt: Arc::clone(&self.interrupt),
                hooks: Arc::new(NoHooks),
            };
            let mut result = Val::Nil;
            let mut pos = 0;
            while let Some(form) = super::super::reader::read_form(source, &mut pos)? {
                result = eval_form(&mut ctx, &form)?;
            }
            Ok(result)
        }

        fn captured_out(&mut self) -> String {
            self.out.flush();
            let mut text = String::new();
            while let Ok(msg) = self.rx.try_recv() {
                if let Some(chunk) = msg.out() {
                    text.push_str(chunk);
                }
            }
            text
        }
    }

    #[test]
    fn test_arithmetic() {
        let mut fx = Fixture::new();
        assert_eq!(fx.eval("(+ 1 2 3)").unwrap(), Val::Int(6));
        assert_eq!(fx.eval("(- 10 3 2)").unwrap(), Val::Int(5));
        assert_eq!(fx.eval("(- 4)").unwrap(), Val::Int(-4));
        assert_eq!(fx.eval("(* 2 3 4)").unwrap(), Val::Int(24));
        assert_eq!(fx.eval("(/ 12 3 2)").unwrap(), Val::Int(2));
    }

    #[test]
    fn test_divide_by_zero_raises() {
        let mut fx = Fixture::new();
        let err = fx.eval("(/ 1 0)").unwrap_err();
        assert_eq!(err.message(), "Divide by zero");
        assert!(!err.is_interrupt());
    }

    #[test]
    fn test_comparisons_and_equality() {
        let mut fx = Fixture::new();
        assert_eq!(fx.eval("(< 1 2 3)").unwrap(), Val::Bool(true));
        assert_eq!(fx.eval("(> 3 1)").unwrap(), Val::Bool(true));
        assert_eq!(fx.eval("(= 2 2 2)").unwrap(), Val::Bool(true));
        assert_eq!(fx.eval("(= 1 2)").unwrap(), Val::Bool(false));
    }

    #[test]
    fn test_def_and_resolution() {
        let mut fx = Fixture::new();
        let var = fx.eval("(def x 41)").unwrap();
        assert_eq!(var, Val::Sym("#'user/x".to_string()));
        assert_eq!(fx.eval("(+ x 1)").unwrap(), Val::Int(42));
    }

    #[test]
    fn test_ns_isolates_and_qualifies() {
        let mut fx = Fixture::new();
        fx.eval("(def x 1)").unwrap();
        fx.eval("(ns other)").unwrap();
        assert_eq!(fx.state.ns, "other");
        assert!(fx.eval("x").is_err(), "x is not defined in other");
        assert_eq!(fx.eval("user/x").unwrap(), Val::Int(1));
    }

    #[test]
    fn test_let_scoping() {
        let mut fx = Fixture::new();
        assert_eq!(fx.eval("(let [a 1 b (+ a 1)] (+ a b))").unwrap(), Val::Int(3));
        assert!(fx.eval("a").is_err(), "let bindings do not leak");
    }

    #[test]
    fn test_closures_capture_lexically() {
        let mut fx = Fixture::new();
        fx.eval("(def add (let [n 10] (fn [x] (+ x n))))").unwrap();
        assert_eq!(fx.eval("(add 5)").unwrap(), Val::Int(15));
    }

    #[test]
    fn test_recursion_via_def() {
        let mut fx = Fixture::new();
        fx.eval("(def fact (fn [n] (if (< n 2) 1 (* n (fact (- n 1))))))")
            .unwrap();
        assert_eq!(fx.eval("(fact 10)").unwrap(), Val::Int(3_628_800));
    }

    #[test]
    fn test_runaway_recursion_raises() {
        let mut fx = Fixture::new();
        fx.eval("(def spin (fn [n] (spin (+ n 1))))").unwrap();
        let err = fx.eval("(spin 0)").unwrap_err();
        assert_eq!(err.message(), "stack overflow");
    }

    #[test]
    fn test_if_and_truthiness() {
        let mut fx = Fixture::new();
        assert_eq!(fx.eval("(if true 1 2)").unwrap(), Val::Int(1));
        assert_eq!(fx.eval("(if nil 1 2)").unwrap(), Val::Int(2));
        assert_eq!(fx.eval("(if 0 1 2)").unwrap(), Val::Int(1), "0 is truthy");
        assert_eq!(fx.eval("(if false 1)").unwrap(), Val::Nil);
    }

    #[test]
    fn test_print_writes_to_out_sink() {
        let mut fx = Fixture::new();
        fx.eval("(print \"hi\")").unwrap();
        fx.eval("(println \"there\")").unwrap();
        assert_eq!(fx.captured_out(), "hithere\n");
    }

    #[test]
    fn test_str_concatenates_plainly() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.eval("(str \"a\" 1 :k nil)").unwrap(),
            Val::Str("a1:k".to_string())
        );
    }

    #[test]
    fn test_read_line_from_request_input() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.eval_with_input("(read-line)", "first\nsecond\n").unwrap(),
            Val::Str("first".to_string())
        );
        assert_eq!(fx.eval("(read-line)").unwrap(), Val::Nil);
    }

    #[test]
    fn test_sleep_raises_interrupt_when_flag_set() {
        let mut fx = Fixture::new();
        fx.interrupt.store(true, Ordering::SeqCst);
        let err = fx.eval("(sleep 60000)").unwrap_err();
        assert!(err.is_interrupt());
    }

    #[test]
    fn test_throw_with_cause_chain() {
        let mut fx = Fixture::new();
        let err = fx.eval("(throw \"outer\" \"inner\")").unwrap_err();
        assert_eq!(err.render(true), "outer\ncaused by: inner");
    }

    #[test]
    fn test_set_option_updates_printer() {
        let mut fx = Fixture::new();
        fx.eval("(set-option! :pretty true)").unwrap();
        fx.eval("(set-option! :print-length 4)").unwrap();
        assert!(fx.state.printer.pretty);
        assert_eq!(fx.state.printer.print_length, Some(4));

        fx.eval("(set-option! :print-length nil)").unwrap();
        assert_eq!(fx.state.printer.print_length, None);

        assert!(fx.eval("(set-option! :bogus 1)").is_err());
    }

    #[test]
    fn test_retain_session_records_id() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.eval("(retain-session)").unwrap(),
            Val::Str("fresh-id".to_string())
        );
        assert_eq!(fx.state.id.as_deref(), Some("fresh-id"));
        // Second retain sticks with the recorded id
        assert_eq!(
            fx.eval("(retain-session)").unwrap(),
            Val::Str("fresh-id".to_string())
        );
    }

    #[test]
    fn test_history_symbols_resolve() {
        let mut fx = Fixture::new();
        fx.state.v1 = Some(Val::Int(3));
        fx.state.v2 = Some(Val::Int(2));
        assert_eq!(fx.eval("(+ *1 *2)").unwrap(), Val::Int(5));
        assert_eq!(fx.eval("*3").unwrap(), Val::Nil);

        fx.state.last_exception = Some(Exception::new("boom"));
        assert_eq!(fx.eval("*e").unwrap(), Val::Str("boom".to_string()));
    }

    #[test]
    fn test_quote_and_collections() {
        let mut fx = Fixture::new();
        assert_eq!(
            fx.eval("'(1 2)").unwrap(),
            Val::List(vec![Val::Int(1), Val::Int(2)])
        );
        assert_eq!(
            fx.eval("[(+ 1 1) 3]").unwrap(),
            Val::Vector(vec![Val::Int(2), Val::Int(3)])
        );
        assert_eq!(
            fx.eval("{:a (+ 1 1)}").unwrap(),
            Val::Map(vec![(Val::Keyword("a".to_string()), Val::Int(2))])
        );
    }

    #[test]
    fn test_calling_non_function_raises() {
        let mut fx = Fixture::new();
        let err = fx.eval("(1 2)").unwrap_err();
        assert!(err.message().contains("is not a function"));
    }
}
