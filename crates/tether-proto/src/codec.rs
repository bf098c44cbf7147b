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

/// Textual codec for tether messages
///
/// A message with N key/value pairs is framed as a decimal count token
/// followed by 2*N readable tokens, whitespace separated:
///
/// ```text
/// 3
/// id "e1b2"
/// code "(+ 1 2)"
/// timeout 60000
/// ```
///
/// Keys are printed as bare symbols; strings are quoted with the standard
/// escapes; integers, booleans and `nil` print bare; lists print `( ... )`
/// and maps `{ k v ... }`. Decoding reads one token for the count, then
/// `2 * count` tokens, zipping them into a map. Key tokens are coerced to
/// the key kind whether they were emitted as symbols or strings.
use std::collections::BTreeMap;
use std::fmt::Write as _;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, Result};
use crate::message::Message;
use crate::value::{write_quoted, Value};

/// Maximum size for a single encoded message (10MB)
/// This prevents OOM from a peer sending unbounded data for one frame.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Maximum number of key/value pairs in one message.
const MAX_PAIRS: usize = 65_536;

/// Encode a message into its wire form.
///
/// The output always ends with a newline, so every bare token is followed
/// by a delimiter and the stream can be decoded incrementally.
pub fn encode(msg: &Message) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", msg.len());
    for (k, v) in msg.iter() {
        out.push_str(k);
        out.push(' ');
        match v {
            Value::Str(s) => write_quoted(&mut out, s),
            other => {
                let _ = write!(out, "{}", other);
            }
        }
        out.push('\n');
    }
    out
}

/// Decode one message from the front of `buf`.
///
/// Returns `Ok(Some((message, consumed)))` on success, `Ok(None)` when the
/// buffer ends mid-message (read more bytes and retry), and `Err` on a
/// framing error. `consumed` is the number of bytes the message occupied;
/// callers drain that many and keep the rest for the next decode.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>> {
    let src = match std::str::from_utf8(buf) {
        Ok(s) => s,
        // A multi-byte sequence split at the buffer edge is not an error;
        // parse the valid prefix and let the caller read the rest.
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&buf[..e.valid_up_to()])
            .map_err(|_| ProtoError::framing("invalid UTF-8 in stream", 0))?,
        Err(e) => {
            return Err(ProtoError::framing(
                "invalid UTF-8 in stream",
                e.valid_up_to(),
            ))
        }
    };

    let mut p = Parser::new(src, false);
    let count = match p.parse_value()? {
        None => return Ok(None),
        Some(Value::Int(n)) if (0..=MAX_PAIRS as i64).contains(&n) => n as usize,
        Some(other) => {
            return Err(ProtoError::framing(
                format!("malformed message count: {}", other),
                p.pos,
            ))
        }
    };

    let mut fields = BTreeMap::new();
    for _ in 0..count {
        let key = match p.parse_value()? {
            None => return Ok(None),
            Some(v) => coerce_key(v, p.pos)?,
        };
        let value = match p.parse_value()? {
            None => return Ok(None),
            Some(v) => v,
        };
        fields.insert(key, value);
    }

    // Consume the message's trailing separator so the reported length
    // covers the whole frame.
    p.skip_whitespace();
    Ok(Some((Message::from_map(fields), p.pos)))
}

/// Parse a single readable value from a complete string.
///
/// Used for reading a response's printed `value` field back into data.
/// Unlike [`decode`], the input is taken to be complete: an unterminated
/// form is an error, not a request for more bytes.
pub fn read_value(input: &str) -> Result<Value> {
    let mut p = Parser::new(input, true);
    let value = p
        .parse_value()?
        .ok_or_else(|| ProtoError::framing("unexpected end of input", input.len()))?;
    p.skip_whitespace();
    if p.pos < p.src.len() {
        return Err(ProtoError::framing("trailing input after value", p.pos));
    }
    Ok(value)
}

/// Every key token is coerced to the key kind, whether it was emitted as a
/// bare symbol, a keyword-style symbol, or a quoted string.
fn coerce_key(v: Value, pos: usize) -> Result<String> {
    match v {
        Value::Sym(s) => Ok(s.strip_prefix(':').unwrap_or(&s).to_string()),
        Value::Str(s) => Ok(s),
        other => Err(ProtoError::framing(
            format!("message key must be a symbol or string, got {}", other),
            pos,
        )),
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    /// When true the input is complete: end-of-input delimits bare tokens
    /// and an unterminated string or collection is a framing error rather
    /// than an incomplete message.
    complete: bool,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, complete: bool) -> Self {
        Self {
            src,
            pos: 0,
            complete,
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self, c: char) {
        self.pos += c.len_utf8();
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump(c);
            } else {
                break;
            }
        }
    }

    fn incomplete<T>(&self, what: &str) -> Result<Option<T>> {
        if self.complete {
            Err(ProtoError::framing(format!("unterminated {}", what), self.pos))
        } else {
            Ok(None)
        }
    }

    fn parse_value(&mut self) -> Result<Option<Value>> {
        self.skip_whitespace();
        match self.peek() {
            None => self.incomplete("value"),
            Some('(') => self.parse_seq('(', ')'),
            Some('[') => self.parse_seq('[', ']'),
            Some('{') => self.parse_map(),
            Some('"') => self.parse_string(),
            Some(c @ (')' | ']' | '}')) => Err(ProtoError::framing(
                format!("unexpected '{}'", c),
                self.pos,
            )),
            Some(_) => self.parse_bare(),
        }
    }

    fn parse_string(&mut self) -> Result<Option<Value>> {
        self.bump('"');
        let mut out = String::new();
        loop {
            let c = match self.peek() {
                None => return self.incomplete("string"),
                Some(c) => c,
            };
            self.bump(c);
            match c {
                '"' => return Ok(Some(Value::Str(out))),
                '\\' => {
                    let esc = match self.peek() {
                        None => return self.incomplete("string"),
                        Some(e) => e,
                    };
                    self.bump(esc);
                    match esc {
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        other => {
                            return Err(ProtoError::framing(
                                format!("invalid escape '\\{}'", other),
                                self.pos,
                            ))
                        }
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn parse_seq(&mut self, open: char, close: char) -> Result<Option<Value>> {
        self.bump(open);
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return self.incomplete("list"),
                Some(c) if c == close => {
                    self.bump(c);
                    return Ok(Some(Value::List(items)));
                }
                Some(_) => match self.parse_value()? {
                    None => return Ok(None),
                    Some(v) => items.push(v),
                },
            }
        }
    }

    fn parse_map(&mut self) -> Result<Option<Value>> {
        self.bump('{');
        let mut entries = BTreeMap::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return self.incomplete("map"),
                Some('}') => {
                    self.bump('}');
                    return Ok(Some(Value::Map(entries)));
                }
                Some(_) => {
                    let key = match self.parse_value()? {
                        None => return Ok(None),
                        Some(v) => coerce_key(v, self.pos)?,
                    };
                    let value = match self.parse_value()? {
                        None => return Ok(None),
                        Some(v) => v,
                    };
                    entries.insert(key, value);
                }
            }
        }
    }

    fn parse_bare(&mut self) -> Result<Option<Value>> {
        let start = self.pos;
        loop {
            match self.peek() {
                None => {
                    // The token might continue in the next read; only a
                    // complete input delimits it.
                    if !self.complete {
                        return Ok(None);
                    }
                    break;
                }
                Some(c) if c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | '"') => {
                    break
                }
                Some(c) => self.bump(c),
            }
        }
        let token = &self.src[start..self.pos];
        Ok(Some(classify_token(token)))
    }
}

fn classify_token(token: &str) -> Value {
    match token {
        "nil" => Value::Nil,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            let digits = token.strip_prefix('-').unwrap_or(token);
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                // Out-of-range integers fall through to the opaque token kind
                match token.parse::<i64>() {
                    Ok(n) => Value::Int(n),
                    Err(_) => Value::Sym(token.to_string()),
                }
            } else {
                Value::Sym(token.to_string())
            }
        }
    }
}

/// Buffered message reader over one half of a stream.
///
/// Keeps a persistent buffer so that several messages arriving in one read,
/// or one message split across reads, both decode correctly. Returns
/// `Ok(None)` on clean end of stream (between messages).
pub struct MessageReader<R> {
    inner: R,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        let mut chunk = [0u8; 4096];
        loop {
            if !self.buffer.is_empty() {
                if let Some((msg, consumed)) = decode(&self.buffer)? {
                    self.buffer.drain(..consumed);
                    return Ok(Some(msg));
                }
                if self.buffer.len() > MAX_MESSAGE_SIZE {
                    return Err(ProtoError::TooLarge {
                        limit: MAX_MESSAGE_SIZE,
                    });
                }
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return if self.buffer.iter().all(u8::is_ascii_whitespace) {
                    Ok(None)
                } else {
                    Err(ProtoError::framing(
                        "stream closed mid-message",
                        self.buffer.len(),
                    ))
                };
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Write one encoded message and flush it.
///
/// Callers are responsible for serializing access to the writer so that a
/// message is never interleaved with another on the wire.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    writer.write_all(encode(msg).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
