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

//! Reader: one top-level form at a time from a source string.

use super::{Exception, Val};

/// Parse the next form from `source`, advancing `pos` past it. `Ok(None)`
/// once only whitespace and comments remain.
pub(crate) fn read_form(source: &str, pos: &mut usize) -> Result<Option<Val>, Exception> {
    let mut reader = Reader {
        src: source,
        pos: *pos,
    };
    reader.skip_trivia();
    if reader.peek().is_none() {
        *pos = reader.pos;
        return Ok(None);
    }
    let form = reader.read()?;
    *pos = reader.pos;
    Ok(Some(form))
}

struct Reader<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self, c: char) {
        self.pos += c.len_utf8();
    }

    /// Skip whitespace, commas, and `;` comments.
    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == ',' {
                self.bump(c);
            } else if c == ';' {
                while let Some(c) = self.peek() {
                    self.bump(c);
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn read(&mut self) -> Result<Val, Exception> {
        self.skip_trivia();
        match self.peek() {
            None => Err(Exception::new("unexpected end of input")),
            Some('(') => self.read_seq('(', ')').map(Val::List),
            Some('[') => self.read_seq('[', ']').map(Val::Vector),
            Some('{') => self.read_map(),
            Some('"') => self.read_string(),
            Some('\'') => {
                self.bump('\'');
                let quoted = self.read()?;
                Ok(Val::List(vec![Val::Sym("quote".to_string()), quoted]))
            }
            Some(c @ (')' | ']' | '}')) => Err(Exception::new(format!("unmatched '{}'", c))),
            Some(_) => self.read_token(),
        }
    }

    fn read_seq(&mut self, open: char, close: char) -> Result<Vec<Val>, Exception> {
        self.bump(open);
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    return Err(Exception::new(format!(
                        "unexpected end of input, expected '{}'",
                        close
                    )))
                }
                Some(c) if c == close => {
                    self.bump(c);
                    return Ok(items);
                }
                Some(_) => items.push(self.read()?),
            }
        }
    }

    fn read_map(&mut self) -> Result<Val, Exception> {
        let items = self.read_seq('{', '}')?;
        if items.len() % 2 != 0 {
            return Err(Exception::new(
                "map literal requires an even number of forms",
            ));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            pairs.push((k, v));
        }
        Ok(Val::Map(pairs))
    }

    fn read_string(&mut self) -> Result<Val, Exception> {
        self.bump('"');
        let mut out = String::new();
        loop {
            let c = self
                .peek()
                .ok_or_else(|| Exception::new("unterminated string"))?;
            self.bump(c);
            match c {
                '"' => return Ok(Val::Str(out)),
                '\\' => {
                    let esc = self
                        .peek()
                        .ok_or_else(|| Exception::new("unterminated string"))?;
                    self.bump(esc);
                    match esc {
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        other => {
                            return Err(Exception::new(format!("invalid escape '\\{}'", other)))
                        }
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn read_token(&mut self) -> Result<Val, Exception> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '{' | '}' | '"' | ';' | ',') {
                break;
            }
            self.bump(c);
        }
        let token = &self.src[start..self.pos];
        Ok(classify(token))
    }
}

fn classify(token: &str) -> Val {
    if let Some(name) = token.strip_prefix(':') {
        if !name.is_empty() {
            return Val::Keyword(name.to_string());
        }
    }
    match token {
        "nil" => Val::Nil,
        "true" => Val::Bool(true),
        "false" => Val::Bool(false),
        _ => {
            let digits = token.strip_prefix('-').unwrap_or(token);
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                match token.parse::<i64>() {
                    Ok(n) => Val::Int(n),
                    Err(_) => Val::Sym(token.to_string()),
                }
            } else {
                Val::Sym(token.to_string())
            }
        }
    }
}
