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

//! # tether wire protocol
//!
//! The shared value model, message type, and codec for the tether REPL
//! protocol. Both the server and the client speak this format; nothing in
//! this crate touches the network beyond reading and writing framed
//! messages over the `AsyncRead`/`AsyncWrite` halves handed to it.
//!
//! ## Wire format
//!
//! Each message is a count-prefixed run of readable tokens:
//!
//! ```text
//! 2
//! id "e1b2"
//! code "(+ 1 2)"
//! ```
//!
//! See [`codec`] for the framing rules and [`Message`] for the recognized
//! keys. Messages are open maps: unknown keys round-trip untouched.
//!
//! ## Example
//!
//! ```
//! use tether_proto::{codec, key, Message};
//!
//! let request = Message::new()
//!     .with(key::ID, "e1b2")
//!     .with(key::CODE, "(+ 1 2)");
//!
//! let bytes = codec::encode(&request);
//! let (decoded, consumed) = codec::decode(bytes.as_bytes()).unwrap().unwrap();
//! assert_eq!(decoded, request);
//! assert_eq!(consumed, bytes.len());
//! ```

pub mod codec;
mod error;
mod message;
mod value;

pub use error::{ProtoError, Result};
pub use message::{key, status, Message, DEFAULT_TIMEOUT_MS};
pub use value::Value;
