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

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtoError>;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error at byte {position}: {message}")]
    Framing { message: String, position: usize },

    #[error("Message exceeds maximum size of {limit} bytes")]
    TooLarge { limit: usize },
}

impl ProtoError {
    /// Create a framing error with the byte position where decoding failed
    pub fn framing(message: impl Into<String>, position: usize) -> Self {
        Self::Framing {
            message: message.into(),
            position,
        }
    }
}
