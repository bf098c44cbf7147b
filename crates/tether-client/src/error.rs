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

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] tether_proto::ProtoError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout after {duration:?} while {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Unreadable response value: {message}")]
    ValueParse { message: String },
}
