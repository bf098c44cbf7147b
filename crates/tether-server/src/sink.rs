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

//! Capturing output sinks.
//!
//! The evaluator writes to these instead of the process's stdout/stderr.
//! Writes accumulate in a buffer; on flush the buffer is swapped out for a
//! fresh one and, when non-empty, emitted as a single `{id, out|err: text}`
//! response chunk.

use std::sync::{Arc, Mutex, PoisonError};

use tether_proto::Message;

use crate::worker::Responder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKey {
    Out,
    Err,
}

impl StreamKey {
    pub fn key(self) -> &'static str {
        match self {
            StreamKey::Out => tether_proto::key::OUT,
            StreamKey::Err => tether_proto::key::ERR,
        }
    }
}

/// A buffered, cheaply clonable capture of one output stream.
#[derive(Clone)]
pub struct OutputSink {
    stream: StreamKey,
    buffer: Arc<Mutex<String>>,
    responder: Responder,
}

impl OutputSink {
    pub(crate) fn new(stream: StreamKey, responder: Responder) -> Self {
        Self {
            stream,
            buffer: Arc::new(Mutex::new(String::new())),
            responder,
        }
    }

    pub fn write(&self, text: &str) {
        self.lock().push_str(text);
    }

    /// Swap the buffer for a fresh one and emit the old contents, if any,
    /// as one response chunk. The swap and emit happen under the buffer
    /// lock so concurrent writers can neither interleave a chunk nor lose
    /// bytes.
    pub fn flush(&self) {
        let mut buffer = self.lock();
        if buffer.is_empty() {
            return;
        }
        let chunk = std::mem::take(&mut *buffer);
        self.responder
            .send(Message::new().with(self.stream.key(), chunk));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, String> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    fn test_sink(stream: StreamKey) -> (OutputSink, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let interrupt = Arc::new(AtomicBool::new(false));
        let responder = Responder::new("req-1".to_string(), interrupt, tx);
        (OutputSink::new(stream, responder), rx)
    }

    #[test]
    fn test_flush_emits_single_chunk() {
        let (sink, mut rx) = test_sink(StreamKey::Out);
        sink.write("hello ");
        sink.write("world");
        sink.flush();

        let msg = rx.try_recv().expect("flush should emit");
        assert_eq!(msg.out(), Some("hello world"));
        assert_eq!(msg.id(), Some("req-1"));
        assert!(rx.try_recv().is_err(), "one chunk per flush");
    }

    #[test]
    fn test_empty_flush_emits_nothing() {
        let (sink, mut rx) = test_sink(StreamKey::Err);
        sink.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_flush_resets_buffer() {
        let (sink, mut rx) = test_sink(StreamKey::Err);
        sink.write("a");
        sink.flush();
        sink.write("b");
        sink.flush();

        assert_eq!(rx.try_recv().unwrap().err(), Some("a"));
        assert_eq!(rx.try_recv().unwrap().err(), Some("b"));
    }
}
