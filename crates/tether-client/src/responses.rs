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

//! Per-request response handles and the folding helpers built on them.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use uuid::Uuid;

use tether_proto::{codec, key, status, Message, Value};

use crate::error::{ClientError, Result};
use crate::{debug_log, register_slot, write_request, Outstanding, SharedWriter, Slot};

/// How long an interrupt request may take to be acknowledged.
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(10);

/// The responses of one request, in server order.
///
/// While this handle is alive, the client routes responses for its id
/// here; once it is dropped, the outstanding entry becomes reclaimable and
/// further responses for the id are discarded.
pub struct Responses {
    id: String,
    slot: Arc<Slot>,
    writer: SharedWriter,
    outstanding: Outstanding,
}

impl Responses {
    pub(crate) fn new(
        id: String,
        slot: Arc<Slot>,
        writer: SharedWriter,
        outstanding: Outstanding,
    ) -> Self {
        Self {
            id,
            slot,
            writer,
            outstanding,
        }
    }

    /// The request id these responses belong to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The next response, in order. `None` once the connection is gone.
    pub async fn recv(&self) -> Option<Message> {
        self.slot.rx.lock().await.recv().await
    }

    /// Like [`recv`](Self::recv), giving up after `wait`.
    pub async fn recv_timeout(&self, wait: Duration) -> Option<Message> {
        timeout(wait, self.recv()).await.ok().flatten()
    }

    /// Interrupt this request server-side and wait for the interrupt
    /// request itself to complete.
    ///
    /// The cancel is delivered as a separate one-line evaluation invoking
    /// the server's interrupt operation for this id; the interrupted
    /// request still emits its own terminal `interrupted` status on this
    /// handle.
    pub async fn interrupt(&self) -> Result<()> {
        let interrupt_id = Uuid::new_v4().to_string();
        debug_log!(
            "[tether DEBUG] Interrupting {} via request {}",
            self.id,
            interrupt_id
        );

        let slot = register_slot(&self.outstanding, &interrupt_id);
        let request = Message::new()
            .with(key::ID, interrupt_id.as_str())
            .with(key::CODE, format!("(interrupt \"{}\")", self.id));
        write_request(&self.writer, &request).await?;

        let acknowledged = async {
            let mut rx = slot.rx.lock().await;
            while let Some(reply) = rx.recv().await {
                if reply.is_terminal() {
                    return true;
                }
            }
            false
        };
        match timeout(INTERRUPT_TIMEOUT, acknowledged).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ClientError::Protocol(
                "connection closed before interrupt completed".to_string(),
            )),
            Err(_) => Err(ClientError::Timeout {
                operation: "interrupt".to_string(),
                duration: INTERRUPT_TIMEOUT,
            }),
        }
    }

    /// The finite response sequence: every response up to and including
    /// the first `done`, `timeout`, or `interrupted` status.
    pub async fn collect(&self) -> Vec<Message> {
        let mut responses = Vec::new();
        while let Some(response) = self.recv().await {
            let terminal = matches!(
                response.status(),
                Some(status::DONE) | Some(status::TIMEOUT) | Some(status::INTERRUPTED)
            );
            responses.push(response);
            if terminal {
                break;
            }
        }
        responses
    }
}

/// Fold a response sequence into a single map.
///
/// `ns` and `id` take the last seen; `value` collects into an ordered
/// list; `status` collects into a set; string-valued keys such as `out`
/// and `err` concatenate in order; anything else is last-wins. A single
/// `value` still comes out as a one-element list, and feeding the result
/// back through is a fixed point.
pub fn combine_responses<'a>(responses: impl IntoIterator<Item = &'a Message>) -> Message {
    let mut combined = Message::new();
    let mut values: Vec<Value> = Vec::new();
    let mut statuses: Vec<Value> = Vec::new();

    for response in responses {
        for (k, v) in response.iter() {
            match k {
                key::VALUE => match v {
                    Value::List(items) => values.extend(items.iter().cloned()),
                    other => values.push(other.clone()),
                },
                key::STATUS => {
                    let incoming: &[Value] = match v {
                        Value::List(items) => items,
                        other => std::slice::from_ref(other),
                    };
                    for item in incoming {
                        if !statuses.contains(item) {
                            statuses.push(item.clone());
                        }
                    }
                }
                key::ID | key::NS => combined.insert(k, v.clone()),
                _ => match (combined.get(k), v) {
                    (Some(Value::Str(prev)), Value::Str(next)) => {
                        let joined = format!("{}{}", prev, next);
                        combined.insert(k, joined);
                    }
                    _ => combined.insert(k, v.clone()),
                },
            }
        }
    }

    if !values.is_empty() {
        combined.insert(key::VALUE, Value::List(values));
    }
    if !statuses.is_empty() {
        combined.insert(key::STATUS, Value::List(statuses));
    }
    combined
}

/// Parse a response's printed `value` back into data.
///
/// # Errors
///
/// `ClientError::Protocol` when the response has no `value`;
/// `ClientError::ValueParse` when the printed form does not read back.
pub fn read_response_value(response: &Message) -> Result<Value> {
    let printed = response
        .value()
        .ok_or_else(|| ClientError::Protocol("response has no value".to_string()))?;
    codec::read_value(printed).map_err(|e| ClientError::ValueParse {
        message: e.to_string(),
    })
}
