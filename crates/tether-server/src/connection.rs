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

//! Per-connection handling: decode requests, dispatch, serialize responses.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tether_proto::codec::{self, MessageReader};
use tether_proto::{key, status, Message};

use crate::runtime::Runtime;
use crate::session::{SessionHandle, SessionState, SessionStore};
use crate::worker::{dispatch, AckSender, PendingRequests};

/// Serve one accepted connection until the peer disconnects or a framing
/// error closes it.
///
/// All responses funnel through a single writer task, so one message is
/// atomic on the wire however many request workers are emitting. The
/// connection starts with a fresh unretained session; a request carrying a
/// known `session-id` repoints the session cursor for itself and every
/// subsequent request.
pub(crate) async fn handle_connection<R: Runtime>(
    runtime: Arc<R>,
    pending: PendingRequests,
    sessions: SessionStore<R>,
    ack: AckSender,
    stream: TcpStream,
) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        let mut writer = write_half;
        while let Some(msg) = reply_rx.recv().await {
            if let Err(e) = codec::write_message(&mut writer, &msg).await {
                tracing::debug!(error = %e, "response write failed, dropping connection output");
                break;
            }
        }
    });

    let mut session: SessionHandle<R> = SessionState::<R>::handle(runtime.initial_ns());
    let mut reader = MessageReader::new(read_half);

    loop {
        let request = match reader.read_message().await {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!(?peer, "client disconnected");
                break;
            }
            Err(e) => {
                tracing::debug!(?peer, error = %e, "closing connection after decode failure");
                break;
            }
        };

        if let Some(wanted) = request.session_id() {
            if let Some(found) = sessions.lookup(wanted) {
                session = found;
            }
        }

        if request.code().is_none() {
            let mut reply = Message::new()
                .with(key::STATUS, status::ERROR)
                .with(key::ERROR, "Received message with no code.");
            if let Some(id) = request.id() {
                reply.insert(key::ID, id);
            }
            let _ = reply_tx.send(reply);
            continue;
        }

        // Dispatch and go straight back to reading; the worker and its
        // supervisor own the request from here.
        dispatch(
            Arc::clone(&runtime),
            pending.clone(),
            sessions.clone(),
            Arc::clone(&ack),
            Arc::clone(&session),
            request,
            reply_tx.clone(),
        );
    }
}
