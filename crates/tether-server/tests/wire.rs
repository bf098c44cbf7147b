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

//! Wire-level tests against a live server, using raw sockets and the codec
//! directly rather than the client library.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use tether_proto::codec::{self, MessageReader};
use tether_proto::{key, status, Message};
use tether_server::{lang::Interp, Server};

async fn start_server() -> Server<Interp> {
    Server::start(Interp::new(), 0, 0)
        .await
        .expect("server should bind an ephemeral port")
}

async fn connect(server: &Server<Interp>) -> TcpStream {
    TcpStream::connect(server.local_addr())
        .await
        .expect("connect to test server")
}

/// Send one request and collect every response up to the terminal status.
async fn roundtrip(stream: TcpStream, request: Message) -> Vec<Message> {
    let (read_half, mut write_half) = stream.into_split();
    codec::write_message(&mut write_half, &request)
        .await
        .expect("request write");

    let mut reader = MessageReader::new(read_half);
    let mut responses = Vec::new();
    loop {
        let reply = tokio::time::timeout(Duration::from_secs(5), reader.read_message())
            .await
            .expect("response should arrive before the test times out")
            .expect("decode response")
            .expect("connection should stay open until the terminal status");
        let terminal = reply.is_terminal();
        responses.push(reply);
        if terminal {
            return responses;
        }
    }
}

#[tokio::test]
async fn test_simple_evaluation_round_trip() {
    let server = start_server().await;
    let request = Message::new().with(key::ID, "w1").with(key::CODE, "(+ 1 2)");

    let responses = roundtrip(connect(&server).await, request).await;

    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].value(), Some("3"));
    assert_eq!(responses[0].ns(), Some("user"));
    assert_eq!(responses[1].status(), Some(status::DONE));
    for reply in &responses {
        assert_eq!(reply.id(), Some("w1"), "every response echoes the id");
    }
}

#[tokio::test]
async fn test_request_without_id_gets_generated_id() {
    let server = start_server().await;
    let responses = roundtrip(
        connect(&server).await,
        Message::new().with(key::CODE, "1"),
    )
    .await;

    let id = responses[0].id().expect("server must stamp an id");
    assert!(!id.is_empty());
    assert!(responses.iter().all(|r| r.id() == Some(id)));
}

#[tokio::test]
async fn test_message_with_no_code_is_an_error() {
    let server = start_server().await;
    let stream = connect(&server).await;
    let (read_half, mut write_half) = stream.into_split();

    codec::write_message(&mut write_half, &Message::new().with(key::ID, "nc1"))
        .await
        .unwrap();

    let mut reader = MessageReader::new(read_half);
    let reply = reader.read_message().await.unwrap().unwrap();
    assert_eq!(reply.id(), Some("nc1"));
    assert_eq!(reply.status(), Some(status::ERROR));
    assert_eq!(reply.error(), Some("Received message with no code."));

    // The connection is still usable afterwards
    codec::write_message(
        &mut write_half,
        &Message::new().with(key::ID, "nc2").with(key::CODE, "2"),
    )
    .await
    .unwrap();
    let reply = reader.read_message().await.unwrap().unwrap();
    assert_eq!(reply.value(), Some("2"));
}

#[tokio::test]
async fn test_framing_error_closes_connection() {
    let server = start_server().await;
    let stream = connect(&server).await;
    let (read_half, mut write_half) = stream.into_split();

    write_half
        .write_all(b"not-a-count \"boom\"\n")
        .await
        .unwrap();
    write_half.flush().await.unwrap();

    let mut reader = MessageReader::new(read_half);
    let result = tokio::time::timeout(Duration::from_secs(5), reader.read_message())
        .await
        .expect("server should close promptly");
    assert!(
        matches!(result, Ok(None)),
        "expected EOF after framing error, got {:?}",
        result
    );
}

#[tokio::test]
async fn test_session_retained_across_connections() {
    let server = start_server().await;

    // First connection: define a var and retain the session.
    let responses = roundtrip(
        connect(&server).await,
        Message::new()
            .with(key::ID, "s1")
            .with(key::CODE, "(def x 1) (retain-session)"),
    )
    .await;
    let printed = responses
        .iter()
        .filter_map(|r| r.value())
        .last()
        .expect("retain-session should print the id");
    // The value is a printed string; strip the quotes.
    let session_id = printed.trim_matches('"').to_string();
    assert_eq!(server.sessions().len(), 1);

    // Second connection: rebind the session by id and read the var back.
    let responses = roundtrip(
        connect(&server).await,
        Message::new()
            .with(key::ID, "s2")
            .with(key::CODE, "x")
            .with(key::SESSION_ID, session_id.as_str()),
    )
    .await;
    assert_eq!(responses[0].value(), Some("1"));

    // Release over the wire; the store entry disappears.
    let responses = roundtrip(
        connect(&server).await,
        Message::new()
            .with(key::ID, "s3")
            .with(key::CODE, "(release-session)")
            .with(key::SESSION_ID, session_id.as_str()),
    )
    .await;
    assert_eq!(responses[0].value(), Some("true"));
    assert_eq!(server.sessions().len(), 0);
}

#[tokio::test]
async fn test_unknown_session_id_uses_connection_session() {
    let server = start_server().await;
    let responses = roundtrip(
        connect(&server).await,
        Message::new()
            .with(key::ID, "u1")
            .with(key::CODE, "1")
            .with(key::SESSION_ID, "no-such-session"),
    )
    .await;
    assert_eq!(responses[0].value(), Some("1"));
    assert_eq!(responses[1].status(), Some(status::DONE));
}

#[tokio::test]
async fn test_timeout_cancels_and_is_terminal() {
    let server = start_server().await;
    let started = std::time::Instant::now();
    let responses = roundtrip(
        connect(&server).await,
        Message::new()
            .with(key::ID, "t1")
            .with(key::CODE, "(sleep 60000)")
            .with(key::TIMEOUT, 200i64),
    )
    .await;

    assert!(
        started.elapsed() < Duration::from_secs(2),
        "timeout should fire in about 200ms"
    );
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status(), Some(status::TIMEOUT));
}

#[tokio::test]
async fn test_interrupt_one_liner_from_second_connection() {
    let server = start_server().await;

    // Start a long evaluation on the first connection.
    let stream = connect(&server).await;
    let (read_half, mut write_half) = stream.into_split();
    codec::write_message(
        &mut write_half,
        &Message::new()
            .with(key::ID, "long-1")
            .with(key::CODE, "(sleep 60000)"),
    )
    .await
    .unwrap();

    // Give the worker a moment to enter the sleep.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Interrupt it from a second connection.
    let responses = roundtrip(
        connect(&server).await,
        Message::new()
            .with(key::ID, "int-1")
            .with(key::CODE, "(interrupt \"long-1\")"),
    )
    .await;
    assert_eq!(responses[0].value(), Some("true"));

    // The original request ends with interrupted, and nothing after it.
    let mut reader = MessageReader::new(read_half);
    let reply = tokio::time::timeout(Duration::from_secs(5), reader.read_message())
        .await
        .expect("interrupted status should arrive promptly")
        .unwrap()
        .unwrap();
    assert_eq!(reply.id(), Some("long-1"));
    assert_eq!(reply.status(), Some(status::INTERRUPTED));
}

#[tokio::test]
async fn test_responses_for_different_requests_interleave() {
    let server = start_server().await;
    let stream = connect(&server).await;
    let (read_half, mut write_half) = stream.into_split();

    // A slow request first, then a fast one on the same connection.
    codec::write_message(
        &mut write_half,
        &Message::new()
            .with(key::ID, "slow")
            .with(key::CODE, "(sleep 500) 1"),
    )
    .await
    .unwrap();
    codec::write_message(
        &mut write_half,
        &Message::new().with(key::ID, "fast").with(key::CODE, "2"),
    )
    .await
    .unwrap();

    let mut reader = MessageReader::new(read_half);
    let mut order = Vec::new();
    let mut done = 0;
    while done < 2 {
        let reply = tokio::time::timeout(Duration::from_secs(5), reader.read_message())
            .await
            .expect("responses should arrive")
            .unwrap()
            .unwrap();
        if reply.is_terminal() {
            done += 1;
        }
        order.push(format!(
            "{}:{}",
            reply.id().unwrap_or("?"),
            reply.status().or(reply.value()).unwrap_or("out")
        ));
    }

    // The fast request completes while the slow one is still sleeping.
    assert_eq!(
        order[..2],
        ["fast:2".to_string(), "fast:done".to_string()],
        "got order: {:?}",
        order
    );
    assert_eq!(order[2..], ["slow:1".to_string(), "slow:done".to_string()]);
}

#[tokio::test]
async fn test_ack_port_delivery_between_servers() {
    let ack_server = start_server().await;
    let main = Server::start(Interp::new(), 0, ack_server.port())
        .await
        .expect("main server should start and ack");

    let delivered = ack_server
        .await_ack(Duration::from_secs(5))
        .await
        .expect("ack server should observe the delivered port");
    assert_eq!(delivered, main.port());
}

#[tokio::test]
async fn test_non_string_code_treated_as_missing() {
    // `code` present but not a string never reaches the driver as code;
    // the connection treats it as missing.
    let server = start_server().await;
    let stream = connect(&server).await;
    let (read_half, mut write_half) = stream.into_split();

    codec::write_message(
        &mut write_half,
        &Message::new().with(key::ID, "k1").with(key::CODE, 42i64),
    )
    .await
    .unwrap();

    let mut reader = MessageReader::new(read_half);
    let reply = reader.read_message().await.unwrap().unwrap();
    assert_eq!(reply.status(), Some(status::ERROR));
    assert_eq!(reply.error(), Some("Received message with no code."));
}
