// ABOUTME: In-process transport tests against a local one-shot HTTP server speaking SSE.
// ABOUTME: Checks record shapes, history and its release, cancellation, and error mapping.

use codebridge_agent::{
    InvocationParams, OutputRecord, QueryError, RecordKind, RecordReceiver, SdkConfig,
    SdkTransport, Transport,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Read one HTTP request; returns its JSON body with the lowercased headers under `_headers`
async fn read_request(socket: &mut TcpStream) -> Value {
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed before sending headers");
        request.extend_from_slice(&buf[..n]);
        if let Some(pos) = find(&request, b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let headers = String::from_utf8_lossy(&request[..header_end]).to_lowercase();
    let content_length: usize = headers
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);
    while request.len() < header_end + content_length {
        let n = socket.read(&mut buf).await.unwrap();
        request.extend_from_slice(&buf[..n]);
    }
    let body = &request[header_end..header_end + content_length];
    let mut value: Value = serde_json::from_slice(body).unwrap();
    value["_headers"] = Value::String(headers);
    value
}

/// Serve each canned response to one connection in turn, returning the request bodies
async fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<Value>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let mut bodies = Vec::new();
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            bodies.push(read_request(&mut socket).await);
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        }
        bodies
    });

    (base_url, handle)
}

/// Send the start of a reply and keep the connection open until the client hangs up.
/// The handle resolves to true once the client closed its side.
async fn serve_and_hold(partial: String) -> (String, JoinHandle<bool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        socket.write_all(partial.as_bytes()).await.unwrap();
        let mut buf = [0u8; 256];
        let closed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        closed.is_ok()
    });

    (base_url, handle)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn sse_response(reply_parts: &[&str]) -> String {
    let mut events = vec![(
        "message_start",
        json!({"type": "message_start", "message": {"model": "claude-test", "usage": {"input_tokens": 12, "output_tokens": 1}}}),
    )];
    events.push((
        "content_block_start",
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
    ));
    for part in reply_parts {
        events.push((
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": part}}),
        ));
    }
    events.push((
        "message_delta",
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 7}}),
    ));
    events.push(("message_stop", json!({"type": "message_stop"})));

    sse(&events)
}

fn sse(events: &[(&str, Value)]) -> String {
    let mut out = String::from(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
    );
    for (name, data) in events {
        out.push_str(&format!("event: {}\ndata: {}\n\n", name, data));
    }
    out
}

/// A reply cut off after its first text delta
fn partial_reply() -> String {
    sse(&[
        (
            "message_start",
            json!({"type": "message_start", "message": {"model": "claude-test", "usage": {"input_tokens": 3}}}),
        ),
        (
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "thinking"}}),
        ),
    ])
}

fn transport(base_url: &str) -> SdkTransport {
    SdkTransport::new(SdkConfig {
        base_url: base_url.to_string(),
        api_key: Some("sk-test".to_string()),
        model: "claude-test".to_string(),
        ..Default::default()
    })
    .unwrap()
}

async fn collect(mut rx: RecordReceiver) -> (Vec<OutputRecord>, Option<QueryError>) {
    let mut records = Vec::new();
    let mut error = None;
    while let Some(item) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("stream stalled")
    {
        match item {
            Ok(record) => records.push(record),
            Err(e) => error = Some(e),
        }
    }
    (records, error)
}

#[tokio::test]
async fn test_streamed_reply_as_records() {
    let (base_url, server) = serve(vec![sse_response(&["Hel", "lo"])]).await;
    let transport = transport(&base_url);

    let mut params = InvocationParams::new("say hello");
    params.append_system_prompt = Some("be brief".to_string());
    let rx = transport
        .stream_query(params, CancellationToken::new())
        .await
        .unwrap();
    let (records, error) = collect(rx).await;
    assert!(error.is_none(), "unexpected error: {:?}", error);

    let kinds: Vec<_> = records.iter().map(|r| r.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            RecordKind::Init,
            RecordKind::Assistant,
            RecordKind::Assistant,
            RecordKind::Result
        ]
    );
    let token = records[0].session_id().unwrap().to_string();
    assert!(!token.is_empty());

    let result = records.last().unwrap();
    assert_eq!(result.raw()["result"], "Hello");
    assert_eq!(result.raw()["session_id"], token.as_str());
    let usage = result.usage().unwrap();
    assert_eq!(usage.input_tokens, 12);
    assert_eq!(usage.output_tokens, 7);

    let bodies = server.await.unwrap();
    assert_eq!(bodies[0]["model"], "claude-test");
    assert_eq!(bodies[0]["stream"], true);
    assert_eq!(bodies[0]["system"], "be brief");
    assert_eq!(
        bodies[0]["messages"],
        json!([{"role": "user", "content": "say hello"}])
    );
    let headers = bodies[0]["_headers"].as_str().unwrap();
    assert!(headers.contains("x-api-key: sk-test"));
    assert!(headers.contains("anthropic-version: 2023-06-01"));
    assert_eq!(transport.conversation_count(), 1);
}

#[tokio::test]
async fn test_resume_sends_prior_history() {
    let (base_url, server) =
        serve(vec![sse_response(&["first"]), sse_response(&["second"])]).await;
    let transport = transport(&base_url);

    let rx = transport
        .stream_query(InvocationParams::new("one"), CancellationToken::new())
        .await
        .unwrap();
    let (records, _) = collect(rx).await;
    let token = records[0].session_id().unwrap().to_string();

    let mut params = InvocationParams::new("two");
    params.resume = Some(token.clone());
    let rx = transport
        .stream_query(params, CancellationToken::new())
        .await
        .unwrap();
    let (records, error) = collect(rx).await;
    assert!(error.is_none());
    assert_eq!(records[0].session_id(), Some(token.as_str()));

    let bodies = server.await.unwrap();
    assert_eq!(
        bodies[1]["messages"],
        json!([
            {"role": "user", "content": "one"},
            {"role": "assistant", "content": "first"},
            {"role": "user", "content": "two"},
        ])
    );
    assert_eq!(transport.conversation_count(), 1);
}

#[tokio::test]
async fn test_rejected_request_is_api_error() {
    let body = r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
    let response = format!(
        "HTTP/1.1 401 Unauthorized\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let (base_url, _server) = serve(vec![response]).await;
    let transport = transport(&base_url);

    let rx = transport
        .stream_query(InvocationParams::new("hi"), CancellationToken::new())
        .await
        .unwrap();
    let (records, error) = collect(rx).await;

    assert!(records.is_empty());
    match error {
        Some(QueryError::Api { status, message }) => {
            assert_eq!(status, 401);
            assert_eq!(message, "invalid x-api-key");
        }
        other => panic!("expected Api error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_refused_connection_is_connect_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let transport = transport(&base_url);
    let rx = transport
        .stream_query(InvocationParams::new("hi"), CancellationToken::new())
        .await
        .unwrap();
    let (records, error) = collect(rx).await;

    assert!(records.is_empty());
    let error = error.expect("expected an error");
    assert!(matches!(error, QueryError::Connect(_)), "got {:?}", error);
    assert!(error.should_probe());
}

#[tokio::test]
async fn test_stream_error_event_is_error_record() {
    let response = String::from(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n\
         event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
    );
    let (base_url, _server) = serve(vec![response]).await;
    let transport = transport(&base_url);

    let rx = transport
        .stream_query(InvocationParams::new("hi"), CancellationToken::new())
        .await
        .unwrap();
    let (records, error) = collect(rx).await;

    assert!(error.is_none());
    assert_eq!(records.len(), 2);
    assert!(records[0].is_init());
    assert_eq!(records[1].kind(), RecordKind::Error);
    assert_eq!(records[1].error_message().as_deref(), Some("Overloaded"));
    assert_eq!(transport.conversation_count(), 0);
}

#[tokio::test]
async fn test_cancel_mid_stream_ends_cleanly() {
    let (base_url, server) = serve_and_hold(partial_reply()).await;
    let transport = transport(&base_url);
    let cancel = CancellationToken::new();

    let mut rx = transport
        .stream_query(InvocationParams::new("hi"), cancel.clone())
        .await
        .unwrap();
    let mut records = Vec::new();
    while records.len() < 2 {
        let item = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("stream stalled")
            .expect("stream ended early");
        records.push(item.unwrap());
    }
    assert!(records[0].is_init());
    assert_eq!(records[1].text().as_deref(), Some("thinking"));

    cancel.cancel();
    let (rest, error) = collect(rx).await;

    assert!(rest.is_empty());
    assert!(error.is_none(), "cancellation surfaced {:?}", error);
    assert!(server.await.unwrap(), "request was not closed after cancel");
    assert_eq!(transport.conversation_count(), 0);
}

#[tokio::test]
async fn test_dropping_receiver_closes_request() {
    let (base_url, server) = serve_and_hold(partial_reply()).await;
    let transport = transport(&base_url);

    let mut rx = transport
        .stream_query(InvocationParams::new("hi"), CancellationToken::new())
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(first.is_init());

    drop(rx);

    assert!(server.await.unwrap(), "request still open after the consumer went away");
}

#[tokio::test]
async fn test_forget_drops_conversation_history() {
    let replies = (0..3).map(|n| sse_response(&[format!("reply {}", n).as_str()])).collect();
    let (base_url, _server) = serve(replies).await;
    let transport = transport(&base_url);

    let mut tokens = Vec::new();
    for prompt in ["a", "b", "c"] {
        let rx = transport
            .stream_query(InvocationParams::new(prompt), CancellationToken::new())
            .await
            .unwrap();
        let (records, error) = collect(rx).await;
        assert!(error.is_none());
        tokens.push(records[0].session_id().unwrap().to_string());
    }
    assert_eq!(transport.conversation_count(), 3);

    transport.forget(&tokens[0]);
    assert_eq!(transport.conversation_count(), 2);
    assert!(!transport.forget_conversation(&tokens[0]));
    assert!(transport.forget_conversation(&tokens[1]));
    transport.forget("never-seen");
    assert_eq!(transport.conversation_count(), 1);
}
