use codebridge_agent::{InvocationParams, QueryError, RecordKind, ScriptedTransport, Transport};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_scripts_are_consumed_in_order() {
    let transport = ScriptedTransport::new()
        .respond_with(vec![json!({"type": "result", "result": "first"})])
        .respond_with(vec![json!({"type": "result", "result": "second"})]);

    for expected in ["first", "second"] {
        let mut rx = transport
            .stream_query(InvocationParams::new("q"), CancellationToken::new())
            .await
            .unwrap();
        let record = rx.recv().await.unwrap().unwrap();
        assert_eq!(record.text().as_deref(), Some(expected));
        assert!(rx.recv().await.is_none());
    }
}

#[tokio::test]
async fn test_failure_follows_records() {
    let transport = ScriptedTransport::new().respond_then_fail(
        vec![
            json!({"type": "system", "subtype": "init", "session_id": "T1"}),
            json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "partial"}]}}),
        ],
        QueryError::AbnormalExit { code: 1 },
    );

    let rx = transport
        .stream_query(InvocationParams::new("q"), CancellationToken::new())
        .await
        .unwrap();
    let items: Vec<_> = rx.into_stream().collect().await;

    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_ref().unwrap().kind(), RecordKind::Init);
    assert_eq!(items[1].as_ref().unwrap().kind(), RecordKind::Assistant);
    assert!(matches!(items[2], Err(QueryError::AbnormalExit { code: 1 })));
}

#[tokio::test]
async fn test_fail_to_start_returns_err() {
    let transport = ScriptedTransport::new().fail_to_start(QueryError::Connect("refused".into()));

    let result = transport
        .stream_query(InvocationParams::new("q"), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(QueryError::Connect(_))));
}

#[tokio::test]
async fn test_calls_are_recorded() {
    let transport = ScriptedTransport::new();
    let mut params = InvocationParams::new("remember me");
    params.resume = Some("T9".to_string());

    let mut rx = transport
        .stream_query(params, CancellationToken::new())
        .await
        .unwrap();
    let fallback = rx.recv().await.unwrap().unwrap();
    assert!(fallback.text().unwrap().contains("remember me"));

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].prompt, "remember me");
    assert_eq!(calls[0].resume.as_deref(), Some("T9"));
}
