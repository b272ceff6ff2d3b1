//! Direct dispatch against a mock vendor endpoint: retries, error mapping,
//! streaming and usage records.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{direct, sse, MockServerFixture, Recorder};
use llm_gateway_core::channel::{ChannelConfig, Credential, Vendor};
use llm_gateway_core::dispatch::{DirectDispatcher, Dispatcher};
use llm_gateway_core::drivers::DriverRegistry;
use llm_gateway_core::telemetry::InMemoryMetricsSink;
use llm_gateway_core::transport::{PoolConfig, TransportPool};
use llm_gateway_core::types::{
    CompletionRequest, ContentPart, FinishReason, Message, MessageContent, MessageRole,
};
use mockito::Matcher;
use serde_json::json;

fn chat_ok() -> String {
    json!({
        "id": "chatcmpl-ok",
        "created": 1700000000,
        "model": "deepseek-chat",
        "choices": [{"index": 0, "finish_reason": "stop",
            "message": {"role": "assistant", "content": "pong"}}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
    })
    .to_string()
}

#[tokio::test]
async fn retries_503_then_succeeds() {
    let mut fixture = MockServerFixture::new().await;
    let busy = fixture
        .server
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body(r#"{"error":{"message":"overloaded","type":"server_error"}}"#)
        .expect(2)
        .create_async()
        .await;
    let ok = fixture
        .server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({"model": "deepseek-chat", "stream": false})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_ok())
        .expect(1)
        .create_async()
        .await;

    let sink = Arc::new(InMemoryMetricsSink::default());
    let resp = direct(sink.clone())
        .complete(
            CompletionRequest::new("deepseek-chat", vec![Message::user("ping")]),
            &fixture.channel(Vendor::DeepSeek),
        )
        .await;

    assert!(!resp.is_error(), "{:?}", resp.error);
    assert_eq!(resp.first_message().unwrap().text(), "pong");
    busy.assert_async().await;
    ok.assert_async().await;

    assert!(sink.wait_for(1, Duration::from_secs(2)).await);
    let record = &sink.records()[0];
    assert_eq!(record.retries, 2);
    assert_eq!(record.total_tokens(), 4);
    assert_eq!(record.finish_reason, Some(FinishReason::Stop));
}

#[tokio::test]
async fn bedrock_is_not_retried_by_default() {
    let mut fixture = MockServerFixture::new().await;
    let busy = fixture
        .server
        .mock("POST", "/model/claude-sonnet/converse")
        .with_status(503)
        .with_body(r#"{"message":"Service unavailable"}"#)
        .expect(1)
        .create_async()
        .await;

    let resp = direct(Arc::new(InMemoryMetricsSink::default()))
        .complete(
            CompletionRequest::new("claude-sonnet", vec![Message::user("ping")]),
            &fixture.channel(Vendor::Bedrock),
        )
        .await;

    busy.assert_async().await;
    let err = resp.error.unwrap();
    assert_eq!(err.http_code, Some(503));
    assert!(resp.choices.is_empty());
}

#[tokio::test]
async fn vendor_error_body_keeps_status_and_type() {
    let mut fixture = MockServerFixture::new().await;
    let _m = fixture
        .server
        .mock("POST", "/chat/completions")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":{"message":"context too long","type":"invalid_request_error","code":"context_length_exceeded"}}"#)
        .expect(1)
        .create_async()
        .await;

    let resp = direct(Arc::new(InMemoryMetricsSink::default()))
        .complete(
            CompletionRequest::new("gpt-4o", vec![Message::user("ping")]),
            &fixture.channel(Vendor::OpenAi),
        )
        .await;

    let err = resp.error.unwrap();
    assert_eq!(err.http_code, Some(400));
    assert_eq!(err.error_type, "invalid_request_error");
    assert!(err.message.contains("context too long"));
}

#[tokio::test]
async fn stream_delivers_chunks_then_complete() {
    let mut fixture = MockServerFixture::new().await;
    let body = sse(
        &[
            json!({"id": "chatcmpl-s", "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}}]}),
            json!({"id": "chatcmpl-s", "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]}),
            json!({"id": "chatcmpl-s", "choices": [], "usage": {"prompt_tokens": 2, "completion_tokens": 2, "total_tokens": 4}}),
        ],
        true,
    );
    let _m = fixture
        .server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({"stream": true})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let sink = Arc::new(InMemoryMetricsSink::default());
    let mut rec = Recorder::default();
    let outcome = direct(sink.clone())
        .stream(
            CompletionRequest::new("gpt-4o", vec![Message::user("hi")]),
            &fixture.channel(Vendor::OpenAi),
            &mut rec,
        )
        .await;

    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(rec.calls.first(), Some(&"open"));
    assert_eq!(rec.calls.last(), Some(&"complete"));
    let text: String = rec
        .chunks
        .iter()
        .filter_map(|c| c.choices.first().and_then(|ch| ch.delta.content.clone()))
        .collect();
    assert_eq!(text, "Hello");

    assert!(sink.wait_for(1, Duration::from_secs(2)).await);
    let record = &sink.records()[0];
    assert!(record.stream);
    assert_eq!(record.total_tokens(), 4);
    assert!(record.time_to_first_chunk_ms.is_some());
}

#[tokio::test]
async fn stream_closed_without_finish_is_one_error() {
    let mut fixture = MockServerFixture::new().await;
    let body = sse(
        &[json!({"id": "chatcmpl-t", "choices": [{"index": 0, "delta": {"content": "partial"}}]})],
        false,
    );
    let _m = fixture
        .server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let mut rec = Recorder::default();
    let outcome = direct(Arc::new(InMemoryMetricsSink::default()))
        .stream(
            CompletionRequest::new("gpt-4o", vec![Message::user("hi")]),
            &fixture.channel(Vendor::OpenAi),
            &mut rec,
        )
        .await;

    assert!(outcome.error.is_some());
    assert_eq!(rec.calls, vec!["open", "chunk", "error"]);
}

#[tokio::test]
async fn stream_open_failure_is_retried_before_first_byte() {
    let mut fixture = MockServerFixture::new().await;
    let busy = fixture
        .server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_body(r#"{"error":{"message":"slow down","type":"rate_limit_error"}}"#)
        .expect(1)
        .create_async()
        .await;
    let ok = fixture
        .server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse(
            &[json!({"id": "c", "choices": [{"index": 0, "delta": {"content": "ok"}, "finish_reason": "stop"}]})],
            true,
        ))
        .expect(1)
        .create_async()
        .await;

    let mut rec = Recorder::default();
    let outcome = direct(Arc::new(InMemoryMetricsSink::default()))
        .stream(
            CompletionRequest::new("qwen-max", vec![Message::user("hi")]),
            &fixture.channel(Vendor::Qwen),
            &mut rec,
        )
        .await;

    busy.assert_async().await;
    ok.assert_async().await;
    assert!(outcome.error.is_none());
    assert_eq!(rec.calls, vec!["open", "chunk", "chunk", "complete"]);
}

#[tokio::test]
async fn retry_resends_the_compiled_image_payload() {
    let mut fixture = MockServerFixture::new().await;
    let with_image = Matcher::PartialJson(json!({
        "contents": [{"parts": [{"text": "what is this?"}, {"inlineData": {"mimeType": "image/png", "data": "iVBORw0KGgo="}}]}]
    }));
    let busy = fixture
        .server
        .mock("POST", "/models/gemini-2.5-flash:generateContent")
        .match_body(with_image.clone())
        .with_status(503)
        .with_body(r#"{"error":{"code":503,"message":"overloaded","status":"UNAVAILABLE"}}"#)
        .expect(1)
        .create_async()
        .await;
    let ok = fixture
        .server
        .mock("POST", "/models/gemini-2.5-flash:generateContent")
        .match_body(with_image)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "a pixel"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 2, "totalTokenCount": 10}
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let request = CompletionRequest::new(
        "gemini-2.5-flash",
        vec![Message::with_content(
            MessageRole::User,
            MessageContent::Parts(vec![
                ContentPart::text("what is this?"),
                ContentPart::image_url("data:image/png;base64,iVBORw0KGgo="),
            ]),
        )],
    );
    let resp = direct(Arc::new(InMemoryMetricsSink::default()))
        .complete(request, &fixture.channel(Vendor::Gemini))
        .await;

    assert!(!resp.is_error(), "{:?}", resp.error);
    assert_eq!(resp.first_message().unwrap().text(), "a pixel");
    busy.assert_async().await;
    ok.assert_async().await;
}

#[tokio::test]
async fn retry_after_client_eviction_uses_a_fresh_client() {
    let mut fixture = MockServerFixture::new().await;
    // One cached client: building another evicts and closes the first.
    let pool = Arc::new(TransportPool::new(PoolConfig {
        cache_capacity: 1,
        cache_ttl: Duration::from_secs(60),
        max_concurrent_streams: 4,
    }));
    let evicting = pool.clone();
    let other = ChannelConfig::new(Vendor::DeepSeek, "https://other.example/v1", Credential::None);
    let busy = fixture
        .server
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body_from_request(move |_| {
            let _ = evicting.transport(&other);
            br#"{"error":{"message":"overloaded","type":"server_error"}}"#.to_vec()
        })
        .expect(1)
        .create_async()
        .await;
    let ok = fixture
        .server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_ok())
        .expect(1)
        .create_async()
        .await;

    let sink = Arc::new(InMemoryMetricsSink::default());
    let resp = DirectDispatcher::new(pool, Arc::new(DriverRegistry::with_defaults()))
        .with_metrics(sink.clone())
        .complete(
            CompletionRequest::new("deepseek-chat", vec![Message::user("ping")]),
            &fixture.channel(Vendor::DeepSeek),
        )
        .await;

    assert!(!resp.is_error(), "{:?}", resp.error);
    busy.assert_async().await;
    ok.assert_async().await;
    assert!(sink.wait_for(1, Duration::from_secs(2)).await);
    assert_eq!(sink.records()[0].retries, 1);
}
