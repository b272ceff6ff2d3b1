//! For every vendor family, a stream with two interleaved tool calls folds
//! back into the same message the non-streaming call returns.

mod common;

use std::sync::Arc;

use common::{direct, event_stream, sse, MockServerFixture, Recorder};
use llm_gateway_core::channel::Vendor;
use llm_gateway_core::dispatch::Dispatcher;
use llm_gateway_core::pipeline::StreamAccumulator;
use llm_gateway_core::telemetry::InMemoryMetricsSink;
use llm_gateway_core::types::{CompletionRequest, CompletionResponse, FinishReason, Message, Tool};
use mockito::Matcher;
use serde_json::{json, Value};

#[derive(Debug, PartialEq)]
struct Summary {
    text: String,
    calls: Vec<(u32, String, Value)>,
    finish: Option<FinishReason>,
    total_tokens: Option<u64>,
}

fn summarize(resp: &CompletionResponse) -> Summary {
    let choice = resp.choices.first().expect("one choice");
    let calls = choice
        .message
        .tool_calls
        .clone()
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let args: Value = serde_json::from_str(&c.function.arguments).expect("arguments are JSON");
            (i as u32, c.function.name, args)
        })
        .collect();
    Summary {
        text: choice.message.text(),
        calls,
        finish: choice.finish_reason,
        total_tokens: resp.usage.as_ref().map(|u| u.total_tokens),
    }
}

fn request() -> CompletionRequest {
    CompletionRequest::new("m", vec![Message::user("Weather and time in Paris?")]).with_tools(vec![
        Tool::function("get_weather", None, json!({"type": "object"})),
        Tool::function("get_time", None, json!({"type": "object"})),
    ])
}

fn expected() -> Summary {
    Summary {
        text: "Checking".into(),
        calls: vec![
            (0, "get_weather".into(), json!({"city": "Paris"})),
            (1, "get_time".into(), json!({"tz": "CET"})),
        ],
        finish: Some(FinishReason::ToolCalls),
        total_tokens: Some(59),
    }
}

async fn both_ways(fixture: &MockServerFixture, vendor: Vendor, model: &str) -> (Summary, Summary) {
    let dispatcher = direct(Arc::new(InMemoryMetricsSink::default()));
    let channel = fixture.channel(vendor);
    let mut req = request();
    req.model = model.to_string();

    let complete = dispatcher.complete(req.clone(), &channel).await;
    assert!(!complete.is_error(), "{:?}", complete.error);

    let mut rec = Recorder::default();
    let outcome = dispatcher.stream(req, &channel, &mut rec).await;
    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(rec.calls.last(), Some(&"complete"));

    let mut acc = StreamAccumulator::new();
    rec.chunks.iter().for_each(|c| acc.push(c));
    (summarize(&complete), summarize(&acc.finish()))
}

#[tokio::test]
async fn openai_chat_stream_matches_completion() {
    let mut fixture = MockServerFixture::new().await;
    let _sync = fixture
        .server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({"stream": false})))
        .with_status(200)
        .with_body(
            json!({
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "finish_reason": "tool_calls", "message": {
                    "role": "assistant",
                    "content": "Checking",
                    "tool_calls": [
                        {"id": "call_a", "type": "function", "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}},
                        {"id": "call_b", "type": "function", "function": {"name": "get_time", "arguments": "{\"tz\":\"CET\"}"}}
                    ]}}],
                "usage": {"prompt_tokens": 42, "completion_tokens": 17, "total_tokens": 59}
            })
            .to_string(),
        )
        .create_async()
        .await;
    let _stream = fixture
        .server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({"stream": true})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse(
            &[
                json!({"id": "chatcmpl-2", "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Checking"}}]}),
                json!({"id": "chatcmpl-2", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "call_a", "type": "function", "function": {"name": "get_weather", "arguments": ""}}]}}]}),
                json!({"id": "chatcmpl-2", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 1, "id": "call_b", "type": "function", "function": {"name": "get_time", "arguments": ""}}]}}]}),
                json!({"id": "chatcmpl-2", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 1, "function": {"arguments": "{\"tz\":"}}]}}]}),
                json!({"id": "chatcmpl-2", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"city\":\"Paris\"}"}}]}}]}),
                json!({"id": "chatcmpl-2", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 1, "function": {"arguments": "\"CET\"}"}}]}}]}),
                json!({"id": "chatcmpl-2", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
                json!({"id": "chatcmpl-2", "choices": [], "usage": {"prompt_tokens": 42, "completion_tokens": 17, "total_tokens": 59}}),
            ],
            true,
        ))
        .create_async()
        .await;

    let (complete, streamed) = both_ways(&fixture, Vendor::OpenAi, "gpt-4o").await;
    assert_eq!(complete, expected());
    assert_eq!(streamed, expected());
}

#[tokio::test]
async fn gemini_stream_matches_completion() {
    let mut fixture = MockServerFixture::new().await;
    let usage = json!({"promptTokenCount": 42, "candidatesTokenCount": 17, "totalTokenCount": 59});
    let _sync = fixture
        .server
        .mock("POST", "/models/gemini-2.5-flash:generateContent")
        .with_status(200)
        .with_body(
            json!({
                "responseId": "g-1",
                "candidates": [{"finishReason": "STOP", "content": {"role": "model", "parts": [
                    {"text": "Checking"},
                    {"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}},
                    {"functionCall": {"name": "get_time", "args": {"tz": "CET"}}}
                ]}}],
                "usageMetadata": usage
            })
            .to_string(),
        )
        .create_async()
        .await;
    let _stream = fixture
        .server
        .mock("POST", Matcher::Regex(r"^/models/gemini-2\.5-flash:streamGenerateContent".into()))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse(
            &[
                json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Checking"}]}}]}),
                json!({"candidates": [{"content": {"role": "model", "parts": [
                    {"functionCall": {"name": "get_weather", "args": {"city": "Paris"}}}
                ]}}]}),
                json!({"candidates": [{"content": {"role": "model", "parts": [
                    {"functionCall": {"name": "get_time", "args": {"tz": "CET"}}}
                ]}}]}),
                json!({"candidates": [{"finishReason": "STOP", "content": {"role": "model", "parts": []}}], "usageMetadata": usage}),
            ],
            false,
        ))
        .create_async()
        .await;

    let (complete, streamed) = both_ways(&fixture, Vendor::Gemini, "gemini-2.5-flash").await;
    assert_eq!(complete, expected());
    assert_eq!(streamed, expected());
}

#[tokio::test]
async fn bedrock_event_stream_matches_converse() {
    let mut fixture = MockServerFixture::new().await;
    let _sync = fixture
        .server
        .mock("POST", "/model/claude-sonnet/converse")
        .with_status(200)
        .with_body(
            json!({
                "output": {"message": {"role": "assistant", "content": [
                    {"text": "Checking"},
                    {"toolUse": {"toolUseId": "tu_a", "name": "get_weather", "input": {"city": "Paris"}}},
                    {"toolUse": {"toolUseId": "tu_b", "name": "get_time", "input": {"tz": "CET"}}}
                ]}},
                "stopReason": "tool_use",
                "usage": {"inputTokens": 42, "outputTokens": 17, "totalTokens": 59}
            })
            .to_string(),
        )
        .create_async()
        .await;
    let _stream = fixture
        .server
        .mock("POST", "/model/claude-sonnet/converse-stream")
        .with_status(200)
        .with_header("content-type", "application/vnd.amazon.eventstream")
        .with_body(event_stream(&[
            ("messageStart", json!({"role": "assistant"})),
            ("contentBlockDelta", json!({"contentBlockIndex": 0, "delta": {"text": "Checking"}})),
            ("contentBlockStop", json!({"contentBlockIndex": 0})),
            ("contentBlockStart", json!({"contentBlockIndex": 1, "start": {"toolUse": {"toolUseId": "tu_a", "name": "get_weather"}}})),
            ("contentBlockStart", json!({"contentBlockIndex": 2, "start": {"toolUse": {"toolUseId": "tu_b", "name": "get_time"}}})),
            ("contentBlockDelta", json!({"contentBlockIndex": 2, "delta": {"toolUse": {"input": "{\"tz\":"}}})),
            ("contentBlockDelta", json!({"contentBlockIndex": 1, "delta": {"toolUse": {"input": "{\"city\":\"Paris\"}"}}})),
            ("contentBlockDelta", json!({"contentBlockIndex": 2, "delta": {"toolUse": {"input": "\"CET\"}"}}})),
            ("contentBlockStop", json!({"contentBlockIndex": 1})),
            ("contentBlockStop", json!({"contentBlockIndex": 2})),
            ("messageStop", json!({"stopReason": "tool_use"})),
            ("metadata", json!({"usage": {"inputTokens": 42, "outputTokens": 17, "totalTokens": 59}})),
        ]))
        .create_async()
        .await;

    let (complete, streamed) = both_ways(&fixture, Vendor::Bedrock, "claude-sonnet").await;
    assert_eq!(complete, expected());
    assert_eq!(streamed, expected());
}

#[tokio::test]
async fn responses_stream_matches_response_object() {
    let mut fixture = MockServerFixture::new().await;
    let usage = json!({"input_tokens": 42, "output_tokens": 17, "total_tokens": 59});
    let _sync = fixture
        .server
        .mock("POST", "/responses")
        .match_body(Matcher::PartialJson(json!({"stream": false})))
        .with_status(200)
        .with_body(
            json!({
                "id": "resp_1",
                "status": "completed",
                "output": [
                    {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "Checking"}]},
                    {"type": "function_call", "id": "fc_a", "call_id": "call_a", "name": "get_weather", "arguments": "{\"city\":\"Paris\"}"},
                    {"type": "function_call", "id": "fc_b", "call_id": "call_b", "name": "get_time", "arguments": "{\"tz\":\"CET\"}"}
                ],
                "usage": usage
            })
            .to_string(),
        )
        .create_async()
        .await;
    let _stream = fixture
        .server
        .mock("POST", "/responses")
        .match_body(Matcher::PartialJson(json!({"stream": true})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(sse(
            &[
                json!({"type": "response.created", "response": {"id": "resp_2", "status": "in_progress"}}),
                json!({"type": "response.output_text.delta", "item_id": "msg_1", "delta": "Checking"}),
                json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_a", "call_id": "call_a", "name": "get_weather", "arguments": ""}}),
                json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_b", "call_id": "call_b", "name": "get_time", "arguments": ""}}),
                json!({"type": "response.function_call_arguments.delta", "item_id": "fc_b", "delta": "{\"tz\":"}),
                json!({"type": "response.function_call_arguments.delta", "item_id": "fc_a", "delta": "{\"city\":\"Paris\"}"}),
                json!({"type": "response.function_call_arguments.delta", "item_id": "fc_b", "delta": "\"CET\"}"}),
                json!({"type": "response.completed", "response": {"id": "resp_2", "status": "completed", "usage": usage}}),
            ],
            false,
        ))
        .create_async()
        .await;

    let (complete, streamed) = both_ways(&fixture, Vendor::Responses, "gpt-5").await;
    assert_eq!(complete, expected());
    assert_eq!(streamed, expected());
}
