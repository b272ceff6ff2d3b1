//! One canonical conversation compiled for every vendor family.

mod common;

use std::sync::Arc;

use common::{direct, MockServerFixture};
use llm_gateway_core::channel::{ChannelConfig, Credential, Vendor};
use llm_gateway_core::dispatch::Dispatcher;
use llm_gateway_core::drivers::{create_driver, DriverRegistry};
use llm_gateway_core::telemetry::InMemoryMetricsSink;
use llm_gateway_core::transport::HttpRequest;
use llm_gateway_core::types::{
    CompletionRequest, ContentPart, Message, MessageContent, MessageRole, Tool, ToolCall,
};
use serde_json::{json, Value};

const PNG: &str = "data:image/png;base64,iVBORw0KGgo=";

fn conversation() -> CompletionRequest {
    CompletionRequest::new(
        "canonical-model",
        vec![
            Message::system("answer briefly"),
            Message::with_content(
                MessageRole::User,
                MessageContent::Parts(vec![ContentPart::text("weather here?"), ContentPart::image_url(PNG)]),
            ),
            Message::assistant_tool_calls(vec![ToolCall::new("call_1", "weather", r#"{"city":"Lima"}"#)]),
            Message::tool("call_1", r#"{"temp":21}"#),
        ],
    )
    .with_tools(vec![Tool::function(
        "weather",
        Some("current weather".into()),
        json!({"type": "object", "properties": {"city": {"type": "string"}}}),
    )])
    .with_max_tokens(256)
}

fn compile(vendor: Vendor, channel: &ChannelConfig) -> (HttpRequest, Value) {
    let http = create_driver(vendor).build_request(&conversation(), channel).unwrap();
    let body: Value = serde_json::from_slice(&http.body).unwrap();
    (http, body)
}

fn channel(vendor: Vendor, base: &str) -> ChannelConfig {
    ChannelConfig::new(vendor, base, Credential::Bearer { token: "tok".into() })
}

#[test]
fn openai_family_keeps_the_canonical_shape() {
    let (http, body) = compile(Vendor::DeepSeek, &channel(Vendor::DeepSeek, "https://api.deepseek.com/v1"));
    assert_eq!(http.url, "https://api.deepseek.com/v1/chat/completions");
    assert_eq!(http.header("authorization"), Some("Bearer tok"));
    assert_eq!(body["model"], "canonical-model");
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[3]["role"], "tool");
    assert_eq!(messages[3]["tool_call_id"], "call_1");
    assert_eq!(body["tools"][0]["function"]["name"], "weather");
}

#[test]
fn azure_uses_deployment_and_key_header() {
    let mut ch = ChannelConfig::new(
        Vendor::AzureOpenAi,
        "https://res.openai.azure.com",
        Credential::ApiKey { key: "az".into() },
    )
    .with_deploy_name("prod-4o");
    ch.api_version = Some("2024-10-21".into());
    let (http, _) = compile(Vendor::AzureOpenAi, &ch);
    assert!(http.url.contains("/openai/deployments/prod-4o/chat/completions"));
    assert!(http.url.ends_with("api-version=2024-10-21"));
    assert_eq!(http.header("api-key"), Some("az"));
    assert_eq!(http.header("authorization"), None);
}

#[test]
fn bedrock_splits_system_and_decodes_images() {
    let ch = channel(Vendor::Bedrock, "https://bedrock-runtime.us-east-1.amazonaws.com").with_deploy_name("anthropic.claude-v2:1");
    let (http, body) = compile(Vendor::Bedrock, &ch);
    assert_eq!(
        http.url,
        "https://bedrock-runtime.us-east-1.amazonaws.com/model/anthropic.claude-v2%3A1/converse"
    );
    assert_eq!(body["system"][0]["text"], "answer briefly");
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"][1]["image"]["format"], "png");
    assert_eq!(messages[1]["content"][0]["toolUse"]["input"]["city"], "Lima");
    assert_eq!(messages[2]["role"], "user");
    assert_eq!(messages[2]["content"][0]["toolResult"]["toolUseId"], "call_1");
    assert_eq!(body["inferenceConfig"]["maxTokens"], 256);
    assert_eq!(body["toolConfig"]["tools"][0]["toolSpec"]["name"], "weather");
}

#[test]
fn gemini_moves_instructions_and_resolves_tool_names() {
    let ch = ChannelConfig::new(
        Vendor::Gemini,
        "https://generativelanguage.googleapis.com/v1beta",
        Credential::ApiKey { key: "g".into() },
    );
    let (http, body) = compile(Vendor::Gemini, &ch);
    assert!(http.url.ends_with("/models/canonical-model:generateContent"));
    assert_eq!(http.header("x-goog-api-key"), Some("g"));
    assert_eq!(body["systemInstruction"]["parts"][0]["text"], "answer briefly");
    let contents = body["contents"].as_array().unwrap();
    assert_eq!(contents[0]["parts"][1]["inlineData"]["mimeType"], "image/png");
    assert_eq!(contents[1]["role"], "model");
    assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "weather");
    assert_eq!(contents[2]["parts"][0]["functionResponse"]["name"], "weather");
    assert_eq!(contents[2]["parts"][0]["functionResponse"]["response"]["temp"], 21);
    assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
}

#[test]
fn responses_flattens_into_input_items() {
    let (http, body) = compile(Vendor::Responses, &channel(Vendor::Responses, "https://api.openai.com/v1"));
    assert_eq!(http.url, "https://api.openai.com/v1/responses");
    assert_eq!(body["instructions"], "answer briefly");
    let kinds: Vec<&str> = body["input"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["type"].as_str().unwrap_or("message"))
        .collect();
    assert_eq!(kinds, vec!["message", "function_call", "function_call_output"]);
}

#[tokio::test]
async fn url_images_fail_before_any_network_call() {
    let mut fixture = MockServerFixture::new().await;
    let never = fixture
        .server
        .mock("POST", mockito::Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let request = CompletionRequest::new(
        "gemini-2.5-flash",
        vec![Message::with_content(
            MessageRole::User,
            MessageContent::Parts(vec![ContentPart::image_url("https://example.com/cat.png")]),
        )],
    );
    let resp = direct(Arc::new(InMemoryMetricsSink::default()))
        .complete(request, &fixture.channel(Vendor::Gemini))
        .await;

    let err = resp.error.unwrap();
    assert_eq!(err.http_code, Some(400));
    never.assert_async().await;
}

#[test]
fn every_vendor_has_a_driver() {
    let registry = DriverRegistry::with_defaults();
    assert_eq!(registry.len(), 11);
    for vendor in [Vendor::Qwen, Vendor::Zhipu, Vendor::Doubao, Vendor::Moonshot, Vendor::Vertex] {
        assert_eq!(registry.get(vendor).unwrap().vendor(), vendor);
    }
}
