//! Integration tests for the provider clients.
//!
//! These tests make real API calls to an OpenAI-compatible endpoint.
//! Run with: OPENAI_API_KEY=your_key cargo test --test llm_integration -- --ignored

use eval_forge::llm::{
    BatchClient, BatchItem, BatchPoll, ChatClient, ChatRequest, OpenAiBatchClient,
    OpenAiChatClient,
};
use eval_forge::LlmError;

const TEST_MODEL: &str = "gpt-4.1-mini";

fn create_chat_client() -> OpenAiChatClient {
    OpenAiChatClient::from_env()
        .expect("OPENAI_API_KEY environment variable must be set for integration tests")
}

fn create_batch_client() -> OpenAiBatchClient {
    OpenAiBatchClient::from_env()
        .expect("OPENAI_API_KEY environment variable must be set for integration tests")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llm_integration -- --ignored
async fn test_simple_chat() {
    let client = create_chat_client();

    let request = ChatRequest::new(TEST_MODEL, "What is 2 + 2? Reply with just the number.")
        .with_system("You are a helpful assistant. Reply concisely.")
        .with_max_tokens(Some(10));

    let response = client.chat(request).await;
    assert!(response.is_ok(), "Chat failed: {:?}", response.err());

    let response = response.expect("Should have response");
    assert!(
        response.text.contains('4'),
        "Response should contain '4', got: {}",
        response.text
    );
    assert!(response.input_tokens.unwrap_or(0) > 0, "Should report input tokens");
}

#[tokio::test]
#[ignore]
async fn test_unknown_model_is_api_error() {
    let client = create_chat_client();

    let request = ChatRequest::new("no-such-model-eval-forge", "Hello");
    let err = client.chat(request).await.expect_err("unknown model should fail");
    assert!(
        matches!(err, LlmError::ApiError { .. }),
        "Expected ApiError, got: {:?}",
        err
    );
}

#[tokio::test]
#[ignore]
async fn test_batch_submit_and_poll() {
    let client = create_batch_client();

    let items = (0..2)
        .map(|i| BatchItem {
            custom_id: format!("integration-{}", i),
            request: ChatRequest::new(TEST_MODEL, format!("Reply with the number {}.", i))
                .with_max_tokens(Some(5)),
        })
        .collect();

    let batch_ref = client.submit(TEST_MODEL, items).await;
    assert!(batch_ref.is_ok(), "Submit failed: {:?}", batch_ref.err());
    let batch_ref = batch_ref.expect("Should have batch reference");
    assert!(!batch_ref.is_empty());

    // Batches take minutes to hours; only check that the first poll succeeds.
    let poll = client.poll(&batch_ref).await;
    assert!(poll.is_ok(), "Poll failed: {:?}", poll.err());
    if let Ok(BatchPoll::Error(reason)) = poll {
        panic!("Fresh batch reported an error: {}", reason);
    }
}
