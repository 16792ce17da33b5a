use std::time::Duration;

use httpmock::prelude::*;
use imagegen::generation::{
    execute_with_retry, BackendErrorKind, BackendRequest, GenerationBackend, GenerationInput,
    GenerationRequest, HttpGenerationBackend, InputImage, RetryError, RetryPolicy,
};
use serde_json::json;
use tokio::time::Instant;

fn text_request() -> BackendRequest {
    BackendRequest::from_request(&GenerationRequest::new(
        "  a paper boat  ",
        GenerationInput::TextToImage,
    ))
}

fn backend(server: &MockServer, timeout: Duration) -> HttpGenerationBackend {
    HttpGenerationBackend::new(&server.base_url(), Some("test-key".to_string()), timeout).unwrap()
}

#[tokio::test]
async fn successful_generation_is_decoded() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/generations")
                .header("authorization", "Bearer test-key")
                .json_body_partial(r#"{"generation_type":"text-to-image","prompt":"a paper boat"}"#);
            then.status(200).json_body(json!({
                "images": [
                    {"url": "https://cdn.test/boat.png", "width": 512, "height": 512}
                ],
                "metadata": {"model": "base-v2", "seed": 42},
                "usage": {"gpu_ms": 800}
            }));
        })
        .await;

    let response = backend(&server, Duration::from_secs(5))
        .invoke(&text_request())
        .await
        .expect("backend call succeeds");

    assert_eq!(response.images.len(), 1);
    assert_eq!(response.images[0].width, Some(512));
    assert_eq!(response.metadata["seed"], 42);
    mock.assert_async().await;
}

#[tokio::test]
async fn image_inputs_and_strength_are_sent() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/generations").json_body_partial(
                r#"{"generation_type":"image-to-image","strength":0.25,"input_images":[{"url":"https://img.test/src.png"}]}"#,
            );
            then.status(200)
                .json_body(json!({"images": [{"url": "https://cdn.test/out.png", "width": 64, "height": 64}]}));
        })
        .await;

    let request = BackendRequest::from_request(&GenerationRequest::new(
        "paint it blue",
        GenerationInput::ImageToImage {
            source: InputImage::new("https://img.test/src.png"),
            strength: 0.25,
        },
    ));
    backend(&server, Duration::from_secs(5))
        .invoke(&request)
        .await
        .expect("backend call succeeds");
    mock.assert_async().await;
}

#[tokio::test]
async fn content_policy_bodies_are_terminal() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/generations");
            then.status(400).json_body(json!({
                "error": {"code": "content_policy_violation", "message": "prompt rejected"}
            }));
        })
        .await;

    let err = backend(&server, Duration::from_secs(5))
        .invoke(&text_request())
        .await
        .unwrap_err();
    assert_eq!(err.kind, BackendErrorKind::SafetyRejected);
    assert_eq!(err.status, Some(400));
    assert_eq!(err.message, "prompt rejected");
}

#[tokio::test]
async fn auth_and_rate_limit_statuses_are_classified() {
    let server = MockServer::start_async().await;
    let mut unauthorized = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/generations");
            then.status(401).body("bad key");
        })
        .await;

    let client = backend(&server, Duration::from_secs(5));
    let err = client.invoke(&text_request()).await.unwrap_err();
    assert_eq!(err.kind, BackendErrorKind::InvalidAuth);
    assert_eq!(err.message, "bad key");
    unauthorized.delete_async().await;

    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/generations");
            then.status(429);
        })
        .await;
    let err = client.invoke(&text_request()).await.unwrap_err();
    assert_eq!(err.kind, BackendErrorKind::RateLimited);
}

#[tokio::test]
async fn slow_backends_time_out() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/generations");
            then.status(200)
                .delay(Duration::from_secs(2))
                .json_body(json!({"images": []}));
        })
        .await;

    let err = backend(&server, Duration::from_millis(200))
        .invoke(&text_request())
        .await
        .unwrap_err();
    assert_eq!(err.kind, BackendErrorKind::Timeout);
}

#[tokio::test]
async fn upstream_outages_exhaust_the_retry_budget() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1/generations");
            then.status(503).body("maintenance");
        })
        .await;

    let client = backend(&server, Duration::from_secs(5));
    let request = text_request();
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(20),
        ..RetryPolicy::default()
    };
    let err = execute_with_retry(&policy, Instant::now() + Duration::from_secs(10), |_| {
        client.invoke(&request)
    })
    .await
    .unwrap_err();

    match err {
        RetryError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert_eq!(last.kind, BackendErrorKind::UpstreamError);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(mock.hits_async().await, 3);
}
