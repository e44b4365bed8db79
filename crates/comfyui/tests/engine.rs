//! Engine client tests against a wiremock ComfyUI.
//!
//! These tests verify:
//! - Completion polling (poll counts, execution errors, deadlines)
//! - Submission errors and transient-error retries
//! - Image retrieval order
//! - The startup readiness gate

use std::collections::VecDeque;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_comfyui::engine::{EngineClient, EngineConfig, EngineError, ImageSource};
use comfyrun_comfyui::readiness::{wait_for_service, ReadinessConfig};
use comfyrun_comfyui::retry::RetryConfig;
use comfyrun_core::graph::JobGraph;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const PROMPT_ID: &str = "3f1c2b7a-prompt";

#[derive(Clone)]
struct SequenceResponder {
    templates: Arc<Mutex<VecDeque<ResponseTemplate>>>,
    fallback: ResponseTemplate,
}

impl SequenceResponder {
    /// Serve `templates` in order, then keep serving `fallback`.
    fn new(templates: Vec<ResponseTemplate>, fallback: ResponseTemplate) -> Self {
        Self {
            templates: Arc::new(Mutex::new(templates.into_iter().collect())),
            fallback,
        }
    }
}

impl Respond for SequenceResponder {
    fn respond(&self, _req: &Request) -> ResponseTemplate {
        let mut templates = self.templates.lock().expect("mutex should not be poisoned");
        templates.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        backoff_factor: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        retry_post: true,
    }
}

fn engine_for(server: &MockServer) -> EngineClient {
    engine_with_source(server, ImageSource::Http)
}

fn engine_with_source(server: &MockServer, image_source: ImageSource) -> EngineClient {
    let api = ComfyUIApi::with_client(reqwest::Client::new(), server.uri(), fast_retry());
    EngineClient::new(
        api,
        EngineConfig {
            poll_interval: Duration::from_millis(10),
            image_source,
        },
    )
}

fn graph() -> JobGraph {
    JobGraph::from_value(&json!({
        "1": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "x.safetensors" } }
    }))
    .unwrap()
}

fn completed_history(images: Value) -> Value {
    json!({
        PROMPT_ID: {
            "outputs": { "9": { "images": images } },
            "status": { "status_str": "success", "completed": true, "messages": [] }
        }
    })
}

fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(10)
}

async fn history_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == format!("/history/{PROMPT_ID}"))
        .count()
}

async fn handle_for(engine: &EngineClient, server: &MockServer) -> comfyrun_comfyui::engine::PromptHandle {
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "prompt_id": PROMPT_ID, "number": 1, "node_errors": {}
        })))
        .mount(server)
        .await;
    engine.submit(&graph()).await.unwrap()
}

// ---------------------------------------------------------------------------
// Completion polling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn polls_until_history_is_populated() {
    let server = MockServer::start().await;
    let engine = engine_for(&server);
    let handle = handle_for(&engine, &server).await;

    let empty = ResponseTemplate::new(200).set_body_json(json!({}));
    let n = 4;
    Mock::given(method("GET"))
        .and(path(format!("/history/{PROMPT_ID}")))
        .respond_with(SequenceResponder::new(
            vec![empty; n],
            ResponseTemplate::new(200).set_body_json(completed_history(json!([
                {"filename": "out_00001_.png", "subfolder": "", "type": "output"}
            ]))),
        ))
        .mount(&server)
        .await;

    let entry = engine
        .await_completion(&handle, far_deadline(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(entry.output_images().len(), 1);
    assert_eq!(history_requests(&server).await, n + 1);
}

#[tokio::test]
async fn execution_error_stops_polling_immediately() {
    let server = MockServer::start().await;
    let engine = engine_for(&server);
    let handle = handle_for(&engine, &server).await;

    Mock::given(method("GET"))
        .and(path(format!("/history/{PROMPT_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            PROMPT_ID: {
                "outputs": {},
                "status": { "status_str": "error", "completed": false, "messages": [
                    ["execution_error", {
                        "prompt_id": PROMPT_ID, "node_id": "3", "node_type": "KSampler",
                        "exception_message": "CUDA out of memory", "exception_type": "RuntimeError"
                    }]
                ]}
            }
        })))
        .mount(&server)
        .await;

    let result = engine
        .await_completion(&handle, far_deadline(), &CancellationToken::new())
        .await;

    assert_matches!(
        result,
        Err(EngineError::Execution { ref failure, .. }) if failure.message == "CUDA out of memory"
    );
    assert_eq!(history_requests(&server).await, 1);
}

#[tokio::test]
async fn transient_poll_failures_do_not_abort() {
    let server = MockServer::start().await;
    let engine = engine_for(&server);
    let handle = handle_for(&engine, &server).await;

    Mock::given(method("GET"))
        .and(path(format!("/history/{PROMPT_ID}")))
        .respond_with(SequenceResponder::new(
            vec![
                ResponseTemplate::new(502),
                ResponseTemplate::new(200).set_body_json(json!({})),
            ],
            ResponseTemplate::new(200).set_body_json(completed_history(json!([]))),
        ))
        .mount(&server)
        .await;

    engine
        .await_completion(&handle, far_deadline(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(history_requests(&server).await, 3);
}

#[tokio::test]
async fn deadline_expiry_times_out_and_abandons_prompt() {
    let server = MockServer::start().await;
    let engine = engine_for(&server);
    let handle = handle_for(&engine, &server).await;

    Mock::given(method("GET"))
        .and(path(format!("/history/{PROMPT_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/queue"))
        .and(body_partial_json(json!({"delete": [PROMPT_ID]})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/interrupt"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let deadline = Instant::now() + Duration::from_millis(100);
    let result = engine
        .await_completion(&handle, deadline, &CancellationToken::new())
        .await;

    assert_matches!(result, Err(EngineError::Timeout { ref prompt_id, .. }) if prompt_id == PROMPT_ID);
    assert!(history_requests(&server).await >= 1);
}

#[tokio::test]
async fn cancellation_stops_polling() {
    let server = MockServer::start().await;
    let engine = engine_for(&server);
    let handle = handle_for(&engine, &server).await;

    Mock::given(method("GET"))
        .and(path(format!("/history/{PROMPT_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = engine.await_completion(&handle, far_deadline(), &cancel).await;
    assert_matches!(result, Err(EngineError::Cancelled { .. }));
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_sends_graph_and_client_id() {
    let server = MockServer::start().await;
    let engine = engine_for(&server);

    Mock::given(method("POST"))
        .and(path("/prompt"))
        .and(body_partial_json(json!({
            "prompt": { "1": { "inputs": { "ckpt_name": "x.safetensors" } } },
            "client_id": engine.client_id(),
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "prompt_id": PROMPT_ID, "number": 0, "node_errors": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let handle = engine.submit(&graph()).await.unwrap();
    assert_eq!(handle.as_str(), PROMPT_ID);
}

#[tokio::test]
async fn rejected_submission_surfaces_body() {
    let server = MockServer::start().await;
    let engine = engine_for(&server);

    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "type": "prompt_outputs_failed_validation", "message": "Prompt outputs failed validation" },
            "node_errors": { "4": { "errors": [{ "message": "Value not in list" }] } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = engine.submit(&graph()).await.unwrap_err();
    assert_matches!(err, EngineError::Submission { status: 400, ref body } if body.contains("Value not in list"));
}

#[tokio::test]
async fn transient_submission_errors_are_retried() {
    let server = MockServer::start().await;
    let engine = engine_for(&server);

    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(SequenceResponder::new(
            vec![ResponseTemplate::new(503), ResponseTemplate::new(502)],
            ResponseTemplate::new(200).set_body_json(json!({
                "prompt_id": PROMPT_ID, "number": 0, "node_errors": {}
            })),
        ))
        .expect(3)
        .mount(&server)
        .await;

    let handle = engine.submit(&graph()).await.unwrap();
    assert_eq!(handle.as_str(), PROMPT_ID);
}

#[tokio::test]
async fn exhausted_retries_become_submission_error() {
    let server = MockServer::start().await;
    let engine = engine_for(&server);

    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(ResponseTemplate::new(504).set_body_string("upstream timeout"))
        .expect(3)
        .mount(&server)
        .await;

    let err = engine.submit(&graph()).await.unwrap_err();
    assert_matches!(err, EngineError::Submission { status: 504, .. });
}

// ---------------------------------------------------------------------------
// Image retrieval
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_images_preserves_engine_order() {
    let server = MockServer::start().await;
    let engine = engine_for(&server);

    for (name, bytes) in [("a.png", "first"), ("b.png", "second")] {
        Mock::given(method("GET"))
            .and(path("/view"))
            .and(query_param("filename", name))
            .and(query_param("type", "output"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.as_bytes()))
            .mount(&server)
            .await;
    }

    let history: comfyrun_comfyui::history::History = serde_json::from_value(completed_history(json!([
        {"filename": "b.png", "subfolder": "", "type": "output"},
        {"filename": "a.png", "subfolder": "", "type": "output"}
    ])))
    .unwrap();
    let entry = &history[PROMPT_ID];

    let blobs = engine.fetch_images(entry).await.unwrap();
    assert_eq!(blobs, vec![b"second".to_vec(), b"first".to_vec()]);
}

#[tokio::test]
async fn fetch_images_reads_shared_volume() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("out.png"), b"from-volume").unwrap();
    let engine = engine_with_source(&server, ImageSource::SharedVolume(dir.path().to_path_buf()));

    let history: comfyrun_comfyui::history::History = serde_json::from_value(completed_history(json!([
        {"filename": "out.png", "subfolder": "", "type": "output"}
    ])))
    .unwrap();

    let blobs = engine.fetch_images(&history[PROMPT_ID]).await.unwrap();
    assert_eq!(blobs, vec![b"from-volume".to_vec()]);
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

// ---------------------------------------------------------------------------
// Readiness gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn readiness_waits_for_unreachable_engine() {
    // Reserve a port, then release it so nothing is listening yet.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let api = ComfyUIApi::with_client(
        reqwest::Client::new(),
        format!("http://{addr}"),
        RetryConfig::disabled(),
    );
    let config = ReadinessConfig {
        interval: Duration::from_millis(10),
        log_every: 15,
    };
    let cancel = CancellationToken::new();

    let waiter = tokio::spawn(async move { wait_for_service(&api, &config, &cancel).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!waiter.is_finished(), "readiness must keep polling while unreachable");

    let server = MockServer::builder()
        .listener(TcpListener::bind(addr).unwrap())
        .start()
        .await;
    Mock::given(method("GET"))
        .and(path("/system_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"system": {}, "devices": []})))
        .mount(&server)
        .await;

    let ready = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("readiness should finish once the engine answers")
        .unwrap();
    assert!(ready);
}

#[tokio::test]
async fn readiness_ignores_non_success_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/system_stats"))
        .respond_with(SequenceResponder::new(
            vec![ResponseTemplate::new(500), ResponseTemplate::new(503)],
            ResponseTemplate::new(200).set_body_json(json!({})),
        ))
        .expect(3)
        .mount(&server)
        .await;

    let api = ComfyUIApi::with_client(reqwest::Client::new(), server.uri(), RetryConfig::disabled());
    let config = ReadinessConfig {
        interval: Duration::from_millis(5),
        log_every: 1,
    };
    assert!(wait_for_service(&api, &config, &CancellationToken::new()).await);
}
