#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use comfyrun_worker::config::WorkerConfig;
use comfyrun_worker::handler::JobHandler;
use comfyrun_worker::routes::build_router;
use comfyrun_worker::state::AppState;

pub const PROMPT_ID: &str = "9a0c1d2e-prompt";

/// Templates shipped with the repository.
pub fn workflows_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../workflows")
}

/// Worker configuration pointed at a mock engine, with fast polling.
pub fn test_config(comfyui_url: String) -> WorkerConfig {
    WorkerConfig {
        comfyui_url,
        workflow_dir: workflows_dir(),
        job_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        http_max_retries: 1,
        http_backoff: Duration::from_millis(5),
        ..WorkerConfig::default()
    }
}

pub fn build_handler(server: &MockServer) -> JobHandler {
    JobHandler::from_config(&test_config(server.uri()), reqwest::Client::new())
}

pub fn build_test_app(server: &MockServer) -> Router {
    build_test_app_with_timeout(server, Duration::from_secs(5)).0
}

/// Router plus the state behind it, so tests can hold the job slot.
pub fn build_test_app_with_timeout(server: &MockServer, job_timeout: Duration) -> (Router, AppState) {
    let config = WorkerConfig {
        job_timeout,
        ..test_config(server.uri())
    };
    let handler = JobHandler::from_config(&config, reqwest::Client::new());
    let state = AppState::new(handler, CancellationToken::new());
    (build_router(state.clone()), state)
}

/// Payload for the shipped txt2img template.
pub fn txt2img_payload() -> Value {
    json!({
        "seed": 42,
        "steps": 20,
        "cfg_scale": 8,
        "sampler_name": "euler",
        "ckpt_name": "x.safetensors",
        "batch_size": 1,
        "width": 512,
        "height": 512,
        "prompt": "a cat",
        "negative_prompt": "blurry"
    })
}

/// Mount an always-empty history (prompt never finishes) and accept the
/// dequeue / interrupt calls made when it is abandoned.
pub async fn mount_never_finishing(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("/history/{PROMPT_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
    for route in ["/queue", "/interrupt"] {
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }
}

/// Number of requests the engine received for `method_name path`.
pub async fn request_count(server: &MockServer, method_name: &str, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == method_name && r.url.path() == route)
        .count()
}

/// Mount `POST /prompt` accepting any graph.
pub async fn mount_submit(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/prompt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "prompt_id": PROMPT_ID, "number": 0, "node_errors": {}
        })))
        .mount(server)
        .await;
}

/// Mount a finished history entry whose SaveImage node produced `files`,
/// and a `/view` route serving `<filename>-bytes` for each.
pub async fn mount_completed(server: &MockServer, files: &[&str]) {
    let images: Vec<Value> = files
        .iter()
        .map(|f| json!({"filename": f, "subfolder": "", "type": "output"}))
        .collect();

    Mock::given(method("GET"))
        .and(path(format!("/history/{PROMPT_ID}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            PROMPT_ID: {
                "outputs": { "9": { "images": images } },
                "status": { "status_str": "success", "completed": true, "messages": [] }
            }
        })))
        .mount(server)
        .await;

    for file in files {
        Mock::given(method("GET"))
            .and(path("/view"))
            .and(wiremock::matchers::query_param("filename", *file))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(format!("{file}-bytes")))
            .mount(server)
            .await;
    }
}

/// The JSON body of the (single) `POST /prompt` the engine received.
pub async fn submitted_prompt(server: &MockServer) -> Value {
    let requests = server.received_requests().await.unwrap_or_default();
    let submit = requests
        .iter()
        .find(|r| r.method.as_str() == "POST" && r.url.path() == "/prompt")
        .expect("a workflow should have been submitted");
    serde_json::from_slice(&submit.body).unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
