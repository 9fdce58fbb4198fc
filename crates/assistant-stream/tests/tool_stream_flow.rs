use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assistant_stream::events::{TOOL_FAILURE_FALLBACK, ToolStreamRequest};
use assistant_stream::prelude::*;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::{StreamExt as _, stream};
use tokio::net::TcpListener;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(3);
const TOOL_PATH: &str = "/tools/tests/generate";

#[derive(Clone, Default)]
struct MockState {
    requests: Arc<Mutex<Vec<ToolStreamRequest>>>,
}

fn token_frame(stage: &str, message: &str) -> String {
    format!(
        "event: token\ndata: {{\"type\":\"token\",\"payload\":{{\"stage\":\"{stage}\",\"message\":\"{message}\",\"timestamp\":\"2025-01-01T00:00:00Z\"}}}}\n\n"
    )
}

fn tool_frame(stage: &str, status: &str, summary: Option<&str>) -> String {
    let summary = summary
        .map(|s| format!(",\"summary\":\"{s}\""))
        .unwrap_or_default();
    format!(
        "event: tool\r\ndata: {{\"type\":\"tool\",\"payload\":{{\"stage\":\"{stage}\",\"status\":\"{status}\"{summary},\"timestamp\":\"2025-01-01T00:00:01Z\"}}}}\r\n\r\n"
    )
}

fn pipeline(last: String) -> String {
    [
        token_frame("test_generation", "writing tests"),
        tool_frame("pytest_initial_run", "in_progress", None),
        token_frame("pytest_initial_run", "1 failed"),
        token_frame("fix_application", "patching"),
        token_frame("pytest_rerun", "all passed"),
        last,
    ]
    .concat()
}

async fn spawn_tool_server(body: Result<String, StatusCode>, open: bool) -> (String, MockState) {
    let state = MockState::default();
    let app = Router::new()
        .route(
            TOOL_PATH,
            post(
                move |State(state): State<MockState>, Json(request): Json<ToolStreamRequest>| {
                    let body = body.clone();
                    async move {
                        state.requests.lock().expect("requests lock").push(request);
                        match body {
                            Ok(body) if open => sse(Body::from_stream(
                                stream::iter([Ok::<_, std::io::Error>(body)])
                                    .chain(stream::pending()),
                            )),
                            Ok(body) => sse(Body::from(body)),
                            Err(status) => (status, "pipeline unavailable").into_response(),
                        }
                    }
                },
            ),
        )
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let address: SocketAddr = listener.local_addr().expect("mock listener local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("run mock server");
    });
    (format!("http://{address}"), state)
}

fn sse(body: Body) -> Response {
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

fn tool_stream(base_url: &str) -> ToolStream {
    let config = ClientConfig::new(base_url).connect_timeout(Duration::from_secs(1));
    ToolStream::new(ToolTransport::new(config).expect("tool transport"))
}

fn conversation() -> Vec<ConversationTurn> {
    vec![
        ConversationTurn::new(Role::User, "add tests for the parser"),
        ConversationTurn::new(Role::Assistant, "on it"),
    ]
}

async fn run_to_end(base_url: &str) -> SessionState<ToolStreamEvent> {
    let mut tools = tool_stream(base_url);
    tools.generate(conversation()).await;
    timeout(TEST_TIMEOUT, tools.wait())
        .await
        .expect("tool session timeout")
}

#[tokio::test]
async fn successful_pipeline_completes_and_posts_conversation() {
    let body = pipeline(tool_frame("completed", "succeeded", Some("5 passed")));
    let (base_url, state) = spawn_tool_server(Ok(body), false).await;

    let session = run_to_end(&base_url).await;

    assert_eq!(session.status(), StreamStatus::Completed);
    assert_eq!(session.last_error(), None);
    assert_eq!(session.events().len(), 6);
    assert_eq!(session.current_stage(), Some(ToolStage::Completed));
    assert_eq!(
        session.stage_status(ToolStage::PytestInitialRun),
        Some(ToolStatus::InProgress)
    );

    let requests = state.requests.lock().expect("requests lock").clone();
    assert_eq!(requests, vec![ToolStreamRequest::new(conversation())]);
}

#[tokio::test]
async fn failed_final_stage_surfaces_summary() {
    let body = pipeline(tool_frame("completed", "failed", Some("X")));
    let (base_url, _) = spawn_tool_server(Ok(body), false).await;

    let session = run_to_end(&base_url).await;

    assert_eq!(session.status(), StreamStatus::Error);
    assert_eq!(session.last_error(), Some("X"));
}

#[tokio::test]
async fn failed_final_stage_without_summary_uses_fallback() {
    let body = pipeline(tool_frame("completed", "failed", None));
    let (base_url, _) = spawn_tool_server(Ok(body), false).await;

    let session = run_to_end(&base_url).await;

    assert_eq!(session.status(), StreamStatus::Error);
    assert_eq!(session.last_error(), Some(TOOL_FAILURE_FALLBACK));
}

#[tokio::test]
async fn close_without_final_stage_is_incomplete() {
    let body = [
        token_frame("test_generation", "writing tests"),
        token_frame("pytest_initial_run", "running"),
    ]
    .concat();
    let (base_url, _) = spawn_tool_server(Ok(body), false).await;

    let session = run_to_end(&base_url).await;

    assert_eq!(session.status(), StreamStatus::Error);
    assert_eq!(session.failure(), Some(&StreamFailure::Incomplete));
    assert_eq!(session.last_error(), Some("stream ended before completion"));
    assert_eq!(session.events().len(), 2);
}

#[tokio::test]
async fn unterminated_final_frame_is_discarded() {
    let last = tool_frame("completed", "succeeded", None);
    let body = format!("{}{}", token_frame("test_generation", "x"), last.trim_end());
    let (base_url, _) = spawn_tool_server(Ok(body), false).await;

    let session = run_to_end(&base_url).await;

    assert_eq!(session.status(), StreamStatus::Error);
    assert_eq!(session.failure(), Some(&StreamFailure::Incomplete));
    assert_eq!(session.events().len(), 1);
}

#[tokio::test]
async fn http_error_status_is_reported() {
    let (base_url, _) = spawn_tool_server(Err(StatusCode::INTERNAL_SERVER_ERROR), false).await;

    let session = run_to_end(&base_url).await;

    assert_eq!(session.status(), StreamStatus::Error);
    assert_eq!(session.last_error(), Some("API error: 500"));
    assert!(session.events().is_empty());
}

#[tokio::test]
async fn unknown_event_shape_is_fatal() {
    let body = format!(
        "{}data: {{\"type\":\"heartbeat\"}}\n\n{}",
        token_frame("test_generation", "x"),
        tool_frame("completed", "succeeded", None)
    );
    let (base_url, _) = spawn_tool_server(Ok(body), false).await;

    let session = run_to_end(&base_url).await;

    assert_eq!(session.status(), StreamStatus::Error);
    assert!(matches!(session.failure(), Some(StreamFailure::Decode { .. })));
    assert_eq!(session.events().len(), 1);
}

#[tokio::test]
async fn server_error_event_ends_the_session() {
    let body = format!(
        "{}event: error\ndata: {{\"type\":\"error\",\"message\":\"sandbox crashed\",\"timestamp\":\"2025-01-01T00:00:02Z\"}}\n\n",
        token_frame("test_generation", "x")
    );
    let (base_url, _) = spawn_tool_server(Ok(body), true).await;

    let session = run_to_end(&base_url).await;

    assert_eq!(session.status(), StreamStatus::Error);
    assert_eq!(session.last_error(), Some("sandbox crashed"));
}

#[tokio::test]
async fn cancel_stops_an_open_pipeline() {
    let body = token_frame("test_generation", "writing tests");
    let (base_url, _) = spawn_tool_server(Ok(body), true).await;

    let mut tools = tool_stream(&base_url);
    let mut rx = tools.subscribe();
    tools.generate(conversation()).await;
    timeout(TEST_TIMEOUT, rx.wait_for(|s| s.events().len() == 1))
        .await
        .expect("first event timeout")
        .expect("state channel open");

    timeout(TEST_TIMEOUT, tools.cancel())
        .await
        .expect("cancel timeout");
    let session = tools.snapshot();
    assert_eq!(session.status(), StreamStatus::Idle);
    assert_eq!(session.last_error(), None);
    assert_eq!(session.current_stage(), Some(ToolStage::TestGeneration));
}
