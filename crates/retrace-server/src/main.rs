mod error;
mod handlers;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::routing::{get, post};
use axum::Router;
use retrace_config::RetraceConfig;
use retrace_monitor::TraceStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ServerState {
    pub store: Arc<TraceStore>,
    pub config: RetraceConfig,
}

impl ServerState {
    pub fn open(config: RetraceConfig) -> Result<Self> {
        let base = config.store.base_path.clone();
        let store = if config.store.index {
            TraceStore::with_index(base)?
        } else {
            TraceStore::new(base)?
        };
        Ok(Self {
            store: Arc::new(store),
            config,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config_path = env::var("RETRACE_CONFIG").ok().map(PathBuf::from);
    let config = RetraceConfig::from_env(config_path.as_deref())?;
    let addr = config.server.addr.clone();

    let state = Arc::new(ServerState::open(config)?);
    info!(
        base_path = %state.store.base_path().display(),
        index = state.store.has_index(),
        "Opened trace store"
    );

    let app = router(state);

    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
                version = ?req.version(),
            )
        })
        .on_response(|res: &Response<Body>, latency: Duration, _span: &tracing::Span| {
            info!(
                latency = %format!("{} ms", latency.as_millis()),
                status = %res.status().as_u16(),
                "finished processing request"
            );
        });

    let logged_routes = Router::new()
        .route("/api/traces", get(handlers::traces::list))
        .route(
            "/api/traces/{id}",
            get(handlers::traces::get).delete(handlers::traces::delete),
        )
        .route("/api/traces/{id}/replay", post(handlers::replay::replay))
        .route("/api/metrics/summary", get(handlers::traces::metrics_summary))
        .route("/api/shadow", post(handlers::shadow::run))
        .layer(trace_layer);

    Router::new()
        .merge(logged_routes)
        .route("/health", get(handlers::health))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode};
    use retrace_core::{Message, Usage};
    use retrace_monitor::{BoundaryCapture, BoundaryKind, ExecutionTrace, ModelCapture, TraceCapture, TraceStatus};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn recorded(agent: &str, prompt: &str) -> ExecutionTrace {
        let capture = TraceCapture::new();
        capture.start_trace("run", agent, None, vec![]).unwrap();
        capture
            .capture_node_boundary(BoundaryCapture::new("n1", "Answer", "llm", BoundaryKind::Enter))
            .unwrap();
        capture
            .capture_model_interaction(
                ModelCapture::new("n1", 0, vec![Message::user(prompt)])
                    .response_content("Hi there!")
                    .usage(Usage::new(3, 4)),
            )
            .unwrap();
        capture.finalize_trace(TraceStatus::Completed).unwrap()
    }

    fn setup() -> (tempfile::TempDir, Arc<ServerState>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RetraceConfig::default();
        config.store.base_path = dir.path().to_path_buf();
        let state = Arc::new(ServerState::open(config).unwrap());
        (dir, state)
    }

    async fn send(state: &Arc<ServerState>, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router(Arc::clone(state))
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, state) = setup();
        let response = router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_get_delete() {
        let (_dir, state) = setup();
        let a1 = recorded("a1", "Hello");
        let a2 = recorded("a2", "Hello");
        state.store.save(&a1).unwrap();
        state.store.save(&a2).unwrap();

        let (status, body) = send(&state, Method::GET, "/api/traces?agent_id=a1", None).await;
        assert_eq!(status, StatusCode::OK);
        let traces = body["traces"].as_array().unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0]["agent_id"], "a1");

        let uri = format!("/api/traces/{}", a1.trace_id());
        let (status, body) = send(&state, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model_interactions"].as_array().unwrap().len(), 1);

        let (status, _) = send(&state, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&state, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "trace not found");
        let (status, _) = send(&state, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let (_dir, state) = setup();
        let (status, body) = send(&state, Method::GET, "/api/traces?status=weird", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("weird"));

        let (status, _) = send(&state, Method::POST, "/api/shadow", Some(json!({"candidates": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_summary() {
        let (_dir, state) = setup();
        state.store.save(&recorded("a1", "Hello")).unwrap();

        let (status, body) = send(&state, Method::GET, "/api/metrics/summary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_traces"], 1);
        assert_eq!(body["completed"], 1);
        assert_eq!(body["total_tokens"], 7);
    }

    #[tokio::test]
    async fn test_replay_endpoint() {
        let (_dir, state) = setup();
        let trace = recorded("a1", "Hello");
        state.store.save(&trace).unwrap();
        let uri = format!("/api/traces/{}/replay", trace.trace_id());

        let (status, body) = send(&state, Method::POST, &uri, Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["diverged"], false);

        let (status, body) = send(
            &state,
            Method::POST,
            &uri,
            Some(json!({"candidate": {"system_prompt": "Be terse."}, "record_replay": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["diverged"], true);
        let replay_id = body["replay_trace_id"].as_str().unwrap();
        assert!(state.store.exists(replay_id));

        // Stored replays are not sampled by later shadow runs.
        let (_, body) = send(&state, Method::POST, &uri, Some(json!({"record_replay": true}))).await;
        assert_eq!(body["success"], true);
        assert!(state.store.exists(body["replay_trace_id"].as_str().unwrap()));
        let request = json!({
            "candidates": [{"config_id": "same", "agent_id": "a1"}],
            "settings": {"min_traces": 1}
        });
        let (status, body) = send(&state, Method::POST, "/api/shadow", Some(request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"][0]["total_traces"], 1);
        assert_eq!(body["results"][0]["details"][0]["trace_id"], trace.trace_id());

        let (status, _) = send(&state, Method::POST, "/api/traces/missing/replay", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shadow_endpoint_ranks_candidates() {
        let (_dir, state) = setup();
        let mut ids = Vec::new();
        for i in 0..3 {
            let trace = recorded("a1", &format!("q{}", i));
            ids.push(trace.trace_id().to_string());
            state.store.save(&trace).unwrap();
        }

        let request = json!({
            "candidates": [
                {"config_id": "rewrite", "agent_id": "a1", "system_prompt": "Be terse."},
                {"config_id": "same", "agent_id": "a1"}
            ],
            "trace_ids": ids,
            "settings": {"min_traces": 3}
        });
        let (status, body) = send(&state, Method::POST, "/api/shadow", Some(request)).await;
        assert_eq!(status, StatusCode::OK);

        let results = body["results"].as_array().unwrap();
        assert_eq!(results[0]["config_id"], "same");
        assert_eq!(results[0]["passed"], true);
        assert_eq!(results[1]["passed"], false);
        assert!(!results[1]["failure_reasons"].as_array().unwrap().is_empty());
    }
}
