use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use agent_dash::config::ServerConfig;
use agent_dash::router::{build_router_with_state, AppState, AuthConfig};
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    _dir: TempDir,
}

impl TestApp {
    fn new() -> Self {
        Self::new_with_auth(AuthConfig::disabled())
    }

    fn new_with_auth(auth: AuthConfig) -> Self {
        Self::with_agent(auth, r#"echo '{"type":"result","result":"done"}'"#)
    }

    /// App whose agent binary is a shell script running `body`.
    fn with_agent(auth: AuthConfig, body: &str) -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let agent = dir.path().join("fake-agent");
        std::fs::write(&agent, format!("#!/bin/sh\n{body}\n")).expect("write fake agent");
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake agent");

        let config = ServerConfig {
            username: "tester".to_string(),
            agent_binary: agent.to_string_lossy().into_owned(),
            run_as: None,
            shell: "/bin/sh".to_string(),
            work_dir: dir.path().to_path_buf(),
            terminal_home: dir.path().to_path_buf(),
            scheduled_timeout: Duration::from_secs(10),
            ..ServerConfig::default()
        };
        let (app, state) = build_router_with_state(Arc::new(AppState::new(auth, config)));
        Self {
            app,
            state,
            _dir: dir,
        }
    }
}

async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let (status, _headers, payload) = send_json_request(app, request).await;
    (status, payload)
}

async fn send_json_request(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, headers, value)
}

fn task_body(prompt: &str) -> Value {
    json!({ "prompt": prompt })
}
