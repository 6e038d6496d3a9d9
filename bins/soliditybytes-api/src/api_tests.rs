/// End-to-end tests for the HTTP surface
///
/// Each test builds the full router over a temporary content root,
/// workspace root and progress file, with a toolchain made of `sh -c`
/// scripts standing in for npm/Hardhat:
/// 1. Catalog and solution endpoints honor visibility
/// 2. Submissions stream their output and exactly one `done`
/// 3. Progress is recorded before `done` is observable
/// 4. Timeouts and output caps are enforced

#[cfg(test)]
mod http_tests {
    use crate::registry::SystemClock;
    use crate::routes;
    use crate::stream::TRUNCATION_MARKER;
    use crate::AppState;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        Router,
    };
    use futures_util::StreamExt;
    use serde_json::{json, Value};
    use soliditybytes_common::catalog::ExerciseCatalog;
    use soliditybytes_common::config::Config;
    use soliditybytes_common::progress::JsonFileProgressStore;
    use soliditybytes_runner::toolchain::ToolchainCommand;
    use soliditybytes_runner::{Executor, ToolchainConfig};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt; // for `oneshot`

    const PASS_ON_SOLUTION: &str =
        "cat contracts/Counter.sol; grep -q solution contracts/Counter.sol";

    struct TestApp {
        app: Router,
        _dirs: Vec<TempDir>,
    }

    fn write_exercise(root: &Path, track: &str, id: &str, visibility: &str) {
        let dir = root.join(track);
        std::fs::create_dir_all(&dir).unwrap();
        let doc = format!(
            r#"id: {id}
title: {id}
difficulty: easy
tags: [basics]
visibility: {visibility}
starter:
  files:
    - path: contracts/Counter.sol
      content: "// starter"
solution:
  files:
    - path: contracts/Counter.sol
      content: "// solution"
tests:
  files:
    - path: test/counter.test.js
      content: "describe('Counter', () => {{}})"
"#
        );
        std::fs::write(dir.join(format!("{}.yaml", id)), doc).unwrap();
    }

    fn fake_toolchain(test_script: &str) -> ToolchainConfig {
        let mut toolchain = ToolchainConfig::default();
        toolchain.name = "fake".to_string();
        toolchain.install =
            ToolchainCommand::new("sh", &["-c", "mkdir -p node_modules && echo installed"]);
        toolchain.test = ToolchainCommand::new("sh", &["-c", test_script]);
        toolchain
    }

    fn setup_with(toolchain: ToolchainConfig, tweak: impl FnOnce(&mut Config)) -> TestApp {
        let content = TempDir::new().unwrap();
        let workspaces = TempDir::new().unwrap();
        let data = TempDir::new().unwrap();

        write_exercise(content.path(), "track-a-basics", "basic-variables", "public");
        write_exercise(content.path(), "track-a-basics", "auth-only", "authenticated");
        write_exercise(content.path(), "track-a-basics", "earn-it", "after-pass");
        write_exercise(content.path(), "track-a-basics", "secret", "hidden");
        write_exercise(content.path(), "_examples", "example-only", "public");

        let mut config = Config::default();
        config.content_root = content.path().to_path_buf();
        config.workspace_root = workspaces.path().to_path_buf();
        config.data_dir = data.path().to_path_buf();
        config.dev_login = true;
        tweak(&mut config);

        let catalog = ExerciseCatalog::load(&config.content_root).unwrap();
        let executor = Executor::new(toolchain, &config.workspace_root);
        let progress = Arc::new(JsonFileProgressStore::new(config.progress_file()));
        let state = Arc::new(AppState::new(
            config,
            catalog,
            executor,
            progress,
            Arc::new(SystemClock),
        ));

        TestApp {
            app: routes::app(state),
            _dirs: vec![content, workspaces, data],
        }
    }

    fn setup(test_script: &str) -> TestApp {
        setup_with(fake_toolchain(test_script), |_| {})
    }

    impl TestApp {
        async fn request(&self, request: Request<Body>) -> (StatusCode, header::HeaderMap, Vec<u8>) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, headers, body.to_vec())
        }

        async fn get(&self, uri: &str, cookie: Option<&str>) -> (StatusCode, Value) {
            let mut builder = Request::builder().uri(uri);
            if let Some(cookie) = cookie {
                builder = builder.header(header::COOKIE, cookie);
            }
            let (status, _, body) = self.request(builder.body(Body::empty()).unwrap()).await;
            (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
        }

        async fn post(&self, uri: &str, payload: Value, cookie: Option<&str>) -> (StatusCode, Value) {
            let mut builder = Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json");
            if let Some(cookie) = cookie {
                builder = builder.header(header::COOKIE, cookie);
            }
            let (status, _, body) = self
                .request(builder.body(Body::from(payload.to_string())).unwrap())
                .await;
            (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
        }

        async fn submit(&self, payload: Value, cookie: Option<&str>) -> String {
            let (status, body) = self.post("/submissions", payload, cookie).await;
            assert_eq!(status, StatusCode::OK, "body: {}", body);
            body["submissionId"].as_str().unwrap().to_string()
        }

        fn stream_request(submission_id: &str) -> Request<Body> {
            Request::builder()
                .uri(format!("/submissions/{}/stream", submission_id))
                .body(Body::empty())
                .unwrap()
        }

        /// Read the whole SSE body as text, comments included
        async fn stream_raw(&self, submission_id: &str) -> String {
            let (status, headers, body) = self.request(Self::stream_request(submission_id)).await;
            assert_eq!(status, StatusCode::OK);
            assert!(headers[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/event-stream"));
            String::from_utf8(body).unwrap()
        }

        /// Read the whole SSE body; returns (event, data) pairs
        async fn stream(&self, submission_id: &str) -> Vec<(String, Value)> {
            parse_sse(&self.stream_raw(submission_id).await)
        }

        /// Poll the snapshot endpoint until the run has exited
        async fn wait_exited(&self, submission_id: &str) -> Value {
            for _ in 0..200 {
                let (_, snapshot) = self.get(&format!("/submissions/{}", submission_id), None).await;
                if snapshot["status"] == "exited" {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            panic!("run never finished");
        }

        async fn dev_login(&self, user_id: &str) -> String {
            let request = Request::builder()
                .method("POST")
                .uri("/auth/dev-login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "id": user_id, "name": "Ada" }).to_string()))
                .unwrap();
            let (status, headers, _) = self.request(request).await;
            assert_eq!(status, StatusCode::OK);
            let cookie = headers[header::SET_COOKIE].to_str().unwrap();
            cookie.split(';').next().unwrap().to_string()
        }
    }

    fn parse_sse(text: &str) -> Vec<(String, Value)> {
        text.split("\n\n")
            .filter_map(|frame| {
                let mut event = None;
                let mut data = String::new();
                for line in frame.lines() {
                    if let Some(name) = line.strip_prefix("event:") {
                        event = Some(name.trim().to_string());
                    } else if let Some(payload) = line.strip_prefix("data:") {
                        data.push_str(payload.strip_prefix(' ').unwrap_or(payload));
                    }
                }
                let event = event?;
                Some((event, serde_json::from_str(&data).unwrap_or(Value::Null)))
            })
            .collect()
    }

    fn log_text(events: &[(String, Value)]) -> String {
        events
            .iter()
            .filter(|(name, _)| name == "log")
            .map(|(_, data)| data["chunk"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn done_events(events: &[(String, Value)]) -> Vec<&Value> {
        events
            .iter()
            .filter(|(name, _)| name == "done")
            .map(|(_, data)| data)
            .collect()
    }

    #[tokio::test]
    async fn test_health() {
        let app = setup("exit 0");
        let (status, body) = app.get("/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_catalog_listing_and_detail() {
        let app = setup("exit 0");

        let (status, body) = app.get("/exercises", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"basic-variables"));
        assert!(!ids.contains(&"example-only"));
        assert_eq!(body[0]["category"], "track-a-basics");

        let (status, detail) = app.get("/exercises/basic-variables", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(detail.get("solution").is_none());
        assert_eq!(detail["tests"]["files"][0], json!({ "path": "test/counter.test.js" }));

        // Examples are reachable by id even though unlisted
        let (status, _) = app.get("/exercises/example-only", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = app.get("/exercises/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_submission_validation_errors() {
        let app = setup_with(fake_toolchain("exit 0"), |config| {
            config.max_override_bytes = 64;
        });

        let (status, body) = app.post("/submissions", json!({}), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_id");

        let (status, body) = app.post("/submissions", json!({ "id": "nope" }), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "exercise_not_found");

        let big = "x".repeat(128);
        let (status, body) = app
            .post(
                "/submissions",
                json!({ "id": "basic-variables", "overrides": [{ "path": "a.sol", "content": big }] }),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "overrides_too_large");

        let (status, body) = app
            .post(
                "/submissions",
                json!({ "id": "basic-variables", "overrides": [{ "path": "../a.sol", "content": "" }] }),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_path");
    }

    #[tokio::test]
    async fn test_overrides_cannot_target_dependency_cache() {
        let app = setup("exit 0");
        for path in ["node_modules/hardhat/evil.js", ".deps-hash"] {
            let (status, body) = app
                .post(
                    "/submissions",
                    json!({ "id": "basic-variables", "overrides": [{ "path": path, "content": "x" }] }),
                    None,
                )
                .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "path {}", path);
            assert_eq!(body["error"], "invalid_path");
        }
    }

    #[tokio::test]
    async fn test_unknown_submission_is_404() {
        let app = setup("exit 0");
        let request = Request::builder()
            .uri("/submissions/sub_missing/stream")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = app.request(request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app.get("/submissions/sub_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_toolchain_rejects_submission() {
        let mut toolchain = fake_toolchain("exit 0");
        toolchain.test.command = "no-such-test-runner-9041".to_string();
        let app = setup_with(toolchain, |_| {});

        let (status, body) = app
            .post("/submissions", json!({ "id": "basic-variables" }), None)
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "spawn_error");
    }

    #[tokio::test]
    async fn test_solution_run_passes_and_records_progress() {
        let app = setup(PASS_ON_SOLUTION);
        let sid = app
            .submit(
                json!({ "id": "basic-variables", "mode": "solution", "deviceId": "dev-1" }),
                None,
            )
            .await;
        assert!(sid.starts_with("sub_"));

        let events = app.stream(&sid).await;
        let done = done_events(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0], &json!({ "code": 0 }));
        assert_eq!(events.last().unwrap().0, "done");
        assert!(log_text(&events).contains("// solution"));

        // Written before `done` went out, so visible right away
        let (status, body) = app.get("/progress?deviceId=dev-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "solved": { "basic-variables": true } }));

        let (_, snapshot) = app.get(&format!("/submissions/{}", sid), None).await;
        assert_eq!(snapshot["status"], "exited");
        assert_eq!(snapshot["code"], 0);
    }

    #[tokio::test]
    async fn test_failing_run_records_nothing() {
        let app = setup(PASS_ON_SOLUTION);
        let sid = app
            .submit(json!({ "id": "basic-variables", "deviceId": "dev-2" }), None)
            .await;

        let events = app.stream(&sid).await;
        let done = done_events(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0]["code"], 1);

        let (_, body) = app.get("/progress?deviceId=dev-2", None).await;
        assert_eq!(body, json!({ "solved": {} }));
    }

    #[tokio::test]
    async fn test_second_run_reuses_dependencies() {
        let app = setup("exit 0");

        let first = app.submit(json!({ "id": "basic-variables" }), None).await;
        let events = app.stream(&first).await;
        assert!(log_text(&events).contains("installed"));

        let second = app.submit(json!({ "id": "basic-variables" }), None).await;
        let events = app.stream(&second).await;
        assert!(!log_text(&events).contains("installed"));
        assert_eq!(done_events(&events), vec![&json!({ "code": 0 })]);
    }

    #[tokio::test]
    async fn test_timeout_kills_run() {
        let app = setup_with(fake_toolchain("echo started; exec sleep 30"), |config| {
            config.limits.run_timeout = Duration::from_secs(2);
        });
        let sid = app
            .submit(json!({ "id": "basic-variables", "deviceId": "dev-3" }), None)
            .await;

        let events = app.stream(&sid).await;
        let done = done_events(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0], &json!({ "code": 124, "reason": "timeout" }));
        assert_eq!(events.last().unwrap().0, "done");
        assert!(log_text(&events).contains("started"));

        let (_, body) = app.get("/progress?deviceId=dev-3", None).await;
        assert_eq!(body, json!({ "solved": {} }));
    }

    #[tokio::test]
    async fn test_output_is_capped_with_one_marker() {
        let cap = 1000;
        let app = setup_with(
            fake_toolchain("yes 0123456789 | head -c 200000"),
            |config| {
                config.limits.max_output_bytes = cap;
            },
        );
        let sid = app.submit(json!({ "id": "basic-variables" }), None).await;

        let events = app.stream(&sid).await;
        let text = log_text(&events);
        assert!(text.len() <= cap + TRUNCATION_MARKER.len());
        assert_eq!(text.matches("[truncated]").count(), 1);
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(done_events(&events).len(), 1);
    }

    #[tokio::test]
    async fn test_late_and_repeated_listeners_replay_the_run() {
        let app = setup("echo hello");
        let sid = app.submit(json!({ "id": "basic-variables" }), None).await;
        app.wait_exited(&sid).await;

        let first = app.stream(&sid).await;
        let second = app.stream(&sid).await;
        assert_eq!(first, second);
        assert!(log_text(&first).contains("hello"));
        assert_eq!(done_events(&first).len(), 1);
    }

    #[tokio::test]
    async fn test_quiet_run_sends_keepalive_comments() {
        let app = setup_with(fake_toolchain("sleep 0.3; echo ok"), |config| {
            config.limits.keepalive = Duration::from_millis(50);
        });
        let sid = app.submit(json!({ "id": "basic-variables" }), None).await;

        let raw = app.stream_raw(&sid).await;
        assert!(
            raw.lines().any(|line| line.starts_with(':') && line.contains("keepalive")),
            "no keepalive in {:?}",
            raw
        );
        let events = parse_sse(&raw);
        assert_eq!(done_events(&events), vec![&json!({ "code": 0 })]);
    }

    #[tokio::test]
    async fn test_run_outlives_disconnected_listener() {
        let app = setup(
            "sleep 0.5; cat contracts/Counter.sol; grep -q solution contracts/Counter.sol",
        );
        let sid = app
            .submit(
                json!({ "id": "basic-variables", "mode": "solution", "deviceId": "dev-gone" }),
                None,
            )
            .await;

        let response = app
            .app
            .clone()
            .oneshot(TestApp::stream_request(&sid))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.expect("stream ended early").unwrap();
        assert!(!first.is_empty());
        drop(body);

        let snapshot = app.wait_exited(&sid).await;
        assert_eq!(snapshot["code"], 0);
        let (_, progress) = app.get("/progress?deviceId=dev-gone", None).await;
        assert_eq!(progress, json!({ "solved": { "basic-variables": true } }));
    }

    #[tokio::test]
    async fn test_solution_visibility_rules() {
        let app = setup(PASS_ON_SOLUTION);

        let (status, body) = app.get("/exercises/basic-variables/solution", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["files"][0]["content"], "// solution");

        let (status, body) = app.get("/exercises/auth-only/solution", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let cookie = app.dev_login("u1").await;
        let (status, body) = app
            .get("/exercises/auth-only/solution", Some(&cookie))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "auth-only");

        let (status, _) = app.get("/exercises/earn-it/solution", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = app.get("/exercises/earn-it/solution", Some(&cookie)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Solving it as the signed-in user unlocks it
        let sid = app
            .submit(json!({ "id": "earn-it", "mode": "solution" }), Some(&cookie))
            .await;
        let events = app.stream(&sid).await;
        assert_eq!(done_events(&events), vec![&json!({ "code": 0 })]);
        let (status, _) = app.get("/exercises/earn-it/solution", Some(&cookie)).await;
        assert_eq!(status, StatusCode::OK);

        let (_, progress) = app.get("/me/progress", Some(&cookie)).await;
        assert_eq!(progress, json!({ "solved": { "earn-it": true } }));

        let (status, _) = app.get("/exercises/secret/solution", Some(&cookie)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_session_endpoints() {
        let app = setup("exit 0");

        let (status, _) = app.get("/auth/me", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = app.get("/me/progress", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let cookie = app.dev_login("u7").await;
        let (status, body) = app.get("/auth/me", Some(&cookie)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["id"], "u7");

        let (status, body) = app.post("/auth/logout", json!({}), Some(&cookie)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        let (status, _) = app.get("/auth/me", Some(&cookie)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_dev_login_disabled_by_default() {
        let app = setup_with(fake_toolchain("exit 0"), |config| {
            config.dev_login = false;
        });
        let (status, _) = app.post("/auth/dev-login", json!({ "id": "u1" }), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = setup("exit 0");
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let (status, _, body) = app.request(request).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("soliditybytes_active_streams"));
    }
}
