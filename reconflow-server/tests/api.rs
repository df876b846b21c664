use axum::http::StatusCode;
use axum_test::TestServer;
use reconflow_core::{catalog::ScanCatalog, executor::ExecutionOutcome, tasks::TaskId};
use reconflow_server::{
    AppState, create_app,
    infra::{
        app_state::Storage,
        config::{ConfigMetadata, EnvConfig, compose_config},
    },
};
use serde_json::{Value, json};
use tempfile::TempDir;

const SCANNERS: &str = r#"
- config_name: discover-subs
  command_template: 'printf "sub.%s\n" {target}'
  output_parser_type: line_parser
  data_mapping:
    hostname: self
  agent_type: subdomain
- config_name: probe-http
  command_template: "cat"
  output_parser_type: json_lines
  data_mapping: {}
  agent_type: http
  target_source: subdomains
"#;

const STRATEGIES: &str = r#"
- strategy_name: web
  description: Subdomains, then HTTP probing
  steps: [discover-subs, probe-http]
- strategy_name: empty
  steps: []
"#;

struct TestApp {
    server: TestServer,
    state: AppState,
    _artifacts: TempDir,
}

fn test_app() -> TestApp {
    let artifacts = tempfile::tempdir().unwrap();
    let mut config = compose_config(None, EnvConfig::default(), ConfigMetadata::default())
        .unwrap()
        .config;
    config.executor.artifact_dir = artifacts.path().to_path_buf();

    let catalog = ScanCatalog::from_yaml(SCANNERS, STRATEGIES).unwrap();
    let (storage, _store) = Storage::in_memory();
    let state = AppState::from_parts(config, catalog, storage);
    let server = TestServer::new(create_app(state.clone())).unwrap();
    TestApp {
        server,
        state,
        _artifacts: artifacts,
    }
}

async fn create_asset(app: &TestApp, name: &str) -> i64 {
    let response = app
        .server
        .post("/api/v1/assets")
        .json(&json!({ "name": name, "project_id": 7 }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    response.json::<Value>()["data"]["id"].as_i64().unwrap()
}

async fn submit(app: &TestApp, asset_id: i64, strategy: &str) -> axum_test::TestResponse {
    app.server
        .post("/api/v1/scans")
        .json(&json!({ "asset_id": asset_id, "strategy_name": strategy }))
        .await
}

fn task_ids(body: &Value) -> Vec<i64> {
    body["data"]["task_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|id| id.as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn submission_creates_one_pending_task_per_step() {
    let app = test_app();
    let asset_id = create_asset(&app, "example.com").await;

    let response = submit(&app, asset_id, "web").await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
    let body = response.json::<Value>();
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["strategy_name"], "web");
    let ids = task_ids(&body);
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);

    let detail = app.server.get(&format!("/api/v1/tasks/{}", ids[0])).await;
    assert_eq!(detail.status_code(), StatusCode::OK);
    let task = &detail.json::<Value>()["data"];
    assert_eq!(task["status"], "pending");
    assert_eq!(task["stage"], "subdomain");
    assert_eq!(task["config_name"], "discover-subs");
    assert_eq!(task["asset_id"], asset_id);
    assert!(task["started_at"].is_null());

    let listed = app
        .server
        .get("/api/v1/tasks")
        .add_query_param("asset_id", asset_id)
        .add_query_param("status", "pending")
        .await;
    assert_eq!(listed.status_code(), StatusCode::OK);
    let listed_ids: Vec<i64> = listed.json::<Value>()["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_i64().unwrap())
        .collect();
    assert_eq!(listed_ids, vec![ids[1], ids[0]]);
}

#[tokio::test]
async fn second_submission_for_same_target_is_suppressed() {
    let app = test_app();
    let first = create_asset(&app, "example.com").await;
    let second = create_asset(&app, "EXAMPLE.com.").await;

    assert_eq!(task_ids(&submit(&app, first, "web").await.json::<Value>()).len(), 2);

    let response = submit(&app, second, "web").await;
    assert_eq!(response.status_code(), StatusCode::ACCEPTED);
    let body = response.json::<Value>();
    assert!(task_ids(&body).is_empty());
    assert!(body["message"].as_str().is_some());
}

#[tokio::test]
async fn invalid_submissions_are_client_errors() {
    let app = test_app();
    let asset_id = create_asset(&app, "example.com").await;

    let unknown_strategy = submit(&app, asset_id, "nope").await;
    assert_eq!(unknown_strategy.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(unknown_strategy.json::<Value>()["error"]["status"], 404);

    let unknown_asset = submit(&app, 999, "web").await;
    assert_eq!(unknown_asset.status_code(), StatusCode::NOT_FOUND);

    let empty = submit(&app, asset_id, "empty").await;
    assert_eq!(empty.status_code(), StatusCode::BAD_REQUEST);

    let blank_asset = app
        .server
        .post("/api/v1/assets")
        .json(&json!({ "name": "   " }))
        .await;
    assert_eq!(blank_asset.status_code(), StatusCode::BAD_REQUEST);

    let listed = app.server.get("/api/v1/tasks").await;
    assert!(listed.json::<Value>()["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn task_lookups_report_missing_resources() {
    let app = test_app();

    let missing = app.server.get("/api/v1/tasks/42").await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);

    let bad_status = app
        .server
        .get("/api/v1/tasks")
        .add_query_param("status", "sleeping")
        .await;
    assert_eq!(bad_status.status_code(), StatusCode::BAD_REQUEST);

    let retry = app
        .server
        .post("/api/v1/tasks/42/retry")
        .json(&json!({ "mode": "step" }))
        .await;
    assert_eq!(retry.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn artifact_is_served_after_execution() {
    let app = test_app();
    let asset_id = create_asset(&app, "example.com").await;
    let ids = task_ids(&submit(&app, asset_id, "web").await.json::<Value>());

    let before = app
        .server
        .get(&format!("/api/v1/tasks/{}/artifact", ids[0]))
        .await;
    assert_eq!(before.status_code(), StatusCode::NOT_FOUND);

    let outcome = app.state.executor.execute(TaskId(ids[0])).await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Completed { .. }));

    let artifact = app
        .server
        .get(&format!("/api/v1/tasks/{}/artifact", ids[0]))
        .await;
    assert_eq!(artifact.status_code(), StatusCode::OK);
    let text = artifact.text();
    assert!(text.contains("printf"));
    assert!(text.contains("sub.example.com"));

    let detail = app.server.get(&format!("/api/v1/tasks/{}", ids[0])).await;
    let task = &detail.json::<Value>()["data"];
    assert_eq!(task["status"], "completed");
    assert!(task["artifact_path"].as_str().is_some());
    assert!(task["completed_at"].as_str().is_some());
}

#[tokio::test]
async fn retries_bypass_suppression() {
    let app = test_app();
    let asset_id = create_asset(&app, "example.com").await;
    let ids = task_ids(&submit(&app, asset_id, "web").await.json::<Value>());

    let step = app
        .server
        .post(&format!("/api/v1/tasks/{}/retry", ids[1]))
        .json(&json!({ "mode": "step" }))
        .await;
    assert_eq!(step.status_code(), StatusCode::ACCEPTED);
    let step_ids = task_ids(&step.json::<Value>());
    assert_eq!(step_ids.len(), 1);
    assert!(step_ids[0] > ids[1]);

    let strategy = app
        .server
        .post(&format!("/api/v1/tasks/{}/retry", ids[0]))
        .json(&json!({ "mode": "strategy", "strategy_name": "web" }))
        .await;
    assert_eq!(strategy.status_code(), StatusCode::ACCEPTED);
    assert_eq!(task_ids(&strategy.json::<Value>()).len(), 2);

    let retried = app.server.get(&format!("/api/v1/tasks/{}", step_ids[0])).await;
    let log = retried.json::<Value>()["data"]["log"].as_str().unwrap().to_string();
    assert!(log.starts_with("retry:"));
}

#[tokio::test]
async fn strategies_are_listed_with_their_steps() {
    let app = test_app();
    let response = app.server.get("/api/v1/scan-strategies").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.json::<Value>();
    let strategies = body["data"].as_array().unwrap();
    assert_eq!(strategies.len(), 2);
    assert_eq!(strategies[0]["name"], "web");
    assert_eq!(strategies[0]["steps"], json!(["discover-subs", "probe-http"]));
    assert_eq!(strategies[0]["description"], "Subdomains, then HTTP probing");
}
