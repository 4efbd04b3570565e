use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fetchq_api::app::services::{self, AppServices, Background};
use fetchq_core::{JobId, SubjectId};
use fetchq_infra::artifacts::InMemoryArtifactStore;
use fetchq_infra::config::{AppConfig, OrchestratorConfig, StreamConfig};
use reqwest::StatusCode;
use serde_json::json;

const OWNER: &str = "x-owner-id";

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    artifacts: Arc<InMemoryArtifactStore>,
    background: Option<Background>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Build the app (same router as prod) on the in-memory stack, bound to
    /// an ephemeral port. Workers and watchdog only run when `run_jobs`.
    async fn spawn(config: AppConfig, run_jobs: bool) -> Self {
        let artifacts = Arc::new(InMemoryArtifactStore::new("https://files.test"));
        let stack = services::in_memory(&config, artifacts.clone());
        let background = run_jobs.then(|| stack.start_background(&config));

        let app = fetchq_api::app::build_app(stack.services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services: stack.services.clone(),
            artifacts,
            background,
            handle,
        }
    }

    fn put_artifact(&self, subject: &str) {
        self.artifacts
            .put(&SubjectId::new(subject).unwrap(), 1024, Utc::now())
            .unwrap();
    }

    async fn create(&self, client: &reqwest::Client, owner: &str, body: serde_json::Value) -> reqwest::Response {
        client
            .post(format!("{}/jobs", self.base_url))
            .header(OWNER, owner)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn stop(mut self) {
        if let Some(background) = self.background.take() {
            background.shutdown().await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn job_eventually(
    client: &reqwest::Client,
    base_url: &str,
    id: &str,
    status: &str,
) -> serde_json::Value {
    // Jobs run on the worker pool; poll briefly until the record settles.
    for _ in 0..200 {
        let res = client
            .get(format!("{}/jobs/{}", base_url, id))
            .header(OWNER, "alice")
            .send()
            .await
            .unwrap();

        if res.status() == StatusCode::OK {
            let body: serde_json::Value = res.json().await.unwrap();
            if body["state"] == status {
                return body;
            }
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {id} did not reach `{status}` within timeout");
}

#[tokio::test]
async fn owner_header_required_for_job_endpoints() {
    let srv = TestServer::spawn(AppConfig::default(), false).await;

    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&json!({ "subject_id": "report.pdf" }))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_then_replay_with_the_same_dedup_token() {
    let srv = TestServer::spawn(AppConfig::default(), false).await;
    let client = reqwest::Client::new();
    let body = json!({ "subject_id": "report.pdf", "dedup_token": "tok-1" });

    let res = srv.create(&client, "alice", body.clone()).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let first: serde_json::Value = res.json().await.unwrap();
    assert_eq!(first["is_new"], true);
    let id = first["job_id"].as_str().unwrap().to_string();
    assert_eq!(first["status_url"], format!("/jobs/{id}"));
    assert_eq!(first["events_url"], format!("/jobs/{id}/events"));

    let res = srv.create(&client, "alice", body).await;
    assert_eq!(res.status(), StatusCode::OK);
    let replay: serde_json::Value = res.json().await.unwrap();
    assert_eq!(replay["is_new"], false);
    assert_eq!(replay["job_id"], first["job_id"]);

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, id))
        .header(OWNER, "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let record: serde_json::Value = res.json().await.unwrap();
    assert_eq!(record["state"], "queued");
    assert_eq!(record["progress"], 0);
    assert_eq!(record["subject_id"], "report.pdf");
    assert_eq!(record["owner_id"], "alice");
}

#[tokio::test]
async fn blank_subject_is_a_bad_request() {
    let srv = TestServer::spawn(AppConfig::default(), false).await;
    let client = reqwest::Client::new();

    let res = srv.create(&client, "alice", json!({ "subject_id": "  " })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_subject");
}

#[tokio::test]
async fn over_quota_owner_gets_429_with_retry_after() {
    let config = AppConfig {
        orchestrator: OrchestratorConfig::default()
            .with_max_concurrent_per_owner(2)
            .with_rate_limit_retry_after(Duration::from_secs(7)),
        ..AppConfig::default()
    };
    let srv = TestServer::spawn(config, false).await;
    let client = reqwest::Client::new();

    for subject in ["a", "b"] {
        let res = srv.create(&client, "alice", json!({ "subject_id": subject })).await;
        assert_eq!(res.status(), StatusCode::ACCEPTED);
    }

    let res = srv.create(&client, "alice", json!({ "subject_id": "c" })).await;
    assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(res.headers()["retry-after"], "7");

    // Quotas are per owner.
    let res = srv.create(&client, "bob", json!({ "subject_id": "c" })).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn unknown_and_malformed_job_ids_are_not_found() {
    let srv = TestServer::spawn(AppConfig::default(), false).await;
    let client = reqwest::Client::new();

    for id in [JobId::new().to_string(), "not-a-job".to_string()] {
        let res = client
            .get(format!("{}/jobs/{}", srv.base_url, id))
            .header(OWNER, "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body["message"], "job not found or expired");
    }

    let res = client
        .get(format!("{}/jobs/{}/events", srv.base_url, JobId::new()))
        .header(OWNER, "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn job_runs_to_completion_and_replays_on_the_event_stream() {
    let srv = TestServer::spawn(AppConfig::default(), true).await;
    srv.put_artifact("report.pdf");
    let client = reqwest::Client::new();

    let res = srv.create(&client, "alice", json!({ "subject_id": "report.pdf" })).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let created: serde_json::Value = res.json().await.unwrap();
    let id = created["job_id"].as_str().unwrap().to_string();

    let record = job_eventually(&client, &srv.base_url, &id, "completed").await;
    assert_eq!(record["progress"], 100);
    assert!(
        record["result_locator"]
            .as_str()
            .unwrap()
            .starts_with("https://files.test/report.pdf?expires=")
    );

    // A finished job replays its snapshot and terminal event, then closes.
    let res = client
        .get(format!("{}/jobs/{}/events", srv.base_url, id))
        .header(OWNER, "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.text().await.unwrap();
    assert!(body.contains("event: status"), "body: {body}");
    assert!(body.contains("event: complete"), "body: {body}");

    srv.stop().await;
}

#[tokio::test]
async fn missing_artifact_fails_without_retry() {
    let srv = TestServer::spawn(AppConfig::default(), true).await;
    let client = reqwest::Client::new();

    let res = srv.create(&client, "alice", json!({ "subject_id": "ghost.bin" })).await;
    let created: serde_json::Value = res.json().await.unwrap();
    let id = created["job_id"].as_str().unwrap().to_string();

    let record = job_eventually(&client, &srv.base_url, &id, "failed").await;
    assert_eq!(record["retryable"], false);
    assert_eq!(record["failure_reason"], "artifact not found");

    let body = client
        .get(format!("{}/jobs/{}/events", srv.base_url, id))
        .header(OWNER, "alice")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("event: error"), "body: {body}");

    srv.stop().await;
}

#[tokio::test]
async fn live_stream_forwards_progress_heartbeats_and_completion() {
    let config = AppConfig {
        stream: StreamConfig::default().with_keepalive(Duration::from_millis(50)),
        ..AppConfig::default()
    };
    let srv = TestServer::spawn(config, false).await;
    let client = reqwest::Client::new();

    let res = srv.create(&client, "alice", json!({ "subject_id": "report.pdf" })).await;
    let created: serde_json::Value = res.json().await.unwrap();
    let job_id: JobId = created["job_id"].as_str().unwrap().parse().unwrap();

    // Headers arrive once the handler has subscribed.
    let res = client
        .get(format!("{}/jobs/{}/events", srv.base_url, job_id))
        .header(OWNER, "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Drive the job the way a worker would.
    let orchestrator = &srv.services.orchestrator;
    orchestrator.mark_processing(job_id).await.unwrap();
    orchestrator.update_progress(job_id, 40).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    orchestrator
        .mark_completed(job_id, "https://files.test/report.pdf")
        .await
        .unwrap();

    let body = res.text().await.unwrap();
    let status_at = body.find("event: status").expect("status event");
    let progress_at = body.find("event: progress").expect("progress event");
    let complete_at = body.find("event: complete").expect("complete event");
    assert!(status_at < progress_at && progress_at < complete_at, "body: {body}");
    assert!(body.contains("event: heartbeat"), "body: {body}");
}

#[tokio::test]
async fn health_reports_queue_counts() {
    let srv = TestServer::spawn(AppConfig::default(), false).await;
    let client = reqwest::Client::new();
    srv.create(&client, "alice", json!({ "subject_id": "report.pdf" })).await;

    let res = client.get(format!("{}/health", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "in_memory");
    assert_eq!(body["queue"]["waiting"], 1);
}
