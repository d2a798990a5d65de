//! Test helpers: build the router over in-memory stores for integration tests.
//!
//! Run from workspace root: `cargo test -p formdrop-api`. No external
//! services are needed; sessions, jobs and objects live in process memory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::Method;
use axum::Extension;
use axum_test::{TestResponse, TestServer};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use formdrop_api::setup::routes::setup_routes;
use formdrop_api::setup::services::{initialize_services, BackgroundTasks};
use formdrop_api::AppState;
use formdrop_core::constants::OFFSET_OCTET_STREAM;
use formdrop_core::models::UploadJob;
use formdrop_core::{AuthContext, Config, HookRegistry, UploadServiceConfig};
use formdrop_db::{
    InMemoryJobRepository, InMemorySessionLock, InMemorySessionRepository,
    InMemorySubmissionRepository, Repositories, SessionRepository,
};
use formdrop_storage::MemoryStorage;

pub const BASE: &str = "/files";

pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub storage: MemoryStorage,
    pub sessions: InMemorySessionRepository,
    pub submissions: InMemorySubmissionRepository,
    pub background: Option<BackgroundTasks>,
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }

    pub async fn job_for(&self, session_id: &str) -> Option<UploadJob> {
        self.state
            .queue
            .find_by_session(session_id)
            .await
            .expect("job lookup")
    }

    /// Move a session's deadline into the past without waiting for it.
    pub async fn expire(&self, session_id: &str) {
        let mut session = self
            .sessions
            .get(session_id)
            .await
            .expect("session lookup")
            .expect("session exists");
        session.expires_at = chrono::Utc::now() - chrono::Duration::minutes(1);
        self.sessions.put_raw(session).await;
    }

    /// Poll until the session's job reaches a terminal state.
    pub async fn wait_for_job(&self, session_id: &str) -> UploadJob {
        for _ in 0..500 {
            if let Some(job) = self.job_for(session_id).await {
                if job.state.is_finished() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job for session {} did not finish", session_id);
    }
}

pub fn test_config() -> Config {
    let vars: HashMap<String, String> = [
        ("SESSION_STORE", "memory"),
        ("STORAGE_BACKEND", "memory"),
        ("UPLOAD_MAX_SIZE_MB", "2"),
        ("UPLOAD_MAX_CHUNK_SIZE_MB", "1"),
        ("JOB_BACKOFF_BASE_MS", "10"),
        ("JOB_POLL_INTERVAL_MS", "10"),
        ("JOB_RETENTION_INTERVAL_SECS", "0"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let config = UploadServiceConfig::from_lookup(|key| vars.get(key).cloned())
        .expect("Failed to build test config");
    config.validate().expect("Test config is invalid");
    Config(Box::new(config))
}

/// Setup a test app for an anonymous caller, without background workers.
pub async fn setup_test_app() -> TestApp {
    build(AuthContext::anonymous(), false)
}

/// Setup a test app whose requests are made by `user_id`.
pub async fn setup_test_app_as(user_id: &str) -> TestApp {
    build(AuthContext::user(user_id), false)
}

/// Setup a test app with the worker pool and sweeper running.
pub async fn setup_test_app_with_workers() -> TestApp {
    build(AuthContext::anonymous(), true)
}

fn build(auth: AuthContext, with_workers: bool) -> TestApp {
    let config = test_config();
    let storage = MemoryStorage::new();
    let submissions = InMemorySubmissionRepository::new();
    let sessions = InMemorySessionRepository::new();
    let repositories = Repositories {
        sessions: Arc::new(sessions.clone()),
        locks: Arc::new(InMemorySessionLock::new()),
        jobs: Arc::new(InMemoryJobRepository::new()),
        submissions: Arc::new(submissions.clone()),
    };

    let services = initialize_services(
        &config,
        repositories,
        Arc::new(storage.clone()),
        None,
        HookRegistry::new(),
    );
    let router = setup_routes(&config, services.state.clone())
        .expect("Failed to build routes")
        .layer(Extension(auth));
    let server = TestServer::new(router).expect("Failed to create test server");

    let state = services.state.clone();
    let background = with_workers.then(|| services.background.start());

    TestApp {
        server,
        state,
        storage,
        sessions,
        submissions,
        background,
    }
}

/// Encode `Upload-Metadata` from plain key/value pairs.
pub fn metadata(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{} {}", k, STANDARD.encode(v)))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn form_metadata() -> String {
    metadata(&[
        ("filename", "report.pdf"),
        ("filetype", "application/pdf"),
        ("formId", "contact"),
        ("fieldName", "attachment"),
    ])
}

pub async fn create_upload(server: &TestServer, length: u64, metadata: &str) -> TestResponse {
    server
        .post(BASE)
        .add_header("Tus-Resumable", "1.0.0")
        .add_header("Upload-Length", length.to_string())
        .add_header("Upload-Metadata", metadata.to_string())
        .await
}

/// Create a session and return its `Location`.
pub async fn create_session(server: &TestServer, length: u64) -> String {
    let response = create_upload(server, length, &form_metadata()).await;
    assert_eq!(response.status_code(), 201);
    location(&response)
}

pub fn location(response: &TestResponse) -> String {
    response
        .header("location")
        .to_str()
        .expect("ASCII Location")
        .to_string()
}

pub fn session_id(location: &str) -> String {
    location.rsplit('/').next().unwrap_or_default().to_string()
}

pub async fn append(server: &TestServer, location: &str, offset: u64, chunk: Vec<u8>) -> TestResponse {
    server
        .patch(location)
        .add_header("Tus-Resumable", "1.0.0")
        .add_header("Upload-Offset", offset.to_string())
        .content_type(OFFSET_OCTET_STREAM)
        .bytes(Bytes::from(chunk))
        .await
}

pub async fn head(server: &TestServer, location: &str) -> TestResponse {
    server
        .method(Method::HEAD, location)
        .add_header("Tus-Resumable", "1.0.0")
        .await
}

pub async fn terminate(server: &TestServer, location: &str) -> TestResponse {
    server
        .delete(location)
        .add_header("Tus-Resumable", "1.0.0")
        .await
}
