//! TUS protocol integration tests.
//!
//! Run with: `cargo test -p formdrop-api --test tus_test`

mod helpers;

use axum::http::Method;
use formdrop_core::models::JobState;
use helpers::*;

#[tokio::test]
async fn test_options_advertises_capabilities() {
    let app = setup_test_app().await;
    let response = app.client().method(Method::OPTIONS, BASE).await;

    assert_eq!(response.status_code(), 204);
    assert_eq!(response.header("tus-resumable"), "1.0.0");
    assert_eq!(response.header("tus-version"), "1.0.0");
    assert_eq!(response.header("tus-max-size"), "2097152");
    assert_eq!(
        response.header("tus-extension"),
        "creation,expiration,termination"
    );
}

#[tokio::test]
async fn test_missing_protocol_version_is_rejected() {
    let app = setup_test_app().await;
    let response = app
        .client()
        .post(BASE)
        .add_header("Upload-Length", "10")
        .add_header("Upload-Metadata", form_metadata())
        .await;

    assert_eq!(response.status_code(), 412);
    assert_eq!(response.header("tus-version"), "1.0.0");
    assert_eq!(response.header("tus-resumable"), "1.0.0");
}

#[tokio::test]
async fn test_two_chunk_upload_completes_and_enqueues_one_job() {
    let app = setup_test_app().await;
    let client = app.client();

    let created = create_upload(client, 1_024_000, &form_metadata()).await;
    assert_eq!(created.status_code(), 201);
    assert_eq!(created.header("upload-offset"), "0");
    assert!(created
        .header("upload-expires")
        .to_str()
        .unwrap()
        .ends_with(" GMT"));
    let location = location(&created);
    assert!(location.starts_with("/files/"));
    let id = session_id(&location);

    let first = append(client, &location, 0, vec![1u8; 600_000]).await;
    assert_eq!(first.status_code(), 204);
    assert_eq!(first.header("upload-offset"), "600000");

    let progress = head(client, &location).await;
    assert_eq!(progress.status_code(), 200);
    assert_eq!(progress.header("upload-offset"), "600000");
    assert_eq!(progress.header("upload-length"), "1024000");
    assert_eq!(progress.header("cache-control"), "no-store");
    assert!(app.job_for(&id).await.is_none());

    let second = append(client, &location, 600_000, vec![2u8; 424_000]).await;
    assert_eq!(second.status_code(), 204);
    assert_eq!(second.header("upload-offset"), "1024000");

    let job = app.job_for(&id).await.expect("job enqueued on completion");
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.payload.file_size, 1_024_000);
    assert_eq!(job.payload.form_id, "contact");
    assert_eq!(job.payload.field_key, "attachment");
    assert_eq!(job.payload.file_name, "report.pdf");

    // handed off: the session itself is gone
    assert_eq!(head(client, &location).await.status_code(), 404);
}

#[tokio::test]
async fn test_offset_mismatch_is_conflict() {
    let app = setup_test_app().await;
    let client = app.client();
    let location = create_session(client, 1_024_000).await;

    let response = append(client, &location, 500_000, vec![0u8; 1000]).await;
    assert_eq!(response.status_code(), 409);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "OFFSET_MISMATCH");

    let progress = head(client, &location).await;
    assert_eq!(progress.header("upload-offset"), "0");
}

#[tokio::test]
async fn test_invalid_metadata_is_bad_request() {
    let app = setup_test_app().await;
    let missing_form = metadata(&[
        ("filename", "report.pdf"),
        ("filetype", "application/pdf"),
        ("fieldName", "attachment"),
    ]);

    let response = create_upload(app.client(), 10, &missing_form).await;
    assert_eq!(response.status_code(), 400);
    let body: serde_json::Value = response.json();
    assert_eq!(body["code"], "INVALID_INPUT");

    let garbled = create_upload(app.client(), 10, "filename !!!notbase64").await;
    assert_eq!(garbled.status_code(), 400);
}

#[tokio::test]
async fn test_upload_length_is_required() {
    let app = setup_test_app().await;
    let response = app
        .client()
        .post(BASE)
        .add_header("Tus-Resumable", "1.0.0")
        .add_header("Upload-Metadata", form_metadata())
        .await;
    assert_eq!(response.status_code(), 400);

    let negative = app
        .client()
        .post(BASE)
        .add_header("Tus-Resumable", "1.0.0")
        .add_header("Upload-Length", "-5")
        .add_header("Upload-Metadata", form_metadata())
        .await;
    assert_eq!(negative.status_code(), 400);
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let app = setup_test_app().await;
    let response = create_upload(app.client(), 3 * 1024 * 1024, &form_metadata()).await;
    assert_eq!(response.status_code(), 413);
}

#[tokio::test]
async fn test_chunk_requires_offset_content_type() {
    let app = setup_test_app().await;
    let client = app.client();
    let location = create_session(client, 10).await;

    let response = client
        .patch(&location)
        .add_header("Tus-Resumable", "1.0.0")
        .add_header("Upload-Offset", "0")
        .content_type("application/octet-stream")
        .bytes(vec![0u8; 10].into())
        .await;
    assert_eq!(response.status_code(), 415);
    assert_eq!(head(client, &location).await.header("upload-offset"), "0");
}

#[tokio::test]
async fn test_chunk_past_upload_length_is_rejected() {
    let app = setup_test_app().await;
    let client = app.client();
    let location = create_session(client, 10).await;

    let response = append(client, &location, 0, vec![0u8; 11]).await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(head(client, &location).await.header("upload-offset"), "0");
}

#[tokio::test]
async fn test_delete_terminates_session() {
    let app = setup_test_app().await;
    let client = app.client();
    let location = create_session(client, 100).await;
    assert_eq!(append(client, &location, 0, vec![9u8; 40]).await.status_code(), 204);

    assert_eq!(terminate(client, &location).await.status_code(), 204);
    assert_eq!(head(client, &location).await.status_code(), 404);
    assert_eq!(terminate(client, &location).await.status_code(), 404);
    assert_eq!(
        append(client, &location, 40, vec![9u8; 10]).await.status_code(),
        404
    );
    // staged chunk discarded
    assert_eq!(app.storage.object_count().await, 0);
}

#[tokio::test]
async fn test_expired_session_is_not_found() {
    let app = setup_test_app().await;
    let client = app.client();
    let location = create_session(client, 100).await;
    assert_eq!(append(client, &location, 0, vec![1u8; 40]).await.status_code(), 204);

    app.expire(&session_id(&location)).await;

    assert_eq!(head(client, &location).await.status_code(), 404);
    assert_eq!(
        append(client, &location, 40, vec![1u8; 10]).await.status_code(),
        404
    );
    assert_eq!(terminate(client, &location).await.status_code(), 404);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let app = setup_test_app().await;
    let response = head(app.client(), "/files/0123456789abcdef0123456789abcdef").await;
    assert_eq!(response.status_code(), 404);

    let malformed = head(app.client(), "/files/not-a-session").await;
    assert_eq!(malformed.status_code(), 404);
}

#[tokio::test]
async fn test_authenticated_user_is_carried_to_the_job() {
    let app = setup_test_app_as("user-42").await;
    let client = app.client();
    let location = create_session(client, 5).await;
    assert_eq!(append(client, &location, 0, b"hello".to_vec()).await.status_code(), 204);

    let job = app.job_for(&session_id(&location)).await.expect("job");
    assert_eq!(job.payload.user_id.as_deref(), Some("user-42"));
}

#[tokio::test]
async fn test_upload_is_stored_and_attached_to_submission() {
    let app = setup_test_app_with_workers().await;
    app.submissions.insert("sub-1").await;
    let client = app.client();

    let meta = metadata(&[
        ("filename", "report.pdf"),
        ("filetype", "application/pdf"),
        ("formId", "contact"),
        ("fieldName", "attachment"),
        ("submissionId", "sub-1"),
    ]);
    let created = create_upload(client, 8, &meta).await;
    assert_eq!(created.status_code(), 201);
    let location = location(&created);
    let id = session_id(&location);

    assert_eq!(append(client, &location, 0, b"%PDF".to_vec()).await.status_code(), 204);
    assert_eq!(append(client, &location, 4, b"-1.7".to_vec()).await.status_code(), 204);

    let job = app.wait_for_job(&id).await;
    assert_eq!(job.state, JobState::Completed);
    let result = job.result.expect("result recorded");
    assert!(result.success);
    assert_eq!(result.retry_count, Some(0));

    let key = format!("uploads/contact/{}/report.pdf", id);
    assert_eq!(result.storage_key.as_deref(), Some(key.as_str()));
    let stored = formdrop_storage::Storage::get(&app.storage, &key)
        .await
        .expect("object stored");
    assert_eq!(&stored[..], b"%PDF-1.7");

    let data = app.submissions.get("sub-1").await.expect("submission");
    assert_eq!(data["attachment"]["key"], key.as_str());
    assert_eq!(data["attachment"]["name"], "report.pdf");
    assert_eq!(data["attachment"]["size"], 8);

    if let Some(background) = app.background {
        background.shutdown().await;
    }
}

#[tokio::test]
async fn test_health_checks() {
    let app = setup_test_app().await;
    assert_eq!(app.client().get("/health/live").await.status_code(), 200);

    let ready = app.client().get("/health/ready").await;
    assert_eq!(ready.status_code(), 200);
    let body: serde_json::Value = ready.json();
    assert_eq!(body["database"], "in_memory");
    assert_eq!(body["storage"], "ready");
}
