//! Resumable protocol conformance at the router level.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{generate_binary, TestApp, TEST_BUCKET};
use std::time::Duration;
use tower::ServiceExt;
use wavevault::hashing::digest_of;

async fn create_session(app: &TestApp, declared: usize, filename: &str) -> String {
    let metadata = format!("filename {}", hex::encode(filename));
    let request = Request::post("/uploads")
        .header("Upload-Length", declared.to_string())
        .header("Upload-Metadata", metadata)
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let location = response
        .headers()
        .get(header::LOCATION)
        .expect("Location header")
        .to_str()
        .unwrap()
        .to_string();
    location.strip_prefix("/uploads/").unwrap().to_string()
}

async fn patch_chunk(
    app: &TestApp,
    id: &str,
    offset: usize,
    chunk: &[u8],
) -> (StatusCode, Option<u64>) {
    let request = Request::patch(format!("/uploads/{id}"))
        .header("Upload-Offset", offset.to_string())
        .header(header::CONTENT_TYPE, "application/offset+octet-stream")
        .body(Body::from(chunk.to_vec()))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    let offset = response
        .headers()
        .get("Upload-Offset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    (response.status(), offset)
}

#[tokio::test]
async fn test_create_head_patch_roundtrip() {
    let app = TestApp::new();
    let payload = generate_binary(100_000, 1);
    let id = create_session(&app, payload.len(), "service.wav").await;

    // HEAD reports length and a zero offset
    let request = Request::head(format!("/uploads/{id}"))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("Upload-Offset").unwrap(),
        &"0".parse::<axum::http::HeaderValue>().unwrap()
    );
    assert_eq!(
        response.headers().get("Upload-Length").unwrap(),
        &payload.len().to_string().parse::<axum::http::HeaderValue>().unwrap()
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store"
    );

    // Two chunks to completion
    let (status, offset) = patch_chunk(&app, &id, 0, &payload[..40_000]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(offset, Some(40_000));

    let (status, offset) = patch_chunk(&app, &id, 40_000, &payload[40_000..]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(offset, Some(100_000));
}

#[tokio::test]
async fn test_patch_offset_mismatch_is_409() {
    let app = TestApp::new();
    let payload = generate_binary(10_000, 2);
    let id = create_session(&app, payload.len(), "x.wav").await;

    let (status, _) = patch_chunk(&app, &id, 0, &payload[..5_000]).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Replay at offset 0
    let (status, _) = patch_chunk(&app, &id, 0, &payload[..5_000]).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Server state is intact: HEAD still reports 5000
    let request = Request::head(format!("/uploads/{id}"))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("Upload-Offset").unwrap(),
        &"5000".parse::<axum::http::HeaderValue>().unwrap()
    );
}

#[tokio::test]
async fn test_patch_overflow_is_413() {
    let app = TestApp::new();
    let id = create_session(&app, 1_000, "small.wav").await;

    let (status, _) = patch_chunk(&app, &id, 0, &generate_binary(1_001, 3)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_patch_checksum_failure_is_460() {
    let app = TestApp::new();
    let id = create_session(&app, 1_000, "sum.wav").await;

    let request = Request::patch(format!("/uploads/{id}"))
        .header("Upload-Offset", "0")
        .header(header::CONTENT_TYPE, "application/offset+octet-stream")
        .header("Upload-Checksum", format!("sha256 {}", "0".repeat(64)))
        .body(Body::from(generate_binary(1_000, 4)))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status().as_u16(), 460);

    // Rejected before any mutation
    let request = Request::head(format!("/uploads/{id}"))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("Upload-Offset").unwrap(),
        &"0".parse::<axum::http::HeaderValue>().unwrap()
    );
}

#[tokio::test]
async fn test_verify_then_background_ingest() {
    let app = TestApp::new();
    let payload = generate_binary(50_000, 5);
    let digest = digest_of(&payload);
    let id = create_session(&app, payload.len(), "verified.wav").await;

    patch_chunk(&app, &id, 0, &payload).await;

    let request = Request::post(format!("/uploads/{id}/verify"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!("{{\"digest\":\"{digest}\"}}")))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "verified");

    // Background ingest lands the object under the canonical name
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if app.store.object_bytes(TEST_BUCKET, "verified_raw.wav").is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ingest did not land before deadline"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stored = app.store.object_bytes(TEST_BUCKET, "verified_raw.wav").unwrap();
    assert_eq!(digest_of(&stored), digest);
}

#[tokio::test]
async fn test_verify_mismatch_reports_failed() {
    let app = TestApp::new();
    let payload = generate_binary(1_000, 6);
    let id = create_session(&app, payload.len(), "bad.wav").await;
    patch_chunk(&app, &id, 0, &payload).await;

    let request = Request::post(format!("/uploads/{id}/verify"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(format!("{{\"digest\":\"{}\"}}", "0".repeat(64))))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "failed_verification");

    // Nothing stored
    assert_eq!(app.store.object_count(TEST_BUCKET), 0);
}

#[tokio::test]
async fn test_delete_session_idempotent() {
    let app = TestApp::new();
    let id = create_session(&app, 1_000, "gone.wav").await;

    for _ in 0..2 {
        let request = Request::delete(format!("/uploads/{id}"))
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let request = Request::head(format!("/uploads/{id}"))
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_options_advertises_extensions() {
    let app = TestApp::new();
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/uploads")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers().get("Upload-Extensions").unwrap(),
        "creation,termination,checksum"
    );
    assert_eq!(
        response.headers().get("Upload-Checksum-Algorithms").unwrap(),
        "sha256"
    );
}

#[tokio::test]
async fn test_create_without_length_is_400() {
    let app = TestApp::new();
    let request = Request::post("/uploads").body(Body::empty()).unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_over_cap_is_413() {
    let app = TestApp::new();
    let request = Request::post("/uploads")
        .header("Upload-Length", (128u64 * 1024 * 1024).to_string())
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_multipart_ingest_end_to_end() {
    let app = TestApp::new();
    let payload = generate_binary(10_000, 7);

    let mut body = Vec::new();
    body.extend_from_slice(b"--BOUNDARY\r\n");
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"files\"; filename=\"board.wav\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: audio/wav\r\n\r\n");
    body.extend_from_slice(&payload);
    body.extend_from_slice(b"\r\n--BOUNDARY--\r\n");

    let request = Request::post("/api/ingest")
        .header(
            header::CONTENT_TYPE,
            "multipart/form-data; boundary=BOUNDARY",
        )
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["successful"], 1);
    assert_eq!(json["total"], 1);
    assert_eq!(json["results"][0]["key"], "board_raw.wav");

    let stored = app.store.object_bytes(TEST_BUCKET, "board_raw.wav").unwrap();
    assert_eq!(digest_of(&stored), digest_of(&payload));
}
