//! Router-level tests for the publish API, driven with `oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use pushgate_core::package::pack_manifest;
use pushgate_core::server::{router, API_KEY_HEADER};
use pushgate_core::{Config, Gallery, PackageIdentity};

struct TestGallery {
    _tmp: tempfile::TempDir,
    gallery: Arc<Gallery>,
    app: Router,
}

async fn open(configure: impl FnOnce(&mut Config), workers: bool) -> TestGallery {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::with_data_dir(tmp.path());
    config.workers = 2;
    configure(&mut config);
    let gallery = Arc::new(Gallery::open(config).await.unwrap());
    if workers {
        gallery.start_workers();
    }
    let app = router(Arc::clone(&gallery));
    TestGallery {
        _tmp: tmp,
        gallery,
        app,
    }
}

fn package(manifest: Value) -> Vec<u8> {
    pack_manifest(&manifest, &[("index.js", b"module.exports = 1;\n")]).unwrap()
}

fn put(uri: &str, content: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/octet-stream")
        .body(Body::from(content))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body.to_vec())
}

fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

/// Poll a download until it leaves the pending state.
async fn download_when_ready(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    for _ in 0..200 {
        let (status, _, body) = send(app, get(uri)).await;
        if status != StatusCode::ACCEPTED {
            return (status, body);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{} never left the pending state", uri);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sixteen_concurrent_pushes_yield_one_created_and_fifteen_conflicts() {
    let t = open(|_| {}, true).await;

    let mut handles = Vec::new();
    for caller in 0..16 {
        let app = t.app.clone();
        handles.push(tokio::spawn(async move {
            let content = package(json!({
                "name": "Foo",
                "version": "1.0.0",
                "description": format!("pushed by caller {}", caller),
            }));
            let (status, _, body) = send(&app, put("/api/v2/package/Foo/1.0.0", content.clone())).await;
            (status, body, content)
        }));
    }

    let mut winner = None;
    let mut conflicts = 0;
    for handle in handles {
        let (status, body, content) = handle.await.unwrap();
        match status {
            StatusCode::CREATED => {
                assert!(winner.is_none(), "second 201");
                assert_eq!(json_body(&body)["state"], "pending");
                winner = Some(content);
            }
            StatusCode::CONFLICT => {
                assert_eq!(json_body(&body)["code"], "IDENTITY_CONFLICT");
                conflicts += 1;
            }
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(conflicts, 15);
    let winner = winner.unwrap();

    let (status, body) = download_when_ready(&t.app, "/api/v2/package/Foo/1.0.0").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, winner);
}

#[tokio::test]
async fn pending_claim_reads_as_accepted_not_missing() {
    // No workers: the push stays pending.
    let t = open(|_| {}, false).await;

    let content = package(json!({ "name": "Foo", "version": "1.0.0" }));
    let (status, _, _) = send(&t.app, put("/api/v2/package", content)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, headers, body) = send(&t.app, get("/api/v2/package/foo/1.0")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(headers.get("retry-after").unwrap(), "1");
    assert_eq!(json_body(&body)["state"], "pending");

    let (status, _, body) = send(&t.app, get("/api/v2/package/Foo/1.0.0/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["state"], "pending");

    let (status, _, body) = send(&t.app, get("/api/v2/package/Foo/9.9.9")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json_body(&body)["code"], "NOT_FOUND");
}

#[tokio::test]
async fn rejected_identity_stays_burned() {
    let t = open(|c| c.policy.require_license = true, true).await;

    let unlicensed = package(json!({ "name": "Foo", "version": "1.0.0" }));
    let (status, _, _) = send(&t.app, put("/api/v2/package/Foo/1.0.0", unlicensed)).await;
    assert_eq!(status, StatusCode::CREATED);
    t.gallery.validator().wait_idle().await;

    let (status, _, _) = send(&t.app, get("/api/v2/package/Foo/1.0.0")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, _, body) = send(&t.app, get("/api/v2/package/Foo/1.0.0/status")).await;
    let report = json_body(&body);
    assert_eq!(report["state"], "rejected");
    assert!(report["reason"].as_str().unwrap().contains("license"));

    // A corrected upload cannot take the identity back.
    let fixed = package(json!({ "name": "Foo", "version": "1.0.0", "license": "MIT" }));
    let (status, _, _) = send(&t.app, put("/api/v2/package/Foo/1.0.0", fixed.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _, _) = send(&t.app, put("/api/v2/package", fixed)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn republish_after_success_conflicts_and_versions_lists_it() {
    let t = open(|_| {}, true).await;
    let content = package(json!({ "name": "Foo", "version": "1.0.0" }));
    let (status, _, _) = send(&t.app, put("/api/v2/package", content.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    t.gallery.validator().wait_idle().await;

    let (status, _, _) = send(&t.app, put("/api/v2/package", content)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, body) = send(&t.app, get("/api/v2/package/FOO/versions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json_body(&body)["versions"], json!(["1.0.0"]));
}

#[tokio::test]
async fn store_failure_is_a_server_error_and_burns_the_identity() {
    let t = open(|_| {}, false).await;
    let identity = PackageIdentity::parse("Foo", "1.0.0").unwrap();
    let dest = t.gallery.store().path_for(&identity);
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    std::fs::write(&dest, b"not ours").unwrap();

    let content = package(json!({ "name": "Foo", "version": "1.0.0" }));
    let (status, _, body) = send(&t.app, put("/api/v2/package", content.clone())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(&body)["code"], "STORE_WRITE_FAILURE");

    let (status, _, _) = send(&t.app, put("/api/v2/package", content)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _, _) = send(&t.app, get("/api/v2/package/Foo/1.0.0")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_uploads_are_client_errors() {
    let t = open(|c| c.max_package_bytes = 64 * 1024, false).await;

    let (status, _, body) = send(&t.app, put("/api/v2/package", b"definitely not a tarball".to_vec())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json_body(&body)["code"], "INVALID_PAYLOAD");

    let content = package(json!({ "name": "Foo", "version": "1.0.0" }));
    let (status, _, _) = send(&t.app, put("/api/v2/package/Foo/2.0.0", content)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(&t.app, put("/api/v2/package/-bad-/1.0.0", Vec::new())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(&t.app, put("/api/v2/package", vec![0u8; 128 * 1024])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(&body)["code"], "PAYLOAD_TOO_LARGE");

    // None of the failures claimed anything.
    assert!(t.gallery.ledger().is_empty());
}

#[tokio::test]
async fn pushes_require_a_known_api_key_when_configured() {
    let t = open(|c| c.api_keys = vec!["s3cret".to_string()], false).await;
    let content = package(json!({ "name": "Foo", "version": "1.0.0" }));

    let (status, _, body) = send(&t.app, put("/api/v2/package", content.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(&body)["code"], "UNAUTHORIZED");

    let mut request = put("/api/v2/package", content);
    request
        .headers_mut()
        .insert(API_KEY_HEADER, "s3cret".parse().unwrap());
    let (status, _, _) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::CREATED);

    // Reads stay open.
    let (status, _, _) = send(&t.app, get("/api/v2/package/Foo/1.0.0")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn health_is_ok() {
    let t = open(|_| {}, false).await;
    let (status, _, body) = send(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}
