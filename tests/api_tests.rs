//! End-to-end router tests: admission, status, permissions, and the
//! feed trash gate, all against a real temp-dir state.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use clap::Parser;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

use atelier::api::{AppState, create_router};
use atelier::config::Config;
use atelier::core::{Scheduler, scheduler::SchedulerSettings};
use atelier::media::{FeedMediaStore, MediaStore, Provenance};
use atelier::notify::{self, NotificationHub};
use atelier::store::{JobStore, PostStore};
use atelier::translate::Translator;
use atelier::workflows::WorkflowRegistry;

const ANON_COOKIE: &str = "anon_id=anon-testertestertester1";
const ADMIN_USER: &str = "root";
const ADMIN_PASSWORD: &str = "hunter2";

struct TestApp {
    _dir: TempDir,
    app: Router,
    media: MediaStore,
}

async fn test_app(extra_args: &[&str]) -> TestApp {
    let dir = TempDir::new().expect("tempdir");
    let output_dir = dir.path().join("outputs");
    let db_path = dir.path().join("db/app_data.db");
    std::fs::create_dir_all(&output_dir).expect("mkdir");

    let mut args = vec![
        "atelier".to_owned(),
        "--output-dir".to_owned(),
        output_dir.display().to_string(),
        "--job-db-path".to_owned(),
        db_path.display().to_string(),
        "--workflow-dir".to_owned(),
        dir.path().join("workflows").display().to_string(),
        "--static-dir".to_owned(),
        dir.path().join("static").display().to_string(),
        "--admin-user".to_owned(),
        ADMIN_USER.to_owned(),
        "--admin-password".to_owned(),
        ADMIN_PASSWORD.to_owned(),
    ];
    args.extend(extra_args.iter().map(ToString::to_string));
    let config = Config::try_parse_from(args).expect("config");

    let jobs = JobStore::new(&db_path, &output_dir).await.expect("job store");
    let posts = PostStore::new(&db_path).await.expect("post store");
    let media = MediaStore::new(&output_dir);
    let feed_media = FeedMediaStore::new(&output_dir);
    let workflows = Arc::new(WorkflowRegistry::load(dir.path().join("workflows")));
    let hub = Arc::new(NotificationHub::new());
    let translator = Translator::new(&config).expect("translator");

    let (notify_tx, notify_rx) = mpsc::channel(64);
    let scheduler = Arc::new(Scheduler::new(
        SchedulerSettings::from_config(&config),
        notify_tx,
    ));
    let _pump = tokio::spawn(notify::run_pump(notify_rx, Arc::clone(&hub), jobs.clone()));

    let state = AppState {
        config: Arc::new(config),
        scheduler,
        hub,
        media: media.clone(),
        feed_media,
        posts,
        jobs,
        workflows,
        translator,
    };
    TestApp {
        _dir: dir,
        app: create_router(state),
        media,
    }
}

fn admin_header() -> String {
    format!(
        "Basic {}",
        base64::prelude::BASE64_STANDARD.encode(format!("{ADMIN_USER}:{ADMIN_PASSWORD}"))
    )
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(16, 16, image::Rgb([10, 20, 30]));
    let mut buf = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .expect("fixture");
    buf.into_inner()
}

fn generate_body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "user_prompt": "a fox",
        "aspect_ratio": "square",
        "workflow_id": "PixelArt"
    }))
    .expect("body")
}

fn post_json(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, ANON_COOKIE)
        .body(Body::from(body))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::COOKIE, ANON_COOKIE)
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn test_generate_enqueues_and_reports_status() {
    let harness = test_app(&[]).await;

    let response = harness
        .app
        .clone()
        .oneshot(post_json("/api/v1/generate", generate_body()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("X-Request-ID"));
    let body = body_json(response).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["position"], 0);
    let job_id = body["job_id"].as_str().expect("job id").to_owned();

    // No worker is running, so the job stays queued.
    let response = harness
        .app
        .clone()
        .oneshot(get(&format!("/api/v1/jobs/{job_id}")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["progress"], 0.0);

    // Cancelling a queued job succeeds exactly once.
    let response = harness
        .app
        .clone()
        .oneshot(post_json(&format!("/api/v1/jobs/{job_id}/cancel"), Vec::new()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let response = harness
        .app
        .clone()
        .oneshot(post_json(&format!("/api/v1/jobs/{job_id}/cancel"), Vec::new()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_queue_full_is_429() {
    let harness = test_app(&["--max-per-user-queue", "2"]).await;
    for _ in 0..2 {
        let response = harness
            .app
            .clone()
            .oneshot(post_json("/api/v1/generate", generate_body()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = harness
        .app
        .clone()
        .oneshot(post_json("/api/v1/generate", generate_body()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_unknown_job_is_404() {
    let harness = test_app(&[]).await;
    let response = harness
        .app
        .clone()
        .oneshot(get("/api/v1/jobs/doesnotexist"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_active_without_running_job_is_400() {
    let harness = test_app(&[]).await;
    let response = harness
        .app
        .clone()
        .oneshot(post_json("/api/v1/cancel", Vec::new()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_image_listing_and_soft_delete() {
    let harness = test_app(&[]).await;
    let saved = harness
        .media
        .save_artifact(
            "anon-testertestertester1",
            &png_bytes(),
            &Provenance::default(),
            "out.png",
        )
        .expect("save");

    let response = harness
        .app
        .clone()
        .oneshot(get("/api/v1/images"))
        .await
        .expect("response");
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["id"], saved.id.as_str());

    let response = harness
        .app
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/images/{}/delete", saved.id),
            Vec::new(),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = harness
        .app
        .clone()
        .oneshot(get("/api/v1/images"))
        .await
        .expect("response");
    let body = body_json(response).await;
    assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn test_feed_publish_delete_and_trash_gate() {
    let harness = test_app(&[]).await;
    let saved = harness
        .media
        .save_artifact(
            "anon-testertestertester1",
            &png_bytes(),
            &Provenance {
                prompt: Some("a fox".into()),
                workflow_id: Some("PixelArt".into()),
                ..Provenance::default()
            },
            "out.png",
        )
        .expect("save");

    // Publish the artifact.
    let response = harness
        .app
        .clone()
        .oneshot(post_json(
            "/api/v1/feed/publish",
            serde_json::to_vec(&json!({ "image_id": saved.id, "author_name": "  fox  artist  " }))
                .expect("body"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let post_id = body["post_id"].as_str().expect("post id").to_owned();
    let image_url = body["image_url"].as_str().expect("image url").to_owned();

    // The published copy is served from the active tree.
    let response = harness
        .app
        .clone()
        .oneshot(get(&image_url))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    // The feed lists it with the sanitised author name.
    let response = harness
        .app
        .clone()
        .oneshot(get("/api/v1/feed"))
        .await
        .expect("response");
    let body = body_json(response).await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["author_display"], "fox artist");

    // Owner deletes the post; assets move to trash.
    let response = harness
        .app
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/feed/{post_id}/delete"),
            Vec::new(),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let trash_url = image_url.replace("/outputs/feed/", "/outputs/feed/trash/");

    // Non-admin sees 404 — not 403 — on the trash URL.
    let response = harness
        .app
        .clone()
        .oneshot(get(&trash_url))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Admin gets the bytes.
    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(&trash_url)
                .header(header::AUTHORIZATION, admin_header())
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    // Restore brings the normal URL back.
    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/admin/feed/{post_id}/restore"))
                .header(header::AUTHORIZATION, admin_header())
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let response = harness
        .app
        .clone()
        .oneshot(get(&image_url))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_feed_reactions_over_http() {
    let harness = test_app(&[]).await;
    let saved = harness
        .media
        .save_artifact(
            "anon-testertestertester1",
            &png_bytes(),
            &Provenance::default(),
            "out.png",
        )
        .expect("save");
    let response = harness
        .app
        .clone()
        .oneshot(post_json(
            "/api/v1/feed/publish",
            serde_json::to_vec(&json!({ "image_id": saved.id })).expect("body"),
        ))
        .await
        .expect("response");
    let post_id = body_json(response).await["post_id"]
        .as_str()
        .expect("post id")
        .to_owned();

    // like -> react:love -> react:love ends with no signal at all.
    let response = harness
        .app
        .clone()
        .oneshot(post_json(&format!("/api/v1/feed/{post_id}/like"), Vec::new()))
        .await
        .expect("response");
    assert_eq!(body_json(response).await["liked"], true);

    for expected_love in [1, 0] {
        let response = harness
            .app
            .clone()
            .oneshot(post_json(
                &format!("/api/v1/feed/{post_id}/reaction"),
                serde_json::to_vec(&json!({ "reaction": "love" })).expect("body"),
            ))
            .await
            .expect("response");
        let body = body_json(response).await;
        assert_eq!(body["reactions"]["love"], expected_love);
    }

    let response = harness
        .app
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/feed/{post_id}/reaction"),
            serde_json::to_vec(&json!({ "reaction": "nonsense" })).expect("body"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_surface_requires_basic_auth() {
    let harness = test_app(&[]).await;
    let response = harness
        .app
        .clone()
        .oneshot(get("/api/v1/admin/jobs"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/admin/jobs")
                .header(header::AUTHORIZATION, admin_header())
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_beta_gate_blocks_api_with_401() {
    let harness = test_app(&["--beta-password", "letmein"]).await;
    let response = harness
        .app
        .clone()
        .oneshot(get("/api/v1/images"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["detail"], "beta_auth_required");

    // Pages redirect to the login form instead.
    let response = harness
        .app
        .clone()
        .oneshot(get("/"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SEE_OTHER);

    // Health stays reachable for probes.
    let response = harness
        .app
        .clone()
        .oneshot(get("/healthz"))
        .await
        .expect("response");
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_beta_login_sets_cookie_that_passes_gate() {
    let harness = test_app(&["--beta-password", "letmein"]).await;
    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/beta-login")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("password=letmein"))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("cookie set")
        .to_str()
        .expect("ascii")
        .to_owned();
    let cookie_pair = set_cookie.split(';').next().expect("pair").to_owned();

    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/images")
                .header(header::COOKIE, format!("{ANON_COOKIE}; {cookie_pair}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_workflows_listing_hides_hidden() {
    let harness = test_app(&[]).await;
    // Registry dir was empty at startup; write configs and reload as admin.
    let workflow_dir = harness._dir.path().join("workflows");
    std::fs::create_dir_all(&workflow_dir).expect("mkdir");
    std::fs::write(
        workflow_dir.join("workflows.json"),
        r#"{ "Visible": { "display_name": "Visible" }, "Secret": { "hidden": true } }"#,
    )
    .expect("write");
    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/admin/workflows/reload")
                .header(header::AUTHORIZATION, admin_header())
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = harness
        .app
        .clone()
        .oneshot(get("/api/v1/workflows"))
        .await
        .expect("response");
    let body = body_json(response).await;
    let workflows = body["workflows"].as_array().expect("array");
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0]["id"], "Visible");
}

#[tokio::test]
async fn test_translate_unconfigured_is_503() {
    let harness = test_app(&[]).await;
    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/translate-prompt")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("text=hello"))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
