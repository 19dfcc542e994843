//! Application state and router assembly.

use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use std::sync::Arc;
use tower_http::services::ServeDir;

use super::handlers::{admin, feed, health, jobs, media, pages, translate, workflows};
use super::{middleware, ws_status};
use crate::config::Config;
use crate::core::Scheduler;
use crate::media::{FeedMediaStore, MediaStore};
use crate::notify::NotificationHub;
use crate::store::{JobStore, PostStore};
use crate::translate::Translator;
use crate::workflows::WorkflowRegistry;

/// Everything a handler can reach, assembled once at startup. No global
/// singletons — components are injected here and cloned per request.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// The job scheduler.
    pub scheduler: Arc<Scheduler>,
    /// WebSocket fan-out hub.
    pub hub: Arc<NotificationHub>,
    /// User media store.
    pub media: MediaStore,
    /// Feed asset store.
    pub feed_media: FeedMediaStore,
    /// Feed post/like/reaction store.
    pub posts: PostStore,
    /// Job snapshot store.
    pub jobs: JobStore,
    /// Workflow recipe registry.
    pub workflows: Arc<WorkflowRegistry>,
    /// Prompt translation client.
    pub translator: Translator,
}

/// Build the full router: API routes, the status WebSocket, the admin
/// surface behind BasicAuth, static mounts, and the middleware stack
/// (beta gate → request log → feed-trash gate, outermost first).
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/api/v1/admin/users", get(admin::users))
        .route("/api/v1/admin/jobs", get(admin::jobs))
        .route("/api/v1/admin/jobs/metrics", get(admin::jobs_metrics))
        .route("/api/v1/admin/jobs/sweep", post(admin::jobs_sweep))
        .route("/api/v1/admin/images", get(admin::images))
        .route(
            "/api/v1/admin/images/{user_id}/{image_id}/status",
            post(admin::set_image_status),
        )
        .route(
            "/api/v1/admin/images/{user_id}/{image_id}/purge",
            post(admin::purge_image),
        )
        .route("/api/v1/admin/feed", get(admin::feed_list))
        .route("/api/v1/admin/feed/{post_id}/delete", post(admin::feed_delete))
        .route("/api/v1/admin/feed/{post_id}/restore", post(admin::feed_restore))
        .route("/api/v1/admin/feed/{post_id}/purge", post(admin::feed_purge))
        .route("/api/v1/admin/workflows/reload", post(admin::reload_workflows))
        .route_layer(from_fn_with_state(state.clone(), middleware::admin_guard));

    Router::new()
        .route("/", get(pages::landing))
        .route(
            "/beta-login",
            get(pages::beta_login_page).post(pages::beta_login_submit),
        )
        .route("/healthz", get(health::healthz))
        .route("/api/v1/generate", post(jobs::generate))
        .route("/api/v1/jobs/metrics", get(jobs::metrics))
        .route("/api/v1/jobs/{id}", get(jobs::job_status))
        .route("/api/v1/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/api/v1/cancel", post(jobs::cancel_active))
        .route("/api/v1/workflows", get(workflows::list))
        .route("/api/v1/images", get(media::list_images))
        .route("/api/v1/images/{id}/delete", post(media::delete_image))
        .route("/api/v1/controls", get(media::list_controls))
        .route("/api/v1/controls/upload", post(media::upload_control))
        .route("/api/v1/controls/{id}/delete", post(media::delete_control))
        .route("/api/v1/controls/{id}/restore", post(media::restore_control))
        .route("/api/v1/inputs", get(media::list_inputs))
        .route("/api/v1/inputs/upload", post(media::upload_input))
        .route("/api/v1/inputs/copy", post(media::copy_input))
        .route("/api/v1/inputs/{id}/delete", post(media::delete_input))
        .route("/api/v1/inputs/{id}/restore", post(media::restore_input))
        .route("/api/v1/feed", get(feed::list))
        .route("/api/v1/feed/publish", post(feed::publish))
        .route("/api/v1/feed/{post_id}", get(feed::detail))
        .route("/api/v1/feed/{post_id}/like", post(feed::like))
        .route("/api/v1/feed/{post_id}/reaction", post(feed::reaction))
        .route("/api/v1/feed/{post_id}/delete", post(feed::delete))
        .route("/api/v1/translate-prompt", post(translate::translate_prompt))
        .route("/ws/status", get(ws_status::ws_status))
        .merge(admin_routes)
        .nest_service("/outputs", ServeDir::new(&state.config.output_dir))
        .nest_service("/static", ServeDir::new(&state.config.static_dir))
        .layer(from_fn_with_state(state.clone(), middleware::feed_trash_gate))
        .layer(from_fn(middleware::request_log))
        .layer(from_fn_with_state(state.clone(), middleware::beta_gate))
        .with_state(state)
}
