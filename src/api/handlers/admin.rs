//! Operator surface, guarded by BasicAuth at the router layer.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::error::ApiError;
use crate::api::protocol::{MediaItemDto, paginate};
use crate::api::server::AppState;
use crate::media::MediaKind;
use crate::media::feed::{FeedMediaStore, PostAssets};
use crate::store::posts::{FeedPost, PostFilter, PostSort};

/// Query parameters of the user listing.
#[derive(Debug, Deserialize)]
pub struct UsersQuery {
    /// 1-based page.
    #[serde(default = "default_page")]
    pub page: i64,
    /// Page size.
    #[serde(default = "default_users_size")]
    pub size: i64,
    /// Substring filter on the anon id.
    #[serde(default)]
    pub q: Option<String>,
}

fn default_page() -> i64 {
    1
}

fn default_users_size() -> i64 {
    50
}

/// `GET /api/v1/admin/users` — owners that have stored anything.
pub async fn users(
    State(state): State<AppState>,
    Query(query): Query<UsersQuery>,
) -> Json<Value> {
    let mut users = state.media.list_owner_ids();
    if let Some(q) = query.q.as_deref().filter(|q| !q.is_empty()) {
        let needle = q.to_lowercase();
        users.retain(|u| u.to_lowercase().contains(&needle));
    }
    let page = paginate(users, query.page, query.size.clamp(1, 200));
    Json(json!({
        "users": page.items,
        "page": page.page,
        "size": page.size,
        "total": page.total,
        "total_pages": page.total_pages,
    }))
}

/// Query parameters with a row limit.
#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    /// Maximum rows.
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// `GET /api/v1/admin/jobs` — recent job snapshots, falling back to the
/// in-memory registry when the store has nothing.
pub async fn jobs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.clamp(1, 1000);
    let rows = state.jobs.fetch_recent(limit).await.unwrap_or_default();
    if rows.is_empty() {
        let jobs = state
            .scheduler
            .list_jobs(usize::try_from(limit).unwrap_or(100));
        return Ok(Json(json!({ "jobs": jobs })));
    }
    Ok(Json(json!({ "jobs": rows })))
}

/// `GET /api/v1/admin/jobs/metrics` — registry-backed averages (the
/// registry knows workflow ids; snapshots do not).
pub async fn jobs_metrics(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let limit = usize::try_from(query.limit.clamp(1, 1000)).unwrap_or(100);
    let averages = state.scheduler.recent_averages(limit);
    Json(serde_json::to_value(&averages).unwrap_or_else(|_| json!({})))
}

/// `POST /api/v1/admin/jobs/sweep` — reconcile artifact availability.
pub async fn jobs_sweep(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.clamp(1, 5000);
    let updated = state.jobs.sweep(limit).await?;
    Ok(Json(json!({ "updated": updated })))
}

/// Query parameters of the admin media listing.
#[derive(Debug, Deserialize)]
pub struct AdminMediaQuery {
    /// Which user to inspect.
    pub user_id: String,
    /// `generated` (default), `control`, or `input`.
    #[serde(default)]
    pub kind: Option<String>,
    /// `active`, `trash`, or `all` (default).
    #[serde(default)]
    pub include: Option<String>,
    /// 1-based page.
    #[serde(default = "default_page")]
    pub page: i64,
    /// Page size.
    #[serde(default = "default_media_size")]
    pub size: i64,
}

fn default_media_size() -> i64 {
    24
}

fn parse_kind(kind: Option<&str>) -> Result<MediaKind, ApiError> {
    match kind.unwrap_or("generated") {
        "generated" | "images" => Ok(MediaKind::Generated),
        "control" | "controls" => Ok(MediaKind::Control),
        "input" | "inputs" => Ok(MediaKind::Input),
        other => Err(ApiError::bad_request(format!("unknown kind: {other}"))),
    }
}

/// `GET /api/v1/admin/images` — any user's media, trash included.
pub async fn images(
    State(state): State<AppState>,
    Query(query): Query<AdminMediaQuery>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_kind(query.kind.as_deref())?;
    let mut items = state.media.list(&query.user_id, kind, true);
    match query.include.as_deref().unwrap_or("all") {
        "active" => items.retain(|it| it.status == "active"),
        "trash" => items.retain(|it| it.status != "active"),
        _ => {}
    }
    let page = paginate(items, query.page, query.size);
    let items: Vec<MediaItemDto> = page.items.into_iter().map(MediaItemDto::from).collect();
    Ok(Json(json!({
        "items": items,
        "page": page.page,
        "size": page.size,
        "total": page.total,
        "total_pages": page.total_pages,
    })))
}

/// Body of the status mutation.
#[derive(Debug, Deserialize)]
pub struct StatusBody {
    /// `active` or `trash`.
    pub status: String,
    /// Media kind; generated by default.
    #[serde(default)]
    pub kind: Option<String>,
}

/// `POST /api/v1/admin/images/{user_id}/{image_id}/status` — soft-delete
/// or restore any user's item.
pub async fn set_image_status(
    State(state): State<AppState>,
    Path((user_id, image_id)): Path<(String, String)>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, ApiError> {
    if body.status != "active" && body.status != "trash" {
        return Err(ApiError::bad_request("status must be active or trash"));
    }
    let kind = parse_kind(body.kind.as_deref())?;
    if !state
        .media
        .update_status(&user_id, kind, &image_id, &body.status)
    {
        return Err(ApiError::not_found("Image not found"));
    }
    tracing::info!(user_id = %user_id, image_id = %image_id, status = %body.status, "admin status change");
    Ok(Json(json!({ "ok": true })))
}

/// Query selecting a media kind.
#[derive(Debug, Deserialize)]
pub struct KindQuery {
    /// Media kind; generated by default.
    #[serde(default)]
    pub kind: Option<String>,
}

/// `POST /api/v1/admin/images/{user_id}/{image_id}/purge` — remove an
/// item's files permanently.
pub async fn purge_image(
    State(state): State<AppState>,
    Path((user_id, image_id)): Path<(String, String)>,
    Query(query): Query<KindQuery>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_kind(query.kind.as_deref())?;
    if !state.media.purge(&user_id, kind, &image_id) {
        return Err(ApiError::not_found("Image not found"));
    }
    tracing::info!(user_id = %user_id, image_id = %image_id, "admin purge");
    Ok(Json(json!({ "ok": true })))
}

/// Query parameters of the admin feed listing.
#[derive(Debug, Deserialize)]
pub struct AdminFeedQuery {
    /// `active`, `trash`, or `all` (default).
    #[serde(default = "default_include")]
    pub include: String,
    /// 1-based page.
    #[serde(default = "default_page")]
    pub page: i64,
    /// Page size.
    #[serde(default = "default_feed_size")]
    pub size: i64,
}

fn default_include() -> String {
    "all".to_owned()
}

fn default_feed_size() -> i64 {
    48
}

fn with_display_urls(post: &FeedPost) -> Value {
    let mut value = serde_json::to_value(post).unwrap_or_else(|_| json!({}));
    let trashed = post.status == "trash";
    let rewrite = |url: &Option<String>| -> Value {
        match url {
            Some(url) if trashed => Value::String(FeedMediaStore::active_url_to_trash_url(url)),
            Some(url) => Value::String(url.clone()),
            None => Value::Null,
        }
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "display_image_url".into(),
            rewrite(&Some(post.image_url.clone())),
        );
        obj.insert("display_thumb_url".into(), rewrite(&post.thumb_url));
        obj.insert(
            "display_input_image_url".into(),
            rewrite(&post.input_image_url),
        );
        obj.insert(
            "display_input_thumb_url".into(),
            rewrite(&post.input_thumb_url),
        );
    }
    value
}

/// `GET /api/v1/admin/feed` — posts with trash-aware display URLs.
pub async fn feed_list(
    State(state): State<AppState>,
    Query(query): Query<AdminFeedQuery>,
) -> Result<Json<Value>, ApiError> {
    let include = PostFilter::parse(&query.include);
    let page = state
        .posts
        .list_posts(include, query.page, query.size, PostSort::Newest)
        .await?;
    let items: Vec<Value> = page.items.iter().map(with_display_urls).collect();
    Ok(Json(json!({
        "items": items,
        "page": page.page,
        "size": page.size,
        "total": page.total,
        "total_pages": page.total_pages,
    })))
}

async fn post_in_status(
    state: &AppState,
    post_id: &str,
    status: &str,
    message: &str,
) -> Result<FeedPost, ApiError> {
    let post = state
        .posts
        .get_post(post_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Post not found"))?;
    if post.status != status {
        return Err(ApiError::bad_request(message));
    }
    Ok(post)
}

/// `POST /api/v1/admin/feed/{post_id}/delete` — move a post to trash.
pub async fn feed_delete(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let post = post_in_status(&state, &post_id, "active", "Post is not active").await?;
    state
        .feed_media
        .move_to_trash(&PostAssets::of(&post))
        .map_err(|err| ApiError::internal(&err))?;
    state.posts.update_status(&post_id, "trash").await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /api/v1/admin/feed/{post_id}/restore` — bring a post back.
pub async fn feed_restore(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let post = post_in_status(&state, &post_id, "trash", "Post is not in trash").await?;
    state
        .feed_media
        .restore_from_trash(&PostAssets::of(&post))
        .map_err(|err| ApiError::internal(&err))?;
    state.posts.update_status(&post_id, "active").await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /api/v1/admin/feed/{post_id}/purge` — delete the post's files
/// and rows permanently.
pub async fn feed_purge(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let post = post_in_status(&state, &post_id, "trash", "Post is not in trash").await?;
    state.feed_media.purge_from_trash(&PostAssets::of(&post));
    state.posts.delete_post_and_likes(&post_id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /api/v1/admin/workflows/reload` — re-read workflows.json.
pub async fn reload_workflows(State(state): State<AppState>) -> Json<Value> {
    let count = state.workflows.reload();
    Json(json!({ "ok": true, "workflows": count }))
}
