//! Public feed: publish, browse, react, delete.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum_extra::extract::cookie::CookieJar;
use serde_json::{Value, json};

use crate::api::error::ApiError;
use crate::api::protocol::{
    FeedDetailDto, FeedItemDto, FeedListQuery, FeedPublishRequest, FeedReactionRequest,
    mask_owner, sanitize_author_name,
};
use crate::api::server::AppState;
use crate::auth::{admin, anon};
use crate::media::MediaKind;
use crate::media::feed::{PostAssets, PublishSource};
use crate::store::posts::{FeedPost, PostFilter, PostSort, ReactionKind};

fn is_admin(state: &AppState, headers: &HeaderMap) -> bool {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    admin::is_admin_authorization(&state.config, authorization)
}

/// `POST /api/v1/feed/publish` — copy one owned artifact to the board.
pub async fn publish(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<FeedPublishRequest>,
) -> Result<Json<Value>, ApiError> {
    let anon_id = anon::anon_id_from_jar(&jar);
    let image_id = request.image_id.trim();
    if image_id.is_empty() {
        return Err(ApiError::bad_request("Missing image_id"));
    }

    let meta = state
        .media
        .read_meta(&anon_id, MediaKind::Generated, image_id)
        .ok_or_else(|| ApiError::not_found("Source image not found"))?;
    if meta.status != "active" {
        return Err(ApiError::bad_request("Source image is not active"));
    }
    if meta.kind.is_some() {
        return Err(ApiError::bad_request("Unsupported source kind"));
    }
    let src_png = state
        .media
        .locate_png(&anon_id, MediaKind::Generated, image_id)
        .filter(|p| p.exists())
        .ok_or_else(|| ApiError::not_found("Source PNG not found"))?;

    // When the artifact was image-to-image, its input reference is
    // published alongside.
    let input_source_id = meta.input_image_id.clone();
    let input_png = input_source_id
        .as_deref()
        .and_then(|id| state.media.locate_png(&anon_id, MediaKind::Input, id))
        .filter(|p| p.exists());

    let post = state
        .feed_media
        .publish(PublishSource {
            owner_id: &anon_id,
            author_name: sanitize_author_name(request.author_name.as_deref()),
            prompt: meta.prompt.clone().unwrap_or_default(),
            workflow_id: meta.workflow_id.clone(),
            seed: meta.seed,
            aspect_ratio: meta.aspect_ratio.clone(),
            source_image_id: image_id,
            source_png_fs: &src_png,
            input_source_image_id: input_source_id,
            input_png_fs: input_png,
        })
        .map_err(|err| {
            tracing::error!(owner_id = %anon_id, image_id = %image_id, error = %err, "feed publish failed");
            ApiError::internal(&err)
        })?;

    state.posts.create_post(&post).await.map_err(|err| {
        tracing::error!(post_id = %post.post_id, error = %err, "feed post insert failed");
        ApiError::internal(&err)
    })?;

    Ok(Json(json!({
        "ok": true,
        "post_id": post.post_id,
        "image_url": post.image_url,
        "thumb_url": post.thumb_url,
        "input_image_url": post.input_image_url,
        "input_thumb_url": post.input_thumb_url,
    })))
}

async fn feed_item(state: &AppState, viewer: &str, post: &FeedPost) -> anyhow::Result<FeedItemDto> {
    let like = state.posts.get_like_info(&post.post_id, viewer).await?;
    let reactions = state.posts.get_reaction_info(&post.post_id, viewer).await?;
    Ok(FeedItemDto {
        post_id: post.post_id.clone(),
        image_url: post.image_url.clone(),
        thumb_url: post.thumb_url.clone(),
        input_thumb_url: post.input_thumb_url.clone(),
        author_name: post.author_name.clone(),
        author_display: post
            .author_name
            .clone()
            .unwrap_or_else(|| mask_owner(&post.owner_id)),
        workflow_id: post.workflow_id.clone(),
        published_at: post.published_at,
        like_count: like.like_count,
        liked_by_me: like.liked_by_me,
        reactions: reactions.reactions,
        my_reaction: reactions.my_reaction,
        has_input: post.input_image_url.is_some(),
    })
}

/// `GET /api/v1/feed` — active posts, paged and sorted.
pub async fn list(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<FeedListQuery>,
) -> Result<Json<Value>, ApiError> {
    let anon_id = anon::anon_id_from_jar(&jar);
    let sort = PostSort::parse(&query.sort).ok_or_else(|| ApiError::bad_request("invalid_sort"))?;
    let page = state
        .posts
        .list_posts(PostFilter::Active, query.page, query.size, sort)
        .await?;

    let mut items = Vec::with_capacity(page.items.len());
    for post in &page.items {
        items.push(feed_item(&state, &anon_id, post).await?);
    }
    Ok(Json(json!({
        "items": items,
        "page": page.page,
        "size": page.size,
        "total": page.total,
        "total_pages": page.total_pages,
    })))
}

/// `GET /api/v1/feed/{post_id}` — full detail of one active post.
pub async fn detail(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Path(post_id): Path<String>,
) -> Result<Json<FeedDetailDto>, ApiError> {
    let anon_id = anon::anon_id_from_jar(&jar);
    let post = state
        .posts
        .get_post(&post_id)
        .await?
        .filter(|p| p.status == "active")
        .ok_or_else(|| ApiError::not_found("Post not found"))?;
    let like = state.posts.get_like_info(&post_id, &anon_id).await?;
    let reactions = state.posts.get_reaction_info(&post_id, &anon_id).await?;
    let can_delete = post.owner_id == anon_id || is_admin(&state, &headers);

    Ok(Json(FeedDetailDto {
        author_display: post
            .author_name
            .clone()
            .unwrap_or_else(|| mask_owner(&post.owner_id)),
        post_id: post.post_id,
        image_url: post.image_url,
        thumb_url: post.thumb_url,
        input_image_url: post.input_image_url,
        input_thumb_url: post.input_thumb_url,
        author_name: post.author_name,
        owner_id: post.owner_id,
        workflow_id: post.workflow_id,
        seed: post.seed,
        aspect_ratio: post.aspect_ratio,
        prompt: post.prompt,
        published_at: post.published_at,
        like_count: like.like_count,
        liked_by_me: like.liked_by_me,
        reactions: reactions.reactions,
        my_reaction: reactions.my_reaction,
        can_delete,
    }))
}

async fn active_post(state: &AppState, post_id: &str) -> Result<FeedPost, ApiError> {
    state
        .posts
        .get_post(post_id)
        .await?
        .filter(|p| p.status == "active")
        .ok_or_else(|| ApiError::not_found("Post not found"))
}

/// `POST /api/v1/feed/{post_id}/like` — toggle the viewer's like.
pub async fn like(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(post_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let anon_id = anon::anon_id_from_jar(&jar);
    active_post(&state, &post_id).await?;
    let toggled = state.posts.like_toggle(&post_id, &anon_id).await?;
    Ok(Json(json!({
        "liked": toggled.liked,
        "like_count": toggled.like_count,
    })))
}

/// `POST /api/v1/feed/{post_id}/reaction` — set, switch, or toggle off.
pub async fn reaction(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(post_id): Path<String>,
    Json(request): Json<FeedReactionRequest>,
) -> Result<Json<Value>, ApiError> {
    let anon_id = anon::anon_id_from_jar(&jar);
    let kind = ReactionKind::parse(&request.reaction)
        .ok_or_else(|| ApiError::bad_request("invalid_reaction"))?;
    active_post(&state, &post_id).await?;
    let info = state.posts.reaction_set(&post_id, &anon_id, kind).await?;
    Ok(Json(json!({
        "reactions": info.reactions,
        "my_reaction": info.my_reaction,
    })))
}

/// `POST /api/v1/feed/{post_id}/delete` — owner or admin moves the post
/// to trash.
pub async fn delete(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Path(post_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let anon_id = anon::anon_id_from_jar(&jar);
    let post = state
        .posts
        .get_post(&post_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Post not found"))?;
    if post.status != "active" {
        return Err(ApiError::bad_request("Post is not active"));
    }
    if post.owner_id != anon_id && !is_admin(&state, &headers) {
        return Err(ApiError::forbidden());
    }

    state
        .feed_media
        .move_to_trash(&PostAssets::of(&post))
        .map_err(|err| {
            tracing::error!(post_id = %post_id, error = %err, "feed delete failed");
            ApiError::internal(&err)
        })?;
    state.posts.update_status(&post_id, "trash").await?;
    Ok(Json(json!({ "ok": true })))
}
