//! Owner-facing media endpoints: generated images, control references,
//! and image-to-image inputs.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum_extra::extract::Multipart;
use axum_extra::extract::cookie::CookieJar;

use crate::api::error::ApiError;
use crate::api::protocol::{MediaItemDto, OkResponse, PageQuery, Paginated, UploadResponse, paginate};
use crate::api::server::AppState;
use crate::auth::anon;
use crate::media::{MediaKind, normalize_to_png};

const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "webp"];

fn list_kind(
    state: &AppState,
    jar: &CookieJar,
    kind: MediaKind,
    query: &PageQuery,
) -> Paginated<MediaItemDto> {
    let anon_id = anon::anon_id_from_jar(jar);
    let items = state.media.list(&anon_id, kind, false);
    let page = paginate(items, query.page, query.size);
    Paginated {
        items: page.items.into_iter().map(MediaItemDto::from).collect(),
        page: page.page,
        size: page.size,
        total: page.total,
        total_pages: page.total_pages,
    }
}

/// Pull the upload out of a multipart body, enforcing the size cap while
/// streaming so oversized bodies stop early.
async fn read_capped_upload(
    mut multipart: Multipart,
    cap: u64,
) -> Result<(String, Vec<u8>), ApiError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let original_name = field
            .file_name()
            .map(str::to_owned)
            .ok_or_else(|| ApiError::bad_request("Invalid upload"))?;
        let file_stem = std::path::Path::new(&original_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&original_name)
            .to_owned();
        let extension_ok = std::path::Path::new(&file_stem)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if !extension_ok {
            return Err(ApiError::bad_request("Unsupported file type"));
        }

        let mut data: Vec<u8> = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| ApiError::bad_request(err.to_string()))?
        {
            if (data.len() + chunk.len()) as u64 > cap {
                return Err(ApiError::payload_too_large());
            }
            data.extend_from_slice(&chunk);
        }
        if data.is_empty() {
            return Err(ApiError::bad_request("Invalid upload"));
        }
        return Ok((file_stem, data));
    }
    Err(ApiError::bad_request("Invalid upload"))
}

async fn save_upload(
    state: &AppState,
    jar: &CookieJar,
    kind: MediaKind,
    multipart: Multipart,
    cap: u64,
) -> Result<Json<UploadResponse>, ApiError> {
    let anon_id = anon::anon_id_from_jar(jar);
    let (original_name, data) = read_capped_upload(multipart, cap).await?;
    let png_bytes = normalize_to_png(&data, &original_name)
        .map_err(|_| ApiError::bad_request("Failed to decode image"))?;
    let saved = match kind {
        MediaKind::Control => state.media.save_control(&anon_id, &png_bytes, &original_name),
        MediaKind::Input => state.media.save_input(&anon_id, &png_bytes, &original_name),
        MediaKind::Generated => {
            return Err(ApiError::bad_request("Unsupported upload kind"));
        }
    }
    .map_err(|err| ApiError::internal(&err))?;
    tracing::info!(owner_id = %anon_id, id = %saved.id, kind = ?kind, "reference image uploaded");
    Ok(Json(UploadResponse {
        ok: true,
        id: saved.id,
        url: saved.web_path,
    }))
}

fn set_status(
    state: &AppState,
    jar: &CookieJar,
    kind: MediaKind,
    id: &str,
    status: &str,
    label: &str,
) -> Result<Json<OkResponse>, ApiError> {
    let anon_id = anon::anon_id_from_jar(jar);
    if !state.media.update_status(&anon_id, kind, id, status) {
        return Err(ApiError::not_found(format!("{label} not found")));
    }
    tracing::info!(owner_id = %anon_id, id = %id, status = %status, kind = ?kind, "media status updated");
    Ok(Json(OkResponse::ok()))
}

/// `GET /api/v1/images` — the caller's generated artifacts.
pub async fn list_images(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<PageQuery>,
) -> Json<Paginated<MediaItemDto>> {
    Json(list_kind(&state, &jar, MediaKind::Generated, &query))
}

/// `POST /api/v1/images/{id}/delete` — soft-delete one artifact.
pub async fn delete_image(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(image_id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    set_status(&state, &jar, MediaKind::Generated, &image_id, "trash", "Image")
}

/// `GET /api/v1/controls` — the caller's control references.
pub async fn list_controls(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<PageQuery>,
) -> Json<Paginated<MediaItemDto>> {
    Json(list_kind(&state, &jar, MediaKind::Control, &query))
}

/// `POST /api/v1/controls/upload` — store a control reference.
pub async fn upload_control(
    State(state): State<AppState>,
    jar: CookieJar,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let cap = state.config.controls_max_bytes;
    save_upload(&state, &jar, MediaKind::Control, multipart, cap).await
}

/// `POST /api/v1/controls/{id}/delete`.
pub async fn delete_control(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(image_id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    set_status(&state, &jar, MediaKind::Control, &image_id, "trash", "Control")
}

/// `POST /api/v1/controls/{id}/restore`.
pub async fn restore_control(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(image_id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    set_status(&state, &jar, MediaKind::Control, &image_id, "active", "Control")
}

/// `GET /api/v1/inputs` — the caller's image-to-image inputs.
pub async fn list_inputs(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<PageQuery>,
) -> Json<Paginated<MediaItemDto>> {
    Json(list_kind(&state, &jar, MediaKind::Input, &query))
}

/// `POST /api/v1/inputs/upload` — store an input image.
pub async fn upload_input(
    State(state): State<AppState>,
    jar: CookieJar,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let cap = state.config.inputs_max_bytes;
    save_upload(&state, &jar, MediaKind::Input, multipart, cap).await
}

/// Body of the copy-from request.
#[derive(Debug, serde::Deserialize)]
pub struct CopyInputRequest {
    /// Id of an owned image to copy into the inputs store.
    pub image_id: String,
}

/// `POST /api/v1/inputs/copy` — seed the inputs store from an existing
/// generated artifact (or control reference) without re-uploading.
pub async fn copy_input(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(request): Json<CopyInputRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    let anon_id = anon::anon_id_from_jar(&jar);
    let image_id = request.image_id.trim();
    if image_id.is_empty() {
        return Err(ApiError::bad_request("Missing image_id"));
    }
    let source = state
        .media
        .locate_png(&anon_id, MediaKind::Generated, image_id)
        .or_else(|| state.media.locate_png(&anon_id, MediaKind::Control, image_id))
        .ok_or_else(|| ApiError::not_found("Source image not found"))?;
    let bytes = std::fs::read(&source).map_err(|err| ApiError::internal(&err))?;
    let saved = state
        .media
        .save_input(&anon_id, &bytes, &format!("{image_id}.png"))
        .map_err(|err| ApiError::internal(&err))?;
    tracing::info!(owner_id = %anon_id, source = %image_id, id = %saved.id, "input copied");
    Ok(Json(UploadResponse {
        ok: true,
        id: saved.id,
        url: saved.web_path,
    }))
}

/// `POST /api/v1/inputs/{id}/delete`.
pub async fn delete_input(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(image_id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    set_status(&state, &jar, MediaKind::Input, &image_id, "trash", "Input")
}

/// `POST /api/v1/inputs/{id}/restore`.
pub async fn restore_input(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(image_id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    set_status(&state, &jar, MediaKind::Input, &image_id, "active", "Input")
}
