//! Request/response DTOs for the HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::media::MediaItem;
use crate::store::posts::{ReactionCounts, ReactionKind};

/// Response to a successful enqueue.
#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    /// The new job's id.
    pub job_id: String,
    /// Always `queued`.
    pub status: &'static str,
    /// Zero-based position in the owner's queue.
    pub position: Option<usize>,
}

/// Point-in-time job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    /// Job id.
    pub id: String,
    /// Lifecycle state.
    pub status: String,
    /// Progress percentage.
    pub progress: f64,
    /// Queue position while queued.
    pub position: Option<usize>,
    /// Result map (includes `image_path` when complete).
    pub result: Map<String, Value>,
    /// Error message, when failed.
    pub error: Option<String>,
}

/// Response to cancelling the caller's active job.
#[derive(Debug, Serialize)]
pub struct CancelActiveResponse {
    /// Human-readable confirmation.
    pub message: &'static str,
    /// The job the cancel was delivered to.
    pub job_id: String,
}

/// Generic success envelope.
#[derive(Debug, Serialize)]
pub struct OkResponse {
    /// Always true.
    pub ok: bool,
}

impl OkResponse {
    /// The canonical `{"ok": true}`.
    #[must_use]
    pub const fn ok() -> Self {
        Self { ok: true }
    }
}

/// Response to a reference-image upload.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    /// Always true.
    pub ok: bool,
    /// New item id.
    pub id: String,
    /// Browser URL of the stored PNG.
    pub url: String,
}

/// One page of items plus paging metadata.
#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    /// The page's items.
    pub items: Vec<T>,
    /// 1-based page number.
    pub page: usize,
    /// Page size after clamping.
    pub size: usize,
    /// Total items.
    pub total: usize,
    /// Total pages.
    pub total_pages: usize,
}

/// Clamp paging parameters and slice an in-memory listing.
pub fn paginate<T>(items: Vec<T>, page: i64, size: i64) -> Paginated<T> {
    let size = usize::try_from(size.clamp(1, 100)).unwrap_or(24);
    let page = usize::try_from(page.max(1)).unwrap_or(1);
    let total = items.len();
    let total_pages = total.div_ceil(size);
    let items: Vec<T> = items
        .into_iter()
        .skip((page - 1) * size)
        .take(size)
        .collect();
    Paginated {
        items,
        page,
        size,
        total,
        total_pages,
    }
}

/// One media item as listed to its owner.
#[derive(Debug, Serialize)]
pub struct MediaItemDto {
    /// Item id.
    pub id: String,
    /// Browser URL of the PNG.
    pub url: String,
    /// Creation time, ISO8601.
    pub created_at: String,
    /// Sidecar metadata, when readable.
    pub meta: Option<crate::media::SidecarMeta>,
    /// Browser URL of the thumbnail.
    pub thumb_url: Option<String>,
}

impl From<MediaItem> for MediaItemDto {
    fn from(item: MediaItem) -> Self {
        Self {
            id: item.id,
            url: item.url,
            created_at: item.created_at.to_rfc3339(),
            meta: item.meta,
            thumb_url: item.thumb_url,
        }
    }
}

/// Common paging query parameters.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    /// 1-based page.
    #[serde(default = "default_page")]
    pub page: i64,
    /// Page size.
    #[serde(default = "default_size")]
    pub size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_size() -> i64 {
    24
}

/// Query parameters of the feed listing.
#[derive(Debug, Deserialize)]
pub struct FeedListQuery {
    /// 1-based page.
    #[serde(default = "default_page")]
    pub page: i64,
    /// Page size.
    #[serde(default = "default_size")]
    pub size: i64,
    /// `newest`, `oldest`, or `most_reactions`.
    #[serde(default = "default_sort")]
    pub sort: String,
}

fn default_sort() -> String {
    "newest".to_owned()
}

/// Publish an owned artifact to the feed.
#[derive(Debug, Deserialize)]
pub struct FeedPublishRequest {
    /// Artifact id in the caller's store.
    pub image_id: String,
    /// Optional display name.
    #[serde(default)]
    pub author_name: Option<String>,
}

/// Set or toggle a reaction.
#[derive(Debug, Deserialize)]
pub struct FeedReactionRequest {
    /// Reaction name.
    pub reaction: String,
}

/// One feed card in the listing.
#[derive(Debug, Serialize)]
pub struct FeedItemDto {
    /// Post id.
    pub post_id: String,
    /// Published image URL.
    pub image_url: String,
    /// Thumbnail URL.
    pub thumb_url: Option<String>,
    /// Input reference thumbnail, for image-to-image posts.
    pub input_thumb_url: Option<String>,
    /// Raw author name, when set.
    pub author_name: Option<String>,
    /// Display name (author name or masked owner).
    pub author_display: String,
    /// Workflow id.
    pub workflow_id: Option<String>,
    /// Publish time, epoch seconds.
    pub published_at: f64,
    /// Legacy like count.
    pub like_count: i64,
    /// Whether the viewer holds a legacy like.
    pub liked_by_me: bool,
    /// Reaction aggregates.
    pub reactions: ReactionCounts,
    /// The viewer's reaction.
    pub my_reaction: Option<ReactionKind>,
    /// Whether an input reference was published alongside.
    pub has_input: bool,
}

/// Full post detail.
#[derive(Debug, Serialize)]
pub struct FeedDetailDto {
    /// Post id.
    pub post_id: String,
    /// Published image URL.
    pub image_url: String,
    /// Thumbnail URL.
    pub thumb_url: Option<String>,
    /// Input reference URL.
    pub input_image_url: Option<String>,
    /// Input reference thumbnail.
    pub input_thumb_url: Option<String>,
    /// Raw author name.
    pub author_name: Option<String>,
    /// Display name.
    pub author_display: String,
    /// Owning anon id.
    pub owner_id: String,
    /// Workflow id.
    pub workflow_id: Option<String>,
    /// Seed.
    pub seed: Option<i64>,
    /// Aspect ratio.
    pub aspect_ratio: Option<String>,
    /// Prompt.
    pub prompt: String,
    /// Publish time, epoch seconds.
    pub published_at: f64,
    /// Legacy like count.
    pub like_count: i64,
    /// Whether the viewer holds a legacy like.
    pub liked_by_me: bool,
    /// Reaction aggregates.
    pub reactions: ReactionCounts,
    /// The viewer's reaction.
    pub my_reaction: Option<ReactionKind>,
    /// Whether the viewer may delete this post.
    pub can_delete: bool,
}

/// Translation result.
#[derive(Debug, Serialize)]
pub struct TranslateResponse {
    /// The single-line English prompt.
    pub translated_text: String,
}

/// One workflow as shown in the picker.
#[derive(Debug, Serialize)]
pub struct WorkflowInfo {
    /// Workflow id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Node count of the graph file (0 when unreadable).
    pub node_count: usize,
    /// Fixed style tokens.
    pub style_prompt: String,
    /// Negative prompt.
    pub negative_prompt: String,
    /// Recommended prompt.
    pub recommended_prompt: String,
    /// Opaque UI schema.
    pub ui: Value,
    /// Aspect-ratio presets.
    pub sizes: Value,
    /// Image-to-image declaration.
    pub image_input: Value,
    /// Control slot metadata.
    pub control_slots: Value,
    /// LoRA slot metadata.
    pub lora_slots: Value,
    /// LoRA slider hint.
    pub lora_hint: Value,
}

/// Mask an owner id for public display: keep only the tail.
#[must_use]
pub fn mask_owner(owner_id: &str) -> String {
    let stripped = owner_id.strip_prefix("anon-").unwrap_or(owner_id);
    let tail: String = if stripped.len() >= 4 {
        stripped[stripped.len() - 4..].to_owned()
    } else {
        stripped.to_owned()
    };
    if tail.is_empty() {
        "Anonymous-user".to_owned()
    } else {
        format!("Anonymous-{tail}")
    }
}

/// Sanitise a submitted author name: collapse whitespace, cap at 20
/// characters, empty becomes `None`.
#[must_use]
pub fn sanitize_author_name(name: Option<&str>) -> Option<String> {
    let name = name?;
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(20).collect())
}
