//! Filesystem-backed media store with sidecar metadata.
//!
//! Layout under the output root:
//! ```text
//! users/<owner>/YYYY/MM/DD/<id>.png            generated artifacts
//! users/<owner>/YYYY/MM/DD/<id>.json           sidecar metadata
//! users/<owner>/YYYY/MM/DD/thumb/<id>.webp     derived thumbnail
//! users/<owner>/controls/YYYY/MM/DD/...        control references
//! users/<owner>/inputs/YYYY/MM/DD/...          image-to-image inputs
//! ```
//! Sidecars are the source of truth for listings and are read
//! defensively: an unreadable sidecar excludes nothing, it just lists the
//! file without metadata.

pub mod feed;
pub(crate) mod thumbs;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub use feed::FeedMediaStore;
pub use thumbs::normalize_to_png;

/// Which sub-store an item lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Generated artifacts (no `kind` field in the sidecar).
    Generated,
    /// ControlNet reference images.
    Control,
    /// Image-to-image input images.
    Input,
}

impl MediaKind {
    fn sidecar_kind(self) -> Option<&'static str> {
        match self {
            Self::Generated => None,
            Self::Control => Some("control"),
            Self::Input => Some("input"),
        }
    }
}

/// Sidecar metadata written next to every stored PNG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarMeta {
    /// Item id (uuid hex); also the file stem.
    pub id: String,
    /// Owning anon id.
    pub owner: String,
    /// `control` / `input` for references; absent for generated artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Workflow that produced a generated artifact.
    #[serde(default)]
    pub workflow_id: Option<String>,
    /// Aspect ratio of the request.
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    /// Seed of the request.
    #[serde(default)]
    pub seed: Option<i64>,
    /// The user's prompt.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Input image the generation was based on, when image-to-image.
    #[serde(default)]
    pub input_image_id: Option<String>,
    /// Filename the upstream (or uploader) called this image.
    pub original_filename: String,
    /// Stored MIME type; always `image/png`.
    pub mime: String,
    /// Byte length of the PNG.
    pub bytes: u64,
    /// SHA-256 of the PNG bytes, hex.
    pub sha256: String,
    /// Creation time, UTC ISO8601.
    pub created_at: String,
    /// `active` or `trash`.
    pub status: String,
    /// Browser URL of the thumbnail, when one was derived.
    pub thumb: Option<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Request provenance recorded into a generated artifact's sidecar.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    /// Workflow id.
    pub workflow_id: Option<String>,
    /// Aspect ratio.
    pub aspect_ratio: Option<String>,
    /// Seed.
    pub seed: Option<i64>,
    /// User prompt.
    pub prompt: Option<String>,
    /// Source input image id, for image-to-image.
    pub input_image_id: Option<String>,
}

/// Result of a save: where the PNG and sidecar landed.
#[derive(Debug, Clone)]
pub struct SavedMedia {
    /// New item id.
    pub id: String,
    /// Filesystem path of the PNG.
    pub png_path: PathBuf,
    /// Filesystem path of the sidecar.
    pub meta_path: PathBuf,
    /// Browser URL of the PNG.
    pub web_path: String,
    /// Browser URL of the thumbnail, when derived.
    pub thumb_url: Option<String>,
}

/// One listed item.
#[derive(Debug, Clone, Serialize)]
pub struct MediaItem {
    /// Item id.
    pub id: String,
    /// Browser URL of the PNG.
    pub url: String,
    /// Browser URL of the thumbnail.
    pub thumb_url: Option<String>,
    /// Sidecar metadata, when readable.
    pub meta: Option<SidecarMeta>,
    /// `active` or `trash`.
    pub status: String,
    /// File modification time.
    pub created_at: DateTime<Utc>,
}

/// Filesystem-backed content store for one output root.
#[derive(Debug, Clone)]
pub struct MediaStore {
    output_dir: PathBuf,
}

impl MediaStore {
    /// Create a store over `output_dir` (served by the API at `/outputs`).
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// The configured output root.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn user_root(&self, owner: &str) -> PathBuf {
        self.output_dir.join("users").join(owner)
    }

    fn scope_root(&self, owner: &str, kind: MediaKind) -> PathBuf {
        match kind {
            MediaKind::Generated => self.user_root(owner),
            MediaKind::Control => self.user_root(owner).join("controls"),
            MediaKind::Input => self.user_root(owner).join("inputs"),
        }
    }

    /// Map a filesystem path under the output root to its `/outputs` URL.
    #[must_use]
    pub fn build_web_path(&self, fs_path: &Path) -> Option<String> {
        let rel = fs_path.strip_prefix(&self.output_dir).ok()?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Some(format!("/outputs/{rel}"))
    }

    /// Inverse of [`MediaStore::build_web_path`].
    #[must_use]
    pub fn web_path_to_fs(&self, url: &str) -> Option<PathBuf> {
        let rel = url
            .strip_prefix("/outputs/")
            .or_else(|| url.strip_prefix("outputs/"))?;
        Some(self.output_dir.join(rel))
    }

    /// Persist a generated artifact with full request provenance.
    pub fn save_artifact(
        &self,
        owner: &str,
        image_bytes: &[u8],
        provenance: &Provenance,
        original_filename: &str,
    ) -> io::Result<SavedMedia> {
        self.save(owner, MediaKind::Generated, image_bytes, provenance, original_filename)
    }

    /// Persist a control reference image.
    pub fn save_control(
        &self,
        owner: &str,
        image_bytes: &[u8],
        original_filename: &str,
    ) -> io::Result<SavedMedia> {
        self.save(
            owner,
            MediaKind::Control,
            image_bytes,
            &Provenance::default(),
            original_filename,
        )
    }

    /// Persist an image-to-image input image.
    pub fn save_input(
        &self,
        owner: &str,
        image_bytes: &[u8],
        original_filename: &str,
    ) -> io::Result<SavedMedia> {
        self.save(
            owner,
            MediaKind::Input,
            image_bytes,
            &Provenance::default(),
            original_filename,
        )
    }

    fn save(
        &self,
        owner: &str,
        kind: MediaKind,
        image_bytes: &[u8],
        provenance: &Provenance,
        original_filename: &str,
    ) -> io::Result<SavedMedia> {
        let now = Utc::now();
        let dated_dir = self
            .scope_root(owner, kind)
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string());
        std::fs::create_dir_all(&dated_dir)?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let png_path = dated_dir.join(format!("{id}.png"));
        std::fs::write(&png_path, image_bytes)?;

        let thumb_dir = dated_dir.join("thumb");
        std::fs::create_dir_all(&thumb_dir)?;
        let thumb_url = thumbs::write_thumbnail(image_bytes, &thumb_dir, &id)
            .and_then(|p| self.build_web_path(&p));

        let meta = SidecarMeta {
            id: id.clone(),
            owner: owner.to_owned(),
            kind: kind.sidecar_kind().map(str::to_owned),
            workflow_id: provenance.workflow_id.clone(),
            aspect_ratio: provenance.aspect_ratio.clone(),
            seed: provenance.seed,
            prompt: provenance.prompt.clone(),
            input_image_id: provenance.input_image_id.clone(),
            original_filename: original_filename.to_owned(),
            mime: "image/png".to_owned(),
            bytes: image_bytes.len() as u64,
            sha256: hex_sha256(image_bytes),
            created_at: now.to_rfc3339(),
            status: "active".to_owned(),
            thumb: thumb_url.clone(),
            tags: Vec::new(),
        };
        let meta_path = dated_dir.join(format!("{id}.json"));
        write_json_atomic(&meta_path, &meta)?;

        let web_path = self
            .build_web_path(&png_path)
            .unwrap_or_else(|| format!("/outputs/{id}.png"));
        Ok(SavedMedia {
            id,
            png_path,
            meta_path,
            web_path,
            thumb_url,
        })
    }

    /// Walk an owner's sub-store and list items, newest first.
    ///
    /// Generated listings never include control/input items and vice
    /// versa; items whose sidecar says `status != active` are excluded
    /// unless `include_trash` is set.
    #[must_use]
    pub fn list(&self, owner: &str, kind: MediaKind, include_trash: bool) -> Vec<MediaItem> {
        let root = self.scope_root(owner, kind);
        if !root.is_dir() {
            return Vec::new();
        }
        let mut items = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            if kind == MediaKind::Generated && in_reference_subtree(&root, path) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let meta: Option<SidecarMeta> = std::fs::read_to_string(path.with_extension("json"))
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok());

            // Kind mismatches never leak across listing categories.
            let sidecar_kind = meta.as_ref().and_then(|m| m.kind.as_deref());
            match kind {
                MediaKind::Generated => {
                    if sidecar_kind.is_some() {
                        continue;
                    }
                }
                MediaKind::Control => {
                    if sidecar_kind.is_some_and(|k| k != "control") {
                        continue;
                    }
                }
                MediaKind::Input => {
                    if sidecar_kind.is_some_and(|k| k != "input") {
                        continue;
                    }
                }
            }

            let status = meta
                .as_ref()
                .map_or_else(|| "active".to_owned(), |m| m.status.clone());
            if !include_trash && status != "active" {
                continue;
            }

            let thumb_url = meta
                .as_ref()
                .and_then(|m| m.thumb.clone())
                .or_else(|| self.implied_thumb_url(path, id));
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map_or_else(Utc::now, DateTime::<Utc>::from);
            let Some(url) = self.build_web_path(path) else {
                continue;
            };
            items.push(MediaItem {
                id: id.to_owned(),
                url,
                thumb_url,
                meta,
                status,
                created_at: mtime,
            });
        }
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items
    }

    fn implied_thumb_url(&self, png_path: &Path, id: &str) -> Option<String> {
        let thumb_dir = png_path.parent()?.join("thumb");
        for ext in ["webp", "jpg"] {
            let candidate = thumb_dir.join(format!("{id}.{ext}"));
            if candidate.exists() {
                return self.build_web_path(&candidate);
            }
        }
        None
    }

    /// Find an item's sidecar under the owner's sub-store.
    #[must_use]
    pub fn locate_meta(&self, owner: &str, kind: MediaKind, id: &str) -> Option<PathBuf> {
        self.locate(owner, kind, &format!("{id}.json"))
    }

    /// Find an item's PNG under the owner's sub-store.
    #[must_use]
    pub fn locate_png(&self, owner: &str, kind: MediaKind, id: &str) -> Option<PathBuf> {
        self.locate(owner, kind, &format!("{id}.png"))
    }

    fn locate(&self, owner: &str, kind: MediaKind, file_name: &str) -> Option<PathBuf> {
        let root = self.scope_root(owner, kind);
        if !root.is_dir() {
            return None;
        }
        WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .find(|e| {
                e.file_type().is_file()
                    && e.file_name().to_str() == Some(file_name)
            })
            .map(walkdir::DirEntry::into_path)
    }

    /// Read an item's sidecar.
    #[must_use]
    pub fn read_meta(&self, owner: &str, kind: MediaKind, id: &str) -> Option<SidecarMeta> {
        let path = self.locate_meta(owner, kind, id)?;
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Rewrite an item's sidecar `status` (soft delete / restore).
    ///
    /// Returns false when the item does not exist or the sidecar is
    /// unreadable.
    pub fn update_status(&self, owner: &str, kind: MediaKind, id: &str, status: &str) -> bool {
        let Some(meta_path) = self.locate_meta(owner, kind, id) else {
            return false;
        };
        let Ok(text) = std::fs::read_to_string(&meta_path) else {
            return false;
        };
        let Ok(mut meta) = serde_json::from_str::<SidecarMeta>(&text) else {
            return false;
        };
        meta.status = status.to_owned();
        write_json_atomic(&meta_path, &meta).is_ok()
    }

    /// Permanently remove an item: PNG, sidecar, and thumbnails.
    pub fn purge(&self, owner: &str, kind: MediaKind, id: &str) -> bool {
        let Some(png) = self.locate_png(owner, kind, id) else {
            return false;
        };
        let mut removed = std::fs::remove_file(&png).is_ok();
        if let Some(meta) = self.locate_meta(owner, kind, id) {
            removed |= std::fs::remove_file(meta).is_ok();
        }
        if let Some(parent) = png.parent() {
            for ext in ["webp", "jpg"] {
                let _ = std::fs::remove_file(parent.join("thumb").join(format!("{id}.{ext}")));
            }
        }
        removed
    }

    /// List the owner ids that have stored anything.
    #[must_use]
    pub fn list_owner_ids(&self) -> Vec<String> {
        let users_root = self.output_dir.join("users");
        let Ok(entries) = std::fs::read_dir(users_root) else {
            return Vec::new();
        };
        let mut owners: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        owners.sort();
        owners
    }
}

/// `true` when a generated-scope walk strayed into `controls/` or
/// `inputs/`.
fn in_reference_subtree(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root).is_ok_and(|rel| {
        rel.components().any(|c| {
            matches!(
                c.as_os_str().to_str(),
                Some("controls") | Some("inputs")
            )
        })
    })
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Serialize JSON to a temp file and rename it into place so readers
/// never observe a half-written sidecar.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(32, 32, image::Rgb([1, 2, 3]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .expect("fixture png");
        buf.into_inner()
    }

    fn store() -> (tempfile::TempDir, MediaStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MediaStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_save_artifact_writes_png_sidecar_and_thumb() {
        let (_dir, store) = store();
        let bytes = png_bytes();
        let saved = store
            .save_artifact(
                "anon-a",
                &bytes,
                &Provenance {
                    workflow_id: Some("wf".into()),
                    prompt: Some("a cat".into()),
                    ..Provenance::default()
                },
                "out.png",
            )
            .expect("save");
        assert!(saved.png_path.exists());
        assert!(saved.meta_path.exists());
        assert!(saved.web_path.starts_with("/outputs/users/anon-a/"));
        let meta: SidecarMeta =
            serde_json::from_str(&std::fs::read_to_string(&saved.meta_path).expect("read"))
                .expect("parse");
        assert_eq!(meta.status, "active");
        assert_eq!(meta.bytes, bytes.len() as u64);
        assert_eq!(meta.sha256.len(), 64);
        assert_eq!(meta.workflow_id.as_deref(), Some("wf"));
        assert!(meta.kind.is_none());
        assert!(meta.thumb.is_some());
    }

    #[test]
    fn test_listings_partition_by_kind() {
        let (_dir, store) = store();
        let bytes = png_bytes();
        store.save_artifact("anon-a", &bytes, &Provenance::default(), "a.png").expect("save");
        store.save_control("anon-a", &bytes, "c.png").expect("save");
        store.save_input("anon-a", &bytes, "i.png").expect("save");

        assert_eq!(store.list("anon-a", MediaKind::Generated, false).len(), 1);
        assert_eq!(store.list("anon-a", MediaKind::Control, false).len(), 1);
        assert_eq!(store.list("anon-a", MediaKind::Input, false).len(), 1);
        let control = &store.list("anon-a", MediaKind::Control, false)[0];
        assert_eq!(
            control.meta.as_ref().and_then(|m| m.kind.as_deref()),
            Some("control")
        );
    }

    #[test]
    fn test_soft_delete_hides_from_default_listing() {
        let (_dir, store) = store();
        let saved = store
            .save_artifact("anon-a", &png_bytes(), &Provenance::default(), "a.png")
            .expect("save");
        assert!(store.update_status("anon-a", MediaKind::Generated, &saved.id, "trash"));
        assert!(store.list("anon-a", MediaKind::Generated, false).is_empty());
        let with_trash = store.list("anon-a", MediaKind::Generated, true);
        assert_eq!(with_trash.len(), 1);
        assert_eq!(with_trash[0].status, "trash");
        assert!(store.update_status("anon-a", MediaKind::Generated, &saved.id, "active"));
        assert_eq!(store.list("anon-a", MediaKind::Generated, false).len(), 1);
    }

    #[test]
    fn test_update_status_unknown_id_is_false() {
        let (_dir, store) = store();
        assert!(!store.update_status("anon-a", MediaKind::Generated, "missing", "trash"));
    }

    #[test]
    fn test_locate_finds_nested_files() {
        let (_dir, store) = store();
        let saved = store
            .save_input("anon-a", &png_bytes(), "i.png")
            .expect("save");
        assert_eq!(
            store.locate_png("anon-a", MediaKind::Input, &saved.id),
            Some(saved.png_path.clone())
        );
        assert_eq!(
            store.locate_meta("anon-a", MediaKind::Input, &saved.id),
            Some(saved.meta_path)
        );
        assert!(store.locate_png("anon-a", MediaKind::Control, &saved.id).is_none());
    }

    #[test]
    fn test_web_path_round_trip() {
        let (_dir, store) = store();
        let saved = store
            .save_artifact("anon-a", &png_bytes(), &Provenance::default(), "a.png")
            .expect("save");
        let url = store.build_web_path(&saved.png_path).expect("web path");
        assert_eq!(store.web_path_to_fs(&url), Some(saved.png_path));
    }

    #[test]
    fn test_listing_tolerates_missing_sidecar() {
        let (_dir, store) = store();
        let orphan_dir = store.output_dir().join("users/anon-a/2024/01/01");
        std::fs::create_dir_all(&orphan_dir).expect("mkdir");
        std::fs::write(orphan_dir.join("deadbeef.png"), png_bytes()).expect("write");
        let items = store.list("anon-a", MediaKind::Generated, false);
        assert_eq!(items.len(), 1);
        assert!(items[0].meta.is_none());
        assert_eq!(items[0].status, "active");
    }

    #[test]
    fn test_purge_removes_all_files() {
        let (_dir, store) = store();
        let saved = store
            .save_artifact("anon-a", &png_bytes(), &Provenance::default(), "a.png")
            .expect("save");
        assert!(store.purge("anon-a", MediaKind::Generated, &saved.id));
        assert!(!saved.png_path.exists());
        assert!(store.list("anon-a", MediaKind::Generated, true).is_empty());
    }
}
