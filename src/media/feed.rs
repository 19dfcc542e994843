//! Feed asset store: active/trash partitions under `feed/`.
//!
//! Publishing copies — never moves — the source artifact, so the owner's
//! original stays untouched. Deleting a post moves its files into
//! `feed/trash/` preserving the relative layout; restore moves them back;
//! purge removes them for good. Database rows always carry the active
//! URL; the trash URL is derived.

use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};

use super::thumbs;
use crate::store::posts::FeedPost;

/// Everything needed to publish one artifact to the feed.
#[derive(Debug)]
pub struct PublishSource<'a> {
    /// Publishing owner.
    pub owner_id: &'a str,
    /// Optional display name (already sanitised).
    pub author_name: Option<String>,
    /// Prompt of the source artifact.
    pub prompt: String,
    /// Workflow id.
    pub workflow_id: Option<String>,
    /// Seed.
    pub seed: Option<i64>,
    /// Aspect ratio.
    pub aspect_ratio: Option<String>,
    /// Id of the source artifact.
    pub source_image_id: &'a str,
    /// Filesystem path of the source PNG.
    pub source_png_fs: &'a Path,
    /// Id of the input reference, when the artifact was image-to-image.
    pub input_source_image_id: Option<String>,
    /// Filesystem path of the input reference PNG.
    pub input_png_fs: Option<PathBuf>,
}

/// The four asset URLs a post may own, in their active-tree form.
#[derive(Debug, Clone)]
pub struct PostAssets {
    /// Published PNG.
    pub image_url: String,
    /// Published thumbnail.
    pub thumb_url: Option<String>,
    /// Copied input reference.
    pub input_image_url: Option<String>,
    /// Input reference thumbnail.
    pub input_thumb_url: Option<String>,
}

impl PostAssets {
    /// Collect the asset URLs of a post row.
    #[must_use]
    pub fn of(post: &FeedPost) -> Self {
        Self {
            image_url: post.image_url.clone(),
            thumb_url: post.thumb_url.clone(),
            input_image_url: post.input_image_url.clone(),
            input_thumb_url: post.input_thumb_url.clone(),
        }
    }

    fn urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.image_url.as_str())
            .chain(self.thumb_url.as_deref())
            .chain(self.input_image_url.as_deref())
            .chain(self.input_thumb_url.as_deref())
    }
}

/// Filesystem store for published feed assets.
#[derive(Debug, Clone)]
pub struct FeedMediaStore {
    output_dir: PathBuf,
}

impl FeedMediaStore {
    /// Create a store over the shared output root.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn active_root(&self) -> PathBuf {
        self.output_dir.join("feed")
    }

    fn trash_root(&self) -> PathBuf {
        self.active_root().join("trash")
    }

    fn build_web_path(&self, fs_path: &Path) -> Option<String> {
        let rel = fs_path.strip_prefix(&self.output_dir).ok()?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Some(format!("/outputs/{rel}"))
    }

    fn url_to_fs(&self, url: &str) -> Option<PathBuf> {
        let rel = url
            .strip_prefix("/outputs/")
            .or_else(|| url.strip_prefix("outputs/"))?;
        Some(self.output_dir.join(rel))
    }

    /// Map an active-tree path to its trash-tree counterpart. Total for
    /// every path under `feed/`; `None` outside it.
    #[must_use]
    pub fn active_fs_to_trash_fs(&self, active_fs: &Path) -> Option<PathBuf> {
        let rel = active_fs.strip_prefix(self.active_root()).ok()?;
        if rel.starts_with("trash") {
            return None;
        }
        Some(self.trash_root().join(rel))
    }

    /// Rewrite an active asset URL to its trash URL for admin display.
    #[must_use]
    pub fn active_url_to_trash_url(url: &str) -> String {
        if let Some(rest) = url.strip_prefix("/outputs/feed/") {
            format!("/outputs/feed/trash/{rest}")
        } else {
            url.to_owned()
        }
    }

    /// Copy an artifact (and optional input reference) into the feed tree
    /// and assemble the post record.
    pub fn publish(&self, source: PublishSource<'_>) -> io::Result<FeedPost> {
        let now = Utc::now();
        let post_id = uuid::Uuid::new_v4().simple().to_string();
        let dest_dir = self
            .active_root()
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string());

        let (png_fs, thumb_fs) = self.copy_png(source.source_png_fs, &dest_dir, &post_id)?;
        let image_url = self
            .build_web_path(&png_fs)
            .ok_or_else(|| io::Error::other("published file escaped the output root"))?;
        let thumb_url = thumb_fs.as_deref().and_then(|p| self.build_web_path(p));

        let (input_image_url, input_thumb_url) = match source.input_png_fs.as_deref() {
            Some(input_png) if input_png.exists() => {
                let base = format!("{post_id}_input");
                let (fs, thumb) = self.copy_png(input_png, &dest_dir, &base)?;
                (
                    self.build_web_path(&fs),
                    thumb.as_deref().and_then(|p| self.build_web_path(p)),
                )
            }
            _ => (None, None),
        };

        let post = FeedPost {
            post_id: post_id.clone(),
            owner_id: source.owner_id.to_owned(),
            author_name: source.author_name,
            prompt: source.prompt,
            workflow_id: source.workflow_id,
            seed: source.seed,
            aspect_ratio: source.aspect_ratio,
            image_url,
            thumb_url,
            input_image_url,
            input_thumb_url,
            source_image_id: Some(source.source_image_id.to_owned()),
            input_source_image_id: source.input_source_image_id,
            published_at: now.timestamp_millis() as f64 / 1000.0,
            status: "active".to_owned(),
        };

        let meta_path = dest_dir.join(format!("{post_id}.json"));
        let text = serde_json::to_string_pretty(&post)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        std::fs::write(meta_path, text)?;
        Ok(post)
    }

    fn copy_png(
        &self,
        src_png: &Path,
        dest_dir: &Path,
        base_name: &str,
    ) -> io::Result<(PathBuf, Option<PathBuf>)> {
        let thumb_dir = dest_dir.join("thumb");
        std::fs::create_dir_all(&thumb_dir)?;
        let dest_png = dest_dir.join(format!("{base_name}.png"));
        std::fs::copy(src_png, &dest_png)?;
        let thumb = std::fs::read(&dest_png)
            .ok()
            .and_then(|bytes| thumbs::write_thumbnail(&bytes, &thumb_dir, base_name));
        Ok((dest_png, thumb))
    }

    /// Move a post's assets (and sidecar) into the trash tree.
    pub fn move_to_trash(&self, assets: &PostAssets) -> io::Result<()> {
        for url in assets.urls() {
            let Some(fs) = self.url_to_fs(url) else { continue };
            if !fs.exists() {
                continue;
            }
            let Some(trash_fs) = self.active_fs_to_trash_fs(&fs) else {
                continue;
            };
            if let Some(parent) = trash_fs.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&fs, &trash_fs)?;
        }
        if let Some(meta_fs) = self.url_to_fs(&assets.image_url).map(|p| p.with_extension("json")) {
            if meta_fs.exists() {
                if let Some(trash_meta) = self.active_fs_to_trash_fs(&meta_fs) {
                    if let Some(parent) = trash_meta.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::rename(&meta_fs, &trash_meta)?;
                }
            }
        }
        Ok(())
    }

    /// Move a post's assets back from the trash tree.
    pub fn restore_from_trash(&self, assets: &PostAssets) -> io::Result<()> {
        for url in assets.urls() {
            let Some(active_fs) = self.url_to_fs(url) else {
                continue;
            };
            let Some(trash_fs) = self.active_fs_to_trash_fs(&active_fs) else {
                continue;
            };
            if !trash_fs.exists() {
                continue;
            }
            if let Some(parent) = active_fs.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&trash_fs, &active_fs)?;
        }
        if let Some(meta_fs) = self.url_to_fs(&assets.image_url).map(|p| p.with_extension("json")) {
            if let Some(trash_meta) = self.active_fs_to_trash_fs(&meta_fs) {
                if trash_meta.exists() {
                    if let Some(parent) = meta_fs.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::rename(&trash_meta, &meta_fs)?;
                }
            }
        }
        Ok(())
    }

    /// Permanently delete a post's trashed assets.
    pub fn purge_from_trash(&self, assets: &PostAssets) {
        let mut targets: Vec<PathBuf> = assets
            .urls()
            .filter_map(|url| self.url_to_fs(url))
            .filter_map(|fs| self.active_fs_to_trash_fs(&fs))
            .collect();
        if let Some(meta_fs) = self.url_to_fs(&assets.image_url).map(|p| p.with_extension("json")) {
            if let Some(trash_meta) = self.active_fs_to_trash_fs(&meta_fs) {
                targets.push(trash_meta);
            }
        }
        for target in targets {
            if target.exists() {
                if let Err(err) = std::fs::remove_file(&target) {
                    tracing::warn!(path = %target.display(), error = %err, "purge failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(24, 24, image::Rgb([9, 9, 9]));
        let mut buf = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .expect("fixture png");
        buf.into_inner()
    }

    fn store_with_source() -> (tempfile::TempDir, FeedMediaStore, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let src_dir = dir.path().join("users/anon-a/2024/01/01");
        std::fs::create_dir_all(&src_dir).expect("mkdir");
        let src_png = src_dir.join("cafe.png");
        std::fs::write(&src_png, png_bytes()).expect("write");
        let store = FeedMediaStore::new(dir.path());
        (dir, store, src_png)
    }

    fn publish(store: &FeedMediaStore, src_png: &Path) -> FeedPost {
        store
            .publish(PublishSource {
                owner_id: "anon-a",
                author_name: Some("fox".into()),
                prompt: "a cafe".into(),
                workflow_id: Some("wf".into()),
                seed: Some(3),
                aspect_ratio: Some("square".into()),
                source_image_id: "cafe",
                source_png_fs: src_png,
                input_source_image_id: None,
                input_png_fs: None,
            })
            .expect("publish")
    }

    #[test]
    fn test_publish_copies_not_moves() {
        let (_dir, store, src_png) = store_with_source();
        let post = publish(&store, &src_png);
        assert!(src_png.exists(), "source artifact untouched");
        let published = store.url_to_fs(&post.image_url).expect("fs path");
        assert!(published.exists());
        assert!(post.image_url.starts_with("/outputs/feed/"));
        assert_eq!(post.status, "active");
        // The sidecar descriptor lands next to the PNG.
        assert!(published.with_extension("json").exists());
    }

    #[test]
    fn test_trash_round_trip() {
        let (_dir, store, src_png) = store_with_source();
        let post = publish(&store, &src_png);
        let assets = PostAssets::of(&post);
        let active_fs = store.url_to_fs(&post.image_url).expect("fs");

        store.move_to_trash(&assets).expect("to trash");
        assert!(!active_fs.exists());
        let trash_fs = store.active_fs_to_trash_fs(&active_fs).expect("trash path");
        assert!(trash_fs.exists());

        store.restore_from_trash(&assets).expect("restore");
        assert!(active_fs.exists());
        assert!(!trash_fs.exists());
    }

    #[test]
    fn test_purge_removes_trashed_files() {
        let (_dir, store, src_png) = store_with_source();
        let post = publish(&store, &src_png);
        let assets = PostAssets::of(&post);
        store.move_to_trash(&assets).expect("to trash");
        store.purge_from_trash(&assets);
        let active_fs = store.url_to_fs(&post.image_url).expect("fs");
        let trash_fs = store.active_fs_to_trash_fs(&active_fs).expect("trash path");
        assert!(!trash_fs.exists());
        assert!(!active_fs.exists());
    }

    #[test]
    fn test_trash_path_mapping_is_total_under_feed() {
        let store = FeedMediaStore::new("/srv/outputs");
        let active = Path::new("/srv/outputs/feed/2024/01/01/p.png");
        let trash = store.active_fs_to_trash_fs(active).expect("maps");
        assert_eq!(
            trash,
            Path::new("/srv/outputs/feed/trash/2024/01/01/p.png")
        );
        // Outside the feed tree there is no mapping.
        assert!(
            store
                .active_fs_to_trash_fs(Path::new("/srv/outputs/users/a/x.png"))
                .is_none()
        );
        // Already-trashed paths do not nest.
        assert!(
            store
                .active_fs_to_trash_fs(Path::new("/srv/outputs/feed/trash/2024/p.png"))
                .is_none()
        );
    }

    #[test]
    fn test_url_rewrite_for_admin_display() {
        assert_eq!(
            FeedMediaStore::active_url_to_trash_url("/outputs/feed/2024/01/01/p.png"),
            "/outputs/feed/trash/2024/01/01/p.png"
        );
        assert_eq!(
            FeedMediaStore::active_url_to_trash_url("/outputs/users/a/x.png"),
            "/outputs/users/a/x.png"
        );
    }

    #[test]
    fn test_publish_with_input_reference() {
        let (dir, store, src_png) = store_with_source();
        let input_png = dir.path().join("users/anon-a/inputs/ref.png");
        std::fs::create_dir_all(input_png.parent().expect("parent")).expect("mkdir");
        std::fs::write(&input_png, png_bytes()).expect("write");

        let post = store
            .publish(PublishSource {
                owner_id: "anon-a",
                author_name: None,
                prompt: "img2img".into(),
                workflow_id: None,
                seed: None,
                aspect_ratio: None,
                source_image_id: "cafe",
                source_png_fs: &src_png,
                input_source_image_id: Some("ref".into()),
                input_png_fs: Some(input_png),
            })
            .expect("publish");
        let input_url = post.input_image_url.expect("input copied");
        assert!(input_url.contains("_input"));
        assert!(store.url_to_fs(&input_url).expect("fs").exists());
    }
}
