//! Durable store of feed posts, likes, and reactions.
//!
//! Invariant: a viewer holds at most one social signal per post — either
//! a legacy like row or a reaction row, never both. Every delete/insert
//! pair that maintains this runs inside a single transaction.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

/// A feed post row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeedPost {
    /// Post id (uuid hex).
    pub post_id: String,
    /// Publishing owner's anon id.
    pub owner_id: String,
    /// Optional display name chosen at publish time.
    pub author_name: Option<String>,
    /// Prompt of the source artifact.
    pub prompt: String,
    /// Workflow of the source artifact.
    pub workflow_id: Option<String>,
    /// Seed of the source artifact.
    pub seed: Option<i64>,
    /// Aspect ratio of the source artifact.
    pub aspect_ratio: Option<String>,
    /// Browser URL of the published PNG (active-tree form).
    pub image_url: String,
    /// Browser URL of the thumbnail.
    pub thumb_url: Option<String>,
    /// Browser URL of the copied input reference, when published.
    pub input_image_url: Option<String>,
    /// Thumbnail of the input reference.
    pub input_thumb_url: Option<String>,
    /// Id of the source artifact in the owner's store.
    pub source_image_id: Option<String>,
    /// Id of the input reference in the owner's store.
    pub input_source_image_id: Option<String>,
    /// Publish time, epoch seconds.
    pub published_at: f64,
    /// `active` or `trash`.
    pub status: String,
}

/// Reaction choices, mutually exclusive per viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    /// Also the bucket legacy likes count into.
    Love,
    /// A plain like as a reaction.
    Like,
    /// Laugh.
    Laugh,
    /// Wow.
    Wow,
    /// Fire.
    Fire,
}

impl ReactionKind {
    /// All reaction kinds in display order.
    pub const ALL: [Self; 5] = [Self::Love, Self::Like, Self::Laugh, Self::Wow, Self::Fire];

    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Love => "love",
            Self::Like => "like",
            Self::Laugh => "laugh",
            Self::Wow => "wow",
            Self::Fire => "fire",
        }
    }

    /// Parse a client-provided reaction name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "love" => Some(Self::Love),
            "like" => Some(Self::Like),
            "laugh" => Some(Self::Laugh),
            "wow" => Some(Self::Wow),
            "fire" => Some(Self::Fire),
            _ => None,
        }
    }
}

/// Aggregate reaction counts per kind. The `love` bucket includes legacy
/// like rows.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReactionCounts {
    /// Loves (including legacy likes).
    pub love: i64,
    /// Likes.
    pub like: i64,
    /// Laughs.
    pub laugh: i64,
    /// Wows.
    pub wow: i64,
    /// Fires.
    pub fire: i64,
}

impl ReactionCounts {
    fn add(&mut self, kind: ReactionKind, count: i64) {
        match kind {
            ReactionKind::Love => self.love += count,
            ReactionKind::Like => self.like += count,
            ReactionKind::Laugh => self.laugh += count,
            ReactionKind::Wow => self.wow += count,
            ReactionKind::Fire => self.fire += count,
        }
    }
}

/// Reaction aggregates plus the viewer's own choice.
#[derive(Debug, Clone, Serialize)]
pub struct ReactionInfo {
    /// Counts per kind.
    pub reactions: ReactionCounts,
    /// The viewer's reaction; legacy likes project to `love`.
    pub my_reaction: Option<ReactionKind>,
}

/// Result of toggling a legacy like.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LikeToggle {
    /// Whether the viewer now likes the post.
    pub liked: bool,
    /// Total like rows after the toggle.
    pub like_count: i64,
}

/// Like aggregate for one viewer.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LikeInfo {
    /// Total like rows.
    pub like_count: i64,
    /// Whether the viewer holds a like row.
    pub liked_by_me: bool,
}

/// Which statuses a listing includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostFilter {
    /// Only active posts.
    Active,
    /// Only trashed posts.
    Trash,
    /// Everything.
    All,
}

impl PostFilter {
    /// Parse the `include` query value; unknown values mean active.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "trash" => Self::Trash,
            "all" => Self::All,
            _ => Self::Active,
        }
    }
}

/// Listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostSort {
    /// `published_at` descending.
    Newest,
    /// `published_at` ascending.
    Oldest,
    /// Total social signals descending, ties shuffled per query.
    MostReactions,
}

impl PostSort {
    /// Parse the `sort` query value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "newest" => Some(Self::Newest),
            "oldest" => Some(Self::Oldest),
            "most_reactions" => Some(Self::MostReactions),
            _ => None,
        }
    }
}

/// One page of posts.
#[derive(Debug, Clone, Serialize)]
pub struct PostPage {
    /// The rows.
    pub items: Vec<FeedPost>,
    /// 1-based page number.
    pub page: i64,
    /// Page size after clamping.
    pub size: i64,
    /// Total matching rows.
    pub total: i64,
    /// Total pages.
    pub total_pages: i64,
}

/// SQLite-backed post store.
#[derive(Debug, Clone)]
pub struct PostStore {
    pool: SqlitePool,
}

impl PostStore {
    /// Open (or create) the store at `db_path` and run migrations.
    pub async fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{display}",
            display = db_path.display()
        ))?
        .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Build a store over an existing pool (shared app database).
    pub async fn from_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Schema creation plus additive migrations. Safe to run repeatedly.
    async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS feed_posts (
                post_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                author_name TEXT NULL,
                prompt TEXT NOT NULL,
                workflow_id TEXT NULL,
                seed INTEGER NULL,
                aspect_ratio TEXT NULL,
                image_url TEXT NOT NULL,
                thumb_url TEXT NULL,
                input_image_url TEXT NULL,
                input_thumb_url TEXT NULL,
                source_image_id TEXT NULL,
                input_source_image_id TEXT NULL,
                published_at REAL NOT NULL,
                status TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS feed_likes (
                post_id TEXT NOT NULL,
                liker_id TEXT NOT NULL,
                created_at REAL NOT NULL,
                UNIQUE(post_id, liker_id)
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS feed_reactions (
                post_id TEXT NOT NULL,
                reactor_id TEXT NOT NULL,
                reaction TEXT NOT NULL,
                created_at REAL NOT NULL,
                UNIQUE(post_id, reactor_id)
            )
            ",
        )
        .execute(pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_feed_posts_published ON feed_posts(published_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_feed_posts_status ON feed_posts(status)",
            "CREATE INDEX IF NOT EXISTS idx_feed_posts_owner ON feed_posts(owner_id)",
            "CREATE INDEX IF NOT EXISTS idx_feed_posts_source ON feed_posts(source_image_id)",
            "CREATE INDEX IF NOT EXISTS idx_feed_likes_post ON feed_likes(post_id)",
            "CREATE INDEX IF NOT EXISTS idx_feed_likes_liker ON feed_likes(liker_id)",
            "CREATE INDEX IF NOT EXISTS idx_feed_reactions_post ON feed_reactions(post_id)",
            "CREATE INDEX IF NOT EXISTS idx_feed_reactions_reactor ON feed_reactions(reactor_id)",
        ] {
            sqlx::query(stmt).execute(pool).await?;
        }

        // Additive column migrations for databases created before the
        // input-reference fields existed.
        for column in ["input_image_url", "input_thumb_url", "input_source_image_id"] {
            let exists: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM pragma_table_info('feed_posts') WHERE name = ?",
            )
            .bind(column)
            .fetch_one(pool)
            .await?;
            if exists == 0 {
                tracing::info!(column = %column, "adding feed_posts column");
                sqlx::query(&format!(
                    "ALTER TABLE feed_posts ADD COLUMN {column} TEXT NULL"
                ))
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Retry wrapper: if the database file vanished at runtime, a fresh
    /// connection sees an empty schema. Re-run migrations once and retry.
    async fn reinit(&self) -> anyhow::Result<()> {
        tracing::warn!("database schema missing, re-initialising");
        Self::run_migrations(&self.pool).await
    }

    fn schema_gone(err: &sqlx::Error) -> bool {
        err.to_string().contains("no such table")
    }

    /// Insert a new post.
    pub async fn create_post(&self, post: &FeedPost) -> anyhow::Result<()> {
        match self.insert_post(post).await {
            Ok(()) => Ok(()),
            Err(err) if Self::schema_gone(&err) => {
                self.reinit().await?;
                Ok(self.insert_post(post).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn insert_post(&self, post: &FeedPost) -> Result<(), sqlx::Error> {
        sqlx::query(
            r"
            INSERT INTO feed_posts (
                post_id, owner_id, author_name, prompt, workflow_id, seed, aspect_ratio,
                image_url, thumb_url, input_image_url, input_thumb_url,
                source_image_id, input_source_image_id,
                published_at, status
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&post.post_id)
        .bind(&post.owner_id)
        .bind(&post.author_name)
        .bind(&post.prompt)
        .bind(&post.workflow_id)
        .bind(post.seed)
        .bind(&post.aspect_ratio)
        .bind(&post.image_url)
        .bind(&post.thumb_url)
        .bind(&post.input_image_url)
        .bind(&post.input_thumb_url)
        .bind(&post.source_image_id)
        .bind(&post.input_source_image_id)
        .bind(post.published_at)
        .bind(&post.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one post.
    pub async fn get_post(&self, post_id: &str) -> anyhow::Result<Option<FeedPost>> {
        let post = sqlx::query_as::<_, FeedPost>("SELECT * FROM feed_posts WHERE post_id = ?")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(post)
    }

    /// Flip a post's status. Returns false for unknown posts.
    pub async fn update_status(&self, post_id: &str, status: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE feed_posts SET status = ? WHERE post_id = ?")
            .bind(status)
            .bind(post_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a post row along with its likes and reactions (purge path).
    pub async fn delete_post_and_likes(&self, post_id: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM feed_likes WHERE post_id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM feed_reactions WHERE post_id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM feed_posts WHERE post_id = ?")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Page through posts.
    ///
    /// `most_reactions` orders by total social signals (legacy likes plus
    /// reactions) descending and breaks ties with `RANDOM()` — pages are
    /// intentionally non-stable so zero-count posts shuffle while the
    /// board is young.
    pub async fn list_posts(
        &self,
        include: PostFilter,
        page: i64,
        size: i64,
        sort: PostSort,
    ) -> anyhow::Result<PostPage> {
        let size = size.clamp(1, 100);
        let page = page.max(1);
        let offset = (page - 1) * size;

        let where_sql = match include {
            PostFilter::Active => "WHERE status = 'active'",
            PostFilter::Trash => "WHERE status = 'trash'",
            PostFilter::All => "",
        };
        let order_sql = match sort {
            PostSort::Newest => "ORDER BY published_at DESC",
            PostSort::Oldest => "ORDER BY published_at ASC",
            PostSort::MostReactions => {
                "ORDER BY (
                    (SELECT COUNT(*) FROM feed_likes WHERE post_id = feed_posts.post_id) +
                    (SELECT COUNT(*) FROM feed_reactions WHERE post_id = feed_posts.post_id)
                ) DESC, RANDOM()"
            }
        };

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM feed_posts {where_sql}"))
                .fetch_one(&self.pool)
                .await?;
        let items = sqlx::query_as::<_, FeedPost>(&format!(
            "SELECT * FROM feed_posts {where_sql} {order_sql} LIMIT ? OFFSET ?"
        ))
        .bind(size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(PostPage {
            items,
            page,
            size,
            total,
            total_pages: (total + size - 1) / size,
        })
    }

    /// Toggle the viewer's legacy like.
    ///
    /// Any reaction row the viewer holds is removed first so the
    /// one-signal-per-viewer invariant survives the legacy path.
    pub async fn like_toggle(&self, post_id: &str, liker_id: &str) -> anyhow::Result<LikeToggle> {
        let now = epoch_now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM feed_reactions WHERE post_id = ? AND reactor_id = ?")
            .bind(post_id)
            .bind(liker_id)
            .execute(&mut *tx)
            .await?;
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM feed_likes WHERE post_id = ? AND liker_id = ?")
                .bind(post_id)
                .bind(liker_id)
                .fetch_optional(&mut *tx)
                .await?;
        let liked = if exists.is_some() {
            sqlx::query("DELETE FROM feed_likes WHERE post_id = ? AND liker_id = ?")
                .bind(post_id)
                .bind(liker_id)
                .execute(&mut *tx)
                .await?;
            false
        } else {
            sqlx::query(
                "INSERT OR IGNORE INTO feed_likes (post_id, liker_id, created_at) VALUES (?, ?, ?)",
            )
            .bind(post_id)
            .bind(liker_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            true
        };
        let like_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feed_likes WHERE post_id = ?")
                .bind(post_id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(LikeToggle { liked, like_count })
    }

    /// Like aggregate for a viewer.
    pub async fn get_like_info(&self, post_id: &str, liker_id: &str) -> anyhow::Result<LikeInfo> {
        let like_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feed_likes WHERE post_id = ?")
                .bind(post_id)
                .fetch_one(&self.pool)
                .await?;
        let liked: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM feed_likes WHERE post_id = ? AND liker_id = ?")
                .bind(post_id)
                .bind(liker_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(LikeInfo {
            like_count,
            liked_by_me: liked.is_some(),
        })
    }

    /// Reaction aggregates plus the viewer's own choice.
    ///
    /// Legacy like rows count into the `love` bucket, and a viewer whose
    /// only signal is a legacy like reads back `my_reaction = love`.
    pub async fn get_reaction_info(
        &self,
        post_id: &str,
        reactor_id: &str,
    ) -> anyhow::Result<ReactionInfo> {
        let mut counts = ReactionCounts::default();
        let rows = sqlx::query(
            "SELECT reaction, COUNT(*) AS cnt FROM feed_reactions WHERE post_id = ? GROUP BY reaction",
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let reaction: String = row.try_get("reaction")?;
            let count: i64 = row.try_get("cnt")?;
            if let Some(kind) = ReactionKind::parse(&reaction) {
                counts.add(kind, count);
            }
        }

        let mine: Option<String> = sqlx::query_scalar(
            "SELECT reaction FROM feed_reactions WHERE post_id = ? AND reactor_id = ? LIMIT 1",
        )
        .bind(post_id)
        .bind(reactor_id)
        .fetch_optional(&self.pool)
        .await?;
        let mut my_reaction = mine.as_deref().and_then(ReactionKind::parse);

        let legacy_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feed_likes WHERE post_id = ?")
                .bind(post_id)
                .fetch_one(&self.pool)
                .await?;
        counts.love += legacy_count;
        if my_reaction.is_none() {
            let legacy_me: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM feed_likes WHERE post_id = ? AND liker_id = ?")
                    .bind(post_id)
                    .bind(reactor_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if legacy_me.is_some() {
                my_reaction = Some(ReactionKind::Love);
            }
        }

        Ok(ReactionInfo {
            reactions: counts,
            my_reaction,
        })
    }

    /// Set, switch, or toggle-off the viewer's reaction.
    ///
    /// A legacy like row is removed first; choosing the current reaction
    /// again removes it.
    pub async fn reaction_set(
        &self,
        post_id: &str,
        reactor_id: &str,
        reaction: ReactionKind,
    ) -> anyhow::Result<ReactionInfo> {
        let now = epoch_now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM feed_likes WHERE post_id = ? AND liker_id = ?")
            .bind(post_id)
            .bind(reactor_id)
            .execute(&mut *tx)
            .await?;
        let current: Option<String> = sqlx::query_scalar(
            "SELECT reaction FROM feed_reactions WHERE post_id = ? AND reactor_id = ? LIMIT 1",
        )
        .bind(post_id)
        .bind(reactor_id)
        .fetch_optional(&mut *tx)
        .await?;

        let my_reaction = if current.as_deref() == Some(reaction.as_str()) {
            sqlx::query("DELETE FROM feed_reactions WHERE post_id = ? AND reactor_id = ?")
                .bind(post_id)
                .bind(reactor_id)
                .execute(&mut *tx)
                .await?;
            None
        } else {
            sqlx::query(
                "INSERT OR REPLACE INTO feed_reactions (post_id, reactor_id, reaction, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(post_id)
            .bind(reactor_id)
            .bind(reaction.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            Some(reaction)
        };
        tx.commit().await?;

        let mut info = self.get_reaction_info(post_id, reactor_id).await?;
        info.my_reaction = my_reaction;
        Ok(info)
    }
}

fn epoch_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, PostStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PostStore::new(&dir.path().join("app_data.db"))
            .await
            .expect("store");
        (dir, store)
    }

    fn post(post_id: &str, published_at: f64) -> FeedPost {
        FeedPost {
            post_id: post_id.to_owned(),
            owner_id: "anon-owner".to_owned(),
            author_name: None,
            prompt: "a red fox".to_owned(),
            workflow_id: Some("wf".to_owned()),
            seed: Some(7),
            aspect_ratio: Some("square".to_owned()),
            image_url: format!("/outputs/feed/2024/01/01/{post_id}.png"),
            thumb_url: None,
            input_image_url: None,
            input_thumb_url: None,
            source_image_id: Some("src".to_owned()),
            input_source_image_id: None,
            published_at,
            status: "active".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_post() {
        let (_dir, store) = store().await;
        store.create_post(&post("p1", 100.0)).await.expect("create");
        let got = store.get_post("p1").await.expect("get").expect("some");
        assert_eq!(got.owner_id, "anon-owner");
        assert_eq!(got.status, "active");
        assert!(store.get_post("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let (_dir, store) = store().await;
        PostStore::run_migrations(&store.pool).await.expect("rerun");
        PostStore::run_migrations(&store.pool).await.expect("rerun again");
    }

    #[tokio::test]
    async fn test_like_then_same_reaction_twice_clears_everything() {
        // like -> react:love -> react:love leaves no signal at all.
        let (_dir, store) = store().await;
        store.create_post(&post("p1", 100.0)).await.expect("create");

        let toggled = store.like_toggle("p1", "anon-v").await.expect("like");
        assert!(toggled.liked);
        assert_eq!(toggled.like_count, 1);

        let info = store
            .reaction_set("p1", "anon-v", ReactionKind::Love)
            .await
            .expect("react");
        // The legacy like is gone; the reaction row replaced it.
        assert_eq!(info.my_reaction, Some(ReactionKind::Love));
        assert_eq!(info.reactions.love, 1);

        let info = store
            .reaction_set("p1", "anon-v", ReactionKind::Love)
            .await
            .expect("react again");
        assert_eq!(info.my_reaction, None);
        assert_eq!(info.reactions.love, 0);
        let like = store.get_like_info("p1", "anon-v").await.expect("like info");
        assert_eq!(like.like_count, 0);
    }

    #[tokio::test]
    async fn test_at_most_one_signal_per_viewer() {
        let (_dir, store) = store().await;
        store.create_post(&post("p1", 100.0)).await.expect("create");
        store
            .reaction_set("p1", "anon-v", ReactionKind::Fire)
            .await
            .expect("react");
        // Liking removes the reaction; the combined count never exceeds 1.
        let toggled = store.like_toggle("p1", "anon-v").await.expect("like");
        assert!(toggled.liked);
        let info = store.get_reaction_info("p1", "anon-v").await.expect("info");
        assert_eq!(info.reactions.fire, 0);
        assert_eq!(info.reactions.love, 1, "legacy like projects to love");
        assert_eq!(info.my_reaction, Some(ReactionKind::Love));
    }

    #[tokio::test]
    async fn test_switching_reactions_replaces() {
        let (_dir, store) = store().await;
        store.create_post(&post("p1", 100.0)).await.expect("create");
        store
            .reaction_set("p1", "anon-v", ReactionKind::Wow)
            .await
            .expect("react");
        let info = store
            .reaction_set("p1", "anon-v", ReactionKind::Laugh)
            .await
            .expect("switch");
        assert_eq!(info.my_reaction, Some(ReactionKind::Laugh));
        assert_eq!(info.reactions.wow, 0);
        assert_eq!(info.reactions.laugh, 1);
    }

    #[tokio::test]
    async fn test_legacy_love_projection() {
        let (_dir, store) = store().await;
        store.create_post(&post("p1", 100.0)).await.expect("create");
        store.like_toggle("p1", "anon-a").await.expect("like a");
        store
            .reaction_set("p1", "anon-b", ReactionKind::Love)
            .await
            .expect("react b");
        let info = store.get_reaction_info("p1", "anon-c").await.expect("info");
        // love aggregate = explicit love reactions + legacy like rows.
        assert_eq!(info.reactions.love, 2);
        assert_eq!(info.my_reaction, None);
    }

    #[tokio::test]
    async fn test_list_posts_sorts_and_clamps() {
        let (_dir, store) = store().await;
        for (id, at) in [("p1", 100.0), ("p2", 200.0), ("p3", 300.0)] {
            store.create_post(&post(id, at)).await.expect("create");
        }
        let newest = store
            .list_posts(PostFilter::Active, 1, 10, PostSort::Newest)
            .await
            .expect("list");
        assert_eq!(newest.items[0].post_id, "p3");
        let oldest = store
            .list_posts(PostFilter::Active, 1, 10, PostSort::Oldest)
            .await
            .expect("list");
        assert_eq!(oldest.items[0].post_id, "p1");

        // Size clamps to [1, 100]; page clamps to >= 1.
        let clamped = store
            .list_posts(PostFilter::Active, -3, 0, PostSort::Newest)
            .await
            .expect("list");
        assert_eq!(clamped.page, 1);
        assert_eq!(clamped.size, 1);
        assert_eq!(clamped.total, 3);
        assert_eq!(clamped.total_pages, 3);
    }

    #[tokio::test]
    async fn test_most_reactions_orders_by_total_signals() {
        let (_dir, store) = store().await;
        for (id, at) in [("cold", 100.0), ("hot", 50.0)] {
            store.create_post(&post(id, at)).await.expect("create");
        }
        store.like_toggle("hot", "anon-1").await.expect("like");
        store
            .reaction_set("hot", "anon-2", ReactionKind::Fire)
            .await
            .expect("react");
        let page = store
            .list_posts(PostFilter::Active, 1, 10, PostSort::MostReactions)
            .await
            .expect("list");
        assert_eq!(page.items[0].post_id, "hot");
    }

    #[tokio::test]
    async fn test_trash_filter() {
        let (_dir, store) = store().await;
        store.create_post(&post("p1", 100.0)).await.expect("create");
        store.create_post(&post("p2", 200.0)).await.expect("create");
        assert!(store.update_status("p2", "trash").await.expect("trash"));
        let active = store
            .list_posts(PostFilter::Active, 1, 10, PostSort::Newest)
            .await
            .expect("list");
        assert_eq!(active.total, 1);
        let trash = store
            .list_posts(PostFilter::Trash, 1, 10, PostSort::Newest)
            .await
            .expect("list");
        assert_eq!(trash.items[0].post_id, "p2");
    }

    #[tokio::test]
    async fn test_purge_removes_post_and_signals() {
        let (_dir, store) = store().await;
        store.create_post(&post("p1", 100.0)).await.expect("create");
        store.like_toggle("p1", "anon-v").await.expect("like");
        assert!(store.delete_post_and_likes("p1").await.expect("purge"));
        assert!(store.get_post("p1").await.expect("get").is_none());
        let like = store.get_like_info("p1", "anon-v").await.expect("info");
        assert_eq!(like.like_count, 0);
    }
}
