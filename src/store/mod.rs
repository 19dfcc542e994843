//! Persistent storage over SQLite: job snapshots and the feed's posts,
//! likes, and reactions.

pub mod jobs;
pub mod posts;

pub use jobs::JobStore;
pub use posts::PostStore;
