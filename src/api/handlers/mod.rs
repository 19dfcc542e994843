//! Request handlers, grouped by surface.

pub mod admin;
pub mod feed;
pub mod health;
pub mod jobs;
pub mod media;
pub mod pages;
pub mod translate;
pub mod workflows;
