//! Atelier: multi-tenant front-end that brokers image-generation jobs
//! between anonymous browser clients and a single ComfyUI worker.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// HTTP/WS API surface (router, middleware, handlers, DTOs).
pub mod api;
/// Anonymous identity, beta gate, and admin authentication.
pub mod auth;
/// Client for the upstream ComfyUI peer (HTTP + WebSocket session).
pub mod comfy;
/// Application configuration loading.
pub mod config;
/// Core domain types: errors, jobs, and the fair scheduler.
pub mod core;
/// Filesystem-backed media stores (user artifacts and the public feed).
pub mod media;
/// Per-user WebSocket notification fan-out.
pub mod notify;
/// Per-job generation pipeline driving the upstream client.
pub mod pipeline;
/// Persistent storage (SQLite): job snapshots and feed posts.
pub mod store;
/// Prompt translation via an external LLM provider.
pub mod translate;
/// Workflow recipe registry (graph files plus node override metadata).
pub mod workflows;
