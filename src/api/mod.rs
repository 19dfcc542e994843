//! HTTP/WS API surface: router assembly, middleware, handlers, DTOs.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod protocol;
pub mod server;
pub mod ws_status;

pub use error::ApiError;
pub use server::{AppState, create_router};
