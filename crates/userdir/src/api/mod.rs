//! HTTP API module.
//!
//! Exposes the user directory as REST endpoints.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
