//! HTTP and WebSocket surface over the session registry.

mod error;
mod events;
mod handlers;
mod routes;
mod state;
mod terminal;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
