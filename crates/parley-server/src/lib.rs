//! HTTP surface for a single-task parley deployment.

pub mod api;
pub mod error;
pub mod state;

pub use api::create_router;
pub use state::AppState;
