//! API module for all HTTP handlers
//!
//! The health endpoint plus one POST route per configured hook route.

pub mod health;
pub mod webhook;

use axum::{Router, routing};

use crate::SharedState;

// Re-export handlers
pub use health::root;
pub use webhook::handle_webhook;

/// Build the router for every route in the hook registry.
pub fn create_router(state: SharedState) -> Router {
    let mut router = Router::new().route("/", routing::get(root));
    for route in state.hooks.routes() {
        router = router.route(route, routing::post(handle_webhook));
    }
    router.with_state(state)
}
