//! §4.5 + §6: the HTTP surface in front of the Connection / list engine.
//! One route, `POST /sync`; everything else (auth, long-poll, replay) lives
//! in `sync::post_sync`.

pub mod error;
pub mod sync;
pub mod types;

use std::sync::Arc;

use axum::{Router, routing::post};
use sync3_service::Services;
use tower_http::trace::TraceLayer;

/// Builds the full router for a running proxy: the `/sync` endpoint plus
/// the teacher's own request-tracing middleware layer (`tower-http`'s
/// `TraceLayer`, the same crate the teacher reaches for — see
/// SPEC_FULL.md §7).
#[must_use]
pub fn router(services: Arc<Services>) -> Router {
	Router::new()
		.route("/sync", post(sync::post_sync))
		.layer(TraceLayer::new_for_http())
		.with_state(services)
}
