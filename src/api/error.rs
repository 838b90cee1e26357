//! Turns the shared `sync3_core::Error` into the `{"errcode", "error"}` JSON
//! body §7 of the spec calls for, with the status code `Error::status_code`
//! already knows how to pick.

use axum::{
	Json,
	response::{IntoResponse, Response},
};
use sync3_core::Error;

use crate::types::ErrorBody;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
	fn from(e: Error) -> Self { Self(e) }
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = self.0.status_code();
		let body = ErrorBody { errcode: self.0.errcode(), error: self.0.sanitized_message() };
		tracing::debug!(status = %status, errcode = body.errcode, "request failed");
		(status, Json(body)).into_response()
	}
}
