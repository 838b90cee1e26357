use std::borrow::Cow;

/// Shared error type for every crate in the workspace, in the same spirit as
/// the teacher's single `tuwunel_core::Error`: one enum, `#[from]`
/// conversions for the things that bubble up unchanged, named variants for
/// the domain errors §7 of the spec calls out by name.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	// std / third-party passthroughs
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	Figment(#[from] figment::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	TracingFilter(#[from] tracing_subscriber::filter::ParseError),
	#[error(transparent)]
	TryFromInt(#[from] std::num::TryFromIntError),

	// domain: §7 of spec.md
	/// Upstream transport failure (timeout, connection reset, DNS, ...).
	/// Retried with backoff by the Poller; never surfaced to a client.
	#[error("upstream transport error: {0}")]
	UpstreamTransport(Cow<'static, str>),

	/// Upstream rejected our credential. Surfaced as 502; the Poller halts
	/// until the client reauthenticates.
	#[error("upstream auth failed: {0}")]
	UpstreamAuth(Cow<'static, str>),

	/// `Accumulate` was called for a room with no current snapshot.
	/// Fatal to the current batch; upstream's `since` must not advance.
	#[error("room {0} has not been initialised")]
	RoomNotInitialised(ruma_common::OwnedRoomId),

	/// A store-layer invariant was violated or the underlying engine
	/// returned an error that isn't one of the passthroughs above.
	#[error("store error: {0}")]
	Store(Cow<'static, str>),

	/// Client's `pos` does not match any state this connection remembers.
	#[error("expired pos")]
	ExpiredPos,

	/// Client's `session` is unknown (evicted for being idle, or never
	/// existed).
	#[error("expired session")]
	ExpiredSession,

	/// Malformed request body: bad ranges, negative limits, etc.
	#[error("bad request: {0}")]
	BadRequest(Cow<'static, str>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
	/// Maps a domain error onto the HTTP status code §7 specifies. Errors
	/// with no client-facing meaning (store/internal) fall back to 500.
	#[must_use]
	pub fn status_code(&self) -> http::StatusCode {
		use http::StatusCode;
		match self {
			| Self::UpstreamAuth(_) => StatusCode::BAD_GATEWAY,
			| Self::ExpiredPos | Self::ExpiredSession | Self::BadRequest(_) =>
				StatusCode::BAD_REQUEST,
			| _ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// A short machine-readable tag for the JSON error body, independent of
	/// the `Display` message (which may contain detail not meant for
	/// clients).
	#[must_use]
	pub fn errcode(&self) -> &'static str {
		match self {
			| Self::UpstreamAuth(_) => "M_UPSTREAM_AUTH_FAILED",
			| Self::ExpiredPos => "M_EXPIRED_POS",
			| Self::ExpiredSession => "M_EXPIRED_SESSION",
			| Self::BadRequest(_) => "M_BAD_REQUEST",
			| _ => "M_UNKNOWN",
		}
	}

	/// Sanitized message safe to hand to an untrusted client: internal
	/// errors never leak their contents.
	#[must_use]
	pub fn sanitized_message(&self) -> String {
		match self {
			| Self::Store(_) | Self::Io(_) => String::from("internal error"),
			| other => other.to_string(),
		}
	}
}
