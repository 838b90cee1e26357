//! `POST /sync` — §6 external interface, §4.5 request lifecycle.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
	Json,
	extract::{Query, State},
	http::{HeaderMap, HeaderValue, StatusCode, header::AUTHORIZATION},
	response::{IntoResponse, Response},
};
use ruma_common::{OwnedRoomId, OwnedUserId};
use sync3_core::{Error, Result};
use sync3_service::{
	Services,
	connection::{ConnId, ListRequest, PosCheck, Tick, WaitOutcome, new_session_id},
};

use crate::{
	error::ApiError,
	types::{SyncQuery, SyncRequestBody, SyncResponseBody, WireListResponse, WireRoomPayload},
};

const POSITION_HEADER: &str = "x-sync3-position";
const SESSION_HEADER: &str = "x-sync3-session";

pub async fn post_sync(
	State(services): State<Arc<Services>>,
	Query(query): Query<SyncQuery>,
	headers: HeaderMap,
	Json(body): Json<SyncRequestBody>,
) -> Result<Response, ApiError> {
	let credential = bearer_credential(&headers).map_err(ApiError::from)?;

	let (user_id, device_id) = services
		.upstream
		.whoami(&credential)
		.await
		.map_err(|e| match e {
			| Error::UpstreamTransport(reason) => Error::UpstreamAuth(reason),
			| other => other,
		})
		.map_err(ApiError::from)?;

	services
		.pollers
		.ensure_polling(
			device_id.clone(),
			credential,
			services.upstream.clone(),
			services.receiver.clone(),
			services.store.clone(),
		)
		.await;

	// A supplied `session` that the Notifier does not recognise (evicted
	// for idleness, or never existed) must fail as expired rather than
	// silently minting a fresh Connection and losing the client's `pos`
	// (§4.5, §5, §7). Only an omitted `session` mints a new one.
	let (conn, session, is_new) = match query.session.clone() {
		| Some(session) => {
			let conn_id = ConnId::new(device_id.clone(), session.clone());
			let conn = services
				.notifier
				.conn(&conn_id)
				.await
				.ok_or_else(|| ApiError::from(Error::ExpiredSession))?;
			(conn, session, false)
		},
		| None => {
			let session = new_session_id();
			let conn_id = ConnId::new(device_id.clone(), session.clone());
			let (conn, is_new) = services.notifier.get_or_create_conn(conn_id, user_id.clone()).await;
			(conn, session, is_new)
		},
	};

	if !is_new {
		match conn.check_pos(query.pos).await {
			| PosCheck::Replay(bytes) => return Ok(replay_response(&session, bytes)),
			| PosCheck::Expired => return Err(ApiError::from(Error::ExpiredPos)),
			| PosCheck::Process => {},
		}
	}

	let mut cancel = conn.begin_request().await;

	let requests: BTreeMap<String, ListRequest> = body
		.lists
		.iter()
		.enumerate()
		.map(|(idx, list)| {
			let ranges = list.ranges.iter().map(|[lo, hi]| (*lo, *hi)).collect();
			let timeline_limit = list.timeline_limit.min(services.config.max_timeline_limit);
			(idx.to_string(), ListRequest { ranges, timeline_limit })
		})
		.collect();

	let mut tick = conn.tick(&requests, rooms_with_nid(&services, &user_id).await).await;
	let has_ops = tick.lists.values().any(|l| !l.ops.is_empty());

	if !has_ops {
		let timeout = std::time::Duration::from_secs(services.config.long_poll_timeout_secs);
		match conn.wait_for_activity(timeout, &mut cancel).await {
			| WaitOutcome::Superseded => return Ok(StatusCode::NO_CONTENT.into_response()),
			| WaitOutcome::Timeout => {
				let pos = tick.pos;
				conn.commit_timeout(pos).await;
				let empty = SyncResponseBody { pos, lists: Vec::new(), rooms: BTreeMap::new() };
				return Ok(finish_response(&session, &empty));
			},
			| WaitOutcome::Activity => {
				tick = conn.tick(&requests, rooms_with_nid(&services, &user_id).await).await;
			},
		}
	}

	let rooms = assemble_rooms(&services, &requests, &tick);
	let response = SyncResponseBody {
		pos: tick.pos,
		lists: tick
			.lists
			.into_iter()
			.map(|(_, list)| WireListResponse { count: list.count, ops: list.ops.into_iter().map(Into::into).collect() })
			.collect(),
		rooms,
	};

	let bytes = serde_json::to_vec(&response).map_err(|e| ApiError::from(Error::from(e)))?;
	conn.commit_response(tick.pos, bytes).await;

	Ok(finish_response(&session, &response))
}

fn bearer_credential(headers: &HeaderMap) -> Result<String> {
	let value = headers
		.get(AUTHORIZATION)
		.ok_or_else(|| Error::BadRequest("missing Authorization header".into()))?
		.to_str()
		.map_err(|_| Error::BadRequest("Authorization header is not valid UTF-8".into()))?;

	value
		.strip_prefix("Bearer ")
		.map(ToOwned::to_owned)
		.ok_or_else(|| Error::BadRequest("Authorization header must be a Bearer token".into()))
}

async fn rooms_with_nid(services: &Services, user_id: &OwnedUserId) -> Vec<(OwnedRoomId, u64)> {
	let rooms = services.notifier.rooms_for_user(user_id).await;
	rooms
		.into_iter()
		.filter_map(|room_id| {
			let nid = services.store.latest_nid(&room_id).ok()?;
			Some((room_id, nid))
		})
		.collect()
}

/// Builds the `rooms` map: for each room touched by this tick's ops, a
/// payload bounded by the largest `timeline_limit` any list asked for it
/// with (§4.5 "Timeline assembly" — `timeline_limit == 0` legally yields no
/// events, never a panic).
fn assemble_rooms(
	services: &Services,
	requests: &BTreeMap<String, ListRequest>,
	tick: &Tick,
) -> BTreeMap<OwnedRoomId, WireRoomPayload> {
	let timeline_limit = requests.values().map(|r| r.timeline_limit).max().unwrap_or(0) as usize;

	tick.rooms
		.iter()
		.map(|(room_id, &initial)| {
			let timeline = services
				.store
				.latest_events(room_id, timeline_limit)
				.unwrap_or_default()
				.into_iter()
				.map(|event| event.content)
				.collect();
			(room_id.clone(), WireRoomPayload { initial, timeline, name: None })
		})
		.collect()
}

fn finish_response(session: &str, body: &SyncResponseBody) -> Response {
	let mut response = Json(body).into_response();
	insert_headers(response.headers_mut(), session, body.pos);
	response
}

fn replay_response(session: &str, bytes: Vec<u8>) -> Response {
	let pos = serde_json::from_slice::<serde_json::Value>(&bytes)
		.ok()
		.and_then(|v| v.get("pos").and_then(serde_json::Value::as_i64))
		.unwrap_or(0);
	let mut response = ([(axum::http::header::CONTENT_TYPE, "application/json")], bytes).into_response();
	insert_headers(response.headers_mut(), session, pos);
	response
}

fn insert_headers(headers: &mut HeaderMap, session: &str, pos: i64) {
	headers.insert(POSITION_HEADER, HeaderValue::from(pos));
	if let Ok(value) = HeaderValue::from_str(session) {
		headers.insert(SESSION_HEADER, value);
	}
}

#[cfg(test)]
mod tests {
	use axum::http::HeaderValue;

	use super::*;

	#[test]
	fn bearer_credential_strips_prefix() {
		let mut headers = HeaderMap::new();
		headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
		assert_eq!(bearer_credential(&headers).unwrap(), "abc123");
	}

	#[test]
	fn bearer_credential_rejects_missing_header() {
		let headers = HeaderMap::new();
		assert!(matches!(bearer_credential(&headers), Err(Error::BadRequest(_))));
	}

	#[test]
	fn bearer_credential_rejects_non_bearer_scheme() {
		let mut headers = HeaderMap::new();
		headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
		assert!(matches!(bearer_credential(&headers), Err(Error::BadRequest(_))));
	}
}
