//! §6 wire contract: the bespoke JSON this proxy speaks to its own
//! sliding-sync clients. Deliberately independent of Ruma's client-API
//! request/response types — we are defining our own dialect here, not
//! reusing the Matrix one, per SPEC_FULL.md §6.

use std::collections::BTreeMap;

use ruma_common::OwnedRoomId;
use serde::{Deserialize, Serialize};
use sync3_core::Pos;
use sync3_service::list::Op;

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
	pub pos: Option<Pos>,
	pub session: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRequestBody {
	#[serde(default)]
	pub lists: Vec<WireListRequest>,
}

#[derive(Debug, Deserialize)]
pub struct WireListRequest {
	pub ranges: Vec<[usize; 2]>,
	#[serde(default)]
	pub timeline_limit: u32,
	#[serde(default)]
	pub filters: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SyncResponseBody {
	pub pos: Pos,
	pub lists: Vec<WireListResponse>,
	pub rooms: BTreeMap<OwnedRoomId, WireRoomPayload>,
}

#[derive(Debug, Serialize)]
pub struct WireListResponse {
	pub count: usize,
	pub ops: Vec<WireOp>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireOp {
	Sync {
		range: [usize; 2],
		room_ids: Vec<OwnedRoomId>,
	},
	Delete {
		index: usize,
	},
	Insert {
		index: usize,
		room_id: OwnedRoomId,
	},
	Update {
		index: usize,
		room_id: OwnedRoomId,
	},
	Invalidate {
		range: [usize; 2],
	},
}

impl From<Op> for WireOp {
	fn from(op: Op) -> Self {
		match op {
			| Op::Sync { range, rooms } => Self::Sync { range: [range.0, range.1], room_ids: rooms },
			| Op::Delete { index } => Self::Delete { index },
			| Op::Insert { index, room_id } => Self::Insert { index, room_id },
			| Op::Update { index, room_id } => Self::Update { index, room_id },
			| Op::Invalidate { range } => Self::Invalidate { range: [range.0, range.1] },
		}
	}
}

#[derive(Debug, Default, Serialize)]
pub struct WireRoomPayload {
	pub initial: bool,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub timeline: Vec<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
	pub errcode: &'static str,
	pub error: String,
}
