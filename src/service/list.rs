//! §4.5 window / list-delta protocol. Pure, synchronous, independent of the
//! Store or async runtime by design (SPEC_FULL.md §4.5 addendum) so the
//! concrete scenarios in spec.md §8.4–§8.5 can be exercised as plain unit
//! tests with no database.

use std::collections::HashSet;

use ruma_common::OwnedRoomId;

/// A compact delta transforming a client's cached window toward the
/// server's current view (GLOSSARY: "Op").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
	/// Reset `range` (inclusive, absolute list indices) to `rooms`.
	/// Emitted only on the first response for a list, or when replay state
	/// is lost.
	Sync { range: (usize, usize), rooms: Vec<OwnedRoomId> },
	/// Remove the room at the absolute index; rooms after shift left.
	Delete { index: usize },
	/// Insert `room_id` at the absolute index; rooms from `index` onward
	/// shift right, overflow off the right edge of the window is
	/// discarded.
	Insert { index: usize, room_id: OwnedRoomId },
	/// Room identity at `index` is unchanged; its payload changed.
	Update { index: usize, room_id: OwnedRoomId },
	/// The client should forget rooms in `range` — emitted when the window
	/// moves such that those indices are no longer covered.
	Invalidate { range: (usize, usize) },
}

/// Total order over a list's member rooms (§4.5 "Room ordering"): descending
/// most-recent-activity NID, ascending room ID as a tie-break.
#[must_use]
pub fn sort_rooms(mut rooms: Vec<(OwnedRoomId, u64)>) -> Vec<OwnedRoomId> {
	rooms.sort_by(|(a_id, a_nid), (b_id, b_nid)| b_nid.cmp(a_nid).then_with(|| a_id.cmp(b_id)));
	rooms.into_iter().map(|(id, _)| id).collect()
}

/// Computes the smallest sequence of ops transforming the previous window's
/// contents into the new window's contents (§4.5). `window` is the absolute
/// `[lo, hi]` index range (inclusive) both `prev` and `new` were sliced
/// from; `updated` names rooms whose identity is unchanged but whose
/// payload changed (new timeline events, name change, ...).
///
/// `prev` empty means "no replay state" — always a full `Sync`, matching
/// both the very-first-response case and the lost-replay-state case in one
/// code path.
#[must_use]
pub fn diff_window(
	window: (usize, usize),
	prev: &[OwnedRoomId],
	new: &[OwnedRoomId],
	updated: &HashSet<OwnedRoomId>,
) -> Vec<Op> {
	if prev.is_empty() {
		if new.is_empty() {
			return Vec::new();
		}
		return vec![Op::Sync { range: window, rooms: new.to_vec() }];
	}

	let lcs_mask = lcs_keep_mask(prev, new);

	let mut ops = Vec::new();

	// Deletions: walk prev right-to-left so earlier deletes don't shift
	// the absolute index of a later one.
	for (local_idx, keep) in lcs_mask.prev_keep.iter().enumerate().rev() {
		if !keep {
			ops.push(Op::Delete { index: window.0 + local_idx });
		}
	}

	// Insertions: walk new left-to-right; absolute index is the room's
	// final resting place in the window.
	for (local_idx, keep) in lcs_mask.new_keep.iter().enumerate() {
		if !keep {
			ops.push(Op::Insert { index: window.0 + local_idx, room_id: new[local_idx].clone() });
		}
	}

	// Rooms whose identity survived unchanged but whose payload changed.
	for (local_idx, room_id) in new.iter().enumerate() {
		if lcs_mask.new_keep[local_idx] && updated.contains(room_id) {
			ops.push(Op::Update { index: window.0 + local_idx, room_id: room_id.clone() });
		}
	}

	ops
}

struct LcsMask {
	prev_keep: Vec<bool>,
	new_keep: Vec<bool>,
}

/// Longest-common-subsequence membership mask: `prev_keep[i]` is true iff
/// `prev[i]` participates in an LCS with `new` (symmetrically for
/// `new_keep`). Rooms outside the LCS are the ones that must be deleted
/// from `prev` / inserted into `new`.
fn lcs_keep_mask(prev: &[OwnedRoomId], new: &[OwnedRoomId]) -> LcsMask {
	let n = prev.len();
	let m = new.len();
	let mut dp = vec![vec![0u32; m + 1]; n + 1];
	for i in (0..n).rev() {
		for j in (0..m).rev() {
			dp[i][j] = if prev[i] == new[j] {
				dp[i + 1][j + 1] + 1
			} else {
				dp[i + 1][j].max(dp[i][j + 1])
			};
		}
	}

	let mut prev_keep = vec![false; n];
	let mut new_keep = vec![false; m];
	let (mut i, mut j) = (0, 0);
	while i < n && j < m {
		if prev[i] == new[j] {
			prev_keep[i] = true;
			new_keep[j] = true;
			i += 1;
			j += 1;
		} else if dp[i + 1][j] >= dp[i][j + 1] {
			i += 1;
		} else {
			j += 1;
		}
	}

	LcsMask { prev_keep, new_keep }
}

/// Applies an op sequence to a client's prior window, for the round-trip
/// law in spec.md §8: "applying the emitted op sequence to the client's
/// prior window yields exactly the server's new window." `window_len` caps
/// the result the same way a real window has a fixed capacity — inserts
/// that would overflow the right edge are discarded, matching `INSERT`'s
/// semantics.
#[must_use]
pub fn apply_ops(mut window: Vec<Option<OwnedRoomId>>, window_start: usize, ops: &[Op]) -> Vec<Option<OwnedRoomId>> {
	let window_len = window.len();
	for op in ops {
		match op {
			| Op::Sync { rooms, .. } => {
				window = rooms.iter().cloned().map(Some).collect();
				window.resize(window_len, None);
			},
			| Op::Delete { index } => {
				let local = *index - window_start;
				if local < window.len() {
					window.remove(local);
					window.push(None);
				}
			},
			| Op::Insert { index, room_id } => {
				let local = *index - window_start;
				if local <= window.len() {
					window.insert(local, Some(room_id.clone()));
					window.truncate(window_len);
				}
			},
			| Op::Update { index, room_id } => {
				let local = *index - window_start;
				if let Some(slot) = window.get_mut(local) {
					*slot = Some(room_id.clone());
				}
			},
			| Op::Invalidate { range } => {
				for idx in range.0..=range.1 {
					let local = idx - window_start;
					if let Some(slot) = window.get_mut(local) {
						*slot = None;
					}
				}
			},
		}
	}
	window
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use ruma_common::RoomId;

	use super::*;

	fn room(n: u32) -> OwnedRoomId { <&RoomId>::try_from(format!("!r{n}:example.org").as_str()).unwrap().to_owned() }

	#[test]
	fn first_response_is_a_sync() {
		let new = vec![room(19), room(18), room(17), room(16)];
		let ops = diff_window((0, 3), &[], &new, &HashSet::new());
		assert_eq!(ops, vec![Op::Sync { range: (0, 3), rooms: new }]);
	}

	#[test]
	fn room_enters_window_from_outside() {
		let prev = vec![room(19), room(18), room(17), room(16)];
		let new = vec![room(7), room(19), room(18), room(17)];
		let ops = diff_window((0, 3), &prev, &new, &HashSet::new());
		assert_eq!(ops, vec![Op::Delete { index: 3 }, Op::Insert { index: 0, room_id: room(7) }]);
	}

	#[test]
	fn unchanged_identity_with_new_payload_is_an_update() {
		let prev = vec![room(7), room(19), room(18), room(17)];
		let new = prev.clone();
		let mut updated = HashSet::new();
		updated.insert(room(7));
		let ops = diff_window((0, 3), &prev, &new, &updated);
		assert_eq!(ops, vec![Op::Update { index: 0, room_id: room(7) }]);
	}

	#[test]
	fn reorder_within_window_is_delete_then_insert() {
		let prev = vec![room(7), room(19), room(18), room(17)];
		let new = vec![room(18), room(7), room(19), room(17)];
		let ops = diff_window((0, 3), &prev, &new, &HashSet::new());
		assert_eq!(ops, vec![Op::Delete { index: 2 }, Op::Insert { index: 0, room_id: room(18) }]);
	}

	#[test]
	fn zero_width_window_never_indexes_out_of_bounds() {
		let prev: Vec<OwnedRoomId> = vec![room(5), room(6), room(7), room(8), room(9), room(10)];
		let new: Vec<OwnedRoomId> = vec![room(15), room(5), room(6), room(7), room(8), room(9)];
		let ops = diff_window((5, 10), &prev, &new, &HashSet::new());
		assert_eq!(ops, vec![Op::Delete { index: 10 }, Op::Insert { index: 5, room_id: room(15) }]);
	}

	#[test]
	fn round_trip_law_holds_for_the_reorder_scenario() {
		let prev = vec![room(7), room(19), room(18), room(17)];
		let new = vec![room(18), room(7), room(19), room(17)];
		let ops = diff_window((0, 3), &prev, &new, &HashSet::new());

		let window: Vec<Option<OwnedRoomId>> = prev.iter().cloned().map(Some).collect();
		let result = apply_ops(window, 0, &ops);
		let expected: Vec<Option<OwnedRoomId>> = new.into_iter().map(Some).collect();
		assert_eq!(result, expected);
	}
}
