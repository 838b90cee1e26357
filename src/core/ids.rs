//! Names, not newtypes: NIDs, snapshot IDs and `pos` are all plain integers
//! at rest (see SPEC_FULL.md §3's byte encoding), but giving them distinct
//! aliases keeps a `Nid` from being silently handed to something expecting a
//! `SnapshotId`.

/// Server-assigned monotonic event identifier (§3, GLOSSARY).
pub type Nid = u64;

/// Sentinel for `Delta`'s `fromExclusivePos`: draw from the beginning.
pub const EVENTS_START: Nid = 0;

/// Monotonic identifier of an immutable state snapshot (§3, GLOSSARY).
pub type SnapshotId = u64;

/// Opaque cursor returned to the sliding-sync client (GLOSSARY: "Pos").
pub type Pos = i64;

pub use ruma_common::{OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
