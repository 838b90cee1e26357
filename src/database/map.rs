use std::sync::Arc;

use sync3_core::Result;

use crate::engine::Engine;

/// A single named column family, the same `name + engine handle` shape as
/// the teacher's own `database::map::Map` (minus the read/write option
/// tuning and the watch-channel machinery that type also carries — this
/// proxy has no counterpart for either).
pub struct Map {
	name: &'static str,
	engine: Arc<Engine>,
}

impl Map {
	#[must_use]
	pub fn open(engine: &Arc<Engine>, name: &'static str) -> Arc<Self> {
		Arc::new(Self { name, engine: engine.clone() })
	}

	#[must_use]
	pub fn name(&self) -> &'static str { self.name }

	pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Vec<u8>>> {
		self.engine
			.db
			.get_cf(&self.engine.cf(self.name), key)
			.map_err(|e| sync3_core::Error::Store(e.to_string().into()))
	}

	/// Reads through a previously-taken snapshot, for read-consistency
	/// across several keys/maps within one response (§4.1).
	pub fn get_in<K: AsRef<[u8]>>(
		&self,
		snapshot: &rocksdb::Snapshot<'_>,
		key: K,
	) -> Result<Option<Vec<u8>>> {
		snapshot
			.get_cf(&self.engine.cf(self.name), key)
			.map_err(|e| sync3_core::Error::Store(e.to_string().into()))
	}

	pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: K, value: V) -> Result<()> {
		self.engine
			.db
			.put_cf(&self.engine.cf(self.name), key, value)
			.map_err(|e| sync3_core::Error::Store(e.to_string().into()))
	}

	pub fn remove<K: AsRef<[u8]>>(&self, key: K) -> Result<()> {
		self.engine
			.db
			.delete_cf(&self.engine.cf(self.name), key)
			.map_err(|e| sync3_core::Error::Store(e.to_string().into()))
	}

	/// Stages a put into a batch without committing; caller commits several
	/// maps' worth of puts atomically via `Engine::commit`.
	pub fn batch_put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, batch: &mut crate::engine::Batch, key: K, value: V) {
		batch.0.put_cf(&self.engine.cf(self.name), key, value);
	}

	pub fn batch_remove<K: AsRef<[u8]>>(&self, batch: &mut crate::engine::Batch, key: K) {
		batch.0.delete_cf(&self.engine.cf(self.name), key);
	}

	/// Ascending iteration over every key with the given prefix.
	pub fn iter_prefix<'a>(
		&'a self,
		prefix: &'a [u8],
	) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + 'a {
		let mode = rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward);
		let prefix = prefix.to_vec();
		self.engine
			.db
			.iterator_cf(&self.engine.cf(self.name), mode)
			.map_while(Result::ok)
			.take_while(move |(k, _)| k.starts_with(&prefix))
	}

	/// Ascending iteration over the whole column family.
	pub fn iter(&self) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + '_ {
		self.engine
			.db
			.iterator_cf(&self.engine.cf(self.name), rocksdb::IteratorMode::Start)
			.map_while(Result::ok)
	}

	/// Descending iteration over the whole column family — used to seed
	/// monotonic counters from the highest existing key at startup.
	pub fn iter_rev(&self) -> impl Iterator<Item = (Box<[u8]>, Box<[u8]>)> + '_ {
		self.engine
			.db
			.iterator_cf(&self.engine.cf(self.name), rocksdb::IteratorMode::End)
			.map_while(Result::ok)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::engine::Engine;

	fn open_tmp() -> (tempfile::TempDir, Arc<Map>) {
		let dir = tempfile::tempdir().unwrap();
		let engine = Engine::open(dir.path(), &["c"]).unwrap();
		let map = Map::open(&engine, "c");
		(dir, map)
	}

	#[test]
	fn get_put_remove_round_trip() {
		let (_dir, map) = open_tmp();
		assert_eq!(map.get(b"x").unwrap(), None);
		map.put(b"x", b"1").unwrap();
		assert_eq!(map.get(b"x").unwrap(), Some(b"1".to_vec()));
		map.remove(b"x").unwrap();
		assert_eq!(map.get(b"x").unwrap(), None);
	}

	#[test]
	fn iter_prefix_is_scoped_and_ascending() {
		let (_dir, map) = open_tmp();
		map.put([b"room1\0".as_slice(), &1u64.to_be_bytes()].concat(), []).unwrap();
		map.put([b"room1\0".as_slice(), &2u64.to_be_bytes()].concat(), []).unwrap();
		map.put([b"room2\0".as_slice(), &1u64.to_be_bytes()].concat(), []).unwrap();

		let keys: Vec<_> = map.iter_prefix(b"room1\0").map(|(k, _)| k.to_vec()).collect();
		assert_eq!(keys.len(), 2);
		assert!(keys[0] < keys[1]);
	}

	#[test]
	fn iter_rev_yields_highest_key_first() {
		let (_dir, map) = open_tmp();
		map.put(1u64.to_be_bytes(), []).unwrap();
		map.put(5u64.to_be_bytes(), []).unwrap();
		map.put(3u64.to_be_bytes(), []).unwrap();

		let (first_key, _) = map.iter_rev().next().unwrap();
		assert_eq!(&*first_key, &5u64.to_be_bytes());
	}
}
