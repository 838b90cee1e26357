use std::{path::Path, sync::Arc};

use rocksdb::{ColumnFamilyDescriptor, MultiThreaded, Options};
use sync3_core::Result;

/// Alias for the concrete RocksDB handle type this crate uses everywhere.
/// The teacher's own `database::engine` keeps the same one-line alias
/// (`type Db = DBWithThreadMode<MultiThreaded>`) so call sites never spell
/// out the generic parameter.
pub(crate) type Db = rocksdb::DBWithThreadMode<MultiThreaded>;

/// The open database plus the column-family descriptors it was opened with.
/// Schema (which column families exist, what goes in them) is entirely the
/// caller's business — this type is generic over "a RocksDB with some named
/// column families", same split as the teacher's `database`/service crates.
pub struct Engine {
	pub(crate) db: Db,
}

/// A set of staged writes across one or more column families, committed
/// atomically by `Engine::commit`. Wraps `rocksdb::WriteBatch` so callers
/// outside this crate never need `rocksdb` as a direct dependency — the
/// same "database crate owns the engine's types" split the teacher keeps
/// between `database` and the services built on it.
#[derive(Default)]
pub struct Batch(pub(crate) rocksdb::WriteBatch);

impl Batch {
	#[must_use]
	pub fn new() -> Self { Self::default() }
}

impl Engine {
	/// Opens (creating if absent) a database at `path` with exactly the
	/// column families named in `columns`.
	pub fn open(path: &Path, columns: &[&'static str]) -> Result<Arc<Self>> {
		let mut db_opts = Options::default();
		db_opts.create_if_missing(true);
		db_opts.create_missing_column_families(true);

		let existing = Db::list_cf(&db_opts, path).unwrap_or_default();

		let cfds = columns
			.iter()
			.map(|&name| {
				let mut cf_opts = Options::default();
				cf_opts.create_if_missing(true);
				ColumnFamilyDescriptor::new(name, cf_opts)
			})
			.collect::<Vec<_>>();

		// RocksDB requires every existing column family to be named when
		// reopening, even ones the current schema no longer declares.
		let mut cfds = cfds;
		for name in &existing {
			if name != "default" && !columns.contains(&name.as_str()) {
				cfds.push(ColumnFamilyDescriptor::new(name.clone(), Options::default()));
			}
		}

		let db = Db::open_cf_descriptors(&db_opts, path, cfds)
			.map_err(|e| sync3_core::Error::Store(e.to_string().into()))?;

		tracing::info!(?path, columns = columns.len(), "opened store");
		Ok(Arc::new(Self { db }))
	}

	#[must_use]
	pub fn cf(&self, name: &str) -> Arc<rocksdb::BoundColumnFamily<'_>> {
		self.db
			.cf_handle(name)
			.unwrap_or_else(|| panic!("column family {name:?} was not opened"))
	}

	/// Applies a batch of writes atomically.
	pub fn commit(&self, batch: Batch) -> Result<()> {
		self.db
			.write(batch.0)
			.map_err(|e| sync3_core::Error::Store(e.to_string().into()))
	}

	/// Takes a consistent point-in-time read handle. Every read that backs a
	/// single HTTP response should come from the same snapshot (§4.1).
	#[must_use]
	pub fn snapshot(&self) -> rocksdb::Snapshot<'_> { self.db.snapshot() }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::map::Map;

	fn open_tmp(columns: &[&'static str]) -> (tempfile::TempDir, Arc<Engine>) {
		let dir = tempfile::tempdir().unwrap();
		let engine = Engine::open(dir.path(), columns).unwrap();
		(dir, engine)
	}

	#[test]
	fn reopen_preserves_previously_declared_column_families() {
		let dir = tempfile::tempdir().unwrap();
		Engine::open(dir.path(), &["a", "b"]).unwrap();
		// reopening with a schema that drops "b" must not fail even though
		// the on-disk database still has it.
		let engine = Engine::open(dir.path(), &["a"]).unwrap();
		let map = Map::open(&engine, "a");
		map.put(b"k", b"v").unwrap();
		assert_eq!(map.get(b"k").unwrap(), Some(b"v".to_vec()));
	}

	#[test]
	fn commit_applies_writes_across_column_families_atomically() {
		let (_dir, engine) = open_tmp(&["a", "b"]);
		let map_a = Map::open(&engine, "a");
		let map_b = Map::open(&engine, "b");

		let mut batch = Batch::new();
		map_a.batch_put(&mut batch, b"k1", b"v1");
		map_b.batch_put(&mut batch, b"k2", b"v2");
		engine.commit(batch).unwrap();

		assert_eq!(map_a.get(b"k1").unwrap(), Some(b"v1".to_vec()));
		assert_eq!(map_b.get(b"k2").unwrap(), Some(b"v2".to_vec()));
	}
}
