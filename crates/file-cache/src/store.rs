use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Error;

const FILES_TABLE: TableDefinition<'_, &'_ str, Vec<u8>> = TableDefinition::new("files");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredValue {
	pub hash: String,
	pub mtime_ticks: i64,
}

/// Durable side of the index: one row per stored path.
///
/// Every call runs a redb transaction synchronously, so async callers go through
/// `spawn_blocking` on a clone.
#[derive(Clone)]
pub(crate) struct RecordStore {
	db: Arc<Database>,
}

impl RecordStore {
	pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
		let db = Database::create(path.as_ref())?;

		let txn = db.begin_write()?;
		{
			txn.open_table(FILES_TABLE)?;
		}
		txn.commit()?;

		Ok(Self { db: Arc::new(db) })
	}

	/// Every row that still decodes. Broken rows are logged and left for the next write over
	/// the same key to replace.
	pub fn load(&self) -> Result<Vec<(String, StoredValue)>, Error> {
		let txn = self.db.begin_read()?;
		let table = txn.open_table(FILES_TABLE)?;

		let mut rows = Vec::new();
		for row in table.iter()? {
			let (key, value) = match row {
				Ok(row) => row,
				Err(e) => {
					warn!(?e, "Failed to read file cache row, skipping;");
					continue;
				}
			};

			match rmp_serde::from_slice::<StoredValue>(&value.value()) {
				Ok(decoded) => rows.push((key.value().to_string(), decoded)),
				Err(e) => warn!(
					key = key.value(),
					?e,
					"Corrupt file cache row, skipping;"
				),
			}
		}

		Ok(rows)
	}

	pub fn upsert(&self, key: &str, value: &StoredValue) -> Result<(), Error> {
		let encoded = rmp_serde::to_vec_named(value)?;

		let txn = self.db.begin_write()?;
		{
			let mut table = txn.open_table(FILES_TABLE)?;
			table.insert(key, encoded)?;
		}
		txn.commit()?;

		Ok(())
	}

	pub fn remove(&self, key: &str) -> Result<(), Error> {
		self.remove_many([key])
	}

	pub fn remove_many<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> Result<(), Error> {
		let txn = self.db.begin_write()?;
		{
			let mut table = txn.open_table(FILES_TABLE)?;
			for key in keys {
				table.remove(key)?;
			}
		}
		txn.commit()?;

		Ok(())
	}

	/// Moves a row to a new key within one transaction
	pub fn rename(&self, from: &str, to: &str, value: &StoredValue) -> Result<(), Error> {
		let encoded = rmp_serde::to_vec_named(value)?;

		let txn = self.db.begin_write()?;
		{
			let mut table = txn.open_table(FILES_TABLE)?;
			table.remove(from)?;
			table.insert(to, encoded)?;
		}
		txn.commit()?;

		Ok(())
	}

	#[cfg(test)]
	pub fn put_raw(&self, key: &str, bytes: Vec<u8>) -> Result<(), Error> {
		let txn = self.db.begin_write()?;
		{
			let mut table = txn.open_table(FILES_TABLE)?;
			table.insert(key, bytes)?;
		}
		txn.commit()?;

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use pretty_assertions::assert_eq;
	use tempfile::tempdir;

	#[test]
	fn corrupt_rows_are_skipped() {
		let dir = tempdir().unwrap();
		let store = RecordStore::open(dir.path().join("files.redb")).unwrap();

		let good = StoredValue {
			hash: "a".repeat(64),
			mtime_ticks: 42,
		};
		store.upsert("{source}/good.tex", &good).unwrap();
		store.put_raw("{source}/bad.tex", vec![0xc1, 0xff]).unwrap();

		assert_eq!(
			store.load().unwrap(),
			vec![("{source}/good.tex".to_string(), good)]
		);
	}

	#[test]
	fn rename_moves_the_row() {
		let dir = tempdir().unwrap();
		let store = RecordStore::open(dir.path().join("files.redb")).unwrap();

		let value = StoredValue {
			hash: "b".repeat(64),
			mtime_ticks: 7,
		};
		store.upsert("old.tex", &value).unwrap();
		store.rename("old.tex", "{cache}/new.tex", &value).unwrap();

		assert_eq!(
			store.load().unwrap(),
			vec![("{cache}/new.tex".to_string(), value)]
		);
	}
}
