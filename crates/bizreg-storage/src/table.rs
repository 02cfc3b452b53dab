//! Flat CSV tables keyed by a natural key.
//!
//! Each table is loaded whole, upserted in memory and rewritten atomically, so
//! running a stage twice leaves one row per key instead of appending duplicates.
//! The leading `index` column is renumbered in key order on every save.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bizreg_core::{CompanyId, CompanyListing, CompanyRecord, FieldValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("csv on {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

pub trait TableRow: Serialize + DeserializeOwned + Clone + PartialEq {
    type Key: Ord + Clone + fmt::Debug;

    fn key(&self) -> Self::Key;
    fn set_index(&mut self, index: usize);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Keys dropped by `replace_all`.
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct KeyedTable<R: TableRow> {
    path: PathBuf,
    rows: BTreeMap<R::Key, R>,
}

impl<R: TableRow> KeyedTable<R> {
    /// Loads `path`; a missing file is an empty table.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TableError> {
        let path = path.into();
        let mut rows = BTreeMap::new();

        if path.exists() {
            let mut reader = csv::Reader::from_path(&path).map_err(|source| TableError::Csv {
                path: path.clone(),
                source,
            })?;
            for row in reader.deserialize::<R>() {
                let mut row = row.map_err(|source| TableError::Csv {
                    path: path.clone(),
                    source,
                })?;
                row.set_index(0);
                rows.insert(row.key(), row);
            }
            debug!(path = %path.display(), rows = rows.len(), "loaded table");
        }

        Ok(Self { path, rows })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains_key(&self, key: &R::Key) -> bool {
        self.rows.contains_key(key)
    }

    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.rows.get(key)
    }

    /// Rows in key order.
    pub fn rows(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    /// Drops every row; the file is only touched by the next `save`.
    pub fn clear(&mut self) {
        self.rows.clear();
    }

    pub fn upsert(&mut self, mut row: R) -> UpsertStats {
        row.set_index(0);
        let mut stats = UpsertStats::default();
        match self.rows.insert(row.key(), row.clone()) {
            None => stats.inserted += 1,
            Some(previous) if previous == row => stats.unchanged += 1,
            Some(_) => stats.updated += 1,
        }
        stats
    }

    pub fn upsert_all(&mut self, rows: impl IntoIterator<Item = R>) -> UpsertStats {
        rows.into_iter()
            .map(|row| self.upsert(row))
            .fold(UpsertStats::default(), |acc, s| UpsertStats {
                inserted: acc.inserted + s.inserted,
                updated: acc.updated + s.updated,
                unchanged: acc.unchanged + s.unchanged,
                removed: acc.removed + s.removed,
            })
    }

    /// Makes `rows` the whole content of the table. Stats compare against the
    /// previous content; keys absent from `rows` are counted as removed.
    pub fn replace_all(&mut self, rows: impl IntoIterator<Item = R>) -> UpsertStats {
        let previous = std::mem::take(&mut self.rows);
        let mut stats = UpsertStats::default();
        for mut row in rows {
            row.set_index(0);
            let key = row.key();
            match previous.get(&key) {
                None => stats.inserted += 1,
                Some(old) if *old == row => stats.unchanged += 1,
                Some(_) => stats.updated += 1,
            }
            self.rows.insert(key, row);
        }
        stats.removed = previous.keys().filter(|key| !self.rows.contains_key(key)).count();
        stats
    }

    /// Rewrites the whole file through a temp file in the same directory.
    pub fn save(&self) -> Result<(), TableError> {
        let io_err = |source| TableError::Io {
            path: self.path.clone(),
            source,
        };
        let csv_err = |source| TableError::Csv {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(io_err)?;

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let written = (|| -> Result<(), TableError> {
            let mut writer = csv::Writer::from_path(&temp_path).map_err(csv_err)?;
            for (index, row) in self.rows.values().enumerate() {
                let mut row = row.clone();
                row.set_index(index);
                writer.serialize(&row).map_err(csv_err)?;
            }
            writer.flush().map_err(io_err)?;
            drop(writer);
            fs::rename(&temp_path, &self.path).map_err(io_err)
        })();

        if written.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        written?;
        debug!(path = %self.path.display(), rows = self.rows.len(), "saved table");
        Ok(())
    }
}

/// `company_info.csv`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRow {
    pub index: usize,
    pub id: CompanyId,
    pub name: String,
}

impl TableRow for ListingRow {
    type Key = CompanyId;

    fn key(&self) -> CompanyId {
        self.id
    }

    fn set_index(&mut self, index: usize) {
        self.index = index;
    }
}

impl From<CompanyListing> for ListingRow {
    fn from(listing: CompanyListing) -> Self {
        Self {
            index: 0,
            id: listing.id,
            name: listing.name,
        }
    }
}

impl From<ListingRow> for CompanyListing {
    fn from(row: ListingRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
        }
    }
}

/// `owner_agent.csv`, keyed by the detail page URL it was extracted from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailRow {
    pub index: usize,
    pub url: String,
    pub agent: FieldValue,
    pub owner: FieldValue,
}

impl TableRow for DetailRow {
    type Key = String;

    fn key(&self) -> String {
        self.url.clone()
    }

    fn set_index(&mut self, index: usize) {
        self.index = index;
    }
}

/// `company_info_crawled.csv`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRow {
    pub index: usize,
    pub id: CompanyId,
    pub name: String,
    pub agent: FieldValue,
    pub owner: FieldValue,
}

impl TableRow for RecordRow {
    type Key = CompanyId;

    fn key(&self) -> CompanyId {
        self.id
    }

    fn set_index(&mut self, index: usize) {
        self.index = index;
    }
}

impl From<CompanyRecord> for RecordRow {
    fn from(record: CompanyRecord) -> Self {
        Self {
            index: 0,
            id: record.id,
            name: record.name,
            agent: record.agent,
            owner: record.owner,
        }
    }
}

impl From<RecordRow> for CompanyRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            agent: row.agent,
            owner: row.owner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn listing(id: u64, name: &str) -> ListingRow {
        ListingRow::from(CompanyListing {
            id: CompanyId(id),
            name: name.to_string(),
        })
    }

    #[test]
    fn missing_file_opens_empty() {
        let dir = tempdir().unwrap();
        let table = KeyedTable::<ListingRow>::open(dir.path().join("company_info.csv")).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn upserting_twice_keeps_one_row_per_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("company_info.csv");

        for _ in 0..2 {
            let mut table = KeyedTable::<ListingRow>::open(&path).unwrap();
            table.upsert_all([listing(2, "Xylo Inc"), listing(1, "X Corp")]);
            table.save().unwrap();
        }

        let table = KeyedTable::<ListingRow>::open(&path).unwrap();
        assert_eq!(table.len(), 2);
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "index,id,name\n0,1,X Corp\n1,2,Xylo Inc\n");
    }

    #[test]
    fn upsert_reports_inserted_updated_unchanged() {
        let dir = tempdir().unwrap();
        let mut table = KeyedTable::<ListingRow>::open(dir.path().join("t.csv")).unwrap();

        let first = table.upsert_all([listing(1, "X Corp"), listing(2, "Xylo Inc")]);
        assert_eq!(first.inserted, 2);

        let second = table.upsert_all([listing(1, "X Corp"), listing(2, "Xylo Incorporated")]);
        assert_eq!(
            second,
            UpsertStats {
                inserted: 0,
                updated: 1,
                unchanged: 1,
                removed: 0
            }
        );
        assert_eq!(table.get(&CompanyId(2)).unwrap().name, "Xylo Incorporated");
    }

    #[test]
    fn replace_all_drops_keys_missing_from_new_rows() {
        let dir = tempdir().unwrap();
        let mut table = KeyedTable::<ListingRow>::open(dir.path().join("t.csv")).unwrap();
        table.upsert_all([listing(1, "X Corp"), listing(2, "Xylo Inc"), listing(3, "Xenon LLC")]);

        let stats = table.replace_all([listing(1, "X Corp"), listing(3, "Xenon Co"), listing(4, "Xeric")]);
        assert_eq!(
            stats,
            UpsertStats {
                inserted: 1,
                updated: 1,
                unchanged: 1,
                removed: 1
            }
        );
        let ids: Vec<_> = table.rows().map(|row| row.id.0).collect();
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[test]
    fn detail_rows_round_trip_multiline_text_and_sentinel() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("owner_agent.csv");
        let mut table = KeyedTable::<DetailRow>::open(&path).unwrap();
        table.upsert(DetailRow {
            index: 0,
            url: "https://example.test/business/1/false".to_string(),
            agent: FieldValue::Found("Jane Doe\r123 Main St".to_string()),
            owner: FieldValue::Absent,
        });
        table.save().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("not found"));

        let reloaded = KeyedTable::<DetailRow>::open(&path).unwrap();
        let row = reloaded.rows().next().unwrap();
        assert_eq!(row.agent, FieldValue::Found("Jane Doe\r123 Main St".to_string()));
        assert_eq!(row.owner, FieldValue::Absent);
    }

    #[test]
    fn legacy_capitalized_sentinel_loads_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("owner_agent.csv");
        fs::write(
            &path,
            "index,url,agent,owner\n0,https://example.test/business/9/false,Not found,Not Found\n",
        )
        .unwrap();

        let table = KeyedTable::<DetailRow>::open(&path).unwrap();
        let row = table.rows().next().unwrap();
        assert_eq!(row.agent, FieldValue::Absent);
        assert_eq!(row.owner, FieldValue::Absent);
    }
}
