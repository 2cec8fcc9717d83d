//! Target-document access
//!
//! Small artifacts are materialized whole via [`load_target_document`]. Large
//! artifacts are handled with the streaming entry points: a structural scan
//! that discovers table names and declared counts, a single-table record
//! stream, and a table filter that writes a reduced artifact for recovery.

use crate::document::{open_reader, ArtifactWriter, Record};
use crate::error::{EtlError, Result};
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Fully materialized target document
#[derive(Debug, Deserialize)]
pub struct TargetDocument {
    #[serde(default)]
    pub etl_timestamp: Option<String>,
    #[serde(default)]
    pub tables: BTreeMap<String, TargetTable>,
}

/// One table's records plus its declared count
#[derive(Debug, Deserialize)]
pub struct TargetTable {
    pub record_count: u64,
    #[serde(default)]
    pub data: Vec<Record>,
}

/// Table name and declared record count from a structural scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTableEntry {
    pub name: String,
    pub record_count: u64,
}

/// Materialize a whole target document, verifying the count invariant.
///
/// A table whose declared `record_count` disagrees with its actual rows is a
/// malformed artifact; a downstream loader must never treat it as valid.
pub fn load_target_document(path: impl AsRef<Path>) -> Result<TargetDocument> {
    let reader = open_reader(path.as_ref())?;
    let doc: TargetDocument = serde_json::from_reader(reader)?;
    for (name, table) in &doc.tables {
        if table.record_count != table.data.len() as u64 {
            return Err(EtlError::MalformedArtifact(format!(
                "table '{}' declares {} records but contains {}",
                name,
                table.record_count,
                table.data.len()
            )));
        }
    }
    Ok(doc)
}

/// Discover table names and declared counts without materializing records.
pub fn scan_target_tables<R: Read>(reader: R) -> Result<Vec<TargetTableEntry>> {
    let mut entries = Vec::new();
    let mut de = serde_json::Deserializer::from_reader(reader);
    TopSeed {
        mode: &mut Mode::Scan {
            entries: &mut entries,
        },
    }
    .deserialize(&mut de)?;
    de.end()?;
    Ok(entries)
}

/// Stream one table's records into `on_record`.
///
/// Returns the table's declared record count, or `None` when the artifact has
/// no such table.
pub fn read_target_table<R, F>(reader: R, table: &str, on_record: F) -> Result<Option<u64>>
where
    R: Read,
    F: FnMut(Record) -> Result<()>,
{
    let mut found = None;
    let mut failure = None;
    let mut on_record = on_record;
    let mut de = serde_json::Deserializer::from_reader(reader);
    let outcome = TopSeed {
        mode: &mut Mode::ReadOne {
            wanted: table,
            found: &mut found,
            sink: &mut on_record,
            failure: &mut failure,
        },
    }
    .deserialize(&mut de)
    .and_then(|()| de.end());

    match outcome {
        Ok(()) => Ok(found),
        Err(parse_err) => match failure.take() {
            Some(sink_err) => Err(sink_err),
            None => Err(EtlError::Serialization(parse_err)),
        },
    }
}

/// Stream the tables named in `keep` into `writer`, preserving declared
/// counts. Returns the total number of records carried over.
pub fn filter_target_tables<R: Read>(
    reader: R,
    keep: &HashSet<String>,
    writer: &mut ArtifactWriter,
) -> Result<u64> {
    let mut total = 0u64;
    let mut failure = None;
    let mut de = serde_json::Deserializer::from_reader(reader);
    let outcome = TopSeed {
        mode: &mut Mode::Filter {
            keep,
            writer,
            total: &mut total,
            failure: &mut failure,
        },
    }
    .deserialize(&mut de)
    .and_then(|()| de.end());

    match outcome {
        Ok(()) => Ok(total),
        Err(parse_err) => match failure.take() {
            Some(sink_err) => Err(sink_err),
            None => Err(EtlError::Serialization(parse_err)),
        },
    }
}

enum Mode<'m> {
    Scan {
        entries: &'m mut Vec<TargetTableEntry>,
    },
    ReadOne {
        wanted: &'m str,
        found: &'m mut Option<u64>,
        sink: &'m mut dyn FnMut(Record) -> Result<()>,
        failure: &'m mut Option<EtlError>,
    },
    Filter {
        keep: &'m HashSet<String>,
        writer: &'m mut ArtifactWriter,
        total: &'m mut u64,
        failure: &'m mut Option<EtlError>,
    },
}

struct TopSeed<'a, 'm> {
    mode: &'a mut Mode<'m>,
}

impl<'de> DeserializeSeed<'de> for TopSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for TopSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a target document object")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> std::result::Result<(), M::Error> {
        let mode = self.mode;
        while let Some(key) = map.next_key::<String>()? {
            if key == "tables" {
                map.next_value_seed(TablesSeed { mode: &mut *mode })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

struct TablesSeed<'a, 'm> {
    mode: &'a mut Mode<'m>,
}

impl<'de> DeserializeSeed<'de> for TablesSeed<'_, '_> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for TablesSeed<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a map of target tables")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> std::result::Result<(), M::Error> {
        let mode = self.mode;
        while let Some(name) = map.next_key::<String>()? {
            match mode {
                Mode::Scan { entries } => {
                    let record_count = map.next_value_seed(TableSkimSeed)?;
                    entries.push(TargetTableEntry { name, record_count });
                },
                Mode::ReadOne {
                    wanted,
                    found,
                    sink,
                    failure,
                } => {
                    if name == *wanted {
                        let count = map.next_value_seed(TableStreamSeed {
                            sink: &mut **sink,
                            failure: &mut **failure,
                        })?;
                        **found = Some(count);
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                },
                Mode::Filter {
                    keep,
                    writer,
                    total,
                    failure,
                } => {
                    if keep.contains(&name) {
                        let count = map.next_value_seed(TableCopySeed {
                            name: &name,
                            writer: &mut **writer,
                            failure: &mut **failure,
                        })?;
                        **total += count;
                    } else {
                        map.next_value::<IgnoredAny>()?;
                    }
                },
            }
        }
        Ok(())
    }
}

/// Reads `record_count`, ignores `data`.
struct TableSkimSeed;

impl<'de> DeserializeSeed<'de> for TableSkimSeed {
    type Value = u64;

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<u64, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for TableSkimSeed {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a target table object")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> std::result::Result<u64, M::Error> {
        let mut record_count = None;
        while let Some(key) = map.next_key::<String>()? {
            if key == "record_count" {
                record_count = Some(map.next_value::<u64>()?);
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        record_count.ok_or_else(|| de::Error::custom("table object missing record_count"))
    }
}

/// Streams `data` records into a sink; `record_count` must precede `data`.
struct TableStreamSeed<'a> {
    sink: &'a mut dyn FnMut(Record) -> Result<()>,
    failure: &'a mut Option<EtlError>,
}

impl<'de> DeserializeSeed<'de> for TableStreamSeed<'_> {
    type Value = u64;

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<u64, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for TableStreamSeed<'_> {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a target table object")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> std::result::Result<u64, M::Error> {
        let mut record_count = None;
        while let Some(key) = map.next_key::<String>()? {
            if key == "record_count" {
                record_count = Some(map.next_value::<u64>()?);
            } else if key == "data" {
                map.next_value_seed(DataSeed {
                    sink: &mut *self.sink,
                    failure: &mut *self.failure,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        record_count.ok_or_else(|| de::Error::custom("table object missing record_count"))
    }
}

struct DataSeed<'a> {
    sink: &'a mut dyn FnMut(Record) -> Result<()>,
    failure: &'a mut Option<EtlError>,
}

impl<'de> DeserializeSeed<'de> for DataSeed<'_> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for DataSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of records")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while let Some(record) = seq.next_element::<Record>()? {
            if let Err(e) = (self.sink)(record) {
                *self.failure = Some(e);
                return Err(de::Error::custom("record sink failed"));
            }
        }
        Ok(())
    }
}

/// Copies a kept table into an [`ArtifactWriter`]. The transform engine
/// always writes `record_count` before `data`, which this copy relies on to
/// emit the header ahead of the first record.
struct TableCopySeed<'a> {
    name: &'a str,
    writer: &'a mut ArtifactWriter,
    failure: &'a mut Option<EtlError>,
}

impl<'de> DeserializeSeed<'de> for TableCopySeed<'_> {
    type Value = u64;

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<u64, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for TableCopySeed<'_> {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a target table object")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> std::result::Result<u64, M::Error> {
        let mut record_count: Option<u64> = None;
        let mut copied = 0u64;
        while let Some(key) = map.next_key::<String>()? {
            if key == "record_count" {
                let count = map.next_value::<u64>()?;
                if let Err(e) = self.writer.begin_table(self.name, count) {
                    *self.failure = Some(e);
                    return Err(de::Error::custom("artifact writer failed"));
                }
                record_count = Some(count);
            } else if key == "data" {
                if record_count.is_none() {
                    return Err(de::Error::custom("data precedes record_count in table object"));
                }
                let mut write = |record: Record| self.writer.write_record(&record);
                map.next_value_seed(DataSeed {
                    sink: &mut write,
                    failure: &mut *self.failure,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }

        let count =
            record_count.ok_or_else(|| de::Error::custom("table object missing record_count"))?;
        if let Err(e) = self.writer.end_table() {
            *self.failure = Some(e);
            return Err(de::Error::custom("artifact writer failed"));
        }
        copied += count;
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "etl_timestamp": "2026-08-04T00:00:00Z",
        "tables": {
            "dim_users": {
                "record_count": 2,
                "data": [{"user_id": 1}, {"user_id": 2}]
            },
            "fct_events": {
                "record_count": 1,
                "data": [{"event_id": 9}]
            }
        }
    }"#;

    #[test]
    fn test_scan_target_tables() {
        let entries = scan_target_tables(DOC.as_bytes()).unwrap();
        assert_eq!(entries, vec![
            TargetTableEntry {
                name: "dim_users".to_string(),
                record_count: 2
            },
            TargetTableEntry {
                name: "fct_events".to_string(),
                record_count: 1
            },
        ]);
    }

    #[test]
    fn test_read_single_table() {
        let mut records = Vec::new();
        let count = read_target_table(DOC.as_bytes(), "dim_users", |r| {
            records.push(r);
            Ok(())
        })
        .unwrap();

        assert_eq!(count, Some(2));
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["user_id"], serde_json::json!(2));
    }

    #[test]
    fn test_read_missing_table_returns_none() {
        let count = read_target_table(DOC.as_bytes(), "dim_ghosts", |_| Ok(())).unwrap();
        assert_eq!(count, None);
    }

    #[test]
    fn test_filter_writes_reduced_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reduced.json");

        let keep: HashSet<String> = ["fct_events".to_string()].into_iter().collect();
        let mut writer = ArtifactWriter::create(&path, None, "2026-08-04T00:00:00Z").unwrap();
        let total = filter_target_tables(DOC.as_bytes(), &keep, &mut writer).unwrap();
        writer.finish().unwrap();

        assert_eq!(total, 1);
        let doc = load_target_document(&path).unwrap();
        assert_eq!(doc.tables.len(), 1);
        assert_eq!(doc.tables["fct_events"].record_count, 1);
    }

    #[test]
    fn test_load_rejects_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{"tables": {"dim_users": {"record_count": 5, "data": [{"user_id": 1}]}}}"#,
        )
        .unwrap();

        let err = load_target_document(&path).unwrap_err();
        assert!(matches!(err, EtlError::MalformedArtifact(_)));
    }
}
