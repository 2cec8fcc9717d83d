//! Streaming scan of extracted documents
//!
//! Drives `serde_json` with seeded visitors so that only one record is ever
//! materialized at a time, regardless of document size. Records are handed to
//! a [`RecordSink`] in the document's natural (database, table, record) order,
//! with table start/end hooks for sinks that track segment boundaries.

use crate::document::{Record, EXTRACTION_METADATA_KEY};
use crate::error::{EtlError, Result};
use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use std::fmt;
use std::io::Read;

/// Sink invoked for every record (and table boundary) during a scan.
pub trait RecordSink {
    fn on_record(&mut self, database: &str, table: &str, record: Record) -> Result<()>;

    /// Tables the sink declines are skipped wholesale: their records are
    /// never materialized and no boundary hooks fire for them.
    fn wants_table(&self, _database: &str, _table: &str) -> bool {
        true
    }

    fn on_table_start(&mut self, _database: &str, _table: &str) -> Result<()> {
        Ok(())
    }

    fn on_table_end(&mut self, _database: &str, _table: &str) -> Result<()> {
        Ok(())
    }
}

/// Stream an extracted document into `sink`, one record at a time.
///
/// The `extraction_metadata` block is skipped without being built in memory.
pub fn scan_extracted<R: Read, S: RecordSink>(reader: R, sink: &mut S) -> Result<()> {
    let mut state = ScanState {
        sink,
        failure: None,
    };
    let mut de = serde_json::Deserializer::from_reader(reader);
    let outcome = DocumentSeed { state: &mut state }
        .deserialize(&mut de)
        .and_then(|()| de.end());

    match outcome {
        Ok(()) => Ok(()),
        // A sink failure aborts the parse with a placeholder serde error;
        // surface the original error instead.
        Err(parse_err) => match state.failure.take() {
            Some(sink_err) => Err(sink_err),
            None => Err(EtlError::Serialization(parse_err)),
        },
    }
}

struct ScanState<'s, S: RecordSink> {
    sink: &'s mut S,
    failure: Option<EtlError>,
}

impl<S: RecordSink> ScanState<'_, S> {
    fn stash<T, E: de::Error>(&mut self, result: Result<T>) -> std::result::Result<T, E> {
        result.map_err(|e| {
            self.failure = Some(e);
            E::custom("record sink failed")
        })
    }
}

struct DocumentSeed<'a, 's, S: RecordSink> {
    state: &'a mut ScanState<'s, S>,
}

impl<'de, S: RecordSink> DeserializeSeed<'de> for DocumentSeed<'_, '_, S> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, S: RecordSink> Visitor<'de> for DocumentSeed<'_, '_, S> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an extracted document object")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> std::result::Result<(), M::Error> {
        let state = self.state;
        while let Some(key) = map.next_key::<String>()? {
            if key == EXTRACTION_METADATA_KEY {
                map.next_value::<IgnoredAny>()?;
            } else {
                map.next_value_seed(DatabaseSeed {
                    state: &mut *state,
                    database: &key,
                })?;
            }
        }
        Ok(())
    }
}

struct DatabaseSeed<'a, 's, S: RecordSink> {
    state: &'a mut ScanState<'s, S>,
    database: &'a str,
}

impl<'de, S: RecordSink> DeserializeSeed<'de> for DatabaseSeed<'_, '_, S> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, S: RecordSink> Visitor<'de> for DatabaseSeed<'_, '_, S> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a database object keyed by table name")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> std::result::Result<(), M::Error> {
        let state = self.state;
        while let Some(table) = map.next_key::<String>()? {
            if state.sink.wants_table(self.database, &table) {
                map.next_value_seed(TableSeed {
                    state: &mut *state,
                    database: self.database,
                    table: &table,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

struct TableSeed<'a, 's, S: RecordSink> {
    state: &'a mut ScanState<'s, S>,
    database: &'a str,
    table: &'a str,
}

impl<'de, S: RecordSink> DeserializeSeed<'de> for TableSeed<'_, '_, S> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de, S: RecordSink> Visitor<'de> for TableSeed<'_, '_, S> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a table object with record_count and records")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> std::result::Result<(), M::Error> {
        let state = self.state;
        let start = state.sink.on_table_start(self.database, self.table);
        state.stash(start)?;

        while let Some(key) = map.next_key::<String>()? {
            if key == "records" {
                map.next_value_seed(RecordsSeed {
                    state: &mut *state,
                    database: self.database,
                    table: self.table,
                })?;
            } else {
                // record_count and any future metadata keys
                map.next_value::<IgnoredAny>()?;
            }
        }

        let end = state.sink.on_table_end(self.database, self.table);
        state.stash(end)?;
        Ok(())
    }
}

struct RecordsSeed<'a, 's, S: RecordSink> {
    state: &'a mut ScanState<'s, S>,
    database: &'a str,
    table: &'a str,
}

impl<'de, S: RecordSink> DeserializeSeed<'de> for RecordsSeed<'_, '_, S> {
    type Value = ();

    fn deserialize<D: de::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, S: RecordSink> Visitor<'de> for RecordsSeed<'_, '_, S> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an array of records")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        let state = self.state;
        while let Some(record) = seq.next_element::<Record>()? {
            let emitted = state.sink.on_record(self.database, self.table, record);
            state.stash(emitted)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectingSink {
        records: Vec<(String, String, Record)>,
        boundaries: Vec<String>,
    }

    impl RecordSink for CollectingSink {
        fn on_record(&mut self, database: &str, table: &str, record: Record) -> Result<()> {
            self.records.push((database.to_string(), table.to_string(), record));
            Ok(())
        }

        fn on_table_start(&mut self, _database: &str, table: &str) -> Result<()> {
            self.boundaries.push(format!("start:{}", table));
            Ok(())
        }

        fn on_table_end(&mut self, _database: &str, table: &str) -> Result<()> {
            self.boundaries.push(format!("end:{}", table));
            Ok(())
        }
    }

    const DOC: &str = r#"{
        "extraction_metadata": {"window": {"start": "2026-01-01"}, "totals": 3},
        "identity": {
            "users": {
                "record_count": 2,
                "records": [
                    {"id": 1, "email": "a@example.com"},
                    {"id": 2, "email": "b@example.com"}
                ]
            },
            "user_settings": {
                "record_count": 1,
                "records": [{"user_id": 1, "digest_enabled": 1}]
            }
        }
    }"#;

    #[test]
    fn test_scan_streams_in_document_order() {
        let mut sink = CollectingSink::default();
        scan_extracted(DOC.as_bytes(), &mut sink).unwrap();

        assert_eq!(sink.records.len(), 3);
        assert_eq!(sink.records[0].1, "users");
        assert_eq!(sink.records[2].1, "user_settings");
        assert_eq!(sink.records[0].2["id"], serde_json::json!(1));
        assert_eq!(
            sink.boundaries,
            vec!["start:users", "end:users", "start:user_settings", "end:user_settings"]
        );
    }

    #[test]
    fn test_scan_ignores_extraction_metadata() {
        let mut sink = CollectingSink::default();
        scan_extracted(DOC.as_bytes(), &mut sink).unwrap();
        assert!(sink.records.iter().all(|(db, _, _)| db == "identity"));
    }

    #[test]
    fn test_sink_error_propagates() {
        struct FailingSink;
        impl RecordSink for FailingSink {
            fn on_record(&mut self, _: &str, _: &str, _: Record) -> Result<()> {
                Err(EtlError::Config("boom".into()))
            }
        }

        let err = scan_extracted(DOC.as_bytes(), &mut FailingSink).unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
    }

    #[test]
    fn test_malformed_document_is_a_serialization_error() {
        let mut sink = CollectingSink::default();
        let err = scan_extracted(&b"{\"identity\": {\"users\": ["[..], &mut sink).unwrap_err();
        assert!(matches!(err, EtlError::Serialization(_)));
    }
}
