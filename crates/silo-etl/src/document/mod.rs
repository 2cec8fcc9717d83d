//! Document formats and streaming access
//!
//! Two artifact shapes flow through the pipeline:
//!
//! - the **extracted document** produced by the extractor:
//!   `{ "extraction_metadata": {..}?, "<db>": { "<table>": { "record_count": N, "records": [..] } } }`
//! - the **target document** produced by the transform engine:
//!   `{ "etl_timestamp": "..", "tables": { "<t>": { "record_count": N, "data": [..] } } }`
//!
//! Both are plain or gzip-compressed JSON files. Readers in this module never
//! materialize a whole document: they drive `serde` with seeded visitors and
//! hand each record to a sink as it is parsed.

mod extracted;
mod target;
mod writer;

pub use extracted::{scan_extracted, RecordSink};
pub use target::{
    filter_target_tables, load_target_document, read_target_table, scan_target_tables,
    TargetDocument, TargetTable, TargetTableEntry,
};
pub use writer::ArtifactWriter;

use crate::error::{EtlError, Result};
use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// One source or target record: an ordered field map of JSON values.
pub type Record = Map<String, Value>;

/// Top-level key the extractor uses for its metadata block; never routed.
pub const EXTRACTION_METADATA_KEY: &str = "extraction_metadata";

/// Open a document for buffered reading, transparently decompressing `.gz`.
pub fn open_reader(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    if is_gzip(path) {
        Ok(Box::new(BufReader::new(GzDecoder::new(BufReader::new(file)))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub(crate) fn is_gzip(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

/// Most recently modified artifact in `dir` whose file name starts with
/// `prefix` and is a plain or gzipped JSON document.
pub fn find_latest_artifact(dir: &Path, prefix: &str) -> Result<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Err(EtlError::ArtifactNotFound(dir.to_path_buf())),
    };

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(prefix) || !(name.ends_with(".json") || name.ends_with(".json.gz")) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            newest = Some((modified, path));
        }
    }

    newest
        .map(|(_, path)| path)
        .ok_or_else(|| EtlError::ArtifactNotFound(dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_open_reader_plain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, b"{\"a\": 1}").unwrap();

        let mut content = String::new();
        open_reader(&path).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "{\"a\": 1}");
    }

    #[test]
    fn test_is_gzip() {
        assert!(is_gzip(Path::new("x/data.json.gz")));
        assert!(!is_gzip(Path::new("x/data.json")));
    }
}
