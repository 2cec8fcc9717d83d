//! Segment-aware artifact assembly
//!
//! The writing pass streams source-table segments in document order. Each
//! target table's records all derive from its primary source table, so a
//! target is complete once its segment (or, for tables fed by the same source
//! table across several databases, its last segment) ends. Within a segment
//! the first routed target streams straight into the artifact; fan-out
//! siblings spill to newline-delimited temp files and are appended as whole
//! tables when the segment closes. Targets fed from multiple segments spill
//! for the entire run and are appended at finish.

use crate::document::{ArtifactWriter, Record};
use crate::error::{EtlError, Result};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::debug;

use super::TransformPlan;

/// Newline-delimited spill file for records that cannot stream directly.
pub(super) struct Spool {
    file: BufWriter<std::fs::File>,
    count: u64,
}

impl Spool {
    fn create() -> Result<Self> {
        Ok(Self {
            file: BufWriter::new(tempfile::tempfile()?),
            count: 0,
        })
    }

    fn append(&mut self, record: &Record) -> Result<()> {
        serde_json::to_writer(&mut self.file, record)?;
        self.file.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    fn replay(self, mut emit: impl FnMut(&str) -> Result<()>) -> Result<()> {
        let mut file = self
            .file
            .into_inner()
            .map_err(|e| EtlError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.is_empty() {
                emit(&line)?;
            }
        }
        Ok(())
    }
}

/// Serializing writer fed by the (ordered) transform stream. Owns the
/// artifact; workers never touch it.
pub(super) struct SegmentWriter<'p> {
    writer: ArtifactWriter,
    plan: &'p TransformPlan,
    /// Target currently streaming directly into the artifact.
    direct: Option<String>,
    /// Fan-out siblings of the current segment.
    segment_spools: BTreeMap<String, Spool>,
    /// Targets fed by more than one segment; flushed at finish.
    run_spools: BTreeMap<String, Spool>,
}

impl<'p> SegmentWriter<'p> {
    pub(super) fn new(writer: ArtifactWriter, plan: &'p TransformPlan) -> Self {
        Self {
            writer,
            plan,
            direct: None,
            segment_spools: BTreeMap::new(),
            run_spools: BTreeMap::new(),
        }
    }

    fn declared_count(&self, target: &str) -> u64 {
        self.plan.counts.get(target).copied().unwrap_or(0)
    }

    pub(super) fn push(&mut self, target: &str, record: &Record) -> Result<()> {
        if self.plan.multi_segment.contains(target) {
            return spool_entry(&mut self.run_spools, target)?.append(record);
        }

        match &self.direct {
            Some(open) if open == target => self.writer.write_record(record),
            Some(_) => spool_entry(&mut self.segment_spools, target)?.append(record),
            None => {
                self.writer.begin_table(target, self.declared_count(target))?;
                self.direct = Some(target.to_string());
                self.writer.write_record(record)
            },
        }
    }

    /// Close the current segment: finish the direct-stream table and append
    /// any fan-out spools as complete tables.
    pub(super) fn end_segment(&mut self) -> Result<()> {
        if self.direct.take().is_some() {
            self.writer.end_table()?;
        }
        let spools = std::mem::take(&mut self.segment_spools);
        for (target, spool) in spools {
            self.flush_spool(&target, spool)?;
        }
        Ok(())
    }

    fn flush_spool(&mut self, target: &str, spool: Spool) -> Result<()> {
        let spooled = spool.count;
        self.writer.begin_table(target, self.declared_count(target))?;
        spool.replay(|line| self.writer.write_raw_record(line))?;
        self.writer.end_table()?;
        debug!(target, records = spooled, "Flushed spool into artifact");
        Ok(())
    }

    /// Flush run-scoped spools and expose the finished artifact.
    pub(super) fn finish(mut self) -> Result<PathBuf> {
        self.end_segment()?;
        let spools = std::mem::take(&mut self.run_spools);
        for (target, spool) in spools {
            self.flush_spool(&target, spool)?;
        }
        self.writer.finish()
    }
}

fn spool_entry<'m>(spools: &'m mut BTreeMap<String, Spool>, target: &str) -> Result<&'m mut Spool> {
    Ok(match spools.entry(target.to_string()) {
        Entry::Occupied(e) => e.into_mut(),
        Entry::Vacant(v) => v.insert(Spool::create()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::load_target_document;
    use serde_json::json;

    fn record(pairs: &[(&str, serde_json::Value)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn plan(counts: &[(&str, u64)], multi: &[&str]) -> TransformPlan {
        TransformPlan {
            counts: counts.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            multi_segment: multi.iter().map(|s| s.to_string()).collect(),
            source_records: 0,
        }
    }

    #[test]
    fn test_fan_out_within_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let plan = plan(&[("dim_users", 2), ("dim_contacts", 2)], &[]);
        let writer = ArtifactWriter::create(&path, None, "2026-08-04T00:00:00Z").unwrap();
        let mut seg = SegmentWriter::new(writer, &plan);

        // interleaved fan-out from one source segment
        seg.push("dim_users", &record(&[("user_id", json!(1))])).unwrap();
        seg.push("dim_contacts", &record(&[("contact_id", json!(1))])).unwrap();
        seg.push("dim_users", &record(&[("user_id", json!(2))])).unwrap();
        seg.push("dim_contacts", &record(&[("contact_id", json!(2))])).unwrap();
        seg.end_segment().unwrap();
        seg.finish().unwrap();

        let doc = load_target_document(&path).unwrap();
        assert_eq!(doc.tables["dim_users"].data.len(), 2);
        assert_eq!(doc.tables["dim_contacts"].data.len(), 2);
        assert_eq!(doc.tables["dim_contacts"].data[1]["contact_id"], json!(2));
    }

    #[test]
    fn test_multi_segment_target_flushes_at_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let plan = plan(&[("dim_users", 2), ("fct_events", 1)], &["dim_users"]);
        let writer = ArtifactWriter::create(&path, None, "2026-08-04T00:00:00Z").unwrap();
        let mut seg = SegmentWriter::new(writer, &plan);

        // dim_users fed from two tenant databases, fct_events from one
        seg.push("dim_users", &record(&[("user_id", json!(1))])).unwrap();
        seg.end_segment().unwrap();
        seg.push("fct_events", &record(&[("event_id", json!(7))])).unwrap();
        seg.end_segment().unwrap();
        seg.push("dim_users", &record(&[("user_id", json!(2))])).unwrap();
        seg.end_segment().unwrap();
        seg.finish().unwrap();

        let doc = load_target_document(&path).unwrap();
        assert_eq!(doc.tables["dim_users"].record_count, 2);
        assert_eq!(doc.tables["dim_users"].data[1]["user_id"], json!(2));
        assert_eq!(doc.tables["fct_events"].data.len(), 1);
    }
}
