//! Streaming transform engine
//!
//! Converts an extracted document into a target document via the mapping
//! registry and join cache, under a bounded-memory streaming discipline:
//!
//! 1. a lightweight **counting pre-pass** replays only the routing decision
//!    for every record to learn each target table's final record count, and
//! 2. a **writing pass** performs the full transformation and streams records
//!    out table by table, writing each table's header (with its now-known
//!    count) immediately before its first record.
//!
//! A record that fails coercion is logged with its source table and position
//! and dropped; the run continues. An I/O failure on the output artifact is
//! fatal and never leaves a file that looks complete.

mod pool;
mod segment;

use crate::coerce::Coercer;
use crate::config::TransformConfig;
use crate::document::{open_reader, scan_extracted, ArtifactWriter, Record, RecordSink};
use crate::error::Result;
use crate::joincache::JoinCache;
use crate::mapping::{MappingRegistry, ReverseIndex, TableMapping};
use chrono::Utc;
use segment::SegmentWriter;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Log cadence for source-record progress.
const PROGRESS_EVERY: u64 = 10_000;

/// Output of the counting pre-pass: per-target final counts plus which
/// targets receive records from more than one source segment.
#[derive(Debug, Default)]
pub struct TransformPlan {
    pub counts: BTreeMap<String, u64>,
    pub multi_segment: HashSet<String>,
    pub source_records: u64,
}

/// Summary of a finished transformation
#[derive(Debug)]
pub struct TransformOutcome {
    pub artifact: PathBuf,
    pub source_records: u64,
    pub transformed_records: u64,
    pub dropped_records: u64,
    pub per_table: BTreeMap<String, u64>,
}

/// The streaming transform engine. Immutable once constructed; safe to share
/// across transform workers.
pub struct TransformEngine<'a> {
    reverse: ReverseIndex<'a>,
    cache: &'a JoinCache,
    coercer: Coercer<'a>,
    config: &'a TransformConfig,
    etl_timestamp: String,
}

impl<'a> TransformEngine<'a> {
    pub fn new(
        registry: &'a MappingRegistry,
        cache: &'a JoinCache,
        boolean_columns: &'a HashSet<String>,
        config: &'a TransformConfig,
    ) -> Self {
        let reverse = registry.reverse_index();
        debug!(
            source_tables = reverse.source_table_count(),
            targets = registry.len(),
            "Built reverse mapping index"
        );
        Self {
            reverse,
            cache,
            coercer: Coercer::new(boolean_columns),
            config,
            etl_timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Transform the extracted document at `input` into a target document
    /// under `transformed_dir`, named after `job_id`.
    pub fn transform(
        &self,
        input: &Path,
        transformed_dir: &Path,
        job_id: &str,
    ) -> Result<TransformOutcome> {
        let mut file_name = format!("target_data_{}.json", job_id);
        if self.config.compression {
            file_name.push_str(".gz");
        }
        let output = transformed_dir.join(file_name);
        self.transform_to(input, &output)
    }

    /// Transform to an explicit output path.
    pub fn transform_to(&self, input: &Path, output: &Path) -> Result<TransformOutcome> {
        info!(input = %input.display(), "Starting transformation (counting pre-pass)");
        let plan = self.count(input)?;
        let routed: u64 = plan.counts.values().sum();
        info!(
            source_records = plan.source_records,
            targets = plan.counts.len(),
            routed_records = routed,
            "Counting pre-pass complete"
        );

        info!(output = %output.display(), workers = self.config.workers, "Starting writing pass");
        let (artifact, dropped) = if self.config.workers <= 1 {
            self.write_sequential(input, &plan, output)?
        } else {
            pool::write_pooled(self, input, &plan, output)?
        };

        let outcome = TransformOutcome {
            artifact,
            source_records: plan.source_records,
            transformed_records: routed,
            dropped_records: dropped,
            per_table: plan.counts,
        };
        info!(
            artifact = %outcome.artifact.display(),
            records = outcome.transformed_records,
            tables = outcome.per_table.len(),
            dropped = outcome.dropped_records,
            "Transformation complete"
        );
        Ok(outcome)
    }

    /// Counting pre-pass: replay routing for every record, discarding values.
    fn count(&self, input: &Path) -> Result<TransformPlan> {
        let mut sink = CountingSink {
            engine: self,
            plan: TransformPlan::default(),
            segment_counts: HashMap::new(),
            seen_this_segment: HashSet::new(),
            record_in_table: 0,
        };
        scan_extracted(open_reader(input)?, &mut sink)?;

        let mut plan = sink.plan;
        plan.multi_segment = sink
            .segment_counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(t, _)| t)
            .collect();
        Ok(plan)
    }

    fn write_sequential(
        &self,
        input: &Path,
        plan: &TransformPlan,
        output: &Path,
    ) -> Result<(PathBuf, u64)> {
        let writer = ArtifactWriter::create(
            output,
            self.compression_level(),
            &self.etl_timestamp,
        )?;
        let mut sink = WritingSink {
            engine: self,
            seg: SegmentWriter::new(writer, plan),
            dropped: 0,
            record_in_table: 0,
        };
        scan_extracted(open_reader(input)?, &mut sink)?;

        let dropped = sink.dropped;
        let artifact = sink.seg.finish()?;
        Ok((artifact, dropped))
    }

    fn compression_level(&self) -> Option<u32> {
        self.config.compression.then_some(self.config.compression_level)
    }

    /// Routes for one source table; `None` when no mapping exists.
    fn routes_for(&self, source_table: &str) -> Option<&[crate::mapping::Route<'a>]> {
        self.reverse.routes_for(source_table)
    }

    /// Transform one record for one target mapping.
    ///
    /// Returns `Ok(None)` when every mapped column resolved to null; such
    /// records are dropped, not emitted and not counted.
    fn transform_record(
        &self,
        source_table: &str,
        target_table: &str,
        mapping: &TableMapping,
        record: &Record,
    ) -> Result<Option<Record>> {
        let mut out = Record::new();
        let mut any_non_null = false;

        for (target_col, source) in &mapping.column_mappings {
            let resolved: Option<Value> = match &source.table {
                None => record.get(&source.column).cloned(),
                Some(table) if table == source_table => record.get(&source.column).cloned(),
                Some(join_table) => self
                    .cache
                    .resolve(join_table, record)
                    .and_then(|joined| joined.get(&source.column).cloned()),
            };

            match resolved {
                Some(value) if !value.is_null() => {
                    let coerced = self
                        .coercer
                        .coerce(target_table, target_col, value)
                        .map_err(|e| crate::error::EtlError::RecordCoercion {
                            source_table: source_table.to_string(),
                            reason: e.to_string(),
                        })?;
                    if !coerced.is_null() {
                        any_non_null = true;
                    }
                    out.insert(target_col.clone(), coerced);
                },
                _ => {
                    out.insert(target_col.clone(), self.coercer.default_for_missing(target_col));
                },
            }
        }

        if !any_non_null {
            return Ok(None);
        }
        out.insert(
            "etl_timestamp".to_string(),
            Value::String(self.etl_timestamp.clone()),
        );
        Ok(Some(out))
    }
}

/// Replays routing decisions only; transformed values are discarded.
struct CountingSink<'e, 'a> {
    engine: &'e TransformEngine<'a>,
    plan: TransformPlan,
    /// target -> number of source segments that emitted records for it
    segment_counts: HashMap<String, u64>,
    seen_this_segment: HashSet<String>,
    record_in_table: u64,
}

impl RecordSink for CountingSink<'_, '_> {
    fn on_table_start(&mut self, _database: &str, _table: &str) -> Result<()> {
        self.seen_this_segment.clear();
        self.record_in_table = 0;
        Ok(())
    }

    fn on_record(&mut self, _database: &str, table: &str, record: Record) -> Result<()> {
        self.plan.source_records += 1;
        self.record_in_table += 1;
        if self.plan.source_records % PROGRESS_EVERY == 0 {
            info!(records = self.plan.source_records, "Counting pre-pass progress");
        }

        let Some(routes) = self.engine.routes_for(table) else {
            return Ok(());
        };
        for route in routes {
            match self
                .engine
                .transform_record(table, route.target, route.mapping, &record)
            {
                Ok(Some(_)) => {
                    *self.plan.counts.entry(route.target.to_string()).or_insert(0) += 1;
                    if self.seen_this_segment.insert(route.target.to_string()) {
                        *self.segment_counts.entry(route.target.to_string()).or_insert(0) += 1;
                    }
                },
                Ok(None) => {},
                Err(e) => {
                    // The writing pass logs the drop at warn; keep the replay quiet.
                    debug!(
                        source_table = table,
                        record = self.record_in_table,
                        error = %e,
                        "Record dropped during counting pre-pass"
                    );
                },
            }
        }
        Ok(())
    }
}

/// Full transformation streamed into the segment writer.
struct WritingSink<'e, 'a, 'p> {
    engine: &'e TransformEngine<'a>,
    seg: SegmentWriter<'p>,
    dropped: u64,
    record_in_table: u64,
}

impl RecordSink for WritingSink<'_, '_, '_> {
    // Unmapped source tables are skipped at the parser.
    fn wants_table(&self, _database: &str, table: &str) -> bool {
        self.engine.routes_for(table).is_some()
    }

    fn on_table_start(&mut self, _database: &str, _table: &str) -> Result<()> {
        self.record_in_table = 0;
        Ok(())
    }

    fn on_record(&mut self, database: &str, table: &str, record: Record) -> Result<()> {
        self.record_in_table += 1;
        let Some(routes) = self.engine.routes_for(table) else {
            return Ok(());
        };
        for route in routes {
            match self
                .engine
                .transform_record(table, route.target, route.mapping, &record)
            {
                Ok(Some(transformed)) => self.seg.push(route.target, &transformed)?,
                Ok(None) => {},
                Err(e) => {
                    self.dropped += 1;
                    warn!(
                        database,
                        source_table = table,
                        record = self.record_in_table,
                        target = route.target,
                        error = %e,
                        "Record dropped: coercion failed"
                    );
                },
            }
        }
        Ok(())
    }

    fn on_table_end(&mut self, _database: &str, _table: &str) -> Result<()> {
        self.seg.end_segment()
    }
}
