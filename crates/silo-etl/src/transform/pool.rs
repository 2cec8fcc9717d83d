//! Parallel writing pass
//!
//! Parallelism is scoped to transforming independent record batches: a feeder
//! thread streams the source document and cuts batches at source-table
//! boundaries, a small worker pool transforms them, and the calling thread
//! remains the single serializing writer, reassembling batch results in
//! submission order before they reach the artifact. Workers never write to
//! the output file.

use crate::document::{open_reader, scan_extracted, ArtifactWriter, Record, RecordSink};
use crate::error::{EtlError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tracing::{debug, warn};

use super::segment::SegmentWriter;
use super::{TransformEngine, TransformPlan};

/// Channel depth per worker; bounds in-flight memory.
const CHANNEL_DEPTH_PER_WORKER: usize = 2;

/// One batch of source records, cut at a segment boundary.
struct Batch {
    seq: u64,
    segment: u64,
    source_table: String,
    records: Vec<Record>,
}

/// Transformed rows for one batch, tagged with the target-table index.
struct BatchRows {
    seq: u64,
    segment: u64,
    rows: Vec<(u32, Record)>,
    dropped: u64,
}

pub(super) fn write_pooled(
    engine: &TransformEngine<'_>,
    input: &Path,
    plan: &TransformPlan,
    output: &Path,
) -> Result<(PathBuf, u64)> {
    // Stable target order lets workers tag rows with a compact index.
    let targets: Vec<String> = plan.counts.keys().cloned().collect();
    let target_index: BTreeMap<String, u32> = targets
        .iter()
        .enumerate()
        .map(|(i, t)| (t.clone(), i as u32))
        .collect();
    let worker_count = engine.config.workers;
    let depth = worker_count * CHANNEL_DEPTH_PER_WORKER;
    let batch_size = engine.config.batch_size;

    thread::scope(|scope| -> Result<(PathBuf, u64)> {
        let (batch_tx, batch_rx) = mpsc::sync_channel::<Batch>(depth);
        let batch_rx = Arc::new(Mutex::new(batch_rx));
        let (rows_tx, rows_rx) = mpsc::sync_channel::<BatchRows>(depth);

        let feeder = scope.spawn(move || -> Result<()> {
            let mut sink = FeedingSink {
                engine,
                tx: batch_tx,
                pending: Vec::new(),
                seq: 0,
                segment: 0,
                batch_size,
                current_table: String::new(),
            };
            scan_extracted(open_reader(input)?, &mut sink)
        });

        for worker_id in 0..worker_count {
            let rx = Arc::clone(&batch_rx);
            let tx = rows_tx.clone();
            let index = &target_index;
            scope.spawn(move || run_worker(engine, index, worker_id, rx, tx));
        }
        drop(rows_tx);

        // This thread is the single serializing writer.
        let writer =
            ArtifactWriter::create(output, engine.compression_level(), &engine.etl_timestamp)?;
        let mut seg = SegmentWriter::new(writer, plan);
        let mut dropped = 0u64;
        let mut pending: BTreeMap<u64, BatchRows> = BTreeMap::new();
        let mut next_seq = 0u64;
        let mut current_segment: Option<u64> = None;

        while let Ok(batch) = rows_rx.recv() {
            pending.insert(batch.seq, batch);
            while let Some(batch) = pending.remove(&next_seq) {
                apply_batch(&mut seg, &mut current_segment, &mut dropped, &targets, batch)?;
                next_seq += 1;
            }
        }
        for (_, batch) in std::mem::take(&mut pending) {
            apply_batch(&mut seg, &mut current_segment, &mut dropped, &targets, batch)?;
        }

        feeder
            .join()
            .map_err(|_| EtlError::MalformedArtifact("transform feeder thread panicked".into()))??;

        let artifact = seg.finish()?;
        Ok((artifact, dropped))
    })
}

fn apply_batch(
    seg: &mut SegmentWriter<'_>,
    current_segment: &mut Option<u64>,
    dropped: &mut u64,
    targets: &[String],
    batch: BatchRows,
) -> Result<()> {
    if current_segment.is_some() && *current_segment != Some(batch.segment) {
        seg.end_segment()?;
    }
    *current_segment = Some(batch.segment);
    *dropped += batch.dropped;
    for (idx, record) in &batch.rows {
        let target = targets
            .get(*idx as usize)
            .ok_or_else(|| EtlError::MalformedArtifact("unknown target index in batch".into()))?;
        seg.push(target, record)?;
    }
    Ok(())
}

/// Streams the source document into bounded batches that never span a
/// source-table segment. Unmapped tables are skipped at the source.
struct FeedingSink<'e, 'a> {
    engine: &'e TransformEngine<'a>,
    tx: SyncSender<Batch>,
    pending: Vec<Record>,
    seq: u64,
    segment: u64,
    batch_size: usize,
    current_table: String,
}

impl FeedingSink<'_, '_> {
    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = Batch {
            seq: self.seq,
            segment: self.segment,
            source_table: self.current_table.clone(),
            records: std::mem::take(&mut self.pending),
        };
        self.seq += 1;
        self.tx
            .send(batch)
            .map_err(|_| EtlError::MalformedArtifact("transform pool shut down early".into()))
    }
}

impl RecordSink for FeedingSink<'_, '_> {
    // Unmapped source tables are skipped at the parser.
    fn wants_table(&self, _database: &str, table: &str) -> bool {
        self.engine.routes_for(table).is_some()
    }

    fn on_table_start(&mut self, _database: &str, table: &str) -> Result<()> {
        self.segment += 1;
        self.current_table = table.to_string();
        Ok(())
    }

    fn on_record(&mut self, _database: &str, _table: &str, record: Record) -> Result<()> {
        self.pending.push(record);
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn on_table_end(&mut self, _database: &str, _table: &str) -> Result<()> {
        self.flush()
    }
}

fn run_worker(
    engine: &TransformEngine<'_>,
    target_index: &BTreeMap<String, u32>,
    worker_id: usize,
    rx: Arc<Mutex<Receiver<Batch>>>,
    tx: SyncSender<BatchRows>,
) {
    let mut processed = 0u64;
    loop {
        let batch = {
            let guard = rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.recv()
        };
        let Ok(batch) = batch else {
            break;
        };

        let mut rows = Vec::new();
        let mut dropped = 0u64;
        if let Some(routes) = engine.routes_for(&batch.source_table) {
            for record in &batch.records {
                for route in routes {
                    match engine.transform_record(
                        &batch.source_table,
                        route.target,
                        route.mapping,
                        record,
                    ) {
                        Ok(Some(transformed)) => {
                            if let Some(idx) = target_index.get(route.target) {
                                rows.push((*idx, transformed));
                            }
                        },
                        Ok(None) => {},
                        Err(e) => {
                            dropped += 1;
                            warn!(
                                source_table = %batch.source_table,
                                target = route.target,
                                error = %e,
                                "Record dropped: coercion failed"
                            );
                        },
                    }
                }
            }
        }

        processed += batch.records.len() as u64;
        let out = BatchRows {
            seq: batch.seq,
            segment: batch.segment,
            rows,
            dropped,
        };
        if tx.send(out).is_err() {
            // Writer went away; shut down quietly.
            break;
        }
    }
    debug!(worker_id, records = processed, "Transform worker finished");
}
