//! Incremental target-document writer
//!
//! Writes a target document table by table, each table's header (with its
//! final record count) immediately before its first record. The artifact is
//! written to a provisional `.tmp` path and only renamed to its final name on
//! clean completion, so a crash or write failure never leaves behind a file
//! that looks complete. An unfinished writer removes its provisional file on
//! drop.

use crate::document::Record;
use crate::error::{EtlError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

enum Sink {
    Plain(BufWriter<File>),
    Gzip(BufWriter<GzEncoder<File>>),
}

impl Sink {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.write_all(buf),
            Sink::Gzip(w) => w.write_all(buf),
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            Sink::Plain(mut w) => w.flush(),
            Sink::Gzip(w) => {
                let encoder = w.into_inner().map_err(|e| e.into_error())?;
                encoder.finish()?;
                Ok(())
            },
        }
    }
}

/// Streaming writer for target documents
pub struct ArtifactWriter {
    sink: Option<Sink>,
    final_path: PathBuf,
    tmp_path: PathBuf,
    tables_written: u64,
    records_in_table: u64,
    expected_in_table: u64,
    in_table: bool,
    finished: bool,
}

impl ArtifactWriter {
    /// Open a provisional file next to `final_path` and write the document
    /// preamble. `compression_level` of `Some(n)` gzips the output.
    pub fn create(
        final_path: impl AsRef<Path>,
        compression_level: Option<u32>,
        etl_timestamp: &str,
    ) -> Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let mut tmp_os = final_path.clone().into_os_string();
        tmp_os.push(".tmp");
        let tmp_path = PathBuf::from(tmp_os);

        let file = File::create(&tmp_path)
            .map_err(|e| Self::write_error(&final_path, e))?;
        let sink = match compression_level {
            Some(level) => Sink::Gzip(BufWriter::new(GzEncoder::new(file, Compression::new(level)))),
            None => Sink::Plain(BufWriter::new(file)),
        };

        let mut writer = Self {
            sink: Some(sink),
            final_path,
            tmp_path,
            tables_written: 0,
            records_in_table: 0,
            expected_in_table: 0,
            in_table: false,
            finished: false,
        };

        let preamble = format!(
            "{{\n  \"etl_timestamp\": {},\n  \"tables\": {{",
            serde_json::to_string(etl_timestamp)?
        );
        writer.write_bytes(preamble.as_bytes())?;
        Ok(writer)
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Begin a table; `record_count` is the final count for this table and
    /// must match the number of records subsequently written.
    pub fn begin_table(&mut self, name: &str, record_count: u64) -> Result<()> {
        if self.in_table {
            return Err(EtlError::MalformedArtifact(format!(
                "begin_table('{}') while another table is open",
                name
            )));
        }
        let mut header = String::new();
        if self.tables_written > 0 {
            header.push(',');
        }
        header.push_str(&format!(
            "\n    {}: {{\n      \"record_count\": {},\n      \"data\": [",
            serde_json::to_string(name)?,
            record_count
        ));
        self.write_bytes(header.as_bytes())?;
        self.in_table = true;
        self.records_in_table = 0;
        self.expected_in_table = record_count;
        Ok(())
    }

    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        let serialized = serde_json::to_string(record)?;
        self.write_raw_record(&serialized)
    }

    /// Write an already-serialized record (spool replay path).
    pub fn write_raw_record(&mut self, raw: &str) -> Result<()> {
        if !self.in_table {
            return Err(EtlError::MalformedArtifact(
                "write_record outside an open table".into(),
            ));
        }
        let mut line = String::with_capacity(raw.len() + 10);
        if self.records_in_table > 0 {
            line.push(',');
        }
        line.push_str("\n        ");
        line.push_str(raw);
        self.write_bytes(line.as_bytes())?;
        self.records_in_table += 1;
        Ok(())
    }

    /// Close the open table, enforcing the header/record-count invariant.
    pub fn end_table(&mut self) -> Result<()> {
        if !self.in_table {
            return Err(EtlError::MalformedArtifact("end_table with no open table".into()));
        }
        if self.records_in_table != self.expected_in_table {
            return Err(EtlError::MalformedArtifact(format!(
                "table declared {} records but {} were written",
                self.expected_in_table, self.records_in_table
            )));
        }
        self.write_bytes(b"\n      ]\n    }")?;
        self.in_table = false;
        self.tables_written += 1;
        Ok(())
    }

    /// Close the document, flush the sink, and expose the artifact under its
    /// final name. Only after this returns is the artifact considered complete.
    pub fn finish(mut self) -> Result<PathBuf> {
        if self.in_table {
            return Err(EtlError::MalformedArtifact("finish with an open table".into()));
        }
        self.write_bytes(b"\n  }\n}\n")?;

        let sink = self.sink.take().ok_or_else(|| {
            EtlError::MalformedArtifact("writer already finished".into())
        })?;
        sink.finish().map_err(|e| Self::write_error(&self.final_path, e))?;

        std::fs::rename(&self.tmp_path, &self.final_path)
            .map_err(|e| Self::write_error(&self.final_path, e))?;
        self.finished = true;
        Ok(self.final_path.clone())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let sink = self.sink.as_mut().ok_or_else(|| {
            EtlError::MalformedArtifact("writer already finished".into())
        })?;
        sink.write_all(bytes)
            .map_err(|e| Self::write_error(&self.final_path, e))
    }

    fn write_error(path: &Path, source: io::Error) -> EtlError {
        EtlError::OutputWrite {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if !self.finished {
            // Abort path: close the file handle, then discard the provisional
            // artifact so nothing half-written survives under any name.
            self.sink.take();
            if self.tmp_path.exists() {
                if let Err(e) = std::fs::remove_file(&self.tmp_path) {
                    warn!(path = %self.tmp_path.display(), error = %e, "Failed to remove provisional artifact");
                }
            }
        }
    }
}
