//! Extraction checkpoint
//!
//! Tracks the last successful extraction date for incremental loading, plus
//! the `skip_extraction` flag that lets a failed run resume from its existing
//! extracted artifact instead of re-querying source systems.

use super::write_json_atomic;
use crate::config::ExtractionConfig;
use crate::error::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the extraction checkpoint inside the checkpoint directory.
pub const EXTRACTION_CHECKPOINT_FILE: &str = "extraction_checkpoint.json";

/// Persisted extraction state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionState {
    pub last_extraction_date: Option<NaiveDate>,
    pub last_extraction_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub data_store: String,
    /// Set when extraction succeeded but a later phase failed; the next run
    /// reuses the existing extracted artifact. Cleared on full success.
    #[serde(default)]
    pub skip_extraction: bool,
}

/// Handle on the long-lived extraction checkpoint file
pub struct ExtractionCheckpoint {
    path: PathBuf,
}

impl ExtractionCheckpoint {
    pub fn new(checkpoint_dir: impl AsRef<Path>) -> Self {
        Self {
            path: checkpoint_dir.as_ref().join(EXTRACTION_CHECKPOINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state. Missing or unparsable files are first-run
    /// semantics, never an error.
    pub fn load(&self) -> ExtractionState {
        if !self.path.exists() {
            info!("No extraction checkpoint found - first run");
            return ExtractionState::default();
        }
        match std::fs::read(&self.path)
            .map_err(crate::error::EtlError::from)
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
        {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Extraction checkpoint unreadable; treating as first run"
                );
                ExtractionState::default()
            },
        }
    }

    pub fn save(&self, state: &ExtractionState) -> Result<()> {
        write_json_atomic(&self.path, state)?;
        debug!(path = %self.path.display(), "Extraction checkpoint saved");
        Ok(())
    }

    /// Record a successful extraction. The checkpoint date only ever moves
    /// forward.
    pub fn advance(
        &self,
        extraction_date: NaiveDate,
        environment: &str,
        data_store: &str,
    ) -> Result<ExtractionState> {
        let mut state = self.load();
        if state
            .last_extraction_date
            .map(|previous| extraction_date >= previous)
            .unwrap_or(true)
        {
            state.last_extraction_date = Some(extraction_date);
        }
        state.last_extraction_timestamp = Some(Utc::now());
        state.environment = environment.to_string();
        state.data_store = data_store.to_string();
        self.save(&state)?;
        info!(date = %extraction_date, "Extraction checkpoint advanced");
        Ok(state)
    }

    pub fn set_skip_extraction(&self, skip: bool) -> Result<()> {
        let mut state = self.load();
        if state.skip_extraction != skip {
            state.skip_extraction = skip;
            self.save(&state)?;
            info!(skip_extraction = skip, "Updated skip_extraction flag");
        }
        Ok(())
    }

    /// Recommended start date for the next incremental extraction, in
    /// priority order: checkpoint date, configured default, lookback window
    /// before now.
    pub fn recommended_start_date(&self, config: &ExtractionConfig) -> NaiveDate {
        if let Some(date) = self.load().last_extraction_date {
            return date;
        }
        if let Some(date) = config.default_start_date {
            return date;
        }
        (Utc::now() - Duration::days(config.lookback_days)).date_naive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_missing_checkpoint_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let cp = ExtractionCheckpoint::new(dir.path());
        let state = cp.load();
        assert!(state.last_extraction_date.is_none());
        assert!(!state.skip_extraction);
    }

    #[test]
    fn test_corrupt_checkpoint_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let cp = ExtractionCheckpoint::new(dir.path());
        std::fs::write(cp.path(), b"{not json").unwrap();

        let state = cp.load();
        assert!(state.last_extraction_date.is_none());
    }

    #[test]
    fn test_advance_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let cp = ExtractionCheckpoint::new(dir.path());

        cp.advance(date("2026-08-01"), "local", "sqlite").unwrap();
        let state = cp.load();
        assert_eq!(state.last_extraction_date, Some(date("2026-08-01")));
        assert_eq!(state.environment, "local");
    }

    #[test]
    fn test_checkpoint_date_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let cp = ExtractionCheckpoint::new(dir.path());

        cp.advance(date("2026-08-03"), "local", "sqlite").unwrap();
        cp.advance(date("2026-07-01"), "local", "sqlite").unwrap();

        assert_eq!(cp.load().last_extraction_date, Some(date("2026-08-03")));
    }

    #[test]
    fn test_skip_extraction_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cp = ExtractionCheckpoint::new(dir.path());

        cp.set_skip_extraction(true).unwrap();
        assert!(cp.load().skip_extraction);
        cp.set_skip_extraction(false).unwrap();
        assert!(!cp.load().skip_extraction);
    }

    #[test]
    fn test_recommended_start_date_priority() {
        let dir = tempfile::tempdir().unwrap();
        let cp = ExtractionCheckpoint::new(dir.path());

        // No checkpoint, no default: lookback window before now.
        let config = ExtractionConfig {
            default_start_date: None,
            lookback_days: 30,
        };
        let before = (Utc::now() - Duration::days(30)).date_naive();
        let got = cp.recommended_start_date(&config);
        let after = (Utc::now() - Duration::days(30)).date_naive();
        assert!(got == before || got == after);

        // Configured default wins over the lookback.
        let config = ExtractionConfig {
            default_start_date: Some(date("2026-05-01")),
            lookback_days: 30,
        };
        assert_eq!(cp.recommended_start_date(&config), date("2026-05-01"));

        // Checkpoint date wins over everything.
        cp.advance(date("2026-08-02"), "local", "sqlite").unwrap();
        assert_eq!(cp.recommended_start_date(&config), date("2026-08-02"));
    }
}
