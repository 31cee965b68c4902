/// Telemetry events sent from file ingestors to the coordinator for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// Ingestion of a file began
    FileStarted,
    /// One batch was successfully appended to the destination table
    BatchUploaded { rows: u64, duration_ms: u64 },
    /// A file reached a terminal outcome
    FileFinished {
        success: bool,
        rows_skipped: u64,
    },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub files_started: usize,
    pub files_finished: usize,
    pub files_failed: usize,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
    pub batch_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::FileStarted => {
                self.files_started += 1;
            }
            TelemetryEvent::BatchUploaded { rows, duration_ms } => {
                self.rows_loaded += rows;
                self.batch_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::FileFinished {
                success,
                rows_skipped,
            } => {
                self.files_finished += 1;
                self.rows_skipped += rows_skipped;
                if !success {
                    self.files_failed += 1;
                }
                // Note: rows_loaded is already counted via BatchUploaded events
            }
        }
    }

    /// Calculate percentile from batch durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.batch_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.batch_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize - 1;
        let index = index.min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
