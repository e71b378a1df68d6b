//! JSON-lines sink for per-stamp diagnostic records

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

use crate::Result;

pub struct TelemetryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl TelemetryWriter {
    /// Open `path` for appending, creating it if needed.
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!("Writing diagnostics to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub async fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.records += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostics::{EstimateDiagnostic, StampDiagnostic};
    use crate::core::algo::Phase;

    #[tokio::test]
    async fn test_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.jsonl");

        let mut writer = TelemetryWriter::create(&path).await.unwrap();
        for index in 0..3 {
            let record = StampDiagnostic {
                index,
                id: index + 100,
                phase: Phase::Warmup,
                phase_changed: false,
                rtt: 20_000,
                anomalous: false,
                rtt_hat: 20_000,
                rtt_hat_shift: None,
                rollover: None,
                level_shift: None,
                phat: EstimateDiagnostic::skipped(),
                plocal: EstimateDiagnostic::inactive(),
                thetahat: EstimateDiagnostic::skipped(),
                theta_naive: None,
                skew: None,
                causality_clamped: false,
                worst_gap: 0.0,
                gap_relevant: false,
                quality_warning: false,
                published: false,
            };
            writer.write(&record).await.unwrap();
        }
        writer.flush().await.unwrap();
        assert_eq!(writer.records(), 3);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: StampDiagnostic = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last.id, 102);
    }
}
