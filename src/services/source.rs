//! Stamp sources feeding the synchronization service

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::stamp::Stamp;
use crate::testing::simulator::{SimulatorConfig, StampSimulator};
use crate::{Error, Result};

/// Anything that yields stamps in producer order.
///
/// `Ok(None)` means the source is exhausted and the service should stop.
#[async_trait::async_trait]
pub trait StampSource: Send {
    async fn next_stamp(&mut self) -> Result<Option<Stamp>>;

    fn name(&self) -> &str;
}

/// Push-style source: the network layer owns the sender half.
pub struct ChannelStampSource {
    rx: mpsc::Receiver<Stamp>,
}

impl ChannelStampSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Stamp>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait::async_trait]
impl StampSource for ChannelStampSource {
    async fn next_stamp(&mut self) -> Result<Option<Stamp>> {
        Ok(self.rx.recv().await)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Recorded stamps, one JSON object per line. Blank lines and lines starting
/// with `#` are skipped.
pub struct ReplayStampSource {
    path: PathBuf,
    name: String,
    lines: Lines<BufReader<File>>,
    line_number: u64,
}

impl ReplayStampSource {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        debug!("Opened stamp replay file {}", path.display());
        Ok(Self {
            name: format!("replay:{}", path.display()),
            path,
            lines: BufReader::new(file).lines(),
            line_number: 0,
        })
    }
}

#[async_trait::async_trait]
impl StampSource for ReplayStampSource {
    async fn next_stamp(&mut self) -> Result<Option<Stamp>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let stamp = serde_json::from_str(line).map_err(|e| {
                Error::parse(format!(
                    "{}:{}: invalid stamp: {}",
                    self.path.display(),
                    self.line_number,
                    e
                ))
            })?;
            return Ok(Some(stamp));
        }
        Ok(None)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Synthetic stamps, optionally limited to a fixed count.
pub struct SimulatedStampSource {
    simulator: StampSimulator,
    remaining: Option<u64>,
}

impl SimulatedStampSource {
    pub fn new(config: SimulatorConfig, count: Option<u64>) -> Self {
        Self {
            simulator: StampSimulator::new(config),
            remaining: count,
        }
    }

    pub fn simulator(&self) -> &StampSimulator {
        &self.simulator
    }
}

#[async_trait::async_trait]
impl StampSource for SimulatedStampSource {
    async fn next_stamp(&mut self) -> Result<Option<Stamp>> {
        match self.remaining {
            Some(0) => return Ok(None),
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }
        Ok(Some(self.simulator.next_stamp()))
    }

    fn name(&self) -> &str {
        "simulator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_ends_with_senders() {
        let (tx, mut source) = ChannelStampSource::new(4);
        tx.send(Stamp::new(1, 10, 1.0, 1.0, 20)).await.unwrap();
        drop(tx);

        assert_eq!(source.next_stamp().await.unwrap().map(|s| s.id), Some(1));
        assert!(source.next_stamp().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_source_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stamps.jsonl");
        std::fs::write(
            &path,
            "# captured stamps\n\
             {\"id\":1,\"ta\":100,\"tb\":5.0,\"te\":5.00001,\"tf\":140}\n\
             \n\
             {\"id\":2,\"ta\":200,\"tb\":6.0,\"te\":6.00001,\"tf\":240,\"quality_warning\":true}\n",
        )
        .unwrap();

        let mut source = ReplayStampSource::open(&path).await.unwrap();
        let first = source.next_stamp().await.unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert!(!first.quality_warning);
        let second = source.next_stamp().await.unwrap().unwrap();
        assert!(second.quality_warning);
        assert!(source.next_stamp().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_source_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jsonl");
        std::fs::write(&path, "{\"id\":1,\"ta\":100,\"tb\":5.0,\"te\":5.0,\"tf\":140}\n{\"id\":2}\n").unwrap();

        let mut source = ReplayStampSource::open(&path).await.unwrap();
        assert!(source.next_stamp().await.is_ok());
        match source.next_stamp().await {
            Err(Error::Parse(msg)) => assert!(msg.contains(":2:"), "{}", msg),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_simulated_source_count() {
        let mut source = SimulatedStampSource::new(SimulatorConfig::default(), Some(3));
        let mut ids = Vec::new();
        while let Some(stamp) = source.next_stamp().await.unwrap() {
            ids.push(stamp.id);
        }
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(source.simulator().sent(), 3);
    }
}
