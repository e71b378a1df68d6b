//! Clock Synchronization Service
//!
//! Async boundary around the estimation core:
//! - a single task drives [`AlgoState`] from a [`StampSource`]
//! - published [`ClockParameters`] are shared behind an `RwLock` for readers
//! - phase changes, rollovers, level shifts and sanity rejections are
//!   reported as [`SyncEvent`]s
//! - per-stamp diagnostics optionally go to a JSON-lines telemetry file

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::core::algo::{AlgoState, AlgoStatistics, Phase, StampOutcome};
use crate::core::diagnostics::{Estimator, StampDiagnostic};
use crate::core::history::Rollover;
use crate::core::params::ClockParameters;
use crate::core::shift::LevelShift;
use crate::core::stamp::Stamp;
use crate::services::source::StampSource;
use crate::services::telemetry::TelemetryWriter;
use crate::{Error, Result};

/// Synchronization events
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PhaseChanged {
        index: u64,
        phase: Phase,
    },
    ParametersUpdated {
        parameters: ClockParameters,
    },
    SanityRejected {
        index: u64,
        estimator: Estimator,
    },
    LevelShift {
        shift: LevelShift,
    },
    Rollover {
        rollover: Rollover,
    },
    Reinitialized {
        reason: String,
    },
    Diagnostic {
        diagnostic: Box<StampDiagnostic>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatistics {
    pub peer_name: String,
    pub phase: Phase,
    pub algo: AlgoStatistics,
    /// Stamps refused for breaking producer ordering
    pub stamps_rejected: u64,
    pub reinitializations: u64,
    /// Diagnostic records that could not be written
    pub telemetry_errors: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Single-writer owner of the synchronization state.
pub struct SyncService {
    config: Arc<RwLock<SyncConfig>>,
    state: Arc<Mutex<AlgoState>>,
    clock: Arc<RwLock<Option<ClockParameters>>>,
    stats: Arc<RwLock<ServiceStatistics>>,
    telemetry: Arc<Mutex<Option<TelemetryWriter>>>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncService {
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let state = AlgoState::new(&config)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats = ServiceStatistics {
            peer_name: config.general.peer_name.clone(),
            phase: state.phase(),
            algo: AlgoStatistics::default(),
            stamps_rejected: 0,
            reinitializations: 0,
            telemetry_errors: 0,
            started_at: None,
            last_update: None,
        };

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            state: Arc::new(Mutex::new(state)),
            clock: Arc::new(RwLock::new(None)),
            stats: Arc::new(RwLock::new(stats)),
            telemetry: Arc::new(Mutex::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Shared handle to the latest published parameters.
    pub fn clock_handle(&self) -> Arc<RwLock<Option<ClockParameters>>> {
        Arc::clone(&self.clock)
    }

    pub async fn parameters(&self) -> Option<ClockParameters> {
        self.clock.read().await.clone()
    }

    /// Latest parameters, refused when older than `stale_after` at `counter`.
    pub async fn fresh_parameters(&self, counter: u64) -> Result<ClockParameters> {
        let stale_after = self.config.read().await.service.stale_after;
        let params = self
            .clock
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::invalid_state("no clock parameters published yet"))?;
        params.check_fresh(counter, stale_after)?;
        Ok(params)
    }

    /// Open the telemetry sink and mark the service as started.
    pub async fn start(&self) -> Result<()> {
        let mut stats = self.stats.write().await;
        if stats.started_at.is_some() {
            return Ok(());
        }

        let config = self.config.read().await;
        if let Some(path) = &config.service.telemetry_file {
            *self.telemetry.lock().await = Some(TelemetryWriter::create(path).await?);
        }
        info!(
            peer = %config.general.peer_name,
            warmup_win = config.windows.warmup_win,
            history_win = config.windows.history_win,
            "Starting clock synchronization service"
        );
        stats.started_at = Some(Utc::now());
        Ok(())
    }

    /// Drive the engine until the source is exhausted or [`stop`](Self::stop)
    /// is called. Returns the number of stamps processed.
    pub async fn run<S: StampSource + ?Sized>(&self, source: &mut S) -> Result<u64> {
        self.start().await?;
        info!("Reading stamps from {}", source.name());

        let mut shutdown = self.shutdown_rx.clone();
        let mut processed = 0;
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let next = tokio::select! {
                stamp = source.next_stamp() => stamp?,
                _ = shutdown.changed() => break,
            };
            let Some(stamp) = next else {
                break;
            };

            match self.process(stamp).await {
                Ok(_) => processed += 1,
                Err(Error::InvalidInput(msg)) => warn!("Dropping stamp: {}", msg),
                Err(e) => return Err(e),
            }
        }

        self.flush_telemetry().await;
        info!(processed, "Stamp source finished");
        Ok(processed)
    }

    /// Push one stamp through the engine.
    pub async fn process(&self, stamp: Stamp) -> Result<StampOutcome> {
        // The engine guard is held until the outcome is visible to readers, so
        // a concurrent reconfigure never sees parameters from the old run.
        let outcome = {
            let mut state = self.state.lock().await;
            let outcome = match state.process_stamp(&stamp) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.stats.write().await.stamps_rejected += 1;
                    return Err(e);
                }
            };
            if let Some(params) = &outcome.published {
                *self.clock.write().await = Some(params.clone());
            }

            let mut stats = self.stats.write().await;
            stats.phase = outcome.diagnostic.phase;
            stats.algo = state.statistics().clone();
            if outcome.published.is_some() {
                stats.last_update = Some(Utc::now());
            }
            outcome
        };
        let diagnostic = &outcome.diagnostic;

        if diagnostic.phase_changed {
            let _ = self.event_tx.send(SyncEvent::PhaseChanged {
                index: diagnostic.index,
                phase: diagnostic.phase,
            });
        }
        if let Some(rollover) = diagnostic.rollover {
            debug!(index = rollover.index, kind = ?rollover.kind, "history rollover");
            let _ = self.event_tx.send(SyncEvent::Rollover { rollover });
        }
        if let Some(shift) = diagnostic.level_shift {
            warn!(
                index = shift.index,
                from_index = shift.from_index,
                old_rtt_hat = shift.old_rtt_hat,
                new_rtt_hat = shift.new_rtt_hat,
                "Upward level shift detected"
            );
            let _ = self.event_tx.send(SyncEvent::LevelShift { shift });
        }
        for estimator in diagnostic.sanity_failures() {
            warn!(index = diagnostic.index, %estimator, "Sanity check rejected estimate");
            let _ = self.event_tx.send(SyncEvent::SanityRejected {
                index: diagnostic.index,
                estimator,
            });
        }
        if let Some(params) = &outcome.published {
            let _ = self.event_tx.send(SyncEvent::ParametersUpdated {
                parameters: params.clone(),
            });
        }

        let written = match self.telemetry.lock().await.as_mut() {
            Some(writer) => writer.write(diagnostic).await,
            None => Ok(()),
        };
        if let Err(e) = written {
            warn!(index = diagnostic.index, "Failed to write diagnostic record: {}", e);
            self.stats.write().await.telemetry_errors += 1;
        }
        if self.config.read().await.service.emit_diagnostics {
            let _ = self.event_tx.send(SyncEvent::Diagnostic {
                diagnostic: Box::new(diagnostic.clone()),
            });
        }

        Ok(outcome)
    }

    /// Controlled reinitialization: new windows or constants, back to WARMUP.
    /// Published parameters are withdrawn until the new run publishes.
    pub async fn reconfigure(&self, config: SyncConfig) -> Result<()> {
        config.validate()?;
        {
            let mut state = self.state.lock().await;
            state.reinitialize(&config)?;
            *self.clock.write().await = None;

            let mut stats = self.stats.write().await;
            stats.peer_name = config.general.peer_name.clone();
            stats.phase = Phase::Warmup;
            stats.algo = AlgoStatistics::default();
            stats.reinitializations += 1;
        }
        *self.config.write().await = config;

        let _ = self.event_tx.send(SyncEvent::Reinitialized {
            reason: "configuration changed".to_string(),
        });
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<String> {
        self.state.lock().await.snapshot()
    }

    /// Resume from a snapshot taken with the current configuration.
    pub async fn restore(&self, snapshot: &str) -> Result<()> {
        let config = self.config.read().await.clone();
        let restored = AlgoState::from_snapshot(snapshot, &config)?;
        info!(index = restored.index(), phase = ?restored.phase(), "Restored synchronization state");

        let mut state = self.state.lock().await;
        *self.clock.write().await = restored.parameters().cloned();
        {
            let mut stats = self.stats.write().await;
            stats.phase = restored.phase();
            stats.algo = restored.statistics().clone();
        }
        *state = restored;
        Ok(())
    }

    /// Stop a running [`run`](Self::run) loop.
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping clock synchronization service");
        let _ = self.shutdown_tx.send(true);
        self.flush_telemetry().await;
        Ok(())
    }

    pub async fn statistics(&self) -> ServiceStatistics {
        self.stats.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_rx.borrow()
    }

    async fn flush_telemetry(&self) {
        if let Some(writer) = self.telemetry.lock().await.as_mut() {
            if let Err(e) = writer.flush().await {
                warn!("Failed to flush {}: {}", writer.path().display(), e);
                self.stats.write().await.telemetry_errors += 1;
            }
        }
    }
}

impl Clone for SyncService {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            stats: Arc::clone(&self.stats),
            telemetry: Arc::clone(&self.telemetry),
            event_tx: self.event_tx.clone(),
            event_rx: None, // Don't clone receiver
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            shutdown_rx: self.shutdown_rx.clone(),
        }
    }
}
