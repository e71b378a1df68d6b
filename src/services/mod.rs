//! Services module for the Redfire clock synchronization engine

pub mod source;
pub mod sync;
pub mod telemetry;

pub use source::{ChannelStampSource, ReplayStampSource, SimulatedStampSource, StampSource};
pub use sync::{ServiceStatistics, SyncEvent, SyncService};
pub use telemetry::TelemetryWriter;
