//! Heart Rate Monitor API
//!
//! The capability set every heart rate source exposes to loggers, bridges and UIs.
//! Consumers hold an `Arc<dyn HeartRateMonitor>` and never depend on the transport.
use crate::core::error::HrpError;
use crate::core::events::MonitorEvent;
use crate::model::heartrate::HeartRateSample;
use crate::model::statistics::SessionStatistics;
use async_trait::async_trait;
use tokio::sync::broadcast::Receiver;

/// Sealed set of monitor transports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MonitorKind {
    /// Bluetooth Smart Heart Rate Profile sensor.
    BluetoothHrp,
    /// ANT+ heart rate strap behind a USB receiver.
    AntPlus,
}

/// HeartRateMonitor trait
///
/// Lifecycle, counters and notifications of one heart rate source.
#[async_trait]
pub trait HeartRateMonitor: Send + Sync {
    fn kind(&self) -> MonitorKind;

    /// Human readable transport name.
    fn name(&self) -> &str;

    /// Starts the monitor. A no-op when already started.
    async fn start(&self) -> Result<(), HrpError>;

    /// Stops the monitor and zeroes its statistics. A no-op when already stopped.
    async fn stop(&self);

    /// Stop followed by start.
    async fn reset(&self) -> Result<(), HrpError>;

    /// Releases all resources. Idempotent; the monitor cannot be started afterwards.
    async fn dispose(&self);

    fn running(&self) -> bool;

    fn total_packets(&self) -> u64;
    fn corrupted_packets(&self) -> u64;
    fn heart_beats(&self) -> u64;

    /// The most recently accepted sample of the current run.
    fn last_packet(&self) -> Option<HeartRateSample>;

    fn min_heart_rate(&self) -> Option<u8>;
    fn max_heart_rate(&self) -> Option<u8>;

    fn smoothing_factor(&self) -> usize;

    /// Changes the smoothing window size. Fails with `InvalidOperation` unless stopped.
    fn set_smoothing_factor(&self, factor: usize) -> Result<(), HrpError>;

    fn smoothed_heart_rate(&self) -> f64;

    /// Snapshot of all counters.
    fn statistics(&self) -> SessionStatistics;

    /// Subscribes to the notification stream of this monitor.
    fn subscribe(&self) -> Receiver<MonitorEvent>;
}
