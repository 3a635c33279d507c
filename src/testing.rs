//! Test helpers shared by the logger and bridge tests.
use crate::api::monitor::{HeartRateMonitor, MonitorKind};
use crate::core::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::error::HrpError;
use crate::core::events::MonitorEvent;
use crate::model::heartrate::HeartRateSample;
use crate::model::statistics::{ProcessedPacket, SessionStatistics};
use async_trait::async_trait;
use time::macros::datetime;
use tokio::sync::broadcast::{self, Receiver, Sender};

/// Monitor whose events are injected by the test.
pub(crate) struct StubMonitor {
    pub events: Sender<MonitorEvent>,
    kind: MonitorKind,
}

impl StubMonitor {
    pub fn new() -> Self {
        Self::with_kind(MonitorKind::BluetoothHrp)
    }

    pub fn with_kind(kind: MonitorKind) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { events, kind }
    }

    pub fn emit(&self, event: MonitorEvent) {
        self.events.send(event).expect("no subscriber");
    }
}

#[async_trait]
impl HeartRateMonitor for StubMonitor {
    fn kind(&self) -> MonitorKind {
        self.kind
    }

    fn name(&self) -> &str {
        "stub"
    }

    async fn start(&self) -> Result<(), HrpError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn reset(&self) -> Result<(), HrpError> {
        Ok(())
    }

    async fn dispose(&self) {}

    fn running(&self) -> bool {
        true
    }

    fn total_packets(&self) -> u64 {
        0
    }

    fn corrupted_packets(&self) -> u64 {
        0
    }

    fn heart_beats(&self) -> u64 {
        0
    }

    fn last_packet(&self) -> Option<HeartRateSample> {
        None
    }

    fn min_heart_rate(&self) -> Option<u8> {
        None
    }

    fn max_heart_rate(&self) -> Option<u8> {
        None
    }

    fn smoothing_factor(&self) -> usize {
        1
    }

    fn set_smoothing_factor(&self, _factor: usize) -> Result<(), HrpError> {
        Ok(())
    }

    fn smoothed_heart_rate(&self) -> f64 {
        0.0
    }

    fn statistics(&self) -> SessionStatistics {
        SessionStatistics::default()
    }

    fn subscribe(&self) -> Receiver<MonitorEvent> {
        self.events.subscribe()
    }
}

/// A processed packet at 2024-05-01 10:00:00 UTC.
pub(crate) fn packet(heart_rate: u16, heart_beats: u64, bounds: Option<(u8, u8)>) -> ProcessedPacket {
    ProcessedPacket {
        sample: HeartRateSample {
            heart_rate,
            long_heart_rate: false,
            has_expended_energy: false,
            expended_energy: 0,
            contact_supported: false,
            contact_detected: false,
            rr_intervals: Vec::new(),
            timestamp: datetime!(2024-05-01 10:00:00 UTC),
        },
        statistics: SessionStatistics {
            total_packets: heart_beats + 1,
            corrupted_packets: 0,
            heart_beats,
            min_heart_rate: bounds.map(|(min, _)| min),
            max_heart_rate: bounds.map(|(_, max)| max),
            smoothed_heart_rate: heart_rate as f64,
        },
    }
}
