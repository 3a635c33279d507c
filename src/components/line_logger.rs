//! Line Logger
//!
//! Generic logger writing one delimited text line per processed packet to a `LineSink`.
//! The UDP and CSV loggers are realizations over different sinks.
//!
//! Line layout: `packetIndex;timestamp;heartBeats;heartRate;minHeartRate;maxHeartRate`
//! followed by the platform line ending. Absent bounds render as empty fields.
use crate::api::logger::HrmLogger;
use crate::api::monitor::{HeartRateMonitor, MonitorKind};
use crate::core::constants::{DEFAULT_LOGGER_DELIMITER, EVENT_CHANNEL_CAPACITY, LINE_ENDING};
use crate::core::error::HrpError;
use crate::core::events::{LoggerEvent, MonitorEvent};
use crate::model::statistics::ProcessedPacket;
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tokio::sync::broadcast::{self, error::RecvError, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Monitor kinds a line logger binds to.
const SUPPORTED_KINDS: &[MonitorKind] = &[MonitorKind::BluetoothHrp];

/// Transport of a line logger.
#[async_trait]
pub trait LineSink: Send + 'static {
    /// Acquires the transport for one logging run.
    async fn open(&mut self) -> Result<()>;

    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Releases the transport. Safe to call when not open.
    async fn close(&mut self) -> Result<()>;
}

/// Formats one packet as a delimited line.
pub fn format_line(packet_index: u64, packet: &ProcessedPacket, delimiter: &str) -> String {
    let bound = |value: Option<u8>| value.map(|v| v.to_string()).unwrap_or_default();
    let fields = [
        packet_index.to_string(),
        packet.sample.timestamp.format(&Rfc3339).unwrap_or_default(),
        packet.statistics.heart_beats.to_string(),
        packet.sample.heart_rate.to_string(),
        bound(packet.statistics.min_heart_rate),
        bound(packet.statistics.max_heart_rate),
    ];
    let mut line = fields.join(delimiter);
    line.push_str(LINE_ENDING);
    line
}

pub struct LineLogger<S: LineSink> {
    sink: Arc<Mutex<S>>,
    delimiter: String,
    task: Option<JoinHandle<()>>,
    events: Sender<LoggerEvent>,
}

impl<S: LineSink> LineLogger<S> {
    pub fn with_sink(sink: S, delimiter: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sink: Arc::new(Mutex::new(sink)),
            delimiter: delimiter.into(),
            task: None,
            events,
        }
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Changes the field delimiter.
    ///
    /// # Errors
    /// `InvalidOperation` while running.
    pub fn set_delimiter(&mut self, delimiter: impl Into<String>) -> Result<(), HrpError> {
        if self.running() {
            return Err(HrpError::invalid_while_active("delimiter"));
        }
        self.delimiter = delimiter.into();
        Ok(())
    }

    async fn pump(sink: Arc<Mutex<S>>, delimiter: String, mut packets: Receiver<MonitorEvent>) {
        let mut packet_index: u64 = 0;
        loop {
            match packets.recv().await {
                Ok(MonitorEvent::PacketProcessed(packet)) => {
                    let line = format_line(packet_index, &packet, &delimiter);
                    packet_index += 1;
                    if let Err(e) = sink.lock().await.write_line(&line).await {
                        warn!("Failed to log packet: {:#}", e);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Logger lagged, {} packets skipped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Logger pump finished after {} packets", packet_index);
    }
}

impl<S: LineSink> Drop for LineLogger<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl<S: LineSink> HrmLogger for LineLogger<S> {
    async fn start(&mut self, monitor: Arc<dyn HeartRateMonitor>) -> Result<()> {
        if self.running() {
            return Ok(());
        }
        if !SUPPORTED_KINDS.contains(&monitor.kind()) {
            return Err(HrpError::InvalidOperation(format!("unsupported monitor {}", monitor.name())).into());
        }
        if self.task.take().is_some() {
            debug!("Previous logger pump ended on its own, reopening sink");
            self.sink.lock().await.close().await?;
        }
        self.sink.lock().await.open().await?;
        let packets = monitor.subscribe();
        self.task = Some(tokio::spawn(Self::pump(self.sink.clone(), self.delimiter.clone(), packets)));
        info!("Logger bound to {}", monitor.name());
        let _ = self.events.send(LoggerEvent::StatusChanged(true));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        task.abort();
        let closed = self.sink.lock().await.close().await;
        info!("Logger stopped");
        let _ = self.events.send(LoggerEvent::StatusChanged(false));
        closed
    }

    /// False once the pump ended, e.g. because the monitor went away.
    fn running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn subscribe(&self) -> Receiver<LoggerEvent> {
        self.events.subscribe()
    }
}

impl<S: LineSink> Default for LineLogger<S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_sink(S::default(), DEFAULT_LOGGER_DELIMITER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{packet, StubMonitor};
    use std::time::Duration;

    /// Sink collecting lines in memory.
    #[derive(Default)]
    struct MemorySink {
        open: bool,
        lines: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LineSink for MemorySink {
        async fn open(&mut self) -> Result<()> {
            self.open = true;
            Ok(())
        }

        async fn write_line(&mut self, line: &str) -> Result<()> {
            assert!(self.open);
            self.lines.lock().unwrap().push(line.to_owned());
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.open = false;
            Ok(())
        }
    }

    #[test]
    fn test_format_line() {
        let line = format_line(0, &packet(72, 3, Some((60, 80))), ";");
        assert_eq!(line, format!("0;2024-05-01T10:00:00Z;3;72;60;80{}", LINE_ENDING));
    }

    #[test]
    fn test_format_line_without_bounds() {
        let line = format_line(7, &packet(72, 0, None), ",");
        assert_eq!(line, format!("7,2024-05-01T10:00:00Z,0,72,,{}", LINE_ENDING));
    }

    #[tokio::test]
    async fn test_lines_are_indexed_from_zero() {
        let sink = MemorySink::default();
        let lines = sink.lines.clone();
        let mut logger = LineLogger::with_sink(sink, "|");
        let monitor = Arc::new(StubMonitor::new());
        let mut status = logger.subscribe();

        logger.start(monitor.clone()).await.unwrap();
        assert_eq!(status.recv().await.unwrap(), LoggerEvent::StatusChanged(true));
        monitor.emit(MonitorEvent::PacketProcessed(packet(60, 0, None)));
        monitor.emit(MonitorEvent::Timeout("start timeout".into()));
        monitor.emit(MonitorEvent::PacketProcessed(packet(62, 1, Some((60, 62)))));

        for _ in 0..100 {
            if lines.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let lines = lines.lock().unwrap().clone();
        assert!(lines[0].starts_with("0|"));
        assert!(lines[1].starts_with("1|"));
        assert!(lines[1].contains("|62|60|62"));

        logger.stop().await.unwrap();
        assert_eq!(status.recv().await.unwrap(), LoggerEvent::StatusChanged(false));
    }

    #[tokio::test]
    async fn test_delimiter_locked_while_running() {
        let mut logger: LineLogger<MemorySink> = LineLogger::default();
        assert_eq!(logger.delimiter(), ";");
        logger.set_delimiter(",").unwrap();
        logger.start(Arc::new(StubMonitor::new())).await.unwrap();
        assert!(matches!(logger.set_delimiter("\t"), Err(HrpError::InvalidOperation(_))));
        logger.stop().await.unwrap();
        logger.set_delimiter("\t").unwrap();
        assert_eq!(logger.delimiter(), "\t");
    }

    #[tokio::test]
    async fn test_rejects_unsupported_monitor_kind() {
        let mut logger: LineLogger<MemorySink> = LineLogger::default();
        let mut status = logger.subscribe();
        let err = logger
            .start(Arc::new(StubMonitor::with_kind(MonitorKind::AntPlus)))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<HrpError>(), Some(HrpError::InvalidOperation(_))));
        assert!(!logger.running());
        assert!(status.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_not_running_after_monitor_dropped() {
        let mut logger: LineLogger<MemorySink> = LineLogger::default();
        let monitor = Arc::new(StubMonitor::new());
        logger.start(monitor.clone()).await.unwrap();
        assert!(logger.running());

        drop(monitor);
        for _ in 0..100 {
            if !logger.running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!logger.running());

        // A restart binds again.
        logger.start(Arc::new(StubMonitor::new())).await.unwrap();
        assert!(logger.running());
        logger.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let mut logger: LineLogger<MemorySink> = LineLogger::default();
        let mut status = logger.subscribe();
        let monitor = Arc::new(StubMonitor::new());
        logger.start(monitor.clone()).await.unwrap();
        logger.start(monitor).await.unwrap();
        logger.stop().await.unwrap();
        logger.stop().await.unwrap();
        assert_eq!(status.try_recv().unwrap(), LoggerEvent::StatusChanged(true));
        assert_eq!(status.try_recv().unwrap(), LoggerEvent::StatusChanged(false));
        assert!(status.try_recv().is_err());
    }
}
