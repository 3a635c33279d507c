//! Bridge Relay
//!
//! Forwards the monitor state in the legacy bridge text format
//! `heartRate,variance,battery,connected` to an external rebroadcaster. Variance and
//! battery level are not measured and always `0`.
use crate::api::monitor::HeartRateMonitor;
use crate::core::events::MonitorEvent;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

/// Formats one bridge message.
pub fn format_bridge_message(heart_rate: u16, connected: bool) -> String {
    format!("{},0,0,{}", heart_rate, u8::from(connected))
}

pub struct BridgeRelay {
    task: JoinHandle<()>,
}

impl BridgeRelay {
    /// Relays `monitor` events to `output` until stopped or either side closes.
    pub fn spawn(monitor: Arc<dyn HeartRateMonitor>, output: Sender<String>) -> Self {
        let events = monitor.subscribe();
        let task = tokio::spawn(async move {
            let mut events = events;
            let mut heart_rate = 0u16;
            loop {
                let message = match events.recv().await {
                    Ok(MonitorEvent::PacketProcessed(packet)) => {
                        heart_rate = packet.sample.heart_rate;
                        format_bridge_message(heart_rate, true)
                    }
                    Ok(MonitorEvent::Timeout(reason)) => {
                        debug!("Bridge reporting disconnect: {}", reason);
                        format_bridge_message(heart_rate, false)
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Bridge lagged, {} events skipped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if output.send(message).await.is_err() {
                    debug!("Bridge output closed");
                    break;
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for BridgeRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}
