//! Logger API
//!
//! Sinks consuming the packet processed stream of one monitor.
use crate::core::events::LoggerEvent;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;

use super::monitor::HeartRateMonitor;

/// HrmLogger trait
///
/// Start and stop are idempotent and publish `LoggerEvent::StatusChanged` on every
/// actual transition.
#[async_trait]
pub trait HrmLogger: Send + Sync {
    /// Binds the logger to `monitor`. Fails with `InvalidOperation` for a monitor of the
    /// wrong kind.
    async fn start(&mut self, monitor: Arc<dyn HeartRateMonitor>) -> Result<()>;

    /// Unbinds the logger and releases its transport.
    async fn stop(&mut self) -> Result<()>;

    fn running(&self) -> bool;

    fn subscribe(&self) -> Receiver<LoggerEvent>;
}
