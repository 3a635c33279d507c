//! Core Events
//!
//! Notifications published by monitors and loggers. Every stream is a
//! `tokio::sync::broadcast` channel: any number of subscribers, and dropping a receiver
//! unsubscribes it.
use std::time::Duration;

use crate::model::{device::DeviceRef, statistics::ProcessedPacket};

/// Configuration values that can only change while a monitor is stopped.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigurationChange {
    CharacteristicIndex(usize),
    InitDelay(Duration),
    SmoothingFactor(usize),
}

/// Enumeration of monitor-level events.
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorEvent {
    /// A different device was assigned to the monitor.
    DeviceChanged(Option<DeviceRef>),

    /// A sample was accepted and the statistics were updated.
    PacketProcessed(ProcessedPacket),

    /// The session stopped itself.
    ///
    /// # Fields
    /// - `String`: human readable reason, e.g. "start timeout".
    Timeout(String),

    /// A stopped-only configuration value changed.
    ConfigurationChanged(ConfigurationChange),
}

/// Enumeration of logger events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoggerEvent {
    /// The logger started (`true`) or stopped (`false`).
    StatusChanged(bool),
}
