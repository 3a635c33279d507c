//! Bluetooth Smart Heart Rate Profile client
//!
//! Subscribes to the Heart Rate Measurement characteristic of a BLE chest strap, decodes
//! its notifications, derives session statistics and forwards every processed sample to
//! pluggable sinks.

/// Core utilities shared by all modules.
pub mod core {
    /// Protocol and session constants.
    pub mod constants;
    /// Error taxonomy.
    pub mod error;
    /// Events published by monitors and loggers.
    pub mod events;
    /// Custom macros for code simplification.
    pub mod macros;
}

/// Trait seams between the session, the platform and the sinks.
pub mod api {
    /// Logger sinks.
    pub mod logger;
    /// Transport independent heart rate monitor contract.
    pub mod monitor;
    /// Platform attribute stack consumed by the session.
    pub mod platform;
}

/// Data models of the heart rate domain.
pub mod model {
    /// Serializable configuration.
    pub mod config;
    /// Sensor identity.
    pub mod device;
    /// Heart Rate Measurement decoding.
    pub mod heartrate;
    /// Smoothing and session statistics.
    pub mod statistics;
}

/// Runtime components.
pub mod components {
    /// Legacy bridge relay.
    pub mod bridge;
    /// btleplug realization of the platform traits.
    pub mod btle;
    /// Notification subscription around one characteristic.
    pub mod characteristic;
    /// File logger.
    pub mod csv_logger;
    /// Delimited line logger over a generic sink.
    pub mod line_logger;
    /// Session state machine.
    pub mod session;
    /// UDP logger.
    pub mod udp_logger;
}

#[cfg(test)]
mod testing;
