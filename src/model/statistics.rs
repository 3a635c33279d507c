//! Session Statistics
//!
//! Derived metrics of one heart rate session: moving average smoothing, plausibility
//! filtered min/max, beat and packet counters.

use crate::core::constants::{
    DEFAULT_SMOOTHING_FACTOR, MAX_PLAUSIBLE_HEART_RATE, MIN_PLAUSIBLE_HEART_RATE,
};
use crate::model::heartrate::HeartRateSample;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed-capacity moving average over the most recent raw heart rates.
#[derive(Clone, Debug, PartialEq)]
pub struct SmoothingWindow {
    capacity: usize,
    values: VecDeque<u16>,
}

impl Default for SmoothingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING_FACTOR)
    }
}

impl SmoothingWindow {
    /// Creates a window holding `capacity` values; a capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Pushes a raw value, evicting the oldest one when full, and returns the new mean.
    pub fn push(&mut self, value: u16) -> f64 {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.mean()
    }

    /// Mean over the filled slots, 0 when nothing was pushed yet.
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().map(|&v| v as f64).sum::<f64>() / self.values.len() as f64
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Snapshot of the session counters, published with every processed packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub total_packets: u64,
    pub corrupted_packets: u64,
    pub heart_beats: u64,
    pub min_heart_rate: Option<u8>,
    pub max_heart_rate: Option<u8>,
    pub smoothed_heart_rate: f64,
}

/// Payload of the packet processed notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedPacket {
    pub sample: HeartRateSample,
    pub statistics: SessionStatistics,
}

/// Mutable statistics state owned by a session.
#[derive(Clone, Debug, Default)]
pub struct StatisticsTracker {
    window: SmoothingWindow,
    statistics: SessionStatistics,
    last_sample: Option<HeartRateSample>,
}

impl StatisticsTracker {
    pub fn new(smoothing_factor: usize) -> Self {
        Self {
            window: SmoothingWindow::new(smoothing_factor),
            ..Default::default()
        }
    }

    /// Runs one accepted sample through the pipeline and returns the resulting packet.
    pub fn accept(&mut self, sample: HeartRateSample) -> ProcessedPacket {
        let stats = &mut self.statistics;
        stats.smoothed_heart_rate = self.window.push(sample.heart_rate);

        // Bounds are bytes; 16 bit rates above 255 never qualify.
        if let Ok(hr) = u8::try_from(sample.heart_rate) {
            if sample.heart_rate > MIN_PLAUSIBLE_HEART_RATE {
                stats.min_heart_rate = Some(stats.min_heart_rate.map_or(hr, |min| min.min(hr)));
            }
            if sample.heart_rate < MAX_PLAUSIBLE_HEART_RATE {
                stats.max_heart_rate = Some(stats.max_heart_rate.map_or(hr, |max| max.max(hr)));
            }
        }

        stats.total_packets += 1;
        if self.last_sample.is_some() {
            stats.heart_beats += 1;
        }
        self.last_sample = Some(sample.clone());

        ProcessedPacket {
            sample,
            statistics: *stats,
        }
    }

    pub fn record_corrupted(&mut self) {
        self.statistics.corrupted_packets += 1;
    }

    /// Zeroes all counters and empties the window, keeping its capacity.
    pub fn reset(&mut self) {
        self.window.clear();
        self.statistics = SessionStatistics::default();
        self.last_sample = None;
    }

    /// Replaces the window. Only valid while the owning session is stopped.
    pub fn set_smoothing_factor(&mut self, factor: usize) {
        self.window = SmoothingWindow::new(factor);
    }

    pub fn smoothing_factor(&self) -> usize {
        self.window.capacity()
    }

    pub fn statistics(&self) -> SessionStatistics {
        self.statistics
    }

    pub fn last_sample(&self) -> Option<&HeartRateSample> {
        self.last_sample.as_ref()
    }
}
