//! Heart Rate Measurement
//!
//! Decoder for the Heart Rate Measurement characteristic (0x2A37) payload:
//! - Heart rate value (8 or 16 bit)
//! - Energy expenditure
//! - Sensor contact status
//! - RR intervals (time between beats)

use crate::core::error::HrpError;
use crate::{get_u16_little_endian, is_bit_set};
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

const FLAG_LONG_HR: u8 = 0;
const FLAG_CONTACT_DETECTED: u8 = 1;
const FLAG_CONTACT_SUPPORTED: u8 = 2;
const FLAG_ENERGY_EXPENDED: u8 = 3;
const FLAG_RR_INTERVAL: u8 = 4;

/// One decoded Heart Rate Measurement notification.
#[derive(Clone, Deserialize, Serialize, Debug, PartialEq)]
pub struct HeartRateSample {
    /// Heart rate value in beats per minute (BPM).
    pub heart_rate: u16,
    /// Whether the 16 bit heart rate encoding was used.
    pub long_heart_rate: bool,
    pub has_expended_energy: bool,
    /// Energy expenditure in kilojoules, 0 when absent.
    pub expended_energy: u16,
    pub contact_supported: bool,
    pub contact_detected: bool,
    /// RR intervals in milliseconds.
    pub rr_intervals: Vec<u16>,
    /// Timestamp of the notification as reported by the platform.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl HeartRateSample {
    pub fn has_rr_intervals(&self) -> bool {
        !self.rr_intervals.is_empty()
    }
}

/// Decodes a raw Heart Rate Measurement payload.
///
/// # Arguments
/// * `data` - The notification value.
/// * `timestamp` - Time the notification was received.
///
/// # Returns
/// The decoded sample, or [`HrpError::DecodeFailure`] if the buffer is shorter than its
/// flags imply.
pub fn decode_heart_rate(data: &[u8], timestamp: OffsetDateTime) -> Result<HeartRateSample, HrpError> {
    let flags = *data
        .first()
        .ok_or_else(|| HrpError::DecodeFailure("empty payload".into()))?;
    let long_heart_rate = is_bit_set!(flags, FLAG_LONG_HR);
    let has_expended_energy = is_bit_set!(flags, FLAG_ENERGY_EXPENDED);

    let hr_size = if long_heart_rate { 2 } else { 1 };
    let energy_offset = 1 + hr_size;
    let required = energy_offset + if has_expended_energy { 2 } else { 0 };
    if data.len() < required {
        return Err(HrpError::DecodeFailure(format!(
            "flags 0b{:08b} require {} bytes, got {}",
            flags,
            required,
            data.len()
        )));
    }

    let heart_rate = if long_heart_rate {
        get_u16_little_endian!(data, 1)
    } else {
        data[1] as u16
    };

    let expended_energy = if has_expended_energy {
        get_u16_little_endian!(data, energy_offset)
    } else {
        0
    };

    // RR values come in 1/1024 s; a dangling odd byte is ignored.
    let rr_intervals = if is_bit_set!(flags, FLAG_RR_INTERVAL) {
        data[required..]
            .chunks_exact(2)
            .map(|chunk| (get_u16_little_endian!(chunk, 0) as f64 * 1000f64 / 1024f64) as u16)
            .collect()
    } else {
        Vec::new()
    };

    Ok(HeartRateSample {
        heart_rate,
        long_heart_rate,
        has_expended_energy,
        expended_energy,
        contact_supported: is_bit_set!(flags, FLAG_CONTACT_SUPPORTED),
        contact_detected: is_bit_set!(flags, FLAG_CONTACT_DETECTED),
        rr_intervals,
        timestamp,
    })
}

impl fmt::Display for HeartRateSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeartRate = {} bpm", self.heart_rate)?;
        if self.has_expended_energy {
            write!(f, ", Energy = {} kJ", self.expended_energy)?;
        }
        if self.has_rr_intervals() {
            let rr = self
                .rr_intervals
                .iter()
                .map(|rr| format!("{} ms", rr))
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, ", RR = [{}]", rr)?;
        }
        Ok(())
    }
}
