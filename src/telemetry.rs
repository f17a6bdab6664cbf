// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Telemetry Decoding Seam
//!
//! The pipeline does not parse binary device files itself; it depends on a
//! [`TelemetryDecoder`] that turns a file into an ordered sequence of
//! [`TelemetryMessage`] values. Only two message kinds matter downstream:
//! the single session summary and the device-info sightings. Everything
//! else is carried as [`TelemetryMessage::Other`] and ignored.
//!
//! [`JsonTelemetryDecoder`] is the bundled implementation, reading JSON
//! message arrays; production binary formats plug in behind the same trait.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, WearError};
use crate::models::{ActivityRecord, ActivitySource};

/// Summary record describing one completed activity.
///
/// All fields are optional; absent fields leave the activity record's
/// defaults untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSummary {
    pub sport: Option<String>,
    pub sub_sport: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub total_distance_m: Option<f64>,
    pub total_timer_time_s: Option<f64>,
    pub avg_power_w: Option<i64>,
    pub avg_speed_mps: Option<f64>,
    pub total_ascent_m: Option<i64>,
    pub total_calories: Option<i64>,
}

impl SessionSummary {
    /// Copy the session fields onto an activity record.
    pub fn apply_to(&self, record: &mut ActivityRecord) {
        record.name = self.sport.clone().unwrap_or_else(|| "Activity".to_string());
        record.sport = self.sport.clone();
        record.sub_sport = self.sub_sport;
        record.start_date = self.start_time;
        if let Some(distance_m) = self.total_distance_m {
            record.set_distance_m(distance_m);
        }
        if let Some(timer_s) = self.total_timer_time_s {
            record.set_duration_s(timer_s as i64);
        }
        if let Some(power_w) = self.avg_power_w {
            record.set_avg_power_w(power_w);
        }
        if let Some(speed) = self.avg_speed_mps {
            record.avg_speed_mps = Some(speed);
        }
        if let Some(ascent) = self.total_ascent_m {
            record.elevation_m = Some(ascent);
        }
        if let Some(calories) = self.total_calories {
            record.calories = Some(calories);
        }
    }

    /// Build a fresh local-device record from this session.
    pub fn into_record(&self) -> ActivityRecord {
        let mut record = ActivityRecord::new(ActivitySource::LocalDevice);
        self.apply_to(&mut record);
        record
    }
}

/// One sighting of a physical device during an activity.
///
/// The same device may report several times in one file under the same
/// device index; the last sighting per index is authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Slot the device occupied during the recording
    pub device_index: Option<u8>,
    /// Hardware serial number, the sensor identity key
    pub serial_no: Option<i64>,
    pub product_name: Option<String>,
    pub manufacturer: Option<String>,
    /// Raw ANT device-type code
    pub device_type: Option<i64>,
    /// Battery status code at the time of the sighting
    pub battery: Option<i64>,
}

/// A decoded telemetry message; the pipeline discriminates a small closed
/// set of kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryMessage {
    Session(SessionSummary),
    DeviceInfo(DeviceInfo),
    /// Any record kind the pipeline does not consume
    #[serde(other)]
    Other,
}

/// Decodes a telemetry file into an ordered message sequence.
#[async_trait]
pub trait TelemetryDecoder: Send + Sync {
    async fn decode(&self, path: &Path) -> Result<Vec<TelemetryMessage>>;
}

/// Decoder for JSON telemetry fixtures: a file holding a JSON array of
/// [`TelemetryMessage`] objects.
pub struct JsonTelemetryDecoder;

#[async_trait]
impl TelemetryDecoder for JsonTelemetryDecoder {
    async fn decode(&self, path: &Path) -> Result<Vec<TelemetryMessage>> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| WearError::DecodeError(format!("{}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| WearError::DecodeError(format!("{}: {e}", path.display())))
    }
}

/// Extract the session summaries from a message sequence, in order.
pub fn session_messages(messages: &[TelemetryMessage]) -> Vec<&SessionSummary> {
    messages
        .iter()
        .filter_map(|m| match m {
            TelemetryMessage::Session(session) => Some(session),
            _ => None,
        })
        .collect()
}

/// Extract the device-info messages from a message sequence, in order.
pub fn device_info_messages(messages: &[TelemetryMessage]) -> Vec<DeviceInfo> {
    messages
        .iter()
        .filter_map(|m| match m {
            TelemetryMessage::DeviceInfo(info) => Some(info.clone()),
            _ => None,
        })
        .collect()
}

/// Reduce device sightings to the last message per device index, dropping
/// any without a serial number.
///
/// The device index, not the serial number, is the de-duplication key
/// within one file: later sightings of the same index carry the newest
/// battery and state. Output order follows first appearance in the file so
/// that first-match-wins bike inference stays deterministic.
pub fn last_device_info_per_index(device_infos: &[DeviceInfo]) -> Vec<DeviceInfo> {
    let mut order: Vec<u8> = Vec::new();
    let mut latest: std::collections::HashMap<u8, DeviceInfo> = std::collections::HashMap::new();

    for info in device_infos {
        if info.serial_no.is_none() {
            continue;
        }
        let Some(index) = info.device_index else {
            continue;
        };
        if !latest.contains_key(&index) {
            order.push(index);
        }
        latest.insert(index, info.clone());
    }

    order
        .into_iter()
        .filter_map(|index| latest.remove(&index))
        .collect()
}
