// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Data Models
//!
//! Core entities tracked by the wear pipeline. These are plain data
//! structures; persistence lives in [`crate::database`] and the pipeline
//! behavior that drives them (delta propagation, sensor merging) lives in
//! [`crate::ingest`] and [`crate::remote`].
//!
//! ## Core Models
//!
//! - [`ActivityRecord`]: one completed activity, from a device file or a
//!   remote service payload
//! - [`Sensor`]: a physical device seen in telemetry, keyed by serial number
//! - [`Bike`]: equipment owning a tree of components
//! - [`Component`]: a trackable part with usage accumulators
//! - [`ServiceRecord`]: a logged maintenance action

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where an activity record originated.
///
/// Local-device activities accumulate component distance directly from the
/// activity; remote-service activities do not, because the remote service
/// reports authoritative per-equipment distance on its gear payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    /// Imported from a telemetry file recorded by a device
    LocalDevice,
    /// Imported from a remote activity service payload
    RemoteService,
}

impl ActivitySource {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivitySource::LocalDevice => "local_device",
            ActivitySource::RemoteService => "remote_service",
        }
    }

    pub fn from_str_or_default(s: &str) -> Self {
        match s {
            "remote_service" => ActivitySource::RemoteService,
            _ => ActivitySource::LocalDevice,
        }
    }
}

/// One completed activity in canonical form, independent of its source.
///
/// Duplicate detection happens before creation: on `file_name` for local
/// imports and on `(source, external_id)` for remote imports. Distance,
/// duration, and power are clamped non-negative by the setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Unique identity for this record
    pub id: Uuid,
    /// Human-readable name; local imports use the file stem
    pub name: String,
    /// Where the record came from
    pub source: ActivitySource,
    /// Identifier at the remote service, when remote-sourced
    pub external_id: Option<String>,
    /// Sport classification as reported by the source
    pub sport: Option<String>,
    /// Sub-sport classification code as reported by the source
    pub sub_sport: Option<i64>,
    /// When the activity started (UTC)
    pub start_date: Option<DateTime<Utc>>,
    /// Total distance in meters
    pub distance_m: f64,
    /// Total duration in seconds
    pub duration_s: i64,
    /// Average power in watts
    pub avg_power_w: Option<i64>,
    /// Average speed in meters per second
    pub avg_speed_mps: Option<f64>,
    /// Total elevation gain in meters
    pub elevation_m: Option<i64>,
    /// Estimated calories burned
    pub calories: Option<i64>,
    /// Encoded route polyline, when the source supplies one
    pub polyline: Option<String>,
    /// Associated equipment, once resolved
    pub bike_id: Option<Uuid>,
    /// Managed raw-file name, for local imports
    pub file_name: Option<String>,
}

impl ActivityRecord {
    /// Create an empty record for the given source.
    pub fn new(source: ActivitySource) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "Activity".to_string(),
            source,
            external_id: None,
            sport: None,
            sub_sport: None,
            start_date: None,
            distance_m: 0.0,
            duration_s: 0,
            avg_power_w: None,
            avg_speed_mps: None,
            elevation_m: None,
            calories: None,
            polyline: None,
            bike_id: None,
            file_name: None,
        }
    }

    /// Set distance, clamped non-negative.
    pub fn set_distance_m(&mut self, distance_m: f64) {
        self.distance_m = distance_m.max(0.0);
    }

    /// Set duration, clamped non-negative.
    pub fn set_duration_s(&mut self, duration_s: i64) {
        self.duration_s = duration_s.max(0);
    }

    /// Set average power, clamped non-negative.
    pub fn set_avg_power_w(&mut self, avg_power_w: i64) {
        self.avg_power_w = Some(avg_power_w.max(0));
    }
}

/// A physical sensor/device seen in telemetry.
///
/// The serial number is the sole resolution key: two sightings with the
/// same serial refer to the same sensor. Battery and manufacturer are
/// merged on every later sighting; sensors are never auto-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: Uuid,
    /// Unique serial number, the identity key
    pub serial_no: i64,
    /// Display name, typically the product name
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    /// Raw ANT device-type code
    pub device_type: Option<i64>,
    /// Last reported battery status code
    pub battery: Option<i64>,
    /// Equipment this sensor is mounted on, if linked
    pub bike_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sensor {
    pub fn new(serial_no: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            serial_no,
            name: None,
            manufacturer: None,
            device_type: None,
            battery: None,
            bike_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Source that owns a bike's authoritative total distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BikeSource {
    /// Synced from the remote service; distance comes from gear payloads
    Remote,
    /// Tracked locally; distance accumulates from activities
    Local,
}

impl BikeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            BikeSource::Remote => "remote",
            BikeSource::Local => "local",
        }
    }

    pub fn from_str_or_default(s: &str) -> Self {
        match s {
            "remote" => BikeSource::Remote,
            _ => BikeSource::Local,
        }
    }
}

/// Frame classification, mapped from the remote service's numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    MountainBike,
    CrossBike,
    RoadBike,
    TtBike,
    GravelBike,
}

impl FrameType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(FrameType::MountainBike),
            2 => Some(FrameType::CrossBike),
            3 => Some(FrameType::RoadBike),
            4 => Some(FrameType::TtBike),
            5 => Some(FrameType::GravelBike),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            FrameType::MountainBike => 1,
            FrameType::CrossBike => 2,
            FrameType::RoadBike => 3,
            FrameType::TtBike => 4,
            FrameType::GravelBike => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameType::MountainBike => "MTB Bike",
            FrameType::CrossBike => "Cross Bike",
            FrameType::RoadBike => "Road Bike",
            FrameType::TtBike => "TT Bike",
            FrameType::GravelBike => "Gravel Bike",
        }
    }
}

/// A bicycle owning a set of components.
///
/// `external_id` is unique among remote-sourced bikes and is the matching
/// key for remote activity and gear payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bike {
    pub id: Uuid,
    pub name: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub frame_type: Option<FrameType>,
    pub source: BikeSource,
    /// Gear id at the remote service, for remote-sourced bikes
    pub external_id: Option<String>,
    /// Running total distance in meters
    pub distance_m: f64,
    /// Bumped whenever reconciliation changes any field
    pub timestamp: DateTime<Utc>,
}

impl Bike {
    pub fn new(name: &str, source: BikeSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            brand: None,
            model: None,
            frame_type: None,
            source,
            external_id: None,
            distance_m: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// A trackable equipment part with usage accumulators.
///
/// Belongs to exactly one bike; an optional parent forms a tree. The
/// accumulators are adjusted by signed deltas but clamp at zero, and a
/// retired component no longer participates in usage attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: Uuid,
    pub bike_id: Uuid,
    /// Parent component when this is a sub-component
    pub parent_id: Option<Uuid>,
    /// Component-type id in the taxonomy
    pub type_id: i64,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    /// Cumulative distance in meters
    pub distance_m: f64,
    /// Cumulative duration in seconds
    pub duration_s: i64,
    /// Free-form point value, e.g. latest wear measurement (100 = new)
    pub value: Option<f64>,
    pub retired: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Component {
    pub fn new(bike_id: Uuid, type_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            bike_id,
            parent_id: None,
            type_id,
            name: None,
            brand: None,
            model: None,
            distance_m: 0.0,
            duration_s: 0,
            value: None,
            retired: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a signed distance delta, clamping at zero.
    pub fn add_distance(&mut self, delta_m: f64) {
        self.distance_m = (self.distance_m + delta_m).max(0.0);
        self.updated_at = Utc::now();
    }

    /// Apply a signed duration delta in seconds, clamping at zero.
    pub fn add_duration(&mut self, delta_s: i64) {
        self.duration_s = (self.duration_s + delta_s).max(0);
        self.updated_at = Utc::now();
    }

    /// Stop the component from receiving future usage attribution.
    pub fn retire(&mut self) {
        self.retired = true;
        self.updated_at = Utc::now();
    }
}

/// Kind of maintenance action logged in a [`ServiceRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Wax,
    Degrease,
    Measure,
    Wash,
    Oil,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Wax => "wax",
            ServiceType::Degrease => "degrease",
            ServiceType::Measure => "measure",
            ServiceType::Wash => "wash",
            ServiceType::Oil => "oil",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "wax" => Some(ServiceType::Wax),
            "degrease" => Some(ServiceType::Degrease),
            "measure" => Some(ServiceType::Measure),
            "wash" => Some(ServiceType::Wash),
            "oil" => Some(ServiceType::Oil),
            _ => None,
        }
    }
}

/// A logged maintenance action against one or more components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: Uuid,
    pub service_type: ServiceType,
    pub performed_at: DateTime<Utc>,
    pub note: Option<String>,
    /// Numeric value of the action, e.g. measured wear percent
    pub value: Option<f64>,
    /// The component was removed as part of this action
    pub removed: bool,
    /// Components this action was performed on
    pub component_ids: Vec<Uuid>,
}

impl ServiceRecord {
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_type,
            performed_at: Utc::now(),
            note: None,
            value: None,
            removed: false,
            component_ids: Vec::new(),
        }
    }
}
