// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Remote Service Import
//!
//! Brings activities and gear from a connected fitness service into the
//! local database. Remote activities carry no telemetry file; their gear
//! association comes from the service's gear id rather than sensor
//! inference, and their distance reaches components through gear
//! reconciliation instead of per-activity attribution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::database::Database;
use crate::errors::{Result, WearError};
use crate::models::{ActivityRecord, ActivitySource, Bike, BikeSource, FrameType};

/// Conversion from the kilojoules remote services report to kcal.
const KILOJOULES_PER_KCAL: f64 = 4.184;

/// An activity as the remote service serializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteActivitySummary {
    /// Service-side activity id
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sport_type: Option<String>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    /// Meters
    #[serde(default)]
    pub distance: f64,
    /// Seconds
    #[serde(default)]
    pub moving_time: i64,
    #[serde(default)]
    pub average_watts: Option<f64>,
    #[serde(default)]
    pub average_speed: Option<f64>,
    #[serde(default)]
    pub total_elevation_gain: Option<f64>,
    /// Work in kilojoules; converted to kcal on import
    #[serde(default)]
    pub kilojoules: Option<f64>,
    #[serde(default)]
    pub summary_polyline: Option<String>,
    /// Gear id linking the activity to a bike the service knows about
    #[serde(default)]
    pub gear_id: Option<String>,
}

/// The detailed view of an activity, fetched separately by the service
/// client. Carries the fields the summary listing omits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteActivityDetail {
    /// Service-side activity id
    pub id: String,
    #[serde(default)]
    pub kilojoules: Option<f64>,
    /// Full-resolution route polyline
    #[serde(default)]
    pub polyline: Option<String>,
    #[serde(default)]
    pub average_watts: Option<f64>,
    #[serde(default)]
    pub total_elevation_gain: Option<f64>,
}

/// A bike as the remote service serializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteGear {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub brand_name: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    /// Lifetime meters the service has attributed to this bike
    #[serde(default)]
    pub distance: f64,
    /// Frame-type code as the service encodes it
    #[serde(default)]
    pub frame_type: Option<i64>,
}

impl RemoteActivitySummary {
    fn into_record(self) -> ActivityRecord {
        let mut record = ActivityRecord::new(ActivitySource::RemoteService);
        record.name = self.name;
        record.external_id = Some(self.id);
        record.sport = self.sport_type;
        record.start_date = self.start_date;
        record.set_distance_m(self.distance);
        record.set_duration_s(self.moving_time);
        if let Some(watts) = self.average_watts {
            record.set_avg_power_w(watts.round() as i64);
        }
        record.avg_speed_mps = self.average_speed;
        record.elevation_m = self.total_elevation_gain.map(|e| e.round() as i64);
        record.calories = self
            .kilojoules
            .map(|kj| (kj / KILOJOULES_PER_KCAL).round() as i64);
        record.polyline = self.summary_polyline;
        record
    }
}

/// Imports remote activities and reconciles gear state.
pub struct RemoteImporter {
    db: Database,
}

impl RemoteImporter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Import one remote activity.
    ///
    /// Duplicate detection keys on the service-side id. A gear id naming
    /// a bike this database has never seen is logged and skipped, not a
    /// failure; gear sync will usually arrive later.
    pub async fn import_remote_activity(
        &self,
        summary: RemoteActivitySummary,
    ) -> Result<ActivityRecord> {
        let external_id = summary.id.clone();
        if self
            .db
            .get_activity_by_external_id(ActivitySource::RemoteService, &external_id)
            .await?
            .is_some()
        {
            return Err(WearError::AlreadyImported(external_id));
        }

        let gear_id = summary.gear_id.clone();
        let record = summary.into_record();
        self.db.create_activity(&record).await?;

        if let Some(gear_id) = gear_id {
            match self.db.get_bike_by_external_id(&gear_id).await? {
                Some(bike) => {
                    // A stored activity with no bike beats losing the import.
                    match self.db.associate_activity(&record, None, Some(&bike)).await {
                        Ok(()) => info!(
                            "Imported remote activity '{}' on bike '{}'",
                            record.name, bike.name
                        ),
                        Err(e) => warn!(
                            "Imported remote activity '{}' but could not attach bike '{}': {e}",
                            record.name, bike.name
                        ),
                    }
                }
                None => {
                    warn!(
                        "Remote activity '{}' references unknown gear {}",
                        record.name, gear_id
                    );
                }
            }
        } else {
            info!("Imported remote activity '{}' without gear", record.name);
        }

        self.db
            .get_activity(record.id)
            .await?
            .ok_or_else(|| WearError::NotFound(record.id.to_string()))
    }

    /// Enrich an already-imported remote activity with its detail fields.
    ///
    /// Fields the detail omits keep their summary values.
    pub async fn apply_activity_detail(
        &self,
        detail: RemoteActivityDetail,
    ) -> Result<ActivityRecord> {
        let mut record = self
            .db
            .get_activity_by_external_id(ActivitySource::RemoteService, &detail.id)
            .await?
            .ok_or_else(|| WearError::NotFound(detail.id.clone()))?;

        if let Some(kj) = detail.kilojoules {
            record.calories = Some((kj / KILOJOULES_PER_KCAL).round() as i64);
        }
        if let Some(polyline) = detail.polyline {
            record.polyline = Some(polyline);
        }
        if let Some(watts) = detail.average_watts {
            record.set_avg_power_w(watts.round() as i64);
        }
        if let Some(gain) = detail.total_elevation_gain {
            record.elevation_m = Some(gain.round() as i64);
        }

        self.db.update_activity(&record).await?;
        Ok(record)
    }

    /// Reconcile the local bike roster against the service's gear list.
    ///
    /// Known bikes take the service's name, brand, model and frame type,
    /// and the difference between the service's lifetime distance and the
    /// stored total flows into every active component, downward
    /// corrections included. Unknown gear becomes a new remote bike.
    /// Returns `(created, updated)`.
    pub async fn sync_gear(&self, gear: &[RemoteGear]) -> Result<(usize, usize)> {
        let mut created = 0;
        let mut updated = 0;

        for item in gear {
            match self.db.get_bike_by_external_id(&item.id).await? {
                Some(mut bike) => {
                    let delta = item.distance - bike.distance_m;
                    bike.name = item.name.clone();
                    bike.brand = item.brand_name.clone();
                    bike.model = item.model_name.clone();
                    bike.frame_type = item.frame_type.and_then(FrameType::from_code);
                    bike.distance_m = item.distance;
                    bike.timestamp = Utc::now();
                    self.db.update_bike_with_distance_delta(&bike, delta).await?;
                    if delta != 0.0 {
                        info!(
                            "Gear '{}' distance reconciled by {:.1} km",
                            bike.name,
                            delta / 1000.0
                        );
                    }
                    updated += 1;
                }
                None => {
                    let mut bike = Bike::new(&item.name, BikeSource::Remote);
                    bike.brand = item.brand_name.clone();
                    bike.model = item.model_name.clone();
                    bike.frame_type = item.frame_type.and_then(FrameType::from_code);
                    bike.external_id = Some(item.id.clone());
                    bike.distance_m = item.distance;
                    self.db.create_bike(&bike).await?;
                    info!("Discovered remote bike '{}'", bike.name);
                    created += 1;
                }
            }
        }

        Ok((created, updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Component;

    async fn test_importer() -> RemoteImporter {
        RemoteImporter::new(Database::new("sqlite::memory:").await.unwrap())
    }

    fn summary(id: &str) -> RemoteActivitySummary {
        RemoteActivitySummary {
            id: id.to_string(),
            name: "Lunch Ride".to_string(),
            sport_type: Some("Ride".to_string()),
            start_date: None,
            distance: 30000.0,
            moving_time: 5400,
            average_watts: Some(185.4),
            average_speed: Some(5.6),
            total_elevation_gain: Some(420.7),
            kilojoules: Some(1004.2),
            summary_polyline: None,
            gear_id: None,
        }
    }

    #[tokio::test]
    async fn test_import_converts_kilojoules_and_rejects_duplicates() {
        let importer = test_importer().await;

        let record = importer
            .import_remote_activity(summary("a100"))
            .await
            .unwrap();
        assert_eq!(record.source, ActivitySource::RemoteService);
        assert_eq!(record.external_id.as_deref(), Some("a100"));
        // 1004.2 kJ / 4.184 = 240 kcal
        assert_eq!(record.calories, Some(240));
        assert_eq!(record.avg_power_w, Some(185));
        assert_eq!(record.elevation_m, Some(421));

        let err = importer
            .import_remote_activity(summary("a100"))
            .await
            .unwrap_err();
        assert!(matches!(err, WearError::AlreadyImported(_)));
    }

    #[tokio::test]
    async fn test_remote_gear_gets_duration_but_not_distance() {
        let importer = test_importer().await;

        let mut bike = Bike::new("Roadie", BikeSource::Remote);
        bike.external_id = Some("g7".to_string());
        importer.db.create_bike(&bike).await.unwrap();
        let chain = Component::new(bike.id, 0);
        importer.db.create_component(&chain).await.unwrap();

        let mut s = summary("a200");
        s.gear_id = Some("g7".to_string());
        let record = importer.import_remote_activity(s).await.unwrap();
        assert_eq!(record.bike_id, Some(bike.id));

        // Distance for remote bikes arrives via gear sync, not activities
        let chain = importer.db.get_component(chain.id).await.unwrap().unwrap();
        assert_eq!(chain.duration_s, 5400);
        assert_eq!(chain.distance_m, 0.0);
    }

    #[tokio::test]
    async fn test_detail_enriches_imported_activity() {
        let importer = test_importer().await;

        let mut s = summary("a150");
        s.kilojoules = None;
        s.summary_polyline = Some("abbrev".to_string());
        importer.import_remote_activity(s).await.unwrap();

        let record = importer
            .apply_activity_detail(RemoteActivityDetail {
                id: "a150".to_string(),
                kilojoules: Some(418.4),
                polyline: Some("full_resolution".to_string()),
                average_watts: None,
                total_elevation_gain: None,
            })
            .await
            .unwrap();

        assert_eq!(record.calories, Some(100));
        assert_eq!(record.polyline.as_deref(), Some("full_resolution"));
        // Summary fields the detail omits are untouched
        assert_eq!(record.avg_power_w, Some(185));

        let err = importer
            .apply_activity_detail(RemoteActivityDetail {
                id: "unknown".to_string(),
                kilojoules: None,
                polyline: None,
                average_watts: None,
                total_elevation_gain: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WearError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_gear_is_not_fatal() {
        let importer = test_importer().await;

        let mut s = summary("a300");
        s.gear_id = Some("missing".to_string());
        let record = importer.import_remote_activity(s).await.unwrap();
        assert!(record.bike_id.is_none());
    }

    #[tokio::test]
    async fn test_failed_bike_attach_keeps_the_import() {
        let importer = test_importer().await;

        let mut bike = Bike::new("Roadie", BikeSource::Remote);
        bike.external_id = Some("g7".to_string());
        importer.db.create_bike(&bike).await.unwrap();

        // Break usage propagation so the association transaction fails
        importer.db.execute_raw("DROP TABLE components").await.unwrap();

        let mut s = summary("a400");
        s.gear_id = Some("g7".to_string());
        let record = importer.import_remote_activity(s).await.unwrap();
        assert!(record.bike_id.is_none());
        assert!(importer
            .db
            .get_activity(record.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_sync_gear_creates_updates_and_reconciles() {
        let importer = test_importer().await;

        let roster = vec![RemoteGear {
            id: "g7".to_string(),
            name: "Roadie".to_string(),
            brand_name: Some("Canyon".to_string()),
            model_name: None,
            distance: 100000.0,
            frame_type: Some(3),
        }];

        let (created, updated) = importer.sync_gear(&roster).await.unwrap();
        assert_eq!((created, updated), (1, 0));

        let bike = importer
            .db
            .get_bike_by_external_id("g7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bike.distance_m, 100000.0);
        assert_eq!(bike.source, BikeSource::Remote);

        let chain = Component::new(bike.id, 0);
        importer.db.create_component(&chain).await.unwrap();

        // Forward reconciliation
        let mut roster = roster;
        roster[0].distance = 125000.0;
        let (created, updated) = importer.sync_gear(&roster).await.unwrap();
        assert_eq!((created, updated), (0, 1));
        let chain_row = importer.db.get_component(chain.id).await.unwrap().unwrap();
        assert_eq!(chain_row.distance_m, 25000.0);

        // Downward correction also flows through, clamped at zero
        roster[0].distance = 90000.0;
        importer.sync_gear(&roster).await.unwrap();
        let bike = importer
            .db
            .get_bike_by_external_id("g7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bike.distance_m, 90000.0);
        let chain_row = importer.db.get_component(chain.id).await.unwrap().unwrap();
        assert_eq!(chain_row.distance_m, 0.0);
    }
}
