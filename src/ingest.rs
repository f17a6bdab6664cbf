// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Activity Ingestion
//!
//! Orchestrates the local import pipeline: decode a telemetry file, store
//! exactly one activity per file, archive the file, then analyze the
//! decoded device sightings to resolve sensors and infer which bike the
//! activity belongs to.
//!
//! Analysis is idempotent. Re-running it against an unchanged file leaves
//! the accumulators alone; when the inferred bike differs from the stored
//! association the old bike's components are reversed before the new
//! bike's receive the deltas.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::Database;
use crate::errors::{Result, WearError};
use crate::models::{ActivityRecord, Bike, Sensor};
use crate::storage::ActivityFileStore;
use crate::telemetry::{
    device_info_messages, last_device_info_per_index, session_messages, DeviceInfo,
    TelemetryDecoder, TelemetryMessage,
};

/// Imports and analyzes activities against the component database.
///
/// Concurrent imports are safe: sensor resolution serializes per serial
/// number and accumulator updates serialize per bike, so two files naming
/// the same hardware cannot race each other into duplicate sensors or
/// torn component totals.
pub struct ActivityIngestor {
    db: Database,
    decoder: Arc<dyn TelemetryDecoder>,
    store: ActivityFileStore,
    bike_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    serial_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl ActivityIngestor {
    pub fn new(db: Database, decoder: Arc<dyn TelemetryDecoder>, store: ActivityFileStore) -> Self {
        Self {
            db,
            decoder,
            store,
            bike_locks: DashMap::new(),
            serial_locks: DashMap::new(),
        }
    }

    fn bike_lock(&self, bike_id: Uuid) -> Arc<Mutex<()>> {
        self.bike_locks
            .entry(bike_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn serial_lock(&self, serial_no: i64) -> Arc<Mutex<()>> {
        self.serial_locks
            .entry(serial_no)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Import one telemetry file recorded on a local device.
    ///
    /// The file must decode to exactly one session summary. On success the
    /// file is archived in the activity store, the record points at it,
    /// and analysis has already run. Any failure after the record is
    /// created rolls the record and the archived copy back, so a failed
    /// import leaves no trace.
    pub async fn import_local_activity(&self, source: &Path) -> Result<ActivityRecord> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(WearError::NotFound(source.display().to_string()));
        }

        let file_name = ActivityFileStore::file_name_of(source)?;
        if self.db.get_activity_by_file_name(&file_name).await?.is_some()
            || self.store.contains(&file_name).await
        {
            return Err(WearError::AlreadyImported(file_name));
        }

        let messages = self.decoder.decode(source).await?;
        let sessions = session_messages(&messages);
        if sessions.len() != 1 {
            return Err(WearError::InvalidSessionCount(sessions.len()));
        }

        let mut record = sessions[0].into_record();
        record.name = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());
        self.db.create_activity(&record).await?;

        match self.finish_import(&mut record, source, &messages).await {
            Ok(()) => {
                info!(
                    "Imported activity '{}' from {} ({:.1} km, {} s)",
                    record.name,
                    file_name,
                    record.distance_m / 1000.0,
                    record.duration_s
                );
                // Analysis may have re-pointed the record at a bike
                self.db
                    .get_activity(record.id)
                    .await?
                    .ok_or_else(|| WearError::NotFound(record.id.to_string()))
            }
            Err(e) => {
                warn!("Import of {} failed, rolling back: {}", file_name, e);
                if let Err(cleanup) = self.store.remove(&file_name).await {
                    warn!("Rollback could not remove {}: {}", file_name, cleanup);
                }
                self.db.delete_activity(record.id).await?;
                Err(e)
            }
        }
    }

    async fn finish_import(
        &self,
        record: &mut ActivityRecord,
        source: &Path,
        messages: &[TelemetryMessage],
    ) -> Result<()> {
        let stored_name = self.store.copy_in(source).await?;
        record.file_name = Some(stored_name);
        self.db.update_activity(record).await?;
        self.analyze_messages(record, messages).await
    }

    /// Re-run sensor and bike analysis for a stored activity.
    pub async fn analyze_activity(&self, activity_id: Uuid) -> Result<()> {
        let record = self
            .db
            .get_activity(activity_id)
            .await?
            .ok_or_else(|| WearError::NotFound(activity_id.to_string()))?;
        let file_name = record
            .file_name
            .clone()
            .ok_or_else(|| WearError::NotFound(format!("{activity_id} has no telemetry file")))?;

        let messages = self.decoder.decode(&self.store.path_for(&file_name)).await?;
        self.analyze_messages(&record, &messages).await
    }

    /// Re-analyze every activity that still has a telemetry file.
    ///
    /// One bad file does not stop the sweep; returns how many activities
    /// analyzed cleanly and how many failed.
    pub async fn analyze_all_activities(&self) -> Result<(usize, usize)> {
        let activities = self.db.activities_with_files().await?;
        let mut analyzed = 0;
        let mut failed = 0;

        for activity in &activities {
            match self.analyze_activity(activity.id).await {
                Ok(()) => analyzed += 1,
                Err(e) => {
                    warn!("Analysis of activity {} failed: {}", activity.id, e);
                    failed += 1;
                }
            }
        }

        info!("Analyzed {} activities, {} failed", analyzed, failed);
        Ok((analyzed, failed))
    }

    /// Remove an activity, its accumulated usage, and its stored file.
    pub async fn delete_activity(&self, activity_id: Uuid) -> Result<()> {
        let record = self
            .db
            .get_activity(activity_id)
            .await?
            .ok_or_else(|| WearError::NotFound(activity_id.to_string()))?;

        if let Some(bike_id) = record.bike_id {
            let bike = self.db.get_bike(bike_id).await?;
            let lock = self.bike_lock(bike_id);
            let _guard = lock.lock().await;
            self.db
                .associate_activity(&record, bike.as_ref(), None)
                .await?;
        }

        self.db.delete_activity(activity_id).await?;

        if let Some(file_name) = &record.file_name {
            if let Err(e) = self.store.remove(file_name).await {
                warn!("Could not remove stored file {}: {}", file_name, e);
            }
        }

        info!("Deleted activity '{}'", record.name);
        Ok(())
    }

    async fn analyze_messages(
        &self,
        record: &ActivityRecord,
        messages: &[TelemetryMessage],
    ) -> Result<()> {
        let sightings = last_device_info_per_index(&device_info_messages(messages));
        debug!(
            "Activity '{}': {} distinct device sightings",
            record.name,
            sightings.len()
        );

        let mut inferred_bike: Option<Bike> = None;
        for sighting in &sightings {
            let sensor = self.resolve_sensor(sighting).await?;
            // First linked sensor wins; later sightings only refresh
            // sensor metadata.
            if inferred_bike.is_none() {
                if let Some(bike_id) = sensor.bike_id {
                    inferred_bike = self.db.get_bike(bike_id).await?;
                }
            }
        }

        let new_bike_id = inferred_bike.as_ref().map(|b| b.id);

        loop {
            let stored = self
                .db
                .get_activity(record.id)
                .await?
                .ok_or_else(|| WearError::NotFound(record.id.to_string()))?;
            let old_bike_id = stored.bike_id;
            if old_bike_id == new_bike_id {
                return Ok(());
            }

            // Lock in a stable order so two analyses moving activities in
            // opposite directions cannot deadlock.
            let mut lock_ids: Vec<Uuid> = old_bike_id.into_iter().chain(new_bike_id).collect();
            lock_ids.sort();
            let locks: Vec<_> = lock_ids.iter().map(|id| self.bike_lock(*id)).collect();
            let mut guards = Vec::with_capacity(locks.len());
            for lock in &locks {
                guards.push(lock.lock().await);
            }

            // Re-read under the locks; a concurrent analysis may have moved
            // the activity while we waited, and the decision must key on
            // the bike whose lock we actually hold.
            let stored = self
                .db
                .get_activity(record.id)
                .await?
                .ok_or_else(|| WearError::NotFound(record.id.to_string()))?;
            if stored.bike_id != old_bike_id {
                continue;
            }

            let old_bike = match old_bike_id {
                Some(id) => self.db.get_bike(id).await?,
                None => None,
            };

            self.db
                .associate_activity(&stored, old_bike.as_ref(), inferred_bike.as_ref())
                .await?;

            match &inferred_bike {
                Some(bike) => {
                    info!("Activity '{}' assigned to bike '{}'", record.name, bike.name);
                }
                None => info!("Activity '{}' detached from its bike", record.name),
            }
            return Ok(());
        }
    }

    /// Resolve one device sighting to a sensor row, creating it on first
    /// sight. Each field takes the latest observation that actually carried
    /// it; a sighting that omits a field never clears a known value.
    async fn resolve_sensor(&self, sighting: &DeviceInfo) -> Result<Sensor> {
        let serial_no = sighting
            .serial_no
            .ok_or_else(|| WearError::StructuralViolation("device sighting without serial".into()))?;

        let lock = self.serial_lock(serial_no);
        let _guard = lock.lock().await;

        match self.db.get_sensor_by_serial(serial_no).await? {
            Some(mut sensor) => {
                if let Some(battery) = sighting.battery {
                    sensor.battery = Some(battery);
                }
                if let Some(manufacturer) = &sighting.manufacturer {
                    sensor.manufacturer = Some(manufacturer.clone());
                }
                sensor.device_type = sighting.device_type.or(sensor.device_type);
                if let Some(name) = &sighting.product_name {
                    sensor.name = Some(name.clone());
                }
                sensor.updated_at = chrono::Utc::now();
                self.db.update_sensor(&sensor).await?;
                Ok(sensor)
            }
            None => {
                let mut sensor = Sensor::new(serial_no);
                sensor.name = sighting.product_name.clone();
                sensor.manufacturer = sighting.manufacturer.clone();
                sensor.device_type = sighting.device_type;
                sensor.battery = sighting.battery;
                self.db.create_sensor(&sensor).await?;
                info!(
                    "Discovered sensor {} ({})",
                    serial_no,
                    sensor.name.as_deref().unwrap_or("unnamed")
                );
                Ok(sensor)
            }
        }
    }
}
