// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Database Management
//!
//! SQLite-backed repository for every entity the pipeline touches. Schema
//! migration runs at connection time. Entity ids are TEXT uuids and
//! timestamps are RFC 3339 TEXT columns.
//!
//! The usage-delta propagation primitives live here because they must be
//! transactional: reversing one association and applying another commits
//! together or not at all, and component accumulators clamp at zero inside
//! the same UPDATE that adjusts them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{
    ActivityRecord, ActivitySource, Bike, BikeSource, Component, FrameType, Sensor,
    ServiceRecord, ServiceType,
};
use crate::rules::{ComponentRule, RuleKind};
use crate::taxonomy::{ComponentTypeDef, Taxonomy};

/// Repository over a SQLite pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect and run migrations. Pass `sqlite::memory:` for tests.
    pub async fn new(database_url: &str) -> Result<Self> {
        let connection_options = if database_url.starts_with("sqlite:") {
            format!("{database_url}?mode=rwc")
        } else {
            database_url.to_string()
        };

        let pool = SqlitePool::connect(&connection_options).await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Create the schema if it does not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bikes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                brand TEXT,
                model TEXT,
                frame_type INTEGER,
                source TEXT NOT NULL,
                external_id TEXT,
                distance_m REAL NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_bikes_external_id
             ON bikes(external_id) WHERE external_id IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS components (
                id TEXT PRIMARY KEY,
                bike_id TEXT NOT NULL,
                parent_id TEXT,
                type_id INTEGER NOT NULL,
                name TEXT,
                brand TEXT,
                model TEXT,
                distance_m REAL NOT NULL DEFAULT 0,
                duration_s INTEGER NOT NULL DEFAULT 0,
                value REAL,
                retired INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_components_bike ON components(bike_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sensors (
                id TEXT PRIMARY KEY,
                serial_no INTEGER NOT NULL UNIQUE,
                name TEXT,
                manufacturer TEXT,
                device_type INTEGER,
                battery INTEGER,
                bike_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                source TEXT NOT NULL,
                external_id TEXT,
                sport TEXT,
                sub_sport INTEGER,
                start_date TEXT,
                distance_m REAL NOT NULL DEFAULT 0,
                duration_s INTEGER NOT NULL DEFAULT 0,
                avg_power_w INTEGER,
                avg_speed_mps REAL,
                elevation_m INTEGER,
                calories INTEGER,
                polyline TEXT,
                bike_id TEXT,
                file_name TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_activities_file_name
             ON activities(file_name) WHERE file_name IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_activities_external
             ON activities(source, external_id) WHERE external_id IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS component_types (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS component_type_parents (
                type_id INTEGER NOT NULL,
                parent_id INTEGER NOT NULL,
                PRIMARY KEY (type_id, parent_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS component_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                rule_value INTEGER NOT NULL DEFAULT 0,
                rule_date TEXT,
                template INTEGER NOT NULL DEFAULT 0,
                notification_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rule_component_types (
                rule_id TEXT NOT NULL,
                type_id INTEGER NOT NULL,
                PRIMARY KEY (rule_id, type_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                id TEXT PRIMARY KEY,
                service_type TEXT NOT NULL,
                performed_at TEXT NOT NULL,
                note TEXT,
                value REAL,
                removed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS service_components (
                service_id TEXT NOT NULL,
                component_id TEXT NOT NULL,
                PRIMARY KEY (service_id, component_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Bikes

    pub async fn create_bike(&self, bike: &Bike) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO bikes (id, name, brand, model, frame_type, source, external_id, distance_m, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(bike.id.to_string())
        .bind(&bike.name)
        .bind(&bike.brand)
        .bind(&bike.model)
        .bind(bike.frame_type.map(FrameType::code))
        .bind(bike.source.as_str())
        .bind(&bike.external_id)
        .bind(bike.distance_m)
        .bind(bike.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(bike.id)
    }

    pub async fn get_bike(&self, bike_id: Uuid) -> Result<Option<Bike>> {
        let row = sqlx::query("SELECT * FROM bikes WHERE id = ?1")
            .bind(bike_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_bike(&r)).transpose()
    }

    /// Find a bike by the external id the remote service assigned it.
    pub async fn get_bike_by_external_id(&self, external_id: &str) -> Result<Option<Bike>> {
        let row = sqlx::query("SELECT * FROM bikes WHERE external_id = ?1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_bike(&r)).transpose()
    }

    pub async fn list_bikes(&self) -> Result<Vec<Bike>> {
        let rows = sqlx::query("SELECT * FROM bikes ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_bike).collect()
    }

    pub async fn update_bike(&self, bike: &Bike) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE bikes
            SET name = ?1, brand = ?2, model = ?3, frame_type = ?4, source = ?5,
                external_id = ?6, distance_m = ?7, timestamp = ?8
            WHERE id = ?9
            "#,
        )
        .bind(&bike.name)
        .bind(&bike.brand)
        .bind(&bike.model)
        .bind(bike.frame_type.map(FrameType::code))
        .bind(bike.source.as_str())
        .bind(&bike.external_id)
        .bind(bike.distance_m)
        .bind(bike.timestamp.to_rfc3339())
        .bind(bike.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Components

    pub async fn create_component(&self, component: &Component) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO components
                (id, bike_id, parent_id, type_id, name, brand, model,
                 distance_m, duration_s, value, retired, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(component.id.to_string())
        .bind(component.bike_id.to_string())
        .bind(component.parent_id.map(|p| p.to_string()))
        .bind(component.type_id)
        .bind(&component.name)
        .bind(&component.brand)
        .bind(&component.model)
        .bind(component.distance_m)
        .bind(component.duration_s)
        .bind(component.value)
        .bind(component.retired)
        .bind(component.created_at.to_rfc3339())
        .bind(component.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(component.id)
    }

    pub async fn get_component(&self, component_id: Uuid) -> Result<Option<Component>> {
        let row = sqlx::query("SELECT * FROM components WHERE id = ?1")
            .bind(component_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_component(&r)).transpose()
    }

    /// All components owned by a bike, flattened across the tree.
    pub async fn components_for_bike(&self, bike_id: Uuid) -> Result<Vec<Component>> {
        let rows = sqlx::query("SELECT * FROM components WHERE bike_id = ?1 ORDER BY created_at")
            .bind(bike_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_component).collect()
    }

    pub async fn update_component(&self, component: &Component) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE components
            SET bike_id = ?1, parent_id = ?2, type_id = ?3, name = ?4, brand = ?5,
                model = ?6, distance_m = ?7, duration_s = ?8, value = ?9,
                retired = ?10, updated_at = ?11
            WHERE id = ?12
            "#,
        )
        .bind(component.bike_id.to_string())
        .bind(component.parent_id.map(|p| p.to_string()))
        .bind(component.type_id)
        .bind(&component.name)
        .bind(&component.brand)
        .bind(&component.model)
        .bind(component.distance_m)
        .bind(component.duration_s)
        .bind(component.value)
        .bind(component.retired)
        .bind(component.updated_at.to_rfc3339())
        .bind(component.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Parent adjacency for a bike's component tree: id -> parent id.
    pub async fn component_tree(&self, bike_id: Uuid) -> Result<HashMap<Uuid, Option<Uuid>>> {
        let components = self.components_for_bike(bike_id).await?;
        Ok(components.into_iter().map(|c| (c.id, c.parent_id)).collect())
    }

    /// Re-parent a component within its bike's tree, or detach it with
    /// `None`. The edge is validated against the tree and the taxonomy's
    /// valid-parent relation before anything changes.
    pub async fn set_component_parent(
        &self,
        component_id: Uuid,
        new_parent_id: Option<Uuid>,
        taxonomy: &Taxonomy,
    ) -> Result<()> {
        let mut component = self
            .get_component(component_id)
            .await?
            .ok_or_else(|| crate::errors::WearError::NotFound(component_id.to_string()))?;

        if let Some(parent_id) = new_parent_id {
            let parent = self
                .get_component(parent_id)
                .await?
                .ok_or_else(|| crate::errors::WearError::NotFound(parent_id.to_string()))?;
            if parent.bike_id != component.bike_id {
                return Err(crate::errors::WearError::StructuralViolation(
                    "parent belongs to a different bike".to_string(),
                ));
            }

            let tree = self.component_tree(component.bike_id).await?;
            crate::taxonomy::validate_component_parent(
                component.id,
                component.type_id,
                parent.id,
                parent.type_id,
                &tree,
                taxonomy,
            )?;
        }

        component.parent_id = new_parent_id;
        component.updated_at = Utc::now();
        self.update_component(&component).await
    }

    // ------------------------------------------------------------------
    // Usage delta propagation

    /// Apply a signed usage delta to every active component of a bike, in
    /// one statement so the clamp and the adjustment commit together.
    pub async fn apply_usage_delta(
        &self,
        bike_id: Uuid,
        duration_delta_s: i64,
        distance_delta_m: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE components
            SET duration_s = MAX(0, duration_s + ?1),
                distance_m = MAX(0.0, distance_m + ?2),
                updated_at = ?3
            WHERE bike_id = ?4 AND retired = 0
            "#,
        )
        .bind(duration_delta_s)
        .bind(distance_delta_m)
        .bind(Utc::now().to_rfc3339())
        .bind(bike_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-point an activity at a new bike, reversing deltas on the old
    /// bike and applying them on the new one in a single transaction.
    ///
    /// Distance propagates only for locally-tracked bikes; duration always
    /// propagates. Passing `None` for the new bike detaches the activity.
    pub async fn associate_activity(
        &self,
        activity: &ActivityRecord,
        old_bike: Option<&Bike>,
        new_bike: Option<&Bike>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        if let Some(old) = old_bike {
            let distance_delta = match old.source {
                BikeSource::Local => -activity.distance_m,
                BikeSource::Remote => 0.0,
            };
            sqlx::query(
                r#"
                UPDATE components
                SET duration_s = MAX(0, duration_s - ?1),
                    distance_m = MAX(0.0, distance_m + ?2),
                    updated_at = ?3
                WHERE bike_id = ?4 AND retired = 0
                "#,
            )
            .bind(activity.duration_s)
            .bind(distance_delta)
            .bind(&now)
            .bind(old.id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        if let Some(new) = new_bike {
            let distance_delta = match new.source {
                BikeSource::Local => activity.distance_m,
                BikeSource::Remote => 0.0,
            };
            sqlx::query(
                r#"
                UPDATE components
                SET duration_s = MAX(0, duration_s + ?1),
                    distance_m = MAX(0.0, distance_m + ?2),
                    updated_at = ?3
                WHERE bike_id = ?4 AND retired = 0
                "#,
            )
            .bind(activity.duration_s)
            .bind(distance_delta)
            .bind(&now)
            .bind(new.id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE activities SET bike_id = ?1 WHERE id = ?2")
            .bind(new_bike.map(|b| b.id.to_string()))
            .bind(activity.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Reconcile a bike's fields and total distance against the remote
    /// source. The distance delta between old and new total is applied
    /// identically to every active component, negative corrections
    /// included, in the same transaction that stores the new total.
    pub async fn update_bike_with_distance_delta(
        &self,
        bike: &Bike,
        distance_delta_m: f64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if distance_delta_m != 0.0 {
            sqlx::query(
                r#"
                UPDATE components
                SET distance_m = MAX(0.0, distance_m + ?1), updated_at = ?2
                WHERE bike_id = ?3 AND retired = 0
                "#,
            )
            .bind(distance_delta_m)
            .bind(Utc::now().to_rfc3339())
            .bind(bike.id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE bikes
            SET name = ?1, brand = ?2, model = ?3, frame_type = ?4,
                distance_m = ?5, timestamp = ?6
            WHERE id = ?7
            "#,
        )
        .bind(&bike.name)
        .bind(&bike.brand)
        .bind(&bike.model)
        .bind(bike.frame_type.map(FrameType::code))
        .bind(bike.distance_m)
        .bind(bike.timestamp.to_rfc3339())
        .bind(bike.id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sensors

    pub async fn create_sensor(&self, sensor: &Sensor) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO sensors
                (id, serial_no, name, manufacturer, device_type, battery, bike_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(sensor.id.to_string())
        .bind(sensor.serial_no)
        .bind(&sensor.name)
        .bind(&sensor.manufacturer)
        .bind(sensor.device_type)
        .bind(sensor.battery)
        .bind(sensor.bike_id.map(|b| b.to_string()))
        .bind(sensor.created_at.to_rfc3339())
        .bind(sensor.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(sensor.id)
    }

    pub async fn get_sensor_by_serial(&self, serial_no: i64) -> Result<Option<Sensor>> {
        let row = sqlx::query("SELECT * FROM sensors WHERE serial_no = ?1")
            .bind(serial_no)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_sensor(&r)).transpose()
    }

    pub async fn list_sensors(&self) -> Result<Vec<Sensor>> {
        let rows = sqlx::query("SELECT * FROM sensors ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_sensor).collect()
    }

    pub async fn update_sensor(&self, sensor: &Sensor) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sensors
            SET name = ?1, manufacturer = ?2, device_type = ?3, battery = ?4,
                bike_id = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
        )
        .bind(&sensor.name)
        .bind(&sensor.manufacturer)
        .bind(sensor.device_type)
        .bind(sensor.battery)
        .bind(sensor.bike_id.map(|b| b.to_string()))
        .bind(sensor.updated_at.to_rfc3339())
        .bind(sensor.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Explicitly link or unlink a sensor to equipment.
    pub async fn link_sensor_to_bike(&self, serial_no: i64, bike_id: Option<Uuid>) -> Result<()> {
        sqlx::query("UPDATE sensors SET bike_id = ?1, updated_at = ?2 WHERE serial_no = ?3")
            .bind(bike_id.map(|b| b.to_string()))
            .bind(Utc::now().to_rfc3339())
            .bind(serial_no)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Activities

    pub async fn create_activity(&self, activity: &ActivityRecord) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO activities
                (id, name, source, external_id, sport, sub_sport, start_date,
                 distance_m, duration_s, avg_power_w, avg_speed_mps, elevation_m,
                 calories, polyline, bike_id, file_name)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(activity.id.to_string())
        .bind(&activity.name)
        .bind(activity.source.as_str())
        .bind(&activity.external_id)
        .bind(&activity.sport)
        .bind(activity.sub_sport)
        .bind(activity.start_date.map(|d| d.to_rfc3339()))
        .bind(activity.distance_m)
        .bind(activity.duration_s)
        .bind(activity.avg_power_w)
        .bind(activity.avg_speed_mps)
        .bind(activity.elevation_m)
        .bind(activity.calories)
        .bind(&activity.polyline)
        .bind(activity.bike_id.map(|b| b.to_string()))
        .bind(&activity.file_name)
        .execute(&self.pool)
        .await?;

        Ok(activity.id)
    }

    pub async fn get_activity(&self, activity_id: Uuid) -> Result<Option<ActivityRecord>> {
        let row = sqlx::query("SELECT * FROM activities WHERE id = ?1")
            .bind(activity_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_activity(&r)).transpose()
    }

    pub async fn get_activity_by_file_name(
        &self,
        file_name: &str,
    ) -> Result<Option<ActivityRecord>> {
        let row = sqlx::query("SELECT * FROM activities WHERE file_name = ?1")
            .bind(file_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_activity(&r)).transpose()
    }

    pub async fn get_activity_by_external_id(
        &self,
        source: ActivitySource,
        external_id: &str,
    ) -> Result<Option<ActivityRecord>> {
        let row = sqlx::query("SELECT * FROM activities WHERE source = ?1 AND external_id = ?2")
            .bind(source.as_str())
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_activity(&r)).transpose()
    }

    pub async fn list_activities(&self) -> Result<Vec<ActivityRecord>> {
        let rows = sqlx::query("SELECT * FROM activities ORDER BY start_date DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_activity).collect()
    }

    /// Activities that still reference a stored telemetry file.
    pub async fn activities_with_files(&self) -> Result<Vec<ActivityRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM activities WHERE file_name IS NOT NULL ORDER BY start_date",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_activity).collect()
    }

    pub async fn update_activity(&self, activity: &ActivityRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE activities
            SET name = ?1, source = ?2, external_id = ?3, sport = ?4, sub_sport = ?5,
                start_date = ?6, distance_m = ?7, duration_s = ?8, avg_power_w = ?9,
                avg_speed_mps = ?10, elevation_m = ?11, calories = ?12, polyline = ?13,
                bike_id = ?14, file_name = ?15
            WHERE id = ?16
            "#,
        )
        .bind(&activity.name)
        .bind(activity.source.as_str())
        .bind(&activity.external_id)
        .bind(&activity.sport)
        .bind(activity.sub_sport)
        .bind(activity.start_date.map(|d| d.to_rfc3339()))
        .bind(activity.distance_m)
        .bind(activity.duration_s)
        .bind(activity.avg_power_w)
        .bind(activity.avg_speed_mps)
        .bind(activity.elevation_m)
        .bind(activity.calories)
        .bind(&activity.polyline)
        .bind(activity.bike_id.map(|b| b.to_string()))
        .bind(&activity.file_name)
        .bind(activity.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_activity(&self, activity_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM activities WHERE id = ?1")
            .bind(activity_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Component types

    /// Load the taxonomy; seeds the default type set when the table is
    /// empty.
    pub async fn load_taxonomy(&self) -> Result<Taxonomy> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM component_types")
            .fetch_one(&self.pool)
            .await?;
        if count == 0 {
            self.seed_component_types().await?;
        }

        let type_rows = sqlx::query("SELECT id, name FROM component_types")
            .fetch_all(&self.pool)
            .await?;
        let parent_rows = sqlx::query("SELECT type_id, parent_id FROM component_type_parents")
            .fetch_all(&self.pool)
            .await?;

        let mut parents: HashMap<i64, Vec<i64>> = HashMap::new();
        for row in &parent_rows {
            let type_id: i64 = row.try_get("type_id")?;
            let parent_id: i64 = row.try_get("parent_id")?;
            parents.entry(type_id).or_default().push(parent_id);
        }

        let mut defs = Vec::with_capacity(type_rows.len());
        for row in &type_rows {
            let id: i64 = row.try_get("id")?;
            defs.push(ComponentTypeDef {
                id,
                name: row.try_get("name")?,
                valid_parent_ids: parents.remove(&id).unwrap_or_default(),
            });
        }
        Ok(Taxonomy::new(defs))
    }

    pub async fn insert_component_type(&self, def: &ComponentTypeDef) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO component_types (id, name) VALUES (?1, ?2)")
            .bind(def.id)
            .bind(&def.name)
            .execute(&mut *tx)
            .await?;
        for parent in &def.valid_parent_ids {
            sqlx::query(
                "INSERT INTO component_type_parents (type_id, parent_id) VALUES (?1, ?2)",
            )
            .bind(def.id)
            .bind(parent)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn seed_component_types(&self) -> Result<()> {
        for def in crate::taxonomy::default_types() {
            self.insert_component_type(&def).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rules

    pub async fn create_rule(&self, rule: &ComponentRule) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO component_rules
                (id, name, kind, rule_value, rule_date, template, notification_message,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(rule.id.to_string())
        .bind(&rule.name)
        .bind(rule.kind.as_str())
        .bind(rule.rule_value)
        .bind(rule.rule_date.map(|d| d.to_rfc3339()))
        .bind(rule.template)
        .bind(&rule.notification_message)
        .bind(rule.created_at.to_rfc3339())
        .bind(rule.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for type_id in &rule.component_type_ids {
            sqlx::query("INSERT INTO rule_component_types (rule_id, type_id) VALUES (?1, ?2)")
                .bind(rule.id.to_string())
                .bind(type_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(rule.id)
    }

    /// List rules, optionally filtered to templates or instances.
    pub async fn list_rules(&self, template: Option<bool>) -> Result<Vec<ComponentRule>> {
        let rows = match template {
            Some(flag) => {
                sqlx::query("SELECT * FROM component_rules WHERE template = ?1 ORDER BY name")
                    .bind(flag)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM component_rules ORDER BY name")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut rule = row_to_rule(row)?;
            rule.component_type_ids = self.rule_type_ids(rule.id).await?;
            rules.push(rule);
        }
        Ok(rules)
    }

    async fn rule_type_ids(&self, rule_id: Uuid) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT type_id FROM rule_component_types WHERE rule_id = ?1 ORDER BY type_id",
        )
        .bind(rule_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<i64, _>("type_id").map_err(Into::into))
            .collect()
    }

    /// Seed the default rule templates when none exist yet.
    pub async fn seed_rule_templates(&self) -> Result<()> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM component_rules WHERE template = 1")
                .fetch_one(&self.pool)
                .await?;
        if count > 0 {
            return Ok(());
        }
        for template in crate::rules::default_templates() {
            self.create_rule(&template).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Service records

    /// Store a maintenance action and its component links together. A
    /// `measure` action with a value also updates each component's wear
    /// value.
    pub async fn create_service(&self, service: &ServiceRecord) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO services (id, service_type, performed_at, note, value, removed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(service.id.to_string())
        .bind(service.service_type.as_str())
        .bind(service.performed_at.to_rfc3339())
        .bind(&service.note)
        .bind(service.value)
        .bind(service.removed)
        .execute(&mut *tx)
        .await?;

        for component_id in &service.component_ids {
            sqlx::query(
                "INSERT INTO service_components (service_id, component_id) VALUES (?1, ?2)",
            )
            .bind(service.id.to_string())
            .bind(component_id.to_string())
            .execute(&mut *tx)
            .await?;

            if service.service_type == ServiceType::Measure {
                if let Some(value) = service.value {
                    sqlx::query(
                        "UPDATE components SET value = ?1, updated_at = ?2 WHERE id = ?3",
                    )
                    .bind(value)
                    .bind(Utc::now().to_rfc3339())
                    .bind(component_id.to_string())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(service.id)
    }

    pub async fn services_for_component(&self, component_id: Uuid) -> Result<Vec<ServiceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT s.* FROM services s
            JOIN service_components sc ON sc.service_id = s.id
            WHERE sc.component_id = ?1
            ORDER BY s.performed_at DESC
            "#,
        )
        .bind(component_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut services = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut service = row_to_service(row)?;
            service.component_ids = self.service_component_ids(service.id).await?;
            services.push(service);
        }
        Ok(services)
    }

    /// Number of logged service actions against a component, the input to
    /// use-count rules.
    pub async fn service_count_for_component(&self, component_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM service_components WHERE component_id = ?1",
        )
        .bind(component_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn service_component_ids(&self, service_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT component_id FROM service_components WHERE service_id = ?1",
        )
        .bind(service_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let id: String = r.try_get("component_id")?;
                parse_uuid(&id)
            })
            .collect()
    }

    /// Run arbitrary SQL against the pool. Tests use this to break the
    /// schema and exercise failure paths.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Row converters

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| crate::errors::WearError::PersistenceFailure(sqlx::Error::Decode(e.into())))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| crate::errors::WearError::PersistenceFailure(sqlx::Error::Decode(e.into())))
}

fn row_to_bike(row: &SqliteRow) -> Result<Bike> {
    let id: String = row.try_get("id")?;
    let source: String = row.try_get("source")?;
    let frame_type: Option<i64> = row.try_get("frame_type")?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(Bike {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        brand: row.try_get("brand")?,
        model: row.try_get("model")?,
        frame_type: frame_type.and_then(FrameType::from_code),
        source: BikeSource::from_str_or_default(&source),
        external_id: row.try_get("external_id")?,
        distance_m: row.try_get("distance_m")?,
        timestamp: parse_timestamp(&timestamp)?,
    })
}

fn row_to_component(row: &SqliteRow) -> Result<Component> {
    let id: String = row.try_get("id")?;
    let bike_id: String = row.try_get("bike_id")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Component {
        id: parse_uuid(&id)?,
        bike_id: parse_uuid(&bike_id)?,
        parent_id: parent_id.as_deref().map(parse_uuid).transpose()?,
        type_id: row.try_get("type_id")?,
        name: row.try_get("name")?,
        brand: row.try_get("brand")?,
        model: row.try_get("model")?,
        distance_m: row.try_get("distance_m")?,
        duration_s: row.try_get("duration_s")?,
        value: row.try_get("value")?,
        retired: row.try_get("retired")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_sensor(row: &SqliteRow) -> Result<Sensor> {
    let id: String = row.try_get("id")?;
    let bike_id: Option<String> = row.try_get("bike_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Sensor {
        id: parse_uuid(&id)?,
        serial_no: row.try_get("serial_no")?,
        name: row.try_get("name")?,
        manufacturer: row.try_get("manufacturer")?,
        device_type: row.try_get("device_type")?,
        battery: row.try_get("battery")?,
        bike_id: bike_id.as_deref().map(parse_uuid).transpose()?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_activity(row: &SqliteRow) -> Result<ActivityRecord> {
    let id: String = row.try_get("id")?;
    let source: String = row.try_get("source")?;
    let start_date: Option<String> = row.try_get("start_date")?;
    let bike_id: Option<String> = row.try_get("bike_id")?;

    Ok(ActivityRecord {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        source: ActivitySource::from_str_or_default(&source),
        external_id: row.try_get("external_id")?,
        sport: row.try_get("sport")?,
        sub_sport: row.try_get("sub_sport")?,
        start_date: start_date.as_deref().map(parse_timestamp).transpose()?,
        distance_m: row.try_get("distance_m")?,
        duration_s: row.try_get("duration_s")?,
        avg_power_w: row.try_get("avg_power_w")?,
        avg_speed_mps: row.try_get("avg_speed_mps")?,
        elevation_m: row.try_get("elevation_m")?,
        calories: row.try_get("calories")?,
        polyline: row.try_get("polyline")?,
        bike_id: bike_id.as_deref().map(parse_uuid).transpose()?,
        file_name: row.try_get("file_name")?,
    })
}

fn row_to_rule(row: &SqliteRow) -> Result<ComponentRule> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let rule_date: Option<String> = row.try_get("rule_date")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ComponentRule {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        kind: RuleKind::from_str_opt(&kind).unwrap_or(RuleKind::Distance),
        rule_value: row.try_get("rule_value")?,
        rule_date: rule_date.as_deref().map(parse_timestamp).transpose()?,
        template: row.try_get("template")?,
        notification_message: row.try_get("notification_message")?,
        component_type_ids: Vec::new(),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn row_to_service(row: &SqliteRow) -> Result<ServiceRecord> {
    let id: String = row.try_get("id")?;
    let service_type: String = row.try_get("service_type")?;
    let performed_at: String = row.try_get("performed_at")?;

    Ok(ServiceRecord {
        id: parse_uuid(&id)?,
        service_type: ServiceType::from_str_opt(&service_type).unwrap_or(ServiceType::Measure),
        performed_at: parse_timestamp(&performed_at)?,
        note: row.try_get("note")?,
        value: row.try_get("value")?,
        removed: row.try_get("removed")?,
        component_ids: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivitySource, BikeSource};

    async fn create_test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_bike() {
        let db = create_test_db().await;

        let mut bike = Bike::new("Gravel rig", BikeSource::Remote);
        bike.external_id = Some("b12345".to_string());
        db.create_bike(&bike).await.unwrap();

        let fetched = db.get_bike(bike.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Gravel rig");
        assert_eq!(fetched.source, BikeSource::Remote);

        let by_external = db.get_bike_by_external_id("b12345").await.unwrap().unwrap();
        assert_eq!(by_external.id, bike.id);
        assert!(db.get_bike_by_external_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_usage_delta_clamps_and_skips_retired() {
        let db = create_test_db().await;

        let bike = Bike::new("Hardtail", BikeSource::Local);
        db.create_bike(&bike).await.unwrap();

        let chain = Component::new(bike.id, 0);
        let mut shock = Component::new(bike.id, 11);
        shock.retired = true;
        db.create_component(&chain).await.unwrap();
        db.create_component(&shock).await.unwrap();

        db.apply_usage_delta(bike.id, 3600, 20000.0).await.unwrap();
        db.apply_usage_delta(bike.id, -7200, -50000.0).await.unwrap();

        let chain = db.get_component(chain.id).await.unwrap().unwrap();
        assert_eq!(chain.duration_s, 0);
        assert_eq!(chain.distance_m, 0.0);

        let shock = db.get_component(shock.id).await.unwrap().unwrap();
        assert_eq!(shock.duration_s, 0);
        assert_eq!(shock.distance_m, 0.0);
    }

    #[tokio::test]
    async fn test_associate_activity_moves_deltas_between_bikes() {
        let db = create_test_db().await;

        let old_bike = Bike::new("Old", BikeSource::Local);
        let new_bike = Bike::new("New", BikeSource::Local);
        db.create_bike(&old_bike).await.unwrap();
        db.create_bike(&new_bike).await.unwrap();

        let old_chain = Component::new(old_bike.id, 0);
        let new_chain = Component::new(new_bike.id, 0);
        db.create_component(&old_chain).await.unwrap();
        db.create_component(&new_chain).await.unwrap();

        let mut activity = ActivityRecord::new(ActivitySource::LocalDevice);
        activity.set_distance_m(20000.0);
        activity.set_duration_s(3600);
        activity.bike_id = Some(old_bike.id);
        db.create_activity(&activity).await.unwrap();
        db.associate_activity(&activity, None, Some(&old_bike))
            .await
            .unwrap();

        db.associate_activity(&activity, Some(&old_bike), Some(&new_bike))
            .await
            .unwrap();

        let old_chain = db.get_component(old_chain.id).await.unwrap().unwrap();
        let new_chain = db.get_component(new_chain.id).await.unwrap().unwrap();
        assert_eq!(old_chain.duration_s, 0);
        assert_eq!(old_chain.distance_m, 0.0);
        assert_eq!(new_chain.duration_s, 3600);
        assert_eq!(new_chain.distance_m, 20000.0);

        let stored = db.get_activity(activity.id).await.unwrap().unwrap();
        assert_eq!(stored.bike_id, Some(new_bike.id));
    }

    #[tokio::test]
    async fn test_set_component_parent_validates_edge() {
        let db = create_test_db().await;
        let taxonomy = db.load_taxonomy().await.unwrap();

        let bike = Bike::new("Trail", BikeSource::Local);
        db.create_bike(&bike).await.unwrap();
        let wheel = Component::new(bike.id, crate::taxonomy::type_ids::REAR_WHEEL);
        let cassette = Component::new(bike.id, crate::taxonomy::type_ids::CASSETTE);
        db.create_component(&wheel).await.unwrap();
        db.create_component(&cassette).await.unwrap();

        db.set_component_parent(cassette.id, Some(wheel.id), &taxonomy)
            .await
            .unwrap();
        let stored = db.get_component(cassette.id).await.unwrap().unwrap();
        assert_eq!(stored.parent_id, Some(wheel.id));

        // The reverse edge would close a cycle
        let err = db
            .set_component_parent(wheel.id, Some(cassette.id), &taxonomy)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::errors::WearError::StructuralViolation(_)
        ));

        db.set_component_parent(cassette.id, None, &taxonomy)
            .await
            .unwrap();
        let stored = db.get_component(cassette.id).await.unwrap().unwrap();
        assert!(stored.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_sensor_serial_is_unique() {
        let db = create_test_db().await;

        let sensor = Sensor::new(12345);
        db.create_sensor(&sensor).await.unwrap();

        let duplicate = Sensor::new(12345);
        assert!(db.create_sensor(&duplicate).await.is_err());

        let fetched = db.get_sensor_by_serial(12345).await.unwrap().unwrap();
        assert_eq!(fetched.id, sensor.id);
    }

    #[tokio::test]
    async fn test_taxonomy_seeds_once() {
        let db = create_test_db().await;

        let taxonomy = db.load_taxonomy().await.unwrap();
        assert_eq!(taxonomy.type_ids().len(), 17);

        // Loading again must not duplicate the seed
        let again = db.load_taxonomy().await.unwrap();
        assert_eq!(again.type_ids().len(), 17);
        assert!(again.allows_nesting(crate::taxonomy::type_ids::CHAIN_LINK, crate::taxonomy::type_ids::CHAIN));
    }

    #[tokio::test]
    async fn test_rule_round_trip_with_type_links() {
        let db = create_test_db().await;
        db.seed_rule_templates().await.unwrap();

        let templates = db.list_rules(Some(true)).await.unwrap();
        assert_eq!(templates.len(), 8);

        let brake_bleed = templates
            .iter()
            .find(|r| r.name == "Bleed brake")
            .unwrap();
        assert_eq!(
            brake_bleed.component_type_ids,
            vec![
                crate::taxonomy::type_ids::FRONT_BRAKE,
                crate::taxonomy::type_ids::REAR_BRAKE
            ]
        );

        // Seeding again is a no-op
        db.seed_rule_templates().await.unwrap();
        assert_eq!(db.list_rules(Some(true)).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_measure_service_updates_component_wear() {
        let db = create_test_db().await;

        let bike = Bike::new("Trail", BikeSource::Local);
        db.create_bike(&bike).await.unwrap();
        let chain = Component::new(bike.id, 0);
        db.create_component(&chain).await.unwrap();

        let mut service = ServiceRecord::new(ServiceType::Measure);
        service.value = Some(62.5);
        service.component_ids = vec![chain.id];
        db.create_service(&service).await.unwrap();

        let chain = db.get_component(chain.id).await.unwrap().unwrap();
        assert_eq!(chain.value, Some(62.5));
        assert_eq!(db.service_count_for_component(chain.id).await.unwrap(), 1);

        let history = db.services_for_component(chain.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].component_ids, vec![chain.id]);
    }

    #[tokio::test]
    async fn test_activity_duplicate_file_name_rejected() {
        let db = create_test_db().await;

        let mut first = ActivityRecord::new(ActivitySource::LocalDevice);
        first.file_name = Some("ride.json".to_string());
        db.create_activity(&first).await.unwrap();

        let mut second = ActivityRecord::new(ActivitySource::LocalDevice);
        second.file_name = Some("ride.json".to_string());
        assert!(db.create_activity(&second).await.is_err());
    }
}
