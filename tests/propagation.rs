// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Usage-delta invariants: reversibility, source gating, clamping and
//! gear-distance reconciliation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use velo_wear::database::Database;
use velo_wear::ingest::ActivityIngestor;
use velo_wear::models::{Bike, BikeSource, Component, Sensor};
use velo_wear::remote::{RemoteActivitySummary, RemoteGear, RemoteImporter};
use velo_wear::storage::ActivityFileStore;
use velo_wear::taxonomy::type_ids;
use velo_wear::telemetry::JsonTelemetryDecoder;

async fn setup(dir: &Path) -> (Database, ActivityIngestor) {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let store = ActivityFileStore::new(dir.join("activities")).await.unwrap();
    let ingestor = ActivityIngestor::new(db.clone(), Arc::new(JsonTelemetryDecoder), store);
    (db, ingestor)
}

async fn write_fixture(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    tokio::fs::write(&path, body).await.unwrap();
    path
}

async fn local_bike_with_chain(db: &Database, serial_no: i64) -> (Bike, Component) {
    let bike = Bike::new("Hardtail", BikeSource::Local);
    db.create_bike(&bike).await.unwrap();
    let chain = Component::new(bike.id, type_ids::CHAIN);
    db.create_component(&chain).await.unwrap();
    let mut sensor = Sensor::new(serial_no);
    sensor.bike_id = Some(bike.id);
    db.create_sensor(&sensor).await.unwrap();
    (bike, chain)
}

const RIDE: &str = r#"[
    {"kind": "session", "total_distance_m": 20000.0, "total_timer_time_s": 3600.0},
    {"kind": "device_info", "device_index": 1, "serial_no": 12345}
]"#;

#[tokio::test]
async fn delete_fully_reverses_attributed_usage() {
    let dir = tempfile::tempdir().unwrap();
    let (db, ingestor) = setup(dir.path()).await;
    let (_bike, chain) = local_bike_with_chain(&db, 12345).await;

    let path = write_fixture(dir.path(), "ride.json", RIDE).await;
    let record = ingestor.import_local_activity(&path).await.unwrap();

    let c = db.get_component(chain.id).await.unwrap().unwrap();
    assert_eq!(c.distance_m, 20000.0);
    assert_eq!(c.duration_s, 3600);

    ingestor.delete_activity(record.id).await.unwrap();

    let c = db.get_component(chain.id).await.unwrap().unwrap();
    assert_eq!(c.distance_m, 0.0);
    assert_eq!(c.duration_s, 0);
}

#[tokio::test]
async fn relinked_sensor_moves_usage_on_reanalysis() {
    let dir = tempfile::tempdir().unwrap();
    let (db, ingestor) = setup(dir.path()).await;
    let (_old_bike, old_chain) = local_bike_with_chain(&db, 12345).await;

    let path = write_fixture(dir.path(), "ride.json", RIDE).await;
    let record = ingestor.import_local_activity(&path).await.unwrap();

    // The sensor was actually mounted on a different bike; relink and
    // re-analyze
    let new_bike = Bike::new("Gravel", BikeSource::Local);
    db.create_bike(&new_bike).await.unwrap();
    let new_chain = Component::new(new_bike.id, type_ids::CHAIN);
    db.create_component(&new_chain).await.unwrap();
    db.link_sensor_to_bike(12345, Some(new_bike.id)).await.unwrap();

    ingestor.analyze_activity(record.id).await.unwrap();

    let old = db.get_component(old_chain.id).await.unwrap().unwrap();
    assert_eq!(old.distance_m, 0.0);
    assert_eq!(old.duration_s, 0);

    let new = db.get_component(new_chain.id).await.unwrap().unwrap();
    assert_eq!(new.distance_m, 20000.0);
    assert_eq!(new.duration_s, 3600);

    let record = db.get_activity(record.id).await.unwrap().unwrap();
    assert_eq!(record.bike_id, Some(new_bike.id));
}

#[tokio::test]
async fn retired_components_stop_accumulating() {
    let dir = tempfile::tempdir().unwrap();
    let (db, ingestor) = setup(dir.path()).await;
    let (bike, chain) = local_bike_with_chain(&db, 12345).await;

    let mut worn_out = db.get_component(chain.id).await.unwrap().unwrap();
    worn_out.retire();
    db.update_component(&worn_out).await.unwrap();

    let fresh = Component::new(bike.id, type_ids::CHAIN);
    db.create_component(&fresh).await.unwrap();

    let path = write_fixture(dir.path(), "ride.json", RIDE).await;
    ingestor.import_local_activity(&path).await.unwrap();

    let worn_out = db.get_component(chain.id).await.unwrap().unwrap();
    assert_eq!(worn_out.distance_m, 0.0);
    let fresh = db.get_component(fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.distance_m, 20000.0);
}

#[tokio::test]
async fn remote_activity_distance_stays_out_of_remote_bikes() {
    let db = Database::new("sqlite::memory:").await.unwrap();

    let mut bike = Bike::new("Roadie", BikeSource::Remote);
    bike.external_id = Some("g1".to_string());
    db.create_bike(&bike).await.unwrap();
    let chain = Component::new(bike.id, type_ids::CHAIN);
    db.create_component(&chain).await.unwrap();

    let importer = RemoteImporter::new(db.clone());
    let summary = RemoteActivitySummary {
        id: "a1".to_string(),
        name: "Lunch Ride".to_string(),
        sport_type: Some("Ride".to_string()),
        start_date: None,
        distance: 30000.0,
        moving_time: 5400,
        average_watts: None,
        average_speed: None,
        total_elevation_gain: None,
        kilojoules: None,
        summary_polyline: None,
        gear_id: Some("g1".to_string()),
    };
    importer.import_remote_activity(summary).await.unwrap();

    // Duration propagates, distance waits for gear reconciliation
    let c = db.get_component(chain.id).await.unwrap().unwrap();
    assert_eq!(c.duration_s, 5400);
    assert_eq!(c.distance_m, 0.0);

    let roster = vec![RemoteGear {
        id: "g1".to_string(),
        name: "Roadie".to_string(),
        brand_name: None,
        model_name: None,
        distance: 30000.0,
        frame_type: None,
    }];
    importer.sync_gear(&roster).await.unwrap();

    let c = db.get_component(chain.id).await.unwrap().unwrap();
    assert_eq!(c.distance_m, 30000.0);
}

#[tokio::test]
async fn reversal_clamps_rather_than_going_negative() {
    let dir = tempfile::tempdir().unwrap();
    let (db, ingestor) = setup(dir.path()).await;
    let (bike, _chain) = local_bike_with_chain(&db, 12345).await;

    let path = write_fixture(dir.path(), "ride.json", RIDE).await;
    let record = ingestor.import_local_activity(&path).await.unwrap();

    // A replacement part installed after the ride has zero usage
    let installed_later = Component::new(bike.id, type_ids::CASSETTE);
    db.create_component(&installed_later).await.unwrap();

    ingestor.delete_activity(record.id).await.unwrap();

    let c = db.get_component(installed_later.id).await.unwrap().unwrap();
    assert_eq!(c.distance_m, 0.0);
    assert_eq!(c.duration_s, 0);
}
