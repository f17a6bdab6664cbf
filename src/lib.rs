// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Velo Wear
//!
//! Bicycle component wear tracking driven by activity telemetry. Imported
//! activities feed distance and time into the components of the bike they
//! were ridden on, and maintenance rules evaluate those accumulators to
//! tell you when a part is due for attention.
//!
//! ## Features
//!
//! - **Local import**: Decode device telemetry files, one activity each
//! - **Sensor inference**: Resolve recorded sensors to the bike they live on
//! - **Usage attribution**: Distance and time flow into every component,
//!   reversibly, clamped at zero
//! - **Remote sync**: Pull activities and gear from a connected service,
//!   reconciling lifetime gear distance into component wear
//! - **Maintenance rules**: Distance, riding-time, calendar, wear-measure
//!   and use-count thresholds, instantiated from templates per component type
//!
//! ## Architecture
//!
//! - **Models**: Activities, bikes, components, sensors, service records
//! - **Telemetry**: Decoder seam and message reduction
//! - **Database**: SQLite persistence and transactional usage propagation
//! - **Ingest**: The import and analysis pipeline
//! - **Remote**: Remote-service activity import and gear reconciliation
//! - **Taxonomy**: Component type tree and nesting validation
//! - **Rules**: Maintenance rule templates and due evaluation
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use velo_wear::database::Database;
//! use velo_wear::ingest::ActivityIngestor;
//! use velo_wear::storage::ActivityFileStore;
//! use velo_wear::telemetry::JsonTelemetryDecoder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let db = Database::new("sqlite:velo-wear.db").await?;
//!     let store = ActivityFileStore::new("activities").await?;
//!     let ingestor = ActivityIngestor::new(db, Arc::new(JsonTelemetryDecoder), store);
//!
//!     let record = ingestor
//!         .import_local_activity(std::path::Path::new("morning_ride.json"))
//!         .await?;
//!     println!("Imported: {}", record.name);
//!
//!     Ok(())
//! }
//! ```

/// Common data models for activities, bikes, components and sensors
pub mod models;

/// Telemetry decoding seam and message reduction
pub mod telemetry;

/// SQLite persistence and transactional usage propagation
pub mod database;

/// Archive of imported telemetry files
pub mod storage;

/// The local import and analysis pipeline
pub mod ingest;

/// Remote-service activity import and gear reconciliation
pub mod remote;

/// Component type tree and nesting validation
pub mod taxonomy;

/// Maintenance rule templates and due evaluation
pub mod rules;

/// Error types shared across the crate
pub mod errors;

/// Configuration management and persistence
pub mod config;

/// Structured logging setup
pub mod logging;
