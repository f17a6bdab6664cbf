// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types for the ingestion and wear-propagation pipeline.
//!
//! Structural and duplicate-detection failures surface before any mutation;
//! mid-pipeline failures trigger the import rollback contract first.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WearError {
    /// Referenced telemetry file or entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An activity record already references this file or external id.
    #[error("activity already imported: {0}")]
    AlreadyImported(String),

    /// Telemetry could not be decoded into messages.
    #[error("failed to decode telemetry: {0}")]
    DecodeError(String),

    /// Zero or more than one session summary in a single file.
    #[error("expected exactly one session message, found {0}")]
    InvalidSessionCount(usize),

    /// Underlying store commit failed.
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] sqlx::Error),

    /// Component parent edit would create a cycle or self-reference.
    #[error("structural violation: {0}")]
    StructuralViolation(String),

    /// Raw file could not be copied, read, or removed.
    #[error("file storage error: {0}")]
    FileStorage(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WearError>;
