// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Raw-File Store
//!
//! Imported telemetry files are copied into a managed sub-directory and
//! addressed by file name from then on. The store only knows how to check
//! existence, copy in, resolve, and remove; which files belong to which
//! activity record is the database's business.

use std::path::{Path, PathBuf};

use crate::errors::{Result, WearError};

/// Managed storage for raw telemetry files.
#[derive(Debug, Clone)]
pub struct ActivityFileStore {
    directory: PathBuf,
}

impl ActivityFileStore {
    /// Open (creating if needed) the managed directory.
    pub async fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await?;
        Ok(Self { directory })
    }

    /// The managed directory path.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path a file name resolves to inside the managed directory.
    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.directory.join(file_name)
    }

    /// Canonical stored name for a source path: its final path component.
    pub fn file_name_of(path: &Path) -> Result<String> {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| WearError::NotFound(format!("no file name in {}", path.display())))
    }

    /// Whether a file with this name already exists in managed storage.
    pub async fn contains(&self, file_name: &str) -> bool {
        tokio::fs::try_exists(self.path_for(file_name))
            .await
            .unwrap_or(false)
    }

    /// Copy a source file into managed storage, returning the stored name.
    pub async fn copy_in(&self, source: &Path) -> Result<String> {
        let file_name = Self::file_name_of(source)?;
        tokio::fs::copy(source, self.path_for(&file_name)).await?;
        Ok(file_name)
    }

    /// Remove a stored file. Missing files are not an error.
    pub async fn remove(&self, file_name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(file_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
