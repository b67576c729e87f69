//! Persistent Store Lifecycle Manager
//!
//! Opens, recovers or clears the `sled` store that backs the build state.
//! The store and the class output directory are only ever used as a pair:
//! whenever one is discarded, the other is deleted too.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::context::ProjectDescriptor;
use crate::error::{BuildError, Result};
use crate::files::delete_recursively;
use crate::log::RequestLog;
use crate::mappings::{Mappings, MAPPINGS_TREE};
use crate::relativizer::PathRelativizer;
use crate::target::{BuildRootIndex, ModuleTarget};

pub const CACHE_DB_FILE_NAME: &str = "jps-portable-cache.db";
pub const STORE_VERSION_KEY: &str = "store-version";
pub const STORE_VERSION: &str = "1";

/// Scoped owner of the open store. Closed on drop at the latest.
pub struct StorageManager {
    path: PathBuf,
    db: Option<sled::Db>,
}

impl StorageManager {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::Config::new().path(path).open()?;
        debug!(path = %path.display(), "cache storage opened");
        Ok(Self {
            path: path.to_path_buf(),
            db: Some(db),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn db(&self) -> Result<&sled::Db> {
        self.db
            .as_ref()
            .ok_or_else(|| BuildError::Corrupted(format!("{} is closed", self.path.display())))
    }

    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    /// Flush and release the store. Idempotent.
    pub fn force_close(&mut self) -> Result<()> {
        if let Some(db) = self.db.take() {
            db.flush()?;
            debug!(path = %self.path.display(), "cache storage closed");
        }
        Ok(())
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        if let Err(e) = self.force_close() {
            warn!(path = %self.path.display(), error = %e, "cannot close cache storage");
        }
    }
}

pub struct StorageInitializer {
    data_dir: PathBuf,
    class_out_dir: PathBuf,
    cache_db_file: PathBuf,
    storage: Option<StorageManager>,
    was_cleared: bool,
    is_clean_build: bool,
}

impl StorageInitializer {
    pub fn new(data_dir: impl Into<PathBuf>, class_out_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let cache_db_file = data_dir.join(CACHE_DB_FILE_NAME);
        Self {
            data_dir,
            class_out_dir: class_out_dir.into(),
            cache_db_file,
            storage: None,
            was_cleared: false,
            is_clean_build: false,
        }
    }

    pub fn cache_db_file(&self) -> &Path {
        &self.cache_db_file
    }

    pub fn is_clean_build(&self) -> bool {
        self.is_clean_build
    }

    pub fn was_cleared(&self) -> bool {
        self.was_cleared
    }

    pub fn storage(&self) -> Result<&StorageManager> {
        self.storage
            .as_ref()
            .ok_or_else(|| BuildError::Corrupted("cache storage is not initialized".to_string()))
    }

    /// Open the existing store, or start clean if there is none
    pub fn init(&mut self, log: &RequestLog, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;

        self.is_clean_build = !self.cache_db_file.exists();
        if self.is_clean_build && self.data_dir.is_dir() {
            log.info(format!(
                "remove {} and {} because no cache db file found: {}",
                self.data_dir.display(),
                self.class_out_dir.display(),
                self.cache_db_file.display()
            ));
            self.delete_dirs()?;
        }
        self.create_data_dir()?;

        match StorageManager::open(&self.cache_db_file) {
            Ok(storage) => {
                self.storage = Some(storage);
                Ok(())
            }
            Err(e) => {
                log.warn(format!("rebuild due to internal error: {e}"));
                self.clear_storage()?;
                self.open_after_clear(cancel)
            }
        }
    }

    /// Discard everything and open a fresh store
    pub fn clear_and_init(&mut self, log: &RequestLog, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        self.close(log);
        self.clear_storage()?;
        self.open_after_clear(cancel)
    }

    fn open_after_clear(&mut self, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        self.create_data_dir()?;
        self.storage = Some(StorageManager::open(&self.cache_db_file)?);
        Ok(())
    }

    /// Bind the target and its mappings to the open store. A failure clears
    /// the store and retries once, unless it was already cleared.
    pub fn create_project_descriptor(
        &mut self,
        log: &RequestLog,
        target: &ModuleTarget,
        relativizer: &Arc<PathRelativizer>,
        dependency_graph_enabled: bool,
        cancel: &CancelToken,
    ) -> Result<ProjectDescriptor> {
        loop {
            cancel.check()?;
            match self.bind_project(target, relativizer, dependency_graph_enabled) {
                Ok(project) => return Ok(project),
                Err(e) => {
                    self.close(log);
                    if self.was_cleared {
                        return Err(e);
                    }
                    log.warn(format!("cannot open cache storage: {e}"));
                    self.clear_and_init(log, cancel)?;
                }
            }
        }
    }

    fn bind_project(
        &self,
        target: &ModuleTarget,
        relativizer: &Arc<PathRelativizer>,
        dependency_graph_enabled: bool,
    ) -> Result<ProjectDescriptor> {
        let db = self.storage()?.db()?;
        match db.get(STORE_VERSION_KEY)? {
            None => {
                db.insert(STORE_VERSION_KEY, STORE_VERSION)?;
            }
            Some(version) if version.as_ref() == STORE_VERSION.as_bytes() => {}
            Some(version) => {
                return Err(BuildError::Corrupted(format!(
                    "unsupported cache storage version {}",
                    String::from_utf8_lossy(&version)
                )))
            }
        }

        let mappings = Mappings::new(
            db.open_tree(MAPPINGS_TREE)?,
            Arc::clone(relativizer),
            dependency_graph_enabled,
        );
        Ok(ProjectDescriptor {
            target: target.clone(),
            root_index: BuildRootIndex::new(target),
            mappings,
            relativizer: Arc::clone(relativizer),
        })
    }

    /// Delete the data and class output directories
    pub fn clear_storage(&mut self) -> Result<()> {
        self.is_clean_build = true;
        self.was_cleared = true;
        self.delete_dirs()
    }

    /// Force-close the store, logging instead of failing
    pub fn close(&mut self, log: &RequestLog) {
        if let Some(mut storage) = self.storage.take() {
            if let Err(e) = storage.force_close() {
                log.warn(format!("cannot close {}: {e}", storage.path().display()));
            }
        }
    }

    fn delete_dirs(&self) -> Result<()> {
        delete_recursively(&self.data_dir)?;
        delete_recursively(&self.class_out_dir)
    }

    fn create_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).map_err(|e| BuildError::io(&self.data_dir, e))
    }
}
