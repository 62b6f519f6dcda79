//! Built-in task kinds and their handlers.
//!
//! | Kind | Policy | Critical |
//! |---|---|---|
//! | `object.upsert` | `GroupByKey` | yes |
//! | `object.delete` | `None` | yes |
//! | `cache.invalidate` | `DropSuperseded` | no |
//! | `file.write` | `DropSuperseded` | yes |
//! | `file.delete` | `None` | yes |
//!
//! Object kinds carry an [`ObjectPayload`] and go through an
//! [`ObjectRepository`], the seam to the node's persistence layer.

use crate::error::CoreResult;
use crate::registry::{
    ApplyError, ApplyOutcome, OptimizationPolicy, TaskHandler, TaskKind, TaskRegistryBuilder,
};
use farmsync_protocol::{ObjectPayload, Task};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Create or update an object.
pub const OBJECT_UPSERT: &str = "object.upsert";
/// Delete an object.
pub const OBJECT_DELETE: &str = "object.delete";
/// Drop a cache entry.
pub const CACHE_INVALIDATE: &str = "cache.invalidate";
/// Write a file below the shared root.
pub const FILE_WRITE: &str = "file.write";
/// Delete a file below the shared root.
pub const FILE_DELETE: &str = "file.delete";

/// Persistence layer that object tasks are applied to.
///
/// Both operations must be idempotent.
pub trait ObjectRepository: Send + Sync {
    /// Creates or updates the object stored under `key` and returns its
    /// local id.
    fn upsert(&self, object_type: &str, key: &str, object: &ObjectPayload)
        -> Result<i64, ApplyError>;

    /// Deletes the object if it exists. Returns true if something was
    /// deleted.
    fn delete(&self, object_type: &str, key: &str) -> Result<bool, ApplyError>;
}

/// An object held by [`ObjectStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    /// Local id.
    pub id: i64,
    /// Last applied payload.
    pub payload: ObjectPayload,
}

/// In-memory [`ObjectRepository`].
#[derive(Debug)]
pub struct ObjectStore {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
    next_id: RwLock<i64>,
}

impl ObjectStore {
    /// Creates an empty store whose ids start at 1.
    pub fn new() -> Self {
        Self::with_first_id(1)
    }

    /// Creates an empty store whose ids start at `first_id`.
    pub fn with_first_id(first_id: i64) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            next_id: RwLock::new(first_id),
        }
    }

    /// Returns the object stored under `key`.
    #[must_use]
    pub fn get(&self, object_type: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .get(&(object_type.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRepository for ObjectStore {
    fn upsert(
        &self,
        object_type: &str,
        key: &str,
        object: &ObjectPayload,
    ) -> Result<i64, ApplyError> {
        let mut objects = self.objects.write();
        let slot = (object_type.to_string(), key.to_string());
        if let Some(existing) = objects.get_mut(&slot) {
            existing.payload = object.clone();
            return Ok(existing.id);
        }
        let id = {
            let mut next = self.next_id.write();
            let id = *next;
            *next += 1;
            id
        };
        objects.insert(
            slot,
            StoredObject {
                id,
                payload: object.clone(),
            },
        );
        Ok(id)
    }

    fn delete(&self, object_type: &str, key: &str) -> Result<bool, ApplyError> {
        Ok(self
            .objects
            .write()
            .remove(&(object_type.to_string(), key.to_string()))
            .is_some())
    }
}

/// Applies `object.upsert` and `object.delete`.
pub struct ObjectHandler {
    repository: Arc<dyn ObjectRepository>,
    excluded: HashSet<String>,
}

impl ObjectHandler {
    /// Creates a handler writing to `repository`.
    pub fn new(repository: Arc<dyn ObjectRepository>) -> Self {
        Self {
            repository,
            excluded: HashSet::new(),
        }
    }

    /// Object types this node does not synchronize.
    #[must_use]
    pub fn with_excluded<I, S>(mut self, object_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded = object_types.into_iter().map(Into::into).collect();
        self
    }
}

impl TaskHandler for ObjectHandler {
    fn apply(&self, task: &Task) -> Result<ApplyOutcome, ApplyError> {
        if self.excluded.contains(&task.object_type) {
            debug!(object_type = %task.object_type, key = %task.target_key, "object type excluded");
            return Ok(ApplyOutcome::Skipped);
        }

        match task.kind.as_str() {
            OBJECT_DELETE => {
                self.repository.delete(&task.object_type, &task.target_key)?;
                Ok(ApplyOutcome::Applied)
            }
            _ => {
                let object = ObjectPayload::from_bytes(&task.payload)
                    .map_err(|e| ApplyError::new(e.to_string()))?;
                let id = self
                    .repository
                    .upsert(&task.object_type, &task.target_key, &object)?;
                Ok(ApplyOutcome::Assigned(id))
            }
        }
    }

    /// Later fields win; fields only the earlier payload set are kept.
    fn merge(&self, earlier: &Task, later: &Task) -> Vec<u8> {
        let (Ok(mut merged), Ok(newer)) = (
            ObjectPayload::from_bytes(&earlier.payload),
            ObjectPayload::from_bytes(&later.payload),
        ) else {
            return later.payload.clone();
        };

        merged.references.retain(|r| !newer.fields.contains_key(&r.field));
        merged.references.extend(newer.references);
        merged.fields.extend(newer.fields);
        merged.source_id = newer.source_id.or(merged.source_id);

        merged.to_bytes().unwrap_or_else(|_| later.payload.clone())
    }
}

/// Applies `cache.invalidate` by calling back into the node's cache.
pub struct CacheInvalidationHandler {
    invalidate: Box<dyn Fn(&str) + Send + Sync>,
}

impl CacheInvalidationHandler {
    /// Creates a handler calling `invalidate` with the cache key.
    pub fn new<F>(invalidate: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            invalidate: Box::new(invalidate),
        }
    }
}

impl TaskHandler for CacheInvalidationHandler {
    fn apply(&self, task: &Task) -> Result<ApplyOutcome, ApplyError> {
        (self.invalidate)(&task.target_key);
        Ok(ApplyOutcome::Applied)
    }
}

/// Applies `file.write` and `file.delete` below a root directory.
///
/// The task key is a relative path; absolute paths and `..` are refused.
#[derive(Debug, Clone, Default)]
pub struct FileSyncHandler {
    root: Option<PathBuf>,
}

impl FileSyncHandler {
    /// Creates a handler rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// A handler that refuses every task. Used on nodes that only emit
    /// file tasks.
    pub fn unconfigured() -> Self {
        Self { root: None }
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, ApplyError> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| ApplyError::new("file sync root not configured"))?;
        let path = Path::new(relative);
        let normal = path.components().all(|c| matches!(c, Component::Normal(_)));
        if relative.is_empty() || !normal {
            return Err(ApplyError::new(format!("refusing file path {relative:?}")));
        }
        Ok(root.join(path))
    }

    fn write(path: &Path, contents: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut temp = path.as_os_str().to_owned();
        temp.push(".farmsync-tmp");
        let temp = PathBuf::from(temp);
        fs::write(&temp, contents)?;
        fs::rename(&temp, path)
    }
}

impl TaskHandler for FileSyncHandler {
    fn apply(&self, task: &Task) -> Result<ApplyOutcome, ApplyError> {
        let path = self.resolve(&task.target_key)?;
        let result = match task.kind.as_str() {
            FILE_DELETE => match fs::remove_file(&path) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
            _ => Self::write(&path, &task.payload),
        };
        result.map_err(|e| ApplyError::new(format!("{}: {e}", path.display())))?;
        Ok(ApplyOutcome::Applied)
    }
}

/// Registers the built-in kinds.
pub struct BuiltinHandlers {
    objects: ObjectHandler,
    cache: CacheInvalidationHandler,
    files: FileSyncHandler,
}

impl BuiltinHandlers {
    /// Built-in handlers writing objects to `repository`, with no-op cache
    /// invalidation and no file root.
    pub fn new(repository: Arc<dyn ObjectRepository>) -> Self {
        Self {
            objects: ObjectHandler::new(repository),
            cache: CacheInvalidationHandler::new(|key| debug!(key, "cache entry invalidated")),
            files: FileSyncHandler::unconfigured(),
        }
    }

    /// Object types this node does not synchronize.
    #[must_use]
    pub fn with_excluded<I, S>(mut self, object_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.objects = self.objects.with_excluded(object_types);
        self
    }

    /// Sets the cache callback.
    #[must_use]
    pub fn with_cache<F>(mut self, invalidate: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.cache = CacheInvalidationHandler::new(invalidate);
        self
    }

    /// Sets the shared file root.
    #[must_use]
    pub fn with_file_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.files = FileSyncHandler::new(root);
        self
    }

    /// Adds the five built-in kinds to `builder`.
    ///
    /// # Errors
    ///
    /// `DuplicateRegistration` if one of the ids is already taken.
    pub fn register_into(self, builder: &mut TaskRegistryBuilder) -> CoreResult<()> {
        let objects = Arc::new(self.objects);
        let files = Arc::new(self.files);

        builder
            .register_kind(
                TaskKind::new(OBJECT_UPSERT, OptimizationPolicy::GroupByKey, true).staged_object(),
                objects.clone(),
            )?
            .register_kind(
                TaskKind::new(OBJECT_DELETE, OptimizationPolicy::None, true).staged_object(),
                objects,
            )?
            .register(
                CACHE_INVALIDATE,
                Arc::new(self.cache),
                OptimizationPolicy::DropSuperseded,
                false,
            )?
            .register(FILE_WRITE, files.clone(), OptimizationPolicy::DropSuperseded, true)?
            .register(FILE_DELETE, files, OptimizationPolicy::None, true)?;
        Ok(())
    }
}
