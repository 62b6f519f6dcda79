//! Task kinds and their handlers.
//!
//! Every module that produces or applies tasks registers its kinds on a
//! [`TaskRegistryBuilder`] during startup. [`TaskRegistryBuilder::seal`]
//! turns the builder into an immutable [`TaskRegistry`] which can be shared
//! across dispatcher and receiver threads without locking.

use crate::error::{CoreError, CoreResult};
use farmsync_protocol::{Task, TaskKindId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// How the optimizer treats pending entries of a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationPolicy {
    /// Every task is delivered.
    #[default]
    None,
    /// Pending tasks on the same key are merged into the earliest one.
    GroupByKey,
    /// A new task replaces pending tasks on the same key.
    DropSuperseded,
}

/// Immutable description of a task kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskKind {
    /// Kind identifier.
    pub id: TaskKindId,
    /// Optimization policy.
    pub policy: OptimizationPolicy,
    /// Whether delivery is required for correctness.
    pub is_critical: bool,
    /// Payload schema version emitted, and the highest one accepted.
    pub schema_version: u16,
    /// Whether the payload is an `ObjectPayload` subject to id translation.
    pub staged_object: bool,
}

impl TaskKind {
    /// Creates a kind with schema version 1.
    pub fn new(id: impl Into<TaskKindId>, policy: OptimizationPolicy, is_critical: bool) -> Self {
        Self {
            id: id.into(),
            policy,
            is_critical,
            schema_version: 1,
            staged_object: false,
        }
    }

    /// Sets the payload schema version.
    #[must_use]
    pub fn with_schema_version(mut self, version: u16) -> Self {
        self.schema_version = version;
        self
    }

    /// Marks the payload as a staged object.
    #[must_use]
    pub fn staged_object(mut self) -> Self {
        self.staged_object = true;
        self
    }
}

/// Result of applying a task on the receiving node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was applied (or was already in place).
    Applied,
    /// The change created an object and the local id is reported back.
    Assigned(i64),
    /// The task was deliberately not applied, e.g. the object type is
    /// excluded from synchronization on this node.
    Skipped,
}

/// A handler failed to apply a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApplyError {
    message: String,
}

impl ApplyError {
    /// Creates an apply error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Applies tasks of one kind.
///
/// `apply` must be idempotent: applying the same task twice leaves the
/// same observable state as applying it once (upsert by key,
/// delete-if-exists).
pub trait TaskHandler: Send + Sync {
    /// Applies a task to local state.
    fn apply(&self, task: &Task) -> Result<ApplyOutcome, ApplyError>;

    /// Combines two pending payloads for `GroupByKey` kinds.
    ///
    /// The default keeps the later payload.
    fn merge(&self, earlier: &Task, later: &Task) -> Vec<u8> {
        let _ = earlier;
        later.payload.clone()
    }
}

/// A kind together with its handler.
#[derive(Clone)]
pub struct RegisteredKind {
    kind: TaskKind,
    handler: Arc<dyn TaskHandler>,
}

impl RegisteredKind {
    /// Returns the kind description.
    #[must_use]
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// Returns the handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn TaskHandler> {
        &self.handler
    }
}

impl fmt::Debug for RegisteredKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredKind")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Collects registrations during startup.
#[derive(Debug, Default)]
pub struct TaskRegistryBuilder {
    kinds: HashMap<TaskKindId, RegisteredKind>,
}

impl TaskRegistryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kind by its parts.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRegistration` if the id is already registered.
    pub fn register(
        &mut self,
        kind: impl Into<TaskKindId>,
        handler: Arc<dyn TaskHandler>,
        policy: OptimizationPolicy,
        is_critical: bool,
    ) -> CoreResult<&mut Self> {
        self.register_kind(TaskKind::new(kind, policy, is_critical), handler)
    }

    /// Registers a fully described kind.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRegistration` if the id is already registered.
    pub fn register_kind(
        &mut self,
        kind: TaskKind,
        handler: Arc<dyn TaskHandler>,
    ) -> CoreResult<&mut Self> {
        if self.kinds.contains_key(&kind.id) {
            return Err(CoreError::DuplicateRegistration { kind: kind.id });
        }
        self.kinds
            .insert(kind.id.clone(), RegisteredKind { kind, handler });
        Ok(self)
    }

    /// Closes registration.
    #[must_use]
    pub fn seal(self) -> TaskRegistry {
        TaskRegistry { kinds: self.kinds }
    }
}

/// Sealed, read-only registry.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    kinds: HashMap<TaskKindId, RegisteredKind>,
}

impl TaskRegistry {
    /// Looks up a kind.
    #[must_use]
    pub fn lookup(&self, kind: &TaskKindId) -> Option<&RegisteredKind> {
        self.kinds.get(kind)
    }

    /// Looks up a kind, failing with `UnknownKind`.
    pub fn require(&self, kind: &TaskKindId) -> CoreResult<&RegisteredKind> {
        self.lookup(kind)
            .ok_or_else(|| CoreError::UnknownKind { kind: kind.clone() })
    }

    /// Returns true if the kind is critical. Unknown kinds count as critical.
    #[must_use]
    pub fn is_critical(&self, kind: &TaskKindId) -> bool {
        self.lookup(kind).map_or(true, |r| r.kind.is_critical)
    }

    /// Iterates over registered kinds in id order.
    pub fn kinds(&self) -> Vec<&TaskKind> {
        let mut kinds: Vec<_> = self.kinds.values().map(|r| &r.kind).collect();
        kinds.sort_by(|a, b| a.id.cmp(&b.id));
        kinds
    }

    /// Number of registered kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Returns true if nothing was registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
