use crate::dispatcher::{Preparation, TaskPreparer};
use crate::error::{EngineError, EngineResult};
use crate::staging::translation::TranslationTable;
use farmsync_core::{unix_millis, TargetState, TaskLogger, OBJECT_DELETE, OBJECT_UPSERT};
use farmsync_protocol::{
    ApplyResponse, ObjectPayload, ObjectReference, SequenceId, ServerId, Task, TaskKindId,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Dependencies of dependencies are followed at most this deep.
const MAX_DEPENDENCY_DEPTH: usize = 16;

/// An object the target is missing, as supplied by a [`DependencyResolver`].
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    /// Object type.
    pub object_type: String,
    /// Key the object is stored under.
    pub target_key: String,
    /// Current state of the object in the source environment.
    pub payload: ObjectPayload,
}

/// Looks up source-environment objects that a staged object references.
pub trait DependencyResolver: Send + Sync {
    /// Returns the referenced object, or `None` if it does not exist.
    fn resolve(&self, object_type: &str, source_id: i64) -> Option<Dependency>;
}

/// Translates references of staged objects and gates manual approval.
///
/// Installed as the [`TaskPreparer`] of a dispatch pool, it runs for
/// staging targets only.
pub struct StagingManager {
    logger: Arc<TaskLogger>,
    translations: Arc<TranslationTable>,
    resolver: Option<Arc<dyn DependencyResolver>>,
}

impl StagingManager {
    /// Creates a manager without a resolver.
    pub fn new(logger: Arc<TaskLogger>) -> Self {
        Self {
            logger,
            translations: Arc::new(TranslationTable::new()),
            resolver: None,
        }
    }

    /// Sets the dependency resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// The translation table.
    pub fn translations(&self) -> &Arc<TranslationTable> {
        &self.translations
    }

    /// Tasks waiting for review on a manual staging target.
    ///
    /// # Errors
    ///
    /// `UnknownTarget` if it is not configured.
    pub fn held(&self, target: &ServerId) -> EngineResult<Vec<Task>> {
        Ok(self.logger.targets().require(target)?.review().list())
    }

    /// Releases held tasks after checking that every referenced object is
    /// either known to the target, released or queued ahead of them, or
    /// resolvable.
    ///
    /// # Errors
    ///
    /// `MissingDependency` naming the first unresolvable reference; nothing
    /// is released in that case.
    pub fn approve(&self, target: &ServerId, selected: &[SequenceId]) -> EngineResult<Vec<Task>> {
        let state = self.logger.targets().require(target)?;
        let releasing = state.review().release_set(selected);
        let queued: Vec<Task> = state.queue().snapshot().into_iter().map(|e| e.task).collect();

        for (index, task) in releasing.iter().enumerate() {
            let Some(object) = self.staged_payload(task)? else {
                continue;
            };
            for reference in &object.references {
                let satisfied = self
                    .translations
                    .get(target, &reference.object_type, reference.source_id)
                    .is_some()
                    || queued
                        .iter()
                        .chain(&releasing[..index])
                        .any(|earlier| self.provides(earlier, reference))
                    || self
                        .resolver
                        .as_ref()
                        .is_some_and(|r| r.resolve(&reference.object_type, reference.source_id).is_some());
                if !satisfied {
                    warn!(
                        target = %target,
                        sequence_id = %task.sequence_id,
                        object_type = %reference.object_type,
                        source_id = reference.source_id,
                        "approval blocked by missing dependency"
                    );
                    return Err(missing(target, reference));
                }
            }
        }

        let released = self.logger.approve(target, selected)?;
        info!(target = %target, count = released.len(), "staging tasks approved");
        Ok(released)
    }

    /// Discards held tasks.
    ///
    /// # Errors
    ///
    /// `UnknownTarget`, or journal errors.
    pub fn reject(&self, target: &ServerId, selected: &[SequenceId]) -> EngineResult<Vec<Task>> {
        Ok(self.logger.reject(target, selected)?)
    }

    fn staged_payload(&self, task: &Task) -> EngineResult<Option<ObjectPayload>> {
        let staged = self
            .logger
            .registry()
            .lookup(&task.kind)
            .is_some_and(|r| r.kind().staged_object);
        if !staged || task.payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(ObjectPayload::from_bytes(&task.payload)?))
    }

    fn provides(&self, task: &Task, reference: &ObjectReference) -> bool {
        if task.object_type != reference.object_type || task.kind.as_str() == OBJECT_DELETE {
            return false;
        }
        matches!(
            self.staged_payload(task),
            Ok(Some(object)) if object.source_id == Some(reference.source_id)
        )
    }

    fn dependencies_for(
        &self,
        target: &ServerId,
        first: ObjectReference,
    ) -> EngineResult<Vec<Task>> {
        let Some(resolver) = &self.resolver else {
            return Err(missing(target, &first));
        };

        let mut wanted = first;
        for _ in 0..MAX_DEPENDENCY_DEPTH {
            let dependency = resolver
                .resolve(&wanted.object_type, wanted.source_id)
                .ok_or_else(|| missing(target, &wanted))?;
            let mut object = dependency.payload;
            object.source_id = Some(wanted.source_id);

            match object.rewrite_references(|r| {
                self.translations.get(target, &r.object_type, r.source_id)
            }) {
                Ok(()) => {
                    return Ok(vec![self.dependency_task(
                        dependency.object_type,
                        dependency.target_key,
                        &object,
                    )?]);
                }
                Err(deeper) => wanted = deeper,
            }
        }
        Err(EngineError::DependencyChain {
            depth: MAX_DEPENDENCY_DEPTH,
        })
    }

    fn dependency_task(
        &self,
        object_type: String,
        target_key: String,
        object: &ObjectPayload,
    ) -> EngineResult<Task> {
        let kind = TaskKindId::new(OBJECT_UPSERT);
        let schema_version = self
            .logger
            .registry()
            .lookup(&kind)
            .map_or(1, |r| r.kind().schema_version);
        Ok(Task {
            sequence_id: SequenceId::UNSEQUENCED,
            kind,
            object_type,
            target_key,
            payload: object.to_bytes()?,
            origin: self.logger.server_id().clone(),
            created_at: unix_millis(),
            groups: Vec::new(),
            schema_version,
        })
    }
}

fn missing(target: &ServerId, reference: &ObjectReference) -> EngineError {
    EngineError::MissingDependency {
        target: target.clone(),
        object_type: reference.object_type.clone(),
        source_id: reference.source_id,
    }
}

impl TaskPreparer for StagingManager {
    fn prepare(&self, target: &TargetState, batch: Vec<Task>) -> EngineResult<Preparation> {
        let target_id = target.server_id();
        let mut ready: Vec<Task> = Vec::with_capacity(batch.len());

        for task in batch {
            let Some(mut object) = self.staged_payload(&task)? else {
                ready.push(task);
                continue;
            };
            match object.rewrite_references(|r| {
                self.translations.get(target_id, &r.object_type, r.source_id)
            }) {
                Ok(()) => ready.push(task.with_payload(object.to_bytes()?)),
                // An earlier task in this batch may supply it; send up to here.
                Err(_) if !ready.is_empty() => break,
                Err(reference) => {
                    return Ok(Preparation::Dependencies(
                        self.dependencies_for(target_id, reference)?,
                    ));
                }
            }
        }
        Ok(Preparation::Ready(ready))
    }

    fn observe(&self, target: &TargetState, sent: &[Task], response: &ApplyResponse) {
        for (task, ack) in sent.iter().zip(&response.acks) {
            let Some(assigned) = ack.assigned_id.filter(|_| ack.is_ack()) else {
                continue;
            };
            let source_id = ObjectPayload::from_bytes(&task.payload)
                .ok()
                .and_then(|o| o.source_id);
            if let Some(source_id) = source_id {
                self.translations
                    .insert(target.server_id(), &task.object_type, source_id, assigned);
                debug!(
                    target = %target.server_id(),
                    object_type = %task.object_type,
                    source_id,
                    assigned,
                    "translation learned"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmsync_core::{
        BuiltinHandlers, CoreConfig, DeliveryTarget, ObjectStore, StagingMode, TargetSet,
        TaskDraft, TaskRegistryBuilder,
    };
    use farmsync_protocol::TaskAck;
    use serde_json::json;
    use std::collections::HashMap;

    struct Source(HashMap<i64, Dependency>);

    impl DependencyResolver for Source {
        fn resolve(&self, _object_type: &str, source_id: i64) -> Option<Dependency> {
            self.0.get(&source_id).cloned()
        }
    }

    fn logger(mode: StagingMode) -> Arc<TaskLogger> {
        let mut builder = TaskRegistryBuilder::new();
        BuiltinHandlers::new(Arc::new(ObjectStore::new()))
            .register_into(&mut builder)
            .unwrap();
        let targets = TargetSet::from_config(
            [DeliveryTarget::staging("stage", "http://stage", "t", mode)],
            100,
        )
        .unwrap();
        Arc::new(TaskLogger::in_memory(
            CoreConfig::new("source"),
            Arc::new(builder.seal()),
            Arc::new(targets),
        ))
    }

    fn document(id: i64, parent: Option<i64>) -> ObjectPayload {
        let object = ObjectPayload::new()
            .with_source_id(id)
            .with_field("title", json!(format!("doc {id}")));
        match parent {
            Some(parent) => object.with_reference("parentId", "cms.document", parent),
            None => object,
        }
    }

    fn log(logger: &TaskLogger, object: &ObjectPayload) -> Task {
        let key = format!("doc:{}", object.source_id.unwrap_or_default());
        logger
            .log(TaskDraft::new(OBJECT_UPSERT, "cms.document", key, object.to_bytes().unwrap()))
            .unwrap()
    }

    fn stage() -> ServerId {
        "stage".into()
    }

    #[test]
    fn known_references_are_rewritten() {
        let logger = logger(StagingMode::Automatic);
        let manager = StagingManager::new(logger.clone());
        manager.translations().insert(&stage(), "cms.document", 1, 501);
        let task = log(&logger, &document(2, Some(1)));

        let target = logger.targets().require(&stage()).unwrap();
        let Preparation::Ready(tasks) = manager.prepare(&target, vec![task]).unwrap() else {
            panic!("expected a ready batch");
        };
        let object = ObjectPayload::from_bytes(&tasks[0].payload).unwrap();
        assert_eq!(object.fields["parentId"], json!(501));
        assert_eq!(object.references[0].source_id, 1);
    }

    #[test]
    fn missing_reference_sends_dependency_first() {
        let logger = logger(StagingMode::Automatic);
        let source = Source(HashMap::from([(
            1,
            Dependency {
                object_type: "cms.document".into(),
                target_key: "doc:1".into(),
                payload: document(1, None),
            },
        )]));
        let manager = StagingManager::new(logger.clone()).with_resolver(Arc::new(source));
        let task = log(&logger, &document(2, Some(1)));
        let target = logger.targets().require(&stage()).unwrap();

        let Preparation::Dependencies(dependencies) =
            manager.prepare(&target, vec![task.clone()]).unwrap()
        else {
            panic!("expected dependencies");
        };
        assert_eq!(dependencies.len(), 1);
        assert!(dependencies[0].sequence_id.is_unsequenced());
        assert_eq!(dependencies[0].target_key, "doc:1");

        let response = ApplyResponse {
            acks: vec![TaskAck::ack_assigned(SequenceId::UNSEQUENCED, 900)],
        };
        manager.observe(&target, &dependencies, &response);
        assert_eq!(manager.translations().get(&stage(), "cms.document", 1), Some(900));

        assert!(matches!(
            manager.prepare(&target, vec![task]).unwrap(),
            Preparation::Ready(tasks) if tasks.len() == 1
        ));
    }

    #[test]
    fn unresolvable_reference_is_reported() {
        let logger = logger(StagingMode::Automatic);
        let manager = StagingManager::new(logger.clone());
        let task = log(&logger, &document(2, Some(77)));
        let target = logger.targets().require(&stage()).unwrap();

        let err = manager.prepare(&target, vec![task]).unwrap_err();
        assert!(matches!(err, EngineError::MissingDependency { source_id: 77, .. }));
    }

    #[test]
    fn batch_stops_before_reference_to_earlier_task() {
        let logger = logger(StagingMode::Automatic);
        let manager = StagingManager::new(logger.clone());
        let parent = log(&logger, &document(1, None));
        let child = log(&logger, &document(2, Some(1)));
        let target = logger.targets().require(&stage()).unwrap();

        let Preparation::Ready(tasks) = manager.prepare(&target, vec![parent, child]).unwrap() else {
            panic!("expected a ready batch");
        };
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].target_key, "doc:1");
    }

    #[test]
    fn approve_checks_dependencies() {
        let logger = logger(StagingMode::Manual);
        let manager = StagingManager::new(logger.clone());
        let parent = log(&logger, &document(1, None));
        let orphan = log(&logger, &document(3, Some(99)));
        let child = log(&logger, &document(2, Some(1)));

        let err = manager.approve(&stage(), &[orphan.sequence_id]).unwrap_err();
        assert!(matches!(err, EngineError::MissingDependency { source_id: 99, .. }));
        assert_eq!(manager.held(&stage()).unwrap().len(), 3);

        // the parent is released in the same approval, ahead of the child
        let released = manager
            .approve(&stage(), &[parent.sequence_id, child.sequence_id])
            .unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(manager.held(&stage()).unwrap().len(), 1);

        manager.reject(&stage(), &[orphan.sequence_id]).unwrap();
        assert!(manager.held(&stage()).unwrap().is_empty());
    }

    #[test]
    fn child_alone_is_blocked_until_parent_is_queued() {
        let logger = logger(StagingMode::Manual);
        let manager = StagingManager::new(logger.clone());
        let parent = log(&logger, &document(1, None));
        let child = log(&logger, &document(2, Some(1)));

        assert!(manager.approve(&stage(), &[child.sequence_id]).is_err());
        manager.approve(&stage(), &[parent.sequence_id]).unwrap();
        manager.approve(&stage(), &[child.sequence_id]).unwrap();

        let queued = logger.targets().require(&stage()).unwrap().queue().len();
        assert_eq!(queued, 2);
    }
}
