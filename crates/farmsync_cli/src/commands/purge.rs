//! Purge command implementation.

use crate::node::NodeConfig;
use farmsync_core::{
    BuiltinHandlers, NodeDir, ObjectStore, TargetSet, TaskLogger, TaskRegistryBuilder,
};
use farmsync_protocol::ServerId;
use farmsync_storage::FileBackend;
use std::sync::Arc;

/// Runs the purge command.
///
/// Abandons every queued and held entry of `target`. The node must not be
/// running; the data directory lock is taken for the duration.
pub fn run(node: &NodeConfig, target: &str, yes: bool) -> Result<(), Box<dyn std::error::Error>> {
    let target = ServerId::new(target);
    if !node.targets.iter().any(|t| t.server_id == target) {
        return Err(format!("Target {target} is not in the node file").into());
    }

    let dir = NodeDir::open(&node.data_dir)?;
    let backend = FileBackend::open(&dir.journal_path())?;
    let mut builder = TaskRegistryBuilder::new();
    BuiltinHandlers::new(Arc::new(ObjectStore::new())).register_into(&mut builder)?;
    let targets = Arc::new(TargetSet::from_config(
        node.targets.clone(),
        node.persistence.max_pending,
    )?);
    let (logger, _) = TaskLogger::open(
        node.core_config(),
        Arc::new(builder.seal()),
        targets,
        Box::new(backend),
    )?;

    let state = logger.targets().require(&target)?;
    let queued = state.queue().len();
    let held = state.review().len();
    if !yes {
        println!("Target {target}: {queued} queued, {held} held");
        println!("Re-run with --yes to abandon them");
        return Ok(());
    }

    let abandoned = logger.purge_target(&target)?;
    println!("Abandoned {abandoned} entries for {target}");
    Ok(())
}
