//! Serve command implementation.
//!
//! Runs a complete node: recovers the journal, starts one dispatcher per
//! enabled target and serves the apply endpoint until Ctrl-C.
//!
//! Objects applied by `object.*` tasks are kept in memory; a CMS embeds
//! the crates and supplies its own `ObjectRepository` instead.

use crate::node::NodeConfig;
use farmsync_core::{
    BuiltinHandlers, NodeDir, ObjectStore, TargetSet, TaskLogger, TaskRegistry,
    TaskRegistryBuilder,
};
use farmsync_engine::{DispatchPool, HttpTransport, ReqwestClient, StagingManager};
use farmsync_server::SyncServer;
use farmsync_storage::FileBackend;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Runs the serve command.
pub fn run(node: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(node))
}

fn registry(node: &NodeConfig) -> Result<TaskRegistry, Box<dyn std::error::Error>> {
    let mut handlers = BuiltinHandlers::new(Arc::new(ObjectStore::new()))
        .with_excluded(node.receiver.excluded_types.clone())
        .with_cache(|key: &str| info!(key, "cache entry invalidated"));
    if let Some(root) = &node.receiver.file_root {
        handlers = handlers.with_file_root(root.clone());
    }

    let mut builder = TaskRegistryBuilder::new();
    handlers.register_into(&mut builder)?;
    Ok(builder.seal())
}

async fn serve(node: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let dir = NodeDir::open(&node.data_dir)?;
    let backend = FileBackend::open(&dir.journal_path())?;
    let registry = Arc::new(registry(&node)?);
    let targets = Arc::new(TargetSet::from_config(
        node.targets.clone(),
        node.persistence.max_pending,
    )?);

    let (logger, report) =
        TaskLogger::open(node.core_config(), Arc::clone(&registry), targets, Box::new(backend))?;
    if report.orphaned > 0 {
        warn!(
            entries = report.orphaned,
            "journal holds entries for targets missing from the node file"
        );
    }
    let logger = Arc::new(logger);

    let dispatch = node.dispatch_config();
    let client = ReqwestClient::new(dispatch.attempt_timeout)?;
    let transport = Arc::new(HttpTransport::new(node.server_id.clone(), client));
    let staging = Arc::new(StagingManager::new(Arc::clone(&logger)));
    let pool = DispatchPool::new(Arc::clone(&logger), transport, dispatch).with_preparer(staging);
    let started = pool.start();
    info!(server = %node.server_id, dispatchers = started, "node started");

    let server = Arc::new(
        SyncServer::new(node.server_config(), registry, Arc::clone(logger.stats()))
            .with_versions(Arc::clone(logger.versions())),
    );
    let listener = TcpListener::bind(node.listen).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
        }
    };
    server.serve(listener, shutdown).await?;

    pool.shutdown().await;
    let stats = logger.stats().snapshot();
    info!(
        logged = stats.tasks_logged,
        delivered = stats.tasks_delivered,
        applied = stats.tasks_applied,
        "node stopped"
    );
    Ok(())
}
