//! Master daemon entry point. Parses its config from the first CLI
//! argument (a `-o key=val,...` style option string, spec §0.3/§6),
//! initializes the namespace graph, and logs readiness.
//!
//! The actual network accept loop ([`protocol::PacketCodec`] framing over
//! `tokio::net`) is out of scope for this crate's core library surface
//! (spec Non-goals: "no bundled network daemon binaries beyond thin CLI
//! wrappers exercising the library").

use anyhow::Result;
use log::info;

use lizardfs_core::config::MasterConfig;
use lizardfs_core::metadata::inode::InodeId;
use lizardfs_core::metadata::task::TaskManager;
use lizardfs_core::metadata::MetadataGraph;

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Drains every pending task under the round-robin fairness policy (spec
/// §4.9, §5), mutating `graph` through its `task_visit` closure -- the same
/// wiring a running daemon's per-tick scheduler step would use.
fn drain_tasks(graph: &mut MetadataGraph, tasks: &mut TaskManager, now: i64) {
    while let Some((id, finished)) = tasks.run_one_batch(&mut |inode, kind| graph.task_visit(inode, kind, now)) {
        if let Some(counts) = finished {
            info!("task {} finished: changed={} not_changed={} not_permitted={}", id, counts.changed, counts.not_changed, counts.not_permitted);
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let opts = std::env::args().nth(1).unwrap_or_default();
    let config = MasterConfig::from_options(&opts)?;
    info!("starting lizardfs-master, data_dir={}", config.data_dir);

    let now = now_unix();
    let mut graph = MetadataGraph::new(now);
    info!("namespace graph initialized, metaversion={}", graph.metaversion);

    // Startup maintenance: normalize every inode's trashtime to the
    // configured default, the same recursive-settrashtime task an admin CLI
    // would submit against the root.
    let mut tasks = TaskManager::default();
    tasks.submit(lizardfs_core::metadata::task::TaskKind::SetTrashtime(config.default_trashtime), InodeId::ROOT);
    drain_tasks(&mut graph, &mut tasks, now);

    let swept = graph.sweep_expired_trash(now);
    if swept > 0 {
        info!("swept {} expired trash inodes on startup", swept);
    }

    Ok(())
}
