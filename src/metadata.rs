//! Master metadata graph: inodes, directory edges, quotas, locks, changelog,
//! recursive task manager, and the session registry (spec components C5-C9).

pub mod changelog;
pub mod goal;
pub mod graph;
pub mod inode;
pub mod locks;
pub mod quota;
pub mod session;
pub mod snapshot;
pub mod task;

pub use graph::MetadataGraph;
pub use inode::{Inode, InodeId};
