//! Core metadata graph and chunk I/O engine for a LizardFS-style distributed
//! filesystem.
//!
//! # Components
//!
//! The master side keeps a single in-memory namespace graph
//! ([`metadata::graph::MetadataGraph`]): inodes keyed by id, directory edges
//! as name -> id maps, trash/reserved lifecycle states, per-owner quotas,
//! byte-range locks, open-file sessions, and a recursive-task manager for
//! subtree-wide goal/trashtime/eattr changes. Every mutation is mirrored to
//! an append-only changelog ([`metadata::changelog`]) so a standby master or
//! a restarted process can reconstruct the same state by loading the most
//! recent [`metadata::snapshot::Snapshot`] and replaying anything newer.
//!
//! The client side resolves a chunk index into concrete chunkserver parts
//! ([`chunk::read_plan`]), drives replicated or XOR-erasure-coded writes
//! ([`chunk::writer`], [`chunk::replicator`]), and keeps a scored pool of
//! live chunkserver connections ([`chunk::connector`]).
//!
//! [`protocol`] frames the wire messages exchanged between these roles;
//! [`config`] parses the `-o key=val,...` mount option string and the
//! per-role config files.

pub mod chunk;
pub mod config;
pub mod error;
pub mod metadata;
pub mod net;
pub mod protocol;
