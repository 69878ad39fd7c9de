//! On-disk snapshot format (spec §10 supplement 1): `metadata.lfs` holds one
//! length-prefixed, CRC32-trailed section per table this process owns.
//! Loading a graph replays this snapshot, then any changelog records newer
//! than its `metaversion` (spec §6 "Loading").
//!
//! Grounded on the teacher's `DataBlob` framing: each section is written as
//! a 4-byte little-endian length, the bincode-serialized payload, then a
//! 4-byte CRC32 of the payload, so a truncated write at the tail is
//! detectable without scanning the whole file.

use std::io::{self, Read, Write};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};

use crate::metadata::goal::GoalTable;
use crate::metadata::graph::MetadataGraph;
use crate::metadata::inode::{Inode, InodeId};
use crate::metadata::locks::LockTable;
use crate::metadata::quota::QuotaTable;
use crate::metadata::session::SessionTable;

#[derive(Debug, Serialize, Deserialize)]
struct GraphState {
    metaversion: u64,
    next_inode_id: u32,
    next_chunk_id: u64,
    inodes: Vec<(InodeId, Inode)>,
    chunks: Vec<(u64, u32, u32)>, // (chunk id, version, refcount)
    quota: QuotaTable,
    goals: GoalTable,
}

/// Full persisted state: the namespace graph plus the sibling tables a
/// daemon layer owns (locks, sessions) but that still need to survive a
/// restart (spec §10 supplement 1 and 3).
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    graph: GraphState,
    locks: LockTable,
    sessions: SessionTable,
}

fn write_section<W: Write, T: Serialize>(w: &mut W, value: &T) -> io::Result<()> {
    let payload = bincode::serialize(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut crc = Crc32::new();
    crc.update(&payload);
    let checksum = crc.finalize();

    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&payload)?;
    w.write_all(&checksum.to_le_bytes())?;
    Ok(())
}

fn read_section<R: Read, T: for<'de> Deserialize<'de>>(r: &mut R) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;

    let mut crc_buf = [0u8; 4];
    r.read_exact(&mut crc_buf)?;
    let stored = u32::from_le_bytes(crc_buf);

    let mut crc = Crc32::new();
    crc.update(&payload);
    if crc.finalize() != stored {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "snapshot section checksum mismatch"));
    }

    bincode::deserialize(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl Snapshot {
    pub fn capture(graph: &MetadataGraph, locks: &LockTable, sessions: &SessionTable) -> Snapshot {
        Snapshot {
            graph: GraphState {
                metaversion: graph.metaversion,
                next_inode_id: graph.next_inode_id,
                next_chunk_id: graph.next_chunk_id,
                inodes: graph.inodes.iter().map(|(id, inode)| (*id, inode.clone())).collect(),
                chunks: graph.chunks.iter().map(|(id, e)| (*id, e.version, e.refcount)).collect(),
                quota: graph.quota.clone(),
                goals: graph.goals.clone(),
            },
            locks: locks.clone(),
            sessions: sessions.clone(),
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        write_section(w, &self.graph)?;
        write_section(w, &self.locks)?;
        write_section(w, &self.sessions)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Snapshot> {
        let graph = read_section(r)?;
        let locks = read_section(r)?;
        let sessions = read_section(r)?;
        Ok(Snapshot { graph, locks, sessions })
    }

    /// Rebuilds a graph plus its sibling tables from this snapshot.
    /// Changelog records with `metaversion >= graph.metaversion()` must
    /// still be replayed afterward (spec §6 "Loading").
    pub fn restore(self) -> (MetadataGraph, LockTable, SessionTable) {
        let graph = MetadataGraph::from_snapshot_state(
            self.graph.metaversion,
            self.graph.next_inode_id,
            self.graph.next_chunk_id,
            self.graph.inodes,
            self.graph.chunks,
            self.graph.quota,
            self.graph.goals,
        );
        (graph, self.locks, self.sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::inode::Mode;

    #[test]
    fn snapshot_round_trips_through_bytes() {
        let mut graph = MetadataGraph::new(1000);
        graph.mkdir(InodeId::ROOT, b"d", Mode::RWXU, 0, 0, 1001).unwrap();
        let locks = LockTable::default();
        let sessions = SessionTable::default();

        let snap = Snapshot::capture(&graph, &locks, &sessions);
        let mut bytes = Vec::new();
        snap.write_to(&mut bytes).unwrap();

        let restored = Snapshot::read_from(&mut bytes.as_slice()).unwrap();
        let (restored_graph, _, _) = restored.restore();
        assert_eq!(restored_graph.metaversion, graph.metaversion);
        assert!(restored_graph.lookup(InodeId::ROOT, b"d").is_ok());
    }

    #[test]
    fn corrupted_payload_is_rejected_by_its_checksum() {
        let graph = MetadataGraph::new(1000);
        let locks = LockTable::default();
        let sessions = SessionTable::default();
        let snap = Snapshot::capture(&graph, &locks, &sessions);

        let mut bytes = Vec::new();
        snap.write_to(&mut bytes).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        assert!(Snapshot::read_from(&mut bytes.as_slice()).is_err());
    }
}
