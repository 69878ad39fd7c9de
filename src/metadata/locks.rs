//! File locks (spec §4.7, component C7).
//!
//! Per inode, two range-lock tables: `flock` covers the single implicit
//! range `[0,1)`; `posix` covers arbitrary byte ranges. Both share the same
//! algorithm, parameterised by range.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Status;
use crate::metadata::inode::{InodeId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    pub owner: u64,
    pub session: SessionId,
    pub req_id: u64,
    pub msg_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64, // exclusive; u64::MAX means "to EOF"
}

impl ByteRange {
    pub const WHOLE_FLOCK: ByteRange = ByteRange { start: 0, end: 1 };

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Held {
    owner: LockOwner,
    range: ByteRange,
    kind: LockKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Pending {
    owner: LockOwner,
    range: ByteRange,
    kind: LockKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RangeLockTable {
    held: Vec<Held>,
    pending: Vec<Pending>,
}

impl RangeLockTable {
    fn collides(&self, range: ByteRange, kind: LockKind, owner: LockOwner) -> Option<LockOwner> {
        self.held.iter().find_map(|h| {
            if h.owner == owner || !h.range.overlaps(&range) {
                return None;
            }
            let conflict = kind == LockKind::Exclusive || h.kind == LockKind::Exclusive;
            if conflict {
                Some(h.owner)
            } else {
                None
            }
        })
    }

    /// Attempts to acquire; on failure, optionally registers a pending
    /// request (spec §4.7: "blocking calls register the request in a
    /// pending queue").
    fn acquire(&mut self, owner: LockOwner, range: ByteRange, kind: LockKind, blocking: bool) -> Result<(), Status> {
        if let Some(_conflict) = self.collides(range, kind, owner) {
            if blocking {
                self.pending.push(Pending { owner, range, kind });
            }
            return Err(Status::Waiting);
        }
        // Replace any existing lock from the same owner covering the same
        // range (e.g. shared -> exclusive upgrade).
        self.held.retain(|h| !(h.owner == owner && h.range.start == range.start && h.range.end == range.end));
        self.held.push(Held { owner, range, kind });
        Ok(())
    }

    fn unlock(&mut self, owner: LockOwner, range: ByteRange) -> Vec<LockOwner> {
        self.held.retain(|h| !(h.owner == owner && h.range.overlaps(&range)));
        self.wake_pending(range)
    }

    /// Scans the pending queue for requests whose range no longer collides
    /// with anything held, applying them in FIFO order (spec §4.7).
    fn wake_pending(&mut self, freed_range: ByteRange) -> Vec<LockOwner> {
        let mut woken = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            let candidate = self.pending[i];
            if !candidate.range.overlaps(&freed_range) {
                i += 1;
                continue;
            }
            if self.collides(candidate.range, candidate.kind, candidate.owner).is_none() {
                self.held.push(Held {
                    owner: candidate.owner,
                    range: candidate.range,
                    kind: candidate.kind,
                });
                woken.push(candidate.owner);
                self.pending.remove(i);
            } else {
                i += 1;
            }
        }
        woken
    }

    /// Releases every held and pending entry belonging to `owner`'s session
    /// (spec §4.7 `release`), returning whoever got woken as a result.
    fn release(&mut self, session: SessionId) -> Vec<LockOwner> {
        let freed: Vec<ByteRange> = self
            .held
            .iter()
            .filter(|h| h.owner.session == session)
            .map(|h| h.range)
            .collect();
        self.held.retain(|h| h.owner.session != session);
        self.pending.retain(|p| p.owner.session != session);
        let mut woken = Vec::new();
        for range in freed {
            woken.extend(self.wake_pending(range));
        }
        woken
    }

    fn probe(&self, range: ByteRange, kind: LockKind, owner: LockOwner) -> Option<LockOwner> {
        self.collides(range, kind, owner)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockTable {
    flock: HashMap<InodeId, RangeLockTable>,
    posix: HashMap<InodeId, RangeLockTable>,
}

impl LockTable {
    pub fn shared_lock(&mut self, posix: bool, inode: InodeId, owner: LockOwner, range: ByteRange, blocking: bool) -> Result<(), Status> {
        self.table(posix, inode).acquire(owner, range, LockKind::Shared, blocking)
    }

    pub fn exclusive_lock(&mut self, posix: bool, inode: InodeId, owner: LockOwner, range: ByteRange, blocking: bool) -> Result<(), Status> {
        self.table(posix, inode).acquire(owner, range, LockKind::Exclusive, blocking)
    }

    pub fn unlock(&mut self, posix: bool, inode: InodeId, owner: LockOwner, range: ByteRange) -> Vec<LockOwner> {
        self.table(posix, inode).unlock(owner, range)
    }

    pub fn release(&mut self, posix: bool, inode: InodeId, session: SessionId) -> Vec<LockOwner> {
        self.table(posix, inode).release(session)
    }

    pub fn probe(&self, posix: bool, inode: InodeId, owner: LockOwner, range: ByteRange, kind: LockKind) -> Option<LockOwner> {
        let table = if posix { self.posix.get(&inode) } else { self.flock.get(&inode) };
        table.and_then(|t| t.probe(range, kind, owner))
    }

    fn table(&mut self, posix: bool, inode: InodeId) -> &mut RangeLockTable {
        let map = if posix { &mut self.posix } else { &mut self.flock };
        map.entry(inode).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(n: u64) -> LockOwner {
        LockOwner { owner: n, session: n as u32, req_id: n, msg_id: 0 }
    }

    #[test]
    fn exclusive_locks_exclude_each_other() {
        let mut table = LockTable::default();
        let inode = InodeId(10);
        table.exclusive_lock(true, inode, owner(1), ByteRange { start: 0, end: 10 }, false).unwrap();
        let err = table.exclusive_lock(true, inode, owner(2), ByteRange { start: 5, end: 15 }, false);
        assert_eq!(err, Err(Status::Waiting));
    }

    #[test]
    fn shared_locks_coexist() {
        let mut table = LockTable::default();
        let inode = InodeId(11);
        table.shared_lock(true, inode, owner(1), ByteRange { start: 0, end: 10 }, false).unwrap();
        table.shared_lock(true, inode, owner(2), ByteRange { start: 5, end: 15 }, false).unwrap();
    }

    #[test]
    fn unlock_wakes_a_compatible_pending_request() {
        let mut table = LockTable::default();
        let inode = InodeId(12);
        let range = ByteRange { start: 0, end: 10 };
        table.exclusive_lock(true, inode, owner(1), range, false).unwrap();
        let err = table.exclusive_lock(true, inode, owner(2), range, true);
        assert_eq!(err, Err(Status::Waiting));
        let woken = table.unlock(true, inode, owner(1), range);
        assert_eq!(woken, vec![owner(2)]);
    }

    #[test]
    fn release_drops_both_held_and_pending_entries_for_a_session() {
        let mut table = LockTable::default();
        let inode = InodeId(13);
        let range = ByteRange { start: 0, end: 10 };
        table.exclusive_lock(true, inode, owner(1), range, false).unwrap();
        table.release(true, inode, 1);
        table.exclusive_lock(true, inode, owner(2), range, false).unwrap();
    }
}
