//! Session registry (spec §10 supplement; implied by §4.5 and the GLOSSARY's
//! "Session" entry).
//!
//! Tracks the server-issued session id -> credentials/open-files/groups
//! mapping a client handle is built around (spec §6 client API:
//! `create_context(uid,gid,pid,umask)`).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::metadata::inode::{Gid, InodeId, SessionId, Uid};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub uid: Uid,
    pub gid: Gid,
    pub pid: u32,
    pub umask: u16,
    pub groups: Vec<Gid>,
    pub open_files: HashSet<InodeId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTable {
    sessions: HashMap<SessionId, SessionInfo>,
    next_id: SessionId,
}

impl SessionTable {
    pub fn open(&mut self, uid: Uid, gid: Gid, pid: u32, umask: u16) -> SessionId {
        self.next_id += 1;
        let id = self.next_id;
        self.sessions.insert(
            id,
            SessionInfo {
                uid,
                gid,
                pid,
                umask,
                groups: vec![gid],
                open_files: HashSet::new(),
            },
        );
        id
    }

    pub fn update_groups(&mut self, session: SessionId, groups: Vec<Gid>) -> bool {
        match self.sessions.get_mut(&session) {
            Some(info) => {
                info.groups = groups;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, session: SessionId) -> Option<&SessionInfo> {
        self.sessions.get(&session)
    }

    pub fn record_open(&mut self, session: SessionId, inode: InodeId) {
        if let Some(info) = self.sessions.get_mut(&session) {
            info.open_files.insert(inode);
        }
    }

    pub fn record_close(&mut self, session: SessionId, inode: InodeId) {
        if let Some(info) = self.sessions.get_mut(&session) {
            info.open_files.remove(&inode);
        }
    }

    /// Every inode this session still has open -- each one must drop the
    /// session from its own session set when the session closes entirely
    /// (spec §4.5 "session open-file semantics").
    pub fn close(&mut self, session: SessionId) -> Vec<InodeId> {
        self.sessions
            .remove(&session)
            .map(|info| info.open_files.into_iter().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_a_session_returns_its_open_files() {
        let mut table = SessionTable::default();
        let sid = table.open(1, 1, 100, 0o022);
        table.record_open(sid, InodeId(5));
        table.record_open(sid, InodeId(6));
        let mut closed = table.close(sid);
        closed.sort_by_key(|i| i.0);
        assert_eq!(closed, vec![InodeId(5), InodeId(6)]);
        assert!(table.get(sid).is_none());
    }
}
