//! Inode data model (spec §3).

use std::collections::{BTreeMap, HashSet};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub type Uid = u32;
pub type Gid = u32;
pub type SessionId = u32;
pub type ChunkId = u64;
pub type GoalId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(pub u32);

impl InodeId {
    pub const ROOT: InodeId = InodeId(1);
}

impl std::fmt::Display for InodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    #[derive(Serialize, Deserialize)]
    pub struct Mode: u16 {
        const SUID = 0o4000;
        const SGID = 0o2000;
        const STICKY = 0o1000;
        const RWXU = 0o0700;
        const RWXG = 0o0070;
        const RWXO = 0o0007;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtendedAttributes {
    pub entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub tag: AclTag,
    pub perm: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclTag {
    UserObj,
    User(Uid),
    GroupObj,
    Group(Gid),
    Mask,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Acl {
    pub access: Vec<AclEntry>,
    pub default: Vec<AclEntry>,
}

/// Common fields every inode variant carries (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeHeader {
    pub id: InodeId,
    pub mode: Mode,
    pub uid: Uid,
    pub gid: Gid,
    pub atime: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub goal: GoalId,
    pub trashtime: u32,
    pub eattr: u16,
    pub xattrs: Option<ExtendedAttributes>,
    pub acl: Option<Acl>,
    pub checksum: u64,
    pub parents: Vec<InodeId>,
}

impl InodeHeader {
    pub fn new(id: InodeId, mode: Mode, uid: Uid, gid: Gid, now: i64) -> Self {
        InodeHeader {
            id,
            mode,
            uid,
            gid,
            atime: now,
            ctime: now,
            mtime: now,
            goal: 1,
            trashtime: 86400,
            eattr: 0,
            xattrs: None,
            acl: None,
            checksum: 0,
            parents: Vec::new(),
        }
    }
}

/// Aggregated recursive directory statistics (spec §3, invariant I3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirStats {
    pub inodes: u64,
    pub dirs: u64,
    pub files: u64,
    pub chunks: u64,
    pub length: u64,
    pub size: u64,
    pub realsize: u64,
}

impl DirStats {
    pub fn add(&mut self, other: DirStats) {
        self.inodes += other.inodes;
        self.dirs += other.dirs;
        self.files += other.files;
        self.chunks += other.chunks;
        self.length += other.length;
        self.size += other.size;
        self.realsize += other.realsize;
    }

    pub fn sub(&mut self, other: DirStats) {
        self.inodes = self.inodes.saturating_sub(other.inodes);
        self.dirs = self.dirs.saturating_sub(other.dirs);
        self.files = self.files.saturating_sub(other.files);
        self.chunks = self.chunks.saturating_sub(other.chunks);
        self.length = self.length.saturating_sub(other.length);
        self.size = self.size.saturating_sub(other.size);
        self.realsize = self.realsize.saturating_sub(other.realsize);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryData {
    pub children: BTreeMap<Vec<u8>, InodeId>,
    pub stats: DirStats,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    pub length: u64,
    pub chunks: Vec<Option<ChunkId>>,
    pub sessions: HashSet<SessionId>,
}

impl FileData {
    /// Bytes actually occupied on chunkservers given the current goal
    /// (replica count or XOR level), used for the `size`/`realsize` stats.
    pub fn size(&self) -> u64 {
        self.length
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkData {
    pub target: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceData {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrashData {
    pub file: FileData,
    pub restorable_path: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedData {
    pub file: FileData,
}

/// A tagged inode variant (spec §3): the arena-of-inodes design (spec §9)
/// stores these keyed by [`InodeId`] rather than as a C++ pointer graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    Directory(DirectoryData),
    File(FileData),
    Symlink(SymlinkData),
    CharDevice(DeviceData),
    BlockDevice(DeviceData),
    Fifo,
    Socket,
    Trash(TrashData),
    Reserved(ReservedData),
}

impl InodeKind {
    pub fn is_directory(&self) -> bool {
        matches!(self, InodeKind::Directory(_))
    }

    pub fn is_trash(&self) -> bool {
        matches!(self, InodeKind::Trash(_))
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self, InodeKind::Reserved(_))
    }

    pub fn file_data(&self) -> Option<&FileData> {
        match self {
            InodeKind::File(f) => Some(f),
            InodeKind::Trash(t) => Some(&t.file),
            InodeKind::Reserved(r) => Some(&r.file),
            _ => None,
        }
    }

    pub fn file_data_mut(&mut self) -> Option<&mut FileData> {
        match self {
            InodeKind::File(f) => Some(f),
            InodeKind::Trash(t) => Some(&mut t.file),
            InodeKind::Reserved(r) => Some(&mut r.file),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub header: InodeHeader,
    pub kind: InodeKind,
}

impl Inode {
    pub fn id(&self) -> InodeId {
        self.header.id
    }

    /// Recomputes this inode's local checksum from its current fields
    /// (spec §3: "on every field mutation the local checksum is recomputed").
    pub fn recompute_checksum(&mut self) {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.header.id.hash(&mut hasher);
        self.header.mode.bits().hash(&mut hasher);
        self.header.uid.hash(&mut hasher);
        self.header.gid.hash(&mut hasher);
        self.header.mtime.hash(&mut hasher);
        self.header.goal.hash(&mut hasher);
        self.header.trashtime.hash(&mut hasher);
        self.header.eattr.hash(&mut hasher);
        self.header.parents.hash(&mut hasher);
        if let Some(xattrs) = &self.header.xattrs {
            for (name, value) in &xattrs.entries {
                name.hash(&mut hasher);
                value.hash(&mut hasher);
            }
        }
        if let Some(acl) = &self.header.acl {
            for entry in acl.access.iter().chain(acl.default.iter()) {
                entry.tag.hash(&mut hasher);
                entry.perm.hash(&mut hasher);
            }
        }
        match &self.kind {
            InodeKind::Directory(d) => {
                for (name, id) in &d.children {
                    name.hash(&mut hasher);
                    id.hash(&mut hasher);
                }
            }
            InodeKind::File(f) | InodeKind::Trash(TrashData { file: f, .. }) | InodeKind::Reserved(ReservedData { file: f }) => {
                f.length.hash(&mut hasher);
                f.chunks.hash(&mut hasher);
            }
            InodeKind::Symlink(s) => s.target.hash(&mut hasher),
            InodeKind::CharDevice(d) | InodeKind::BlockDevice(d) => {
                d.major.hash(&mut hasher);
                d.minor.hash(&mut hasher);
            }
            InodeKind::Fifo | InodeKind::Socket => {}
        }
        self.header.checksum = hasher.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_changes_when_a_field_mutates() {
        let mut inode = Inode {
            header: InodeHeader::new(InodeId(2), Mode::RWXU, 0, 0, 1000),
            kind: InodeKind::File(FileData { length: 0, chunks: vec![], sessions: HashSet::new() }),
        };
        inode.recompute_checksum();
        let before = inode.header.checksum;
        if let InodeKind::File(f) = &mut inode.kind {
            f.length = 42;
        }
        inode.recompute_checksum();
        assert_ne!(before, inode.header.checksum);
    }
}
