//! Scenario S2: unlinking a file under a positive trashtime moves it to
//! Trash rather than destroying it; `undel` restores it at its original
//! name, and an explicit goal-0/purge sequence removes it for good and
//! drops its chunk's reference.

use lizardfs_core::metadata::inode::{InodeId, InodeKind, Mode};
use lizardfs_core::metadata::MetadataGraph;

fn mode() -> Mode {
    Mode::from_bits_truncate(0o755)
}

#[test]
fn unlink_to_trash_then_undel_restores_the_original_name() {
    let now = 1_700_000_000;
    let mut graph = MetadataGraph::new(now);
    graph.set_trashtime(InodeId::ROOT, 86400, now).unwrap();

    let f = graph.create(InodeId::ROOT, b"doc.txt", mode(), 0, 0, now).unwrap();
    graph.set_trashtime(f, 86400, now).unwrap();

    graph.unlink(InodeId::ROOT, b"doc.txt", now + 1).unwrap();
    let inode = graph.get(f).unwrap();
    match &inode.kind {
        InodeKind::Trash(trash) => assert_eq!(trash.restorable_path, b"doc.txt"),
        other => panic!("expected Trash, got {:?}", other),
    }
    assert!(graph.lookup(InodeId::ROOT, b"doc.txt").is_err());

    graph.undel(f, InodeId::ROOT, now + 2).unwrap();
    assert_eq!(graph.lookup(InodeId::ROOT, b"doc.txt").unwrap(), f);
    assert!(graph.get(f).unwrap().kind.file_data().is_some());
}

#[test]
fn setgoal_zero_then_purge_removes_the_inode_and_drops_the_chunk_ref() {
    let now = 1_700_000_000;
    let mut graph = MetadataGraph::new(now);
    let f = graph.create(InodeId::ROOT, b"doc.txt", mode(), 0, 0, now).unwrap();
    let (chunk_id, _version) = graph.write_chunk(f, 0, 0, 0, now).unwrap();
    assert_eq!(graph.chunk_refcount(chunk_id), Some(1));

    graph.unlink(InodeId::ROOT, b"doc.txt", now + 1).unwrap();
    graph.set_goal(f, 0, now + 2).unwrap();
    graph.purge_explicit(f, now + 3).unwrap();

    assert!(graph.get(f).is_none());
    assert_eq!(graph.chunk_refcount(chunk_id), None);
}
