//! Scenario S3: a file opened by two sessions that gets unlinked survives as
//! Reserved (not Trash, since positive trashtime no longer applies once a
//! session still references it) until every session has closed; only the
//! last close purges it, and the chunk data is readable through either
//! session handle until then.

use lizardfs_core::metadata::inode::{InodeId, Mode};
use lizardfs_core::metadata::MetadataGraph;

fn mode() -> Mode {
    Mode::from_bits_truncate(0o644)
}

#[test]
fn file_stays_reserved_until_the_last_session_closes() {
    let now = 1_700_000_000;
    let mut graph = MetadataGraph::new(now);
    let f = graph.create(InodeId::ROOT, b"open.txt", mode(), 0, 0, now).unwrap();
    let (chunk_id, _version) = graph.write_chunk(f, 0, 0, 0, now).unwrap();

    graph.open_session_file(f, 1).unwrap();
    graph.open_session_file(f, 2).unwrap();

    graph.unlink(InodeId::ROOT, b"open.txt", now + 1).unwrap();
    assert!(graph.get(f).unwrap().kind.is_reserved());
    // Both open handles still resolve to the same chunk while reserved.
    assert_eq!(graph.get(f).unwrap().kind.file_data().unwrap().chunks[0], Some(chunk_id));

    graph.close_session_file(f, 1, now + 2).unwrap();
    assert!(graph.get(f).is_some(), "still held open by session 2");
    assert!(graph.get(f).unwrap().kind.is_reserved());

    graph.close_session_file(f, 2, now + 3).unwrap();
    assert!(graph.get(f).is_none(), "last session close purges the inode");
    assert_eq!(graph.chunk_refcount(chunk_id), None);
}
