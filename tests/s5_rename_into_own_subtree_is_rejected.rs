//! Scenario S5: renaming a directory to a destination path under its own
//! subtree would create a cycle in the namespace graph and must be rejected
//! with `EINVAL` rather than silently corrupting the tree.

use lizardfs_core::error::Status;
use lizardfs_core::metadata::inode::{InodeId, Mode};
use lizardfs_core::metadata::MetadataGraph;

#[test]
fn rename_x_y_to_x_y_z_where_y_is_a_directory_fails_with_einval() {
    let now = 1_700_000_000;
    let mut graph = MetadataGraph::new(now);
    let mode = Mode::from_bits_truncate(0o755);

    let x = graph.mkdir(InodeId::ROOT, b"x", mode, 0, 0, now).unwrap();
    let y = graph.mkdir(x, b"y", mode, 0, 0, now).unwrap();

    let result = graph.rename(x, b"y", y, b"z", now + 1);
    assert_eq!(result, Err(Status::EInval));

    // The tree is untouched: "y" is still where it was, and gained no "z".
    assert_eq!(graph.lookup(x, b"y").unwrap(), y);
    assert!(graph.lookup(y, b"z").is_err());
}
